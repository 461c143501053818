use std::cell::RefCell;
use std::ffi::c_uint;
use std::fs;
use std::path::{Path, PathBuf};
use std::rc::Rc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use clap::Parser;
use enumset::EnumSet;
use libretro_sys::PixelFormat;
use rodio::Source;

use crate::audio::AudioBridge;
use crate::config::Config as UserConfig;
use crate::core::{Callbacks, Core};
use crate::input::{
    default_button_mapping, default_shortcuts, map_buttons, Button, ButtonMapping, NullPad,
    PadSource, PhysicalButton, ShortcutEvent, ShortcutState,
};
use crate::overclock::{NullGovernor, Overclock, OverclockTier};
use crate::rewind::{RewindConfig, RewindEngine, StepResult};
use crate::scaler::{ScalingPolicy, Screen};
use crate::state_io::Blocked;
use crate::video::{Frame, NullVideoSink, VideoBridge};

mod audio;
mod config;
mod core;
mod environment_command;
mod input;
mod overclock;
mod rewind;
mod scaler;
mod state_io;
mod video;
mod options;

/// Every half-period of frames one way, then the other; a cheap square-wave
/// autofire that needs no extra timing state beyond a frame counter.
const TURBO_HALF_PERIOD_FRAMES: u64 = 4;

/// `minarch <core> <rom>` — no named flags, matching a handheld launcher's
/// convention of invoking a frontend with two positional paths. `DEVICE`
/// (env) selects which system-scope config file to load.
#[derive(Parser)]
struct Cli {
    core: PathBuf,
    rom: PathBuf,
}

fn main() -> Result<()> {
    dotenv::dotenv().ok();

    let cli = Cli::parse();
    let paths = Paths::resolve(&cli.core, &cli.rom)?;

    let user_config = UserConfig::load(&paths.system_config, &paths.pak_config, &paths.console_config, &paths.game_config)
        .context("loading configuration")?;

    let screen = Screen {
        width: config_u32(&user_config, "minarch_screen_width", 640),
        height: config_u32(&user_config, "minarch_screen_height", 480),
        is_hdmi: config_bool(&user_config, "minarch_screen_is_hdmi", false),
    };
    let policy = config_scaling_policy(&user_config);
    let rewind_config = RewindConfig {
        enabled: config_bool(&user_config, "minarch_rewind_enabled", true),
        buffer_mb: config_u32(&user_config, "minarch_rewind_buffer_mb", 64),
        interval_ms: config_u32(&user_config, "minarch_rewind_interval_ms", 1),
        audio_enabled: config_bool(&user_config, "minarch_rewind_audio", false),
        compress: config_bool(&user_config, "minarch_rewind_compress", true),
        lz4_acceleration: config_u32(&user_config, "minarch_rewind_lz4_acceleration", 1) as u8,
    };
    let ff_audio_enabled = config_bool(&user_config, "minarch_fast_forward_audio", false);
    let max_ff_multiplier = config_u32(&user_config, "minarch_fast_forward_speed", 2).max(2);
    let hardcore = config_bool(&user_config, "minarch_hardcore_mode", false);
    let overclock_tier = config_overclock_tier(&user_config);

    let (_stream, stream_handle) =
        rodio::OutputStream::try_default().context("opening the default audio output device")?;

    let (placeholder_audio, _unused_source) =
        AudioBridge::new(48_000.0, rewind_config.audio_enabled, ff_audio_enabled, 4);

    let frontend = Rc::new(RefCell::new(Frontend {
        video: VideoBridge::new(screen, policy, Box::new(NullVideoSink::default())),
        audio: placeholder_audio,
        policy,
        pad: Box::new(NullPad),
        button_mappings: default_button_mapping(),
        shortcuts: ShortcutState::new(default_shortcuts()),
        mapped_buttons: EnumSet::empty(),
        turbo_buttons: EnumSet::empty(),
        turbo_frame: 0,
        rewinding: false,
        fast_forwarding: false,
        rewind_held: false,
        pending_events: Vec::new(),
    }));

    let frame_ratio_millis = Arc::new(AtomicU32::new(1000));
    let mut overclock = Overclock::new(Arc::new(NullGovernor));
    {
        let frame_ratio_millis = frame_ratio_millis.clone();
        overclock.set_tier(overclock_tier, move || frame_ratio_millis.load(Ordering::Relaxed) as f32 / 1000.0);
    }

    let core_config = core::Config {
        core: cli.core.clone(),
        rom: cli.rom.clone(),
        system_dir: paths.system_dir.clone(),
        save_dir: paths.save_dir.clone(),
        core_assets_dir: paths.core_assets_dir.clone(),
        callbacks: Box::new(CallbacksHandle(frontend.clone())),
    };

    let mut ctx = HostContext {
        frontend,
        stream_handle,
        paths,
        config: user_config,
        rewind_config,
        ff_audio_enabled,
        max_ff_multiplier,
        hardcore,
        frame_ratio_millis,
        screenshot_count: 0,
    };

    Core::load(core_config, |core| run(core, &mut ctx))??;

    // `overclock` and `_stream` must outlive the run loop; drop them
    // explicitly here so the compiler doesn't warn them as unused past
    // their last read.
    drop(overclock);
    drop(_stream);

    Ok(())
}

/// Owned frontend state the libretro callbacks mutate and the host loop
/// reads back. Lives behind `Rc<RefCell<_>>` so both [`CallbacksHandle`]
/// (registered thread-locally with the core) and `run`'s own loop can reach
/// it — sound only because everything here runs on a single thread, per
/// spec.md §5.
struct Frontend {
    video: VideoBridge,
    audio: AudioBridge,
    /// Tracked alongside `video` since `VideoBridge` doesn't expose its
    /// current policy back out; `CycleScaler` reads/writes it here.
    policy: ScalingPolicy,
    pad: Box<dyn PadSource>,
    button_mappings: Vec<ButtonMapping>,
    shortcuts: ShortcutState,
    mapped_buttons: EnumSet<Button>,
    turbo_buttons: EnumSet<Button>,
    turbo_frame: u64,
    rewinding: bool,
    fast_forwarding: bool,
    rewind_held: bool,
    pending_events: Vec<ShortcutEvent>,
}

/// The `Callbacks` implementation actually registered with the core. Thin
/// by design: all state lives in `Frontend`, this just borrows it for the
/// duration of each callback.
struct CallbacksHandle(Rc<RefCell<Frontend>>);

impl Callbacks for CallbacksHandle {
    fn video_refresh(&mut self, frame: Option<Frame>) {
        self.0.borrow_mut().video.refresh(frame);
    }

    fn supports_pixel_format(&mut self, pixel_format: PixelFormat) -> bool {
        crate::video::accepts_pixel_format(pixel_format)
    }

    fn audio_sample(&mut self, left: i16, right: i16) {
        let f = self.0.borrow();
        f.audio.forward(&[left, right], f.rewinding, f.fast_forwarding);
    }

    fn audio_samples(&mut self, samples: &[i16]) {
        let f = self.0.borrow();
        f.audio.forward(samples, f.rewinding, f.fast_forwarding);
    }

    fn input_poll(&mut self) {
        let mut f = self.0.borrow_mut();

        let physical = f.pad.poll();
        let turbo_capable = f.pad.supports_turbo();
        let (events, rewind_held) = f.shortcuts.poll(physical, turbo_capable);
        f.rewind_held = rewind_held;

        let mut mapped = map_buttons(&f.button_mappings, physical);

        f.turbo_frame = f.turbo_frame.wrapping_add(1);
        let turbo_phase_on = (f.turbo_frame / TURBO_HALF_PERIOD_FRAMES) % 2 == 0;
        if !turbo_phase_on {
            for button in f.turbo_buttons.iter() {
                mapped.remove(button);
            }
        }
        f.mapped_buttons = mapped;

        for event in events {
            if let ShortcutEvent::ToggleTurbo(button) = event {
                if f.turbo_buttons.contains(button) {
                    f.turbo_buttons.remove(button);
                } else {
                    f.turbo_buttons.insert(button);
                }
            }
            f.pending_events.push(event);
        }
    }

    fn input_buttons(&self, _port: c_uint) -> EnumSet<Button> {
        self.0.borrow().mapped_buttons
    }

    fn can_dupe_frames(&mut self) -> bool {
        true
    }
}

/// Everything the host loop needs that isn't already reachable through
/// `Core`: the shared frontend handle, resolved paths, the loaded
/// configuration, and the knobs derived from it once at startup.
struct HostContext {
    frontend: Rc<RefCell<Frontend>>,
    stream_handle: rodio::OutputStreamHandle,
    paths: Paths,
    config: UserConfig,
    rewind_config: RewindConfig,
    ff_audio_enabled: bool,
    max_ff_multiplier: u32,
    hardcore: bool,
    frame_ratio_millis: Arc<AtomicU32>,
    screenshot_count: u32,
}

/// The core host loop (spec.md §4.G): one iteration drives either a rewind
/// step or one-or-more `retro_run()` calls, then reconciles AV info, drains
/// shortcut events, and paces itself to the core's reported frame time.
fn run(core: &mut Core, ctx: &mut HostContext) -> Result<()> {
    if let Ok(save_ram) = fs::read(&ctx.paths.save_ram) {
        core.restore_save_ram(&save_ram);
    }

    apply_option_overrides(core, &ctx.config);

    let state_size = core.serialize_size();
    let av_info = core.get_system_av_info();
    let mut last_fps = av_info.timing.fps;
    let mut last_sample_rate = av_info.timing.sample_rate;

    let mut rewind_engine = RewindEngine::new(ctx.rewind_config, state_size, av_info.timing.fps);

    configure_audio(ctx, av_info.timing.sample_rate as f32);
    ctx.frontend.borrow_mut().video.set_core_aspect_ratio(av_info.geometry.aspect_ratio);

    if let Ok(Ok(state)) = state_io::read_state(&ctx.paths.auto_resume_state, state_size, ctx.hardcore) {
        if core.restore_state(&state).is_ok() {
            if let Some(engine) = rewind_engine.as_mut() {
                engine.on_state_change();
            }
        }
    }

    loop {
        if core.shutdown_requested() {
            break;
        }

        let loop_start = Instant::now();

        let (rewinding, fast_forwarding) = {
            let f = ctx.frontend.borrow();
            (f.rewind_held || f.shortcuts.rewind_toggled(), f.shortcuts.fast_forward_active())
        };
        {
            let mut f = ctx.frontend.borrow_mut();
            f.rewinding = rewinding;
            f.fast_forwarding = fast_forwarding;
        }

        let runs = if rewinding {
            0
        } else if fast_forwarding {
            ctx.max_ff_multiplier
        } else {
            1
        };

        if rewinding {
            if let Some(engine) = rewind_engine.as_mut() {
                let _ = engine.step_back(|buf| core.restore_state(buf).is_ok());
            }
            ctx.frontend.borrow_mut().video.refresh(None);
        } else {
            for _ in 0..runs {
                core.run();
            }
            if let Some(engine) = rewind_engine.as_mut() {
                engine.push(false, |buf| core.serialize_into(buf));
            }
        }

        if !rewinding {
            if let Some(engine) = rewind_engine.as_mut() {
                if engine.is_rewinding() {
                    engine.end_rewind();
                }
            }
        }

        let av_info = core.get_system_av_info();
        if av_info.timing.fps != last_fps || av_info.timing.sample_rate != last_sample_rate {
            configure_audio(ctx, av_info.timing.sample_rate as f32);
            let mut f = ctx.frontend.borrow_mut();
            f.video.set_core_aspect_ratio(av_info.geometry.aspect_ratio);
            f.video.invalidate_geometry();
            last_fps = av_info.timing.fps;
            last_sample_rate = av_info.timing.sample_rate;
        }

        handle_shortcut_events(core, ctx, &mut rewind_engine, state_size)?;

        let target_runs = runs.max(1) as f64;
        let frame_time = Duration::from_secs_f64(1.0 / av_info.timing.fps.max(1.0) / target_runs);
        let elapsed = loop_start.elapsed();

        let ratio = if frame_time.as_secs_f64() > 0.0 {
            elapsed.as_secs_f64() / frame_time.as_secs_f64()
        } else {
            1.0
        };
        ctx.frame_ratio_millis
            .store((ratio * 1000.0).clamp(0.0, u32::MAX as f64) as u32, Ordering::Relaxed);

        if elapsed < frame_time {
            std::thread::sleep(frame_time - elapsed);
        }
    }

    let save_ram = core.get_save_ram().to_vec();
    if !save_ram.is_empty() {
        fs::write(&ctx.paths.save_ram, &save_ram).context("persisting save RAM")?;
    }

    if let Ok(state) = core.state() {
        let _ = state_io::write_state(&ctx.paths.auto_resume_state, &state, ctx.hardcore);
    }

    Ok(())
}

fn handle_shortcut_events(
    core: &mut Core,
    ctx: &mut HostContext,
    rewind_engine: &mut Option<RewindEngine>,
    state_size: usize,
) -> Result<()> {
    let events = std::mem::take(&mut ctx.frontend.borrow_mut().pending_events);

    for event in events {
        match event {
            ShortcutEvent::SaveState => match core.state() {
                Ok(state) => match state_io::write_state(&ctx.paths.quick_state, &state, ctx.hardcore) {
                    Ok(Ok(())) => {}
                    Ok(Err(Blocked::HardcoreMode)) => eprintln!("INFO: save-state blocked by hardcore mode"),
                    Err(err) => eprintln!("WARNING: failed to write save state: {err}"),
                },
                Err(err) => eprintln!("WARNING: failed to serialize state: {err}"),
            },
            ShortcutEvent::LoadState => match state_io::read_state(&ctx.paths.quick_state, state_size, ctx.hardcore) {
                Ok(Ok(state)) => {
                    if core.restore_state(&state).is_ok() {
                        if let Some(engine) = rewind_engine.as_mut() {
                            engine.on_state_change();
                        }
                    }
                }
                Ok(Err(Blocked::HardcoreMode)) => eprintln!("INFO: load-state blocked by hardcore mode"),
                Err(err) => eprintln!("WARNING: failed to read save state: {err}"),
            },
            ShortcutEvent::Reset => {
                core.reset();
                if let Some(engine) = rewind_engine.as_mut() {
                    engine.on_state_change();
                }
            }
            ShortcutEvent::Screenshot => {
                if let Err(err) = write_screenshot(core, ctx) {
                    eprintln!("WARNING: failed to write screenshot: {err}");
                }
            }
            ShortcutEvent::GameSwitcher | ShortcutEvent::OpenMenu => {
                eprintln!("INFO: {event:?} requested, but no menu UI is wired up in this build");
            }
            ShortcutEvent::SaveAndQuit => {
                if let Ok(state) = core.state() {
                    let _ = state_io::write_state(&ctx.paths.auto_resume_state, &state, ctx.hardcore);
                }
                let save_ram = core.get_save_ram().to_vec();
                if !save_ram.is_empty() {
                    fs::write(&ctx.paths.save_ram, &save_ram).context("persisting save RAM")?;
                }
                request_shutdown();
            }
            ShortcutEvent::CycleScaler => {
                let mut f = ctx.frontend.borrow_mut();
                f.policy = next_scaling_policy(f.policy);
                let next = f.policy;
                f.video.set_policy(next);
            }
            ShortcutEvent::CycleEffect => {
                eprintln!("INFO: post-processing effects are not implemented in this build");
            }
            ShortcutEvent::ToggleTurbo(_) => {
                // Already folded into `turbo_buttons` by `input_poll`.
            }
        }
    }

    Ok(())
}

/// No libretro environment command lets a frontend force its own shutdown
/// from outside a callback; `SHUTDOWN` only flows core-to-frontend. Setting
/// the same thread-local flag from the other direction mirrors that
/// mechanism, used only for the `SaveAndQuit` shortcut.
fn request_shutdown() {
    core::STATE.with_borrow_mut(|state| state.shutdown_requested = true);
}

fn next_scaling_policy(policy: ScalingPolicy) -> ScalingPolicy {
    use ScalingPolicy::*;
    match policy {
        Native => Cropped,
        Cropped => Fullscreen,
        Fullscreen => AspectScreen,
        AspectScreen => Aspect,
        Aspect => Native,
    }
}

fn write_screenshot(_core: &mut Core, ctx: &mut HostContext) -> Result<()> {
    let frontend = ctx.frontend.borrow();
    let frame = frontend.video.last_frame().context("core has not presented a frame yet")?;
    let width = frame.width as u32;
    let height = frame.height as u32;
    let pixels = frame.buffer_to_packed_argb32();
    drop(frontend);

    ctx.screenshot_count += 1;
    let path = ctx
        .paths
        .states_dir
        .join(format!("screenshot-{:04}.argb32", ctx.screenshot_count));

    let mut out = Vec::with_capacity(8 + pixels.len() * 4);
    out.extend_from_slice(&width.to_le_bytes());
    out.extend_from_slice(&height.to_le_bytes());
    for pixel in pixels {
        out.extend_from_slice(&pixel.to_ne_bytes());
    }

    fs::write(&path, out).context("writing screenshot")?;
    println!("Screenshot written to {}", path.display());

    Ok(())
}

fn apply_option_overrides(core: &mut Core, config: &UserConfig) {
    let keys: Vec<String> = core.with_options(|options| options.keys().map(str::to_owned).collect());

    for key in keys {
        let Some(resolved) = config.get(&key) else { continue };

        core.with_options_mut(|options| {
            options.set_value(&key, &resolved.value);
            if resolved.locked {
                options.lock(&key);
            }
        });
    }
}

fn configure_audio(ctx: &mut HostContext, base_sample_rate: f32) {
    let (bridge, source) =
        AudioBridge::new(base_sample_rate.max(1.0), ctx.rewind_config.audio_enabled, ctx.ff_audio_enabled, 4);

    ctx.frontend.borrow_mut().audio = bridge;

    let stream_handle = ctx.stream_handle.clone();
    std::thread::spawn(move || {
        stream_handle.play_raw(source.convert_samples()).ok();
    });
}

fn config_bool(config: &UserConfig, key: &str, default: bool) -> bool {
    match config.get(key) {
        Some(resolved) => match resolved.value.as_str() {
            "0" | "false" | "off" | "no" => false,
            "1" | "true" | "on" | "yes" => true,
            _ => default,
        },
        None => default,
    }
}

fn config_u32(config: &UserConfig, key: &str, default: u32) -> u32 {
    config.get(key).and_then(|r| r.value.parse().ok()).unwrap_or(default)
}

fn config_scaling_policy(config: &UserConfig) -> ScalingPolicy {
    match config.get("minarch_scaling").map(|r| r.value) {
        Some(s) if s == "cropped" => ScalingPolicy::Cropped,
        Some(s) if s == "fullscreen" => ScalingPolicy::Fullscreen,
        Some(s) if s == "aspect_screen" => ScalingPolicy::AspectScreen,
        Some(s) if s == "aspect" => ScalingPolicy::Aspect,
        _ => ScalingPolicy::Native,
    }
}

fn config_overclock_tier(config: &UserConfig) -> OverclockTier {
    match config.get("minarch_overclock").map(|r| r.value) {
        Some(s) if s == "powersave" => OverclockTier::PowerSave,
        Some(s) if s == "performance" => OverclockTier::Performance,
        Some(s) if s == "auto" => OverclockTier::Auto,
        _ => OverclockTier::Normal,
    }
}

/// Resolved, CWD-relative layout for everything the frontend persists
/// (spec.md §6 "Persisted state layout"), since the teacher's dependency
/// stack carries no `dirs`/`directories` crate to ask the OS for these.
struct Paths {
    system_config: PathBuf,
    pak_config: PathBuf,
    console_config: PathBuf,
    game_config: PathBuf,
    save_ram: PathBuf,
    auto_resume_state: PathBuf,
    quick_state: PathBuf,
    states_dir: PathBuf,
    system_dir: PathBuf,
    save_dir: PathBuf,
    core_assets_dir: PathBuf,
}

impl Paths {
    fn resolve(core: &Path, rom: &Path) -> Result<Self> {
        let root = PathBuf::from(".minarch");
        let config_dir = root.join("config");
        let saves_dir = root.join("saves");
        let states_dir = root.join("states");
        let system_dir = root.join("system");
        let core_assets_dir = root.join("core_assets");

        for dir in [&config_dir, &saves_dir, &states_dir, &system_dir, &core_assets_dir] {
            fs::create_dir_all(dir).with_context(|| format!("creating directory {}", dir.display()))?;
        }

        let core_stem = core.file_stem().and_then(|s| s.to_str()).unwrap_or("core");
        let rom_stem = rom.file_stem().and_then(|s| s.to_str()).unwrap_or("rom");

        let system_config = match std::env::var("DEVICE") {
            Ok(device) if !device.is_empty() => config_dir.join(format!("{device}.cfg")),
            _ => config_dir.join("default.cfg"),
        };

        Ok(Paths {
            system_config,
            pak_config: config_dir.join(format!("{core_stem}.cfg")),
            console_config: config_dir.join("minarch.cfg"),
            game_config: config_dir.join(format!("{rom_stem}.cfg")),
            save_ram: saves_dir.join(format!("{rom_stem}.srm")),
            auto_resume_state: states_dir.join(format!("{rom_stem}.st0")),
            quick_state: states_dir.join(format!("{rom_stem}.st1")),
            states_dir,
            system_dir,
            save_dir: saves_dir,
            core_assets_dir,
        })
    }
}
