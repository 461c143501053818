use std::ffi::{c_char, c_uint, c_void, CStr, CString};
use std::ptr;

use libretro_sys::PixelFormat;

use crate::core::{CALLBACKS, STATE};
use crate::environment_command::EnvironmentCommand as Command;
use crate::input::Button;
use crate::options::{RawOptionDefinition, RawOptionsV2, RawVariable};
use crate::video::Frame;

/// Raw FFI mirror of `struct retro_message` (`SET_MESSAGE`); not bound by
/// `libretro_sys`.
#[repr(C)]
struct RawMessage {
    msg: *const c_char,
    frames: c_uint,
}

/// Raw FFI mirror of `struct retro_core_option_display`
/// (`SET_CORE_OPTIONS_DISPLAY`); not bound by `libretro_sys`.
#[repr(C)]
struct RawOptionDisplay {
    key: *const c_char,
    visible: bool,
}

pub unsafe extern "C" fn video_refresh(data: *const c_void, width: c_uint, height: c_uint, pitch: usize) {
    let pixel_format = STATE.with_borrow(|state| state.pixel_format);
    let frame = Frame::from_raw(data, width, height, pitch, pixel_format);

    CALLBACKS.with_borrow_mut(|callbacks| callbacks.video_refresh(frame));
}

pub unsafe extern "C" fn audio_sample(left: i16, right: i16) {
    CALLBACKS.with_borrow_mut(|callbacks| callbacks.audio_sample(left, right))
}

pub unsafe extern "C" fn audio_sample_batch(samples: *const i16, num_frames: usize) -> usize {
    let num_channels = 2;
    let samples = std::slice::from_raw_parts(samples, num_channels * num_frames);

    CALLBACKS.with_borrow_mut(|callbacks| callbacks.audio_samples(samples));

    num_frames
}

pub unsafe extern "C" fn input_poll() {
    CALLBACKS.with_borrow_mut(|callbacks| callbacks.input_poll());
}

pub unsafe extern "C" fn input_state(port: c_uint, device: c_uint, _index: c_uint, id: c_uint) -> i16 {
    if device != libretro_sys::DEVICE_JOYPAD {
        return 0;
    }

    let Some(button) = Button::from_raw_retro_joypad_device_id(id) else {
        return 0;
    };

    let pressed = CALLBACKS.with_borrow(|callbacks| callbacks.input_buttons(port).contains(button));

    pressed as i16
}

/// Borrows a `*const c_char` as a `str`, logging and refusing the call on a
/// null or non-UTF8 pointer instead of propagating garbage into `options`.
unsafe fn cstr<'a>(ptr: *const c_char, what: &str) -> std::option::Option<&'a str> {
    if ptr.is_null() {
        eprintln!("WARNING: environment({what}) called with a null pointer");
        return None;
    }
    match CStr::from_ptr(ptr).to_str() {
        Ok(s) => Some(s),
        Err(_) => {
            eprintln!("WARNING: environment({what}) pointer is not valid UTF-8");
            None
        }
    }
}

/// Dispatches one `retro_environment` opcode. Each handled opcode routes to
/// the component that owns it: core options (A) via `STATE.options`, pixel
/// format and frame-time (D) via the registered `Callbacks`, directories
/// (E) via stable pointers `STATE` owns, and the RA memory map via
/// `STATE.memory_map`. Unhandled and unknown opcodes return `false`,
/// matching what a core should treat as "not supported by this frontend".
pub unsafe extern "C" fn environment(command: u32, data: *mut c_void) -> bool {
    let Some(command) = Command::from_repr(command) else {
        eprintln!("WARNING: unknown retro_environment command `{command}`");
        return false;
    };

    match command {
        Command::SET_PIXEL_FORMAT => {
            let pixel_format = *data.cast_const().cast::<c_uint>();
            let Some(pixel_format) = PixelFormat::from_uint(pixel_format) else {
                eprintln!("WARNING: unknown pixel format variant `{pixel_format}`");
                return false;
            };

            let supported = crate::video::accepts_pixel_format(pixel_format);
            if supported {
                STATE.with_borrow_mut(|state| state.pixel_format = pixel_format);
            }

            supported
        }
        Command::GET_CAN_DUPE => {
            if !data.is_null() {
                let can_dupe = CALLBACKS.with_borrow_mut(|callbacks| callbacks.can_dupe_frames());
                *data.cast::<bool>() = can_dupe;
            }
            true
        }
        Command::SET_VARIABLES => STATE.with_borrow_mut(|state| state.options.set_variables(data.cast_const().cast::<RawVariable>())),
        Command::SET_CORE_OPTIONS => STATE.with_borrow_mut(|state| state.options.set_core_options(data.cast_const().cast::<RawOptionDefinition>())),
        Command::SET_CORE_OPTIONS_V2 => STATE.with_borrow_mut(|state| state.options.set_core_options_v2(data.cast_const().cast::<RawOptionsV2>())),
        Command::GET_VARIABLE => STATE.with_borrow(|state| state.options.get_variable(data.cast::<RawVariable>())),
        Command::GET_VARIABLE_UPDATE => {
            if data.is_null() {
                return false;
            }
            let changed = STATE.with_borrow_mut(|state| state.options.take_changed());
            *data.cast::<bool>() = changed;
            true
        }
        Command::SET_CORE_OPTIONS_DISPLAY => {
            let display = &*data.cast_const().cast::<RawOptionDisplay>();
            let Some(key) = cstr(display.key, "SET_CORE_OPTIONS_DISPLAY") else {
                return false;
            };
            STATE.with_borrow_mut(|state| state.options.set_display(key, display.visible));
            true
        }
        Command::GET_CORE_OPTIONS_VERSION => {
            if data.is_null() {
                return false;
            }
            *data.cast::<c_uint>() = 2;
            true
        }
        Command::GET_SYSTEM_DIRECTORY => {
            directory_pointer(data, |state| &mut state.system_directory)
        }
        Command::GET_SAVE_DIRECTORY => {
            directory_pointer(data, |state| &mut state.save_directory)
        }
        Command::GET_CORE_ASSETS_DIRECTORY => {
            directory_pointer(data, |state| &mut state.core_assets_directory)
        }
        Command::SET_GEOMETRY => {
            let geometry = *data.cast_const().cast::<libretro_sys::GameGeometry>();
            STATE.with_borrow_mut(|state| state.geometry = Some(geometry));
            true
        }
        Command::SET_SYSTEM_AV_INFO => {
            let av_info = &*data.cast_const().cast::<libretro_sys::SystemAvInfo>();
            STATE.with_borrow_mut(|state| state.geometry = Some(av_info.geometry));
            true
        }
        Command::SET_MEMORY_MAPS => {
            let map = data.cast_const().cast::<libretro_sys::MemoryMap>();
            let memory_map = crate::core::MemoryMap::from_raw(map);
            STATE.with_borrow_mut(|state| state.memory_map = memory_map);
            true
        }
        Command::SHUTDOWN => {
            STATE.with_borrow_mut(|state| state.shutdown_requested = true);
            true
        }
        Command::SET_MESSAGE => {
            let message = &*data.cast_const().cast::<RawMessage>();
            if let Some(text) = cstr(message.msg, "SET_MESSAGE") {
                println!("{text}");
            }
            true
        }
        _ => false,
    }
}

/// Lazily fills in and returns one of `STATE`'s stable directory pointers.
/// The `CString` lives in `STATE` for as long as the core is loaded, so the
/// pointer handed back stays valid for the lifetime the core is allowed to
/// hold onto it.
unsafe fn directory_pointer(data: *mut c_void, field: impl FnOnce(&mut crate::core::State) -> &mut std::option::Option<CString>) -> bool {
    if data.is_null() {
        return false;
    }

    let ptr = STATE.with_borrow_mut(|state| {
        let slot = field(state);
        if slot.is_none() {
            eprintln!("WARNING: directory requested before the host configured one");
        }
        slot.as_ref().map(|c| c.as_ptr()).unwrap_or(ptr::null())
    });

    *data.cast::<*const c_char>() = ptr;
    !ptr.is_null()
}
