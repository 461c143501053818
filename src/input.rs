use std::ffi::c_uint;

use enumset::{EnumSet, EnumSetType};

/// The buttons a core can ask about through `RETRO_DEVICE_ID_JOYPAD_*`.
#[derive(EnumSetType, Debug)]
pub enum Button {
    Up,
    Down,
    Left,
    Right,
    A,
    B,
    X,
    Y,
    Start,
    Select,
    L,
    L2,
    L3,
    R,
    R2,
    R3,
}

impl Button {
    pub fn from_raw_retro_joypad_device_id(device_id_joypad: c_uint) -> Option<Self> {
        Some(match device_id_joypad {
            libretro_sys::DEVICE_ID_JOYPAD_UP => Button::Up,
            libretro_sys::DEVICE_ID_JOYPAD_DOWN => Button::Down,
            libretro_sys::DEVICE_ID_JOYPAD_LEFT => Button::Left,
            libretro_sys::DEVICE_ID_JOYPAD_RIGHT => Button::Right,
            libretro_sys::DEVICE_ID_JOYPAD_A => Button::A,
            libretro_sys::DEVICE_ID_JOYPAD_B => Button::B,
            libretro_sys::DEVICE_ID_JOYPAD_X => Button::X,
            libretro_sys::DEVICE_ID_JOYPAD_Y => Button::Y,
            libretro_sys::DEVICE_ID_JOYPAD_SELECT => Button::Select,
            libretro_sys::DEVICE_ID_JOYPAD_START => Button::Start,
            libretro_sys::DEVICE_ID_JOYPAD_L => Button::L,
            libretro_sys::DEVICE_ID_JOYPAD_L2 => Button::L2,
            libretro_sys::DEVICE_ID_JOYPAD_L3 => Button::L3,
            libretro_sys::DEVICE_ID_JOYPAD_R => Button::R,
            libretro_sys::DEVICE_ID_JOYPAD_R2 => Button::R2,
            libretro_sys::DEVICE_ID_JOYPAD_R3 => Button::R3,
            _ => return None,
        })
    }
}

/// Every physical button a handheld reports, a superset of [`Button`]: it
/// adds `Menu`, the hotkey modifier that never reaches the core directly.
#[derive(EnumSetType, Debug)]
pub enum PhysicalButton {
    Up,
    Down,
    Left,
    Right,
    A,
    B,
    X,
    Y,
    Start,
    Select,
    L,
    L2,
    L3,
    R,
    R2,
    R3,
    Menu,
}

impl PhysicalButton {
    fn to_emulator_button(self) -> Option<Button> {
        Some(match self {
            PhysicalButton::Up => Button::Up,
            PhysicalButton::Down => Button::Down,
            PhysicalButton::Left => Button::Left,
            PhysicalButton::Right => Button::Right,
            PhysicalButton::A => Button::A,
            PhysicalButton::B => Button::B,
            PhysicalButton::X => Button::X,
            PhysicalButton::Y => Button::Y,
            PhysicalButton::Start => Button::Start,
            PhysicalButton::Select => Button::Select,
            PhysicalButton::L => Button::L,
            PhysicalButton::L2 => Button::L2,
            PhysicalButton::L3 => Button::L3,
            PhysicalButton::R => Button::R,
            PhysicalButton::R2 => Button::R2,
            PhysicalButton::R3 => Button::R3,
            PhysicalButton::Menu => return None,
        })
    }
}

/// Supplies the physical button state each frame. The real implementation
/// (reading an evdev/SDL joystick, or a platform's dedicated pad driver) is
/// a collaborator outside this crate; [`NullPad`] stands in when none is
/// wired up.
pub trait PadSource: Send {
    fn poll(&mut self) -> EnumSet<PhysicalButton>;

    /// Whether the running platform can drive per-button turbo (autofire).
    /// Cores without a turbo-capable platform silently ignore turbo
    /// shortcuts instead of erroring.
    fn supports_turbo(&self) -> bool {
        false
    }
}

/// A pad that never reports any button pressed.
pub struct NullPad;

impl PadSource for NullPad {
    fn poll(&mut self) -> EnumSet<PhysicalButton> {
        EnumSet::empty()
    }
}

/// Maps a physical button straight onto the abstract joypad the core sees.
/// `needs_menu` means the mapping only fires while `Menu` is held, letting a
/// handheld with one shortcut row behave like it has a MENU+X combo table.
#[derive(Debug, Clone, Copy)]
pub struct ButtonMapping {
    pub physical: PhysicalButton,
    pub emulator: Button,
}

pub fn default_button_mapping() -> Vec<ButtonMapping> {
    use PhysicalButton::*;
    [Up, Down, Left, Right, A, B, X, Y, Start, Select, L, L2, L3, R, R2, R3]
        .into_iter()
        .map(|physical| ButtonMapping { physical, emulator: physical.to_emulator_button().unwrap() })
        .collect()
}

/// Projects the raw physical state a [`PadSource`] reports into the
/// joypad bitmask a core's `input_state` callback is allowed to see.
pub fn map_buttons(mappings: &[ButtonMapping], physical: EnumSet<PhysicalButton>) -> EnumSet<Button> {
    let mut out = EnumSet::empty();
    for mapping in mappings {
        if physical.contains(mapping.physical) {
            out.insert(mapping.emulator);
        }
    }
    out
}

/// Frontend-level actions bound to MENU+button combos (or, for the two
/// toggle/hold pairs, a bare button on devices with a dedicated key).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Shortcut {
    SaveState,
    LoadState,
    Reset,
    ToggleFastForward,
    HoldFastForward,
    ToggleRewind,
    HoldRewind,
    Screenshot,
    GameSwitcher,
    SaveAndQuit,
    CycleScaler,
    CycleEffect,
    ToggleTurbo(Button),
}

#[derive(Debug, Clone, Copy)]
pub struct ShortcutBinding {
    pub button: PhysicalButton,
    pub needs_menu: bool,
}

pub fn default_shortcuts() -> Vec<(Shortcut, ShortcutBinding)> {
    use PhysicalButton::*;
    let needs_menu = |button| ShortcutBinding { button, needs_menu: true };
    vec![
        (Shortcut::SaveState, needs_menu(L)),
        (Shortcut::LoadState, needs_menu(R)),
        (Shortcut::Reset, needs_menu(Select)),
        (Shortcut::ToggleFastForward, needs_menu(Up)),
        (Shortcut::HoldFastForward, ShortcutBinding { button: R2, needs_menu: false }),
        (Shortcut::ToggleRewind, needs_menu(Down)),
        (Shortcut::HoldRewind, ShortcutBinding { button: L2, needs_menu: false }),
        (Shortcut::Screenshot, needs_menu(X)),
        (Shortcut::GameSwitcher, needs_menu(Start)),
        (Shortcut::SaveAndQuit, needs_menu(B)),
        (Shortcut::CycleScaler, needs_menu(Left)),
        (Shortcut::CycleEffect, needs_menu(Right)),
    ]
}

/// What, if anything, happened to the frontend's own state this frame as a
/// result of shortcut input. The G loop drives save/load/reset/quit off of
/// these instead of re-deriving them from raw buttons.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShortcutEvent {
    SaveState,
    LoadState,
    Reset,
    Screenshot,
    GameSwitcher,
    SaveAndQuit,
    CycleScaler,
    CycleEffect,
    ToggleTurbo(Button),
    OpenMenu,
}

/// Tracks edge detection and the fast-forward/rewind toggle-vs-hold
/// interaction described for the hotkey layer: only one of "fast-forward
/// toggled on" and "rewind toggled on" can be true at a time (last toggle
/// wins), and holding rewind pauses a toggled-on fast-forward for as long
/// as the hold lasts.
pub struct ShortcutState {
    bindings: Vec<(Shortcut, ShortcutBinding)>,
    prev_physical: EnumSet<PhysicalButton>,
    ignore_menu_release: bool,
    fast_forward_toggled: bool,
    fast_forward_held: bool,
    fast_forward_paused_by_rewind: bool,
    rewind_toggled: bool,
}

impl ShortcutState {
    pub fn new(bindings: Vec<(Shortcut, ShortcutBinding)>) -> Self {
        ShortcutState {
            bindings,
            prev_physical: EnumSet::empty(),
            ignore_menu_release: false,
            fast_forward_toggled: false,
            fast_forward_held: false,
            fast_forward_paused_by_rewind: false,
            rewind_toggled: false,
        }
    }

    /// Whether the emulation loop should currently be running at
    /// fast-forward speed: toggled on (and not paused by a rewind hold),
    /// or the hold button is currently down.
    pub fn fast_forward_active(&self) -> bool {
        self.fast_forward_held || (self.fast_forward_toggled && !self.fast_forward_paused_by_rewind)
    }

    pub fn rewind_toggled(&self) -> bool {
        self.rewind_toggled
    }

    fn just_pressed(&self, physical: EnumSet<PhysicalButton>, button: PhysicalButton) -> bool {
        physical.contains(button) && !self.prev_physical.contains(button)
    }

    fn just_released(&self, physical: EnumSet<PhysicalButton>, button: PhysicalButton) -> bool {
        !physical.contains(button) && self.prev_physical.contains(button)
    }

    /// Consumes one frame of physical button state, updates internal
    /// toggle/hold tracking, and returns the shortcut events that fired.
    /// `rewind_held` additionally reports whether hold-rewind is currently
    /// down, separately from the events list, since the G loop needs that
    /// as a continuous signal rather than an edge.
    pub fn poll(&mut self, physical: EnumSet<PhysicalButton>, turbo_capable: bool) -> (Vec<ShortcutEvent>, bool) {
        let menu_held = physical.contains(PhysicalButton::Menu);
        if self.just_pressed(physical, PhysicalButton::Menu) {
            self.ignore_menu_release = false;
        }

        let mut events = Vec::new();
        let mut rewind_held = false;

        let bindings = std::mem::take(&mut self.bindings);
        for (shortcut, binding) in &bindings {
            if binding.needs_menu && !menu_held {
                continue;
            }

            match shortcut {
                Shortcut::ToggleFastForward => {
                    if self.just_pressed(physical, binding.button) {
                        self.fast_forward_toggled = !self.fast_forward_toggled;
                        self.fast_forward_held = false;
                        if self.fast_forward_toggled && self.rewind_toggled {
                            self.rewind_toggled = false;
                        }
                        if binding.needs_menu {
                            self.ignore_menu_release = true;
                        }
                    }
                }
                Shortcut::HoldFastForward => {
                    if physical.contains(binding.button) != self.prev_physical.contains(binding.button) {
                        self.fast_forward_held = physical.contains(binding.button);
                        if binding.needs_menu {
                            self.ignore_menu_release = true;
                        }
                    }
                }
                Shortcut::ToggleRewind => {
                    if self.just_pressed(physical, binding.button) {
                        self.rewind_toggled = !self.rewind_toggled;
                        if self.rewind_toggled && self.fast_forward_toggled {
                            self.fast_forward_toggled = false;
                            self.fast_forward_paused_by_rewind = false;
                        }
                        if binding.needs_menu {
                            self.ignore_menu_release = true;
                        }
                    }
                }
                Shortcut::HoldRewind => {
                    rewind_held = physical.contains(binding.button);
                    let just_pressed = self.just_pressed(physical, binding.button);
                    let just_released = self.just_released(physical, binding.button);
                    if just_pressed && self.fast_forward_toggled && !self.fast_forward_paused_by_rewind {
                        self.fast_forward_paused_by_rewind = true;
                    } else if just_released && self.fast_forward_paused_by_rewind {
                        self.fast_forward_paused_by_rewind = false;
                    }
                    if binding.needs_menu && rewind_held {
                        self.ignore_menu_release = true;
                    }
                }
                Shortcut::SaveState => {
                    if self.just_pressed(physical, binding.button) {
                        events.push(ShortcutEvent::SaveState);
                        self.ignore_menu_release = true;
                    }
                }
                Shortcut::LoadState => {
                    if self.just_pressed(physical, binding.button) {
                        events.push(ShortcutEvent::LoadState);
                        self.ignore_menu_release = true;
                    }
                }
                Shortcut::Reset => {
                    if self.just_pressed(physical, binding.button) {
                        events.push(ShortcutEvent::Reset);
                        self.ignore_menu_release = true;
                    }
                }
                Shortcut::Screenshot => {
                    if self.just_pressed(physical, binding.button) {
                        events.push(ShortcutEvent::Screenshot);
                        self.ignore_menu_release = true;
                    }
                }
                Shortcut::GameSwitcher => {
                    if self.just_pressed(physical, binding.button) {
                        events.push(ShortcutEvent::GameSwitcher);
                        self.ignore_menu_release = true;
                    }
                }
                Shortcut::SaveAndQuit => {
                    if self.just_pressed(physical, binding.button) {
                        events.push(ShortcutEvent::SaveAndQuit);
                        self.ignore_menu_release = true;
                    }
                }
                Shortcut::CycleScaler => {
                    if self.just_pressed(physical, binding.button) {
                        events.push(ShortcutEvent::CycleScaler);
                        self.ignore_menu_release = true;
                    }
                }
                Shortcut::CycleEffect => {
                    if self.just_pressed(physical, binding.button) {
                        events.push(ShortcutEvent::CycleEffect);
                        self.ignore_menu_release = true;
                    }
                }
                Shortcut::ToggleTurbo(button) => {
                    if turbo_capable && self.just_pressed(physical, binding.button) {
                        events.push(ShortcutEvent::ToggleTurbo(*button));
                        self.ignore_menu_release = true;
                    }
                }
            }
        }
        self.bindings = bindings;

        if !self.ignore_menu_release && self.just_released(physical, PhysicalButton::Menu) {
            events.push(ShortcutEvent::OpenMenu);
        }

        self.prev_physical = physical;
        (events, rewind_held)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn state() -> ShortcutState {
        ShortcutState::new(default_shortcuts())
    }

    fn with(buttons: &[PhysicalButton]) -> EnumSet<PhysicalButton> {
        let mut set = EnumSet::empty();
        for &b in buttons {
            set.insert(b);
        }
        set
    }

    #[test]
    fn bare_menu_release_opens_menu() {
        let mut s = state();
        s.poll(with(&[PhysicalButton::Menu]), false);
        let (events, _) = s.poll(with(&[]), false);
        assert_eq!(events, vec![ShortcutEvent::OpenMenu]);
    }

    #[test]
    fn menu_plus_button_suppresses_menu_open() {
        let mut s = state();
        s.poll(with(&[PhysicalButton::Menu]), false);
        s.poll(with(&[PhysicalButton::Menu, PhysicalButton::L]), false);
        let (events, _) = s.poll(with(&[]), false);
        assert!(!events.contains(&ShortcutEvent::OpenMenu));
        assert!(events.contains(&ShortcutEvent::SaveState));
    }

    #[test]
    fn toggling_fast_forward_on_disables_an_active_rewind_toggle() {
        let mut s = state();
        s.poll(with(&[PhysicalButton::Menu, PhysicalButton::Down]), false);
        assert!(s.rewind_toggled());
        s.poll(with(&[PhysicalButton::Menu]), false);
        s.poll(with(&[PhysicalButton::Menu, PhysicalButton::Up]), false);
        assert!(!s.rewind_toggled());
        assert!(s.fast_forward_active());
    }

    #[test]
    fn holding_rewind_pauses_a_toggled_on_fast_forward() {
        let mut s = state();
        s.poll(with(&[PhysicalButton::Menu, PhysicalButton::Up]), false);
        assert!(s.fast_forward_active());

        let (_, rewind_held) = s.poll(with(&[PhysicalButton::L2]), false);
        assert!(rewind_held);
        assert!(!s.fast_forward_active(), "rewind hold must pause a toggled-on fast-forward");

        let (_, rewind_held) = s.poll(with(&[]), false);
        assert!(!rewind_held);
        assert!(s.fast_forward_active(), "releasing rewind hold restores the fast-forward toggle");
    }

    #[test]
    fn hold_fast_forward_tracks_button_state_directly() {
        let mut s = state();
        assert!(!s.fast_forward_active());
        s.poll(with(&[PhysicalButton::R2]), false);
        assert!(s.fast_forward_active());
        s.poll(with(&[]), false);
        assert!(!s.fast_forward_active());
    }

    #[test]
    fn turbo_shortcut_is_ignored_on_a_non_turbo_platform() {
        let mut s = ShortcutState::new(vec![(
            Shortcut::ToggleTurbo(Button::A),
            ShortcutBinding { button: PhysicalButton::A, needs_menu: true },
        )]);
        s.poll(with(&[PhysicalButton::Menu]), false);
        let (events, _) = s.poll(with(&[PhysicalButton::Menu, PhysicalButton::A]), false);
        assert!(events.is_empty());
    }

    #[test]
    fn button_mapping_round_trips_joypad_ids() {
        let mappings = default_button_mapping();
        let physical = with(&[PhysicalButton::A, PhysicalButton::Up]);
        let mapped = map_buttons(&mappings, physical);
        assert!(mapped.contains(Button::A));
        assert!(mapped.contains(Button::Up));
        assert!(!mapped.contains(Button::B));
    }
}
