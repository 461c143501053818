use std::cell::RefCell;
use std::ffi::CString;

use libretro_sys::{GameGeometry, PixelFormat};

use crate::core::MemoryMap;
use crate::options::OptionRegistry;

thread_local! {
    pub static STATE: RefCell<State> = RefCell::new(State::new());
}

pub struct State {
    pub is_core_loaded: bool,
    pub pixel_format: PixelFormat,
    pub memory_map: MemoryMap,
    pub options: OptionRegistry,
    /// Set by `SET_GEOMETRY`/`SET_SYSTEM_AV_INFO`; the scaler selector
    /// watches this to know when its cached rectangles are stale.
    pub geometry: Option<GameGeometry>,
    /// Stable directory pointers the environment callback hands back for
    /// `GET_SYSTEM_DIRECTORY`/`GET_SAVE_DIRECTORY`/`GET_CORE_ASSETS_DIRECTORY`.
    /// Owned here (G) rather than by the closure that set them up, so the
    /// pointer stays valid for as long as the core can call back.
    pub system_directory: Option<CString>,
    pub save_directory: Option<CString>,
    pub core_assets_directory: Option<CString>,
    /// Set when the core calls `SHUTDOWN`; the host loop polls this once
    /// per frame and exits cleanly instead of tearing the core down mid
    /// callback.
    pub shutdown_requested: bool,
}

impl State {
    pub fn new() -> Self {
        Self {
            is_core_loaded: false,
            pixel_format: PixelFormat::ARGB1555,
            memory_map: MemoryMap::empty(),
            options: OptionRegistry::new(),
            geometry: None,
            system_directory: None,
            save_directory: None,
            core_assets_directory: None,
            shutdown_requested: false,
        }
    }
}
