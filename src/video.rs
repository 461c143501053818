use std::ffi::{c_uint, c_void};
use std::slice;

use itertools::Itertools;
use libretro_sys::PixelFormat;

use crate::scaler::{BlitKind, Geometry, ScalingPolicy, Scaler, Screen};

/// Whether a negotiated pixel format is one the bridge actually forwards.
/// Only XRGB8888 and RGB565 are accepted; everything else (just ARGB1555
/// today) is refused, which makes the core fall back to its default format
/// on the next `SET_PIXEL_FORMAT` attempt.
pub fn accepts_pixel_format(pixel_format: PixelFormat) -> bool {
    matches!(pixel_format, PixelFormat::ARGB8888 | PixelFormat::RGB565)
}

pub struct Frame {
    pub buffer: Vec<u8>,
    pub width: usize,
    pub height: usize,
    pub pitch: usize,
    pub pixel_format: PixelFormat,
}

impl Frame {
    pub fn empty() -> Self {
        Self {
            buffer: Vec::new(),
            width: 0,
            height: 0,
            pitch: 0,
            pixel_format: PixelFormat::ARGB8888,
        }
    }

    pub unsafe fn from_raw(
        data: *const c_void,
        width: c_uint,
        height: c_uint,
        pitch: usize,
        pixel_format: PixelFormat,
    ) -> Option<Self> {
        if data.is_null() {
            return None;
        }

        let width = width as usize;
        let height = height as usize;
        let size = height * pitch;
        let buffer = slice::from_raw_parts(data.cast::<u8>(), size).to_vec();

        Some(Self {
            buffer,
            width,
            height,
            pitch,
            pixel_format,
        })
    }

    pub fn buffer_to_packed_argb32(&self) -> Vec<u32> {
        match self.pixel_format {
            PixelFormat::ARGB1555 => self.argb1555_buffer_to_packed_argb32(),
            PixelFormat::ARGB8888 => self.argb8888_buffer_to_packed_argb32(),
            PixelFormat::RGB565 => self.rgb565_buffer_to_packed_argb32(),
        }
    }

    fn argb8888_buffer_to_packed_argb32(&self) -> Vec<u32> {
        let bytes_per_pixel = 4;
        let bytes_per_row = bytes_per_pixel * self.width;

        self.buffer
            .chunks_exact(self.pitch)
            .flat_map(|row| &row[..bytes_per_row])
            .copied()
            .tuples()
            .map(|(b1, b2, b3, b4)| u32::from_ne_bytes([b1, b2, b3, b4]))
            .collect_vec()
    }

    // Negotiation refuses this format (see `accepts_pixel_format`), so no
    // core should ever hand us a frame in it; kept for completeness rather
    // than left as a panic waiting to happen.
    fn argb1555_buffer_to_packed_argb32(&self) -> Vec<u32> {
        let bytes_per_pixel = 2;
        let bytes_per_row = bytes_per_pixel * self.width;
        let max_5 = (2u8.pow(5) - 1) as f32;

        self.buffer
            .chunks_exact(self.pitch)
            .flat_map(|row| &row[..bytes_per_row])
            .copied()
            .tuples()
            .map(|(b1, b2)| {
                let pixel = u16::from_ne_bytes([b1, b2]);
                let a = if pixel & 0x8000 != 0 { 255 } else { 0 };
                let r = (pixel >> 10) & 0b11111;
                let r = ((r as f32 / max_5) * 255.).round() as u8;
                let g = (pixel >> 5) & 0b11111;
                let g = ((g as f32 / max_5) * 255.).round() as u8;
                let b = pixel & 0b11111;
                let b = ((b as f32 / max_5) * 255.).round() as u8;

                u32::from_be_bytes([a, r, g, b])
            })
            .collect_vec()
    }

    fn rgb565_buffer_to_packed_argb32(&self) -> Vec<u32> {
        let bytes_per_pixel = 2;
        let bytes_per_row = bytes_per_pixel * self.width;
        let max_r = (2u8.pow(5) - 1) as f32;
        let max_g = (2u8.pow(6) - 1) as f32;
        let max_b = (2u8.pow(5) - 1) as f32;

        self.buffer
            .chunks_exact(self.pitch)
            .flat_map(|row| &row[..bytes_per_row])
            .copied()
            .tuples()
            .map(|(b1, b2)| {
                let pixel = u16::from_ne_bytes([b1, b2]);
                let r = pixel >> 11;
                let r = ((r as f32 / max_r) * 255.).round() as u8;
                let g = (pixel >> 5) & 0b111111;
                let g = ((g as f32 / max_g) * 255.).round() as u8;
                let b = pixel & 0b11111;
                let b = ((b as f32 / max_b) * 255.).round() as u8;
                let a = 0;

                u32::from_be_bytes([a, r, g, b])
            })
            .collect_vec()
    }
}

/// Presents a finished blit rectangle. The real GFX driver (framebuffer
/// flip, shader pipeline, vsync wait) is an external collaborator; only its
/// contract is modeled here.
pub trait PlatformVideoSink: Send {
    fn present(&mut self, frame: &Frame, geometry: &Geometry, blit_kind: BlitKind);
}

/// Records frame count and the last geometry presented; used when no real
/// display driver is wired up.
#[derive(Default)]
pub struct NullVideoSink {
    pub frames_presented: u64,
    pub last_geometry: Option<Geometry>,
}

impl PlatformVideoSink for NullVideoSink {
    fn present(&mut self, _frame: &Frame, geometry: &Geometry, _blit_kind: BlitKind) {
        self.frames_presented += 1;
        self.last_geometry = Some(*geometry);
    }
}

/// The video half of the core/platform bridge (spec.md §4.D): negotiates
/// pixel format, feeds the scaler selector on every refresh, and forwards
/// the computed blit rectangle to a [`PlatformVideoSink`]. A `None` frame
/// (the core "duping" its last frame) replays the last frame this bridge
/// saw rather than presenting nothing.
pub struct VideoBridge {
    scaler: Scaler,
    screen: Screen,
    policy: ScalingPolicy,
    core_aspect_ratio: f32,
    sink: Box<dyn PlatformVideoSink>,
    last_frame: Option<Frame>,
}

impl VideoBridge {
    pub fn new(screen: Screen, policy: ScalingPolicy, sink: Box<dyn PlatformVideoSink>) -> Self {
        VideoBridge {
            scaler: Scaler::new(),
            screen,
            policy,
            core_aspect_ratio: 0.0,
            sink,
            last_frame: None,
        }
    }

    pub fn set_policy(&mut self, policy: ScalingPolicy) {
        self.policy = policy;
        self.scaler.invalidate();
    }

    pub fn set_core_aspect_ratio(&mut self, aspect_ratio: f32) {
        self.core_aspect_ratio = aspect_ratio;
        self.scaler.invalidate();
    }

    pub fn invalidate_geometry(&mut self) {
        self.scaler.invalidate();
    }

    /// The most recent frame presented (or duped), for screenshotting.
    pub fn last_frame(&self) -> Option<&Frame> {
        self.last_frame.as_ref()
    }

    /// Handles one `video_refresh` callback. Drops frames with no prior
    /// frame to dupe rather than presenting garbage.
    pub fn refresh(&mut self, frame: Option<Frame>) {
        if let Some(frame) = frame {
            self.last_frame = Some(frame);
        }
        let Some(frame) = &self.last_frame else { return };

        self.scaler.update(
            frame.width as u32,
            frame.height as u32,
            frame.pitch,
            self.core_aspect_ratio,
            self.screen,
            self.policy,
        );
        let geometry = *self.scaler.current().expect("update always populates current geometry");
        let blit_kind = geometry.blit_kind(self.policy);
        self.sink.present(frame, &geometry, blit_kind);
    }
}
