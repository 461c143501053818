//! Frame scaler selector: maps a core's reported output geometry onto the
//! device's fixed framebuffer. Grounded in `selectScaler()` in
//! `workspace/all/minarch/minarch.c`, simplified to the five named policies
//! and their blit-rectangle math as described in the distilled spec.

/// One of the five scaling behaviors a user can pick in the menu.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScalingPolicy {
    Native,
    Cropped,
    Fullscreen,
    AspectScreen,
    Aspect,
}

/// Which blit routine the platform GFX layer should reach for. Policy
/// metadata only — the actual resampling is the platform's job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlitKind {
    NearestInteger,
    NearestArbitrary,
    Bilinear,
}

/// The device's fixed output surface.
#[derive(Debug, Clone, Copy)]
pub struct Screen {
    pub width: u32,
    pub height: u32,
    /// `true` for an HDMI-out-sized screen; disables the `cropped` policy
    /// per spec.md §4.B ("only valid when device screen is not HDMI-sized").
    pub is_hdmi: bool,
}

/// Renderer geometry: blit rectangle plus scale/aspect metadata, §3.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Geometry {
    pub src_x: u32,
    pub src_y: u32,
    pub src_w: u32,
    pub src_h: u32,
    pub src_pitch: usize,
    pub dst_x: u32,
    pub dst_y: u32,
    pub dst_w: u32,
    pub dst_h: u32,
    pub dst_pitch: usize,
    pub scale: u32,
    /// `0.0` for native/cropped (no aspect correction), source aspect for
    /// `aspect_screen`, `-1.0` for fullscreen (oversized, caller crops), the
    /// core-reported aspect ratio for `aspect`.
    pub aspect: f32,
}

impl Geometry {
    pub fn blit_kind(&self, policy: ScalingPolicy) -> BlitKind {
        match policy {
            ScalingPolicy::Native if self.scale > 0 => BlitKind::NearestInteger,
            ScalingPolicy::Native | ScalingPolicy::Cropped => BlitKind::NearestArbitrary,
            ScalingPolicy::Fullscreen => BlitKind::NearestInteger,
            ScalingPolicy::AspectScreen | ScalingPolicy::Aspect => BlitKind::Bilinear,
        }
    }
}

/// Tracks the last geometry the selector computed a rectangle for, so the
/// bridge (§4.D) knows when to recompute: either `dst_pitch == 0` (explicit
/// invalidation, e.g. after a policy switch) or `(src_w, src_h)` changed.
#[derive(Default)]
pub struct Scaler {
    current: Option<Geometry>,
    true_w: u32,
    true_h: u32,
}

impl Scaler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Forces the next `update` call to recompute regardless of geometry.
    pub fn invalidate(&mut self) {
        if let Some(geometry) = &mut self.current {
            geometry.dst_pitch = 0;
        }
    }

    pub fn current(&self) -> Option<&Geometry> {
        self.current.as_ref()
    }

    /// Recomputes the blit rectangle if needed, returning `true` when a
    /// recompute happened (callers use this to invalidate shader caches
    /// downstream, per spec.md §4.B).
    pub fn update(
        &mut self,
        src_w: u32,
        src_h: u32,
        src_pitch: usize,
        core_aspect_ratio: f32,
        screen: Screen,
        policy: ScalingPolicy,
    ) -> bool {
        let needs_recompute = match &self.current {
            None => true,
            Some(g) => g.dst_pitch == 0 || src_w != self.true_w || src_h != self.true_h,
        };

        if !needs_recompute {
            return false;
        }

        self.true_w = src_w;
        self.true_h = src_h;
        self.current = Some(select_scaler(
            src_w,
            src_h,
            src_pitch,
            core_aspect_ratio,
            screen,
            policy,
        ));

        true
    }
}

const FIXED_BPP: u32 = 4;

fn ceil_div(a: u32, b: u32) -> u32 {
    if b == 0 {
        return 0;
    }

    (a + b - 1) / b
}

/// Pure function computing the renderer geometry for one policy. Split out
/// of `Scaler::update` so invariants 7/8 (spec.md §8) can be tested
/// directly without constructing a `Scaler`.
pub fn select_scaler(
    src_w: u32,
    src_h: u32,
    src_pitch: usize,
    core_aspect_ratio: f32,
    screen: Screen,
    policy: ScalingPolicy,
) -> Geometry {
    if src_w == 0 || src_h == 0 {
        return Geometry {
            src_x: 0,
            src_y: 0,
            src_w,
            src_h,
            src_pitch,
            dst_x: 0,
            dst_y: 0,
            dst_w: 0,
            dst_h: 0,
            dst_pitch: 0,
            scale: 0,
            aspect: 0.0,
        };
    }

    // "only valid when device screen is not HDMI-sized; otherwise degrade to native"
    let policy = if policy == ScalingPolicy::Cropped && screen.is_hdmi {
        ScalingPolicy::Native
    } else {
        policy
    };

    match policy {
        ScalingPolicy::Native => native(src_w, src_h, src_pitch, screen),
        ScalingPolicy::Cropped => cropped(src_w, src_h, src_pitch, screen),
        ScalingPolicy::Fullscreen => fullscreen(src_w, src_h, src_pitch, screen),
        ScalingPolicy::AspectScreen => aspect_screen(src_w, src_h, src_pitch, screen),
        ScalingPolicy::Aspect => aspect(src_w, src_h, src_pitch, core_aspect_ratio, screen),
    }
}

fn native(src_w: u32, src_h: u32, src_pitch: usize, screen: Screen) -> Geometry {
    let scale = (screen.width / src_w).min(screen.height / src_h);

    if scale == 0 {
        // force-crop: dst is the whole screen, center the source on it
        let ox = (screen.width as i64 - src_w as i64) / 2;
        let oy = (screen.height as i64 - src_h as i64) / 2;
        let (src_x, dst_x) = split_offset(ox);
        let (src_y, dst_y) = split_offset(oy);

        return Geometry {
            src_x,
            src_y,
            src_w,
            src_h,
            src_pitch,
            dst_x,
            dst_y,
            dst_w: screen.width,
            dst_h: screen.height,
            dst_pitch: (screen.width * FIXED_BPP) as usize,
            scale: 0,
            aspect: 0.0,
        };
    }

    let scaled_w = src_w * scale;
    let scaled_h = src_h * scale;

    Geometry {
        src_x: 0,
        src_y: 0,
        src_w,
        src_h,
        src_pitch,
        dst_x: (screen.width - scaled_w) / 2,
        dst_y: (screen.height - scaled_h) / 2,
        dst_w: screen.width,
        dst_h: screen.height,
        dst_pitch: (screen.width * FIXED_BPP) as usize,
        scale,
        aspect: 0.0,
    }
}

fn split_offset(offset: i64) -> (u32, u32) {
    if offset < 0 {
        ((-offset) as u32, 0)
    } else {
        (0, offset as u32)
    }
}

fn cropped(mut src_w: u32, mut src_h: u32, src_pitch: usize, screen: Screen) -> Geometry {
    let scale = ceil_div(screen.width, src_w).min(ceil_div(screen.height, src_h));

    if scale == 0 {
        return native(src_w, src_h, src_pitch, screen);
    }

    let scaled_w = src_w * scale;
    let scaled_h = src_h * scale;

    let ox = (screen.width as i64 - scaled_w as i64) / 2;
    let oy = (screen.height as i64 - scaled_h as i64) / 2;

    let mut src_x = 0;
    let mut dst_x = 0;
    if ox < 0 {
        src_x = ((-ox) as u32) / scale;
        src_w -= src_x * 2;
    } else {
        dst_x = ox as u32;
    }

    let mut src_y = 0;
    let mut dst_y = 0;
    if oy < 0 {
        src_y = ((-oy) as u32) / scale;
        src_h -= src_y * 2;
    } else {
        dst_y = oy as u32;
    }

    Geometry {
        src_x,
        src_y,
        src_w,
        src_h,
        src_pitch,
        dst_x,
        dst_y,
        dst_w: screen.width,
        dst_h: screen.height,
        dst_pitch: (screen.width * FIXED_BPP) as usize,
        scale,
        aspect: 0.0,
    }
}

fn fullscreen_scale(src_w: u32, src_h: u32, screen: Screen) -> u32 {
    let scale_x = ceil_div(screen.width, src_w);
    let mut scale_y = ceil_div(screen.height, src_h);

    // 8px snap on the vertical remainder for odd resolutions (eg. 320x239)
    let remainder = (screen.height.max(src_h) - src_h) % 8;
    if remainder != 0 && remainder < 8 && scale_y > 1 {
        scale_y -= 1;
    }

    scale_x.max(scale_y).max(1)
}

fn fullscreen(src_w: u32, src_h: u32, src_pitch: usize, screen: Screen) -> Geometry {
    let scale = fullscreen_scale(src_w, src_h, screen);
    let dst_w = src_w * scale;
    let dst_h = src_h * scale;

    Geometry {
        src_x: 0,
        src_y: 0,
        src_w,
        src_h,
        src_pitch,
        dst_x: 0,
        dst_y: 0,
        dst_w,
        dst_h,
        dst_pitch: (dst_w * FIXED_BPP) as usize,
        scale,
        aspect: -1.0,
    }
}

fn aspect_screen(src_w: u32, src_h: u32, src_pitch: usize, screen: Screen) -> Geometry {
    let scale = (screen.width / src_w).min(screen.height / src_h).max(1);
    let dst_w = src_w * scale;
    let dst_h = src_h * scale;

    Geometry {
        src_x: 0,
        src_y: 0,
        src_w,
        src_h,
        src_pitch,
        dst_x: (screen.width - dst_w) / 2,
        dst_y: (screen.height - dst_h) / 2,
        dst_w,
        dst_h,
        dst_pitch: (dst_w * FIXED_BPP) as usize,
        scale,
        aspect: src_w as f32 / src_h as f32,
    }
}

fn aspect(
    src_w: u32,
    src_h: u32,
    src_pitch: usize,
    core_aspect_ratio: f32,
    screen: Screen,
) -> Geometry {
    let scale = fullscreen_scale(src_w, src_h, screen);
    let scaled_w = src_w * scale;
    let scaled_h = src_h * scale;
    let screen_aspect = screen.width as f32 / screen.height as f32;

    let (dst_w, dst_h, dst_x, dst_y) = if core_aspect_ratio > screen_aspect {
        // letterbox: width-locked, height shrinks
        let dst_h = (scaled_w as f32 / core_aspect_ratio).round() as u32;
        (
            scaled_w,
            dst_h.max(1),
            0,
            (dst_h.max(1).max(scaled_h) - scaled_h) / 2,
        )
    } else if core_aspect_ratio < screen_aspect {
        // pillarbox: height-locked, width shrinks, snapped to a multiple of 8
        let raw_w = (scaled_h as f32 * core_aspect_ratio).round() as u32;
        let dst_w = ((raw_w / 8) * 8).max(8);
        (dst_w, scaled_h, (dst_w.max(scaled_w) - scaled_w) / 2, 0)
    } else {
        (scaled_w, scaled_h, 0, 0)
    };

    Geometry {
        src_x: 0,
        src_y: 0,
        src_w,
        src_h,
        src_pitch,
        dst_x,
        dst_y,
        dst_w,
        dst_h,
        dst_pitch: (dst_w * FIXED_BPP) as usize,
        scale,
        aspect: core_aspect_ratio,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SCREEN: Screen = Screen {
        width: 640,
        height: 480,
        is_hdmi: false,
    };

    /// Invariant 7 (spec.md §8): native policy with a source that fits
    /// produces an integer scale >= 1 and a fully on-screen centered rect.
    #[test]
    fn native_fit_is_integer_and_centered() {
        let g = select_scaler(320, 240, 320 * 4, 4.0 / 3.0, SCREEN, ScalingPolicy::Native);

        assert!(g.scale >= 1);
        assert_eq!(g.dst_w, SCREEN.width);
        assert_eq!(g.dst_h, SCREEN.height);
        assert!(g.dst_x + g.src_w * g.scale <= SCREEN.width);
        assert!(g.dst_y + g.src_h * g.scale <= SCREEN.height);
    }

    #[test]
    fn native_oversized_force_crops() {
        let g = select_scaler(800, 600, 800 * 4, 4.0 / 3.0, SCREEN, ScalingPolicy::Native);

        assert_eq!(g.scale, 0);
        assert_eq!(g.dst_w, SCREEN.width);
        assert_eq!(g.dst_h, SCREEN.height);
        assert_eq!(g.src_x, (800 - SCREEN.width) / 2);
        assert_eq!(g.src_y, (600 - SCREEN.height) / 2);
    }

    /// Invariant 8: equal aspect ratios produce an exact (rounding-free)
    /// match between dst and screen aspect.
    #[test]
    fn aspect_matching_ratio_is_exact() {
        let screen_aspect = SCREEN.width as f32 / SCREEN.height as f32;
        let g = select_scaler(
            320,
            240,
            320 * 4,
            screen_aspect,
            SCREEN,
            ScalingPolicy::Aspect,
        );

        assert_eq!(g.dst_w * SCREEN.height, g.dst_h * SCREEN.width);
    }

    #[test]
    fn aspect_wider_than_screen_letterboxes() {
        // core_aspect_ratio wider than the 4:3 screen -> letterbox (height shrinks)
        let g = select_scaler(320, 240, 320 * 4, 2.0, SCREEN, ScalingPolicy::Aspect);

        assert!(g.dst_h <= SCREEN.height);
    }

    #[test]
    fn cropped_degrades_to_native_on_hdmi() {
        let hdmi = Screen {
            is_hdmi: true,
            ..SCREEN
        };

        let cropped = select_scaler(320, 240, 320 * 4, 4.0 / 3.0, hdmi, ScalingPolicy::Cropped);
        let native = select_scaler(320, 240, 320 * 4, 4.0 / 3.0, hdmi, ScalingPolicy::Native);

        assert_eq!(cropped, native);
    }

    #[test]
    fn scaler_invalidates_on_dst_pitch_reset() {
        let mut scaler = Scaler::new();

        assert!(scaler.update(320, 240, 320 * 4, 4.0 / 3.0, SCREEN, ScalingPolicy::Native));
        assert!(!scaler.update(320, 240, 320 * 4, 4.0 / 3.0, SCREEN, ScalingPolicy::Native));

        scaler.invalidate();
        assert!(scaler.update(320, 240, 320 * 4, 4.0 / 3.0, SCREEN, ScalingPolicy::Aspect));
    }

    #[test]
    fn scaler_recomputes_on_geometry_change() {
        let mut scaler = Scaler::new();

        assert!(scaler.update(320, 240, 320 * 4, 4.0 / 3.0, SCREEN, ScalingPolicy::Native));
        assert!(scaler.update(256, 224, 256 * 4, 4.0 / 3.0, SCREEN, ScalingPolicy::Native));
    }
}
