//! Paint loop driving the shifting solid-color fill.
//!
//! Owns the process-wide color counters. Each tick advances the counters once,
//! then paints and swaps every output through the active backend.

use bytemuck::cast_slice_mut;
use tracing::trace;

use crate::backend::Presenter;

/// Color counters stepping by 1, 2 and 3 per tick with u8 wraparound.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ColorCycle {
    r: u8,
    g: u8,
    b: u8,
}

impl ColorCycle {
    pub fn new() -> Self {
        Self::default()
    }

    /// Advances the counters one step and returns the packed XRGB fill word.
    pub fn advance(&mut self) -> u32 {
        self.r = self.r.wrapping_add(1);
        self.g = self.g.wrapping_add(2);
        self.b = self.b.wrapping_add(3);
        u32::from(self.r) << 16 | u32::from(self.g) << 8 | u32::from(self.b)
    }
}

/// Fill every 32-bit pixel in `bytes` with `color`.
///
/// `bytes` must be 4-byte aligned with a length divisible by 4; the backends
/// validate both at buffer setup.
pub fn fill_pixels(bytes: &mut [u8], color: u32) {
    let pixels: &mut [u32] = cast_slice_mut(bytes);
    pixels.fill(color);
}

pub struct PaintLoop {
    colors: ColorCycle,
}

impl PaintLoop {
    pub fn new() -> Self {
        Self {
            colors: ColorCycle::new(),
        }
    }

    /// Runs one paint tick across all outputs.
    pub fn tick(&mut self, backend: &mut dyn Presenter) {
        let color = self.colors.advance();
        trace!("painting color {color:#08x}");

        for output in 0..backend.output_count() {
            if backend.paint_back_buffer(output, &mut |bytes| fill_pixels(bytes, color)) {
                backend.swap_buffers(output);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn color_progression() {
        let mut colors = ColorCycle::new();
        assert_eq!(colors.advance(), 0x00010203);
        assert_eq!(colors.advance(), 0x00020406);

        let mut colors = ColorCycle::new();
        let mut last = 0;
        for _ in 0..100 {
            last = colors.advance();
        }
        // After tick k: r = k, g = 2k mod 256, b = 3k mod 256.
        assert_eq!(last, 0x0064C82C);
    }

    #[test]
    fn color_wraparound() {
        let mut colors = ColorCycle::new();
        for _ in 0..256 {
            colors.advance();
        }
        // All three counters return to zero after 256 ticks.
        assert_eq!(colors, ColorCycle::new());
    }

    #[test]
    fn fill_covers_every_pixel() {
        let mut buf = vec![0u32; 64];
        fill_pixels(bytemuck::cast_slice_mut(&mut buf), 0x00AABBCC);
        assert!(buf.iter().all(|&px| px == 0x00AABBCC));
    }
}
