//! Dumb buffer allocation and release.

use anyhow::{bail, Context};
use drm::buffer::{Buffer, DrmFourcc};
use drm::control::dumbbuffer::DumbBuffer;
use drm::control::{framebuffer, Device as ControlDevice, Mode};
use tracing::warn;

use super::device::Card;

const BPP: u32 = 32;
const DEPTH: u32 = 24;

/// A dumb buffer registered as a presentable framebuffer.
///
/// Either fully constructed or absent; [`create_framebuffer`] releases every
/// partial step on failure.
pub struct Framebuffer {
    pub bo: DumbBuffer,
    pub fb: framebuffer::Handle,
    pub pitch: u32,
    pub len: usize,
}

/// The driver may round the pitch and size up, never down.
pub fn buffer_len_ok(len: usize, width: u16, height: u16) -> bool {
    len % 4 == 0 && len >= width as usize * height as usize * 4
}

pub fn create_framebuffer(card: &Card, mode: &Mode) -> anyhow::Result<Framebuffer> {
    let (width, height) = mode.size();

    let mut bo = card
        .create_dumb_buffer((width.into(), height.into()), DrmFourcc::Xrgb8888, BPP)
        .context("error creating dumb buffer")?;
    let pitch = bo.pitch();

    let fb = match card.add_framebuffer(&bo, DEPTH, BPP) {
        Ok(fb) => fb,
        Err(err) => {
            let _ = card.destroy_dumb_buffer(bo);
            return Err(err).context("error registering framebuffer");
        }
    };

    // Map once up front so a buffer the paint loop can't use fails here. The
    // mapping's borrow of `bo` must end before the error path destroys it.
    let mapped = card.map_dumb_buffer(&mut bo).map(|mut map| {
        let bytes = map.as_mut();
        bytes.fill(0);
        bytes.len()
    });
    let len = match mapped {
        Ok(len) => len,
        Err(err) => {
            let _ = card.destroy_framebuffer(fb);
            let _ = card.destroy_dumb_buffer(bo);
            return Err(err).context("error mapping dumb buffer");
        }
    };

    if pitch % 4 != 0 || !buffer_len_ok(len, width, height) {
        let _ = card.destroy_framebuffer(fb);
        let _ = card.destroy_dumb_buffer(bo);
        bail!("driver returned an unusable buffer ({len} bytes, pitch {pitch}, for {width}x{height})");
    }

    Ok(Framebuffer { bo, fb, pitch, len })
}

/// Unregisters and frees a framebuffer, logging failures.
pub fn destroy_framebuffer(card: &Card, fb: Framebuffer, output: &str) {
    if let Err(err) = card.destroy_framebuffer(fb.fb) {
        warn!("{output}: error removing framebuffer: {err}");
    }
    if let Err(err) = card.destroy_dumb_buffer(fb.bo) {
        warn!("{output}: error destroying dumb buffer: {err}");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn buffer_len_validation() {
        // Exact fit and rounded-up sizes are fine.
        assert!(buffer_len_ok(1920 * 1080 * 4, 1920, 1080));
        assert!(buffer_len_ok(2048 * 1080 * 4, 1920, 1080));

        // Too small for the mode, or not whole pixels.
        assert!(!buffer_len_ok(1920 * 1080 * 4 - 4, 1920, 1080));
        assert!(!buffer_len_ok(1920 * 1080 * 4 + 2, 1920, 1080));
        assert!(!buffer_len_ok(0, 1920, 1080));
    }
}
