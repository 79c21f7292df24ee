//! Presentation backends.
//!
//! A backend owns the display device, its outputs and their buffers, and
//! exposes the small capability set the paint loop drives. Three variants:
//!
//! - `kms::PageFlip`: DRM dumb buffers, double-buffered, swapped with
//!   page-flip events. The default on any card that supports dumb buffers.
//! - `kms::SingleBuffer`: DRM dumb buffer committed once with the mode; the
//!   paint loop writes straight into the scanned-out buffer.
//! - `fbdev::Fbdev`: the legacy `/dev/fb*` interface, one persistent mapping.

use std::path::Path;

use clap::ValueEnum;
use tracing::warn;

pub mod fbdev;
pub mod kms;

pub trait Presenter {
    fn output_count(&self) -> usize;

    /// Allocates the buffers for every discovered output.
    ///
    /// Per-output failures are logged and leave that output without buffers;
    /// an error means no output has a usable buffer.
    fn allocate_buffers(&mut self) -> anyhow::Result<()>;

    /// Commits the first buffer to the screen.
    fn present_initial(&mut self) -> anyhow::Result<()>;

    /// Calls `fill` with the writable back buffer of `output`.
    ///
    /// Blocks until the output's previous swap is confirmed. Returns `false`
    /// if the output has no usable buffer this tick.
    fn paint_back_buffer(&mut self, output: usize, fill: &mut dyn FnMut(&mut [u8])) -> bool;

    /// Schedules the freshly painted buffer for presentation.
    ///
    /// A failed request is logged and dropped; the next tick tries again.
    fn swap_buffers(&mut self, output: usize);

    /// Releases buffers and restores the previous display configuration.
    ///
    /// Failures are logged and never escalate; every buffer slot is left
    /// empty afterwards.
    fn teardown(&mut self);
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum BackendKind {
    /// Page-flip KMS if a usable DRM card is found, legacy fbdev otherwise.
    #[default]
    Auto,
    /// DRM dumb buffers swapped on page-flip completion.
    PageFlip,
    /// One DRM dumb buffer, painted in place.
    SingleBuffer,
    /// Legacy /dev/fb* framebuffer.
    Fbdev,
}

pub fn create(kind: BackendKind, device: Option<&Path>) -> anyhow::Result<Box<dyn Presenter>> {
    match kind {
        BackendKind::PageFlip => Ok(Box::new(kms::PageFlip::new(device)?)),
        BackendKind::SingleBuffer => Ok(Box::new(kms::SingleBuffer::new(device)?)),
        BackendKind::Fbdev => Ok(Box::new(fbdev::Fbdev::new(device)?)),
        BackendKind::Auto => match kms::PageFlip::new(device) {
            Ok(backend) => Ok(Box::new(backend)),
            Err(err) => {
                warn!("no usable DRM device ({err:#}); trying the legacy framebuffer");
                Ok(Box::new(fbdev::Fbdev::new(None)?))
            }
        },
    }
}
