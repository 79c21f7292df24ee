//! Legacy /dev/fb* backend.
//!
//! One persistent mapping of the whole framebuffer; painting walks the
//! visible rows honoring the line pitch and x/y panning offsets. Only 32 bpp
//! packed layouts are supported.

use std::fs::{File, OpenOptions};
use std::ops::Range;
use std::os::unix::io::AsRawFd;
use std::path::{Path, PathBuf};
use std::{mem, ptr, slice};

use anyhow::{bail, ensure, Context};
use tracing::{debug, info, warn};

use super::Presenter;

const DEFAULT_FB_PATH: &str = "/dev/fb0";

const FBIOGET_VSCREENINFO: libc::c_ulong = 0x4600;
const FBIOGET_FSCREENINFO: libc::c_ulong = 0x4602;

const BYTES_PER_PIXEL: usize = 4;

// From linux/fb.h; the libc crate doesn't carry these.
#[repr(C)]
#[derive(Clone, Copy)]
struct FbBitfield {
    offset: u32,
    length: u32,
    msb_right: u32,
}

#[repr(C)]
struct FbVarScreeninfo {
    xres: u32,
    yres: u32,
    xres_virtual: u32,
    yres_virtual: u32,
    xoffset: u32,
    yoffset: u32,
    bits_per_pixel: u32,
    grayscale: u32,
    red: FbBitfield,
    green: FbBitfield,
    blue: FbBitfield,
    transp: FbBitfield,
    nonstd: u32,
    activate: u32,
    height: u32,
    width: u32,
    accel_flags: u32,
    pixclock: u32,
    left_margin: u32,
    right_margin: u32,
    upper_margin: u32,
    lower_margin: u32,
    hsync_len: u32,
    vsync_len: u32,
    sync: u32,
    vmode: u32,
    rotate: u32,
    colorspace: u32,
    reserved: [u32; 4],
}

#[repr(C)]
struct FbFixScreeninfo {
    id: [u8; 16],
    smem_start: libc::c_ulong,
    smem_len: u32,
    type_: u32,
    type_aux: u32,
    visual: u32,
    xpanstep: u16,
    ypanstep: u16,
    ywrapstep: u16,
    line_length: u32,
    mmio_start: libc::c_ulong,
    mmio_len: u32,
    accel: u32,
    capabilities: u16,
    reserved: [u16; 2],
}

/// A live framebuffer mapping, unmapped on drop.
struct FbMapping {
    ptr: *mut u8,
    len: usize,
}

impl FbMapping {
    fn new(file: &File, len: usize) -> anyhow::Result<Self> {
        let ptr = unsafe {
            libc::mmap(
                ptr::null_mut(),
                len,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_SHARED,
                file.as_raw_fd(),
                0,
            )
        };
        ensure!(
            ptr != libc::MAP_FAILED,
            "error mapping the framebuffer: {}",
            std::io::Error::last_os_error()
        );

        Ok(Self {
            ptr: ptr.cast(),
            len,
        })
    }

    fn bytes(&mut self) -> &mut [u8] {
        unsafe { slice::from_raw_parts_mut(self.ptr, self.len) }
    }
}

impl Drop for FbMapping {
    fn drop(&mut self) {
        let ret = unsafe { libc::munmap(self.ptr.cast(), self.len) };
        if ret != 0 {
            warn!(
                "error unmapping the framebuffer: {}",
                std::io::Error::last_os_error()
            );
        }
    }
}

/// The byte range of the visible part of row `y`.
fn row_span(pitch: usize, xoffset: usize, yoffset: usize, width: usize, y: usize) -> Range<usize> {
    let start = (yoffset + y) * pitch + xoffset * BYTES_PER_PIXEL;
    start..start + width * BYTES_PER_PIXEL
}

/// The effective pixel depth; some drivers report 16 or 24 bpp layouts whose
/// real depth is the sum of the component lengths, others zero the component
/// fields out entirely.
fn effective_depth(bits_per_pixel: u32, component_bits: u32) -> u32 {
    match bits_per_pixel {
        16 | 24 if component_bits > 0 => component_bits,
        other => other,
    }
}

pub struct Fbdev {
    file: File,
    mapping: Option<FbMapping>,
    name: String,
    len: usize,
    pitch: usize,
    xoffset: usize,
    yoffset: usize,
    width: usize,
    height: usize,
}

impl Fbdev {
    pub fn new(path: Option<&Path>) -> anyhow::Result<Self> {
        let path = path
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from(DEFAULT_FB_PATH));

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(&path)
            .with_context(|| format!("error opening framebuffer device {path:?}"))?;

        let mut fixed: FbFixScreeninfo = unsafe { mem::zeroed() };
        let ret =
            unsafe { libc::ioctl(file.as_raw_fd(), FBIOGET_FSCREENINFO as _, &mut fixed) };
        ensure!(
            ret == 0,
            "error reading fixed screen info: {}",
            std::io::Error::last_os_error()
        );

        let mut var: FbVarScreeninfo = unsafe { mem::zeroed() };
        let ret = unsafe { libc::ioctl(file.as_raw_fd(), FBIOGET_VSCREENINFO as _, &mut var) };
        ensure!(
            ret == 0,
            "error reading variable screen info: {}",
            std::io::Error::last_os_error()
        );

        let component_bits = var.red.length + var.green.length + var.blue.length;
        let depth = effective_depth(var.bits_per_pixel, component_bits);
        if var.bits_per_pixel != 32 {
            bail!("unsupported pixel depth {depth}, only 32 bpp packed layouts work");
        }

        let len = fixed.smem_len as usize;
        let pitch = fixed.line_length as usize;
        let (width, height) = (var.xres as usize, var.yres as usize);
        let (xoffset, yoffset) = (var.xoffset as usize, var.yoffset as usize);

        ensure!(pitch % 4 == 0, "line pitch {pitch} is not whole pixels");
        let last_row = row_span(pitch, xoffset, yoffset, width, height.saturating_sub(1));
        ensure!(
            width > 0 && height > 0 && last_row.end <= len,
            "reported geometry {width}x{height}+{xoffset}+{yoffset} \
             does not fit the {len} byte framebuffer"
        );

        info!(
            "using framebuffer device {path:?}: {width}x{height}+{xoffset}+{yoffset}, \
             pitch {pitch}, {len} bytes"
        );

        Ok(Self {
            file,
            mapping: None,
            name: path.display().to_string(),
            len,
            pitch,
            xoffset,
            yoffset,
            width,
            height,
        })
    }
}

impl Presenter for Fbdev {
    fn output_count(&self) -> usize {
        1
    }

    fn allocate_buffers(&mut self) -> anyhow::Result<()> {
        let mut mapping = FbMapping::new(&self.file, self.len)?;
        mapping.bytes().fill(0);
        self.mapping = Some(mapping);
        Ok(())
    }

    fn present_initial(&mut self) -> anyhow::Result<()> {
        // The console framebuffer is always scanned out; nothing to commit.
        Ok(())
    }

    fn paint_back_buffer(&mut self, _output: usize, fill: &mut dyn FnMut(&mut [u8])) -> bool {
        let Some(mapping) = self.mapping.as_mut() else {
            return false;
        };

        let bytes = mapping.bytes();
        for y in 0..self.height {
            let span = row_span(self.pitch, self.xoffset, self.yoffset, self.width, y);
            fill(&mut bytes[span]);
        }

        true
    }

    fn swap_buffers(&mut self, _output: usize) {
        // Single mapping straight to the screen; the timer is the only pacing.
    }

    fn teardown(&mut self) {
        if self.mapping.take().is_some() {
            debug!("{}: framebuffer unmapped", self.name);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn row_spans_honor_pitch_and_panning() {
        // 4 visible pixels per row, 32 bytes of pitch, panned by (2, 1).
        assert_eq!(row_span(32, 2, 1, 4, 0), 40..56);
        assert_eq!(row_span(32, 2, 1, 4, 3), 136..152);

        // No panning, tight pitch.
        assert_eq!(row_span(16, 0, 0, 4, 2), 32..48);
    }

    #[test]
    fn depth_reporting() {
        assert_eq!(effective_depth(32, 24), 32);
        assert_eq!(effective_depth(24, 24), 24);
        assert_eq!(effective_depth(16, 15), 15);

        // Drivers that zero the component fields still report a real depth.
        assert_eq!(effective_depth(16, 0), 16);
        assert_eq!(effective_depth(24, 0), 24);
        assert_eq!(effective_depth(8, 0), 8);
    }
}
