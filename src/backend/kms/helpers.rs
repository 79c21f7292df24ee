//! Stateless DRM helpers: mode selection, timing math, property lookup.

use std::time::Duration;

use anyhow::Context;
use drm::control::{
    self, property, Device as ControlDevice, ModeFlags, ModeTypeFlags, ResourceHandle,
};
use tracing::warn;

use super::device::Card;

const DPMS_ON: property::RawValue = 0;

/// Picks the preferred mode with the highest refresh rate, falling back to
/// the first mode the connector lists.
pub fn pick_mode(modes: &[control::Mode]) -> Option<control::Mode> {
    let mut mode: Option<&control::Mode> = None;

    for m in modes {
        if !m.mode_type().contains(ModeTypeFlags::PREFERRED) {
            continue;
        }

        if let Some(curr) = mode {
            if curr.vrefresh() < m.vrefresh() {
                mode = Some(m);
            }
        } else {
            mode = Some(m);
        }
    }

    mode.or_else(|| modes.first()).copied()
}

/// Calculate the refresh interval from a DRM mode.
pub fn refresh_interval(mode: control::Mode) -> Duration {
    let clock = mode.clock() as u64;
    let htotal = mode.hsync().2 as u64;
    let vtotal = mode.vsync().2 as u64;

    let mut numerator = htotal * vtotal * 1_000_000;
    let mut denominator = clock;

    if mode.flags().contains(ModeFlags::INTERLACE) {
        denominator *= 2;
    }

    if mode.flags().contains(ModeFlags::DBLSCAN) {
        numerator *= 2;
    }

    if mode.vscan() > 1 {
        numerator *= mode.vscan() as u64;
    }

    let refresh_interval = (numerator + denominator / 2) / denominator;
    Duration::from_nanos(refresh_interval)
}

/// Find a DRM property by name.
pub fn find_drm_property(
    card: &Card,
    resource: impl ResourceHandle,
    name: &str,
) -> Option<(property::Handle, property::Info, property::RawValue)> {
    let props = match card.get_properties(resource) {
        Ok(props) => props,
        Err(err) => {
            warn!("error getting properties: {err:?}");
            return None;
        }
    };

    props.into_iter().find_map(|(handle, value)| {
        let info = card.get_property(handle).ok()?;
        let n = info.name().to_str().ok()?;

        (n == name).then_some((handle, info, value))
    })
}

/// Sets the connector's DPMS power state to on.
pub fn set_power_on(card: &Card, connector: control::connector::Handle) -> anyhow::Result<()> {
    let (handle, _info, value) =
        find_drm_property(card, connector, "DPMS").context("no DPMS property")?;

    if value != DPMS_ON {
        card.set_property(connector, handle, DPMS_ON)
            .context("error setting the DPMS property")?;
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use std::iter::zip;

    use drm_ffi::drm_mode_modeinfo;
    use insta::assert_debug_snapshot;

    use super::*;

    fn name_slice(mode_name: &str) -> [core::ffi::c_char; 32] {
        let mut name: [core::ffi::c_char; 32] = [0; 32];
        for (a, b) in zip(&mut name[..31], mode_name.as_bytes()) {
            // Can be u8 on aarch64 and i8 on x86_64.
            *a = *b as _;
        }
        name
    }

    fn mode(vrefresh: u32, type_: u32, flags: u32, vscan: u16) -> control::Mode {
        control::Mode::from(drm_mode_modeinfo {
            clock: 60_000,
            hdisplay: 800,
            hsync_start: 840,
            hsync_end: 880,
            htotal: 1000,
            vdisplay: 600,
            vsync_start: 610,
            vsync_end: 620,
            vtotal: 1000,
            vrefresh,
            flags,
            type_,
            name: name_slice(&format!("800x600@{vrefresh}")),
            hskew: 0,
            vscan,
        })
    }

    #[test]
    fn pick_prefers_preferred_with_highest_refresh() {
        let modes = [
            mode(75, 0, 0, 0),
            mode(60, drm_ffi::DRM_MODE_TYPE_PREFERRED, 0, 0),
            mode(50, drm_ffi::DRM_MODE_TYPE_PREFERRED, 0, 0),
        ];

        let picked = pick_mode(&modes).unwrap();
        assert_eq!(picked.vrefresh(), 60);
        assert!(picked.mode_type().contains(ModeTypeFlags::PREFERRED));
    }

    #[test]
    fn pick_falls_back_to_first_listed() {
        let modes = [mode(75, 0, 0, 0), mode(120, 0, 0, 0)];
        assert_eq!(pick_mode(&modes).unwrap().vrefresh(), 75);

        assert!(pick_mode(&[]).is_none());
    }

    #[test]
    fn refresh_interval_from_timings() {
        // 1000x1000 total at a 60 MHz pixel clock.
        assert_debug_snapshot!(refresh_interval(mode(60, 0, 0, 0)), @"16.666667ms");

        assert_debug_snapshot!(
            refresh_interval(mode(120, 0, drm_ffi::DRM_MODE_FLAG_INTERLACE, 0)),
            @"8.333333ms"
        );

        assert_debug_snapshot!(
            refresh_interval(mode(30, 0, drm_ffi::DRM_MODE_FLAG_DBLSCAN, 0)),
            @"33.333333ms"
        );

        assert_debug_snapshot!(refresh_interval(mode(20, 0, 0, 3)), @"50ms");
    }
}
