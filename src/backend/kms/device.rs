//! DRM card handle, capability checks and output discovery.

use std::collections::HashSet;
use std::fs::{File, OpenOptions};
use std::os::unix::io::{AsFd, BorrowedFd};
use std::path::{Path, PathBuf};

use anyhow::{ensure, Context};
use drm::control::{connector, crtc, Device as ControlDevice, Mode, ResourceHandles};
use drm::{Device, DriverCapability};
use tracing::{debug, info, warn};

use super::buffers::Framebuffer;
use super::flip::SwapState;
use super::helpers::pick_mode;

const DEFAULT_CARD_PATHS: [&str; 2] = ["/dev/dri/card0", "/dev/dri/card1"];

/// An open DRM card with mode-setting access.
pub struct Card(File);

impl AsFd for Card {
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.0.as_fd()
    }
}

impl Device for Card {}
impl ControlDevice for Card {}

impl Card {
    pub fn open(path: &Path) -> anyhow::Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(path)
            .with_context(|| format!("error opening DRM device {path:?}"))?;

        let card = Self(file);

        let cap = card
            .get_driver_capability(DriverCapability::DumbBuffer)
            .context("error querying the dumb buffer capability")?;
        ensure!(cap != 0, "{path:?} does not support dumb buffers");

        info!("using DRM device {path:?}");
        Ok(card)
    }
}

/// Opens `path` if given, otherwise the first usable default card.
pub fn open_card(path: Option<&Path>) -> anyhow::Result<Card> {
    if let Some(path) = path {
        return Card::open(path);
    }

    let mut last_err = None;
    for path in DEFAULT_CARD_PATHS {
        match Card::open(&PathBuf::from(path)) {
            Ok(card) => return Ok(card),
            Err(err) => {
                debug!("skipping {path}: {err:#}");
                last_err = Some(err);
            }
        }
    }

    Err(last_err.unwrap_or_else(|| anyhow::anyhow!("no DRM device found")))
}

/// A connected display output and its presentation state.
pub struct Output {
    pub connector: connector::Handle,
    pub crtc: crtc::Handle,
    pub mode: Mode,
    pub name: String,
    /// Allocated buffer slots; a slot is `None` until allocation succeeds and
    /// again after teardown.
    pub buffers: Vec<Option<Framebuffer>>,
    pub swap: SwapState,
    /// A mode was committed to the CRTC and must be restored at teardown.
    pub mode_committed: bool,
    /// CRTC configuration saved before the first commit.
    pub saved_crtc: Option<crtc::Info>,
}

impl Output {
    fn new(
        connector: connector::Handle,
        crtc: crtc::Handle,
        mode: Mode,
        name: String,
        buffer_count: usize,
    ) -> Self {
        Self {
            connector,
            crtc,
            mode,
            name,
            buffers: (0..buffer_count).map(|_| None).collect(),
            swap: SwapState::new(buffer_count),
            mode_committed: false,
            saved_crtc: None,
        }
    }
}

/// Enumerates connected connectors and assigns each a free CRTC and a mode.
pub fn discover_outputs(card: &Card, buffer_count: usize) -> anyhow::Result<Vec<Output>> {
    let resources = card
        .resource_handles()
        .context("error getting DRM resource handles")?;

    let mut outputs = Vec::new();
    let mut taken_crtcs = HashSet::new();

    for &conn in resources.connectors() {
        let connector = match card.get_connector(conn, true) {
            Ok(connector) => connector,
            Err(err) => {
                warn!("error probing connector {conn:?}: {err}");
                continue;
            }
        };

        if connector.state() != connector::State::Connected {
            continue;
        }

        let name = format!(
            "{}-{}",
            connector.interface().as_str(),
            connector.interface_id()
        );

        let Some(mode) = pick_mode(connector.modes()) else {
            warn!("{name}: connected but has no modes, skipping");
            continue;
        };

        let Some(crtc) = pick_crtc(card, &resources, &connector, &taken_crtcs) else {
            warn!("{name}: no free CRTC, skipping");
            continue;
        };
        taken_crtcs.insert(crtc);

        let (width, height) = mode.size();
        info!("{name}: {width}x{height}@{} on {crtc:?}", mode.vrefresh());

        outputs.push(Output::new(conn, crtc, mode, name, buffer_count));
    }

    ensure!(!outputs.is_empty(), "no connected outputs found");
    Ok(outputs)
}

/// Picks a CRTC for the connector, preferring the one already driving it.
fn pick_crtc(
    card: &Card,
    resources: &ResourceHandles,
    connector: &connector::Info,
    taken: &HashSet<crtc::Handle>,
) -> Option<crtc::Handle> {
    if let Some(enc) = connector.current_encoder() {
        if let Ok(encoder) = card.get_encoder(enc) {
            if let Some(crtc) = encoder.crtc() {
                if !taken.contains(&crtc) {
                    return Some(crtc);
                }
            }
        }
    }

    for &enc in connector.encoders() {
        let Ok(encoder) = card.get_encoder(enc) else {
            continue;
        };

        for crtc in resources.filter_crtcs(encoder.possible_crtcs()) {
            if !taken.contains(&crtc) {
                return Some(crtc);
            }
        }
    }

    None
}
