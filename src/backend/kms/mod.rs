//! DRM/KMS backends built on dumb buffers.

use std::path::Path;

use anyhow::{ensure, Context};
use drm::control::{Device as ControlDevice, Event, PageFlipFlags};
use tracing::{debug, info, trace, warn};

mod buffers;
mod device;
mod flip;
mod helpers;

use buffers::{create_framebuffer, destroy_framebuffer};
use device::{discover_outputs, open_card, Card, Output};
use helpers::{refresh_interval, set_power_on};

use super::Presenter;

/// Double-buffered KMS backend paced by page-flip completion events.
pub struct PageFlip {
    card: Card,
    outputs: Vec<Output>,
}

impl PageFlip {
    pub fn new(path: Option<&Path>) -> anyhow::Result<Self> {
        let card = open_card(path)?;
        let outputs = discover_outputs(&card, 2)?;
        Ok(Self { card, outputs })
    }
}

impl Presenter for PageFlip {
    fn output_count(&self) -> usize {
        self.outputs.len()
    }

    fn allocate_buffers(&mut self) -> anyhow::Result<()> {
        allocate_outputs(&self.card, &mut self.outputs)
    }

    fn present_initial(&mut self) -> anyhow::Result<()> {
        commit_outputs(&self.card, &mut self.outputs)
    }

    fn paint_back_buffer(&mut self, output: usize, fill: &mut dyn FnMut(&mut [u8])) -> bool {
        if self.outputs[output].swap.awaiting_confirm() {
            if let Err(err) = wait_for_flip(&self.card, &mut self.outputs, output) {
                warn!(
                    "{}: error waiting for page flip: {err:#}",
                    self.outputs[output].name
                );
                return false;
            }
        }

        paint_output(&self.card, &mut self.outputs[output], fill)
    }

    fn swap_buffers(&mut self, output: usize) {
        let output = &mut self.outputs[output];
        let back = output.swap.back_buffer();
        let Some(fb) = output.buffers[back].as_ref() else {
            return;
        };

        match self
            .card
            .page_flip(output.crtc, fb.fb, PageFlipFlags::EVENT, None)
        {
            Ok(()) => output.swap.request_issued(),
            Err(err) => warn!("{}: page flip request failed: {err}", output.name),
        }
    }

    fn teardown(&mut self) {
        teardown_outputs(&self.card, &mut self.outputs);
    }
}

/// Single-buffered KMS backend; the committed buffer is painted in place.
pub struct SingleBuffer {
    card: Card,
    outputs: Vec<Output>,
}

impl SingleBuffer {
    pub fn new(path: Option<&Path>) -> anyhow::Result<Self> {
        let card = open_card(path)?;
        let outputs = discover_outputs(&card, 1)?;
        Ok(Self { card, outputs })
    }
}

impl Presenter for SingleBuffer {
    fn output_count(&self) -> usize {
        self.outputs.len()
    }

    fn allocate_buffers(&mut self) -> anyhow::Result<()> {
        allocate_outputs(&self.card, &mut self.outputs)
    }

    fn present_initial(&mut self) -> anyhow::Result<()> {
        commit_outputs(&self.card, &mut self.outputs)
    }

    fn paint_back_buffer(&mut self, output: usize, fill: &mut dyn FnMut(&mut [u8])) -> bool {
        paint_output(&self.card, &mut self.outputs[output], fill)
    }

    fn swap_buffers(&mut self, _output: usize) {
        // The committed buffer is scanned out directly; the timer is the only
        // pacing.
    }

    fn teardown(&mut self) {
        teardown_outputs(&self.card, &mut self.outputs);
    }
}

fn allocate_outputs(card: &Card, outputs: &mut [Output]) -> anyhow::Result<()> {
    for output in &mut *outputs {
        for (i, slot) in output.buffers.iter_mut().enumerate() {
            match create_framebuffer(card, &output.mode) {
                Ok(fb) => {
                    debug!(
                        "{}: buffer {i}: pitch {}, {} bytes, {:?}",
                        output.name, fb.pitch, fb.len, fb.fb,
                    );
                    *slot = Some(fb);
                }
                Err(err) => {
                    warn!("{}: error allocating buffer {i}: {err:#}", output.name);
                    break;
                }
            }
        }

        if output.buffers[0].is_none() {
            warn!("{}: no usable buffer, output will be skipped", output.name);
        }
    }

    ensure!(
        outputs.iter().any(|output| output.buffers[0].is_some()),
        "buffer allocation failed for every output"
    );
    Ok(())
}

/// Commits buffer 0 with the chosen mode and powers the connectors on.
fn commit_outputs(card: &Card, outputs: &mut [Output]) -> anyhow::Result<()> {
    for output in &mut *outputs {
        let Some(fb) = output.buffers[0].as_ref() else {
            continue;
        };

        match card.get_crtc(output.crtc) {
            Ok(info) => output.saved_crtc = Some(info),
            Err(err) => {
                warn!(
                    "{}: error reading current CRTC state, previous mode won't be restored: {err}",
                    output.name
                );
            }
        }

        if let Err(err) = card.set_crtc(
            output.crtc,
            Some(fb.fb),
            (0, 0),
            &[output.connector],
            Some(output.mode),
        ) {
            warn!("{}: error setting mode: {err}", output.name);
            continue;
        }
        output.mode_committed = true;

        if let Err(err) = set_power_on(card, output.connector) {
            debug!("{}: error setting DPMS to on: {err:#}", output.name);
        }

        info!(
            "{}: mode committed, refresh interval {:?}",
            output.name,
            refresh_interval(output.mode),
        );
    }

    ensure!(
        outputs.iter().any(|output| output.mode_committed),
        "mode-setting failed on every output"
    );
    Ok(())
}

/// Maps the back buffer of `output` and paints it through `fill`.
fn paint_output(card: &Card, output: &mut Output, fill: &mut dyn FnMut(&mut [u8])) -> bool {
    if !output.mode_committed {
        return false;
    }

    let back = output.swap.back_buffer();
    let Some(fb) = output.buffers[back].as_mut() else {
        return false;
    };

    match card.map_dumb_buffer(&mut fb.bo) {
        Ok(mut map) => {
            fill(map.as_mut());
            true
        }
        Err(err) => {
            warn!("{}: error mapping dumb buffer: {err}", output.name);
            false
        }
    }
}

/// Blocks on the DRM event stream until the pending flip for `target`
/// confirms. Completions for other outputs are dispatched as they arrive.
fn wait_for_flip(card: &Card, outputs: &mut [Output], target: usize) -> anyhow::Result<()> {
    while outputs[target].swap.awaiting_confirm() {
        let events = card.receive_events().context("error reading DRM events")?;

        for event in events {
            if let Event::PageFlip(flip) = event {
                let Some(output) = outputs.iter_mut().find(|o| o.crtc == flip.crtc) else {
                    continue;
                };

                output.swap.confirm();
                trace!(
                    "{}: page flip confirmed at sequence {}",
                    output.name,
                    flip.frame,
                );
            }
        }
    }

    Ok(())
}

/// Destroys every buffer, then restores the saved CRTC configuration.
///
/// Failures are logged; every buffer slot ends up empty regardless.
fn teardown_outputs(card: &Card, outputs: &mut [Output]) {
    for output in outputs {
        let name = &output.name;
        drain_slots(&mut output.buffers, &mut |fb| {
            destroy_framebuffer(card, fb, name);
        });

        if !output.mode_committed {
            continue;
        }
        output.mode_committed = false;

        let result = match output.saved_crtc.take() {
            Some(saved) => card.set_crtc(
                output.crtc,
                saved.framebuffer(),
                saved.position(),
                &[output.connector],
                saved.mode(),
            ),
            // Nothing to go back to, leave the CRTC disabled.
            None => card.set_crtc(output.crtc, None, (0, 0), &[], None),
        };

        if let Err(err) = result {
            warn!("{}: error restoring previous mode: {err}", output.name);
        } else {
            debug!("{}: previous mode restored", output.name);
        }
    }
}

/// Empties every buffer slot, handing each present buffer to `destroy`.
///
/// `destroy` reports failures itself and never aborts the drain, so the
/// slots are empty afterwards no matter what.
fn drain_slots<T>(slots: &mut [Option<T>], destroy: &mut dyn FnMut(T)) {
    for slot in slots {
        if let Some(value) = slot.take() {
            destroy(value);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn teardown_leaves_every_slot_empty() {
        // A full slot, one that never allocated, one already released.
        let mut slots = vec![Some(7u32), None, Some(9u32)];

        let mut destroyed = Vec::new();
        drain_slots(&mut slots, &mut |value| {
            // The release step logging a failure does not stop the drain.
            destroyed.push(value);
        });

        assert!(slots.iter().all(Option::is_none));
        assert_eq!(destroyed, [7, 9]);
    }
}
