//! Frame sources.
//!
//! A [`FrameSource`] hands out one panel of one tag at a time. The
//! synchroniser calls it concurrently from one producer thread per panel, so
//! implementations must be `Sync` and must tolerate interleaved panel reads.

use crate::{Error, Result};
use rustsfx_core::{DetectorLayout, Frame, SpectrumImage};
use std::collections::{HashMap, HashSet};
use std::thread;
use std::time::Duration;

/// One panel's samples as returned by a source.
#[derive(Debug, Clone, PartialEq)]
pub struct PanelRead {
    /// Tag the source actually delivered. May differ from the requested tag
    /// when the stream has moved on.
    pub tag: u64,
    pub pixels: Vec<f32>,
    pub run_id: u32,
}

/// Source of per-panel detector data and per-tag metadata.
pub trait FrameSource: Send + Sync {
    /// Raw layout of the detector read by this source.
    fn layout(&self) -> DetectorLayout;

    fn n_panels(&self) -> usize {
        self.layout().n_panels
    }

    fn panel_len(&self) -> usize {
        self.layout().panel_len()
    }

    /// Reads `panel` at `requested_tag`.
    ///
    /// # Errors
    /// Returns `Source` if the panel cannot be read.
    fn next_panel_tag(&self, panel: usize, requested_tag: u64) -> Result<PanelRead>;

    /// # Errors
    /// Returns `Source` if the run number is unavailable.
    fn read_run_number(&self) -> Result<u32>;

    /// Absolute gain of one panel.
    ///
    /// # Errors
    /// Returns `Source` if the gain is unavailable.
    fn read_gain(&self, panel: usize) -> Result<f32>;

    /// # Errors
    /// Returns `Source` if no energy is recorded for `tag`.
    fn read_photon_energy(&self, tag: u64) -> Result<f64>;

    /// First and last tag of the run, inclusive.
    ///
    /// # Errors
    /// Returns `Source` if the range is unknown.
    fn tag_range(&self) -> Result<(u64, u64)>;

    /// # Errors
    /// Returns `Source` if the shutter state is unavailable.
    fn read_beam_on(&self, _tag: u64) -> Result<bool> {
        Ok(true)
    }

    /// # Errors
    /// Returns `Source` if the pulse energy is unavailable.
    fn read_pulse_energy(&self, _tag: u64) -> Result<f64> {
        Ok(0.0)
    }

    /// Time-of-flight trace, if the source records one.
    ///
    /// # Errors
    /// Returns `Source` if a recorded trace cannot be read.
    fn read_tof(&self, _tag: u64) -> Result<Option<Vec<f32>>> {
        Ok(None)
    }

    /// Spectrometer image, if the source records one.
    ///
    /// # Errors
    /// Returns `Source` if a recorded image cannot be read.
    fn read_spectrum_image(&self, _tag: u64) -> Result<Option<SpectrumImage>> {
        Ok(None)
    }
}

/// In-memory source built from whole frames.
///
/// Used for replaying short runs and for tests; individual panel reads can
/// be made to fail or to stall.
#[derive(Debug, Clone)]
pub struct MemorySource {
    layout: DetectorLayout,
    run_id: u32,
    gains: Vec<f32>,
    frames: Vec<Frame>,
    failing: HashSet<(usize, u64)>,
    delays: HashMap<(usize, u64), Duration>,
    misreported: HashMap<(usize, u64), u64>,
}

impl MemorySource {
    /// Creates a source from frames in increasing tag order.
    ///
    /// # Errors
    /// Returns `CoreError` if a frame does not match `layout` and `Source` if
    /// the tags are not strictly increasing.
    pub fn from_frames(layout: DetectorLayout, frames: Vec<Frame>) -> Result<Self> {
        for frame in &frames {
            layout.check_len("frame pixels", frame.pixels.len())?;
        }
        if frames.windows(2).any(|w| w[0].tag >= w[1].tag) {
            return Err(Error::Source(
                "frame tags must be strictly increasing".to_string(),
            ));
        }
        Ok(Self {
            layout,
            run_id: 0,
            gains: vec![1.0; layout.n_panels],
            frames,
            failing: HashSet::new(),
            delays: HashMap::new(),
            misreported: HashMap::new(),
        })
    }

    #[must_use]
    pub fn with_run_id(mut self, run_id: u32) -> Self {
        self.run_id = run_id;
        self
    }

    /// Sets the per-panel gains.
    ///
    /// # Errors
    /// Returns `CoreError` unless there is one gain per panel.
    pub fn try_with_gains(mut self, gains: Vec<f32>) -> Result<Self> {
        if gains.len() != self.layout.n_panels {
            return Err(rustsfx_core::Error::DimensionMismatch {
                what: "panel gains",
                expected: self.layout.n_panels,
                actual: gains.len(),
            }
            .into());
        }
        self.gains = gains;
        Ok(self)
    }

    /// Makes every read of `panel` at `tag` fail.
    #[must_use]
    pub fn with_failing_read(mut self, panel: usize, tag: u64) -> Self {
        self.failing.insert((panel, tag));
        self
    }

    /// Makes the read of `panel` at `tag` stall for `delay` before returning.
    #[must_use]
    pub fn with_delay(mut self, panel: usize, tag: u64, delay: Duration) -> Self {
        self.delays.insert((panel, tag), delay);
        self
    }

    /// Makes the read of `panel` at `tag` report `reported` as its tag.
    #[must_use]
    pub fn with_wrong_tag(mut self, panel: usize, tag: u64, reported: u64) -> Self {
        self.misreported.insert((panel, tag), reported);
        self
    }

    #[must_use]
    pub fn frames(&self) -> &[Frame] {
        &self.frames
    }

    fn frame(&self, tag: u64) -> Result<&Frame> {
        self.frames
            .binary_search_by_key(&tag, |f| f.tag)
            .map(|i| &self.frames[i])
            .map_err(|_| Error::Source(format!("no frame recorded for tag {tag}")))
    }
}

impl FrameSource for MemorySource {
    fn layout(&self) -> DetectorLayout {
        self.layout
    }

    fn next_panel_tag(&self, panel: usize, requested_tag: u64) -> Result<PanelRead> {
        self.layout.check_panel(panel)?;
        if let Some(delay) = self.delays.get(&(panel, requested_tag)) {
            thread::sleep(*delay);
        }
        if self.failing.contains(&(panel, requested_tag)) {
            return Err(Error::source(panel, requested_tag, "injected read failure"));
        }
        let frame = self.frame(requested_tag)?;
        let tag = self
            .misreported
            .get(&(panel, requested_tag))
            .copied()
            .unwrap_or(frame.tag);
        Ok(PanelRead {
            tag,
            pixels: frame.panel(panel).to_vec(),
            run_id: self.run_id,
        })
    }

    fn read_run_number(&self) -> Result<u32> {
        Ok(self.run_id)
    }

    fn read_gain(&self, panel: usize) -> Result<f32> {
        self.layout.check_panel(panel)?;
        Ok(self.gains[panel])
    }

    fn read_photon_energy(&self, tag: u64) -> Result<f64> {
        Ok(self.frame(tag)?.photon_energy_ev)
    }

    fn tag_range(&self) -> Result<(u64, u64)> {
        match (self.frames.first(), self.frames.last()) {
            (Some(first), Some(last)) => Ok((first.tag, last.tag)),
            _ => Err(Error::Source("source holds no frames".to_string())),
        }
    }

    fn read_beam_on(&self, tag: u64) -> Result<bool> {
        Ok(self.frame(tag)?.beam_on)
    }

    fn read_pulse_energy(&self, tag: u64) -> Result<f64> {
        Ok(self.frame(tag)?.pulse_energy)
    }

    fn read_tof(&self, tag: u64) -> Result<Option<Vec<f32>>> {
        Ok(self.frame(tag)?.tof.clone())
    }

    fn read_spectrum_image(&self, tag: u64) -> Result<Option<SpectrumImage>> {
        Ok(self.frame(tag)?.spectrum_image.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn source() -> MemorySource {
        let layout = DetectorLayout::new(2, 2, 1);
        let frames = (0..3)
            .map(|i| {
                Frame::from_pixels(i * 2, layout, vec![i as f32, 1.0, 2.0, 3.0])
                    .unwrap()
                    .with_photon_energy(7000.0 + i as f64)
            })
            .collect();
        MemorySource::from_frames(layout, frames)
            .unwrap()
            .with_run_id(42)
    }

    #[test]
    fn test_panel_reads() {
        let source = source();
        let read = source.next_panel_tag(1, 2).unwrap();
        assert_eq!(read.tag, 2);
        assert_eq!(read.pixels, vec![2.0, 3.0]);
        assert_eq!(read.run_id, 42);
        assert_eq!(source.tag_range().unwrap(), (0, 4));
        assert!(source.next_panel_tag(0, 3).is_err());
        assert!(source.next_panel_tag(2, 0).is_err());
    }

    #[test]
    fn test_metadata_defaults() {
        let source = source();
        assert!(source.read_beam_on(4).unwrap());
        assert!((source.read_photon_energy(4).unwrap() - 7002.0).abs() < 1e-9);
        assert!(source.read_tof(0).unwrap().is_none());
        assert_eq!(source.n_panels(), 2);
        assert_eq!(source.panel_len(), 2);
    }

    #[test]
    fn test_injected_failure() {
        let source = source().with_failing_read(0, 2);
        assert!(matches!(source.next_panel_tag(0, 2), Err(Error::Source(_))));
        assert!(source.next_panel_tag(1, 2).is_ok());
    }

    #[test]
    fn test_rejects_unordered_frames() {
        let layout = DetectorLayout::new(1, 1, 1);
        let frames = vec![Frame::new(4, layout), Frame::new(2, layout)];
        assert!(MemorySource::from_frames(layout, frames).is_err());
    }
}
