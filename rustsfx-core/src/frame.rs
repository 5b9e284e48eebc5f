//! Shot frames and detector layout.

use crate::{Error, Result};

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

/// hc in eV·Å, used to turn photon energy into wavelength.
pub const HC_EV_ANGSTROM: f64 = 12_398.42;

/// Raw panel layout: `n_panels` rectangular panels of `panel_nx * panel_ny`
/// samples, stored contiguously panel after panel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct DetectorLayout {
    pub n_panels: usize,
    /// Fast-scan size of one panel.
    pub panel_nx: usize,
    /// Slow-scan size of one panel.
    pub panel_ny: usize,
}

impl DetectorLayout {
    #[must_use]
    pub const fn new(n_panels: usize, panel_nx: usize, panel_ny: usize) -> Self {
        Self {
            n_panels,
            panel_nx,
            panel_ny,
        }
    }

    /// Samples in one panel.
    #[must_use]
    pub const fn panel_len(&self) -> usize {
        self.panel_nx * self.panel_ny
    }

    /// Samples in the whole detector.
    #[must_use]
    pub const fn len(&self) -> usize {
        self.n_panels * self.panel_len()
    }

    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Offset of the first sample of `panel`.
    #[must_use]
    pub const fn panel_offset(&self, panel: usize) -> usize {
        panel * self.panel_len()
    }

    /// Checks that `panel` lies inside the layout.
    ///
    /// # Errors
    /// Returns `InvalidPanel` for an out-of-range index.
    pub fn check_panel(&self, panel: usize) -> Result<()> {
        if panel < self.n_panels {
            Ok(())
        } else {
            Err(Error::InvalidPanel {
                panel,
                n_panels: self.n_panels,
            })
        }
    }

    /// Checks that an array has one entry per detector pixel.
    ///
    /// # Errors
    /// Returns `DimensionMismatch` if the length is wrong.
    pub fn check_len(&self, what: &'static str, actual: usize) -> Result<()> {
        if actual == self.len() {
            Ok(())
        } else {
            Err(Error::DimensionMismatch {
                what,
                expected: self.len(),
                actual,
            })
        }
    }
}

/// Image from the single-shot spectrometer, row major `ny * nx`.
#[derive(Debug, Clone, PartialEq)]
pub struct SpectrumImage {
    pub nx: usize,
    pub ny: usize,
    pub data: Vec<f32>,
}

impl SpectrumImage {
    /// Wraps spectrometer samples.
    ///
    /// # Errors
    /// Returns `DimensionMismatch` if `data` is not `nx * ny` long.
    pub fn new(nx: usize, ny: usize, data: Vec<f32>) -> Result<Self> {
        if data.len() != nx * ny {
            return Err(Error::DimensionMismatch {
                what: "spectrum image",
                expected: nx * ny,
                actual: data.len(),
            });
        }
        Ok(Self { nx, ny, data })
    }
}

/// One shot's raw detector data and metadata.
#[derive(Debug, Clone)]
pub struct Frame {
    pub tag: u64,
    pub run_id: u32,
    pub layout: DetectorLayout,
    /// Panel-contiguous raw samples.
    pub pixels: Vec<f32>,
    pub photon_energy_ev: f64,
    pub beam_on: bool,
    /// Pulse energy from the gas monitor.
    pub pulse_energy: f64,
    /// Absolute gain per panel, as reported by the source.
    pub panel_gains: Option<Vec<f32>>,
    /// Time-of-flight trace.
    pub tof: Option<Vec<f32>>,
    pub spectrum_image: Option<SpectrumImage>,
}

impl Frame {
    /// Creates a zero-filled frame.
    #[must_use]
    pub fn new(tag: u64, layout: DetectorLayout) -> Self {
        Self::assemble(tag, layout, vec![0.0; layout.len()])
    }

    /// Creates a frame from existing samples.
    ///
    /// # Errors
    /// Returns `DimensionMismatch` if `pixels` does not cover the layout.
    pub fn from_pixels(tag: u64, layout: DetectorLayout, pixels: Vec<f32>) -> Result<Self> {
        layout.check_len("frame pixels", pixels.len())?;
        Ok(Self::assemble(tag, layout, pixels))
    }

    fn assemble(tag: u64, layout: DetectorLayout, pixels: Vec<f32>) -> Self {
        Self {
            tag,
            run_id: 0,
            layout,
            pixels,
            photon_energy_ev: 0.0,
            beam_on: true,
            pulse_energy: 0.0,
            panel_gains: None,
            tof: None,
            spectrum_image: None,
        }
    }

    #[must_use]
    pub fn with_run_id(mut self, run_id: u32) -> Self {
        self.run_id = run_id;
        self
    }

    #[must_use]
    pub fn with_photon_energy(mut self, ev: f64) -> Self {
        self.photon_energy_ev = ev;
        self
    }

    #[must_use]
    pub fn with_beam_on(mut self, beam_on: bool) -> Self {
        self.beam_on = beam_on;
        self
    }

    #[must_use]
    pub fn with_pulse_energy(mut self, pulse_energy: f64) -> Self {
        self.pulse_energy = pulse_energy;
        self
    }

    #[must_use]
    pub fn with_tof(mut self, tof: Vec<f32>) -> Self {
        self.tof = Some(tof);
        self
    }

    #[must_use]
    pub fn with_spectrum_image(mut self, image: SpectrumImage) -> Self {
        self.spectrum_image = Some(image);
        self
    }

    /// Attaches per-panel gains.
    ///
    /// # Errors
    /// Returns `DimensionMismatch` unless there is one gain per panel.
    pub fn try_with_panel_gains(mut self, gains: Vec<f32>) -> Result<Self> {
        if gains.len() != self.layout.n_panels {
            return Err(Error::DimensionMismatch {
                what: "panel gains",
                expected: self.layout.n_panels,
                actual: gains.len(),
            });
        }
        self.panel_gains = Some(gains);
        Ok(self)
    }

    /// Samples of one panel.
    #[must_use]
    pub fn panel(&self, panel: usize) -> &[f32] {
        let len = self.layout.panel_len();
        let start = self.layout.panel_offset(panel);
        &self.pixels[start..start + len]
    }

    /// Mutable samples of one panel.
    pub fn panel_mut(&mut self, panel: usize) -> &mut [f32] {
        let len = self.layout.panel_len();
        let start = self.layout.panel_offset(panel);
        &mut self.pixels[start..start + len]
    }

    /// Photon wavelength in Angstrom, 0 when the energy is unknown.
    #[must_use]
    pub fn wavelength_a(&self) -> f64 {
        wavelength_from_ev(self.photon_energy_ev)
    }
}

/// Converts photon energy (eV) to wavelength (Å).
#[must_use]
pub fn wavelength_from_ev(ev: f64) -> f64 {
    if ev > 0.0 {
        HC_EV_ANGSTROM / ev
    } else {
        0.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn test_layout_offsets() {
        let layout = DetectorLayout::new(8, 512, 1024);
        assert_eq!(layout.panel_len(), 512 * 1024);
        assert_eq!(layout.len(), 8 * 512 * 1024);
        assert_eq!(layout.panel_offset(3), 3 * 512 * 1024);
        assert!(layout.check_panel(7).is_ok());
        assert!(matches!(
            layout.check_panel(8),
            Err(Error::InvalidPanel { panel: 8, .. })
        ));
    }

    #[test]
    fn test_frame_panels() {
        let layout = DetectorLayout::new(2, 2, 2);
        let mut frame = Frame::new(4, layout);
        frame.panel_mut(1).copy_from_slice(&[1.0, 2.0, 3.0, 4.0]);
        assert_eq!(frame.panel(0), &[0.0; 4]);
        assert_eq!(frame.pixels[4..], [1.0, 2.0, 3.0, 4.0]);
    }

    #[test]
    fn test_from_pixels_rejects_wrong_len() {
        let layout = DetectorLayout::new(2, 2, 2);
        let err = Frame::from_pixels(0, layout, vec![0.0; 7]).unwrap_err();
        assert!(matches!(
            err,
            Error::DimensionMismatch {
                expected: 8,
                actual: 7,
                ..
            }
        ));
    }

    #[test]
    fn test_wavelength() {
        let frame = Frame::new(0, DetectorLayout::new(1, 1, 1)).with_photon_energy(12_398.42);
        assert_relative_eq!(frame.wavelength_a(), 1.0, epsilon = 1e-9);
        assert_relative_eq!(wavelength_from_ev(0.0), 0.0);
    }

    #[test]
    fn test_panel_gains_length() {
        let frame = Frame::new(0, DetectorLayout::new(2, 1, 1));
        assert!(frame.clone().try_with_panel_gains(vec![1.0]).is_err());
        assert!(frame.try_with_panel_gains(vec![1.0, 2.0]).is_ok());
    }
}
