//! Per-event working set.

use crate::calibration::Calibration;
use crate::frame::{DetectorLayout, Frame, SpectrumImage};
use crate::mask::PixelFlags;
use crate::Result;

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

/// One connected peak on a panel.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct Peak {
    pub panel: usize,
    /// Intensity-weighted centre, fast-scan, panel coordinates.
    pub fs: f32,
    /// Intensity-weighted centre, slow-scan, panel coordinates.
    pub ss: f32,
    pub npix: usize,
    pub total: f32,
    pub max: f32,
    /// Distance of the centre from the beam, in pixels.
    pub radius: f32,
}

/// Scalar outputs of one event.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct EventSummary {
    pub hit: bool,
    pub n_peaks: usize,
    pub peak_npix: usize,
    pub peak_total: f64,
    /// Resolution radius in pixels.
    pub peak_resolution: f64,
    pub peak_resolution_a: f64,
    pub peak_density: f64,
    pub total_photons: f64,
    pub tof_signal: f64,
    pub halo_sigma: f64,
    pub reference_ratio: f64,
}

/// Mutable working set of one admitted frame.
///
/// Created from a [`Frame`] at admission and owned by the task that
/// processes it.
#[derive(Debug, Clone)]
pub struct EventRecord {
    pub tag: u64,
    pub run_id: u32,
    pub layout: DetectorLayout,
    pub photon_energy_ev: f64,
    pub wavelength_a: f64,
    pub pulse_energy: f64,
    pub beam_on: bool,
    pub panel_gains: Option<Vec<f32>>,
    pub corrected: Vec<f32>,
    pub mask: Vec<PixelFlags>,
    /// Empty until photon accounting runs.
    pub significance: Vec<f32>,
    /// Empty until photon accounting runs.
    pub photons: Vec<f32>,
    pub peaks: Vec<Peak>,
    pub tof: Option<Vec<f32>>,
    pub spectrum_image: Option<SpectrumImage>,
    /// Integrated 1-D spectrum.
    pub spectrum: Option<Vec<f64>>,
    pub summary: EventSummary,
}

impl EventRecord {
    /// Takes ownership of a frame's samples.
    ///
    /// # Errors
    /// Returns `DimensionMismatch` if the frame does not match the calibration.
    pub fn from_frame(frame: Frame, calibration: &Calibration) -> Result<Self> {
        calibration
            .layout()
            .check_len("frame pixels", frame.pixels.len())?;
        let wavelength_a = frame.wavelength_a();
        Ok(Self {
            tag: frame.tag,
            run_id: frame.run_id,
            layout: frame.layout,
            photon_energy_ev: frame.photon_energy_ev,
            wavelength_a,
            pulse_energy: frame.pulse_energy,
            beam_on: frame.beam_on,
            panel_gains: frame.panel_gains,
            corrected: frame.pixels,
            mask: calibration.pixel_mask.clone(),
            significance: Vec::new(),
            photons: Vec::new(),
            peaks: Vec::new(),
            tof: frame.tof,
            spectrum_image: frame.spectrum_image,
            spectrum: None,
            summary: EventSummary::default(),
        })
    }

    #[must_use]
    pub fn is_hit(&self) -> bool {
        self.summary.hit
    }

    #[must_use]
    pub fn has_photons(&self) -> bool {
        !self.photons.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::calibration::DetectorGeometry;

    #[test]
    fn test_from_frame_moves_samples() {
        let layout = DetectorLayout::new(1, 2, 2);
        let calibration = Calibration::new(DetectorGeometry::stacked(layout, 0.1, 1e-4).unwrap())
            .try_with_pixel_mask(vec![
                PixelFlags::NONE,
                PixelFlags::HOT,
                PixelFlags::NONE,
                PixelFlags::NONE,
            ])
            .unwrap();
        let frame = Frame::from_pixels(6, layout, vec![1.0, 2.0, 3.0, 4.0])
            .unwrap()
            .with_photon_energy(12_398.42);

        let event = EventRecord::from_frame(frame, &calibration).unwrap();
        assert_eq!(event.tag, 6);
        assert_eq!(event.corrected, vec![1.0, 2.0, 3.0, 4.0]);
        assert_eq!(event.mask[1], PixelFlags::HOT);
        assert!((event.wavelength_a - 1.0).abs() < 1e-9);
        assert!(!event.is_hit());
        assert!(!event.has_photons());
    }

    #[test]
    fn test_from_frame_rejects_other_detector() {
        let calibration = Calibration::new(
            DetectorGeometry::stacked(DetectorLayout::new(1, 2, 2), 0.1, 1e-4).unwrap(),
        );
        let frame = Frame::new(0, DetectorLayout::new(1, 3, 3));
        assert!(EventRecord::from_frame(frame, &calibration).is_err());
    }
}
