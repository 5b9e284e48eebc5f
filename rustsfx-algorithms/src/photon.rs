//! Per-pixel photon accounting.

use rayon::prelude::*;
use rustsfx_core::{
    Calibration, EventRecord, Error, PhotonConfig, PhotonMode, Result, SharedAccumulators,
};

/// Converts corrected values to photon counts and feeds the run's
/// cumulative photon map.
#[derive(Debug, Clone, Copy)]
pub struct PhotonCounter {
    config: PhotonConfig,
}

impl PhotonCounter {
    #[must_use]
    pub fn new(config: PhotonConfig) -> Self {
        Self { config }
    }

    #[must_use]
    pub fn config(&self) -> &PhotonConfig {
        &self.config
    }

    /// Fills the event's significance and photon maps and returns its total
    /// photon count.
    ///
    /// Every passing pixel adds its truncated photon estimate to the shared
    /// cumulative map with a single atomic add.
    ///
    /// # Errors
    /// Returns `MissingCalibration` if the map the mode reads is absent.
    pub fn compute(
        &self,
        event: &mut EventRecord,
        calibration: &Calibration,
        accumulators: &SharedAccumulators,
    ) -> Result<f64> {
        let adu_per_photon = self.config.adu_per_photon;
        let (significance, photons): (Vec<f32>, Vec<f32>) = match self.config.mode {
            PhotonMode::Disabled => return Ok(0.0),
            PhotonMode::Significance => {
                let dark_sigma = calibration.dark_sigma.as_deref().ok_or(
                    Error::MissingCalibration {
                        map: "dark_sigma",
                        required_by: "significance photon counting",
                    },
                )?;
                let threshold = self.config.significance_threshold;
                event
                    .corrected
                    .par_iter()
                    .zip(dark_sigma.par_iter())
                    .enumerate()
                    .map(|(i, (&value, &sigma))| {
                        let sigma = sigma.abs();
                        let significance = if sigma > 0.0 { value.abs() / sigma } else { 0.0 };
                        let photons = if significance > threshold {
                            count_photons(accumulators, i, value / adu_per_photon)
                        } else {
                            0.0
                        };
                        (significance, photons)
                    })
                    .unzip()
            }
            PhotonMode::StaticThreshold => {
                let thresholds = calibration.threshold_map.as_deref().ok_or(
                    Error::MissingCalibration {
                        map: "threshold_map",
                        required_by: "static-threshold photon counting",
                    },
                )?;
                event
                    .corrected
                    .par_iter()
                    .zip(thresholds.par_iter())
                    .enumerate()
                    .map(|(i, (&value, &threshold))| {
                        // Only the threshold decides; pixel flags are left to the hitfinders.
                        let photons = if value > threshold {
                            count_photons(accumulators, i, value / adu_per_photon)
                        } else {
                            0.0
                        };
                        (value - threshold, photons)
                    })
                    .unzip()
            }
        };

        let total: f64 = photons.par_iter().map(|p| f64::from(*p)).sum();
        event.significance = significance;
        event.photons = photons;
        event.summary.total_photons = total;
        Ok(total)
    }
}

fn count_photons(accumulators: &SharedAccumulators, pixel: usize, photons: f32) -> f32 {
    let whole = photons.trunc() as i64;
    if whole != 0 {
        accumulators.add_photons(pixel, whole);
    }
    photons
}
