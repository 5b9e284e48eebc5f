//! Detector geometry and read-only calibration maps.
//!
//! Everything here is loaded once before processing starts and then shared
//! immutably by every worker.

use crate::config::{HitfinderAlgorithm, PhotonMode, RunConfig};
use crate::frame::DetectorLayout;
use crate::mask::PixelFlags;
use crate::{Error, Result};
use rayon::prelude::*;

/// Position of every raw pixel in the detector plane.
///
/// Coordinates are in pixel units relative to the direct beam.
#[derive(Debug, Clone)]
pub struct DetectorGeometry {
    pub layout: DetectorLayout,
    /// Sample to detector distance in metres.
    pub distance_m: f64,
    /// Pixel pitch in metres.
    pub pixel_size_m: f64,
    pixel_x: Vec<f32>,
    pixel_y: Vec<f32>,
    pixel_r: Vec<f32>,
    assembled_nx: usize,
    assembled_ny: usize,
    assembled_index: Vec<u32>,
}

impl DetectorGeometry {
    /// Builds the geometry from per-panel origins.
    ///
    /// `panel_origins[p]` is the detector-plane position (in pixels) of
    /// sample `(fs = 0, ss = 0)` of panel `p`; panels are axis aligned.
    ///
    /// # Errors
    /// Returns `DimensionMismatch` unless there is one origin per panel, and
    /// `ConfigError` for non-positive distance or pixel size.
    pub fn new(
        layout: DetectorLayout,
        panel_origins: &[(f64, f64)],
        distance_m: f64,
        pixel_size_m: f64,
    ) -> Result<Self> {
        if panel_origins.len() != layout.n_panels {
            return Err(Error::DimensionMismatch {
                what: "panel origins",
                expected: layout.n_panels,
                actual: panel_origins.len(),
            });
        }
        if distance_m <= 0.0 || pixel_size_m <= 0.0 {
            return Err(Error::ConfigError(format!(
                "detector distance ({distance_m}) and pixel size ({pixel_size_m}) must be positive"
            )));
        }

        let n = layout.len();
        let mut pixel_x = Vec::with_capacity(n);
        let mut pixel_y = Vec::with_capacity(n);
        for &(ox, oy) in panel_origins {
            for ss in 0..layout.panel_ny {
                for fs in 0..layout.panel_nx {
                    pixel_x.push((ox + fs as f64) as f32);
                    pixel_y.push((oy + ss as f64) as f32);
                }
            }
        }
        let pixel_r = pixel_x
            .par_iter()
            .zip(pixel_y.par_iter())
            .map(|(x, y)| x.hypot(*y))
            .collect();

        let (assembled_nx, assembled_ny, assembled_index) = assemble_index(&pixel_x, &pixel_y);

        Ok(Self {
            layout,
            distance_m,
            pixel_size_m,
            pixel_x,
            pixel_y,
            pixel_r,
            assembled_nx,
            assembled_ny,
            assembled_index,
        })
    }

    /// Stacks panels along the slow-scan axis and centres the stack on the beam.
    ///
    /// # Errors
    /// See [`DetectorGeometry::new`].
    pub fn stacked(layout: DetectorLayout, distance_m: f64, pixel_size_m: f64) -> Result<Self> {
        let half_x = layout.panel_nx as f64 / 2.0;
        let half_y = (layout.n_panels * layout.panel_ny) as f64 / 2.0;
        let origins: Vec<(f64, f64)> = (0..layout.n_panels)
            .map(|p| (-half_x, (p * layout.panel_ny) as f64 - half_y))
            .collect();
        Self::new(layout, &origins, distance_m, pixel_size_m)
    }

    /// Distance of each raw pixel from the beam, in pixels.
    #[must_use]
    pub fn pixel_radius(&self) -> &[f32] {
        &self.pixel_r
    }

    #[must_use]
    pub fn pixel_x(&self) -> &[f32] {
        &self.pixel_x
    }

    #[must_use]
    pub fn pixel_y(&self) -> &[f32] {
        &self.pixel_y
    }

    /// Shape `(nx, ny)` of the assembled image.
    #[must_use]
    pub fn assembled_shape(&self) -> (usize, usize) {
        (self.assembled_nx, self.assembled_ny)
    }

    /// Assembled-image index of each raw pixel.
    #[must_use]
    pub fn assembled_index(&self) -> &[u32] {
        &self.assembled_index
    }

    /// Detector distance expressed in pixels.
    #[must_use]
    pub fn distance_pixels(&self) -> f64 {
        self.distance_m / self.pixel_size_m
    }
}

fn assemble_index(pixel_x: &[f32], pixel_y: &[f32]) -> (usize, usize, Vec<u32>) {
    if pixel_x.is_empty() {
        return (0, 0, Vec::new());
    }
    let min_x = pixel_x.iter().copied().fold(f32::INFINITY, f32::min).floor();
    let max_x = pixel_x.iter().copied().fold(f32::NEG_INFINITY, f32::max).ceil();
    let min_y = pixel_y.iter().copied().fold(f32::INFINITY, f32::min).floor();
    let max_y = pixel_y.iter().copied().fold(f32::NEG_INFINITY, f32::max).ceil();
    let nx = (max_x - min_x) as usize + 1;
    let ny = (max_y - min_y) as usize + 1;

    let index = pixel_x
        .iter()
        .zip(pixel_y)
        .map(|(x, y)| {
            let ix = (x - min_x).round() as usize;
            let iy = (y - min_y).round() as usize;
            (iy * nx + ix) as u32
        })
        .collect();
    (nx, ny, index)
}

/// Read-only per-pixel calibration maps.
#[derive(Debug, Clone)]
pub struct Calibration {
    pub geometry: DetectorGeometry,
    pub pixel_mask: Vec<PixelFlags>,
    pub dark_sigma: Option<Vec<f32>>,
    pub threshold_map: Option<Vec<f32>>,
    pub halo_mean: Option<Vec<f32>>,
    pub halo_sigma: Option<Vec<f32>>,
    pub sample_reference: Option<Vec<f32>>,
    pub background_reference: Option<Vec<f32>>,
    /// Dark image of the spectrometer camera.
    pub spectrum_dark: Option<Vec<f32>>,
}

impl Calibration {
    /// Creates a calibration with an all-good mask and no optional maps.
    #[must_use]
    pub fn new(geometry: DetectorGeometry) -> Self {
        let n = geometry.layout.len();
        Self {
            geometry,
            pixel_mask: vec![PixelFlags::NONE; n],
            dark_sigma: None,
            threshold_map: None,
            halo_mean: None,
            halo_sigma: None,
            sample_reference: None,
            background_reference: None,
            spectrum_dark: None,
        }
    }

    /// Number of raw pixels.
    #[must_use]
    pub fn len(&self) -> usize {
        self.geometry.layout.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    #[must_use]
    pub fn layout(&self) -> DetectorLayout {
        self.geometry.layout
    }

    /// Replaces the pixel mask.
    ///
    /// # Errors
    /// Returns `DimensionMismatch` if the mask does not cover the detector.
    pub fn try_with_pixel_mask(mut self, mask: Vec<PixelFlags>) -> Result<Self> {
        self.geometry.layout.check_len("pixel mask", mask.len())?;
        self.pixel_mask = mask;
        Ok(self)
    }

    /// Sets the dark-sigma map used for significance photon counting.
    ///
    /// # Errors
    /// Returns `DimensionMismatch` if the map does not cover the detector.
    pub fn try_with_dark_sigma(mut self, map: Vec<f32>) -> Result<Self> {
        self.geometry.layout.check_len("dark sigma", map.len())?;
        self.dark_sigma = Some(map);
        Ok(self)
    }

    /// Sets the per-pixel static photon threshold map.
    ///
    /// # Errors
    /// Returns `DimensionMismatch` if the map does not cover the detector.
    pub fn try_with_threshold_map(mut self, map: Vec<f32>) -> Result<Self> {
        self.geometry.layout.check_len("threshold map", map.len())?;
        self.threshold_map = Some(map);
        Ok(self)
    }

    /// Derives the static threshold map as `n_sigma * dark_sigma`.
    ///
    /// # Errors
    /// Returns `MissingCalibration` when no dark-sigma map is loaded.
    pub fn try_with_threshold_from_dark(mut self, n_sigma: f32) -> Result<Self> {
        let sigma = self.dark_sigma.as_ref().ok_or(Error::MissingCalibration {
            map: "dark_sigma",
            required_by: "threshold derivation",
        })?;
        let map = sigma.par_iter().map(|s| s.abs() * n_sigma).collect();
        self.threshold_map = Some(map);
        Ok(self)
    }

    /// Sets the halo mean and sigma maps.
    ///
    /// # Errors
    /// Returns `DimensionMismatch` if either map does not cover the detector.
    pub fn try_with_halo(mut self, mean: Vec<f32>, sigma: Vec<f32>) -> Result<Self> {
        self.geometry.layout.check_len("halo mean", mean.len())?;
        self.geometry.layout.check_len("halo sigma", sigma.len())?;
        self.halo_mean = Some(mean);
        self.halo_sigma = Some(sigma);
        Ok(self)
    }

    /// Sets the sample and background reference projections.
    ///
    /// # Errors
    /// Returns `DimensionMismatch` if either map does not cover the detector.
    pub fn try_with_references(mut self, sample: Vec<f32>, background: Vec<f32>) -> Result<Self> {
        self.geometry
            .layout
            .check_len("sample reference", sample.len())?;
        self.geometry
            .layout
            .check_len("background reference", background.len())?;
        self.sample_reference = Some(sample);
        self.background_reference = Some(background);
        Ok(self)
    }

    #[must_use]
    pub fn with_spectrum_dark(mut self, dark: Vec<f32>) -> Self {
        self.spectrum_dark = Some(dark);
        self
    }

    /// Checks that every map the configured processing reads is present.
    ///
    /// # Errors
    /// Returns `MissingCalibration` for an absent map and `ConfigError` when a
    /// photon-based hitfinder is selected with photon accounting disabled.
    pub fn validate_for(&self, config: &RunConfig) -> Result<()> {
        match config.photon.mode {
            PhotonMode::Disabled => {}
            PhotonMode::Significance => require(
                self.dark_sigma.as_ref(),
                "dark_sigma",
                "significance photon counting",
            )?,
            PhotonMode::StaticThreshold => require(
                self.threshold_map.as_ref(),
                "threshold_map",
                "static-threshold photon counting",
            )?,
        }

        let algorithm = config.hitfinder.algorithm;
        if algorithm.needs_photons() && config.photon.mode == PhotonMode::Disabled {
            return Err(Error::ConfigError(format!(
                "hitfinder {algorithm} needs photon accounting, but it is disabled"
            )));
        }
        match algorithm {
            HitfinderAlgorithm::ReferenceProjection => {
                let name = algorithm.name();
                require(self.sample_reference.as_ref(), "sample_reference", name)?;
                require(self.background_reference.as_ref(), "background_reference", name)?;
            }
            HitfinderAlgorithm::HaloSigma => {
                let name = algorithm.name();
                require(self.halo_mean.as_ref(), "halo_mean", name)?;
                require(self.halo_sigma.as_ref(), "halo_sigma", name)?;
            }
            _ => {}
        }
        Ok(())
    }
}

fn require<T>(map: Option<&T>, name: &'static str, required_by: &'static str) -> Result<()> {
    map.map(|_| ()).ok_or(Error::MissingCalibration {
        map: name,
        required_by,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::HitfinderConfig;
    use approx::assert_relative_eq;

    fn small_geometry() -> DetectorGeometry {
        DetectorGeometry::new(
            DetectorLayout::new(2, 3, 2),
            &[(0.0, 0.0), (0.0, 10.0)],
            0.05,
            50e-6,
        )
        .unwrap()
    }

    #[test]
    fn test_pixel_radius() {
        let geometry = small_geometry();
        let r = geometry.pixel_radius();
        assert_eq!(r.len(), 12);
        assert_relative_eq!(r[0], 0.0);
        // panel 0, fs = 1, ss = 1
        assert_relative_eq!(r[4], 2.0_f32.sqrt());
        // panel 1, fs = 0, ss = 0
        assert_relative_eq!(r[6], 10.0);
        assert_relative_eq!(geometry.distance_pixels(), 1000.0, epsilon = 1e-9);
    }

    #[test]
    fn test_assembled_index_is_unique() {
        let geometry = small_geometry();
        let (nx, ny) = geometry.assembled_shape();
        assert_eq!((nx, ny), (3, 12));
        let mut seen = geometry.assembled_index().to_vec();
        seen.sort_unstable();
        seen.dedup();
        assert_eq!(seen.len(), 12);
        assert!(seen.iter().all(|&i| (i as usize) < nx * ny));
    }

    #[test]
    fn test_stacked_geometry_is_centred() {
        let geometry = DetectorGeometry::stacked(DetectorLayout::new(2, 4, 4), 0.1, 1e-4).unwrap();
        assert_relative_eq!(geometry.pixel_x()[0], -2.0);
        assert_relative_eq!(geometry.pixel_y()[0], -4.0);
        assert!(DetectorGeometry::stacked(DetectorLayout::new(1, 1, 1), 0.0, 1e-4).is_err());
    }

    #[test]
    fn test_map_dimension_checks() {
        let calibration = Calibration::new(small_geometry());
        assert!(calibration.clone().try_with_dark_sigma(vec![1.0; 11]).is_err());
        let calibration = calibration
            .try_with_dark_sigma(vec![-2.0; 12])
            .unwrap()
            .try_with_threshold_from_dark(3.0)
            .unwrap();
        assert_relative_eq!(calibration.threshold_map.as_ref().unwrap()[5], 6.0);
    }

    #[test]
    fn test_validate_for_missing_maps() {
        let calibration = Calibration::new(small_geometry());
        let mut config = RunConfig::default();
        assert!(calibration.validate_for(&config).is_ok());

        config.photon.mode = PhotonMode::Significance;
        assert!(matches!(
            calibration.validate_for(&config),
            Err(Error::MissingCalibration { map: "dark_sigma", .. })
        ));

        config.photon.mode = PhotonMode::Disabled;
        config.hitfinder =
            HitfinderConfig::default().with_algorithm(HitfinderAlgorithm::PhotonCount);
        assert!(matches!(
            calibration.validate_for(&config),
            Err(Error::ConfigError(_))
        ));

        let calibration = calibration.try_with_threshold_map(vec![1.0; 12]).unwrap();
        config.photon.mode = PhotonMode::StaticThreshold;
        config.hitfinder.algorithm = HitfinderAlgorithm::HaloSigma;
        assert!(matches!(
            calibration.validate_for(&config),
            Err(Error::MissingCalibration { map: "halo_mean", .. })
        ));
    }
}
