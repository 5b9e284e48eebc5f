//! Run configuration.
//!
//! All detector-specific constants live here rather than in the algorithms,
//! so a run can be retuned from its JSON file alone.

use crate::{Error, Result};
use std::fmt;
use std::str::FromStr;

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

/// Hit-decision algorithm.
///
/// The numeric ids are the ones used by existing run configurations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[cfg_attr(
    feature = "serde",
    derive(Serialize, Deserialize),
    serde(rename_all = "kebab-case")
)]
pub enum HitfinderAlgorithm {
    /// Every frame is a hit.
    Everything,
    /// Count of bright unmasked pixels.
    #[default]
    PixelCount,
    /// Sum of bright unmasked pixels.
    IntegratedIntensity,
    /// Number of Bragg peaks.
    BraggPeaks,
    /// Integrated time-of-flight signal.
    TofIntegrated,
    /// Minimum of a 3-sample running sum of the time-of-flight trace.
    TofMinimum,
    /// `TofMinimum` that is not also a `PixelCount` hit.
    TofMinimumExcludingPixels,
    /// Total photon count above a static threshold.
    PhotonCount,
    /// Sample versus background reference projection of the photon map.
    ReferenceProjection,
    /// Total photon count above a threshold linear in pulse energy.
    GainModePhotonCount,
    /// Halo-normalised sigma sum of the photon map.
    HaloSigma,
}

impl HitfinderAlgorithm {
    pub const ALL: [Self; 11] = [
        Self::Everything,
        Self::PixelCount,
        Self::IntegratedIntensity,
        Self::BraggPeaks,
        Self::TofIntegrated,
        Self::TofMinimum,
        Self::TofMinimumExcludingPixels,
        Self::PhotonCount,
        Self::ReferenceProjection,
        Self::GainModePhotonCount,
        Self::HaloSigma,
    ];

    /// Looks up an algorithm by its numeric id.
    ///
    /// # Errors
    /// Returns `UnknownHitfinder` for ids outside the supported set.
    pub fn from_id(id: u32) -> Result<Self> {
        Self::ALL
            .into_iter()
            .find(|a| a.id() == id)
            .ok_or_else(|| Error::UnknownHitfinder(id.to_string()))
    }

    #[must_use]
    pub const fn id(self) -> u32 {
        match self {
            Self::Everything => 0,
            Self::PixelCount => 1,
            Self::IntegratedIntensity => 2,
            Self::BraggPeaks => 3,
            Self::TofIntegrated => 4,
            Self::TofMinimum => 8,
            Self::TofMinimumExcludingPixels => 9,
            Self::PhotonCount => 28,
            Self::ReferenceProjection => 29,
            Self::GainModePhotonCount => 30,
            Self::HaloSigma => 31,
        }
    }

    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::Everything => "everything",
            Self::PixelCount => "pixel-count",
            Self::IntegratedIntensity => "integrated-intensity",
            Self::BraggPeaks => "bragg-peaks",
            Self::TofIntegrated => "tof-integrated",
            Self::TofMinimum => "tof-minimum",
            Self::TofMinimumExcludingPixels => "tof-minimum-excluding-pixels",
            Self::PhotonCount => "photon-count",
            Self::ReferenceProjection => "reference-projection",
            Self::GainModePhotonCount => "gain-mode-photon-count",
            Self::HaloSigma => "halo-sigma",
        }
    }

    /// Returns true if the decision reads the event's photon map.
    #[must_use]
    pub const fn needs_photons(self) -> bool {
        matches!(
            self,
            Self::PhotonCount
                | Self::ReferenceProjection
                | Self::GainModePhotonCount
                | Self::HaloSigma
        )
    }

    /// Returns true if the decision runs the peak finder.
    #[must_use]
    pub const fn uses_peaks(self) -> bool {
        matches!(self, Self::BraggPeaks)
    }
}

impl fmt::Display for HitfinderAlgorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.name(), self.id())
    }
}

impl FromStr for HitfinderAlgorithm {
    type Err = Error;

    /// Accepts either the numeric id or the kebab-case name.
    fn from_str(s: &str) -> Result<Self> {
        let s = s.trim();
        if let Ok(id) = s.parse::<u32>() {
            return Self::from_id(id);
        }
        Self::ALL
            .into_iter()
            .find(|a| a.name() == s)
            .ok_or_else(|| Error::UnknownHitfinder(s.to_string()))
    }
}

/// Time-of-flight sample window and threshold.
#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize), serde(default))]
pub struct TofWindow {
    /// First sample included.
    pub min_sample: usize,
    /// First sample excluded.
    pub max_sample: usize,
    pub threshold: f64,
}

impl Default for TofWindow {
    fn default() -> Self {
        Self {
            min_sample: 0,
            max_sample: 1000,
            threshold: 100.0,
        }
    }
}

/// Photon-count threshold that grows linearly with pulse energy.
#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize), serde(default))]
pub struct GainModeThreshold {
    pub base: f64,
    pub slope: f64,
    pub sigma: f64,
    pub n_sigma: f64,
    /// Shots with a weaker pulse are never hits.
    pub min_pulse_energy: f64,
}

impl Default for GainModeThreshold {
    fn default() -> Self {
        Self {
            base: -8270.0,
            slope: 6459.0,
            sigma: 1110.0,
            n_sigma: 2.5,
            min_pulse_energy: 1.0,
        }
    }
}

impl GainModeThreshold {
    /// Photon count a blank shot is expected to stay under.
    #[must_use]
    pub fn threshold(&self, pulse_energy: f64) -> f64 {
        self.base + self.slope * pulse_energy + self.n_sigma * self.sigma
    }
}

/// Hit-decision parameters.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize), serde(default))]
pub struct HitfinderConfig {
    pub algorithm: HitfinderAlgorithm,
    /// Corrected value a pixel must exceed to count as bright.
    pub adc_threshold: f32,
    pub min_pix_count: usize,
    pub integrated_threshold: f64,
    pub npeaks_min: usize,
    pub npeaks_max: usize,
    /// Smallest and largest connected region accepted as a peak.
    pub peak_min_pix: usize,
    pub peak_max_pix: usize,
    /// Compute resolution statistics for peak hitfinders.
    pub resolution_stats: bool,
    pub tof: TofWindow,
    pub photon_threshold: f64,
    pub gain_mode: GainModeThreshold,
    pub reference_ratio: f64,
    pub halo_threshold: f64,
}

impl Default for HitfinderConfig {
    fn default() -> Self {
        Self {
            algorithm: HitfinderAlgorithm::PixelCount,
            adc_threshold: 100.0,
            min_pix_count: 100,
            integrated_threshold: 1.0e5,
            npeaks_min: 20,
            npeaks_max: 100_000,
            peak_min_pix: 2,
            peak_max_pix: 50,
            resolution_stats: true,
            tof: TofWindow::default(),
            photon_threshold: 1000.0,
            gain_mode: GainModeThreshold::default(),
            reference_ratio: 1.0,
            halo_threshold: 100.0,
        }
    }
}

impl HitfinderConfig {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_algorithm(mut self, algorithm: HitfinderAlgorithm) -> Self {
        self.algorithm = algorithm;
        self
    }

    #[must_use]
    pub fn with_adc_threshold(mut self, threshold: f32) -> Self {
        self.adc_threshold = threshold;
        self
    }

    #[must_use]
    pub fn with_min_pix_count(mut self, count: usize) -> Self {
        self.min_pix_count = count;
        self
    }

    #[must_use]
    pub fn with_integrated_threshold(mut self, threshold: f64) -> Self {
        self.integrated_threshold = threshold;
        self
    }

    #[must_use]
    pub fn with_npeaks(mut self, min: usize, max: usize) -> Self {
        self.npeaks_min = min;
        self.npeaks_max = max;
        self
    }

    #[must_use]
    pub fn with_peak_size(mut self, min_pix: usize, max_pix: usize) -> Self {
        self.peak_min_pix = min_pix;
        self.peak_max_pix = max_pix;
        self
    }

    #[must_use]
    pub fn with_tof(mut self, tof: TofWindow) -> Self {
        self.tof = tof;
        self
    }

    #[must_use]
    pub fn with_photon_threshold(mut self, threshold: f64) -> Self {
        self.photon_threshold = threshold;
        self
    }

    #[must_use]
    pub fn with_gain_mode(mut self, gain_mode: GainModeThreshold) -> Self {
        self.gain_mode = gain_mode;
        self
    }

    #[must_use]
    pub fn with_halo_threshold(mut self, threshold: f64) -> Self {
        self.halo_threshold = threshold;
        self
    }

    fn validate(&self) -> Result<()> {
        if self.adc_threshold < 0.0 || self.integrated_threshold < 0.0 {
            return Err(Error::ConfigError(
                "hitfinder thresholds must be non-negative".to_string(),
            ));
        }
        if self.npeaks_min > self.npeaks_max {
            return Err(Error::ConfigError(format!(
                "npeaks_min ({}) exceeds npeaks_max ({})",
                self.npeaks_min, self.npeaks_max
            )));
        }
        if self.peak_min_pix == 0 || self.peak_min_pix > self.peak_max_pix {
            return Err(Error::ConfigError(format!(
                "invalid peak size range [{}, {}]",
                self.peak_min_pix, self.peak_max_pix
            )));
        }
        if self.tof.min_sample >= self.tof.max_sample {
            return Err(Error::ConfigError(format!(
                "empty TOF window [{}, {})",
                self.tof.min_sample, self.tof.max_sample
            )));
        }
        if self.reference_ratio <= 0.0 {
            return Err(Error::ConfigError(
                "reference_ratio must be positive".to_string(),
            ));
        }
        Ok(())
    }
}

/// How per-pixel photon counts are derived.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(
    feature = "serde",
    derive(Serialize, Deserialize),
    serde(rename_all = "kebab-case")
)]
pub enum PhotonMode {
    #[default]
    Disabled,
    /// `|value| / |dark sigma|` compared with a significance threshold.
    Significance,
    /// `value` compared with a per-pixel threshold map.
    StaticThreshold,
}

/// Photon accounting parameters.
#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize), serde(default))]
pub struct PhotonConfig {
    pub mode: PhotonMode,
    pub significance_threshold: f32,
    pub adu_per_photon: f32,
}

impl Default for PhotonConfig {
    fn default() -> Self {
        Self {
            mode: PhotonMode::Disabled,
            significance_threshold: 5.0,
            adu_per_photon: 30.0,
        }
    }
}

impl PhotonConfig {
    #[must_use]
    pub fn with_mode(mut self, mode: PhotonMode) -> Self {
        self.mode = mode;
        self
    }

    #[must_use]
    pub fn with_significance_threshold(mut self, threshold: f32) -> Self {
        self.significance_threshold = threshold;
        self
    }

    #[must_use]
    pub fn with_adu_per_photon(mut self, adu: f32) -> Self {
        self.adu_per_photon = adu;
        self
    }
}

/// Raw-to-corrected conversion applied before hit finding.
#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize), serde(default))]
pub struct CorrectionConfig {
    /// Scale panels by their absolute gain when the source reports one.
    pub gain_correction: bool,
    /// Energy to create one electron-hole pair, in eV.
    pub ev_per_electron: f64,
    /// Photon fraction represented by one corrected unit.
    pub output_unit_photons: f64,
    /// Raw values at or above this level are flagged saturated.
    pub saturation_adu: Option<f32>,
}

impl Default for CorrectionConfig {
    fn default() -> Self {
        Self {
            gain_correction: true,
            ev_per_electron: 3.65,
            output_unit_photons: 0.1,
            saturation_adu: None,
        }
    }
}

impl CorrectionConfig {
    /// Multiplier applied to a panel's raw samples.
    #[must_use]
    pub fn panel_scale(&self, panel_gain: f32, photon_energy_ev: f64) -> f32 {
        if !self.gain_correction || photon_energy_ev <= 0.0 {
            return 1.0;
        }
        (f64::from(panel_gain) * self.ev_per_electron / self.output_unit_photons / photon_energy_ev)
            as f32
    }
}

/// Worker pool and frame assembly parameters.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize), serde(default))]
pub struct PipelineConfig {
    /// Maximum number of events processed concurrently.
    pub max_in_flight: usize,
    /// Distance between consecutive tags.
    pub tag_stride: u64,
    /// Tags a pending frame may wait before it is evicted.
    pub lateness_window: u64,
    /// Lookups a secondary producer makes before giving up on a tag.
    pub retry_budget: u32,
    pub retry_sleep_ms: u64,
    /// Frames between status updates.
    pub status_interval: u64,
    /// Read panels on independent producer threads.
    pub multi_producer: bool,
    pub accumulate_powder: bool,
    pub accumulate_spectrum: bool,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            max_in_flight: 16,
            tag_stride: 2,
            lateness_window: 8,
            retry_budget: 100,
            retry_sleep_ms: 1,
            status_interval: 5,
            multi_producer: false,
            accumulate_powder: true,
            accumulate_spectrum: false,
        }
    }
}

impl PipelineConfig {
    #[must_use]
    pub fn with_max_in_flight(mut self, k: usize) -> Self {
        self.max_in_flight = k;
        self
    }

    #[must_use]
    pub fn with_tag_stride(mut self, stride: u64) -> Self {
        self.tag_stride = stride;
        self
    }

    #[must_use]
    pub fn with_lateness_window(mut self, window: u64) -> Self {
        self.lateness_window = window;
        self
    }

    #[must_use]
    pub fn with_retry_budget(mut self, budget: u32) -> Self {
        self.retry_budget = budget;
        self
    }

    #[must_use]
    pub fn with_multi_producer(mut self, enabled: bool) -> Self {
        self.multi_producer = enabled;
        self
    }

    fn validate(&self) -> Result<()> {
        if self.max_in_flight == 0 {
            return Err(Error::ConfigError(
                "max_in_flight must be at least 1".to_string(),
            ));
        }
        if self.tag_stride == 0 {
            return Err(Error::ConfigError(
                "tag_stride must be at least 1".to_string(),
            ));
        }
        if self.lateness_window == 0 {
            return Err(Error::ConfigError(
                "lateness_window must be at least 1".to_string(),
            ));
        }
        if self.status_interval == 0 {
            return Err(Error::ConfigError(
                "status_interval must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

/// Spectrometer integration parameters.
#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize), serde(default))]
pub struct SpectrumConfig {
    /// Tilt of the dispersion axis in degrees.
    pub tilt_deg: f64,
    pub subtract_dark: bool,
    /// Energy covered by the whole spectrum, in eV.
    pub ev_spread: f64,
}

impl Default for SpectrumConfig {
    fn default() -> Self {
        Self {
            tilt_deg: 0.0,
            subtract_dark: false,
            ev_spread: 50.0,
        }
    }
}

/// Complete configuration of one run.
#[derive(Debug, Clone, PartialEq, Default)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize), serde(default))]
pub struct RunConfig {
    pub hitfinder: HitfinderConfig,
    pub photon: PhotonConfig,
    pub correction: CorrectionConfig,
    pub pipeline: PipelineConfig,
    pub spectrum: SpectrumConfig,
}

impl RunConfig {
    /// Rejects configurations that cannot drive a run.
    ///
    /// # Errors
    /// Returns `ConfigError` describing the first problem found.
    pub fn validate(&self) -> Result<()> {
        self.hitfinder.validate()?;
        self.pipeline.validate()?;
        if self.photon.adu_per_photon <= 0.0 {
            return Err(Error::ConfigError(
                "adu_per_photon must be positive".to_string(),
            ));
        }
        if self.photon.significance_threshold < 0.0 {
            return Err(Error::ConfigError(
                "significance_threshold must be non-negative".to_string(),
            ));
        }
        Ok(())
    }

    /// Parses a JSON configuration; missing fields take their defaults.
    ///
    /// # Errors
    /// Returns `ConfigParse` for malformed JSON or unknown algorithm names.
    #[cfg(feature = "serde")]
    pub fn from_json_str(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }

    /// Reads a JSON configuration file.
    ///
    /// # Errors
    /// Returns `Io` if the file cannot be read, otherwise see [`RunConfig::from_json_str`].
    #[cfg(feature = "serde")]
    pub fn from_json_file<P: AsRef<std::path::Path>>(path: P) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        Self::from_json_str(&text)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn test_algorithm_ids_round_trip() {
        for algorithm in HitfinderAlgorithm::ALL {
            assert_eq!(HitfinderAlgorithm::from_id(algorithm.id()).unwrap(), algorithm);
            assert_eq!(algorithm.name().parse::<HitfinderAlgorithm>().unwrap(), algorithm);
        }
    }

    #[test]
    fn test_unknown_algorithm_is_error() {
        assert!(matches!(
            HitfinderAlgorithm::from_id(5),
            Err(Error::UnknownHitfinder(_))
        ));
        assert!(matches!(
            "bogus".parse::<HitfinderAlgorithm>(),
            Err(Error::UnknownHitfinder(_))
        ));
        assert_eq!(
            "30".parse::<HitfinderAlgorithm>().unwrap(),
            HitfinderAlgorithm::GainModePhotonCount
        );
    }

    #[test]
    fn test_gain_mode_threshold() {
        let gm = GainModeThreshold::default();
        assert_relative_eq!(gm.threshold(2.0), -8270.0 + 12918.0 + 2775.0);
    }

    #[test]
    fn test_panel_scale() {
        let correction = CorrectionConfig::default();
        assert_relative_eq!(correction.panel_scale(2.0, 7300.0), 0.01, epsilon = 1e-6);
        assert_relative_eq!(correction.panel_scale(2.0, 0.0), 1.0);
        let disabled = CorrectionConfig {
            gain_correction: false,
            ..CorrectionConfig::default()
        };
        assert_relative_eq!(disabled.panel_scale(2.0, 7300.0), 1.0);
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        assert!(RunConfig::default().validate().is_ok());

        let mut config = RunConfig::default();
        config.pipeline.max_in_flight = 0;
        assert!(config.validate().is_err());

        let mut config = RunConfig::default();
        config.hitfinder.tof = TofWindow {
            min_sample: 10,
            max_sample: 10,
            threshold: 1.0,
        };
        assert!(config.validate().is_err());

        let mut config = RunConfig::default();
        config.hitfinder.npeaks_min = 10;
        config.hitfinder.npeaks_max = 5;
        assert!(config.validate().is_err());

        let mut config = RunConfig::default();
        config.photon.adu_per_photon = 0.0;
        assert!(config.validate().is_err());
    }

    #[cfg(feature = "serde")]
    #[test]
    fn test_json_defaults_and_unknown_algorithm() {
        let config = RunConfig::from_json_str(
            r#"{"hitfinder": {"algorithm": "halo-sigma", "halo_threshold": 12.5},
                "pipeline": {"max_in_flight": 4}}"#,
        )
        .unwrap();
        assert_eq!(config.hitfinder.algorithm, HitfinderAlgorithm::HaloSigma);
        assert_relative_eq!(config.hitfinder.halo_threshold, 12.5);
        assert_eq!(config.pipeline.max_in_flight, 4);
        assert_eq!(config.pipeline.tag_stride, 2);

        let err = RunConfig::from_json_str(r#"{"hitfinder": {"algorithm": "psychic"}}"#);
        assert!(matches!(err, Err(Error::ConfigParse(_))));
    }
}
