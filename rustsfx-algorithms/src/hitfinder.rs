//! Hit decision.
//!
//! One [`HitFinder`] is built per run and shared by every worker. It reads
//! the event's corrected data and calibration maps, writes the event's own
//! summary, and touches shared state only to count a hit.

use crate::peaks::{resolution_stats, ConnectedPeakFinder, PeakFinder};
use rustsfx_core::{
    Calibration, EventRecord, HitfinderAlgorithm, HitfinderConfig, PixelFlags, SharedAccumulators,
};

/// Pixels ignored by the pixel-count hitfinder.
pub const PIXEL_COUNT_EXCLUDE: PixelFlags = PixelFlags::INVALID
    .union(PixelFlags::IN_PEAKMASK)
    .union(PixelFlags::OUT_OF_RESOLUTION)
    .union(PixelFlags::HOT)
    .union(PixelFlags::BAD)
    .union(PixelFlags::SATURATED)
    .union(PixelFlags::MISSING)
    .union(PixelFlags::IN_HALO);

/// Pixels ignored by the integrated-intensity hitfinder.
pub const INTEGRATED_EXCLUDE: PixelFlags = PixelFlags::INVALID
    .union(PixelFlags::IN_PEAKMASK)
    .union(PixelFlags::OUT_OF_RESOLUTION)
    .union(PixelFlags::HOT)
    .union(PixelFlags::BAD)
    .union(PixelFlags::SATURATED)
    .union(PixelFlags::MISSING);

/// Pixels ignored by the TOF hitfinder's pixel-count fallback.
pub const TOF_FALLBACK_EXCLUDE: PixelFlags = PixelFlags::INVALID
    .union(PixelFlags::IN_PEAKMASK)
    .union(PixelFlags::OUT_OF_RESOLUTION)
    .union(PixelFlags::HOT)
    .union(PixelFlags::BAD)
    .union(PixelFlags::SATURATED);

/// Pixels ignored by the reference-projection and halo-sigma hitfinders.
pub const PROJECTION_EXCLUDE: PixelFlags = PixelFlags::IN_PEAKMASK
    .union(PixelFlags::OUT_OF_RESOLUTION)
    .union(PixelFlags::HOT)
    .union(PixelFlags::BAD)
    .union(PixelFlags::SATURATED)
    .union(PixelFlags::MISSING);

/// Width of the running sum used by the TOF minimum filter.
const TOF_MIN_WINDOW: usize = 3;

/// Applies the configured hit-decision algorithm.
pub struct HitFinder {
    config: HitfinderConfig,
    peak_finder: Box<dyn PeakFinder>,
}

impl HitFinder {
    /// Creates a hit finder using the connected-component peak finder.
    #[must_use]
    pub fn new(config: HitfinderConfig) -> Self {
        Self {
            config,
            peak_finder: Box::new(ConnectedPeakFinder::new()),
        }
    }

    /// Replaces the peak finder.
    #[must_use]
    pub fn with_peak_finder<P: PeakFinder + 'static>(mut self, finder: P) -> Self {
        self.peak_finder = Box::new(finder);
        self
    }

    #[must_use]
    pub fn config(&self) -> &HitfinderConfig {
        &self.config
    }

    #[must_use]
    pub fn algorithm(&self) -> HitfinderAlgorithm {
        self.config.algorithm
    }

    /// Decides whether `event` is a hit and fills its summary.
    ///
    /// A hit is counted in `accumulators` exactly once.
    pub fn evaluate(
        &self,
        event: &mut EventRecord,
        calibration: &Calibration,
        accumulators: &SharedAccumulators,
    ) -> bool {
        let hit = match self.config.algorithm {
            HitfinderAlgorithm::Everything => true,
            HitfinderAlgorithm::PixelCount => self.pixel_count(event),
            HitfinderAlgorithm::IntegratedIntensity => self.integrated_intensity(event),
            HitfinderAlgorithm::BraggPeaks => self.bragg_peaks(event, calibration),
            HitfinderAlgorithm::TofIntegrated => self.tof_integrated(event),
            HitfinderAlgorithm::TofMinimum => self.tof_minimum(event),
            HitfinderAlgorithm::TofMinimumExcludingPixels => {
                let (nat, _) =
                    count_bright(event, self.config.adc_threshold, PIXEL_COUNT_EXCLUDE);
                self.tof_minimum(event) && nat < self.config.min_pix_count
            }
            HitfinderAlgorithm::PhotonCount => {
                event.summary.total_photons > self.config.photon_threshold
            }
            HitfinderAlgorithm::ReferenceProjection => {
                self.reference_projection(event, calibration)
            }
            HitfinderAlgorithm::GainModePhotonCount => {
                let gm = &self.config.gain_mode;
                event.pulse_energy > gm.min_pulse_energy
                    && event.summary.total_photons > gm.threshold(event.pulse_energy)
            }
            HitfinderAlgorithm::HaloSigma => self.halo_sigma(event, calibration),
        };

        event.summary.hit = hit;
        if hit {
            accumulators.record_hit();
        }
        hit
    }

    fn pixel_count(&self, event: &mut EventRecord) -> bool {
        let (nat, tat) = count_bright(event, self.config.adc_threshold, PIXEL_COUNT_EXCLUDE);
        set_bright_metrics(event, nat, tat);
        nat >= self.config.min_pix_count
    }

    fn integrated_intensity(&self, event: &mut EventRecord) -> bool {
        let (nat, tat) = count_bright(event, self.config.adc_threshold, INTEGRATED_EXCLUDE);
        set_bright_metrics(event, nat, tat);
        tat >= self.config.integrated_threshold
    }

    fn bragg_peaks(&self, event: &mut EventRecord, calibration: &Calibration) -> bool {
        let peaks = self
            .peak_finder
            .find_peaks(event, calibration, &self.config);
        let summary = &mut event.summary;
        summary.n_peaks = peaks.len();
        summary.peak_npix = peaks.iter().map(|p| p.npix).sum();
        summary.peak_total = peaks.iter().map(|p| f64::from(p.total)).sum();

        if self.config.resolution_stats {
            if let Some(stats) = resolution_stats(
                &peaks,
                self.config.npeaks_max,
                &calibration.geometry,
                event.wavelength_a,
            ) {
                summary.peak_resolution = stats.resolution;
                summary.peak_resolution_a = stats.resolution_a;
                summary.peak_density = stats.density;
            }
        }

        let n = peaks.len();
        event.peaks = peaks;
        (self.config.npeaks_min..=self.config.npeaks_max).contains(&n)
    }

    fn tof_integrated(&self, event: &mut EventRecord) -> bool {
        let Some(trace) = event.tof.as_deref() else {
            let (nat, tat) =
                count_bright(event, self.config.adc_threshold, TOF_FALLBACK_EXCLUDE);
            set_bright_metrics(event, nat, tat);
            return nat >= self.config.min_pix_count;
        };
        let window = &self.config.tof;
        let end = window.max_sample.min(trace.len());
        let start = window.min_sample.min(end);
        let signal: f64 = trace[start..end].iter().map(|v| f64::from(*v)).sum();
        event.summary.tof_signal = signal;
        signal > window.threshold
    }

    fn tof_minimum(&self, event: &mut EventRecord) -> bool {
        let window = &self.config.tof;
        let minimum = event.tof.as_deref().and_then(|trace| {
            let end = window.max_sample.min(trace.len());
            let start = window.min_sample.min(end);
            trace[start..end]
                .windows(TOF_MIN_WINDOW)
                .map(|w| w.iter().map(|v| f64::from(*v)).sum::<f64>())
                .min_by(f64::total_cmp)
        });
        match minimum {
            Some(min) => {
                event.summary.tof_signal = min / TOF_MIN_WINDOW as f64;
                min < window.threshold * TOF_MIN_WINDOW as f64
            }
            None => {
                event.summary.tof_signal = 0.0;
                false
            }
        }
    }

    fn reference_projection(&self, event: &mut EventRecord, calibration: &Calibration) -> bool {
        let (Some(sample), Some(background)) = (
            calibration.sample_reference.as_deref(),
            calibration.background_reference.as_deref(),
        ) else {
            return false;
        };
        let mut on_sample = 0.0;
        let mut on_background = 0.0;
        for (((photons, mask), s), b) in event
            .photons
            .iter()
            .zip(&event.mask)
            .zip(sample)
            .zip(background)
        {
            if *photons > 0.0 && mask.is_clear_of(PROJECTION_EXCLUDE) {
                on_sample += f64::from(s * photons);
                on_background += f64::from(b * photons);
            }
        }
        let ratio = if on_background > 0.0 {
            on_sample / on_background
        } else {
            0.0
        };
        event.summary.reference_ratio = ratio;
        ratio > self.config.reference_ratio
    }

    fn halo_sigma(&self, event: &mut EventRecord, calibration: &Calibration) -> bool {
        let (Some(mean), Some(sigma)) = (
            calibration.halo_mean.as_deref(),
            calibration.halo_sigma.as_deref(),
        ) else {
            return false;
        };
        let sum_sq: f64 = event
            .photons
            .iter()
            .zip(mean)
            .zip(sigma)
            .zip(&event.mask)
            .filter(|(((_, _), s), m)| **s > 0.0 && m.is_clear_of(PROJECTION_EXCLUDE))
            .map(|(((p, m), s), _)| {
                let z = f64::from((p - m) / s);
                z * z
            })
            .sum();
        let halo = sum_sq.sqrt();
        event.summary.halo_sigma = halo;
        halo > self.config.halo_threshold
    }
}

/// Counts pixels brighter than `threshold` and not flagged with any of
/// `exclude`. Returns the count and their summed value.
#[must_use]
pub fn count_bright(event: &EventRecord, threshold: f32, exclude: PixelFlags) -> (usize, f64) {
    event
        .corrected
        .iter()
        .zip(&event.mask)
        .filter(|(v, m)| **v > threshold && m.is_clear_of(exclude))
        .fold((0, 0.0), |(n, sum), (v, _)| (n + 1, sum + f64::from(*v)))
}

fn set_bright_metrics(event: &mut EventRecord, nat: usize, tat: f64) {
    event.summary.peak_total = tat;
    event.summary.peak_npix = nat;
    event.summary.n_peaks = nat;
}
