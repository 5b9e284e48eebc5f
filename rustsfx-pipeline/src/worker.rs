//! Per-event task body.

use crate::dispatcher::EventProcessor;
use crate::sink::Sink;
use crate::Result;
use log::{debug, info};
use parking_lot::Mutex;
use rustsfx_algorithms::{apply_corrections, integrate_spectrum, HitFinder, PhotonCounter};
use rustsfx_core::{
    Calibration, EventRecord, Frame, PowderClass, RunConfig, RunState, RunStatus,
    SharedAccumulators,
};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Turns one admitted frame into an event and runs every stage on it:
/// corrections, photon accounting, hit decision, spectrum and powder
/// accumulation, then hands the event to the sink.
pub struct ShotProcessor {
    config: RunConfig,
    calibration: Arc<Calibration>,
    accumulators: Arc<SharedAccumulators>,
    sink: Arc<dyn Sink>,
    hitfinder: HitFinder,
    photons: PhotonCounter,
    delivered: Arc<AtomicU64>,
    last_flushed: Mutex<u64>,
}

impl ShotProcessor {
    /// `delivered` is the running count of frames handed to the pool; it is
    /// reported as the status total.
    #[must_use]
    pub fn new(
        config: RunConfig,
        calibration: Arc<Calibration>,
        accumulators: Arc<SharedAccumulators>,
        sink: Arc<dyn Sink>,
        delivered: Arc<AtomicU64>,
    ) -> Self {
        Self {
            hitfinder: HitFinder::new(config.hitfinder.clone()),
            photons: PhotonCounter::new(config.photon),
            config,
            calibration,
            accumulators,
            sink,
            delivered,
            last_flushed: Mutex::new(0),
        }
    }

    /// Current progress as seen by the workers.
    #[must_use]
    pub fn status(&self, state: RunState) -> RunStatus {
        let counters = self.accumulators.counters();
        RunStatus {
            total: self.delivered.load(Ordering::Relaxed),
            processed: counters.processed,
            hits: counters.hits,
            state,
        }
    }

    fn run_stages(&self, event: &mut EventRecord) -> Result<bool> {
        let calibration = &*self.calibration;
        let accumulators = &*self.accumulators;

        apply_corrections(event, &self.config.correction);
        self.photons.compute(event, calibration, accumulators)?;
        let hit = self.hitfinder.evaluate(event, calibration, accumulators);

        if hit && self.config.pipeline.accumulate_spectrum {
            if let Some(image) = &event.spectrum_image {
                let spectrum = integrate_spectrum(
                    image,
                    calibration.spectrum_dark.as_deref(),
                    &self.config.spectrum,
                );
                accumulators.add_spectrum(&spectrum);
                event.spectrum = Some(spectrum);
            }
        }

        if self.config.pipeline.accumulate_powder {
            accumulators.add_powder(
                PowderClass::from_hit(hit),
                &event.corrected,
                calibration.geometry.assembled_index(),
            );
        }
        Ok(hit)
    }
}

impl EventProcessor for ShotProcessor {
    fn process(&self, frame: Frame, seq: u64) -> Result<()> {
        let tag = frame.tag;
        let mut event = EventRecord::from_frame(frame, &self.calibration)?;
        let hit = self.run_stages(&mut event)?;
        debug!(
            "Task {seq}: tag {tag} {} ({} peaks, {:.1} photons)",
            if hit { "hit" } else { "blank" },
            event.summary.n_peaks,
            event.summary.total_photons
        );

        self.sink.write_event(tag, &event)?;

        let processed = self.accumulators.record_processed();
        if processed % self.config.pipeline.status_interval == 0 {
            let mut last_flushed = self.last_flushed.lock();
            let status = self.status(RunState::Hitfinding);
            // Another task already published this progress or later.
            if status.processed <= *last_flushed {
                return Ok(());
            }
            let recent = self.accumulators.take_recent_hits();
            info!(
                "Processed {} of {} frames, {} hits ({recent} since last update)",
                status.processed, status.total, status.hits
            );
            self.sink.flush_status(&status)?;
            *last_flushed = status.processed;
        }
        Ok(())
    }
}
