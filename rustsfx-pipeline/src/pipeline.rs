//! Run driver: source to synchroniser to worker pool to sink.

use crate::dispatcher::{DispatcherStats, EventDispatcher};
use crate::sink::Sink;
use crate::source::FrameSource;
use crate::sync::{SequentialReader, SyncReport, TagPlan, TagSynchronizer};
use crate::worker::ShotProcessor;
use crate::{Error, Result};
use log::{error, info, warn};
use rustsfx_algorithms::summarize_spectrum;
use rustsfx_core::{
    Calibration, Frame, HitCounters, RunConfig, RunState, RunStatus, RunSummary,
    SharedAccumulators,
};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// What happened during one run.
#[derive(Debug, Clone, Default)]
pub struct RunReport {
    pub run_id: u32,
    pub sync: SyncReport,
    pub dispatcher: DispatcherStats,
    pub counters: HitCounters,
    /// Frames dropped because the shutter was closed.
    pub beam_off: u64,
    /// Frames dropped because their metadata could not be read.
    pub metadata_errors: u64,
    pub status: RunStatus,
}

#[derive(Debug, Default)]
struct EnergyMean {
    sum: f64,
    count: u64,
}

impl EnergyMean {
    fn add(&mut self, ev: f64) {
        if ev > 0.0 {
            self.sum += ev;
            self.count += 1;
        }
    }

    fn mean(&self) -> f64 {
        if self.count == 0 {
            0.0
        } else {
            self.sum / self.count as f64
        }
    }
}

/// A configured hit-finding run over one calibration.
pub struct Pipeline {
    config: RunConfig,
    calibration: Arc<Calibration>,
    accumulators: Arc<SharedAccumulators>,
}

impl Pipeline {
    /// Validates the configuration against the calibration.
    ///
    /// # Errors
    /// Returns `CoreError` for an invalid configuration or a calibration map
    /// the configuration needs but does not have.
    pub fn new(config: RunConfig, calibration: Calibration) -> Result<Self> {
        config.validate()?;
        calibration.validate_for(&config)?;
        let (nx, ny) = calibration.geometry.assembled_shape();
        let accumulators = SharedAccumulators::new(calibration.len(), nx * ny);
        Ok(Self {
            config,
            calibration: Arc::new(calibration),
            accumulators: Arc::new(accumulators),
        })
    }

    #[must_use]
    pub fn config(&self) -> &RunConfig {
        &self.config
    }

    #[must_use]
    pub fn calibration(&self) -> &Calibration {
        &self.calibration
    }

    #[must_use]
    pub fn accumulators(&self) -> &SharedAccumulators {
        &self.accumulators
    }

    /// Processes every tag `source` offers and writes the results to `sink`.
    ///
    /// On a fatal error an `Error-<reason>` status is flushed before the
    /// error is returned.
    ///
    /// # Errors
    /// Returns the first fatal error: an unreadable run number, gain or tag
    /// range, a layout mismatch, a first-frame failure, or a failing sink
    /// at the end of the run.
    pub fn run<S>(&self, source: &S, sink: Arc<dyn Sink>) -> Result<RunReport>
    where
        S: FrameSource + ?Sized,
    {
        let delivered = Arc::new(AtomicU64::new(0));
        match self.execute(source, &sink, &delivered) {
            Ok(report) => Ok(report),
            Err(e) => {
                error!("Run failed: {e}");
                let counters = self.accumulators.counters();
                let status = RunStatus {
                    total: delivered.load(Ordering::Relaxed),
                    processed: counters.processed,
                    hits: counters.hits,
                    state: RunState::from(&e),
                };
                if let Err(flush) = sink.flush_status(&status) {
                    error!("Could not flush error status: {flush}");
                }
                Err(e)
            }
        }
    }

    fn execute<S>(
        &self,
        source: &S,
        sink: &Arc<dyn Sink>,
        delivered: &Arc<AtomicU64>,
    ) -> Result<RunReport>
    where
        S: FrameSource + ?Sized,
    {
        let layout = self.calibration.layout();
        if source.layout() != layout {
            return Err(rustsfx_core::Error::DimensionMismatch {
                what: "source layout",
                expected: layout.len(),
                actual: source.layout().len(),
            }
            .into());
        }

        self.accumulators.reset();
        let run_id = source.read_run_number()?;
        let gains = if self.config.correction.gain_correction {
            Some(
                (0..layout.n_panels)
                    .map(|panel| source.read_gain(panel))
                    .collect::<Result<Vec<_>>>()?,
            )
        } else {
            None
        };
        let (first, last) = source.tag_range()?;
        let pipeline = &self.config.pipeline;
        let plan = TagPlan::new(first, last, pipeline.tag_stride)?;
        info!(
            "Run {run_id}: {} tags from {first} to {last}, hitfinder {}, {} in flight, {} mode",
            plan.tag_count(),
            self.config.hitfinder.algorithm,
            pipeline.max_in_flight,
            if pipeline.multi_producer {
                "multi-producer"
            } else {
                "sequential"
            }
        );

        let processor = ShotProcessor::new(
            self.config.clone(),
            Arc::clone(&self.calibration),
            Arc::clone(&self.accumulators),
            Arc::clone(sink),
            Arc::clone(delivered),
        );
        let dispatcher = EventDispatcher::new(processor, pipeline.max_in_flight);

        let mut energy = EnergyMean::default();
        let mut beam_off = 0;
        let mut metadata_errors = 0;
        let deliver = |frame: Frame| -> Result<()> {
            let tag = frame.tag;
            let frame = match enrich(source, frame, gains.as_deref()) {
                Ok(Some(frame)) => frame,
                Ok(None) => {
                    beam_off += 1;
                    return Ok(());
                }
                Err(e) => {
                    warn!("Skipping tag {tag}: {e}");
                    metadata_errors += 1;
                    return Ok(());
                }
            };
            energy.add(frame.photon_energy_ev);
            delivered.fetch_add(1, Ordering::Relaxed);
            dispatcher.submit(frame).map(|_| ())
        };

        let sync = if pipeline.multi_producer {
            TagSynchronizer::new(layout, plan, pipeline).run(source, deliver)
        } else {
            SequentialReader::new(layout, plan).run(source, deliver)
        };
        // Admitted tasks finish even when the run is failing.
        dispatcher.drain();
        let sync = sync?;

        let snapshot = self.accumulators.snapshot();
        let status = RunStatus {
            total: delivered.load(Ordering::Relaxed),
            processed: snapshot.counters.processed,
            hits: snapshot.counters.hits,
            state: RunState::Finished,
        };
        let spectrum = (pipeline.accumulate_spectrum && snapshot.spectrum_hits > 0).then(|| {
            summarize_spectrum(
                &snapshot.spectrum,
                snapshot.spectrum_hits,
                energy.mean(),
                self.config.spectrum.ev_spread,
            )
        });
        let (nx, ny) = self.calibration.geometry.assembled_shape();
        let summary = RunSummary {
            run_id,
            status: status.clone(),
            accumulators: snapshot,
            raw_shape: (layout.n_panels, layout.panel_ny, layout.panel_nx),
            assembled_shape: (ny, nx),
            spectrum,
        };
        sink.write_run_summary(&summary)?;
        sink.flush_status(&status)?;

        let stats = dispatcher.stats();
        info!(
            "Run {run_id} finished: {} processed, {} hits, {} skipped by the synchroniser, {} failed tasks",
            status.processed,
            status.hits,
            sync.errored + sync.stale,
            stats.failed + stats.panicked
        );
        Ok(RunReport {
            run_id,
            sync,
            dispatcher: stats,
            counters: summary.accumulators.counters,
            beam_off,
            metadata_errors,
            status,
        })
    }
}

/// Attaches per-tag metadata. Returns `None` for beam-off frames.
fn enrich<S>(source: &S, frame: Frame, gains: Option<&[f32]>) -> Result<Option<Frame>>
where
    S: FrameSource + ?Sized,
{
    let tag = frame.tag;
    if !source.read_beam_on(tag)? {
        return Ok(None);
    }
    let mut frame = frame
        .with_photon_energy(source.read_photon_energy(tag)?)
        .with_pulse_energy(source.read_pulse_energy(tag)?);
    if let Some(tof) = source.read_tof(tag)? {
        frame = frame.with_tof(tof);
    }
    if let Some(image) = source.read_spectrum_image(tag)? {
        frame = frame.with_spectrum_image(image);
    }
    if let Some(gains) = gains {
        frame = frame.try_with_panel_gains(gains.to_vec())?;
    }
    Ok(Some(frame))
}

impl From<&Error> for RunState {
    fn from(e: &Error) -> Self {
        RunState::Error(e.reason().to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sink::MemorySink;
    use crate::source::MemorySource;
    use rustsfx_core::{DetectorGeometry, DetectorLayout, HitfinderAlgorithm, PhotonMode};

    fn calibration(layout: DetectorLayout) -> Calibration {
        Calibration::new(DetectorGeometry::stacked(layout, 0.1, 1e-4).unwrap())
    }

    #[test]
    fn test_rejects_missing_calibration() {
        let mut config = RunConfig::default();
        config.photon.mode = PhotonMode::Significance;
        let err = Pipeline::new(config, calibration(DetectorLayout::new(1, 2, 2)));
        assert!(matches!(
            err,
            Err(Error::CoreError(
                rustsfx_core::Error::MissingCalibration { .. }
            ))
        ));
    }

    #[test]
    fn test_layout_mismatch_flushes_error_status() {
        let mut config = RunConfig::default();
        config.hitfinder.algorithm = HitfinderAlgorithm::Everything;
        let pipeline = Pipeline::new(config, calibration(DetectorLayout::new(1, 2, 2))).unwrap();

        let layout = DetectorLayout::new(2, 2, 2);
        let source = MemorySource::from_frames(layout, vec![Frame::new(0, layout)]).unwrap();
        let sink = Arc::new(MemorySink::new());
        assert!(pipeline.run(&source, Arc::clone(&sink) as Arc<dyn Sink>).is_err());
        assert_eq!(
            sink.last_status().unwrap().state,
            RunState::Error("Config".to_string())
        );
    }

    #[test]
    fn test_beam_off_frames_skipped() {
        let layout = DetectorLayout::new(1, 2, 2);
        let mut config = RunConfig::default();
        config.hitfinder.algorithm = HitfinderAlgorithm::Everything;
        let pipeline = Pipeline::new(config, calibration(layout)).unwrap();

        let frames = (0..4)
            .map(|tag| {
                Frame::new(tag * 2, layout)
                    .with_photon_energy(9000.0)
                    .with_beam_on(tag != 2)
            })
            .collect();
        let source = MemorySource::from_frames(layout, frames).unwrap();
        let sink = Arc::new(MemorySink::new());
        let report = pipeline
            .run(&source, Arc::clone(&sink) as Arc<dyn Sink>)
            .unwrap();

        assert_eq!(report.beam_off, 1);
        assert_eq!(report.counters.hits, 3);
        assert_eq!(report.status.total, 3);
        assert!(!sink.events().contains_key(&4));
        assert_eq!(sink.last_status().unwrap().state, RunState::Finished);
    }
}
