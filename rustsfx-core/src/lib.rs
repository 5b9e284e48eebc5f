//! rustsfx-core: Core types for real-time XFEL hit finding.
//!
//! This crate provides the frame and event data model, calibration maps,
//! run configuration and the shared accumulators updated by every worker.
//!

pub mod accumulators;
pub mod calibration;
pub mod config;
pub mod error;
pub mod event;
pub mod frame;
pub mod mask;
pub mod status;

pub use accumulators::{AccumulatorSnapshot, HitCounters, PowderClass, SharedAccumulators};
pub use calibration::{Calibration, DetectorGeometry};
pub use config::{
    CorrectionConfig, GainModeThreshold, HitfinderAlgorithm, HitfinderConfig, PhotonConfig,
    PhotonMode, PipelineConfig, RunConfig, SpectrumConfig, TofWindow,
};
pub use error::{Error, Result};
pub use event::{EventRecord, EventSummary, Peak};
pub use frame::{wavelength_from_ev, DetectorLayout, Frame, SpectrumImage};
pub use mask::PixelFlags;
pub use status::{RunState, RunStatus, RunSummary, SpectrumSummary};
