//! rustsfx-algorithms: Per-event processing for XFEL hit finding.
//!
//! This crate provides the algorithms run inside each event's task:
//! - **Correction** - saturation flagging and per-panel gain
//! - **Photon accounting** - significance or static-threshold photon maps
//! - **Hit decision** - pixel, peak, TOF and photon based hitfinders
//! - **Spectrum** - spectrometer integration and run spectrum summary
//!

mod correction;
mod hitfinder;
pub mod peaks;
mod photon;
pub mod spectrum;

pub use correction::apply_corrections;
pub use hitfinder::{
    count_bright, HitFinder, INTEGRATED_EXCLUDE, PIXEL_COUNT_EXCLUDE, PROJECTION_EXCLUDE,
    TOF_FALLBACK_EXCLUDE,
};
pub use peaks::{resolution_stats, ConnectedPeakFinder, PeakFinder, ResolutionStats};
pub use photon::PhotonCounter;
pub use spectrum::{integrate_spectrum, summarize_spectrum};
