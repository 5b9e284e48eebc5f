//! Error types for rustsfx-core.

use thiserror::Error;

/// Result type alias for rustsfx operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Core error types for rustsfx operations.
#[derive(Error, Debug)]
pub enum Error {
    /// Hitfinder selector that does not name a known algorithm.
    #[error("unknown hitfinder algorithm: {0}")]
    UnknownHitfinder(String),

    /// Configuration error.
    #[error("configuration error: {0}")]
    ConfigError(String),

    /// A calibration map required by the configured processing is absent.
    #[error("missing calibration map `{map}` required by {required_by}")]
    MissingCalibration {
        map: &'static str,
        required_by: &'static str,
    },

    /// Array length does not match the detector layout.
    #[error("dimension mismatch for {what}: expected {expected}, got {actual}")]
    DimensionMismatch {
        what: &'static str,
        expected: usize,
        actual: usize,
    },

    /// Panel index outside the detector layout.
    #[error("panel index {panel} out of range (detector has {n_panels} panels)")]
    InvalidPanel { panel: usize, n_panels: usize },

    /// Configuration file could not be read.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Configuration file could not be parsed.
    #[cfg(feature = "serde")]
    #[error("configuration parse error: {0}")]
    ConfigParse(#[from] serde_json::Error),
}
