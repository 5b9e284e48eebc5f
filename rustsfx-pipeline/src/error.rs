//! Pipeline error types.

use thiserror::Error;

/// Result type for pipeline operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Pipeline error types.
#[derive(Error, Debug)]
pub enum Error {
    /// Core library error, usually configuration or calibration.
    #[error("core error: {0}")]
    CoreError(#[from] rustsfx_core::Error),

    /// A source read failed.
    #[error("source error: {0}")]
    Source(String),

    /// The first tag of the run could not be assembled.
    #[error("first frame could not be read: {0}")]
    FirstFrame(String),

    /// The pending table disagrees with the producers.
    #[error("tag table consistency violation: {0}")]
    Consistency(String),

    /// A sink write failed.
    #[error("sink error: {0}")]
    Sink(String),

    /// A worker or producer thread could not be started.
    #[error("failed to spawn thread: {0}")]
    Spawn(#[source] std::io::Error),
}

impl Error {
    /// Short reason written into an `Error-<reason>` status line.
    #[must_use]
    pub fn reason(&self) -> &'static str {
        match self {
            Self::CoreError(_) => "Config",
            Self::Source(_) => "Source",
            Self::FirstFrame(_) => "FirstFrame",
            Self::Consistency(_) => "Consistency",
            Self::Sink(_) => "Sink",
            Self::Spawn(_) => "Spawn",
        }
    }

    /// Builds a source error for one panel read.
    pub fn source(panel: usize, tag: u64, message: impl std::fmt::Display) -> Self {
        Self::Source(format!("panel {panel}, tag {tag}: {message}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reason_codes() {
        let err = Error::FirstFrame("tag 0".to_string());
        assert_eq!(err.reason(), "FirstFrame");
        let err: Error = rustsfx_core::Error::UnknownHitfinder("7".to_string()).into();
        assert_eq!(err.reason(), "Config");
        let err = Error::source(2, 40, "timeout");
        assert_eq!(err.to_string(), "source error: panel 2, tag 40: timeout");
    }
}
