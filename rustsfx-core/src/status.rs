//! Run progress and end-of-run summary.

use crate::accumulators::AccumulatorSnapshot;
use std::fmt;

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

/// Phase of a run as reported to monitors.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum RunState {
    #[default]
    Hitfinding,
    Finished,
    /// Fatal error; the payload is a short reason.
    Error(String),
}

impl fmt::Display for RunState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Hitfinding => f.write_str("Hitfinding"),
            Self::Finished => f.write_str("Finished"),
            Self::Error(reason) => write!(f, "Error-{reason}"),
        }
    }
}

/// Progress counters flushed to the sink.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct RunStatus {
    /// Frames delivered to the worker pool.
    pub total: u64,
    pub processed: u64,
    pub hits: u64,
    pub state: RunState,
}

impl RunStatus {
    /// Parses the single-line form written by `Display`.
    #[must_use]
    pub fn parse_line(line: &str) -> Option<Self> {
        let mut status = Self::default();
        let mut seen = 0;
        for field in line.trim().split(',') {
            let (key, value) = field.split_once('=')?;
            match key {
                "Total" => status.total = value.parse().ok()?,
                "Processed" => status.processed = value.parse().ok()?,
                "Hits" => status.hits = value.parse().ok()?,
                "Status" => {
                    status.state = match value {
                        "Hitfinding" => RunState::Hitfinding,
                        "Finished" => RunState::Finished,
                        other => RunState::Error(other.strip_prefix("Error-")?.to_string()),
                    };
                }
                _ => return None,
            }
            seen += 1;
        }
        (seen == 4).then_some(status)
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Total={},Processed={},Hits={},Status={}",
            self.total, self.processed, self.hits, self.state
        )
    }
}

/// Run spectrum with its energy axis.
#[derive(Debug, Clone, PartialEq, Default)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct SpectrumSummary {
    pub sum: Vec<f64>,
    pub hits: u64,
    pub peak_index: usize,
    /// Energy of every bin, in eV.
    pub energy_scale_ev: Vec<f64>,
}

/// Everything written at the end of a run.
#[derive(Debug, Clone, Default)]
pub struct RunSummary {
    pub run_id: u32,
    pub status: RunStatus,
    pub accumulators: AccumulatorSnapshot,
    /// Raw-pixel shape `(n_panels, panel_ny, panel_nx)`.
    pub raw_shape: (usize, usize, usize),
    /// Assembled image shape `(ny, nx)`.
    pub assembled_shape: (usize, usize),
    pub spectrum: Option<SpectrumSummary>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_line() {
        let status = RunStatus {
            total: 20,
            processed: 15,
            hits: 3,
            state: RunState::Hitfinding,
        };
        assert_eq!(
            status.to_string(),
            "Total=20,Processed=15,Hits=3,Status=Hitfinding"
        );
        assert_eq!(RunStatus::parse_line(&status.to_string()), Some(status));
    }

    #[test]
    fn test_error_status_line() {
        let status = RunStatus {
            state: RunState::Error("FirstFrame".to_string()),
            ..RunStatus::default()
        };
        let line = status.to_string();
        assert!(line.ends_with("Status=Error-FirstFrame"));
        assert_eq!(RunStatus::parse_line(&line), Some(status));
        assert_eq!(RunStatus::parse_line("Total=1,Hits=2"), None);
    }
}
