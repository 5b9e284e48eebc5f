//! Output sinks.

use crate::Result;
use parking_lot::Mutex;
use rustsfx_core::{EventRecord, EventSummary, RunStatus, RunSummary};
use std::collections::BTreeMap;
use std::sync::Arc;

/// Destination for per-event results, progress and the run summary.
///
/// Workers call `write_event` concurrently and out of tag order, so every
/// record is keyed by its tag.
pub trait Sink: Send + Sync {
    /// # Errors
    /// Returns `Sink` if the event cannot be written.
    fn write_event(&self, tag: u64, event: &EventRecord) -> Result<()>;

    /// # Errors
    /// Returns `Sink` if the status cannot be written.
    fn flush_status(&self, status: &RunStatus) -> Result<()>;

    /// # Errors
    /// Returns `Sink` if the summary cannot be written.
    fn write_run_summary(&self, summary: &RunSummary) -> Result<()>;
}

/// Forwards every call to several sinks in order.
#[derive(Default)]
pub struct MultiSink {
    sinks: Vec<Arc<dyn Sink>>,
}

impl MultiSink {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_sink(mut self, sink: Arc<dyn Sink>) -> Self {
        self.sinks.push(sink);
        self
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.sinks.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.sinks.is_empty()
    }
}

impl Sink for MultiSink {
    fn write_event(&self, tag: u64, event: &EventRecord) -> Result<()> {
        self.sinks.iter().try_for_each(|s| s.write_event(tag, event))
    }

    fn flush_status(&self, status: &RunStatus) -> Result<()> {
        self.sinks.iter().try_for_each(|s| s.flush_status(status))
    }

    fn write_run_summary(&self, summary: &RunSummary) -> Result<()> {
        self.sinks.iter().try_for_each(|s| s.write_run_summary(summary))
    }
}

/// Keeps everything in memory.
#[derive(Debug, Default)]
pub struct MemorySink {
    events: Mutex<BTreeMap<u64, EventSummary>>,
    statuses: Mutex<Vec<RunStatus>>,
    summary: Mutex<Option<RunSummary>>,
}

impl MemorySink {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Event summaries by tag.
    #[must_use]
    pub fn events(&self) -> BTreeMap<u64, EventSummary> {
        self.events.lock().clone()
    }

    /// Every status flushed so far, oldest first.
    #[must_use]
    pub fn statuses(&self) -> Vec<RunStatus> {
        self.statuses.lock().clone()
    }

    #[must_use]
    pub fn last_status(&self) -> Option<RunStatus> {
        self.statuses.lock().last().cloned()
    }

    #[must_use]
    pub fn summary(&self) -> Option<RunSummary> {
        self.summary.lock().clone()
    }
}

impl Sink for MemorySink {
    fn write_event(&self, tag: u64, event: &EventRecord) -> Result<()> {
        self.events.lock().insert(tag, event.summary);
        Ok(())
    }

    fn flush_status(&self, status: &RunStatus) -> Result<()> {
        self.statuses.lock().push(status.clone());
        Ok(())
    }

    fn write_run_summary(&self, summary: &RunSummary) -> Result<()> {
        *self.summary.lock() = Some(summary.clone());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rustsfx_core::RunState;

    #[test]
    fn test_multi_sink_fans_out() {
        let a = Arc::new(MemorySink::new());
        let b = Arc::new(MemorySink::new());
        let sink = MultiSink::new()
            .with_sink(Arc::clone(&a) as Arc<dyn Sink>)
            .with_sink(Arc::clone(&b) as Arc<dyn Sink>);
        assert_eq!(sink.len(), 2);

        let status = RunStatus {
            total: 3,
            state: RunState::Finished,
            ..RunStatus::default()
        };
        sink.flush_status(&status).unwrap();
        assert_eq!(a.last_status(), Some(status.clone()));
        assert_eq!(b.statuses(), vec![status]);
    }
}
