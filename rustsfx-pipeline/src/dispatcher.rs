//! Bounded pool of in-flight event tasks.
//!
//! Every admitted frame runs on its own detached thread. Admission blocks
//! while `max_in_flight` tasks are running; each task gives its slot back
//! through a guard that is dropped on every exit path, panics included.

use crate::{Error, Result};
use log::{debug, error, warn};
use parking_lot::{Condvar, Mutex};
use rustsfx_core::Frame;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::thread;

/// Work run for each admitted frame.
pub trait EventProcessor: Send + Sync + 'static {
    /// Processes one frame. `seq` is the admission sequence number.
    ///
    /// # Errors
    /// Any error is logged and counted by the dispatcher.
    fn process(&self, frame: Frame, seq: u64) -> Result<()>;
}

impl<F> EventProcessor for F
where
    F: Fn(Frame, u64) -> Result<()> + Send + Sync + 'static,
{
    fn process(&self, frame: Frame, seq: u64) -> Result<()> {
        self(frame, seq)
    }
}

/// Identifies an admitted task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TaskHandle {
    pub seq: u64,
    pub tag: u64,
}

/// Outcome of [`EventDispatcher::try_submit`].
#[derive(Debug)]
pub enum Admission {
    Admitted(TaskHandle),
    /// Every slot was busy; the frame is handed back untouched.
    Blocked(Frame),
}

/// Counters kept by the dispatcher.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DispatcherStats {
    pub submitted: u64,
    pub completed: u64,
    pub failed: u64,
    pub panicked: u64,
    pub in_flight: usize,
    pub peak_in_flight: usize,
}

#[derive(Debug, Clone, Copy)]
enum Outcome {
    Completed,
    Failed,
    Panicked,
}

#[derive(Debug, Default)]
struct PoolState {
    next_seq: u64,
    stats: DispatcherStats,
}

impl PoolState {
    fn admit(&mut self) -> u64 {
        let seq = self.next_seq;
        self.next_seq += 1;
        self.stats.submitted += 1;
        self.stats.in_flight += 1;
        self.stats.peak_in_flight = self.stats.peak_in_flight.max(self.stats.in_flight);
        seq
    }

    fn release(&mut self, outcome: Outcome) {
        self.stats.in_flight -= 1;
        match outcome {
            Outcome::Completed => self.stats.completed += 1,
            Outcome::Failed => self.stats.failed += 1,
            Outcome::Panicked => self.stats.panicked += 1,
        }
    }
}

#[derive(Debug, Default)]
struct Shared {
    state: Mutex<PoolState>,
    slot_freed: Condvar,
}

/// Returns one slot to the pool when dropped.
struct SlotGuard {
    shared: Arc<Shared>,
    outcome: Outcome,
}

impl Drop for SlotGuard {
    fn drop(&mut self) {
        self.shared.state.lock().release(self.outcome);
        self.shared.slot_freed.notify_all();
    }
}

/// Runs at most `max_in_flight` event tasks at once.
pub struct EventDispatcher<P> {
    shared: Arc<Shared>,
    processor: Arc<P>,
    max_in_flight: usize,
}

impl<P: EventProcessor> EventDispatcher<P> {
    /// Creates a pool admitting at most `max_in_flight` tasks (at least 1).
    #[must_use]
    pub fn new(processor: P, max_in_flight: usize) -> Self {
        Self {
            shared: Arc::new(Shared::default()),
            processor: Arc::new(processor),
            max_in_flight: max_in_flight.max(1),
        }
    }

    #[must_use]
    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight
    }

    #[must_use]
    pub fn processor(&self) -> &P {
        &self.processor
    }

    /// Admits `frame`, waiting for a free slot first.
    ///
    /// # Errors
    /// Returns `Spawn` if the task thread cannot be started; the slot is
    /// released before returning.
    pub fn submit(&self, frame: Frame) -> Result<TaskHandle> {
        let seq = {
            let mut state = self.shared.state.lock();
            while state.stats.in_flight >= self.max_in_flight {
                self.shared.slot_freed.wait(&mut state);
            }
            state.admit()
        };
        self.launch(frame, seq)
    }

    /// Admits `frame` only if a slot is free right now.
    ///
    /// # Errors
    /// Returns `Spawn` if the task thread cannot be started.
    pub fn try_submit(&self, frame: Frame) -> Result<Admission> {
        let seq = {
            let mut state = self.shared.state.lock();
            if state.stats.in_flight >= self.max_in_flight {
                return Ok(Admission::Blocked(frame));
            }
            state.admit()
        };
        self.launch(frame, seq).map(Admission::Admitted)
    }

    fn launch(&self, frame: Frame, seq: u64) -> Result<TaskHandle> {
        let handle = TaskHandle {
            seq,
            tag: frame.tag,
        };
        let mut guard = SlotGuard {
            shared: Arc::clone(&self.shared),
            outcome: Outcome::Failed,
        };
        let processor = Arc::clone(&self.processor);

        // A failed spawn drops the closure, and the guard with it.
        thread::Builder::new()
            .name(format!("rustsfx-event-{seq}"))
            .spawn(move || {
                let tag = frame.tag;
                let result =
                    panic::catch_unwind(AssertUnwindSafe(|| processor.process(frame, seq)));
                guard.outcome = match result {
                    Ok(Ok(())) => Outcome::Completed,
                    Ok(Err(e)) => {
                        warn!("Event task for tag {tag} failed: {e}");
                        Outcome::Failed
                    }
                    Err(_) => {
                        error!("Event task for tag {tag} panicked");
                        Outcome::Panicked
                    }
                };
                drop(guard);
            })
            .map_err(Error::Spawn)?;

        debug!("Admitted tag {} as task {seq}", handle.tag);
        Ok(handle)
    }

    /// Blocks until no task is in flight.
    pub fn drain(&self) {
        let mut state = self.shared.state.lock();
        while state.stats.in_flight > 0 {
            self.shared.slot_freed.wait(&mut state);
        }
    }

    #[must_use]
    pub fn in_flight(&self) -> usize {
        self.shared.state.lock().stats.in_flight
    }

    #[must_use]
    pub fn stats(&self) -> DispatcherStats {
        self.shared.state.lock().stats
    }
}

impl<P> Drop for EventDispatcher<P> {
    fn drop(&mut self) {
        let mut state = self.shared.state.lock();
        while state.stats.in_flight > 0 {
            self.shared.slot_freed.wait(&mut state);
        }
    }
}
