//! Multi-producer frame assembly.
//!
//! One producer thread per panel reads its panel for every tag of the run.
//! Panel 0 is the primary: it alone allocates entries in the pending table.
//! The consumer, running on the caller's thread, drains the table in
//! increasing tag order and hands complete frames on.
//!
//! The table holds at most `lateness_window + 1` entries. Once it is full
//! and the oldest entry is still waiting for a panel, that entry is evicted
//! as stale so that one stuck producer cannot hold up the run.

use crate::source::{FrameSource, PanelRead};
use crate::{Error, Result};
use log::{debug, info, warn};
use parking_lot::{Condvar, Mutex};
use rustsfx_core::{DetectorLayout, Frame, PipelineConfig};
use std::collections::HashMap;
use std::thread;
use std::time::Duration;

/// Tags a run covers: `first, first + stride, ..` up to `last` inclusive.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TagPlan {
    pub first: u64,
    pub last: u64,
    pub stride: u64,
}

impl TagPlan {
    /// # Errors
    /// Returns `CoreError` for a zero stride or `last < first`.
    pub fn new(first: u64, last: u64, stride: u64) -> Result<Self> {
        if stride == 0 {
            return Err(
                rustsfx_core::Error::ConfigError("tag stride must be at least 1".into()).into(),
            );
        }
        if last < first {
            return Err(rustsfx_core::Error::ConfigError(format!(
                "empty tag range {first}..={last}"
            ))
            .into());
        }
        Ok(Self {
            first,
            last,
            stride,
        })
    }

    /// Number of tags in the plan; never zero.
    #[must_use]
    pub fn tag_count(&self) -> u64 {
        (self.last - self.first) / self.stride + 1
    }

    /// Tag following `tag`, if still inside the plan.
    #[must_use]
    pub fn after(&self, tag: u64) -> Option<u64> {
        tag.checked_add(self.stride).filter(|t| *t <= self.last)
    }

    pub fn tags(&self) -> impl Iterator<Item = u64> {
        let plan = *self;
        std::iter::successors(Some(plan.first), move |t| plan.after(*t))
    }
}

/// Counters describing how the tags of a run were resolved.
///
/// `delivered + errored + stale` equals the number of tags drained.
/// `starved` counts producer contributions abandoned after the retry
/// budget; those entries are drained as errored or stale.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SyncReport {
    pub delivered: u64,
    pub errored: u64,
    pub stale: u64,
    pub starved: u64,
    /// Panels that arrived after their entry had been drained.
    pub late_panels: u64,
}

impl SyncReport {
    #[must_use]
    pub fn resolved(&self) -> u64 {
        self.delivered + self.errored + self.stale
    }
}

#[derive(Debug)]
struct PanelBuffer {
    panels: Vec<Option<Vec<f32>>>,
    error: bool,
    run_id: u32,
}

impl PanelBuffer {
    fn new(n_panels: usize) -> Self {
        Self {
            panels: vec![None; n_panels],
            error: false,
            run_id: 0,
        }
    }

    fn is_complete(&self) -> bool {
        self.panels.iter().all(Option::is_some)
    }

    fn into_frame(self, tag: u64, layout: DetectorLayout) -> Result<Frame> {
        let pixels: Vec<f32> = self.panels.into_iter().flatten().flatten().collect();
        Ok(Frame::from_pixels(tag, layout, pixels)?.with_run_id(self.run_id))
    }
}

#[derive(Debug, Default)]
struct SyncState {
    pending: HashMap<u64, PanelBuffer>,
    /// Next tag each producer will attempt.
    next_tag: Vec<u64>,
    finished: Vec<bool>,
    /// Every tag below this has been drained.
    drained_below: u64,
    primary_blocked: bool,
    aborted: bool,
    report: SyncReport,
}

impl SyncState {
    fn attempted_by_all(&self, tag: u64) -> bool {
        self.next_tag
            .iter()
            .zip(&self.finished)
            .all(|(next, done)| *done || *next > tag)
    }
}

enum Slot {
    Ready,
    Gone,
    Starved,
    Aborted,
}

enum Resolution {
    Attempted,
    Overrun,
}

/// Assembles frames from concurrent per-panel producers.
pub struct TagSynchronizer {
    layout: DetectorLayout,
    plan: TagPlan,
    lateness_window: u64,
    retry_budget: u32,
    retry_sleep: Duration,
    state: Mutex<SyncState>,
    changed: Condvar,
}

impl TagSynchronizer {
    #[must_use]
    pub fn new(layout: DetectorLayout, plan: TagPlan, config: &PipelineConfig) -> Self {
        Self {
            layout,
            plan,
            lateness_window: config.lateness_window.max(1),
            retry_budget: config.retry_budget,
            retry_sleep: Duration::from_millis(config.retry_sleep_ms.max(1)),
            state: Mutex::new(SyncState::default()),
            changed: Condvar::new(),
        }
    }

    #[must_use]
    pub fn plan(&self) -> TagPlan {
        self.plan
    }

    /// Entries currently waiting in the table.
    #[must_use]
    pub fn pending_len(&self) -> usize {
        self.state.lock().pending.len()
    }

    /// Runs one producer per panel and drains the table into `deliver`.
    ///
    /// Returns once every tag of the plan has been resolved and every
    /// producer has exited.
    ///
    /// # Errors
    /// Returns `FirstFrame` if the first tag cannot be assembled,
    /// `Consistency` if an attempted tag has no entry, `Spawn` if a producer
    /// cannot start, and any error returned by `deliver`.
    pub fn run<S, F>(&self, source: &S, deliver: F) -> Result<SyncReport>
    where
        S: FrameSource + ?Sized,
        F: FnMut(Frame) -> Result<()>,
    {
        *self.state.lock() = SyncState {
            next_tag: vec![self.plan.first; self.layout.n_panels],
            finished: vec![false; self.layout.n_panels],
            drained_below: self.plan.first,
            ..SyncState::default()
        };

        let result = thread::scope(|scope| {
            let mut producers = Vec::with_capacity(self.layout.n_panels);
            let mut result = Ok(());
            // Primary starts last.
            for panel in (0..self.layout.n_panels).rev() {
                let spawned = thread::Builder::new()
                    .name(format!("rustsfx-panel-{panel}"))
                    .spawn_scoped(scope, move || self.produce(source, panel));
                match spawned {
                    Ok(handle) => producers.push(handle),
                    Err(e) => {
                        result = Err(Error::Spawn(e));
                        break;
                    }
                }
            }
            if result.is_ok() {
                result = self.consume(deliver);
            }
            if result.is_err() {
                // Producers still running exit on the abort flag.
                self.abort();
            }
            for handle in producers {
                let panel = handle.thread().name().unwrap_or("producer").to_string();
                if handle.join().is_err() {
                    warn!("Producer {panel} panicked");
                }
            }
            result
        });

        let report = self.state.lock().report;
        info!(
            "Tag sync finished: {} delivered, {} errored, {} stale, {} starved",
            report.delivered, report.errored, report.stale, report.starved
        );
        result.map(|()| report)
    }

    fn abort(&self) {
        self.state.lock().aborted = true;
        self.changed.notify_all();
    }

    fn produce<S: FrameSource + ?Sized>(&self, source: &S, panel: usize) {
        let _finished = FinishGuard { sync: self, panel };
        let primary = panel == 0;
        let mut next = Some(self.plan.first);

        while let Some(tag) = next {
            next = self.plan.after(tag);
            let slot = if primary {
                self.allocate(tag)
            } else {
                self.await_entry(panel, tag)
            };
            match slot {
                Slot::Ready => {}
                Slot::Aborted => return,
                Slot::Gone => {
                    debug!("Panel {panel} skipping tag {tag}: already drained");
                    self.advance(panel, tag);
                    continue;
                }
                Slot::Starved => {
                    warn!("Panel {panel} starved waiting for tag {tag}; giving up on it");
                    self.advance(panel, tag);
                    continue;
                }
            }

            // No lock is held while the source is read.
            let read = source.next_panel_tag(panel, tag);
            self.store(panel, tag, read);
        }
    }

    fn allocate(&self, tag: u64) -> Slot {
        let mut state = self.state.lock();
        loop {
            if state.aborted {
                return Slot::Aborted;
            }
            if state.pending.len() as u64 <= self.lateness_window {
                break;
            }
            state.primary_blocked = true;
            self.changed.wait(&mut state);
        }
        state.primary_blocked = false;
        let n_panels = self.layout.n_panels;
        state
            .pending
            .entry(tag)
            .or_insert_with(|| PanelBuffer::new(n_panels));
        drop(state);
        self.changed.notify_all();
        Slot::Ready
    }

    fn await_entry(&self, panel: usize, tag: u64) -> Slot {
        let mut retries = 0;
        let mut state = self.state.lock();
        loop {
            if state.aborted {
                return Slot::Aborted;
            }
            if tag < state.drained_below {
                return Slot::Gone;
            }
            if state.pending.contains_key(&tag) {
                return Slot::Ready;
            }
            let timed_out = self
                .changed
                .wait_for(&mut state, self.retry_sleep)
                .timed_out();
            // Waiting on a full table is backpressure, not starvation.
            if timed_out && !state.primary_blocked {
                retries += 1;
                if retries > self.retry_budget {
                    state.report.starved += 1;
                    debug!("Panel {panel} used {retries} retries on tag {tag}");
                    return Slot::Starved;
                }
            }
        }
    }

    fn store(&self, panel: usize, tag: u64, read: Result<PanelRead>) {
        let panel_len = self.layout.panel_len();
        let mut state = self.state.lock();
        match state.pending.get_mut(&tag) {
            None => {
                state.report.late_panels += 1;
                debug!("Panel {panel} for tag {tag} arrived after the entry was drained");
            }
            Some(entry) => match read {
                Ok(read) if read.tag != tag => {
                    entry.error = true;
                    warn!(
                        "Panel {panel} returned tag {} while tag {tag} was requested",
                        read.tag
                    );
                }
                Ok(read) if read.pixels.len() != panel_len => {
                    entry.error = true;
                    warn!(
                        "Panel {panel} at tag {tag} has {} samples, expected {panel_len}",
                        read.pixels.len()
                    );
                }
                Ok(read) => {
                    if panel == 0 {
                        entry.run_id = read.run_id;
                    }
                    entry.panels[panel] = Some(read.pixels);
                }
                Err(e) => {
                    entry.error = true;
                    warn!("Fetch failed for panel {panel} at tag {tag}: {e}");
                }
            },
        }
        state.next_tag[panel] = tag.saturating_add(self.plan.stride);
        drop(state);
        self.changed.notify_all();
    }

    fn advance(&self, panel: usize, tag: u64) {
        self.state.lock().next_tag[panel] = tag.saturating_add(self.plan.stride);
        self.changed.notify_all();
    }

    fn consume<F>(&self, mut deliver: F) -> Result<()>
    where
        F: FnMut(Frame) -> Result<()>,
    {
        let bound = self.lateness_window.saturating_mul(self.plan.stride);

        for wanted in self.plan.tags() {
            let (entry, resolution) = {
                let mut state = self.state.lock();
                let resolution = loop {
                    if state.attempted_by_all(wanted) {
                        break Resolution::Attempted;
                    }
                    if state.next_tag[0] > wanted.saturating_add(bound) {
                        break Resolution::Overrun;
                    }
                    self.changed.wait(&mut state);
                };
                let entry = state.pending.remove(&wanted);
                state.drained_below = wanted.saturating_add(self.plan.stride);
                (entry, resolution)
            };
            self.changed.notify_all();

            let Some(entry) = entry else {
                return Err(Error::Consistency(format!(
                    "tag {wanted} was attempted by every panel but has no entry"
                )));
            };

            let failure = if entry.error {
                warn!("Skipping tag {wanted}: panel read failed");
                self.state.lock().report.errored += 1;
                Some("panel read failed")
            } else if !entry.is_complete() {
                let missing = entry.panels.iter().filter(|p| p.is_none()).count();
                let mut state = self.state.lock();
                if matches!(resolution, Resolution::Overrun) {
                    state.report.stale += 1;
                    warn!("Evicting stale tag {wanted}: {missing} panel(s) still outstanding");
                } else {
                    state.report.errored += 1;
                    warn!("Skipping tag {wanted}: {missing} panel(s) missing");
                }
                Some("panels missing")
            } else {
                None
            };

            if let Some(reason) = failure {
                if wanted == self.plan.first {
                    return Err(Error::FirstFrame(format!("tag {wanted}: {reason}")));
                }
                continue;
            }

            deliver(entry.into_frame(wanted, self.layout)?)?;
            self.state.lock().report.delivered += 1;
        }
        Ok(())
    }
}

/// Marks a producer finished however it exits.
struct FinishGuard<'a> {
    sync: &'a TagSynchronizer,
    panel: usize,
}

impl Drop for FinishGuard<'_> {
    fn drop(&mut self) {
        self.sync.state.lock().finished[self.panel] = true;
        self.sync.changed.notify_all();
    }
}

/// Single-producer mode: reads every panel of a tag on the calling thread.
#[derive(Debug, Clone, Copy)]
pub struct SequentialReader {
    layout: DetectorLayout,
    plan: TagPlan,
}

impl SequentialReader {
    #[must_use]
    pub fn new(layout: DetectorLayout, plan: TagPlan) -> Self {
        Self { layout, plan }
    }

    /// Reads the plan tag by tag, skipping a tag if any panel fails.
    ///
    /// # Errors
    /// Returns `FirstFrame` if the first tag cannot be read, and any error
    /// returned by `deliver`.
    pub fn run<S, F>(&self, source: &S, mut deliver: F) -> Result<SyncReport>
    where
        S: FrameSource + ?Sized,
        F: FnMut(Frame) -> Result<()>,
    {
        let mut report = SyncReport::default();
        for tag in self.plan.tags() {
            match self.read_tag(source, tag) {
                Ok(frame) => {
                    deliver(frame)?;
                    report.delivered += 1;
                }
                Err(e) if tag == self.plan.first => {
                    return Err(Error::FirstFrame(format!("tag {tag}: {e}")));
                }
                Err(e) => {
                    warn!("Skipping tag {tag}: {e}");
                    report.errored += 1;
                }
            }
        }
        Ok(report)
    }

    fn read_tag<S: FrameSource + ?Sized>(&self, source: &S, tag: u64) -> Result<Frame> {
        let mut pixels = Vec::with_capacity(self.layout.len());
        let mut run_id = 0;
        for panel in 0..self.layout.n_panels {
            let read = source.next_panel_tag(panel, tag)?;
            if read.tag != tag {
                return Err(Error::source(
                    panel,
                    tag,
                    format!("source returned tag {}", read.tag),
                ));
            }
            if panel == 0 {
                run_id = read.run_id;
            }
            pixels.extend_from_slice(&read.pixels);
        }
        Ok(Frame::from_pixels(tag, self.layout, pixels)?.with_run_id(run_id))
    }
}
