//! rustsfx-pipeline: Concurrency core of the rustsfx hit finder.
//!
//! This crate moves frames from a [`FrameSource`] to a [`Sink`]:
//! - **Synchronisation** - per-panel producers assembled by tag
//! - **Dispatch** - a bounded pool of in-flight event tasks
//! - **Processing** - the per-event stages run inside each task
//!

pub mod dispatcher;
mod error;
mod pipeline;
pub mod sink;
pub mod source;
pub mod sync;
mod worker;

pub use dispatcher::{Admission, DispatcherStats, EventDispatcher, EventProcessor, TaskHandle};
pub use error::{Error, Result};
pub use pipeline::{Pipeline, RunReport};
pub use sink::{MemorySink, MultiSink, Sink};
pub use source::{FrameSource, MemorySource, PanelRead};
pub use sync::{SequentialReader, SyncReport, TagPlan, TagSynchronizer};
pub use worker::ShotProcessor;
