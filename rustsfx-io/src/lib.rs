//! rustsfx-io: File sources and sinks for rustsfx.
//!
//! This crate provides a memory-mapped raw frame source, flat calibration
//! map readers and the directory sink that persists status, event log and
//! run summary. HDF5 output is available behind the `hdf5` feature.
//!

mod error;
#[cfg(feature = "hdf5")]
pub mod hdf5;
mod reader;
mod writer;

pub use error::{Error, Result};
#[cfg(feature = "hdf5")]
pub use hdf5::{Hdf5Sink, Hdf5WriteOptions};
pub use reader::{
    read_f32_map, read_mask_map, MappedFileReader, RawFrameFile, RawFrameHeader, RAW_HEADER_LEN,
    RAW_MAGIC,
};
pub use writer::{EventLog, FileSink, RawFrameWriter, StatusFile, EVENT_LOG_HEADER};
