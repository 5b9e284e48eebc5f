//! I/O error types.

use thiserror::Error;

/// Result type for I/O operations.
pub type Result<T> = std::result::Result<T, Error>;

/// I/O error types.
#[derive(Error, Debug)]
pub enum Error {
    /// File I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Memory mapping error.
    #[error("memory mapping error: {0}")]
    MmapError(String),

    /// Invalid file format.
    #[error("invalid file format: {0}")]
    InvalidFormat(String),

    /// Core library error.
    #[error("core error: {0}")]
    CoreError(#[from] rustsfx_core::Error),

    /// JSON serialisation error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// HDF5 library error.
    #[cfg(feature = "hdf5")]
    #[error("HDF5 error: {0}")]
    Hdf5(#[from] hdf5::Error),
}

impl Error {
    /// Reports this error as a failed source read.
    #[must_use]
    pub fn into_source(self) -> rustsfx_pipeline::Error {
        rustsfx_pipeline::Error::Source(self.to_string())
    }

    /// Reports this error as a failed sink write.
    #[must_use]
    pub fn into_sink(self) -> rustsfx_pipeline::Error {
        rustsfx_pipeline::Error::Sink(self.to_string())
    }
}
