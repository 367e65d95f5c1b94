//! Error taxonomy for the pipeline.
//!
//! Per-item failures stay per-item: a `DecodeError` or `ThumbError` for one
//! file is reported for that file and never tears down a worker thread.

use std::path::PathBuf;

use thiserror::Error;

/// Every decode strategy for a single image failed.
#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("could not decode {path:?}: all strategies failed (last: {last})")]
    AllStrategiesFailed { path: PathBuf, last: String },
}

/// Failure while producing or persisting a thumbnail.
#[derive(Debug, Error)]
pub enum ThumbError {
    #[error(transparent)]
    Decode(#[from] DecodeError),

    #[error("could not write thumbnail: {0}")]
    Write(#[from] std::io::Error),

    #[error("could not encode thumbnail: {0}")]
    Encode(#[from] image::ImageError),

    #[error(transparent)]
    Folder(#[from] FolderUnreadable),

    #[error("thumbnailing was cancelled")]
    Cancelled,
}

impl From<tempfile::PersistError> for ThumbError {
    fn from(e: tempfile::PersistError) -> Self {
        ThumbError::Write(e.error)
    }
}

/// A folder could not be enumerated (permissions, unmounted volume).
#[derive(Debug, Error)]
#[error("could not read folder {path:?}: {source}")]
pub struct FolderUnreadable {
    pub path: PathBuf,
    #[source]
    pub source: std::io::Error,
}
