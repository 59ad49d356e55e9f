//! Error type for the shard writer.

use std::path::{Path, PathBuf};

use thiserror::Error;

use crate::codec::CodecError;
use crate::config::ConfigError;
use crate::upload::UploadError;

/// Errors raised while writing a dataset.
#[derive(Debug, Error)]
pub enum WriteError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// The output directory has files in it and `exist_ok` is off.
    #[error("Output directory {} is not empty", .0.display())]
    LocalDirNotEmpty(PathBuf),

    /// A sample does not fit the encoder's schema.
    #[error("Invalid sample: {0}")]
    InvalidSample(String),

    /// A shard cannot be represented in its format.
    #[error("Failed to encode shard {shard}: {reason}")]
    Encode { shard: usize, reason: String },

    /// The index or a shard descriptor is inconsistent.
    #[error("Invalid index: {0}")]
    InvalidIndex(String),

    #[error("Compression failed: {0}")]
    Codec(#[from] CodecError),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("I/O error at {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// An upload failed for good. Reported in place of any cancellations it
    /// caused.
    #[error(transparent)]
    Upload(#[from] UploadError),

    /// Work was abandoned after the writer was cancelled.
    #[error("Write cancelled: {shards} shard(s) skipped, {uploads} upload(s) not started")]
    Cancelled { shards: usize, uploads: usize },
}

impl WriteError {
    pub(crate) fn io(path: &Path, source: std::io::Error) -> Self {
        Self::Io {
            path: path.to_path_buf(),
            source,
        }
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled { .. })
    }
}
