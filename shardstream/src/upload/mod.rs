//! Asynchronous shard uploads with bounded concurrency, retry and
//! fail-fast cancellation.

mod limiter;
mod pool;

pub use limiter::{ConcurrencyLimiter, ConcurrencyPermit};
pub use pool::{UploadJob, UploadOutcome, UploadPool, UploadSummary, DEFAULT_RETRY_BACKOFF};

use std::path::PathBuf;

use thiserror::Error;

use crate::storage::StorageError;

/// Terminal failure of an upload pool.
#[derive(Debug, Error)]
pub enum UploadError {
    /// Every attempt at one upload failed.
    #[error("Upload of {} to '{key}' failed after {attempts} attempt(s): {source}", .local.display())]
    Failed {
        local: PathBuf,
        key: String,
        attempts: u32,
        #[source]
        source: StorageError,
    },

    /// An upload task panicked or was aborted.
    #[error("Upload task failed: {0}")]
    Task(String),
}
