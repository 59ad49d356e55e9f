//! Error types for the shard file lifecycle.

use std::path::{Path, PathBuf};

use thiserror::Error;

use super::locality::PhaseKind;
use crate::codec::CodecError;
use crate::hash::HashAlgo;
use crate::storage::StorageError;

/// Errors raised while validating, loading or evicting shard files.
///
/// Every size or digest check is fatal: a mismatching file is never kept,
/// repaired or retried.
#[derive(Debug, Error)]
pub enum ShardError {
    /// A phase's bytes do not have the declared length.
    #[error("{phase} phase of '{file}' is {actual} bytes, expected {expected}")]
    SizeMismatch {
        file: String,
        phase: PhaseKind,
        expected: u64,
        actual: u64,
    },

    /// A phase's bytes do not have the declared digest.
    #[error("{phase} phase of '{file}' has {algo} {actual}, expected {expected}")]
    HashMismatch {
        file: String,
        phase: PhaseKind,
        algo: HashAlgo,
        expected: String,
        actual: String,
    },

    /// The file to download is larger than the stream allows.
    #[error("'{file}' is {size} bytes, over the download limit of {limit} bytes")]
    SizeLimitExceeded { file: String, size: u64, limit: u64 },

    /// The remote object is missing or arrived incomplete.
    #[error("Failed to fetch '{file}': {source}")]
    RemoteFetch {
        file: String,
        #[source]
        source: StorageError,
    },

    /// Decompression or canonicalization failed.
    #[error("Codec failure on '{file}': {source}")]
    Codec {
        file: String,
        #[source]
        source: CodecError,
    },

    /// A shard loaded on demand cannot fit in the configured cache limit.
    #[error("Shard needs {needed} bytes but the cache limit is {limit} bytes")]
    CacheLimitTooSmall { needed: u64, limit: u64 },

    /// The caller or metadata broke a lifecycle invariant.
    #[error("Internal error: {0}")]
    InternalConsistency(String),

    /// Local filesystem failure.
    #[error("I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl ShardError {
    pub(crate) fn io(path: &Path, source: std::io::Error) -> Self {
        Self::Io {
            path: path.to_path_buf(),
            source,
        }
    }

    /// Whether this is a size, digest or limit validation failure.
    pub fn is_validation(&self) -> bool {
        matches!(
            self,
            Self::SizeMismatch { .. } | Self::HashMismatch { .. } | Self::SizeLimitExceeded { .. }
        )
    }
}

/// Result alias for shard operations.
pub type ShardResult<T> = Result<T, ShardError>;
