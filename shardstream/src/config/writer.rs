//! Shard writer configuration.

use std::path::{Path, PathBuf};
use std::thread;

use super::ConfigError;
use crate::codec::Compression;
use crate::hash::HashAlgo;

/// Default uncompressed shard size limit (64 MiB).
pub const DEFAULT_SIZE_LIMIT: u64 = 1 << 26;

/// Default number of retries per failed upload.
pub const DEFAULT_RETRY: u32 = 2;

/// Upper bound on the default upload worker count.
const MAX_DEFAULT_WORKERS: usize = 32;

/// Settings for a [`ShardWriter`](crate::writer::ShardWriter).
///
/// # Example
///
/// ```
/// use shardstream::config::WriterConfig;
///
/// let config = WriterConfig::new("/tmp/out")
///     .with_remote("train")
///     .with_compression(Some("gz:6".parse().unwrap()))
///     .with_max_workers(4);
/// assert_eq!(config.max_workers(), 4);
/// assert!(config.validate().is_ok());
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WriterConfig {
    /// Directory shards are written to before upload
    local: PathBuf,
    /// Remote prefix, `None` to write locally only
    remote: Option<String>,
    /// Keep local copies after a successful upload
    keep_local: bool,
    /// Accept a local directory that already has files in it
    exist_ok: bool,
    /// Compression applied to every shard file
    compression: Option<Compression>,
    /// Digests recorded for every file
    hashes: Vec<HashAlgo>,
    /// Uncompressed shard size that triggers a flush, `None` for unbounded
    size_limit: Option<u64>,
    /// Upload workers running concurrently
    max_workers: usize,
    /// Retries per failed upload
    retry: u32,
}

impl WriterConfig {
    pub fn new(local: impl Into<PathBuf>) -> Self {
        Self {
            local: local.into(),
            remote: None,
            keep_local: false,
            exist_ok: false,
            compression: None,
            hashes: Vec::new(),
            size_limit: Some(DEFAULT_SIZE_LIMIT),
            max_workers: default_workers(),
            retry: DEFAULT_RETRY,
        }
    }

    pub fn with_remote(mut self, remote: impl Into<String>) -> Self {
        self.remote = Some(remote.into());
        self
    }

    /// Keep local files after upload. Ignored without a remote, where the
    /// local files are the dataset.
    pub fn with_keep_local(mut self, keep: bool) -> Self {
        self.keep_local = keep;
        self
    }

    pub fn with_exist_ok(mut self, exist_ok: bool) -> Self {
        self.exist_ok = exist_ok;
        self
    }

    pub fn with_compression(mut self, compression: Option<Compression>) -> Self {
        self.compression = compression;
        self
    }

    pub fn with_hashes(mut self, hashes: Vec<HashAlgo>) -> Self {
        self.hashes = hashes;
        self
    }

    pub fn with_size_limit(mut self, limit: Option<u64>) -> Self {
        self.size_limit = limit;
        self
    }

    pub fn with_max_workers(mut self, workers: usize) -> Self {
        self.max_workers = workers;
        self
    }

    pub fn with_retry(mut self, retry: u32) -> Self {
        self.retry = retry;
        self
    }

    pub fn local(&self) -> &Path {
        &self.local
    }

    pub fn remote(&self) -> Option<&str> {
        self.remote.as_deref()
    }

    /// Whether local files survive their upload.
    pub fn keep_local(&self) -> bool {
        self.keep_local || self.remote.is_none()
    }

    pub fn exist_ok(&self) -> bool {
        self.exist_ok
    }

    pub fn compression(&self) -> Option<&Compression> {
        self.compression.as_ref()
    }

    pub fn hashes(&self) -> &[HashAlgo] {
        &self.hashes
    }

    pub fn size_limit(&self) -> Option<u64> {
        self.size_limit
    }

    pub fn max_workers(&self) -> usize {
        self.max_workers
    }

    pub fn retry(&self) -> u32 {
        self.retry
    }

    /// Reject settings the writer cannot run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.size_limit == Some(0) {
            return Err(ConfigError::InvalidValue {
                key: "size_limit".to_string(),
                reason: "must be greater than zero".to_string(),
            });
        }
        if self.max_workers == 0 {
            return Err(ConfigError::InvalidValue {
                key: "max_workers".to_string(),
                reason: "must be at least 1".to_string(),
            });
        }
        let mut seen = self.hashes.clone();
        seen.sort();
        seen.dedup();
        if seen.len() != self.hashes.len() {
            return Err(ConfigError::InvalidValue {
                key: "hashes".to_string(),
                reason: "algorithms must be unique".to_string(),
            });
        }
        Ok(())
    }
}

fn default_workers() -> usize {
    thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
        .min(MAX_DEFAULT_WORKERS)
}
