//! Object storage client abstraction.
//!
//! The shard lifecycle and the writer never talk to a concrete backend; they
//! go through [`ObjectStore`], which allows mock stores in tests and any
//! remote backend in production. [`LocalDirStore`] treats a directory as the
//! remote, which is what `file://`-style datasets and the test-suite use.

mod local;

pub use local::LocalDirStore;

use std::path::{Path, PathBuf};
use thiserror::Error;

/// Errors from object storage operations.
#[derive(Debug, Error)]
pub enum StorageError {
    /// The remote object does not exist.
    #[error("Remote object not found: {0}")]
    NotFound(String),

    /// The key cannot be mapped onto this store.
    #[error("Invalid object key '{0}'")]
    InvalidKey(String),

    /// Local filesystem failure during a transfer.
    #[error("Storage I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Backend-reported transfer failure.
    #[error("Transfer of '{key}' failed: {message}")]
    Transfer { key: String, message: String },
}

impl StorageError {
    pub(crate) fn io(path: &Path, source: std::io::Error) -> Self {
        Self::Io {
            path: path.to_path_buf(),
            source,
        }
    }
}

/// Trait for blocking object storage operations.
///
/// Implementations are called from blocking contexts: shard loads run on the
/// caller's thread and uploads run inside `spawn_blocking`. Retries belong to
/// the caller (the upload pool) or to the implementation itself; the shard
/// lifecycle never retries.
pub trait ObjectStore: Send + Sync {
    /// Whether an object exists under `key`.
    fn exists(&self, key: &str) -> Result<bool, StorageError>;

    /// Copy the object under `key` to `local`, returning the bytes written.
    ///
    /// Must fail with [`StorageError::NotFound`] when the object is missing.
    /// Callers pass a temporary `local` path and rename it themselves.
    fn download(&self, key: &str, local: &Path) -> Result<u64, StorageError>;

    /// Copy the local file at `local` to the object under `key`.
    fn upload(&self, local: &Path, key: &str) -> Result<(), StorageError>;

    /// Short backend name for logging.
    fn name(&self) -> &str;
}

/// Join a remote prefix and a relative object name with a single `/`.
pub fn join_key(prefix: Option<&str>, name: &str) -> String {
    match prefix.map(|p| p.trim_end_matches('/')) {
        Some(p) if !p.is_empty() => format!("{}/{}", p, name.trim_start_matches('/')),
        _ => name.trim_start_matches('/').to_string(),
    }
}
