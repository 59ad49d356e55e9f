//! One on-disk representation of a shard file.

use std::collections::HashSet;
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tracing::{debug, warn};

use super::error::{ShardError, ShardResult};
use super::locality::PhaseKind;
use crate::hash::ExpectedHash;
use crate::storage::StorageError;
use crate::stream::StreamContext;

/// Suffix of the temporary file a phase is written to before being renamed.
pub const TMP_SUFFIX: &str = ".tmp";

/// Declared metadata of one phase, as recorded in the dataset index.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PhaseMeta {
    /// Path relative to the stream root, `/`-separated
    pub basename: String,
    /// Expected size in bytes, if known before the phase is produced
    pub size: Option<u64>,
    /// Expected digest, if recorded
    pub hash: Option<ExpectedHash>,
}

impl PhaseMeta {
    pub fn new(basename: impl Into<String>, size: Option<u64>) -> Self {
        Self {
            basename: basename.into(),
            size,
            hash: None,
        }
    }

    pub fn with_hash(mut self, hash: ExpectedHash) -> Self {
        self.hash = Some(hash);
        self
    }
}

/// A phase of a shard file: expected size/digest plus its local path.
///
/// The on-disk file, when present, must match the declared size and digest.
/// Phases are only mutated through [`download`](Self::download),
/// [`write_atomic`](Self::write_atomic) and [`evict`](Self::evict).
#[derive(Debug, Clone)]
pub struct ShardFilePhase {
    ctx: Arc<StreamContext>,
    kind: PhaseKind,
    algo: Option<String>,
    meta: PhaseMeta,
}

impl ShardFilePhase {
    pub(crate) fn new(
        ctx: Arc<StreamContext>,
        kind: PhaseKind,
        algo: Option<String>,
        meta: PhaseMeta,
    ) -> Self {
        Self {
            ctx,
            kind,
            algo,
            meta,
        }
    }

    pub fn kind(&self) -> PhaseKind {
        self.kind
    }

    /// Algorithm that produces this phase from the previous one.
    pub fn algo(&self) -> Option<&str> {
        self.algo.as_deref()
    }

    pub fn basename(&self) -> &str {
        &self.meta.basename
    }

    pub fn size(&self) -> Option<u64> {
        self.meta.size
    }

    pub fn get_local_filename(&self) -> PathBuf {
        self.ctx.local_path(&self.meta.basename)
    }

    pub(crate) fn tmp_filename(&self) -> PathBuf {
        let mut name = self.get_local_filename().into_os_string();
        name.push(TMP_SUFFIX);
        PathBuf::from(name)
    }

    /// Whether the listing contains this phase. Does not touch the filesystem.
    pub fn probe(&self, listing: &HashSet<String>) -> bool {
        listing.contains(&self.meta.basename)
    }

    /// Whether the phase file exists on disk right now.
    pub fn is_local(&self) -> bool {
        self.get_local_filename().is_file()
    }

    /// Reconcile startup state against a directory listing.
    ///
    /// Removes a leftover temp file from an interrupted write, then returns the
    /// size of the phase file if present. A present file of the wrong size (or
    /// digest, when the stream validates hashes) is an error; nothing is ever
    /// downloaded here.
    pub fn init_dir(&self, listing: &HashSet<String>) -> ShardResult<i64> {
        let tmp_name = format!("{}{}", self.meta.basename, TMP_SUFFIX);
        if listing.contains(&tmp_name) {
            let tmp = self.tmp_filename();
            debug!(path = %tmp.display(), "Removing stale temp file");
            remove_if_present(&tmp)?;
        }

        if !self.probe(listing) {
            return Ok(0);
        }

        let path = self.get_local_filename();
        let actual = fs::metadata(&path)
            .map_err(|e| ShardError::io(&path, e))?
            .len();
        self.check_size(actual)?;
        if self.ctx.conf().validate_hash() {
            if let Some(expected) = &self.meta.hash {
                let digest = expected
                    .algo
                    .digest_file(&path)
                    .map_err(|e| ShardError::io(&path, e))?;
                self.check_hash(expected, digest)?;
            }
        }
        Ok(actual as i64)
    }

    /// Fail if this phase is larger than the stream's download limit.
    pub fn validate_for_download(&self) -> ShardResult<()> {
        if let (Some(limit), Some(size)) = (self.ctx.conf().download_max_size(), self.meta.size) {
            if size > limit {
                return Err(ShardError::SizeLimitExceeded {
                    file: self.meta.basename.clone(),
                    size,
                    limit,
                });
            }
        }
        Ok(())
    }

    /// Fetch this phase from remote storage, atomically.
    ///
    /// The object lands in a temp path, is checked against the declared size
    /// (and digest when the stream validates hashes), and only then renamed
    /// into place. Returns the disk usage added.
    pub fn download(&self) -> ShardResult<i64> {
        let key = self.ctx.remote_key(&self.meta.basename);
        let tmp = self.tmp_filename();
        debug!(key = %key, store = self.ctx.store().name(), "Downloading shard phase");

        let fetched = self
            .ctx
            .store()
            .download(&key, &tmp)
            .map_err(|source| ShardError::RemoteFetch {
                file: self.meta.basename.clone(),
                source,
            });

        let verified = fetched.and_then(|bytes| {
            if let Some(expected) = self.meta.size {
                if bytes != expected {
                    return Err(ShardError::RemoteFetch {
                        file: self.meta.basename.clone(),
                        source: StorageError::Transfer {
                            key: key.clone(),
                            message: format!("got {} bytes, expected {}", bytes, expected),
                        },
                    });
                }
            }
            if self.ctx.conf().validate_hash() {
                if let Some(expected) = &self.meta.hash {
                    let actual = expected
                        .algo
                        .digest_file(&tmp)
                        .map_err(|e| ShardError::io(&tmp, e))?;
                    self.check_hash(expected, actual)?;
                }
            }
            Ok(bytes)
        });

        match verified {
            Ok(bytes) => {
                self.commit(&tmp)?;
                Ok(bytes as i64)
            }
            Err(e) => {
                discard(&tmp);
                Err(e)
            }
        }
    }

    /// Verify `data` against this phase and write it atomically into place.
    pub fn write_atomic(&self, data: &[u8]) -> ShardResult<i64> {
        self.check_bytes(data)?;
        let tmp = self.tmp_filename();
        if let Some(parent) = tmp.parent() {
            fs::create_dir_all(parent).map_err(|e| ShardError::io(parent, e))?;
        }
        if let Err(e) = fs::write(&tmp, data) {
            discard(&tmp);
            return Err(ShardError::io(&tmp, e));
        }
        self.commit(&tmp)?;
        Ok(data.len() as i64)
    }

    /// Check in-memory bytes against the declared size and digest.
    pub fn check_bytes(&self, data: &[u8]) -> ShardResult<()> {
        self.check_size(data.len() as u64)?;
        if self.ctx.conf().validate_hash() {
            if let Some(expected) = &self.meta.hash {
                self.check_hash(expected, expected.algo.digest(data))?;
            }
        }
        Ok(())
    }

    pub(crate) fn check_size(&self, actual: u64) -> ShardResult<()> {
        match self.meta.size {
            Some(expected) if expected != actual => Err(ShardError::SizeMismatch {
                file: self.meta.basename.clone(),
                phase: self.kind,
                expected,
                actual,
            }),
            _ => Ok(()),
        }
    }

    fn check_hash(&self, expected: &ExpectedHash, actual: String) -> ShardResult<()> {
        if actual != expected.digest {
            return Err(ShardError::HashMismatch {
                file: self.meta.basename.clone(),
                phase: self.kind,
                algo: expected.algo,
                expected: expected.digest.clone(),
                actual,
            });
        }
        Ok(())
    }

    /// Rename a verified temp file onto the phase path.
    pub(crate) fn commit(&self, tmp: &Path) -> ShardResult<()> {
        let path = self.get_local_filename();
        fs::rename(tmp, &path).map_err(|e| {
            discard(tmp);
            ShardError::io(&path, e)
        })
    }

    /// Delete the phase file if present, returning the (negative) usage delta.
    pub fn evict(&self) -> ShardResult<i64> {
        let path = self.get_local_filename();
        let size = match fs::metadata(&path) {
            Ok(meta) => meta.len(),
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(0),
            Err(e) => return Err(ShardError::io(&path, e)),
        };
        if !remove_if_present(&path)? {
            return Ok(0);
        }
        debug!(path = %path.display(), bytes = size, "Evicted shard phase");
        Ok(-(size as i64))
    }
}

/// Remove a file, treating "already absent" as success.
fn remove_if_present(path: &Path) -> ShardResult<bool> {
    match fs::remove_file(path) {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
        Err(e) => Err(ShardError::io(path, e)),
    }
}

/// Best-effort cleanup of a temp file on an error path.
pub(crate) fn discard(tmp: &Path) {
    if let Err(e) = fs::remove_file(tmp) {
        if e.kind() != ErrorKind::NotFound {
            warn!(path = %tmp.display(), error = %e, "Failed to remove temp file");
        }
    }
}
