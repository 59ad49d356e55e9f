//! Directory-backed object store.

use std::fs;
use std::io::ErrorKind;
use std::path::{Component, Path, PathBuf};

use tracing::trace;

use super::{ObjectStore, StorageError};

/// Object store rooted at a local (or network-mounted) directory.
///
/// Keys are relative paths below `root`; absolute keys and `..` components
/// are rejected.
#[derive(Debug, Clone)]
pub struct LocalDirStore {
    root: PathBuf,
}

impl LocalDirStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn object_path(&self, key: &str) -> Result<PathBuf, StorageError> {
        let rel = Path::new(key);
        let clean = rel
            .components()
            .all(|c| matches!(c, Component::Normal(_) | Component::CurDir));
        if key.is_empty() || !clean {
            return Err(StorageError::InvalidKey(key.to_string()));
        }
        Ok(self.root.join(rel))
    }
}

fn ensure_parent(path: &Path) -> Result<(), StorageError> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(|e| StorageError::io(parent, e))?;
    }
    Ok(())
}

impl ObjectStore for LocalDirStore {
    fn exists(&self, key: &str) -> Result<bool, StorageError> {
        Ok(self.object_path(key)?.is_file())
    }

    fn download(&self, key: &str, local: &Path) -> Result<u64, StorageError> {
        let src = self.object_path(key)?;
        ensure_parent(local)?;
        match fs::copy(&src, local) {
            Ok(bytes) => {
                trace!(key, bytes, "Downloaded object");
                Ok(bytes)
            }
            Err(e) if e.kind() == ErrorKind::NotFound && !src.exists() => {
                Err(StorageError::NotFound(key.to_string()))
            }
            Err(e) => Err(StorageError::io(local, e)),
        }
    }

    fn upload(&self, local: &Path, key: &str) -> Result<(), StorageError> {
        let dst = self.object_path(key)?;
        ensure_parent(&dst)?;
        fs::copy(local, &dst).map_err(|e| StorageError::io(local, e))?;
        trace!(key, "Uploaded object");
        Ok(())
    }

    fn name(&self) -> &str {
        "local"
    }
}
