//! Named shared memory segments.
//!
//! A segment is created once, with its full contents, by one process and
//! attached read-only by any number of others. [`FileShm`] backs segments
//! with files under a shared directory (`/dev/shm` on Linux) mapped into
//! memory, so every process on the machine sees the same bytes.

use std::fmt;
use std::fs::{self, File, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use memmap2::{Mmap, MmapOptions};
use thiserror::Error;
use tracing::{debug, warn};

/// Errors from shared memory operations.
#[derive(Debug, Error)]
pub enum ShmError {
    /// Another process already created a segment with this name.
    #[error("Shared memory segment '{0}' already exists")]
    AlreadyExists(String),

    /// No segment with this name exists.
    #[error("Shared memory segment '{0}' does not exist")]
    NotFound(String),

    /// Segment names must be plain file names.
    #[error("Invalid shared memory segment name '{0}'")]
    InvalidName(String),

    #[error("Shared memory I/O error on '{name}': {source}")]
    Io {
        name: String,
        #[source]
        source: std::io::Error,
    },
}

impl ShmError {
    fn io(name: &str, source: std::io::Error) -> Self {
        match source.kind() {
            ErrorKind::AlreadyExists => Self::AlreadyExists(name.to_string()),
            ErrorKind::NotFound => Self::NotFound(name.to_string()),
            _ => Self::Io {
                name: name.to_string(),
                source,
            },
        }
    }
}

/// An attached segment. Dropping it detaches; dropping the creator's handle
/// also removes the segment.
pub trait ShmSegment: Send + Sync + fmt::Debug {
    fn name(&self) -> &str;

    fn as_bytes(&self) -> &[u8];
}

/// A namespace of shared memory segments.
pub trait SharedMemory: Send + Sync {
    /// Create a segment holding `contents`.
    ///
    /// Creation is atomic: other processes either fail to attach or see the
    /// full contents. Fails with [`ShmError::AlreadyExists`] when the name is
    /// taken, including when another process wins a concurrent create.
    fn create(&self, name: &str, contents: &[u8]) -> Result<Box<dyn ShmSegment>, ShmError>;

    /// Attach to an existing segment, failing with [`ShmError::NotFound`].
    fn attach(&self, name: &str) -> Result<Box<dyn ShmSegment>, ShmError>;
}

/// Distinguishes staging files of concurrent creators within one process.
static STAGING_SEQ: AtomicU64 = AtomicU64::new(0);

/// File-backed shared memory rooted at a directory.
#[derive(Debug, Clone)]
pub struct FileShm {
    root: PathBuf,
}

impl FileShm {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// `/dev/shm` when available, else the system temp directory.
    pub fn default_root() -> PathBuf {
        let dev_shm = Path::new("/dev/shm");
        if dev_shm.is_dir() {
            dev_shm.to_path_buf()
        } else {
            std::env::temp_dir()
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn segment_path(&self, name: &str) -> Result<PathBuf, ShmError> {
        let valid = !name.is_empty()
            && name != "."
            && name != ".."
            && !name.contains(['/', '\\', '\0']);
        if !valid {
            return Err(ShmError::InvalidName(name.to_string()));
        }
        Ok(self.root.join(name))
    }
}

impl Default for FileShm {
    fn default() -> Self {
        Self::new(Self::default_root())
    }
}

impl SharedMemory for FileShm {
    fn create(&self, name: &str, contents: &[u8]) -> Result<Box<dyn ShmSegment>, ShmError> {
        let path = self.segment_path(name)?;
        let staging = self.root.join(format!(
            ".{}.{}.{}",
            name,
            std::process::id(),
            STAGING_SEQ.fetch_add(1, Ordering::Relaxed)
        ));

        let file = write_staging(&staging, contents).map_err(|e| {
            remove_quietly(&staging);
            ShmError::io(name, e)
        })?;

        // Publishing by hard link fails if the name is taken, so a segment is
        // never visible half-written and concurrent creators cannot both win.
        let linked = fs::hard_link(&staging, &path);
        remove_quietly(&staging);
        linked.map_err(|e| ShmError::io(name, e))?;

        let map = map_file(&file).map_err(|e| {
            remove_quietly(&path);
            ShmError::io(name, e)
        })?;
        debug!(name, path = %path.display(), bytes = contents.len(), "Created shared memory segment");

        Ok(Box::new(FileSegment {
            name: name.to_string(),
            path,
            map,
            owner: true,
        }))
    }

    fn attach(&self, name: &str) -> Result<Box<dyn ShmSegment>, ShmError> {
        let path = self.segment_path(name)?;
        let file = File::open(&path).map_err(|e| ShmError::io(name, e))?;
        let map = map_file(&file).map_err(|e| ShmError::io(name, e))?;
        Ok(Box::new(FileSegment {
            name: name.to_string(),
            path,
            map,
            owner: false,
        }))
    }
}

fn write_staging(path: &Path, contents: &[u8]) -> std::io::Result<File> {
    let mut file = OpenOptions::new()
        .read(true)
        .write(true)
        .create_new(true)
        .open(path)?;
    file.write_all(contents)?;
    file.sync_all()?;
    Ok(file)
}

fn map_file(file: &File) -> std::io::Result<Mmap> {
    // SAFETY: segments are never modified after creation and are only
    // unlinked, never truncated, so the mapping stays valid for its lifetime.
    unsafe { MmapOptions::new().map(file) }
}

fn remove_quietly(path: &Path) {
    if let Err(e) = fs::remove_file(path) {
        if e.kind() != ErrorKind::NotFound {
            warn!(path = %path.display(), error = %e, "Failed to remove shared memory file");
        }
    }
}

struct FileSegment {
    name: String,
    path: PathBuf,
    map: Mmap,
    owner: bool,
}

impl ShmSegment for FileSegment {
    fn name(&self) -> &str {
        &self.name
    }

    fn as_bytes(&self) -> &[u8] {
        &self.map
    }
}

impl fmt::Debug for FileSegment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FileSegment")
            .field("name", &self.name)
            .field("len", &self.map.len())
            .field("owner", &self.owner)
            .finish()
    }
}

impl Drop for FileSegment {
    fn drop(&mut self) {
        if self.owner {
            debug!(name = %self.name, "Removing shared memory segment");
            remove_quietly(&self.path);
        }
    }
}
