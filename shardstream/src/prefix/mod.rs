//! Shared-resource prefix allocation.
//!
//! Every process of a job that streams the same datasets must agree on a
//! short namespace (`"000042"`) under which shared resources are created, and
//! concurrently running jobs on one machine must not share local cache
//! directories. Once at dataset open, each machine's local leader scans the
//! registration records of running jobs, rejects any overlap with its own
//! directories and publishes a record in the first free slot. After a
//! group-wide barrier the other ranks find that record by its contents, and a
//! second barrier keeps anyone from moving on before everyone has.
//!
//! ```text
//!   leader                         others
//!   ------                         ------
//!   scan slots, check overlap
//!   publish record
//!          \------- barrier -------/
//!                                  scan slots for our record
//!          /------- barrier -------\
//! ```

mod record;
mod rendezvous;
mod shm;
mod world;

pub use record::{pack_locals, unpack_locals, HEADER_LEN};
pub use rendezvous::{
    LocalRendezvous, Rendezvous, RendezvousError, TcpRendezvous, DEFAULT_CONNECT_TIMEOUT,
    DEFAULT_MASTER_ADDR, DEFAULT_MASTER_PORT,
};
pub use shm::{FileShm, SharedMemory, ShmError, ShmSegment};
pub use world::World;

use std::collections::BTreeSet;
use std::fmt;

use thiserror::Error;
use tracing::{debug, info};

/// Default bound on the slot scan.
pub const DEFAULT_MAX_SLOTS: usize = 1_000_000;

/// Errors raised while allocating a prefix.
#[derive(Debug, Error)]
pub enum PrefixError {
    /// The same directory was given twice by this group.
    #[error("Reused local directory: {0}. Provide a different one.")]
    DuplicateLocalDir(String),

    /// A directory cannot be stored in a registration record.
    #[error("Local directory {0:?} contains a NUL byte")]
    InvalidLocalDir(String),

    /// A running job already claims one of our directories.
    #[error(
        "Reused local directory: {ours:?} vs {theirs:?} (registered as {prefix}). \
         Provide a different one."
    )]
    LocalDirInUse {
        prefix: String,
        ours: Vec<String>,
        theirs: Vec<String>,
    },

    /// A registration record could not be decoded.
    #[error("Malformed registration record: {0}")]
    Record(String),

    /// Every slot up to the scan bound is taken.
    #[error("No free prefix slot among the first {0}")]
    SlotsExhausted(usize),

    /// The local leader did not register what its group expected.
    #[error("Internal error: {0}")]
    Internal(String),

    #[error(transparent)]
    Shm(#[from] ShmError),

    #[error(transparent)]
    Rendezvous(#[from] RendezvousError),
}

impl PrefixError {
    /// Whether the user can fix this by choosing other directories.
    pub fn is_configuration(&self) -> bool {
        matches!(
            self,
            Self::DuplicateLocalDir(_) | Self::InvalidLocalDir(_) | Self::LocalDirInUse { .. }
        )
    }
}

/// Shared memory name of a slot's registration record.
pub fn slot_name(prefix: &str) -> String {
    format!("{}_locals", prefix)
}

fn slot_prefix(slot: usize) -> String {
    format!("{:06}", slot)
}

/// An allocated prefix and the attached registration record backing it.
///
/// Keep this alive as long as the datasets are in use: for the local leader,
/// dropping it removes the record and frees the prefix.
pub struct SharedPrefix {
    prefix: String,
    segment: Box<dyn ShmSegment>,
}

impl SharedPrefix {
    /// Six-digit namespace, e.g. `"000042"`.
    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    pub fn segment(&self) -> &dyn ShmSegment {
        self.segment.as_ref()
    }

    /// Directories registered under this prefix.
    pub fn locals(&self) -> Result<BTreeSet<String>, PrefixError> {
        unpack_locals(self.segment.as_bytes())
    }
}

impl fmt::Debug for SharedPrefix {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SharedPrefix")
            .field("prefix", &self.prefix)
            .field("segment", &self.segment)
            .finish()
    }
}

/// Runs the allocation protocol over a shared memory namespace.
#[derive(Debug, Clone)]
pub struct PrefixAllocator<S> {
    shm: S,
    max_slots: usize,
}

impl<S: SharedMemory> PrefixAllocator<S> {
    pub fn new(shm: S) -> Self {
        Self {
            shm,
            max_slots: DEFAULT_MAX_SLOTS,
        }
    }

    pub fn with_max_slots(mut self, max_slots: usize) -> Self {
        self.max_slots = max_slots;
        self
    }

    pub fn max_slots(&self) -> usize {
        self.max_slots
    }

    /// Register or look up this group's prefix.
    ///
    /// Every rank of `world` must call this with the same directories. The
    /// transport is initialized on demand when more than one rank exists and
    /// torn down afterwards only if this call initialized it.
    pub async fn allocate<R: Rendezvous>(
        &self,
        my_locals: &[String],
        world: World,
        rendezvous: &R,
    ) -> Result<SharedPrefix, PrefixError> {
        let mine = unique_locals(my_locals)?;
        let record = pack_locals(&mine)?;

        let registered = if world.is_local_leader() {
            Some(self.register(&mine, &record)?)
        } else {
            None
        };

        let synchronized = 1 < world.num_ranks();
        let owns_transport = synchronized && !rendezvous.is_initialized();
        if owns_transport {
            rendezvous.init(world).await?;
        }

        let result = self
            .resolve(&mine, registered, synchronized, rendezvous)
            .await;

        let destroyed = if owns_transport {
            rendezvous.destroy().await
        } else {
            Ok(())
        };
        let shared = result?;
        destroyed?;
        debug!(rank = world.rank(), prefix = %shared.prefix, "Resolved shared prefix");
        Ok(shared)
    }

    async fn resolve<R: Rendezvous>(
        &self,
        mine: &BTreeSet<String>,
        registered: Option<SharedPrefix>,
        synchronized: bool,
        rendezvous: &R,
    ) -> Result<SharedPrefix, PrefixError> {
        if synchronized {
            rendezvous.barrier().await?;
        }
        let shared = match registered {
            Some(shared) => shared,
            None => self.lookup(mine)?,
        };
        if synchronized {
            rendezvous.barrier().await?;
        }
        Ok(shared)
    }

    /// Leader side: check every existing record for overlap and publish ours
    /// in the first free slot.
    fn register(
        &self,
        mine: &BTreeSet<String>,
        record: &[u8],
    ) -> Result<SharedPrefix, PrefixError> {
        let mut slot = 0;
        while slot < self.max_slots {
            let prefix = slot_prefix(slot);
            let name = slot_name(&prefix);

            match self.shm.attach(&name) {
                Ok(theirs) => {
                    check_overlap(&prefix, mine, theirs.as_ref())?;
                    slot += 1;
                    continue;
                }
                Err(ShmError::NotFound(_)) => {}
                Err(e) => return Err(e.into()),
            }

            match self.shm.create(&name, record) {
                Ok(segment) => {
                    info!(prefix = %prefix, locals = ?mine, "Registered shared prefix");
                    return Ok(SharedPrefix { prefix, segment });
                }
                // Another leader won the race for this slot; retry it as an
                // existing record.
                Err(ShmError::AlreadyExists(_)) => {
                    debug!(prefix = %prefix, "Lost race for prefix slot");
                }
                Err(e) => return Err(e.into()),
            }
        }
        Err(PrefixError::SlotsExhausted(self.max_slots))
    }

    /// Non-leader side: find the record whose directories equal ours.
    fn lookup(&self, mine: &BTreeSet<String>) -> Result<SharedPrefix, PrefixError> {
        for slot in 0..self.max_slots {
            let prefix = slot_prefix(slot);
            let segment = match self.shm.attach(&slot_name(&prefix)) {
                Ok(segment) => segment,
                Err(ShmError::NotFound(_)) => continue,
                Err(e) => return Err(e.into()),
            };
            if unpack_locals(segment.as_bytes())? == *mine {
                return Ok(SharedPrefix { prefix, segment });
            }
        }
        Err(PrefixError::Internal(
            "shared prefix was not registered by the local leader".to_string(),
        ))
    }
}

/// Run the allocation protocol against the machine's default shared memory.
pub async fn get_shm_prefix<R: Rendezvous>(
    my_locals: &[String],
    world: World,
    rendezvous: &R,
) -> Result<SharedPrefix, PrefixError> {
    PrefixAllocator::new(FileShm::default())
        .allocate(my_locals, world, rendezvous)
        .await
}

fn unique_locals(my_locals: &[String]) -> Result<BTreeSet<String>, PrefixError> {
    let mut set = BTreeSet::new();
    for dir in my_locals {
        if !set.insert(dir.clone()) {
            return Err(PrefixError::DuplicateLocalDir(dir.clone()));
        }
    }
    Ok(set)
}

fn check_overlap(
    prefix: &str,
    mine: &BTreeSet<String>,
    theirs: &dyn ShmSegment,
) -> Result<(), PrefixError> {
    let theirs = unpack_locals(theirs.as_bytes())?;
    if mine.intersection(&theirs).next().is_some() {
        return Err(PrefixError::LocalDirInUse {
            prefix: prefix.to_string(),
            ours: mine.iter().cloned().collect(),
            theirs: theirs.into_iter().collect(),
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn dirs(d: &[&str]) -> Vec<String> {
        d.iter().map(|s| s.to_string()).collect()
    }

    fn allocator(dir: &TempDir) -> PrefixAllocator<FileShm> {
        PrefixAllocator::new(FileShm::new(dir.path()))
    }

    async fn solo(
        alloc: &PrefixAllocator<FileShm>,
        locals: &[&str],
    ) -> Result<SharedPrefix, PrefixError> {
        let rendezvous = LocalRendezvous::group(1).remove(0);
        alloc.allocate(&dirs(locals), World::SINGLE, &rendezvous).await
    }

    #[tokio::test]
    async fn test_disjoint_groups_get_distinct_prefixes() {
        let dir = TempDir::new().unwrap();
        let alloc = allocator(&dir);

        let a = solo(&alloc, &["/a"]).await.unwrap();
        let b = solo(&alloc, &["/b"]).await.unwrap();
        assert_eq!(a.prefix(), "000000");
        assert_eq!(b.prefix(), "000001");
        assert_eq!(b.locals().unwrap(), dirs(&["/b"]).into_iter().collect());
    }

    #[tokio::test]
    async fn test_overlap_is_rejected() {
        let dir = TempDir::new().unwrap();
        let alloc = allocator(&dir);

        let _a = solo(&alloc, &["/a", "/x"]).await.unwrap();
        let err = solo(&alloc, &["/y", "/a"]).await.unwrap_err();
        assert!(err.is_configuration());
        match err {
            PrefixError::LocalDirInUse {
                prefix,
                ours,
                theirs,
            } => {
                assert_eq!(prefix, "000000");
                assert_eq!(ours, dirs(&["/a", "/y"]));
                assert_eq!(theirs, dirs(&["/a", "/x"]));
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn test_duplicate_dirs_fail_before_registering() {
        let dir = TempDir::new().unwrap();
        let alloc = allocator(&dir);

        let err = solo(&alloc, &["/a", "/b", "/a"]).await.unwrap_err();
        assert!(matches!(err, PrefixError::DuplicateLocalDir(ref d) if d == "/a"));
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
    }

    #[tokio::test]
    async fn test_released_slot_is_reused() {
        let dir = TempDir::new().unwrap();
        let alloc = allocator(&dir);

        let a = solo(&alloc, &["/a"]).await.unwrap();
        let _b = solo(&alloc, &["/b"]).await.unwrap();
        drop(a);
        let c = solo(&alloc, &["/a"]).await.unwrap();
        assert_eq!(c.prefix(), "000000");
    }

    #[tokio::test]
    async fn test_slots_exhausted() {
        let dir = TempDir::new().unwrap();
        let alloc = allocator(&dir).with_max_slots(2);

        let _a = solo(&alloc, &["/a"]).await.unwrap();
        let _b = solo(&alloc, &["/b"]).await.unwrap();
        assert!(matches!(
            solo(&alloc, &["/c"]).await,
            Err(PrefixError::SlotsExhausted(2))
        ));
    }

    #[tokio::test]
    async fn test_single_rank_leaves_transport_untouched() {
        let dir = TempDir::new().unwrap();
        let alloc = allocator(&dir);
        let rendezvous = LocalRendezvous::group(1).remove(0);

        alloc
            .allocate(&dirs(&["/a"]), World::SINGLE, &rendezvous)
            .await
            .unwrap();
        assert!(!rendezvous.is_initialized());
    }

    #[tokio::test]
    async fn test_record_written_in_wire_format() {
        let dir = TempDir::new().unwrap();
        let alloc = allocator(&dir);
        let _a = solo(&alloc, &["/z", "/a"]).await.unwrap();

        let raw = std::fs::read(dir.path().join("000000_locals")).unwrap();
        assert_eq!(&raw[..4], &9i32.to_le_bytes());
        assert_eq!(&raw[4..], b"/a\0/z");
    }

    #[test]
    fn test_lookup_without_record_is_internal() {
        let dir = TempDir::new().unwrap();
        let alloc = allocator(&dir).with_max_slots(3);
        let err = alloc
            .lookup(&dirs(&["/a"]).into_iter().collect())
            .unwrap_err();
        assert!(matches!(err, PrefixError::Internal(_)));
        assert!(!err.is_configuration());
    }
}
