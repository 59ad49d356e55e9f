//! Shardstream - local cache core for streaming sharded datasets
//!
//! Datasets larger than local disk are stored remotely as shards and pulled
//! onto each machine on demand. This crate covers the pieces that keep those
//! local copies coherent and shared safely between worker processes:
//!
//! - [`shard`]: per-file zip -> raw -> can lifecycle with the keep-phases
//!   eviction policy. Every operation returns a disk usage delta.
//! - [`cache`]: a disk budget over a stream's shards, evicting the coldest.
//! - [`prefix`]: once-per-job negotiation of a unique shared-memory prefix,
//!   rejecting jobs whose local directories overlap.
//! - [`writer`] and [`upload`]: the authoring path, writing shards and
//!   uploading them with bounded concurrency, retry and fail-fast
//!   cancellation.
//!
//! # Reading a dataset
//!
//! ```no_run
//! use std::sync::Arc;
//! use shardstream::cache::ShardCache;
//! use shardstream::codec::CodecRegistry;
//! use shardstream::storage::LocalDirStore;
//! use shardstream::stream::{StreamConf, StreamContext};
//! use shardstream::writer::Index;
//!
//! # fn run() -> Result<(), Box<dyn std::error::Error>> {
//! let ctx = StreamContext::new(
//!     StreamConf::new("/tmp/cache/train"),
//!     Arc::new(LocalDirStore::new("/mnt/datasets/train")),
//!     CodecRegistry::with_defaults(),
//! );
//! let index = Index::read("/mnt/datasets/train/index.json".as_ref())?;
//! let mut shards = Vec::new();
//! for shard in &index.shards {
//!     shards.push(shard.shard_files(&ctx)?);
//! }
//! let mut cache = ShardCache::new(ctx, shards).with_cache_limit(Some(10 << 30));
//! cache.validate()?;
//! cache.init_dir()?;
//! cache.load(0)?;
//! # Ok(())
//! # }
//! ```

pub mod cache;
pub mod codec;
pub mod config;
pub mod hash;
pub mod logging;
pub mod prefix;
pub mod shard;
pub mod storage;
pub mod stream;
pub mod upload;
pub mod writer;

/// Version of the shardstream library.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version_is_set() {
        assert!(!VERSION.is_empty());
    }
}
