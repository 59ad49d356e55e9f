//! Disk budget over a stream's shards.

use std::collections::VecDeque;
use std::sync::Arc;

use tracing::{debug, info, warn};

use super::listing::walk_listing;
use crate::shard::{ShardError, ShardFile, ShardResult};
use crate::stream::StreamContext;

/// The shards of one stream and the local disk they occupy.
///
/// Every shard is the list of its files (e.g. data and meta). Usage deltas
/// from the shard lifecycle are accumulated here; with a cache limit set,
/// loading a shard first evicts the least recently loaded shards until the
/// new one fits.
///
/// # Example
///
/// ```no_run
/// use shardstream::cache::ShardCache;
/// # fn run(ctx: std::sync::Arc<shardstream::stream::StreamContext>,
/// #        shards: Vec<Vec<shardstream::shard::ShardFile>>) -> shardstream::shard::ShardResult<()> {
/// let mut cache = ShardCache::new(ctx, shards).with_cache_limit(Some(1 << 30));
/// cache.validate()?;
/// cache.init_dir()?;
/// cache.load(0)?;
/// # Ok(())
/// # }
/// ```
pub struct ShardCache {
    ctx: Arc<StreamContext>,
    shards: Vec<Vec<ShardFile>>,
    cache_limit: Option<u64>,
    usage: i64,
    /// Shards whose terminal phases are local, coldest first
    resident: VecDeque<usize>,
}

impl ShardCache {
    pub fn new(ctx: Arc<StreamContext>, shards: Vec<Vec<ShardFile>>) -> Self {
        Self {
            ctx,
            shards,
            cache_limit: None,
            usage: 0,
            resident: VecDeque::new(),
        }
    }

    pub fn with_cache_limit(mut self, limit: Option<u64>) -> Self {
        self.cache_limit = limit;
        self
    }

    pub fn num_shards(&self) -> usize {
        self.shards.len()
    }

    pub fn cache_limit(&self) -> Option<u64> {
        self.cache_limit
    }

    /// Local bytes currently attributed to this stream.
    pub fn usage(&self) -> u64 {
        self.usage.max(0) as u64
    }

    pub fn is_resident(&self, shard: usize) -> bool {
        self.resident.contains(&shard)
    }

    pub fn validate(&self) -> ShardResult<()> {
        self.shards.iter().flatten().try_for_each(ShardFile::validate)
    }

    /// Reconcile the local directory with the shard metadata.
    ///
    /// Takes one listing of the stream's directory, lets every file account
    /// for (and clean up) what it finds, and evicts down to the limit if the
    /// leftovers exceed it. Returns the resulting usage.
    pub fn init_dir(&mut self) -> ShardResult<u64> {
        let local = self.ctx.conf().local();
        let listing = walk_listing(local).map_err(|e| ShardError::io(local, e))?;

        let mut usage = 0;
        self.resident.clear();
        for (index, files) in self.shards.iter().enumerate() {
            for file in files {
                usage += file.init_dir(&listing)?;
            }
            if is_loaded(files)? {
                self.resident.push_back(index);
            }
        }
        self.usage = usage;
        info!(
            local = %local.display(),
            files = listing.len(),
            resident = self.resident.len(),
            usage_bytes = self.usage(),
            "Reconciled local shard directory"
        );

        self.make_room(0, None)?;
        Ok(self.usage())
    }

    /// Make `shard` resident, returning the usage delta of loading it alone.
    pub fn load(&mut self, shard: usize) -> ShardResult<i64> {
        let needed = self.terminal_bytes(shard)?;
        if let Some(limit) = self.cache_limit {
            if needed > limit {
                return Err(ShardError::CacheLimitTooSmall { needed, limit });
            }
        }

        match self.resident.iter().position(|&s| s == shard) {
            Some(pos) => {
                self.resident.remove(pos);
            }
            None => self.make_room(needed, Some(shard))?,
        }

        let mut ddu = 0;
        for i in 0..self.shards[shard].len() {
            match self.shards[shard][i].load() {
                Ok(delta) => ddu += delta,
                Err(e) => {
                    self.usage += ddu;
                    return Err(e);
                }
            }
        }
        self.usage += ddu;
        self.resident.push_back(shard);
        if ddu != 0 {
            debug!(shard, bytes = ddu, usage_bytes = self.usage(), "Loaded shard");
        }

        // Sizes of later phases may be unknown up front.
        self.make_room(0, Some(shard))?;
        Ok(ddu)
    }

    /// Delete every local phase of `shard`.
    pub fn evict(&mut self, shard: usize) -> ShardResult<i64> {
        self.files(shard)?;
        self.resident.retain(|&s| s != shard);
        self.evict_files(shard)
    }

    fn files(&self, shard: usize) -> ShardResult<&[ShardFile]> {
        self.shards.get(shard).map(Vec::as_slice).ok_or_else(|| {
            ShardError::InternalConsistency(format!(
                "shard {} out of range for {} shards",
                shard,
                self.shards.len()
            ))
        })
    }

    /// Declared bytes of the terminal phases of `shard`; unknown sizes count 0.
    fn terminal_bytes(&self, shard: usize) -> ShardResult<u64> {
        let mut total = 0;
        for file in self.files(shard)? {
            total += file.terminal_phase()?.size().unwrap_or(0);
        }
        Ok(total)
    }

    fn evict_files(&mut self, shard: usize) -> ShardResult<i64> {
        let mut ddu = 0;
        for i in 0..self.shards[shard].len() {
            match self.shards[shard][i].evict() {
                Ok(delta) => ddu += delta,
                Err(e) => {
                    self.usage += ddu;
                    return Err(e);
                }
            }
        }
        self.usage += ddu;
        Ok(ddu)
    }

    /// Evict the coldest resident shards other than `keep` until `needed`
    /// more bytes fit under the limit.
    fn make_room(&mut self, needed: u64, keep: Option<usize>) -> ShardResult<()> {
        let Some(limit) = self.cache_limit else {
            return Ok(());
        };
        while self.usage() + needed > limit {
            let Some(pos) = self.resident.iter().position(|&s| Some(s) != keep) else {
                warn!(
                    usage_bytes = self.usage(),
                    needed_bytes = needed,
                    limit_bytes = limit,
                    "No shard left to evict, cache stays over its limit"
                );
                break;
            };
            let Some(victim) = self.resident.remove(pos) else {
                break;
            };
            let freed = self.evict_files(victim)?;
            debug!(shard = victim, bytes = -freed, "Evicted coldest shard");
        }
        Ok(())
    }
}

fn is_loaded(files: &[ShardFile]) -> ShardResult<bool> {
    for file in files {
        if !file.terminal_phase()?.is_local() {
            return Ok(false);
        }
    }
    Ok(!files.is_empty())
}
