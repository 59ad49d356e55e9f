//! Buffering shard writer with pipelined uploads.

use std::fs;
use std::path::PathBuf;
use std::sync::Arc;

use tracing::{debug, info, warn};

use super::encoder::{EncodedShard, ShardEncoder};
use super::index::{FileInfo, Index, ShardDescriptor, INDEX_BASENAME, INDEX_VERSION};
use super::WriteError;
use crate::codec::Compressor;
use crate::config::{format_size, WriterConfig};
use crate::storage::{join_key, ObjectStore};
use crate::upload::{UploadJob, UploadPool};

/// Writes samples into size-bounded shards and uploads them as it goes.
///
/// Each flush encodes the buffered samples, optionally compresses every
/// resulting file, records it in the index and hands it to the upload pool.
/// Encoding of the next shard overlaps with those uploads. If an upload
/// fails for good, later flushes are skipped and [`finish`](Self::finish)
/// returns that failure.
///
/// Must be driven from within a Tokio runtime.
///
/// # Example
///
/// ```no_run
/// use std::sync::Arc;
/// use serde_json::json;
/// use shardstream::config::WriterConfig;
/// use shardstream::storage::LocalDirStore;
/// use shardstream::writer::{JsonlEncoder, ShardWriter};
///
/// # async fn run() -> Result<(), shardstream::writer::WriteError> {
/// let config = WriterConfig::new("/tmp/out").with_remote("train");
/// let store = Arc::new(LocalDirStore::new("/mnt/bucket"));
/// let mut writer = ShardWriter::new(config, JsonlEncoder::new(), store)?;
/// writer.write(&json!({"text": "hello"})).await?;
/// let index = writer.finish().await?;
/// assert_eq!(index.num_samples(), 1);
/// # Ok(())
/// # }
/// ```
pub struct ShardWriter<E: ShardEncoder> {
    config: WriterConfig,
    encoder: E,
    compressor: Option<Box<dyn Compressor>>,
    store: Arc<dyn ObjectStore>,
    pool: UploadPool,
    samples: Vec<Vec<u8>>,
    pending_bytes: u64,
    shards: Vec<ShardDescriptor>,
    next_shard: usize,
    skipped_shards: usize,
}

impl<E: ShardEncoder> ShardWriter<E> {
    pub fn new(
        config: WriterConfig,
        encoder: E,
        store: Arc<dyn ObjectStore>,
    ) -> Result<Self, WriteError> {
        config.validate()?;
        prepare_local_dir(&config)?;

        let compressor = config.compression().map(|c| c.compressor());
        let pool = UploadPool::new(store.clone(), config.max_workers(), config.retry());
        info!(
            local = %config.local().display(),
            remote = config.remote().unwrap_or("-"),
            format = encoder.format(),
            size_limit = %config.size_limit().map_or_else(|| "none".to_string(), format_size),
            "Writing dataset"
        );

        Ok(Self {
            config,
            encoder,
            compressor,
            store,
            pool,
            samples: Vec::new(),
            pending_bytes: 0,
            shards: Vec::new(),
            next_shard: 0,
            skipped_shards: 0,
        })
    }

    /// Replace the upload pool, e.g. to tune its retry backoff.
    pub fn with_pool(mut self, configure: impl FnOnce(UploadPool) -> UploadPool) -> Self {
        let pool = UploadPool::new(
            self.store.clone(),
            self.config.max_workers(),
            self.config.retry(),
        );
        self.pool = configure(pool);
        self
    }

    pub fn config(&self) -> &WriterConfig {
        &self.config
    }

    /// Whether an upload failure (or [`cancel`](Self::cancel)) has stopped
    /// the writer.
    pub fn is_cancelled(&self) -> bool {
        self.pool.is_cancelled()
    }

    /// Stop uploading: pending uploads are cancelled and later shards skipped.
    pub fn cancel(&self) {
        self.pool.cancel();
    }

    /// Shards flushed so far.
    pub fn shards(&self) -> &[ShardDescriptor] {
        &self.shards
    }

    /// Buffer one sample, flushing first if it would push the shard over the
    /// size limit. A sample larger than the limit gets a shard of its own.
    pub async fn write(&mut self, sample: &E::Sample) -> Result<(), WriteError> {
        let data = self.encoder.encode_sample(sample)?;
        let sample_bytes = data.len() as u64 + self.encoder.extra_bytes_per_sample();

        if let Some(limit) = self.config.size_limit() {
            let shard_bytes = self.encoder.extra_bytes_per_shard() + self.pending_bytes;
            if !self.samples.is_empty() && shard_bytes + sample_bytes > limit {
                self.flush().await?;
            }
            if self.encoder.extra_bytes_per_shard() + sample_bytes > limit {
                warn!(bytes = sample_bytes, limit, "Sample exceeds the shard size limit");
            }
        }

        self.pending_bytes += sample_bytes;
        self.samples.push(data);
        Ok(())
    }

    /// Turn the buffered samples into a shard and queue its uploads.
    pub async fn flush(&mut self) -> Result<(), WriteError> {
        if self.samples.is_empty() {
            return Ok(());
        }
        let samples = std::mem::take(&mut self.samples);
        self.pending_bytes = 0;

        if self.pool.is_cancelled() {
            warn!(samples = samples.len(), "Writer cancelled, skipping shard");
            self.skipped_shards += 1;
            return Ok(());
        }

        let shard = self.next_shard;
        self.next_shard += 1;

        let (data, meta) = match self.encoder.encode_shard(shard, &samples)? {
            EncodedShard::Single(data) => (data, None),
            EncodedShard::Dual { data, meta } => (data, Some(meta)),
        };
        let basename = format!("shard.{:05}.{}", shard, self.encoder.format());
        let (raw_data, zip_data) = self.store_file(&data, &basename)?;
        let (raw_meta, zip_meta) = match meta {
            Some(meta) => {
                let (raw, zip) = self.store_file(&meta, &format!("{}.meta", basename))?;
                (Some(raw), zip)
            }
            None => (None, None),
        };

        let descriptor = ShardDescriptor {
            version: INDEX_VERSION,
            format: self.encoder.format().to_string(),
            samples: samples.len() as u64,
            compression: self.config.compression().map(|c| c.to_string()),
            hashes: self
                .config
                .hashes()
                .iter()
                .map(|h| h.as_str().to_string())
                .collect(),
            size_limit: self.config.size_limit(),
            columns: self.encoder.columns(),
            raw_data,
            zip_data,
            raw_meta,
            zip_meta,
        };
        debug!(
            shard,
            samples = descriptor.samples,
            bytes = descriptor.raw_data.bytes,
            "Flushed shard"
        );

        if self.config.remote().is_some() {
            let basenames: Vec<String> = descriptor
                .stored_basenames()
                .into_iter()
                .map(str::to_string)
                .collect();
            for basename in basenames {
                self.submit(&basename);
            }
        }
        self.shards.push(descriptor);

        // Let the upload tasks start while the caller encodes the next shard.
        tokio::task::yield_now().await;
        Ok(())
    }

    /// Flush, wait for every upload, then write and upload the index.
    pub async fn finish(mut self) -> Result<Index, WriteError> {
        self.flush().await?;

        let pool = std::mem::replace(
            &mut self.pool,
            UploadPool::new(self.store.clone(), 1, self.config.retry()),
        );
        let summary = pool.join().await?;
        if summary.cancelled > 0 || self.skipped_shards > 0 {
            return Err(WriteError::Cancelled {
                shards: self.skipped_shards,
                uploads: summary.cancelled,
            });
        }

        let index = Index::new(std::mem::take(&mut self.shards));
        let index_path = self.config.local().join(INDEX_BASENAME);
        index.write(&index_path)?;

        if self.config.remote().is_some() {
            self.submit(INDEX_BASENAME);
            let pool = std::mem::replace(
                &mut self.pool,
                UploadPool::new(self.store.clone(), 1, 0),
            );
            pool.join().await?;
            if !self.config.keep_local() {
                // Every file was deleted after its upload; only the directory is left.
                if let Err(e) = fs::remove_dir(self.config.local()) {
                    debug!(error = %e, "Left local output directory in place");
                }
            }
        }

        info!(
            shards = index.shards.len(),
            samples = index.num_samples(),
            "Finished writing dataset"
        );
        Ok(index)
    }

    /// Write a physical file, compressed if configured. Only the stored
    /// variant lands on disk; the raw variant is described but not kept.
    fn store_file(
        &self,
        data: &[u8],
        raw_basename: &str,
    ) -> Result<(FileInfo, Option<FileInfo>), WriteError> {
        let hashes = self.config.hashes();
        let raw_info = FileInfo::describe(raw_basename, data, hashes);

        let (zip_info, stored, stored_basename) = match &self.compressor {
            Some(compressor) => {
                let zipped = compressor.compress(data)?;
                let zip_basename = format!("{}.{}", raw_basename, compressor.extension());
                let info = FileInfo::describe(zip_basename.clone(), &zipped, hashes);
                (Some(info), zipped, zip_basename)
            }
            None => (None, data.to_vec(), raw_basename.to_string()),
        };

        let path = self.local_path(&stored_basename);
        fs::write(&path, &stored).map_err(|e| WriteError::io(&path, e))?;
        Ok((raw_info, zip_info))
    }

    fn submit(&mut self, basename: &str) {
        let job = UploadJob {
            local: self.local_path(basename),
            key: join_key(self.config.remote(), basename),
            delete_after: !self.config.keep_local(),
        };
        self.pool.submit(job);
    }

    fn local_path(&self, basename: &str) -> PathBuf {
        self.config.local().join(basename)
    }
}

fn prepare_local_dir(config: &WriterConfig) -> Result<(), WriteError> {
    let local = config.local();
    match fs::read_dir(local) {
        Ok(mut entries) => {
            if entries.next().is_some() && !config.exist_ok() {
                return Err(WriteError::LocalDirNotEmpty(local.to_path_buf()));
            }
            Ok(())
        }
        Err(_) => fs::create_dir_all(local).map_err(|e| WriteError::io(local, e)),
    }
}
