//! Write a dataset, then materialize it through the read path.

use std::fs;
use std::path::Path;
use std::sync::Arc;

use serde_json::{json, Value};
use shardstream::cache::ShardCache;
use shardstream::codec::CodecRegistry;
use shardstream::config::WriterConfig;
use shardstream::hash::HashAlgo;
use shardstream::shard::{PhaseKind, ShardError, ShardFile};
use shardstream::storage::LocalDirStore;
use shardstream::stream::{StreamConf, StreamContext};
use shardstream::writer::{read_jsonl_samples, Index, JsonlEncoder, ShardWriter, INDEX_BASENAME};
use tempfile::TempDir;

const REMOTE_PREFIX: &str = "train";

fn sample(i: usize) -> Value {
    json!({"id": i, "text": format!("sample number {i} ").repeat(8)})
}

/// Write `n` samples compressed with gzip into `bucket/train`.
async fn write_dataset(bucket: &Path, staging: &Path, n: usize) -> Index {
    let config = WriterConfig::new(staging)
        .with_remote(REMOTE_PREFIX)
        .with_compression(Some("gz:6".parse().unwrap()))
        .with_hashes(vec![HashAlgo::Sha256])
        .with_size_limit(Some(1024))
        .with_max_workers(3);
    let store = Arc::new(LocalDirStore::new(bucket));
    let mut writer = ShardWriter::new(config, JsonlEncoder::new(), store).unwrap();
    for i in 0..n {
        writer.write(&sample(i)).await.unwrap();
    }
    writer.finish().await.unwrap()
}

fn open_stream(bucket: &Path, cache: &Path) -> (Arc<StreamContext>, Index) {
    let ctx = StreamContext::new(
        StreamConf::new(cache)
            .with_remote(REMOTE_PREFIX)
            .with_validate_hash(true),
        Arc::new(LocalDirStore::new(bucket)),
        CodecRegistry::with_defaults(),
    );
    let index = Index::read(&bucket.join(REMOTE_PREFIX).join(INDEX_BASENAME)).unwrap();
    (ctx, index)
}

fn read_shard(files: &[ShardFile]) -> Vec<Value> {
    let data = fs::read(files[0].terminal_phase().unwrap().get_local_filename()).unwrap();
    let meta = fs::read(files[1].terminal_phase().unwrap().get_local_filename()).unwrap();
    read_jsonl_samples(&data, &meta).unwrap()
}

#[tokio::test]
async fn test_written_dataset_streams_back() {
    let bucket = TempDir::new().unwrap();
    let staging = TempDir::new().unwrap();
    let cache_dir = TempDir::new().unwrap();
    let staging_dir = staging.path().join("out");

    let written = write_dataset(bucket.path(), &staging_dir, 40).await;
    assert!(written.shards.len() > 1);
    assert!(!staging_dir.exists(), "local staging copies should be gone");

    let (ctx, index) = open_stream(bucket.path(), cache_dir.path());
    assert_eq!(index, written);
    assert_eq!(index.num_samples(), 40);

    let shards: Vec<Vec<ShardFile>> = index
        .shards
        .iter()
        .map(|s| s.shard_files(&ctx).unwrap())
        .collect();
    let mut cache = ShardCache::new(ctx.clone(), shards.clone());
    cache.validate().unwrap();
    assert_eq!(cache.init_dir().unwrap(), 0);

    let mut decoded = Vec::new();
    for (i, files) in shards.iter().enumerate() {
        assert!(cache.load(i).unwrap() > 0);
        // Zip phases are dropped once raw is resident.
        for file in files {
            assert!(!file.phase(PhaseKind::Zip).unwrap().is_local());
            assert!(file.raw_phase().unwrap().is_local());
        }
        decoded.extend(read_shard(files));
    }
    assert_eq!(decoded, (0..40).map(sample).collect::<Vec<_>>());

    let raw_total: u64 = index
        .shards
        .iter()
        .map(|s| s.raw_data.bytes + s.raw_meta.as_ref().map_or(0, |m| m.bytes))
        .sum();
    assert_eq!(cache.usage(), raw_total);

    // A second pass over a warm cache does no work.
    for i in 0..shards.len() {
        assert_eq!(cache.load(i).unwrap(), 0);
    }
}

#[tokio::test]
async fn test_restart_reuses_local_shards() {
    let bucket = TempDir::new().unwrap();
    let staging = TempDir::new().unwrap();
    let cache_dir = TempDir::new().unwrap();
    write_dataset(bucket.path(), &staging.path().join("out"), 10).await;

    let (ctx, index) = open_stream(bucket.path(), cache_dir.path());
    let shards: Vec<Vec<ShardFile>> = index
        .shards
        .iter()
        .map(|s| s.shard_files(&ctx).unwrap())
        .collect();

    let mut first = ShardCache::new(ctx.clone(), shards.clone());
    first.load(0).unwrap();
    let usage = first.usage();

    let mut second = ShardCache::new(ctx, shards);
    assert_eq!(second.init_dir().unwrap(), usage);
    assert!(second.is_resident(0));
    assert_eq!(second.load(0).unwrap(), 0);
}

#[tokio::test]
async fn test_corrupt_remote_shard_is_rejected() {
    let bucket = TempDir::new().unwrap();
    let staging = TempDir::new().unwrap();
    let cache_dir = TempDir::new().unwrap();
    write_dataset(bucket.path(), &staging.path().join("out"), 5).await;

    let (ctx, index) = open_stream(bucket.path(), cache_dir.path());
    let shard = &index.shards[0];
    let zip = shard.zip_data.as_ref().unwrap();

    // Same length, different bytes.
    let remote = bucket.path().join(REMOTE_PREFIX).join(&zip.basename);
    let mut bytes = fs::read(&remote).unwrap();
    let last = bytes.len() - 1;
    bytes[last] ^= 0xff;
    fs::write(&remote, bytes).unwrap();

    let files = shard.shard_files(&ctx).unwrap();
    let err = files[0].load().unwrap_err();
    assert!(err.is_validation(), "unexpected error: {err}");
    assert!(matches!(err, ShardError::HashMismatch { phase: PhaseKind::Zip, .. }));
    assert!(!files[0].raw_phase().unwrap().is_local());
    assert!(!files[0].phase(PhaseKind::Zip).unwrap().is_local());
}
