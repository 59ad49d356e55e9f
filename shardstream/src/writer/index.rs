//! Dataset index (`index.json`) and per-shard descriptors.

use std::collections::BTreeMap;
use std::fs;
use std::path::Path;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use super::WriteError;
use crate::hash::{ExpectedHash, HashAlgo};
use crate::shard::{PhaseMeta, ShardFile};
use crate::stream::StreamContext;

/// File name of the dataset index.
pub const INDEX_BASENAME: &str = "index.json";

/// Index format version written by this crate.
pub const INDEX_VERSION: u32 = 2;

/// One physical file as recorded in the index.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileInfo {
    pub basename: String,
    pub bytes: u64,
    /// Hex digest per algorithm name
    #[serde(default)]
    pub hashes: BTreeMap<String, String>,
}

impl FileInfo {
    /// Describe `data`, hashing it with each of `algos`.
    pub fn describe(basename: impl Into<String>, data: &[u8], algos: &[HashAlgo]) -> Self {
        Self {
            basename: basename.into(),
            bytes: data.len() as u64,
            hashes: algos
                .iter()
                .map(|algo| (algo.as_str().to_string(), algo.digest(data)))
                .collect(),
        }
    }

    /// Phase metadata for this file, carrying the first recognised digest.
    pub fn phase_meta(&self) -> PhaseMeta {
        let meta = PhaseMeta::new(self.basename.clone(), Some(self.bytes));
        let expected = self.hashes.iter().find_map(|(algo, digest)| {
            algo.parse::<HashAlgo>()
                .ok()
                .map(|algo| ExpectedHash::new(algo, digest.clone()))
        });
        match expected {
            Some(hash) => meta.with_hash(hash),
            None => meta,
        }
    }
}

/// Everything the read path needs to know about one shard.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShardDescriptor {
    pub version: u32,
    pub format: String,
    pub samples: u64,
    /// Compression as configured, e.g. `"gz:6"`
    pub compression: Option<String>,
    #[serde(default)]
    pub hashes: Vec<String>,
    pub size_limit: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub columns: Option<BTreeMap<String, String>>,
    pub raw_data: FileInfo,
    pub zip_data: Option<FileInfo>,
    #[serde(default)]
    pub raw_meta: Option<FileInfo>,
    #[serde(default)]
    pub zip_meta: Option<FileInfo>,
}

impl ShardDescriptor {
    /// Decompression algorithm name, without any level.
    pub fn compression_algo(&self) -> Option<&str> {
        self.compression
            .as_deref()
            .map(|c| c.split_once(':').map_or(c, |(algo, _)| algo))
    }

    /// Build the read-path files of this shard: data first, then meta.
    pub fn shard_files(&self, ctx: &Arc<StreamContext>) -> Result<Vec<ShardFile>, WriteError> {
        let mut files = vec![self.shard_file(ctx, &self.raw_data, self.zip_data.as_ref())?];
        if let Some(raw_meta) = &self.raw_meta {
            files.push(self.shard_file(ctx, raw_meta, self.zip_meta.as_ref())?);
        }
        Ok(files)
    }

    fn shard_file(
        &self,
        ctx: &Arc<StreamContext>,
        raw: &FileInfo,
        zip: Option<&FileInfo>,
    ) -> Result<ShardFile, WriteError> {
        let file = ShardFile::new(ctx.clone(), raw.phase_meta());
        match zip {
            None => Ok(file),
            Some(zip) => {
                let algo = self.compression_algo().ok_or_else(|| {
                    WriteError::InvalidIndex(format!(
                        "'{}' is compressed but the shard names no compression",
                        zip.basename
                    ))
                })?;
                Ok(file.with_zip(algo, zip.phase_meta()))
            }
        }
    }

    /// Basenames of the files that are stored (and uploaded) for this shard.
    pub fn stored_basenames(&self) -> Vec<&str> {
        let data = self.zip_data.as_ref().unwrap_or(&self.raw_data);
        let meta = self
            .raw_meta
            .as_ref()
            .map(|raw| self.zip_meta.as_ref().unwrap_or(raw));
        std::iter::once(data)
            .chain(meta)
            .map(|info| info.basename.as_str())
            .collect()
    }
}

/// The dataset index.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Index {
    pub version: u32,
    pub shards: Vec<ShardDescriptor>,
}

impl Index {
    pub fn new(shards: Vec<ShardDescriptor>) -> Self {
        Self {
            version: INDEX_VERSION,
            shards,
        }
    }

    pub fn num_samples(&self) -> u64 {
        self.shards.iter().map(|s| s.samples).sum()
    }

    pub fn read(path: &Path) -> Result<Self, WriteError> {
        let data = fs::read(path).map_err(|e| WriteError::io(path, e))?;
        Ok(serde_json::from_slice(&data)?)
    }

    /// Write to `path` through a temp file and rename.
    pub fn write(&self, path: &Path) -> Result<(), WriteError> {
        let data = serde_json::to_vec_pretty(self)?;
        let mut tmp = path.as_os_str().to_owned();
        tmp.push(crate::shard::TMP_SUFFIX);
        let tmp = Path::new(&tmp);
        fs::write(tmp, &data).map_err(|e| WriteError::io(tmp, e))?;
        fs::rename(tmp, path).map_err(|e| WriteError::io(path, e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::CodecRegistry;
    use crate::shard::PhaseKind;
    use crate::storage::LocalDirStore;
    use crate::stream::StreamConf;
    use tempfile::TempDir;

    fn descriptor(compressed: bool) -> ShardDescriptor {
        let info = |name: &str, bytes| FileInfo {
            basename: name.to_string(),
            bytes,
            hashes: BTreeMap::new(),
        };
        ShardDescriptor {
            version: INDEX_VERSION,
            format: "jsonl".to_string(),
            samples: 3,
            compression: compressed.then(|| "gz:6".to_string()),
            hashes: Vec::new(),
            size_limit: Some(1 << 26),
            columns: None,
            raw_data: info("shard.00000.jsonl", 30),
            zip_data: compressed.then(|| info("shard.00000.jsonl.gz", 20)),
            raw_meta: Some(info("shard.00000.jsonl.meta", 20)),
            zip_meta: compressed.then(|| info("shard.00000.jsonl.meta.gz", 15)),
        }
    }

    #[test]
    fn test_file_info_hashes() {
        let info = FileInfo::describe("a", b"", &[HashAlgo::Sha256]);
        assert_eq!(info.bytes, 0);
        let meta = info.phase_meta();
        assert_eq!(meta.size, Some(0));
        assert_eq!(meta.hash.unwrap().algo, HashAlgo::Sha256);
    }

    #[test]
    fn test_stored_basenames() {
        assert_eq!(
            descriptor(true).stored_basenames(),
            vec!["shard.00000.jsonl.gz", "shard.00000.jsonl.meta.gz"]
        );
        assert_eq!(
            descriptor(false).stored_basenames(),
            vec!["shard.00000.jsonl", "shard.00000.jsonl.meta"]
        );
    }

    #[test]
    fn test_shard_files_configure_zip_phase() {
        let dir = TempDir::new().unwrap();
        let ctx = StreamContext::new(
            StreamConf::new(dir.path()),
            Arc::new(LocalDirStore::new(dir.path())),
            CodecRegistry::with_defaults(),
        );
        let desc = descriptor(true);
        assert_eq!(desc.compression_algo(), Some("gz"));

        let files = desc.shard_files(&ctx).unwrap();
        assert_eq!(files.len(), 2);
        let zip = files[0].phase(PhaseKind::Zip).unwrap();
        assert_eq!(zip.algo(), Some("gz"));
        assert_eq!(zip.size(), Some(20));
        assert!(files[1].phase(PhaseKind::Can).is_none());
    }

    #[test]
    fn test_index_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join(INDEX_BASENAME);
        let index = Index::new(vec![descriptor(false), descriptor(true)]);
        index.write(&path).unwrap();

        let value: serde_json::Value = serde_json::from_slice(&fs::read(&path).unwrap()).unwrap();
        assert_eq!(value["version"], 2);
        assert_eq!(value["shards"][1]["zip_data"]["basename"], "shard.00000.jsonl.gz");

        let read = Index::read(&path).unwrap();
        assert_eq!(read.num_samples(), 6);
        assert_eq!(read, index);
    }
}
