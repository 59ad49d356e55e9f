//! Per-stream settings shared by every shard file of a stream.
//!
//! A [`StreamContext`] is built once when a dataset is opened and handed to
//! every phase as an `Arc`. It outlives all shard files and is never mutated,
//! so phases can reach remote/local roots, size limits, the keep policy, the
//! object store and the codecs without owning any of them.

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::codec::CodecRegistry;
use crate::shard::KeepPhases;
use crate::storage::{join_key, ObjectStore};

/// Immutable configuration of one stream.
///
/// # Example
///
/// ```
/// use shardstream::shard::KeepPhases;
/// use shardstream::stream::StreamConf;
///
/// let conf = StreamConf::new("/tmp/ds")
///     .with_remote("s3://bucket/ds")
///     .with_keep_phases("can".parse::<KeepPhases>().unwrap())
///     .with_download_max_size(Some(1 << 30));
/// assert_eq!(conf.remote(), Some("s3://bucket/ds"));
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamConf {
    /// Local cache directory for this stream
    local: PathBuf,
    /// Remote prefix, `None` when the dataset is local only
    remote: Option<String>,
    /// Largest first-phase file this stream may download
    download_max_size: Option<u64>,
    /// Phases that must stay resident after each transition
    keep_phases: KeepPhases,
    /// Verify expected digests of downloaded and decompressed files
    validate_hash: bool,
}

impl StreamConf {
    pub fn new(local: impl Into<PathBuf>) -> Self {
        Self {
            local: local.into(),
            ..Self::default()
        }
    }

    pub fn with_remote(mut self, remote: impl Into<String>) -> Self {
        self.remote = Some(remote.into());
        self
    }

    pub fn with_download_max_size(mut self, max: Option<u64>) -> Self {
        self.download_max_size = max;
        self
    }

    pub fn with_keep_phases(mut self, keep: KeepPhases) -> Self {
        self.keep_phases = keep;
        self
    }

    pub fn with_validate_hash(mut self, validate: bool) -> Self {
        self.validate_hash = validate;
        self
    }

    pub fn local(&self) -> &Path {
        &self.local
    }

    pub fn remote(&self) -> Option<&str> {
        self.remote.as_deref()
    }

    pub fn download_max_size(&self) -> Option<u64> {
        self.download_max_size
    }

    pub fn keep_phases(&self) -> &KeepPhases {
        &self.keep_phases
    }

    pub fn validate_hash(&self) -> bool {
        self.validate_hash
    }
}

impl Default for StreamConf {
    fn default() -> Self {
        let local = dirs::cache_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("shardstream");

        Self {
            local,
            remote: None,
            download_max_size: None,
            keep_phases: KeepPhases::default(),
            validate_hash: false,
        }
    }
}

/// Stream configuration plus the collaborators every phase needs.
pub struct StreamContext {
    conf: StreamConf,
    store: Arc<dyn ObjectStore>,
    codecs: CodecRegistry,
}

impl StreamContext {
    pub fn new(conf: StreamConf, store: Arc<dyn ObjectStore>, codecs: CodecRegistry) -> Arc<Self> {
        Arc::new(Self {
            conf,
            store,
            codecs,
        })
    }

    pub fn conf(&self) -> &StreamConf {
        &self.conf
    }

    pub fn store(&self) -> &dyn ObjectStore {
        self.store.as_ref()
    }

    pub fn codecs(&self) -> &CodecRegistry {
        &self.codecs
    }

    /// Local path of a dataset-relative file name.
    pub fn local_path(&self, relative: &str) -> PathBuf {
        self.conf.local.join(relative)
    }

    /// Remote object key of a dataset-relative file name.
    pub fn remote_key(&self, relative: &str) -> String {
        join_key(self.conf.remote(), relative)
    }
}

impl fmt::Debug for StreamContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StreamContext")
            .field("conf", &self.conf)
            .field("store", &self.store.name())
            .field("codecs", &self.codecs)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::LocalDirStore;

    #[test]
    fn test_default_conf() {
        let conf = StreamConf::default();
        assert!(conf.local().ends_with("shardstream"));
        assert_eq!(conf.remote(), None);
        assert_eq!(conf.download_max_size(), None);
        assert_eq!(*conf.keep_phases(), KeepPhases::default());
        assert!(!conf.validate_hash());
    }

    #[test]
    fn test_context_paths() {
        let conf = StreamConf::new("/data/local").with_remote("train");
        let ctx = StreamContext::new(
            conf,
            Arc::new(LocalDirStore::new("/data/remote")),
            CodecRegistry::with_defaults(),
        );
        assert_eq!(
            ctx.local_path("shard.00000.mds"),
            PathBuf::from("/data/local/shard.00000.mds")
        );
        assert_eq!(ctx.remote_key("shard.00000.mds"), "train/shard.00000.mds");
    }
}
