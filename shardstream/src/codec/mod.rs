//! Codec seams for the decompression and canonicalization phases.
//!
//! Codec bodies are pluggable: the shard lifecycle looks algorithms up by
//! name in a [`CodecRegistry`] and only ever sees `bytes -> bytes`
//! decompression and `path -> path` canonicalization. Gzip ships built in.

mod gzip;

pub use gzip::Gzip;

use std::collections::HashMap;
use std::fmt;
use std::path::Path;
use std::str::FromStr;
use std::sync::Arc;

use thiserror::Error;

use crate::config::ConfigError;

/// Errors from codec operations.
#[derive(Debug, Error)]
pub enum CodecError {
    /// No codec registered under this name.
    #[error("Unknown {kind} algorithm '{algo}'")]
    UnknownAlgorithm { kind: &'static str, algo: String },

    /// The codec rejected its input.
    #[error("{algo} codec failed: {message}")]
    Failed { algo: String, message: String },

    /// I/O failure while reading or writing codec data.
    #[error("Codec I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Whole-buffer decompression.
pub trait Decompressor: Send + Sync {
    fn decompress(&self, data: &[u8]) -> Result<Vec<u8>, CodecError>;
}

/// Whole-buffer compression, used by the shard writer.
pub trait Compressor: Send + Sync {
    fn compress(&self, data: &[u8]) -> Result<Vec<u8>, CodecError>;

    /// File extension appended to compressed files, without the dot.
    fn extension(&self) -> &str;
}

/// File-to-file conversion into the canonical read format.
///
/// Implementations may stream; nothing requires the file to fit in memory.
pub trait Canonicalizer: Send + Sync {
    fn canonicalize(&self, src: &Path, dst: &Path) -> Result<(), CodecError>;
}

/// Named codec lookup shared by every shard file of a stream.
#[derive(Clone, Default)]
pub struct CodecRegistry {
    decompressors: HashMap<String, Arc<dyn Decompressor>>,
    canonicalizers: HashMap<String, Arc<dyn Canonicalizer>>,
}

impl CodecRegistry {
    /// Empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with the built-in decompressors.
    pub fn with_defaults() -> Self {
        Self::new().with_decompressor(gzip::NAME, Arc::new(Gzip::default()))
    }

    pub fn with_decompressor(
        mut self,
        algo: impl Into<String>,
        codec: Arc<dyn Decompressor>,
    ) -> Self {
        self.decompressors.insert(algo.into(), codec);
        self
    }

    pub fn with_canonicalizer(
        mut self,
        algo: impl Into<String>,
        codec: Arc<dyn Canonicalizer>,
    ) -> Self {
        self.canonicalizers.insert(algo.into(), codec);
        self
    }

    pub fn has_decompressor(&self, algo: &str) -> bool {
        self.decompressors.contains_key(algo)
    }

    pub fn has_canonicalizer(&self, algo: &str) -> bool {
        self.canonicalizers.contains_key(algo)
    }

    pub fn decompress(&self, algo: &str, data: &[u8]) -> Result<Vec<u8>, CodecError> {
        self.decompressors
            .get(algo)
            .ok_or_else(|| CodecError::UnknownAlgorithm {
                kind: "decompression",
                algo: algo.to_string(),
            })?
            .decompress(data)
    }

    pub fn canonicalize(&self, algo: &str, src: &Path, dst: &Path) -> Result<(), CodecError> {
        self.canonicalizers
            .get(algo)
            .ok_or_else(|| CodecError::UnknownAlgorithm {
                kind: "canonicalization",
                algo: algo.to_string(),
            })?
            .canonicalize(src, dst)
    }
}

impl fmt::Debug for CodecRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut decompressors: Vec<_> = self.decompressors.keys().collect();
        let mut canonicalizers: Vec<_> = self.canonicalizers.keys().collect();
        decompressors.sort();
        canonicalizers.sort();
        f.debug_struct("CodecRegistry")
            .field("decompressors", &decompressors)
            .field("canonicalizers", &canonicalizers)
            .finish()
    }
}

/// Writer-side compression setting, parsed from `"algo"` or `"algo:level"`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Compression {
    algo: String,
    level: Option<u32>,
}

impl Compression {
    /// Algorithm name as recorded in shard metadata (e.g. `"gz"`).
    pub fn algo(&self) -> &str {
        &self.algo
    }

    pub fn level(&self) -> Option<u32> {
        self.level
    }

    /// Build the compressor for this setting.
    pub fn compressor(&self) -> Box<dyn Compressor> {
        // Parsing only admits known algorithms.
        Box::new(Gzip::new(self.level))
    }
}

impl FromStr for Compression {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || ConfigError::InvalidCompression(s.to_string());
        let (algo, level) = match s.trim().split_once(':') {
            Some((algo, level)) => (algo, Some(level.parse::<u32>().map_err(|_| invalid())?)),
            None => (s.trim(), None),
        };
        if algo != gzip::NAME {
            return Err(invalid());
        }
        if level.is_some_and(|l| l > 9) {
            return Err(invalid());
        }
        Ok(Self {
            algo: algo.to_string(),
            level,
        })
    }
}

impl fmt::Display for Compression {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.level {
            Some(level) => write!(f, "{}:{}", self.algo, level),
            None => f.write_str(&self.algo),
        }
    }
}
