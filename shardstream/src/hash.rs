//! Content digests recorded by the writer and checked on the read path.

use std::fmt;
use std::fs::File;
use std::io::{self, BufReader, Read};
use std::path::Path;
use std::str::FromStr;

use sha2::{Digest, Sha256};

use crate::config::ConfigError;

/// Supported hash algorithms.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum HashAlgo {
    Sha256,
}

impl HashAlgo {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Sha256 => "sha256",
        }
    }

    /// Lowercase hex digest of an in-memory buffer.
    pub fn digest(&self, data: &[u8]) -> String {
        match self {
            Self::Sha256 => format!("{:x}", Sha256::digest(data)),
        }
    }

    /// Lowercase hex digest of a file, read in fixed-size blocks.
    pub fn digest_file(&self, path: &Path) -> io::Result<String> {
        let mut reader = BufReader::new(File::open(path)?);
        let mut hasher = Sha256::new();
        let mut buffer = [0u8; 8192];
        loop {
            let n = reader.read(&mut buffer)?;
            if n == 0 {
                break;
            }
            hasher.update(&buffer[..n]);
        }
        Ok(format!("{:x}", hasher.finalize()))
    }
}

impl fmt::Display for HashAlgo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for HashAlgo {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "sha256" => Ok(Self::Sha256),
            _ => Err(ConfigError::InvalidValue {
                key: "hash".to_string(),
                reason: format!("unsupported algorithm '{}'", s),
            }),
        }
    }
}

/// A digest a phase file is expected to match.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExpectedHash {
    pub algo: HashAlgo,
    pub digest: String,
}

impl ExpectedHash {
    pub fn new(algo: HashAlgo, digest: impl Into<String>) -> Self {
        Self {
            algo,
            digest: digest.into(),
        }
    }
}
