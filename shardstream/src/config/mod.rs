//! Configuration types shared across the read and write paths.
//!
//! Settings are grouped into small builder-style structs with sensible
//! defaults. Sizes may be given in human-readable form via [`parse_size`].
//!
//! # Example
//!
//! ```
//! use shardstream::config::{parse_size, WriterConfig};
//!
//! let config = WriterConfig::new("/tmp/out")
//!     .with_size_limit(Some(parse_size("32MB").unwrap()))
//!     .with_retry(3);
//! assert_eq!(config.retry(), 3);
//! ```

mod size;
mod writer;

pub use size::{format_size, parse_size, SizeParseError};
pub use writer::{WriterConfig, DEFAULT_RETRY, DEFAULT_SIZE_LIMIT};

use thiserror::Error;

/// Errors raised for invalid user-supplied configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// A keep-phases setting named no phases at all.
    #[error("Keep phases must name at least one phase")]
    EmptyKeepPhases,

    /// A keep-phases setting named an unknown phase.
    #[error("Unknown phase '{0}' in keep phases (expected zip, raw or can)")]
    UnknownPhase(String),

    /// A keep-phases setting named the same phase twice.
    #[error("Phase '{0}' given more than once in keep phases")]
    ConflictingKeepPhases(String),

    /// A size could not be parsed.
    #[error(transparent)]
    Size(#[from] SizeParseError),

    /// Compression setting was malformed or names an unknown algorithm.
    #[error("Invalid compression '{0}' (expected e.g. 'gz' or 'gz:6')")]
    InvalidCompression(String),

    /// Process topology is inconsistent.
    #[error("Invalid topology: {0}")]
    InvalidTopology(String),

    /// Any other invalid setting.
    #[error("Invalid value for {key}: {reason}")]
    InvalidValue { key: String, reason: String },
}
