//! Human-readable byte sizes ("64MB", "1 GB", "4096").

use thiserror::Error;

/// Error parsing a size string.
#[derive(Debug, Error, PartialEq, Eq)]
#[error("Invalid size '{input}' - expected format like '64MB', '1GB', or '4096'")]
pub struct SizeParseError {
    input: String,
}

impl SizeParseError {
    fn new(input: impl Into<String>) -> Self {
        Self {
            input: input.into(),
        }
    }
}

const KB: u64 = 1 << 10;
const MB: u64 = 1 << 20;
const GB: u64 = 1 << 30;
const TB: u64 = 1 << 40;

/// Suffixes longest first so "MB" is tried before "B".
const SUFFIXES: [(&str, u64); 9] = [
    ("TB", TB),
    ("GB", GB),
    ("MB", MB),
    ("KB", KB),
    ("T", TB),
    ("G", GB),
    ("M", MB),
    ("K", KB),
    ("B", 1),
];

/// Parse a human-readable size string into bytes.
///
/// Suffixes are binary multiples and case-insensitive; a bare number is bytes.
///
/// ```
/// use shardstream::config::parse_size;
///
/// assert_eq!(parse_size("4096").unwrap(), 4096);
/// assert_eq!(parse_size("64MB").unwrap(), 64 << 20);
/// assert_eq!(parse_size("1 gb").unwrap(), 1 << 30);
/// ```
pub fn parse_size(s: &str) -> Result<u64, SizeParseError> {
    let trimmed = s.trim();
    let upper = trimmed.to_ascii_uppercase();

    let (num_part, multiplier) = SUFFIXES
        .iter()
        .find(|(suffix, _)| upper.ends_with(suffix))
        .map(|(suffix, mult)| (&trimmed[..trimmed.len() - suffix.len()], *mult))
        .unwrap_or((trimmed, 1));

    let num_part = num_part.trim();
    if num_part.is_empty() || !num_part.bytes().all(|b| b.is_ascii_digit()) {
        return Err(SizeParseError::new(s));
    }

    let num: u64 = num_part.parse().map_err(|_| SizeParseError::new(s))?;
    num.checked_mul(multiplier)
        .ok_or_else(|| SizeParseError::new(s))
}

/// Format a byte count using the largest suffix that divides it evenly.
pub fn format_size(bytes: u64) -> String {
    for (suffix, mult) in [("TB", TB), ("GB", GB), ("MB", MB), ("KB", KB)] {
        if bytes >= mult && bytes % mult == 0 {
            return format!("{}{}", bytes / mult, suffix);
        }
    }
    bytes.to_string()
}
