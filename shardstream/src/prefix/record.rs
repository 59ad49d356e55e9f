//! Registration record wire format.
//!
//! ```text
//! +----------------+--------------------------------------+
//! | len: i32 LE    | dir_0 \0 dir_1 \0 ... \0 dir_n (UTF-8) |
//! +----------------+--------------------------------------+
//! ```
//!
//! `len` covers the header and the payload, so a record may sit in a larger
//! segment with trailing padding. Directories are written sorted.

use std::collections::BTreeSet;

use super::PrefixError;

/// Size of the length header.
pub const HEADER_LEN: usize = 4;

const SEPARATOR: char = '\0';

/// Encode a set of directories into a registration record.
pub fn pack_locals(dirs: &BTreeSet<String>) -> Result<Vec<u8>, PrefixError> {
    let mut text = String::new();
    for (i, dir) in dirs.iter().enumerate() {
        if dir.contains(SEPARATOR) {
            return Err(PrefixError::InvalidLocalDir(dir.clone()));
        }
        if i > 0 {
            text.push(SEPARATOR);
        }
        text.push_str(dir);
    }

    let len = HEADER_LEN + text.len();
    let header = i32::try_from(len)
        .map_err(|_| PrefixError::Record(format!("record of {} bytes is too large", len)))?;

    let mut data = Vec::with_capacity(len);
    data.extend_from_slice(&header.to_le_bytes());
    data.extend_from_slice(text.as_bytes());
    Ok(data)
}

/// Decode a registration record, ignoring any bytes past its declared length.
pub fn unpack_locals(data: &[u8]) -> Result<BTreeSet<String>, PrefixError> {
    let header: [u8; HEADER_LEN] = data
        .get(..HEADER_LEN)
        .and_then(|h| h.try_into().ok())
        .ok_or_else(|| {
            PrefixError::Record(format!("record of {} bytes has no header", data.len()))
        })?;

    let len = i32::from_le_bytes(header);
    let len = usize::try_from(len)
        .ok()
        .filter(|&len| (HEADER_LEN..=data.len()).contains(&len))
        .ok_or_else(|| {
            PrefixError::Record(format!(
                "declared length {} does not fit a {} byte segment",
                len,
                data.len()
            ))
        })?;

    let text = std::str::from_utf8(&data[HEADER_LEN..len])
        .map_err(|e| PrefixError::Record(format!("payload is not UTF-8: {}", e)))?;
    if text.is_empty() {
        return Ok(BTreeSet::new());
    }
    Ok(text.split(SEPARATOR).map(str::to_string).collect())
}
