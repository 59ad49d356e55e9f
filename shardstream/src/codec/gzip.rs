//! Gzip codec backed by flate2.

use std::io::{Read, Write};

use flate2::read::GzDecoder;
use flate2::write::GzEncoder;

use super::{CodecError, Compressor, Decompressor};

pub(super) const NAME: &str = "gz";

/// Default flate2 compression level.
const DEFAULT_LEVEL: u32 = 6;

#[derive(Debug, Clone, Copy)]
pub struct Gzip {
    level: u32,
}

impl Gzip {
    pub fn new(level: Option<u32>) -> Self {
        Self {
            level: level.unwrap_or(DEFAULT_LEVEL),
        }
    }
}

impl Default for Gzip {
    fn default() -> Self {
        Self::new(None)
    }
}

impl Decompressor for Gzip {
    fn decompress(&self, data: &[u8]) -> Result<Vec<u8>, CodecError> {
        let mut out = Vec::with_capacity(data.len() * 2);
        GzDecoder::new(data)
            .read_to_end(&mut out)
            .map_err(|e| CodecError::Failed {
                algo: NAME.to_string(),
                message: e.to_string(),
            })?;
        Ok(out)
    }
}

impl Compressor for Gzip {
    fn compress(&self, data: &[u8]) -> Result<Vec<u8>, CodecError> {
        let mut encoder = GzEncoder::new(Vec::new(), flate2::Compression::new(self.level));
        encoder.write_all(data)?;
        Ok(encoder.finish()?)
    }

    fn extension(&self) -> &str {
        NAME
    }
}
