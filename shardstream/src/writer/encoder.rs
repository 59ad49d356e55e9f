//! Shard encodings.
//!
//! An encoder turns one sample into bytes as it arrives, and a buffer of
//! encoded samples into the physical file(s) of a shard at flush time.

use std::collections::BTreeMap;

use serde_json::Value;

use super::WriteError;

/// Bytes of a flushed shard.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EncodedShard {
    /// One self-describing file.
    Single(Vec<u8>),
    /// A data file plus a meta file indexing into it.
    Dual { data: Vec<u8>, meta: Vec<u8> },
}

/// A shard file format.
pub trait ShardEncoder: Send {
    type Sample: ?Sized;

    /// Format name, used as the shard file extension.
    fn format(&self) -> &str;

    fn encode_sample(&self, sample: &Self::Sample) -> Result<Vec<u8>, WriteError>;

    /// Build shard number `shard` from samples encoded by
    /// [`encode_sample`](Self::encode_sample).
    fn encode_shard(
        &self,
        shard: usize,
        samples: &[Vec<u8>],
    ) -> Result<EncodedShard, WriteError>;

    /// Per-shard bytes added on top of the samples, counted against the size
    /// limit.
    fn extra_bytes_per_shard(&self) -> u64 {
        0
    }

    /// Per-sample bytes added on top of its encoding.
    fn extra_bytes_per_sample(&self) -> u64 {
        0
    }

    /// Column schema recorded in the index, if the format has one.
    fn columns(&self) -> Option<BTreeMap<String, String>> {
        None
    }
}

/// Newline-delimited JSON data with a binary offsets meta file.
///
/// The meta file is little-endian `u32`s: the sample count `n`, then `n + 1`
/// offsets into the data file. Sample `i` spans `offsets[i]..offsets[i + 1]`
/// including its trailing newline.
#[derive(Debug, Clone, Default)]
pub struct JsonlEncoder {
    columns: Option<BTreeMap<String, String>>,
}

const OFFSET_BYTES: u64 = 4;

impl JsonlEncoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Require every sample to be an object with exactly these keys. Values
    /// name the column type and are recorded as-is.
    pub fn with_columns(mut self, columns: BTreeMap<String, String>) -> Self {
        self.columns = Some(columns);
        self
    }

    fn check_columns(&self, sample: &Value) -> Result<(), WriteError> {
        let Some(columns) = &self.columns else {
            return Ok(());
        };
        let Some(object) = sample.as_object() else {
            return Err(WriteError::InvalidSample("expected a JSON object".to_string()));
        };
        if object.len() != columns.len() || !columns.keys().all(|k| object.contains_key(k)) {
            let mut got: Vec<&str> = object.keys().map(String::as_str).collect();
            got.sort_unstable();
            return Err(WriteError::InvalidSample(format!(
                "keys {:?} do not match columns {:?}",
                got,
                columns.keys().collect::<Vec<_>>()
            )));
        }
        Ok(())
    }
}

impl ShardEncoder for JsonlEncoder {
    type Sample = Value;

    fn format(&self) -> &str {
        "jsonl"
    }

    fn encode_sample(&self, sample: &Value) -> Result<Vec<u8>, WriteError> {
        self.check_columns(sample)?;
        let mut line = serde_json::to_vec(sample)?;
        line.push(b'\n');
        Ok(line)
    }

    fn encode_shard(
        &self,
        shard: usize,
        samples: &[Vec<u8>],
    ) -> Result<EncodedShard, WriteError> {
        let too_large = |what: &str| WriteError::Encode {
            shard,
            reason: format!("{} does not fit in a u32 offset", what),
        };

        let count = u32::try_from(samples.len()).map_err(|_| too_large("sample count"))?;
        let mut meta = Vec::with_capacity((samples.len() + 2) * OFFSET_BYTES as usize);
        meta.extend_from_slice(&count.to_le_bytes());

        let mut offset: u32 = 0;
        meta.extend_from_slice(&offset.to_le_bytes());
        for sample in samples {
            let len = u32::try_from(sample.len()).map_err(|_| too_large("sample"))?;
            offset = offset.checked_add(len).ok_or_else(|| too_large("data file"))?;
            meta.extend_from_slice(&offset.to_le_bytes());
        }

        Ok(EncodedShard::Dual {
            data: samples.concat(),
            meta,
        })
    }

    fn extra_bytes_per_shard(&self) -> u64 {
        2 * OFFSET_BYTES
    }

    fn extra_bytes_per_sample(&self) -> u64 {
        OFFSET_BYTES
    }

    fn columns(&self) -> Option<BTreeMap<String, String>> {
        self.columns.clone()
    }
}

/// Decode every sample of a JSONL shard from its data and meta files.
pub fn read_jsonl_samples(data: &[u8], meta: &[u8]) -> Result<Vec<Value>, WriteError> {
    let malformed =
        |reason: String| WriteError::InvalidSample(format!("malformed shard: {}", reason));

    let words: Vec<u32> = meta
        .chunks_exact(OFFSET_BYTES as usize)
        .map(|c| u32::from_le_bytes([c[0], c[1], c[2], c[3]]))
        .collect();
    let (&count, offsets) = words
        .split_first()
        .ok_or_else(|| malformed("empty meta file".to_string()))?;
    if offsets.len() != count as usize + 1 {
        return Err(malformed(format!(
            "{} offsets for {} samples",
            offsets.len(),
            count
        )));
    }

    offsets
        .windows(2)
        .map(|w| -> Result<Value, WriteError> {
            let line = data
                .get(w[0] as usize..w[1] as usize)
                .ok_or_else(|| malformed(format!("offset {}..{} out of range", w[0], w[1])))?;
            Ok(serde_json::from_slice(line)?)
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_jsonl_shard_layout() {
        let encoder = JsonlEncoder::new();
        let samples = vec![
            encoder.encode_sample(&json!({"a": 1})).unwrap(),
            encoder.encode_sample(&json!({"a": 22})).unwrap(),
        ];
        let EncodedShard::Dual { data, meta } = encoder.encode_shard(0, &samples).unwrap() else {
            panic!("expected a dual shard");
        };

        assert_eq!(data, b"{\"a\":1}\n{\"a\":22}\n");
        let words: Vec<u32> = meta
            .chunks_exact(4)
            .map(|c| u32::from_le_bytes(c.try_into().unwrap()))
            .collect();
        assert_eq!(words, vec![2, 0, 8, 17]);

        let decoded = read_jsonl_samples(&data, &meta).unwrap();
        assert_eq!(decoded, vec![json!({"a": 1}), json!({"a": 22})]);
    }

    #[test]
    fn test_columns_are_enforced() {
        let columns: BTreeMap<String, String> =
            [("id".to_string(), "int".to_string()), ("text".to_string(), "str".to_string())]
                .into();
        let encoder = JsonlEncoder::new().with_columns(columns.clone());

        assert!(encoder.encode_sample(&json!({"id": 1, "text": "x"})).is_ok());
        assert!(encoder.encode_sample(&json!({"id": 1})).is_err());
        assert!(encoder.encode_sample(&json!({"id": 1, "text": "x", "extra": 0})).is_err());
        assert!(encoder.encode_sample(&json!([1, 2])).is_err());
        assert_eq!(encoder.columns(), Some(columns));
    }

    #[test]
    fn test_read_rejects_bad_meta() {
        assert!(read_jsonl_samples(b"", b"").is_err());
        let mut meta = Vec::new();
        for word in [1u32, 0, 100] {
            meta.extend_from_slice(&word.to_le_bytes());
        }
        assert!(read_jsonl_samples(b"{}\n", &meta).is_err());
    }
}
