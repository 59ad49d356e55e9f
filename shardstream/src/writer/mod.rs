//! Dataset authoring: samples in, shard files and `index.json` out.
//!
//! [`ShardWriter`] buffers encoded samples until the next one would push the
//! shard over its size limit, then flushes the shard to disk and queues its
//! uploads on an [`UploadPool`](crate::upload::UploadPool). The index is
//! written once every shard upload has succeeded.

mod encoder;
mod error;
mod index;
mod shard_writer;

pub use encoder::{read_jsonl_samples, EncodedShard, JsonlEncoder, ShardEncoder};
pub use error::WriteError;
pub use index::{FileInfo, Index, ShardDescriptor, INDEX_BASENAME, INDEX_VERSION};
pub use shard_writer::ShardWriter;
