//! Local shard cache: directory listing and the disk budget.

mod budget;
mod listing;

pub use budget::ShardCache;
pub use listing::walk_listing;
