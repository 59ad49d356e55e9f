//! Shard file lifecycle: phases, locality and the keep-phases eviction policy.
//!
//! A [`ShardFile`] owns up to three [`ShardFilePhase`]s (zip, raw, can) and
//! drives them forward on [`load`](ShardFile::load). After every transition
//! the stream's [`KeepPhases`] decides which upstream phases to delete.
//!
//! Every operation that touches the disk returns a signed usage delta in
//! bytes. The caller owns the running total (see [`crate::cache::ShardCache`]).

mod error;
mod file;
mod keep;
mod locality;
mod phase;

pub use error::{ShardError, ShardResult};
pub use file::{PhaseSlot, ShardFile};
pub use keep::KeepPhases;
pub use locality::{Locality, PhaseDels, PhaseKind, PhaseLocs, NUM_PHASES};
pub use phase::{PhaseMeta, ShardFilePhase, TMP_SUFFIX};
