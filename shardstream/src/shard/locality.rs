//! Phase identity and per-phase locality vectors.

use std::fmt;

/// Number of phase slots every shard file carries.
pub const NUM_PHASES: usize = 3;

/// Where the bytes of one phase of a shard file currently live.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Locality {
    /// The phase is not configured for this file.
    Dne,
    /// Configured, but only available remotely.
    Remote,
    /// Present in the local cache directory.
    Local,
}

impl Locality {
    /// Locality of a configured phase given whether its file is present.
    pub fn of_present(present: bool) -> Self {
        if present {
            Self::Local
        } else {
            Self::Remote
        }
    }
}

/// Position of a phase along the zip -> raw -> can pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum PhaseKind {
    /// Compressed, as stored remotely.
    Zip = 0,
    /// Decompressed bytes in the shard format.
    Raw = 1,
    /// Canonicalized form used on the read path.
    Can = 2,
}

impl PhaseKind {
    /// All phases in pipeline order.
    pub const ALL: [PhaseKind; NUM_PHASES] = [PhaseKind::Zip, PhaseKind::Raw, PhaseKind::Can];

    /// Slot index of this phase.
    pub fn index(self) -> usize {
        self as usize
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Zip => "zip",
            Self::Raw => "raw",
            Self::Can => "can",
        }
    }
}

impl fmt::Display for PhaseKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Locality of each phase slot, indexed by [`PhaseKind::index`].
pub type PhaseLocs = [Locality; NUM_PHASES];

/// Deletion decision for each phase slot.
pub type PhaseDels = [bool; NUM_PHASES];

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_phase_order() {
        assert!(PhaseKind::Zip < PhaseKind::Raw);
        assert!(PhaseKind::Raw < PhaseKind::Can);
        for (i, kind) in PhaseKind::ALL.iter().enumerate() {
            assert_eq!(kind.index(), i);
        }
    }

    #[test]
    fn test_of_present() {
        assert_eq!(Locality::of_present(true), Locality::Local);
        assert_eq!(Locality::of_present(false), Locality::Remote);
    }

    #[test]
    fn test_display() {
        assert_eq!(PhaseKind::Can.to_string(), "can");
    }
}
