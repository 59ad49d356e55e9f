//! Keep-phases eviction policy.
//!
//! After every phase transition a shard file asks this policy which of its
//! local phases may be deleted. A phase is only ever deleted in favour of a
//! later phase that is both kept and already local, so the policy can never
//! remove the last usable copy of a file and never touches an unconfigured
//! slot.

use std::fmt;
use std::str::FromStr;

use super::locality::{Locality, PhaseDels, PhaseKind, PhaseLocs, NUM_PHASES};
use crate::config::ConfigError;

/// Which phases must remain resident once produced.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct KeepPhases {
    keep: [bool; NUM_PHASES],
}

impl KeepPhases {
    /// Keep every phase that gets produced.
    pub const fn all() -> Self {
        Self { keep: [true; NUM_PHASES] }
    }

    /// Keep exactly the given phases.
    ///
    /// Fails if `phases` is empty or names a phase twice.
    pub fn only(phases: &[PhaseKind]) -> Result<Self, ConfigError> {
        if phases.is_empty() {
            return Err(ConfigError::EmptyKeepPhases);
        }
        let mut keep = [false; NUM_PHASES];
        for phase in phases {
            if keep[phase.index()] {
                return Err(ConfigError::ConflictingKeepPhases(phase.to_string()));
            }
            keep[phase.index()] = true;
        }
        Ok(Self { keep })
    }

    /// Whether `phase` is in the keep set.
    pub fn keeps(&self, phase: PhaseKind) -> bool {
        self.keep[phase.index()]
    }

    /// Map a locality vector to the phases that should be deleted.
    ///
    /// A local phase is flagged iff it is not kept and some later phase is
    /// both kept and local. Applying the result and recomputing localities
    /// always yields an all-false vector.
    pub fn get_phase_deletions(&self, locs: &PhaseLocs) -> PhaseDels {
        let mut dels = [false; NUM_PHASES];
        // Scan backwards, remembering whether a kept phase is resident downstream.
        let mut kept_downstream = false;
        for i in (0..NUM_PHASES).rev() {
            if locs[i] != Locality::Local {
                continue;
            }
            if self.keep[i] {
                kept_downstream = true;
            } else if kept_downstream {
                dels[i] = true;
            }
        }
        dels
    }
}

impl Default for KeepPhases {
    /// Drop the compressed form once a later phase is resident.
    fn default() -> Self {
        Self {
            keep: [false, true, true],
        }
    }
}

impl FromStr for KeepPhases {
    type Err = ConfigError;

    /// Parse `"all"` or a comma-separated list of `zip`, `raw`, `can`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if s.eq_ignore_ascii_case("all") {
            return Ok(Self::all());
        }
        let mut phases = Vec::new();
        for part in s.split(',').map(str::trim).filter(|p| !p.is_empty()) {
            let phase = match part.to_ascii_lowercase().as_str() {
                "zip" => PhaseKind::Zip,
                "raw" => PhaseKind::Raw,
                "can" => PhaseKind::Can,
                _ => return Err(ConfigError::UnknownPhase(part.to_string())),
            };
            phases.push(phase);
        }
        Self::only(&phases)
    }
}

impl fmt::Display for KeepPhases {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let names: Vec<&str> = PhaseKind::ALL
            .iter()
            .filter(|p| self.keeps(**p))
            .map(|p| p.as_str())
            .collect();
        f.write_str(&names.join(","))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use Locality::{Dne, Local, Remote};

    fn every_locality_vector() -> Vec<PhaseLocs> {
        let opts = [Dne, Remote, Local];
        let mut out = Vec::new();
        for a in opts {
            for b in opts {
                for c in opts {
                    out.push([a, b, c]);
                }
            }
        }
        out
    }

    fn every_keep_setting() -> Vec<KeepPhases> {
        (1u8..8)
            .map(|mask| KeepPhases {
                keep: [mask & 1 != 0, mask & 2 != 0, mask & 4 != 0],
            })
            .collect()
    }

    #[test]
    fn test_canonical_only_without_canonical_phase() {
        let keep: KeepPhases = "can".parse().unwrap();
        assert_eq!(
            keep.get_phase_deletions(&[Local, Local, Dne]),
            [false, false, false]
        );
    }

    #[test]
    fn test_canonical_only_with_canonical_present() {
        let keep: KeepPhases = "can".parse().unwrap();
        assert_eq!(
            keep.get_phase_deletions(&[Local, Local, Local]),
            [true, true, false]
        );
    }

    #[test]
    fn test_raw_survives_until_canonical_exists() {
        let keep: KeepPhases = "can".parse().unwrap();
        assert_eq!(
            keep.get_phase_deletions(&[Dne, Local, Remote]),
            [false, false, false]
        );
    }

    #[test]
    fn test_default_drops_zip_after_decompress() {
        let keep = KeepPhases::default();
        assert_eq!(
            keep.get_phase_deletions(&[Local, Local, Dne]),
            [true, false, false]
        );
        // Freshly downloaded zip is not touched before it is decompressed.
        assert_eq!(
            keep.get_phase_deletions(&[Local, Remote, Dne]),
            [false, false, false]
        );
    }

    #[test]
    fn test_never_flags_dne_and_is_idempotent() {
        for keep in every_keep_setting() {
            for locs in every_locality_vector() {
                let dels = keep.get_phase_deletions(&locs);
                let mut after = locs;
                for i in 0..NUM_PHASES {
                    if locs[i] == Dne {
                        assert!(!dels[i], "flagged DNE slot: {keep} {locs:?}");
                    }
                    if dels[i] {
                        assert_eq!(locs[i], Local);
                        after[i] = Remote;
                    }
                }
                assert_eq!(
                    keep.get_phase_deletions(&after),
                    [false; NUM_PHASES],
                    "not idempotent: {keep} {locs:?}"
                );
            }
        }
    }

    #[test]
    fn test_never_deletes_every_local_phase() {
        for keep in every_keep_setting() {
            for locs in every_locality_vector() {
                let dels = keep.get_phase_deletions(&locs);
                let local = locs.iter().filter(|l| **l == Local).count();
                let deleted = dels.iter().filter(|d| **d).count();
                if local > 0 {
                    assert!(deleted < local);
                }
            }
        }
    }

    #[test]
    fn test_parse() {
        assert_eq!("all".parse::<KeepPhases>().unwrap(), KeepPhases::all());
        assert_eq!(
            " raw , can ".parse::<KeepPhases>().unwrap(),
            KeepPhases::default()
        );
        assert!(matches!(
            "".parse::<KeepPhases>(),
            Err(ConfigError::EmptyKeepPhases)
        ));
        assert!(matches!(
            "raw,bogus".parse::<KeepPhases>(),
            Err(ConfigError::UnknownPhase(_))
        ));
        assert!(matches!(
            "raw,raw".parse::<KeepPhases>(),
            Err(ConfigError::ConflictingKeepPhases(_))
        ));
    }

    #[test]
    fn test_display() {
        assert_eq!(KeepPhases::default().to_string(), "raw,can");
        assert_eq!(KeepPhases::all().to_string(), "zip,raw,can");
    }
}
