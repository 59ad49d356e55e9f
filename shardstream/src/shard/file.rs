//! A shard file and its zip -> raw -> can lifecycle.
//!
//! ```text
//!        remote
//!          |
//!     Downloading
//!          |
//!        [zip]
//!          |
//!    Decompression
//!          |
//!        [raw]
//!          |
//!   Canonicalization
//!          |
//!        [can]
//!          |
//!      Eviction
//! ```
//!
//! Every file has a raw phase; zip and can are optional. Files move forward
//! through their configured phases only, are downloaded in their first phase
//! and read in their last. After each transition the stream's keep policy
//! decides which upstream phases are deleted on the spot.

use std::collections::HashSet;
use std::fs;
use std::sync::Arc;

use tracing::{debug, trace};

use super::error::{ShardError, ShardResult};
use super::locality::{Locality, PhaseDels, PhaseKind, PhaseLocs, NUM_PHASES};
use super::phase::{discard, PhaseMeta, ShardFilePhase};
use crate::stream::StreamContext;

/// One slot of the fixed three-phase set.
#[derive(Debug, Clone)]
pub enum PhaseSlot {
    Absent,
    Configured(ShardFilePhase),
}

impl PhaseSlot {
    pub fn phase(&self) -> Option<&ShardFilePhase> {
        match self {
            Self::Absent => None,
            Self::Configured(phase) => Some(phase),
        }
    }
}

/// Metadata and lifecycle driver for one file of a shard.
///
/// All usage-returning methods report the signed change in local disk
/// usage, in bytes, for the caller to accumulate against its budget.
#[derive(Debug, Clone)]
pub struct ShardFile {
    ctx: Arc<StreamContext>,
    phases: [PhaseSlot; NUM_PHASES],
}

impl ShardFile {
    /// A file with only a raw phase.
    pub fn new(ctx: Arc<StreamContext>, raw: PhaseMeta) -> Self {
        let raw = ShardFilePhase::new(ctx.clone(), PhaseKind::Raw, None, raw);
        Self {
            ctx,
            phases: [
                PhaseSlot::Absent,
                PhaseSlot::Configured(raw),
                PhaseSlot::Absent,
            ],
        }
    }

    /// Add a compressed phase decompressed with `algo`.
    pub fn with_zip(mut self, algo: impl Into<String>, zip: PhaseMeta) -> Self {
        let phase = ShardFilePhase::new(self.ctx.clone(), PhaseKind::Zip, Some(algo.into()), zip);
        self.phases[PhaseKind::Zip.index()] = PhaseSlot::Configured(phase);
        self
    }

    /// Add a canonical phase produced from raw with `algo`.
    pub fn with_can(mut self, algo: impl Into<String>, can: PhaseMeta) -> Self {
        let phase = ShardFilePhase::new(self.ctx.clone(), PhaseKind::Can, Some(algo.into()), can);
        self.phases[PhaseKind::Can.index()] = PhaseSlot::Configured(phase);
        self
    }

    pub fn phase(&self, kind: PhaseKind) -> Option<&ShardFilePhase> {
        self.phases[kind.index()].phase()
    }

    pub fn raw_phase(&self) -> ShardResult<&ShardFilePhase> {
        self.phase(PhaseKind::Raw)
            .ok_or_else(|| ShardError::InternalConsistency("shard file has no raw phase".into()))
    }

    /// Phase read by consumers: can if configured, else raw.
    pub fn terminal_phase(&self) -> ShardResult<&ShardFilePhase> {
        match self.phase(PhaseKind::Can) {
            Some(can) => Ok(can),
            None => self.raw_phase(),
        }
    }

    /// Phase downloaded from remote: zip if configured, else raw.
    pub fn first_phase(&self) -> ShardResult<&ShardFilePhase> {
        match self.phase(PhaseKind::Zip) {
            Some(zip) => Ok(zip),
            None => self.raw_phase(),
        }
    }

    fn configured(&self) -> impl Iterator<Item = &ShardFilePhase> {
        self.phases.iter().filter_map(PhaseSlot::phase)
    }

    /// Check that this file may be part of its stream.
    ///
    /// Only the first phase is downloaded, so only it is held to the download
    /// size limit. Algorithms must be registered with the stream's codecs.
    pub fn validate(&self) -> ShardResult<()> {
        if self.ctx.conf().download_max_size().is_some() {
            self.first_phase()?.validate_for_download()?;
        }
        if let Some(zip) = self.phase(PhaseKind::Zip) {
            let algo = zip.algo().unwrap_or_default();
            if !self.ctx.codecs().has_decompressor(algo) {
                return Err(ShardError::InternalConsistency(format!(
                    "no decompressor registered for '{}' ({})",
                    algo,
                    zip.basename()
                )));
            }
        }
        if let Some(can) = self.phase(PhaseKind::Can) {
            let algo = can.algo().unwrap_or_default();
            if !self.ctx.codecs().has_canonicalizer(algo) {
                return Err(ShardError::InternalConsistency(format!(
                    "no canonicalizer registered for '{}' ({})",
                    algo,
                    can.basename()
                )));
            }
        }
        Ok(())
    }

    /// Locality of each phase according to a recursive directory listing.
    pub fn locate(&self, listing: &HashSet<String>) -> PhaseLocs {
        self.locs_with(|phase| phase.probe(listing))
    }

    /// Locality of each phase according to the filesystem.
    fn current_locs(&self) -> PhaseLocs {
        self.locs_with(ShardFilePhase::is_local)
    }

    fn locs_with(&self, mut present: impl FnMut(&ShardFilePhase) -> bool) -> PhaseLocs {
        let mut locs = [Locality::Dne; NUM_PHASES];
        for (loc, slot) in locs.iter_mut().zip(&self.phases) {
            if let PhaseSlot::Configured(phase) = slot {
                *loc = Locality::of_present(present(phase));
            }
        }
        locs
    }

    /// Normalize a possibly stale local directory to a coherent state.
    ///
    /// Counts the usage of every present phase, then applies the keep policy
    /// once so that leftovers of a previous configuration are reclaimed.
    pub fn init_dir(&self, listing: &HashSet<String>) -> ShardResult<i64> {
        let mut locs = [Locality::Dne; NUM_PHASES];
        let mut du = 0;
        for (loc, slot) in locs.iter_mut().zip(&self.phases) {
            if let PhaseSlot::Configured(phase) = slot {
                du += phase.init_dir(listing)?;
                *loc = Locality::of_present(phase.probe(listing));
            }
        }
        let dels = self.ctx.conf().keep_phases().get_phase_deletions(&locs);
        Ok(du + self.evict_phases(&dels)?)
    }

    /// Download, decompress and canonicalize as needed until the terminal
    /// phase is local. A no-op when it already is.
    pub fn load(&self) -> ShardResult<i64> {
        if self.terminal_phase()?.is_local() {
            return Ok(0);
        }
        let mut ddu = self.load_raw()?;
        if self.phase(PhaseKind::Can).is_some() {
            ddu += self.canonicalize()?;
        }
        Ok(ddu)
    }

    fn load_raw(&self) -> ShardResult<i64> {
        let raw = self.raw_phase()?;
        if raw.is_local() {
            return Ok(0);
        }
        let ddu = match self.phase(PhaseKind::Zip) {
            Some(zip) => {
                let fetched = if zip.is_local() { 0 } else { zip.download()? };
                // Zip is the only local phase until raw exists, so there is
                // nothing the keep policy could drop yet.
                fetched + self.decompress()?
            }
            None => raw.download()?,
        };
        Ok(ddu + self.apply_keep_policy()?)
    }

    /// Zip -> raw. Both sizes are checked before anything is written.
    fn decompress(&self) -> ShardResult<i64> {
        let zip = self.phase(PhaseKind::Zip).ok_or_else(|| {
            ShardError::InternalConsistency("decompress requested without a zip phase".into())
        })?;
        let raw = self.raw_phase()?;

        let zip_path = zip.get_local_filename();
        let zip_data = fs::read(&zip_path).map_err(|e| ShardError::io(&zip_path, e))?;
        zip.check_bytes(&zip_data)?;

        let algo = zip.algo().unwrap_or_default();
        let raw_data =
            self.ctx
                .codecs()
                .decompress(algo, &zip_data)
                .map_err(|source| ShardError::Codec {
                    file: zip.basename().to_string(),
                    source,
                })?;

        let ddu = raw.write_atomic(&raw_data)?;
        trace!(
            file = raw.basename(),
            zip_bytes = zip_data.len(),
            raw_bytes = raw_data.len(),
            "Decompressed shard file"
        );
        Ok(ddu)
    }

    /// Raw -> can, via a temp path renamed only after the size check.
    fn canonicalize(&self) -> ShardResult<i64> {
        let can = self.phase(PhaseKind::Can).ok_or_else(|| {
            ShardError::InternalConsistency("canonicalize requested without a can phase".into())
        })?;
        let raw = self.raw_phase()?;

        let tmp = can.tmp_filename();
        let algo = can.algo().unwrap_or_default();
        if let Err(source) = self
            .ctx
            .codecs()
            .canonicalize(algo, &raw.get_local_filename(), &tmp)
        {
            discard(&tmp);
            return Err(ShardError::Codec {
                file: raw.basename().to_string(),
                source,
            });
        }

        let can_size = match fs::metadata(&tmp) {
            Ok(meta) => meta.len(),
            Err(e) => {
                discard(&tmp);
                return Err(ShardError::io(&tmp, e));
            }
        };
        if let Err(e) = can.check_size(can_size) {
            discard(&tmp);
            return Err(e);
        }
        can.commit(&tmp)?;
        debug!(file = can.basename(), bytes = can_size, "Canonicalized shard file");

        Ok(can_size as i64 + self.apply_keep_policy()?)
    }

    /// Recompute localities and delete whatever the keep policy flags.
    fn apply_keep_policy(&self) -> ShardResult<i64> {
        let locs = self.current_locs();
        let dels = self.ctx.conf().keep_phases().get_phase_deletions(&locs);
        self.evict_phases(&dels)
    }

    /// Delete every present phase of this file.
    pub fn evict(&self) -> ShardResult<i64> {
        let mut ddu = 0;
        for phase in self.configured() {
            ddu += phase.evict()?;
        }
        Ok(ddu)
    }

    /// Delete exactly the flagged phases.
    ///
    /// Flagging an unconfigured phase is a caller bug and is rejected before
    /// anything is deleted.
    pub fn evict_phases(&self, dels: &PhaseDels) -> ShardResult<i64> {
        for (kind, (slot, del)) in PhaseKind::ALL.iter().zip(self.phases.iter().zip(dels)) {
            if *del && matches!(slot, PhaseSlot::Absent) {
                return Err(ShardError::InternalConsistency(format!(
                    "attempted to evict the unconfigured {} phase of '{}'",
                    kind,
                    self.raw_phase()?.basename()
                )));
            }
        }
        let mut ddu = 0;
        for (slot, del) in self.phases.iter().zip(dels) {
            if let (PhaseSlot::Configured(phase), true) = (slot, *del) {
                ddu += phase.evict()?;
            }
        }
        Ok(ddu)
    }
}
