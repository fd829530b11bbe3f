//! Pointer discovery and claiming.
//!
//! The mapper scans the buffer once for words that look like ROM pointers
//! and keeps them as open candidates until a parser decides what lives at
//! their destination. Claiming a destination registers the shared pointer
//! run at every source and publishes the back-links, which are the only
//! mapper state that outlives a load.
//!
//! ## Claim flavors
//!
//! - [`PointerMapper::claim`] registers immediately.
//! - [`PointerMapper::defer`] records intent; [`PointerMapper::claim_deferred`]
//!   re-validates and registers later, so matchers can propose many
//!   candidates before the winner is known.
//! - [`PointerMapper::claim_remainder`] sweeps whatever is still open.

use crate::buffer::read_u32;
use crate::error::Result;
use crate::run::{Run, RunStorage};
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, PoisonError};
use tracing::{debug, trace, warn};

/// Claimed destinations and the sources pointing at them
pub type BackLinks = Arc<Mutex<BTreeMap<usize, Vec<usize>>>>;

/// A deferred claim that could not be honored
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClaimConflict {
    /// Destination of the abandoned claim
    pub destination: usize,
    /// Why it was abandoned
    pub reason: String,
}

impl ClaimConflict {
    fn new(destination: usize, reason: impl Into<String>) -> Self {
        Self {
            destination,
            reason: reason.into(),
        }
    }
}

/// Open pointer candidates and the claims made against them
#[derive(Debug)]
pub struct PointerMapper {
    bank_tag: u8,
    pointer_run: Arc<Run>,
    /// source -> destination
    open: BTreeMap<usize, usize>,
    /// destination -> sources
    reverse: BTreeMap<usize, Vec<usize>>,
    claimed: BackLinks,
    /// destinations claimed together with a run
    claimed_runs: BTreeMap<usize, Arc<Run>>,
    deferred: BTreeMap<usize, Option<Arc<Run>>>,
}

impl PointerMapper {
    /// Scans every 4-byte aligned word for pointer candidates.
    ///
    /// A candidate's top byte is `bank_tag` and its 24-bit address is a
    /// multiple of four.
    pub fn scan(data: &[u8], bank_tag: u8) -> Self {
        let mut open = BTreeMap::new();
        let mut reverse: BTreeMap<usize, Vec<usize>> = BTreeMap::new();

        for source in (0..data.len().saturating_sub(3)).step_by(4) {
            let Some(word) = read_u32(data, source) else {
                break;
            };
            if (word >> 24) as u8 != bank_tag {
                continue;
            }
            let destination = (word & 0x00FF_FFFF) as usize;
            if destination % 4 != 0 {
                continue;
            }
            open.insert(source, destination);
            reverse.entry(destination).or_default().push(source);
        }

        debug!(
            "Found {} pointer candidates to {} destinations",
            open.len(),
            reverse.len()
        );

        Self {
            bank_tag,
            pointer_run: Arc::new(Run::pointer(bank_tag)),
            open,
            reverse,
            claimed: BackLinks::default(),
            claimed_runs: BTreeMap::new(),
            deferred: BTreeMap::new(),
        }
    }

    /// Publishes claims into `links` instead of a private table.
    ///
    /// Meant to be called right after [`PointerMapper::scan`]; claims already
    /// made stay in the old table.
    pub fn with_back_links(mut self, links: BackLinks) -> Self {
        self.claimed = links;
        self
    }

    /// Bank tag candidates were scanned with
    pub fn bank_tag(&self) -> u8 {
        self.bank_tag
    }

    /// The run registered at every claimed source
    pub fn pointer_run(&self) -> Arc<Run> {
        Arc::clone(&self.pointer_run)
    }

    /// Shared handle to the claimed-destination table
    pub fn back_links(&self) -> BackLinks {
        Arc::clone(&self.claimed)
    }

    /// Number of open candidates
    pub fn open_count(&self) -> usize {
        self.open.len()
    }

    /// Destinations that still have open sources, in ascending order
    pub fn open_destinations(&self) -> Vec<usize> {
        self.reverse
            .iter()
            .filter(|(_, sources)| !sources.is_empty())
            .map(|(&destination, _)| destination)
            .collect()
    }

    /// True if `destination` still has open sources
    pub fn is_open(&self, destination: usize) -> bool {
        self.reverse
            .get(&destination)
            .is_some_and(|sources| !sources.is_empty())
    }

    /// True if `destination` has been claimed
    pub fn is_claimed(&self, destination: usize) -> bool {
        self.claimed
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(&destination)
    }

    /// Sources known to point at `destination`, claimed or open
    pub fn pointers_from_destination(&self, destination: usize) -> Vec<usize> {
        if let Some(sources) = self
            .claimed
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&destination)
        {
            return sources.clone();
        }
        self.reverse.get(&destination).cloned().unwrap_or_default()
    }

    /// Registers `run` at `destination` and claims every pointer to it.
    ///
    /// Claiming an already claimed destination does nothing.
    pub fn claim(
        &mut self,
        storage: &RunStorage,
        data: &[u8],
        run: Arc<Run>,
        destination: usize,
    ) -> Result<()> {
        if self.is_claimed(destination) {
            return Ok(());
        }
        storage.add_run(data, destination, Arc::clone(&run))?;
        self.claimed_runs.insert(destination, run);
        self.claim_destination(storage, data, destination)
    }

    /// Claims every pointer to `destination` without registering a run there
    pub fn claim_destination(
        &mut self,
        storage: &RunStorage,
        data: &[u8],
        destination: usize,
    ) -> Result<()> {
        if self.is_claimed(destination) {
            return Ok(());
        }
        let sources = self.reverse.remove(&destination).unwrap_or_default();
        let mut registered = Vec::with_capacity(sources.len());
        for source in sources {
            self.open.remove(&source);
            if self.register_pointer(storage, data, source)? {
                registered.push(source);
            }
        }
        trace!(
            "Claimed {:#X} from {} source(s)",
            destination,
            registered.len()
        );
        self.publish(destination, registered);
        Ok(())
    }

    /// Claims `destination` as reached from the known pointer at `source`.
    ///
    /// Unlike [`PointerMapper::claim_destination`] this also works for
    /// destinations that were never open candidates.
    pub fn claim_pointer_at(
        &mut self,
        storage: &RunStorage,
        data: &[u8],
        source: usize,
        destination: usize,
    ) -> Result<()> {
        if self
            .reverse
            .get(&destination)
            .is_some_and(|sources| sources.contains(&source))
        {
            return self.claim_destination(storage, data, destination);
        }

        self.open.remove(&source);
        let sources = if self.register_pointer(storage, data, source)? {
            vec![source]
        } else {
            Vec::new()
        };
        self.publish(destination, sources);
        Ok(())
    }

    /// Records the intent to claim `destination`, optionally with a run
    pub fn defer(&mut self, destination: usize, run: Option<Arc<Run>>) {
        let slot = self.deferred.entry(destination).or_default();
        if slot.is_none() {
            *slot = run;
        }
    }

    /// Number of deferred claims waiting for [`PointerMapper::claim_deferred`]
    pub fn deferred_count(&self) -> usize {
        self.deferred.len()
    }

    /// Resolves deferred claims.
    ///
    /// A destination that lost all its open sources, or whose run can no
    /// longer be registered, is reported as a conflict and skipped.
    pub fn claim_deferred(
        &mut self,
        storage: &RunStorage,
        data: &[u8],
    ) -> Result<Vec<ClaimConflict>> {
        let deferred = std::mem::take(&mut self.deferred);
        let mut conflicts = Vec::new();

        for (destination, run) in deferred {
            if self.is_claimed(destination) {
                continue;
            }
            if !self.is_open(destination) {
                let conflict = ClaimConflict::new(destination, "no open pointers lead here");
                warn!("Deferred claim of {:#X} dropped: {}", destination, conflict.reason);
                conflicts.push(conflict);
                continue;
            }

            match run {
                Some(run) if !storage.can_register(data, destination, &run) => {
                    let conflict =
                        ClaimConflict::new(destination, format!("{} run overlaps existing data", run.kind()));
                    warn!("Deferred claim of {:#X} dropped: {}", destination, conflict.reason);
                    conflicts.push(conflict);
                }
                Some(run) => self.claim(storage, data, run, destination)?,
                None => self.claim_destination(storage, data, destination)?,
            }
        }

        Ok(conflicts)
    }

    /// Claims every remaining open destination that is safe to claim, then
    /// empties the open sets.
    ///
    /// A destination strictly inside the nearest run claimed at or before it
    /// is skipped, as is one whose sources are not all registrable.
    pub fn claim_remainder(&mut self, storage: &RunStorage, data: &[u8]) -> Result<usize> {
        let mut claimed = 0;
        let reverse = std::mem::take(&mut self.reverse);

        for (destination, sources) in reverse {
            if sources.is_empty() || self.is_claimed(destination) {
                continue;
            }
            if let Some((&start, run)) = self.claimed_runs.range(..=destination).next_back() {
                if start < destination && destination < start + run.measure(data, start) {
                    trace!("Remainder {:#X} is inside the run at {:#X}", destination, start);
                    continue;
                }
            }
            if !sources
                .iter()
                .all(|&source| storage.can_register(data, source, &self.pointer_run))
            {
                continue;
            }
            for &source in &sources {
                storage.add_run(data, source, Arc::clone(&self.pointer_run))?;
            }
            self.publish(destination, sources);
            claimed += 1;
        }

        self.open.clear();
        debug!("Claimed {} remaining destinations", claimed);
        Ok(claimed)
    }

    /// Drops open candidates whose destination fails `keep`
    pub fn filter_pointers(&mut self, keep: impl Fn(usize) -> bool) {
        let before = self.open.len();
        self.open.retain(|_, destination| keep(*destination));
        self.reverse.retain(|destination, _| keep(*destination));
        trace!("Filtered {} pointer candidates", before - self.open.len());
    }

    /// False, with a warning, if `source` overlaps different data
    fn register_pointer(&self, storage: &RunStorage, data: &[u8], source: usize) -> Result<bool> {
        if !storage.can_register(data, source, &self.pointer_run) {
            warn!("Pointer at {:#X} overlaps existing data; not linked", source);
            return Ok(false);
        }
        storage.add_run(data, source, Arc::clone(&self.pointer_run))?;
        Ok(true)
    }

    fn publish(&self, destination: usize, sources: Vec<usize>) {
        let mut claimed = self.claimed.lock().unwrap_or_else(PoisonError::into_inner);
        let entry = claimed.entry(destination).or_default();
        for source in sources {
            if !entry.contains(&source) {
                entry.push(source);
            }
        }
    }
}
