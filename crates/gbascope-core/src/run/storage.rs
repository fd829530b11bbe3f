use super::{Artifact, DecodeContext, Run, RunKind};
use crate::error::{Error, Result};
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use tracing::trace;

/// What occupies one byte position
#[derive(Debug, Clone)]
pub enum Coverage {
    /// Covered by the run starting at `start`
    Run {
        /// Start of the covering run
        start: usize,
        /// Position relative to `start`
        offset: usize,
        /// The covering run
        run: Arc<Run>,
    },
    /// No run covers this byte
    Uncovered,
}

impl Coverage {
    /// The covering run, if any
    pub fn run(&self) -> Option<&Arc<Run>> {
        match self {
            Self::Run { run, .. } => Some(run),
            Self::Uncovered => None,
        }
    }
}

/// Ordered registry of non-overlapping runs.
///
/// Lengths are computed on demand from the bytes, so every query that needs
/// an end position takes the current bytes as `data`. Callers hold the buffer
/// guard for the duration of the call; storage never locks the buffer itself.
#[derive(Debug, Default)]
pub struct RunStorage {
    runs: RwLock<BTreeMap<usize, Arc<Run>>>,
    artifacts: Mutex<HashMap<usize, Option<Arc<Artifact>>>>,
}

impl RunStorage {
    /// Creates an empty registry
    pub fn new() -> Self {
        Self::default()
    }

    fn runs(&self) -> RwLockReadGuard<'_, BTreeMap<usize, Arc<Run>>> {
        self.runs.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn runs_mut(&self) -> RwLockWriteGuard<'_, BTreeMap<usize, Arc<Run>>> {
        self.runs.write().unwrap_or_else(PoisonError::into_inner)
    }

    fn memo(&self) -> MutexGuard<'_, HashMap<usize, Option<Arc<Artifact>>>> {
        self.artifacts.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Registers `run` at `start`.
    ///
    /// Registering an equivalent run at the same start is a no-op. Any other
    /// overlap is a contract violation and returns [`Error::RunOverlap`].
    pub fn add_run(&self, data: &[u8], start: usize, run: Arc<Run>) -> Result<()> {
        let mut runs = self.runs_mut();

        if let Some(existing) = runs.get(&start) {
            if existing.is_equivalent(&run, data, start) {
                return Ok(());
            }
            return Err(Error::run_overlap(start, start));
        }
        if let Some((&prev, prev_run)) = runs.range(..start).next_back() {
            if prev + prev_run.measure(data, prev) > start {
                return Err(Error::run_overlap(start, prev));
            }
        }
        let len = run.measure(data, start);
        if let Some((&next, _)) = runs.range(start..).next() {
            if next < start + len {
                return Err(Error::run_overlap(start, next));
            }
        }

        trace!("Registered {} run at {:#X} ({} bytes)", run.kind(), start, len);
        runs.insert(start, run);
        Ok(())
    }

    /// True if no run covers `location`
    pub fn is_free(&self, data: &[u8], location: usize) -> bool {
        match self.runs().range(..=location).next_back() {
            Some((&start, run)) => start + run.measure(data, start) <= location,
            None => true,
        }
    }

    /// True if no run covers any byte of `[start, start + len)`
    pub fn is_range_free(&self, data: &[u8], start: usize, len: usize) -> bool {
        self.is_free(data, start) && self.next_used(start).map_or(true, |next| next >= start + len)
    }

    /// True if [`RunStorage::add_run`] would accept `run` at `start`
    pub fn can_register(&self, data: &[u8], start: usize, run: &Run) -> bool {
        match self.run_at(start) {
            Some(existing) => existing.is_equivalent(run, data, start),
            None => self.is_range_free(data, start, run.measure(data, start)),
        }
    }

    /// Smallest registered start at or after `location`
    pub fn next_used(&self, location: usize) -> Option<usize> {
        self.runs().range(location..).next().map(|(&start, _)| start)
    }

    /// The run registered exactly at `location`
    pub fn run_at(&self, location: usize) -> Option<Arc<Run>> {
        self.runs().get(&location).cloned()
    }

    /// The run covering `location`, with its start
    pub fn covering(&self, data: &[u8], location: usize) -> Option<(usize, Arc<Run>)> {
        let runs = self.runs();
        let (&start, run) = runs.range(..=location).next_back()?;
        (start + run.measure(data, start) > location).then(|| (start, Arc::clone(run)))
    }

    /// True if a run starts at `location`
    pub fn is_start_of_run(&self, location: usize) -> bool {
        self.runs().contains_key(&location)
    }

    /// True if `location` is covered by a run that starts before it
    pub fn is_within_run(&self, data: &[u8], location: usize) -> bool {
        self.covering(data, location)
            .is_some_and(|(start, _)| start != location)
    }

    /// Start of the run covering `location`
    pub fn block_start(&self, data: &[u8], location: usize) -> Option<usize> {
        self.covering(data, location).map(|(start, _)| start)
    }

    /// Length of the run covering `location`
    pub fn block_length(&self, data: &[u8], location: usize) -> Option<usize> {
        self.covering(data, location)
            .map(|(start, run)| run.measure(data, start))
    }

    /// Per-position coverage of `[start, start + len)`, clipped to the buffer
    pub fn query_range(&self, data: &[u8], start: usize, len: usize) -> Vec<Coverage> {
        let len = len.min(data.len().saturating_sub(start));
        let runs = self.runs();
        let first = runs
            .range(..=start)
            .next_back()
            .map_or(start, |(&s, _)| s);

        let mut iter = runs.range(first..);
        let mut current = span(data, iter.next());

        let mut out = Vec::with_capacity(len);
        for pos in start..start + len {
            while let Some((_, end, _)) = current {
                if end > pos {
                    break;
                }
                current = span(data, iter.next());
            }
            match current {
                Some((s, _, run)) if s <= pos => out.push(Coverage::Run {
                    start: s,
                    offset: pos - s,
                    run: Arc::clone(run),
                }),
                _ => out.push(Coverage::Uncovered),
            }
        }
        out
    }

    /// Decoded artifact of the run starting at `location`, memoized per start
    pub fn artifact(
        &self,
        data: &[u8],
        location: usize,
        ctx: &DecodeContext<'_>,
    ) -> Option<Arc<Artifact>> {
        if let Some(cached) = self.memo().get(&location) {
            return cached.clone();
        }

        let run = self.run_at(location)?;
        let decoder = run.decoder()?;
        let len = run.measure(data, location);
        let mut artifact = decoder.decode(data, location, len, ctx);

        if let Some(Artifact::Link {
            destination,
            target,
        }) = &mut artifact
        {
            // pointer tables pointing at pointer tables stop after one hop
            let leads_to_pointer = self
                .run_at(*destination)
                .is_some_and(|r| matches!(r.kind(), RunKind::Pointer));
            if !leads_to_pointer {
                *target = self.artifact(data, *destination, ctx);
            }
        }

        let artifact = artifact.map(Arc::new);
        self.memo().entry(location).or_insert(artifact).clone()
    }

    /// Drops memoized artifacts affected by an edit at `location`
    pub fn invalidate(&self, data: &[u8], location: usize) {
        let Some(start) = self.block_start(data, location) else {
            return;
        };
        self.memo().retain(|&key, artifact| {
            let links_here = matches!(
                artifact.as_deref(),
                Some(Artifact::Link { destination, .. }) if *destination == start
            );
            key != start && !links_here
        });
    }

    /// Number of registered runs
    pub fn len(&self) -> usize {
        self.runs().len()
    }

    /// True if no runs are registered
    pub fn is_empty(&self) -> bool {
        self.runs().is_empty()
    }

    /// Snapshot of `(start, run)` pairs in order
    pub fn runs_snapshot(&self) -> Vec<(usize, Arc<Run>)> {
        self.runs()
            .iter()
            .map(|(&start, run)| (start, Arc::clone(run)))
            .collect()
    }
}

/// `(start, end, run)` for a registry entry
fn span<'a>(data: &[u8], entry: Option<(&usize, &'a Arc<Run>)>) -> Option<(usize, usize, &'a Arc<Run>)> {
    entry.map(|(&start, run)| (start, start + run.measure(data, start), run))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::{encode_pointer, DEFAULT_BANK_TAG};
    use crate::run::{Decoder, RunKind};
    use crate::text::CharacterTable;

    fn block(len: usize) -> Arc<Run> {
        Arc::new(Run::fixed(RunKind::Padding, len))
    }

    #[test]
    fn test_add_run_and_queries() {
        let data = vec![0u8; 0x100];
        let storage = RunStorage::new();
        storage.add_run(&data, 0x10, block(8)).unwrap();

        assert!(storage.is_free(&data, 0x0F));
        assert!(!storage.is_free(&data, 0x10));
        assert!(!storage.is_free(&data, 0x17));
        assert!(storage.is_free(&data, 0x18));

        assert!(storage.is_start_of_run(0x10));
        assert!(!storage.is_start_of_run(0x11));
        assert!(!storage.is_within_run(&data, 0x10));
        assert!(storage.is_within_run(&data, 0x11));
        assert!(!storage.is_within_run(&data, 0x18));

        assert_eq!(storage.block_start(&data, 0x15), Some(0x10));
        assert_eq!(storage.block_length(&data, 0x15), Some(8));
        assert_eq!(storage.block_start(&data, 0x18), None);

        assert_eq!(storage.next_used(0), Some(0x10));
        assert_eq!(storage.next_used(0x11), None);
    }

    #[test]
    fn test_overlap_rejected() {
        let data = vec![0u8; 0x100];
        let storage = RunStorage::new();
        storage.add_run(&data, 0x10, block(8)).unwrap();

        // equivalent run at the same start
        storage.add_run(&data, 0x10, block(8)).unwrap();
        assert_eq!(storage.len(), 1);

        assert!(matches!(
            storage.add_run(&data, 0x10, block(4)),
            Err(Error::RunOverlap { start: 0x10, .. })
        ));
        assert!(matches!(
            storage.add_run(&data, 0x14, block(4)),
            Err(Error::RunOverlap { start: 0x14, existing: 0x10 })
        ));
        assert!(matches!(
            storage.add_run(&data, 0x0C, block(8)),
            Err(Error::RunOverlap { start: 0x0C, existing: 0x10 })
        ));
        storage.add_run(&data, 0x08, block(8)).unwrap();
        storage.add_run(&data, 0x18, block(8)).unwrap();
    }

    #[test]
    fn test_range_free() {
        let data = vec![0u8; 0x100];
        let storage = RunStorage::new();
        storage.add_run(&data, 0x20, block(4)).unwrap();

        assert!(storage.is_range_free(&data, 0x10, 0x10));
        assert!(!storage.is_range_free(&data, 0x10, 0x11));
        assert!(!storage.is_range_free(&data, 0x22, 1));
        assert!(storage.can_register(&data, 0x20, &Run::fixed(RunKind::Padding, 4)));
        assert!(!storage.can_register(&data, 0x1E, &Run::fixed(RunKind::Padding, 4)));
    }

    #[test]
    fn test_query_range() {
        let data = vec![0u8; 0x100];
        let storage = RunStorage::new();
        storage.add_run(&data, 0x10, block(4)).unwrap();
        storage.add_run(&data, 0x14, block(2)).unwrap();

        let coverage = storage.query_range(&data, 0x12, 6);
        let starts: Vec<Option<(usize, usize)>> = coverage
            .iter()
            .map(|c| match c {
                Coverage::Run { start, offset, .. } => Some((*start, *offset)),
                Coverage::Uncovered => None,
            })
            .collect();
        assert_eq!(
            starts,
            vec![
                Some((0x10, 2)),
                Some((0x10, 3)),
                Some((0x14, 0)),
                Some((0x14, 1)),
                None,
                None
            ]
        );

        // clipped to the buffer
        assert_eq!(storage.query_range(&data, 0xF0, usize::MAX).len(), 0x10);
        assert!(storage.query_range(&data, 0x200, 4).is_empty());
    }

    #[test]
    fn test_artifact_memo_and_links() {
        let charmap = CharacterTable::english();
        let ctx = DecodeContext {
            charmap: &charmap,
            bank_tag: DEFAULT_BANK_TAG,
        };
        let mut data = vec![0u8; 0x40];
        data[0..4].copy_from_slice(&encode_pointer(0x20, DEFAULT_BANK_TAG));
        data[0x20..0x23].copy_from_slice(&[0xBB, 0xBC, 0xFF]);

        let storage = RunStorage::new();
        storage
            .add_run(&data, 0, Arc::new(Run::pointer(DEFAULT_BANK_TAG)))
            .unwrap();
        storage.add_run(&data, 0x20, Arc::new(Run::text())).unwrap();

        let link = storage.artifact(&data, 0, &ctx).unwrap();
        let Artifact::Link { destination, target } = link.as_ref() else {
            panic!("expected a link, got {link:?}");
        };
        assert_eq!(*destination, 0x20);
        assert_eq!(target.as_deref().and_then(Artifact::as_text), Some("AB"));

        // memoized: same allocation
        let again = storage.artifact(&data, 0x20, &ctx).unwrap();
        assert!(Arc::ptr_eq(target.as_ref().unwrap(), &again));

        data[0x21] = 0xBD;
        storage.invalidate(&data, 0x21);
        let edited = storage.artifact(&data, 0x20, &ctx).unwrap();
        assert_eq!(edited.as_text(), Some("AC"));
    }

    #[test]
    fn test_artifact_without_decoder() {
        let charmap = CharacterTable::english();
        let ctx = DecodeContext {
            charmap: &charmap,
            bank_tag: DEFAULT_BANK_TAG,
        };
        let data = vec![0u8; 0x10];
        let storage = RunStorage::new();
        storage.add_run(&data, 0, block(4)).unwrap();
        assert!(storage.artifact(&data, 0, &ctx).is_none());
        assert!(storage.artifact(&data, 8, &ctx).is_none());

        let palette = Arc::new(Run::fixed(RunKind::Padding, 2).with_decoder(Decoder::Palette));
        storage.add_run(&data, 8, palette).unwrap();
        // fewer than 32 bytes available
        assert!(storage.artifact(&data, 8, &ctx).is_none());
    }
}
