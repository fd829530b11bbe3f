//! The analysis session: one buffer, its runs, and the background load.
//!
//! [`Session::load`] starts the pipeline on a worker thread and returns at
//! once. Every query may be called while the load is running; it sees
//! whatever runs have been registered so far. Once [`Session::is_loaded`]
//! reports true the run registry no longer changes except through edits.
//!
//! Locks are always taken buffer first, then storage.

use crate::buffer::{find_subsequence, ByteBuffer};
use crate::config::EngineConfig;
use crate::error::{Error, Result};
use crate::mapper::{BackLinks, ClaimConflict, PointerMapper};
use crate::parsers::{LoadContext, Profile, RunParser};
use crate::run::{Artifact, Coverage, Decoder, EditRule, Run, RunStorage};
use crate::text::TERMINATOR;
use std::collections::BTreeSet;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tracing::{debug, debug_span, info, warn};

/// Timing for one pipeline step
#[derive(Debug, Clone)]
pub struct StepTiming {
    /// Parser name
    pub parser: &'static str,
    /// Wall time spent
    pub elapsed: Duration,
    /// Runs registered during the step
    pub runs_added: usize,
}

/// Summary of a finished load
#[derive(Debug, Clone, Default)]
pub struct LoadReport {
    /// Pointer candidates found by the initial scan
    pub candidates: usize,
    /// Destinations claimed by the end of the load
    pub claimed_destinations: usize,
    /// Runs registered
    pub runs: usize,
    /// Deferred claims that were abandoned
    pub conflicts: Vec<ClaimConflict>,
    /// Per-parser timings, in load order
    pub steps: Vec<StepTiming>,
    /// Total wall time
    pub elapsed: Duration,
}

type Worker = JoinHandle<Result<LoadReport>>;

/// A loaded (or loading) buffer and everything inferred about it
pub struct Session {
    buffer: ByteBuffer,
    storage: Arc<RunStorage>,
    back_links: BackLinks,
    parsers: Arc<Vec<Box<dyn RunParser>>>,
    config: Arc<EngineConfig>,
    profile: Profile,
    started: AtomicBool,
    loaded: Arc<AtomicBool>,
    worker: Mutex<Option<Worker>>,
    outcome: Mutex<Option<std::result::Result<LoadReport, String>>>,
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("len", &self.buffer.len())
            .field("profile", &self.profile)
            .field("runs", &self.storage.len())
            .field("loaded", &self.is_loaded())
            .finish()
    }
}

impl Session {
    /// Creates a session over `data`.
    ///
    /// `name_hint` is usually the file name; it decides the profile together
    /// with the header game code.
    pub fn new(data: Vec<u8>, name_hint: Option<&str>, config: EngineConfig) -> Self {
        let profile = Profile::select(name_hint, &data);
        let parsers = profile.parsers(&config);
        debug!("Profile {} with {} parsers", profile, parsers.len());

        Self {
            buffer: ByteBuffer::new(data),
            storage: Arc::new(RunStorage::new()),
            back_links: BackLinks::default(),
            parsers: Arc::new(parsers),
            config: Arc::new(config),
            profile,
            started: AtomicBool::new(false),
            loaded: Arc::new(AtomicBool::new(false)),
            worker: Mutex::new(None),
            outcome: Mutex::new(None),
        }
    }

    /// Reads `path` and creates a session named after it
    pub fn open(path: impl AsRef<Path>, config: EngineConfig) -> Result<Self> {
        let path = path.as_ref();
        let data = std::fs::read(path).map_err(|e| Error::file_read(path, e))?;
        let name = path.file_name().map(|n| n.to_string_lossy().into_owned());
        Ok(Self::new(data, name.as_deref(), config))
    }

    /// Starts the background load. Calling it again does nothing.
    pub fn load(&self) -> Result<()> {
        if self.started.swap(true, Ordering::AcqRel) {
            return Ok(());
        }

        let buffer = self.buffer.clone();
        let storage = Arc::clone(&self.storage);
        let back_links = Arc::clone(&self.back_links);
        let parsers = Arc::clone(&self.parsers);
        let config = Arc::clone(&self.config);
        let loaded = Arc::clone(&self.loaded);

        let handle = thread::Builder::new()
            .name("gbascope-load".into())
            .spawn(move || {
                let report = run_pipeline(&buffer, &storage, back_links, &parsers, &config)?;
                loaded.store(true, Ordering::Release);
                Ok(report)
            })
            .map_err(|e| Error::internal(format!("failed to spawn load worker: {e}")))?;

        *self.lock_worker() = Some(handle);
        Ok(())
    }

    /// Blocks until the load finishes.
    ///
    /// The first call after a failed load returns the original error; later
    /// calls return [`Error::LoadFailed`] with its message.
    pub fn wait(&self) -> Result<LoadReport> {
        let mut worker = self.lock_worker();
        if let Some(handle) = worker.take() {
            let result = handle
                .join()
                .unwrap_or_else(|_| Err(Error::load_failed("load worker panicked")));
            *self.lock_outcome() = Some(match &result {
                Ok(report) => Ok(report.clone()),
                Err(e) => Err(e.to_string()),
            });
            return result;
        }
        drop(worker);

        match self.lock_outcome().as_ref() {
            Some(Ok(report)) => Ok(report.clone()),
            Some(Err(msg)) => Err(Error::load_failed(msg.clone())),
            None => Err(Error::load_failed("load was never started")),
        }
    }

    /// Starts the load and waits for it
    pub fn load_blocking(&self) -> Result<LoadReport> {
        self.load()?;
        self.wait()
    }

    /// True once the load has finished successfully
    pub fn is_loaded(&self) -> bool {
        self.loaded.load(Ordering::Acquire)
    }

    /// Profile chosen for this buffer
    pub fn profile(&self) -> Profile {
        self.profile
    }

    /// Configuration in use
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Buffer length
    pub fn len(&self) -> usize {
        self.buffer.len()
    }

    /// True for an empty buffer
    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }

    /// Copy of the current bytes
    pub fn snapshot(&self) -> Vec<u8> {
        self.buffer.snapshot()
    }

    /// Coverage of `len` bytes from `start`, one entry per byte
    pub fn query_range(&self, start: usize, len: usize) -> Vec<Coverage> {
        let data = self.buffer.read();
        self.storage.query_range(&data, start, len)
    }

    /// True if a run starts exactly at `location`
    pub fn is_start_of_run(&self, location: usize) -> bool {
        self.storage.is_start_of_run(location)
    }

    /// True if `location` is covered by a run but is not its start
    pub fn is_within_run(&self, location: usize) -> bool {
        let data = self.buffer.read();
        self.storage.is_within_run(&data, location)
    }

    /// Start of the run covering `location`
    pub fn block_start(&self, location: usize) -> Option<usize> {
        let data = self.buffer.read();
        self.storage.block_start(&data, location)
    }

    /// Length of the run covering `location`
    pub fn block_length(&self, location: usize) -> Option<usize> {
        let data = self.buffer.read();
        self.storage.block_length(&data, location)
    }

    /// The run starting at `location`
    pub fn run_at(&self, location: usize) -> Option<Arc<Run>> {
        self.storage.run_at(location)
    }

    /// Every registered run, in address order
    pub fn runs(&self) -> Vec<(usize, Arc<Run>)> {
        self.storage.runs_snapshot()
    }

    /// Decoded artifact of the run starting at `location`
    pub fn artifact(&self, location: usize) -> Option<Arc<Artifact>> {
        let data = self.buffer.read();
        self.storage
            .artifact(&data, location, &self.config.decode_context())
    }

    /// Where the run covering `location` leads
    pub fn jump_targets(&self, location: usize) -> Vec<usize> {
        let data = self.buffer.read();
        self.storage
            .covering(&data, location)
            .and_then(|(start, run)| run.jump().map(|jump| jump.targets(&data, start)))
            .unwrap_or_default()
    }

    /// Claimed pointers leading to `destination`
    pub fn back_links(&self, destination: usize) -> Vec<usize> {
        self.back_links
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&destination)
            .cloned()
            .unwrap_or_default()
    }

    /// Display label a parser gives `location`
    pub fn label(&self, location: usize) -> Option<String> {
        self.parsers.iter().find_map(|p| p.label(location))
    }

    /// Location of a named shortcut
    pub fn shortcut(&self, name: &str) -> Option<usize> {
        self.shortcuts()
            .into_iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, location)| location)
    }

    /// Every named shortcut
    pub fn shortcuts(&self) -> Vec<(String, usize)> {
        self.parsers.iter().flat_map(|p| p.shortcuts()).collect()
    }

    /// Locations matching `term`, sorted and deduplicated.
    ///
    /// A term of hex digit pairs also matches those bytes; text runs whose
    /// decoded text equals the term match at their start; parsers add their
    /// own hits.
    pub fn find_by_term(&self, term: &str) -> Vec<usize> {
        let data = self.buffer.read();
        let mut hits = BTreeSet::new();

        if let Some(needle) = parse_hex(term) {
            let mut from = 0;
            while let Some(at) = find_subsequence(&data, &needle, from) {
                hits.insert(at);
                from = at + 1;
            }
        }

        let ctx = self.config.decode_context();
        for (start, run) in self.storage.runs_snapshot() {
            if !matches!(
                run.decoder(),
                Some(Decoder::Ascii | Decoder::Text | Decoder::FixedText(_))
            ) {
                continue;
            }
            let equal = self
                .storage
                .artifact(&data, start, &ctx)
                .is_some_and(|a| a.as_text().is_some_and(|t| t.eq_ignore_ascii_case(term)));
            if equal {
                hits.insert(start);
            }
        }

        for parser in self.parsers.iter() {
            hits.extend(parser.find(&data, term));
        }

        hits.into_iter().collect()
    }

    /// Edit rule of the run covering `location`
    pub fn editor_at(&self, location: usize) -> Option<EditRule> {
        let data = self.buffer.read();
        self.storage
            .covering(&data, location)
            .and_then(|(_, run)| run.editor())
    }

    /// Writes one byte and drops artifacts the edit affects.
    ///
    /// Runs are not re-inferred.
    pub fn write(&self, location: usize, value: u8) -> Result<()> {
        self.buffer.write(location, value)?;
        let data = self.buffer.read();
        self.storage.invalidate(&data, location);
        Ok(())
    }

    /// Types `c` into a text run at `location`.
    ///
    /// Returns false if the location is not editable text or the character
    /// has no byte. Overwriting a terminator moves it one byte right, which
    /// is refused when that byte belongs to another run.
    pub fn edit_char(&self, location: usize, c: char) -> Result<bool> {
        if self.editor_at(location) != Some(EditRule::Text) {
            return Ok(false);
        }
        let Some(byte) = self.config.charmap.encode(c) else {
            return Ok(false);
        };

        let (at_terminator, room) = {
            let data = self.buffer.read();
            let next = location + 1;
            (
                data.get(location) == Some(&TERMINATOR),
                next < data.len() && self.storage.is_free(&data, next),
            )
        };
        if at_terminator {
            if !room {
                debug!("No room to extend the text at {:#X}", location);
                return Ok(false);
            }
            self.write(location + 1, TERMINATOR)?;
        }
        self.write(location, byte)?;
        Ok(true)
    }

    fn lock_worker(&self) -> std::sync::MutexGuard<'_, Option<Worker>> {
        self.worker.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn lock_outcome(
        &self,
    ) -> std::sync::MutexGuard<'_, Option<std::result::Result<LoadReport, String>>> {
        self.outcome.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        let worker = self
            .worker
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(handle) = worker {
            if handle.join().is_err() {
                warn!("Load worker panicked");
            }
        }
    }
}

fn run_pipeline(
    buffer: &ByteBuffer,
    storage: &RunStorage,
    back_links: BackLinks,
    parsers: &[Box<dyn RunParser>],
    config: &EngineConfig,
) -> Result<LoadReport> {
    let started = Instant::now();
    let mut mapper = {
        let data = buffer.read();
        PointerMapper::scan(&data, config.bank_tag).with_back_links(Arc::clone(&back_links))
    };
    let mut report = LoadReport {
        candidates: mapper.open_count(),
        ..LoadReport::default()
    };

    for parser in parsers {
        let _span = debug_span!("parser", name = parser.name()).entered();
        let step_started = Instant::now();
        let before = storage.len();

        let data = buffer.read();
        let mut ctx = LoadContext {
            data: &data,
            storage,
            mapper: &mut mapper,
            config,
            conflicts: &mut report.conflicts,
        };
        parser.load(&mut ctx)?;
        drop(data);

        let step = StepTiming {
            parser: parser.name(),
            elapsed: step_started.elapsed(),
            runs_added: storage.len() - before,
        };
        debug!("{} added {} runs in {:?}", step.parser, step.runs_added, step.elapsed);
        report.steps.push(step);
    }

    report.runs = storage.len();
    report.claimed_destinations = back_links
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
        .len();
    report.elapsed = started.elapsed();
    info!(
        "Loaded {} runs, {} claimed destinations in {:?}",
        report.runs, report.claimed_destinations, report.elapsed
    );
    Ok(report)
}

/// Bytes spelled by `term` as hex digit pairs, spaces allowed
fn parse_hex(term: &str) -> Option<Vec<u8>> {
    let digits: String = term.chars().filter(|c| !c.is_whitespace()).collect();
    if digits.is_empty() || digits.len() % 2 != 0 || !digits.chars().all(|c| c.is_ascii_hexdigit()) {
        return None;
    }
    (0..digits.len())
        .step_by(2)
        .map(|i| u8::from_str_radix(&digits[i..i + 2], 16).ok())
        .collect()
}
