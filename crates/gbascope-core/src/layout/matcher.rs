use super::{FieldKind, Record, Schema, Shape, Target, Value};
use crate::buffer::follow_pointer;
use crate::error::Result;
use crate::mapper::PointerMapper;
use crate::run::{DecodeContext, Decoder, EditRule, Run, RunKind, RunStorage};
use crate::text::CharacterTable;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, trace};

/// Smallest element count accepted for a variable-length array
pub const DEFAULT_MIN_ARRAY_LEN: usize = 10;

/// A region that passed the shape and parse checks
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ArrayCandidate {
    /// First element
    pub start: usize,
    /// Number of elements
    pub count: usize,
    /// Bytes per element
    pub stride: usize,
}

impl ArrayCandidate {
    /// One past the last element
    pub fn end(&self) -> usize {
        self.start + self.count * self.stride
    }
}

/// Picks one array among several structurally valid candidates
pub trait TieBreak: Send + Sync {
    /// Index into `candidates` of the winner
    fn pick(&self, data: &[u8], candidates: &[ArrayCandidate]) -> Option<usize>;
}

/// Prefers the candidate with the lowest [`repeat_ratio`]
#[derive(Debug, Clone, Copy, Default)]
pub struct FewestRepeats;

/// Fraction of bytes in `[start, start + len)` equal to their predecessor
pub fn repeat_ratio(data: &[u8], start: usize, len: usize) -> f64 {
    let end = start.saturating_add(len).min(data.len());
    if end <= start + 1 {
        return 1.0;
    }
    let repeats = data[start..end]
        .windows(2)
        .filter(|pair| pair[0] == pair[1])
        .count();
    repeats as f64 / (end - start) as f64
}

impl TieBreak for FewestRepeats {
    fn pick(&self, data: &[u8], candidates: &[ArrayCandidate]) -> Option<usize> {
        let mut best: Option<(usize, f64)> = None;
        for (i, candidate) in candidates.iter().enumerate() {
            let ratio = repeat_ratio(data, candidate.start, candidate.count * candidate.stride);
            if best.map_or(true, |(_, least)| ratio < least) {
                best = Some((i, ratio));
            }
        }
        best.map(|(i, _)| i)
    }
}

/// An array the matcher registered
#[derive(Debug, Clone)]
pub struct ArrayMatch {
    /// A pointer leading to the array, if one is known
    pub source: Option<usize>,
    /// First element
    pub start: usize,
    /// Bytes per element
    pub stride: usize,
    /// Parsed elements
    pub records: Vec<Record>,
}

impl ArrayMatch {
    /// One past the last element
    pub fn end(&self) -> usize {
        self.start + self.records.len() * self.stride
    }
}

/// A single record the matcher registered
#[derive(Debug, Clone)]
pub struct RecordMatch {
    /// A pointer leading to the record, if one is known
    pub source: Option<usize>,
    /// The parsed record
    pub record: Record,
}

/// Runs for schema fields, built once per schema and shared by every record
#[derive(Debug, Default)]
pub struct FieldRuns {
    cache: HashMap<Arc<str>, Vec<Arc<Run>>>,
}

impl FieldRuns {
    /// Creates an empty cache
    pub fn new() -> Self {
        Self::default()
    }

    /// One run per field of `schema`.
    ///
    /// The first non-pointer field carries the whole-record decoder. Pointer
    /// fields get a placeholder used only when a nullable pointer is zero;
    /// non-null pointers are registered through the mapper.
    pub fn runs_for(&mut self, schema: &Arc<Schema>) -> Vec<Arc<Run>> {
        self.cache
            .entry(Arc::clone(schema.name()))
            .or_insert_with(|| build_field_runs(schema))
            .clone()
    }
}

fn build_field_runs(schema: &Arc<Schema>) -> Vec<Arc<Run>> {
    let anchor = schema.fields().iter().position(|f| !f.kind.is_pointer());
    schema
        .fields()
        .iter()
        .enumerate()
        .map(|(i, field)| {
            let kind = RunKind::Field {
                schema: Arc::clone(schema.name()),
                name: Arc::clone(&field.name),
            };
            let run = match field.kind {
                FieldKind::Padding(len) => Run::fixed(RunKind::Padding, len),
                FieldKind::Text(len) => Run::fixed(kind, len)
                    .with_decoder(Decoder::FixedText(len))
                    .with_editor(EditRule::Text),
                ref other => Run::fixed(kind, other.width()).with_editor(EditRule::Hex),
            };
            let run = if Some(i) == anchor {
                run.with_decoder(Decoder::Record(Arc::clone(schema)))
            } else {
                run
            };
            Arc::new(run)
        })
        .collect()
}

/// Finds and registers record layouts among open pointer destinations.
///
/// Borrowed for one parser step: it reads the bytes, registers runs in
/// storage and claims destinations through the mapper.
pub struct LayoutMatcher<'a> {
    data: &'a [u8],
    storage: &'a RunStorage,
    mapper: &'a mut PointerMapper,
    charmap: &'a CharacterTable,
    field_runs: &'a mut FieldRuns,
    min_array_len: usize,
    max_depth: usize,
    tie_break: &'a dyn TieBreak,
}

impl<'a> LayoutMatcher<'a> {
    /// Creates a matcher with the default limits and [`FewestRepeats`]
    pub fn new(
        data: &'a [u8],
        storage: &'a RunStorage,
        mapper: &'a mut PointerMapper,
        charmap: &'a CharacterTable,
        field_runs: &'a mut FieldRuns,
    ) -> Self {
        Self {
            data,
            storage,
            mapper,
            charmap,
            field_runs,
            min_array_len: DEFAULT_MIN_ARRAY_LEN,
            max_depth: super::DEFAULT_MAX_DEPTH,
            tie_break: &FewestRepeats,
        }
    }

    /// Sets the smallest accepted element count for variable arrays
    pub fn min_array_len(mut self, len: usize) -> Self {
        self.min_array_len = len;
        self
    }

    /// Sets how deep record pointers are followed
    pub fn max_depth(mut self, depth: usize) -> Self {
        self.max_depth = depth;
        self
    }

    /// Replaces the tie-breaker
    pub fn tie_break(mut self, tie_break: &'a dyn TieBreak) -> Self {
        self.tie_break = tie_break;
        self
    }

    fn ctx(&self) -> DecodeContext<'a> {
        DecodeContext {
            charmap: self.charmap,
            bank_tag: self.mapper.bank_tag(),
        }
    }

    fn parse(&self, schema: &Arc<Schema>, at: usize) -> Option<Record> {
        match schema.parse_nested(self.data, at, &self.ctx(), self.max_depth) {
            Ok(record) => Some(record),
            Err(rejection) => {
                trace!("Rejected {}", rejection);
                None
            }
        }
    }

    /// True if a record of `schema` could start at `address`.
    ///
    /// Beyond a successful parse, word fields must have a zero high byte.
    pub fn could_be(&self, address: usize, schema: &Arc<Schema>) -> bool {
        self.parse(schema, address)
            .is_some_and(|record| plausible_words(&record))
    }

    /// Registers the children of a registered record.
    ///
    /// Text and record children get their runs now. The pointer to each
    /// child is claimed later if the child is an open candidate, or right
    /// away if it is not. Returns the child destinations.
    pub fn seek_children(&mut self, record: &Record) -> Result<Vec<usize>> {
        let schema = Arc::clone(record.schema());
        let mut children = Vec::new();

        for (i, (field, value)) in schema.fields().iter().zip(record.values()).enumerate() {
            let Value::Pointer { destination, child } = value else {
                continue;
            };
            let destination = *destination;
            let source = record.location() + schema.offset_of(i);

            let target = match &field.kind {
                FieldKind::Pointer(target) | FieldKind::NullablePointer(target) => target,
                _ => continue,
            };
            match (target, child.as_deref()) {
                (Target::Text, Some(Value::Text(_))) => {
                    let run = Arc::new(Run::text());
                    if self.storage.can_register(self.data, destination, &run) {
                        self.storage.add_run(self.data, destination, run)?;
                    } else {
                        trace!("Text child at {:#X} overlaps existing data", destination);
                    }
                }
                (Target::Record(_), Some(Value::Record(child_record))) => {
                    if !self.register_record(child_record)? {
                        trace!("Record child at {:#X} overlaps existing data", destination);
                    }
                }
                _ => {}
            }

            if self.mapper.is_open(destination) {
                self.mapper.defer(destination, None);
            } else {
                self.mapper
                    .claim_pointer_at(self.storage, self.data, source, destination)?;
            }
            children.push(destination);
        }

        Ok(children)
    }

    /// Registers the field runs of `record` and seeks its children.
    ///
    /// Returns false, registering nothing, if any field would overlap
    /// different data.
    pub fn register_record(&mut self, record: &Record) -> Result<bool> {
        let schema = Arc::clone(record.schema());
        let runs = self.field_runs.runs_for(&schema);
        let pointer_run = self.mapper.pointer_run();

        let planned: Vec<(usize, &Arc<Run>)> = record
            .values()
            .iter()
            .enumerate()
            .map(|(i, value)| {
                let at = record.location() + schema.offset_of(i);
                let run = match value {
                    Value::Pointer { .. } => &pointer_run,
                    _ => &runs[i],
                };
                (at, run)
            })
            .collect();
        if !planned
            .iter()
            .all(|(at, run)| self.storage.can_register(self.data, *at, run))
        {
            return Ok(false);
        }

        for ((at, run), value) in planned.into_iter().zip(record.values()) {
            // pointer sources are registered when their destination is claimed
            if !matches!(value, Value::Pointer { .. }) {
                self.storage.add_run(self.data, at, Arc::clone(run))?;
            }
        }
        self.seek_children(record)?;
        Ok(true)
    }

    /// Registers `records` in order, stopping at the first one whose fields
    /// overlap data registered meanwhile. Returns the registered prefix.
    fn register_records(
        &mut self,
        schema: &Arc<Schema>,
        mut records: Vec<Record>,
    ) -> Result<Vec<Record>> {
        for n in 0..records.len() {
            if !self.register_record(&records[n])? {
                debug!(
                    "{} element {} at {:#X} overlaps existing data; array ends there",
                    schema.name(),
                    n,
                    records[n].location()
                );
                records.truncate(n);
                break;
            }
        }
        Ok(records)
    }

    fn count_shaped(&self, shape: &Shape, address: usize) -> usize {
        let stride = shape.stride();
        let tag = self.mapper.bank_tag();
        (0..)
            .take_while(|n| shape.matches(self.data, address + n * stride, tag))
            .count()
    }

    fn count_parsed(&self, schema: &Arc<Schema>, address: usize, stride: usize) -> usize {
        (0..)
            .take_while(|n| self.parse(schema, address + n * stride).is_some())
            .count()
    }

    /// Finds the most plausible variable-length array of `schema`.
    ///
    /// Every open, free destination is measured twice: how many consecutive
    /// elements fit `shape`, and how many parse. Both counts must reach the
    /// minimum. The tie-breaker picks among survivors; the winner's interior
    /// pointers are dropped from the candidates, its records registered and
    /// its destination claimed.
    pub fn find_variable_array(
        &mut self,
        shape: &Shape,
        schema: &Arc<Schema>,
    ) -> Result<Option<ArrayMatch>> {
        let stride = shape.stride();
        let mut candidates = Vec::new();

        for address in self.mapper.open_destinations() {
            if !self.storage.is_free(self.data, address) {
                continue;
            }
            let shaped = self.count_shaped(shape, address);
            if shaped < self.min_array_len || address + stride * shaped >= self.data.len() {
                continue;
            }
            let parsed = self.count_parsed(schema, address, stride);
            if parsed < self.min_array_len {
                continue;
            }
            if !self.storage.is_range_free(self.data, address, parsed * stride) {
                trace!("Array at {:#X} overlaps existing data", address);
                continue;
            }
            candidates.push(ArrayCandidate {
                start: address,
                count: parsed,
                stride,
            });
        }

        self.finish_array(shape, schema, candidates)
    }

    /// Like [`LayoutMatcher::find_variable_array`], but the array ends at the
    /// first element whose leading byte is `ender`.
    pub fn find_terminated_array(
        &mut self,
        ender: u8,
        shape: &Shape,
        schema: &Arc<Schema>,
    ) -> Result<Option<ArrayMatch>> {
        let stride = shape.stride();
        let tag = self.mapper.bank_tag();
        let mut candidates = Vec::new();

        for address in self.mapper.open_destinations() {
            if !self.storage.is_free(self.data, address) {
                continue;
            }
            let count = (0..)
                .take_while(|n| {
                    self.data
                        .get(address + n * stride)
                        .is_some_and(|byte| *byte != ender)
                })
                .count();
            if address + stride * count >= self.data.len() || count < self.min_array_len {
                continue;
            }
            let fits = (0..count).all(|n| {
                let at = address + n * stride;
                shape.matches(self.data, at, tag) && self.parse(schema, at).is_some()
            });
            if !fits || !self.storage.is_range_free(self.data, address, count * stride) {
                continue;
            }
            candidates.push(ArrayCandidate {
                start: address,
                count,
                stride,
            });
        }

        self.finish_array(shape, schema, candidates)
    }

    fn finish_array(
        &mut self,
        shape: &Shape,
        schema: &Arc<Schema>,
        candidates: Vec<ArrayCandidate>,
    ) -> Result<Option<ArrayMatch>> {
        let Some(winner) = self
            .tie_break
            .pick(self.data, &candidates)
            .and_then(|i| candidates.get(i).copied())
        else {
            debug!("No {} array matching '{}'", schema.name(), shape);
            return Ok(None);
        };
        debug!(
            "{} array at {:#X}: {} elements (of {} candidates)",
            schema.name(),
            winner.start,
            winner.count,
            candidates.len()
        );

        let records: Vec<Record> = (0..winner.count)
            .filter_map(|n| self.parse(schema, winner.start + n * winner.stride))
            .collect();
        let source = self.mapper.pointers_from_destination(winner.start).first().copied();

        let (start, end) = (winner.start, winner.end());
        self.mapper
            .filter_pointers(|destination| destination <= start || destination >= end);
        let records = self.register_records(schema, records)?;
        if records.is_empty() {
            return Ok(None);
        }
        self.mapper
            .claim_destination(self.storage, self.data, winner.start)?;

        Ok(Some(ArrayMatch {
            source,
            start: winner.start,
            stride: winner.stride,
            records,
        }))
    }

    /// Registers every open destination that holds a record of `schema`.
    ///
    /// Destinations are claimed later, when deferred claims are resolved.
    pub fn find_many(&mut self, shape: &Shape, schema: &Arc<Schema>) -> Result<Vec<RecordMatch>> {
        let tag = self.mapper.bank_tag();
        let mut matches = Vec::new();

        for address in self.mapper.open_destinations() {
            if !self.storage.is_free(self.data, address) || !shape.matches(self.data, address, tag) {
                continue;
            }
            let Some(record) = self.parse(schema, address).filter(plausible_words) else {
                continue;
            };
            if !self.register_record(&record)? {
                continue;
            }
            let source = self.mapper.pointers_from_destination(address).first().copied();
            self.mapper.defer(address, None);
            matches.push(RecordMatch { source, record });
        }

        debug!("Found {} {} records", matches.len(), schema.name());
        Ok(matches)
    }

    /// Reads `count` records from wherever the pointer at `pointer_at` leads.
    ///
    /// All of them must parse and the range must be free; otherwise nothing
    /// is registered. The table ends early at an element whose bytes were
    /// taken by an earlier element's children.
    pub fn read_array(
        &mut self,
        count: usize,
        pointer_at: usize,
        schema: &Arc<Schema>,
    ) -> Result<Option<ArrayMatch>> {
        let Some(start) = follow_pointer(self.data, pointer_at, self.mapper.bank_tag()) else {
            debug!("No pointer at {:#X} for {}", pointer_at, schema.name());
            return Ok(None);
        };
        let stride = schema.size();

        let mut records = Vec::with_capacity(count);
        for n in 0..count {
            let Some(record) = self.parse(schema, start + n * stride) else {
                debug!(
                    "{} element {} at {:#X} does not parse",
                    schema.name(),
                    n,
                    start + n * stride
                );
                return Ok(None);
            };
            records.push(record);
        }
        let end = start + count * stride;
        if !self.storage.is_range_free(self.data, start, count * stride) {
            debug!("{} table at {:#X} overlaps existing data", schema.name(), start);
            return Ok(None);
        }

        self.mapper
            .filter_pointers(|destination| destination <= start || destination >= end);
        let records = self.register_records(schema, records)?;
        if records.is_empty() {
            return Ok(None);
        }
        self.mapper
            .claim_pointer_at(self.storage, self.data, pointer_at, start)?;
        debug!("{} table at {:#X}: {} elements", schema.name(), start, records.len());

        Ok(Some(ArrayMatch {
            source: Some(pointer_at),
            start,
            stride,
            records,
        }))
    }
}

fn plausible_words(record: &Record) -> bool {
    record.values().iter().all(|value| match value {
        Value::Word(word) => word >> 24 == 0,
        Value::Pointer {
            child: Some(child), ..
        } => match child.as_ref() {
            Value::Record(nested) => plausible_words(nested),
            _ => true,
        },
        _ => true,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::{encode_pointer, DEFAULT_BANK_TAG};
    use crate::layout::Target;

    struct Fixture {
        data: Vec<u8>,
        storage: RunStorage,
        charmap: CharacterTable,
        field_runs: FieldRuns,
    }

    impl Fixture {
        fn new(data: Vec<u8>) -> Self {
            Self {
                data,
                storage: RunStorage::new(),
                charmap: CharacterTable::english(),
                field_runs: FieldRuns::new(),
            }
        }
    }

    fn put_pointer(data: &mut [u8], at: usize, destination: usize) {
        data[at..at + 4].copy_from_slice(&encode_pointer(destination, DEFAULT_BANK_TAG));
    }

    fn pair_schema() -> Arc<Schema> {
        Schema::builder("pair").word("value").text_pointer("name").build()
    }

    /// `count` pair records at `start`, names at `names`
    fn plant_pairs(data: &mut [u8], start: usize, count: usize, names: usize) {
        for n in 0..count {
            let at = start + n * 8;
            data[at..at + 4].copy_from_slice(&((n as u32 * 37 + 5) % 251).to_le_bytes());
            let name = names + n * 4;
            data[name..name + 3].copy_from_slice(&[0xBB + n as u8 % 26, 0xD5, 0xFF]);
            put_pointer(data, at + 4, name);
        }
    }

    #[test]
    fn test_repeat_ratio() {
        assert_eq!(repeat_ratio(&[1, 1, 1, 1], 0, 4), 0.75);
        assert_eq!(repeat_ratio(&[1, 2, 3, 4], 0, 4), 0.0);
        assert_eq!(repeat_ratio(&[1], 0, 1), 1.0);
    }

    #[test]
    fn test_fewest_repeats_pick() {
        let mut data = vec![0u8; 0x40];
        for (i, byte) in data[0x20..].iter_mut().enumerate() {
            *byte = i as u8;
        }
        let candidates = [
            ArrayCandidate { start: 0, count: 4, stride: 4 },
            ArrayCandidate { start: 0x20, count: 4, stride: 4 },
        ];
        assert_eq!(FewestRepeats.pick(&data, &candidates), Some(1));
        assert_eq!(FewestRepeats.pick(&data, &[]), None);
    }

    #[test]
    fn test_field_runs_anchor_decoder() {
        let schema = Schema::builder("s")
            .pointer("p", Target::Opaque)
            .byte("b")
            .text("t", 4)
            .build();
        let mut cache = FieldRuns::new();
        let runs = cache.runs_for(&schema);
        assert_eq!(runs.len(), 3);
        assert!(matches!(runs[1].decoder(), Some(Decoder::Record(_))));
        assert!(matches!(runs[2].decoder(), Some(Decoder::FixedText(4))));
        // cached instances are shared
        assert!(Arc::ptr_eq(&runs[1], &cache.runs_for(&schema)[1]));
    }

    #[test]
    fn test_find_variable_array() {
        // 0xFF filler fails the pointer slot, so the shape stops after the table
        let mut data = vec![0xFFu8; 0x800];
        plant_pairs(&mut data, 0x100, 12, 0x400);
        put_pointer(&mut data, 0x10, 0x100);
        // a second, shorter candidate that also parses
        plant_pairs(&mut data, 0x200, 4, 0x600);
        put_pointer(&mut data, 0x14, 0x200);
        let mut fx = Fixture::new(data);

        let mut mapper = PointerMapper::scan(&fx.data, DEFAULT_BANK_TAG);
        let schema = pair_schema();
        let shape = Shape::parse("wp").unwrap();
        let found = {
            let mut matcher =
                LayoutMatcher::new(&fx.data, &fx.storage, &mut mapper, &fx.charmap, &mut fx.field_runs);
            matcher.find_variable_array(&shape, &schema).unwrap().unwrap()
        };

        assert_eq!(found.start, 0x100);
        assert_eq!(found.source, Some(0x10));
        assert!(found.records.len() >= 12);
        assert!(fx.storage.is_start_of_run(0x100));
        assert!(fx.storage.is_start_of_run(0x10));
        assert!(mapper.is_claimed(0x100));
        // names are registered as text
        assert!(fx.storage.is_start_of_run(0x400));
        // the pointer fields themselves wait for deferred claims
        assert!(mapper.deferred_count() > 0);
        mapper.claim_deferred(&fx.storage, &fx.data).unwrap();
        assert!(fx.storage.is_start_of_run(0x104));
    }

    #[test]
    fn test_array_stops_at_taken_element() {
        let mut data = vec![0xFFu8; 0x800];
        plant_pairs(&mut data, 0x100, 12, 0x400);
        put_pointer(&mut data, 0x10, 0x100);
        // the first name is the text "A" sitting in the third element's word
        put_pointer(&mut data, 0x104, 0x110);
        data[0x110..0x114].copy_from_slice(&[0xBB, 0xFF, 0x00, 0x00]);
        let mut fx = Fixture::new(data);

        let mut mapper = PointerMapper::scan(&fx.data, DEFAULT_BANK_TAG);
        let schema = pair_schema();
        let shape = Shape::parse("wp").unwrap();
        let found = {
            let mut matcher =
                LayoutMatcher::new(&fx.data, &fx.storage, &mut mapper, &fx.charmap, &mut fx.field_runs)
                    .min_array_len(11);
            matcher.find_variable_array(&shape, &schema).unwrap().unwrap()
        };

        assert_eq!(found.start, 0x100);
        assert_eq!(found.records.len(), 2);
        assert_eq!(found.end(), 0x110);
        assert!(mapper.is_claimed(0x100));
        assert_eq!(
            fx.storage.run_at(0x110).map(|run| run.kind().clone()),
            Some(RunKind::Text)
        );
        assert!(!fx.storage.is_start_of_run(0x118));
    }

    #[test]
    fn test_find_variable_array_too_short() {
        let mut data = vec![0u8; 0x800];
        plant_pairs(&mut data, 0x100, 5, 0x400);
        put_pointer(&mut data, 0x10, 0x100);
        // zero after the planted records stops the parse
        let mut fx = Fixture::new(data);
        let mut mapper = PointerMapper::scan(&fx.data, DEFAULT_BANK_TAG);
        let schema = pair_schema();
        let shape = Shape::parse("wp").unwrap();

        let mut matcher =
            LayoutMatcher::new(&fx.data, &fx.storage, &mut mapper, &fx.charmap, &mut fx.field_runs);
        assert!(matcher.find_variable_array(&shape, &schema).unwrap().is_none());
        assert!(fx.storage.is_empty());
    }

    #[test]
    fn test_find_terminated_array() {
        let mut data = vec![0u8; 0x800];
        plant_pairs(&mut data, 0x100, 12, 0x400);
        data[0x160] = 0xFE;
        put_pointer(&mut data, 0x10, 0x100);
        let mut fx = Fixture::new(data);
        let mut mapper = PointerMapper::scan(&fx.data, DEFAULT_BANK_TAG);
        let schema = pair_schema();
        let shape = Shape::parse("wp").unwrap();

        let found = {
            let mut matcher =
                LayoutMatcher::new(&fx.data, &fx.storage, &mut mapper, &fx.charmap, &mut fx.field_runs);
            matcher.find_terminated_array(0xFE, &shape, &schema).unwrap().unwrap()
        };
        assert_eq!(found.start, 0x100);
        assert_eq!(found.records.len(), 12);
        assert_eq!(found.end(), 0x160);
        assert!(mapper.is_claimed(0x100));
        assert!(fx.storage.is_free(&fx.data, 0x160));
    }

    #[test]
    fn test_read_array() {
        let mut data = vec![0u8; 0x400];
        let names = Schema::builder("name").text("name", 4).build();
        for n in 0..3 {
            let at = 0x100 + n * 4;
            data[at..at + 4].copy_from_slice(&[0xBB + n as u8, 0xBB, 0xFF, 0x00]);
        }
        put_pointer(&mut data, 0x20, 0x100);
        let mut fx = Fixture::new(data);
        let mut mapper = PointerMapper::scan(&fx.data, DEFAULT_BANK_TAG);

        let found = {
            let mut matcher =
                LayoutMatcher::new(&fx.data, &fx.storage, &mut mapper, &fx.charmap, &mut fx.field_runs);
            matcher.read_array(3, 0x20, &names).unwrap().unwrap()
        };
        assert_eq!(found.records.len(), 3);
        assert_eq!(found.records[2].title(), Some("CA"));
        assert!(fx.storage.is_start_of_run(0x108));
        assert!(fx.storage.is_start_of_run(0x20));
        assert_eq!(mapper.pointers_from_destination(0x100), vec![0x20]);

        // a fourth element does not parse: all or nothing
        let mut mapper = PointerMapper::scan(&fx.data, DEFAULT_BANK_TAG);
        let storage = RunStorage::new();
        let mut matcher =
            LayoutMatcher::new(&fx.data, &storage, &mut mapper, &fx.charmap, &mut fx.field_runs);
        assert!(matcher.read_array(4, 0x20, &names).unwrap().is_none());
        assert!(storage.is_empty());
    }

    #[test]
    fn test_could_be_word_heuristic() {
        let mut data = vec![0u8; 0x40];
        data[0..4].copy_from_slice(&0x0100_0000u32.to_le_bytes());
        let fx = Fixture::new(data);
        let schema = Schema::builder("w").word("w").build();
        let mut mapper = PointerMapper::scan(&fx.data, DEFAULT_BANK_TAG);
        let mut field_runs = FieldRuns::new();
        let matcher = LayoutMatcher::new(&fx.data, &fx.storage, &mut mapper, &fx.charmap, &mut field_runs);

        assert!(!matcher.could_be(0, &schema));
        assert!(matcher.could_be(4, &schema));
        assert!(!matcher.could_be(0x3E, &schema));
    }

    #[test]
    fn test_find_many() {
        let mut data = vec![0u8; 0x400];
        plant_pairs(&mut data, 0x100, 1, 0x200);
        plant_pairs(&mut data, 0x180, 1, 0x280);
        put_pointer(&mut data, 0x10, 0x100);
        put_pointer(&mut data, 0x14, 0x180);
        let mut fx = Fixture::new(data);
        let mut mapper = PointerMapper::scan(&fx.data, DEFAULT_BANK_TAG);
        let schema = pair_schema();
        let shape = Shape::parse("wp").unwrap();

        let found = {
            let mut matcher =
                LayoutMatcher::new(&fx.data, &fx.storage, &mut mapper, &fx.charmap, &mut fx.field_runs);
            matcher.find_many(&shape, &schema).unwrap()
        };
        let starts: Vec<usize> = found.iter().map(|m| m.record.location()).collect();
        assert_eq!(starts, vec![0x100, 0x180]);

        let conflicts = mapper.claim_deferred(&fx.storage, &fx.data).unwrap();
        assert!(conflicts.is_empty());
        assert!(mapper.is_claimed(0x100));
        assert!(mapper.is_claimed(0x180));
        assert!(fx.storage.is_start_of_run(0x10));
    }
}
