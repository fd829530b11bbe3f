//! Declarative record layouts and the structural matcher that finds them.
//!
//! A [`Schema`] is an ordered list of typed fields. Offsets and the
//! name-to-index table are resolved once when the schema is built, so
//! [`Record::get`] is a plain lookup.
//!
//! ```
//! use gbascope_core::layout::{Schema, Target};
//!
//! let entry = Schema::builder("dexinfo")
//!     .text("species", 12)
//!     .short("height")
//!     .short("weight")
//!     .pointer("description", Target::Text)
//!     .padding(4)
//!     .build();
//! assert_eq!(entry.size(), 24);
//! assert_eq!(entry.shape().unwrap().to_string(), "wwwwpw");
//! ```

mod matcher;

pub use matcher::{
    repeat_ratio, ArrayCandidate, DEFAULT_MIN_ARRAY_LEN, ArrayMatch, FewestRepeats, FieldRuns, LayoutMatcher,
    RecordMatch, TieBreak,
};

use crate::buffer::{follow_pointer, read_u16, read_u32};
use crate::error::{Error, Result};
use crate::run::DecodeContext;
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

/// Nesting limit for record pointers when no explicit limit is given
pub const DEFAULT_MAX_DEPTH: usize = 4;

/// What a pointer field leads to
#[derive(Debug, Clone)]
pub enum Target {
    /// Nothing the schema knows about
    Opaque,
    /// A terminated string
    Text,
    /// A nested record
    Record(Arc<Schema>),
}

/// Field type
#[derive(Debug, Clone)]
pub enum FieldKind {
    /// One byte, optionally below `limit`
    Byte {
        /// Exclusive upper bound for enum-like bytes
        limit: Option<u32>,
    },
    /// Little-endian halfword, optionally below `limit`
    Short {
        /// Exclusive upper bound for enum-like shorts
        limit: Option<u32>,
    },
    /// Little-endian word
    Word,
    /// Fixed-size text field; the terminator must fall inside it
    Text(usize),
    /// Unused bytes
    Padding(usize),
    /// Pointer that must be valid
    Pointer(Target),
    /// Pointer that may be zero
    NullablePointer(Target),
}

impl FieldKind {
    /// Bytes the field occupies
    pub fn width(&self) -> usize {
        match self {
            Self::Byte { .. } => 1,
            Self::Short { .. } => 2,
            Self::Word | Self::Pointer(_) | Self::NullablePointer(_) => 4,
            Self::Text(len) | Self::Padding(len) => *len,
        }
    }

    /// True for pointer and nullable pointer fields
    pub fn is_pointer(&self) -> bool {
        matches!(self, Self::Pointer(_) | Self::NullablePointer(_))
    }
}

/// A named field
#[derive(Debug, Clone)]
pub struct Field {
    /// Field name, unique within its schema
    pub name: Arc<str>,
    /// Field type
    pub kind: FieldKind,
}

/// A named record layout
#[derive(Debug)]
pub struct Schema {
    name: Arc<str>,
    fields: Vec<Field>,
    offsets: Vec<usize>,
    index: HashMap<Arc<str>, usize>,
    size: usize,
}

/// Accumulates fields for a [`Schema`]
#[derive(Debug)]
pub struct SchemaBuilder {
    name: Arc<str>,
    fields: Vec<Field>,
}

impl SchemaBuilder {
    fn push(mut self, name: &str, kind: FieldKind) -> Self {
        self.fields.push(Field {
            name: Arc::from(name),
            kind,
        });
        self
    }

    /// Adds a byte
    pub fn byte(self, name: &str) -> Self {
        self.push(name, FieldKind::Byte { limit: None })
    }

    /// Adds a byte that must be below `limit`
    pub fn byte_enum(self, name: &str, limit: u32) -> Self {
        self.push(name, FieldKind::Byte { limit: Some(limit) })
    }

    /// Adds a halfword
    pub fn short(self, name: &str) -> Self {
        self.push(name, FieldKind::Short { limit: None })
    }

    /// Adds a halfword that must be below `limit`
    pub fn short_enum(self, name: &str, limit: u32) -> Self {
        self.push(name, FieldKind::Short { limit: Some(limit) })
    }

    /// Adds a word
    pub fn word(self, name: &str) -> Self {
        self.push(name, FieldKind::Word)
    }

    /// Adds a fixed-size text field
    pub fn text(self, name: &str, len: usize) -> Self {
        self.push(name, FieldKind::Text(len))
    }

    /// Adds unused bytes
    pub fn padding(self, len: usize) -> Self {
        let name = format!("unused{}", self.fields.len());
        self.push(&name, FieldKind::Padding(len))
    }

    /// Adds a pointer
    pub fn pointer(self, name: &str, target: Target) -> Self {
        self.push(name, FieldKind::Pointer(target))
    }

    /// Adds a pointer to a terminated string
    pub fn text_pointer(self, name: &str) -> Self {
        self.pointer(name, Target::Text)
    }

    /// Adds a pointer that may be zero
    pub fn nullable_pointer(self, name: &str, target: Target) -> Self {
        self.push(name, FieldKind::NullablePointer(target))
    }

    /// Resolves offsets and the name index
    pub fn build(self) -> Arc<Schema> {
        let mut offsets = Vec::with_capacity(self.fields.len());
        let mut index = HashMap::with_capacity(self.fields.len());
        let mut size = 0;
        for (i, field) in self.fields.iter().enumerate() {
            offsets.push(size);
            index.insert(Arc::clone(&field.name), i);
            size += field.kind.width();
        }
        Arc::new(Schema {
            name: self.name,
            fields: self.fields,
            offsets,
            index,
            size,
        })
    }
}

impl Schema {
    /// Starts a schema called `name`
    pub fn builder(name: &str) -> SchemaBuilder {
        SchemaBuilder {
            name: Arc::from(name),
            fields: Vec::new(),
        }
    }

    /// Schema name
    pub fn name(&self) -> &Arc<str> {
        &self.name
    }

    /// Fields in declaration order
    pub fn fields(&self) -> &[Field] {
        &self.fields
    }

    /// Byte offset of field `index`
    pub fn offset_of(&self, index: usize) -> usize {
        self.offsets[index]
    }

    /// Index of the field called `name`
    pub fn index_of(&self, name: &str) -> Option<usize> {
        self.index.get(name).copied()
    }

    /// Size of one record in bytes
    pub fn size(&self) -> usize {
        self.size
    }

    /// Word-level shape of the record, if its size is a multiple of four
    pub fn shape(&self) -> Option<Shape> {
        if self.size % 4 != 0 {
            return None;
        }
        let mut slots = vec![Slot::Word; self.size / 4];
        for (field, &offset) in self.fields.iter().zip(&self.offsets) {
            if field.kind.is_pointer() && offset % 4 == 0 {
                slots[offset / 4] = Slot::Pointer;
            }
        }
        Some(Shape { slots })
    }

    /// Parses one record at `at` with the default nesting limit
    pub fn parse(
        self: &Arc<Self>,
        data: &[u8],
        at: usize,
        ctx: &DecodeContext<'_>,
    ) -> std::result::Result<Record, Rejection> {
        self.parse_nested(data, at, ctx, DEFAULT_MAX_DEPTH)
    }

    /// Parses one record, following record pointers at most `depth` levels
    pub fn parse_nested(
        self: &Arc<Self>,
        data: &[u8],
        at: usize,
        ctx: &DecodeContext<'_>,
        depth: usize,
    ) -> std::result::Result<Record, Rejection> {
        if at.checked_add(self.size).map_or(true, |end| end > data.len()) {
            return Err(self.reject(at, None, "record runs past the end of the buffer"));
        }

        let mut values = Vec::with_capacity(self.fields.len());
        for (i, field) in self.fields.iter().enumerate() {
            let offset = at + self.offsets[i];
            let value = match &field.kind {
                FieldKind::Byte { limit } => {
                    let value = data[offset];
                    if limit.is_some_and(|limit| u32::from(value) >= limit) {
                        return Err(self.reject(at, Some(i), "value out of range"));
                    }
                    Value::Byte(value)
                }
                FieldKind::Short { limit } => {
                    let value = read_u16(data, offset).unwrap_or_default();
                    if limit.is_some_and(|limit| u32::from(value) >= limit) {
                        return Err(self.reject(at, Some(i), "value out of range"));
                    }
                    Value::Short(value)
                }
                FieldKind::Word => Value::Word(read_u32(data, offset).unwrap_or_default()),
                FieldKind::Text(len) => match ctx.charmap.decode(data, offset, Some(*len)) {
                    Some(text) => Value::Text(text),
                    None => return Err(self.reject(at, Some(i), "not text")),
                },
                FieldKind::Padding(_) => Value::Padding,
                FieldKind::NullablePointer(_) if read_u32(data, offset) == Some(0) => Value::Null,
                FieldKind::Pointer(target) | FieldKind::NullablePointer(target) => {
                    let Some(destination) = follow_pointer(data, offset, ctx.bank_tag) else {
                        return Err(self.reject(at, Some(i), "not a pointer"));
                    };
                    let child = match target {
                        Target::Opaque => None,
                        Target::Text => match ctx.charmap.decode(data, destination, None) {
                            Some(text) => Some(Box::new(Value::Text(text))),
                            None => return Err(self.reject(at, Some(i), "pointer does not lead to text")),
                        },
                        Target::Record(child) => {
                            if depth == 0 {
                                return Err(self.reject(at, Some(i), "records nest too deeply"));
                            }
                            let record = child.parse_nested(data, destination, ctx, depth - 1)?;
                            Some(Box::new(Value::Record(record)))
                        }
                    };
                    Value::Pointer { destination, child }
                }
            };
            values.push(value);
        }

        Ok(Record {
            location: at,
            schema: Arc::clone(self),
            values,
        })
    }

    fn reject(&self, location: usize, field: Option<usize>, reason: &'static str) -> Rejection {
        Rejection {
            location,
            schema: Arc::clone(&self.name),
            field: field.map(|i| Arc::clone(&self.fields[i].name)),
            reason,
        }
    }
}

/// Why a record failed to parse. Not an error: the caller moves on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Rejection {
    /// Start of the rejected record
    pub location: usize,
    /// Schema being parsed
    pub schema: Arc<str>,
    /// Offending field, if the failure is field specific
    pub field: Option<Arc<str>>,
    /// Short description
    pub reason: &'static str,
}

impl fmt::Display for Rejection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.field {
            Some(field) => write!(
                f,
                "{} at {:#X}: {}: {}",
                self.schema, self.location, field, self.reason
            ),
            None => write!(f, "{} at {:#X}: {}", self.schema, self.location, self.reason),
        }
    }
}

/// A parsed field value
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    /// Byte
    Byte(u8),
    /// Halfword
    Short(u16),
    /// Word
    Word(u32),
    /// Decoded text
    Text(String),
    /// Unused bytes
    Padding,
    /// A zero nullable pointer
    Null,
    /// A pointer and what it leads to
    Pointer {
        /// Destination offset
        destination: usize,
        /// Parsed text or record at the destination
        child: Option<Box<Value>>,
    },
    /// A nested record
    Record(Record),
}

impl Value {
    /// Numeric value of byte, short and word fields
    pub fn as_number(&self) -> Option<u32> {
        match self {
            Self::Byte(v) => Some(u32::from(*v)),
            Self::Short(v) => Some(u32::from(*v)),
            Self::Word(v) => Some(*v),
            _ => None,
        }
    }

    /// Text of text fields and of pointers to text
    pub fn as_text(&self) -> Option<&str> {
        match self {
            Self::Text(text) => Some(text),
            Self::Pointer {
                child: Some(child), ..
            } => child.as_text(),
            _ => None,
        }
    }
}

/// One parsed instance of a schema
#[derive(Debug, Clone)]
pub struct Record {
    location: usize,
    schema: Arc<Schema>,
    values: Vec<Value>,
}

impl PartialEq for Record {
    fn eq(&self, other: &Self) -> bool {
        self.location == other.location
            && Arc::ptr_eq(&self.schema, &other.schema)
            && self.values == other.values
    }
}

impl Record {
    /// Where the record starts
    pub fn location(&self) -> usize {
        self.location
    }

    /// The schema it was parsed with
    pub fn schema(&self) -> &Arc<Schema> {
        &self.schema
    }

    /// Values in field order
    pub fn values(&self) -> &[Value] {
        &self.values
    }

    /// Value of the field called `name`
    pub fn get(&self, name: &str) -> Option<&Value> {
        self.schema.index_of(name).map(|i| &self.values[i])
    }

    /// First text value, used as the record's display name
    pub fn title(&self) -> Option<&str> {
        self.values.iter().find_map(|value| match value {
            Value::Text(text) => Some(text.as_str()),
            _ => None,
        })
    }
}

/// One word of a [`Shape`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Slot {
    /// A pointer or zero
    Pointer,
    /// Anything
    Word,
}

/// Word-level outline of a record, such as `"wwwwppwww"`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Shape {
    slots: Vec<Slot>,
}

impl FromStr for Shape {
    type Err = Error;

    fn from_str(shape: &str) -> Result<Self> {
        let slots = shape
            .chars()
            .map(|letter| match letter.to_ascii_lowercase() {
                'p' => Ok(Slot::Pointer),
                'w' => Ok(Slot::Word),
                _ => Err(Error::InvalidShape {
                    shape: shape.to_string(),
                    letter,
                }),
            })
            .collect::<Result<Vec<_>>>()?;
        if slots.is_empty() {
            return Err(Error::InvalidShape {
                shape: String::new(),
                letter: ' ',
            });
        }
        Ok(Self { slots })
    }
}

impl fmt::Display for Shape {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for slot in &self.slots {
            f.write_str(match slot {
                Slot::Pointer => "p",
                Slot::Word => "w",
            })?;
        }
        Ok(())
    }
}

impl Shape {
    /// Parses a shape string of `p` and `w` letters
    pub fn parse(shape: &str) -> Result<Self> {
        shape.parse()
    }

    /// Bytes per element
    pub fn stride(&self) -> usize {
        self.slots.len() * 4
    }

    /// True if the element at `at` fits the shape
    pub fn matches(&self, data: &[u8], at: usize, bank_tag: u8) -> bool {
        if at.checked_add(self.stride()).map_or(true, |end| end > data.len()) {
            return false;
        }
        self.slots.iter().enumerate().all(|(i, slot)| match slot {
            Slot::Word => true,
            Slot::Pointer => {
                let offset = at + i * 4;
                read_u32(data, offset) == Some(0) || follow_pointer(data, offset, bank_tag).is_some()
            }
        })
    }
}
