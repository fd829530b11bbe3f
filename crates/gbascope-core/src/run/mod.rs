//! Runs: typed, non-overlapping ranges of the byte buffer.
//!
//! A [`Run`] describes how to measure, decode, follow and edit the bytes it
//! covers. It carries no position; [`RunStorage`] maps starts to shared
//! `Arc<Run>` values, so one pointer run can back thousands of pointers.

mod storage;

pub use storage::{Coverage, RunStorage};

use crate::buffer::{follow_pointer, read_u32};
use crate::layout::{Record, Schema};
use crate::lz77;
use crate::media::{Palette, TiledImage};
use crate::text::{CharacterTable, TERMINATOR};
use std::fmt;
use std::sync::Arc;

/// Provider identity of a run
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum RunKind {
    /// A fixed entry of the cartridge header
    Header(&'static str),
    /// A pointer word
    Pointer,
    /// An LZ77 compressed asset
    Compressed(AssetKind),
    /// Terminated text in the title's character table
    Text,
    /// A field of a matched record
    Field {
        /// Schema the field belongs to
        schema: Arc<str>,
        /// Field name
        name: Arc<str>,
    },
    /// Bytes a record declares unused
    Padding,
}

impl fmt::Display for RunKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Header(name) => write!(f, "header:{name}"),
            Self::Pointer => f.write_str("pointer"),
            Self::Compressed(kind) => write!(f, "lz:{kind}"),
            Self::Text => f.write_str("text"),
            Self::Field { schema, name } => write!(f, "{schema}.{name}"),
            Self::Padding => f.write_str("padding"),
        }
    }
}

/// What an LZ77 blob decompresses into
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AssetKind {
    /// 16-color BGR555 palette
    Palette,
    /// 4bpp tile sheet
    Image,
}

impl fmt::Display for AssetKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Palette => "palette",
            Self::Image => "image",
        })
    }
}

/// How a run measures itself
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LengthRule {
    /// Always this many bytes
    Fixed(usize),
    /// Advance by `stride` until the byte at the cursor is `terminator`;
    /// the terminating step is included
    Terminated {
        /// Byte ending the run
        terminator: u8,
        /// Step between candidate terminator positions
        stride: usize,
    },
}

impl LengthRule {
    /// Length of a run following this rule at `start`.
    ///
    /// A terminated run that never finds its terminator ends at the buffer end.
    pub fn measure(&self, data: &[u8], start: usize) -> usize {
        match *self {
            Self::Fixed(len) => len,
            Self::Terminated { terminator, stride } => {
                let stride = stride.max(1);
                let available = data.len().saturating_sub(start);
                let mut len = 0;
                while len < available {
                    if data[start + len] == terminator {
                        return (len + stride).min(available);
                    }
                    len += stride;
                }
                available
            }
        }
    }
}

/// How a run turns bytes into an [`Artifact`]
#[derive(Debug, Clone)]
pub enum Decoder {
    /// Printable ASCII, NUL padded
    Ascii,
    /// Terminated text through the character table
    Text,
    /// Fixed-length text through the character table
    FixedText(usize),
    /// Uncompressed 16-color palette
    Palette,
    /// LZ77 compressed palette
    LzPalette,
    /// LZ77 compressed 4bpp tiles
    LzImage,
    /// Pointer word; the artifact is the destination's artifact
    Pointer,
    /// A whole record of this schema
    Record(Arc<Schema>),
}

impl PartialEq for Decoder {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Self::Record(a), Self::Record(b)) => Arc::ptr_eq(a, b),
            (Self::FixedText(a), Self::FixedText(b)) => a == b,
            _ => std::mem::discriminant(self) == std::mem::discriminant(other),
        }
    }
}

impl Eq for Decoder {}

/// How a run exposes navigation targets
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum JumpRule {
    /// Follow the pointer word at the start of the run
    Pointer {
        /// Bank tag the word must carry
        bank_tag: u8,
    },
}

impl JumpRule {
    /// Destinations reachable from the run at `start`
    pub fn targets(&self, data: &[u8], start: usize) -> Vec<usize> {
        match *self {
            Self::Pointer { bank_tag } => follow_pointer(data, start, bank_tag).into_iter().collect(),
        }
    }
}

/// What kind of in-place editing a run accepts
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EditRule {
    /// Characters are mapped through the character table
    Text,
    /// Raw hex digits
    Hex,
}

/// A decoded, presentation-independent view of a run
#[derive(Debug, Clone, PartialEq)]
pub enum Artifact {
    /// Text
    Text(String),
    /// Palette
    Palette(Palette),
    /// Tile sheet
    Image(TiledImage),
    /// Parsed record
    Record(Record),
    /// A pointer and what it leads to
    Link {
        /// Where the pointer leads
        destination: usize,
        /// Artifact at the destination, if it has one
        target: Option<Arc<Artifact>>,
    },
}

impl Artifact {
    /// Text content, if this artifact is text
    pub fn as_text(&self) -> Option<&str> {
        match self {
            Self::Text(text) => Some(text),
            _ => None,
        }
    }
}

/// Shared state a decoder may need
#[derive(Debug, Clone, Copy)]
pub struct DecodeContext<'a> {
    /// Character table for text runs
    pub charmap: &'a CharacterTable,
    /// Bank tag for pointer words
    pub bank_tag: u8,
}

impl Decoder {
    /// Decodes `len` bytes at `start`.
    ///
    /// Pointer runs resolve to a bare [`Artifact::Link`]; storage fills in the
    /// target because only it can look the destination up.
    pub fn decode(
        &self,
        data: &[u8],
        start: usize,
        len: usize,
        ctx: &DecodeContext<'_>,
    ) -> Option<Artifact> {
        let bytes = data.get(start..start.checked_add(len)?)?;
        match self {
            Self::Ascii => {
                let text: String = bytes
                    .iter()
                    .take_while(|b| **b != 0)
                    .map(|b| if b.is_ascii_graphic() || *b == b' ' { char::from(*b) } else { '.' })
                    .collect();
                Some(Artifact::Text(text))
            }
            Self::Text => ctx.charmap.decode(data, start, None).map(Artifact::Text),
            Self::FixedText(max) => ctx.charmap.decode(data, start, Some(*max)).map(Artifact::Text),
            Self::Palette => Palette::from_bgr555(bytes).map(Artifact::Palette),
            Self::LzPalette => {
                let raw = lz77::decompress(data, start).ok()?;
                Palette::from_bgr555(&raw).map(Artifact::Palette)
            }
            Self::LzImage => {
                let raw = lz77::decompress(data, start).ok()?;
                Some(Artifact::Image(TiledImage::from_tiles(raw)))
            }
            Self::Pointer => {
                let word = read_u32(data, start)?;
                Some(Artifact::Link {
                    destination: (word & 0x00FF_FFFF) as usize,
                    target: None,
                })
            }
            Self::Record(schema) => schema
                .parse(data, start, ctx)
                .ok()
                .map(Artifact::Record),
        }
    }
}

/// An immutable description of a typed range
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Run {
    kind: RunKind,
    length: LengthRule,
    decoder: Option<Decoder>,
    jump: Option<JumpRule>,
    editor: Option<EditRule>,
}

impl Run {
    /// A run of `len` bytes
    pub fn fixed(kind: RunKind, len: usize) -> Self {
        Self::new(kind, LengthRule::Fixed(len))
    }

    /// A run ending at `terminator`, scanned in `stride` steps
    pub fn terminated(kind: RunKind, terminator: u8, stride: usize) -> Self {
        Self::new(kind, LengthRule::Terminated { terminator, stride })
    }

    /// A run with the given length rule and no capabilities
    pub fn new(kind: RunKind, length: LengthRule) -> Self {
        Self {
            kind,
            length,
            decoder: None,
            jump: None,
            editor: None,
        }
    }

    /// The shared run every claimed pointer word is registered with
    pub fn pointer(bank_tag: u8) -> Self {
        Self::fixed(RunKind::Pointer, 4)
            .with_decoder(Decoder::Pointer)
            .with_jump(JumpRule::Pointer { bank_tag })
            .with_editor(EditRule::Hex)
    }

    /// Terminated text in the character table
    pub fn text() -> Self {
        Self::terminated(RunKind::Text, TERMINATOR, 1)
            .with_decoder(Decoder::Text)
            .with_editor(EditRule::Text)
    }

    /// Sets the decoder
    pub fn with_decoder(mut self, decoder: Decoder) -> Self {
        self.decoder = Some(decoder);
        self
    }

    /// Sets the jump rule
    pub fn with_jump(mut self, jump: JumpRule) -> Self {
        self.jump = Some(jump);
        self
    }

    /// Sets the edit capability
    pub fn with_editor(mut self, editor: EditRule) -> Self {
        self.editor = Some(editor);
        self
    }

    /// Provider identity
    pub fn kind(&self) -> &RunKind {
        &self.kind
    }

    /// Length rule
    pub fn length_rule(&self) -> LengthRule {
        self.length
    }

    /// Decoder, if any
    pub fn decoder(&self) -> Option<&Decoder> {
        self.decoder.as_ref()
    }

    /// Jump rule, if any
    pub fn jump(&self) -> Option<JumpRule> {
        self.jump
    }

    /// Edit capability, if any
    pub fn editor(&self) -> Option<EditRule> {
        self.editor
    }

    /// Length of this run at `start`
    pub fn measure(&self, data: &[u8], start: usize) -> usize {
        self.length.measure(data, start)
    }

    /// Same provider, decoder, jump rule and computed length at `start`
    pub fn is_equivalent(&self, other: &Run, data: &[u8], start: usize) -> bool {
        self.kind == other.kind
            && self.decoder == other.decoder
            && self.jump == other.jump
            && self.measure(data, start) == other.measure(data, start)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::{encode_pointer, DEFAULT_BANK_TAG};

    #[test]
    fn test_terminated_length() {
        let data = [1, 2, 3, 0xFF, 5];
        let rule = LengthRule::Terminated {
            terminator: 0xFF,
            stride: 1,
        };
        assert_eq!(rule.measure(&data, 0), 4);
        assert_eq!(rule.measure(&data, 3), 1);
        // no terminator: clamps to the buffer
        assert_eq!(rule.measure(&data, 4), 1);
    }

    #[test]
    fn test_terminated_stride() {
        let data = [0, 0xFF, 0, 0, 0xFF, 0];
        let rule = LengthRule::Terminated {
            terminator: 0xFF,
            stride: 2,
        };
        // 0xFF at odd offsets is skipped by a stride of two from 0
        assert_eq!(rule.measure(&data, 0), 6);
        assert_eq!(rule.measure(&data, 1), 2);
    }

    #[test]
    fn test_equivalence() {
        let data = [0xBB, 0xBC, 0xFF, 0xBB, 0xFF];
        let a = Run::text();
        let b = Run::text();
        assert!(a.is_equivalent(&b, &data, 0));

        let fixed = Run::fixed(RunKind::Text, 3).with_decoder(Decoder::Text);
        assert!(a.is_equivalent(&fixed, &data, 0));
        assert!(!a.is_equivalent(&fixed, &data, 3));
        assert!(!a.is_equivalent(&Run::pointer(DEFAULT_BANK_TAG), &data, 0));
    }

    #[test]
    fn test_pointer_jump_and_decode() {
        let mut data = vec![0u8; 0x40];
        data[0..4].copy_from_slice(&encode_pointer(0x20, DEFAULT_BANK_TAG));
        let run = Run::pointer(DEFAULT_BANK_TAG);
        assert_eq!(run.jump().unwrap().targets(&data, 0), vec![0x20]);

        let charmap = CharacterTable::english();
        let ctx = DecodeContext {
            charmap: &charmap,
            bank_tag: DEFAULT_BANK_TAG,
        };
        let artifact = run.decoder().unwrap().decode(&data, 0, 4, &ctx).unwrap();
        assert_eq!(
            artifact,
            Artifact::Link {
                destination: 0x20,
                target: None
            }
        );
    }

    #[test]
    fn test_ascii_decode() {
        let data = b"POKEMON FIRE\0\0";
        let charmap = CharacterTable::english();
        let ctx = DecodeContext {
            charmap: &charmap,
            bank_tag: DEFAULT_BANK_TAG,
        };
        let artifact = Decoder::Ascii.decode(data, 0, 14, &ctx).unwrap();
        assert_eq!(artifact.as_text(), Some("POKEMON FIRE"));
    }
}
