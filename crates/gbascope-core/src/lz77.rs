//! GBA BIOS LZ77 (type `0x10`) codec.
//!
//! ## Container
//!
//! ```text
//! +------+---------------------+------------------------------------+
//! | 0x10 | length (24-bit LE)  | flag byte, 8 tokens, flag byte ... |
//! +------+---------------------+------------------------------------+
//! ```
//!
//! Flags are read most significant bit first. A clear bit is a literal byte.
//! A set bit is a two byte back-reference `b0 b1`: run length is
//! `(b0 >> 4) + 3`, distance is `((b0 & 0xF) << 8 | b1) + 1`. Back-references
//! may overlap the bytes they produce. Decoding stops as soon as `length`
//! bytes have been produced, even mid-token.
//!
//! [`probe`] and [`decompress`] share one walk; the only difference is the
//! sink the walk writes into.

use crate::error::{Error, Result};
use bytes::Bytes;

/// Tag byte opening an LZ77 stream
pub const LZ_TAG: u8 = 0x10;

/// Largest payload the 24-bit length field can describe
pub const MAX_UNCOMPRESSED: usize = 0x00FF_FFFF;

const HEADER_LEN: usize = 4;
const MIN_RUN: usize = 3;
const MAX_RUN: usize = 18;
const WINDOW: usize = 0x1000;

/// Sizes reported by [`probe`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct LzSizes {
    /// Length declared by the header, and produced by the stream
    pub uncompressed: usize,
    /// Bytes consumed from the stream start, header included
    pub compressed: usize,
}

/// Destination of decoded tokens
trait Sink {
    fn produced(&self) -> usize;
    fn literal(&mut self, byte: u8);
    fn copy(&mut self, distance: usize, count: usize);
}

/// Counts output without keeping it
struct Counter(usize);

impl Sink for Counter {
    fn produced(&self) -> usize {
        self.0
    }

    fn literal(&mut self, _byte: u8) {
        self.0 += 1;
    }

    fn copy(&mut self, _distance: usize, count: usize) {
        self.0 += count;
    }
}

impl Sink for Vec<u8> {
    fn produced(&self) -> usize {
        self.len()
    }

    fn literal(&mut self, byte: u8) {
        self.push(byte);
    }

    fn copy(&mut self, distance: usize, count: usize) {
        // byte by byte: the source may overlap what this copy produces
        for _ in 0..count {
            let byte = self[self.len() - distance];
            self.push(byte);
        }
    }
}

/// Reads the uncompressed length from a header without walking the body
pub fn declared_length(data: &[u8], offset: usize) -> Option<usize> {
    let header = data.get(offset..offset.checked_add(HEADER_LEN)?)?;
    (header[0] == LZ_TAG).then(|| {
        usize::from(header[1]) | usize::from(header[2]) << 8 | usize::from(header[3]) << 16
    })
}

fn next_byte(data: &[u8], cursor: &mut usize, offset: usize) -> Result<u8> {
    let byte = *data.get(*cursor).ok_or_else(|| {
        Error::invalid_lz(offset, format!("stream runs past the end of the buffer at {:#X}", *cursor))
    })?;
    *cursor += 1;
    Ok(byte)
}

fn walk<S: Sink>(data: &[u8], offset: usize, sink: &mut S) -> Result<LzSizes> {
    let Some(tag) = data.get(offset) else {
        return Err(Error::invalid_lz(offset, "header runs past the end of the buffer"));
    };
    if *tag != LZ_TAG {
        return Err(Error::invalid_lz(
            offset,
            format!("expected tag {LZ_TAG:#04X}, found {tag:#04X}"),
        ));
    }
    let length = declared_length(data, offset)
        .ok_or_else(|| Error::invalid_lz(offset, "header runs past the end of the buffer"))?;

    let mut cursor = offset + HEADER_LEN;
    while sink.produced() < length {
        let flags = next_byte(data, &mut cursor, offset)?;
        for bit in (0..8).rev() {
            if sink.produced() >= length {
                break;
            }
            if flags >> bit & 1 == 0 {
                let byte = next_byte(data, &mut cursor, offset)?;
                sink.literal(byte);
                continue;
            }

            let b0 = next_byte(data, &mut cursor, offset)?;
            let b1 = next_byte(data, &mut cursor, offset)?;
            let run = usize::from(b0 >> 4) + MIN_RUN;
            let distance = (usize::from(b0 & 0x0F) << 8 | usize::from(b1)) + 1;
            if distance > sink.produced() {
                return Err(Error::invalid_lz(
                    offset,
                    format!(
                        "back-reference distance {distance} exceeds the {} bytes decoded so far",
                        sink.produced()
                    ),
                ));
            }
            sink.copy(distance, run.min(length - sink.produced()));
        }
    }

    Ok(LzSizes {
        uncompressed: length,
        compressed: cursor - offset,
    })
}

/// Walks the stream at `offset` without producing output.
///
/// Fails on a tag mismatch, on a back-reference reaching before the start of
/// the output, or when the stream ends before the declared length is reached.
pub fn probe(data: &[u8], offset: usize) -> Result<LzSizes> {
    walk(data, offset, &mut Counter(0))
}

/// Decodes the stream at `offset` into exactly its declared length
pub fn decompress(data: &[u8], offset: usize) -> Result<Bytes> {
    let capacity = declared_length(data, offset).unwrap_or(0);
    let mut out = Vec::with_capacity(capacity);
    walk(data, offset, &mut out)?;
    Ok(Bytes::from(out))
}

/// Greedy encoder producing a stream [`decompress`] accepts
pub fn compress(input: &[u8]) -> Result<Vec<u8>> {
    if input.len() > MAX_UNCOMPRESSED {
        return Err(Error::LzInputTooLarge { len: input.len() });
    }

    let mut out = Vec::with_capacity(HEADER_LEN + input.len() + input.len() / 8 + 1);
    out.push(LZ_TAG);
    out.extend_from_slice(&(input.len() as u32).to_le_bytes()[..3]);

    let mut pos = 0;
    while pos < input.len() {
        let flag_index = out.len();
        out.push(0);
        for bit in (0..8).rev() {
            if pos >= input.len() {
                break;
            }
            match longest_match(input, pos) {
                Some((distance, run)) => {
                    out[flag_index] |= 1 << bit;
                    let d = distance - 1;
                    out.push(((run - MIN_RUN) << 4 | d >> 8) as u8);
                    out.push(d as u8);
                    pos += run;
                }
                None => {
                    out.push(input[pos]);
                    pos += 1;
                }
            }
        }
    }

    Ok(out)
}

/// Longest earlier occurrence of the bytes at `pos`, as `(distance, run)`
fn longest_match(input: &[u8], pos: usize) -> Option<(usize, usize)> {
    let max_run = MAX_RUN.min(input.len() - pos);
    if max_run < MIN_RUN {
        return None;
    }

    let mut best: Option<(usize, usize)> = None;
    for distance in 1..=WINDOW.min(pos) {
        let start = pos - distance;
        let run = (0..max_run)
            .take_while(|&i| input[start + i] == input[pos + i])
            .count();
        if run >= MIN_RUN && best.map_or(true, |(_, longest)| run > longest) {
            best = Some((distance, run));
            if run == max_run {
                break;
            }
        }
    }
    best
}
