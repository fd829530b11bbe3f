//! Character tables for in-game text.
//!
//! GBA titles store text in a proprietary single-byte encoding. A
//! [`CharacterTable`] maps each byte to the glyph it renders. Three bytes
//! are structural in every table: `0x00` renders as a space, `0xFD` escapes
//! the following byte and `0xFF` terminates the string.

use crate::error::{Error, Result};
use std::fmt::Write as _;

/// Space byte
pub const SPACE: u8 = 0x00;

/// Escape byte; the next byte is carried raw
pub const ESCAPE: u8 = 0xFD;

/// String terminator
pub const TERMINATOR: u8 = 0xFF;

const ENGLISH: &[(u8, &str)] = &[
    (0x01, "À"), (0x02, "Á"), (0x03, "Â"), (0x04, "Ç"), (0x05, "È"), (0x06, "É"),
    (0x07, "Ê"), (0x08, "Ë"), (0x09, "Ì"), (0x0B, "Î"), (0x0C, "Ï"), (0x0D, "Ò"),
    (0x0E, "Ó"), (0x0F, "Ô"), (0x10, "Œ"), (0x11, "Ù"), (0x12, "Ú"), (0x13, "Û"),
    (0x14, "Ñ"), (0x15, "ß"), (0x16, "à"), (0x17, "á"), (0x19, "ç"), (0x1A, "è"),
    (0x1B, "é"), (0x1C, "ê"), (0x1D, "ë"), (0x1E, "ì"), (0x20, "î"), (0x21, "ï"),
    (0x22, "ò"), (0x23, "ó"), (0x24, "ô"), (0x25, "œ"), (0x26, "ù"), (0x27, "ú"),
    (0x28, "û"), (0x29, "ñ"), (0x2A, "º"), (0x2B, "ª"), (0x2D, "&"), (0x2E, "+"),
    (0x34, "Lv"), (0x35, "="), (0x36, ";"), (0x51, "¿"), (0x52, "¡"), (0x5A, "Í"),
    (0x5B, "%"), (0x5C, "("), (0x5D, ")"), (0x68, "â"), (0x6F, "í"), (0x85, "<"),
    (0x86, ">"), (0xA1, "0"), (0xA2, "1"), (0xA3, "2"), (0xA4, "3"), (0xA5, "4"),
    (0xA6, "5"), (0xA7, "6"), (0xA8, "7"), (0xA9, "8"), (0xAA, "9"), (0xAB, "!"),
    (0xAC, "?"), (0xAD, "."), (0xAE, "-"), (0xAF, "·"), (0xB0, "…"), (0xB1, "“"),
    (0xB2, "”"), (0xB3, "‘"), (0xB4, "'"), (0xB5, "♂"), (0xB6, "♀"), (0xB7, "$"),
    (0xB8, ","), (0xB9, "×"), (0xBA, "/"), (0xEF, "▶"), (0xF0, ":"), (0xF1, "Ä"),
    (0xF2, "Ö"), (0xF3, "Ü"), (0xF4, "ä"), (0xF5, "ö"), (0xF6, "ü"),
];

/// Byte to glyph mapping for one title's text
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CharacterTable {
    glyphs: Vec<Option<String>>,
}

impl Default for CharacterTable {
    fn default() -> Self {
        Self::english()
    }
}

impl CharacterTable {
    /// A table with no glyphs
    pub fn empty() -> Self {
        Self {
            glyphs: vec![None; 0x100],
        }
    }

    /// The built-in table for English releases
    pub fn english() -> Self {
        let mut table = Self::empty();
        for (byte, glyph) in ENGLISH {
            table.glyphs[usize::from(*byte)] = Some((*glyph).to_string());
        }
        for (offset, letter) in ('A'..='Z').enumerate() {
            table.glyphs[0xBB + offset] = Some(letter.to_string());
        }
        for (offset, letter) in ('a'..='z').enumerate() {
            table.glyphs[0xD5 + offset] = Some(letter.to_string());
        }
        table
    }

    /// Parses the `0xNN='glyph'` line format; `#` starts a comment line
    pub fn parse(text: &str) -> Result<Self> {
        let mut table = Self::empty();
        for (index, line) in text.lines().enumerate() {
            let line_no = index + 1;
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }

            let (key, value) = line
                .split_once('=')
                .ok_or_else(|| Error::charmap_parse(line_no, "expected 0xNN='glyph'"))?;
            let digits = key
                .trim()
                .strip_prefix("0x")
                .or_else(|| key.trim().strip_prefix("0X"))
                .ok_or_else(|| Error::charmap_parse(line_no, "key must start with 0x"))?;
            let byte = u8::from_str_radix(digits, 16)
                .map_err(|e| Error::charmap_parse(line_no, format!("bad key '{digits}': {e}")))?;
            let glyph = value
                .trim()
                .strip_prefix('\'')
                .and_then(|v| v.strip_suffix('\''))
                .filter(|v| !v.is_empty())
                .ok_or_else(|| Error::charmap_parse(line_no, "glyph must be quoted"))?;

            table.glyphs[usize::from(byte)] = Some(glyph.to_string());
        }
        Ok(table)
    }

    /// Glyph for `byte`, if the table has one
    pub fn glyph(&self, byte: u8) -> Option<&str> {
        self.glyphs[usize::from(byte)].as_deref()
    }

    /// True if `byte` renders as a glyph
    pub fn is_glyph(&self, byte: u8) -> bool {
        self.glyphs[usize::from(byte)].is_some()
    }

    /// Byte that renders as `c`
    pub fn encode(&self, c: char) -> Option<u8> {
        if c == ' ' {
            return Some(SPACE);
        }
        let mut buf = [0u8; 4];
        let wanted: &str = c.encode_utf8(&mut buf);
        (0..=0xFFu8).find(|&byte| self.glyph(byte) == Some(wanted))
    }

    /// Decodes the string at `at`.
    ///
    /// With `max_len` the terminator must appear within that many bytes.
    /// Returns `None` on an unknown byte or if the text runs off the buffer.
    pub fn decode(&self, data: &[u8], at: usize, max_len: Option<usize>) -> Option<String> {
        let mut out = String::new();
        let mut j = 0;
        loop {
            if max_len.is_some_and(|max| j >= max) {
                return None;
            }
            let byte = *data.get(at + j)?;
            match byte {
                TERMINATOR => return Some(out),
                SPACE => out.push(' '),
                ESCAPE => {
                    let raw = *data.get(at + j + 1)?;
                    let _ = write!(out, "\\x{raw:02X}");
                    j += 1;
                }
                _ => out.push_str(self.glyph(byte)?),
            }
            j += 1;
        }
    }

    /// Case-insensitive search for `term`.
    ///
    /// Returns nothing if some character of the term has no byte in the table.
    pub fn search(&self, data: &[u8], term: &str) -> Vec<usize> {
        let Some(patterns) = self.case_patterns(term) else {
            return Vec::new();
        };
        if patterns.is_empty() {
            return Vec::new();
        }

        data.windows(patterns.len())
            .enumerate()
            .filter(|(_, window)| {
                window
                    .iter()
                    .zip(&patterns)
                    .all(|(byte, (lower, upper))| byte == lower || byte == upper)
            })
            .map(|(position, _)| position)
            .collect()
    }

    fn case_patterns(&self, term: &str) -> Option<Vec<(u8, u8)>> {
        term.chars()
            .map(|c| {
                let lower = c.to_lowercase().next().unwrap_or(c);
                let upper = c.to_uppercase().next().unwrap_or(c);
                let lower_byte = self.encode(lower).or_else(|| self.encode(c))?;
                let upper_byte = self.encode(upper).unwrap_or(lower_byte);
                Some((lower_byte, upper_byte))
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn encode_str(table: &CharacterTable, text: &str) -> Vec<u8> {
        let mut out: Vec<u8> = text.chars().map(|c| table.encode(c).unwrap()).collect();
        out.push(TERMINATOR);
        out
    }

    #[test]
    fn test_english_letters() {
        let table = CharacterTable::english();
        assert_eq!(table.encode('A'), Some(0xBB));
        assert_eq!(table.encode('z'), Some(0xEE));
        assert_eq!(table.encode('0'), Some(0xA1));
        assert_eq!(table.encode(' '), Some(SPACE));
        assert_eq!(table.encode('~'), None);
    }

    #[test]
    fn test_decode() {
        let table = CharacterTable::english();
        let data = encode_str(&table, "Bulba saur");
        assert_eq!(table.decode(&data, 0, None).as_deref(), Some("Bulba saur"));
        assert_eq!(table.decode(&data, 0, Some(11)).as_deref(), Some("Bulba saur"));
        // terminator must fall inside the limit
        assert_eq!(table.decode(&data, 0, Some(10)), None);
    }

    #[test]
    fn test_decode_escape_and_unknown() {
        let table = CharacterTable::english();
        assert_eq!(
            table.decode(&[0xBB, ESCAPE, 0x07, TERMINATOR], 0, None).as_deref(),
            Some("A\\x07")
        );
        assert_eq!(table.decode(&[0xBB, 0x0A, TERMINATOR], 0, None), None);
        assert_eq!(table.decode(&[0xBB, 0xBC], 0, None), None);
    }

    #[test]
    fn test_parse() {
        let table = CharacterTable::parse("# test table\n0xBB='A'\n\n0x34='Lv'\n").unwrap();
        assert_eq!(table.glyph(0xBB), Some("A"));
        assert_eq!(table.glyph(0x34), Some("Lv"));
        assert_eq!(table.glyph(0xBC), None);

        let err = CharacterTable::parse("0xBB='A'\nBB='B'").unwrap_err();
        assert!(matches!(err, Error::CharmapParse { line: 2, .. }));
        assert!(CharacterTable::parse("0xZZ='A'").is_err());
        assert!(CharacterTable::parse("0xBB=A").is_err());
    }

    #[test]
    fn test_search_case_insensitive() {
        let table = CharacterTable::english();
        let mut data = vec![0u8; 8];
        data.extend(encode_str(&table, "PIKACHU"));
        data.extend(encode_str(&table, "pikachu"));

        assert_eq!(table.search(&data, "Pikachu"), vec![8, 16]);
        assert!(table.search(&data, "pika~").is_empty());
        assert!(table.search(&data, "").is_empty());
    }
}
