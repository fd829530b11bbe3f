use super::{LoadContext, RunParser};
use crate::config::EngineConfig;
use crate::error::Result;
use crate::run::Run;
use crate::text::{CharacterTable, ESCAPE, SPACE, TERMINATOR};
use std::sync::Arc;
use tracing::debug;

/// Largest step taken while skipping non-text bytes
const MAX_SKIP: usize = 0x10;

/// Registers terminated strings found by scanning the buffer
#[derive(Debug, Clone)]
pub struct StringTable {
    charmap: Arc<CharacterTable>,
    start: usize,
    min_len: usize,
    run: Arc<Run>,
}

impl StringTable {
    /// Uses the character table and scan limits of `config`
    pub fn new(config: &EngineConfig) -> Self {
        Self {
            charmap: Arc::clone(&config.charmap),
            start: config.string_scan_start,
            min_len: config.min_string_len,
            run: Arc::new(Run::text()),
        }
    }

    /// Skips ahead in growing steps while bytes are not glyphs.
    ///
    /// On a hit, walks back over the text the last step jumped past, then
    /// forward over leading spaces.
    fn skip_binary(&self, data: &[u8], mut at: usize) -> usize {
        let mut missed = at;
        let mut step = 0;
        while at < data.len() && !self.charmap.is_glyph(data[at]) {
            missed = at;
            step = (step + 1).min(MAX_SKIP);
            at += step;
        }
        if step == 0 || at >= data.len() {
            return at;
        }

        let mut start = at;
        while start > missed + 1 && self.is_text_byte(data[start - 1]) {
            start -= 1;
        }
        while data[start] == SPACE {
            start += 1;
        }
        start
    }

    fn is_text_byte(&self, byte: u8) -> bool {
        byte == SPACE || self.charmap.is_glyph(byte)
    }

    /// Length of the text starting at `at` if it ends in a terminator
    fn measure_text(&self, data: &[u8], at: usize) -> (usize, Option<usize>) {
        let mut len = 0;
        while let Some(&byte) = data.get(at + len) {
            if self.charmap.is_glyph(byte) || (byte == SPACE && len > 0) {
                len += 1;
            } else if byte == ESCAPE {
                len += 2;
            } else if byte == TERMINATOR && len >= self.min_len {
                return (len, Some(len));
            } else {
                break;
            }
        }
        (len, None)
    }
}

fn is_monotone(bytes: &[u8]) -> bool {
    bytes.windows(2).all(|pair| pair[0] == pair[1])
}

impl RunParser for StringTable {
    fn name(&self) -> &'static str {
        "strings"
    }

    fn load(&self, ctx: &mut LoadContext<'_>) -> Result<()> {
        let data = ctx.data;
        let mut at = self.start;
        let mut found = 0;

        while at < data.len() {
            at = self.skip_binary(data, at);
            let (scanned, text) = self.measure_text(data, at);
            if let Some(len) = text {
                if !is_monotone(&data[at..at + len])
                    && ctx.storage.is_range_free(data, at, len + 1)
                {
                    ctx.storage.add_run(data, at, Arc::clone(&self.run))?;
                    found += 1;
                }
            }
            at += scanned + 1;
        }

        debug!("Registered {} strings", found);
        Ok(())
    }

    fn find(&self, data: &[u8], term: &str) -> Vec<usize> {
        self.charmap.search(data, term)
    }
}
