//! Engine configuration.

use crate::buffer::DEFAULT_BANK_TAG;
use crate::layout::{DEFAULT_MAX_DEPTH, DEFAULT_MIN_ARRAY_LEN};
use crate::run::DecodeContext;
use crate::text::CharacterTable;
use std::sync::Arc;

/// Knobs for one load
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Top byte that marks a pointer word
    pub bank_tag: u8,
    /// Smallest element count for variable-length arrays
    pub min_array_len: usize,
    /// Offset where the string scan starts
    pub string_scan_start: usize,
    /// Shortest string the string scan registers, terminator excluded
    pub min_string_len: usize,
    /// How deep nested record pointers are followed
    pub max_schema_depth: usize,
    /// Character table for in-game text
    pub charmap: Arc<CharacterTable>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            bank_tag: DEFAULT_BANK_TAG,
            min_array_len: DEFAULT_MIN_ARRAY_LEN,
            string_scan_start: 0x200,
            min_string_len: 3,
            max_schema_depth: DEFAULT_MAX_DEPTH,
            charmap: Arc::new(CharacterTable::english()),
        }
    }
}

impl EngineConfig {
    /// Creates a config with default values
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the pointer bank tag
    pub fn bank_tag(mut self, tag: u8) -> Self {
        self.bank_tag = tag;
        self
    }

    /// Sets the minimum variable array length
    pub fn min_array_len(mut self, len: usize) -> Self {
        self.min_array_len = len;
        self
    }

    /// Sets where the string scan starts
    pub fn string_scan_start(mut self, offset: usize) -> Self {
        self.string_scan_start = offset;
        self
    }

    /// Sets the shortest registered string
    pub fn min_string_len(mut self, len: usize) -> Self {
        self.min_string_len = len;
        self
    }

    /// Sets the record nesting limit
    pub fn max_schema_depth(mut self, depth: usize) -> Self {
        self.max_schema_depth = depth;
        self
    }

    /// Replaces the character table
    pub fn charmap(mut self, charmap: CharacterTable) -> Self {
        self.charmap = Arc::new(charmap);
        self
    }

    /// Decoder context borrowing this config
    pub fn decode_context(&self) -> DecodeContext<'_> {
        DecodeContext {
            charmap: &self.charmap,
            bank_tag: self.bank_tag,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_engine_config_builder() {
        let config = EngineConfig::new()
            .bank_tag(0x09)
            .min_array_len(4)
            .string_scan_start(0x400)
            .min_string_len(5)
            .max_schema_depth(2);

        assert_eq!(config.bank_tag, 0x09);
        assert_eq!(config.min_array_len, 4);
        assert_eq!(config.string_scan_start, 0x400);
        assert_eq!(config.min_string_len, 5);
        assert_eq!(config.max_schema_depth, 2);
        assert_eq!(config.decode_context().bank_tag, 0x09);
    }

    #[test]
    fn test_defaults() {
        let config = EngineConfig::default();
        assert_eq!(config.bank_tag, 0x08);
        assert_eq!(config.min_array_len, 10);
        assert_eq!(config.charmap.encode('A'), Some(0xBB));
    }
}
