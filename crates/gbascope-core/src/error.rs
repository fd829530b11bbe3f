//! Error types for the gbascope-core library.
//!
//! Heuristic rejections are not errors: a candidate that fails a structural
//! check is dropped with a `trace!` and the scan moves on. The variants here
//! cover reading input, malformed compressed streams, out-of-range edits and the one
//! fatal contract violation, an overlapping run registration.

use std::path::PathBuf;
use thiserror::Error;

/// Result type alias for gbascope operations
pub type Result<T> = std::result::Result<T, Error>;

/// Error type for all gbascope operations
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum Error {
    /// Failed to read input file
    #[error("failed to read file '{path}': {source}")]
    FileRead {
        /// Path to the file that failed to read
        path: PathBuf,
        /// Underlying I/O error
        #[source]
        source: std::io::Error,
    },

    /// Malformed LZ77 stream
    #[error("invalid lz77 stream at offset {offset:#X}: {details}")]
    InvalidLz {
        /// Offset of the stream header
        offset: usize,
        /// What went wrong while walking the stream
        details: String,
    },

    /// Input too long for the 24-bit length field of the LZ77 header
    #[error("cannot compress {len} bytes: lz77 length field is 24 bits")]
    LzInputTooLarge {
        /// Length of the rejected input
        len: usize,
    },

    /// Access past the end of the byte buffer
    #[error("offset {offset:#X} is out of bounds for a buffer of {len:#X} bytes")]
    OutOfBounds {
        /// Requested offset
        offset: usize,
        /// Buffer length
        len: usize,
    },

    /// A run was registered over bytes already covered by a different run
    #[error("run at {start:#X} overlaps the run registered at {existing:#X}")]
    RunOverlap {
        /// Start of the rejected run
        start: usize,
        /// Start of the run already covering those bytes
        existing: usize,
    },

    /// Shape string contains a letter other than `p` or `w`
    #[error("invalid layout shape '{shape}': unexpected '{letter}'")]
    InvalidShape {
        /// The rejected shape string
        shape: String,
        /// Offending letter
        letter: char,
    },

    /// Malformed line in a character table file
    #[error("invalid character table entry on line {line}: {details}")]
    CharmapParse {
        /// 1-based line number
        line: usize,
        /// Description of the problem
        details: String,
    },

    /// The background load failed or was torn down
    #[error("load failed: {0}")]
    LoadFailed(String),

    /// Generic internal error
    #[error("internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Creates a new file read error
    pub fn file_read(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::FileRead {
            path: path.into(),
            source,
        }
    }

    /// Creates a new lz77 stream error
    pub fn invalid_lz(offset: usize, details: impl Into<String>) -> Self {
        Self::InvalidLz {
            offset,
            details: details.into(),
        }
    }

    /// Creates a new out-of-bounds error
    pub fn out_of_bounds(offset: usize, len: usize) -> Self {
        Self::OutOfBounds { offset, len }
    }

    /// Creates a new run overlap error
    pub fn run_overlap(start: usize, existing: usize) -> Self {
        Self::RunOverlap { start, existing }
    }

    /// Creates a new character table parse error
    pub fn charmap_parse(line: usize, details: impl Into<String>) -> Self {
        Self::CharmapParse {
            line,
            details: details.into(),
        }
    }

    /// Creates a new load failure
    pub fn load_failed(msg: impl Into<String>) -> Self {
        Self::LoadFailed(msg.into())
    }

    /// Creates a new internal error
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }

    /// Returns true if this is a recoverable error that should be skipped
    pub fn is_recoverable(&self) -> bool {
        matches!(self, Self::InvalidLz { .. } | Self::OutOfBounds { .. })
    }
}
