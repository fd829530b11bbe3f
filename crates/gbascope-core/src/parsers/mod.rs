//! Run parsers and the profile that picks them.
//!
//! A load runs an ordered list of [`RunParser`]s against the same storage
//! and mapper. Order matters: fixed structures go first, compressed assets
//! next, then schema tables, strings, and finally the pointer sweep.
//!
//! ## Extensibility
//!
//! ```
//! use gbascope_core::parsers::{LoadContext, RunParser};
//! use gbascope_core::Result;
//!
//! struct NoPointersIntoRam;
//!
//! impl RunParser for NoPointersIntoRam {
//!     fn name(&self) -> &'static str {
//!         "no-pointers-into-ram"
//!     }
//!
//!     fn load(&self, ctx: &mut LoadContext<'_>) -> Result<()> {
//!         ctx.mapper.filter_pointers(|destination| destination < 0x0100_0000);
//!         Ok(())
//!     }
//! }
//! ```

mod header;
mod lz;
mod pointers;
mod strings;
mod titles;

pub use header::{game_code, Header, GAME_CODE_OFFSET, HEADER_LEN};
pub use lz::LzAssets;
pub use pointers::Reconcile;
pub use strings::StringTable;
pub use titles::{Title, TitleSchemas};

use crate::config::EngineConfig;
use crate::error::Result;
use crate::mapper::{ClaimConflict, PointerMapper};
use crate::run::RunStorage;
use std::fmt;

/// Everything a parser may touch during one step
pub struct LoadContext<'a> {
    /// The bytes, read-locked for the step
    pub data: &'a [u8],
    /// The run registry
    pub storage: &'a RunStorage,
    /// Open pointer candidates
    pub mapper: &'a mut PointerMapper,
    /// Load configuration
    pub config: &'a EngineConfig,
    /// Conflicts collected for the load report
    pub conflicts: &'a mut Vec<ClaimConflict>,
}

/// One stage of the load pipeline
pub trait RunParser: Send + Sync {
    /// Short name for logs and reports
    fn name(&self) -> &'static str;

    /// Registers runs and claims pointers
    fn load(&self, ctx: &mut LoadContext<'_>) -> Result<()>;

    /// Locations matching `term`, in this parser's own terms
    fn find(&self, _data: &[u8], _term: &str) -> Vec<usize> {
        Vec::new()
    }

    /// Display label for `location`
    fn label(&self, _location: usize) -> Option<String> {
        None
    }

    /// Named jump targets discovered during load
    fn shortcuts(&self) -> Vec<(String, usize)> {
        Vec::new()
    }
}

/// Which parser set a buffer gets
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Profile {
    /// Not a cartridge image: nothing is inferred
    Raw,
    /// A cartridge without a built-in title profile
    Gba,
    /// A cartridge with built-in schema tables
    Title(Title),
}

impl fmt::Display for Profile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Raw => f.write_str("raw"),
            Self::Gba => f.write_str("gba"),
            Self::Title(title) => write!(f, "gba/{title}"),
        }
    }
}

impl Profile {
    /// Picks a profile from the file name hint and the header game code.
    ///
    /// A hint that does not end in `.gba` selects [`Profile::Raw`]; no hint
    /// is treated as a cartridge.
    pub fn select(name_hint: Option<&str>, data: &[u8]) -> Self {
        if let Some(hint) = name_hint {
            if !hint.to_ascii_lowercase().ends_with(".gba") {
                return Self::Raw;
            }
        }
        match game_code(data).as_deref().and_then(Title::from_game_code) {
            Some(title) => Self::Title(title),
            None => Self::Gba,
        }
    }

    /// Parsers in load order
    pub fn parsers(&self, config: &EngineConfig) -> Vec<Box<dyn RunParser>> {
        match *self {
            Self::Raw => Vec::new(),
            Self::Gba => vec![Box::new(Header), Box::new(LzAssets), Box::new(Reconcile)],
            Self::Title(title) => vec![
                Box::new(Header),
                Box::new(LzAssets),
                Box::new(TitleSchemas::new(title)),
                Box::new(StringTable::new(config)),
                Box::new(Reconcile),
            ],
        }
    }
}
