//! # gbascope-core
//!
//! Structure inference for Game Boy Advance cartridge images.
//!
//! This crate provides the core functionality for:
//! - Finding pointer words and tracking which of them are confirmed
//! - Decoding and measuring LZ77 (type 0x10) compressed assets
//! - Matching record layouts against pointer destinations
//! - Registering typed runs and answering coverage queries while loading
//!
//! ## Architecture
//!
//! - [`run`]: Run descriptions and the ordered run registry
//! - [`mapper`]: Pointer candidates, claims and back-links
//! - [`lz77`]: The compression codec
//! - [`layout`]: Schemas, shapes and the layout matcher
//! - [`parsers`]: Load pipeline stages and profile selection
//! - [`session`]: The buffer, its background load and all queries
//! - [`error`]: Error types and handling
//!
//! ## Example
//!
//! ```no_run
//! use gbascope_core::{EngineConfig, Session};
//!
//! let session = Session::open("./firered.gba", EngineConfig::default())?;
//! session.load()?;
//!
//! // queries work while the load runs
//! let early = session.query_range(0, 0x100);
//!
//! let report = session.wait()?;
//! println!("{} runs, {} conflicts", report.runs, report.conflicts.len());
//! println!("{:?}", session.shortcut("pokename"));
//! # let _ = early;
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```
//!
//! ## Extensibility
//!
//! - [`RunParser`]: Add a pipeline stage
//! - [`TieBreak`]: Choose among competing array candidates

#![deny(unsafe_code)]
#![warn(missing_docs, rust_2018_idioms, unreachable_pub)]

pub mod buffer;
pub mod config;
pub mod error;
pub mod layout;
pub mod lz77;
pub mod mapper;
pub mod media;
pub mod parsers;
pub mod run;
pub mod session;
pub mod text;

// Re-export primary types for convenience
pub use buffer::ByteBuffer;
pub use config::EngineConfig;
pub use error::{Error, Result};
pub use layout::{LayoutMatcher, Record, Schema, Shape, TieBreak};
pub use mapper::{ClaimConflict, PointerMapper};
pub use parsers::{Profile, RunParser, Title};
pub use run::{Artifact, Coverage, Run, RunKind, RunStorage};
pub use session::{LoadReport, Session};
pub use text::CharacterTable;

/// Crate version for programmatic access
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
