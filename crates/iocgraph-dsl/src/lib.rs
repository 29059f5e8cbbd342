//! EPICS IOC configuration grammars and the shared record model.
//!
//! This crate defines the canonical text formats iocgraph understands natively
//! and provides parsers + typed models for each:
//!
//! - `db`: record databases (`.db`) and database definitions (`.dbd`), in the
//!   two supported grammar versions
//! - `substitution`: template substitution files (`.substitutions`)
//! - `macros`: the `$(NAME)` / `${NAME}` macro engine used by both of the
//!   above and by startup scripts
//!
//! Everything a parser produces carries a [`context::LoadContext`] so that
//! downstream diagnostics can always point at an exact file and line, even
//! across nested includes and template expansions.

pub mod context;
pub mod db;
pub mod digest;
pub mod format;
pub mod macros;
pub mod model;
pub mod substitution;

pub use context::{FullLoadContext, LoadContext};
pub use macros::{MacroContext, UndefinedMacroPolicy};
pub use model::{
    Database, LintMessage, LintResult, PVAFieldReference, RecordField, RecordInstance, RecordType,
};
