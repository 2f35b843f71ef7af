//! Ingestion layer: from raw session logs to candidate summaries
//!
//! ## Architecture
//!
//! ```text
//! ┌────────────────┐     ┌───────────┐     ┌────────────────┐     ┌────────────────┐
//! │ SessionSource  │ ──► │ LogReader │ ──► │ SummaryBuilder │ ──► │ SessionSummary │
//! │ (discovery)    │     │ (decode)  │     │ (accumulate)   │     │  (candidate)   │
//! └────────────────┘     └───────────┘     └────────────────┘     └────────────────┘
//!                              ▲
//!                   BoundedParser / ExhaustiveParser
//!                   (when to stop, which fidelity)
//! ```
//!
//! Candidates produced here are never written directly; they go through
//! [`crate::index::IndexStore::upsert`].

mod builder;
mod dialects;
mod parser;
mod reader;
pub mod sources;

pub use builder::{ScanStats, SummaryBuilder};
pub use dialects::decode_line;
pub use parser::{BoundedParser, ExhaustiveParser, ParseOutcome};
pub use reader::LogReader;
pub use sources::{default_sources, DiscoveredFile, GlobSource, SessionSource};
