//! # sessdex-core
//!
//! Core library for sessdex - an index of agent session logs.
//!
//! This library provides:
//! - Domain types for log events and session summaries
//! - Bounded and exhaustive parsers over append-only JSONL logs
//! - Reconciliation of competing summaries into one accepted record
//! - An SQLite-backed index store whose writes never regress
//! - A refresh orchestrator with concurrent, cancellable passes
//!
//! ## Architecture
//!
//! Data flows through three stages:
//! - **Sources:** session logs on disk (append-only, never modified by sessdex)
//! - **Candidates:** summaries produced by a parse, tagged with their fidelity
//! - **Accepted:** one summary per session in the store, chosen by [`reconcile::choose`]
//!
//! ## Example
//!
//! ```rust,no_run
//! use sessdex_core::{Config, Indexer, RefreshPolicy};
//!
//! # async fn run() -> sessdex_core::Result<()> {
//! let config = Config::load()?;
//! let indexer = Indexer::open(&config)?;
//!
//! let report = indexer.refresh(RefreshPolicy::Hybrid).await?;
//! println!("{} sessions", report.summaries.len());
//!
//! // Wait for the exhaustive follow-up passes
//! indexer.settle().await?;
//! # Ok(())
//! # }
//! ```

// Re-export commonly used items at the crate root
pub use config::Config;
pub use db::Database;
pub use error::{Error, Result};
pub use index::IndexStore;
pub use refresh::{Indexer, PassToken, RefreshPolicy, RefreshReport, SweepReport};
pub use types::*;

// Public modules
pub mod config;
pub mod db;
pub mod error;
pub mod index;
pub mod ingest;
pub mod logging;
pub mod reconcile;
pub mod refresh;
pub mod types;
