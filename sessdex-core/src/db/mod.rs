//! Database layer for sessdex
//!
//! This module provides the storage layer using SQLite with:
//! - Schema migrations
//! - Row mapping for summaries and source file bookkeeping
//!
//! The [`Database`] performs plain reads and writes. The accept/reject
//! decision for summaries lives one layer up in [`crate::index::IndexStore`].

pub mod repo;
pub mod schema;

pub use repo::Database;
