//! Index store: the only write path for summaries
//!
//! [`IndexStore::upsert`] is not a blind overwrite. It reads the existing
//! row, asks [`reconcile::merge`] for the winner and writes only if the
//! winner differs from what is stored. The read and the write share one
//! immediate transaction, so other connections to the same file (another
//! `sessdex` process) cannot interleave. Within a process, calls for the
//! same session are also serialized by a per-session lock.

use crate::db::Database;
use crate::error::Result;
use crate::reconcile;
use crate::types::{SessionSummary, SourceFile};
use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

/// Retry policy for transient store contention.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub attempts: u32,
    pub backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempts: 3,
            backoff: Duration::from_millis(25),
        }
    }
}

/// Persistent store of accepted summaries keyed by session id.
pub struct IndexStore {
    db: Database,
    retry: RetryPolicy,
    locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl IndexStore {
    pub fn new(db: Database) -> Self {
        Self::with_retry(db, RetryPolicy::default())
    }

    pub fn with_retry(db: Database, retry: RetryPolicy) -> Self {
        Self {
            db,
            retry,
            locks: Mutex::new(HashMap::new()),
        }
    }

    /// Open (and migrate) the store at `path`.
    pub fn open(path: &Path, retry: RetryPolicy) -> Result<Self> {
        let db = Database::open(path)?;
        db.migrate()?;
        Ok(Self::with_retry(db, retry))
    }

    /// In-memory store (for testing)
    pub fn open_in_memory() -> Result<Self> {
        let db = Database::open_in_memory()?;
        db.migrate()?;
        Ok(Self::new(db))
    }

    /// The accepted summary for a session.
    pub fn get(&self, session_id: &str) -> Result<Option<SessionSummary>> {
        self.with_retry_on_busy(|| self.db.get_summary(session_id))
    }

    /// All accepted summaries, most recently started first.
    pub fn list(&self) -> Result<Vec<SessionSummary>> {
        self.with_retry_on_busy(|| self.db.list_summaries())
    }

    /// Propose a candidate. Returns the summary that is accepted afterwards.
    ///
    /// A candidate that loses to the stored summary is dropped without
    /// error; compare the returned value to the candidate to tell the two
    /// outcomes apart.
    pub fn upsert(&self, candidate: SessionSummary) -> Result<SessionSummary> {
        let key_lock = self.key_lock(&candidate.session_id);
        let result = {
            let _guard = key_lock.lock().unwrap_or_else(PoisonError::into_inner);
            self.with_retry_on_busy(|| self.merge_and_write(&candidate))
        };
        self.release_key_lock(&candidate.session_id, key_lock);
        result
    }

    /// Unconditionally replace the row for `summary.session_id`.
    ///
    /// Only for maintenance: a row that has been shown to be wrong for its
    /// own file identity cannot be corrected through `upsert`.
    pub fn replace(&self, summary: &SessionSummary) -> Result<()> {
        let key_lock = self.key_lock(&summary.session_id);
        let result = {
            let _guard = key_lock.lock().unwrap_or_else(PoisonError::into_inner);
            self.with_retry_on_busy(|| self.db.write_summary(summary))
        };
        self.release_key_lock(&summary.session_id, key_lock);
        result
    }

    /// Complete-labeled rows whose line coverage is implausible.
    pub fn suspect_rows(&self, max_avg_line_bytes: u64) -> Result<Vec<SessionSummary>> {
        self.with_retry_on_busy(|| self.db.suspect_summaries(max_avg_line_bytes))
    }

    pub fn source_file(&self, path: &Path) -> Result<Option<SourceFile>> {
        self.with_retry_on_busy(|| self.db.get_source_file(path))
    }

    pub fn record_source_file(&self, file: &SourceFile) -> Result<()> {
        self.with_retry_on_busy(|| self.db.upsert_source_file(file))
    }

    pub fn source_files(&self) -> Result<Vec<SourceFile>> {
        self.with_retry_on_busy(|| self.db.list_source_files())
    }

    fn merge_and_write(&self, candidate: &SessionSummary) -> Result<SessionSummary> {
        let mut rule = None;
        let (existing, written) = self.db.write_summary_if(candidate, |existing| {
            let (ordering, decided_by) = reconcile::compare(existing, candidate);
            rule = Some(decided_by);
            ordering.is_lt()
        })?;

        let Some(existing) = existing else {
            tracing::debug!(
                session_id = %candidate.session_id,
                fidelity = %candidate.fidelity,
                "Inserted summary"
            );
            return Ok(candidate.clone());
        };

        let rule = rule.map(|r| r.as_str()).unwrap_or_default();
        if written {
            tracing::debug!(
                session_id = %candidate.session_id,
                from = %existing.fidelity,
                to = %candidate.fidelity,
                rule = %rule,
                "Accepted candidate"
            );
            Ok(candidate.clone())
        } else {
            tracing::debug!(
                session_id = %candidate.session_id,
                kept = %existing.fidelity,
                rejected = %candidate.fidelity,
                rule = %rule,
                "Kept existing summary"
            );
            Ok(existing)
        }
    }

    fn with_retry_on_busy<T>(&self, mut op: impl FnMut() -> Result<T>) -> Result<T> {
        let mut attempt = 0;
        loop {
            match op() {
                Err(e) if e.is_busy() && attempt < self.retry.attempts => {
                    attempt += 1;
                    tracing::warn!(attempt, error = %e, "Store busy, retrying");
                    std::thread::sleep(self.retry.backoff * attempt);
                }
                result => return result,
            }
        }
    }

    fn key_lock(&self, key: &str) -> Arc<Mutex<()>> {
        let mut locks = self.locks.lock().unwrap_or_else(PoisonError::into_inner);
        locks
            .entry(key.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// Drop the map entry once no other caller holds it.
    fn release_key_lock(&self, key: &str, key_lock: Arc<Mutex<()>>) {
        let mut locks = self.locks.lock().unwrap_or_else(PoisonError::into_inner);
        // One reference in the map, one here
        if Arc::strong_count(&key_lock) == 2 {
            locks.remove(key);
        }
        // Counts only change under the map lock
        drop(key_lock);
        drop(locks);
    }

    #[cfg(test)]
    fn lock_entries(&self) -> usize {
        self.locks.lock().unwrap().len()
    }
}
