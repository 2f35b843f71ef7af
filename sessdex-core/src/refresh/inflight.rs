//! At-most-one scan per file observation
//!
//! A scan is keyed by path, file identity and scan mode. The first caller
//! for a key runs the scan; callers arriving while it runs await the same
//! cell and get a clone of its result. The map entry is removed by the
//! first caller to finish waiting, so a later request for the same key
//! starts a fresh scan. Waiters keep the cell alive through their own `Arc`.

use crate::ingest::ParseOutcome;
use crate::types::FileIdentity;
use std::collections::HashMap;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::OnceCell;

/// Shared result of one scan. Errors are rendered to strings so every
/// waiter can own a copy.
pub type ScanResult = std::result::Result<ParseOutcome, String>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ScanMode {
    Bounded,
    Exhaustive,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ScanKey {
    path: PathBuf,
    identity: FileIdentity,
    mode: ScanMode,
}

impl ScanKey {
    pub fn new(path: &Path, identity: FileIdentity, mode: ScanMode) -> Self {
        Self {
            path: path.to_path_buf(),
            identity,
            mode,
        }
    }
}

#[derive(Default)]
pub struct InFlight {
    cells: Mutex<HashMap<ScanKey, Arc<OnceCell<ScanResult>>>>,
}

impl InFlight {
    pub fn new() -> Self {
        Self::default()
    }

    /// Run `scan` unless a scan for `key` is already running, in which case
    /// wait for that one. Returns the result and whether this call ran it.
    pub async fn run<F, Fut>(&self, key: ScanKey, scan: F) -> (ScanResult, bool)
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = ScanResult>,
    {
        let cell = {
            let mut cells = self.cells.lock().unwrap_or_else(PoisonError::into_inner);
            Arc::clone(cells.entry(key.clone()).or_default())
        };

        let mut ran = false;
        let result = cell
            .get_or_init(|| {
                ran = true;
                scan()
            })
            .await
            .clone();

        let mut cells = self.cells.lock().unwrap_or_else(PoisonError::into_inner);
        if cells.get(&key).is_some_and(|current| Arc::ptr_eq(current, &cell)) {
            cells.remove(&key);
        }

        (result, ran)
    }

    pub fn len(&self) -> usize {
        self.cells.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Callers currently holding the cell for `key`.
    #[cfg(test)]
    pub(crate) fn waiters(&self, key: &ScanKey) -> usize {
        let cells = self.cells.lock().unwrap_or_else(PoisonError::into_inner);
        cells.get(key).map_or(0, |cell| Arc::strong_count(cell) - 1)
    }
}
