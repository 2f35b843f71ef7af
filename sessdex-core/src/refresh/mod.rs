//! Refresh orchestration
//!
//! [`Indexer`] drives discovery, parsing and reconciliation for all
//! configured sources. It is the only place where work runs concurrently:
//!
//! ```text
//!            discover (sources)
//!                  │
//!     ┌────────────┼────────────┐        one task per changed file,
//!     ▼            ▼            ▼        bounded by a semaphore,
//!   parse        parse        parse      deduplicated per observation
//!     └────────────┼────────────┘
//!                  ▼
//!        reconcile_groups (by canonical id)
//!                  ▼
//!          IndexStore::upsert  ◄──── background exhaustive passes
//! ```
//!
//! ## Policies
//!
//! | Policy | Parses | Writes |
//! |--------|--------|--------|
//! | [`RefreshPolicy::CacheOnly`] | nothing | nothing |
//! | [`RefreshPolicy::ForceReparse`] | every file, exhaustively | reconciled winners |
//! | [`RefreshPolicy::Hybrid`] | changed files, bounded | reconciled winners, then exhaustive results in the background |
//!
//! ## Cancellation
//!
//! Every pass carries a [`PassToken`]. [`Indexer::refresh`] cancels the
//! previous pass's token before starting. Tokens are checked immediately
//! before each store write, so a cancelled pass stops writing but everything
//! it already wrote stays (writes only ever move a row forward).
//!
//! Parsing and every store call run on the blocking pool; async tasks only
//! schedule and await them.

mod inflight;

pub use inflight::{InFlight, ScanKey, ScanMode, ScanResult};

use crate::config::{Config, SweepConfig};
use crate::error::{Error, Result};
use crate::index::{IndexStore, RetryPolicy};
use crate::ingest::{
    default_sources, BoundedParser, DiscoveredFile, ExhaustiveParser, ParseOutcome, SessionSource,
};
use crate::reconcile::{self, CanonicalSessionId, IdentityResolver};
use crate::types::{Fidelity, FileIdentity, FileStatus, SessionSummary, SourceFile};
use chrono::Utc;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::Semaphore;
use tokio::task::{JoinHandle, JoinSet};

/// How a refresh pass obtains summaries.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum RefreshPolicy {
    /// Return what the store holds
    CacheOnly,
    /// Exhaustively parse every discovered file
    ForceReparse,
    /// Bounded parse of changed files, exhaustive follow-up in the background
    #[default]
    Hybrid,
}

impl RefreshPolicy {
    pub fn as_str(&self) -> &'static str {
        match self {
            RefreshPolicy::CacheOnly => "cache-only",
            RefreshPolicy::ForceReparse => "force-reparse",
            RefreshPolicy::Hybrid => "hybrid",
        }
    }
}

impl std::fmt::Display for RefreshPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for RefreshPolicy {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "cache-only" => Ok(RefreshPolicy::CacheOnly),
            "force-reparse" => Ok(RefreshPolicy::ForceReparse),
            "hybrid" => Ok(RefreshPolicy::Hybrid),
            _ => Err(format!("unknown refresh policy: {}", s)),
        }
    }
}

/// Cancellation flag for one refresh pass and the background work it spawned.
#[derive(Debug, Clone, Default)]
pub struct PassToken(Arc<AtomicBool>);

impl PassToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Result of a refresh pass.
#[derive(Debug, Clone, Default)]
pub struct RefreshReport {
    pub policy: RefreshPolicy,
    /// Accepted summaries after the pass, most recently started first
    pub summaries: Vec<SessionSummary>,
    /// Files parsed by this pass
    pub files_parsed: usize,
    /// Files skipped because their identity had not changed
    pub files_unchanged: usize,
    /// Files that could not be read (path, error)
    pub failures: Vec<(PathBuf, String)>,
    /// Files with no essential metadata
    pub unindexable: Vec<PathBuf>,
    /// Background exhaustive passes scheduled
    pub scheduled: usize,
    /// The pass was cancelled before it finished writing
    pub cancelled: bool,
}

/// Result of a maintenance sweep.
#[derive(Debug, Clone, Default)]
pub struct SweepReport {
    /// Suspect rows found
    pub checked: usize,
    /// Session ids whose rows were re-derived
    pub repaired: Vec<String>,
    /// Session ids left unchanged (id, reason)
    pub kept: Vec<(String, String)>,
}

/// Accepted summaries from [`Indexer::ingest`].
#[derive(Debug, Clone, Default)]
pub struct Ingested {
    /// Accepted summary per canonical session id
    pub accepted: BTreeMap<String, SessionSummary>,
    /// The token was cancelled before every group was written
    pub cancelled: bool,
}

struct Shared {
    store: IndexStore,
    sources: Vec<Box<dyn SessionSource>>,
    resolver: Box<dyn IdentityResolver>,
    bounded: BoundedParser,
    exhaustive: ExhaustiveParser,
    sweep: SweepConfig,
    permits: Semaphore,
    inflight: InFlight,
    current: Mutex<PassToken>,
    background: Mutex<Vec<JoinHandle<()>>>,
}

/// Keeps the index fresh. Cheap to clone; clones share all state.
#[derive(Clone)]
pub struct Indexer {
    shared: Arc<Shared>,
}

impl Indexer {
    /// Open the store at the configured location with the built-in sources.
    pub fn open(config: &Config) -> Result<Self> {
        config.index.validate()?;
        let store = IndexStore::open(&Config::database_path(), retry_policy(config))?;
        Ok(Self::new(store, default_sources(&config.sources), config))
    }

    pub fn new(store: IndexStore, sources: Vec<Box<dyn SessionSource>>, config: &Config) -> Self {
        Self::with_resolver(store, sources, config, Box::new(CanonicalSessionId))
    }

    /// Construct with a custom session identity resolver.
    pub fn with_resolver(
        store: IndexStore,
        sources: Vec<Box<dyn SessionSource>>,
        config: &Config,
        resolver: Box<dyn IdentityResolver>,
    ) -> Self {
        Self {
            shared: Arc::new(Shared {
                store,
                sources,
                resolver,
                bounded: BoundedParser::from_config(&config.index),
                exhaustive: ExhaustiveParser::from_config(&config.index),
                sweep: config.sweep.clone(),
                permits: Semaphore::new(config.index.max_parallel_parses.max(1)),
                inflight: InFlight::new(),
                current: Mutex::new(PassToken::new()),
                background: Mutex::new(Vec::new()),
            }),
        }
    }

    pub fn store(&self) -> &IndexStore {
        &self.shared.store
    }

    pub fn sources(&self) -> &[Box<dyn SessionSource>] {
        &self.shared.sources
    }

    /// Accepted summary for a session.
    pub fn get(&self, session_id: &str) -> Result<Option<SessionSummary>> {
        self.shared.store.get(session_id)
    }

    /// Start a new pass: cancel the current token and install a fresh one.
    pub fn new_pass_token(&self) -> PassToken {
        let mut current = self
            .shared
            .current
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        current.cancel();
        *current = PassToken::new();
        current.clone()
    }

    /// Cancel the current pass and its background work.
    pub fn cancel(&self) {
        self.shared
            .current
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .cancel();
    }

    /// Run a pass that supersedes any pass still running.
    pub async fn refresh(&self, policy: RefreshPolicy) -> Result<RefreshReport> {
        let token = self.new_pass_token();
        self.refresh_with_token(policy, token).await
    }

    /// Run a pass under a caller-provided token.
    ///
    /// Passes with independent tokens do not cancel each other.
    pub async fn refresh_with_token(
        &self,
        policy: RefreshPolicy,
        token: PassToken,
    ) -> Result<RefreshReport> {
        let started = std::time::Instant::now();
        let mut report = RefreshReport {
            policy,
            ..RefreshReport::default()
        };

        match policy {
            RefreshPolicy::CacheOnly => {}
            RefreshPolicy::ForceReparse => {
                let files = self.blocking(|indexer| Ok(indexer.discover())).await?;
                self.parse_and_ingest(files, ScanMode::Exhaustive, &token, &mut report)
                    .await?;
            }
            RefreshPolicy::Hybrid => {
                let triage = self.blocking(|indexer| indexer.triage()).await?;
                report.files_unchanged = triage.unchanged;
                for file in triage.follow_ups {
                    self.schedule_exhaustive(file, token.clone());
                    report.scheduled += 1;
                }
                self.parse_and_ingest(triage.changed, ScanMode::Bounded, &token, &mut report)
                    .await?;
            }
        }

        report.cancelled = report.cancelled || token.is_cancelled();
        report.summaries = self.blocking(|indexer| indexer.shared.store.list()).await?;

        tracing::info!(
            policy = %policy,
            parsed = report.files_parsed,
            unchanged = report.files_unchanged,
            failed = report.failures.len(),
            unindexable = report.unindexable.len(),
            scheduled = report.scheduled,
            cancelled = report.cancelled,
            duration_ms = started.elapsed().as_millis() as u64,
            "Refresh pass complete"
        );
        Ok(report)
    }

    /// Reconcile `candidates` per canonical id and upsert the winners.
    ///
    /// Blocks on the store; async callers go through the blocking pool.
    pub fn ingest<I>(&self, candidates: I, token: &PassToken) -> Result<Ingested>
    where
        I: IntoIterator<Item = SessionSummary>,
    {
        let groups = reconcile::reconcile_groups(candidates, self.shared.resolver.as_ref());
        let mut ingested = Ingested::default();

        for (key, winner) in groups {
            if token.is_cancelled() {
                ingested.cancelled = true;
                break;
            }
            let accepted = self.shared.store.upsert(winner)?;
            ingested.accepted.insert(key, accepted);
        }
        Ok(ingested)
    }

    /// Wait for all background exhaustive passes scheduled so far.
    pub async fn settle(&self) -> Result<()> {
        loop {
            let handles: Vec<_> = {
                let mut background = self
                    .shared
                    .background
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner);
                background.drain(..).collect()
            };
            if handles.is_empty() {
                return Ok(());
            }
            for handle in handles {
                handle.await?;
            }
        }
    }

    /// Re-derive complete-labeled rows whose line coverage is implausible.
    ///
    /// A row whose file is unchanged is replaced outright; a row whose file
    /// has changed is upserted like any other candidate. Rows whose file can
    /// no longer be parsed are kept. Scans are shared with any exhaustive
    /// scan of the same observation already running.
    pub async fn sweep(&self) -> Result<SweepReport> {
        let max_avg_line_bytes = self.shared.sweep.max_avg_line_bytes;
        let suspects = self
            .blocking(move |indexer| indexer.shared.store.suspect_rows(max_avg_line_bytes))
            .await?;
        let mut report = SweepReport {
            checked: suspects.len(),
            ..SweepReport::default()
        };

        for row in suspects {
            let path = row.source_path.clone();
            let identity = match tokio::fs::metadata(&path).await {
                Ok(metadata) => FileIdentity::from_metadata(&metadata),
                Err(e) => {
                    tracing::warn!(
                        session_id = %row.session_id,
                        path = %path.display(),
                        error = %e,
                        "Could not re-derive suspect summary"
                    );
                    report.kept.push((row.session_id, e.to_string()));
                    continue;
                }
            };

            let key = ScanKey::new(&path, identity, ScanMode::Exhaustive);
            let (result, _) = self
                .shared
                .inflight
                .run(key, || run_parser(&self.shared, &path, ScanMode::Exhaustive))
                .await;

            match result {
                Ok(ParseOutcome::Parsed(fresh)) => {
                    let fresh = fresh.with_session_id(row.session_id.clone());
                    let recorded = row.file_identity;
                    self.blocking(move |indexer| {
                        if fresh.file_identity == recorded {
                            indexer.shared.store.replace(&fresh)
                        } else {
                            indexer.shared.store.upsert(fresh).map(|_| ())
                        }
                    })
                    .await?;
                    tracing::info!(session_id = %row.session_id, "Re-derived suspect summary");
                    report.repaired.push(row.session_id);
                }
                Ok(ParseOutcome::Unindexable { .. }) => {
                    report
                        .kept
                        .push((row.session_id, "no essential metadata".to_string()));
                }
                Err(message) => {
                    tracing::warn!(
                        session_id = %row.session_id,
                        path = %path.display(),
                        error = %message,
                        "Could not re-derive suspect summary"
                    );
                    report.kept.push((row.session_id, message));
                }
            }
        }

        Ok(report)
    }

    /// Run synchronous store work on the blocking pool.
    async fn blocking<T, F>(&self, work: F) -> Result<T>
    where
        F: FnOnce(&Indexer) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let indexer = self.clone();
        tokio::task::spawn_blocking(move || work(&indexer)).await?
    }

    fn discover(&self) -> Vec<DiscoveredFile> {
        let mut files = Vec::new();
        for source in &self.shared.sources {
            if !source.is_installed() {
                tracing::debug!(source = source.name(), "Source not installed, skipping");
                continue;
            }
            match source.discover_files() {
                Ok(found) => {
                    tracing::debug!(source = source.name(), count = found.len(), "Discovered files");
                    files.extend(found);
                }
                Err(e) => {
                    tracing::warn!(source = source.name(), error = %e, "Failed to discover files");
                }
            }
        }
        files
    }

    /// Split discovered files into those a hybrid pass must parse and those
    /// it can skip.
    fn triage(&self) -> Result<Triage> {
        let mut triage = Triage::default();
        for file in self.discover() {
            match self.freshness(&file)? {
                Freshness::Changed => triage.changed.push(file),
                Freshness::Unchanged => triage.unchanged += 1,
                Freshness::NeedsExhaustive => {
                    triage.unchanged += 1;
                    triage.follow_ups.push(file);
                }
            }
        }
        Ok(triage)
    }

    /// Compare a discovered file against its source-file row.
    ///
    /// Unchanged files whose accepted summary is still `Metadata` for this
    /// identity get their exhaustive pass (re)scheduled.
    fn freshness(&self, file: &DiscoveredFile) -> Result<Freshness> {
        let Some(previous) = self.shared.store.source_file(&file.path)? else {
            return Ok(Freshness::Changed);
        };
        if previous.identity != file.identity {
            return Ok(Freshness::Changed);
        }

        match previous.status {
            FileStatus::Failed => Ok(Freshness::Changed),
            FileStatus::Unindexable => Ok(Freshness::Unchanged),
            FileStatus::Indexed => {
                let Some(session_id) = previous.session_id.as_deref() else {
                    return Ok(Freshness::Unchanged);
                };
                match self.shared.store.get(session_id)? {
                    Some(accepted) if needs_exhaustive(&accepted, file) => {
                        Ok(Freshness::NeedsExhaustive)
                    }
                    _ => Ok(Freshness::Unchanged),
                }
            }
        }
    }

    async fn parse_and_ingest(
        &self,
        files: Vec<DiscoveredFile>,
        mode: ScanMode,
        token: &PassToken,
        report: &mut RefreshReport,
    ) -> Result<()> {
        let mut workers = JoinSet::new();
        for file in files {
            let shared = Arc::clone(&self.shared);
            workers.spawn(async move {
                let result = scan(&shared, &file, mode).await;
                (file, result)
            });
        }

        let mut scanned = Scanned::default();
        while let Some(joined) = workers.join_next().await {
            let (file, result) = match joined {
                Ok(done) => done,
                Err(e) => {
                    tracing::error!(error = %e, "Parse worker failed");
                    continue;
                }
            };
            report.files_parsed += 1;
            match result {
                Ok(ParseOutcome::Parsed(summary)) => scanned.parsed.push((file, summary)),
                Ok(ParseOutcome::Unindexable { identity, .. }) => {
                    scanned.unindexable.push((file, identity))
                }
                Err(message) => scanned.failed.push((file, message)),
            }
        }

        if token.is_cancelled() {
            report.cancelled = true;
            return Ok(());
        }

        let commit_token = token.clone();
        let committed = self
            .blocking(move |indexer| indexer.commit(scanned, mode, &commit_token))
            .await?;

        report.failures.extend(committed.failures);
        report.unindexable.extend(committed.unindexable);
        report.cancelled |= committed.cancelled;
        for file in committed.follow_ups {
            self.schedule_exhaustive(file, token.clone());
            report.scheduled += 1;
        }
        Ok(())
    }

    /// Write the results of one batch of scans.
    fn commit(&self, scanned: Scanned, mode: ScanMode, token: &PassToken) -> Result<Committed> {
        let mut committed = Committed::default();

        for (file, message) in scanned.failed {
            tracing::warn!(path = %file.path.display(), error = %message, "Failed to parse file");
            self.record(&file, file.identity, FileStatus::Failed, None, Some(message.clone()))?;
            committed.failures.push((file.path, message));
        }
        for (file, identity) in scanned.unindexable {
            tracing::info!(path = %file.path.display(), "File has no essential metadata");
            self.record(&file, identity, FileStatus::Unindexable, None, None)?;
            committed.unindexable.push(file.path);
        }

        let candidates = scanned.parsed.iter().map(|(_, summary)| summary.clone());
        let ingested = self.ingest(candidates, token)?;
        committed.cancelled = ingested.cancelled;

        for (file, summary) in &scanned.parsed {
            let key = self.shared.resolver.canonical_id(summary);
            let Some(accepted) = ingested.accepted.get(&key) else {
                continue;
            };
            if token.is_cancelled() {
                committed.cancelled = true;
                break;
            }
            self.record(
                file,
                summary.file_identity,
                FileStatus::Indexed,
                Some(key),
                None,
            )?;

            let follow_up = DiscoveredFile {
                identity: summary.file_identity,
                ..file.clone()
            };
            if mode == ScanMode::Bounded && needs_exhaustive(accepted, &follow_up) {
                committed.follow_ups.push(follow_up);
            }
        }
        Ok(committed)
    }

    fn record(
        &self,
        file: &DiscoveredFile,
        identity: FileIdentity,
        status: FileStatus,
        session_id: Option<String>,
        last_error: Option<String>,
    ) -> Result<()> {
        self.shared.store.record_source_file(&SourceFile {
            path: file.path.clone(),
            provider: file.provider.clone(),
            identity,
            status,
            session_id,
            last_error,
            checked_at: Utc::now(),
        })
    }

    fn schedule_exhaustive(&self, file: DiscoveredFile, token: PassToken) {
        let indexer = self.clone();
        let handle = tokio::spawn(async move {
            if let Err(e) = indexer.run_exhaustive(file.clone(), &token).await {
                tracing::warn!(path = %file.path.display(), error = %e, "Background parse failed");
            }
        });

        let mut background = self
            .shared
            .background
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        background.retain(|h| !h.is_finished());
        background.push(handle);
    }

    async fn run_exhaustive(&self, file: DiscoveredFile, token: &PassToken) -> Result<()> {
        let (result, ran) = {
            let shared = &self.shared;
            let key = ScanKey::new(&file.path, file.identity, ScanMode::Exhaustive);
            shared
                .inflight
                .run(key, || run_parser(shared, &file.path, ScanMode::Exhaustive))
                .await
        };

        let summary = match result {
            Ok(ParseOutcome::Parsed(summary)) => summary,
            Ok(ParseOutcome::Unindexable { .. }) => {
                tracing::debug!(path = %file.path.display(), "File changed under background parse");
                return Ok(());
            }
            Err(message) => {
                return Err(Error::Parse {
                    path: file.path.display().to_string(),
                    message,
                })
            }
        };

        if token.is_cancelled() {
            tracing::debug!(path = %file.path.display(), "Pass cancelled, dropping exhaustive result");
            return Ok(());
        }

        let accepted = self
            .blocking(move |indexer| {
                let key = indexer.shared.resolver.canonical_id(&summary);
                let identity = summary.file_identity;
                let accepted = indexer
                    .shared
                    .store
                    .upsert(summary.with_session_id(key.clone()))?;
                indexer.record(&file, identity, FileStatus::Indexed, Some(key), None)?;
                Ok(accepted)
            })
            .await?;

        tracing::debug!(
            session_id = %accepted.session_id,
            fidelity = %accepted.fidelity,
            shared_scan = !ran,
            "Background exhaustive pass complete"
        );
        Ok(())
    }
}

/// How a discovered file relates to what the last pass recorded for it.
enum Freshness {
    Changed,
    Unchanged,
    /// Unchanged, but its accepted summary is still metadata-only
    NeedsExhaustive,
}

#[derive(Default)]
struct Triage {
    changed: Vec<DiscoveredFile>,
    unchanged: usize,
    follow_ups: Vec<DiscoveredFile>,
}

/// Scan results of one pass, before anything is written.
#[derive(Default)]
struct Scanned {
    parsed: Vec<(DiscoveredFile, SessionSummary)>,
    unindexable: Vec<(DiscoveredFile, FileIdentity)>,
    failed: Vec<(DiscoveredFile, String)>,
}

#[derive(Default)]
struct Committed {
    failures: Vec<(PathBuf, String)>,
    unindexable: Vec<PathBuf>,
    follow_ups: Vec<DiscoveredFile>,
    cancelled: bool,
}

/// Whether `accepted` is a metadata-only summary of exactly this file observation.
fn needs_exhaustive(accepted: &SessionSummary, file: &DiscoveredFile) -> bool {
    accepted.fidelity == Fidelity::Metadata
        && accepted.file_identity == file.identity
        && accepted.source_path == file.path
}

fn retry_policy(config: &Config) -> RetryPolicy {
    RetryPolicy {
        attempts: config.index.store_retry_attempts,
        backoff: std::time::Duration::from_millis(config.index.store_retry_backoff_ms),
    }
}

/// Parse a file once per observation, sharing the result with concurrent requests.
async fn scan(shared: &Shared, file: &DiscoveredFile, mode: ScanMode) -> ScanResult {
    let key = ScanKey::new(&file.path, file.identity, mode);
    let (result, _) = shared
        .inflight
        .run(key, || run_parser(shared, &file.path, mode))
        .await;
    result
}

async fn run_parser(shared: &Shared, path: &Path, mode: ScanMode) -> ScanResult {
    let _permit = shared.permits.acquire().await.map_err(|e| e.to_string())?;

    let path = path.to_path_buf();
    let parsed = match mode {
        ScanMode::Bounded => {
            let parser = shared.bounded.clone();
            tokio::task::spawn_blocking(move || parser.parse_file(&path)).await
        }
        ScanMode::Exhaustive => {
            let parser = shared.exhaustive.clone();
            tokio::task::spawn_blocking(move || parser.parse_file(&path)).await
        }
    };

    match parsed {
        Ok(Ok(outcome)) => Ok(outcome),
        Ok(Err(e)) => Err(e.to_string()),
        Err(e) => Err(format!("parse task failed: {}", e)),
    }
}
