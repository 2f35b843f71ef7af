//! Integration tests for the parse → reconcile → store pipeline
//!
//! Fixture files live in `tests/fixtures/{codex,claude-code}/`. Larger logs
//! are generated on the fly into temp directories.

use chrono::{DateTime, Duration, TimeZone, Utc};
use sessdex_core::config::Config;
use sessdex_core::ingest::{
    BoundedParser, DiscoveredFile, ExhaustiveParser, GlobSource, ParseOutcome, SessionSource,
};
use sessdex_core::reconcile;
use sessdex_core::{
    FileIdentity, FileStatus, Fidelity, IndexStore, Indexer, PassToken, RefreshPolicy,
    SessionSummary,
};
use serde_json::json;
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tempfile::TempDir;

const CODEX_SESSION_ID: &str = "019ab86e-1e83-75b0-b2d7-d335492e7026";

fn fixture_path(provider: &str, name: &str) -> PathBuf {
    PathBuf::from(env!("CARGO_MANIFEST_DIR"))
        .join("tests/fixtures")
        .join(provider)
        .join(name)
}

fn ts(iso: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(iso).unwrap().with_timezone(&Utc)
}

fn parsed(outcome: ParseOutcome) -> SessionSummary {
    outcome.into_summary().expect("expected a summary")
}

// ============================================
// Generated codex logs
// ============================================

/// Builds codex rollout logs line by line.
struct CodexLog {
    lines: Vec<String>,
    clock: DateTime<Utc>,
}

impl CodexLog {
    fn new() -> Self {
        Self {
            lines: Vec::new(),
            clock: Utc.with_ymd_and_hms(2025, 11, 25, 9, 0, 0).unwrap(),
        }
    }

    fn tick(&mut self) -> String {
        self.clock += Duration::seconds(2);
        self.clock.to_rfc3339()
    }

    fn session_meta(mut self, id: &str, cwd: Option<&str>) -> Self {
        let now = self.tick();
        let mut payload = json!({ "id": id, "timestamp": now });
        if let Some(cwd) = cwd {
            payload["cwd"] = json!(cwd);
        }
        self.lines.push(
            json!({ "timestamp": now, "type": "session_meta", "payload": payload }).to_string(),
        );
        self
    }

    fn turn_context(mut self, cwd: &str) -> Self {
        let now = self.tick();
        self.lines.push(
            json!({
                "timestamp": now,
                "type": "turn_context",
                "payload": { "cwd": cwd, "model": "gpt-5-codex" }
            })
            .to_string(),
        );
        self
    }

    fn tool_calls(mut self, n: usize) -> Self {
        for i in 0..n {
            let now = self.tick();
            self.lines.push(
                json!({
                    "timestamp": now,
                    "type": "response_item",
                    "payload": { "type": "function_call", "name": "shell", "call_id": format!("call_{}", i) }
                })
                .to_string(),
            );
        }
        self
    }

    fn messages(mut self, n: usize) -> Self {
        for i in 0..n {
            let now = self.tick();
            let role = if i % 2 == 0 { "user" } else { "assistant" };
            self.lines.push(
                json!({
                    "timestamp": now,
                    "type": "response_item",
                    "payload": {
                        "type": "message",
                        "role": role,
                        "content": [{ "type": "input_text", "text": format!("message {}", i) }]
                    }
                })
                .to_string(),
            );
        }
        self
    }

    fn write(&self, path: &Path) {
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        let mut text = self.lines.join("\n");
        text.push('\n');
        fs::write(path, text).unwrap();
    }
}

fn append_user_message(path: &Path, text: &str) {
    let mut file = OpenOptions::new().append(true).open(path).unwrap();
    let line = json!({
        "timestamp": "2025-11-25T12:00:00Z",
        "type": "response_item",
        "payload": { "type": "message", "role": "user", "content": [{ "type": "input_text", "text": text }] }
    });
    writeln!(file, "{}", line).unwrap();
}

/// Codex home under a temp dir, with a path for one rollout file.
struct CodexHome {
    _tmp: TempDir,
    root: PathBuf,
    db_path: PathBuf,
}

impl CodexHome {
    fn new() -> Self {
        sessdex_core::logging::init_test();
        let tmp = TempDir::new().unwrap();
        let root = tmp.path().join("codex");
        let db_path = tmp.path().join("index.db");
        Self {
            _tmp: tmp,
            root,
            db_path,
        }
    }

    fn rollout(&self, name: &str) -> PathBuf {
        self.root
            .join("sessions/2025/11/25")
            .join(format!("rollout-{}.jsonl", name))
    }

    fn indexer(&self, config: &Config) -> Indexer {
        let store = IndexStore::open(&self.db_path, Default::default()).unwrap();
        Indexer::new(
            store,
            vec![Box::new(GlobSource::codex(Some(self.root.clone())))],
            config,
        )
    }
}

fn config(enrich: bool) -> Config {
    let mut config = Config::default();
    config.index.enable_enriched_fidelity = enrich;
    config.index.max_parallel_parses = 4;
    config
}

// ============================================
// Fixture parsing
// ============================================

#[test]
fn test_codex_fixture_exhaustive() {
    let path = fixture_path("codex", "minimal-session.jsonl");
    let summary = parsed(ExhaustiveParser::new().parse_file(&path).unwrap());

    assert_eq!(summary.session_id, CODEX_SESSION_ID);
    assert_eq!(summary.fidelity, Fidelity::Full);
    assert_eq!(summary.lines_scanned, 10);
    assert_eq!(summary.malformed_lines, 0);
    assert_eq!(summary.counts.user_messages, 2);
    assert_eq!(summary.counts.assistant_messages, 1);
    // The call and its output record
    assert_eq!(summary.counts.tool_invocations, 2);
    assert_eq!(summary.counts.thinking, 1);
    assert_eq!(summary.started_at, Some(ts("2025-11-25T00:33:35Z")));
    assert_eq!(summary.working_directory.as_deref(), Some("/home/dev/project"));
    assert_eq!(
        summary.title.as_deref(),
        Some("Fix the failing build in the parser crate")
    );
    assert_eq!(summary.model.as_deref(), Some("gpt-5-codex"));
    assert_eq!(summary.last_activity_at, Some(ts("2025-11-25T00:34:30Z")));
    assert_eq!(summary.source_path, path);
}

#[test]
fn test_codex_fixture_enriched() {
    let path = fixture_path("codex", "minimal-session.jsonl");
    let summary = parsed(
        ExhaustiveParser::enriched(Duration::minutes(15))
            .parse_file(&path)
            .unwrap(),
    );
    assert_eq!(summary.fidelity, Fidelity::Enriched);
    assert_eq!(summary.active_duration_secs, Some(54));
}

#[test]
fn test_codex_fixture_bounded() {
    let path = fixture_path("codex", "minimal-session.jsonl");
    let summary = parsed(BoundedParser::new(64).parse_file(&path).unwrap());

    assert_eq!(summary.fidelity, Fidelity::Metadata);
    assert_eq!(summary.lines_scanned, 1);
    assert_eq!(summary.counts.total(), 0);
    assert_eq!(summary.session_id, CODEX_SESSION_ID);
}

#[test]
fn test_claude_code_fixture() {
    let path = fixture_path("claude-code", "minimal-session.jsonl");

    let full = parsed(ExhaustiveParser::new().parse_file(&path).unwrap());
    assert_eq!(full.session_id, "test-session-001");
    assert_eq!(full.lines_scanned, 6);
    assert_eq!(full.counts.user_messages, 2);
    assert_eq!(full.counts.assistant_messages, 2);
    assert_eq!(full.counts.tool_invocations, 1);
    assert_eq!(full.counts.thinking, 1);
    assert_eq!(full.started_at, Some(ts("2025-11-25T10:00:00Z")));
    assert_eq!(full.working_directory.as_deref(), Some("/home/dev/app"));
    assert_eq!(
        full.title.as_deref(),
        Some("Hello, can you list the files in this directory?")
    );
    assert_eq!(full.model.as_deref(), Some("claude-sonnet-4-5-20250929"));

    let bounded = parsed(BoundedParser::new(64).parse_file(&path).unwrap());
    assert_eq!(bounded.fidelity, Fidelity::Metadata);
    assert_eq!(bounded.lines_scanned, 2);
    assert_eq!(bounded.counts.user_messages, 1);
    assert!(full.counts.user_messages >= bounded.counts.user_messages);
    assert!(full.counts.total() >= bounded.counts.total());
}

// ============================================
// Parser scenarios
// ============================================

#[test]
fn test_bounded_fallback_reports_true_length() {
    let home = CodexHome::new();
    let path = home.rollout("late-metadata");
    CodexLog::new()
        .tool_calls(70)
        .session_meta("late", Some("/work"))
        .messages(4)
        .write(&path);

    let summary = parsed(BoundedParser::new(64).parse_file(&path).unwrap());
    assert_eq!(summary.fidelity, Fidelity::Full);
    assert_eq!(summary.lines_scanned, 75);
    assert_eq!(summary.counts.tool_invocations, 70);
    assert_eq!(summary.counts.messages(), 4);
}

/// A log whose working directory is only declared after 74 tool calls.
fn write_late_cwd_log(path: &Path) {
    CodexLog::new()
        .session_meta("sess-190", None)
        .tool_calls(74)
        .turn_context("/work")
        .messages(41)
        .tool_calls(116)
        .write(path);
}

#[test]
fn test_prefix_and_full_scan_reconcile_to_full() {
    let home = CodexHome::new();
    let path = home.rollout("late-cwd");
    write_late_cwd_log(&path);

    let bounded = parsed(BoundedParser::new(100).parse_file(&path).unwrap());
    assert_eq!(bounded.fidelity, Fidelity::Metadata);
    assert_eq!(bounded.lines_scanned, 76);
    assert_eq!(bounded.counts.tool_invocations, 74);

    let full = parsed(ExhaustiveParser::new().parse_file(&path).unwrap());
    assert_eq!(full.fidelity, Fidelity::Full);
    assert_eq!(full.lines_scanned, 233);
    assert_eq!(full.counts.tool_invocations, 190);
    assert_eq!(full.counts.messages(), 41);
    assert_eq!(bounded.file_identity, full.file_identity);

    for order in [
        vec![bounded.clone(), full.clone()],
        vec![full.clone(), bounded.clone()],
    ] {
        let winner = reconcile::reconcile(order).unwrap();
        assert_eq!(winner.fidelity, Fidelity::Full);
        assert_eq!(winner.counts.tool_invocations, 190);
    }

    let store = IndexStore::open_in_memory().unwrap();
    store.upsert(bounded.clone()).unwrap();
    store.upsert(full.clone()).unwrap();

    // A bounded result for the same observation arriving late
    let spurious = parsed(BoundedParser::new(100).parse_file(&path).unwrap());
    let accepted = store.upsert(spurious).unwrap();
    assert_eq!(accepted, full);
    assert_eq!(store.get("sess-190").unwrap(), Some(full));
}

#[test]
fn test_grown_file_supersedes_full_summary() {
    let home = CodexHome::new();
    let path = home.rollout("growing");
    write_late_cwd_log(&path);

    let store = IndexStore::open_in_memory().unwrap();
    let old = parsed(ExhaustiveParser::new().parse_file(&path).unwrap());
    store.upsert(old.clone()).unwrap();

    append_user_message(&path, "one more thing");
    let grown = parsed(BoundedParser::new(100).parse_file(&path).unwrap());
    assert!(grown.file_identity.size > old.file_identity.size);
    assert_eq!(grown.fidelity, Fidelity::Metadata);

    let accepted = store.upsert(grown.clone()).unwrap();
    assert_eq!(accepted, grown);
    assert_eq!(store.get("sess-190").unwrap(), Some(grown));
}

// ============================================
// Orchestrator
// ============================================

#[tokio::test]
async fn test_hybrid_refresh_end_to_end() {
    let home = CodexHome::new();
    let path = home.rollout(CODEX_SESSION_ID);
    fs::create_dir_all(path.parent().unwrap()).unwrap();
    fs::copy(fixture_path("codex", "minimal-session.jsonl"), &path).unwrap();

    let indexer = home.indexer(&config(true));

    let first = indexer.refresh(RefreshPolicy::Hybrid).await.unwrap();
    assert_eq!(first.files_parsed, 1);
    assert_eq!(first.scheduled, 1);
    assert_eq!(first.summaries.len(), 1);
    assert!(first.failures.is_empty());

    indexer.settle().await.unwrap();
    let settled = indexer.get(CODEX_SESSION_ID).unwrap().unwrap();
    assert_eq!(settled.fidelity, Fidelity::Enriched);
    assert_eq!(settled.counts.user_messages, 2);
    assert_eq!(settled.lines_scanned, 10);

    // Nothing changed: no parse, nothing scheduled
    let second = indexer.refresh(RefreshPolicy::Hybrid).await.unwrap();
    assert_eq!(second.files_parsed, 0);
    assert_eq!(second.files_unchanged, 1);
    assert_eq!(second.scheduled, 0);
    assert_eq!(second.summaries, vec![settled.clone()]);

    // The file grows: the bounded result for the new identity wins at once
    append_user_message(&path, "and update the changelog");
    let third = indexer.refresh(RefreshPolicy::Hybrid).await.unwrap();
    assert_eq!(third.files_parsed, 1);
    let current = indexer.get(CODEX_SESSION_ID).unwrap().unwrap();
    assert_ne!(current.file_identity, settled.file_identity);

    indexer.settle().await.unwrap();
    let regrown = indexer.get(CODEX_SESSION_ID).unwrap().unwrap();
    assert_eq!(regrown.fidelity, Fidelity::Enriched);
    assert_eq!(regrown.counts.user_messages, 3);
    assert_eq!(regrown.lines_scanned, 11);

    let cached = indexer.refresh(RefreshPolicy::CacheOnly).await.unwrap();
    assert_eq!(cached.files_parsed, 0);
    assert_eq!(cached.summaries, vec![regrown]);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_hybrid_passes_converge() {
    let home = CodexHome::new();
    let path = home.rollout("concurrent");
    write_late_cwd_log(&path);

    let mut config = config(false);
    config.index.bounded_parse_line_limit = 100;
    let indexer = home.indexer(&config);

    let stop = Arc::new(AtomicBool::new(false));
    let monitor = {
        let indexer = indexer.clone();
        let stop = Arc::clone(&stop);
        tokio::spawn(async move {
            let mut seen = Vec::new();
            while !stop.load(Ordering::SeqCst) {
                if let Some(s) = indexer.get("sess-190").unwrap() {
                    seen.push((s.file_identity, s.fidelity));
                }
                tokio::task::yield_now().await;
            }
            seen
        })
    };

    let (a, b) = tokio::join!(
        indexer.refresh_with_token(RefreshPolicy::Hybrid, PassToken::new()),
        indexer.refresh_with_token(RefreshPolicy::Hybrid, PassToken::new()),
    );
    assert!(!a.unwrap().cancelled);
    assert!(!b.unwrap().cancelled);
    indexer.settle().await.unwrap();

    stop.store(true, Ordering::SeqCst);
    let seen = monitor.await.unwrap();

    let rows = indexer.store().list().unwrap();
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].fidelity, Fidelity::Full);
    assert_eq!(rows[0].counts.tool_invocations, 190);

    for pair in seen.windows(2) {
        if pair[0].0 == pair[1].0 {
            assert!(pair[0].1 <= pair[1].1, "fidelity regressed: {:?}", pair);
        }
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_force_reparse_single_row() {
    let home = CodexHome::new();
    let path = home.rollout("forced");
    write_late_cwd_log(&path);
    let indexer = home.indexer(&config(false));

    let (a, b) = tokio::join!(
        indexer.refresh_with_token(RefreshPolicy::ForceReparse, PassToken::new()),
        indexer.refresh_with_token(RefreshPolicy::ForceReparse, PassToken::new()),
    );
    let (a, b) = (a.unwrap(), b.unwrap());
    assert_eq!(a.scheduled + b.scheduled, 0);

    let rows = indexer.store().list().unwrap();
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].fidelity, Fidelity::Full);
    assert_eq!(rows[0].counts.tool_invocations, 190);
}

#[tokio::test]
async fn test_unindexable_file_is_skipped_until_it_changes() {
    let home = CodexHome::new();
    let path = home.rollout("no-metadata");
    CodexLog::new().tool_calls(3).write(&path);
    let indexer = home.indexer(&config(true));

    let first = indexer.refresh(RefreshPolicy::Hybrid).await.unwrap();
    assert_eq!(first.unindexable, vec![path.clone()]);
    assert!(first.failures.is_empty());
    assert!(first.summaries.is_empty());

    let second = indexer.refresh(RefreshPolicy::Hybrid).await.unwrap();
    assert_eq!(second.files_parsed, 0);
    assert_eq!(second.files_unchanged, 1);
    assert!(second.unindexable.is_empty());

    let status = indexer.store().source_file(&path).unwrap().unwrap().status;
    assert_eq!(status, FileStatus::Unindexable);
}

/// Source that surfaces a fixed list of files, whether or not they exist.
struct StaticSource {
    files: Vec<DiscoveredFile>,
}

impl SessionSource for StaticSource {
    fn name(&self) -> &str {
        "static"
    }

    fn root_path(&self) -> Option<PathBuf> {
        Some(std::env::temp_dir())
    }

    fn source_patterns(&self) -> Vec<String> {
        Vec::new()
    }

    fn discover_files(&self) -> sessdex_core::Result<Vec<DiscoveredFile>> {
        Ok(self.files.clone())
    }
}

#[tokio::test]
async fn test_unreadable_file_keeps_previous_summary() {
    let home = CodexHome::new();
    let path = home.rollout("vanishing");
    write_late_cwd_log(&path);

    let store = IndexStore::open(&home.db_path, Default::default()).unwrap();
    let previous = parsed(ExhaustiveParser::new().parse_file(&path).unwrap());
    store.upsert(previous.clone()).unwrap();
    fs::remove_file(&path).unwrap();

    let missing = DiscoveredFile {
        provider: "static".to_string(),
        path: path.clone(),
        identity: FileIdentity::new(1, Utc::now()),
    };
    let indexer = Indexer::new(
        store,
        vec![Box::new(StaticSource {
            files: vec![missing],
        })],
        &config(false),
    );

    let report = indexer.refresh(RefreshPolicy::ForceReparse).await.unwrap();
    assert_eq!(report.failures.len(), 1);
    assert_eq!(report.failures[0].0, path);
    assert_eq!(indexer.get("sess-190").unwrap(), Some(previous));

    let row = indexer.store().source_file(&path).unwrap().unwrap();
    assert_eq!(row.status, FileStatus::Failed);
    assert!(row.last_error.is_some());
}

#[tokio::test]
async fn test_cancelled_pass_does_not_write() {
    let home = CodexHome::new();
    CodexLog::new()
        .session_meta("cancelled", Some("/work"))
        .messages(2)
        .write(&home.rollout("cancelled"));
    let indexer = home.indexer(&config(true));

    let token = PassToken::new();
    token.cancel();
    let report = indexer
        .refresh_with_token(RefreshPolicy::Hybrid, token)
        .await
        .unwrap();
    assert!(report.cancelled);
    assert!(report.summaries.is_empty());
    assert!(indexer.store().source_files().unwrap().is_empty());

    // A new pass supersedes the one before it
    let older = indexer.new_pass_token();
    let newer = indexer.new_pass_token();
    assert!(older.is_cancelled());
    assert!(!newer.is_cancelled());
    indexer.cancel();
    assert!(newer.is_cancelled());

    let report = indexer.refresh(RefreshPolicy::Hybrid).await.unwrap();
    assert!(!report.cancelled);
    assert_eq!(report.summaries.len(), 1);
}

#[tokio::test]
async fn test_ingest_deduplicates_across_sources() {
    let home = CodexHome::new();
    let path = home.rollout("dup");
    write_late_cwd_log(&path);
    let indexer = home.indexer(&config(false));

    let full = parsed(ExhaustiveParser::new().parse_file(&path).unwrap());
    let mut shouted = parsed(BoundedParser::new(100).parse_file(&path).unwrap());
    shouted.session_id = "SESS-190".to_string();

    let ingested = indexer
        .ingest(vec![shouted, full.clone()], &PassToken::new())
        .unwrap();
    assert_eq!(ingested.accepted.len(), 1);
    assert_eq!(ingested.accepted["sess-190"], full);
    assert_eq!(indexer.store().list().unwrap(), vec![full]);
}

#[tokio::test]
async fn test_sweep_rederives_implausible_rows() {
    let home = CodexHome::new();
    let path = home.rollout("suspect");
    write_late_cwd_log(&path);
    let indexer = home.indexer(&config(false));

    let truth = parsed(ExhaustiveParser::new().parse_file(&path).unwrap());
    let bogus = SessionSummary {
        lines_scanned: 0,
        counts: Default::default(),
        ..truth.clone()
    };
    indexer.store().replace(&bogus).unwrap();

    let report = indexer.sweep().await.unwrap();
    assert_eq!(report.checked, 1);
    assert_eq!(report.repaired, vec!["sess-190".to_string()]);

    let repaired = indexer.get("sess-190").unwrap().unwrap();
    assert_eq!(repaired.lines_scanned, 233);
    assert_eq!(repaired.counts, truth.counts);

    // Nothing left to repair
    assert_eq!(indexer.sweep().await.unwrap().checked, 0);
}
