//! Summary builder
//!
//! Folds [`LogEvent`]s into the fields of a [`SessionSummary`]. The builder
//! does no I/O and does not know how many lines it will see; the parsers
//! decide when to stop and with which fidelity to build.

use crate::types::{
    EventKind, FileIdentity, Fidelity, LogEvent, Role, SessionCounts, SessionSummary,
};
use chrono::{DateTime, Duration, Utc};
use std::path::PathBuf;

/// Maximum title length in characters.
const TITLE_MAX_CHARS: usize = 80;

/// Line statistics from the reader, stamped onto the built summary.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ScanStats {
    pub lines_scanned: u64,
    pub malformed_lines: u64,
}

/// Accumulates events into a session summary.
#[derive(Debug, Clone)]
pub struct SummaryBuilder {
    source_path: PathBuf,
    session_id: Option<String>,
    declared_started_at: Option<DateTime<Utc>>,
    id_record_timestamp: Option<DateTime<Utc>>,
    working_directory: Option<String>,
    model: Option<String>,
    title: Option<String>,
    counts: SessionCounts,
    last_activity_at: Option<DateTime<Utc>>,
    history: Option<Vec<DateTime<Utc>>>,
}

impl SummaryBuilder {
    pub fn new(source_path: impl Into<PathBuf>) -> Self {
        Self {
            source_path: source_path.into(),
            session_id: None,
            declared_started_at: None,
            id_record_timestamp: None,
            working_directory: None,
            model: None,
            title: None,
            counts: SessionCounts::default(),
            last_activity_at: None,
            history: None,
        }
    }

    /// Retain event timestamps for derived metrics.
    pub fn with_history(mut self) -> Self {
        self.history = Some(Vec::new());
        self
    }

    /// Accumulate one event.
    pub fn observe(&mut self, event: &LogEvent) {
        if self.session_id.is_none() {
            if let Some(id) = event.session_id.as_deref().map(str::trim) {
                if !id.is_empty() {
                    self.session_id = Some(id.to_string());
                    self.id_record_timestamp = event.timestamp;
                }
            }
        }
        if self.declared_started_at.is_none() {
            self.declared_started_at = event.started_at;
        }
        if self.working_directory.is_none() {
            self.working_directory = event
                .working_directory
                .clone()
                .filter(|cwd| !cwd.trim().is_empty());
        }
        if self.model.is_none() {
            self.model = event.model.clone();
        }

        match (event.kind, event.role) {
            (EventKind::Message, Some(Role::User)) => {
                self.counts.user_messages += 1;
                if self.title.is_none() {
                    self.title = event.text.as_deref().and_then(title_from);
                }
            }
            (EventKind::Message, Some(Role::Assistant)) => self.counts.assistant_messages += 1,
            (EventKind::ToolInvocation, _) => self.counts.tool_invocations += 1,
            (EventKind::Thinking, _) => self.counts.thinking += 1,
            _ => {}
        }

        if let Some(ts) = event.timestamp {
            if self.last_activity_at.map_or(true, |last| ts > last) {
                self.last_activity_at = Some(ts);
            }
            if let Some(history) = self.history.as_mut() {
                history.push(ts);
            }
        }
    }

    fn started_at(&self) -> Option<DateTime<Utc>> {
        self.declared_started_at.or(self.id_record_timestamp)
    }

    /// True once session id, start time and working directory are all known.
    pub fn has_essential_metadata(&self) -> bool {
        self.session_id.is_some() && self.started_at().is_some() && self.working_directory.is_some()
    }

    pub fn counts(&self) -> SessionCounts {
        self.counts
    }

    /// Sum of gaps between consecutive events, skipping gaps longer than `idle_gap`.
    ///
    /// Returns `None` when no history was retained.
    pub fn active_duration(&self, idle_gap: Duration) -> Option<Duration> {
        let history = self.history.as_ref()?;
        let mut sorted = history.clone();
        sorted.sort();

        let total = sorted
            .windows(2)
            .map(|pair| pair[1] - pair[0])
            .filter(|gap| *gap > Duration::zero() && *gap <= idle_gap)
            .fold(Duration::zero(), |acc, gap| acc + gap);
        Some(total)
    }

    /// Produce a summary, or `None` if essential metadata is missing.
    pub fn build(
        &self,
        identity: FileIdentity,
        fidelity: Fidelity,
        stats: ScanStats,
    ) -> Option<SessionSummary> {
        if !self.has_essential_metadata() {
            return None;
        }

        Some(SessionSummary {
            session_id: self.session_id.clone()?,
            source_path: self.source_path.clone(),
            file_identity: identity,
            fidelity,
            parsed_at: Utc::now(),
            lines_scanned: stats.lines_scanned,
            malformed_lines: stats.malformed_lines,
            counts: self.counts,
            started_at: self.started_at(),
            working_directory: self.working_directory.clone(),
            title: self.title.clone(),
            model: self.model.clone(),
            last_activity_at: self.last_activity_at,
            active_duration_secs: None,
        })
    }
}

/// Detect context the CLI injects as "user" messages.
///
/// These count as user messages but never become the session title.
fn is_system_injected_context(text: &str) -> bool {
    let trimmed = text.trim();
    trimmed.starts_with("<environment_context>")
        || trimmed.starts_with("<user_shell_command>")
        || trimmed.starts_with("<INSTRUCTIONS>")
        || trimmed.starts_with("<user_instructions>")
        || trimmed.starts_with("<system")
        || trimmed.starts_with("<command-")
        || trimmed.starts_with("<local-command-")
        || trimmed.starts_with("# AGENTS.md instructions for")
}

fn title_from(text: &str) -> Option<String> {
    if is_system_injected_context(text) {
        return None;
    }
    let first_line = text.lines().map(str::trim).find(|l| !l.is_empty())?;
    if first_line.chars().count() > TITLE_MAX_CHARS {
        let truncated: String = first_line.chars().take(TITLE_MAX_CHARS - 3).collect();
        Some(format!("{}...", truncated.trim_end()))
    } else {
        Some(first_line.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn ts(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap()
    }

    fn identity() -> FileIdentity {
        FileIdentity::new(100, ts(0))
    }

    fn user(line: u64, text: &str) -> LogEvent {
        let mut event = LogEvent::new(line, EventKind::Message);
        event.role = Some(Role::User);
        event.text = Some(text.to_string());
        event
    }

    fn meta(line: u64) -> LogEvent {
        let mut event = LogEvent::new(line, EventKind::Other);
        event.session_id = Some("sess-1".to_string());
        event.started_at = Some(ts(0));
        event.working_directory = Some("/work".to_string());
        event
    }

    #[test]
    fn test_build_requires_essential_metadata() {
        let mut builder = SummaryBuilder::new("/logs/a.jsonl");
        builder.observe(&user(1, "hello"));
        assert!(!builder.has_essential_metadata());
        assert!(builder
            .build(identity(), Fidelity::Full, ScanStats::default())
            .is_none());

        builder.observe(&meta(2));
        assert!(builder.has_essential_metadata());
        let summary = builder
            .build(
                identity(),
                Fidelity::Full,
                ScanStats {
                    lines_scanned: 2,
                    malformed_lines: 0,
                },
            )
            .unwrap();
        assert_eq!(summary.session_id, "sess-1");
        assert_eq!(summary.counts.user_messages, 1);
        assert_eq!(summary.lines_scanned, 2);
        assert_eq!(summary.title.as_deref(), Some("hello"));
    }

    #[test]
    fn test_started_at_falls_back_to_id_record_timestamp() {
        let mut event = LogEvent::new(1, EventKind::Other);
        event.session_id = Some("abc".to_string());
        event.working_directory = Some("/w".to_string());
        event.timestamp = Some(ts(42));

        let mut builder = SummaryBuilder::new("/logs/b.jsonl");
        builder.observe(&event);
        let summary = builder
            .build(identity(), Fidelity::Metadata, ScanStats::default())
            .unwrap();
        assert_eq!(summary.started_at, Some(ts(42)));
    }

    #[test]
    fn test_first_working_directory_wins() {
        let mut builder = SummaryBuilder::new("/logs/c.jsonl");
        builder.observe(&meta(1));
        let mut later = LogEvent::new(2, EventKind::Other);
        later.working_directory = Some("/elsewhere".to_string());
        builder.observe(&later);

        let summary = builder
            .build(identity(), Fidelity::Full, ScanStats::default())
            .unwrap();
        assert_eq!(summary.working_directory.as_deref(), Some("/work"));
    }

    #[test]
    fn test_injected_context_counts_but_is_not_title() {
        let mut builder = SummaryBuilder::new("/logs/d.jsonl");
        builder.observe(&meta(1));
        builder.observe(&user(2, "<environment_context>\n  <cwd>/work</cwd>\n</environment_context>"));
        builder.observe(&user(3, "\nRefactor the parser\nand add tests"));

        let summary = builder
            .build(identity(), Fidelity::Full, ScanStats::default())
            .unwrap();
        assert_eq!(summary.counts.user_messages, 2);
        assert_eq!(summary.title.as_deref(), Some("Refactor the parser"));
    }

    #[test]
    fn test_long_title_is_truncated() {
        let long = "x".repeat(200);
        let title = title_from(&long).unwrap();
        assert_eq!(title.chars().count(), TITLE_MAX_CHARS);
        assert!(title.ends_with("..."));
    }

    #[test]
    fn test_active_duration_skips_idle_gaps() {
        let mut builder = SummaryBuilder::new("/logs/e.jsonl").with_history();
        for secs in [0, 60, 120, 5000, 5030] {
            let mut event = LogEvent::new(1, EventKind::Other);
            event.timestamp = Some(ts(secs));
            builder.observe(&event);
        }
        let active = builder.active_duration(Duration::minutes(15)).unwrap();
        assert_eq!(active.num_seconds(), 150);
        assert_eq!(builder.last_activity_at, Some(ts(5030)));
    }

    #[test]
    fn test_active_duration_without_history() {
        let builder = SummaryBuilder::new("/logs/f.jsonl");
        assert!(builder.active_duration(Duration::minutes(15)).is_none());
    }
}
