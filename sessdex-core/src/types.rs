//! Core domain types for sessdex
//!
//! ## Terminology
//!
//! | Term | Definition |
//! |------|------------|
//! | **Session** | One recorded agent session, backed by one append-only JSONL file |
//! | **LogEvent** | One decoded event from a log line (a line may yield several) |
//! | **Fidelity** | How completely a summary reflects its source file |
//! | **FileIdentity** | `(size, modified_at)` of the source file at parse time |
//! | **SessionSummary** | The indexed record for a session |
//!
//! Summaries are values: they are never patched in place. Reconciliation
//! picks between whole summaries (see [`crate::reconcile`]).

use chrono::{DateTime, SubsecRound, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::cmp::Ordering;
use std::path::PathBuf;

// ============================================
// Log events
// ============================================

/// Semantic kind of a decoded log event
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    Message,
    ToolInvocation,
    Thinking,
    Other,
}

/// Author role of a message event
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    User,
    Assistant,
    System,
}

impl Role {
    /// Map a raw log role string. `developer` is the system channel in Codex logs.
    pub fn from_raw(raw: &str) -> Option<Self> {
        match raw {
            "user" | "human" => Some(Role::User),
            "assistant" => Some(Role::Assistant),
            "system" | "developer" => Some(Role::System),
            _ => None,
        }
    }
}

/// One decoded event from a session log.
///
/// Metadata fields are populated only on the events that declare them.
#[derive(Debug, Clone, PartialEq)]
pub struct LogEvent {
    /// 1-based physical line the event was decoded from
    pub line: u64,
    /// Envelope timestamp of the record, if present and valid
    pub timestamp: Option<DateTime<Utc>>,
    pub kind: EventKind,
    /// Author role (messages only)
    pub role: Option<Role>,
    /// Declared session identifier
    pub session_id: Option<String>,
    /// Declared session start time
    pub started_at: Option<DateTime<Utc>>,
    /// Declared working directory
    pub working_directory: Option<String>,
    /// Declared model identifier
    pub model: Option<String>,
    /// First text content (messages only)
    pub text: Option<String>,
}

impl LogEvent {
    /// Create an event with no metadata.
    pub fn new(line: u64, kind: EventKind) -> Self {
        Self {
            line,
            timestamp: None,
            kind,
            role: None,
            session_id: None,
            started_at: None,
            working_directory: None,
            model: None,
            text: None,
        }
    }
}

// ============================================
// Fidelity and file identity
// ============================================

/// How completely a summary reflects its source file.
///
/// Totally ordered: `Metadata < Full < Enriched`.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum Fidelity {
    /// Bounded prefix scan; counts are a lower bound
    Metadata,
    /// Full linear scan; counts are exact for the file identity
    Full,
    /// Full scan plus derived metrics (active duration)
    Enriched,
}

impl Fidelity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Fidelity::Metadata => "metadata",
            Fidelity::Full => "full",
            Fidelity::Enriched => "enriched",
        }
    }
}

impl std::fmt::Display for Fidelity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for Fidelity {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "metadata" => Ok(Fidelity::Metadata),
            "full" => Ok(Fidelity::Full),
            "enriched" => Ok(Fidelity::Enriched),
            _ => Err(format!("unknown fidelity: {}", s)),
        }
    }
}

/// Size and modification time of a source file at observation time.
///
/// Two identities are equal iff both fields match. `modified_at` is kept at
/// millisecond precision so identities survive a round trip through the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FileIdentity {
    pub size: u64,
    pub modified_at: DateTime<Utc>,
}

impl FileIdentity {
    pub fn new(size: u64, modified_at: DateTime<Utc>) -> Self {
        Self {
            size,
            modified_at: modified_at.trunc_subsecs(3),
        }
    }

    /// Identity of a file from its filesystem metadata.
    pub fn from_metadata(metadata: &std::fs::Metadata) -> Self {
        let modified_at = metadata
            .modified()
            .ok()
            .map(DateTime::<Utc>::from)
            .unwrap_or_else(|| DateTime::<Utc>::from(std::time::UNIX_EPOCH));
        Self::new(metadata.len(), modified_at)
    }

    /// Order two observations of a file, newest last.
    ///
    /// Lexicographic on `(modified_at, size)`: every "grew or was touched
    /// later" pair is ordered the intuitive way, and pairs that moved in
    /// opposite directions (truncation) resolve to the later write.
    pub fn observation_cmp(&self, other: &Self) -> Ordering {
        self.modified_at
            .cmp(&other.modified_at)
            .then(self.size.cmp(&other.size))
    }
}

// ============================================
// Session summary
// ============================================

/// Event counts accumulated for a session.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SessionCounts {
    pub user_messages: u64,
    pub assistant_messages: u64,
    pub tool_invocations: u64,
    pub thinking: u64,
}

impl SessionCounts {
    /// Sum of all four counts.
    pub fn total(&self) -> u64 {
        self.user_messages + self.assistant_messages + self.tool_invocations + self.thinking
    }

    /// Total message count (user + assistant)
    pub fn messages(&self) -> u64 {
        self.user_messages + self.assistant_messages
    }
}

/// The indexed summary of one session log.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionSummary {
    /// Stable session identity
    pub session_id: String,
    /// Path of the log file this summary was parsed from
    pub source_path: PathBuf,
    /// Identity of the source file at parse time
    pub file_identity: FileIdentity,
    pub fidelity: Fidelity,
    pub parsed_at: DateTime<Utc>,
    /// Physical lines read by the parser
    pub lines_scanned: u64,
    /// Lines skipped because they could not be decoded
    pub malformed_lines: u64,
    pub counts: SessionCounts,
    pub started_at: Option<DateTime<Utc>>,
    pub working_directory: Option<String>,
    pub title: Option<String>,
    pub model: Option<String>,
    pub last_activity_at: Option<DateTime<Utc>>,
    /// Time spent between events, excluding idle gaps (`Enriched` only)
    pub active_duration_secs: Option<i64>,
}

impl SessionSummary {
    /// SHA-256 of the canonical JSON encoding, hex encoded.
    ///
    /// Used as the final, content-based tie-break when two candidates agree
    /// on every ranked field.
    pub fn fingerprint(&self) -> String {
        let encoded = serde_json::to_vec(self).unwrap_or_default();
        hex::encode(Sha256::digest(&encoded))
    }

    /// Copy of this summary filed under a different session id.
    pub fn with_session_id(&self, session_id: impl Into<String>) -> Self {
        Self {
            session_id: session_id.into(),
            ..self.clone()
        }
    }
}

// ============================================
// Source file bookkeeping
// ============================================

/// Outcome of the last parse attempt for a source file
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FileStatus {
    /// Parsed into a summary
    Indexed,
    /// Parsed to EOF without finding essential metadata
    Unindexable,
    /// Could not be read
    Failed,
}

impl FileStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            FileStatus::Indexed => "indexed",
            FileStatus::Unindexable => "unindexable",
            FileStatus::Failed => "failed",
        }
    }
}

impl std::str::FromStr for FileStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "indexed" => Ok(FileStatus::Indexed),
            "unindexable" => Ok(FileStatus::Unindexable),
            "failed" => Ok(FileStatus::Failed),
            _ => Err(format!("unknown file status: {}", s)),
        }
    }
}

/// Last observation of a source file, used to detect change between refreshes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceFile {
    /// Path to the source file (primary key)
    pub path: PathBuf,
    /// Name of the source that surfaced the file
    pub provider: String,
    pub identity: FileIdentity,
    pub status: FileStatus,
    /// Canonical session id, when indexed
    pub session_id: Option<String>,
    pub last_error: Option<String>,
    pub checked_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn ts(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(secs, 0).unwrap()
    }

    #[test]
    fn test_fidelity_order() {
        assert!(Fidelity::Metadata < Fidelity::Full);
        assert!(Fidelity::Full < Fidelity::Enriched);
        assert_eq!("full".parse::<Fidelity>(), Ok(Fidelity::Full));
        assert!("partial".parse::<Fidelity>().is_err());
        assert_eq!(Fidelity::Enriched.to_string(), "enriched");
    }

    #[test]
    fn test_file_identity_truncates_to_millis() {
        let precise = Utc.timestamp_opt(1_700_000_000, 123_456_789).unwrap();
        let identity = FileIdentity::new(10, precise);
        assert_eq!(identity.modified_at.timestamp_subsec_nanos(), 123_000_000);
        assert_eq!(identity, FileIdentity::new(10, precise));
    }

    #[test]
    fn test_file_identity_observation_order() {
        let old = FileIdentity::new(1000, ts(100));
        let grown = FileIdentity::new(1500, ts(200));
        let touched = FileIdentity::new(1000, ts(200));
        let truncated = FileIdentity::new(400, ts(300));

        assert_eq!(grown.observation_cmp(&old), Ordering::Greater);
        assert_eq!(touched.observation_cmp(&old), Ordering::Greater);
        assert_eq!(grown.observation_cmp(&touched), Ordering::Greater);
        assert_eq!(truncated.observation_cmp(&grown), Ordering::Greater);
        assert_eq!(old.observation_cmp(&old), Ordering::Equal);
    }

    #[test]
    fn test_counts() {
        let a = SessionCounts {
            user_messages: 2,
            assistant_messages: 3,
            tool_invocations: 5,
            thinking: 1,
        };
        assert_eq!(a.total(), 11);
        assert_eq!(a.messages(), 5);
    }

    #[test]
    fn test_role_mapping() {
        assert_eq!(Role::from_raw("user"), Some(Role::User));
        assert_eq!(Role::from_raw("developer"), Some(Role::System));
        assert_eq!(Role::from_raw("tool"), None);
    }
}
