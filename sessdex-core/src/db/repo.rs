//! Database repository layer
//!
//! Provides query and write operations for summaries and source files.
//! Every write is a single statement, so readers never observe a torn row.

use crate::error::{Error, Result};
use crate::types::{FileIdentity, FileStatus, Fidelity, SessionCounts, SessionSummary, SourceFile};
use chrono::{DateTime, TimeZone, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row, TransactionBehavior};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

/// How long SQLite waits on a lock held by another connection before
/// reporting `SQLITE_BUSY`.
const BUSY_TIMEOUT: Duration = Duration::from_millis(250);

/// Database handle (single connection)
pub struct Database {
    conn: Mutex<Connection>,
}

impl Database {
    /// Open or create a database at the given path
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let conn = Connection::open(path)?;
        conn.busy_timeout(BUSY_TIMEOUT)?;

        // WAL lets the CLI read while a refresh is writing
        conn.execute_batch(
            "
            PRAGMA journal_mode = WAL;
            PRAGMA synchronous = NORMAL;
            ",
        )?;

        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Open an in-memory database (for testing)
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Run migrations on this database
    pub fn migrate(&self) -> Result<()> {
        super::schema::run_migrations(&self.conn())
    }

    fn conn(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(PoisonError::into_inner)
    }

    // ============================================
    // Summary operations
    // ============================================

    /// Get the accepted summary for a session
    pub fn get_summary(&self, session_id: &str) -> Result<Option<SessionSummary>> {
        Self::query_summary(&self.conn(), session_id)
    }

    /// Insert or replace the row for `summary.session_id`.
    ///
    /// This is an unconditional write; callers decide whether it should happen.
    pub fn write_summary(&self, summary: &SessionSummary) -> Result<()> {
        Self::insert_summary(&self.conn(), summary)
    }

    /// Write `candidate` if there is no row for its session or `accept`
    /// approves replacing the current one.
    ///
    /// Read, decision and write run in one `IMMEDIATE` transaction, so no
    /// other connection (in this process or another) can write the row in
    /// between. Returns the row that was stored before the call, if any, and
    /// whether `candidate` was written.
    pub fn write_summary_if<F>(
        &self,
        candidate: &SessionSummary,
        accept: F,
    ) -> Result<(Option<SessionSummary>, bool)>
    where
        F: FnOnce(&SessionSummary) -> bool,
    {
        let mut conn = self.conn();
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let existing = Self::query_summary(&tx, &candidate.session_id)?;
        let write = existing.as_ref().map_or(true, accept);
        if write {
            Self::insert_summary(&tx, candidate)?;
        }

        tx.commit()?;
        Ok((existing, write))
    }

    fn query_summary(conn: &Connection, session_id: &str) -> Result<Option<SessionSummary>> {
        conn.query_row(
            "SELECT * FROM summaries WHERE session_id = ?",
            [session_id],
            Self::row_to_summary,
        )
        .optional()
        .map_err(Error::from)
    }

    fn insert_summary(conn: &Connection, summary: &SessionSummary) -> Result<()> {
        conn.execute(
            r#"
            INSERT INTO summaries (
                session_id, source_path, file_size, file_modified_ms, fidelity, parsed_at,
                lines_scanned, malformed_lines, user_message_count, assistant_message_count,
                tool_invocation_count, thinking_count, started_at, working_directory, title,
                model, last_activity_at, active_duration_secs, fingerprint
            )
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17, ?18, ?19)
            ON CONFLICT(session_id) DO UPDATE SET
                source_path = excluded.source_path,
                file_size = excluded.file_size,
                file_modified_ms = excluded.file_modified_ms,
                fidelity = excluded.fidelity,
                parsed_at = excluded.parsed_at,
                lines_scanned = excluded.lines_scanned,
                malformed_lines = excluded.malformed_lines,
                user_message_count = excluded.user_message_count,
                assistant_message_count = excluded.assistant_message_count,
                tool_invocation_count = excluded.tool_invocation_count,
                thinking_count = excluded.thinking_count,
                started_at = excluded.started_at,
                working_directory = excluded.working_directory,
                title = excluded.title,
                model = excluded.model,
                last_activity_at = excluded.last_activity_at,
                active_duration_secs = excluded.active_duration_secs,
                fingerprint = excluded.fingerprint
            "#,
            params![
                summary.session_id,
                summary.source_path.to_string_lossy().to_string(),
                summary.file_identity.size as i64,
                summary.file_identity.modified_at.timestamp_millis(),
                summary.fidelity.as_str(),
                summary.parsed_at.to_rfc3339(),
                summary.lines_scanned as i64,
                summary.malformed_lines as i64,
                summary.counts.user_messages as i64,
                summary.counts.assistant_messages as i64,
                summary.counts.tool_invocations as i64,
                summary.counts.thinking as i64,
                summary.started_at.map(|t| t.to_rfc3339()),
                summary.working_directory,
                summary.title,
                summary.model,
                summary.last_activity_at.map(|t| t.to_rfc3339()),
                summary.active_duration_secs,
                summary.fingerprint(),
            ],
        )?;
        Ok(())
    }

    /// All accepted summaries, most recently started first
    pub fn list_summaries(&self) -> Result<Vec<SessionSummary>> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            "SELECT * FROM summaries ORDER BY started_at DESC, session_id ASC",
        )?;
        let rows = stmt.query_map([], Self::row_to_summary)?;
        rows.collect::<rusqlite::Result<Vec<_>>>()
            .map_err(Error::from)
    }

    /// Number of accepted summaries
    pub fn summary_count(&self) -> Result<i64> {
        let conn = self.conn();
        let count = conn.query_row("SELECT COUNT(*) FROM summaries", [], |r| r.get(0))?;
        Ok(count)
    }

    /// Rows labeled complete whose line count cannot be trusted.
    ///
    /// A `full`/`enriched` row is suspect when it scanned no lines, or when
    /// its file size per scanned line exceeds `max_avg_line_bytes`.
    pub fn suspect_summaries(&self, max_avg_line_bytes: u64) -> Result<Vec<SessionSummary>> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            r#"
            SELECT * FROM summaries
            WHERE fidelity IN ('full', 'enriched')
              AND (lines_scanned = 0 OR file_size / lines_scanned > ?1)
            ORDER BY session_id
            "#,
        )?;
        let rows = stmt.query_map([max_avg_line_bytes as i64], Self::row_to_summary)?;
        rows.collect::<rusqlite::Result<Vec<_>>>()
            .map_err(Error::from)
    }

    fn row_to_summary(row: &Row) -> rusqlite::Result<SessionSummary> {
        let source_path: String = row.get("source_path")?;
        let fidelity_str: String = row.get("fidelity")?;
        let parsed_at_str: String = row.get("parsed_at")?;
        let started_at_str: Option<String> = row.get("started_at")?;
        let last_activity_str: Option<String> = row.get("last_activity_at")?;

        Ok(SessionSummary {
            session_id: row.get("session_id")?,
            source_path: PathBuf::from(source_path),
            file_identity: Self::row_to_identity(row)?,
            fidelity: fidelity_str
                .parse::<Fidelity>()
                .map_err(|e| conversion_error(e.into()))?,
            parsed_at: parse_datetime(&parsed_at_str)?,
            lines_scanned: get_u64(row, "lines_scanned")?,
            malformed_lines: get_u64(row, "malformed_lines")?,
            counts: SessionCounts {
                user_messages: get_u64(row, "user_message_count")?,
                assistant_messages: get_u64(row, "assistant_message_count")?,
                tool_invocations: get_u64(row, "tool_invocation_count")?,
                thinking: get_u64(row, "thinking_count")?,
            },
            started_at: started_at_str.as_deref().map(parse_datetime).transpose()?,
            working_directory: row.get("working_directory")?,
            title: row.get("title")?,
            model: row.get("model")?,
            last_activity_at: last_activity_str.as_deref().map(parse_datetime).transpose()?,
            active_duration_secs: row.get("active_duration_secs")?,
        })
    }

    fn row_to_identity(row: &Row) -> rusqlite::Result<FileIdentity> {
        let modified_ms: i64 = row.get("file_modified_ms")?;
        let modified_at = Utc
            .timestamp_millis_opt(modified_ms)
            .single()
            .ok_or_else(|| conversion_error(format!("invalid mtime: {}", modified_ms).into()))?;
        Ok(FileIdentity::new(get_u64(row, "file_size")?, modified_at))
    }

    // ============================================
    // SourceFile operations
    // ============================================

    /// Insert or update a source file observation
    pub fn upsert_source_file(&self, file: &SourceFile) -> Result<()> {
        let conn = self.conn();
        conn.execute(
            r#"
            INSERT INTO source_files (path, provider, file_size, file_modified_ms, status,
                                      session_id, last_error, checked_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
            ON CONFLICT(path) DO UPDATE SET
                provider = excluded.provider,
                file_size = excluded.file_size,
                file_modified_ms = excluded.file_modified_ms,
                status = excluded.status,
                session_id = excluded.session_id,
                last_error = excluded.last_error,
                checked_at = excluded.checked_at
            "#,
            params![
                file.path.to_string_lossy().to_string(),
                file.provider,
                file.identity.size as i64,
                file.identity.modified_at.timestamp_millis(),
                file.status.as_str(),
                file.session_id,
                file.last_error,
                file.checked_at.to_rfc3339(),
            ],
        )?;
        Ok(())
    }

    /// Get the last observation of a source file
    pub fn get_source_file(&self, path: &Path) -> Result<Option<SourceFile>> {
        let conn = self.conn();
        conn.query_row(
            "SELECT * FROM source_files WHERE path = ?",
            [path.to_string_lossy().to_string()],
            Self::row_to_source_file,
        )
        .optional()
        .map_err(Error::from)
    }

    /// All tracked source files, ordered by path
    pub fn list_source_files(&self) -> Result<Vec<SourceFile>> {
        let conn = self.conn();
        let mut stmt = conn.prepare("SELECT * FROM source_files ORDER BY path")?;
        let rows = stmt.query_map([], Self::row_to_source_file)?;
        rows.collect::<rusqlite::Result<Vec<_>>>()
            .map_err(Error::from)
    }

    fn row_to_source_file(row: &Row) -> rusqlite::Result<SourceFile> {
        let path_str: String = row.get("path")?;
        let status_str: String = row.get("status")?;
        let checked_at_str: String = row.get("checked_at")?;

        Ok(SourceFile {
            path: PathBuf::from(path_str),
            provider: row.get("provider")?,
            identity: Self::row_to_identity(row)?,
            status: status_str
                .parse::<FileStatus>()
                .map_err(|e| conversion_error(e.into()))?,
            session_id: row.get("session_id")?,
            last_error: row.get("last_error")?,
            checked_at: parse_datetime(&checked_at_str)?,
        })
    }
}

fn conversion_error(err: Box<dyn std::error::Error + Send + Sync>) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(0, rusqlite::types::Type::Text, err)
}

fn parse_datetime(raw: &str) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| conversion_error(Box::new(e)))
}

fn get_u64(row: &Row, column: &str) -> rusqlite::Result<u64> {
    let value: i64 = row.get(column)?;
    Ok(value.max(0) as u64)
}
