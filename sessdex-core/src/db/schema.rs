//! Database schema and migrations
//!
//! Uses SQLite with embedded migrations managed via PRAGMA user_version.

use rusqlite::Connection;

/// Current schema version
pub const SCHEMA_VERSION: i32 = 1;

/// SQL migrations, indexed by version number
const MIGRATIONS: &[&str] = &[
    // Version 1: summaries + source file bookkeeping
    r#"
    -- One accepted summary per session. Rows are only ever replaced whole.
    CREATE TABLE IF NOT EXISTS summaries (
        session_id              TEXT PRIMARY KEY,
        source_path             TEXT NOT NULL,

        -- File identity at parse time
        file_size               INTEGER NOT NULL,
        file_modified_ms        INTEGER NOT NULL,

        fidelity                TEXT NOT NULL,  -- 'metadata', 'full', 'enriched'
        parsed_at               DATETIME NOT NULL,
        lines_scanned           INTEGER NOT NULL,
        malformed_lines         INTEGER NOT NULL DEFAULT 0,

        -- Counts
        user_message_count      INTEGER NOT NULL DEFAULT 0,
        assistant_message_count INTEGER NOT NULL DEFAULT 0,
        tool_invocation_count   INTEGER NOT NULL DEFAULT 0,
        thinking_count          INTEGER NOT NULL DEFAULT 0,

        -- Metadata
        started_at              DATETIME,
        working_directory       TEXT,
        title                   TEXT,
        model                   TEXT,
        last_activity_at        DATETIME,

        -- Derived ('enriched' only)
        active_duration_secs    INTEGER,

        fingerprint             TEXT NOT NULL
    );

    -- Maintenance sweeps select by fidelity
    CREATE INDEX IF NOT EXISTS idx_summaries_fidelity ON summaries(fidelity);
    CREATE INDEX IF NOT EXISTS idx_summaries_started ON summaries(started_at DESC);

    -- Last observation of every discovered log file
    CREATE TABLE IF NOT EXISTS source_files (
        path                    TEXT PRIMARY KEY,
        provider                TEXT NOT NULL,
        file_size               INTEGER NOT NULL,
        file_modified_ms        INTEGER NOT NULL,
        status                  TEXT NOT NULL,  -- 'indexed', 'unindexable', 'failed'
        session_id              TEXT,
        last_error              TEXT,
        checked_at              DATETIME NOT NULL
    );

    CREATE INDEX IF NOT EXISTS idx_source_files_session ON source_files(session_id);
    "#,
];

/// Run all pending migrations
pub fn run_migrations(conn: &Connection) -> crate::error::Result<()> {
    let current_version: i32 = conn
        .query_row("PRAGMA user_version", [], |r| r.get(0))
        .unwrap_or(0);

    tracing::debug!(
        current_version,
        target_version = SCHEMA_VERSION,
        "Checking database migrations"
    );

    for (i, migration) in MIGRATIONS.iter().enumerate() {
        let version = (i + 1) as i32;
        if version > current_version {
            tracing::info!(version, "Running migration");
            conn.execute_batch(migration)?;
            conn.execute(&format!("PRAGMA user_version = {}", version), [])?;
        }
    }

    Ok(())
}

/// Get the current schema version from the database
pub fn get_schema_version(conn: &Connection) -> crate::error::Result<i32> {
    let version: i32 = conn.query_row("PRAGMA user_version", [], |r| r.get(0))?;
    Ok(version)
}
