//! Bounded and exhaustive parse strategies
//!
//! Both strategies drive a [`LogReader`] into a [`SummaryBuilder`]; they
//! differ only in when they stop and which [`Fidelity`] they stamp:
//!
//! | Strategy | Stops | Fidelity |
//! |----------|-------|----------|
//! | [`BoundedParser`] | at the line limit, or as soon as essential metadata is known | `Metadata` (or `Full` after fallback) |
//! | [`ExhaustiveParser`] | at EOF | `Full`, or `Enriched` with enrichment on |
//!
//! Scans are pinned to the file size observed when the file was opened, so
//! content appended mid-scan is left for the next identity.

use super::builder::{ScanStats, SummaryBuilder};
use super::reader::LogReader;
use crate::config::IndexConfig;
use crate::error::{Error, Result};
use crate::types::{FileIdentity, Fidelity, SessionSummary};
use chrono::Duration;
use std::fs::File;
use std::io::{BufRead, BufReader, Seek};
use std::path::Path;

/// Result of parsing one file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ParseOutcome {
    /// A summary with essential metadata
    Parsed(SessionSummary),
    /// Read to EOF without finding essential metadata
    Unindexable {
        identity: FileIdentity,
        lines_scanned: u64,
        malformed_lines: u64,
    },
}

impl ParseOutcome {
    pub fn summary(&self) -> Option<&SessionSummary> {
        match self {
            ParseOutcome::Parsed(summary) => Some(summary),
            ParseOutcome::Unindexable { .. } => None,
        }
    }

    pub fn into_summary(self) -> Option<SessionSummary> {
        match self {
            ParseOutcome::Parsed(summary) => Some(summary),
            ParseOutcome::Unindexable { .. } => None,
        }
    }

    /// Identity of the file as it was scanned.
    pub fn identity(&self) -> FileIdentity {
        match self {
            ParseOutcome::Parsed(summary) => summary.file_identity,
            ParseOutcome::Unindexable { identity, .. } => *identity,
        }
    }
}

fn open(path: &Path) -> Result<(BufReader<File>, FileIdentity)> {
    let file = File::open(path)?;
    let identity = FileIdentity::from_metadata(&file.metadata()?);
    Ok((BufReader::new(file), identity))
}

fn check_read_error<R: BufRead + Seek>(reader: &mut LogReader<R>, path: &Path) -> Result<()> {
    match reader.take_error() {
        Some(e) => Err(Error::Parse {
            path: path.display().to_string(),
            message: format!("read failed at line {}: {}", reader.lines_read() + 1, e),
        }),
        None => Ok(()),
    }
}

/// Full linear scan of a session log.
#[derive(Debug, Clone)]
pub struct ExhaustiveParser {
    enrich: bool,
    idle_gap: Duration,
}

impl Default for ExhaustiveParser {
    fn default() -> Self {
        Self::new()
    }
}

impl ExhaustiveParser {
    /// Exhaustive parser producing `Full` summaries.
    pub fn new() -> Self {
        Self {
            enrich: false,
            idle_gap: Duration::minutes(15),
        }
    }

    /// Exhaustive parser producing `Enriched` summaries.
    pub fn enriched(idle_gap: Duration) -> Self {
        Self {
            enrich: true,
            idle_gap,
        }
    }

    pub fn from_config(config: &IndexConfig) -> Self {
        Self {
            enrich: config.enable_enriched_fidelity,
            idle_gap: config.idle_gap(),
        }
    }

    /// Open and parse a file, taking its identity from the open handle.
    pub fn parse_file(&self, path: &Path) -> Result<ParseOutcome> {
        let (source, identity) = open(path)?;
        self.parse(source, identity, path)
    }

    /// Parse `source`, reading at most `identity.size` bytes.
    pub fn parse<R: BufRead + Seek>(
        &self,
        source: R,
        identity: FileIdentity,
        path: &Path,
    ) -> Result<ParseOutcome> {
        let mut reader = LogReader::new(source).with_byte_limit(identity.size);
        self.scan(&mut reader, identity, path)
    }

    fn scan<R: BufRead + Seek>(
        &self,
        reader: &mut LogReader<R>,
        identity: FileIdentity,
        path: &Path,
    ) -> Result<ParseOutcome> {
        let mut builder = SummaryBuilder::new(path);
        if self.enrich {
            builder = builder.with_history();
        }

        for event in reader.by_ref() {
            builder.observe(&event);
        }
        check_read_error(reader, path)?;

        let stats = ScanStats {
            lines_scanned: reader.lines_read(),
            malformed_lines: reader.malformed_lines(),
        };

        let fidelity = if self.enrich {
            Fidelity::Enriched
        } else {
            Fidelity::Full
        };

        let Some(mut summary) = builder.build(identity, fidelity, stats) else {
            tracing::debug!(
                path = %path.display(),
                lines = stats.lines_scanned,
                "No essential metadata in file"
            );
            return Ok(ParseOutcome::Unindexable {
                identity,
                lines_scanned: stats.lines_scanned,
                malformed_lines: stats.malformed_lines,
            });
        };

        if self.enrich {
            summary.active_duration_secs = builder
                .active_duration(self.idle_gap)
                .map(|d| d.num_seconds());
        }

        tracing::debug!(
            path = %path.display(),
            session_id = %summary.session_id,
            fidelity = %summary.fidelity,
            lines = summary.lines_scanned,
            malformed = summary.malformed_lines,
            "Exhaustive parse complete"
        );
        Ok(ParseOutcome::Parsed(summary))
    }
}

/// Low-latency prefix scan for session metadata.
#[derive(Debug, Clone)]
pub struct BoundedParser {
    line_limit: u64,
    fallback: ExhaustiveParser,
}

impl BoundedParser {
    pub fn new(line_limit: u64) -> Self {
        Self {
            line_limit: line_limit.max(1),
            fallback: ExhaustiveParser::new(),
        }
    }

    pub fn from_config(config: &IndexConfig) -> Self {
        Self::new(config.bounded_parse_line_limit)
    }

    pub fn line_limit(&self) -> u64 {
        self.line_limit
    }

    /// Open and parse a file, taking its identity from the open handle.
    pub fn parse_file(&self, path: &Path) -> Result<ParseOutcome> {
        let (source, identity) = open(path)?;
        self.parse(source, identity, path)
    }

    /// Scan a prefix of `source`.
    ///
    /// If the prefix lacks essential metadata the reader is rewound and the
    /// whole file is scanned; the result is then `Full` (never `Enriched`)
    /// with `lines_scanned` covering the entire file.
    pub fn parse<R: BufRead + Seek>(
        &self,
        source: R,
        identity: FileIdentity,
        path: &Path,
    ) -> Result<ParseOutcome> {
        let mut reader = LogReader::new(source)
            .with_byte_limit(identity.size)
            .with_line_limit(self.line_limit);
        let mut builder = SummaryBuilder::new(path);

        #[allow(clippy::while_let_on_iterator)]
        while let Some(event) = reader.next() {
            builder.observe(&event);
            if builder.has_essential_metadata() && !reader.mid_line() {
                break;
            }
        }
        check_read_error(&mut reader, path)?;

        let stats = ScanStats {
            lines_scanned: reader.lines_read(),
            malformed_lines: reader.malformed_lines(),
        };
        if let Some(summary) = builder.build(identity, Fidelity::Metadata, stats) {
            tracing::debug!(
                path = %path.display(),
                session_id = %summary.session_id,
                lines = stats.lines_scanned,
                "Bounded parse complete"
            );
            return Ok(ParseOutcome::Parsed(summary));
        }

        tracing::debug!(
            path = %path.display(),
            limit = self.line_limit,
            "Essential metadata not in prefix, falling back to exhaustive parse"
        );
        reader.restart()?;
        reader.clear_line_limit();
        self.fallback.scan(&mut reader, identity, path)
    }
}
