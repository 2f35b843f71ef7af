//! Reconciliation of candidate summaries
//!
//! All accept/reject decisions in sessdex go through [`choose`]. It is the
//! maximum of a single total order over summaries of one session:
//!
//! | Rank | Key | Preference |
//! |------|-----|------------|
//! | 1 | file identity `(modified_at, size)` | newer observation of the file |
//! | 2 | fidelity | `Enriched > Full > Metadata` |
//! | 3 | sum of the four counts | more observed events |
//! | 4 | `lines_scanned` | more lines read |
//! | 5 | `parsed_at` | later parse |
//! | 6 | content fingerprint | larger SHA-256 hex digest |
//!
//! Because it is a maximum over a total order, [`choose`] is commutative and
//! associative and [`reconcile`] gives the same winner for every ordering of
//! its input. Rank 2 applies whenever identities are equal, so a lower
//! fidelity summary can never replace a higher one for an unchanged file.
//!
//! Identities that are not a monotone growth of each other (a truncated and
//! rewritten file) resolve by the later modification time, not by parse time.
//! Ordering them by `parsed_at` would let three candidates form a cycle.

use crate::types::SessionSummary;
use std::cmp::Ordering;
use std::collections::BTreeMap;

/// The rule that decided a comparison.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Rule {
    NewerFile,
    Fidelity,
    Coverage,
    LinesScanned,
    ParsedAt,
    Fingerprint,
    /// Both summaries are identical
    Identical,
}

impl Rule {
    pub fn as_str(&self) -> &'static str {
        match self {
            Rule::NewerFile => "newer_file",
            Rule::Fidelity => "fidelity",
            Rule::Coverage => "coverage",
            Rule::LinesScanned => "lines_scanned",
            Rule::ParsedAt => "parsed_at",
            Rule::Fingerprint => "fingerprint",
            Rule::Identical => "identical",
        }
    }
}

impl std::fmt::Display for Rule {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Order two summaries of the same session. `Greater` means `a` wins.
pub fn compare(a: &SessionSummary, b: &SessionSummary) -> (Ordering, Rule) {
    let ranked = [
        (
            a.file_identity.observation_cmp(&b.file_identity),
            Rule::NewerFile,
        ),
        (a.fidelity.cmp(&b.fidelity), Rule::Fidelity),
        (a.counts.total().cmp(&b.counts.total()), Rule::Coverage),
        (a.lines_scanned.cmp(&b.lines_scanned), Rule::LinesScanned),
        (a.parsed_at.cmp(&b.parsed_at), Rule::ParsedAt),
    ];

    if let Some(decided) = ranked.into_iter().find(|(ord, _)| ord.is_ne()) {
        return decided;
    }
    if a == b {
        return (Ordering::Equal, Rule::Identical);
    }
    (a.fingerprint().cmp(&b.fingerprint()), Rule::Fingerprint)
}

/// Pick the winner of two candidates. Ties (identical summaries) return `a`.
pub fn choose<'a>(a: &'a SessionSummary, b: &'a SessionSummary) -> &'a SessionSummary {
    match compare(a, b).0 {
        Ordering::Less => b,
        Ordering::Equal | Ordering::Greater => a,
    }
}

/// Two-argument form used by the store: the summary that should be accepted.
pub fn merge(existing: SessionSummary, incoming: SessionSummary) -> SessionSummary {
    match compare(&existing, &incoming).0 {
        Ordering::Less => incoming,
        Ordering::Equal | Ordering::Greater => existing,
    }
}

/// Fold [`merge`] over candidates. `None` for an empty input.
pub fn reconcile<I>(candidates: I) -> Option<SessionSummary>
where
    I: IntoIterator<Item = SessionSummary>,
{
    candidates.into_iter().reduce(merge)
}

/// Maps a summary to the key it is deduplicated under.
///
/// Different sources can surface the same underlying session under keys
/// that differ only in form. Implementations decide which summaries are the
/// same session; [`reconcile_groups`] then picks one winner per key.
pub trait IdentityResolver: Send + Sync {
    fn canonical_id(&self, summary: &SessionSummary) -> String;
}

impl<F> IdentityResolver for F
where
    F: Fn(&SessionSummary) -> String + Send + Sync,
{
    fn canonical_id(&self, summary: &SessionSummary) -> String {
        self(summary)
    }
}

/// Default resolver: the declared session id, trimmed and lowercased.
#[derive(Debug, Clone, Copy, Default)]
pub struct CanonicalSessionId;

impl IdentityResolver for CanonicalSessionId {
    fn canonical_id(&self, summary: &SessionSummary) -> String {
        summary.session_id.trim().to_lowercase()
    }
}

/// Group candidates by canonical id and reconcile each group.
///
/// Winners are re-keyed to their canonical id. Groups never interact.
pub fn reconcile_groups<I>(
    candidates: I,
    resolver: &dyn IdentityResolver,
) -> BTreeMap<String, SessionSummary>
where
    I: IntoIterator<Item = SessionSummary>,
{
    let mut groups: BTreeMap<String, SessionSummary> = BTreeMap::new();
    for candidate in candidates {
        let key = resolver.canonical_id(&candidate);
        let candidate = if candidate.session_id == key {
            candidate
        } else {
            candidate.with_session_id(key.clone())
        };
        let winner = match groups.remove(&key) {
            Some(current) => merge(current, candidate),
            None => candidate,
        };
        groups.insert(key, winner);
    }
    groups
}
