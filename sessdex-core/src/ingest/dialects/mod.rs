//! Line decoders for the supported log dialects
//!
//! Every line is a JSON object with a top-level `type`. The value of `type`
//! selects the dialect:
//!
//! | `type` values | Dialect |
//! |---------------|---------|
//! | `session_meta`, `turn_context`, `response_item`, `event_msg`, `compacted` | [`codex`] |
//! | `user`, `assistant`, `system`, `summary`, `file-history-snapshot` | [`claude`] |
//!
//! Unknown types decode to a single [`EventKind::Other`] event so that new
//! record types never make a file unreadable.

mod claude;
mod codex;

use crate::types::{EventKind, LogEvent};
use chrono::{DateTime, Utc};
use serde_json::Value;

/// Decode one physical line into zero or more events.
///
/// Returns `None` when the line is malformed (not JSON, not an object, or
/// missing a string `type`). Blank lines decode to no events.
pub fn decode_line(line: &str, line_no: u64) -> Option<Vec<LogEvent>> {
    if line.trim().is_empty() {
        return Some(Vec::new());
    }

    let value: Value = serde_json::from_str(line).ok()?;
    let record_type = value.get("type")?.as_str()?;
    let timestamp = value
        .get("timestamp")
        .and_then(Value::as_str)
        .and_then(parse_timestamp);

    let mut events = match record_type {
        "session_meta" | "turn_context" | "response_item" | "event_msg" | "compacted" => {
            codex::decode(record_type, value.get("payload"), line_no)
        }
        "user" | "assistant" | "system" | "summary" | "file-history-snapshot" => {
            claude::decode(record_type, &value, line_no)
        }
        _ => vec![LogEvent::new(line_no, EventKind::Other)],
    };

    for event in &mut events {
        event.timestamp = timestamp;
    }
    Some(events)
}

/// Parse an RFC 3339 timestamp into UTC.
pub(crate) fn parse_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .ok()
        .map(|dt| dt.with_timezone(&Utc))
}

/// First non-empty `text` field of a content block array.
fn first_text(blocks: &[Value]) -> Option<String> {
    blocks
        .iter()
        .filter_map(|block| block.get("text").and_then(Value::as_str))
        .find(|text| !text.trim().is_empty())
        .map(str::to_string)
}
