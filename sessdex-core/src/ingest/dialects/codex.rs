//! Codex CLI rollout records (`~/.codex/sessions/YYYY/MM/DD/rollout-*.jsonl`)
//!
//! Only `response_item` records carry countable events. `event_msg`
//! records such as `user_message` and `agent_message` duplicate
//! `response_item` content and are deliberately not counted.

use super::{first_text, parse_timestamp};
use crate::types::{EventKind, LogEvent, Role};
use serde::Deserialize;
use serde_json::Value;

/// Session metadata payload (normally the first record in a file).
#[derive(Debug, Deserialize, Default)]
#[serde(default)]
struct SessionMetaPayload {
    id: Option<String>,
    timestamp: Option<String>,
    cwd: Option<String>,
}

/// Per-turn context payload.
#[derive(Debug, Deserialize, Default)]
#[serde(default)]
struct TurnContextPayload {
    cwd: Option<String>,
    model: Option<String>,
}

/// Response item payload.
#[derive(Debug, Deserialize, Default)]
#[serde(default)]
struct ResponseItemPayload {
    #[serde(rename = "type")]
    item_type: Option<String>,
    role: Option<String>,
    content: Option<Vec<Value>>,
}

fn payload<T: for<'de> Deserialize<'de> + Default>(payload: Option<&Value>) -> T {
    payload
        .and_then(|value| T::deserialize(value).ok())
        .unwrap_or_default()
}

pub(super) fn decode(record_type: &str, raw_payload: Option<&Value>, line: u64) -> Vec<LogEvent> {
    let mut event = LogEvent::new(line, EventKind::Other);

    match record_type {
        "session_meta" => {
            let meta: SessionMetaPayload = payload(raw_payload);
            event.session_id = meta.id;
            event.started_at = meta.timestamp.as_deref().and_then(parse_timestamp);
            event.working_directory = meta.cwd;
        }

        "turn_context" => {
            let context: TurnContextPayload = payload(raw_payload);
            event.working_directory = context.cwd;
            event.model = context.model;
        }

        "response_item" => {
            let item: ResponseItemPayload = payload(raw_payload);
            let item_type = item.item_type.as_deref().unwrap_or("unknown");

            match item_type {
                "message" => {
                    event.kind = EventKind::Message;
                    event.role = item.role.as_deref().and_then(Role::from_raw);
                    event.text = item.content.as_deref().and_then(first_text);
                }
                "reasoning" => event.kind = EventKind::Thinking,
                t if t.contains("tool_call") || t.contains("function_call") => {
                    event.kind = EventKind::ToolInvocation;
                }
                _ => {}
            }
        }

        _ => {}
    }

    vec![event]
}
