//! Claude Code project records (`~/.claude/projects/<encoded-path>/*.jsonl`)
//!
//! Every conversational record repeats `sessionId` and `cwd`. One assistant
//! record may hold several content blocks, so a single line can decode to a
//! message, tool invocations and thinking events at once.

use super::first_text;
use crate::types::{EventKind, LogEvent, Role};
use serde::Deserialize;
use serde_json::Value;

#[derive(Debug, Deserialize, Default)]
#[serde(rename_all = "camelCase", default)]
struct RawRecord {
    session_id: Option<String>,
    cwd: Option<String>,
    is_sidechain: Option<bool>,
    is_meta: Option<bool>,
    message: Option<RawMessage>,
}

#[derive(Debug, Deserialize, Default)]
#[serde(default)]
struct RawMessage {
    model: Option<String>,
    content: Option<Value>,
}

pub(super) fn decode(record_type: &str, value: &Value, line: u64) -> Vec<LogEvent> {
    let record = RawRecord::deserialize(value).unwrap_or_default();
    let message = record.message.unwrap_or_default();

    let mut events = Vec::new();
    let counted = !record.is_sidechain.unwrap_or(false) && !record.is_meta.unwrap_or(false);

    if counted {
        match (record_type, &message.content) {
            ("user", Some(Value::String(text))) => {
                events.push(message_event(line, Role::User, Some(text.clone())));
            }
            ("user", Some(Value::Array(blocks))) => {
                // Tool results come back as user records; they are not user turns.
                let text = first_text(&text_blocks(blocks));
                if text.is_some() {
                    events.push(message_event(line, Role::User, text));
                }
            }
            ("assistant", Some(Value::Array(blocks))) => {
                let text = first_text(&text_blocks(blocks));
                if text.is_some() {
                    events.push(message_event(line, Role::Assistant, text));
                }
                for block in blocks {
                    match block.get("type").and_then(Value::as_str) {
                        Some("tool_use") | Some("server_tool_use") => {
                            events.push(LogEvent::new(line, EventKind::ToolInvocation));
                        }
                        Some("thinking") | Some("redacted_thinking") => {
                            events.push(LogEvent::new(line, EventKind::Thinking));
                        }
                        _ => {}
                    }
                }
            }
            ("assistant", Some(Value::String(text))) => {
                events.push(message_event(line, Role::Assistant, Some(text.clone())));
            }
            _ => {}
        }
    }

    if events.is_empty() {
        events.push(LogEvent::new(line, EventKind::Other));
    }

    // Line-level metadata rides on the first event of the line.
    let first = &mut events[0];
    first.session_id = record.session_id;
    first.working_directory = record.cwd;
    first.model = message.model.filter(|m| !m.starts_with('<'));

    events
}

fn text_blocks(blocks: &[Value]) -> Vec<Value> {
    blocks
        .iter()
        .filter(|block| block.get("type").and_then(Value::as_str) == Some("text"))
        .cloned()
        .collect()
}

fn message_event(line: u64, role: Role, text: Option<String>) -> LogEvent {
    let mut event = LogEvent::new(line, EventKind::Message);
    event.role = Some(role);
    event.text = text;
    event
}
