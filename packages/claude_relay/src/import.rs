//! Import of the CLI's own session archive.
//!
//! An archived conversation is replayed into relay history so a resumed
//! session looks the same as one that was recorded live.

use claude_convo::{ClaudeConvo, ContentPart, Conversation, ConvoError, MessageContent};
use tracing::{debug, info, warn};

use crate::decoder::tool_result_text;
use crate::protocol::SessionEvent;

const MAX_TITLE_CHARS: usize = 50;

/// Relay-side view of an archived CLI session.
#[derive(Debug, Clone, PartialEq)]
pub struct ImportedSession {
    pub cli_session_id: String,
    pub title: String,
    pub history: Vec<SessionEvent>,
}

/// Read `session_id` from the archive for `cwd`. A missing or unreadable
/// conversation imports as an empty history.
pub fn import_cli_session(archive: &ClaudeConvo, cwd: &str, session_id: &str) -> ImportedSession {
    let (title, history) = match archive.read_conversation(cwd, session_id) {
        Ok(convo) => {
            let title = convo
                .first_prompt()
                .map(|p| p.chars().take(MAX_TITLE_CHARS).collect())
                .unwrap_or_default();
            (title, history_from_conversation(&convo))
        }
        Err(ConvoError::ConversationNotFound(_)) => {
            debug!("No archived conversation {} for {}", session_id, cwd);
            (String::new(), Vec::new())
        }
        Err(e) => {
            warn!("Failed to read archived conversation {}: {}", session_id, e);
            (String::new(), Vec::new())
        }
    };

    info!(
        "Imported CLI session {} ({} records)",
        session_id,
        history.len()
    );
    ImportedSession {
        cli_session_id: session_id.to_string(),
        title,
        history,
    }
}

/// Convert archive entries to relay events. Consecutive assistant entries
/// form one turn, closed by `done {code:0}` when the next user prompt
/// arrives or the conversation ends. Tool results do not close a turn.
pub fn history_from_conversation(convo: &Conversation) -> Vec<SessionEvent> {
    let mut out = Vec::new();
    let mut in_turn = false;

    for (entry, message) in convo.messages() {
        let Some(content) = &message.content else {
            continue;
        };

        if entry.is_user() {
            let text = content.text();
            if !text.is_empty() {
                if in_turn {
                    out.push(SessionEvent::Done { code: 0 });
                    in_turn = false;
                }
                out.push(SessionEvent::UserMessage {
                    text,
                    image_count: image_count(content),
                });
            }
            for part in content.parts() {
                if let ContentPart::ToolResult {
                    tool_use_id,
                    content,
                    is_error,
                } = part
                {
                    out.push(SessionEvent::ToolResult {
                        id: tool_use_id.clone(),
                        content: tool_result_text(content),
                        is_error: *is_error,
                    });
                }
            }
        } else if entry.is_assistant() {
            in_turn = true;
            match content {
                MessageContent::Text(text) => out.push(SessionEvent::Delta { text: text.clone() }),
                MessageContent::Parts(parts) => parts.iter().for_each(|p| assistant_part(p, &mut out)),
            }
        }
    }

    if in_turn {
        out.push(SessionEvent::Done { code: 0 });
    }
    out
}

fn assistant_part(part: &ContentPart, out: &mut Vec<SessionEvent>) {
    match part {
        ContentPart::Text { text } if !text.is_empty() => {
            out.push(SessionEvent::Delta { text: text.clone() });
        }
        ContentPart::Thinking { thinking, .. } => {
            out.push(SessionEvent::ThinkingStart);
            if !thinking.is_empty() {
                out.push(SessionEvent::ThinkingDelta {
                    text: thinking.clone(),
                });
            }
            out.push(SessionEvent::ThinkingStop);
        }
        ContentPart::ToolUse { id, name, input } => {
            out.push(SessionEvent::ToolStart {
                id: id.clone(),
                name: name.clone(),
            });
            out.push(SessionEvent::ToolExecuting {
                id: id.clone(),
                name: name.clone(),
                input: input.clone(),
            });
        }
        _ => {}
    }
}

/// Images in a user message; `None` when there are none, matching live records.
fn image_count(content: &MessageContent) -> Option<usize> {
    let count = content
        .parts()
        .iter()
        .filter(|p| matches!(p, ContentPart::Image { .. }))
        .count();
    (count > 0).then_some(count)
}

#[cfg(test)]
mod tests {
    use super::*;
    use claude_convo::{ConversationReader, PathResolver, encode_cwd};
    use serde_json::{Value, json};
    use std::fs;
    use std::path::Path;
    use tempfile::TempDir;

    fn write_jsonl(path: &Path, records: &[Value]) {
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        let body: String = records.iter().map(|r| format!("{}\n", r)).collect();
        fs::write(path, body).unwrap();
    }

    fn sample() -> Vec<Value> {
        vec![
            json!({"type": "file-history-snapshot", "messageId": "m1", "snapshot": {}}),
            json!({"type": "user", "sessionId": "hist", "message": {"role": "user", "content": "What is 2+2?"}}),
            json!({"type": "assistant", "message": {"role": "assistant", "content": [
                {"type": "thinking", "thinking": "simple"},
                {"type": "text", "text": "The answer is 4."}
            ]}}),
            json!({"type": "user", "message": {"role": "user", "content": "Now multiply by 3"}}),
            json!({"type": "assistant", "message": {"role": "assistant", "content": [
                {"type": "tool_use", "id": "tool1", "name": "Calculator", "input": {"expr": "4*3"}}
            ]}}),
            json!({"type": "user", "message": {"role": "user", "content": [
                {"type": "tool_result", "tool_use_id": "tool1", "content": "12"}
            ]}}),
            json!({"type": "assistant", "message": {"role": "assistant", "content": [
                {"type": "text", "text": "The result is 12."}
            ]}}),
        ]
    }

    #[test]
    fn test_history_from_conversation() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("hist.jsonl");
        write_jsonl(&path, &sample());
        let convo = ConversationReader::read_conversation(&path).unwrap();

        let history = history_from_conversation(&convo);
        assert_eq!(
            history,
            vec![
                SessionEvent::UserMessage {
                    text: "What is 2+2?".into(),
                    image_count: None
                },
                SessionEvent::ThinkingStart,
                SessionEvent::ThinkingDelta {
                    text: "simple".into()
                },
                SessionEvent::ThinkingStop,
                SessionEvent::Delta {
                    text: "The answer is 4.".into()
                },
                SessionEvent::Done { code: 0 },
                SessionEvent::UserMessage {
                    text: "Now multiply by 3".into(),
                    image_count: None
                },
                SessionEvent::ToolStart {
                    id: "tool1".into(),
                    name: "Calculator".into()
                },
                SessionEvent::ToolExecuting {
                    id: "tool1".into(),
                    name: "Calculator".into(),
                    input: json!({"expr": "4*3"})
                },
                SessionEvent::ToolResult {
                    id: "tool1".into(),
                    content: "12".into(),
                    is_error: false
                },
                SessionEvent::Delta {
                    text: "The result is 12.".into()
                },
                SessionEvent::Done { code: 0 },
            ]
        );
    }

    #[test]
    fn test_user_images_are_counted() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("img.jsonl");
        write_jsonl(
            &path,
            &[json!({"type": "user", "message": {"role": "user", "content": [
                {"type": "image", "source": {"data": "..."}},
                {"type": "document", "source": {"data": "..."}},
                {"type": "image", "source": {"data": "..."}},
                {"type": "text", "text": "Describe these images"}
            ]}})],
        );
        let convo = ConversationReader::read_conversation(&path).unwrap();
        assert_eq!(
            history_from_conversation(&convo),
            vec![SessionEvent::UserMessage {
                text: "Describe these images".into(),
                image_count: Some(2)
            }]
        );
    }

    #[test]
    fn test_import_cli_session_from_archive() {
        let home = TempDir::new().unwrap();
        let claude_dir = home.path().join(".claude");
        let cwd = "/fake/history-test";
        let file = claude_dir
            .join("projects")
            .join(encode_cwd(cwd))
            .join("hist.jsonl");
        write_jsonl(&file, &sample());

        let archive = ClaudeConvo::with_resolver(PathResolver::new().with_claude_dir(&claude_dir));
        let imported = import_cli_session(&archive, cwd, "hist");
        assert_eq!(imported.cli_session_id, "hist");
        assert_eq!(imported.title, "What is 2+2?");
        assert_eq!(imported.history.len(), 12);
    }

    #[test]
    fn test_missing_conversation_imports_empty() {
        let home = TempDir::new().unwrap();
        let archive = ClaudeConvo::with_resolver(PathResolver::new().with_claude_dir(home.path()));
        let imported = import_cli_session(&archive, "/nowhere", "no-such-session");
        assert_eq!(imported.title, "");
        assert!(imported.history.is_empty());
    }
}
