//! Stream-json decoder.
//!
//! Turns the assistant's stdout (newline-delimited JSON, arriving in arbitrary
//! chunks) into relay events. One decoder per session; it owns the partial
//! line buffer, the open content blocks keyed by stream index, and the set of
//! tool-result ids already delivered in the current turn.

use serde::Deserialize;
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use tracing::debug;

use crate::protocol::SessionEvent;

/// What a decoded line asks the relay to do, in order.
#[derive(Debug, Clone, PartialEq)]
pub enum Decoded {
    /// A record carried a top-level `session_id`
    SessionId(String),
    /// `system/init` advertised the available slash commands
    SlashCommands(Vec<String>),
    /// Append to the session log and deliver
    Event(SessionEvent),
    /// A `result` record closed the turn; follows its `result` and `done` events
    TurnComplete,
}

#[derive(Debug, Clone, PartialEq)]
enum OpenBlock {
    Text,
    ToolUse {
        id: String,
        name: String,
        input_json: String,
    },
    Thinking {
        text: String,
    },
}

// =============================================================================
// Wire shapes
// =============================================================================

#[derive(Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum StreamRecord {
    System {
        #[serde(default)]
        subtype: Option<String>,
        #[serde(default)]
        slash_commands: Option<Vec<String>>,
    },
    StreamEvent {
        event: StreamEvent,
    },
    Assistant {
        #[serde(default)]
        message: Option<TurnMessage>,
    },
    User {
        #[serde(default)]
        message: Option<TurnMessage>,
    },
    Result {
        #[serde(default)]
        total_cost_usd: Option<f64>,
        #[serde(default)]
        duration_ms: Option<f64>,
        #[serde(default)]
        session_id: Option<String>,
    },
    #[serde(other)]
    Other,
}

#[derive(Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum StreamEvent {
    ContentBlockStart {
        index: u64,
        content_block: BlockStart,
    },
    ContentBlockDelta {
        index: u64,
        delta: BlockDelta,
    },
    ContentBlockStop {
        index: u64,
    },
    #[serde(other)]
    Other,
}

#[derive(Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum BlockStart {
    ToolUse {
        id: String,
        name: String,
    },
    Thinking,
    Text,
    #[serde(other)]
    Other,
}

#[derive(Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum BlockDelta {
    TextDelta { text: String },
    InputJsonDelta { partial_json: String },
    ThinkingDelta { thinking: String },
    #[serde(other)]
    Other,
}

#[derive(Deserialize)]
struct TurnMessage {
    /// Usually a list of content items; a plain string carries no tool results
    #[serde(default)]
    content: Value,
}

#[derive(Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum TurnContent {
    ToolResult {
        tool_use_id: String,
        #[serde(default)]
        content: Value,
        #[serde(default)]
        is_error: Option<bool>,
    },
    #[serde(other)]
    Other,
}

// =============================================================================
// Decoder
// =============================================================================

#[derive(Debug, Default)]
pub struct ProtocolDecoder {
    buffer: Vec<u8>,
    blocks: HashMap<u64, OpenBlock>,
    delivered: HashSet<String>,
}

impl ProtocolDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed a chunk of process output. Only complete lines are decoded; a
    /// trailing partial line waits for the next chunk.
    pub fn feed(&mut self, chunk: &[u8]) -> Vec<Decoded> {
        // The carried-over tail never holds a newline, so only the new chunk
        // needs scanning.
        let mut buffer = std::mem::take(&mut self.buffer);
        let mut from = buffer.len();
        buffer.extend_from_slice(chunk);

        let mut out = Vec::new();
        let mut start = 0;
        while let Some(rel) = buffer[from..].iter().position(|&b| b == b'\n') {
            let end = from + rel;
            self.decode_line(&buffer[start..end], &mut out);
            start = end + 1;
            from = start;
        }
        buffer.drain(..start);
        self.buffer = buffer;
        out
    }

    /// Decode whatever is left in the buffer as a final line. Used when the
    /// process exits without a trailing newline.
    pub fn flush(&mut self) -> Vec<Decoded> {
        let line = std::mem::take(&mut self.buffer);
        let mut out = Vec::new();
        self.decode_line(&line, &mut out);
        out
    }

    /// Forget tool results delivered so far; called when a new turn starts.
    pub fn begin_turn(&mut self) {
        self.delivered.clear();
    }

    /// Drop any open content blocks (process exit).
    pub fn clear_blocks(&mut self) {
        self.blocks.clear();
    }

    /// Full reset for a freshly spawned process.
    pub fn reset(&mut self) {
        self.buffer.clear();
        self.blocks.clear();
        self.delivered.clear();
    }

    #[cfg(test)]
    pub fn open_block_count(&self) -> usize {
        self.blocks.len()
    }

    fn decode_line(&mut self, line: &[u8], out: &mut Vec<Decoded>) {
        let line = String::from_utf8_lossy(line);
        let line = line.trim();
        if line.is_empty() {
            return;
        }

        let value: Value = match serde_json::from_str(line) {
            Ok(value) => value,
            Err(e) => {
                debug!("Dropping malformed line from assistant: {}", e);
                return;
            }
        };

        if let Some(id) = value.get("session_id").and_then(Value::as_str) {
            if !id.is_empty() {
                out.push(Decoded::SessionId(id.to_string()));
            }
        }

        let record = match StreamRecord::deserialize(&value) {
            Ok(record) => record,
            Err(e) => {
                debug!("Ignoring unrecognized record shape: {}", e);
                return;
            }
        };

        match record {
            StreamRecord::System {
                subtype,
                slash_commands,
            } => {
                if subtype.as_deref() == Some("init") {
                    if let Some(commands) = slash_commands {
                        out.push(Decoded::SlashCommands(commands));
                    }
                }
            }
            StreamRecord::StreamEvent { event } => self.on_stream_event(event, out),
            StreamRecord::Assistant { message } | StreamRecord::User { message } => {
                if let Some(message) = message {
                    self.on_turn_content(message.content, out);
                }
            }
            StreamRecord::Result {
                total_cost_usd,
                duration_ms,
                session_id,
            } => {
                self.blocks.clear();
                self.delivered.clear();
                out.push(Decoded::Event(SessionEvent::Result {
                    cost: total_cost_usd,
                    duration: duration_ms
                        .filter(|d| d.is_finite())
                        .map(|d| d.max(0.0).round() as u64),
                    session_id,
                }));
                out.push(Decoded::Event(SessionEvent::Done { code: 0 }));
                out.push(Decoded::TurnComplete);
            }
            StreamRecord::Other => {}
        }
    }

    fn on_stream_event(&mut self, event: StreamEvent, out: &mut Vec<Decoded>) {
        match event {
            StreamEvent::ContentBlockStart {
                index,
                content_block,
            } => match content_block {
                BlockStart::ToolUse { id, name } => {
                    out.push(Decoded::Event(SessionEvent::ToolStart {
                        id: id.clone(),
                        name: name.clone(),
                    }));
                    self.blocks.insert(
                        index,
                        OpenBlock::ToolUse {
                            id,
                            name,
                            input_json: String::new(),
                        },
                    );
                }
                BlockStart::Thinking => {
                    self.blocks.insert(
                        index,
                        OpenBlock::Thinking {
                            text: String::new(),
                        },
                    );
                    out.push(Decoded::Event(SessionEvent::ThinkingStart));
                }
                BlockStart::Text => {
                    self.blocks.insert(index, OpenBlock::Text);
                }
                BlockStart::Other => {}
            },
            StreamEvent::ContentBlockDelta { index, delta } => match delta {
                BlockDelta::TextDelta { text } => {
                    out.push(Decoded::Event(SessionEvent::Delta { text }));
                }
                BlockDelta::InputJsonDelta { partial_json } => {
                    if let Some(OpenBlock::ToolUse { input_json, .. }) = self.blocks.get_mut(&index)
                    {
                        input_json.push_str(&partial_json);
                    }
                }
                BlockDelta::ThinkingDelta { thinking } => {
                    if let Some(OpenBlock::Thinking { text }) = self.blocks.get_mut(&index) {
                        text.push_str(&thinking);
                        out.push(Decoded::Event(SessionEvent::ThinkingDelta { text: thinking }));
                    }
                }
                BlockDelta::Other => {}
            },
            StreamEvent::ContentBlockStop { index } => match self.blocks.remove(&index) {
                Some(OpenBlock::ToolUse {
                    id,
                    name,
                    input_json,
                }) => {
                    let input = serde_json::from_str(&input_json)
                        .unwrap_or_else(|_| Value::Object(Default::default()));
                    out.push(Decoded::Event(SessionEvent::ToolExecuting { id, name, input }));
                }
                Some(OpenBlock::Thinking { .. }) => {
                    out.push(Decoded::Event(SessionEvent::ThinkingStop));
                }
                Some(OpenBlock::Text) | None => {}
            },
            StreamEvent::Other => {}
        }
    }

    fn on_turn_content(&mut self, content: Value, out: &mut Vec<Decoded>) {
        let Value::Array(items) = content else {
            return;
        };

        for item in items {
            let Ok(TurnContent::ToolResult {
                tool_use_id,
                content,
                is_error,
            }) = TurnContent::deserialize(&item)
            else {
                continue;
            };

            if !self.delivered.insert(tool_use_id.clone()) {
                continue;
            }
            out.push(Decoded::Event(SessionEvent::ToolResult {
                id: tool_use_id,
                content: tool_result_text(&content),
                is_error: is_error.unwrap_or(false),
            }));
        }
    }
}

/// A tool result's display text: the string itself, or the text items of a
/// content list joined by newlines.
pub(crate) fn tool_result_text(content: &Value) -> String {
    match content {
        Value::String(text) => text.clone(),
        Value::Array(items) => items
            .iter()
            .filter(|item| item.get("type").and_then(Value::as_str) == Some("text"))
            .filter_map(|item| item.get("text").and_then(Value::as_str))
            .collect::<Vec<_>>()
            .join("\n"),
        _ => String::new(),
    }
}
