//! WebSocket Protocol Types
//!
//! Every frame is a JSON object tagged by `type`. Session events are also the
//! records of the per-session append log, so their wire form is their
//! storage form.

use claude_convo::CliSessionSummary;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Local session id, assigned per relay process.
pub type SessionId = u64;

/// Terminal id, assigned per relay process.
pub type TerminalId = u64;

/// A record in a session's history. Delivered live to bound clients and
/// replayed verbatim on switch or reconnect.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SessionEvent {
    /// The user's prompt, with image payloads reduced to a count
    UserMessage {
        text: String,
        #[serde(
            rename = "imageCount",
            default,
            skip_serializing_if = "Option::is_none"
        )]
        image_count: Option<usize>,
    },
    Delta {
        text: String,
    },
    ToolStart {
        id: String,
        name: String,
    },
    ToolExecuting {
        id: String,
        name: String,
        input: Value,
    },
    ToolResult {
        id: String,
        content: String,
        #[serde(default)]
        is_error: bool,
    },
    ThinkingStart,
    ThinkingDelta {
        text: String,
    },
    ThinkingStop,
    Result {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        cost: Option<f64>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        duration: Option<u64>,
        #[serde(
            rename = "sessionId",
            default,
            skip_serializing_if = "Option::is_none"
        )]
        session_id: Option<String>,
    },
    Done {
        code: i32,
    },
    Error {
        text: String,
    },
}

/// One row of a `session_list` message. `active` is computed per recipient.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionListEntry {
    pub id: SessionId,
    pub title: String,
    pub active: bool,
    #[serde(rename = "isProcessing")]
    pub is_processing: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    Processing,
}

/// Relay state notifications that are never persisted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RelayMessage {
    Info {
        cwd: String,
        project: String,
    },
    SlashCommands {
        commands: Vec<String>,
    },
    SessionList {
        sessions: Vec<SessionListEntry>,
    },
    SessionSwitched {
        id: SessionId,
    },
    Status {
        status: SessionStatus,
    },
    Stderr {
        text: String,
    },
    CliSessions {
        sessions: Vec<CliSessionSummary>,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TerminalListEntry {
    pub id: TerminalId,
    pub title: String,
    pub exited: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TerminalMessage {
    TermOutput {
        id: TerminalId,
        data: String,
    },
    TermExited {
        id: TerminalId,
        #[serde(
            rename = "exitCode",
            default,
            skip_serializing_if = "Option::is_none"
        )]
        exit_code: Option<i32>,
    },
    TermClosed {
        id: TerminalId,
    },
    TermList {
        terminals: Vec<TerminalListEntry>,
    },
    TermCreated {
        id: TerminalId,
    },
}

/// Anything the server sends over a client's socket.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum ServerMessage {
    Event(SessionEvent),
    Relay(RelayMessage),
    Terminal(TerminalMessage),
}

impl From<SessionEvent> for ServerMessage {
    fn from(event: SessionEvent) -> Self {
        ServerMessage::Event(event)
    }
}

impl From<RelayMessage> for ServerMessage {
    fn from(msg: RelayMessage) -> Self {
        ServerMessage::Relay(msg)
    }
}

impl From<TerminalMessage> for ServerMessage {
    fn from(msg: TerminalMessage) -> Self {
        ServerMessage::Terminal(msg)
    }
}

/// Image attached to a user message, base64 encoded.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImageAttachment {
    #[serde(rename = "mediaType")]
    pub media_type: String,
    pub data: String,
}

/// Messages sent FROM the client TO the server
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    // === Sessions ===
    NewSession,
    SwitchSession {
        id: SessionId,
    },
    Message {
        #[serde(default)]
        text: Option<String>,
        #[serde(default)]
        images: Vec<ImageAttachment>,
    },
    AskUserResponse {
        #[serde(rename = "toolId")]
        tool_id: String,
        #[serde(default = "empty_object")]
        answers: Value,
    },
    Stop,

    // === Terminals ===
    TermCreate {
        #[serde(default)]
        cols: Option<u16>,
        #[serde(default)]
        rows: Option<u16>,
    },
    TermAttach {
        id: TerminalId,
    },
    TermDetach {
        id: TerminalId,
    },
    TermInput {
        id: TerminalId,
        data: String,
    },
    /// Signed so that non-positive sizes parse and can be ignored
    TermResize {
        id: TerminalId,
        cols: i64,
        rows: i64,
    },
    TermClose {
        id: TerminalId,
    },
    TermRename {
        id: TerminalId,
        title: String,
    },
    TermList,

    // === CLI history ===
    ListCliSessions,
    ResumeCliSession {
        #[serde(rename = "sessionId")]
        session_id: String,
    },
}

fn empty_object() -> Value {
    Value::Object(Default::default())
}
