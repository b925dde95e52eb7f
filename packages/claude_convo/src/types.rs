use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;

/// One line of an archived conversation file.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConversationEntry {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parent_uuid: Option<String>,

    #[serde(default)]
    pub is_sidechain: bool,

    #[serde(rename = "type")]
    pub entry_type: String,

    #[serde(default)]
    pub uuid: String,

    #[serde(default)]
    pub timestamp: String,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub cwd: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub git_branch: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<Message>,

    #[serde(flatten)]
    pub extra: HashMap<String, Value>,
}

impl ConversationEntry {
    pub fn is_user(&self) -> bool {
        self.entry_type == "user"
    }

    pub fn is_assistant(&self) -> bool {
        self.entry_type == "assistant"
    }

    /// Text of the entry's message, empty when there is none.
    pub fn text(&self) -> String {
        self.message
            .as_ref()
            .and_then(|m| m.content.as_ref())
            .map(MessageContent::text)
            .unwrap_or_default()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    pub role: MessageRole,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub content: Option<MessageContent>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub stop_reason: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MessageContent {
    Text(String),
    Parts(Vec<ContentPart>),
}

impl MessageContent {
    /// Plain text of the content: the string itself, or the concatenated
    /// `text` parts. Images, tool calls and tool results contribute nothing.
    pub fn text(&self) -> String {
        match self {
            MessageContent::Text(text) => text.clone(),
            MessageContent::Parts(parts) => parts
                .iter()
                .filter_map(|part| match part {
                    ContentPart::Text { text } => Some(text.as_str()),
                    _ => None,
                })
                .collect(),
        }
    }

    pub fn parts(&self) -> &[ContentPart] {
        match self {
            MessageContent::Text(_) => &[],
            MessageContent::Parts(parts) => parts,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentPart {
    Text {
        text: String,
    },
    Thinking {
        thinking: String,
        #[serde(default)]
        signature: Option<String>,
    },
    ToolUse {
        id: String,
        name: String,
        #[serde(default)]
        input: Value,
    },
    ToolResult {
        tool_use_id: String,
        /// Either a string or a list of content blocks
        #[serde(default)]
        content: Value,
        #[serde(default)]
        is_error: bool,
    },
    Image {
        #[serde(default)]
        source: Value,
    },
    /// Catch-all for unknown content types (documents, ...)
    #[serde(other)]
    Unknown,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Copy)]
#[serde(rename_all = "lowercase")]
pub enum MessageRole {
    User,
    Assistant,
    System,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Conversation {
    pub session_id: String,
    pub project_path: Option<String>,
    pub entries: Vec<ConversationEntry>,
    pub started_at: Option<DateTime<Utc>>,
    pub last_activity: Option<DateTime<Utc>>,
}

impl Conversation {
    pub fn new(session_id: String) -> Self {
        Self {
            session_id,
            project_path: None,
            entries: Vec::new(),
            started_at: None,
            last_activity: None,
        }
    }

    pub fn add_entry(&mut self, entry: ConversationEntry) {
        if let Ok(timestamp) = entry.timestamp.parse::<DateTime<Utc>>() {
            if self.started_at.is_none() || Some(timestamp) < self.started_at {
                self.started_at = Some(timestamp);
            }
            if self.last_activity.is_none() || Some(timestamp) > self.last_activity {
                self.last_activity = Some(timestamp);
            }
        }

        if self.project_path.is_none() {
            self.project_path = entry.cwd.clone();
        }

        self.entries.push(entry);
    }

    /// Entries that carry a message, in file order.
    pub fn messages(&self) -> impl Iterator<Item = (&ConversationEntry, &Message)> {
        self.entries
            .iter()
            .filter_map(|e| e.message.as_ref().map(|m| (e, m)))
    }

    pub fn message_count(&self) -> usize {
        self.messages().count()
    }

    /// First user prompt with non-empty text.
    pub fn first_prompt(&self) -> Option<String> {
        self.entries
            .iter()
            .filter(|e| e.is_user())
            .map(ConversationEntry::text)
            .find(|t| !t.is_empty())
    }
}

/// Listing row for one archived CLI session, sent to clients as-is.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CliSessionSummary {
    pub session_id: String,
    pub first_prompt: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub git_branch: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub start_time: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_activity: Option<String>,
}
