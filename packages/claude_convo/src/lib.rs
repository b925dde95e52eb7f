//! # Claude Conversations
//!
//! Read-only access to the conversation archive the `claude` CLI keeps under
//! `~/.claude/projects/`.
//!
//! ## Directory Structure
//!
//! ```text
//! ~/.claude/
//! └── projects/
//!     ├── -Users-alice-project1/
//!     │   ├── session-uuid-1.jsonl
//!     │   └── session-uuid-2.jsonl
//!     └── -Users-bob-project2/
//!         └── session-uuid-3.jsonl
//! ```
//!
//! A project folder name is the working directory with every `/` replaced by
//! `-` (see [`encode_cwd`]).
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use claude_convo::ClaudeConvo;
//!
//! let archive = ClaudeConvo::new();
//!
//! for summary in archive.list_sessions("/Users/alice/project1")? {
//!     println!("{} {}", summary.session_id, summary.first_prompt);
//! }
//!
//! let convo = archive.read_conversation("/Users/alice/project1", "session-uuid-1")?;
//! println!("{} messages", convo.message_count());
//! # Ok::<(), claude_convo::ConvoError>(())
//! ```

pub mod error;
pub mod paths;
pub mod reader;
pub mod types;

pub use error::{ConvoError, Result};
pub use paths::{PathResolver, encode_cwd};
pub use reader::{ConversationReader, DEFAULT_SCAN_LINES, FIRST_PROMPT_MAX_CHARS};
pub use types::{
    CliSessionSummary, ContentPart, Conversation, ConversationEntry, Message, MessageContent,
    MessageRole,
};

use tracing::warn;

/// High-level interface over one `.claude` directory.
#[derive(Debug, Clone, Default)]
pub struct ClaudeConvo {
    resolver: PathResolver,
}

impl ClaudeConvo {
    /// Creates a manager rooted at the user's home directory.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a manager with a custom path resolver.
    ///
    /// ```rust
    /// use claude_convo::{ClaudeConvo, PathResolver};
    ///
    /// let resolver = PathResolver::new().with_claude_dir("/custom/.claude");
    /// let archive = ClaudeConvo::with_resolver(resolver);
    /// ```
    pub fn with_resolver(resolver: PathResolver) -> Self {
        Self { resolver }
    }

    pub fn resolver(&self) -> &PathResolver {
        &self.resolver
    }

    /// Summaries of every archived session for a working directory, most
    /// recently active first. Files without a user prompt are left out, and
    /// unreadable files are logged and skipped.
    pub fn list_sessions(&self, cwd: &str) -> Result<Vec<CliSessionSummary>> {
        let mut sessions = Vec::new();
        for path in self.resolver.list_conversation_files(cwd)? {
            match ConversationReader::summarize(&path, DEFAULT_SCAN_LINES) {
                Ok(Some(summary)) => sessions.push(summary),
                Ok(None) => {}
                Err(e) => warn!("Failed to summarize {}: {}", path.display(), e),
            }
        }

        sessions.sort_by(|a, b| b.last_activity.cmp(&a.last_activity));
        Ok(sessions)
    }

    /// Reads a conversation by working directory and session id.
    pub fn read_conversation(&self, cwd: &str, session_id: &str) -> Result<Conversation> {
        let path = self.resolver.conversation_file(cwd, session_id)?;
        ConversationReader::read_conversation(&path)
    }
}
