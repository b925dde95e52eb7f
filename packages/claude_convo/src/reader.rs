use crate::error::{ConvoError, Result};
use crate::types::{CliSessionSummary, Conversation, ConversationEntry};
use chrono::{DateTime, SecondsFormat, Utc};
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::Path;
use tracing::debug;

/// Lines scanned when summarizing a session file.
pub const DEFAULT_SCAN_LINES: usize = 20;

/// Maximum length, in characters, of a summary's first prompt.
pub const FIRST_PROMPT_MAX_CHARS: usize = 100;

pub struct ConversationReader;

impl ConversationReader {
    /// Read a whole conversation file. Lines that are not conversation
    /// entries (malformed JSON, unknown shapes) are skipped.
    pub fn read_conversation<P: AsRef<Path>>(path: P) -> Result<Conversation> {
        let path = path.as_ref();
        if !path.exists() {
            return Err(ConvoError::ConversationNotFound(path.display().to_string()));
        }

        let session_id = session_id_from_path(path)?;
        let reader = BufReader::new(File::open(path)?);
        let mut conversation = Conversation::new(session_id);

        for (line_num, line) in reader.lines().enumerate() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }

            match serde_json::from_str::<ConversationEntry>(&line) {
                Ok(entry) => conversation.add_entry(entry),
                Err(e) => debug!(
                    "Skipping line {} in {}: {}",
                    line_num + 1,
                    path.display(),
                    e
                ),
            }
        }

        Ok(conversation)
    }

    /// Summarize a session file from its first `max_lines` lines.
    ///
    /// Returns `Ok(None)` for a missing file or when no user prompt with text
    /// appears within the window.
    pub fn summarize<P: AsRef<Path>>(
        path: P,
        max_lines: usize,
    ) -> Result<Option<CliSessionSummary>> {
        let path = path.as_ref();
        let file = match File::open(path) {
            Ok(file) => file,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        let last_activity = file
            .metadata()
            .and_then(|m| m.modified())
            .ok()
            .map(|t| DateTime::<Utc>::from(t).to_rfc3339_opts(SecondsFormat::Millis, true));

        let mut summary: Option<CliSessionSummary> = None;
        let mut model: Option<String> = None;

        for line in BufReader::new(file).lines().take(max_lines) {
            let Ok(line) = line else { break };
            let entry = match serde_json::from_str::<ConversationEntry>(&line) {
                Ok(entry) => entry,
                Err(_) => continue,
            };

            if entry.is_assistant() && model.is_none() {
                model = entry.message.as_ref().and_then(|m| m.model.clone());
            }

            if entry.is_user() && summary.is_none() {
                let text = entry.text();
                if text.is_empty() {
                    continue;
                }
                let session_id = match &entry.session_id {
                    Some(id) => id.clone(),
                    None => session_id_from_path(path)?,
                };
                summary = Some(CliSessionSummary {
                    session_id,
                    first_prompt: text.chars().take(FIRST_PROMPT_MAX_CHARS).collect(),
                    model: None,
                    git_branch: entry.git_branch.clone(),
                    start_time: Some(entry.timestamp.clone()).filter(|t| !t.is_empty()),
                    last_activity: last_activity.clone(),
                });
            }
        }

        Ok(summary.map(|s| CliSessionSummary { model, ..s }))
    }
}

fn session_id_from_path(path: &Path) -> Result<String> {
    path.file_stem()
        .and_then(|s| s.to_str())
        .map(str::to_string)
        .ok_or_else(|| ConvoError::InvalidFormat(path.to_path_buf()))
}
