//! Per-session append log.
//!
//! One file per correlation id under the sessions directory:
//!
//! ```text
//! {"type":"meta","localId":1,"cliSessionId":"…","title":"…","createdAt":1700000000000}
//! {"type":"user_message","text":"hi"}
//! {"type":"delta","text":"H"}
//! …
//! ```

use serde::{Deserialize, Serialize};
use std::fs::{self, File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{debug, warn};

use crate::protocol::SessionEvent;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("session log I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("session log encoding error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("refusing to store session under id {0:?}")]
    InvalidId(String),
}

/// Header line of a session file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionMeta {
    pub local_id: u64,
    pub cli_session_id: String,
    #[serde(default)]
    pub title: String,
    /// Epoch milliseconds
    #[serde(default)]
    pub created_at: i64,
}

#[derive(Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum HeaderLine {
    Meta(SessionMeta),
}

/// A session read back from disk.
#[derive(Debug, Clone, PartialEq)]
pub struct LoadedSession {
    pub meta: SessionMeta,
    pub history: Vec<SessionEvent>,
}

#[derive(Debug, Clone)]
pub struct SessionStore {
    dir: PathBuf,
}

impl SessionStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// File backing a correlation id. The id comes from the child process,
    /// so it must stay a single path component.
    pub fn path_for(&self, cli_session_id: &str) -> Result<PathBuf, StoreError> {
        let valid = !cli_session_id.is_empty()
            && cli_session_id != "."
            && cli_session_id != ".."
            && !cli_session_id.contains(['/', '\\', '\0']);
        if !valid {
            return Err(StoreError::InvalidId(cli_session_id.to_string()));
        }
        Ok(self.dir.join(format!("{}.jsonl", cli_session_id)))
    }

    /// Rewrite the whole file: meta header followed by every history record.
    /// Written to a sibling temp file first and renamed into place.
    pub fn write_snapshot(
        &self,
        meta: &SessionMeta,
        history: &[SessionEvent],
    ) -> Result<(), StoreError> {
        let path = self.path_for(&meta.cli_session_id)?;
        let tmp = path.with_extension("jsonl.tmp");

        {
            let mut out = BufWriter::new(File::create(&tmp)?);
            serde_json::to_writer(&mut out, &HeaderLine::Meta(meta.clone()))?;
            out.write_all(b"\n")?;
            for event in history {
                serde_json::to_writer(&mut out, event)?;
                out.write_all(b"\n")?;
            }
            out.flush()?;
        }

        fs::rename(&tmp, &path)?;
        debug!(
            "Wrote snapshot for {} ({} records)",
            meta.cli_session_id,
            history.len()
        );
        Ok(())
    }

    /// Append one record to an existing session file.
    pub fn append(&self, cli_session_id: &str, event: &SessionEvent) -> Result<(), StoreError> {
        let path = self.path_for(cli_session_id)?;
        let mut line = serde_json::to_vec(event)?;
        line.push(b'\n');

        let mut file = OpenOptions::new().create(true).append(true).open(path)?;
        file.write_all(&line)?;
        Ok(())
    }

    /// Load every persisted session, oldest `createdAt` first.
    ///
    /// Files without a valid meta header (or with an empty correlation id)
    /// are skipped whole; malformed history lines are skipped one by one.
    pub fn load_all(&self) -> Result<Vec<LoadedSession>, StoreError> {
        if !self.dir.is_dir() {
            return Ok(Vec::new());
        }

        let mut loaded = Vec::new();
        for entry in fs::read_dir(&self.dir)? {
            let path = entry?.path();
            if path.extension().and_then(|e| e.to_str()) != Some("jsonl") {
                continue;
            }

            let content = match fs::read_to_string(&path) {
                Ok(content) => content,
                Err(e) => {
                    warn!("Skipping unreadable session file {}: {}", path.display(), e);
                    continue;
                }
            };

            match parse_session_file(&content) {
                Some(session) => loaded.push(session),
                None => debug!("Skipping {}: no valid meta header", path.display()),
            }
        }

        loaded.sort_by_key(|s| s.meta.created_at);
        Ok(loaded)
    }
}

fn parse_session_file(content: &str) -> Option<LoadedSession> {
    let mut lines = content.lines().filter(|l| !l.trim().is_empty());

    let HeaderLine::Meta(meta) = serde_json::from_str(lines.next()?).ok()?;
    if meta.cli_session_id.is_empty() {
        return None;
    }

    let history = lines
        .filter_map(|line| match serde_json::from_str::<SessionEvent>(line) {
            Ok(event) => Some(event),
            Err(e) => {
                debug!("Skipping malformed history line: {}", e);
                None
            }
        })
        .collect();

    Some(LoadedSession { meta, history })
}
