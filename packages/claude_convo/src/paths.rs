use crate::error::{ConvoError, Result};
use std::path::{Path, PathBuf};

/// Encode a working directory the way the CLI names its project folders:
/// every `/` becomes `-`.
pub fn encode_cwd(cwd: &str) -> String {
    cwd.replace('/', "-")
}

/// Resolves locations inside the CLI's `.claude` directory.
///
/// The `.claude` directory can be overridden, which keeps tests away from
/// the real archive.
#[derive(Debug, Clone, Default)]
pub struct PathResolver {
    claude_dir: Option<PathBuf>,
}

impl PathResolver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_claude_dir<P: Into<PathBuf>>(mut self, claude_dir: P) -> Self {
        self.claude_dir = Some(claude_dir.into());
        self
    }

    pub fn claude_dir(&self) -> Result<PathBuf> {
        match &self.claude_dir {
            Some(dir) => Ok(dir.clone()),
            None => Ok(dirs::home_dir()
                .ok_or(ConvoError::NoHomeDir)?
                .join(".claude")),
        }
    }

    pub fn projects_dir(&self) -> Result<PathBuf> {
        Ok(self.claude_dir()?.join("projects"))
    }

    /// `~/.claude/projects/<encoded cwd>`
    pub fn project_dir(&self, cwd: &str) -> Result<PathBuf> {
        Ok(self.projects_dir()?.join(encode_cwd(cwd)))
    }

    /// Path of one archived conversation. Session ids come from clients, so
    /// anything that could escape the project directory is rejected.
    pub fn conversation_file(&self, cwd: &str, session_id: &str) -> Result<PathBuf> {
        if !is_valid_session_id(session_id) {
            return Err(ConvoError::InvalidSessionId(session_id.to_string()));
        }
        Ok(self.project_dir(cwd)?.join(format!("{}.jsonl", session_id)))
    }

    /// All `*.jsonl` regular files in the project directory. A missing
    /// directory yields an empty list.
    pub fn list_conversation_files(&self, cwd: &str) -> Result<Vec<PathBuf>> {
        let dir = self.project_dir(cwd)?;
        if !dir.is_dir() {
            return Ok(Vec::new());
        }

        let mut files = Vec::new();
        for entry in std::fs::read_dir(&dir)? {
            let entry = entry?;
            if !entry.file_type()?.is_file() {
                continue;
            }
            let path = entry.path();
            if has_jsonl_extension(&path) {
                files.push(path);
            }
        }
        files.sort();
        Ok(files)
    }
}

fn has_jsonl_extension(path: &Path) -> bool {
    path.extension().and_then(|e| e.to_str()) == Some("jsonl")
}

fn is_valid_session_id(id: &str) -> bool {
    !id.is_empty()
        && id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
}
