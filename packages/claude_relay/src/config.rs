use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::info;

// =============================================================================
// Tunable config (figment-deserialized from defaults / config.toml / env vars)
// =============================================================================
//
// Three equivalent ways to configure:
//
//   config.toml:     [terminal]
//                    max_terminals = 4
//
//   env var:         RELAY_TERMINAL__MAX_TERMINALS=4   (double underscore = nesting)
//
//   (single underscore stays within field names: RELAY_SERVER__PUBLIC_DIR)

/// Top-level tunable configuration, deserialized by figment.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct FileConfig {
    #[serde(default)]
    pub server: ServerFileConfig,
    #[serde(default)]
    pub assistant: AssistantFileConfig,
    #[serde(default)]
    pub terminal: TerminalFileConfig,
}

/// HTTP listener settings (lives under `[server]` in config.toml).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ServerFileConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    /// Directory served for any path that is not an API route
    #[serde(default)]
    pub public_dir: Option<PathBuf>,
}

impl Default for ServerFileConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            public_dir: None,
        }
    }
}

/// How the assistant process is launched (lives under `[assistant]`).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct AssistantFileConfig {
    #[serde(default = "default_assistant_command")]
    pub command: String,
    /// Appended after the stream-json flags and `--resume`
    #[serde(default)]
    pub extra_args: Vec<String>,
}

impl Default for AssistantFileConfig {
    fn default() -> Self {
        Self {
            command: default_assistant_command(),
            extra_args: Vec::new(),
        }
    }
}

/// Terminal multiplexer limits (lives under `[terminal]`).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TerminalFileConfig {
    #[serde(default = "default_max_terminals")]
    pub max_terminals: usize,
    #[serde(default = "default_scrollback_kb")]
    pub scrollback_kb: usize,
    /// Falls back to `$SHELL`, then `/bin/bash`
    #[serde(default)]
    pub shell: Option<String>,
}

impl Default for TerminalFileConfig {
    fn default() -> Self {
        Self {
            max_terminals: default_max_terminals(),
            scrollback_kb: default_scrollback_kb(),
            shell: None,
        }
    }
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}
fn default_port() -> u16 {
    3456
}
fn default_assistant_command() -> String {
    "claude".to_string()
}
fn default_max_terminals() -> usize {
    10
}
fn default_scrollback_kb() -> usize {
    50
}

/// Build a figment that layers: defaults → config.toml → RELAY_* env vars.
///
/// Env vars use double-underscore for nesting into sections:
///   `RELAY_SERVER__PORT=8080`  →  `server.port = 8080`
///   `RELAY_ASSISTANT__COMMAND=/opt/claude`  →  `assistant.command = "/opt/claude"`
pub fn load_config(data_dir: &Path) -> figment::Figment {
    use figment::{
        Figment,
        providers::{Env, Format, Serialized, Toml},
    };

    Figment::from(Serialized::defaults(FileConfig::default()))
        .merge(Toml::file(data_dir.join("config.toml")))
        .merge(Env::prefixed("RELAY_").split("__"))
}

// =============================================================================
// Runtime config structs (derived from FileConfig)
// =============================================================================

/// Terminal multiplexer configuration (runtime view).
#[derive(Clone, Debug)]
pub struct TerminalConfig {
    pub max_terminals: usize,
    pub scrollback_bytes: usize,
    pub shell: String,
}

impl TerminalConfig {
    pub fn from_file(fc: &TerminalFileConfig) -> Self {
        let shell = fc
            .shell
            .clone()
            .filter(|s| !s.is_empty())
            .or_else(|| std::env::var("SHELL").ok().filter(|s| !s.is_empty()))
            .unwrap_or_else(|| "/bin/bash".to_string());
        Self {
            max_terminals: fc.max_terminals,
            scrollback_bytes: fc.scrollback_kb * 1024,
            shell,
        }
    }
}

impl Default for TerminalConfig {
    fn default() -> Self {
        Self::from_file(&TerminalFileConfig::default())
    }
}

// =============================================================================
// Directory layout (derived from --cwd / --data-dir, not tunable via figment)
// =============================================================================

#[derive(Clone, Debug)]
pub struct RelayConfig {
    /// Working directory the assistant and terminals run in
    pub cwd: PathBuf,
    /// Last path component of `cwd`, shown as the project name
    pub project: String,
    pub data_dir: PathBuf,
    pub sessions_dir: PathBuf,
}

impl RelayConfig {
    pub fn new(cwd: Option<PathBuf>, custom_data_dir: Option<PathBuf>) -> Result<Self> {
        let cwd = match cwd {
            Some(dir) => dir,
            None => std::env::current_dir().context("Failed to read current directory")?,
        };
        let cwd = cwd
            .canonicalize()
            .with_context(|| format!("Working directory does not exist: {:?}", cwd))?;

        let data_dir = custom_data_dir.unwrap_or_else(|| cwd.join(".claude-relay"));

        let sessions_dir = data_dir.join("sessions");
        std::fs::create_dir_all(&sessions_dir)
            .with_context(|| format!("Failed to create sessions directory: {:?}", sessions_dir))?;

        let project = cwd
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| cwd.display().to_string());

        info!("Data directory: {}", data_dir.display());

        Ok(Self {
            cwd,
            project,
            data_dir,
            sessions_dir,
        })
    }

    pub fn config_toml_path(&self) -> PathBuf {
        self.data_dir.join("config.toml")
    }

    pub fn cwd_str(&self) -> String {
        self.cwd.display().to_string()
    }
}
