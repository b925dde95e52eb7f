//! Assistant process supervision.
//!
//! Each session owns at most one `claude` child speaking stream-json on its
//! stdio. The child's stdout, stderr and exit are reported to the relay loop
//! as [`ProcessEvent`]s tagged with the session and a spawn generation, so an
//! exit from a superseded process can be told apart from the live one.

use serde_json::{Value, json};
use std::path::PathBuf;
use std::process::{ExitStatus, Stdio};
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::process::Command;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::protocol::{ImageAttachment, SessionId};
use crate::relay::RelayEvent;

/// Output and lifecycle notifications from one assistant process.
#[derive(Debug, Clone, PartialEq)]
pub struct ProcessEvent {
    pub session: SessionId,
    pub generation: u64,
    pub kind: ProcessEventKind,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ProcessEventKind {
    Stdout(Vec<u8>),
    Stderr(String),
    /// `None` when no status could be collected
    Exited(Option<i32>),
}

#[derive(Debug, Clone, PartialEq)]
pub struct LaunchRequest {
    pub session: SessionId,
    pub generation: u64,
    /// Correlation id to pass as `--resume`
    pub resume: Option<String>,
}

/// Starts assistant processes. The relay only talks to this trait so tests
/// can substitute a scripted process.
pub trait Launcher: Send {
    fn launch(
        &self,
        request: LaunchRequest,
        events: mpsc::Sender<RelayEvent>,
    ) -> anyhow::Result<ProcessHandle>;
}

/// Live side of a running assistant process.
#[derive(Debug, Clone)]
pub struct ProcessHandle {
    generation: u64,
    pid: Option<u32>,
    stdin: mpsc::UnboundedSender<String>,
}

impl ProcessHandle {
    pub fn new(generation: u64, pid: Option<u32>, stdin: mpsc::UnboundedSender<String>) -> Self {
        Self {
            generation,
            pid,
            stdin,
        }
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    /// Queue one JSON line for the process's stdin. Returns false once the
    /// writer has gone away.
    pub fn send_line(&self, line: String) -> bool {
        self.stdin.send(line).is_ok()
    }

    /// Ask the assistant to abandon the current turn.
    pub fn interrupt(&self) {
        self.signal(Signal::Interrupt);
    }

    pub fn terminate(&self) {
        self.signal(Signal::Terminate);
    }

    fn signal(&self, sig: Signal) {
        let Some(pid) = self.pid else {
            return;
        };
        #[cfg(unix)]
        {
            use nix::sys::signal::{self, Signal as NixSignal};
            use nix::unistd::Pid;
            let nix_sig = match sig {
                Signal::Interrupt => NixSignal::SIGINT,
                Signal::Terminate => NixSignal::SIGTERM,
            };
            if let Err(e) = signal::kill(Pid::from_raw(pid as i32), nix_sig) {
                debug!("Failed to send {:?} to pid {}: {}", nix_sig, pid, e);
            }
        }
        #[cfg(not(unix))]
        {
            debug!("Signal {:?} for pid {} not supported on this platform", sig, pid);
        }
    }
}

#[derive(Debug, Clone, Copy)]
enum Signal {
    Interrupt,
    Terminate,
}

/// Command line for the assistant: stream-json in both directions with
/// partial messages, resuming a known conversation when there is one.
pub fn assistant_args(resume: Option<&str>, extra_args: &[String]) -> Vec<String> {
    let mut args: Vec<String> = [
        "-p",
        "--verbose",
        "--output-format",
        "stream-json",
        "--input-format",
        "stream-json",
        "--include-partial-messages",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect();

    if let Some(id) = resume {
        args.push("--resume".to_string());
        args.push(id.to_string());
    }
    args.extend(extra_args.iter().cloned());
    args
}

/// Stdin line for a user turn: images first, then the text (if any).
pub fn user_message_line(text: &str, images: &[ImageAttachment]) -> String {
    let mut content: Vec<Value> = images
        .iter()
        .map(|img| {
            json!({
                "type": "image",
                "source": {
                    "type": "base64",
                    "media_type": img.media_type,
                    "data": img.data,
                }
            })
        })
        .collect();

    if !text.is_empty() {
        content.push(json!({"type": "text", "text": text}));
    }

    user_envelope(content)
}

/// Stdin line answering a tool call.
pub fn tool_result_line(tool_use_id: &str, content: &str) -> String {
    user_envelope(vec![json!({
        "type": "tool_result",
        "tool_use_id": tool_use_id,
        "content": content,
    })])
}

fn user_envelope(content: Vec<Value>) -> String {
    json!({
        "type": "user",
        "session_id": "",
        "parent_tool_use_id": null,
        "message": {
            "role": "user",
            "content": content,
        }
    })
    .to_string()
}

/// Launches the real `claude` CLI with tokio::process.
#[derive(Debug, Clone)]
pub struct ClaudeLauncher {
    pub command: String,
    pub extra_args: Vec<String>,
    pub cwd: PathBuf,
}

impl Launcher for ClaudeLauncher {
    fn launch(
        &self,
        request: LaunchRequest,
        events: mpsc::Sender<RelayEvent>,
    ) -> anyhow::Result<ProcessHandle> {
        let args = assistant_args(request.resume.as_deref(), &self.extra_args);
        info!(
            "Spawning {} for session {} (generation {}): {:?}",
            self.command, request.session, request.generation, args
        );

        let mut child = Command::new(&self.command)
            .args(&args)
            .current_dir(&self.cwd)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()?;

        let pid = child.id();
        let (stdin_tx, mut stdin_rx) = mpsc::unbounded_channel::<String>();
        let session = request.session;
        let generation = request.generation;
        let event = move |kind| {
            RelayEvent::Process(ProcessEvent {
                session,
                generation,
                kind,
            })
        };

        if let Some(mut stdin) = child.stdin.take() {
            tokio::spawn(async move {
                while let Some(line) = stdin_rx.recv().await {
                    let mut bytes = line.into_bytes();
                    bytes.push(b'\n');
                    if let Err(e) = stdin.write_all(&bytes).await {
                        warn!("Session {} stdin closed: {}", session, e);
                        break;
                    }
                    if let Err(e) = stdin.flush().await {
                        warn!("Session {} stdin flush failed: {}", session, e);
                        break;
                    }
                }
            });
        }

        if let Some(stderr) = child.stderr.take() {
            let tx = events.clone();
            tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    if tx.send(event(ProcessEventKind::Stderr(line))).await.is_err() {
                        break;
                    }
                }
            });
        }

        let stdout = child.stdout.take();
        tokio::spawn(async move {
            if let Some(mut stdout) = stdout {
                let mut buf = vec![0u8; 8192];
                loop {
                    match stdout.read(&mut buf).await {
                        Ok(0) => break,
                        Ok(n) => {
                            let chunk = ProcessEventKind::Stdout(buf[..n].to_vec());
                            if events.send(event(chunk)).await.is_err() {
                                return;
                            }
                        }
                        Err(e) => {
                            warn!("Session {} stdout read failed: {}", session, e);
                            break;
                        }
                    }
                }
            }

            let code = match child.wait().await {
                Ok(status) => exit_code(status),
                Err(e) => {
                    warn!("Failed to reap assistant for session {}: {}", session, e);
                    None
                }
            };
            info!(
                "Assistant for session {} (generation {}) exited with {:?}",
                session, generation, code
            );
            let _ = events.send(event(ProcessEventKind::Exited(code))).await;
        });

        Ok(ProcessHandle::new(generation, pid, stdin_tx))
    }
}

/// Exit code, or 128 + signal number for a signalled process.
fn exit_code(status: ExitStatus) -> Option<i32> {
    if let Some(code) = status.code() {
        return Some(code);
    }
    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        status.signal().map(|sig| 128 + sig)
    }
    #[cfg(not(unix))]
    {
        None
    }
}
