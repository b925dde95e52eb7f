use anyhow::Context;
use portable_pty::{ChildKiller, CommandBuilder, MasterPty, PtySize, native_pty_system};
use std::io::{Read, Write};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use crate::error::PtyError;

/// Unique identifier for a PTY session
#[derive(Clone, Copy, Debug, Hash, Eq, PartialEq, Ord, PartialOrd)]
pub struct PtyId(pub u64);

impl std::fmt::Display for PtyId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "pty-{}", self.0)
    }
}

/// Events emitted by a running PTY.
///
/// Output for one PTY is always delivered before its `Exited` event.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum PtyEvent {
    /// Output from a PTY
    Output { id: PtyId, data: Vec<u8> },
    /// PTY process exited
    Exited { id: PtyId, exit_code: Option<i32> },
}

/// Configuration for spawning a PTY
#[derive(Clone, Debug)]
pub struct PtyConfig {
    pub command: String,
    pub args: Vec<String>,
    pub working_dir: Option<String>,
    pub env: Vec<(String, String)>,
    pub rows: u16,
    pub cols: u16,
}

impl Default for PtyConfig {
    fn default() -> Self {
        Self {
            command: "/bin/bash".to_string(),
            args: Vec::new(),
            working_dir: None,
            env: Vec::new(),
            rows: 24,
            cols: 80,
        }
    }
}

/// Messages that can be sent to the PTY actor
pub(crate) enum PtyMessage {
    WriteInput { data: Vec<u8> },
    Resize { rows: u16, cols: u16 },
    Kill,
}

/// Handle to communicate with a PTY actor.
///
/// Commands are queued without waiting for the actor, so callers running an
/// event loop never block on terminal I/O. Commands sent to one handle are
/// applied in order.
#[derive(Clone, Debug)]
pub struct PtyHandle {
    id: PtyId,
    pid: Option<u32>,
    sender: mpsc::UnboundedSender<PtyMessage>,
}

impl std::fmt::Debug for PtyMessage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PtyMessage::WriteInput { data } => write!(f, "WriteInput({} bytes)", data.len()),
            PtyMessage::Resize { rows, cols } => write!(f, "Resize({}x{})", cols, rows),
            PtyMessage::Kill => write!(f, "Kill"),
        }
    }
}

impl PtyHandle {
    pub fn id(&self) -> PtyId {
        self.id
    }

    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    /// Queue data for the PTY's input
    pub fn write(&self, data: &[u8]) -> Result<(), PtyError> {
        self.sender
            .send(PtyMessage::WriteInput {
                data: data.to_vec(),
            })
            .map_err(|_| PtyError::ProcessExited)
    }

    /// Queue a string for the PTY's input
    pub fn write_str(&self, text: &str) -> Result<(), PtyError> {
        self.write(text.as_bytes())
    }

    /// Resize the PTY
    pub fn resize(&self, rows: u16, cols: u16) -> Result<(), PtyError> {
        self.sender
            .send(PtyMessage::Resize { rows, cols })
            .map_err(|_| PtyError::ProcessExited)
    }

    /// Force-kill the PTY process. The actor stops after handling this.
    pub fn kill(&self) -> Result<(), PtyError> {
        self.sender
            .send(PtyMessage::Kill)
            .map_err(|_| PtyError::ProcessExited)
    }
}

/// The PTY actor that manages a single PTY session
pub struct PtyActor {
    master: Box<dyn MasterPty + Send>,
    writer: Option<Box<dyn Write + Send>>,
    killer: Box<dyn ChildKiller + Send + Sync>,
    command: String,
    pid: Option<u32>,
    receiver: mpsc::UnboundedReceiver<PtyMessage>,
}

impl PtyActor {
    /// Spawn a new PTY and return a handle to it.
    ///
    /// Output and the final exit notification are pushed into `events` from a
    /// dedicated reader thread. The channel is bounded, so a slow consumer
    /// pauses reading from the PTY instead of buffering without limit.
    pub fn spawn<E>(
        id: PtyId,
        config: PtyConfig,
        events: mpsc::Sender<E>,
    ) -> Result<PtyHandle, PtyError>
    where
        E: From<PtyEvent> + Send + 'static,
    {
        let pty_system = native_pty_system();

        let pair = pty_system
            .openpty(PtySize {
                rows: config.rows,
                cols: config.cols,
                pixel_width: 0,
                pixel_height: 0,
            })
            .context("Failed to open PTY")?;

        let mut cmd = CommandBuilder::new(&config.command);
        for arg in &config.args {
            cmd.arg(arg);
        }

        if let Some(dir) = &config.working_dir {
            debug!("Setting working directory: {}", dir);
            cmd.cwd(dir);
        }

        // Set environment for proper terminal behavior
        cmd.env("TERM", "xterm-256color");
        cmd.env("COLORTERM", "truecolor");

        for (key, value) in &config.env {
            cmd.env(key, value);
        }

        info!(
            "Spawning {} command: {} with args: {:?}",
            id, config.command, config.args
        );

        let mut child = pair.slave.spawn_command(cmd).map_err(|e| {
            error!("Failed to spawn command '{}': {}", config.command, e);
            PtyError::CreateFailed(e.to_string())
        })?;
        // The slave side must close in this process so EOF reaches the reader
        drop(pair.slave);

        let pid = child.process_id();
        debug!("{} started with PID: {:?}", id, pid);

        let killer = child.clone_killer();
        let mut reader = pair
            .master
            .try_clone_reader()
            .context("Failed to clone PTY reader")?;

        let (msg_tx, msg_rx) = mpsc::unbounded_channel();

        let actor = Self {
            master: pair.master,
            writer: None,
            killer,
            command: config.command.clone(),
            pid,
            receiver: msg_rx,
        };

        // Blocking reader thread: owns the child so it can reap the exit status
        // after the output stream ends.
        std::thread::spawn(move || {
            let mut buffer = vec![0u8; 4096];
            loop {
                match reader.read(&mut buffer) {
                    Ok(0) => {
                        debug!("{} EOF detected", id);
                        break;
                    }
                    Ok(n) => {
                        let event = PtyEvent::Output {
                            id,
                            data: buffer[..n].to_vec(),
                        };
                        if events.blocking_send(E::from(event)).is_err() {
                            debug!("{} event receiver dropped, reader exiting", id);
                            return;
                        }
                    }
                    Err(e) => {
                        // EIO is how Linux reports a closed PTY
                        debug!("{} read ended: {}", id, e);
                        break;
                    }
                }
            }

            let exit_code = match child.wait() {
                Ok(status) => Some(status.exit_code() as i32),
                Err(e) => {
                    warn!("Failed to reap {}: {}", id, e);
                    None
                }
            };
            info!("{} exited with code {:?}", id, exit_code);
            let _ = events.blocking_send(E::from(PtyEvent::Exited { id, exit_code }));
        });

        tokio::spawn(async move {
            actor.run(id).await;
        });

        Ok(PtyHandle {
            id,
            pid,
            sender: msg_tx,
        })
    }

    async fn run(mut self, id: PtyId) {
        debug!(
            "{} actor started for command: {} with PID: {:?}",
            id, self.command, self.pid
        );

        // Take the writer immediately to keep the PTY stdin open
        match self.master.take_writer() {
            Ok(writer) => self.writer = Some(writer),
            Err(e) => error!("Failed to get PTY writer for {}: {}", id, e),
        }

        while let Some(msg) = self.receiver.recv().await {
            match msg {
                PtyMessage::WriteInput { data } => {
                    if let Err(e) = self.handle_write_input(&data) {
                        warn!("{}: {}", id, e);
                    }
                }
                PtyMessage::Resize { rows, cols } => {
                    if let Err(e) = self.handle_resize(rows, cols) {
                        warn!("{}: {}", id, e);
                    }
                }
                PtyMessage::Kill => {
                    if let Err(e) = self.handle_kill() {
                        warn!("{}: {}", id, e);
                    }
                    break;
                }
            }
        }

        debug!("{} actor shutting down", id);
    }

    fn handle_write_input(&mut self, data: &[u8]) -> Result<(), PtyError> {
        let writer = self
            .writer
            .as_mut()
            .ok_or_else(|| PtyError::WriteFailed("No PTY writer available".into()))?;

        writer
            .write_all(data)
            .map_err(|e| PtyError::WriteFailed(e.to_string()))?;
        writer
            .flush()
            .map_err(|e| PtyError::WriteFailed(e.to_string()))?;

        Ok(())
    }

    fn handle_resize(&mut self, rows: u16, cols: u16) -> Result<(), PtyError> {
        self.master
            .resize(PtySize {
                rows,
                cols,
                pixel_width: 0,
                pixel_height: 0,
            })
            .map_err(|e| PtyError::ResizeFailed(e.to_string()))?;
        Ok(())
    }

    fn handle_kill(&mut self) -> Result<(), PtyError> {
        self.killer
            .kill()
            .map_err(|e| PtyError::KillFailed(e.to_string()))
    }
}
