//! Terminal multiplexer.
//!
//! Shell PTYs shared by any number of subscribed clients. Output is decoded
//! as a UTF-8 stream, kept in a byte-capped scrollback and fanned out to the
//! subscribers. Nothing here is persisted.

use pty_manager::{PtyActor, PtyConfig, PtyError, PtyHandle, PtyId, Scrollback};
use std::collections::{BTreeMap, BTreeSet};
use std::path::PathBuf;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::clients::{ClientId, ClientRegistry};
use crate::config::TerminalConfig;
use crate::protocol::{TerminalId, TerminalListEntry, TerminalMessage};
use crate::relay::RelayEvent;

const DEFAULT_COLS: u16 = 80;
const DEFAULT_ROWS: u16 = 24;
const MAX_TITLE_CHARS: usize = 50;

/// A running PTY as the multiplexer sees it.
pub trait TerminalPty: Send {
    fn write(&self, data: &[u8]) -> Result<(), PtyError>;
    fn resize(&self, rows: u16, cols: u16) -> Result<(), PtyError>;
    fn kill(&self) -> Result<(), PtyError>;
}

impl TerminalPty for PtyHandle {
    fn write(&self, data: &[u8]) -> Result<(), PtyError> {
        PtyHandle::write(self, data)
    }

    fn resize(&self, rows: u16, cols: u16) -> Result<(), PtyError> {
        PtyHandle::resize(self, rows, cols)
    }

    fn kill(&self) -> Result<(), PtyError> {
        PtyHandle::kill(self)
    }
}

/// Spawns PTYs. Output and exit must arrive on `events` as
/// [`pty_manager::PtyEvent`]s carrying `PtyId(id)`.
pub trait PtyBackend: Send {
    fn spawn(
        &self,
        id: TerminalId,
        cols: u16,
        rows: u16,
        events: mpsc::Sender<RelayEvent>,
    ) -> Result<Box<dyn TerminalPty>, PtyError>;
}

/// Login shell in the relay's working directory.
#[derive(Debug, Clone)]
pub struct ShellBackend {
    pub shell: String,
    pub cwd: PathBuf,
}

impl PtyBackend for ShellBackend {
    fn spawn(
        &self,
        id: TerminalId,
        cols: u16,
        rows: u16,
        events: mpsc::Sender<RelayEvent>,
    ) -> Result<Box<dyn TerminalPty>, PtyError> {
        let config = PtyConfig {
            command: self.shell.clone(),
            args: vec!["-l".to_string()],
            working_dir: Some(self.cwd.display().to_string()),
            env: Vec::new(),
            rows,
            cols,
        };
        let handle = PtyActor::spawn(PtyId(id), config, events)?;
        Ok(Box::new(handle))
    }
}

/// Streaming UTF-8 decoder. Holds an incomplete trailing sequence until the
/// next chunk completes it; invalid bytes become U+FFFD.
#[derive(Debug, Default)]
pub(crate) struct Utf8StreamDecoder {
    buf: Vec<u8>,
}

impl Utf8StreamDecoder {
    pub fn decode(&mut self, chunk: &[u8]) -> String {
        self.buf.extend_from_slice(chunk);
        let mut out = String::new();

        loop {
            match std::str::from_utf8(&self.buf) {
                Ok(s) => {
                    out.push_str(s);
                    self.buf.clear();
                    break;
                }
                Err(e) => {
                    let valid = e.valid_up_to();
                    out.push_str(&String::from_utf8_lossy(&self.buf[..valid]));
                    match e.error_len() {
                        None => {
                            self.buf.drain(..valid);
                            break;
                        }
                        Some(len) => {
                            out.push('\u{FFFD}');
                            self.buf.drain(..valid + len);
                        }
                    }
                }
            }
        }

        out
    }
}

struct Terminal {
    title: String,
    pty: Option<Box<dyn TerminalPty>>,
    scrollback: Scrollback<String>,
    decoder: Utf8StreamDecoder,
    cols: u16,
    rows: u16,
    exited: bool,
    exit_code: Option<i32>,
    subscribers: BTreeSet<ClientId>,
}

impl Terminal {
    fn send(&self, clients: &ClientRegistry, msg: TerminalMessage) {
        for client in &self.subscribers {
            clients.send_to(*client, msg.clone());
        }
    }
}

pub struct TerminalManager {
    config: TerminalConfig,
    backend: Box<dyn PtyBackend>,
    events: mpsc::Sender<RelayEvent>,
    terminals: BTreeMap<TerminalId, Terminal>,
    next_id: TerminalId,
}

impl TerminalManager {
    pub fn new(
        config: TerminalConfig,
        backend: Box<dyn PtyBackend>,
        events: mpsc::Sender<RelayEvent>,
    ) -> Self {
        Self {
            config,
            backend,
            events,
            terminals: BTreeMap::new(),
            next_id: 1,
        }
    }

    pub fn len(&self) -> usize {
        self.terminals.len()
    }

    pub fn is_empty(&self) -> bool {
        self.terminals.is_empty()
    }

    /// Start a terminal for `requester`. On success the requester gets
    /// `term_created`, is attached, and everyone gets the new list. At the
    /// ceiling or on spawn failure nothing is sent.
    pub fn create(
        &mut self,
        clients: &ClientRegistry,
        requester: ClientId,
        cols: Option<u16>,
        rows: Option<u16>,
    ) -> Option<TerminalId> {
        if self.terminals.len() >= self.config.max_terminals {
            debug!(
                "Refusing terminal for client {}: {} already open",
                requester,
                self.terminals.len()
            );
            return None;
        }

        let cols = cols.filter(|c| *c > 0).unwrap_or(DEFAULT_COLS);
        let rows = rows.filter(|r| *r > 0).unwrap_or(DEFAULT_ROWS);
        let id = self.next_id;

        let pty = match self.backend.spawn(id, cols, rows, self.events.clone()) {
            Ok(pty) => pty,
            Err(e) => {
                warn!("Failed to start terminal {}: {}", id, e);
                return None;
            }
        };
        self.next_id += 1;

        info!("Terminal {} started ({}x{})", id, cols, rows);
        self.terminals.insert(
            id,
            Terminal {
                title: format!("Terminal {}", id),
                pty: Some(pty),
                scrollback: Scrollback::new(self.config.scrollback_bytes),
                decoder: Utf8StreamDecoder::default(),
                cols,
                rows,
                exited: false,
                exit_code: None,
                subscribers: BTreeSet::new(),
            },
        );

        clients.send_to(requester, TerminalMessage::TermCreated { id });
        self.attach(clients, requester, id);
        self.broadcast_list(clients);
        Some(id)
    }

    /// Subscribe a client and replay the scrollback as one `term_output`,
    /// followed by `term_exited` when the shell is already gone.
    pub fn attach(&mut self, clients: &ClientRegistry, client: ClientId, id: TerminalId) {
        let Some(term) = self.terminals.get_mut(&id) else {
            debug!("Attach to unknown terminal {}", id);
            return;
        };
        term.subscribers.insert(client);

        if !term.scrollback.is_empty() {
            clients.send_to(
                client,
                TerminalMessage::TermOutput {
                    id,
                    data: term.scrollback.concat(),
                },
            );
        }
        if term.exited {
            clients.send_to(
                client,
                TerminalMessage::TermExited {
                    id,
                    exit_code: term.exit_code,
                },
            );
        }
    }

    pub fn detach(&mut self, client: ClientId, id: TerminalId) {
        if let Some(term) = self.terminals.get_mut(&id) {
            term.subscribers.remove(&client);
        }
    }

    /// Drop a client from every terminal (disconnect).
    pub fn detach_all(&mut self, client: ClientId) {
        for term in self.terminals.values_mut() {
            term.subscribers.remove(&client);
        }
    }

    pub fn write(&self, id: TerminalId, data: &str) {
        let Some(pty) = self.terminals.get(&id).and_then(|t| t.pty.as_ref()) else {
            return;
        };
        if let Err(e) = pty.write(data.as_bytes()) {
            debug!("Terminal {} write dropped: {}", id, e);
        }
    }

    /// Non-positive sizes and terminals without a PTY are ignored.
    pub fn resize(&mut self, id: TerminalId, cols: i64, rows: i64) {
        if cols <= 0 || rows <= 0 {
            return;
        }
        let Some(term) = self.terminals.get_mut(&id) else {
            return;
        };
        let Some(pty) = term.pty.as_ref() else {
            return;
        };

        let cols = u16::try_from(cols).unwrap_or(u16::MAX);
        let rows = u16::try_from(rows).unwrap_or(u16::MAX);
        if let Err(e) = pty.resize(rows, cols) {
            debug!("Terminal {} resize failed: {}", id, e);
            return;
        }
        if (term.cols, term.rows) != (cols, rows) {
            debug!(
                "Terminal {} resized {}x{} -> {}x{}",
                id, term.cols, term.rows, cols, rows
            );
        }
        term.cols = cols;
        term.rows = rows;
    }

    pub fn close(&mut self, clients: &ClientRegistry, id: TerminalId) {
        let Some(term) = self.terminals.remove(&id) else {
            return;
        };
        if let Some(pty) = &term.pty {
            if let Err(e) = pty.kill() {
                debug!("Terminal {} kill failed: {}", id, e);
            }
        }
        info!("Terminal {} closed", id);
        term.send(clients, TerminalMessage::TermClosed { id });
        self.broadcast_list(clients);
    }

    pub fn rename(&mut self, clients: &ClientRegistry, id: TerminalId, title: &str) {
        let Some(term) = self.terminals.get_mut(&id) else {
            return;
        };
        term.title = title.chars().take(MAX_TITLE_CHARS).collect();
        self.broadcast_list(clients);
    }

    pub fn list(&self) -> Vec<TerminalListEntry> {
        self.terminals
            .iter()
            .map(|(id, t)| TerminalListEntry {
                id: *id,
                title: t.title.clone(),
                exited: t.exited,
            })
            .collect()
    }

    pub fn list_message(&self) -> TerminalMessage {
        TerminalMessage::TermList {
            terminals: self.list(),
        }
    }

    pub fn broadcast_list(&self, clients: &ClientRegistry) {
        clients.broadcast(self.list_message());
    }

    /// Kill every PTY and forget all terminals (shutdown).
    pub fn destroy_all(&mut self) {
        for (id, term) in std::mem::take(&mut self.terminals) {
            if let Some(pty) = term.pty {
                if let Err(e) = pty.kill() {
                    debug!("Terminal {} kill failed: {}", id, e);
                }
            }
        }
    }

    pub fn on_output(&mut self, clients: &ClientRegistry, id: TerminalId, bytes: &[u8]) {
        let Some(term) = self.terminals.get_mut(&id) else {
            return;
        };
        let data = term.decoder.decode(bytes);
        if data.is_empty() {
            return;
        }
        term.scrollback.push(data.clone());
        term.send(clients, TerminalMessage::TermOutput { id, data });
    }

    pub fn on_exit(&mut self, clients: &ClientRegistry, id: TerminalId, exit_code: Option<i32>) {
        let Some(term) = self.terminals.get_mut(&id) else {
            return;
        };
        info!("Terminal {} exited with {:?}", id, exit_code);
        term.exited = true;
        term.exit_code = exit_code;
        term.pty = None;
        term.send(clients, TerminalMessage::TermExited { id, exit_code });
        self.broadcast_list(clients);
    }

    #[cfg(test)]
    pub fn dimensions(&self, id: TerminalId) -> Option<(u16, u16)> {
        self.terminals.get(&id).map(|t| (t.cols, t.rows))
    }
}
