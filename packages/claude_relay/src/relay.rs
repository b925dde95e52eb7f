//! Relay coordinator.
//!
//! One task owns every session, client and terminal and handles a single
//! stream of [`RelayEvent`]s to completion, one at a time. Process readers,
//! PTY readers and WebSocket connections only ever produce events.

use claude_convo::ClaudeConvo;
use pty_manager::PtyEvent;
use serde_json::{Value, json};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, info, warn};

use crate::clients::{ClientId, ClientRegistry, ClientSender};
use crate::config::TerminalConfig;
use crate::decoder::{Decoded, ProtocolDecoder};
use crate::import::import_cli_session;
use crate::protocol::{
    ClientMessage, ImageAttachment, RelayMessage, SessionEvent, SessionId, SessionListEntry,
    SessionStatus,
};
use crate::store::{SessionMeta, SessionStore};
use crate::supervisor::{
    LaunchRequest, Launcher, ProcessEvent, ProcessEventKind, ProcessHandle, tool_result_line,
    user_message_line,
};
use crate::terminal::{PtyBackend, TerminalManager};

/// Capacity of the coordinator's inbound channel.
pub const EVENT_CHANNEL_CAPACITY: usize = 1024;

const MAX_TITLE_CHARS: usize = 50;
const BUSY_MESSAGE: &str = "Still processing previous message. Please wait.";

/// Everything the coordinator reacts to.
#[derive(Debug)]
pub enum RelayEvent {
    ClientConnected { client: ClientId, tx: ClientSender },
    ClientMessage { client: ClientId, msg: ClientMessage },
    ClientDisconnected { client: ClientId },
    Process(ProcessEvent),
    Terminal(PtyEvent),
    /// Stop terminals and assistant processes, then end the loop
    Shutdown { done: oneshot::Sender<()> },
}

impl From<PtyEvent> for RelayEvent {
    fn from(event: PtyEvent) -> Self {
        RelayEvent::Terminal(event)
    }
}

/// Cloneable sending side of the coordinator, handed to connections.
#[derive(Debug, Clone)]
pub struct RelayHandle {
    events: mpsc::Sender<RelayEvent>,
    next_client: Arc<AtomicU64>,
}

impl RelayHandle {
    pub fn new(events: mpsc::Sender<RelayEvent>) -> Self {
        Self {
            events,
            next_client: Arc::new(AtomicU64::new(1)),
        }
    }

    pub fn next_client_id(&self) -> ClientId {
        self.next_client.fetch_add(1, Ordering::Relaxed)
    }

    /// Returns false once the coordinator has stopped.
    pub async fn send(&self, event: RelayEvent) -> bool {
        self.events.send(event).await.is_ok()
    }

    /// Ask the coordinator to clean up and wait until it has.
    pub async fn shutdown(&self) {
        let (done, wait) = oneshot::channel();
        if self.send(RelayEvent::Shutdown { done }).await {
            let _ = wait.await;
        }
    }
}

/// Fixed inputs of a relay.
pub struct RelayOptions {
    pub cwd: String,
    pub project: String,
    pub store: SessionStore,
    pub archive: ClaudeConvo,
    pub terminal: TerminalConfig,
}

struct Session {
    id: SessionId,
    cli_session_id: Option<String>,
    title: String,
    /// Epoch milliseconds
    created_at: i64,
    processing: bool,
    history: Vec<SessionEvent>,
    decoder: ProtocolDecoder,
    process: Option<ProcessHandle>,
    generation: u64,
}

impl Session {
    fn new(id: SessionId) -> Self {
        Self {
            id,
            cli_session_id: None,
            title: String::new(),
            created_at: chrono::Utc::now().timestamp_millis(),
            processing: false,
            history: Vec::new(),
            decoder: ProtocolDecoder::new(),
            process: None,
            generation: 0,
        }
    }

    fn meta(&self) -> Option<SessionMeta> {
        Some(SessionMeta {
            local_id: self.id,
            cli_session_id: self.cli_session_id.clone()?,
            title: self.title.clone(),
            created_at: self.created_at,
        })
    }

    fn list_title(&self) -> String {
        if self.title.is_empty() {
            "New Session".to_string()
        } else {
            self.title.clone()
        }
    }
}

pub struct Relay {
    cwd: String,
    project: String,
    sessions: BTreeMap<SessionId, Session>,
    next_session_id: SessionId,
    clients: ClientRegistry,
    slash_commands: Option<Vec<String>>,
    store: SessionStore,
    archive: ClaudeConvo,
    launcher: Box<dyn Launcher>,
    terminals: TerminalManager,
    events: mpsc::Sender<RelayEvent>,
}

impl Relay {
    pub fn new(
        options: RelayOptions,
        launcher: Box<dyn Launcher>,
        pty_backend: Box<dyn PtyBackend>,
        events: mpsc::Sender<RelayEvent>,
    ) -> Self {
        Self {
            cwd: options.cwd,
            project: options.project,
            sessions: BTreeMap::new(),
            next_session_id: 1,
            clients: ClientRegistry::new(),
            slash_commands: None,
            store: options.store,
            archive: options.archive,
            launcher,
            terminals: TerminalManager::new(options.terminal, pty_backend, events.clone()),
            events,
        }
    }

    /// Load persisted sessions; start a fresh one when there are none.
    pub fn boot(&mut self) {
        let loaded = match self.store.load_all() {
            Ok(loaded) => loaded,
            Err(e) => {
                warn!("Failed to load sessions from {}: {}", self.store.dir().display(), e);
                Vec::new()
            }
        };

        for stored in loaded {
            let id = self.alloc_session_id();
            let mut session = Session::new(id);
            session.cli_session_id = Some(stored.meta.cli_session_id);
            session.title = stored.meta.title;
            if stored.meta.created_at != 0 {
                session.created_at = stored.meta.created_at;
            }
            session.history = stored.history;
            self.sessions.insert(id, session);
        }
        info!("Loaded {} persisted sessions", self.sessions.len());

        if self.sessions.is_empty() {
            self.create_session(None);
        }
    }

    pub async fn run(mut self, mut events: mpsc::Receiver<RelayEvent>) {
        while let Some(event) = events.recv().await {
            if let RelayEvent::Shutdown { done } = event {
                self.shutdown();
                let _ = done.send(());
                break;
            }
            self.handle(event);
        }
        debug!("Relay loop ended");
    }

    pub fn handle(&mut self, event: RelayEvent) {
        match event {
            RelayEvent::ClientConnected { client, tx } => self.on_connect(client, tx),
            RelayEvent::ClientMessage { client, msg } => self.on_client_message(client, msg),
            RelayEvent::ClientDisconnected { client } => {
                self.clients.remove(client);
                self.terminals.detach_all(client);
                debug!("Client {} disconnected ({} left)", client, self.clients.len());
            }
            RelayEvent::Process(event) => self.on_process_event(event),
            RelayEvent::Terminal(PtyEvent::Output { id, data }) => {
                self.terminals.on_output(&self.clients, id.0, &data);
            }
            RelayEvent::Terminal(PtyEvent::Exited { id, exit_code }) => {
                self.terminals.on_exit(&self.clients, id.0, exit_code);
            }
            RelayEvent::Shutdown { done } => {
                self.shutdown();
                let _ = done.send(());
            }
        }
    }

    /// Destroy every terminal and terminate every assistant process.
    pub fn shutdown(&mut self) {
        info!("Relay shutting down");
        if !self.terminals.is_empty() {
            info!("Destroying {} terminals", self.terminals.len());
            self.terminals.destroy_all();
        }
        for session in self.sessions.values_mut() {
            if let Some(process) = session.process.take() {
                process.terminate();
            }
        }
    }

    // =========================================================================
    // Clients
    // =========================================================================

    fn on_connect(&mut self, client: ClientId, tx: ClientSender) {
        let active = self.sessions.keys().next_back().copied();
        self.clients.insert(client, tx, active);
        info!("Client {} connected ({} total)", client, self.clients.len());

        self.clients.send_to(
            client,
            RelayMessage::Info {
                cwd: self.cwd.clone(),
                project: self.project.clone(),
            },
        );
        if let Some(commands) = &self.slash_commands {
            self.clients.send_to(
                client,
                RelayMessage::SlashCommands {
                    commands: commands.clone(),
                },
            );
        }
        self.broadcast_session_list();
        self.clients.send_to(client, self.terminals.list_message());

        if let Some(id) = active {
            self.clients
                .send_to(client, RelayMessage::SessionSwitched { id });
            self.replay(client, id);
        }
    }

    fn on_client_message(&mut self, client: ClientId, msg: ClientMessage) {
        if !self.clients.contains(client) {
            debug!("Message from unknown client {}", client);
            return;
        }

        match msg {
            ClientMessage::NewSession => {
                self.create_session(Some(client));
            }
            ClientMessage::SwitchSession { id } => {
                if self.sessions.contains_key(&id) {
                    self.switch_session(client, id);
                } else {
                    debug!("Client {} asked for unknown session {}", client, id);
                }
            }
            ClientMessage::Message { text, images } => {
                self.send_message(client, text.unwrap_or_default(), images);
            }
            ClientMessage::AskUserResponse { tool_id, answers } => {
                self.answer_prompt(client, &tool_id, answers);
            }
            ClientMessage::Stop => self.stop(client),
            ClientMessage::TermCreate { cols, rows } => {
                self.terminals.create(&self.clients, client, cols, rows);
            }
            ClientMessage::TermAttach { id } => self.terminals.attach(&self.clients, client, id),
            ClientMessage::TermDetach { id } => self.terminals.detach(client, id),
            ClientMessage::TermInput { id, data } => self.terminals.write(id, &data),
            ClientMessage::TermResize { id, cols, rows } => self.terminals.resize(id, cols, rows),
            ClientMessage::TermClose { id } => self.terminals.close(&self.clients, id),
            ClientMessage::TermRename { id, title } => {
                self.terminals.rename(&self.clients, id, &title)
            }
            ClientMessage::TermList => {
                self.clients.send_to(client, self.terminals.list_message());
            }
            ClientMessage::ListCliSessions => self.list_cli_sessions(client),
            ClientMessage::ResumeCliSession { session_id } => {
                self.resume_cli_session(client, session_id)
            }
        }
    }

    // =========================================================================
    // Sessions
    // =========================================================================

    fn alloc_session_id(&mut self) -> SessionId {
        let id = self.next_session_id;
        self.next_session_id += 1;
        id
    }

    /// Create a session, start its process, and bind `client` to it.
    pub fn create_session(&mut self, client: Option<ClientId>) -> SessionId {
        let id = self.alloc_session_id();
        self.sessions.insert(id, Session::new(id));
        info!("Created session {}", id);

        self.spawn_process(id);
        if let Some(client) = client {
            self.switch_session(client, id);
        }
        id
    }

    fn switch_session(&mut self, client: ClientId, id: SessionId) {
        self.clients.bind(client, id);
        self.clients
            .send_to(client, RelayMessage::SessionSwitched { id });
        self.broadcast_session_list();
        self.replay(client, id);
    }

    /// Full history to one client, then the processing notice if needed.
    fn replay(&self, client: ClientId, id: SessionId) {
        let Some(session) = self.sessions.get(&id) else {
            return;
        };
        for event in &session.history {
            self.clients.send_to(client, event.clone());
        }
        if session.processing {
            self.clients.send_to(
                client,
                RelayMessage::Status {
                    status: SessionStatus::Processing,
                },
            );
        }
    }

    fn send_message(&mut self, client: ClientId, text: String, images: Vec<ImageAttachment>) {
        if text.is_empty() && images.is_empty() {
            return;
        }
        let Some(id) = self.clients.active_session(client) else {
            return;
        };
        let Some(session) = self.sessions.get_mut(&id) else {
            return;
        };

        if session.processing {
            self.clients.send_to(
                client,
                SessionEvent::Error {
                    text: BUSY_MESSAGE.to_string(),
                },
            );
            return;
        }

        session.processing = true;
        session.decoder.begin_turn();

        // The sender renders its own copy; images are stored as a count only
        let record = SessionEvent::UserMessage {
            text: text.clone(),
            image_count: (!images.is_empty()).then_some(images.len()),
        };
        self.record(id, record, Some(client));
        self.clients.send_to_session(
            id,
            RelayMessage::Status {
                status: SessionStatus::Processing,
            },
        );

        if let Some(session) = self.sessions.get_mut(&id) {
            if session.title.is_empty() {
                session.title = if text.is_empty() {
                    "Image".to_string()
                } else {
                    text.chars().take(MAX_TITLE_CHARS).collect()
                };
                self.persist_snapshot(id);
                self.broadcast_session_list();
            }
        }

        let needs_spawn = self
            .sessions
            .get(&id)
            .is_some_and(|s| s.process.is_none());
        if needs_spawn {
            self.spawn_process(id);
        }

        if let Some(process) = self.sessions.get(&id).and_then(|s| s.process.as_ref()) {
            if !process.send_line(user_message_line(&text, &images)) {
                warn!("Session {} stdin is closed; message not delivered", id);
            }
        }
        self.broadcast_session_list();
    }

    fn answer_prompt(&mut self, client: ClientId, tool_id: &str, answers: Value) {
        let Some(process) = self
            .clients
            .active_session(client)
            .and_then(|id| self.sessions.get(&id))
            .and_then(|s| s.process.as_ref())
        else {
            debug!("Dropping prompt answer from client {}: no live process", client);
            return;
        };

        let content = json!({ "answers": answers }).to_string();
        if !process.send_line(tool_result_line(tool_id, &content)) {
            warn!("Prompt answer for {} not delivered: stdin closed", tool_id);
        }
    }

    fn stop(&mut self, client: ClientId) {
        let Some(session) = self
            .clients
            .active_session(client)
            .and_then(|id| self.sessions.get(&id))
        else {
            return;
        };
        if !session.processing {
            return;
        }
        if let Some(process) = &session.process {
            info!("Interrupting session {}", session.id);
            process.interrupt();
        }
    }

    fn list_cli_sessions(&self, client: ClientId) {
        let sessions = match self.archive.list_sessions(&self.cwd) {
            Ok(sessions) => sessions,
            Err(e) => {
                warn!("Failed to list CLI sessions for {}: {}", self.cwd, e);
                Vec::new()
            }
        };
        self.clients
            .send_to(client, RelayMessage::CliSessions { sessions });
    }

    /// Bind `client` to the session for `cli_session_id`, importing it from
    /// the CLI archive first when the relay does not know it yet.
    fn resume_cli_session(&mut self, client: ClientId, cli_session_id: String) {
        let existing = self
            .sessions
            .values()
            .find(|s| s.cli_session_id.as_deref() == Some(cli_session_id.as_str()))
            .map(|s| s.id);
        if let Some(id) = existing {
            self.switch_session(client, id);
            return;
        }

        if let Err(e) = self.store.path_for(&cli_session_id) {
            warn!("Refusing to resume CLI session: {}", e);
            return;
        }

        let imported = import_cli_session(&self.archive, &self.cwd, &cli_session_id);
        let id = self.alloc_session_id();
        let mut session = Session::new(id);
        session.cli_session_id = Some(imported.cli_session_id);
        session.title = imported.title;
        session.history = imported.history;
        self.sessions.insert(id, session);
        info!("Resumed CLI session {} as session {}", cli_session_id, id);

        self.persist_snapshot(id);
        self.spawn_process(id);
        self.switch_session(client, id);
    }

    // =========================================================================
    // Processes
    // =========================================================================

    fn spawn_process(&mut self, id: SessionId) {
        let Some(session) = self.sessions.get_mut(&id) else {
            return;
        };
        session.generation += 1;
        session.decoder.reset();

        let request = LaunchRequest {
            session: id,
            generation: session.generation,
            resume: session.cli_session_id.clone(),
        };
        match self.launcher.launch(request, self.events.clone()) {
            Ok(process) => {
                debug!(
                    "Session {} process generation {} started (pid {:?})",
                    id,
                    process.generation(),
                    process.pid()
                );
                session.process = Some(process);
            }
            Err(e) => {
                error!("Failed to spawn assistant for session {}: {:#}", id, e);
                session.process = None;
                session.processing = false;
                self.record(
                    id,
                    SessionEvent::Error {
                        text: format!("Failed to spawn claude: {:#}", e),
                    },
                    None,
                );
                self.record(id, SessionEvent::Done { code: 1 }, None);
                self.broadcast_session_list();
            }
        }
    }

    fn on_process_event(&mut self, event: ProcessEvent) {
        let Some(session) = self.sessions.get_mut(&event.session) else {
            return;
        };
        let live = session
            .process
            .as_ref()
            .is_some_and(|p| p.generation() == event.generation);
        if !live {
            debug!(
                "Ignoring event from superseded process of session {} (generation {})",
                event.session, event.generation
            );
            return;
        }

        let id = event.session;
        match event.kind {
            ProcessEventKind::Stdout(bytes) => {
                let decoded = session.decoder.feed(&bytes);
                self.apply(id, decoded);
            }
            ProcessEventKind::Stderr(line) => {
                if line.contains("error") || line.contains("Error") {
                    self.clients
                        .send_to_session(id, RelayMessage::Stderr { text: line });
                } else {
                    debug!("Session {} stderr: {}", id, line);
                }
            }
            ProcessEventKind::Exited(code) => {
                let decoded = session.decoder.flush();
                self.apply(id, decoded);
                self.on_process_exit(id, code);
            }
        }
    }

    fn on_process_exit(&mut self, id: SessionId, code: Option<i32>) {
        let Some(session) = self.sessions.get_mut(&id) else {
            return;
        };
        session.process = None;
        session.decoder.clear_blocks();
        info!("Session {} process exited with {:?}", id, code);

        if !session.processing {
            return;
        }
        session.processing = false;

        let shown = code.map_or_else(|| "unknown".to_string(), |c| c.to_string());
        self.record(
            id,
            SessionEvent::Error {
                text: format!("Claude process exited unexpectedly (code {})", shown),
            },
            None,
        );
        let done = code.filter(|c| *c != 0).unwrap_or(1);
        self.record(id, SessionEvent::Done { code: done }, None);
        self.broadcast_session_list();
    }

    fn apply(&mut self, id: SessionId, decoded: Vec<Decoded>) {
        for item in decoded {
            match item {
                Decoded::SessionId(cli_id) => self.bind_cli_session(id, cli_id),
                Decoded::SlashCommands(commands) => {
                    if self.slash_commands.as_ref() != Some(&commands) {
                        self.slash_commands = Some(commands.clone());
                        self.clients
                            .broadcast(RelayMessage::SlashCommands { commands });
                    }
                }
                Decoded::Event(event) => self.record(id, event, None),
                Decoded::TurnComplete => {
                    if let Some(session) = self.sessions.get_mut(&id) {
                        session.processing = false;
                    }
                    self.broadcast_session_list();
                }
            }
        }
    }

    fn bind_cli_session(&mut self, id: SessionId, cli_id: String) {
        let Some(session) = self.sessions.get_mut(&id) else {
            return;
        };
        match &session.cli_session_id {
            None => {
                if let Err(e) = self.store.path_for(&cli_id) {
                    warn!("Session {} reported an unusable id: {}", id, e);
                    return;
                }
                info!("Session {} bound to CLI session {}", id, cli_id);
                session.cli_session_id = Some(cli_id);
                self.persist_snapshot(id);
            }
            Some(existing) if *existing == cli_id => {}
            Some(existing) => {
                warn!(
                    "Session {} already bound to {}; ignoring {}",
                    id, existing, cli_id
                );
            }
        }
    }

    // =========================================================================
    // Persistence and delivery
    // =========================================================================

    /// Append to the session's history and log, then deliver to its clients
    /// (except `skip`). Disk failures are logged and delivery continues.
    fn record(&mut self, id: SessionId, event: SessionEvent, skip: Option<ClientId>) {
        let Some(session) = self.sessions.get_mut(&id) else {
            return;
        };
        session.history.push(event.clone());
        if let Some(cli_id) = &session.cli_session_id {
            if let Err(e) = self.store.append(cli_id, &event) {
                warn!("Failed to append to session log {}: {}", cli_id, e);
            }
        }
        self.clients.send_to_session_except(id, skip, event);
    }

    fn persist_snapshot(&self, id: SessionId) {
        let Some(session) = self.sessions.get(&id) else {
            return;
        };
        let Some(meta) = session.meta() else {
            return;
        };
        if let Err(e) = self.store.write_snapshot(&meta, &session.history) {
            warn!(
                "Failed to write session log {}: {}",
                meta.cli_session_id, e
            );
        }
    }

    fn broadcast_session_list(&self) {
        let rows: Vec<SessionListEntry> = self
            .sessions
            .values()
            .map(|s| SessionListEntry {
                id: s.id,
                title: s.list_title(),
                active: false,
                is_processing: s.processing,
            })
            .collect();

        for client in self.clients.ids() {
            let active = self.clients.active_session(client);
            let sessions = rows
                .iter()
                .map(|row| SessionListEntry {
                    active: Some(row.id) == active,
                    ..row.clone()
                })
                .collect();
            self.clients
                .send_to(client, RelayMessage::SessionList { sessions });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{ServerMessage, TerminalMessage};
    use crate::store::LoadedSession;
    use crate::terminal::tests::{FakePtyBackend, PtyCall};
    use claude_convo::{PathResolver, encode_cwd};
    use pty_manager::PtyId;
    use std::sync::Mutex;
    use tempfile::TempDir;
    use tokio::sync::mpsc::{UnboundedReceiver, UnboundedSender};

    struct FakeProcess {
        request: LaunchRequest,
        stdin: UnboundedReceiver<String>,
    }

    #[derive(Default, Clone)]
    struct FakeLauncher {
        launched: Arc<Mutex<Vec<FakeProcess>>>,
        fail: Arc<Mutex<bool>>,
    }

    impl Launcher for FakeLauncher {
        fn launch(
            &self,
            request: LaunchRequest,
            _events: mpsc::Sender<RelayEvent>,
        ) -> anyhow::Result<ProcessHandle> {
            if *self.fail.lock().unwrap() {
                anyhow::bail!("No such file or directory (os error 2)");
            }
            let (tx, rx): (UnboundedSender<String>, _) = mpsc::unbounded_channel();
            let generation = request.generation;
            self.launched.lock().unwrap().push(FakeProcess {
                request,
                stdin: rx,
            });
            Ok(ProcessHandle::new(generation, None, tx))
        }
    }

    impl FakeLauncher {
        fn requests(&self) -> Vec<LaunchRequest> {
            self.launched
                .lock()
                .unwrap()
                .iter()
                .map(|p| p.request.clone())
                .collect()
        }

        fn stdin_lines(&self, index: usize) -> Vec<Value> {
            let mut launched = self.launched.lock().unwrap();
            let mut out = Vec::new();
            while let Ok(line) = launched[index].stdin.try_recv() {
                out.push(serde_json::from_str(&line).unwrap());
            }
            out
        }
    }

    struct Harness {
        relay: Relay,
        launcher: FakeLauncher,
        ptys: FakePtyBackend,
        store: SessionStore,
        claude_dir: std::path::PathBuf,
        _events: mpsc::Receiver<RelayEvent>,
        _dir: TempDir,
    }

    const CWD: &str = "/work/demo";

    fn harness_with(setup: impl FnOnce(&SessionStore)) -> Harness {
        let dir = TempDir::new().unwrap();
        let store = SessionStore::new(dir.path().join("sessions"));
        std::fs::create_dir_all(store.dir()).unwrap();
        setup(&store);

        let claude_dir = dir.path().join(".claude");
        let launcher = FakeLauncher::default();
        let ptys = FakePtyBackend::default();
        let (tx, rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        let options = RelayOptions {
            cwd: CWD.to_string(),
            project: "demo".to_string(),
            store: store.clone(),
            archive: ClaudeConvo::with_resolver(PathResolver::new().with_claude_dir(&claude_dir)),
            terminal: TerminalConfig {
                max_terminals: 2,
                scrollback_bytes: 1024,
                shell: "/bin/sh".to_string(),
            },
        };
        let mut relay = Relay::new(
            options,
            Box::new(launcher.clone()),
            Box::new(ptys.clone()),
            tx,
        );
        relay.boot();
        Harness {
            relay,
            launcher,
            ptys,
            store,
            claude_dir,
            _events: rx,
            _dir: dir,
        }
    }

    fn harness() -> Harness {
        harness_with(|_| {})
    }

    impl Harness {
        fn connect(&mut self, client: ClientId) -> UnboundedReceiver<ServerMessage> {
            let (tx, rx) = mpsc::unbounded_channel();
            self.relay
                .handle(RelayEvent::ClientConnected { client, tx });
            rx
        }

        fn send(&mut self, client: ClientId, msg: ClientMessage) {
            self.relay
                .handle(RelayEvent::ClientMessage { client, msg });
        }

        fn say(&mut self, client: ClientId, text: &str) {
            self.send(
                client,
                ClientMessage::Message {
                    text: Some(text.to_string()),
                    images: Vec::new(),
                },
            );
        }

        fn stdout(&mut self, session: SessionId, generation: u64, records: &[Value]) {
            let mut bytes = Vec::new();
            for r in records {
                bytes.extend(serde_json::to_vec(r).unwrap());
                bytes.push(b'\n');
            }
            self.process(session, generation, ProcessEventKind::Stdout(bytes));
        }

        fn process(&mut self, session: SessionId, generation: u64, kind: ProcessEventKind) {
            self.relay.handle(RelayEvent::Process(ProcessEvent {
                session,
                generation,
                kind,
            }));
        }
    }

    fn drain(rx: &mut UnboundedReceiver<ServerMessage>) -> Vec<Value> {
        let mut out = Vec::new();
        while let Ok(msg) = rx.try_recv() {
            out.push(serde_json::to_value(&msg).unwrap());
        }
        out
    }

    fn types(msgs: &[Value]) -> Vec<String> {
        msgs.iter()
            .map(|m| m["type"].as_str().unwrap_or_default().to_string())
            .collect()
    }

    fn text_delta(text: &str) -> Value {
        json!({"type": "stream_event", "event": {
            "type": "content_block_delta", "index": 0,
            "delta": {"type": "text_delta", "text": text}
        }})
    }

    fn result(session_id: &str) -> Value {
        json!({"type": "result", "total_cost_usd": 0.01, "duration_ms": 1200, "session_id": session_id})
    }

    #[test]
    fn test_boot_creates_and_spawns_first_session() {
        let h = harness();
        let requests = h.launcher.requests();
        assert_eq!(requests.len(), 1);
        assert_eq!(requests[0].session, 1);
        assert_eq!(requests[0].generation, 1);
        assert_eq!(requests[0].resume, None);
    }

    #[test]
    fn test_connect_sends_initial_state() {
        let mut h = harness();
        let mut rx = h.connect(1);
        let msgs = drain(&mut rx);
        assert_eq!(
            types(&msgs),
            vec!["info", "session_list", "term_list", "session_switched"]
        );
        assert_eq!(msgs[0], json!({"type": "info", "cwd": CWD, "project": "demo"}));
        assert_eq!(
            msgs[1]["sessions"],
            json!([{"id": 1, "title": "New Session", "active": true, "isProcessing": false}])
        );
        assert_eq!(msgs[3]["id"], 1);
    }

    #[test]
    fn test_message_round_trip() {
        let mut h = harness();
        let mut rx = h.connect(1);
        drain(&mut rx);

        h.say(1, "hi");
        let msgs = drain(&mut rx);
        // the sender does not get its own user_message back
        assert_eq!(types(&msgs), vec!["status", "session_list", "session_list"]);
        assert_eq!(msgs[0]["status"], "processing");
        assert_eq!(msgs[1]["sessions"][0]["title"], "hi");
        assert_eq!(msgs[2]["sessions"][0]["isProcessing"], true);

        let stdin = h.launcher.stdin_lines(0);
        assert_eq!(stdin.len(), 1);
        assert_eq!(
            stdin[0]["message"]["content"],
            json!([{"type": "text", "text": "hi"}])
        );

        h.stdout(
            1,
            1,
            &[
                json!({"type": "system", "subtype": "init", "session_id": "abc", "slash_commands": ["/help"]}),
                text_delta("H"),
                text_delta("i"),
                result("abc"),
            ],
        );
        let msgs = drain(&mut rx);
        assert_eq!(
            types(&msgs),
            vec!["slash_commands", "delta", "delta", "result", "done", "session_list"]
        );
        assert_eq!(msgs[1]["text"], "H");
        assert_eq!(msgs[2]["text"], "i");
        assert_eq!(
            msgs[3],
            json!({"type": "result", "cost": 0.01, "duration": 1200, "sessionId": "abc"})
        );
        assert_eq!(msgs[4], json!({"type": "done", "code": 0}));
        assert_eq!(msgs[5]["sessions"][0]["isProcessing"], false);

        // replaying the log reproduces the live sequence
        let loaded: Vec<LoadedSession> = h.store.load_all().unwrap();
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded[0].meta.cli_session_id, "abc");
        assert_eq!(loaded[0].meta.title, "hi");
        assert_eq!(
            types(
                &loaded[0]
                    .history
                    .iter()
                    .map(|e| serde_json::to_value(e).unwrap())
                    .collect::<Vec<_>>()
            ),
            vec!["user_message", "delta", "delta", "result", "done"]
        );
    }

    #[test]
    fn test_persisted_log_matches_live_and_replayed_events() {
        fn session_events(msgs: Vec<Value>) -> Vec<Value> {
            msgs.into_iter()
                .filter(|m| {
                    !matches!(
                        m["type"].as_str(),
                        Some("status" | "session_list" | "slash_commands" | "session_switched")
                    )
                })
                .collect()
        }

        let mut h = harness();
        let mut sender = h.connect(1);
        let mut observer = h.connect(2);
        drain(&mut sender);
        drain(&mut observer);

        h.say(1, "list the files");
        h.stdout(
            1,
            1,
            &[
                json!({"type": "system", "subtype": "init", "session_id": "sess-rt"}),
                json!({"type": "stream_event", "event": {
                    "type": "content_block_start", "index": 0,
                    "content_block": {"type": "thinking", "thinking": ""}
                }}),
                json!({"type": "stream_event", "event": {
                    "type": "content_block_delta", "index": 0,
                    "delta": {"type": "thinking_delta", "thinking": "use ls"}
                }}),
                json!({"type": "stream_event", "event": {"type": "content_block_stop", "index": 0}}),
                json!({"type": "stream_event", "event": {
                    "type": "content_block_start", "index": 1,
                    "content_block": {"type": "tool_use", "id": "tu_1", "name": "Bash", "input": {}}
                }}),
                json!({"type": "stream_event", "event": {
                    "type": "content_block_delta", "index": 1,
                    "delta": {"type": "input_json_delta", "partial_json": "{\"command\": \"ls\"}"}
                }}),
                json!({"type": "stream_event", "event": {"type": "content_block_stop", "index": 1}}),
                json!({"type": "user", "message": {"role": "user", "content": [
                    {"type": "tool_result", "tool_use_id": "tu_1", "content": "Cargo.toml\nsrc"}
                ]}}),
                text_delta("Two entries."),
                result("sess-rt"),
            ],
        );

        let live = session_events(drain(&mut observer));
        assert_eq!(
            types(&live),
            vec![
                "user_message",
                "thinking_start",
                "thinking_delta",
                "thinking_stop",
                "tool_start",
                "tool_executing",
                "tool_result",
                "delta",
                "result",
                "done"
            ]
        );

        let loaded = h.store.load_all().unwrap();
        assert_eq!(loaded.len(), 1);
        let persisted: Vec<Value> = loaded[0]
            .history
            .iter()
            .map(|e| serde_json::to_value(e).unwrap())
            .collect();
        assert_eq!(persisted, live);

        h.send(2, ClientMessage::SwitchSession { id: 1 });
        let replayed = session_events(drain(&mut observer));
        assert_eq!(replayed, live);
    }

    #[test]
    fn test_busy_session_rejects_sender_only() {
        let mut h = harness();
        let mut a = h.connect(1);
        let mut b = h.connect(2);
        h.say(1, "first");
        drain(&mut a);
        drain(&mut b);

        h.say(2, "second");
        let msgs = drain(&mut b);
        assert_eq!(
            msgs,
            vec![json!({"type": "error", "text": "Still processing previous message. Please wait."})]
        );
        assert!(drain(&mut a).is_empty());
        assert_eq!(h.launcher.stdin_lines(0).len(), 1);
    }

    #[test]
    fn test_user_message_reaches_other_bound_clients() {
        let mut h = harness();
        let mut a = h.connect(1);
        let mut b = h.connect(2);
        drain(&mut a);
        drain(&mut b);

        h.send(
            1,
            ClientMessage::Message {
                text: None,
                images: vec![ImageAttachment {
                    media_type: "image/png".into(),
                    data: "AAAA".into(),
                }],
            },
        );
        let msgs = drain(&mut b);
        assert_eq!(
            msgs[0],
            json!({"type": "user_message", "text": "", "imageCount": 1})
        );
        assert_eq!(msgs[2]["sessions"][0]["title"], "Image");
    }

    #[test]
    fn test_empty_message_is_ignored() {
        let mut h = harness();
        let mut rx = h.connect(1);
        drain(&mut rx);
        h.send(
            1,
            ClientMessage::Message {
                text: None,
                images: Vec::new(),
            },
        );
        assert!(drain(&mut rx).is_empty());
        assert!(h.launcher.stdin_lines(0).is_empty());
    }

    #[test]
    fn test_crash_mid_turn_reports_exit() {
        let mut h = harness();
        let mut rx = h.connect(1);
        h.say(1, "hi");
        drain(&mut rx);

        h.process(1, 1, ProcessEventKind::Exited(Some(137)));
        let msgs = drain(&mut rx);
        assert_eq!(
            msgs,
            vec![
                json!({"type": "error", "text": "Claude process exited unexpectedly (code 137)"}),
                json!({"type": "done", "code": 137}),
                json!({"type": "session_list", "sessions": [
                    {"id": 1, "title": "hi", "active": true, "isProcessing": false}
                ]}),
            ]
        );
    }

    #[test]
    fn test_idle_exit_is_quiet_and_respawn_is_lazy() {
        let mut h = harness();
        let mut rx = h.connect(1);
        h.say(1, "hi");
        h.stdout(1, 1, &[result("abc")]);
        drain(&mut rx);

        h.process(1, 1, ProcessEventKind::Exited(Some(0)));
        assert!(drain(&mut rx).is_empty());
        assert_eq!(h.launcher.requests().len(), 1);

        h.say(1, "again");
        let requests = h.launcher.requests();
        assert_eq!(requests.len(), 2);
        assert_eq!(requests[1].generation, 2);
        assert_eq!(requests[1].resume.as_deref(), Some("abc"));
        assert_eq!(h.launcher.stdin_lines(1).len(), 1);

        // a late exit from the first process changes nothing
        drain(&mut rx);
        h.process(1, 1, ProcessEventKind::Exited(Some(1)));
        h.stdout(1, 1, &[text_delta("stale")]);
        assert!(drain(&mut rx).is_empty());
    }

    #[test]
    fn test_partial_output_is_flushed_on_exit() {
        let mut h = harness();
        let mut rx = h.connect(1);
        h.say(1, "hi");
        drain(&mut rx);

        let line = serde_json::to_vec(&text_delta("tail")).unwrap();
        h.process(1, 1, ProcessEventKind::Stdout(line));
        assert!(drain(&mut rx).is_empty());

        h.process(1, 1, ProcessEventKind::Exited(Some(2)));
        let msgs = drain(&mut rx);
        assert_eq!(types(&msgs), vec!["delta", "error", "done", "session_list"]);
        assert_eq!(msgs[0]["text"], "tail");
        assert_eq!(msgs[2]["code"], 2);
    }

    #[test]
    fn test_spawn_failure_reports_error() {
        let mut h = harness();
        let mut rx = h.connect(1);
        drain(&mut rx);
        *h.launcher.fail.lock().unwrap() = true;

        h.send(1, ClientMessage::NewSession);
        let msgs = drain(&mut rx);
        // the failure is recorded before the client switches, so it arrives
        // with the replay
        assert_eq!(
            types(&msgs),
            vec![
                "session_list",
                "session_switched",
                "session_list",
                "error",
                "done"
            ]
        );
        assert_eq!(msgs[1]["id"], 2);
        assert_eq!(
            msgs[3]["text"],
            "Failed to spawn claude: No such file or directory (os error 2)"
        );
        assert_eq!(msgs[4]["code"], 1);
    }

    #[test]
    fn test_sessions_are_isolated_per_client() {
        let mut h = harness();
        let mut a = h.connect(1);
        let mut b = h.connect(2);
        h.send(2, ClientMessage::NewSession);
        drain(&mut a);
        drain(&mut b);

        h.say(1, "for one");
        h.say(2, "for two");
        drain(&mut a);
        drain(&mut b);

        h.stdout(1, 1, &[text_delta("one")]);
        h.stdout(2, 1, &[text_delta("two")]);
        assert_eq!(drain(&mut a), vec![json!({"type": "delta", "text": "one"})]);
        assert_eq!(drain(&mut b), vec![json!({"type": "delta", "text": "two"})]);
    }

    #[test]
    fn test_switch_replays_history_and_processing() {
        let mut h = harness();
        let mut a = h.connect(1);
        h.say(1, "hi");
        h.stdout(1, 1, &[text_delta("partial")]);
        h.send(1, ClientMessage::NewSession);
        drain(&mut a);

        h.send(1, ClientMessage::SwitchSession { id: 1 });
        let msgs = drain(&mut a);
        assert_eq!(
            types(&msgs),
            vec![
                "session_switched",
                "session_list",
                "user_message",
                "delta",
                "status"
            ]
        );
        assert_eq!(
            msgs[1]["sessions"],
            json!([
                {"id": 1, "title": "hi", "active": true, "isProcessing": true},
                {"id": 2, "title": "New Session", "active": false, "isProcessing": false}
            ])
        );

        h.send(1, ClientMessage::SwitchSession { id: 42 });
        assert!(drain(&mut a).is_empty());
    }

    #[test]
    fn test_reconnect_binds_most_recent_session() {
        let mut h = harness();
        let mut a = h.connect(1);
        h.send(1, ClientMessage::NewSession);
        h.say(1, "hello");
        h.relay
            .handle(RelayEvent::ClientDisconnected { client: 1 });
        drain(&mut a);

        let mut b = h.connect(2);
        let msgs = drain(&mut b);
        assert_eq!(
            types(&msgs),
            vec![
                "info",
                "session_list",
                "term_list",
                "session_switched",
                "user_message",
                "status"
            ]
        );
        assert_eq!(msgs[3]["id"], 2);
    }

    #[test]
    fn test_slash_commands_broadcast_on_change_only() {
        let mut h = harness();
        let mut a = h.connect(1);
        drain(&mut a);

        let init = json!({"type": "system", "subtype": "init", "slash_commands": ["/a"]});
        h.stdout(1, 1, &[init.clone()]);
        h.stdout(1, 1, &[init]);
        assert_eq!(
            drain(&mut a),
            vec![json!({"type": "slash_commands", "commands": ["/a"]})]
        );

        let mut b = h.connect(2);
        assert_eq!(types(&drain(&mut b))[1], "slash_commands");
    }

    #[test]
    fn test_stderr_forwarding_filters_noise() {
        let mut h = harness();
        let mut a = h.connect(1);
        drain(&mut a);

        h.process(1, 1, ProcessEventKind::Stderr("loading config".into()));
        h.process(1, 1, ProcessEventKind::Stderr("Error: rate limited".into()));
        assert_eq!(
            drain(&mut a),
            vec![json!({"type": "stderr", "text": "Error: rate limited"})]
        );
        // not part of the log
        h.send(1, ClientMessage::SwitchSession { id: 1 });
        assert!(!types(&drain(&mut a)).contains(&"stderr".to_string()));
    }

    #[test]
    fn test_conflicting_session_id_is_ignored() {
        let mut h = harness();
        let _a = h.connect(1);
        h.stdout(1, 1, &[json!({"type": "system", "subtype": "init", "session_id": "first"})]);
        h.stdout(1, 1, &[json!({"type": "system", "subtype": "init", "session_id": "second"})]);

        let loaded = h.store.load_all().unwrap();
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded[0].meta.cli_session_id, "first");
    }

    #[test]
    fn test_ask_user_response_and_stop() {
        let mut h = harness();
        let _a = h.connect(1);
        h.send(
            1,
            ClientMessage::AskUserResponse {
                tool_id: "tu_9".into(),
                answers: json!({"Proceed?": "yes"}),
            },
        );
        let lines = h.launcher.stdin_lines(0);
        assert_eq!(
            lines[0]["message"]["content"],
            json!([{
                "type": "tool_result",
                "tool_use_id": "tu_9",
                "content": "{\"answers\":{\"Proceed?\":\"yes\"}}"
            }])
        );

        // no pid on the fake process, so this only exercises the routing
        h.say(1, "long task");
        h.send(1, ClientMessage::Stop);
    }

    #[test]
    fn test_boot_loads_persisted_sessions_without_spawning() {
        let h = harness_with(|store| {
            let meta = |id: &str, title: &str, created_at| SessionMeta {
                local_id: 9,
                cli_session_id: id.to_string(),
                title: title.to_string(),
                created_at,
            };
            store
                .write_snapshot(
                    &meta("newer", "second", 2_000),
                    &[SessionEvent::Delta { text: "b".into() }],
                )
                .unwrap();
            store
                .write_snapshot(&meta("older", "first", 1_000), &[])
                .unwrap();
        });
        assert!(h.launcher.requests().is_empty());

        let mut h = h;
        let mut rx = h.connect(1);
        let msgs = drain(&mut rx);
        assert_eq!(
            msgs[1]["sessions"],
            json!([
                {"id": 1, "title": "first", "active": false, "isProcessing": false},
                {"id": 2, "title": "second", "active": true, "isProcessing": false}
            ])
        );
        assert_eq!(msgs[4], json!({"type": "delta", "text": "b"}));

        // first message to a loaded session spawns with resume
        h.say(1, "continue");
        assert_eq!(h.launcher.requests()[0].resume.as_deref(), Some("newer"));
    }

    #[test]
    fn test_list_and_resume_cli_sessions() {
        let mut h = harness();
        let project = h.claude_dir.join("projects").join(encode_cwd(CWD));
        std::fs::create_dir_all(&project).unwrap();
        let records = [
            json!({"type": "user", "sessionId": "cli-1", "timestamp": "2026-01-01T00:00:00Z",
                   "message": {"role": "user", "content": "Refactor the parser"}}),
            json!({"type": "assistant", "message": {"role": "assistant", "model": "claude-sonnet",
                   "content": [{"type": "text", "text": "Done."}]}}),
        ];
        let body: String = records.iter().map(|r| format!("{}\n", r)).collect();
        std::fs::write(project.join("cli-1.jsonl"), body).unwrap();

        let mut a = h.connect(1);
        drain(&mut a);

        h.send(1, ClientMessage::ListCliSessions);
        let msgs = drain(&mut a);
        assert_eq!(types(&msgs), vec!["cli_sessions"]);
        assert_eq!(msgs[0]["sessions"][0]["sessionId"], "cli-1");
        assert_eq!(msgs[0]["sessions"][0]["firstPrompt"], "Refactor the parser");

        h.send(
            1,
            ClientMessage::ResumeCliSession {
                session_id: "cli-1".into(),
            },
        );
        let msgs = drain(&mut a);
        assert_eq!(
            types(&msgs),
            vec!["session_switched", "session_list", "user_message", "delta", "done"]
        );
        assert_eq!(msgs[0]["id"], 2);
        assert_eq!(msgs[1]["sessions"][1]["title"], "Refactor the parser");

        let requests = h.launcher.requests();
        assert_eq!(requests[1].resume.as_deref(), Some("cli-1"));
        let loaded = h.store.load_all().unwrap();
        assert_eq!(loaded[0].meta.cli_session_id, "cli-1");
        assert_eq!(loaded[0].history.len(), 3);

        // resuming again switches to the same relay session
        h.send(1, ClientMessage::SwitchSession { id: 1 });
        h.send(
            1,
            ClientMessage::ResumeCliSession {
                session_id: "cli-1".into(),
            },
        );
        assert_eq!(h.launcher.requests().len(), 2);
        let msgs = drain(&mut a);
        assert_eq!(msgs.iter().filter(|m| m["type"] == "session_switched").last().unwrap()["id"], 2);

        // ids that cannot name a log file are refused
        h.send(
            1,
            ClientMessage::ResumeCliSession {
                session_id: "../escape".into(),
            },
        );
        assert_eq!(h.launcher.requests().len(), 2);
    }

    #[test]
    fn test_terminal_messages_route_through_relay() {
        let mut h = harness();
        let mut a = h.connect(1);
        let mut b = h.connect(2);
        drain(&mut a);
        drain(&mut b);

        h.send(1, ClientMessage::TermCreate { cols: Some(100), rows: Some(30) });
        let msgs = drain(&mut a);
        assert_eq!(types(&msgs), vec!["term_created", "term_list"]);
        assert_eq!(types(&drain(&mut b)), vec!["term_list"]);
        assert_eq!(
            h.ptys.calls.lock().unwrap()[0],
            PtyCall::Spawn { id: 1, cols: 100, rows: 30 }
        );

        h.send(1, ClientMessage::TermInput { id: 1, data: "ls\n".into() });
        h.relay.handle(RelayEvent::from(PtyEvent::Output {
            id: PtyId(1),
            data: b"file.txt\r\n".to_vec(),
        }));
        assert_eq!(
            drain(&mut a),
            vec![json!({"type": "term_output", "id": 1, "data": "file.txt\r\n"})]
        );

        h.send(2, ClientMessage::TermAttach { id: 1 });
        assert_eq!(
            drain(&mut b),
            vec![json!({"type": "term_output", "id": 1, "data": "file.txt\r\n"})]
        );

        // disconnect drops subscriptions
        h.relay
            .handle(RelayEvent::ClientDisconnected { client: 2 });
        h.relay.handle(RelayEvent::from(PtyEvent::Exited {
            id: PtyId(1),
            exit_code: Some(0),
        }));
        let msgs = drain(&mut a);
        assert_eq!(types(&msgs), vec!["term_exited", "term_list"]);
        assert_eq!(msgs[0], json!({"type": "term_exited", "id": 1, "exitCode": 0}));

        h.send(1, ClientMessage::TermList);
        let expected: ServerMessage = TerminalMessage::TermList {
            terminals: h.relay.terminals.list(),
        }
        .into();
        assert_eq!(drain(&mut a), vec![serde_json::to_value(&expected).unwrap()]);
    }

    #[tokio::test]
    async fn test_run_loop_shuts_down() {
        let h = harness();
        let launcher = h.launcher.clone();
        let (tx, rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        let handle = RelayHandle::new(tx);
        let task = tokio::spawn(h.relay.run(rx));

        let client = handle.next_client_id();
        assert_eq!(client, 1);
        assert_eq!(handle.next_client_id(), 2);
        let (ctx, mut crx) = mpsc::unbounded_channel();
        assert!(handle.send(RelayEvent::ClientConnected { client, tx: ctx }).await);

        handle.shutdown().await;
        task.await.unwrap();
        assert!(!handle.send(RelayEvent::ClientDisconnected { client }).await);

        let first = crx.recv().await.unwrap();
        assert!(matches!(first, ServerMessage::Relay(RelayMessage::Info { .. })));
        assert_eq!(launcher.requests().len(), 1);
    }
}
