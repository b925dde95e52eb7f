use anyhow::{Context, Result};
use clap::Parser;
use claude_convo::ClaudeConvo;
use std::{net::SocketAddr, path::PathBuf, sync::Arc};
use tokio::sync::mpsc;
use tower_http::cors::CorsLayer;
use tower_http::trace::MakeSpan;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};
use tracing_subscriber::prelude::*;
use uuid::Uuid;

mod clients;
mod config;
mod decoder;
mod handlers;
mod import;
mod protocol;
mod relay;
mod store;
mod supervisor;
mod terminal;
mod ws;

use crate::config::{FileConfig, RelayConfig, TerminalConfig};
use crate::handlers::ProjectInfo;
use crate::relay::{EVENT_CHANNEL_CAPACITY, Relay, RelayHandle, RelayOptions};
use crate::store::SessionStore;
use crate::supervisor::ClaudeLauncher;
use crate::terminal::ShellBackend;

/// Custom span maker that adds a unique request ID to each incoming request
#[derive(Clone)]
struct RequestIdMakeSpan;

impl<B> MakeSpan<B> for RequestIdMakeSpan {
    fn make_span(&mut self, request: &axum::http::Request<B>) -> tracing::Span {
        let request_id = Uuid::new_v4().to_string();
        tracing::info_span!(
            "request",
            method = %request.method(),
            uri = %request.uri(),
            request_id = %request_id,
        )
    }
}

#[derive(Parser, Debug)]
#[command(name = "claude-relay")]
#[command(about = "Share claude sessions and shell terminals with browsers over WebSocket")]
struct Cli {
    /// Project directory the assistant and terminals run in (default: current directory)
    #[arg(long)]
    cwd: Option<PathBuf>,

    /// Where sessions and config.toml live (default: <cwd>/.claude-relay)
    #[arg(long)]
    data_dir: Option<PathBuf>,

    /// Address to bind (overrides [server] host)
    #[arg(short = 'b', long)]
    host: Option<String>,

    /// Port to listen on (overrides [server] port)
    #[arg(short, long)]
    port: Option<u16>,

    /// Enable debug logging
    #[arg(long)]
    debug: bool,
}

#[derive(Clone)]
pub(crate) struct AppState {
    pub relay: RelayHandle,
    pub info: Arc<ProjectInfo>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let default_directive = if cli.debug {
        "claude_relay=debug,pty_manager=debug,claude_convo=debug,tower_http=debug,info"
    } else {
        "claude_relay=info,tower_http=info,warn"
    };
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_directive));
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(env_filter)
        .init();

    let relay_config = RelayConfig::new(cli.cwd, cli.data_dir)?;
    let file_config: FileConfig = config::load_config(&relay_config.data_dir)
        .extract()
        .with_context(|| {
            format!(
                "Invalid configuration in {}",
                relay_config.config_toml_path().display()
            )
        })?;

    info!("Starting claude-relay for {}", relay_config.cwd_str());

    let (events_tx, events_rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);

    let terminal_config = TerminalConfig::from_file(&file_config.terminal);
    let launcher = ClaudeLauncher {
        command: file_config.assistant.command.clone(),
        extra_args: file_config.assistant.extra_args.clone(),
        cwd: relay_config.cwd.clone(),
    };
    let shells = ShellBackend {
        shell: terminal_config.shell.clone(),
        cwd: relay_config.cwd.clone(),
    };
    let options = RelayOptions {
        cwd: relay_config.cwd_str(),
        project: relay_config.project.clone(),
        store: SessionStore::new(&relay_config.sessions_dir),
        archive: ClaudeConvo::new(),
        terminal: terminal_config,
    };

    let mut relay = Relay::new(options, Box::new(launcher), Box::new(shells), events_tx.clone());
    relay.boot();
    let relay_task = tokio::spawn(relay.run(events_rx));
    let handle = RelayHandle::new(events_tx);

    let state = AppState {
        relay: handle.clone(),
        info: Arc::new(ProjectInfo {
            cwd: relay_config.cwd_str(),
            project: relay_config.project.clone(),
        }),
    };

    let public_dir = file_config.server.public_dir.as_deref();
    if let Some(dir) = public_dir {
        info!("Serving static files from {}", dir.display());
    }
    let app = handlers::router(state, public_dir)
        .layer(TraceLayer::new_for_http().make_span_with(RequestIdMakeSpan))
        .layer(CorsLayer::permissive());

    let host = cli.host.unwrap_or(file_config.server.host);
    let port = cli.port.unwrap_or(file_config.server.port);
    let addr = format!("{}:{}", host, port)
        .parse::<SocketAddr>()
        .with_context(|| format!("Invalid listen address {}:{}", host, port))?;
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind {}", addr))?;
    let actual_addr = listener.local_addr()?;

    info!("claude-relay listening on http://{}", actual_addr);
    info!("  GET /ws   - WebSocket endpoint");
    info!("  GET /info - Project info");

    let shutdown_signal = async {
        tokio::signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
        info!("Received shutdown signal, cleaning up...");
    };

    let server_result = axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal)
        .await
        .context("Server error");

    info!("Stopping terminals and assistant processes...");
    handle.shutdown().await;
    if let Err(e) = relay_task.await {
        warn!("Relay task ended abnormally: {}", e);
    }

    info!("Shutdown complete");
    server_result
}
