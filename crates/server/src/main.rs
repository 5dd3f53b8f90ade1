//! Flypad Server
//!
//! Orchestration and supervision host for AI coding CLIs. Spawns Codex,
//! Claude, and OpenCode sessions behind PTYs, exposes them over
//! authenticated HTTP + WebSocket, and composes them into
//! orchestrations.

mod attention;
mod auth;
mod cmd_status;
mod codex_appserver;
mod commands;
mod digest;
mod directive_parser;
mod exec;
mod http;
mod linker;
mod logging;
mod migration_runner;
mod orchestration;
mod pairing;
pub(crate) mod paths;
mod profiles;
mod state;
mod store;
mod supervisor;
mod sync;
mod websocket;
mod worktree;

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

use crate::logging::init_logging;
use crate::pairing::AuthService;
use crate::state::AppState;
use crate::store::Store;

/// Server version, baked in at compile time.
pub(crate) const VERSION: &str = env!("CARGO_PKG_VERSION");

const DEFAULT_BIND: &str = "127.0.0.1:4400";

#[derive(Parser, Debug)]
#[command(
    name = "flypad-server",
    about = "Flypad server — orchestration host for AI coding CLIs",
    version = VERSION,
)]
struct Cli {
    /// Data directory (default: ~/.flypad)
    #[arg(long, global = true, env = "FYP_DATA_DIR")]
    data_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Start the server (default when no subcommand given)
    Start {
        /// Bind address (e.g. 0.0.0.0:4400 for remote access)
        #[arg(long, default_value = DEFAULT_BIND, env = "FYP_BIND_ADDR")]
        bind: SocketAddr,

        /// Auth token (requests must include `Authorization: Bearer <token>`)
        #[arg(long, env = "FYP_AUTH_TOKEN")]
        auth_token: Option<String>,
    },

    /// Check if the server is running
    Status,

    /// Generate a random auth token and write it to data_dir/auth-token
    GenerateToken,
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Initialize data dir from CLI arg / env / default — before anything else
    let data_dir = paths::init_data_dir(cli.data_dir.as_deref());

    match cli.command {
        Some(Command::Status) => return cmd_status::run(&data_dir),
        Some(Command::GenerateToken) => return cmd_status::generate_token(&data_dir),
        _ => {}
    }

    let (bind_addr, auth_token) = match cli.command {
        Some(Command::Start { bind, auth_token }) => (bind, auth_token),
        _ => (DEFAULT_BIND.parse().expect("default bind parses"), None),
    };

    let runtime = tokio::runtime::Runtime::new()?;
    runtime.block_on(async_main(bind_addr, auth_token))
}

async fn async_main(bind_addr: SocketAddr, auth_token: Option<String>) -> anyhow::Result<()> {
    paths::ensure_dirs()?;

    let logging = init_logging()?;
    let run_id = logging.run_id.clone();
    let _log_guard = logging.guard;
    let root_span =
        tracing::info_span!("flypad_server", service = "flypad-server", run_id = %run_id);
    let _root_span_guard = root_span.enter();

    info!(
        component = "server",
        event = "server.starting",
        run_id = %run_id,
        version = VERSION,
        pid = std::process::id(),
        data_dir = %paths::data_dir().display(),
        "Starting Flypad Server..."
    );

    // Opening the DB runs migrations; failure here is fatal.
    let store = Arc::new(Store::open(&paths::db_path())?);

    // Resolve the auth token: CLI/env > token file (generated on demand)
    let token = match auth_token {
        Some(token) => token,
        None => pairing::load_or_generate_token(&paths::token_file_path())?,
    };
    let auth_service = Arc::new(AuthService::new(token));

    // Check that at least one tool binary is reachable
    for tool in ["codex", "claude", "opencode"] {
        let found = std::process::Command::new("which")
            .arg(tool)
            .output()
            .map(|o| o.status.success())
            .unwrap_or(false);
        if found {
            info!(
                component = "server",
                event = "server.tool.available",
                tool = tool,
                "Tool binary available"
            );
        } else {
            warn!(
                component = "server",
                event = "server.tool.missing",
                tool = tool,
                "Tool binary not found — sessions for it will fail to spawn"
            );
        }
    }

    let state = AppState::new(store, auth_service.clone());

    let app = http::build_router(state.clone())
        .layer(axum::middleware::from_fn_with_state(
            auth_service,
            auth::auth_middleware,
        ))
        .layer(TraceLayer::new_for_http())
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        );

    let listener = tokio::net::TcpListener::bind(bind_addr).await?;
    let local_addr = listener.local_addr()?;

    info!(
        component = "server",
        event = "server.listening",
        bind_address = %local_addr,
        "Listening for connections"
    );

    // Write PID file after successful bind
    write_pid_file(local_addr);

    let shutdown_state = state.clone();
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(shutdown_state))
        .await?;

    Ok(())
}

/// Write `server.pid` as JSON `{pid, port, bind, startedAt}`.
fn write_pid_file(addr: SocketAddr) {
    let pid_path = paths::pid_file_path();
    let body = serde_json::json!({
        "pid": std::process::id(),
        "port": addr.port(),
        "bind": addr.to_string(),
        "startedAt": chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Secs, true),
    });
    if let Err(e) = std::fs::write(&pid_path, body.to_string()) {
        warn!(
            component = "server",
            event = "server.pid_file.write_error",
            path = %pid_path.display(),
            error = %e,
            "Failed to write PID file"
        );
    }
}

/// Remove PID file on clean shutdown
fn remove_pid_file() {
    let pid_path = paths::pid_file_path();
    let _ = std::fs::remove_file(&pid_path);
}

/// Wait for SIGINT/SIGTERM, then tear the core down in order.
async fn shutdown_signal(state: Arc<AppState>) {
    let ctrl_c = tokio::signal::ctrl_c();
    let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
        .expect("install SIGTERM handler");

    tokio::select! {
        _ = ctrl_c => {}
        _ = sigterm.recv() => {}
    }

    info!(
        component = "server",
        event = "server.shutdown",
        "Shutdown signal received"
    );

    state.shutdown().await;

    // Give in-flight writes a moment to settle
    tokio::time::sleep(std::time::Duration::from_millis(200)).await;
    remove_pid_file();
}
