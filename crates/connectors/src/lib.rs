//! Flypad Connectors
//!
//! Child-process transports for AI coding CLIs. `pty` hosts interactive
//! tools behind a pseudo-terminal; `app_server` speaks JSON-RPC to
//! Codex's app-server mode over stdio JSONL or WebSocket.

pub mod app_server;
pub mod pty;

pub use app_server::{AppServerClient, AppServerConfig, AppServerError, AppServerEvent};
pub use pty::{PtyError, PtySession, PtySpawnConfig};
