//! Server → Client messages

use serde::{Deserialize, Serialize};

use crate::types::{AttentionItem, SessionStatus};

/// Messages sent from server to client over the WebSocket
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    /// Raw PTY output chunk (lossy UTF-8)
    Output { session_id: String, chunk: String },

    /// Child process exited
    SessionExit {
        session_id: String,
        status: SessionStatus,
    },

    /// A new or updated inbox item
    Attention { item: AttentionItem },

    /// Errors
    Error {
        code: String,
        message: String,
        session_id: Option<String>,
    },

    Pong,
}
