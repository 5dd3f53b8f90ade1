//! Client → Server messages

use serde::{Deserialize, Serialize};

/// Messages sent from client to server over the WebSocket
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    /// Stream raw output for a session
    SubscribeSession { session_id: String },
    UnsubscribeSession { session_id: String },

    /// Write keystrokes into a session's terminal
    Input { session_id: String, data: String },
    Resize {
        session_id: String,
        cols: u16,
        rows: u16,
    },
    Interrupt { session_id: String },

    Ping,
}
