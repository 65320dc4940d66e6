use serde::{Deserialize, Serialize};

use crate::models::Message;

/// Events sent FROM server TO client over the WebSocket gateway.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(
    tag = "type",
    content = "data",
    rename_all = "camelCase",
    rename_all_fields = "camelCase"
)]
pub enum GatewayEvent {
    /// The channel is now associated with `user_id`
    Registered { user_id: String },

    /// A message was persisted for a conversation this channel belongs to
    NewMessage { message: Message },

    /// Outcome of a `sendMessage` command, sent only to the issuing channel.
    /// Reports persistence only; delivery and push are best-effort.
    SendResult {
        ack_id: Option<String>,
        success: bool,
        message: Option<Message>,
        error: Option<String>,
    },

    /// A command could not be understood or applied
    Error { message: String },
}

/// Commands sent FROM client TO server over WebSocket.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(
    tag = "type",
    content = "data",
    rename_all = "camelCase",
    rename_all_fields = "camelCase"
)]
pub enum GatewayCommand {
    /// Associate this channel with a user identity
    RegisterUser { user_id: String },

    /// Persist a message and fan it out to the participants
    SendMessage {
        sender_id: String,
        receiver_id: String,
        message: String,
        #[serde(default)]
        ack_id: Option<String>,
    },
}
