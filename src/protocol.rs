//! Relay protocol message definitions.
//!
//! The relay speaks JSON over WebSocket. Every frame is an object tagged by
//! `type`; field names are camelCase to match the web client.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

// ── Identifiers ───────────────────────────────────────────────────────────────

/// Stable numeric identity of a registered user. Never reused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UserId(pub i64);

impl fmt::Display for UserId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identifier of one live transport connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectionId(Uuid);

impl ConnectionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for ConnectionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// What a client presents to prove who it is.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Credential {
    /// A bare claimed user id.
    Claim(UserId),
    /// A signed bearer token.
    Token(String),
}

// ── Client → Relay ────────────────────────────────────────────────────────────

/// Messages sent from a client to the relay server.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum ClientMessage {
    /// Bind this connection to a user. Either field may carry the credential;
    /// a token wins when both are present.
    #[serde(rename_all = "camelCase")]
    Authenticate {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        user_id: Option<UserId>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        token: Option<String>,
    },

    /// Send a direct message to a friend.
    #[serde(rename_all = "camelCase")]
    SendMessage {
        #[serde(default)]
        recipient_id: Option<UserId>,
        #[serde(default)]
        content: String,
    },

    /// Typing indicator. `user_id` is accepted for compatibility with older
    /// clients but ignored; the bound identity is used instead.
    #[serde(rename_all = "camelCase")]
    Typing {
        recipient_id: UserId,
        is_typing: bool,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        user_id: Option<UserId>,
    },

    /// Application-level keepalive.
    Ping,
}

impl ClientMessage {
    /// Extract the credential from an `authenticate` payload.
    pub fn credential(user_id: Option<UserId>, token: Option<String>) -> Option<Credential> {
        match (token, user_id) {
            (Some(token), _) if !token.is_empty() => Some(Credential::Token(token)),
            (_, Some(id)) => Some(Credential::Claim(id)),
            _ => None,
        }
    }
}

// ── Relay → Client ────────────────────────────────────────────────────────────

/// Messages sent from the relay server to a client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum ServerMessage {
    /// Snapshot of everyone online, sent once after authenticating.
    #[serde(rename_all = "camelCase")]
    OnlineUsers { user_ids: Vec<UserId> },

    /// A user's first connection came up.
    #[serde(rename_all = "camelCase")]
    UserOnline { user_id: UserId },

    /// A user's last connection went away.
    #[serde(rename_all = "camelCase")]
    UserOffline { user_id: UserId },

    /// A persisted message, delivered to the recipient and echoed to the
    /// sender as its acknowledgment.
    Message(MessageRecord),

    /// A friend started or stopped typing.
    #[serde(rename_all = "camelCase")]
    Typing { user_id: UserId, is_typing: bool },

    /// Error response for the acting connection only.
    Error { message: String },

    /// Pong response to keep connection alive.
    Pong,
}

impl ServerMessage {
    pub fn error(message: impl Into<String>) -> Self {
        ServerMessage::Error {
            message: message.into(),
        }
    }
}

// ── Supporting Types ──────────────────────────────────────────────────────────

/// A message as persisted by the store. Sender and recipient both receive
/// this exact record, so ids and timestamps agree on every client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageRecord {
    pub id: i64,
    pub sender_id: UserId,
    pub recipient_id: UserId,
    pub content: String,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub is_read: bool,
}
