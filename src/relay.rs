//! Relay engine.
//!
//! Drives each connection through `Unauthenticated → Authenticated → Closed`
//! and, for every inbound event, runs the authorize → persist → fan-out
//! sequence against the presence registry and the storage collaborators.
//!
//! The engine owns no persistent state. It never holds a registry guard
//! across an `.await`: the oracle check and the store write happen first,
//! and delivery targets are resolved from the registry afterwards.

use std::sync::Arc;

use crate::auth::IdentityVerifier;
use crate::error::{Error, Result};
use crate::presence::{ConnectionHandle, PresenceRegistry, Transition};
use crate::protocol::{ClientMessage, ConnectionId, Credential, MessageRecord, ServerMessage, UserId};
use crate::store::{MessageStore, RelationshipOracle};

/// Default maximum message length, in characters.
pub const DEFAULT_MAX_MESSAGE_LEN: usize = 4000;

/// Tunable relay behavior.
#[derive(Debug, Clone)]
pub struct RelayPolicy {
    /// Drop typing indicators between users who are not friends.
    pub typing_requires_friendship: bool,
    /// Longest accepted message body, in characters.
    pub max_message_len: usize,
}

impl Default for RelayPolicy {
    fn default() -> Self {
        Self {
            typing_requires_friendship: false,
            max_message_len: DEFAULT_MAX_MESSAGE_LEN,
        }
    }
}

/// Lifecycle of one connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Unauthenticated,
    Authenticated(UserId),
    Closed,
}

/// Per-connection state owned by the connection's task.
#[derive(Debug)]
pub struct Session {
    handle: ConnectionHandle,
    state: SessionState,
}

impl Session {
    pub fn new(handle: ConnectionHandle) -> Self {
        Self {
            handle,
            state: SessionState::Unauthenticated,
        }
    }

    pub fn id(&self) -> ConnectionId {
        self.handle.id()
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn user(&self) -> Option<UserId> {
        match self.state {
            SessionState::Authenticated(user) => Some(user),
            _ => None,
        }
    }

    /// Push an event to this connection only.
    pub fn reply(&self, message: ServerMessage) {
        if !self.handle.send(message) {
            tracing::debug!(connection = %self.id(), "Reply dropped, connection writer gone");
        }
    }
}

/// The per-event orchestrator over registry, oracle and store.
#[derive(Clone)]
pub struct RelayEngine {
    registry: PresenceRegistry,
    verifier: Arc<dyn IdentityVerifier>,
    oracle: Arc<dyn RelationshipOracle>,
    store: Arc<dyn MessageStore>,
    policy: RelayPolicy,
}

impl RelayEngine {
    pub fn new(
        registry: PresenceRegistry,
        verifier: Arc<dyn IdentityVerifier>,
        oracle: Arc<dyn RelationshipOracle>,
        store: Arc<dyn MessageStore>,
        policy: RelayPolicy,
    ) -> Self {
        Self {
            registry,
            verifier,
            oracle,
            store,
            policy,
        }
    }

    pub fn registry(&self) -> &PresenceRegistry {
        &self.registry
    }

    #[cfg(test)]
    pub fn policy(&self) -> &RelayPolicy {
        &self.policy
    }

    /// Dispatch one inbound event.
    ///
    /// Failures are reported to the acting connection as an `error` event and
    /// never propagate further. Events other than `authenticate` and `ping`
    /// are ignored until the connection is authenticated.
    pub async fn handle(&self, session: &mut Session, message: ClientMessage) {
        let result = match (session.state, message) {
            (SessionState::Closed, _) => return,

            (_, ClientMessage::Ping) => {
                session.reply(ServerMessage::Pong);
                return;
            }

            (_, ClientMessage::Authenticate { user_id, token }) => self
                .authenticate(session, ClientMessage::credential(user_id, token))
                .await
                .map(|_| ()),

            (
                SessionState::Authenticated(sender),
                ClientMessage::SendMessage {
                    recipient_id,
                    content,
                },
            ) => self
                .send_message(session, sender, recipient_id, &content)
                .await
                .map(|_| ()),

            (
                SessionState::Authenticated(sender),
                ClientMessage::Typing {
                    recipient_id,
                    is_typing,
                    ..
                },
            ) => {
                self.typing(session, sender, recipient_id, is_typing).await;
                Ok(())
            }

            (SessionState::Unauthenticated, _) => {
                tracing::trace!(connection = %session.id(), "Ignoring event before authentication");
                return;
            }
        };

        if let Err(e) = result {
            match &e {
                Error::Persistence(_) | Error::Database(_) => {
                    tracing::warn!(connection = %session.id(), error = %e, "Event failed")
                }
                _ => tracing::debug!(connection = %session.id(), error = %e, "Event rejected"),
            }
            session.reply(ServerMessage::error(e.client_message()));
        }
    }

    // ── Operations ────────────────────────────────────────────────────────

    /// Bind the connection to the verified identity.
    ///
    /// Sends the requester a snapshot of online users. If this was the
    /// user's first connection, every other connection is told the user
    /// came online.
    pub async fn authenticate(
        &self,
        session: &mut Session,
        credential: Option<Credential>,
    ) -> Result<UserId> {
        let credential = credential
            .ok_or_else(|| Error::Authentication("missing credential".to_string()))?;
        let user = self.verifier.verify(&credential).await?;

        if let SessionState::Authenticated(bound) = session.state {
            if bound != user {
                return Err(Error::IdentityMismatch {
                    bound,
                    requested: user,
                });
            }
        }

        let origin = session.id();
        self.registry
            .bind_with(user, session.handle.clone(), |transition| {
                if let Transition::BecameOnline(user_id) = transition {
                    self.registry
                        .broadcast_except(Some(origin), &ServerMessage::UserOnline { user_id });
                }
            })?;

        session.state = SessionState::Authenticated(user);
        session.reply(ServerMessage::OnlineUsers {
            user_ids: self.registry.online_identities(),
        });

        tracing::info!(user_id = %user, connection = %origin, "Connection authenticated");
        Ok(user)
    }

    /// Authorize, persist and fan out one direct message.
    ///
    /// The recipient's connections are resolved only after the store write
    /// completes. The sender gets the persisted record as its acknowledgment,
    /// unless its connection was unbound in the meantime.
    pub async fn send_message(
        &self,
        session: &Session,
        sender: UserId,
        recipient: Option<UserId>,
        content: &str,
    ) -> Result<MessageRecord> {
        let recipient = recipient.ok_or_else(|| {
            Error::Authorization("Content and recipient are required".to_string())
        })?;
        if content.trim().is_empty() {
            return Err(Error::Authorization(
                "Content and recipient are required".to_string(),
            ));
        }
        if content.chars().count() > self.policy.max_message_len {
            return Err(Error::Authorization(format!(
                "Message exceeds {} characters",
                self.policy.max_message_len
            )));
        }

        if !self.oracle.are_friends(sender, recipient).await? {
            return Err(Error::NotFriends { sender, recipient });
        }

        let record = self.store.save(sender, recipient, content).await?;
        let event = ServerMessage::Message(record.clone());

        let delivered = self
            .registry
            .connections_for(recipient)
            .into_iter()
            .filter(|handle| handle.id() != session.id())
            .filter(|handle| handle.send(event.clone()))
            .count();

        if self.registry.identity_of(session.id()) == Some(sender) {
            session.reply(event);
        } else {
            tracing::debug!(
                message_id = record.id,
                connection = %session.id(),
                "Sender disconnected mid-send, acknowledgment suppressed"
            );
        }

        tracing::debug!(
            message_id = record.id,
            sender = %sender,
            recipient = %recipient,
            delivered,
            "Message relayed"
        );
        Ok(record)
    }

    /// Forward a typing indicator to the recipient's live connections.
    /// Never persisted, never echoed to the originating connection.
    /// Returns the number of connections reached.
    pub async fn typing(
        &self,
        session: &Session,
        sender: UserId,
        recipient: UserId,
        is_typing: bool,
    ) -> usize {
        if self.policy.typing_requires_friendship {
            match self.oracle.are_friends(sender, recipient).await {
                Ok(true) => {}
                Ok(false) => {
                    tracing::trace!(sender = %sender, recipient = %recipient, "Typing between non-friends dropped");
                    return 0;
                }
                Err(e) => {
                    tracing::warn!(error = %e, "Friendship check failed, typing dropped");
                    return 0;
                }
            }
        }

        let event = ServerMessage::Typing {
            user_id: sender,
            is_typing,
        };
        self.registry
            .connections_for(recipient)
            .into_iter()
            .filter(|handle| handle.id() != session.id())
            .filter(|handle| handle.send(event.clone()))
            .count()
    }

    /// Close the session. If it was the user's last connection, everyone
    /// still connected is told the user went offline.
    pub fn disconnect(&self, session: &mut Session) -> Option<Transition> {
        let previous = std::mem::replace(&mut session.state, SessionState::Closed);
        if !matches!(previous, SessionState::Authenticated(_)) {
            return None;
        }

        self.registry.unbind_with(session.id(), |transition| {
            if let Transition::BecameOffline(user_id) = transition {
                self.registry
                    .broadcast_except(None, &ServerMessage::UserOffline { user_id });
            }
        })
    }
}
