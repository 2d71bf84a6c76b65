//! Presence registry.
//!
//! The single source of truth for "is user U reachable right now". Maps each
//! identity to the set of its live connections, and each connection back to
//! the identity it was bound to.
//!
//! Both maps are `DashMap`s, so unrelated users on different shards never
//! contend. An identity's connection set is only mutated while its shard's
//! write guard is held, which makes the empty ↔ non-empty edge observable
//! exactly once. The transition callback runs under that same guard, so
//! online/offline signals for one identity are emitted in the order the
//! transitions happened.
//!
//! Lock order is always `by_identity` → `by_connection`; nothing holds a
//! `by_connection` guard while acquiring a `by_identity` one.

use std::collections::HashMap;
use std::sync::Arc;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tokio::sync::mpsc;

use crate::error::{Error, Result};
use crate::protocol::{ConnectionId, ServerMessage, UserId};

/// A connected client's sender channel.
pub type ClientSender = mpsc::UnboundedSender<ServerMessage>;

/// Handle to one live connection: its id plus the channel feeding its writer task.
#[derive(Debug, Clone)]
pub struct ConnectionHandle {
    id: ConnectionId,
    sender: ClientSender,
}

impl ConnectionHandle {
    pub fn new(id: ConnectionId, sender: ClientSender) -> Self {
        Self { id, sender }
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    /// Push an event to this connection. Returns false if its writer is gone.
    pub fn send(&self, message: ServerMessage) -> bool {
        self.sender.send(message).is_ok()
    }
}

/// Edge event fired when an identity's connection count crosses zero.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    BecameOnline(UserId),
    BecameOffline(UserId),
}

#[derive(Debug)]
struct Binding {
    user: UserId,
    handle: ConnectionHandle,
}

/// Process-wide identity → connections mapping.
#[derive(Clone, Default)]
pub struct PresenceRegistry {
    /// User → live connections. An entry exists iff its map is non-empty.
    by_identity: Arc<DashMap<UserId, HashMap<ConnectionId, ConnectionHandle>>>,

    /// Connection → bound user. Disconnects only carry the connection id.
    by_connection: Arc<DashMap<ConnectionId, Binding>>,
}

impl PresenceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    // ── Mutation ──────────────────────────────────────────────────────────

    /// Bind a connection to a user, without observing the transition callback.
    #[cfg(test)]
    pub fn bind(&self, user: UserId, handle: ConnectionHandle) -> Result<Option<Transition>> {
        self.bind_with(user, handle, |_| {})
    }

    /// Bind a connection to a user.
    ///
    /// Idempotent for the same (connection, user) pair. A connection that is
    /// already bound to a different user is refused and nothing changes.
    /// When this is the user's first connection, `signal` is invoked with
    /// [`Transition::BecameOnline`] while the user's slot is still locked.
    pub fn bind_with<F>(
        &self,
        user: UserId,
        handle: ConnectionHandle,
        signal: F,
    ) -> Result<Option<Transition>>
    where
        F: FnOnce(Transition),
    {
        let conn = handle.id();

        match self.by_connection.entry(conn) {
            Entry::Occupied(existing) => {
                let bound = existing.get().user;
                if bound != user {
                    return Err(Error::IdentityMismatch {
                        bound,
                        requested: user,
                    });
                }
                return Ok(None);
            }
            Entry::Vacant(slot) => {
                slot.insert(Binding {
                    user,
                    handle: handle.clone(),
                });
            }
        }

        let mut connections = self.by_identity.entry(user).or_default();
        let transition = connections
            .is_empty()
            .then_some(Transition::BecameOnline(user));
        connections.insert(conn, handle);

        if let Some(t) = transition {
            tracing::info!(user_id = %user, connection = %conn, "User came online");
            signal(t);
        } else {
            tracing::debug!(
                user_id = %user,
                connection = %conn,
                sessions = connections.len(),
                "Additional session bound"
            );
        }

        Ok(transition)
    }

    /// Unbind a connection, without observing the transition callback.
    #[cfg(test)]
    pub fn unbind(&self, conn: ConnectionId) -> Option<Transition> {
        self.unbind_with(conn, |_| {})
    }

    /// Remove a connection from whichever user it is bound to.
    ///
    /// No-op for connections that were never bound. When this empties the
    /// user's set the entry is deleted and `signal` is invoked with
    /// [`Transition::BecameOffline`] while the user's slot is still locked.
    pub fn unbind_with<F>(&self, conn: ConnectionId, signal: F) -> Option<Transition>
    where
        F: FnOnce(Transition),
    {
        let (_, binding) = self.by_connection.remove(&conn)?;
        let user = binding.user;
        let mut transition = None;

        self.by_identity.remove_if_mut(&user, |_, connections| {
            connections.remove(&conn);
            if connections.is_empty() {
                let t = Transition::BecameOffline(user);
                transition = Some(t);
                tracing::info!(user_id = %user, connection = %conn, "User went offline");
                signal(t);
                true
            } else {
                false
            }
        });

        transition
    }

    // ── Queries ───────────────────────────────────────────────────────────

    /// Live connections of a user (possibly empty).
    pub fn connections_for(&self, user: UserId) -> Vec<ConnectionHandle> {
        self.by_identity
            .get(&user)
            .map(|connections| connections.values().cloned().collect())
            .unwrap_or_default()
    }

    /// Snapshot of every user with at least one live connection, ascending.
    pub fn online_identities(&self) -> Vec<UserId> {
        let mut users: Vec<UserId> = self.by_identity.iter().map(|e| *e.key()).collect();
        users.sort_unstable();
        users
    }

    pub fn is_online(&self, user: UserId) -> bool {
        self.by_identity.contains_key(&user)
    }

    /// The user a connection is bound to, if any.
    pub fn identity_of(&self, conn: ConnectionId) -> Option<UserId> {
        self.by_connection.get(&conn).map(|b| b.user)
    }

    /// Number of distinct users online.
    pub fn online_count(&self) -> usize {
        self.by_identity.len()
    }

    /// Number of bound connections across all users.
    pub fn connection_count(&self) -> usize {
        self.by_connection.len()
    }

    // ── Delivery ──────────────────────────────────────────────────────────

    /// Push an event to every bound connection except `exclude`.
    /// Returns the number of connections that accepted it.
    pub fn broadcast_except(&self, exclude: Option<ConnectionId>, message: &ServerMessage) -> usize {
        self.by_connection
            .iter()
            .filter(|entry| Some(*entry.key()) != exclude)
            .filter(|entry| entry.handle.send(message.clone()))
            .count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;

    fn handle() -> (ConnectionHandle, mpsc::UnboundedReceiver<ServerMessage>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (ConnectionHandle::new(ConnectionId::new(), tx), rx)
    }

    fn assert_invariant(registry: &PresenceRegistry, users: &[UserId]) {
        let online = registry.online_identities();
        for user in users {
            assert_eq!(
                online.contains(user),
                !registry.connections_for(*user).is_empty(),
                "presence invariant broken for user {}",
                user
            );
        }
    }

    #[test]
    fn test_first_bind_signals_online() {
        let registry = PresenceRegistry::new();
        let (a, _rx) = handle();

        let t = registry.bind(UserId(1), a.clone()).unwrap();
        assert_eq!(t, Some(Transition::BecameOnline(UserId(1))));
        assert!(registry.is_online(UserId(1)));
        assert_eq!(registry.identity_of(a.id()), Some(UserId(1)));
        assert_invariant(&registry, &[UserId(1)]);
    }

    #[test]
    fn test_two_sessions_one_online_one_offline() {
        let registry = PresenceRegistry::new();
        let (a, _rx_a) = handle();
        let (b, _rx_b) = handle();

        assert!(registry.bind(UserId(1), a.clone()).unwrap().is_some());
        assert!(registry.bind(UserId(1), b.clone()).unwrap().is_none());
        assert_eq!(registry.connections_for(UserId(1)).len(), 2);
        assert_eq!(registry.online_count(), 1);
        assert_eq!(registry.connection_count(), 2);

        // Dropping one of two sessions keeps the user online, silently.
        assert!(registry.unbind(a.id()).is_none());
        assert!(registry.is_online(UserId(1)));
        assert_invariant(&registry, &[UserId(1)]);

        assert_eq!(
            registry.unbind(b.id()),
            Some(Transition::BecameOffline(UserId(1)))
        );
        assert!(!registry.is_online(UserId(1)));
        assert!(registry.online_identities().is_empty());
        assert_invariant(&registry, &[UserId(1)]);
    }

    #[test]
    fn test_bind_is_idempotent() {
        let registry = PresenceRegistry::new();
        let (a, _rx) = handle();

        registry.bind(UserId(1), a.clone()).unwrap();
        assert!(registry.bind(UserId(1), a.clone()).unwrap().is_none());
        assert_eq!(registry.connections_for(UserId(1)).len(), 1);
    }

    #[test]
    fn test_rebind_to_other_user_is_refused() {
        let registry = PresenceRegistry::new();
        let (a, _rx) = handle();

        registry.bind(UserId(1), a.clone()).unwrap();
        let err = registry.bind(UserId(2), a.clone()).unwrap_err();
        assert!(matches!(
            err,
            Error::IdentityMismatch {
                bound: UserId(1),
                requested: UserId(2)
            }
        ));
        assert!(!registry.is_online(UserId(2)));
        assert_eq!(registry.identity_of(a.id()), Some(UserId(1)));
    }

    #[test]
    fn test_unbind_unknown_connection_is_noop() {
        let registry = PresenceRegistry::new();
        let (a, _rx) = handle();
        let (b, _rx_b) = handle();
        registry.bind(UserId(1), a).unwrap();

        assert!(registry.unbind(b.id()).is_none());
        assert_eq!(registry.online_count(), 1);
        assert_eq!(registry.connection_count(), 1);
    }

    #[test]
    fn test_signal_called_exactly_on_transitions() {
        let registry = PresenceRegistry::new();
        let (a, _rx_a) = handle();
        let (b, _rx_b) = handle();
        let seen = Mutex::new(Vec::new());

        registry
            .bind_with(UserId(9), a.clone(), |t| seen.lock().push(t))
            .unwrap();
        registry
            .bind_with(UserId(9), b.clone(), |t| seen.lock().push(t))
            .unwrap();
        registry.unbind_with(a.id(), |t| seen.lock().push(t));
        registry.unbind_with(b.id(), |t| seen.lock().push(t));

        assert_eq!(
            *seen.lock(),
            vec![
                Transition::BecameOnline(UserId(9)),
                Transition::BecameOffline(UserId(9)),
            ]
        );
    }

    #[test]
    fn test_broadcast_except_skips_origin() {
        let registry = PresenceRegistry::new();
        let (a, mut rx_a) = handle();
        let (b, mut rx_b) = handle();
        registry.bind(UserId(1), a.clone()).unwrap();
        registry.bind(UserId(2), b).unwrap();

        let delivered =
            registry.broadcast_except(Some(a.id()), &ServerMessage::UserOnline { user_id: UserId(1) });
        assert_eq!(delivered, 1);
        assert!(rx_a.try_recv().is_err());
        assert_eq!(
            rx_b.try_recv().unwrap(),
            ServerMessage::UserOnline { user_id: UserId(1) }
        );
    }

    #[test]
    fn test_online_identities_sorted_snapshot() {
        let registry = PresenceRegistry::new();
        let mut receivers = Vec::new();
        for id in [5, 1, 3] {
            let (h, rx) = handle();
            receivers.push(rx);
            registry.bind(UserId(id), h).unwrap();
        }
        assert_eq!(
            registry.online_identities(),
            vec![UserId(1), UserId(3), UserId(5)]
        );
    }

    #[test]
    fn test_concurrent_sessions_transitions_alternate() {
        let registry = PresenceRegistry::new();
        let log = Arc::new(Mutex::new(Vec::new()));
        let user = UserId(77);

        let threads: Vec<_> = (0..8)
            .map(|_| {
                let registry = registry.clone();
                let log = log.clone();
                std::thread::spawn(move || {
                    for _ in 0..200 {
                        let (tx, _rx) = mpsc::unbounded_channel();
                        let h = ConnectionHandle::new(ConnectionId::new(), tx);
                        let id = h.id();
                        registry
                            .bind_with(user, h, |t| log.lock().push(t))
                            .unwrap();
                        registry.unbind_with(id, |t| log.lock().push(t));
                    }
                })
            })
            .collect();

        for t in threads {
            t.join().unwrap();
        }

        let log = log.lock();
        assert!(!log.is_empty());
        assert_eq!(log.len() % 2, 0);
        // Signals are emitted under the per-user guard, so they must strictly
        // alternate: online, offline, online, offline, ...
        for (i, t) in log.iter().enumerate() {
            let expected = if i % 2 == 0 {
                Transition::BecameOnline(user)
            } else {
                Transition::BecameOffline(user)
            };
            assert_eq!(*t, expected, "out-of-order transition at index {}", i);
        }
        assert!(!registry.is_online(user));
        assert_eq!(registry.connection_count(), 0);
    }
}
