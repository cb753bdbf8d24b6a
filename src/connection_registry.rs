// SPDX-FileCopyrightText: 2026 Mattia Egloff <mattia.egloff@pm.me>
//
// SPDX-License-Identifier: GPL-3.0-or-later

//! Connection Registry
//!
//! The canonical set of admitted connections plus the index from username
//! to the authenticated connection reachable under it. Usernames are
//! matched case-insensitively, like the credential store matches them.
//!
//! The registry is owned by the dispatch loop and is never shared: every
//! admission, eviction, lookup and delivery is one method call on one task,
//! so a lookup can never observe a half-evicted connection. The registry
//! also owns the sending half of every outbound queue; evicting a
//! connection drops it, which closes the queue for good.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::mpsc::{self, error::TrySendError};
use tracing::{debug, warn};

use crate::connection::{Connection, ConnectionId, Identity};
use crate::presence::PresenceUpdate;

/// What to do when a user authenticates while already connected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DuplicateLoginPolicy {
    /// The new connection takes over; the old one is closed.
    #[default]
    ReplaceExisting,
    /// The new connection's handshake fails.
    RejectNew,
}

/// Why a connection leaves the registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EvictReason {
    /// Transport closed or handshake failed. Already-queued frames are flushed.
    Disconnected,
    /// A newer login for the same user took over. Queued frames are flushed.
    Replaced,
    /// The outbound queue was full. The connection is aborted immediately.
    SlowConsumer,
}

/// Result of trying to put a frame on a connection's outbound queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    /// Queued for the outbound loop.
    Delivered,
    /// No such connection (or its queue already closed).
    NotConnected,
    /// The queue was full; the connection has been evicted and the frame dropped.
    Dropped,
}

/// Failure to bind an identity to a connection.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AuthenticateError {
    #[error("connection is not admitted")]
    NotAdmitted,
    #[error("connection is already authenticated")]
    AlreadyAuthenticated,
    #[error("user already has a live connection")]
    AlreadyConnected,
}

/// Outcome of a broadcast to every admitted connection.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BroadcastReport {
    pub delivered: usize,
    /// Slow consumers evicted instead of receiving the frame.
    pub evicted: usize,
}

/// Registry counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RegistryStats {
    /// All admitted connections, authenticated or not.
    pub connections: usize,
    /// Usernames currently reachable.
    pub users_online: usize,
}

struct Entry {
    conn: Arc<Connection>,
    outbound: mpsc::Sender<String>,
}

/// Admitted connections and the username index.
pub struct ConnectionRegistry {
    connections: HashMap<ConnectionId, Entry>,
    /// Keyed by [`index_key`].
    usernames: HashMap<String, ConnectionId>,
    duplicate_login: DuplicateLoginPolicy,
    /// Reachability changes not yet handed to the presence writer.
    presence: Vec<PresenceUpdate>,
}

fn index_key(username: &str) -> String {
    username.to_lowercase()
}

impl ConnectionRegistry {
    /// Creates an empty registry.
    pub fn new(duplicate_login: DuplicateLoginPolicy) -> Self {
        ConnectionRegistry {
            connections: HashMap::new(),
            usernames: HashMap::new(),
            duplicate_login,
            presence: Vec::new(),
        }
    }

    /// Adds a freshly accepted connection together with its outbound queue.
    ///
    /// Returns `false` (and changes nothing) if the ID is already admitted.
    pub fn admit(&mut self, conn: Arc<Connection>, outbound: mpsc::Sender<String>) -> bool {
        let id = conn.id();
        if self.connections.contains_key(&id) {
            warn!("[{}] Duplicate admission ignored", conn.label());
            return false;
        }
        self.connections.insert(id, Entry { conn, outbound });
        true
    }

    /// Binds `identity` to an admitted connection and makes it reachable by
    /// username.
    ///
    /// `ack` is queued to the connection before the username becomes
    /// visible, so it always precedes routed traffic. Under
    /// [`DuplicateLoginPolicy::ReplaceExisting`] an older connection for the
    /// same user is marked superseded and evicted; the user stays reachable
    /// throughout, so only an online update is recorded.
    pub fn authenticate(
        &mut self,
        id: ConnectionId,
        identity: Identity,
        ack: String,
    ) -> Result<(), AuthenticateError> {
        let conn = match self.connections.get(&id) {
            Some(entry) => entry.conn.clone(),
            None => return Err(AuthenticateError::NotAdmitted),
        };
        if conn.is_authenticated() {
            return Err(AuthenticateError::AlreadyAuthenticated);
        }

        let key = index_key(&identity.username);
        let displaced = self
            .usernames
            .get(&key)
            .copied()
            .filter(|&existing| existing != id);
        if displaced.is_some() && self.duplicate_login == DuplicateLoginPolicy::RejectNew {
            return Err(AuthenticateError::AlreadyConnected);
        }

        let username = identity.username.clone();
        if !conn.promote(identity) {
            return Err(AuthenticateError::AlreadyAuthenticated);
        }
        if self.enqueue(id, ack) != Delivery::Delivered {
            return Err(AuthenticateError::NotAdmitted);
        }

        // Index first: the displaced connection no longer owns the username
        self.usernames.insert(key, id);
        if let Some(old) = displaced {
            if let Some(entry) = self.connections.get(&old) {
                entry.conn.mark_superseded();
            }
            if let Some(replaced) = self.evict(old, EvictReason::Replaced) {
                debug!("[{}] Took over from [{}]", conn.label(), replaced.label());
            }
        }
        self.presence.push(PresenceUpdate::Online(username));
        Ok(())
    }

    /// Queues a frame for one connection, evicting it if its queue is full.
    pub fn enqueue(&mut self, id: ConnectionId, frame: String) -> Delivery {
        let entry = match self.connections.get(&id) {
            Some(entry) => entry,
            None => return Delivery::NotConnected,
        };
        match entry.outbound.try_send(frame) {
            Ok(()) => Delivery::Delivered,
            Err(TrySendError::Full(_)) => {
                warn!(
                    "[{}] Outbound queue full, evicting slow consumer",
                    entry.conn.label()
                );
                self.evict(id, EvictReason::SlowConsumer);
                Delivery::Dropped
            }
            Err(TrySendError::Closed(_)) => {
                self.evict(id, EvictReason::Disconnected);
                Delivery::NotConnected
            }
        }
    }

    /// Routes a frame to the authenticated connection registered under `username`.
    pub fn deliver(&mut self, username: &str, frame: String) -> Delivery {
        let id = match self.lookup(username) {
            Some(conn) => conn.id(),
            None => return Delivery::NotConnected,
        };
        self.enqueue(id, frame)
    }

    /// Finds the authenticated connection for a username.
    pub fn lookup(&self, username: &str) -> Option<&Arc<Connection>> {
        let id = self.usernames.get(&index_key(username))?;
        self.connections
            .get(id)
            .map(|entry| &entry.conn)
            .filter(|conn| conn.is_authenticated())
    }

    /// True if `username` is currently reachable.
    pub fn is_online(&self, username: &str) -> bool {
        self.lookup(username).is_some()
    }

    /// Removes a connection and closes its outbound queue.
    ///
    /// If the connection owned its username, the user goes offline. Returns
    /// the removed connection, or `None` if it was not admitted (evicting
    /// twice is a no-op).
    pub fn evict(&mut self, id: ConnectionId, reason: EvictReason) -> Option<Arc<Connection>> {
        let Entry { conn, outbound } = self.connections.remove(&id)?;

        if let Some(identity) = conn.identity() {
            let key = index_key(&identity.username);
            if self.usernames.get(&key) == Some(&id) {
                self.usernames.remove(&key);
                self.presence
                    .push(PresenceUpdate::Offline(identity.username.clone()));
            }
        }
        if reason == EvictReason::SlowConsumer {
            conn.close();
        }
        drop(outbound);

        debug!("[{}] Evicted ({:?})", conn.label(), reason);
        Some(conn)
    }

    /// Offers a frame to every admitted connection without blocking.
    ///
    /// Connections whose queue is full are evicted instead.
    pub fn broadcast_all(&mut self, frame: &str) -> BroadcastReport {
        let mut report = BroadcastReport::default();
        let mut stale = Vec::new();

        for (&id, entry) in &self.connections {
            match entry.outbound.try_send(frame.to_string()) {
                Ok(()) => report.delivered += 1,
                Err(TrySendError::Full(_)) => stale.push((id, EvictReason::SlowConsumer)),
                Err(TrySendError::Closed(_)) => stale.push((id, EvictReason::Disconnected)),
            }
        }
        for (id, reason) in stale {
            if self.evict(id, reason).is_some() && reason == EvictReason::SlowConsumer {
                report.evicted += 1;
            }
        }
        report
    }

    /// Drains the reachability changes recorded since the last call, oldest
    /// first.
    pub fn take_presence_updates(&mut self) -> Vec<PresenceUpdate> {
        std::mem::take(&mut self.presence)
    }

    /// Returns the current counters.
    pub fn stats(&self) -> RegistryStats {
        RegistryStats {
            connections: self.connections.len(),
            users_online: self.usernames.len(),
        }
    }
}

impl Default for ConnectionRegistry {
    fn default() -> Self {
        Self::new(DuplicateLoginPolicy::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc::error::TryRecvError;

    use crate::connection::outbound_queue;

    fn admit(
        registry: &mut ConnectionRegistry,
        id: ConnectionId,
        capacity: usize,
    ) -> (Arc<Connection>, mpsc::Receiver<String>) {
        let conn = Arc::new(Connection::new(id));
        let (tx, rx) = outbound_queue(capacity);
        assert!(registry.admit(conn.clone(), tx));
        (conn, rx)
    }

    fn identity(user_id: i64, username: &str) -> Identity {
        Identity {
            user_id,
            username: username.to_string(),
        }
    }

    fn login(registry: &mut ConnectionRegistry, id: ConnectionId, user_id: i64, username: &str) {
        registry
            .authenticate(id, identity(user_id, username), "Authenticated".into())
            .unwrap();
    }

    #[test]
    fn test_admit_counts_unauthenticated_connections() {
        let mut registry = ConnectionRegistry::default();
        let (_c1, _rx1) = admit(&mut registry, 1, 4);
        let (_c2, _rx2) = admit(&mut registry, 2, 4);

        assert_eq!(
            registry.stats(),
            RegistryStats {
                connections: 2,
                users_online: 0
            }
        );
    }

    #[test]
    fn test_duplicate_admission_is_rejected() {
        let mut registry = ConnectionRegistry::default();
        let (conn, _rx) = admit(&mut registry, 1, 4);
        let (tx, _rx2) = outbound_queue(4);
        assert!(!registry.admit(conn, tx));
        assert_eq!(registry.stats().connections, 1);
    }

    #[test]
    fn test_authenticate_queues_ack_and_indexes_username() {
        let mut registry = ConnectionRegistry::default();
        let (conn, mut rx) = admit(&mut registry, 1, 4);

        login(&mut registry, 1, 10, "alice");

        assert_eq!(rx.try_recv().unwrap(), "Authenticated");
        assert!(conn.is_authenticated());
        assert!(registry.is_online("alice"));
        assert_eq!(registry.lookup("alice").unwrap().id(), 1);
    }

    #[test]
    fn test_authenticate_twice_keeps_first_identity() {
        let mut registry = ConnectionRegistry::default();
        let (conn, _rx) = admit(&mut registry, 1, 4);
        login(&mut registry, 1, 10, "alice");

        let err = registry
            .authenticate(1, identity(11, "bob"), "Authenticated".into())
            .unwrap_err();

        assert_eq!(err, AuthenticateError::AlreadyAuthenticated);
        assert_eq!(conn.identity().unwrap().username, "alice");
        assert!(!registry.is_online("bob"));
    }

    #[test]
    fn test_authenticate_unknown_connection() {
        let mut registry = ConnectionRegistry::default();
        let err = registry
            .authenticate(99, identity(1, "alice"), "Authenticated".into())
            .unwrap_err();
        assert_eq!(err, AuthenticateError::NotAdmitted);
    }

    #[test]
    fn test_deliver_to_registered_user() {
        let mut registry = ConnectionRegistry::default();
        let (_alice, _arx) = admit(&mut registry, 1, 4);
        let (_bob, mut brx) = admit(&mut registry, 2, 4);
        login(&mut registry, 1, 10, "alice");
        login(&mut registry, 2, 20, "bob");
        assert_eq!(brx.try_recv().unwrap(), "Authenticated");

        assert_eq!(registry.deliver("bob", "XYZ".into()), Delivery::Delivered);
        assert_eq!(brx.try_recv().unwrap(), "XYZ");
    }

    #[test]
    fn test_deliver_to_unknown_user() {
        let mut registry = ConnectionRegistry::default();
        assert_eq!(
            registry.deliver("carol", "XYZ".into()),
            Delivery::NotConnected
        );
    }

    #[test]
    fn test_unauthenticated_connection_is_not_routable() {
        let mut registry = ConnectionRegistry::default();
        let (_conn, mut rx) = admit(&mut registry, 1, 4);

        assert_eq!(registry.deliver("", "x".into()), Delivery::NotConnected);
        assert!(matches!(rx.try_recv(), Err(TryRecvError::Empty)));
    }

    #[test]
    fn test_evict_is_idempotent() {
        let mut registry = ConnectionRegistry::default();
        let (_conn, mut rx) = admit(&mut registry, 1, 4);
        login(&mut registry, 1, 10, "alice");

        assert!(registry.evict(1, EvictReason::Disconnected).is_some());
        assert!(registry.evict(1, EvictReason::Disconnected).is_none());
        assert!(registry.evict(1, EvictReason::SlowConsumer).is_none());

        assert!(!registry.is_online("alice"));
        assert_eq!(registry.stats(), RegistryStats::default());

        // Queue drains what was already there, then reports closed
        assert_eq!(rx.try_recv().unwrap(), "Authenticated");
        assert!(matches!(rx.try_recv(), Err(TryRecvError::Disconnected)));
    }

    #[test]
    fn test_graceful_evict_does_not_abort() {
        let mut registry = ConnectionRegistry::default();
        let (conn, _rx) = admit(&mut registry, 1, 4);
        registry.evict(1, EvictReason::Disconnected);
        assert!(!conn.is_closed());
    }

    #[test]
    fn test_full_queue_evicts_slow_consumer() {
        let mut registry = ConnectionRegistry::default();
        let (_alice, _arx) = admit(&mut registry, 1, 256);
        let (bob, _brx_never_drained) = admit(&mut registry, 2, 256);
        login(&mut registry, 1, 10, "alice");
        login(&mut registry, 2, 20, "bob");

        // The ack already occupies one slot of bob's queue
        let outcomes: Vec<Delivery> = (0..300)
            .map(|i| registry.deliver("bob", format!("msg-{}", i)))
            .collect();

        let delivered = outcomes
            .iter()
            .filter(|d| **d == Delivery::Delivered)
            .count();
        assert_eq!(delivered, 255);
        assert_eq!(outcomes[255], Delivery::Dropped);
        assert!(outcomes[256..].iter().all(|d| *d == Delivery::NotConnected));

        assert!(bob.is_closed(), "slow consumer must be aborted");
        assert!(!registry.is_online("bob"));
        assert!(registry.is_online("alice"), "sender is unaffected");
    }

    #[test]
    fn test_enqueue_to_closed_queue_evicts() {
        let mut registry = ConnectionRegistry::default();
        let (_conn, rx) = admit(&mut registry, 1, 4);
        drop(rx);

        assert_eq!(registry.enqueue(1, "x".into()), Delivery::NotConnected);
        assert_eq!(registry.stats().connections, 0);
    }

    #[test]
    fn test_broadcast_reaches_all_and_evicts_full() {
        let mut registry = ConnectionRegistry::default();
        let (_a, mut arx) = admit(&mut registry, 1, 4);
        let (_b, mut brx) = admit(&mut registry, 2, 4);
        let (slow, _srx) = admit(&mut registry, 3, 1);
        login(&mut registry, 2, 20, "bob");
        // conn 3 is unauthenticated and its single slot is taken
        assert_eq!(registry.enqueue(3, "filler".into()), Delivery::Delivered);

        let report = registry.broadcast_all("Server shutting down");

        assert_eq!(
            report,
            BroadcastReport {
                delivered: 2,
                evicted: 1
            }
        );
        assert_eq!(arx.try_recv().unwrap(), "Server shutting down");
        assert_eq!(brx.try_recv().unwrap(), "Authenticated");
        assert_eq!(brx.try_recv().unwrap(), "Server shutting down");
        assert!(slow.is_closed());
        assert_eq!(registry.stats().connections, 2);
    }

    #[test]
    fn test_duplicate_login_replaces_existing() {
        let mut registry = ConnectionRegistry::new(DuplicateLoginPolicy::ReplaceExisting);
        let (old, mut old_rx) = admit(&mut registry, 1, 4);
        let (new, mut new_rx) = admit(&mut registry, 2, 4);

        login(&mut registry, 1, 10, "alice");
        login(&mut registry, 2, 10, "alice");

        assert!(old.is_superseded());
        assert!(!new.is_superseded());
        assert_eq!(registry.lookup("alice").unwrap().id(), 2);
        assert_eq!(registry.stats().connections, 1);

        // Old queue is closed after its ack
        assert_eq!(old_rx.try_recv().unwrap(), "Authenticated");
        assert!(matches!(old_rx.try_recv(), Err(TryRecvError::Disconnected)));

        assert_eq!(registry.deliver("alice", "hi".into()), Delivery::Delivered);
        assert_eq!(new_rx.try_recv().unwrap(), "Authenticated");
        assert_eq!(new_rx.try_recv().unwrap(), "hi");
    }

    #[test]
    fn test_duplicate_login_rejects_new() {
        let mut registry = ConnectionRegistry::new(DuplicateLoginPolicy::RejectNew);
        let (old, _old_rx) = admit(&mut registry, 1, 4);
        let (new, mut new_rx) = admit(&mut registry, 2, 4);

        login(&mut registry, 1, 10, "alice");
        let err = registry
            .authenticate(2, identity(10, "alice"), "Authenticated".into())
            .unwrap_err();

        assert_eq!(err, AuthenticateError::AlreadyConnected);
        assert!(!new.is_authenticated());
        assert!(!old.is_superseded());
        assert_eq!(registry.lookup("alice").unwrap().id(), 1);
        assert!(matches!(new_rx.try_recv(), Err(TryRecvError::Empty)));
    }

    #[test]
    fn test_usernames_match_case_insensitively() {
        let mut registry = ConnectionRegistry::default();
        let (_alice, mut rx) = admit(&mut registry, 1, 4);
        login(&mut registry, 1, 10, "alice");
        assert_eq!(rx.try_recv().unwrap(), "Authenticated");

        assert!(registry.is_online("ALICE"));
        assert_eq!(registry.deliver("Alice", "XYZ".into()), Delivery::Delivered);
        assert_eq!(rx.try_recv().unwrap(), "XYZ");
    }

    #[test]
    fn test_presence_updates_follow_reachability() {
        let mut registry = ConnectionRegistry::default();
        let (_c1, _rx1) = admit(&mut registry, 1, 4);
        let (_c2, _rx2) = admit(&mut registry, 2, 4);

        login(&mut registry, 1, 10, "alice");
        registry.evict(1, EvictReason::Disconnected);
        registry.evict(1, EvictReason::Disconnected);
        login(&mut registry, 2, 10, "alice");

        assert_eq!(
            registry.take_presence_updates(),
            vec![
                PresenceUpdate::Online("alice".into()),
                PresenceUpdate::Offline("alice".into()),
                PresenceUpdate::Online("alice".into()),
            ]
        );
        assert!(registry.take_presence_updates().is_empty());
    }

    #[test]
    fn test_unauthenticated_eviction_records_no_presence() {
        let mut registry = ConnectionRegistry::default();
        let (_conn, _rx) = admit(&mut registry, 1, 4);
        registry.evict(1, EvictReason::Disconnected);
        assert!(registry.take_presence_updates().is_empty());
    }

    #[test]
    fn test_replaced_login_never_goes_offline() {
        let mut registry = ConnectionRegistry::new(DuplicateLoginPolicy::ReplaceExisting);
        let (_old, _old_rx) = admit(&mut registry, 1, 4);
        let (_new, _new_rx) = admit(&mut registry, 2, 4);
        login(&mut registry, 1, 10, "alice");
        login(&mut registry, 2, 10, "alice");
        registry.evict(1, EvictReason::Disconnected);

        assert_eq!(
            registry.take_presence_updates(),
            vec![
                PresenceUpdate::Online("alice".into()),
                PresenceUpdate::Online("alice".into()),
            ]
        );
    }

    #[test]
    fn test_superseded_eviction_keeps_new_index_entry() {
        let mut registry = ConnectionRegistry::new(DuplicateLoginPolicy::ReplaceExisting);
        let (_old, _old_rx) = admit(&mut registry, 1, 4);
        let (_new, _new_rx) = admit(&mut registry, 2, 4);
        login(&mut registry, 1, 10, "alice");
        login(&mut registry, 2, 10, "alice");

        // Teardown of the old connection arrives late
        assert!(registry.evict(1, EvictReason::Disconnected).is_none());
        assert!(registry.is_online("alice"));
    }
}
