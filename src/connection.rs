// SPDX-FileCopyrightText: 2026 Mattia Egloff <mattia.egloff@pm.me>
//
// SPDX-License-Identifier: GPL-3.0-or-later

//! Connection State
//!
//! One [`Connection`] exists per accepted WebSocket. It carries the
//! authentication state and the shutdown signal shared by the connection's
//! inbound loop, its outbound loop and the registry. The outbound queue's
//! sending half lives in the registry; the receiving half is drained by
//! [`run_outbound`].

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::OnceLock;
use std::time::Duration;

use futures_util::{Sink, SinkExt};
use tokio::sync::mpsc;
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::Message;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Process-unique connection number.
pub type ConnectionId = u64;

/// Bound on sending the closing handshake once the queue is drained.
const CLOSE_GRACE: Duration = Duration::from_secs(2);

static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

/// Allocates the next connection ID.
pub fn next_connection_id() -> ConnectionId {
    NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed)
}

/// Who an authenticated connection belongs to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity {
    pub user_id: i64,
    pub username: String,
}

/// Shared per-connection state.
#[derive(Debug)]
pub struct Connection {
    id: ConnectionId,
    session: String,
    identity: OnceLock<Identity>,
    superseded: AtomicBool,
    shutdown: CancellationToken,
}

impl Connection {
    /// Creates an unauthenticated connection.
    pub fn new(id: ConnectionId) -> Self {
        Connection {
            id,
            session: uuid::Uuid::new_v4().to_string()[..8].to_string(),
            identity: OnceLock::new(),
            superseded: AtomicBool::new(false),
            shutdown: CancellationToken::new(),
        }
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    /// Random session label for log lines. Never contains the username.
    pub fn label(&self) -> &str {
        &self.session
    }

    /// The authenticated identity, if the handshake succeeded.
    pub fn identity(&self) -> Option<&Identity> {
        self.identity.get()
    }

    pub fn is_authenticated(&self) -> bool {
        self.identity.get().is_some()
    }

    /// Moves the connection to the authenticated state.
    ///
    /// Returns `false` if it was already authenticated; the first identity
    /// is kept.
    pub(crate) fn promote(&self, identity: Identity) -> bool {
        self.identity.set(identity).is_ok()
    }

    /// Marks the connection as displaced by a newer login for the same user.
    pub(crate) fn mark_superseded(&self) {
        self.superseded.store(true, Ordering::SeqCst);
    }

    /// True if a newer connection took over this connection's username.
    pub fn is_superseded(&self) -> bool {
        self.superseded.load(Ordering::SeqCst)
    }

    /// Signals both loops to stop. Idempotent.
    pub fn close(&self) {
        self.shutdown.cancel();
    }

    pub fn is_closed(&self) -> bool {
        self.shutdown.is_cancelled()
    }

    /// Resolves once [`close`](Self::close) has been called.
    pub async fn closed(&self) {
        self.shutdown.cancelled().await
    }
}

/// Creates a bounded outbound queue.
pub fn outbound_queue(capacity: usize) -> (mpsc::Sender<String>, mpsc::Receiver<String>) {
    mpsc::channel(capacity.max(1))
}

/// Drains the outbound queue onto the WebSocket in FIFO order.
///
/// Stops when the queue is closed (after writing everything already queued),
/// when the connection is closed (pending items are abandoned), or on the
/// first write error. Always closes the connection on the way out so the
/// inbound loop stops too.
pub async fn run_outbound<S>(
    conn: std::sync::Arc<Connection>,
    mut queue: mpsc::Receiver<String>,
    mut sink: S,
) where
    S: Sink<Message> + Unpin,
    S::Error: std::fmt::Display,
{
    let session = conn.label();

    loop {
        let frame = tokio::select! {
            biased;
            _ = conn.closed() => break,
            frame = queue.recv() => match frame {
                Some(frame) => frame,
                None => break,
            },
        };

        let sent = tokio::select! {
            biased;
            _ = conn.closed() => break,
            sent = sink.send(Message::Text(frame)) => sent,
        };
        if let Err(e) = sent {
            debug!("[{}] Write failed: {}", session, e);
            break;
        }
    }

    let aborted = conn.is_closed();
    conn.close();
    if !aborted {
        let _ = timeout(CLOSE_GRACE, sink.close()).await;
    }
    debug!("[{}] Outbound loop stopped (aborted: {})", session, aborted);
}
