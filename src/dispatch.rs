// SPDX-FileCopyrightText: 2026 Mattia Egloff <mattia.egloff@pm.me>
//
// SPDX-License-Identifier: GPL-3.0-or-later

//! Dispatch Loop
//!
//! The single task that owns the [`ConnectionRegistry`]. Connection tasks,
//! the router, the HTTP side port and the shutdown path talk to it through a
//! cloneable [`DispatchHandle`]; requests that need an answer carry a
//! oneshot reply.
//!
//! Commands are executed strictly one at a time, in arrival order. This is
//! what makes a lookup-and-enqueue atomic with respect to eviction, and what
//! keeps each connection's notices in the order its own task issued them.
//! Reachability changes are forwarded to the presence writer in that same
//! order.

use std::sync::Arc;

use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::debug;

use crate::connection::{Connection, ConnectionId, Identity};
use crate::connection_registry::{
    AuthenticateError, BroadcastReport, ConnectionRegistry, Delivery, DuplicateLoginPolicy,
    EvictReason, RegistryStats,
};
use crate::metrics::RelayMetrics;
use crate::presence::{self, PresenceSender};
use crate::protocol::Notice;
use crate::storage::ChatStore;

/// Capacity of the command channel.
const COMMAND_CAPACITY: usize = 1024;

/// Dispatch errors.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DispatchError {
    #[error("dispatch loop is not running")]
    Closed,
    #[error(transparent)]
    Rejected(#[from] AuthenticateError),
}

enum Command {
    Admit {
        conn: Arc<Connection>,
        outbound: mpsc::Sender<String>,
    },
    Authenticate {
        id: ConnectionId,
        identity: Identity,
        reply: oneshot::Sender<Result<(), AuthenticateError>>,
    },
    Notify {
        id: ConnectionId,
        frame: String,
    },
    Deliver {
        recipient: String,
        frame: String,
        reply: oneshot::Sender<Delivery>,
    },
    Evict {
        id: ConnectionId,
        reason: EvictReason,
    },
    Broadcast {
        frame: String,
        reply: oneshot::Sender<BroadcastReport>,
    },
    IsOnline {
        username: String,
        reply: oneshot::Sender<bool>,
    },
    Stats {
        reply: oneshot::Sender<RegistryStats>,
    },
}

/// The registry owner.
pub struct Dispatcher {
    registry: ConnectionRegistry,
    commands: mpsc::Receiver<Command>,
    presence: PresenceSender,
    metrics: RelayMetrics,
}

impl Dispatcher {
    /// Creates a dispatcher and the handle used to reach it.
    pub fn new(
        duplicate_login: DuplicateLoginPolicy,
        metrics: RelayMetrics,
        presence: PresenceSender,
    ) -> (Self, DispatchHandle) {
        let (tx, rx) = mpsc::channel(COMMAND_CAPACITY);
        let dispatcher = Dispatcher {
            registry: ConnectionRegistry::new(duplicate_login),
            commands: rx,
            presence,
            metrics,
        };
        (dispatcher, DispatchHandle { commands: tx })
    }

    /// Runs until every [`DispatchHandle`] has been dropped.
    ///
    /// Dropping the registry on exit closes every outbound queue.
    pub async fn run(mut self) {
        while let Some(command) = self.commands.recv().await {
            self.execute(command);
            for update in self.registry.take_presence_updates() {
                if self.presence.send(update).is_err() {
                    debug!("Presence writer gone, update dropped");
                }
            }
            self.metrics
                .users_online
                .set(self.registry.stats().users_online as i64);
        }
        debug!("Dispatch loop stopped");
    }

    fn execute(&mut self, command: Command) {
        match command {
            Command::Admit { conn, outbound } => {
                self.registry.admit(conn, outbound);
            }
            Command::Authenticate {
                id,
                identity,
                reply,
            } => {
                let result = self
                    .registry
                    .authenticate(id, identity, Notice::Authenticated.into());
                let _ = reply.send(result);
            }
            Command::Notify { id, frame } => {
                let delivery = self.registry.enqueue(id, frame);
                self.record(delivery);
            }
            Command::Deliver {
                recipient,
                frame,
                reply,
            } => {
                let delivery = self.registry.deliver(&recipient, frame);
                self.record(delivery);
                let _ = reply.send(delivery);
            }
            Command::Evict { id, reason } => {
                self.registry.evict(id, reason);
            }
            Command::Broadcast { frame, reply } => {
                let report = self.registry.broadcast_all(&frame);
                self.metrics.broadcasts.inc();
                self.metrics
                    .slow_consumer_evictions
                    .inc_by(report.evicted as u64);
                let _ = reply.send(report);
            }
            Command::IsOnline { username, reply } => {
                let _ = reply.send(self.registry.is_online(&username));
            }
            Command::Stats { reply } => {
                let _ = reply.send(self.registry.stats());
            }
        }
    }

    fn record(&self, delivery: Delivery) {
        if delivery == Delivery::Dropped {
            self.metrics.slow_consumer_evictions.inc();
        }
    }
}

/// Spawns the dispatch loop and its presence writer on the current runtime.
///
/// The writer stops once the dispatch loop has stopped and drained.
pub fn spawn(
    duplicate_login: DuplicateLoginPolicy,
    metrics: RelayMetrics,
    store: Arc<dyn ChatStore>,
) -> (DispatchHandle, JoinHandle<()>) {
    let (presence_tx, presence_rx) = presence::channel();
    tokio::spawn(presence::run_presence_writer(store, presence_rx));
    let (dispatcher, handle) = Dispatcher::new(duplicate_login, metrics, presence_tx);
    let task = tokio::spawn(dispatcher.run());
    (handle, task)
}

/// Cloneable handle to the dispatch loop.
#[derive(Clone)]
pub struct DispatchHandle {
    commands: mpsc::Sender<Command>,
}

impl DispatchHandle {
    async fn send(&self, command: Command) -> Result<(), DispatchError> {
        self.commands
            .send(command)
            .await
            .map_err(|_| DispatchError::Closed)
    }

    async fn request<T>(
        &self,
        build: impl FnOnce(oneshot::Sender<T>) -> Command,
    ) -> Result<T, DispatchError> {
        let (reply, answer) = oneshot::channel();
        self.send(build(reply)).await?;
        answer.await.map_err(|_| DispatchError::Closed)
    }

    /// Registers a freshly accepted connection and its outbound queue.
    pub async fn admit(
        &self,
        conn: Arc<Connection>,
        outbound: mpsc::Sender<String>,
    ) -> Result<(), DispatchError> {
        self.send(Command::Admit { conn, outbound }).await
    }

    /// Promotes a connection and queues the "Authenticated" acknowledgment.
    pub async fn authenticate(
        &self,
        id: ConnectionId,
        identity: Identity,
    ) -> Result<(), DispatchError> {
        self.request(|reply| Command::Authenticate {
            id,
            identity,
            reply,
        })
        .await??;
        Ok(())
    }

    /// Queues a frame for one connection without waiting for the outcome.
    pub async fn notify(
        &self,
        id: ConnectionId,
        frame: impl Into<String>,
    ) -> Result<(), DispatchError> {
        self.send(Command::Notify {
            id,
            frame: frame.into(),
        })
        .await
    }

    /// Looks up `recipient` and queues `frame` to it in one step.
    pub async fn deliver(
        &self,
        recipient: &str,
        frame: String,
    ) -> Result<Delivery, DispatchError> {
        self.request(|reply| Command::Deliver {
            recipient: recipient.to_string(),
            frame,
            reply,
        })
        .await
    }

    /// Removes a connection. Evicting twice is harmless.
    pub async fn evict(&self, id: ConnectionId, reason: EvictReason) -> Result<(), DispatchError> {
        self.send(Command::Evict { id, reason }).await
    }

    /// Offers a frame to every admitted connection.
    pub async fn broadcast(&self, frame: impl Into<String>) -> Result<BroadcastReport, DispatchError> {
        let frame = frame.into();
        self.request(|reply| Command::Broadcast { frame, reply })
            .await
    }

    /// True if `username` has a live authenticated connection.
    pub async fn is_online(&self, username: &str) -> Result<bool, DispatchError> {
        self.request(|reply| Command::IsOnline {
            username: username.to_string(),
            reply,
        })
        .await
    }

    /// Current registry counters.
    pub async fn stats(&self) -> Result<RegistryStats, DispatchError> {
        self.request(|reply| Command::Stats { reply }).await
    }
}
