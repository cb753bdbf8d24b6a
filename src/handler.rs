// SPDX-FileCopyrightText: 2026 Mattia Egloff <mattia.egloff@pm.me>
//
// SPDX-License-Identifier: GPL-3.0-or-later

//! WebSocket Connection Handler
//!
//! Handles individual client connections: admission, the single-shot
//! credential handshake, the authenticated read loop and teardown.
//! Presence is not written here; the dispatch loop records it whenever a
//! username gains or loses its connection.

use std::sync::Arc;
use std::time::Duration;

use futures_util::{Stream, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::{self, Message};
use tokio_tungstenite::WebSocketStream;
use tracing::{debug, warn};

use crate::connection::{next_connection_id, outbound_queue, run_outbound, Connection, Identity};
use crate::connection_registry::EvictReason;
use crate::dispatch::{DispatchError, DispatchHandle};
use crate::gate::CredentialGate;
use crate::metrics::RelayMetrics;
use crate::protocol::{ChatEnvelope, Notice};
use crate::rate_limit::MessageBudget;
use crate::router::{RouteError, Router};
use crate::storage::ChatStore;

/// How long teardown waits for the outbound loop to flush what was queued.
const WRITER_DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

/// Everything a connection task needs, shared across connections.
#[derive(Clone)]
pub struct ConnectionDeps {
    pub store: Arc<dyn ChatStore>,
    pub dispatch: DispatchHandle,
    pub metrics: RelayMetrics,
    pub outbound_capacity: usize,
    pub max_message_size: usize,
    pub rate_limit_per_min: u32,
}

/// Handles a single WebSocket connection until it closes.
///
/// The first frame must carry credentials. Afterwards every frame is a chat
/// envelope routed to its recipient; per-message problems are answered with
/// a notice and the connection stays open. The connection is evicted from
/// the registry before this returns.
pub async fn handle_connection<S>(ws_stream: WebSocketStream<S>, deps: ConnectionDeps)
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let ConnectionDeps {
        store,
        dispatch,
        metrics,
        outbound_capacity,
        max_message_size,
        rate_limit_per_min,
    } = deps;

    let conn = Arc::new(Connection::new(next_connection_id()));
    let session = conn.label().to_string();

    let (write, mut read) = ws_stream.split();
    let (outbound, queue) = outbound_queue(outbound_capacity);
    if dispatch.admit(conn.clone(), outbound).await.is_err() {
        warn!("[{}] Dispatch loop gone, dropping connection", session);
        return;
    }
    let mut writer = tokio::spawn(run_outbound(conn.clone(), queue, write));

    // Single-shot handshake on the first frame
    let gate = CredentialGate::new(store.clone(), dispatch.clone());
    let identity = match next_frame(&conn, &mut read).await {
        Some(frame) => match gate.authenticate(&conn, &frame).await {
            Ok(identity) => Some(identity),
            Err(e) => {
                metrics.handshake_failures.inc();
                warn!("[{}] Handshake rejected: {}", session, e);
                let _ = dispatch.notify(conn.id(), e.notice()).await;
                None
            }
        },
        None => {
            debug!("[{}] Connection closed before handshake", session);
            None
        }
    };

    if let Some(identity) = &identity {
        let router = Router::new(store.clone(), dispatch.clone(), metrics.clone());
        let mut budget = MessageBudget::per_minute(rate_limit_per_min);

        while let Some(frame) = next_frame(&conn, &mut read).await {
            metrics.messages_received.inc();

            let outcome = process_frame(
                &frame,
                identity,
                &router,
                &mut budget,
                max_message_size,
                &metrics,
            )
            .await;

            let notice = match outcome {
                Ok(notice) => notice,
                Err(e) => {
                    warn!("[{}] {}", session, e);
                    break;
                }
            };
            if let Some(notice) = notice {
                if dispatch.notify(conn.id(), notice).await.is_err() {
                    break;
                }
            }
        }
    }

    // Teardown: unreachable first, then let the outbound loop flush
    let _ = dispatch.evict(conn.id(), EvictReason::Disconnected).await;
    if conn.is_superseded() {
        debug!("[{}] Superseded by a newer login", session);
    }

    if timeout(WRITER_DRAIN_TIMEOUT, &mut writer).await.is_err() {
        conn.close();
        let _ = writer.await;
    }
    debug!("[{}] Connection closed", session);
}

/// Reads the next data frame, or `None` once the transport or the
/// connection is closed.
async fn next_frame<R>(conn: &Connection, read: &mut R) -> Option<Vec<u8>>
where
    R: Stream<Item = Result<Message, tungstenite::Error>> + Unpin,
{
    loop {
        let msg = tokio::select! {
            biased;
            _ = conn.closed() => return None,
            msg = read.next() => msg,
        };
        match msg {
            Some(Ok(Message::Text(text))) => return Some(text.into_bytes()),
            Some(Ok(Message::Binary(data))) => return Some(data),
            Some(Ok(Message::Close(_))) | None => return None,
            Some(Ok(_)) => continue,
            Some(Err(e)) => {
                debug!("[{}] Read error: {}", conn.label(), e);
                return None;
            }
        }
    }
}

/// Handles one post-auth frame. Returns the notice owed to the sender, if any.
async fn process_frame(
    frame: &[u8],
    sender: &Identity,
    router: &Router,
    budget: &mut Option<MessageBudget>,
    max_message_size: usize,
    metrics: &RelayMetrics,
) -> Result<Option<Notice>, DispatchError> {
    if frame.len() > max_message_size {
        metrics.messages_rejected.inc();
        return Ok(Some(Notice::MessageTooLarge));
    }

    if let Some(budget) = budget {
        if !budget.try_spend() {
            metrics.rate_limited.inc();
            return Ok(Some(Notice::RateLimited));
        }
    }

    let envelope = match ChatEnvelope::parse(frame) {
        Ok(envelope) => envelope,
        Err(_) => {
            metrics.messages_rejected.inc();
            return Ok(Some(Notice::InvalidChatFormat));
        }
    };

    match router.route(sender, envelope).await {
        Ok(()) => Ok(None),
        Err(RouteError::Dispatch(e)) => Err(e),
        Err(e) => {
            if matches!(e, RouteError::MissingFields) {
                metrics.messages_rejected.inc();
            }
            Ok(e.notice())
        }
    }
}
