// SPDX-FileCopyrightText: 2026 Mattia Egloff <mattia.egloff@pm.me>
//
// SPDX-License-Identifier: GPL-3.0-or-later

//! WebSocket Accept Loop
//!
//! Accepts TCP connections, enforces the connection cap, performs the
//! WebSocket upgrade under a timeout and hands each upgraded stream to
//! [`handle_connection`].

use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpListener;
use tokio::sync::Semaphore;
use tokio::time::timeout;
use tokio_tungstenite::accept_async;
use tracing::{debug, warn};

use crate::handler::{handle_connection, ConnectionDeps};

/// Pause after a failed accept (e.g. out of file descriptors).
const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

/// Accept-loop settings.
#[derive(Debug, Clone)]
pub struct ServerSettings {
    pub max_connections: usize,
    pub upgrade_timeout: Duration,
}

/// Accepts connections until the returned future is dropped.
pub async fn serve(listener: TcpListener, deps: ConnectionDeps, settings: ServerSettings) {
    let slots = Arc::new(Semaphore::new(settings.max_connections));

    loop {
        let (stream, _addr) = match listener.accept().await {
            Ok(accepted) => accepted,
            Err(e) => {
                warn!("Accept failed: {}", e);
                tokio::time::sleep(ACCEPT_BACKOFF).await;
                continue;
            }
        };

        // Enforce connection limit
        let permit = match slots.clone().try_acquire_owned() {
            Ok(permit) => permit,
            Err(_) => {
                warn!(
                    "Connection rejected: at max capacity ({})",
                    settings.max_connections
                );
                deps.metrics.connection_errors.inc();
                drop(stream);
                continue;
            }
        };

        let deps = deps.clone();
        let upgrade_timeout = settings.upgrade_timeout;
        tokio::spawn(async move {
            // Keep the permit for the duration of the connection
            let _permit = permit;
            let metrics = deps.metrics.clone();

            match timeout(upgrade_timeout, accept_async(stream)).await {
                Ok(Ok(ws_stream)) => {
                    metrics.connections_total.inc();
                    metrics.connections_active.inc();
                    handle_connection(ws_stream, deps).await;
                    metrics.connections_active.dec();
                }
                Ok(Err(e)) => {
                    debug!("WebSocket upgrade failed: {}", e);
                    metrics.connection_errors.inc();
                }
                Err(_) => {
                    warn!("WebSocket upgrade timeout");
                    metrics.connection_errors.inc();
                }
            }
        });
    }
}
