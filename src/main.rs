// SPDX-FileCopyrightText: 2026 Mattia Egloff <mattia.egloff@pm.me>
//
// SPDX-License-Identifier: GPL-3.0-or-later

//! Chatterbox Relay Server
//!
//! Real-time relay for end-to-end encrypted chat. Provides:
//! - WebSocket endpoint: credential handshake, then opaque ciphertext routing
//! - HTTP endpoints for health checks, Prometheus metrics and presence lookups
//! - Per-connection rate limiting and slow-consumer eviction

use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::net::TcpListener;
use tracing::{error, info, warn};

use chatterbox_relay::config::RelayConfig;
use chatterbox_relay::dispatch;
use chatterbox_relay::handler::ConnectionDeps;
use chatterbox_relay::http::{create_router, HttpState};
use chatterbox_relay::metrics::RelayMetrics;
use chatterbox_relay::protocol::Notice;
use chatterbox_relay::server::{self, ServerSettings};
use chatterbox_relay::storage::create_store;

/// Time allowed for the shutdown notice to reach clients.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(1);

#[tokio::main]
async fn main() {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("chatterbox_relay=info".parse().unwrap()),
        )
        .init();

    // Load configuration
    let config = RelayConfig::from_env();

    // TLS enforcement: credentials travel in the first frame
    let is_localhost = config.listen_addr.ip().is_loopback();
    let tls_verified = std::env::var("RELAY_TLS_VERIFIED")
        .map(|v| v == "true" || v == "1")
        .unwrap_or(false);

    if !is_localhost && !tls_verified {
        error!("=======================================================================");
        error!("SECURITY ERROR: Relay MUST run behind a TLS proxy in production!");
        error!("=======================================================================");
        error!("");
        error!("The relay server is configured to listen on a non-localhost address");
        error!(
            "({}) but TLS verification has not been confirmed.",
            config.listen_addr
        );
        error!("Clients send their username and password in the first frame.");
        error!("");
        error!("To fix this, either:");
        error!("  1. Run behind a TLS-terminating proxy (nginx, Caddy, etc.) and set");
        error!("     RELAY_TLS_VERIFIED=true to confirm TLS is handled externally");
        error!("");
        error!("  2. Bind to localhost (127.0.0.1) for local development:");
        error!("     RELAY_LISTEN_ADDR=127.0.0.1:8080");
        error!("=======================================================================");
        std::process::exit(1);
    }

    info!(
        "Starting Chatterbox Relay Server v{}",
        env!("CARGO_PKG_VERSION")
    );
    info!("WebSocket: {}", config.listen_addr);
    if tls_verified {
        info!("TLS: Verified (handled by external proxy)");
    } else {
        info!("TLS: Local development mode (localhost only)");
    }
    info!("Metrics endpoint: {}", config.metrics_addr);
    info!("Storage backend: {:?}", config.storage_backend);
    info!("Duplicate login policy: {:?}", config.duplicate_login);

    let store = match create_store(config.storage_backend, &config.database_path) {
        Ok(store) => store,
        Err(e) => {
            error!(
                "Failed to open store at {}: {}",
                config.database_path.display(),
                e
            );
            std::process::exit(1);
        }
    };

    let metrics = RelayMetrics::new();
    let (dispatch, _dispatch_task) =
        dispatch::spawn(config.duplicate_login, metrics.clone(), store.clone());

    if config.metrics_token.is_some() {
        info!("Metrics endpoint protected with bearer token");
    } else if !config.metrics_addr.ip().is_loopback() {
        warn!("Metrics exposed on non-localhost without auth token");
        warn!("Consider setting RELAY_METRICS_TOKEN for production use");
    }

    // Start HTTP server for health/metrics/presence
    let http_state = HttpState {
        metrics: metrics.clone(),
        metrics_token: config.metrics_token.clone(),
        store: store.clone(),
        dispatch: dispatch.clone(),
        started_at: Instant::now(),
    };
    let http_router = create_router(http_state);
    let http_listener = match TcpListener::bind(config.metrics_addr).await {
        Ok(listener) => listener,
        Err(e) => {
            error!("Failed to bind HTTP listener {}: {}", config.metrics_addr, e);
            std::process::exit(1);
        }
    };
    let http_addr = config.metrics_addr;
    tokio::spawn(async move {
        info!("HTTP server listening on {}", http_addr);
        if let Err(e) = axum::serve(http_listener, http_router).await {
            error!("HTTP server stopped: {}", e);
        }
    });

    // Start TCP listener for WebSocket
    let listener = match TcpListener::bind(config.listen_addr).await {
        Ok(listener) => listener,
        Err(e) => {
            error!(
                "Failed to bind WebSocket listener {}: {}",
                config.listen_addr, e
            );
            std::process::exit(1);
        }
    };
    info!("WebSocket server listening on {}", config.listen_addr);

    let deps = ConnectionDeps {
        store: Arc::clone(&store),
        dispatch: dispatch.clone(),
        metrics,
        outbound_capacity: config.outbound_capacity,
        max_message_size: config.max_message_size,
        rate_limit_per_min: config.rate_limit_per_min,
    };
    let settings = ServerSettings {
        max_connections: config.max_connections,
        upgrade_timeout: config.upgrade_timeout(),
    };

    tokio::select! {
        _ = server::serve(listener, deps, settings) => {}
        _ = tokio::signal::ctrl_c() => {
            info!("Shutdown requested");
        }
    }

    match dispatch.broadcast(Notice::ShuttingDown).await {
        Ok(report) => info!(
            "Notified {} connections ({} slow consumers evicted)",
            report.delivered, report.evicted
        ),
        Err(e) => warn!("Shutdown broadcast failed: {}", e),
    }

    // Give outbound loops a moment to flush the notice
    tokio::time::sleep(SHUTDOWN_GRACE).await;
    info!("Relay stopped");
}
