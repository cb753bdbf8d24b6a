// SPDX-FileCopyrightText: 2026 Mattia Egloff <mattia.egloff@pm.me>
//
// SPDX-License-Identifier: GPL-3.0-or-later

//! HTTP Server for Health, Metrics and Presence Endpoints
//!
//! Provides REST endpoints for monitoring plus read-only user lookups:
//! - `GET /health`
//! - `GET /metrics` (optionally behind a bearer token)
//! - `GET /users/:username/presence`
//! - `GET /users/:username/public_key`

use std::sync::Arc;
use std::time::Instant;

use axum::{
    extract::{Path, State},
    http::{header, Request, StatusCode},
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use serde::Serialize;
use tracing::warn;

use crate::dispatch::DispatchHandle;
use crate::metrics::RelayMetrics;
use crate::storage::{ChatStore, PresenceStatus, StoreError, User};

/// Shared state for HTTP handlers.
#[derive(Clone)]
pub struct HttpState {
    pub metrics: RelayMetrics,
    pub metrics_token: Option<String>,
    pub store: Arc<dyn ChatStore>,
    pub dispatch: DispatchHandle,
    pub started_at: Instant,
}

/// Middleware to check bearer token for metrics endpoint.
async fn metrics_auth_middleware(
    State(state): State<HttpState>,
    request: Request<axum::body::Body>,
    next: Next,
) -> Response {
    // Only check auth for /metrics endpoint
    if request.uri().path() == "/metrics" {
        if let Some(ref expected_token) = state.metrics_token {
            let auth_header = request.headers().get(header::AUTHORIZATION);
            let is_authorized = auth_header.is_some_and(|h| {
                h.to_str()
                    .map(|s| {
                        s.strip_prefix("Bearer ")
                            .is_some_and(|token| token == expected_token)
                    })
                    .unwrap_or(false)
            });

            if !is_authorized {
                return (
                    StatusCode::UNAUTHORIZED,
                    [(header::WWW_AUTHENTICATE, "Bearer")],
                    "Unauthorized",
                )
                    .into_response();
            }
        }
    }

    next.run(request).await
}

/// Creates the HTTP router.
pub fn create_router(state: HttpState) -> Router {
    Router::new()
        .route("/", get(root_handler))
        .route("/health", get(health_handler))
        .route("/metrics", get(metrics_handler))
        .route("/users/:username/presence", get(presence_handler))
        .route("/users/:username/public_key", get(public_key_handler))
        .layer(middleware::from_fn_with_state(
            state.clone(),
            metrics_auth_middleware,
        ))
        .with_state(state)
}

/// Root handler - returns basic info.
async fn root_handler() -> impl IntoResponse {
    Json(serde_json::json!({
        "service": "chatterbox-relay",
        "version": env!("CARGO_PKG_VERSION"),
        "endpoints": [
            "/health",
            "/metrics",
            "/users/:username/presence",
            "/users/:username/public_key"
        ]
    }))
}

/// Health check. 503 once the dispatch loop is gone.
async fn health_handler(State(state): State<HttpState>) -> Response {
    let uptime = state.started_at.elapsed().as_secs();
    match state.dispatch.stats().await {
        Ok(stats) => Json(serde_json::json!({
            "status": "healthy",
            "version": env!("CARGO_PKG_VERSION"),
            "uptime_seconds": uptime,
            "connections": stats.connections,
            "users_online": stats.users_online,
        }))
        .into_response(),
        Err(_) => (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(serde_json::json!({
                "status": "unhealthy",
                "version": env!("CARGO_PKG_VERSION"),
                "uptime_seconds": uptime,
            })),
        )
            .into_response(),
    }
}

async fn metrics_handler(State(state): State<HttpState>) -> impl IntoResponse {
    let metrics_text = state.metrics.encode();

    (
        StatusCode::OK,
        [("content-type", "text/plain; version=0.0.4")],
        metrics_text,
    )
}

#[derive(Debug, Serialize)]
struct PresenceResponse {
    username: String,
    status: PresenceStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    last_seen: Option<String>,
    /// Live view from the registry, independent of the stored status.
    connected: bool,
}

#[derive(Debug, Serialize)]
struct PublicKeyResponse {
    username: String,
    public_key: String,
}

async fn presence_handler(
    State(state): State<HttpState>,
    Path(username): Path<String>,
) -> Response {
    let user = match lookup_user(&state, &username) {
        Ok(user) => user,
        Err(response) => return response,
    };
    let connected = state.dispatch.is_online(&user.username).await.unwrap_or(false);

    Json(PresenceResponse {
        username: user.username,
        status: user.status,
        last_seen: user.last_seen,
        connected,
    })
    .into_response()
}

async fn public_key_handler(
    State(state): State<HttpState>,
    Path(username): Path<String>,
) -> Response {
    match lookup_user(&state, &username) {
        Ok(user) => Json(PublicKeyResponse {
            username: user.username,
            public_key: user.public_key,
        })
        .into_response(),
        Err(response) => response,
    }
}

fn lookup_user(state: &HttpState, username: &str) -> Result<User, Response> {
    match state.store.get_user_by_username(username) {
        Ok(Some(user)) => Ok(user),
        Ok(None) => Err((StatusCode::NOT_FOUND, "User not found").into_response()),
        Err(StoreError::Unavailable) => {
            Err((StatusCode::SERVICE_UNAVAILABLE, "Store unavailable").into_response())
        }
        Err(e) => {
            warn!("User lookup failed: {}", e);
            Err((StatusCode::INTERNAL_SERVER_ERROR, "Internal error").into_response())
        }
    }
}
