// SPDX-FileCopyrightText: 2026 Mattia Egloff <mattia.egloff@pm.me>
//
// SPDX-License-Identifier: GPL-3.0-or-later

//! Credential Gate
//!
//! Resolves the first inbound frame of a connection: either the connection
//! is promoted to authenticated and indexed under its username, or the
//! handshake fails with exactly one notice and the connection is closed.
//! There is no retry.

use std::sync::Arc;

use tracing::{debug, warn};

use crate::connection::{Connection, Identity};
use crate::connection_registry::AuthenticateError;
use crate::dispatch::{DispatchError, DispatchHandle};
use crate::protocol::{AuthEnvelope, Notice};
use crate::storage::{ChatStore, StoreError, User};

/// Why a handshake failed.
#[derive(Debug, thiserror::Error)]
pub enum HandshakeError {
    #[error("auth frame is not a JSON credentials object")]
    MalformedPayload,
    #[error("username or password missing")]
    MissingFields,
    #[error("credential store unavailable")]
    StoreUnavailable,
    #[error("invalid credentials")]
    InvalidCredentials,
    #[error("user already connected")]
    AlreadyConnected,
    #[error("dispatch failed: {0}")]
    Dispatch(DispatchError),
}

impl HandshakeError {
    /// The single notice sent before the connection is closed.
    pub fn notice(&self) -> Notice {
        match self {
            HandshakeError::MalformedPayload => Notice::InvalidAuthFormat,
            HandshakeError::MissingFields => Notice::CredentialsRequired,
            HandshakeError::StoreUnavailable | HandshakeError::Dispatch(_) => Notice::ServerError,
            HandshakeError::InvalidCredentials => Notice::InvalidCredentials,
            HandshakeError::AlreadyConnected => Notice::AlreadyConnected,
        }
    }
}

impl From<DispatchError> for HandshakeError {
    fn from(err: DispatchError) -> Self {
        match err {
            DispatchError::Rejected(AuthenticateError::AlreadyConnected) => {
                HandshakeError::AlreadyConnected
            }
            other => HandshakeError::Dispatch(other),
        }
    }
}

/// Validates credentials against the store and promotes connections.
#[derive(Clone)]
pub struct CredentialGate {
    store: Arc<dyn ChatStore>,
    dispatch: DispatchHandle,
}

impl CredentialGate {
    pub fn new(store: Arc<dyn ChatStore>, dispatch: DispatchHandle) -> Self {
        CredentialGate { store, dispatch }
    }

    /// Runs the handshake for `conn` on its first frame.
    ///
    /// On success the "Authenticated" notice is already queued, the
    /// connection is reachable by username and the online status is on its
    /// way to the store. On failure nothing has been sent; the caller sends
    /// [`HandshakeError::notice`] and closes.
    pub async fn authenticate(
        &self,
        conn: &Connection,
        frame: &[u8],
    ) -> Result<Identity, HandshakeError> {
        let session = conn.label();

        let auth = AuthEnvelope::parse(frame).map_err(|_| HandshakeError::MalformedPayload)?;
        if !auth.is_complete() {
            return Err(HandshakeError::MissingFields);
        }

        let user = self.verify(auth).await.map_err(|e| {
            warn!("[{}] Credential check failed: {}", session, e);
            e
        })?;

        let identity = Identity {
            user_id: user.id,
            username: user.username,
        };
        self.dispatch
            .authenticate(conn.id(), identity.clone())
            .await?;

        debug!("[{}] Authenticated as user {}", session, identity.user_id);
        Ok(identity)
    }

    async fn verify(&self, auth: AuthEnvelope) -> Result<User, HandshakeError> {
        // Argon2 verification is CPU-bound
        let store = self.store.clone();
        let verified =
            tokio::task::spawn_blocking(move || store.verify(&auth.username, &auth.password))
                .await
                .map_err(|_| HandshakeError::StoreUnavailable)?;

        match verified {
            Ok(Some(user)) => Ok(user),
            Ok(None) => Err(HandshakeError::InvalidCredentials),
            Err(StoreError::Unavailable) => Err(HandshakeError::StoreUnavailable),
            Err(_) => Err(HandshakeError::InvalidCredentials),
        }
    }
}
