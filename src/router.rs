// SPDX-FileCopyrightText: 2026 Mattia Egloff <mattia.egloff@pm.me>
//
// SPDX-License-Identifier: GPL-3.0-or-later

//! Router
//!
//! Moves one chat envelope from an authenticated sender to its recipient.
//! The ciphertext is persisted best-effort and then handed to the dispatch
//! loop, which looks the recipient up and enqueues the raw ciphertext in a
//! single step.

use std::sync::Arc;

use tracing::{debug, warn};

use crate::connection::Identity;
use crate::connection_registry::Delivery;
use crate::dispatch::{DispatchError, DispatchHandle};
use crate::metrics::RelayMetrics;
use crate::protocol::{ChatEnvelope, Notice};
use crate::storage::ChatStore;

/// Why an envelope was not delivered.
#[derive(Debug, thiserror::Error)]
pub enum RouteError {
    #[error("recipient or ciphertext missing")]
    MissingFields,
    #[error("recipient not connected")]
    RecipientNotConnected,
    #[error("dispatch failed: {0}")]
    Dispatch(#[from] DispatchError),
}

impl RouteError {
    /// Inline notice for the sender. `None` when the relay itself is going
    /// away and there is nobody left to tell.
    pub fn notice(&self) -> Option<Notice> {
        match self {
            RouteError::MissingFields => Some(Notice::RecipientAndCiphertextRequired),
            RouteError::RecipientNotConnected => Some(Notice::RecipientNotConnected),
            RouteError::Dispatch(_) => None,
        }
    }
}

/// Routes chat envelopes.
#[derive(Clone)]
pub struct Router {
    store: Arc<dyn ChatStore>,
    dispatch: DispatchHandle,
    metrics: RelayMetrics,
}

impl Router {
    pub fn new(store: Arc<dyn ChatStore>, dispatch: DispatchHandle, metrics: RelayMetrics) -> Self {
        Router {
            store,
            dispatch,
            metrics,
        }
    }

    /// Delivers `envelope.ciphertext` from `sender` to `envelope.to`.
    pub async fn route(&self, sender: &Identity, envelope: ChatEnvelope) -> Result<(), RouteError> {
        let ChatEnvelope { to, ciphertext } = envelope;
        if to.is_empty() || ciphertext.is_empty() {
            return Err(RouteError::MissingFields);
        }

        let timer = self.metrics.route_duration.start_timer();
        let to = self.canonical_recipient(to);

        if let Err(e) =
            self.store
                .create_message(sender.user_id, &sender.username, &to, &ciphertext)
        {
            self.metrics.persistence_failures.inc();
            warn!("Failed to persist message from user {}: {}", sender.user_id, e);
        }

        let delivery = self.dispatch.deliver(&to, ciphertext).await?;
        timer.observe_duration();

        match delivery {
            Delivery::Delivered => {
                self.metrics.messages_routed.inc();
                Ok(())
            }
            Delivery::NotConnected | Delivery::Dropped => {
                self.metrics.messages_undeliverable.inc();
                debug!("Recipient of message from user {} not connected", sender.user_id);
                Err(RouteError::RecipientNotConnected)
            }
        }
    }

    /// The stored spelling of a registered recipient; unknown names pass through.
    fn canonical_recipient(&self, to: String) -> String {
        match self.store.get_user_by_username(&to) {
            Ok(Some(user)) => user.username,
            Ok(None) => to,
            Err(e) => {
                debug!("Recipient lookup failed: {}", e);
                to
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::{next_connection_id, outbound_queue, Connection};
    use crate::connection_registry::DuplicateLoginPolicy;
    use crate::dispatch;
    use crate::storage::MemoryStore;
    use tokio::sync::mpsc;

    struct Fixture {
        store: Arc<MemoryStore>,
        dispatch: DispatchHandle,
        metrics: RelayMetrics,
        router: Router,
        alice: Identity,
    }

    async fn fixture() -> Fixture {
        let store = Arc::new(MemoryStore::new());
        let alice_id = store.register("alice", "pw", "pk").unwrap();
        store.register("bob", "pw", "pk").unwrap();
        let metrics = RelayMetrics::new();
        let (dispatch, _task) = dispatch::spawn(
            DuplicateLoginPolicy::default(),
            metrics.clone(),
            store.clone(),
        );
        let router = Router::new(store.clone(), dispatch.clone(), metrics.clone());
        Fixture {
            store,
            dispatch,
            metrics,
            router,
            alice: Identity {
                user_id: alice_id,
                username: "alice".into(),
            },
        }
    }

    async fn online(dispatch: &DispatchHandle, user_id: i64, username: &str) -> mpsc::Receiver<String> {
        let conn = Arc::new(Connection::new(next_connection_id()));
        let (tx, mut rx) = outbound_queue(64);
        dispatch.admit(conn.clone(), tx).await.unwrap();
        dispatch
            .authenticate(
                conn.id(),
                Identity {
                    user_id,
                    username: username.into(),
                },
            )
            .await
            .unwrap();
        assert_eq!(rx.recv().await.unwrap(), "Authenticated");
        rx
    }

    fn chat(to: &str, ciphertext: &str) -> ChatEnvelope {
        ChatEnvelope {
            to: to.into(),
            ciphertext: ciphertext.into(),
        }
    }

    #[tokio::test]
    async fn test_routes_raw_ciphertext() {
        let f = fixture().await;
        let mut bob = online(&f.dispatch, 2, "bob").await;

        f.router.route(&f.alice, chat("bob", "XYZ")).await.unwrap();

        assert_eq!(bob.recv().await.unwrap(), "XYZ");
        assert_eq!(f.metrics.messages_routed.get(), 1);
        let stored = f.store.get_messages_between("alice", "bob").unwrap();
        assert_eq!(stored.len(), 1);
        assert_eq!(stored[0].content, "XYZ");
        assert_eq!(stored[0].user_id, f.alice.user_id);
    }

    #[tokio::test]
    async fn test_recipient_spelling_is_canonicalized() {
        let f = fixture().await;
        let mut bob = online(&f.dispatch, 2, "bob").await;

        f.router.route(&f.alice, chat("BoB", "XYZ")).await.unwrap();

        assert_eq!(bob.recv().await.unwrap(), "XYZ");
        let stored = f.store.get_messages_between("alice", "bob").unwrap();
        assert_eq!(stored.len(), 1);
        assert_eq!(stored[0].recipient, "bob");
    }

    #[tokio::test]
    async fn test_preserves_sender_order() {
        let f = fixture().await;
        let mut bob = online(&f.dispatch, 2, "bob").await;

        for i in 0..20 {
            f.router
                .route(&f.alice, chat("bob", &format!("c{}", i)))
                .await
                .unwrap();
        }
        for i in 0..20 {
            assert_eq!(bob.recv().await.unwrap(), format!("c{}", i));
        }
    }

    #[tokio::test]
    async fn test_missing_fields_rejected_before_persisting() {
        let f = fixture().await;

        let err = f.router.route(&f.alice, chat("", "XYZ")).await.unwrap_err();
        assert_eq!(err.notice(), Some(Notice::RecipientAndCiphertextRequired));
        let err = f.router.route(&f.alice, chat("bob", "")).await.unwrap_err();
        assert_eq!(err.notice(), Some(Notice::RecipientAndCiphertextRequired));

        assert_eq!(f.store.message_count(), 0);
    }

    #[tokio::test]
    async fn test_absent_recipient_still_persisted() {
        let f = fixture().await;

        let err = f.router.route(&f.alice, chat("carol", "XYZ")).await.unwrap_err();

        assert!(matches!(err, RouteError::RecipientNotConnected));
        assert_eq!(err.notice(), Some(Notice::RecipientNotConnected));
        assert_eq!(f.store.message_count(), 1);
        assert_eq!(f.metrics.messages_undeliverable.get(), 1);
    }

    #[tokio::test]
    async fn test_persistence_failure_does_not_block_delivery() {
        let f = fixture().await;
        let mut bob = online(&f.dispatch, 2, "bob").await;
        f.store.set_reject_messages(true);

        f.router.route(&f.alice, chat("bob", "XYZ")).await.unwrap();

        assert_eq!(bob.recv().await.unwrap(), "XYZ");
        assert_eq!(f.metrics.persistence_failures.get(), 1);
    }
}
