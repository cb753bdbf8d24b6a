// SPDX-FileCopyrightText: 2026 Mattia Egloff <mattia.egloff@pm.me>
//
// SPDX-License-Identifier: GPL-3.0-or-later

//! Presence Writer
//!
//! Applies presence changes to the store in the order the dispatch loop
//! recorded them. The dispatch loop never calls the store; it hands every
//! reachability change to this task, which writes them one at a time. The
//! stored status therefore always ends at the registry's latest state, and
//! a slow store only delays presence, never routing.

use std::sync::Arc;

use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::storage::{ChatStore, PresenceStatus};

/// A change in whether a username is reachable.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PresenceUpdate {
    /// A connection authenticated under this username.
    Online(String),
    /// The connection owning this username left the registry.
    Offline(String),
}

/// Sending half used by the dispatch loop.
pub type PresenceSender = mpsc::UnboundedSender<PresenceUpdate>;

/// Creates the channel between the dispatch loop and the writer.
pub fn channel() -> (PresenceSender, mpsc::UnboundedReceiver<PresenceUpdate>) {
    mpsc::unbounded_channel()
}

/// Writes updates in arrival order until every sender is dropped.
pub async fn run_presence_writer(
    store: Arc<dyn ChatStore>,
    mut updates: mpsc::UnboundedReceiver<PresenceUpdate>,
) {
    while let Some(update) = updates.recv().await {
        let store = store.clone();
        if let Err(e) = tokio::task::spawn_blocking(move || apply(store.as_ref(), &update)).await {
            warn!("Presence write panicked: {}", e);
        }
    }
    debug!("Presence writer stopped");
}

fn apply(store: &dyn ChatStore, update: &PresenceUpdate) {
    match update {
        PresenceUpdate::Online(username) => {
            if let Err(e) = store.set_status(username, PresenceStatus::Online) {
                warn!("Failed to record online status: {}", e);
            }
        }
        PresenceUpdate::Offline(username) => {
            if let Err(e) = store.set_status(username, PresenceStatus::Offline) {
                warn!("Failed to record offline status: {}", e);
            }
            if let Err(e) = store.set_last_seen_now(username) {
                warn!("Failed to record last seen: {}", e);
            }
        }
    }
}
