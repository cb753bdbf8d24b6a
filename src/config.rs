// SPDX-FileCopyrightText: 2026 Mattia Egloff <mattia.egloff@pm.me>
//
// SPDX-License-Identifier: GPL-3.0-or-later

//! Relay Server Configuration
//!
//! Configuration loaded from environment variables. Values that fail to
//! parse are ignored and the default is kept.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::connection_registry::DuplicateLoginPolicy;
use crate::storage::StorageBackend;

/// Relay server configuration.
#[derive(Debug, Clone)]
pub struct RelayConfig {
    /// Address to listen on for WebSocket clients.
    pub listen_addr: SocketAddr,
    /// Address of the health/metrics/presence HTTP port.
    pub metrics_addr: SocketAddr,
    /// Bearer token required on `/metrics`, if set.
    pub metrics_token: Option<String>,
    /// Maximum concurrent connections.
    pub max_connections: usize,
    /// Maximum post-auth frame size in bytes.
    pub max_message_size: usize,
    /// Per-connection outbound queue capacity.
    pub outbound_capacity: usize,
    /// Chat frames per minute per connection (0 = unlimited).
    pub rate_limit_per_min: u32,
    /// Storage backend (memory or sqlite).
    pub storage_backend: StorageBackend,
    /// SQLite database file.
    pub database_path: PathBuf,
    /// Bound on the WebSocket upgrade, in seconds.
    pub upgrade_timeout_secs: u64,
    /// What a second login for a connected user does.
    pub duplicate_login: DuplicateLoginPolicy,
}

impl Default for RelayConfig {
    fn default() -> Self {
        RelayConfig {
            listen_addr: SocketAddr::from(([0, 0, 0, 0], 8080)),
            metrics_addr: SocketAddr::from(([127, 0, 0, 1], 8081)),
            metrics_token: None,
            max_connections: 1000,
            max_message_size: 65_536, // 64 KB
            outbound_capacity: 256,
            rate_limit_per_min: 120,
            storage_backend: StorageBackend::Sqlite, // Persistent by default
            database_path: PathBuf::from("chatterbox.db"),
            upgrade_timeout_secs: 10,
            duplicate_login: DuplicateLoginPolicy::ReplaceExisting,
        }
    }
}

impl FromStr for DuplicateLoginPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "replace" => Ok(DuplicateLoginPolicy::ReplaceExisting),
            "reject" => Ok(DuplicateLoginPolicy::RejectNew),
            other => Err(format!("unknown duplicate login policy: {}", other)),
        }
    }
}

fn env_parse<T: FromStr>(name: &str, target: &mut T) {
    if let Ok(val) = std::env::var(name) {
        if let Ok(parsed) = val.parse() {
            *target = parsed;
        }
    }
}

impl RelayConfig {
    /// Loads configuration from environment variables.
    pub fn from_env() -> Self {
        let mut config = Self::default();

        env_parse("RELAY_LISTEN_ADDR", &mut config.listen_addr);
        env_parse("RELAY_METRICS_ADDR", &mut config.metrics_addr);
        env_parse("RELAY_MAX_CONNECTIONS", &mut config.max_connections);
        env_parse("RELAY_MAX_MESSAGE_SIZE", &mut config.max_message_size);
        env_parse("RELAY_OUTBOUND_CAPACITY", &mut config.outbound_capacity);
        env_parse("RELAY_RATE_LIMIT", &mut config.rate_limit_per_min);
        env_parse("RELAY_UPGRADE_TIMEOUT", &mut config.upgrade_timeout_secs);
        env_parse("RELAY_DUPLICATE_LOGIN", &mut config.duplicate_login);

        if let Ok(val) = std::env::var("RELAY_METRICS_TOKEN") {
            if !val.is_empty() {
                config.metrics_token = Some(val);
            }
        }

        if let Ok(val) = std::env::var("RELAY_STORAGE_BACKEND") {
            config.storage_backend = match val.to_lowercase().as_str() {
                "memory" => StorageBackend::Memory,
                _ => StorageBackend::Sqlite,
            };
        }

        if let Ok(val) = std::env::var("RELAY_DATABASE_PATH") {
            config.database_path = PathBuf::from(val);
        }

        config
    }

    /// Returns the upgrade timeout as a Duration.
    pub fn upgrade_timeout(&self) -> Duration {
        Duration::from_secs(self.upgrade_timeout_secs)
    }
}
