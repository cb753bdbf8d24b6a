// SPDX-FileCopyrightText: 2026 Mattia Egloff <mattia.egloff@pm.me>
//
// SPDX-License-Identifier: GPL-3.0-or-later

//! Prometheus Metrics for Chatterbox Relay
//!
//! Provides observability metrics for monitoring the relay server.

use prometheus::{Histogram, HistogramOpts, IntCounter, IntGauge, Opts, Registry};
use std::sync::Arc;

/// Relay server metrics.
#[derive(Clone)]
pub struct RelayMetrics {
    /// Registry for all metrics.
    pub registry: Arc<Registry>,

    // Connection metrics
    /// Total WebSocket connections accepted.
    pub connections_total: IntCounter,
    /// Current active WebSocket connections.
    pub connections_active: IntGauge,
    /// Connection errors (upgrade failures, over capacity).
    pub connection_errors: IntCounter,
    /// Handshakes that ended without authentication.
    pub handshake_failures: IntCounter,
    /// Usernames currently reachable.
    pub users_online: IntGauge,

    // Message metrics
    /// Chat frames received from authenticated connections.
    pub messages_received: IntCounter,
    /// Chat frames queued to their recipient.
    pub messages_routed: IntCounter,
    /// Chat frames whose recipient was not connected.
    pub messages_undeliverable: IntCounter,
    /// Chat frames rejected (malformed, too large, missing fields).
    pub messages_rejected: IntCounter,
    /// Routing duration in seconds (persist + deliver).
    pub route_duration: Histogram,

    // Delivery metrics
    /// Failed best-effort message persistence.
    pub persistence_failures: IntCounter,
    /// Connections evicted because their outbound queue was full.
    pub slow_consumer_evictions: IntCounter,
    /// System-wide broadcasts sent.
    pub broadcasts: IntCounter,

    // Rate limiting
    /// Frames dropped by the per-connection rate limit.
    pub rate_limited: IntCounter,
}

fn counter(name: &str, help: &str) -> IntCounter {
    IntCounter::with_opts(Opts::new(name, help)).unwrap()
}

fn gauge(name: &str, help: &str) -> IntGauge {
    IntGauge::with_opts(Opts::new(name, help)).unwrap()
}

impl RelayMetrics {
    /// Creates a new metrics instance with all counters registered.
    pub fn new() -> Self {
        let registry = Registry::new();

        // Connection metrics
        let connections_total = counter(
            "relay_connections_total",
            "Total WebSocket connections accepted",
        );
        let connections_active = gauge(
            "relay_connections_active",
            "Current active WebSocket connections",
        );
        let connection_errors = counter(
            "relay_connection_errors_total",
            "Total connection errors",
        );
        let handshake_failures = counter(
            "relay_handshake_failures_total",
            "Total handshakes that did not authenticate",
        );
        let users_online = gauge("relay_users_online", "Usernames currently reachable");

        // Message metrics
        let messages_received = counter(
            "relay_messages_received_total",
            "Total chat messages received",
        );
        let messages_routed = counter(
            "relay_messages_routed_total",
            "Total chat messages queued to their recipient",
        );
        let messages_undeliverable = counter(
            "relay_messages_undeliverable_total",
            "Total chat messages whose recipient was not connected",
        );
        let messages_rejected = counter(
            "relay_messages_rejected_total",
            "Total chat messages rejected",
        );
        let route_duration = Histogram::with_opts(HistogramOpts::new(
            "relay_route_duration_seconds",
            "Message routing duration in seconds",
        ))
        .unwrap();

        // Delivery metrics
        let persistence_failures = counter(
            "relay_persistence_failures_total",
            "Total failed message persistence attempts",
        );
        let slow_consumer_evictions = counter(
            "relay_slow_consumer_evictions_total",
            "Total connections evicted for a full outbound queue",
        );
        let broadcasts = counter("relay_broadcasts_total", "Total system-wide broadcasts");

        // Rate limiting
        let rate_limited = counter(
            "relay_rate_limited_total",
            "Total messages rate limited",
        );

        // Register all metrics
        registry
            .register(Box::new(connections_total.clone()))
            .unwrap();
        registry
            .register(Box::new(connections_active.clone()))
            .unwrap();
        registry
            .register(Box::new(connection_errors.clone()))
            .unwrap();
        registry
            .register(Box::new(handshake_failures.clone()))
            .unwrap();
        registry.register(Box::new(users_online.clone())).unwrap();
        registry
            .register(Box::new(messages_received.clone()))
            .unwrap();
        registry
            .register(Box::new(messages_routed.clone()))
            .unwrap();
        registry
            .register(Box::new(messages_undeliverable.clone()))
            .unwrap();
        registry
            .register(Box::new(messages_rejected.clone()))
            .unwrap();
        registry.register(Box::new(route_duration.clone())).unwrap();
        registry
            .register(Box::new(persistence_failures.clone()))
            .unwrap();
        registry
            .register(Box::new(slow_consumer_evictions.clone()))
            .unwrap();
        registry.register(Box::new(broadcasts.clone())).unwrap();
        registry.register(Box::new(rate_limited.clone())).unwrap();

        RelayMetrics {
            registry: Arc::new(registry),
            connections_total,
            connections_active,
            connection_errors,
            handshake_failures,
            users_online,
            messages_received,
            messages_routed,
            messages_undeliverable,
            messages_rejected,
            route_duration,
            persistence_failures,
            slow_consumer_evictions,
            broadcasts,
            rate_limited,
        }
    }

    /// Encodes all metrics in Prometheus text format.
    pub fn encode(&self) -> String {
        use prometheus::Encoder;
        let encoder = prometheus::TextEncoder::new();
        let metric_families = self.registry.gather();
        let mut buffer = Vec::new();
        if encoder.encode(&metric_families, &mut buffer).is_err() {
            return String::new();
        }
        String::from_utf8(buffer).unwrap_or_default()
    }
}

impl Default for RelayMetrics {
    fn default() -> Self {
        Self::new()
    }
}
