// SPDX-FileCopyrightText: 2026 Mattia Egloff <mattia.egloff@pm.me>
//
// SPDX-License-Identifier: GPL-3.0-or-later

//! Rate Limiting
//!
//! Token bucket limiting how many chat frames one connection may send.
//! Each connection owns its own bucket, so no locking is needed.

use std::time::Instant;

/// Per-connection message budget.
#[derive(Debug)]
pub struct MessageBudget {
    /// Current number of tokens.
    tokens: f64,
    /// Maximum tokens (bucket capacity).
    max_tokens: f64,
    /// Tokens added per second.
    refill_rate: f64,
    /// Last time tokens were updated.
    last_update: Instant,
}

impl MessageBudget {
    /// Creates a budget allowing `max_per_minute` frames per minute with
    /// bursts of the same size.
    ///
    /// Returns `None` for 0, which means unlimited.
    pub fn per_minute(max_per_minute: u32) -> Option<Self> {
        if max_per_minute == 0 {
            return None;
        }
        Some(MessageBudget {
            tokens: max_per_minute as f64,
            max_tokens: max_per_minute as f64,
            refill_rate: max_per_minute as f64 / 60.0,
            last_update: Instant::now(),
        })
    }

    fn refill(&mut self, now: Instant) {
        let elapsed = now.saturating_duration_since(self.last_update).as_secs_f64();
        self.tokens = (self.tokens + elapsed * self.refill_rate).min(self.max_tokens);
        self.last_update = now;
    }

    /// Tries to spend one token.
    ///
    /// Returns true if allowed, false if rate limited.
    pub fn try_spend(&mut self) -> bool {
        self.try_spend_at(Instant::now())
    }

    fn try_spend_at(&mut self, now: Instant) -> bool {
        self.refill(now);
        if self.tokens >= 1.0 {
            self.tokens -= 1.0;
            true
        } else {
            false
        }
    }
}
