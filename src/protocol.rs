// SPDX-FileCopyrightText: 2026 Mattia Egloff <mattia.egloff@pm.me>
//
// SPDX-License-Identifier: GPL-3.0-or-later

//! Wire Protocol
//!
//! Frames exchanged with chat clients after the WebSocket upgrade:
//! - the first inbound frame is an [`AuthEnvelope`]
//! - every later inbound frame is a [`ChatEnvelope`]
//! - the relay answers with short plain-text [`Notice`]s
//! - routed ciphertext is delivered to the recipient as-is, never wrapped

use serde::{Deserialize, Serialize};

/// First-message credentials: `{"username": "...", "password": "..."}`.
///
/// Missing fields decode as empty strings so that the gate can answer with
/// "Username and password required" instead of a format error.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthEnvelope {
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub password: String,
}

impl AuthEnvelope {
    /// Decodes an auth frame.
    pub fn parse(frame: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(frame)
    }

    /// True when both fields are present and non-empty.
    pub fn is_complete(&self) -> bool {
        !self.username.is_empty() && !self.password.is_empty()
    }
}

/// Post-auth chat frame: `{"to": "<recipient username>", "ciphertext": "..."}`.
///
/// The ciphertext is opaque to the relay.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatEnvelope {
    #[serde(default)]
    pub to: String,
    #[serde(default)]
    pub ciphertext: String,
}

impl ChatEnvelope {
    /// Decodes a chat frame.
    pub fn parse(frame: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(frame)
    }
}

/// Plain-text notices sent by the relay.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Notice {
    // Handshake
    Authenticated,
    InvalidAuthFormat,
    CredentialsRequired,
    ServerError,
    InvalidCredentials,
    AlreadyConnected,
    // Per-message (connection stays open)
    InvalidChatFormat,
    RecipientAndCiphertextRequired,
    RecipientNotConnected,
    MessageTooLarge,
    RateLimited,
    // Broadcast
    ShuttingDown,
}

impl Notice {
    /// The exact text put on the wire.
    pub fn text(self) -> &'static str {
        match self {
            Notice::Authenticated => "Authenticated",
            Notice::InvalidAuthFormat => "Invalid auth message format",
            Notice::CredentialsRequired => "Username and password required",
            Notice::ServerError => "Server error",
            Notice::InvalidCredentials => "Invalid credentials",
            Notice::AlreadyConnected => "User already connected",
            Notice::InvalidChatFormat => "Invalid chat message format",
            Notice::RecipientAndCiphertextRequired => "Recipient and ciphertext required",
            Notice::RecipientNotConnected => "Recipient not connected",
            Notice::MessageTooLarge => "Message too large",
            Notice::RateLimited => "Rate limit exceeded",
            Notice::ShuttingDown => "Server shutting down",
        }
    }
}

impl From<Notice> for String {
    fn from(notice: Notice) -> Self {
        notice.text().to_string()
    }
}

impl std::fmt::Display for Notice {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.text())
    }
}
