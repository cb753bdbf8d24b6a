// SPDX-FileCopyrightText: 2026 Mattia Egloff <mattia.egloff@pm.me>
//
// SPDX-License-Identifier: GPL-3.0-or-later

pub mod config;
pub mod connection;
pub mod connection_registry;
pub mod dispatch;
pub mod gate;
pub mod handler;
pub mod http;
pub mod metrics;
pub mod presence;
pub mod protocol;
pub mod rate_limit;
pub mod router;
pub mod server;
pub mod storage;
