// SPDX-FileCopyrightText: © 2025 RelayCast Contributors
//
// SPDX-License-Identifier: MPL-2.0

use std::sync::Arc;

use relaycast_core::Registry;

use crate::config::Config;

/// Shared application state handed to every request handler.
pub struct AppState {
    /// Process-wide stream name table (a cheap clonable handle).
    pub registry: Registry,
    pub config: Arc<Config>,
}
