// SPDX-FileCopyrightText: © 2025 RelayCast Contributors
//
// SPDX-License-Identifier: MPL-2.0

pub mod cli;
pub mod config;
pub mod logging;
pub mod server;
pub mod state;
pub mod telemetry;

// Re-export commonly used items for convenience
pub use config::Config;
pub use state::AppState;
