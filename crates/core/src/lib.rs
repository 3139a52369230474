// SPDX-FileCopyrightText: © 2025 RelayCast Contributors
//
// SPDX-License-Identifier: MPL-2.0

//! RelayCast Core - broadcast fan-out engine for live WebM relays.
//!
//! One publisher pushes an EBML/Matroska byte stream; many subscribers pull
//! it concurrently, each receiving a byte sequence that is itself a valid
//! WebM stream. Nothing is transcoded, persisted or reordered: the container
//! is parsed just far enough to capture the initialization segment, cut on
//! cluster boundaries and rewrite cluster timestamps for late joiners.
//!
//! ## Core Modules
//!
//! - [`ebml`]: incremental EBML/Matroska stream framer
//! - [`broadcast`]: one-to-many fan-out with per-subscriber backpressure
//! - [`registry`]: stream name table and publisher grace-window lifecycle
//! - [`error`]: error types and handling
//!
//! ## Quick Start
//!
//! ```ignore
//! use relaycast_core::{Registry, RegistryConfig};
//! use std::sync::Arc;
//!
//! let registry = Arc::new(Registry::new(RegistryConfig::default()));
//!
//! // Publisher side: claim a name and push body chunks.
//! let publication = registry.publish("live")?;
//! publication.send(&chunk)?;
//!
//! // Subscriber side: a Stream of Bytes, valid WebM from the first byte.
//! let subscription = registry.subscribe("live", false).ok_or("offline")?;
//! ```

// Module declarations
pub mod broadcast;
pub mod ebml;
pub mod error;
pub mod registry;

// Convenience re-exports for commonly used types

// Error handling
pub use error::{RelayError, Result};

// Container framing
pub use ebml::{ClusterStart, ContainerError, StreamEvent, StreamParser};

// Fan-out
pub use broadcast::{Broadcast, BroadcastConfig, Subscription};

// Names and lifecycle
pub use registry::{Publication, Registry, RegistryConfig};
