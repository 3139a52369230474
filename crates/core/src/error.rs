// SPDX-FileCopyrightText: © 2025 RelayCast Contributors
//
// SPDX-License-Identifier: MPL-2.0

//! Structured error types for RelayCast.

use thiserror::Error;

use crate::ebml::ContainerError;

/// Main error type for relay operations.
///
/// Parse failures carry the underlying [`ContainerError`] so transports can
/// report what the publisher sent; the remaining variants describe lifecycle
/// conflicts.
#[derive(Debug, Error)]
pub enum RelayError {
    /// The publisher's byte stream is not a well-formed WebM container.
    ///
    /// The publishing transport converts this into HTTP 400 and tears the
    /// session down. Subscribers keep whatever was already delivered.
    #[error("bad container data: {0}")]
    BadContainer(#[from] ContainerError),

    /// A second publisher tried to claim a name that is currently live.
    #[error("stream id already taken")]
    NameInUse,

    /// Bytes were pushed into a broadcast after it was stopped.
    #[error("session closed")]
    SessionClosed,

    /// A subscriber could not keep up with a forced delivery and was dropped.
    ///
    /// Never propagated; only used to describe the disconnect in logs.
    #[error("subscriber queue overflow")]
    SubscriberOverflow,
}

/// Convenience type alias for Results using [`RelayError`].
pub type Result<T> = std::result::Result<T, RelayError>;
