// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Error taxonomy for the messaging runtime.
//!
//! Two families exist, mirroring §7 of the design: [`RuntimeError`] is
//! returned synchronously by `Service` calls, while [`CompletionError`] is
//! the value handed to a message's completion callback — always present
//! (never wrapped in `Option`), with [`CompletionError::NoError`] standing
//! in for success.

use thiserror::Error;

/// Errors returned synchronously from a `Service`/`ConnectionPool` call.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum RuntimeError {
    #[error("connection {0} does not exist")]
    ConnectionInexistent(u64),
    #[error("pool {0:?} does not exist")]
    PoolInexistent(String),
    #[error("message type {0} is not registered")]
    TypeNotRegistered(u32),
    #[error("operation not permitted: service is server-only")]
    ServerOnly,
    #[error("connection is delayed-closed and rejects new work")]
    DelayedClosed,
    #[error("pool {0:?} is at its connection limit")]
    PoolFull(String),
    #[error("proposed packet would exceed the 65535 byte wire limit")]
    PacketSizeExceeded,
    #[error("compression hook reported an error")]
    CompressionError,
    #[error("malformed packet: {0}")]
    BadPacket(&'static str),
    #[error("unknown wire type id {0}")]
    UnknownType(u32),
    #[error("deserialization failed: {0}")]
    DeserializationError(String),
    #[error("serialization failed: {0}")]
    SerializationError(String),
    #[error(transparent)]
    Io(#[from] IoErrorWrapper),
}

/// Wraps [`std::io::Error`] so [`RuntimeError`] can stay `Clone + PartialEq`.
#[derive(Debug, Error, Clone)]
#[error("{0}")]
pub struct IoErrorWrapper(pub String);

impl PartialEq for IoErrorWrapper {
    fn eq(&self, other: &Self) -> bool {
        self.0 == other.0
    }
}
impl Eq for IoErrorWrapper {}

impl From<std::io::Error> for RuntimeError {
    fn from(e: std::io::Error) -> Self {
        RuntimeError::Io(IoErrorWrapper(e.to_string()))
    }
}

/// The outcome delivered to a message's completion callback.
///
/// Modeled as an always-present enum (rather than `Result<(), E>`) because
/// the runtime's completion contract is "called exactly once with an
/// outcome", and `NoError` is itself a first-class outcome, not the absence
/// of one.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum CompletionError {
    #[error("no error")]
    NoError,
    #[error("writer queue is full")]
    QueueFull,
    #[error("pool is full")]
    PoolFull,
    #[error("operation timed out")]
    Timeout,
    #[error("message was canceled")]
    Canceled,
    #[error("connection was closed")]
    ConnectionClosed,
    #[error("connection was killed")]
    ConnectionKilled,
    #[error("malformed packet received")]
    BadPacket,
    #[error("peer referenced an unknown message type")]
    UnknownType,
    #[error("deserialization failed")]
    DeserializationError,
    #[error("serialization failed")]
    SerializationError,
}

impl CompletionError {
    #[inline]
    pub fn is_success(self) -> bool {
        matches!(self, CompletionError::NoError)
    }

    #[inline]
    pub fn is_fatal_for_connection(self) -> bool {
        matches!(
            self,
            CompletionError::BadPacket
                | CompletionError::UnknownType
                | CompletionError::DeserializationError
                | CompletionError::SerializationError
        )
    }
}
