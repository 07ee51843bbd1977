// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! The message data model: a user value plus the small header the
//! runtime needs to route, order and complete it, and the internal bundle
//! the writer/pool actually move around.

use std::{any::Any, fmt};

use bitflags::bitflags;

use crate::error::CompletionError;

bitflags! {
    /// Per-message header flags. `Synchronous` and
    /// `Asynchronous` are mutually exclusive; the rest are independent
    /// bookkeeping/role bits toggled as the message crosses the wire.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct MessageFlags: u32 {
        const SYNCHRONOUS    = 1 << 0;
        const ASYNCHRONOUS   = 1 << 1;
        const WAIT_RESPONSE  = 1 << 2;
        const IDEMPOTENT     = 1 << 3;
        const STARTED_SEND   = 1 << 4;
        const DONE_SEND      = 1 << 5;
        const CANCELED       = 1 << 6;
        const ON_PEER        = 1 << 7;
        const BACK_ON_SENDER = 1 << 8;
        const RELAYED        = 1 << 9;
    }
}

impl Default for MessageFlags {
    fn default() -> Self {
        MessageFlags::ASYNCHRONOUS
    }
}

impl MessageFlags {
    #[inline]
    pub fn is_synchronous(self) -> bool {
        self.contains(MessageFlags::SYNCHRONOUS)
    }

    #[inline]
    pub fn is_asynchronous(self) -> bool {
        !self.is_synchronous()
    }

    #[inline]
    pub fn wants_response(self) -> bool {
        self.contains(MessageFlags::WAIT_RESPONSE)
    }

    #[inline]
    pub fn is_idempotent(self) -> bool {
        self.contains(MessageFlags::IDEMPOTENT)
    }

    #[inline]
    pub fn is_canceled(self) -> bool {
        self.contains(MessageFlags::CANCELED)
    }

    #[inline]
    pub fn is_done_send(self) -> bool {
        self.contains(MessageFlags::DONE_SEND)
    }
}

/// Identifies a request/response pair across the wire.
pub type RequestId = u64;

/// Invoked exactly once with the outcome of a message. Takes the value
/// back and the outcome only — the runtime never inspects message
/// contents, so the callback needs nothing else.
pub type CompletionFn = Box<dyn FnOnce(Box<dyn Any + Send>, CompletionError) + Send>;

/// A user-provided typed value plus the small header the runtime attaches
/// to it. Owned by its producer until passed to
/// `send`; thereafter the runtime exclusively owns it until completion.
pub struct Message {
    pub value: Box<dyn Any + Send>,
    pub type_index: u32,
    pub state_counter: u64,
    pub flags: MessageFlags,
    pub request_id: RequestId,
    pub response_id: Option<RequestId>,
}

impl fmt::Debug for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Message")
            .field("type_index", &self.type_index)
            .field("state_counter", &self.state_counter)
            .field("flags", &self.flags)
            .field("request_id", &self.request_id)
            .field("response_id", &self.response_id)
            .finish_non_exhaustive()
    }
}

impl Message {
    pub fn new(value: Box<dyn Any + Send>, type_index: u32, flags: MessageFlags) -> Self {
        Self {
            value,
            type_index,
            state_counter: 0,
            flags,
            request_id: 0,
            response_id: None,
        }
    }

    /// The empty terminal sentinel admitted unconditionally by
    /// `MessageWriter::enqueue` to schedule an orderly close.
    pub fn terminal() -> Self {
        Self::new(Box::new(()), u32::MAX, MessageFlags::ASYNCHRONOUS)
    }

    pub fn is_terminal(&self) -> bool {
        self.type_index == u32::MAX
    }
}

/// The message value together with its type index, flags, and optional
/// response handler. Movable, never cloned — the runtime treats it as a
/// unique-ownership token.
pub struct MessageBundle {
    pub message: Message,
    pub on_complete: Option<CompletionFn>,
}

impl fmt::Debug for MessageBundle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MessageBundle")
            .field("message", &self.message)
            .field("has_completion", &self.on_complete.is_some())
            .finish()
    }
}

impl MessageBundle {
    pub fn new(message: Message, on_complete: Option<CompletionFn>) -> Self {
        Self { message, on_complete }
    }

    pub fn is_terminal(&self) -> bool {
        self.message.is_terminal()
    }

    /// Invoke the completion callback exactly once, consuming the bundle.
    pub fn complete(self, error: CompletionError) {
        if let Some(cb) = self.on_complete {
            cb(self.message.value, error);
        }
    }
}

/// A stable reference to a slot inside a [`crate::pool::ConnectionPool`].
/// `unique` is bumped every time the slot is recycled so stale ids fail
/// cleanly instead of aliasing a new message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MessageId {
    pub index: u32,
    pub unique: u64,
}

impl MessageId {
    pub const INVALID: MessageId = MessageId { index: u32::MAX, unique: 0 };

    pub fn is_valid(self) -> bool {
        self.index != u32::MAX
    }
}

impl Default for MessageId {
    fn default() -> Self {
        MessageId::INVALID
    }
}
