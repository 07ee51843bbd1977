// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! The serializer / type-registry trait boundary.
//!
//! This is an external collaborator: a pluggable marshaller producing a
//! byte stream for a given typed value. The runtime never inspects message
//! contents, it only drives these traits. [`test_support`] ships a minimal
//! in-memory implementation used by this crate's own test suite; a
//! production marshaller is out of scope.

use std::any::Any;

use crate::error::RuntimeError;

/// Result of one `run()` step against a caller-provided buffer span.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunOutcome {
    /// The whole value was consumed/produced; `usize` is the number of
    /// bytes written to (or read from) the span on this call.
    Done(usize),
    /// More buffer space (or more input) is needed; `usize` is the number
    /// of bytes written to (or read from) the span on this call.
    NeedsMore(usize),
}

impl RunOutcome {
    pub fn bytes(self) -> usize {
        match self {
            RunOutcome::Done(n) | RunOutcome::NeedsMore(n) => n,
        }
    }

    pub fn is_done(self) -> bool {
        matches!(self, RunOutcome::Done(_))
    }
}

/// Turns one message value into an opaque byte stream across possibly many
/// calls to `run`. A fresh serializer is attached lazily the first time a
/// write-slot is serialized; `reset` lets the writer recycle a
/// just-completed serializer instead of allocating a new one.
pub trait Serializer: Send {
    /// Begin serializing `value` (of the given registry type index).
    fn push(&mut self, value: &dyn Any, type_idx: u32) -> Result<(), RuntimeError>;

    /// Write as much of the pushed value as fits in `buf`.
    fn run(&mut self, buf: &mut [u8]) -> Result<RunOutcome, RuntimeError>;

    /// Drop any in-progress state so the serializer can be reused for the
    /// next message instead of allocating a fresh one.
    fn reset(&mut self);
}

/// Reconstructs one message value across possibly many calls to `run`.
pub trait Deserializer: Send {
    /// Consume as much of `buf` as needed to make progress.
    fn run(&mut self, buf: &[u8]) -> Result<RunOutcome, RuntimeError>;

    /// Take the fully assembled value. Only meaningful after `run` returns
    /// `RunOutcome::Done`.
    fn take(&mut self) -> Option<Box<dyn Any + Send>>;

    fn reset(&mut self);
}

/// Maps typed values to/from registry type indices and hands out fresh
/// (de)serializers. Populated during `Service::reconfigure` and read-only
/// thereafter.
pub trait TypeRegistry: Send + Sync {
    /// The registry index for `value`'s concrete type, if registered.
    fn type_index_of(&self, value: &dyn Any) -> Option<u32>;

    fn new_serializer(&self) -> Box<dyn Serializer>;

    fn new_deserializer(&self, type_idx: u32) -> Result<Box<dyn Deserializer>, RuntimeError>;
}

/// A minimal in-memory registry and length-prefixed byte codec, used only
/// by this crate's tests to exercise the writer/reader/pool without a real
/// marshaller. Messages are `Vec<u8>` payloads carried behind a
/// `u32` length prefix, so an oversized payload naturally forces
/// multi-packet serialization — useful for fairness/rescue tests.
pub mod test_support {
    use std::any::Any;

    use super::{Deserializer, RunOutcome, Serializer, TypeRegistry};
    use crate::error::RuntimeError;

    pub const BYTES_TYPE_INDEX: u32 = 1;

    #[derive(Default)]
    pub struct BytesRegistry;

    impl TypeRegistry for BytesRegistry {
        fn type_index_of(&self, value: &dyn Any) -> Option<u32> {
            value.downcast_ref::<Vec<u8>>().map(|_| BYTES_TYPE_INDEX)
        }

        fn new_serializer(&self) -> Box<dyn Serializer> {
            Box::new(LengthPrefixedSerializer::default())
        }

        fn new_deserializer(
            &self,
            type_idx: u32,
        ) -> Result<Box<dyn Deserializer>, RuntimeError> {
            if type_idx != BYTES_TYPE_INDEX {
                return Err(RuntimeError::UnknownType(type_idx));
            }
            Ok(Box::new(LengthPrefixedDeserializer::default()))
        }
    }

    #[derive(Default)]
    struct LengthPrefixedSerializer {
        buf: Vec<u8>,
        pos: usize,
    }

    impl Serializer for LengthPrefixedSerializer {
        fn push(&mut self, value: &dyn Any, _type_idx: u32) -> Result<(), RuntimeError> {
            let payload = value
                .downcast_ref::<Vec<u8>>()
                .ok_or_else(|| RuntimeError::SerializationError("not a Vec<u8>".into()))?;
            self.buf.clear();
            self.buf.extend_from_slice(&(payload.len() as u32).to_be_bytes());
            self.buf.extend_from_slice(payload);
            self.pos = 0;
            Ok(())
        }

        fn run(&mut self, out: &mut [u8]) -> Result<RunOutcome, RuntimeError> {
            let remaining = self.buf.len() - self.pos;
            let n = remaining.min(out.len());
            out[..n].copy_from_slice(&self.buf[self.pos..self.pos + n]);
            self.pos += n;
            if self.pos == self.buf.len() {
                Ok(RunOutcome::Done(n))
            } else {
                Ok(RunOutcome::NeedsMore(n))
            }
        }

        fn reset(&mut self) {
            self.buf.clear();
            self.pos = 0;
        }
    }

    #[derive(Default)]
    struct LengthPrefixedDeserializer {
        buf: Vec<u8>,
        expected_len: Option<usize>,
    }

    impl Deserializer for LengthPrefixedDeserializer {
        fn run(&mut self, input: &[u8]) -> Result<RunOutcome, RuntimeError> {
            // Only ever take as much of `input` as this message still owes;
            // the rest belongs to whatever segment follows in the caller's
            // buffer span.
            let mut consumed = 0;

            if self.expected_len.is_none() {
                let need = 4usize.saturating_sub(self.buf.len());
                let take = need.min(input.len());
                self.buf.extend_from_slice(&input[..take]);
                consumed += take;
                if self.buf.len() >= 4 {
                    let len = u32::from_be_bytes([self.buf[0], self.buf[1], self.buf[2], self.buf[3]]);
                    self.expected_len = Some(len as usize);
                }
            }

            if let Some(len) = self.expected_len {
                let total = 4 + len;
                let need = total.saturating_sub(self.buf.len());
                let take = need.min(input.len() - consumed);
                self.buf.extend_from_slice(&input[consumed..consumed + take]);
                consumed += take;
                if self.buf.len() >= total {
                    return Ok(RunOutcome::Done(consumed));
                }
            }

            Ok(RunOutcome::NeedsMore(consumed))
        }

        fn take(&mut self) -> Option<Box<dyn Any + Send>> {
            let len = self.expected_len?;
            if self.buf.len() < 4 + len {
                return None;
            }
            let payload = self.buf[4..4 + len].to_vec();
            Some(Box::new(payload))
        }

        fn reset(&mut self) {
            self.buf.clear();
            self.expected_len = None;
        }
    }
}
