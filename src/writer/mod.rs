// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! The per-connection message writer: multiplexes up to
//! `max_multiplex` in-flight messages onto one byte stream, enforces
//! per-connection synchronous ordering, and fairly rotates large messages
//! off the head of the queue so they cannot starve the rest.

use std::collections::{HashMap, VecDeque};

use bitflags::bitflags;

use crate::{
    error::{CompletionError, RuntimeError},
    framer::{HEADER_LEN, MIN_FREE_PAYLOAD, PacketFramer, PacketType, SegmentKind, encode_type_id},
    message::{MessageBundle, MessageFlags, RequestId},
    registry::{Serializer, TypeRegistry},
};

/// Every segment — the packet's first one included — opens with a 2-byte
/// write-id so the peer's `MessageReader` can key its read-slots directly
/// by the id the sender assigned, instead of having to mirror the writer's
/// fair-rotation order to infer identity.
pub const WRITE_ID_LEN: usize = 2;

bitflags! {
    /// Cheap O(1) bookkeeping bits, checked instead of scanning the queues
    /// on every `enqueue`/`promote_pending` call.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    struct WriterFlags: u8 {
        const SYNCHRONOUS_IN_WRITE_QUEUE    = 1 << 0;
        const ASYNCHRONOUS_IN_PENDING_QUEUE = 1 << 1;
    }
}

/// Per-connection tunables (`max_writer_*` config keys).
#[derive(Debug, Clone, Copy)]
pub struct WriterLimits {
    pub max_multiplex: usize,
    pub max_waiting: usize,
    pub max_pending: usize,
    pub max_continuous_packet_count: u32,
}

impl Default for WriterLimits {
    fn default() -> Self {
        Self {
            max_multiplex: 4,
            max_waiting: 16,
            max_pending: 64,
            max_continuous_packet_count: 4,
        }
    }
}

/// Observable state of a write-id, for tests asserting the invariant that
/// exactly one of {serializer present, packet_count==0 and no serializer}
/// holds at any step per slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteSlotState {
    Queued,
    Serializing,
}

struct WriteSlot {
    bundle: Option<MessageBundle>,
    serializer: Option<Box<dyn Serializer>>,
    packet_count: u32,
    unique: u64,
}

/// The per-connection message writer.
pub struct MessageWriter {
    slots: Vec<WriteSlot>,
    free: Vec<usize>,
    write_q: VecDeque<usize>,
    pending_q: VecDeque<MessageBundle>,
    waiting_responses: HashMap<RequestId, MessageBundle>,
    spare_serializer: Option<Box<dyn Serializer>>,
    flags: WriterFlags,
    next_unique: u64,
    limits: WriterLimits,
}

impl MessageWriter {
    pub fn new(limits: WriterLimits) -> Self {
        Self {
            slots: Vec::new(),
            free: Vec::new(),
            write_q: VecDeque::new(),
            pending_q: VecDeque::new(),
            waiting_responses: HashMap::new(),
            spare_serializer: None,
            flags: WriterFlags::empty(),
            next_unique: 0,
            limits,
        }
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.write_q.is_empty()
    }

    #[inline]
    pub fn write_queue_len(&self) -> usize {
        self.write_q.len()
    }

    #[inline]
    pub fn pending_queue_len(&self) -> usize {
        self.pending_q.len()
    }

    #[inline]
    pub fn live_slot_count(&self) -> usize {
        self.slots.len() - self.free.len()
    }

    pub fn waiting_response_count(&self) -> usize {
        self.waiting_responses.len()
    }

    /// The recycle counter stamped on write-id `idx` when it was last
    /// assigned, for invariant checks.
    pub fn unique_of(&self, idx: usize) -> Option<u64> {
        self.slots.get(idx).map(|s| s.unique)
    }

    pub fn state_of_front(&self) -> Option<WriteSlotState> {
        let idx = *self.write_q.front()?;
        Some(if self.slots[idx].serializer.is_some() {
            WriteSlotState::Serializing
        } else {
            WriteSlotState::Queued
        })
    }

    /// Admission contract. Returns the write-id
    /// assigned in the live write queue, or `None` if the message instead
    /// landed in the pending queue (not yet a cancelable write-id) or was
    /// completed immediately as `QueueFull`.
    pub fn enqueue(&mut self, bundle: MessageBundle) -> Option<usize> {
        if bundle.is_terminal() {
            return Some(self.push_write_q(bundle));
        }

        let is_sync = bundle.message.flags.is_synchronous();
        let fits_write_q = self.write_q.len() < self.limits.max_multiplex
            && self.live_slot_count() < self.limits.max_waiting
            && (!is_sync || !self.flags.contains(WriterFlags::SYNCHRONOUS_IN_WRITE_QUEUE));

        if fits_write_q {
            Some(self.push_write_q(bundle))
        } else if self.pending_q.len() < self.limits.max_pending {
            if bundle.message.flags.is_asynchronous() {
                self.flags.insert(WriterFlags::ASYNCHRONOUS_IN_PENDING_QUEUE);
            }
            self.pending_q.push_back(bundle);
            None
        } else {
            bundle.complete(CompletionError::QueueFull);
            None
        }
    }

    fn push_write_q(&mut self, bundle: MessageBundle) -> usize {
        let is_sync = bundle.message.flags.is_synchronous();
        let unique = self.next_unique;
        self.next_unique += 1;

        let idx = if let Some(idx) = self.free.pop() {
            self.slots[idx] = WriteSlot { bundle: Some(bundle), serializer: None, packet_count: 0, unique };
            idx
        } else {
            self.slots.push(WriteSlot { bundle: Some(bundle), serializer: None, packet_count: 0, unique });
            self.slots.len() - 1
        };

        if is_sync {
            self.flags.insert(WriterFlags::SYNCHRONOUS_IN_WRITE_QUEUE);
        }
        self.write_q.push_back(idx);
        idx
    }

    fn recycle_slot(&mut self, idx: usize) {
        self.slots[idx].bundle = None;
        if let Some(ser) = self.slots[idx].serializer.take() {
            self.spare_serializer = Some(ser);
        }
        self.slots[idx].packet_count = 0;
        self.free.push(idx);
    }

    fn take_serializer(&mut self, registry: &dyn TypeRegistry) -> Box<dyn Serializer> {
        if let Some(mut ser) = self.spare_serializer.take() {
            ser.reset();
            ser
        } else {
            registry.new_serializer()
        }
    }

    /// Moves one message from `pending_q` into a free write-id when
    /// capacity allows.
    fn promote_pending(&mut self) {
        if self.write_q.len() >= self.limits.max_multiplex
            || self.live_slot_count() >= self.limits.max_waiting
            || self.pending_q.is_empty()
        {
            return;
        }

        let sync_in_write_q = self.flags.contains(WriterFlags::SYNCHRONOUS_IN_WRITE_QUEUE);
        let front_is_async = self
            .pending_q
            .front()
            .map(|b| b.message.flags.is_asynchronous())
            .unwrap_or(false);

        if front_is_async || !sync_in_write_q {
            if let Some(bundle) = self.pending_q.pop_front() {
                self.push_write_q(bundle);
                self.refresh_async_in_pending_flag();
            }
            return;
        }

        if !self.flags.contains(WriterFlags::ASYNCHRONOUS_IN_PENDING_QUEUE) {
            return;
        }

        let len = self.pending_q.len();
        let mut rotated = VecDeque::with_capacity(len);
        let mut extracted = None;
        for _ in 0..len {
            let bundle = self.pending_q.pop_front().expect("len tracked above");
            if extracted.is_none() && bundle.message.flags.is_asynchronous() {
                extracted = Some(bundle);
            } else {
                rotated.push_back(bundle);
            }
        }
        self.pending_q = rotated;
        if let Some(bundle) = extracted {
            self.push_write_q(bundle);
        }
        self.refresh_async_in_pending_flag();
    }

    fn refresh_async_in_pending_flag(&mut self) {
        let any_async = self.pending_q.iter().any(|b| b.message.flags.is_asynchronous());
        self.flags.set(WriterFlags::ASYNCHRONOUS_IN_PENDING_QUEUE, any_async);
    }

    /// Fills `buf` with one packet's worth of multiplexed message data.
    /// Returns the number of bytes written (0 if there was nothing to
    /// send and `keep_alive` was false).
    pub fn write(
        &mut self,
        buf: &mut [u8],
        keep_alive: bool,
        framer: &PacketFramer,
        registry: &dyn TypeRegistry,
    ) -> Result<usize, RuntimeError> {
        let payload_cap = (buf.len().saturating_sub(HEADER_LEN)).min(framer.max_payload());
        let payload_end = HEADER_LEN + payload_cap;
        let mut pos = HEADER_LEN;
        let mut first_type: Option<PacketType> = None;

        while let Some(&idx) = self.write_q.front() {
            if payload_end.saturating_sub(pos) < MIN_FREE_PAYLOAD {
                break;
            }

            let is_terminal = self.slots[idx].bundle.as_ref().expect("queued slot has a bundle").is_terminal();
            if is_terminal {
                self.write_q.pop_front();
                let bundle = self.slots[idx].bundle.take().expect("checked above");
                self.recycle_slot(idx);
                bundle.complete(CompletionError::NoError);
                continue;
            }

            let has_serializer = self.slots[idx].serializer.is_some();
            let segment_is_new = !has_serializer;
            let segment_is_resumed_old = has_serializer && self.slots[idx].packet_count == 0;

            if first_type.is_none() {
                first_type = Some(if segment_is_new {
                    PacketType::SwitchToNewMessage
                } else if segment_is_resumed_old {
                    PacketType::SwitchToOldMessage
                } else {
                    PacketType::ContinuedMessage
                });
            } else {
                if payload_end.saturating_sub(pos) < 1 + WRITE_ID_LEN {
                    break;
                }
                buf[pos] = if segment_is_new { SegmentKind::NewMessage as u8 } else { SegmentKind::OldMessage as u8 };
                pos += 1;
            }

            let write_id = idx as u16;
            buf[pos..pos + WRITE_ID_LEN].copy_from_slice(&write_id.to_be_bytes());
            pos += WRITE_ID_LEN;

            if segment_is_new {
                let type_idx = self.slots[idx]
                    .bundle
                    .as_ref()
                    .expect("queued slot has a bundle")
                    .message
                    .type_index;
                let encoded = encode_type_id(type_idx);
                if payload_end.saturating_sub(pos) < encoded.len() {
                    break;
                }
                buf[pos..pos + encoded.len()].copy_from_slice(&encoded);
                pos += encoded.len();

                let mut serializer = self.take_serializer(registry);
                let value_ref = &*self.slots[idx].bundle.as_ref().expect("checked above").message.value;
                serializer.push(value_ref, type_idx)?;
                self.slots[idx].serializer = Some(serializer);
            }

            let remaining = payload_end - pos;
            let outcome = self.slots[idx]
                .serializer
                .as_mut()
                .expect("attached above")
                .run(&mut buf[pos..pos + remaining])?;
            pos += outcome.bytes();
            self.slots[idx]
                .bundle
                .as_mut()
                .expect("checked above")
                .message
                .flags
                .insert(MessageFlags::STARTED_SEND);

            if outcome.is_done() {
                self.write_q.pop_front();
                let mut bundle = self.slots[idx].bundle.take().expect("checked above");
                bundle.message.flags.insert(MessageFlags::DONE_SEND);
                if bundle.message.flags.is_synchronous() {
                    self.flags.remove(WriterFlags::SYNCHRONOUS_IN_WRITE_QUEUE);
                }
                self.recycle_slot(idx);

                if bundle.message.flags.wants_response() {
                    self.waiting_responses.insert(bundle.message.request_id, bundle);
                } else {
                    bundle.complete(CompletionError::NoError);
                }
                self.promote_pending();
            } else {
                let slot = &mut self.slots[idx];
                slot.packet_count += 1;
                if slot.packet_count >= self.limits.max_continuous_packet_count {
                    slot.packet_count = 0;
                    self.write_q.pop_front();
                    self.write_q.push_back(idx);
                }
                break;
            }
        }

        if pos == HEADER_LEN {
            if keep_alive {
                framer.stamp_header(buf, PacketType::KeepAlive, 0, false)?;
                return Ok(HEADER_LEN);
            }
            return Ok(0);
        }

        let mut payload_len = pos - HEADER_LEN;
        let mut compressed = false;
        if let Some(new_len) = framer.try_compress(&mut buf[HEADER_LEN..], payload_len)? {
            payload_len = new_len;
            compressed = true;
        }
        framer.stamp_header(buf, first_type.expect("wrote at least one segment"), payload_len, compressed)?;
        Ok(HEADER_LEN + payload_len)
    }

    /// Removes an in-flight write-id, dropping its partially-serialized
    /// state, for the pool's cancel visitor.
    pub fn cancel_in_flight(&mut self, idx: usize) -> Option<MessageBundle> {
        if idx >= self.slots.len() || self.slots[idx].bundle.is_none() {
            return None;
        }
        self.write_q.retain(|&i| i != idx);
        let bundle = self.slots[idx].bundle.take();
        self.recycle_slot(idx);
        bundle
    }

    pub fn take_waiting_response(&mut self, request_id: RequestId) -> Option<MessageBundle> {
        self.waiting_responses.remove(&request_id)
    }

    /// Drains both queues on connection teardown, completing every
    /// still-owned message with `error`. Also drains the response-wait
    /// table, since those messages will never see a reply on a dead
    /// connection.
    pub fn complete_all(&mut self, error: CompletionError) {
        while let Some(&idx) = self.write_q.front() {
            self.write_q.pop_front();
            if let Some(bundle) = self.slots[idx].bundle.take() {
                self.recycle_slot(idx);
                bundle.complete(error);
            }
        }
        while let Some(bundle) = self.pending_q.pop_front() {
            bundle.complete(error);
        }
        for (_, bundle) in self.waiting_responses.drain() {
            bundle.complete(error);
        }
        self.flags = WriterFlags::empty();
    }

    /// Visits every write-id and pending message that has not finished
    /// sending, yielding it back to the caller so the pool can rescue it.
    pub fn fetch_unsent_messages(&mut self) -> Vec<MessageBundle> {
        let mut out = Vec::new();
        while let Some(&idx) = self.write_q.front() {
            self.write_q.pop_front();
            if let Some(bundle) = self.slots[idx].bundle.take() {
                self.recycle_slot(idx);
                out.push(bundle);
            }
        }
        while let Some(bundle) = self.pending_q.pop_front() {
            out.push(bundle);
        }
        self.flags = WriterFlags::empty();
        out
    }
}
