// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! The per-connection message reader: parses the packet stream
//! and reassembles multiplexed message segments back into complete values.
//!
//! Segments are keyed by a 2-byte write-id the peer's `MessageWriter`
//! stamps at the front of every segment (see [`crate::writer::WRITE_ID_LEN`]).
//! `ReadSlot`s live in a flat table indexed by that id, mirroring the
//! writer's own slot table rather than requiring both sides to agree on an
//! implicit rotation order.

use std::collections::HashMap;

use crate::{
    error::RuntimeError,
    framer::{PacketFramer, PacketHeader, PacketType, SegmentKind, decode_type_id},
    message::RequestId,
    registry::{Deserializer, TypeRegistry},
};

/// Minimum bytes needed to read a write-id off the front of a segment.
const WRITE_ID_LEN: usize = 2;

struct ReadSlot {
    deserializer: Box<dyn Deserializer>,
    type_idx: u32,
}

/// One fully reassembled inbound message, or a control event reported
/// straight to the caller: control packet types are reported to the
/// receiver directly rather than reassembled.
pub enum ReaderEvent {
    Message { type_idx: u32, value: Box<dyn std::any::Any + Send> },
    KeepAlive,
    CancelMessage { write_id: u16 },
    CancelRequest { request_id: RequestId },
    AckCount { payload: Vec<u8> },
    Update { payload: Vec<u8> },
}

/// The per-connection message reader.
pub struct MessageReader {
    slots: HashMap<u16, ReadSlot>,
}

impl Default for MessageReader {
    fn default() -> Self {
        Self::new()
    }
}

impl MessageReader {
    pub fn new() -> Self {
        Self { slots: HashMap::new() }
    }

    #[inline]
    pub fn open_slot_count(&self) -> usize {
        self.slots.len()
    }

    /// Parses one complete packet (`header` already validated by the
    /// framer, `payload` is `header.size - 4` bytes) and returns every
    /// event it produced, in order.
    pub fn consume_packet(
        &mut self,
        header: &PacketHeader,
        payload: &[u8],
        framer: &PacketFramer,
        registry: &dyn TypeRegistry,
    ) -> Result<Vec<ReaderEvent>, RuntimeError> {
        let owned_payload;
        let payload = if header.is_compressed() {
            owned_payload = framer.decompress(payload)?;
            owned_payload.as_slice()
        } else {
            payload
        };

        match header.packet_type {
            PacketType::KeepAlive => Ok(vec![ReaderEvent::KeepAlive]),
            PacketType::CancelMessage => {
                let write_id = read_write_id(payload)?;
                self.slots.remove(&write_id);
                Ok(vec![ReaderEvent::CancelMessage { write_id }])
            }
            PacketType::CancelRequest => {
                let request_id = read_request_id(payload)?;
                Ok(vec![ReaderEvent::CancelRequest { request_id }])
            }
            PacketType::AckCount => Ok(vec![ReaderEvent::AckCount { payload: payload.to_vec() }]),
            PacketType::Update => Ok(vec![ReaderEvent::Update { payload: payload.to_vec() }]),
            PacketType::SwitchToNewMessage | PacketType::SwitchToOldMessage | PacketType::ContinuedMessage => {
                self.consume_message_segments(header.packet_type, payload, registry)
            }
        }
    }

    fn consume_message_segments(
        &mut self,
        first_kind: PacketType,
        payload: &[u8],
        registry: &dyn TypeRegistry,
    ) -> Result<Vec<ReaderEvent>, RuntimeError> {
        let mut events = Vec::new();
        let mut pos = 0;
        let mut next_kind = Some(first_kind);

        while pos < payload.len() {
            let is_new = match next_kind.take() {
                Some(PacketType::SwitchToNewMessage) => true,
                Some(PacketType::SwitchToOldMessage) | Some(PacketType::ContinuedMessage) => false,
                Some(_) => unreachable!("only message-bearing types reach this loop"),
                None => {
                    let kind = SegmentKind::from_u8(payload[pos])
                        .ok_or(RuntimeError::BadPacket("unknown segment data type"))?;
                    pos += 1;
                    matches!(kind, SegmentKind::NewMessage)
                }
            };

            let write_id = read_write_id(&payload[pos..])?;
            pos += WRITE_ID_LEN;

            if is_new {
                let type_idx = decode_type_id(&payload[pos..])?;
                pos += crate::framer::TYPE_ID_WIRE_LEN;
                let deserializer = registry.new_deserializer(type_idx)?;
                self.slots.insert(write_id, ReadSlot { deserializer, type_idx });
            }

            let remaining = &payload[pos..];
            let slot = self
                .slots
                .get_mut(&write_id)
                .ok_or(RuntimeError::BadPacket("segment for unknown write-id"))?;
            let outcome = slot.deserializer.run(remaining)?;
            pos += outcome.bytes();

            if outcome.is_done() {
                let mut slot = self.slots.remove(&write_id).expect("just looked up");
                let value = slot
                    .deserializer
                    .take()
                    .ok_or(RuntimeError::DeserializationError("deserializer reported Done with no value".into()))?;
                events.push(ReaderEvent::Message { type_idx: slot.type_idx, value });
            }
        }

        Ok(events)
    }
}

fn read_write_id(buf: &[u8]) -> Result<u16, RuntimeError> {
    if buf.len() < WRITE_ID_LEN {
        return Err(RuntimeError::BadPacket("truncated write-id"));
    }
    Ok(u16::from_be_bytes([buf[0], buf[1]]))
}

fn read_request_id(buf: &[u8]) -> Result<RequestId, RuntimeError> {
    if buf.len() < 8 {
        return Err(RuntimeError::BadPacket("truncated request id"));
    }
    Ok(RequestId::from_be_bytes(buf[..8].try_into().expect("slice is 8 bytes")))
}
