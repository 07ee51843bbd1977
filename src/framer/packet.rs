// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::sync::Arc;

use bitflags::bitflags;
use zerocopy::{BigEndian, FromBytes, Immutable, IntoBytes, KnownLayout, U16};

use crate::error::RuntimeError;

/// Every packet on the wire is `[4-byte header][payload <= MaxPayload]`.
pub const HEADER_LEN: usize = 4;
/// Hard wire limit: `size` is a `uint16`, so no packet may exceed this.
pub const MAX_PACKET_SIZE: usize = 65_535;

/// A caller-supplied in-place compressor. Transforms `buf` in place and
/// returns the new length, or `Ok(0)` to mean "left uncompressed". `Err`
/// is a fatal `CompressionError` for the connection.
pub type CompressFn = Arc<dyn Fn(&mut [u8]) -> Result<usize, ()> + Send + Sync>;
/// The inverse transform, used by the reader when a packet's `Compressed`
/// flag is set.
pub type DecompressFn = Arc<dyn Fn(&[u8]) -> Result<Vec<u8>, ()> + Send + Sync>;

/// Packet header `type` field.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum PacketType {
    SwitchToNewMessage = 1,
    SwitchToOldMessage = 2,
    ContinuedMessage = 3,
    KeepAlive = 4,
    CancelMessage = 5,
    CancelRequest = 6,
    AckCount = 7,
    Update = 8,
}

impl PacketType {
    pub fn from_u8(v: u8) -> Option<Self> {
        Some(match v {
            1 => Self::SwitchToNewMessage,
            2 => Self::SwitchToOldMessage,
            3 => Self::ContinuedMessage,
            4 => Self::KeepAlive,
            5 => Self::CancelMessage,
            6 => Self::CancelRequest,
            7 => Self::AckCount,
            8 => Self::Update,
            _ => return None,
        })
    }

    pub fn carries_message_data(self) -> bool {
        matches!(self, Self::SwitchToNewMessage | Self::SwitchToOldMessage | Self::ContinuedMessage)
    }
}

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct PacketFlags: u8 {
        const COMPRESSED = 1 << 0;
    }
}

/// In-payload byte preceding every segment after the first.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum SegmentKind {
    NewMessage = 0,
    OldMessage = 1,
}

impl SegmentKind {
    pub fn from_u8(v: u8) -> Option<Self> {
        match v {
            0 => Some(Self::NewMessage),
            1 => Some(Self::OldMessage),
            _ => None,
        }
    }
}

#[repr(C)]
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, FromBytes, IntoBytes, KnownLayout, Immutable)]
struct RawPacketHeader {
    packet_type: u8,
    flags: u8,
    size: U16<BigEndian>,
}

/// A parsed packet header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PacketHeader {
    pub packet_type: PacketType,
    pub flags: PacketFlags,
    /// Total packet length, header included.
    pub size: u16,
}

impl PacketHeader {
    pub fn is_compressed(&self) -> bool {
        self.flags.contains(PacketFlags::COMPRESSED)
    }

    pub fn encode(&self, buf: &mut [u8]) -> Result<(), RuntimeError> {
        if buf.len() < HEADER_LEN {
            return Err(RuntimeError::BadPacket("buffer too small for packet header"));
        }
        let raw = RawPacketHeader {
            packet_type: self.packet_type as u8,
            flags: self.flags.bits(),
            size: U16::new(self.size),
        };
        buf[..HEADER_LEN].copy_from_slice(raw.as_bytes());
        Ok(())
    }

    pub fn decode(buf: &[u8]) -> Result<Self, RuntimeError> {
        if buf.len() < HEADER_LEN {
            return Err(RuntimeError::BadPacket("short packet header"));
        }
        let raw = RawPacketHeader::read_from_bytes(&buf[..HEADER_LEN])
            .map_err(|_| RuntimeError::BadPacket("malformed packet header"))?;
        let packet_type = PacketType::from_u8(raw.packet_type)
            .ok_or(RuntimeError::BadPacket("unknown packet type"))?;
        let flags = PacketFlags::from_bits_truncate(raw.flags);
        let size = raw.size.get();
        if (size as usize) < HEADER_LEN {
            return Err(RuntimeError::BadPacket("packet size smaller than header"));
        }
        Ok(Self { packet_type, flags, size })
    }
}

/// Cross-encodes a registry type index with a CRC32C so a `NewMessage`
/// segment's type id can be validated independently of the deserializer.
pub const TYPE_ID_WIRE_LEN: usize = 8;

pub fn encode_type_id(type_idx: u32) -> [u8; TYPE_ID_WIRE_LEN] {
    let id_bytes = type_idx.to_be_bytes();
    let crc = crc32c::crc32c(&id_bytes);
    let mut out = [0u8; TYPE_ID_WIRE_LEN];
    out[..4].copy_from_slice(&id_bytes);
    out[4..].copy_from_slice(&crc.to_be_bytes());
    out
}

pub fn decode_type_id(buf: &[u8]) -> Result<u32, RuntimeError> {
    if buf.len() < TYPE_ID_WIRE_LEN {
        return Err(RuntimeError::BadPacket("truncated type id"));
    }
    let id_bytes: [u8; 4] = buf[..4].try_into().expect("slice is 4 bytes");
    let crc_bytes: [u8; 4] = buf[4..8].try_into().expect("slice is 4 bytes");
    let expected = crc32c::crc32c(&id_bytes);
    if u32::from_be_bytes(crc_bytes) != expected {
        return Err(RuntimeError::BadPacket("type id CRC mismatch"));
    }
    Ok(u32::from_be_bytes(id_bytes))
}
