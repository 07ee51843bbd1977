// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! The packet framer: encodes/decodes the 4-byte packet
//! header and applies the optional in-place compression hook. This module
//! never interprets message contents — `writer`/`reader` own the
//! multiplexing semantics, `framer` only owns the wire envelope.

mod packet;

pub use packet::{
    CompressFn, DecompressFn, HEADER_LEN, MAX_PACKET_SIZE, PacketFlags, PacketHeader,
    PacketType, SegmentKind, TYPE_ID_WIRE_LEN, decode_type_id, encode_type_id,
};

use crate::error::RuntimeError;

/// Default `MaxPacket`, typically 8 KiB to 64 KiB.
pub const DEFAULT_MAX_PACKET: usize = 8 * 1024;

/// Below this many free payload bytes, `fill_packet` stops adding segments
/// to the current packet — enough room for a data-type
/// byte, a 2-byte write-id, and a cross-encoded type id, so a `NewMessage`
/// segment header never straddles a "nearly full" packet.
pub const MIN_FREE_PAYLOAD: usize = 16;

/// Encodes/decodes packet headers and applies the pluggable compression
/// transform. One `PacketFramer` is owned per connection.
#[derive(Clone)]
pub struct PacketFramer {
    max_packet: usize,
    compress_fn: Option<CompressFn>,
    decompress_fn: Option<DecompressFn>,
}

impl PacketFramer {
    pub fn new(max_packet: usize) -> Self {
        Self { max_packet: max_packet.min(MAX_PACKET_SIZE), compress_fn: None, decompress_fn: None }
    }

    pub fn with_compression(
        max_packet: usize,
        compress_fn: CompressFn,
        decompress_fn: DecompressFn,
    ) -> Self {
        Self {
            max_packet: max_packet.min(MAX_PACKET_SIZE),
            compress_fn: Some(compress_fn),
            decompress_fn: Some(decompress_fn),
        }
    }

    /// Maximum payload bytes (excluding the 4-byte header) the framer will
    /// ever put in one packet.
    #[inline]
    pub fn max_payload(&self) -> usize {
        self.max_packet - HEADER_LEN
    }

    /// Writes a 4-byte header into `buf[0..4]` describing a packet whose
    /// payload is `buf[4..4+payload_len]`. Fails with `PacketSizeExceeded`
    /// if the total would exceed 65535 bytes.
    pub fn stamp_header(
        &self,
        buf: &mut [u8],
        packet_type: PacketType,
        payload_len: usize,
        compressed: bool,
    ) -> Result<(), RuntimeError> {
        let total = HEADER_LEN + payload_len;
        if total > MAX_PACKET_SIZE {
            return Err(RuntimeError::PacketSizeExceeded);
        }
        let header = PacketHeader {
            packet_type,
            flags: if compressed { PacketFlags::COMPRESSED } else { PacketFlags::empty() },
            size: total as u16,
        };
        header.encode(&mut buf[..HEADER_LEN])
    }

    pub fn parse_header(&self, buf: &[u8]) -> Result<PacketHeader, RuntimeError> {
        let header = PacketHeader::decode(buf)?;
        if header.size as usize > self.max_packet {
            return Err(RuntimeError::BadPacket("packet size exceeds configured MaxPacket"));
        }
        Ok(header)
    }

    /// Applies the compression hook to `buf[..len]` in place. Returns
    /// `Some(new_len)` if compression shrank the payload (so the caller
    /// should set the `Compressed` flag and truncate to `new_len`), or
    /// `None` if the hook declined (returned zero) or no hook is
    /// configured.
    pub fn try_compress(&self, buf: &mut [u8], len: usize) -> Result<Option<usize>, RuntimeError> {
        let Some(f) = &self.compress_fn else { return Ok(None) };
        let new_len = f(&mut buf[..len]).map_err(|_| RuntimeError::CompressionError)?;
        if new_len == 0 || new_len >= len {
            Ok(None)
        } else {
            Ok(Some(new_len))
        }
    }

    /// Expands a compressed payload into a fresh buffer. Only called when
    /// the packet's `Compressed` flag is set.
    pub fn decompress(&self, payload: &[u8]) -> Result<Vec<u8>, RuntimeError> {
        match &self.decompress_fn {
            Some(f) => f(payload).map_err(|_| RuntimeError::CompressionError),
            None => Err(RuntimeError::CompressionError),
        }
    }
}
