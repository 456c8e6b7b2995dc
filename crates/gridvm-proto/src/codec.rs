// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Wire framing.
//!
//! Layout per packet:
//!   `[kind:u8][total_length:u16 BE][meta_offset:u16 BE]` (5-byte header)
//!   `meta_offset` bytes of UTF-8 JSON metadata (may be empty)
//!   `total_length − 5 − meta_offset` bytes of binary payload
//!   4-byte checksum placeholder
//!
//! `total_length` covers header + metadata + payload; the checksum trailer is
//! carried on top of it.

use serde_json::Map;

use crate::error::ProtoError;
use crate::kind::PacketKind;
use crate::packet::{check_body, meta_from_map, meta_to_map, Packet};

pub const HEADER_LEN: usize = 5;
pub const TRAILER_LEN: usize = 4;

/// Checksums are not computed yet; the slot is reserved on the wire.
const CHECKSUM_PLACEHOLDER: [u8; TRAILER_LEN] = *b"0000";

/// Encode a packet to its wire representation.
///
/// Deterministic for identical inputs: the metadata object is emitted in
/// the JSON map's sorted key order.
pub fn encode(packet: &Packet) -> Result<Vec<u8>, ProtoError> {
    check_body(packet)?;
    let meta = serde_json::to_vec(&meta_to_map(packet)?).map_err(|e| ProtoError::Metadata {
        kind: packet.kind,
        reason: e.to_string(),
    })?;

    let total = HEADER_LEN + meta.len() + packet.payload.len();
    if meta.len() > u16::MAX as usize || total > u16::MAX as usize {
        return Err(ProtoError::TooLarge(total));
    }

    let mut out = Vec::with_capacity(total + TRAILER_LEN);
    out.push(packet.kind as u8);
    out.extend_from_slice(&(total as u16).to_be_bytes());
    out.extend_from_slice(&(meta.len() as u16).to_be_bytes());
    out.extend_from_slice(&meta);
    out.extend_from_slice(&packet.payload);
    out.extend_from_slice(&CHECKSUM_PLACEHOLDER);
    Ok(out)
}

/// Number of bytes that follow a 5-byte header on the wire
/// (metadata + payload + checksum trailer).
pub fn payload_len_from_header(header: &[u8; HEADER_LEN]) -> Result<usize, ProtoError> {
    let total = u16::from_be_bytes([header[1], header[2]]) as usize;
    if total < HEADER_LEN {
        return Err(ProtoError::Truncated(format!(
            "total_length {total} shorter than header"
        )));
    }
    Ok(total - HEADER_LEN + TRAILER_LEN)
}

/// Decode one packet from its full wire representation.
pub fn decode(buf: &[u8]) -> Result<Packet, ProtoError> {
    if buf.len() < HEADER_LEN + TRAILER_LEN {
        return Err(ProtoError::Truncated(format!("{} bytes", buf.len())));
    }
    let kind = PacketKind::from_u8(buf[0])?;
    let total = u16::from_be_bytes([buf[1], buf[2]]) as usize;
    let meta_len = u16::from_be_bytes([buf[3], buf[4]]) as usize;

    if total + TRAILER_LEN != buf.len() || HEADER_LEN + meta_len > total {
        return Err(ProtoError::Truncated(format!(
            "length fields inconsistent: total={total} meta={meta_len} buf={}",
            buf.len()
        )));
    }

    let meta_bytes = &buf[HEADER_LEN..HEADER_LEN + meta_len];
    let meta: Map<String, serde_json::Value> = if meta_bytes.is_empty() {
        Map::new()
    } else {
        serde_json::from_slice(meta_bytes).map_err(|e| ProtoError::Metadata {
            kind,
            reason: e.to_string(),
        })?
    };

    let (sender, body) = meta_from_map(kind, &meta)?;
    Ok(Packet {
        kind,
        sender,
        body,
        payload: buf[HEADER_LEN + meta_len..total].to_vec(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_metadata_is_tolerated() {
        // Hand-built ACK frame with a zero-length metadata segment.
        let mut raw = vec![0xff, 0x00, HEADER_LEN as u8, 0x00, 0x00];
        raw.extend_from_slice(b"0000");
        let pkt = decode(&raw).unwrap();
        assert_eq!(pkt.kind, PacketKind::Ack);
        assert!(pkt.payload.is_empty());
    }

    #[test]
    fn truncated_frames_are_rejected() {
        assert!(decode(&[0xff, 0x00]).is_err());
        let mut raw = encode(&Packet::control(PacketKind::Ack)).unwrap();
        raw.pop();
        assert!(decode(&raw).is_err());
    }
}
