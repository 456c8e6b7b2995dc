// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use thiserror::Error;

use crate::kind::PacketKind;

#[derive(Debug, Error)]
pub enum ProtoError {
    #[error("unknown packet kind {0:#04x}")]
    UnknownKind(u8),

    #[error("packet kind {0:?} has no reply kind")]
    NoReplyKind(PacketKind),

    #[error("packet too large: {0} bytes")]
    TooLarge(usize),

    #[error("truncated packet: {0}")]
    Truncated(String),

    #[error("metadata error for {kind:?}: {reason}")]
    Metadata { kind: PacketKind, reason: String },

    #[error("packet kind {kind:?} cannot carry {body} metadata")]
    BodyMismatch { kind: PacketKind, body: &'static str },
}
