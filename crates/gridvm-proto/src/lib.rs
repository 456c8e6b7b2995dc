// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
pub mod codec;
pub mod error;
pub mod ident;
pub mod kind;
pub mod packet;

pub use codec::{decode, encode, payload_len_from_header, HEADER_LEN, TRAILER_LEN};
pub use error::ProtoError;
pub use ident::{short_hash, ProgramId, RuntimeId, ThreadId, ThreadStatus, ThreadUid};
pub use kind::PacketKind;
pub use packet::{
    Migration, Packet, PacketBody, PrintRequest, SenderInfo, StatusUpdate, ThreadLocation,
    ThreadMessage, ThreadQuery,
};
