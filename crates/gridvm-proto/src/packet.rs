// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Typed control/data packets.
//!
//! The metadata of every kind is a typed struct; on the wire the fields are
//! flattened into a single flat JSON object together with the sender
//! identity, so the encoded form stays a plain `{"key": value}` map.

use std::hash::{Hash, Hasher};
use std::net::IpAddr;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::ProtoError;
use crate::ident::{RuntimeId, ThreadStatus, ThreadUid};
use crate::kind::PacketKind;

// ── Sender identity ───────────────────────────────────────────────────────────

/// Identity of the node that sent a packet.
///
/// Request packets implicitly carry this; the net handler fills it in just
/// before dispatch, which is why it is optional on the in-memory packet.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SenderInfo {
    pub ip: IpAddr,
    pub port: u16,
    pub runtime_id: RuntimeId,
}

// ── Kind-specific metadata ────────────────────────────────────────────────────

/// `DISCOVER_THREAD_REQ`: which node currently runs this thread?
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ThreadQuery {
    pub thread_uid: ThreadUid,
}

/// `DISCOVER_THREAD_REP`: the claim by the node that runs the thread.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ThreadLocation {
    pub thread_uid: ThreadUid,
    pub location: RuntimeId,
}

/// `THREAD_MESSAGE`: one inter-thread message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ThreadMessage {
    pub recv: ThreadUid,
    pub sender: ThreadUid,
    pub msg: Value,
}

/// `RUNTIME_STATUS_REQ`: a status transition reported to the origin runtime.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusUpdate {
    pub thread_uid: ThreadUid,
    pub status: ThreadStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub waiting_from: Option<ThreadUid>,
}

/// `RUNTIME_PRINT_REQ`: text a thread wants printed at its origin.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PrintRequest {
    pub thread_uid: ThreadUid,
    pub text: String,
}

/// `MIGRATE_THREAD` / `MIGRATION_COMPLETED`: the thread being moved.
/// For `MIGRATE_THREAD` the serialized thread package rides in the payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Migration {
    pub thread_uid: ThreadUid,
}

/// Metadata body, one variant per packet-kind family.
#[derive(Debug, Clone, PartialEq)]
pub enum PacketBody {
    /// Control kinds (DISCOVER, SHUTDOWN, ACK/NACK/RETRY…) carry no
    /// kind-specific fields.
    Empty,
    ThreadQuery(ThreadQuery),
    ThreadLocation(ThreadLocation),
    ThreadMessage(ThreadMessage),
    StatusUpdate(StatusUpdate),
    PrintRequest(PrintRequest),
    Migration(Migration),
}

impl PacketBody {
    fn name(&self) -> &'static str {
        match self {
            PacketBody::Empty => "empty",
            PacketBody::ThreadQuery(_) => "thread-query",
            PacketBody::ThreadLocation(_) => "thread-location",
            PacketBody::ThreadMessage(_) => "thread-message",
            PacketBody::StatusUpdate(_) => "status-update",
            PacketBody::PrintRequest(_) => "print-request",
            PacketBody::Migration(_) => "migration",
        }
    }
}

// ── Packet ────────────────────────────────────────────────────────────────────

/// One wire packet: kind, metadata (sender identity + typed body) and an
/// opaque binary payload.
///
/// Equality is structural; the hash covers only the kind so that a
/// `HashSet<Packet>` works as the "recently sent by me" multicast
/// loop-suppression set.
#[derive(Debug, Clone, PartialEq)]
pub struct Packet {
    pub kind: PacketKind,
    pub sender: Option<SenderInfo>,
    pub body: PacketBody,
    pub payload: Vec<u8>,
}

impl Eq for Packet {}

impl Hash for Packet {
    fn hash<H: Hasher>(&self, state: &mut H) {
        (self.kind as u8).hash(state);
    }
}

impl Packet {
    /// A bare control packet (no kind-specific metadata, no payload).
    pub fn control(kind: PacketKind) -> Self {
        Packet {
            kind,
            sender: None,
            body: PacketBody::Empty,
            payload: Vec::new(),
        }
    }

    pub fn thread_message(recv: ThreadUid, sender: ThreadUid, msg: Value) -> Self {
        Packet {
            kind: PacketKind::ThreadMessage,
            sender: None,
            body: PacketBody::ThreadMessage(ThreadMessage { recv, sender, msg }),
            payload: Vec::new(),
        }
    }

    pub fn status_update(
        thread_uid: ThreadUid,
        status: ThreadStatus,
        waiting_from: Option<ThreadUid>,
    ) -> Self {
        Packet {
            kind: PacketKind::RuntimeStatusReq,
            sender: None,
            body: PacketBody::StatusUpdate(StatusUpdate {
                thread_uid,
                status,
                waiting_from,
            }),
            payload: Vec::new(),
        }
    }

    pub fn print_request(thread_uid: ThreadUid, text: String) -> Self {
        Packet {
            kind: PacketKind::RuntimePrintReq,
            sender: None,
            body: PacketBody::PrintRequest(PrintRequest { thread_uid, text }),
            payload: Vec::new(),
        }
    }

    pub fn migrate_thread(thread_uid: ThreadUid, package: Vec<u8>) -> Self {
        Packet {
            kind: PacketKind::MigrateThread,
            sender: None,
            body: PacketBody::Migration(Migration { thread_uid }),
            payload: package,
        }
    }

    pub fn migration_completed(thread_uid: ThreadUid) -> Self {
        Packet {
            kind: PacketKind::MigrationCompleted,
            sender: None,
            body: PacketBody::Migration(Migration { thread_uid }),
            payload: Vec::new(),
        }
    }

    pub fn thread_query(thread_uid: ThreadUid) -> Self {
        Packet {
            kind: PacketKind::DiscoverThreadReq,
            sender: None,
            body: PacketBody::ThreadQuery(ThreadQuery { thread_uid }),
            payload: Vec::new(),
        }
    }

    pub fn thread_location(thread_uid: ThreadUid, location: RuntimeId) -> Self {
        Packet {
            kind: PacketKind::DiscoverThreadRep,
            sender: None,
            body: PacketBody::ThreadLocation(ThreadLocation {
                thread_uid,
                location,
            }),
            payload: Vec::new(),
        }
    }

    /// Runtime id of the sender, for handlers that require one.
    pub fn sender_runtime(&self) -> Result<&SenderInfo, ProtoError> {
        self.sender.as_ref().ok_or(ProtoError::Metadata {
            kind: self.kind,
            reason: "missing sender identity".into(),
        })
    }
}

// ── Flat-JSON conversion (used by the codec) ──────────────────────────────────

fn object_of<T: Serialize>(kind: PacketKind, value: &T) -> Result<Map<String, Value>, ProtoError> {
    match serde_json::to_value(value) {
        Ok(Value::Object(map)) => Ok(map),
        Ok(_) => Err(ProtoError::Metadata {
            kind,
            reason: "metadata did not serialize to an object".into(),
        }),
        Err(e) => Err(ProtoError::Metadata {
            kind,
            reason: e.to_string(),
        }),
    }
}

/// Flatten sender identity and body fields into one JSON object.
pub(crate) fn meta_to_map(packet: &Packet) -> Result<Map<String, Value>, ProtoError> {
    let mut map = match &packet.body {
        PacketBody::Empty => Map::new(),
        PacketBody::ThreadQuery(b) => object_of(packet.kind, b)?,
        PacketBody::ThreadLocation(b) => object_of(packet.kind, b)?,
        PacketBody::ThreadMessage(b) => object_of(packet.kind, b)?,
        PacketBody::StatusUpdate(b) => object_of(packet.kind, b)?,
        PacketBody::PrintRequest(b) => object_of(packet.kind, b)?,
        PacketBody::Migration(b) => object_of(packet.kind, b)?,
    };
    if let Some(sender) = &packet.sender {
        for (key, value) in object_of(packet.kind, sender)? {
            map.insert(key, value);
        }
    }
    Ok(map)
}

fn body_of<T>(kind: PacketKind, map: &Map<String, Value>) -> Result<T, ProtoError>
where
    T: for<'de> Deserialize<'de>,
{
    serde_json::from_value(Value::Object(map.clone())).map_err(|e| ProtoError::Metadata {
        kind,
        reason: e.to_string(),
    })
}

/// Rebuild the typed body (and sender identity) from a flat JSON object.
pub(crate) fn meta_from_map(
    kind: PacketKind,
    map: &Map<String, Value>,
) -> Result<(Option<SenderInfo>, PacketBody), ProtoError> {
    let sender = if map.contains_key("ip") {
        Some(body_of::<SenderInfo>(kind, map)?)
    } else {
        None
    };
    let body = match kind {
        PacketKind::DiscoverThreadReq => PacketBody::ThreadQuery(body_of(kind, map)?),
        PacketKind::DiscoverThreadRep => PacketBody::ThreadLocation(body_of(kind, map)?),
        PacketKind::ThreadMessage => PacketBody::ThreadMessage(body_of(kind, map)?),
        PacketKind::RuntimeStatusReq => PacketBody::StatusUpdate(body_of(kind, map)?),
        PacketKind::RuntimePrintReq => PacketBody::PrintRequest(body_of(kind, map)?),
        PacketKind::MigrateThread | PacketKind::MigrationCompleted => {
            PacketBody::Migration(body_of(kind, map)?)
        }
        _ => PacketBody::Empty,
    };
    Ok((sender, body))
}

/// Kinds that may legally carry each body variant; enforced on encode.
pub(crate) fn check_body(packet: &Packet) -> Result<(), ProtoError> {
    let ok = matches!(
        (packet.kind, &packet.body),
        (PacketKind::DiscoverThreadReq, PacketBody::ThreadQuery(_))
            | (PacketKind::DiscoverThreadRep, PacketBody::ThreadLocation(_))
            | (PacketKind::ThreadMessage, PacketBody::ThreadMessage(_))
            | (PacketKind::RuntimeStatusReq, PacketBody::StatusUpdate(_))
            | (PacketKind::RuntimePrintReq, PacketBody::PrintRequest(_))
            | (PacketKind::MigrateThread, PacketBody::Migration(_))
            | (PacketKind::MigrationCompleted, PacketBody::Migration(_))
            | (
                PacketKind::Uninit
                    | PacketKind::DiscoverReq
                    | PacketKind::DiscoverRep
                    | PacketKind::ShutdownReq
                    | PacketKind::ShutdownAck
                    | PacketKind::Print
                    | PacketKind::Nack
                    | PacketKind::Retry
                    | PacketKind::Ack,
                PacketBody::Empty,
            )
    );
    if ok {
        Ok(())
    } else {
        Err(ProtoError::BodyMismatch {
            kind: packet.kind,
            body: packet.body.name(),
        })
    }
}
