// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Wire round-trip tests for every packet kind.

use std::collections::HashSet;
use std::net::{IpAddr, Ipv4Addr};

use gridvm_proto::{
    decode, encode, Packet, PacketKind, ProgramId, RuntimeId, SenderInfo, ThreadStatus, ThreadUid,
};

fn uid(tid: u32) -> ThreadUid {
    ThreadUid(ProgramId::derive("/srv/programs/demo.mtss"), tid)
}

fn sender() -> SenderInfo {
    SenderInfo {
        ip: IpAddr::V4(Ipv4Addr::new(192, 168, 1, 7)),
        port: 40551,
        runtime_id: RuntimeId::derive("2026-07-30T10:00:00"),
    }
}

fn roundtrip(pkt: &Packet) -> Packet {
    decode(&encode(pkt).expect("encode")).expect("decode")
}

// ── Structural round-trips ────────────────────────────────────────────────────

#[test]
fn control_packet_roundtrip() {
    for kind in [
        PacketKind::DiscoverReq,
        PacketKind::DiscoverRep,
        PacketKind::ShutdownReq,
        PacketKind::ShutdownAck,
        PacketKind::Ack,
        PacketKind::Nack,
        PacketKind::Retry,
    ] {
        let mut pkt = Packet::control(kind);
        pkt.sender = Some(sender());
        assert_eq!(pkt, roundtrip(&pkt));
    }
}

#[test]
fn thread_message_roundtrip() {
    let mut pkt = Packet::thread_message(uid(1), uid(0), serde_json::json!(42));
    pkt.sender = Some(sender());
    assert_eq!(pkt, roundtrip(&pkt));
}

#[test]
fn thread_message_string_value() {
    let pkt = Packet::thread_message(uid(2), uid(3), serde_json::json!("héllo ✓"));
    assert_eq!(pkt, roundtrip(&pkt));
}

#[test]
fn status_update_roundtrip() {
    let pkt = Packet::status_update(uid(0), ThreadStatus::Blocked, Some(uid(1)));
    assert_eq!(pkt, roundtrip(&pkt));

    let no_wait = Packet::status_update(uid(0), ThreadStatus::Finished, None);
    assert_eq!(no_wait, roundtrip(&no_wait));
}

#[test]
fn print_request_roundtrip() {
    let pkt = Packet::print_request(uid(4), "got 42".into());
    assert_eq!(pkt, roundtrip(&pkt));
}

#[test]
fn migrate_thread_carries_binary_payload() {
    let blob: Vec<u8> = (0u16..600).map(|i| (i % 251) as u8).collect();
    let mut pkt = Packet::migrate_thread(uid(1), blob.clone());
    pkt.sender = Some(sender());
    let back = roundtrip(&pkt);
    assert_eq!(back.payload, blob, "payload must survive byte-for-byte");
    assert_eq!(back, pkt);
}

#[test]
fn thread_discovery_roundtrip() {
    let query = Packet::thread_query(uid(7));
    assert_eq!(query, roundtrip(&query));

    let reply = Packet::thread_location(uid(7), RuntimeId::derive("peer"));
    assert_eq!(reply, roundtrip(&reply));
}

#[test]
fn migration_completed_roundtrip() {
    let mut pkt = Packet::migration_completed(uid(5));
    pkt.sender = Some(sender());
    assert_eq!(pkt, roundtrip(&pkt));
}

// ── Encode determinism ────────────────────────────────────────────────────────

#[test]
fn encode_is_deterministic() {
    let mut pkt = Packet::thread_message(uid(1), uid(0), serde_json::json!([1, 2]));
    pkt.sender = Some(sender());
    assert_eq!(encode(&pkt).unwrap(), encode(&pkt).unwrap());
}

// ── Loop-suppression set behaviour ────────────────────────────────────────────

#[test]
fn packets_hash_by_kind_and_compare_structurally() {
    let a = Packet::thread_query(uid(1));
    let b = Packet::thread_query(uid(2));

    let mut sent: HashSet<Packet> = HashSet::new();
    sent.insert(a.clone());
    // Same kind, different metadata: not suppressed.
    assert!(!sent.contains(&b));
    // Structural re-reception: suppressed exactly once.
    assert!(sent.remove(&roundtrip(&a)));
    assert!(!sent.contains(&a));
}

// ── Body/kind discipline ──────────────────────────────────────────────────────

#[test]
fn mismatched_body_is_rejected_on_encode() {
    let bogus = Packet {
        kind: PacketKind::Ack,
        sender: None,
        body: gridvm_proto::PacketBody::ThreadQuery(gridvm_proto::ThreadQuery {
            thread_uid: uid(0),
        }),
        payload: Vec::new(),
    };
    assert!(encode(&bogus).is_err());
}

#[test]
fn oversized_packet_is_rejected() {
    let pkt = Packet::migrate_thread(uid(0), vec![0u8; 70_000]);
    assert!(encode(&pkt).is_err());
}
