// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! The communication bus proper.
//!
//! Scheduler-facing methods live on the same handle as the net-handler
//! facing ones; the handle is cheap to clone. Blocking waits (migration
//! outcome, thread discovery) use rendezvous channels so the scheduler
//! worker can block without holding any lock.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::mpsc::{sync_channel, SyncSender};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use gridvm_proto::{Packet, RuntimeId, ThreadStatus, ThreadUid};
use gridvm_vm::{MessagePort, SendError, Value};

use crate::error::CommsError;
use crate::peers::PeerTable;

/// How long a sender waits for some node to claim an unknown thread.
const DISCOVERY_TIMEOUT: Duration = Duration::from_secs(2);

/// How long a migration may take end-to-end before the caller unwinds.
const MIGRATION_TIMEOUT: Duration = Duration::from_secs(10);

/// Pending messages drained from the inboxes of a migrating thread,
/// keyed by `(receiver, sender)`.
pub type MessageBundle = Vec<((ThreadUid, ThreadUid), Vec<Value>)>;

/// A status transition reported to this (origin) runtime.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusEvent {
    pub thread_uid: ThreadUid,
    pub status: ThreadStatus,
    pub waiting_from: Option<ThreadUid>,
}

/// Receiving half of the outbound packet queue; taken once by the net
/// handler.
pub type OutboundReceiver = mpsc::UnboundedReceiver<(Option<RuntimeId>, Packet)>;

#[derive(Default)]
struct Tables {
    /// Inboxes keyed by `(receiver, sender)`.
    messages: HashMap<(ThreadUid, ThreadUid), VecDeque<Value>>,
    /// Pairs with a message in flight from this node over the network.
    sent: Vec<(ThreadUid, ThreadUid)>,
    /// `(program_id, thread_id) → runtime_id`.
    forwarding: HashMap<ThreadUid, RuntimeId>,
}

#[derive(Default)]
struct Gates {
    migration: Option<SyncSender<Option<RuntimeId>>>,
    discovery: HashMap<ThreadUid, Vec<SyncSender<RuntimeId>>>,
    /// Threads already being asked about, to avoid multicast storms.
    querying: HashSet<ThreadUid>,
}

struct Inner {
    runtime_id: RuntimeId,
    tables: Mutex<Tables>,
    gates: Mutex<Gates>,
    status_q: Mutex<VecDeque<StatusEvent>>,
    print_q: Mutex<VecDeque<(ThreadUid, String)>>,
    migration_q: Mutex<VecDeque<Vec<u8>>>,
    outbound_tx: mpsc::UnboundedSender<(Option<RuntimeId>, Packet)>,
    peers: PeerTable,
}

/// Cheap-to-clone handle to the bus.
#[derive(Clone)]
pub struct CommsBus {
    inner: Arc<Inner>,
}

impl CommsBus {
    /// Create the bus; the returned receiver is the net handler's end of
    /// the outbound queue.
    pub fn new(runtime_id: RuntimeId) -> (Self, OutboundReceiver) {
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let bus = CommsBus {
            inner: Arc::new(Inner {
                runtime_id,
                tables: Mutex::new(Tables::default()),
                gates: Mutex::new(Gates::default()),
                status_q: Mutex::new(VecDeque::new()),
                print_q: Mutex::new(VecDeque::new()),
                migration_q: Mutex::new(VecDeque::new()),
                outbound_tx,
                peers: PeerTable::new(),
            }),
        };
        (bus, outbound_rx)
    }

    pub fn runtime_id(&self) -> &RuntimeId {
        &self.inner.runtime_id
    }

    pub fn peers(&self) -> PeerTable {
        self.inner.peers.clone()
    }

    fn enqueue(&self, target: Option<RuntimeId>, packet: Packet) {
        // A closed queue means the net handler is shutting down; packets
        // are dropped on the floor, like writes to a closed socket.
        let _ = self.inner.outbound_tx.send((target, packet));
    }

    // ── Messages (scheduler side) ────────────────────────────────────────────

    /// Non-blocking pop of the next message from `sender` to `recv`.
    pub fn receive_message(&self, sender: &ThreadUid, recv: &ThreadUid) -> Option<Value> {
        let mut tables = self.inner.tables.lock().unwrap();
        tables
            .messages
            .get_mut(&(recv.clone(), sender.clone()))
            .and_then(|q| q.pop_front())
    }

    /// True iff a blocked receiver has (or will shortly have) something to
    /// pop: the inbox is non-empty, or a message toward that pair left this
    /// node and is still in flight.
    pub fn can_receive_message(&self, sender: &ThreadUid, recv: &ThreadUid) -> bool {
        let mut tables = self.inner.tables.lock().unwrap();
        let pair = (recv.clone(), sender.clone());
        if tables.messages.get(&pair).is_some_and(|q| !q.is_empty()) {
            return true;
        }
        if let Some(pos) = tables.sent.iter().position(|p| *p == pair) {
            tables.sent.remove(pos);
            return true;
        }
        false
    }

    /// Like [`CommsBus::can_receive_message`] but without consuming the
    /// in-flight marker; used by the deadlock check, which must not eat the
    /// wake-up signal of the thread it inspects.
    pub fn has_pending(&self, sender: &ThreadUid, recv: &ThreadUid) -> bool {
        let tables = self.inner.tables.lock().unwrap();
        let pair = (recv.clone(), sender.clone());
        tables.messages.get(&pair).is_some_and(|q| !q.is_empty())
            || tables.sent.contains(&pair)
    }

    /// Drain every inbox whose receiver is `thread_uid` (migration time).
    pub fn receive_all_messages(&self, thread_uid: &ThreadUid) -> MessageBundle {
        let mut tables = self.inner.tables.lock().unwrap();
        let keys: Vec<_> = tables
            .messages
            .keys()
            .filter(|(recv, _)| recv == thread_uid)
            .cloned()
            .collect();
        let mut bundle = Vec::new();
        for key in keys {
            if let Some(queue) = tables.messages.remove(&key) {
                if !queue.is_empty() {
                    bundle.push((key, queue.into_iter().collect()));
                }
            }
        }
        bundle
    }

    /// Inverse of [`CommsBus::receive_all_messages`], on migration arrival.
    pub fn restore_messages(&self, bundle: MessageBundle) {
        let mut tables = self.inner.tables.lock().unwrap();
        for (key, messages) in bundle {
            tables.messages.entry(key).or_default().extend(messages);
        }
    }

    // ── Status / print requests ──────────────────────────────────────────────

    /// Report a status transition to the thread's origin runtime.
    pub fn send_status_request(
        &self,
        origin: &RuntimeId,
        thread_uid: ThreadUid,
        status: ThreadStatus,
        waiting_from: Option<ThreadUid>,
    ) {
        if *origin == self.inner.runtime_id {
            self.inner.status_q.lock().unwrap().push_back(StatusEvent {
                thread_uid,
                status,
                waiting_from,
            });
        } else {
            self.enqueue(
                Some(origin.clone()),
                Packet::status_update(thread_uid, status, waiting_from),
            );
        }
    }

    pub fn send_print_request(&self, origin: &RuntimeId, thread_uid: ThreadUid, text: String) {
        if *origin == self.inner.runtime_id {
            self.inner
                .print_q
                .lock()
                .unwrap()
                .push_back((thread_uid, text));
        } else {
            self.enqueue(Some(origin.clone()), Packet::print_request(thread_uid, text));
        }
    }

    pub fn get_status_requests(&self) -> Vec<StatusEvent> {
        self.inner.status_q.lock().unwrap().drain(..).collect()
    }

    pub fn get_print_requests(&self) -> Vec<(ThreadUid, String)> {
        self.inner.print_q.lock().unwrap().drain(..).collect()
    }

    // ── Forwarding table & discovery ─────────────────────────────────────────

    /// Record that `thread_uid` now runs on `location`; releases anyone
    /// blocked in [`CommsBus::resolve_location`] for it.
    pub fn update_thread_location(&self, thread_uid: ThreadUid, location: RuntimeId) {
        self.inner
            .tables
            .lock()
            .unwrap()
            .forwarding
            .insert(thread_uid.clone(), location.clone());

        let mut gates = self.inner.gates.lock().unwrap();
        gates.querying.remove(&thread_uid);
        if let Some(waiters) = gates.discovery.remove(&thread_uid) {
            for waiter in waiters {
                let _ = waiter.send(location.clone());
            }
        }
    }

    /// Forwarding-table entry, if any (no discovery).
    pub fn location_of(&self, thread_uid: &ThreadUid) -> Option<RuntimeId> {
        self.inner
            .tables
            .lock()
            .unwrap()
            .forwarding
            .get(thread_uid)
            .cloned()
    }

    /// Resolve the runtime currently hosting `thread_uid`, multicasting a
    /// `DISCOVER_THREAD_REQ` and blocking (bounded) on a miss.
    pub fn resolve_location(&self, thread_uid: &ThreadUid) -> Result<RuntimeId, CommsError> {
        if let Some(found) = self.location_of(thread_uid) {
            return Ok(found);
        }

        let rx = {
            let mut gates = self.inner.gates.lock().unwrap();
            let (tx, rx) = sync_channel(1);
            gates
                .discovery
                .entry(thread_uid.clone())
                .or_default()
                .push(tx);
            if gates.querying.insert(thread_uid.clone()) {
                self.enqueue(None, Packet::thread_query(thread_uid.clone()));
            }
            rx
        };

        rx.recv_timeout(DISCOVERY_TIMEOUT)
            .map_err(|_| CommsError::UnknownThread(thread_uid.clone()))
    }

    // ── Migration ────────────────────────────────────────────────────────────

    /// Ship a packed thread to `target` (or to any peer that will take it)
    /// and block until the net handler signals the outcome.
    ///
    /// Returns the accepting runtime on success; `None` if every candidate
    /// refused. The forwarding table is updated on success.
    pub fn migrate_thread(
        &self,
        thread_uid: ThreadUid,
        package: Vec<u8>,
        target: Option<RuntimeId>,
    ) -> Result<Option<RuntimeId>, CommsError> {
        if target.as_ref() == Some(&self.inner.runtime_id) {
            return Err(CommsError::SelfMigration);
        }

        let rx = {
            let mut gates = self.inner.gates.lock().unwrap();
            let (tx, rx) = sync_channel(1);
            gates.migration = Some(tx);
            rx
        };
        self.enqueue(target, Packet::migrate_thread(thread_uid.clone(), package));

        let outcome = rx
            .recv_timeout(MIGRATION_TIMEOUT)
            .map_err(|_| CommsError::MigrationTimeout)?;
        if let Some(acceptor) = &outcome {
            self.update_thread_location(thread_uid, acceptor.clone());
        }
        Ok(outcome)
    }

    // ── Net handler side ─────────────────────────────────────────────────────

    /// A `THREAD_MESSAGE` arrived from the network.
    pub fn add_thread_message(&self, recv: ThreadUid, sender: ThreadUid, msg: Value) {
        self.inner
            .tables
            .lock()
            .unwrap()
            .messages
            .entry((recv, sender))
            .or_default()
            .push_back(msg);
    }

    pub fn add_status_request(&self, event: StatusEvent) {
        self.inner.status_q.lock().unwrap().push_back(event);
    }

    pub fn add_print_request(&self, thread_uid: ThreadUid, text: String) {
        self.inner
            .print_q
            .lock()
            .unwrap()
            .push_back((thread_uid, text));
    }

    /// A `MIGRATE_THREAD` package arrived; the thread now lives here.
    pub fn add_thread_migration(&self, thread_uid: ThreadUid, package: Vec<u8>) {
        self.update_thread_location(thread_uid, self.inner.runtime_id.clone());
        self.inner.migration_q.lock().unwrap().push_back(package);
    }

    /// Outcome signal for the migration gate.
    pub fn migrate_thread_completed(&self, acceptor: Option<RuntimeId>) {
        let gate = self.inner.gates.lock().unwrap().migration.take();
        match gate {
            Some(tx) => {
                let _ = tx.send(acceptor);
            }
            None => tracing::warn!("migration outcome with no migration in flight"),
        }
    }

    pub fn get_migrated_threads(&self) -> Vec<Vec<u8>> {
        self.inner.migration_q.lock().unwrap().drain(..).collect()
    }
}

// ── The interpreter's port ────────────────────────────────────────────────────

impl MessagePort for CommsBus {
    fn send_message(
        &self,
        recv: ThreadUid,
        sender: ThreadUid,
        msg: Value,
    ) -> Result<(), SendError> {
        let location = self
            .resolve_location(&recv)
            .map_err(|e| SendError(e.to_string()))?;

        if location == self.inner.runtime_id {
            let mut tables = self.inner.tables.lock().unwrap();
            tables
                .messages
                .entry((recv, sender))
                .or_default()
                .push_back(msg);
            return Ok(());
        }

        let wire = serde_json::to_value(&msg).map_err(|e| SendError(e.to_string()))?;
        let pair = (recv.clone(), sender.clone());
        self.enqueue(
            Some(location),
            Packet::thread_message(recv, sender, wire),
        );
        self.inner.tables.lock().unwrap().sent.push(pair);
        Ok(())
    }

    fn receive_message(&self, sender: ThreadUid, recv: ThreadUid) -> Option<Value> {
        CommsBus::receive_message(self, &sender, &recv)
    }

    fn send_print(&self, origin: &RuntimeId, thread: ThreadUid, text: String) {
        self.send_print_request(origin, thread, text);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use gridvm_proto::ProgramId;

    fn uid(t: u32) -> ThreadUid {
        ThreadUid(ProgramId::derive("/p.mtss"), t)
    }

    fn bus() -> (CommsBus, OutboundReceiver) {
        CommsBus::new(RuntimeId::derive("local"))
    }

    #[test]
    fn local_send_receive_is_fifo() {
        let (bus, _rx) = bus();
        bus.update_thread_location(uid(1), bus.runtime_id().clone());

        bus.send_message(uid(1), uid(0), Value::Int(1)).unwrap();
        bus.send_message(uid(1), uid(0), Value::Int(2)).unwrap();

        assert!(bus.can_receive_message(&uid(0), &uid(1)));
        assert_eq!(bus.receive_message(&uid(0), &uid(1)), Some(Value::Int(1)));
        assert_eq!(bus.receive_message(&uid(0), &uid(1)), Some(Value::Int(2)));
        assert_eq!(bus.receive_message(&uid(0), &uid(1)), None);
    }

    #[test]
    fn remote_send_goes_to_outbound_queue_and_marks_in_flight() {
        let (bus, mut rx) = bus();
        let remote = RuntimeId::derive("remote");
        bus.update_thread_location(uid(1), remote.clone());

        bus.send_message(uid(1), uid(0), Value::Int(42)).unwrap();

        let (target, packet) = rx.try_recv().unwrap();
        assert_eq!(target, Some(remote));
        assert_eq!(packet.kind, gridvm_proto::PacketKind::ThreadMessage);

        // The in-flight marker wakes a blocked receiver exactly once.
        assert!(bus.can_receive_message(&uid(0), &uid(1)));
        assert!(!bus.can_receive_message(&uid(0), &uid(1)));
    }

    #[test]
    fn unknown_thread_times_out_with_a_query() {
        let (bus, mut rx) = bus();
        let err = bus.send_message(uid(9), uid(0), Value::Int(1)).unwrap_err();
        assert!(err.to_string().contains("no runtime claims"));

        let (target, packet) = rx.try_recv().unwrap();
        assert_eq!(target, None, "discovery goes out on multicast");
        assert_eq!(packet.kind, gridvm_proto::PacketKind::DiscoverThreadReq);
    }

    #[test]
    fn drain_and_restore_round_trip() {
        let (bus, _rx) = bus();
        bus.update_thread_location(uid(1), bus.runtime_id().clone());
        bus.send_message(uid(1), uid(0), Value::Int(7)).unwrap();
        bus.send_message(uid(1), uid(2), Value::Int(8)).unwrap();

        let bundle = bus.receive_all_messages(&uid(1));
        assert_eq!(bundle.len(), 2);
        assert_eq!(bus.receive_message(&uid(0), &uid(1)), None);

        bus.restore_messages(bundle);
        assert_eq!(bus.receive_message(&uid(0), &uid(1)), Some(Value::Int(7)));
        assert_eq!(bus.receive_message(&uid(2), &uid(1)), Some(Value::Int(8)));
    }

    #[test]
    fn migration_gate_relays_the_acceptor() {
        let (bus, mut rx) = bus();
        let target = RuntimeId::derive("target");

        let bus2 = bus.clone();
        let target2 = target.clone();
        let signaller = std::thread::spawn(move || {
            // The "net handler": consume the packet, signal success.
            loop {
                if let Ok((_, pkt)) = rx.try_recv() {
                    assert_eq!(pkt.kind, gridvm_proto::PacketKind::MigrateThread);
                    break;
                }
                std::thread::sleep(Duration::from_millis(5));
            }
            bus2.migrate_thread_completed(Some(target2));
        });

        let outcome = bus
            .migrate_thread(uid(1), vec![1, 2, 3], Some(target.clone()))
            .unwrap();
        signaller.join().unwrap();

        assert_eq!(outcome, Some(target.clone()));
        assert_eq!(bus.location_of(&uid(1)), Some(target));
    }

    #[test]
    fn refused_migration_leaves_the_table_alone() {
        let (bus, _rx) = bus();
        bus.update_thread_location(uid(1), bus.runtime_id().clone());

        let bus2 = bus.clone();
        let signaller = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(10));
            bus2.migrate_thread_completed(None);
        });

        let outcome = bus
            .migrate_thread(uid(1), vec![], Some(RuntimeId::derive("busy")))
            .unwrap();
        signaller.join().unwrap();

        assert_eq!(outcome, None);
        assert_eq!(bus.location_of(&uid(1)), Some(bus.runtime_id().clone()));
    }

    #[test]
    fn migrating_to_self_is_rejected() {
        let (bus, _rx) = bus();
        let err = bus
            .migrate_thread(uid(0), vec![], Some(bus.runtime_id().clone()))
            .unwrap_err();
        assert!(matches!(err, CommsError::SelfMigration));
    }
}
