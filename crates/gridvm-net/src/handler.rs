// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! The net handler.
//!
//! Two cooperating loops share the handler's state:
//!
//! - the **receive loop** owns the multicast subscription, the unicast
//!   listener and the command channel; it mutates the peer table and hands
//!   inbound traffic to the communication bus;
//! - the **send loop** drains the bus's outbound queue plus an internal
//!   queue of initiated sends (DISCOVER_REP, SHUTDOWN_ACK, …), performs
//!   every unicast exchange sequentially (which keeps per-pair message
//!   order) and runs the migration sub-protocol.
//!
//! Keeping all *initiated* exchanges out of the receive loop means two nodes
//! can discover each other simultaneously without deadlocking on each
//! other's blocked accept loop.
//!
//! The sockets are kept as local variables of the running loops so that
//! `tokio::select!` can poll them while the handler methods borrow the
//! state structs mutably.

use std::collections::HashSet;
use std::net::{IpAddr, Ipv4Addr, SocketAddr, SocketAddrV4};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::net::{TcpListener, TcpStream, UdpSocket};
use tokio::sync::mpsc;
use tokio::time::{sleep, timeout, Instant};

use gridvm_comms::{CommsBus, OutboundReceiver, PeerTable, StatusEvent};
use gridvm_proto::{codec, Packet, PacketBody, PacketKind, RuntimeId, SenderInfo};
use gridvm_vm::Value;

use crate::error::NetError;
use crate::sockets::{
    multicast_pub, multicast_sub, read_packet, unicast_exchange, write_packet, UNICAST_TIMEOUT,
};

/// Transient failures are re-sent this many times with exponential backoff.
const RETRY_MAX: u32 = 3;
const RETRY_BASE: Duration = Duration::from_millis(250);

/// Grace period for the SHUTDOWN_REQ / SHUTDOWN_ACK drain.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

// ── Configuration ─────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct NetConfig {
    /// IP of the local interface to advertise and multicast on.
    /// `0.0.0.0` auto-detects from the default route.
    pub interface: Ipv4Addr,
    /// Multicast group for discovery and announcements.
    pub group: SocketAddrV4,
}

impl Default for NetConfig {
    fn default() -> Self {
        NetConfig {
            interface: Ipv4Addr::UNSPECIFIED,
            group: SocketAddrV4::new(Ipv4Addr::new(224, 0, 0, 1), 19999),
        }
    }
}

// ── Handle ────────────────────────────────────────────────────────────────────

#[derive(Debug)]
enum NetCommand {
    /// Refuse MIGRATE_THREAD from now on, without broadcasting yet.
    PrepareShutdown,
    Shutdown,
}

/// Cheap-to-clone handle to the running net handler.
#[derive(Debug, Clone)]
pub struct NetHandle {
    cmd_tx: mpsc::UnboundedSender<NetCommand>,
    local: SocketAddr,
}

impl NetHandle {
    /// First phase of shutdown: further MIGRATE_THREAD arrivals are NACKed
    /// while the runtime migrates its foreign threads away.
    pub fn prepare_shutdown(&self) {
        let _ = self.cmd_tx.send(NetCommand::PrepareShutdown);
    }

    /// Final phase: broadcast SHUTDOWN_REQ and terminate once the peer
    /// table drains (or the grace period expires).
    pub fn shutdown(&self) {
        let _ = self.cmd_tx.send(NetCommand::Shutdown);
    }

    /// The advertised unicast address of this node.
    pub fn local_addr(&self) -> SocketAddr {
        self.local
    }
}

// ── Outbound units of the send loop ───────────────────────────────────────────

#[derive(Debug)]
enum Dest {
    Peer(RuntimeId),
    /// Used when the peer entry is already gone (SHUTDOWN_ACK).
    Addr(SocketAddr),
    Multicast,
}

#[derive(Debug)]
struct Outbound {
    dest: Dest,
    packet: Packet,
    attempt: u32,
}

// ── NetHandler ────────────────────────────────────────────────────────────────

pub struct NetHandler {
    mcast_sub: UdpSocket,
    listener: TcpListener,
    cmd_rx: mpsc::UnboundedReceiver<NetCommand>,
    outbound_rx: OutboundReceiver,
    send_q_rx: mpsc::UnboundedReceiver<Outbound>,
    recv: RecvState,
    send: SendState,
}

impl NetHandler {
    /// Bind all four sockets and register this node in its own peer table.
    pub async fn bind(
        config: NetConfig,
        comms: CommsBus,
        outbound_rx: OutboundReceiver,
    ) -> Result<(Self, NetHandle), NetError> {
        let listener = TcpListener::bind((Ipv4Addr::UNSPECIFIED, 0)).await?;
        let port = listener.local_addr()?.port();
        let ip = advertised_ip(config.interface, config.group);

        let identity = SenderInfo {
            ip: IpAddr::V4(ip),
            port,
            runtime_id: comms.runtime_id().clone(),
        };
        tracing::info!(
            "net handler up: {}:{} runtime_id={}",
            identity.ip,
            identity.port,
            identity.runtime_id
        );

        let peers = comms.peers();
        peers.insert(
            identity.runtime_id.clone(),
            SocketAddr::new(identity.ip, port),
        );

        let mcast_sub = multicast_sub(config.group, config.interface)?;
        let mcast_pub = multicast_pub(config.interface)?;

        let own_multicast = Arc::new(Mutex::new(HashSet::new()));
        let shutting_down = Arc::new(AtomicBool::new(false));
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let (send_q_tx, send_q_rx) = mpsc::unbounded_channel();

        let handle = NetHandle {
            cmd_tx,
            local: SocketAddr::new(identity.ip, port),
        };

        let handler = NetHandler {
            mcast_sub,
            listener,
            cmd_rx,
            outbound_rx,
            send_q_rx,
            recv: RecvState {
                comms: comms.clone(),
                peers: peers.clone(),
                own_multicast: Arc::clone(&own_multicast),
                shutting_down: Arc::clone(&shutting_down),
                send_q_tx: send_q_tx.clone(),
                identity: identity.clone(),
                shutdown_deadline: None,
            },
            send: SendState {
                mcast_pub,
                group: config.group,
                send_q_tx,
                comms,
                peers,
                own_multicast,
                identity,
            },
        };
        Ok((handler, handle))
    }

    /// Drive both loops until shutdown completes.
    pub async fn run(self) -> Result<(), NetError> {
        let NetHandler {
            mcast_sub,
            listener,
            cmd_rx,
            outbound_rx,
            send_q_rx,
            recv,
            mut send,
        } = self;

        // Announce ourselves before serving anything.
        send.send_multicast(with_sender(
            Packet::control(PacketKind::DiscoverReq),
            &send.identity,
        ))
        .await;

        tokio::select! {
            result = recv.run(mcast_sub, listener, cmd_rx) => result,
            result = send.run(outbound_rx, send_q_rx) => result,
        }
    }
}

fn with_sender(mut packet: Packet, identity: &SenderInfo) -> Packet {
    if packet.sender.is_none() {
        packet.sender = Some(identity.clone());
    }
    packet
}

/// Pick the IP peers should connect back to. With an explicit interface IP
/// that is it; otherwise ask the kernel which source address routes toward
/// the multicast group.
fn advertised_ip(interface: Ipv4Addr, group: SocketAddrV4) -> Ipv4Addr {
    if !interface.is_unspecified() {
        return interface;
    }
    let probed = std::net::UdpSocket::bind((Ipv4Addr::UNSPECIFIED, 0))
        .and_then(|s| {
            s.connect(group)?;
            s.local_addr()
        })
        .map(|a| match a.ip() {
            IpAddr::V4(ip) => ip,
            IpAddr::V6(_) => Ipv4Addr::LOCALHOST,
        });
    match probed {
        Ok(ip) if !ip.is_unspecified() => ip,
        _ => Ipv4Addr::LOCALHOST,
    }
}

// ── Receive loop ──────────────────────────────────────────────────────────────

struct RecvState {
    comms: CommsBus,
    peers: PeerTable,
    own_multicast: Arc<Mutex<HashSet<Packet>>>,
    shutting_down: Arc<AtomicBool>,
    send_q_tx: mpsc::UnboundedSender<Outbound>,
    identity: SenderInfo,
    shutdown_deadline: Option<Instant>,
}

impl RecvState {
    async fn run(
        mut self,
        mcast_sub: UdpSocket,
        listener: TcpListener,
        mut cmd_rx: mpsc::UnboundedReceiver<NetCommand>,
    ) -> Result<(), NetError> {
        let mut buf = vec![0u8; 66 * 1024];
        loop {
            let deadline = self
                .shutdown_deadline
                .unwrap_or_else(|| Instant::now() + Duration::from_secs(3600));

            tokio::select! {
                result = mcast_sub.recv_from(&mut buf) => match result {
                    Ok((len, _)) => self.on_multicast(&buf[..len]),
                    Err(e) => tracing::warn!("multicast recv error: {e}"),
                },
                result = listener.accept() => match result {
                    Ok((stream, _)) => {
                        if self.on_unicast(stream).await {
                            break;
                        }
                    }
                    Err(e) => tracing::warn!("accept error: {e}"),
                },
                cmd = cmd_rx.recv() => match cmd {
                    Some(NetCommand::PrepareShutdown) => {
                        self.shutting_down.store(true, Ordering::SeqCst);
                    }
                    Some(NetCommand::Shutdown) => {
                        if self.on_shutdown() {
                            break;
                        }
                    }
                    None => break,
                },
                _ = tokio::time::sleep_until(deadline), if self.shutdown_deadline.is_some() => {
                    tracing::warn!("shutdown grace period expired with peers remaining");
                    break;
                }
            }
        }
        tracing::info!("net handler stopped");
        Ok(())
    }

    fn queue(&self, dest: Dest, packet: Packet) {
        let _ = self.send_q_tx.send(Outbound {
            dest,
            packet,
            attempt: 0,
        });
    }

    // ── Multicast handlers ───────────────────────────────────────────────────

    fn on_multicast(&mut self, bytes: &[u8]) {
        let packet = match codec::decode(bytes) {
            Ok(p) => p,
            Err(e) => {
                tracing::debug!("dropping undecodable multicast: {e}");
                return;
            }
        };

        // Self-echo suppression: every mcast_pub send is seen on mcast_sub.
        if self.own_multicast.lock().unwrap().remove(&packet) {
            return;
        }
        if packet
            .sender
            .as_ref()
            .is_some_and(|s| s.runtime_id == self.identity.runtime_id)
        {
            return;
        }

        let sender = match packet.sender_runtime() {
            Ok(sender) => sender.clone(),
            Err(_) => {
                tracing::debug!("multicast {:?} without sender identity", packet.kind);
                return;
            }
        };
        let sender_addr = SocketAddr::new(sender.ip, sender.port);

        match packet.kind {
            PacketKind::DiscoverReq => {
                tracing::info!("found peer {} @ {sender_addr}", sender.runtime_id);
                self.peers.insert(sender.runtime_id.clone(), sender_addr);
                self.queue(
                    Dest::Peer(sender.runtime_id),
                    Packet::control(PacketKind::DiscoverRep),
                );
            }
            PacketKind::DiscoverRep => {
                self.peers.insert(sender.runtime_id, sender_addr);
            }
            PacketKind::ShutdownReq => {
                if self.peers.remove(&sender.runtime_id).is_none() {
                    tracing::warn!("peer {} not in my table", sender.runtime_id);
                }
                tracing::info!("lost peer {} @ {sender_addr}", sender.runtime_id);
                self.queue(
                    Dest::Addr(sender_addr),
                    Packet::control(PacketKind::ShutdownAck),
                );
            }
            PacketKind::MigrationCompleted => {
                if let PacketBody::Migration(m) = &packet.body {
                    self.comms
                        .update_thread_location(m.thread_uid.clone(), sender.runtime_id);
                }
            }
            PacketKind::DiscoverThreadReq => {
                if let PacketBody::ThreadQuery(q) = &packet.body {
                    let mine = self
                        .comms
                        .location_of(&q.thread_uid)
                        .is_some_and(|loc| loc == self.identity.runtime_id);
                    if mine {
                        self.queue(
                            Dest::Peer(sender.runtime_id),
                            Packet::thread_location(
                                q.thread_uid.clone(),
                                self.identity.runtime_id.clone(),
                            ),
                        );
                    }
                }
            }
            other => tracing::debug!("ignoring multicast {other:?}"),
        }
    }

    // ── Unicast handlers ─────────────────────────────────────────────────────

    /// Serve one inbound connection; returns `true` when the handler should
    /// terminate (last SHUTDOWN_ACK collected).
    async fn on_unicast(&mut self, mut stream: TcpStream) -> bool {
        let packet = match timeout(UNICAST_TIMEOUT, read_packet(&mut stream)).await {
            Ok(Ok(packet)) => packet,
            Ok(Err(e)) => {
                tracing::debug!("bad unicast request: {e}");
                return false;
            }
            Err(_) => {
                tracing::debug!("unicast request timed out mid-read");
                return false;
            }
        };

        tracing::debug!("got {:?} from peer", packet.kind);
        let (reply, terminate) = self.handle_request(&packet);
        match timeout(UNICAST_TIMEOUT, write_packet(&mut stream, &reply)).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => tracing::debug!("unicast reply failed: {e}"),
            Err(_) => tracing::debug!("unicast reply timed out"),
        }
        terminate
    }

    /// The handler table. Every request gets exactly one reply packet.
    fn handle_request(&mut self, packet: &Packet) -> (Packet, bool) {
        let ack = Packet::control(PacketKind::Ack);
        match (packet.kind, &packet.body) {
            (PacketKind::ThreadMessage, PacketBody::ThreadMessage(m)) => {
                match serde_json::from_value::<Value>(m.msg.clone()) {
                    Ok(value) => {
                        self.comms
                            .add_thread_message(m.recv.clone(), m.sender.clone(), value)
                    }
                    Err(e) => tracing::warn!("non-scalar thread message dropped: {e}"),
                }
                (ack, false)
            }

            (PacketKind::RuntimeStatusReq, PacketBody::StatusUpdate(update)) => {
                self.comms.add_status_request(StatusEvent {
                    thread_uid: update.thread_uid.clone(),
                    status: update.status,
                    waiting_from: update.waiting_from.clone(),
                });
                (ack, false)
            }

            (PacketKind::RuntimePrintReq, PacketBody::PrintRequest(req)) => {
                self.comms
                    .add_print_request(req.thread_uid.clone(), req.text.clone());
                (ack, false)
            }

            (PacketKind::MigrateThread, PacketBody::Migration(m)) => {
                if self.shutting_down.load(Ordering::SeqCst) {
                    // Refused: the initiator restores the thread locally.
                    return (Packet::control(PacketKind::Nack), false);
                }
                tracing::info!("thread {} migrated here", m.thread_uid);
                self.comms
                    .add_thread_migration(m.thread_uid.clone(), packet.payload.clone());
                self.queue(
                    Dest::Multicast,
                    Packet::migration_completed(m.thread_uid.clone()),
                );
                (ack, false)
            }

            (PacketKind::DiscoverThreadRep, PacketBody::ThreadLocation(loc)) => {
                self.comms
                    .update_thread_location(loc.thread_uid.clone(), loc.location.clone());
                (ack, false)
            }

            (PacketKind::DiscoverRep, _) => {
                if let Ok(sender) = packet.sender_runtime() {
                    self.peers.insert(
                        sender.runtime_id.clone(),
                        SocketAddr::new(sender.ip, sender.port),
                    );
                }
                (ack, false)
            }

            (PacketKind::ShutdownAck, _) => {
                if let Ok(sender) = packet.sender_runtime() {
                    self.peers.remove(&sender.runtime_id);
                }
                let done = self.shutting_down.load(Ordering::SeqCst) && self.peers.len() <= 1;
                if done {
                    tracing::info!("signaled all other runtimes");
                }
                (ack, done)
            }

            (kind, _) => {
                tracing::debug!("no handler for unicast {kind:?}; replying ACK");
                (ack, false)
            }
        }
    }

    // ── Shutdown ─────────────────────────────────────────────────────────────

    /// Returns `true` when there is nobody to wait for.
    fn on_shutdown(&mut self) -> bool {
        self.shutting_down.store(true, Ordering::SeqCst);
        if self.peers.len() <= 1 {
            return true;
        }
        tracing::info!("signaling {} other runtimes", self.peers.len() - 1);
        self.queue(Dest::Multicast, Packet::control(PacketKind::ShutdownReq));
        self.shutdown_deadline = Some(Instant::now() + SHUTDOWN_GRACE);
        false
    }
}

// ── Send loop ─────────────────────────────────────────────────────────────────

struct SendState {
    mcast_pub: UdpSocket,
    group: SocketAddrV4,
    send_q_tx: mpsc::UnboundedSender<Outbound>,
    comms: CommsBus,
    peers: PeerTable,
    own_multicast: Arc<Mutex<HashSet<Packet>>>,
    identity: SenderInfo,
}

impl SendState {
    async fn run(
        mut self,
        mut outbound_rx: OutboundReceiver,
        mut send_q_rx: mpsc::UnboundedReceiver<Outbound>,
    ) -> Result<(), NetError> {
        loop {
            let outbound = tokio::select! {
                entry = outbound_rx.recv() => match entry {
                    Some((target, packet)) if packet.kind == PacketKind::MigrateThread => {
                        self.do_migration(target, packet).await;
                        continue;
                    }
                    Some((target, packet)) => Outbound {
                        dest: target.map(Dest::Peer).unwrap_or(Dest::Multicast),
                        packet,
                        attempt: 0,
                    },
                    None => return Ok(()),
                },
                entry = send_q_rx.recv() => match entry {
                    Some(outbound) => outbound,
                    None => return Ok(()),
                },
            };
            self.dispatch(outbound).await;
        }
    }

    async fn dispatch(&mut self, outbound: Outbound) {
        let Outbound {
            dest,
            packet,
            attempt,
        } = outbound;
        let packet = with_sender(packet, &self.identity);

        let addr = match dest {
            Dest::Multicast => {
                self.send_multicast(packet).await;
                return;
            }
            Dest::Peer(id) => match self.peers.get(&id) {
                Some(addr) => addr,
                None => {
                    tracing::warn!("dropping {:?}: unknown peer {id}", packet.kind);
                    return;
                }
            },
            Dest::Addr(addr) => addr,
        };
        self.send_unicast(addr, packet, attempt).await;
    }

    async fn send_multicast(&mut self, packet: Packet) {
        let bytes = match codec::encode(&packet) {
            Ok(bytes) => bytes,
            Err(e) => {
                tracing::warn!("cannot encode multicast {:?}: {e}", packet.kind);
                return;
            }
        };
        tracing::debug!("sending {:?} over multicast", packet.kind);
        self.own_multicast.lock().unwrap().insert(packet);
        if let Err(e) = self
            .mcast_pub
            .send_to(&bytes, SocketAddr::V4(self.group))
            .await
        {
            tracing::warn!("multicast send failed: {e}");
        }
    }

    async fn send_unicast(&mut self, addr: SocketAddr, packet: Packet, attempt: u32) {
        tracing::debug!("sending {:?} to {addr}", packet.kind);
        match unicast_exchange(addr, &packet).await {
            Ok(reply) => match reply.kind {
                PacketKind::Ack => {}
                PacketKind::Retry => self.schedule_retry(addr, packet, attempt),
                PacketKind::Nack => {
                    tracing::warn!("{:?} to {addr} was refused", packet.kind)
                }
                other => tracing::debug!("unexpected reply {other:?} from {addr}"),
            },
            Err(e) => {
                tracing::debug!("{:?} to {addr} failed: {e}", packet.kind);
                self.schedule_retry(addr, packet, attempt);
            }
        }
    }

    /// Bounded exponential backoff; exhaustion is a hard failure.
    fn schedule_retry(&self, addr: SocketAddr, packet: Packet, attempt: u32) {
        let attempt = attempt + 1;
        if attempt > RETRY_MAX {
            tracing::error!("giving up on {:?} after {RETRY_MAX} retries", packet.kind);
            return;
        }
        let backoff = RETRY_BASE * 2u32.pow(attempt - 1);
        let tx = self.send_q_tx.clone();
        tokio::spawn(async move {
            sleep(backoff).await;
            let _ = tx.send(Outbound {
                dest: Dest::Addr(addr),
                packet,
                attempt,
            });
        });
    }

    // ── Migration sub-protocol (initiator side) ──────────────────────────────

    /// Unicast MIGRATE_THREAD to the target, or sweep the peer table until
    /// one peer ACKs. The outcome is signalled through the bus's gate.
    async fn do_migration(&mut self, target: Option<RuntimeId>, packet: Packet) {
        let packet = with_sender(packet, &self.identity);

        let candidates: Vec<(RuntimeId, SocketAddr)> = match target {
            Some(id) => match self.peers.get(&id) {
                Some(addr) => vec![(id, addr)],
                None => {
                    tracing::warn!("migration target {id} is not a known peer");
                    Vec::new()
                }
            },
            None => self
                .peers
                .snapshot()
                .into_iter()
                .filter(|(id, _)| *id != self.identity.runtime_id)
                .collect(),
        };

        for (id, addr) in candidates {
            match unicast_exchange(addr, &packet).await {
                Ok(reply) if reply.kind == PacketKind::Ack => {
                    tracing::info!("peer {id} accepted the thread");
                    self.comms.migrate_thread_completed(Some(id));
                    return;
                }
                Ok(reply) => {
                    tracing::debug!("peer {id} replied {:?} to migration", reply.kind)
                }
                Err(e) => tracing::debug!("migration to {id} failed: {e}"),
            }
        }
        self.comms.migrate_thread_completed(None);
    }
}
