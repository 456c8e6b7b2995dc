// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Socket plumbing: multicast group membership and framed packet I/O.

use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::time::Duration;

use socket2::{Domain, Protocol, Socket, Type};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpStream, UdpSocket};
use tokio::time::timeout;

use gridvm_proto::{codec, Packet};

use crate::error::NetError;

/// Bound on one connect → request → reply unicast exchange.
pub const UNICAST_TIMEOUT: Duration = Duration::from_secs(5);

/// Subscribing side of the multicast pair.
///
/// `SO_REUSEADDR` before bind so several runtimes on one host can share the
/// group port.
pub(crate) fn multicast_sub(group: SocketAddrV4, interface: Ipv4Addr) -> std::io::Result<UdpSocket> {
    let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))?;
    socket.set_reuse_address(true)?;
    socket.set_nonblocking(true)?;
    socket.bind(&SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, group.port()).into())?;
    socket.join_multicast_v4(group.ip(), &interface)?;
    UdpSocket::from_std(socket.into())
}

/// Publishing side of the multicast pair. Loopback stays enabled: every
/// message sent is also received on the sub socket and deduplicated there.
pub(crate) fn multicast_pub(interface: Ipv4Addr) -> std::io::Result<UdpSocket> {
    let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))?;
    socket.set_nonblocking(true)?;
    socket.set_multicast_loop_v4(true)?;
    if !interface.is_unspecified() {
        socket.set_multicast_if_v4(&interface)?;
    }
    socket.bind(&SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, 0).into())?;
    UdpSocket::from_std(socket.into())
}

// ── Framed packet I/O over TCP ────────────────────────────────────────────────

/// Read exactly one packet from the stream.
pub async fn read_packet(stream: &mut TcpStream) -> Result<Packet, NetError> {
    let mut header = [0u8; codec::HEADER_LEN];
    stream.read_exact(&mut header).await?;
    let rest_len = codec::payload_len_from_header(&header)?;

    let mut frame = vec![0u8; codec::HEADER_LEN + rest_len];
    frame[..codec::HEADER_LEN].copy_from_slice(&header);
    stream.read_exact(&mut frame[codec::HEADER_LEN..]).await?;
    Ok(codec::decode(&frame)?)
}

/// Write one packet to the stream.
pub async fn write_packet(stream: &mut TcpStream, packet: &Packet) -> Result<(), NetError> {
    let bytes = codec::encode(packet)?;
    stream.write_all(&bytes).await?;
    stream.flush().await?;
    Ok(())
}

/// One reliable-unicast exchange: connect, write the request, block for
/// exactly one reply, disconnect. Bounded by [`UNICAST_TIMEOUT`] so a stuck
/// peer cannot freeze the sender.
pub async fn unicast_exchange(addr: SocketAddr, packet: &Packet) -> Result<Packet, NetError> {
    timeout(UNICAST_TIMEOUT, async {
        let mut stream = TcpStream::connect(addr).await?;
        write_packet(&mut stream, packet).await?;
        read_packet(&mut stream).await
    })
    .await
    .map_err(|_| NetError::Timeout(addr))?
}
