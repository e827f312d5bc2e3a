//! LAN peer discovery over UDP multicast.
//!
//! A listener joins the group and reports novel peers through a channel;
//! the network task owns the peer table and decides whether to dial. A
//! sender announces our own hello coordinates every few seconds.

use crate::config::{ANNOUNCE_INTERVAL_SECS, MAX_DATAGRAM_BYTES, MULTICAST_GROUP, MULTICAST_PORT};
use crate::net::wire::Frame;
use socket2::{Domain, Protocol, Socket, Type};
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio::time::{sleep, Duration};
use tracing::debug;

/// A peer heard on the multicast group that we are not connected to yet.
#[derive(Debug, Clone)]
pub struct Discovered {
    pub peer_id: String,
    pub addr: SocketAddr,
}

/// Group-joined, reuse-addr listening socket. socket2 does the setup the
/// std builder cannot (SO_REUSEADDR before bind).
fn listener_socket() -> std::io::Result<UdpSocket> {
    let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))?;
    socket.set_reuse_address(true)?;
    socket.set_nonblocking(true)?;
    let bind_addr = SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, MULTICAST_PORT);
    socket.bind(&SocketAddr::V4(bind_addr).into())?;
    socket.join_multicast_v4(&MULTICAST_GROUP, &Ipv4Addr::UNSPECIFIED)?;
    UdpSocket::from_std(socket.into())
}

/// Listen for `discover` datagrams and forward novel peers to `found`.
/// Our own announcements are recognised by pubkey and ignored. Returns
/// quietly if the group cannot be joined (no multicast on this host).
pub async fn listen(
    own_pubkey: String,
    found: mpsc::UnboundedSender<Discovered>,
    running: Arc<AtomicBool>,
) {
    let socket = match listener_socket() {
        Ok(s) => s,
        Err(e) => {
            debug!("multicast listener unavailable: {e}");
            return;
        }
    };

    let mut buf = [0u8; MAX_DATAGRAM_BYTES];
    while running.load(Ordering::SeqCst) {
        let (len, from) = match socket.recv_from(&mut buf).await {
            Ok(r) => r,
            Err(_) => {
                sleep(Duration::from_secs(1)).await;
                continue;
            }
        };
        let Ok(text) = std::str::from_utf8(&buf[..len]) else {
            continue;
        };
        let Ok(Frame::Discover { name, tag, pubkey, tcp_port }) = Frame::parse(text) else {
            continue;
        };
        if pubkey == own_pubkey {
            continue;
        }
        let discovered = Discovered {
            peer_id: format!("{name}#{tag}"),
            addr: SocketAddr::new(from.ip(), tcp_port),
        };
        if found.send(discovered).is_err() {
            return;
        }
    }
}

/// Announce our hello coordinates to the group every
/// `ANNOUNCE_INTERVAL_SECS` until shutdown.
pub async fn announce(frame: Frame, running: Arc<AtomicBool>) {
    let socket = match UdpSocket::bind((Ipv4Addr::UNSPECIFIED, 0)).await {
        Ok(s) => s,
        Err(e) => {
            debug!("multicast announcer unavailable: {e}");
            return;
        }
    };
    let _ = socket.set_multicast_ttl_v4(2);
    let payload = frame.encode();
    let target = SocketAddrV4::new(MULTICAST_GROUP, MULTICAST_PORT);

    while running.load(Ordering::SeqCst) {
        let _ = socket.send_to(payload.as_bytes(), target).await;
        sleep(Duration::from_secs(ANNOUNCE_INTERVAL_SECS)).await;
    }
}
