//! Socket construction for the bus participant.
//!
//! Two sockets per participant: a shared-port multicast receiver for
//! announcements and an ephemeral sender that doubles as the unicast event
//! inbox. SO_REUSEADDR + SO_REUSEPORT on the receiver lets every participant
//! on the host bind the same group port.

use std::collections::HashSet;
use std::io;
use std::net::{IpAddr, Ipv4Addr, SocketAddrV4};

use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::UdpSocket;
use trestle_protocol::wire::MAX_DATAGRAM_SIZE;

/// Group receiver: bound to the group port on all interfaces, joined to the
/// group on loopback.
pub(crate) fn multicast_receiver(group: SocketAddrV4) -> io::Result<UdpSocket> {
    let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))?;
    socket.set_reuse_address(true)?;
    #[cfg(unix)]
    socket.set_reuse_port(true)?;
    socket.set_recv_buffer_size(MAX_DATAGRAM_SIZE)?;

    let bind_addr = SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, group.port());
    socket.bind(&bind_addr.into())?;
    socket.join_multicast_v4(group.ip(), &Ipv4Addr::LOCALHOST)?;

    socket.set_nonblocking(true)?;
    UdpSocket::from_std(socket.into())
}

/// Event sender: ephemeral port, multicast TTL 0 so announcements never
/// leave the host. Peers learn this socket's port from our announcements and
/// unicast events back to it.
pub(crate) fn event_sender() -> io::Result<UdpSocket> {
    let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))?;
    socket.bind(&SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, 0).into())?;
    socket.set_multicast_ttl_v4(0)?;
    socket.set_multicast_if_v4(&Ipv4Addr::LOCALHOST)?;
    socket.set_multicast_loop_v4(true)?;
    socket.set_nonblocking(true)?;
    UdpSocket::from_std(socket.into())
}

/// Addresses that count as "this host" for the announcement source filter.
///
/// Loopback and unspecified are always local; the primary interface address
/// is discovered by routing a connectionless UDP socket at a public address
/// and reading back the chosen source (no packet is sent).
pub(crate) fn local_addresses() -> HashSet<IpAddr> {
    let mut addrs = HashSet::new();
    addrs.insert(IpAddr::V4(Ipv4Addr::LOCALHOST));
    addrs.insert(IpAddr::V4(Ipv4Addr::UNSPECIFIED));

    if let Ok(probe) = std::net::UdpSocket::bind((Ipv4Addr::UNSPECIFIED, 0)) {
        if probe.connect(("8.8.8.8", 53)).is_ok() {
            if let Ok(addr) = probe.local_addr() {
                addrs.insert(addr.ip());
            }
        }
    }

    addrs
}

/// Whether datagrams from `source` should be treated as originating on this
/// host.
pub(crate) fn is_local(source: IpAddr, local: &HashSet<IpAddr>) -> bool {
    source.is_loopback() || local.contains(&source)
}
