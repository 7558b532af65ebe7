use std::net::SocketAddr;

use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::UdpSocket;

use crate::core::{Error, Result};

/// Creates a non-blocking UDP socket bound to `addr`
fn create_udp_socket(addr: SocketAddr, broadcast: bool) -> Result<Socket> {
    let domain = if addr.is_ipv6() {
        Domain::IPV6
    } else {
        Domain::IPV4
    };

    let socket = Socket::new(domain, Type::DGRAM, Some(Protocol::UDP))
        .map_err(|e| Error::network(format!("Failed to create socket: {}", e)))?;

    socket
        .set_reuse_address(true)
        .map_err(|e| Error::network(format!("Failed to set SO_REUSEADDR: {}", e)))?;

    if broadcast {
        socket
            .set_broadcast(true)
            .map_err(|e| Error::network(format!("Failed to enable broadcast: {}", e)))?;
    }

    socket
        .bind(&addr.into())
        .map_err(|e| Error::network(format!("Failed to bind {}: {}", addr, e)))?;

    socket
        .set_nonblocking(true)
        .map_err(|e| Error::network(format!("Failed to set non-blocking: {}", e)))?;

    Ok(socket)
}

/// Binds the socket inbound datagrams arrive on
pub fn bind_receive_socket(addr: SocketAddr) -> Result<UdpSocket> {
    let socket = create_udp_socket(addr, false)?;
    Ok(UdpSocket::from_std(socket.into())?)
}

/// Binds the broadcast-capable socket every transport sends through
pub fn bind_send_socket(addr: SocketAddr) -> Result<UdpSocket> {
    let socket = create_udp_socket(addr, true)?;
    Ok(UdpSocket::from_std(socket.into())?)
}
