use crate::error::{RecorderError, RecorderResult};
use socket2::{Domain, Protocol as SockProto, SockAddr, Socket, Type};
use std::net::{IpAddr, SocketAddr};
use tokio::net::UdpSocket;
use tracing::{info, instrument};

/// Creates the multicast RX socket for one stream group. The socket is
/// nonblocking and registered with the tokio reactor; read deadlines are
/// applied by the caller so that stall detection stays in one place.
#[instrument]
pub fn create_rx_socket(group: IpAddr, port: u16, local_ip: IpAddr) -> RecorderResult<UdpSocket> {
    let socket = match (group, local_ip) {
        (IpAddr::V4(group), IpAddr::V4(local_ip)) => {
            info!(
                "Creating IPv4 {} RX socket for group {}:{} at {}",
                if group.is_multicast() {
                    "multicast"
                } else {
                    "unicast"
                },
                group,
                port,
                local_ip,
            );

            let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(SockProto::UDP))?;
            socket.set_reuse_address(true)?;
            socket.set_nonblocking(true)?;

            if group.is_multicast() {
                socket.join_multicast_v4(&group, &local_ip)?;
                socket.bind(&SockAddr::from(SocketAddr::new(IpAddr::V4(group), port)))?;
            } else {
                socket.bind(&SockAddr::from(SocketAddr::new(IpAddr::V4(local_ip), port)))?;
            }
            socket
        }
        (IpAddr::V6(group), IpAddr::V6(local_ip)) => {
            info!(
                "Creating IPv6 {} RX socket for group {}:{} at {}",
                if group.is_multicast() {
                    "multicast"
                } else {
                    "unicast"
                },
                group,
                port,
                local_ip,
            );

            let socket = Socket::new(Domain::IPV6, Type::DGRAM, Some(SockProto::UDP))?;
            socket.set_reuse_address(true)?;
            socket.set_nonblocking(true)?;

            if group.is_multicast() {
                socket.join_multicast_v6(&group, 0)?;
                socket.bind(&SockAddr::from(SocketAddr::new(IpAddr::V6(group), port)))?;
            } else {
                socket.bind(&SockAddr::from(SocketAddr::new(IpAddr::V6(local_ip), port)))?;
            }
            socket
        }
        (group, local_ip) => {
            return Err(RecorderError::SocketFailure(format!(
                "address family mismatch between group {group} and interface {local_ip}"
            )));
        }
    };

    Ok(UdpSocket::from_std(socket.into())?)
}
