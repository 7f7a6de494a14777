use socket2::Protocol;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};

use crate::error::Result;

/// Accept socket with address and port reuse, so that outbound sockets can
/// share its local port. An IPv6 wildcard address accepts both families.
pub(crate) fn create_tcp_listener(addr: SocketAddr) -> Result<std::net::TcpListener> {
    let socket = if addr.is_ipv6() {
        let socket = socket2::Socket::new(
            socket2::Domain::IPV6,
            socket2::Type::STREAM,
            Some(Protocol::TCP),
        )?;
        if let Err(e) = socket.set_only_v6(false) {
            log::warn!("set_only_v6 {addr} {e:?}")
        }
        socket
    } else {
        socket2::Socket::new(
            socket2::Domain::IPV4,
            socket2::Type::STREAM,
            Some(Protocol::TCP),
        )?
    };
    socket.set_reuse_address(true)?;
    #[cfg(unix)]
    if let Err(e) = socket.set_reuse_port(true) {
        log::warn!("set_reuse_port {:?}", e)
    }
    socket.bind(&addr.into())?;
    socket.listen(128)?;
    socket.set_nonblocking(true)?;
    socket.set_nodelay(true)?;
    Ok(socket.into())
}

/// Outbound socket bound to `bind` with the same reuse flags as the accept socket.
pub(crate) fn create_tcp(bind: SocketAddr) -> Result<tokio::net::TcpSocket> {
    let socket = if bind.is_ipv4() {
        socket2::Socket::new(
            socket2::Domain::IPV4,
            socket2::Type::STREAM,
            Some(Protocol::TCP),
        )?
    } else {
        let socket = socket2::Socket::new(
            socket2::Domain::IPV6,
            socket2::Type::STREAM,
            Some(Protocol::TCP),
        )?;
        socket.set_only_v6(true)?;
        socket
    };
    socket.set_reuse_address(true)?;
    #[cfg(unix)]
    socket.set_reuse_port(true)?;
    socket.bind(&bind.into())?;
    socket.set_nonblocking(true)?;
    socket.set_nodelay(true)?;
    Ok(tokio::net::TcpSocket::from_std_stream(socket.into()))
}

/// Connect to `addr` from `bind`, sharing the port with a listener bound there.
pub async fn connect_tcp(bind: SocketAddr, addr: SocketAddr) -> Result<tokio::net::TcpStream> {
    let socket = create_tcp(outbound_bind_addr(bind, addr))?;
    Ok(socket.connect(addr).await?)
}

/// Local address an outbound attempt to `target` binds to: the listener's
/// port, on the listener's address when it is specific and of the target's
/// family, otherwise on the wildcard address of the target's family.
pub(crate) fn outbound_bind_addr(listen: SocketAddr, target: SocketAddr) -> SocketAddr {
    let ip = if listen.ip().is_unspecified() || listen.is_ipv4() != target.is_ipv4() {
        if target.is_ipv4() {
            IpAddr::V4(Ipv4Addr::UNSPECIFIED)
        } else {
            IpAddr::V6(Ipv6Addr::UNSPECIFIED)
        }
    } else {
        listen.ip()
    };
    SocketAddr::new(ip, listen.port())
}

#[cfg(test)]
mod tests {
    use super::{create_tcp, create_tcp_listener, outbound_bind_addr};
    use std::net::SocketAddr;

    #[test]
    fn bind_addr_follows_target_family() {
        let any6: SocketAddr = "[::]:7000".parse().unwrap();
        let lo4: SocketAddr = "127.0.0.1:7000".parse().unwrap();
        let v4: SocketAddr = "10.0.0.5:9000".parse().unwrap();
        let v6: SocketAddr = "[fd00::5]:9000".parse().unwrap();
        assert_eq!(outbound_bind_addr(any6, v4), "0.0.0.0:7000".parse().unwrap());
        assert_eq!(outbound_bind_addr(any6, v6), "[::]:7000".parse().unwrap());
        assert_eq!(outbound_bind_addr(lo4, v4), lo4);
        assert_eq!(outbound_bind_addr(lo4, v6), "[::]:7000".parse().unwrap());
    }

    #[tokio::test]
    async fn outbound_shares_listener_port() {
        let listener = create_tcp_listener("127.0.0.1:0".parse().unwrap()).unwrap();
        let local = listener.local_addr().unwrap();
        let listener = tokio::net::TcpListener::from_std(listener).unwrap();
        let server = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let socket = create_tcp(local).unwrap();
        let stream = socket.connect(server.local_addr().unwrap()).await.unwrap();
        assert_eq!(stream.local_addr().unwrap(), local);
        drop(listener);
    }
}
