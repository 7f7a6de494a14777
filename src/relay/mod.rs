//! TCP relay for peers that cannot reach each other directly.
//!
//! ```text
//!  owner                      relay                          peer
//!    | -- Allocate ----------->  |                              |
//!    | <-- relayed addr -------  | <------ connect relayed ---- |
//!    | <-- ConnectionAttempt --  |                              |
//!    | == ConnectionBind(token) => (new data connection)        |
//!    | <========= bytes ========> <========== bytes ==========> |
//! ```
//!
//! A relayed peer waits for the owner's data connection in a
//! [`CorrelationRendezvous`](natpunch_core::rendezvous::CorrelationRendezvous)
//! keyed by the token carried in the `ConnectionAttempt` indication.

mod client;
mod server;

pub use client::{query_binding, RelayClient};
pub use server::RelayServer;

#[cfg(test)]
mod tests {
    use super::{query_binding, RelayClient, RelayServer};
    use crate::config::RelayConfig;
    use crate::error::Error;
    use natpunch_core::connection::Connection;
    use natpunch_core::endpoint::Endpoint;
    use natpunch_core::message::{error_code, Attribute, Message, Method};
    use natpunch_core::rendezvous::Token;
    use std::net::{Ipv4Addr, SocketAddr};
    use std::sync::Arc;
    use std::time::Duration;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpStream;

    async fn start(config: RelayConfig) -> (Arc<RelayServer>, SocketAddr) {
        let config = config.set_ip(Ipv4Addr::LOCALHOST.into()).set_port(0);
        let server = Arc::new(RelayServer::bind(config).await.unwrap());
        let addr = server.local_addr().unwrap();
        let s = server.clone();
        tokio::spawn(async move { s.run().await });
        (server, addr)
    }

    #[tokio::test]
    async fn relays_peer_bytes() {
        let (_server, addr) = start(RelayConfig::default()).await;
        let mut client = RelayClient::connect(addr).await.unwrap();
        let relayed = client.allocate().await.unwrap();
        assert_eq!(client.relayed_endpoint(), Some(relayed));

        let peer = tokio::spawn(async move {
            let mut stream = TcpStream::connect(relayed.socket_addr()).await.unwrap();
            let local = stream.local_addr().unwrap();
            stream.write_all(b"ping").await.unwrap();
            let mut buf = [0; 4];
            stream.read_exact(&mut buf).await.unwrap();
            assert_eq!(&buf, b"pong");
            local
        });

        let (connection, peer_endpoint) = client.accept().await.unwrap();
        let mut data = connection.into_stream();
        let mut buf = [0; 4];
        data.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ping");
        data.write_all(b"pong").await.unwrap();
        let peer_local = peer.await.unwrap();
        assert_eq!(peer_endpoint, Endpoint::from(peer_local));
    }

    #[tokio::test]
    async fn unknown_token_is_rejected() {
        let (_server, addr) = start(RelayConfig::default()).await;
        let mut connection = Connection::connect(addr).await.unwrap();
        let request = Message::request(Method::ConnectionBind)
            .with_attribute(Attribute::CorrelationToken(Token::random()));
        connection.write_message(&request).await.unwrap();
        let response = connection.read_message().await.unwrap();
        assert_eq!(response.transaction_id(), request.transaction_id());
        assert_eq!(
            response.error_code().map(|(code, _)| code),
            Some(error_code::UNKNOWN_CORRELATION)
        );
    }

    #[tokio::test]
    async fn second_allocation_is_refused() {
        let (_server, addr) = start(RelayConfig::default()).await;
        let mut client = RelayClient::connect(addr).await.unwrap();
        client.allocate().await.unwrap();
        assert!(matches!(
            client.allocate().await,
            Err(Error::AlreadyAllocated)
        ));

        let mut control = Connection::connect(addr).await.unwrap();
        control
            .write_message(&Message::request(Method::Allocate))
            .await
            .unwrap();
        let first = control.read_message().await.unwrap();
        assert!(first.is_success());
        control
            .write_message(&Message::request(Method::Allocate))
            .await
            .unwrap();
        let second = control.read_message().await.unwrap();
        assert_eq!(
            second.error_code().map(|(code, _)| code),
            Some(error_code::ALLOCATION_MISMATCH)
        );
    }

    #[tokio::test]
    async fn refresh_keeps_allocation() {
        let config = RelayConfig::default().set_allocation_lifetime(Duration::from_millis(300));
        let (_server, addr) = start(config).await;
        let mut client = RelayClient::connect(addr).await.unwrap();
        let relayed = client.allocate().await.unwrap();
        for _ in 0..4 {
            tokio::time::sleep(Duration::from_millis(150)).await;
            client.refresh().await.unwrap();
        }
        assert!(TcpStream::connect(relayed.socket_addr()).await.is_ok());
    }

    #[tokio::test]
    async fn closing_control_releases_allocation() {
        let (_server, addr) = start(RelayConfig::default()).await;
        let mut client = RelayClient::connect(addr).await.unwrap();
        let relayed = client.allocate().await.unwrap();
        drop(client);
        let mut released = false;
        for _ in 0..100 {
            if TcpStream::connect(relayed.socket_addr()).await.is_err() {
                released = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(released);
    }

    #[tokio::test]
    async fn unanswered_peer_is_dropped() {
        let config = RelayConfig::default().set_wait_timeout(Duration::from_millis(200));
        let (_server, addr) = start(config).await;
        let mut client = RelayClient::connect(addr).await.unwrap();
        let relayed = client.allocate().await.unwrap();

        let mut peer = TcpStream::connect(relayed.socket_addr()).await.unwrap();
        let mut buf = [0; 1];
        let rs = tokio::time::timeout(Duration::from_secs(2), peer.read(&mut buf)).await;
        assert_eq!(rs.unwrap().unwrap(), 0);
    }

    #[tokio::test]
    async fn binding_reports_source() {
        let (_server, addr) = start(RelayConfig::default()).await;
        let mapped = query_binding(addr).await.unwrap();
        assert_eq!(mapped.ip(), Ipv4Addr::LOCALHOST);
        assert_ne!(mapped.port(), 0);
    }

    #[tokio::test]
    async fn shutdown_stops_run() {
        let config = RelayConfig::default()
            .set_ip(Ipv4Addr::LOCALHOST.into())
            .set_port(0);
        let server = Arc::new(RelayServer::bind(config).await.unwrap());
        let s = server.clone();
        let run = tokio::spawn(async move { s.run().await });
        tokio::time::sleep(Duration::from_millis(20)).await;
        server.shutdown();
        let rs = tokio::time::timeout(Duration::from_secs(1), run).await;
        assert!(rs.unwrap().unwrap().is_ok());
        assert!(matches!(server.run().await, Err(Error::Shutdown)));
    }
}
