//! Rendezvous service for peers behind NAT.
//!
//! Peers keep a control connection to the mediator and register under a
//! username with their private endpoint; the mediator records the public
//! endpoint it observes. A `ConnectRequest` hands each side the other's
//! endpoints so both can run
//! [`HolePuncher::establish_connection`](natpunch_core::punch::HolePuncher::establish_connection)
//! at the same time. A `Reversal` asks a peer to connect back to an acceptor
//! the requester listens on, for when only one side is reachable.

mod client;
mod registry;
mod reversal;
mod server;

pub use client::MediatorClient;
pub use registry::Registry;
pub use reversal::ReversalAcceptor;
pub use server::MediatorServer;

use natpunch_core::endpoint::Endpoint;
use natpunch_core::message::{Message, Method};
use natpunch_core::rendezvous::Token;

#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub struct PeerEndpoints {
    /// As observed by the mediator.
    pub public: Endpoint,
    /// As reported by the peer.
    pub private: Endpoint,
}

/// A request to connect to `acceptor` and present `token`.
#[derive(Clone, Debug)]
pub struct ReversalRequest {
    pub from: String,
    pub token: Token,
    pub acceptor: Endpoint,
}

#[derive(Clone, Debug)]
pub enum MediatorEvent {
    /// `from` is about to punch towards us.
    ConnectRequest { from: String, peer: PeerEndpoints },
    Reversal(ReversalRequest),
}

impl MediatorEvent {
    fn from_indication(message: &Message) -> Option<Self> {
        let from = message.username()?.to_string();
        match message.method() {
            Method::ConnectRequest => Some(MediatorEvent::ConnectRequest {
                from,
                peer: PeerEndpoints {
                    public: message.peer_address()?,
                    private: message.private_address()?,
                },
            }),
            Method::Reversal => Some(MediatorEvent::Reversal(ReversalRequest {
                from,
                token: message.token()?,
                acceptor: message.peer_address()?,
            })),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{MediatorClient, MediatorEvent, MediatorServer, Registry, ReversalAcceptor};
    use crate::config::MediatorConfig;
    use crate::error::Error;
    use natpunch_core::connection::Connection;
    use natpunch_core::endpoint::Endpoint;
    use natpunch_core::error::Error as CoreError;
    use natpunch_core::message::{error_code, Attribute, Message, Method};
    use natpunch_core::rendezvous::Token;
    use std::net::{Ipv4Addr, SocketAddr};
    use std::sync::Arc;
    use std::time::Duration;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    async fn start(config: MediatorConfig) -> (Arc<Registry>, SocketAddr) {
        let registry = Arc::new(Registry::new());
        let config = config.set_ip(Ipv4Addr::LOCALHOST.into());
        let server = MediatorServer::bind(config, registry.clone()).await.unwrap();
        let addr = server.local_addr().unwrap();
        tokio::spawn(async move { server.run().await });
        (registry, addr)
    }

    fn private(port: u16) -> Endpoint {
        Endpoint::new(Ipv4Addr::new(192, 168, 0, 2).into(), port)
    }

    async fn wait_until(f: impl Fn() -> bool) -> bool {
        for _ in 0..200 {
            if f() {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        false
    }

    #[tokio::test]
    async fn register_reports_public_endpoint() {
        let (registry, addr) = start(MediatorConfig::new(0)).await;
        let alice = MediatorClient::connect(addr).await.unwrap();
        let public = alice.register("alice", private(4000)).await.unwrap();
        assert_eq!(public, alice.local_endpoint());
        assert_eq!(alice.binding().await.unwrap(), public);
        let entry = registry.lookup("alice").unwrap();
        assert_eq!(entry.public, public);
        assert_eq!(entry.private, private(4000));
        alice.keep_alive().await.unwrap();
        alice.deregister().await.unwrap();
        assert!(!registry.contains("alice"));
    }

    #[tokio::test]
    async fn connect_request_notifies_target() {
        let (_registry, addr) = start(MediatorConfig::new(0)).await;
        let alice = MediatorClient::connect(addr).await.unwrap();
        let bob = MediatorClient::connect(addr).await.unwrap();
        alice.register("alice", private(4000)).await.unwrap();
        bob.register("bob", private(5000)).await.unwrap();

        let peer = alice.connect_request("bob").await.unwrap();
        assert_eq!(peer.public, bob.local_endpoint());
        assert_eq!(peer.private, private(5000));

        let event = tokio::time::timeout(Duration::from_secs(1), bob.next_event())
            .await
            .unwrap();
        match event {
            Some(MediatorEvent::ConnectRequest { from, peer }) => {
                assert_eq!(from, "alice");
                assert_eq!(peer.public, alice.local_endpoint());
                assert_eq!(peer.private, private(4000));
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn unknown_user_is_404() {
        let (_registry, addr) = start(MediatorConfig::new(0)).await;
        let alice = MediatorClient::connect(addr).await.unwrap();
        alice.register("alice", private(4000)).await.unwrap();
        match alice.connect_request("carol").await {
            Err(Error::Core(CoreError::Rejected { code, .. })) => {
                assert_eq!(code, error_code::UNKNOWN_USER)
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn unregistered_session_is_bad_request() {
        let (_registry, addr) = start(MediatorConfig::new(0)).await;
        let alice = MediatorClient::connect(addr).await.unwrap();
        match alice.keep_alive().await {
            Err(Error::Core(CoreError::Rejected { code, .. })) => {
                assert_eq!(code, error_code::BAD_REQUEST)
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn reversal_connects_back() {
        let (_registry, addr) = start(MediatorConfig::new(0)).await;
        let alice = MediatorClient::connect(addr).await.unwrap();
        let bob = MediatorClient::connect(addr).await.unwrap();
        alice.register("alice", private(4000)).await.unwrap();
        bob.register("bob", private(5000)).await.unwrap();
        let acceptor = ReversalAcceptor::bind("127.0.0.1:0".parse().unwrap())
            .await
            .unwrap();

        let answer = tokio::spawn(async move {
            let Some(MediatorEvent::Reversal(request)) = bob.next_event().await else {
                panic!("expected reversal");
            };
            assert_eq!(request.from, "alice");
            let connection = bob.answer_reversal(&request).await.unwrap();
            let mut stream = connection.into_stream();
            stream.write_all(b"hi").await.unwrap();
            stream
        });

        let connection = alice.request_reversal("bob", &acceptor).await.unwrap();
        let mut stream = connection.into_stream();
        let mut buf = [0; 2];
        stream.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"hi");
        drop(answer.await.unwrap());
    }

    #[tokio::test]
    async fn acceptor_rejects_unknown_token() {
        let acceptor = ReversalAcceptor::bind("127.0.0.1:0".parse().unwrap())
            .await
            .unwrap();
        let mut connection = Connection::connect(acceptor.local_addr()).await.unwrap();
        let request = Message::request(Method::ConnectionBind)
            .with_attribute(Attribute::CorrelationToken(Token::random()));
        connection.write_message(&request).await.unwrap();
        let response = connection.read_message().await.unwrap();
        assert_eq!(
            response.error_code().map(|(code, _)| code),
            Some(error_code::UNKNOWN_CORRELATION)
        );
    }

    #[tokio::test]
    async fn silent_registration_expires() {
        let config = MediatorConfig::new(0).set_registration_ttl(Duration::from_millis(300));
        let (registry, addr) = start(config).await;
        let alice = MediatorClient::connect(addr).await.unwrap();
        let bob = MediatorClient::connect(addr).await.unwrap();
        alice.register("alice", private(4000)).await.unwrap();
        bob.register("bob", private(5000)).await.unwrap();
        for _ in 0..6 {
            tokio::time::sleep(Duration::from_millis(100)).await;
            alice.keep_alive().await.unwrap();
        }
        assert!(registry.contains("alice"));
        assert!(!registry.contains("bob"));
    }

    #[tokio::test]
    async fn closing_session_deregisters() {
        let (registry, addr) = start(MediatorConfig::new(0)).await;
        let alice = MediatorClient::connect(addr).await.unwrap();
        alice.register("alice", private(4000)).await.unwrap();
        drop(alice);
        assert!(wait_until(|| !registry.contains("alice")).await);
    }

    #[tokio::test]
    async fn undrained_events_do_not_block_responses() {
        let (_registry, addr) = start(MediatorConfig::new(0)).await;
        let alice = MediatorClient::connect(addr).await.unwrap();
        let bob = MediatorClient::connect(addr).await.unwrap();
        alice.register("alice", private(4000)).await.unwrap();
        bob.register("bob", private(5000)).await.unwrap();
        for _ in 0..70 {
            alice.connect_request("bob").await.unwrap();
        }
        tokio::time::timeout(Duration::from_secs(2), bob.keep_alive())
            .await
            .unwrap()
            .unwrap();
        match bob.next_event().await {
            Some(MediatorEvent::ConnectRequest { from, .. }) => assert_eq!(from, "alice"),
            other => panic!("unexpected {other:?}"),
        }
    }
}
