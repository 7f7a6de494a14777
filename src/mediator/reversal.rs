use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinSet;

use natpunch_core::connection::Connection;
use natpunch_core::endpoint::Endpoint;
use natpunch_core::message::{error_code, Message, MessageClass, Method};
use natpunch_core::rendezvous::{CorrelationRendezvous, Token};

use crate::config::WAIT_TIMEOUT;
use crate::error::Result;
use crate::OwnedJoinHandle;

type Bound = (Connection, Message);

/// Accepts the connections peers open in answer to a reversal request.
///
/// Every inbound connection must start with a `ConnectionBind` request whose
/// token was handed out by [`MediatorClient::request_reversal`](super::MediatorClient::request_reversal);
/// others are answered with 447 and closed.
pub struct ReversalAcceptor {
    local_addr: SocketAddr,
    rendezvous: Arc<CorrelationRendezvous<Token, Bound>>,
    _accept: OwnedJoinHandle,
}

impl ReversalAcceptor {
    pub async fn bind(addr: SocketAddr) -> Result<Self> {
        Self::bind_with_timeout(addr, WAIT_TIMEOUT).await
    }
    /// `wait_timeout` bounds both the wait for a peer and the peer's first message.
    pub async fn bind_with_timeout(addr: SocketAddr, wait_timeout: Duration) -> Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        let local_addr = listener.local_addr()?;
        let rendezvous = Arc::new(CorrelationRendezvous::new().set_wait_timeout(wait_timeout));
        let handle = tokio::spawn(accept_loop(listener, rendezvous.clone(), wait_timeout));
        log::info!("reversal acceptor on {local_addr}");
        Ok(Self {
            local_addr,
            rendezvous,
            _accept: OwnedJoinHandle::new(handle),
        })
    }
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }
    /// Register `token`, run `notification` and wait for the peer presenting it.
    pub(crate) async fn wait_for<F>(&self, token: Token, notification: F) -> Result<Connection>
    where
        F: std::future::Future<Output = natpunch_core::error::Result<()>>,
    {
        let (mut connection, request) = self.rendezvous.begin_wait(token, notification).await?;
        connection
            .write_message(&Message::success_response(&request))
            .await?;
        Ok(connection)
    }
}

async fn accept_loop(
    listener: TcpListener,
    rendezvous: Arc<CorrelationRendezvous<Token, Bound>>,
    wait_timeout: Duration,
) {
    let mut pending = JoinSet::new();
    loop {
        match listener.accept().await {
            Ok((stream, addr)) => {
                let rendezvous = rendezvous.clone();
                pending.spawn(async move {
                    if let Err(e) = bind_inbound(stream, &rendezvous, wait_timeout).await {
                        log::debug!("reversal connection from {addr} {e}");
                    }
                });
            }
            Err(e) => {
                log::debug!("reversal accept {e:?}");
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        }
        while pending.try_join_next().is_some() {}
    }
}

async fn bind_inbound(
    stream: TcpStream,
    rendezvous: &CorrelationRendezvous<Token, Bound>,
    wait_timeout: Duration,
) -> Result<()> {
    let mut connection = Connection::new(stream)?;
    let peer: Endpoint = connection.peer_endpoint();
    connection.set_read_timeout(Some(wait_timeout));
    let request = connection.read_message().await?;
    connection.set_read_timeout(None);
    if !request.is(Method::ConnectionBind, MessageClass::Request) {
        log::warn!(
            "unexpected {:?} {:?} from {peer}",
            request.method(),
            request.class()
        );
        let response = Message::failure_response(
            &request,
            error_code::BAD_REQUEST,
            "expected connection bind",
        );
        return Ok(connection.write_message(&response).await?);
    }
    let Some(token) = request.token() else {
        let response =
            Message::failure_response(&request, error_code::BAD_REQUEST, "missing token");
        return Ok(connection.write_message(&response).await?);
    };
    if let Err((mut connection, request)) = rendezvous.deliver(&token, (connection, request)) {
        log::warn!("unknown correlation {token} from {peer}");
        let response = Message::failure_response(
            &request,
            error_code::UNKNOWN_CORRELATION,
            "unknown correlation",
        );
        connection.write_message(&response).await?;
    }
    Ok(())
}
