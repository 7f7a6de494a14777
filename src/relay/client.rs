use std::collections::VecDeque;
use std::net::SocketAddr;
use std::time::Duration;

use natpunch_core::connection::Connection;
use natpunch_core::endpoint::Endpoint;
use natpunch_core::message::{Attribute, Message, MessageClass, Method};

use crate::config::WAIT_TIMEOUT;
use crate::error::{Error, Result};

/// Client side of a relay allocation.
///
/// The control connection carries requests and `ConnectionAttempt`
/// indications; every accepted peer gets its own data connection.
pub struct RelayClient {
    server: SocketAddr,
    control: Connection,
    response_timeout: Duration,
    relayed: Option<Endpoint>,
    backlog: VecDeque<Message>,
}

impl RelayClient {
    pub async fn connect(server: SocketAddr) -> Result<Self> {
        let control = Connection::connect(server).await?;
        Ok(Self {
            server,
            control,
            response_timeout: WAIT_TIMEOUT,
            relayed: None,
            backlog: VecDeque::new(),
        })
    }
    pub fn set_response_timeout(mut self, timeout: Duration) -> Self {
        self.response_timeout = timeout;
        self
    }
    /// Relayed endpoint of the current allocation.
    pub fn relayed_endpoint(&self) -> Option<Endpoint> {
        self.relayed
    }
    pub fn local_endpoint(&self) -> Endpoint {
        self.control.local_endpoint()
    }
    /// Ask the relay for a public listener. Peers that connect to the
    /// returned endpoint show up through [`accept`](Self::accept).
    pub async fn allocate(&mut self) -> Result<Endpoint> {
        if self.relayed.is_some() {
            return Err(Error::AlreadyAllocated);
        }
        let response = self.transact(Message::request(Method::Allocate)).await?;
        let relayed = response.relayed_address().ok_or_else(|| {
            natpunch_core::error::Error::InvalidMessage("allocate without relayed address".into())
        })?;
        log::info!(
            "relay {} allocated {relayed}, mapped {:?}",
            self.server,
            response.xor_mapped_address()
        );
        self.relayed.replace(relayed);
        Ok(relayed)
    }
    pub async fn refresh(&mut self) -> Result<()> {
        self.transact(Message::request(Method::Refresh)).await?;
        Ok(())
    }
    /// Wait for the next peer of the allocation and open its data connection.
    pub async fn accept(&mut self) -> Result<(Connection, Endpoint)> {
        loop {
            let message = match self.backlog.pop_front() {
                Some(message) => message,
                None => self.control.read_message().await?,
            };
            if !message.is(Method::ConnectionAttempt, MessageClass::Indication) {
                log::warn!(
                    "ignore {:?} {:?} on relay control connection",
                    message.method(),
                    message.class()
                );
                continue;
            }
            let (Some(token), Some(peer)) = (message.token(), message.peer_address()) else {
                log::warn!("connection attempt without token or peer address");
                continue;
            };
            match self.bind_data(token).await {
                Ok(connection) => return Ok((connection, peer)),
                Err(e) => {
                    // the relay already gave up on this peer
                    log::debug!("data connection for {peer} {e}");
                }
            }
        }
    }

    async fn bind_data(&self, token: natpunch_core::rendezvous::Token) -> Result<Connection> {
        let mut connection = Connection::connect(self.server).await?;
        let request =
            Message::request(Method::ConnectionBind).with_attribute(Attribute::CorrelationToken(token));
        connection.write_message(&request).await?;
        connection.set_read_timeout(Some(self.response_timeout));
        let response = connection.read_message().await?;
        connection.set_read_timeout(None);
        if response.transaction_id() != request.transaction_id() {
            return Err(natpunch_core::error::Error::UnexpectedMessage {
                method: response.method(),
                class: response.class(),
            }
            .into());
        }
        response.into_success(Method::ConnectionBind)?;
        Ok(connection)
    }

    async fn transact(&mut self, request: Message) -> Result<Message> {
        self.control.write_message(&request).await?;
        let previous = self.control.set_read_timeout(Some(self.response_timeout));
        let rs = loop {
            match self.control.read_message().await {
                Ok(message) if message.is_indication() => self.backlog.push_back(message),
                Ok(message) if message.transaction_id() == request.transaction_id() => {
                    break message.into_success(request.method());
                }
                Ok(message) => log::warn!(
                    "stray {:?} {:?} on relay control connection",
                    message.method(),
                    message.class()
                ),
                Err(e) => break Err(e),
            }
        };
        self.control.set_read_timeout(previous);
        Ok(rs?)
    }
}

/// Reflexive address of this host as seen by `server`.
pub async fn query_binding(server: SocketAddr) -> Result<Endpoint> {
    let mut connection = Connection::connect(server).await?;
    connection.set_read_timeout(Some(WAIT_TIMEOUT));
    connection
        .write_message(&Message::request(Method::Binding))
        .await?;
    let response = connection
        .read_message()
        .await?
        .into_success(Method::Binding)?;
    Ok(response.xor_mapped_address().ok_or_else(|| {
        natpunch_core::error::Error::InvalidMessage("binding without mapped address".into())
    })?)
}
