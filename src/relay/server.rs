use async_shutdown::ShutdownManager;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinSet;
use tokio::time::Instant;

use natpunch_core::connection::Connection;
use natpunch_core::endpoint::Endpoint;
use natpunch_core::message::{error_code, Attribute, Message, MessageClass, Method};
use natpunch_core::rendezvous::{CorrelationRendezvous, Token};

use crate::config::RelayConfig;
use crate::error::{Error, Result};
use crate::{send, OwnedJoinHandle, SharedWriter};

/// A data connection presented by the allocation owner, with the
/// `ConnectionBind` request it arrived with.
pub(crate) struct DataBind {
    connection: Connection,
    request: Message,
}

#[derive(Clone)]
struct RelayContext {
    config: RelayConfig,
    rendezvous: Arc<CorrelationRendezvous<Token, DataBind>>,
    shutdown_manager: ShutdownManager<()>,
}

pub struct RelayServer {
    listener: TcpListener,
    context: RelayContext,
}

impl RelayServer {
    pub async fn bind(config: RelayConfig) -> Result<Self> {
        config.check()?;
        let listener = TcpListener::bind(config.listen_addr()).await?;
        let rendezvous =
            Arc::new(CorrelationRendezvous::new().set_wait_timeout(config.wait_timeout));
        Ok(Self {
            listener,
            context: RelayContext {
                config,
                rendezvous,
                shutdown_manager: ShutdownManager::new(),
            },
        })
    }
    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }
    pub fn shutdown(&self) {
        _ = self.context.shutdown_manager.trigger_shutdown(());
    }
    /// Serve until [`shutdown`](Self::shutdown); sessions end with it.
    pub async fn run(&self) -> Result<()> {
        if self.context.shutdown_manager.is_shutdown_triggered() {
            return Err(Error::Shutdown);
        }
        log::info!("relay listening on {}", self.local_addr()?);
        loop {
            let Ok(rs) = self
                .context
                .shutdown_manager
                .wrap_cancel(self.listener.accept())
                .await
            else {
                log::info!("relay shut down");
                return Ok(());
            };
            let (stream, addr) = match rs {
                Ok(rs) => rs,
                Err(e) => {
                    log::warn!("relay accept {e:?}");
                    continue;
                }
            };
            let context = self.context.clone();
            let fut = self.context.shutdown_manager.wrap_cancel(async move {
                if let Err(e) = context.serve(stream).await {
                    log::debug!("relay session {addr} {e}");
                }
            });
            tokio::spawn(fut);
        }
    }
}

impl RelayContext {
    async fn serve(self, stream: TcpStream) -> Result<()> {
        let mut connection = Connection::new(stream)?;
        connection.set_read_timeout(Some(self.config.wait_timeout));
        let request = connection.read_message().await?;
        connection.set_read_timeout(None);
        if !request.is_request() {
            log::warn!(
                "unexpected {:?} {:?} from {}",
                request.method(),
                request.class(),
                connection.peer_endpoint()
            );
            return Ok(());
        }
        match request.method() {
            Method::Allocate => self.allocation(connection, request).await,
            Method::ConnectionBind => self.bind_data(connection, request).await,
            Method::Binding => {
                let mapped = connection.peer_endpoint();
                let response = Message::success_response(&request)
                    .with_attribute(Attribute::XorMappedAddress(mapped));
                Ok(connection.write_message(&response).await?)
            }
            method => {
                let response = Message::failure_response(
                    &request,
                    error_code::BAD_REQUEST,
                    &format!("{method:?} is not served here"),
                );
                Ok(connection.write_message(&response).await?)
            }
        }
    }

    async fn bind_data(self, mut connection: Connection, request: Message) -> Result<()> {
        let Some(token) = request.token() else {
            let response =
                Message::failure_response(&request, error_code::BAD_REQUEST, "missing token");
            return Ok(connection.write_message(&response).await?);
        };
        let bind = DataBind {
            connection,
            request,
        };
        if let Err(DataBind {
            mut connection,
            request,
        }) = self.rendezvous.deliver(&token, bind)
        {
            log::warn!(
                "unknown correlation {token} from {}",
                connection.peer_endpoint()
            );
            let response = Message::failure_response(
                &request,
                error_code::UNKNOWN_CORRELATION,
                "unknown correlation",
            );
            connection.write_message(&response).await?;
        }
        Ok(())
    }

    async fn allocation(self, connection: Connection, request: Message) -> Result<()> {
        let owner = connection.peer_endpoint();
        let relayed_addr = SocketAddr::new(connection.local_endpoint().ip(), 0);
        let relayed = TcpListener::bind(relayed_addr).await?;
        let relayed_endpoint: Endpoint = relayed.local_addr()?.into();
        let (mut reader, writer) = connection.into_split();
        let writer: SharedWriter = Arc::new(async_lock::Mutex::new(writer));
        let response = Message::success_response(&request)
            .with_attribute(Attribute::XorRelayedAddress(relayed_endpoint))
            .with_attribute(Attribute::XorMappedAddress(owner));
        send(&writer, &response).await?;
        log::info!("allocated {relayed_endpoint} for {owner}");

        let _peers = OwnedJoinHandle::new(tokio::spawn(
            self.clone().accept_peers(relayed, writer.clone()),
        ));
        let lifetime = self.config.allocation_lifetime;
        let mut expiry = Instant::now() + lifetime;
        loop {
            let message = tokio::select! {
                rs = reader.read_message() => match rs {
                    Ok(message) => message,
                    Err(e) => {
                        log::debug!("control connection of {owner} closed {e}");
                        break;
                    }
                },
                _ = tokio::time::sleep_until(expiry) => {
                    log::info!("allocation {relayed_endpoint} expired");
                    break;
                }
            };
            if message.class() != MessageClass::Request {
                continue;
            }
            let response = match message.method() {
                Method::Refresh => {
                    expiry = Instant::now() + lifetime;
                    Message::success_response(&message)
                }
                Method::Allocate => {
                    log::warn!("{owner} allocated twice on one control connection");
                    Message::failure_response(
                        &message,
                        error_code::ALLOCATION_MISMATCH,
                        &Error::AlreadyAllocated.to_string(),
                    )
                }
                method => Message::failure_response(
                    &message,
                    error_code::BAD_REQUEST,
                    &format!("{method:?} is not served on a control connection"),
                ),
            };
            send(&writer, &response).await?;
        }
        log::info!("allocation {relayed_endpoint} released");
        Ok(())
    }

    async fn accept_peers(self, relayed: TcpListener, writer: SharedWriter) {
        // dropping the set when the allocation ends closes every relayed pipe
        let mut peers = JoinSet::new();
        loop {
            match relayed.accept().await {
                Ok((stream, addr)) => {
                    peers.spawn(self.clone().relay_peer(stream, addr.into(), writer.clone()));
                }
                Err(e) => {
                    log::debug!("relayed accept {e:?}");
                    tokio::time::sleep(Duration::from_millis(10)).await;
                }
            }
            while peers.try_join_next().is_some() {}
        }
    }

    async fn relay_peer(self, mut peer: TcpStream, peer_endpoint: Endpoint, writer: SharedWriter) {
        let token = Token::random();
        let attempt = Message::indication(Method::ConnectionAttempt)
            .with_attribute(Attribute::CorrelationToken(token))
            .with_attribute(Attribute::XorPeerAddress(peer_endpoint));
        let rs = self
            .rendezvous
            .begin_wait(token, send(&writer, &attempt))
            .await;
        let DataBind {
            mut connection,
            request,
        } = match rs {
            Ok(bind) => bind,
            Err(e) => {
                log::debug!("no data connection for peer {peer_endpoint} {e}");
                return;
            }
        };
        if let Err(e) = connection
            .write_message(&Message::success_response(&request))
            .await
        {
            log::debug!("data connection for {peer_endpoint} {e}");
            return;
        }
        let mut data = connection.into_stream();
        match tokio::io::copy_bidirectional(&mut peer, &mut data).await {
            Ok((up, down)) => {
                log::debug!("relay for {peer_endpoint} done, {up} bytes in, {down} bytes out")
            }
            Err(e) => log::debug!("relay for {peer_endpoint} {e:?}"),
        }
    }
}
