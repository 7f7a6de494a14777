use async_shutdown::ShutdownManager;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};

use natpunch_core::connection::Connection;
use natpunch_core::endpoint::Endpoint;
use natpunch_core::error::Error as CoreError;
use natpunch_core::message::{error_code, Attribute, Message, Method};

use crate::config::MediatorConfig;
use crate::error::{Error, Result};
use crate::mediator::Registry;
use crate::{send, SharedWriter};

#[derive(Clone)]
struct MediatorContext {
    config: MediatorConfig,
    registry: Arc<Registry>,
    shutdown_manager: ShutdownManager<()>,
    sessions: Arc<AtomicU64>,
}

/// Per control connection state.
struct Session {
    id: u64,
    public: Endpoint,
    writer: SharedWriter,
    user: Option<String>,
}

pub struct MediatorServer {
    listener: TcpListener,
    context: MediatorContext,
}

impl MediatorServer {
    pub async fn bind(config: MediatorConfig, registry: Arc<Registry>) -> Result<Self> {
        config.check()?;
        let listener = TcpListener::bind(config.listen_addr()).await?;
        Ok(Self {
            listener,
            context: MediatorContext {
                config,
                registry,
                shutdown_manager: ShutdownManager::new(),
                sessions: Arc::new(AtomicU64::new(0)),
            },
        })
    }
    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }
    pub fn registry(&self) -> &Arc<Registry> {
        &self.context.registry
    }
    pub fn shutdown(&self) {
        _ = self.context.shutdown_manager.trigger_shutdown(());
    }
    pub async fn run(&self) -> Result<()> {
        if self.context.shutdown_manager.is_shutdown_triggered() {
            return Err(Error::Shutdown);
        }
        log::info!("mediator listening on {}", self.local_addr()?);
        let sweeper = self.context.clone();
        let fut = self
            .context
            .shutdown_manager
            .wrap_cancel(async move { sweeper.expire_idle().await });
        tokio::spawn(fut);
        loop {
            let Ok(rs) = self
                .context
                .shutdown_manager
                .wrap_cancel(self.listener.accept())
                .await
            else {
                log::info!("mediator shut down");
                return Ok(());
            };
            let (stream, addr) = match rs {
                Ok(rs) => rs,
                Err(e) => {
                    log::warn!("mediator accept {e:?}");
                    continue;
                }
            };
            let context = self.context.clone();
            let fut = self.context.shutdown_manager.wrap_cancel(async move {
                if let Err(e) = context.serve(stream).await {
                    log::debug!("mediator session {addr} {e}");
                }
            });
            tokio::spawn(fut);
        }
    }
}

impl MediatorContext {
    async fn expire_idle(&self) {
        let ttl = self.config.registration_ttl;
        loop {
            let (name, last_seen) = self.registry.next_idle(ttl).await;
            if self.registry.expire(&name, last_seen) {
                log::info!("registration of {name} expired");
            }
        }
    }

    async fn serve(self, stream: TcpStream) -> Result<()> {
        let connection = Connection::new(stream)?;
        let public = connection.peer_endpoint();
        let (mut reader, writer) = connection.into_split();
        let mut session = Session {
            id: self.sessions.fetch_add(1, Ordering::Relaxed),
            public,
            writer: Arc::new(async_lock::Mutex::new(writer)),
            user: None,
        };
        let rs = self.session_loop(&mut session, &mut reader).await;
        if let Some(name) = session.user.take() {
            if self.registry.deregister(&name, session.id) {
                log::info!("{name} left");
            }
        }
        rs
    }

    async fn session_loop(
        &self,
        session: &mut Session,
        reader: &mut natpunch_core::connection::MessageReader,
    ) -> Result<()> {
        loop {
            let request = reader.read_message().await?;
            if let Some(name) = &session.user {
                self.registry.touch(name, session.id);
            }
            if !request.is_request() {
                log::warn!(
                    "unexpected {:?} {:?} from {}",
                    request.method(),
                    request.class(),
                    session.public
                );
                continue;
            }
            let response = match self.handle(session, &request).await {
                Ok(response) => response,
                Err(e) => {
                    log::debug!("{:?} from {} failed {e}", request.method(), session.public);
                    Message::failure_response(&request, e.failure_code(), &e.to_string())
                }
            };
            send(&session.writer, &response).await?;
        }
    }

    async fn handle(&self, session: &mut Session, request: &Message) -> Result<Message> {
        match request.method() {
            Method::Binding => Ok(Message::success_response(request)
                .with_attribute(Attribute::XorMappedAddress(session.public))),
            Method::Register => {
                let name = username(request)?;
                let private = request.private_address().unwrap_or(session.public);
                if let Some(old) = session.user.replace(name.to_string()) {
                    if old != name {
                        self.registry.deregister(&old, session.id);
                    }
                }
                self.registry.register(
                    name,
                    session.public,
                    private,
                    session.writer.clone(),
                    session.id,
                );
                log::info!("{name} registered, public {} private {private}", session.public);
                Ok(Message::success_response(request)
                    .with_attribute(Attribute::XorMappedAddress(session.public)))
            }
            Method::Deregister => {
                if let Some(name) = session.user.take() {
                    self.registry.deregister(&name, session.id);
                    log::info!("{name} deregistered");
                }
                Ok(Message::success_response(request))
            }
            Method::KeepAlive => match &session.user {
                Some(name) if self.registry.contains(name) => Ok(Message::success_response(request)),
                Some(name) => Err(Error::UnknownUser(name.clone())),
                None => Err(not_registered()),
            },
            Method::ConnectRequest => {
                let from = self.registered_name(session)?;
                let requester = self
                    .registry
                    .lookup(&from)
                    .ok_or_else(|| Error::UnknownUser(from.clone()))?;
                let target = username(request)?;
                let (peer, writer) = self
                    .registry
                    .lookup_with_writer(target)
                    .ok_or_else(|| Error::UnknownUser(target.to_string()))?;
                let notify = Message::indication(Method::ConnectRequest)
                    .with_attribute(Attribute::Username(from.clone()))
                    .with_attribute(Attribute::XorPeerAddress(requester.public))
                    .with_attribute(Attribute::PrivateAddress(requester.private));
                self.notify(&writer, &notify).await?;
                log::info!("{from} connects to {target}");
                Ok(Message::success_response(request)
                    .with_attribute(Attribute::XorPeerAddress(peer.public))
                    .with_attribute(Attribute::PrivateAddress(peer.private)))
            }
            Method::Reversal => {
                let from = self.registered_name(session)?;
                let target = username(request)?;
                let (Some(token), Some(acceptor)) = (request.token(), request.peer_address())
                else {
                    return Err(CoreError::InvalidMessage(
                        "reversal without token or acceptor".into(),
                    )
                    .into());
                };
                let (_, writer) = self
                    .registry
                    .lookup_with_writer(target)
                    .ok_or_else(|| Error::UnknownUser(target.to_string()))?;
                let notify = Message::indication(Method::Reversal)
                    .with_attribute(Attribute::Username(from.clone()))
                    .with_attribute(Attribute::CorrelationToken(token))
                    .with_attribute(Attribute::XorPeerAddress(acceptor));
                self.notify(&writer, &notify).await?;
                log::info!("{from} asks {target} to connect to {acceptor}");
                Ok(Message::success_response(request))
            }
            method => Ok(Message::failure_response(
                request,
                error_code::BAD_REQUEST,
                &format!("{method:?} is not served here"),
            )),
        }
    }

    /// Push an indication to another user's control connection; a peer that
    /// does not drain it must not stall the requester.
    async fn notify(&self, writer: &SharedWriter, message: &Message) -> Result<()> {
        tokio::time::timeout(self.config.wait_timeout, send(writer, message))
            .await
            .map_err(|_| CoreError::Timeout)??;
        Ok(())
    }

    fn registered_name(&self, session: &Session) -> Result<String> {
        session.user.clone().ok_or_else(not_registered)
    }
}

fn username(request: &Message) -> Result<&str> {
    request
        .username()
        .ok_or_else(|| CoreError::InvalidMessage("missing username".into()).into())
}

fn not_registered() -> Error {
    CoreError::InvalidMessage("register first".into()).into()
}
