use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpStream;
use tokio::sync::mpsc;

use natpunch_core::connection::{Connection, MessageReader};
use natpunch_core::endpoint::Endpoint;
use natpunch_core::error::Error as CoreError;
use natpunch_core::message::{Attribute, Message, Method, TransactionId};
use natpunch_core::rendezvous::{CorrelationRendezvous, Token};

use crate::config::WAIT_TIMEOUT;
use crate::error::Result;
use crate::mediator::{MediatorEvent, PeerEndpoints, ReversalAcceptor, ReversalRequest};
use crate::{send, OwnedJoinHandle, SharedWriter};

const EVENT_QUEUE: usize = 64;

/// Control connection to a mediator.
///
/// Responses are matched to requests by transaction id; indications pushed by
/// the mediator are queued for [`next_event`](Self::next_event).
pub struct MediatorClient {
    local: Endpoint,
    writer: SharedWriter,
    pending: Arc<CorrelationRendezvous<TransactionId, Message>>,
    events: async_lock::Mutex<mpsc::Receiver<MediatorEvent>>,
    _reader: OwnedJoinHandle,
}

impl MediatorClient {
    pub async fn connect(server: SocketAddr) -> Result<Self> {
        Self::with_stream(TcpStream::connect(server).await?)
    }
    /// Connect from `bind`, a port a [`ConnectionListener`](natpunch_core::listener::ConnectionListener)
    /// may already listen on, so the mediator reports the mapping the hole
    /// punch will use.
    pub async fn connect_from(bind: SocketAddr, server: SocketAddr) -> Result<Self> {
        Self::with_stream(natpunch_core::socket::connect_tcp(bind, server).await?)
    }
    fn with_stream(stream: TcpStream) -> Result<Self> {
        let connection = Connection::new(stream)?;
        let local = connection.local_endpoint();
        let (reader, writer) = connection.into_split();
        let pending = Arc::new(CorrelationRendezvous::new().set_wait_timeout(WAIT_TIMEOUT));
        let (sender, receiver) = mpsc::channel(EVENT_QUEUE);
        let handle = tokio::spawn(read_loop(reader, pending.clone(), sender));
        Ok(Self {
            local,
            writer: Arc::new(async_lock::Mutex::new(writer)),
            pending,
            events: async_lock::Mutex::new(receiver),
            _reader: OwnedJoinHandle::new(handle),
        })
    }
    pub fn local_endpoint(&self) -> Endpoint {
        self.local
    }
    /// Register as `name`; returns the public endpoint the mediator sees.
    pub async fn register(&self, name: &str, private: Endpoint) -> Result<Endpoint> {
        let request = Message::request(Method::Register)
            .with_attribute(Attribute::Username(name.to_string()))
            .with_attribute(Attribute::PrivateAddress(private));
        let response = self.request(request).await?;
        Ok(mapped_address(&response)?)
    }
    pub async fn deregister(&self) -> Result<()> {
        self.request(Message::request(Method::Deregister)).await?;
        Ok(())
    }
    pub async fn keep_alive(&self) -> Result<()> {
        self.request(Message::request(Method::KeepAlive)).await?;
        Ok(())
    }
    pub async fn binding(&self) -> Result<Endpoint> {
        let response = self.request(Message::request(Method::Binding)).await?;
        Ok(mapped_address(&response)?)
    }
    /// Ask for `target`'s endpoints. The target is told about us at the same
    /// time, so both sides can start punching.
    pub async fn connect_request(&self, target: &str) -> Result<PeerEndpoints> {
        let request = Message::request(Method::ConnectRequest)
            .with_attribute(Attribute::Username(target.to_string()));
        let response = self.request(request).await?;
        match (response.peer_address(), response.private_address()) {
            (Some(public), Some(private)) => Ok(PeerEndpoints { public, private }),
            _ => Err(CoreError::InvalidMessage("connect request without endpoints".into()).into()),
        }
    }
    /// Have `target` connect to `acceptor` and return that connection.
    pub async fn request_reversal(
        &self,
        target: &str,
        acceptor: &ReversalAcceptor,
    ) -> Result<Connection> {
        let token = Token::random();
        let local = acceptor.local_addr();
        let advertised = if local.ip().is_unspecified() {
            Endpoint::new(self.local.ip(), local.port())
        } else {
            local.into()
        };
        let request = Message::request(Method::Reversal)
            .with_attribute(Attribute::Username(target.to_string()))
            .with_attribute(Attribute::CorrelationToken(token))
            .with_attribute(Attribute::XorPeerAddress(advertised));
        let notification = async move { self.request(request).await.map(|_| ()) };
        acceptor.wait_for(token, notification).await
    }
    /// Connect to the acceptor named in `reversal` and present its token.
    pub async fn answer_reversal(&self, reversal: &ReversalRequest) -> Result<Connection> {
        let mut connection = Connection::connect(reversal.acceptor.socket_addr()).await?;
        let request = Message::request(Method::ConnectionBind)
            .with_attribute(Attribute::CorrelationToken(reversal.token));
        connection.write_message(&request).await?;
        connection.set_read_timeout(Some(WAIT_TIMEOUT));
        connection
            .read_message()
            .await?
            .into_success(Method::ConnectionBind)?;
        connection.set_read_timeout(None);
        log::info!("answered reversal of {} at {}", reversal.from, reversal.acceptor);
        Ok(connection)
    }
    /// Next indication from the mediator; `None` once the control connection is gone.
    /// Indications arriving while the queue is full are dropped.
    pub async fn next_event(&self) -> Option<MediatorEvent> {
        self.events.lock().await.recv().await
    }

    async fn request(&self, request: Message) -> natpunch_core::error::Result<Message> {
        let method = request.method();
        let response = self
            .pending
            .begin_wait(request.transaction_id(), send(&self.writer, &request))
            .await?;
        response.into_success(method)
    }
}

fn mapped_address(response: &Message) -> natpunch_core::error::Result<Endpoint> {
    response
        .xor_mapped_address()
        .ok_or_else(|| CoreError::InvalidMessage("response without mapped address".into()))
}

async fn read_loop(
    mut reader: MessageReader,
    pending: Arc<CorrelationRendezvous<TransactionId, Message>>,
    events: mpsc::Sender<MediatorEvent>,
) {
    loop {
        let message = match reader.read_message().await {
            Ok(message) => message,
            Err(e) => {
                log::debug!("mediator {} closed {e}", reader.peer_endpoint());
                return;
            }
        };
        if message.is_indication() {
            let Some(event) = MediatorEvent::from_indication(&message) else {
                log::warn!("ignore indication {:?}", message.method());
                continue;
            };
            // responses share this loop, so a full queue drops the event
            // instead of waiting for the owner to drain it
            match events.try_send(event) {
                Ok(()) => {}
                Err(mpsc::error::TrySendError::Full(event)) => {
                    log::warn!("event queue full, dropping {event:?}");
                }
                Err(mpsc::error::TrySendError::Closed(_)) => return,
            }
            continue;
        }
        if message.is_request() {
            log::warn!("ignore request {:?} from mediator", message.method());
            continue;
        }
        if let Err(message) = pending.deliver(&message.transaction_id(), message) {
            log::warn!(
                "stray response {:?} {:?}",
                message.method(),
                message.transaction_id()
            );
        }
    }
}
