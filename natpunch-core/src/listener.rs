//! Restartable accept loop that routes inbound connections to whoever is
//! waiting for the remote endpoint they come from.
//!
//! The hole punching connectors need the listener's local port for their own
//! outbound sockets, so the loop is stopped and restarted many times during a
//! race. The port is pinned after the first successful bind; later restarts
//! rebind exactly that address.

use async_shutdown::ShutdownManager;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

use crate::connection::Connection;
use crate::endpoint::Endpoint;
use crate::error::{Error, Result};
use crate::mailbox::Mailbox;
use crate::socket::create_tcp_listener;

pub const BIND_RETRY_INTERVAL: Duration = Duration::from_millis(10);

/// What a registered waiter receives.
#[derive(Debug)]
pub enum Inbound {
    Connection(Connection),
    /// The listener was shut down; stop waiting.
    Poison,
}

pub type InboundMailbox = Arc<Mailbox<Inbound>>;

#[derive(Default)]
struct Registry {
    waiters: Mutex<HashMap<Endpoint, InboundMailbox>>,
}

impl Registry {
    fn dispatch(&self, stream: TcpStream, addr: SocketAddr) {
        let connection = match Connection::new(stream) {
            Ok(connection) => connection,
            Err(e) => {
                log::debug!("accepted {addr} but the stream is unusable {e:?}");
                return;
            }
        };
        let origin = connection.peer_endpoint();
        let mailbox = self.waiters.lock().get(&origin).cloned();
        let Some(mailbox) = mailbox else {
            log::debug!("nobody waits for {origin}, closing");
            return;
        };
        if mailbox.offer(Inbound::Connection(connection)).is_err() {
            log::warn!("waiter for {origin} already holds a connection, closing the new one");
        }
    }
}

struct AcceptLoop {
    stop_sender: oneshot::Sender<()>,
    handle: JoinHandle<()>,
}

pub struct ConnectionListener {
    local_addr: Mutex<SocketAddr>,
    registry: Arc<Registry>,
    lifecycle: async_lock::Mutex<Option<AcceptLoop>>,
    shutdown_manager: ShutdownManager<()>,
    bind_retry_interval: Duration,
}

impl ConnectionListener {
    pub fn new(local_addr: SocketAddr) -> Self {
        Self {
            local_addr: Mutex::new(local_addr),
            registry: Arc::new(Registry::default()),
            lifecycle: async_lock::Mutex::new(None),
            shutdown_manager: ShutdownManager::new(),
            bind_retry_interval: BIND_RETRY_INTERVAL,
        }
    }
    pub fn set_bind_retry_interval(mut self, interval: Duration) -> Self {
        self.bind_retry_interval = interval;
        self
    }
    /// The configured address until the first bind, the bound address after it.
    pub fn local_addr(&self) -> SocketAddr {
        *self.local_addr.lock()
    }
    pub fn is_shutdown(&self) -> bool {
        self.shutdown_manager.is_shutdown_triggered()
    }
    pub async fn is_running(&self) -> bool {
        self.lifecycle.lock().await.is_some()
    }

    /// Start accepting, or do nothing when already running. A bind that fails
    /// because the port is momentarily held elsewhere is retried until it
    /// succeeds or the listener is shut down.
    pub async fn start(&self) -> Result<()> {
        if self.is_shutdown() {
            return Err(Error::IllegalState("listener is shut down"));
        }
        let mut lifecycle = self.lifecycle.lock().await;
        if lifecycle.is_some() {
            return Ok(());
        }
        let listener = loop {
            if self.is_shutdown() {
                return Err(Error::IllegalState("listener is shut down"));
            }
            let addr = self.local_addr();
            match create_tcp_listener(addr) {
                Ok(listener) => break listener,
                Err(Error::Io(e)) if e.kind() == io::ErrorKind::AddrInUse => {
                    log::debug!("{addr} in use, retrying bind");
                    tokio::time::sleep(self.bind_retry_interval).await;
                }
                Err(e) => return Err(e),
            }
        };
        *self.local_addr.lock() = listener.local_addr()?;
        let listener = TcpListener::from_std(listener)?;
        let (stop_sender, stop_receiver) = oneshot::channel();
        let handle = tokio::spawn(accept_loop(
            listener,
            self.registry.clone(),
            stop_receiver,
        ));
        *lifecycle = Some(AcceptLoop {
            stop_sender,
            handle,
        });
        Ok(())
    }

    /// Close the accept socket. Returns once the socket is closed; calling it
    /// while stopped is a no-op.
    pub async fn stop(&self) {
        let accept_loop = self.lifecycle.lock().await.take();
        if let Some(AcceptLoop {
            stop_sender,
            handle,
        }) = accept_loop
        {
            _ = stop_sender.send(());
            if let Err(e) = handle.await {
                log::warn!("accept loop ended abnormally {e:?}");
            }
        }
    }

    /// Stop for good. Waiters still registered receive [`Inbound::Poison`].
    pub async fn shutdown(&self) {
        _ = self.shutdown_manager.trigger_shutdown(());
        self.stop().await;
        let waiters: Vec<_> = self.registry.waiters.lock().drain().collect();
        for (_, mailbox) in waiters {
            _ = mailbox.offer(Inbound::Poison);
        }
    }

    /// A later registration for the same endpoint replaces the earlier one.
    pub fn register_for_originator(&self, origin: Endpoint, mailbox: InboundMailbox) {
        let mut waiters = self.registry.waiters.lock();
        // checked under the registry lock so shutdown either drains this
        // entry or is already visible here
        if self.is_shutdown() {
            drop(waiters);
            _ = mailbox.offer(Inbound::Poison);
            return;
        }
        waiters.insert(origin, mailbox);
    }
    pub fn deregister_for_originator(&self, origin: &Endpoint) {
        self.registry.waiters.lock().remove(origin);
    }
    pub fn is_registered(&self, origin: &Endpoint) -> bool {
        self.registry.waiters.lock().contains_key(origin)
    }
}

async fn accept_loop(
    listener: TcpListener,
    registry: Arc<Registry>,
    mut stop_receiver: oneshot::Receiver<()>,
) {
    loop {
        tokio::select! {
            _ = &mut stop_receiver => break,
            rs = listener.accept() => match rs {
                Ok((stream, addr)) => registry.dispatch(stream, addr),
                Err(e) => {
                    log::debug!("accept {e:?}");
                    tokio::time::sleep(BIND_RETRY_INTERVAL).await;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{ConnectionListener, Inbound};
    use crate::endpoint::Endpoint;
    use crate::error::Error;
    use crate::mailbox::Mailbox;
    use std::sync::Arc;
    use std::time::Duration;
    use tokio::io::AsyncReadExt;
    use tokio::net::{TcpSocket, TcpStream};

    async fn started() -> ConnectionListener {
        let listener = ConnectionListener::new("127.0.0.1:0".parse().unwrap());
        listener.start().await.unwrap();
        listener
    }

    async fn connect_from(listener: &ConnectionListener) -> TcpStream {
        let socket = TcpSocket::new_v4().unwrap();
        socket.bind("127.0.0.1:0".parse().unwrap()).unwrap();
        socket.connect(listener.local_addr()).await.unwrap()
    }

    #[tokio::test]
    async fn delivers_to_registered_originator() {
        let listener = started().await;
        let socket = TcpSocket::new_v4().unwrap();
        socket.bind("127.0.0.1:0".parse().unwrap()).unwrap();
        let origin: Endpoint = socket.local_addr().unwrap().into();
        let mailbox = Arc::new(Mailbox::new());
        listener.register_for_originator(origin, mailbox.clone());
        let stream = socket.connect(listener.local_addr()).await.unwrap();
        match mailbox.poll(Duration::from_secs(2)).await {
            Some(Inbound::Connection(connection)) => {
                assert_eq!(connection.peer_endpoint(), origin);
                assert_eq!(
                    connection.local_endpoint(),
                    Endpoint::from(stream.peer_addr().unwrap())
                );
            }
            other => panic!("{other:?}"),
        }
        listener.shutdown().await;
    }

    #[tokio::test]
    async fn unregistered_connection_is_closed() {
        let listener = started().await;
        let other = Arc::new(Mailbox::new());
        listener.register_for_originator("127.0.0.1:1".parse().unwrap(), other.clone());
        let mut stream = connect_from(&listener).await;
        let mut buf = [0; 1];
        let rs = tokio::time::timeout(Duration::from_secs(2), stream.read(&mut buf))
            .await
            .unwrap();
        assert!(matches!(rs, Ok(0) | Err(_)));
        assert!(!other.is_full());
        listener.shutdown().await;
    }

    #[tokio::test]
    async fn full_mailbox_closes_new_connection() {
        let listener = started().await;
        let socket = TcpSocket::new_v4().unwrap();
        socket.bind("127.0.0.1:0".parse().unwrap()).unwrap();
        let origin: Endpoint = socket.local_addr().unwrap().into();
        let mailbox = Arc::new(Mailbox::new());
        assert!(mailbox.offer(Inbound::Poison).is_ok());
        listener.register_for_originator(origin, mailbox.clone());
        let mut stream = socket.connect(listener.local_addr()).await.unwrap();
        let mut buf = [0; 1];
        let rs = tokio::time::timeout(Duration::from_secs(2), stream.read(&mut buf))
            .await
            .unwrap();
        assert!(matches!(rs, Ok(0) | Err(_)));
        assert!(matches!(mailbox.try_take(), Some(Inbound::Poison)));
        listener.shutdown().await;
    }

    #[tokio::test]
    async fn restart_keeps_port() {
        let listener = started().await;
        let addr = listener.local_addr();
        for _ in 0..50 {
            listener.stop().await;
            listener.stop().await;
            assert!(!listener.is_running().await);
            listener.start().await.unwrap();
            listener.start().await.unwrap();
            assert_eq!(listener.local_addr(), addr);
        }
        let socket = TcpSocket::new_v4().unwrap();
        socket.bind("127.0.0.1:0".parse().unwrap()).unwrap();
        let origin: Endpoint = socket.local_addr().unwrap().into();
        let mailbox = Arc::new(Mailbox::new());
        listener.register_for_originator(origin, mailbox.clone());
        let _stream = socket.connect(addr).await.unwrap();
        assert!(matches!(
            mailbox.poll(Duration::from_secs(2)).await,
            Some(Inbound::Connection(_))
        ));
        listener.shutdown().await;
    }

    #[tokio::test]
    async fn stopped_listener_refuses() {
        let listener = started().await;
        let addr = listener.local_addr();
        listener.stop().await;
        assert!(TcpStream::connect(addr).await.is_err());
        listener.shutdown().await;
    }

    #[tokio::test]
    async fn shutdown_poisons_waiters_and_blocks_start() {
        let listener = started().await;
        let mailbox = Arc::new(Mailbox::new());
        let origin: Endpoint = "127.0.0.1:2".parse().unwrap();
        listener.register_for_originator(origin, mailbox.clone());
        listener.shutdown().await;
        assert!(matches!(mailbox.try_take(), Some(Inbound::Poison)));
        assert!(!listener.is_registered(&origin));
        assert!(matches!(
            listener.start().await,
            Err(Error::IllegalState(_))
        ));
        let late = Arc::new(Mailbox::new());
        listener.register_for_originator(origin, late.clone());
        assert!(matches!(late.try_take(), Some(Inbound::Poison)));
    }

    #[tokio::test]
    async fn deregister_is_idempotent() {
        let listener = ConnectionListener::new("127.0.0.1:0".parse().unwrap());
        let origin: Endpoint = "127.0.0.1:3".parse().unwrap();
        listener.register_for_originator(origin, Arc::new(Mailbox::new()));
        listener.deregister_for_originator(&origin);
        listener.deregister_for_originator(&origin);
        assert!(!listener.is_registered(&origin));
        listener.stop().await;
    }
}
