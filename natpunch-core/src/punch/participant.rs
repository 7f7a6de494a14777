use std::sync::Arc;

use crate::auth::Authenticator;
use crate::cancel::CancelableWork;
use crate::connection::Connection;
use crate::endpoint::Endpoint;
use crate::error::{Error, Result};
use crate::listener::{ConnectionListener, Inbound};
use crate::mailbox::Mailbox;
use crate::punch::{PunchConfig, RaceContext, Role};
use crate::socket::{create_tcp, outbound_bind_addr};

/// One racing task: a connector or a listener aimed at one target endpoint.
pub(crate) struct Participant {
    pub(crate) role: Role,
    pub(crate) target: Endpoint,
    pub(crate) work: Arc<CancelableWork>,
    pub(crate) race: Arc<RaceContext>,
    pub(crate) listener: Arc<ConnectionListener>,
    pub(crate) authenticator: Arc<dyn Authenticator>,
    pub(crate) config: PunchConfig,
}

impl Participant {
    pub(crate) async fn run(self) {
        if !self.work.start() {
            return;
        }
        match self.role {
            Role::Connector => self.connect_loop().await,
            Role::Listener => self.listen_loop().await,
        }
        log::debug!(
            "{} for {} done in phase {:?}",
            self.role,
            self.target,
            self.work.phase()
        );
    }

    async fn listen_loop(&self) {
        let mailbox = Arc::new(Mailbox::new());
        while !self.work.is_cancelled() {
            self.listener
                .register_for_originator(self.target, mailbox.clone());
            let rs = self.work.guard(mailbox.take()).await;
            self.listener.deregister_for_originator(&self.target);
            let mut connection = match rs {
                Ok(Inbound::Connection(connection)) => connection,
                Ok(Inbound::Poison) => {
                    log::debug!("listener shut down while waiting for {}", self.target);
                    return;
                }
                Err(_) => return,
            };
            // a second connection that slipped in before deregistering
            if let Some(Inbound::Connection(extra)) = mailbox.try_take() {
                log::debug!("closing extra inbound {}", extra.peer_endpoint());
            }
            if self.work.watch_stream(connection.stream()).is_err() {
                return;
            }
            if self.authenticate(&mut connection).await && self.deliver(connection) {
                return;
            }
            // the duplicate would keep a rejected connection open
            self.work.release();
        }
    }

    async fn connect_loop(&self) {
        loop {
            if self.work.is_cancelled() {
                return;
            }
            if self.race.is_expired() {
                if self.race.expire() {
                    log::debug!("no connection to {} before the deadline", self.target);
                }
                return;
            }
            match self.attempt().await {
                Ok(Some(mut connection)) => {
                    if self.authenticate(&mut connection).await && self.deliver(connection) {
                        return;
                    }
                }
                Ok(None) => {
                    log::debug!("listener shut down, connector for {} exits", self.target);
                    return;
                }
                Err(e) => {
                    if self.work.is_cancelled() {
                        return;
                    }
                    log::debug!("connect {} {e}", self.target);
                }
            }
            self.work.release();
            let backoff = self.config.retry_backoff.min(self.race.remaining());
            if self.work.sleep(backoff).await.is_err() {
                return;
            }
        }
    }

    /// One outbound attempt from the listener's port. `Ok(None)` means the
    /// listener was shut down from outside.
    async fn attempt(&self) -> Result<Option<Connection>> {
        let target = self.target.socket_addr();
        self.listener.stop().await;
        let socket = create_tcp(outbound_bind_addr(self.listener.local_addr(), target));
        // the rebind retries while the port is held; the race deadline caps it
        match tokio::time::timeout(self.race.remaining(), self.listener.start()).await {
            Ok(Ok(())) => {}
            Ok(Err(Error::IllegalState(_))) => return Ok(None),
            Ok(Err(e)) => return Err(e),
            Err(_) => return Err(Error::Timeout),
        }
        let socket = socket?;
        self.work.watch_socket(&socket)?;
        let timeout = self.config.connect_timeout.min(self.race.remaining());
        let stream = self
            .work
            .guard(tokio::time::timeout(timeout, socket.connect(target)))
            .await?
            .map_err(|_| Error::Timeout)??;
        let connection = Connection::new(stream)?;
        self.work.watch_stream(connection.stream())?;
        Ok(Some(connection))
    }

    async fn authenticate(&self, connection: &mut Connection) -> bool {
        let rs = self
            .work
            .guard(
                self.authenticator
                    .authenticate(connection, &self.race, &self.work),
            )
            .await;
        match rs {
            Ok(Ok(true)) => true,
            Ok(Ok(false)) => {
                log::debug!("{} rejected {}", self.role, connection.peer_endpoint());
                false
            }
            Ok(Err(e)) => {
                log::debug!(
                    "{} failed to authenticate {} {e}",
                    self.role,
                    connection.peer_endpoint()
                );
                false
            }
            Err(_) => false,
        }
    }

    fn deliver(&self, connection: Connection) -> bool {
        match self
            .race
            .deliver(&self.work, self.role, self.target, connection)
        {
            Ok(()) => {
                log::info!("{} established connection with {}", self.role, self.target);
                true
            }
            Err(connection) => {
                log::debug!("race already decided, closing {}", connection.peer_endpoint());
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::Participant;
    use crate::auth::TrustAuthenticator;
    use crate::cancel::CancelableWork;
    use crate::error::Error;
    use crate::listener::ConnectionListener;
    use crate::punch::{PunchConfig, RaceContext, Role};
    use std::sync::Arc;
    use std::time::Duration;
    use tokio::time::Instant;

    #[tokio::test]
    async fn held_port_does_not_outlast_the_race() {
        let listener = Arc::new(ConnectionListener::new("127.0.0.1:0".parse().unwrap()));
        listener.start().await.unwrap();
        listener.stop().await;
        // listening without SO_REUSEPORT keeps the listener from rebinding
        let squatter = std::net::TcpListener::bind(listener.local_addr()).unwrap();
        let work = Arc::new(CancelableWork::new());
        let race = Arc::new(RaceContext::new(
            vec![work.clone()],
            Instant::now() + Duration::from_millis(200),
        ));
        let participant = Participant {
            role: Role::Connector,
            target: "127.0.0.1:9".parse().unwrap(),
            work,
            race,
            listener: listener.clone(),
            authenticator: Arc::new(TrustAuthenticator),
            config: PunchConfig::default(),
        };
        let rs = tokio::time::timeout(Duration::from_secs(2), participant.attempt())
            .await
            .expect("attempt must end with the race");
        assert!(matches!(rs, Err(Error::Timeout)));
        assert!(!listener.is_running().await);
        drop(squatter);
        listener.shutdown().await;
    }
}
