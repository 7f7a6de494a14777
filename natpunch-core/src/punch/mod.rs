//! TCP hole punching by simultaneous open.
//!
//! [`HolePuncher::establish_connection`] races a connector and a listener
//! against each candidate endpoint of the peer. Connectors bind their
//! outbound sockets to the shared [`ConnectionListener`]'s port, stopping the
//! listener for the bind and restarting it right after, so outbound SYNs and
//! the peer's inbound SYNs use the same NAT mapping. The first participant
//! whose connection passes the [`Authenticator`] wins; everybody else is
//! cancelled.

use std::fmt;
use std::sync::Arc;
use tokio::task::JoinSet;
use tokio::time::Instant;

use crate::auth::{Authenticator, TimeLimitAuthenticator};
use crate::cancel::CancelableWork;
use crate::connection::Connection;
use crate::endpoint::Endpoint;
use crate::error::Result;
use crate::listener::ConnectionListener;

pub use config::*;
pub use race::RaceContext;

pub mod config;
mod participant;
mod race;

use participant::Participant;

#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub enum Role {
    /// Originates outbound connections to the target.
    Connector,
    /// Waits for the target to connect to the shared listener.
    Listener,
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Role::Connector => f.write_str("connector"),
            Role::Listener => f.write_str("listener"),
        }
    }
}

#[derive(Debug)]
pub enum PunchOutcome {
    Established {
        connection: Connection,
        role: Role,
        /// The candidate endpoint the winning connection was made with.
        target: Endpoint,
    },
    /// No participant succeeded within the total budget.
    TimedOut,
}

impl PunchOutcome {
    pub fn is_established(&self) -> bool {
        matches!(self, PunchOutcome::Established { .. })
    }
    pub fn into_connection(self) -> Option<Connection> {
        match self {
            PunchOutcome::Established { connection, .. } => Some(connection),
            PunchOutcome::TimedOut => None,
        }
    }
}

pub struct HolePuncher {
    listener: Arc<ConnectionListener>,
    config: PunchConfig,
}

impl HolePuncher {
    pub fn new(listener: Arc<ConnectionListener>, config: PunchConfig) -> Self {
        Self { listener, config }
    }
    pub fn listener(&self) -> &Arc<ConnectionListener> {
        &self.listener
    }
    pub fn config(&self) -> &PunchConfig {
        &self.config
    }

    /// Race for a direct connection to a peer known by its private and public
    /// endpoints. Running out of time is reported as [`PunchOutcome::TimedOut`];
    /// `Err` is reserved for setup failures such as a shut down listener.
    pub async fn establish_connection(
        &self,
        private: Endpoint,
        public: Endpoint,
        authenticator: Arc<dyn Authenticator>,
    ) -> Result<PunchOutcome> {
        self.config.check()?;
        self.listener.start().await?;
        let targets = if private == public {
            vec![private]
        } else {
            vec![private, public]
        };
        let authenticator: Arc<dyn Authenticator> = Arc::new(TimeLimitAuthenticator::new(
            authenticator,
            self.config.read_timeout,
        ));
        let mut plan = Vec::with_capacity(targets.len() * 2);
        for target in targets {
            for role in [Role::Connector, Role::Listener] {
                plan.push((role, target, Arc::new(CancelableWork::new())));
            }
        }
        let deadline = Instant::now() + self.config.total_timeout;
        let race = Arc::new(RaceContext::new(
            plan.iter().map(|(_, _, work)| work.clone()).collect(),
            deadline,
        ));
        let mut participants = JoinSet::new();
        for (role, target, work) in plan {
            let participant = Participant {
                role,
                target,
                work,
                race: race.clone(),
                listener: self.listener.clone(),
                authenticator: authenticator.clone(),
                config: self.config.clone(),
            };
            participants.spawn(participant.run());
        }

        let wait = self.config.total_timeout + self.config.connect_timeout;
        let outcome = tokio::select! {
            outcome = race.outcome(wait) => outcome,
            // every participant gave up, e.g. the listener was shut down
            _ = join_all(&mut participants) => race.try_outcome(),
        };
        let outcome = match outcome {
            Some(outcome) => outcome,
            None => {
                race.expire();
                race.try_outcome().unwrap_or(PunchOutcome::TimedOut)
            }
        };
        race.cancel_all();
        let teardown = tokio::time::timeout(self.config.retry_backoff, join_all(&mut participants));
        if teardown.await.is_err() {
            log::debug!("aborting {} lingering participants", participants.len());
            participants.shutdown().await;
        }
        self.restore_listener().await;
        match &outcome {
            PunchOutcome::Established { role, target, .. } => {
                log::debug!("punched through to {target} as {role}")
            }
            PunchOutcome::TimedOut => log::debug!("hole punching to {private}/{public} timed out"),
        }
        Ok(outcome)
    }

    /// An aborted connector may leave the shared listener stopped between its
    /// stop and start.
    async fn restore_listener(&self) {
        if self.listener.is_shutdown() {
            return;
        }
        match tokio::time::timeout(self.config.connect_timeout, self.listener.start()).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => log::debug!("listener not restarted after the race {e}"),
            Err(_) => log::warn!(
                "{} still held elsewhere, listener stays stopped",
                self.listener.local_addr()
            ),
        }
    }
}

async fn join_all(participants: &mut JoinSet<()>) {
    while let Some(rs) = participants.join_next().await {
        if let Err(e) = rs {
            log::warn!("participant ended abnormally {e:?}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{HolePuncher, PunchConfig, PunchOutcome};
    use crate::auth::{SharedSecretAuthenticator, TrustAuthenticator};
    use crate::endpoint::Endpoint;
    use crate::error::Error;
    use crate::listener::ConnectionListener;
    use std::net::SocketAddr;
    use std::sync::Arc;
    use std::time::Duration;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::{TcpSocket, TcpStream};
    use tokio::time::Instant;

    fn puncher(config: PunchConfig) -> HolePuncher {
        _ = env_logger::builder().is_test(true).try_init();
        let listener = Arc::new(ConnectionListener::new("127.0.0.1:0".parse().unwrap()));
        HolePuncher::new(listener, config)
    }

    fn quick() -> PunchConfig {
        PunchConfig::default()
            .set_connect_timeout(Duration::from_millis(300))
            .set_total_timeout(Duration::from_secs(5))
    }

    /// A free loopback port nobody listens on.
    fn idle_endpoint() -> Endpoint {
        let socket = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        socket.local_addr().unwrap().into()
    }

    /// Connect from a fixed local endpoint, retrying while the listener is
    /// briefly stopped by a connector.
    async fn connect_from(local: Endpoint, remote: SocketAddr) -> TcpStream {
        for _ in 0..50 {
            let socket = TcpSocket::new_v4().unwrap();
            socket.set_reuseaddr(true).unwrap();
            socket.bind(local.socket_addr()).unwrap();
            if let Ok(stream) = socket.connect(remote).await {
                return stream;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        panic!("cannot reach {remote}");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn inbound_peer_wins_while_connector_retries() {
        let puncher = Arc::new(puncher(quick()));
        puncher.listener().start().await.unwrap();
        let local = puncher.listener().local_addr();

        let peer_endpoint = idle_endpoint();

        let task = {
            let puncher = puncher.clone();
            tokio::spawn(async move {
                puncher
                    .establish_connection(peer_endpoint, peer_endpoint, Arc::new(TrustAuthenticator))
                    .await
            })
        };
        tokio::time::sleep(Duration::from_millis(200)).await;
        let mut peer_stream = connect_from(peer_endpoint, local).await;

        let outcome = task.await.unwrap().unwrap();
        let PunchOutcome::Established {
            mut connection,
            target,
            ..
        } = outcome
        else {
            panic!("timed out");
        };
        assert_eq!(target, peer_endpoint);
        assert_eq!(connection.peer_endpoint(), peer_endpoint);
        peer_stream.write_all(b"ping").await.unwrap();
        let mut buf = [0; 4];
        connection.stream_mut().read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ping");
        puncher.listener().shutdown().await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn two_punchers_meet() {
        let a = Arc::new(puncher(quick()));
        let b = Arc::new(puncher(quick()));
        a.listener().start().await.unwrap();
        b.listener().start().await.unwrap();
        let a_endpoint: Endpoint = a.listener().local_addr().into();
        let b_endpoint: Endpoint = b.listener().local_addr().into();
        let auth = Arc::new(SharedSecretAuthenticator::new("swordfish"));

        let (ra, rb) = tokio::join!(
            a.establish_connection(b_endpoint, b_endpoint, auth.clone()),
            b.establish_connection(a_endpoint, a_endpoint, auth.clone()),
        );
        let mut ca = ra.unwrap().into_connection().expect("a timed out");
        let mut cb = rb.unwrap().into_connection().expect("b timed out");
        assert_eq!(ca.peer_endpoint(), b_endpoint);
        assert_eq!(cb.peer_endpoint(), a_endpoint);
        ca.stream_mut().write_all(b"hi").await.unwrap();
        let mut buf = [0; 2];
        cb.stream_mut().read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"hi");
        a.listener().shutdown().await;
        b.listener().shutdown().await;
    }

    #[tokio::test]
    async fn gives_up_at_deadline() {
        let config = PunchConfig::default()
            .set_connect_timeout(Duration::from_millis(200))
            .set_total_timeout(Duration::from_millis(600));
        let puncher = puncher(config.clone());
        let private = idle_endpoint();
        let public = idle_endpoint();
        let start = Instant::now();
        let outcome = puncher
            .establish_connection(private, public, Arc::new(TrustAuthenticator))
            .await
            .unwrap();
        assert!(matches!(outcome, PunchOutcome::TimedOut));
        let bound = config.total_timeout + config.connect_timeout + Duration::from_millis(500);
        assert!(start.elapsed() < bound, "took {:?}", start.elapsed());
        // the listener stays usable for the next race
        assert!(puncher.listener().is_running().await);
        puncher.listener().shutdown().await;
    }

    #[tokio::test]
    async fn listener_is_restarted_once_the_port_frees() {
        let puncher = puncher(quick());
        puncher.listener().start().await.unwrap();
        puncher.listener().stop().await;
        let squatter = std::net::TcpListener::bind(puncher.listener().local_addr()).unwrap();
        let release = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            drop(squatter);
        });
        puncher.restore_listener().await;
        assert!(puncher.listener().is_running().await);
        release.await.unwrap();
        puncher.listener().shutdown().await;
    }

    #[tokio::test]
    async fn shut_down_listener_is_a_setup_error() {
        let puncher = puncher(quick());
        puncher.listener().shutdown().await;
        let target = idle_endpoint();
        let rs = puncher
            .establish_connection(target, target, Arc::new(TrustAuthenticator))
            .await;
        assert!(matches!(rs, Err(Error::IllegalState(_))));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn external_shutdown_ends_race() {
        let puncher = Arc::new(puncher(
            PunchConfig::default().set_total_timeout(Duration::from_secs(20)),
        ));
        let target = idle_endpoint();
        let task = {
            let puncher = puncher.clone();
            tokio::spawn(async move {
                puncher
                    .establish_connection(target, target, Arc::new(TrustAuthenticator))
                    .await
            })
        };
        tokio::time::sleep(Duration::from_millis(300)).await;
        puncher.listener().shutdown().await;
        let outcome = tokio::time::timeout(Duration::from_secs(5), task)
            .await
            .expect("race must end after shutdown")
            .unwrap()
            .unwrap();
        assert!(matches!(outcome, PunchOutcome::TimedOut));
    }
}
