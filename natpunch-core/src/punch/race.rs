use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

use crate::cancel::{CancelableWork, Phase};
use crate::connection::Connection;
use crate::endpoint::Endpoint;
use crate::mailbox::Mailbox;
use crate::punch::{PunchOutcome, Role};

#[derive(Default)]
struct RaceState {
    claimant: Option<Arc<CancelableWork>>,
    decided: bool,
}

/// State shared by the participants of one `establish_connection` call.
///
/// All transitions that decide the race (claim, winner delivery, expiry) go
/// through one lock, and each of them cancels every participant that did not
/// win. The result mailbox therefore only ever receives one outcome.
pub struct RaceContext {
    state: Mutex<RaceState>,
    participants: Vec<Arc<CancelableWork>>,
    result: Mailbox<PunchOutcome>,
    deadline: Instant,
}

impl RaceContext {
    pub fn new(participants: Vec<Arc<CancelableWork>>, deadline: Instant) -> Self {
        Self {
            state: Mutex::new(RaceState::default()),
            participants,
            result: Mailbox::new(),
            deadline,
        }
    }
    pub fn participants(&self) -> &[Arc<CancelableWork>] {
        &self.participants
    }
    #[inline]
    pub fn deadline(&self) -> Instant {
        self.deadline
    }
    pub fn remaining(&self) -> Duration {
        self.deadline.saturating_duration_since(Instant::now())
    }
    pub fn is_expired(&self) -> bool {
        Instant::now() >= self.deadline
    }
    pub fn is_decided(&self) -> bool {
        self.state.lock().decided
    }

    /// Called by an authenticator that accepted a connection. The first
    /// caller wins and every other participant is cancelled; later callers,
    /// and callers that were already cancelled, get false.
    pub fn claim(&self, me: &Arc<CancelableWork>) -> bool {
        let mut state = self.state.lock();
        if state.decided || me.is_cancelled() {
            return false;
        }
        if let Some(claimant) = &state.claimant {
            return Arc::ptr_eq(claimant, me);
        }
        state.claimant = Some(me.clone());
        self.cancel_others(me);
        true
    }

    /// Hand the winning connection to the coordinator. The connection is
    /// given back when the race was already decided or lost.
    pub(crate) fn deliver(
        &self,
        me: &Arc<CancelableWork>,
        role: Role,
        target: Endpoint,
        connection: Connection,
    ) -> Result<(), Connection> {
        let mut state = self.state.lock();
        let lost = match &state.claimant {
            Some(claimant) => !Arc::ptr_eq(claimant, me),
            None => false,
        };
        if state.decided || lost || me.is_cancelled() {
            return Err(connection);
        }
        // from here on a cancel must not shut the winning socket down
        me.release();
        me.finish(Phase::Succeeded);
        let outcome = PunchOutcome::Established {
            connection,
            role,
            target,
        };
        if let Err(outcome) = self.result.offer(outcome) {
            return match outcome {
                PunchOutcome::Established { connection, .. } => Err(connection),
                PunchOutcome::TimedOut => Ok(()),
            };
        }
        state.decided = true;
        state.claimant = Some(me.clone());
        self.cancel_others(me);
        Ok(())
    }

    /// Decide the race as timed out unless somebody already won.
    pub fn expire(&self) -> bool {
        let mut state = self.state.lock();
        if state.decided {
            return false;
        }
        state.decided = true;
        for participant in &self.participants {
            participant.finish(Phase::TimedOut);
            participant.cancel();
        }
        _ = self.result.offer(PunchOutcome::TimedOut);
        true
    }

    pub fn cancel_all(&self) {
        for participant in &self.participants {
            participant.cancel();
        }
    }

    pub(crate) async fn outcome(&self, wait: Duration) -> Option<PunchOutcome> {
        self.result.poll(wait).await
    }
    pub(crate) fn try_outcome(&self) -> Option<PunchOutcome> {
        self.result.try_take()
    }

    fn cancel_others(&self, me: &Arc<CancelableWork>) {
        for participant in &self.participants {
            if !Arc::ptr_eq(participant, me) {
                participant.cancel();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::RaceContext;
    use crate::cancel::{CancelableWork, Phase};
    use crate::connection::Connection;
    use crate::punch::{PunchOutcome, Role};
    use std::sync::Arc;
    use std::time::Duration;
    use tokio::net::{TcpListener, TcpStream};
    use tokio::time::Instant;

    fn race(n: usize) -> (Arc<RaceContext>, Vec<Arc<CancelableWork>>) {
        let works: Vec<_> = (0..n).map(|_| Arc::new(CancelableWork::new())).collect();
        let race = Arc::new(RaceContext::new(
            works.clone(),
            Instant::now() + Duration::from_secs(30),
        ));
        (race, works)
    }

    async fn connection() -> (Connection, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (client, server) = tokio::join!(Connection::connect(addr), listener.accept());
        (client.unwrap(), server.unwrap().0)
    }

    #[test]
    fn first_claim_cancels_siblings() {
        let (race, works) = race(4);
        assert!(race.claim(&works[2]));
        assert!(race.claim(&works[2]));
        assert!(!race.claim(&works[0]));
        for (i, work) in works.iter().enumerate() {
            assert_eq!(work.is_cancelled(), i != 2);
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_deliveries_have_one_winner() {
        for _ in 0..10 {
            let (race, works) = race(8);
            let mut tasks = Vec::new();
            for work in works.clone() {
                let race = race.clone();
                let (connection, _server) = connection().await;
                let target = connection.peer_endpoint();
                tasks.push(tokio::spawn(async move {
                    race.claim(&work)
                        && race
                            .deliver(&work, Role::Connector, target, connection)
                            .is_ok()
                }));
            }
            let mut winners = 0;
            for task in tasks {
                if task.await.unwrap() {
                    winners += 1;
                }
            }
            assert_eq!(winners, 1);
            assert!(matches!(
                race.try_outcome(),
                Some(PunchOutcome::Established { .. })
            ));
            assert!(race.try_outcome().is_none());
            assert!(!race.expire());
            assert!(race.try_outcome().is_none());
            let survivors = works.iter().filter(|w| !w.is_cancelled()).count();
            assert_eq!(survivors, 1);
        }
    }

    #[tokio::test]
    async fn expiry_cancels_everyone() {
        let (race, works) = race(2);
        assert!(race.expire());
        assert!(!race.expire());
        for work in &works {
            assert!(work.is_cancelled());
            assert_eq!(work.phase(), Phase::TimedOut);
        }
        assert!(matches!(race.try_outcome(), Some(PunchOutcome::TimedOut)));
        let (late, _server) = connection().await;
        let target = late.peer_endpoint();
        assert!(race
            .deliver(&works[0], Role::Listener, target, late)
            .is_err());
        assert!(!race.claim(&works[1]));
    }

    #[tokio::test]
    async fn winner_handle_survives_cancel_all() {
        let (race, works) = race(2);
        let (winner, _server) = connection().await;
        works[0].watch_stream(winner.stream()).unwrap();
        let target = winner.peer_endpoint();
        race.deliver(&works[0], Role::Connector, target, winner)
            .unwrap();
        race.cancel_all();
        assert_eq!(works[0].phase(), Phase::Succeeded);
        match race.try_outcome() {
            Some(PunchOutcome::Established { connection, .. }) => {
                assert!(connection.stream().peer_addr().is_ok());
                let mut buf = [0; 1];
                // still open: nothing to read, would block
                assert!(connection.stream().try_read(&mut buf).is_err());
            }
            _ => panic!("no winner"),
        }
    }
}
