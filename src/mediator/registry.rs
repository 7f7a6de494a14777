use dashmap::DashMap;
use std::time::Duration;
use tokio::time::Instant;

use natpunch_core::endpoint::Endpoint;

use crate::mediator::PeerEndpoints;
use crate::SharedWriter;

struct Registration {
    endpoints: PeerEndpoints,
    writer: SharedWriter,
    session: u64,
    last_seen: Instant,
}

/// Registered users of a mediator, keyed by username.
///
/// Entries belong to the control session that registered them, so a stale
/// session closing never removes a newer registration of the same name.
#[derive(Default)]
pub struct Registry {
    users: DashMap<String, Registration>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }
    pub fn len(&self) -> usize {
        self.users.len()
    }
    pub fn is_empty(&self) -> bool {
        self.users.is_empty()
    }
    pub fn contains(&self, name: &str) -> bool {
        self.users.contains_key(name)
    }
    pub fn lookup(&self, name: &str) -> Option<PeerEndpoints> {
        self.users.get(name).map(|r| r.endpoints)
    }

    pub(crate) fn register(
        &self,
        name: &str,
        public: Endpoint,
        private: Endpoint,
        writer: SharedWriter,
        session: u64,
    ) {
        let registration = Registration {
            endpoints: PeerEndpoints { public, private },
            writer,
            session,
            last_seen: Instant::now(),
        };
        if let Some(old) = self.users.insert(name.to_string(), registration) {
            if old.session != session {
                log::info!("{name} moved from {} to {public}", old.endpoints.public);
            }
        }
    }
    pub(crate) fn lookup_with_writer(&self, name: &str) -> Option<(PeerEndpoints, SharedWriter)> {
        self.users
            .get(name)
            .map(|r| (r.endpoints, r.writer.clone()))
    }
    /// Refresh `name` if `session` still owns it.
    pub(crate) fn touch(&self, name: &str, session: u64) -> bool {
        match self.users.get_mut(name) {
            Some(mut r) if r.session == session => {
                r.last_seen = Instant::now();
                true
            }
            _ => false,
        }
    }
    pub(crate) fn deregister(&self, name: &str, session: u64) -> bool {
        self.users
            .remove_if(name, |_, r| r.session == session)
            .is_some()
    }
    fn oldest(&self) -> Option<(String, Instant)> {
        self.users
            .iter()
            .min_by_key(|r| r.last_seen)
            .map(|r| (r.key().clone(), r.last_seen))
    }
    /// Wait for the registration that has been silent longest to exceed `ttl`.
    pub(crate) async fn next_idle(&self, ttl: Duration) -> (String, Instant) {
        loop {
            let wait = match self.oldest() {
                Some((name, last_seen)) => {
                    let idle = last_seen.elapsed();
                    if idle >= ttl {
                        return (name, last_seen);
                    }
                    ttl - idle
                }
                None => ttl,
            };
            tokio::time::sleep(wait).await;
        }
    }
    /// Remove `name` unless it was refreshed after `last_seen`.
    pub(crate) fn expire(&self, name: &str, last_seen: Instant) -> bool {
        self.users
            .remove_if(name, |_, r| r.last_seen <= last_seen)
            .is_some()
    }
}
