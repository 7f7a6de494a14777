//! Token-keyed handoff of an asynchronously arriving value to a waiter.
//!
//! The shape is the same as the [`ConnectionListener`](crate::listener::ConnectionListener)
//! registry, except the key is an explicit correlation token instead of the
//! remote endpoint. This is what the relay uses to match a client's data
//! connection to a waiting peer, and what connection reversal uses to match
//! an inbound connection to the request that caused it.

use std::fmt;
use std::future::Future;
use std::hash::Hash;
use std::sync::Arc;
use std::time::Duration;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;

use crate::error::{Error, Result};
use crate::mailbox::Mailbox;

pub const DEFAULT_WAIT_TIMEOUT: Duration = Duration::from_secs(5);
pub const DEFAULT_LATE_GRACE: Duration = Duration::from_millis(100);

/// Opaque correlation identifier carried in protocol messages.
#[derive(Copy, Clone, Eq, PartialEq, Hash)]
pub struct Token(u64);

impl Token {
    pub fn random() -> Self {
        Token(rand::random())
    }
    #[inline]
    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl From<u64> for Token {
    fn from(value: u64) -> Self {
        Token(value)
    }
}

impl fmt::Debug for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Token({:016x})", self.0)
    }
}

impl fmt::Display for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:016x}", self.0)
    }
}

pub struct CorrelationRendezvous<K, V> {
    waiters: DashMap<K, Arc<Mailbox<V>>>,
    wait_timeout: Duration,
    late_grace: Duration,
}

impl<K: Eq + Hash + Clone, V> Default for CorrelationRendezvous<K, V> {
    fn default() -> Self {
        Self::new()
    }
}

impl<K: Eq + Hash + Clone, V> CorrelationRendezvous<K, V> {
    pub fn new() -> Self {
        Self {
            waiters: DashMap::new(),
            wait_timeout: DEFAULT_WAIT_TIMEOUT,
            late_grace: DEFAULT_LATE_GRACE,
        }
    }
    pub fn set_wait_timeout(mut self, wait_timeout: Duration) -> Self {
        self.wait_timeout = wait_timeout;
        self
    }
    pub fn set_late_grace(mut self, late_grace: Duration) -> Self {
        self.late_grace = late_grace;
        self
    }
    pub fn wait_timeout(&self) -> Duration {
        self.wait_timeout
    }
    pub fn is_pending(&self, token: &K) -> bool {
        self.waiters.contains_key(token)
    }
    pub fn pending_count(&self) -> usize {
        self.waiters.len()
    }

    /// Register interest in `token`. The registration lives as long as the
    /// returned guard; registering a token that is already pending is a
    /// contract violation.
    pub fn register(&self, token: K) -> Result<PendingWait<'_, K, V>> {
        let mailbox = Arc::new(Mailbox::new());
        match self.waiters.entry(token.clone()) {
            Entry::Occupied(_) => return Err(Error::IllegalState("token already pending")),
            Entry::Vacant(entry) => {
                entry.insert(mailbox.clone());
            }
        }
        Ok(PendingWait {
            rendezvous: self,
            token,
            mailbox,
        })
    }

    /// Register `token`, run `notification` (usually a message telling the
    /// remote side which token to present) and wait for the matching delivery.
    pub async fn begin_wait<F>(&self, token: K, notification: F) -> Result<V>
    where
        F: Future<Output = Result<()>>,
    {
        let pending = self.register(token)?;
        notification.await?;
        pending.wait().await
    }

    /// Hand `value` to the waiter registered for `token`, removing the
    /// registration. The value is returned when nobody is waiting so the
    /// caller can reject it explicitly.
    pub fn deliver(&self, token: &K, value: V) -> Result<(), V> {
        let mut value = Some(value);
        // remove and offer under the shard lock; a waiter that is timing out
        // either sees the value afterwards or this call sees no entry
        self.waiters.remove_if(token, |_, mailbox| match value.take() {
            Some(v) => match mailbox.offer(v) {
                Ok(()) => true,
                Err(v) => {
                    value = Some(v);
                    false
                }
            },
            None => false,
        });
        match value {
            Some(v) => Err(v),
            None => Ok(()),
        }
    }
}

pub struct PendingWait<'a, K: Eq + Hash + Clone, V> {
    rendezvous: &'a CorrelationRendezvous<K, V>,
    token: K,
    mailbox: Arc<Mailbox<V>>,
}

impl<K: Eq + Hash + Clone, V> PendingWait<'_, K, V> {
    pub fn token(&self) -> &K {
        &self.token
    }
    pub async fn wait(self) -> Result<V> {
        let timeout = self.rendezvous.wait_timeout;
        self.wait_timeout(timeout).await
    }
    pub async fn wait_timeout(self, timeout: Duration) -> Result<V> {
        if let Some(value) = self.mailbox.poll(timeout).await {
            return Ok(value);
        }
        if let Some(value) = self.mailbox.poll(self.rendezvous.late_grace).await {
            return Ok(value);
        }
        self.unregister();
        self.mailbox.try_take().ok_or(Error::Timeout)
    }
    fn unregister(&self) {
        self.rendezvous
            .waiters
            .remove_if(&self.token, |_, mailbox| Arc::ptr_eq(mailbox, &self.mailbox));
    }
}

impl<K: Eq + Hash + Clone, V> Drop for PendingWait<'_, K, V> {
    fn drop(&mut self) {
        self.unregister();
    }
}
