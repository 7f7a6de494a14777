use async_trait::async_trait;
use bytes::Bytes;
use std::ops::{Deref, DerefMut};
use std::sync::Arc;
use std::time::Duration;

use crate::cancel::CancelableWork;
use crate::connection::Connection;
use crate::message::{Attribute, Message, MessageClass, Method};
use crate::punch::RaceContext;

/// Validates a freshly connected handle before it is allowed to win a race.
///
/// An implementation that returns `true` must have claimed the race through
/// [`RaceContext::claim`] first; the claim is what cancels the sibling
/// participants, so at most one connection per race gets past this point.
#[async_trait]
pub trait Authenticator: Send + Sync {
    async fn authenticate(
        &self,
        connection: &mut Connection,
        race: &RaceContext,
        me: &Arc<CancelableWork>,
    ) -> crate::error::Result<bool>;
}

/// Accepts any connection. Useful when the transport is authenticated by a
/// layer above the punched connection.
#[derive(Copy, Clone, Default, Debug)]
pub struct TrustAuthenticator;

#[async_trait]
impl Authenticator for TrustAuthenticator {
    async fn authenticate(
        &self,
        _connection: &mut Connection,
        race: &RaceContext,
        me: &Arc<CancelableWork>,
    ) -> crate::error::Result<bool> {
        Ok(race.claim(me))
    }
}

/// Both sides send the secret in a `Binding` indication and compare what
/// they receive. The exchange is symmetric, so it works whichever side
/// initiated the TCP connection.
#[derive(Clone)]
pub struct SharedSecretAuthenticator {
    secret: Bytes,
}

impl SharedSecretAuthenticator {
    pub fn new(secret: impl Into<Bytes>) -> Self {
        Self {
            secret: secret.into(),
        }
    }
}

#[async_trait]
impl Authenticator for SharedSecretAuthenticator {
    async fn authenticate(
        &self,
        connection: &mut Connection,
        race: &RaceContext,
        me: &Arc<CancelableWork>,
    ) -> crate::error::Result<bool> {
        let hello =
            Message::indication(Method::Binding).with_attribute(Attribute::Data(self.secret.clone()));
        connection.write_message(&hello).await?;
        let reply = connection.read_message().await?;
        if !reply.is(Method::Binding, MessageClass::Indication) {
            log::warn!(
                "unexpected {:?} {:?} from {} while authenticating",
                reply.method(),
                reply.class(),
                connection.peer_endpoint()
            );
            return Ok(false);
        }
        if reply.data() != Some(&self.secret) {
            log::warn!("secret mismatch from {}", connection.peer_endpoint());
            return Ok(false);
        }
        Ok(race.claim(me))
    }
}

/// Bounds the inner authenticator with a read timeout on the connection and
/// puts the previous timeout back however the inner call ends.
pub struct TimeLimitAuthenticator {
    inner: Arc<dyn Authenticator>,
    limit: Duration,
}

impl TimeLimitAuthenticator {
    pub fn new(inner: Arc<dyn Authenticator>, limit: Duration) -> Self {
        Self { inner, limit }
    }
}

#[async_trait]
impl Authenticator for TimeLimitAuthenticator {
    async fn authenticate(
        &self,
        connection: &mut Connection,
        race: &RaceContext,
        me: &Arc<CancelableWork>,
    ) -> crate::error::Result<bool> {
        let mut guard = ReadTimeoutGuard::new(connection, self.limit);
        self.inner.authenticate(&mut guard, race, me).await
    }
}

struct ReadTimeoutGuard<'a> {
    connection: &'a mut Connection,
    prior: Option<Duration>,
}

impl<'a> ReadTimeoutGuard<'a> {
    fn new(connection: &'a mut Connection, limit: Duration) -> Self {
        let prior = connection.set_read_timeout(Some(limit));
        Self { connection, prior }
    }
}

impl Deref for ReadTimeoutGuard<'_> {
    type Target = Connection;

    fn deref(&self) -> &Self::Target {
        self.connection
    }
}

impl DerefMut for ReadTimeoutGuard<'_> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        self.connection
    }
}

impl Drop for ReadTimeoutGuard<'_> {
    fn drop(&mut self) {
        self.connection.set_read_timeout(self.prior);
    }
}
