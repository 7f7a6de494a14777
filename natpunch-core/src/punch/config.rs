use std::io;
use std::time::Duration;

pub(crate) const READ_TIMEOUT: Duration = Duration::from_secs(2);
pub(crate) const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
pub(crate) const TOTAL_TIMEOUT: Duration = Duration::from_secs(30);
pub(crate) const RETRY_BACKOFF: Duration = Duration::from_millis(100);

#[derive(Clone, Debug)]
pub struct PunchConfig {
    /// Read timeout imposed on a connection while it is authenticated.
    pub read_timeout: Duration,
    /// Budget of a single outbound attempt.
    pub connect_timeout: Duration,
    /// Budget of the whole race.
    pub total_timeout: Duration,
    /// Pause between failed attempts of a connector.
    pub retry_backoff: Duration,
}

impl Default for PunchConfig {
    fn default() -> Self {
        Self {
            read_timeout: READ_TIMEOUT,
            connect_timeout: CONNECT_TIMEOUT,
            total_timeout: TOTAL_TIMEOUT,
            retry_backoff: RETRY_BACKOFF,
        }
    }
}

impl PunchConfig {
    pub fn set_read_timeout(mut self, timeout: Duration) -> Self {
        self.read_timeout = timeout;
        self
    }
    pub fn set_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }
    pub fn set_total_timeout(mut self, timeout: Duration) -> Self {
        self.total_timeout = timeout;
        self
    }
    pub fn set_retry_backoff(mut self, backoff: Duration) -> Self {
        self.retry_backoff = backoff;
        self
    }
    pub fn check(&self) -> io::Result<()> {
        if self.read_timeout.is_zero() {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "read_timeout cannot be 0",
            ));
        }
        if self.connect_timeout.is_zero() {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "connect_timeout cannot be 0",
            ));
        }
        if self.total_timeout < self.connect_timeout {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "total_timeout cannot be shorter than connect_timeout",
            ));
        }
        Ok(())
    }
}
