use std::io;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::time::Duration;

pub const RELAY_PORT: u16 = 3478;
pub(crate) const WAIT_TIMEOUT: Duration = Duration::from_secs(5);
pub(crate) const ALLOCATION_LIFETIME: Duration = Duration::from_secs(600);
pub(crate) const REGISTRATION_TTL: Duration = Duration::from_secs(60);

#[derive(Clone, Debug)]
pub struct RelayConfig {
    pub ip: IpAddr,
    pub port: u16,
    /// How long a peer waits for the allocation owner's data connection.
    pub wait_timeout: Duration,
    /// An allocation without a `Refresh` for this long is torn down.
    pub allocation_lifetime: Duration,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            ip: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            port: RELAY_PORT,
            wait_timeout: WAIT_TIMEOUT,
            allocation_lifetime: ALLOCATION_LIFETIME,
        }
    }
}

impl RelayConfig {
    pub fn set_ip(mut self, ip: IpAddr) -> Self {
        self.ip = ip;
        self
    }
    pub fn set_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }
    pub fn set_wait_timeout(mut self, wait_timeout: Duration) -> Self {
        self.wait_timeout = wait_timeout;
        self
    }
    pub fn set_allocation_lifetime(mut self, lifetime: Duration) -> Self {
        self.allocation_lifetime = lifetime;
        self
    }
    pub fn listen_addr(&self) -> SocketAddr {
        SocketAddr::new(self.ip, self.port)
    }
    pub fn check(&self) -> io::Result<()> {
        if self.wait_timeout.is_zero() {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "wait_timeout cannot be 0",
            ));
        }
        if self.allocation_lifetime.is_zero() {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "allocation_lifetime cannot be 0",
            ));
        }
        Ok(())
    }
}

#[derive(Clone, Debug)]
pub struct MediatorConfig {
    pub ip: IpAddr,
    pub port: u16,
    /// Users that send nothing for this long are dropped from the registry.
    pub registration_ttl: Duration,
    pub wait_timeout: Duration,
}

impl MediatorConfig {
    /// The mediator has no well-known port, so one is always given.
    pub fn new(port: u16) -> Self {
        Self {
            ip: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            port,
            registration_ttl: REGISTRATION_TTL,
            wait_timeout: WAIT_TIMEOUT,
        }
    }
    pub fn set_ip(mut self, ip: IpAddr) -> Self {
        self.ip = ip;
        self
    }
    pub fn set_registration_ttl(mut self, ttl: Duration) -> Self {
        self.registration_ttl = ttl;
        self
    }
    pub fn set_wait_timeout(mut self, wait_timeout: Duration) -> Self {
        self.wait_timeout = wait_timeout;
        self
    }
    pub fn listen_addr(&self) -> SocketAddr {
        SocketAddr::new(self.ip, self.port)
    }
    pub fn check(&self) -> io::Result<()> {
        if self.registration_ttl.is_zero() {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "registration_ttl cannot be 0",
            ));
        }
        if self.wait_timeout.is_zero() {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "wait_timeout cannot be 0",
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::{MediatorConfig, RelayConfig, RELAY_PORT};
    use std::time::Duration;

    #[test]
    fn relay_defaults() {
        let config = RelayConfig::default();
        assert_eq!(config.port, RELAY_PORT);
        assert_eq!(config.wait_timeout, Duration::from_secs(5));
        assert!(config.check().is_ok());
        assert!(config.set_wait_timeout(Duration::ZERO).check().is_err());
    }

    #[test]
    fn mediator_defaults() {
        let config = MediatorConfig::new(7000);
        assert_eq!(config.listen_addr().port(), 7000);
        assert_eq!(config.registration_ttl, Duration::from_secs(60));
        assert!(config.check().is_ok());
    }
}
