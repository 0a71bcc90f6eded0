//! Dispatcher configuration.
//!
//! [`DispatcherConfig`] collects everything the runtime needs to bind its
//! sockets and drive its timers. Defaults match the classic daemon:
//!
//! | Setting | Default |
//! |---------|---------|
//! | `socket_path` | `/tmp/someip-dispatch.socket` |
//! | `tcp_port` | 10032 (probing 10 ports upward if occupied) |
//! | `sd_port` | 10102 (UDP broadcast) |
//! | `announced_address` | 127.0.0.1 |
//! | `ping_interval` | 5 s |
//! | `announce_interval` | 300 s |
//! | `service_ttl` | 0xFFFFFF (does not expire) |

use std::net::Ipv4Addr;
use std::path::PathBuf;
use std::time::Duration;

use crate::error::{Error, Result};
use crate::sd::TTL_FOREVER;

/// Default TCP server port; the server probes upward from here.
pub const DEFAULT_TCP_PORT: u16 = 10032;

/// Number of TCP ports probed before giving up.
pub const DEFAULT_TCP_PORT_ATTEMPTS: u16 = 10;

/// UDP port used for service discovery broadcasts.
pub const DEFAULT_SD_PORT: u16 = 10102;

/// Runtime configuration for a dispatcher instance.
#[derive(Debug, Clone)]
pub struct DispatcherConfig {
    /// Path of the Unix stream socket local clients connect to.
    pub socket_path: PathBuf,
    /// Base TCP port for the SOME/IP server.
    pub tcp_port: u16,
    /// How many consecutive ports to try when the base port is occupied.
    pub tcp_port_attempts: u16,
    /// UDP port for service discovery.
    pub sd_port: u16,
    /// IPv4 address placed into OfferService endpoint options. SD datagrams
    /// sourced from this address are ignored (our own broadcasts).
    pub announced_address: Ipv4Addr,
    /// Keep-alive ping interval for local clients.
    pub ping_interval: Duration,
    /// Period of the SD re-announce timer.
    pub announce_interval: Duration,
    /// TTL placed into OfferService entries (24-bit).
    pub service_ttl: u32,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            socket_path: PathBuf::from("/tmp/someip-dispatch.socket"),
            tcp_port: DEFAULT_TCP_PORT,
            tcp_port_attempts: DEFAULT_TCP_PORT_ATTEMPTS,
            sd_port: DEFAULT_SD_PORT,
            announced_address: Ipv4Addr::LOCALHOST,
            ping_interval: Duration::from_secs(5),
            announce_interval: Duration::from_secs(300),
            service_ttl: TTL_FOREVER,
        }
    }
}

impl DispatcherConfig {
    /// Start building a configuration from the defaults.
    pub fn builder() -> DispatcherConfigBuilder {
        DispatcherConfigBuilder {
            config: Self::default(),
        }
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<()> {
        if self.tcp_port_attempts == 0 {
            return Err(Error::config("tcp_port_attempts must be at least 1"));
        }
        if self.tcp_port.checked_add(self.tcp_port_attempts - 1).is_none() {
            return Err(Error::config("TCP port probe range exceeds 65535"));
        }
        if self.sd_port == 0 {
            return Err(Error::config("sd_port must not be 0"));
        }
        if self.service_ttl > TTL_FOREVER {
            return Err(Error::config("service_ttl exceeds 24 bits"));
        }
        if self.socket_path.as_os_str().is_empty() {
            return Err(Error::config("socket_path must not be empty"));
        }
        Ok(())
    }
}

/// Builder for [`DispatcherConfig`].
#[derive(Debug)]
pub struct DispatcherConfigBuilder {
    config: DispatcherConfig,
}

impl DispatcherConfigBuilder {
    pub fn socket_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.config.socket_path = path.into();
        self
    }

    pub fn tcp_port(mut self, port: u16) -> Self {
        self.config.tcp_port = port;
        self
    }

    pub fn tcp_port_attempts(mut self, attempts: u16) -> Self {
        self.config.tcp_port_attempts = attempts;
        self
    }

    pub fn sd_port(mut self, port: u16) -> Self {
        self.config.sd_port = port;
        self
    }

    pub fn announced_address(mut self, addr: Ipv4Addr) -> Self {
        self.config.announced_address = addr;
        self
    }

    pub fn ping_interval(mut self, interval: Duration) -> Self {
        self.config.ping_interval = interval;
        self
    }

    pub fn announce_interval(mut self, interval: Duration) -> Self {
        self.config.announce_interval = interval;
        self
    }

    pub fn service_ttl(mut self, ttl: u32) -> Self {
        self.config.service_ttl = ttl;
        self
    }

    /// Validate and return the finished configuration.
    pub fn build(self) -> Result<DispatcherConfig> {
        self.config.validate()?;
        Ok(self.config)
    }
}
