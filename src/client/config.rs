//! Client configuration

use std::net::Ipv6Addr;
use std::time::Duration;

use crate::endpoint::EndpointConfig;
use crate::protocol::constants::*;

/// Client configuration options
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Broker address as `host:port`
    pub broker_addr: String,

    /// How long to wait for the TCP connection
    pub connect_timeout: Duration,

    /// Enable TCP_NODELAY
    pub tcp_nodelay: bool,

    /// Application-level read buffer size
    pub read_buffer_size: usize,

    /// Largest accepted length-prefixed field
    pub max_field_size: u32,

    /// How long a closing connection keeps flushing queued frames
    pub close_timeout: Duration,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            broker_addr: format!("127.0.0.1:{}", DEFAULT_PORT),
            connect_timeout: Duration::from_secs(10),
            tcp_nodelay: true,
            read_buffer_size: DEFAULT_READ_BUFFER_SIZE,
            max_field_size: DEFAULT_MAX_FIELD_SIZE,
            close_timeout: DEFAULT_CLOSE_TIMEOUT,
        }
    }
}

impl ClientConfig {
    /// Create a config for the broker at `addr`
    ///
    /// A bare host name or IP gets the default port. Bare IPv6 literals
    /// are bracketed first.
    pub fn new(addr: impl Into<String>) -> Self {
        let mut broker_addr = addr.into();
        if !has_port(&broker_addr) {
            broker_addr = if broker_addr.parse::<Ipv6Addr>().is_ok() {
                format!("[{}]:{}", broker_addr, DEFAULT_PORT)
            } else {
                format!("{}:{}", broker_addr, DEFAULT_PORT)
            };
        }

        Self {
            broker_addr,
            ..Default::default()
        }
    }

    /// Set connect timeout
    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// Enable or disable TCP_NODELAY
    pub fn tcp_nodelay(mut self, enabled: bool) -> Self {
        self.tcp_nodelay = enabled;
        self
    }

    /// Set the read buffer size
    pub fn read_buffer_size(mut self, size: usize) -> Self {
        self.read_buffer_size = size.max(1);
        self
    }

    /// Set the largest accepted field
    pub fn max_field_size(mut self, size: u32) -> Self {
        self.max_field_size = size.max(1);
        self
    }

    /// Set the bound on the final flush after close
    pub fn close_timeout(mut self, timeout: Duration) -> Self {
        self.close_timeout = timeout;
        self
    }

    /// Settings for the connection endpoint
    pub fn endpoint_config(&self) -> EndpointConfig {
        EndpointConfig {
            read_buffer_size: self.read_buffer_size,
            max_field_size: self.max_field_size,
            close_timeout: self.close_timeout,
        }
    }
}

/// Whether `addr` already ends in a port
fn has_port(addr: &str) -> bool {
    // Bracketed IPv6 literal: "[::1]:11717"
    if let Some(rest) = addr.strip_prefix('[') {
        return rest
            .split_once(']')
            .map(|(_, tail)| tail.starts_with(':'))
            .unwrap_or(false);
    }

    match addr.rsplit_once(':') {
        // A second colon means an unbracketed IPv6 address with no port
        Some((host, port)) => !host.contains(':') && port.parse::<u16>().is_ok(),
        None => false,
    }
}
