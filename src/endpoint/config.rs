//! Per-endpoint settings

use std::time::Duration;

use crate::protocol::constants::{
    DEFAULT_CLOSE_TIMEOUT, DEFAULT_MAX_FIELD_SIZE, DEFAULT_READ_BUFFER_SIZE,
};

/// Settings shared by broker sessions and initiator connections
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EndpointConfig {
    /// Bytes reserved per socket read
    pub read_buffer_size: usize,

    /// Largest length-prefixed field, in both directions
    ///
    /// Outgoing data is split to fit and other oversized fields are refused
    /// before they reach the wire.
    pub max_field_size: u32,

    /// Bound on the final flush after close
    pub close_timeout: Duration,
}

impl Default for EndpointConfig {
    fn default() -> Self {
        Self {
            read_buffer_size: DEFAULT_READ_BUFFER_SIZE,
            max_field_size: DEFAULT_MAX_FIELD_SIZE,
            close_timeout: DEFAULT_CLOSE_TIMEOUT,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_endpoint_config() {
        let config = EndpointConfig::default();

        assert_eq!(config.read_buffer_size, 64 * 1024);
        assert_eq!(config.max_field_size, 16 * 1024 * 1024);
        assert_eq!(config.close_timeout, Duration::from_secs(5));
    }
}
