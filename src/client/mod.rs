//! Initiator side
//!
//! Connects to a broker, hosts services on it and opens channels to the
//! services of others.

pub mod config;
pub mod connector;

pub use config::ClientConfig;
pub use connector::BrokerClient;
