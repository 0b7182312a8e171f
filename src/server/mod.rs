//! Rendezvous broker
//!
//! The broker accepts connections, keeps the shared host registry, and
//! relays channel traffic between sessions without looking at payloads.

pub mod config;
pub mod listener;
pub mod session;

pub use config::ServerConfig;
pub use listener::BrokerServer;
pub use session::HostTarget;
