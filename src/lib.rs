//! Rendezvous broker and reverse-tunnel relay
//!
//! Endpoints that cannot reach each other directly connect out to a shared
//! broker. A service registers under a name and gets a numbered host id;
//! anyone else can look it up and open a virtual channel to it. The broker
//! relays channel bytes between the two sessions without reading them.
//!
//! ```text
//!   host process                 broker                  guest process
//!   BrokerClient ──── TCP ──── BrokerServer ──── TCP ──── BrokerClient
//!     REGISTER "printer"  ──►  printer:0
//!                              ◄──  CONNECT_NAME "printer"
//!     ◄── CONNECT(printer:0, 1)     RESPONSE(channel 1)  ──►
//!     SEND/CLOSE on 1  ◄═════════ relay ═════════►  SEND/CLOSE on 1
//! ```
//!
//! - [`protocol`]: wire format and frame codec
//! - [`registry`]: named host registry with wildcard search
//! - [`endpoint`]: per-connection runtime, channel tables, correlation
//! - [`server`]: the broker
//! - [`client`]: the initiator side
//! - [`stats`]: session and server counters

pub mod client;
pub mod endpoint;
pub mod error;
pub mod protocol;
pub mod registry;
pub mod server;
pub mod stats;

pub use client::{BrokerClient, ClientConfig};
pub use endpoint::{ChannelHandle, HostOwner, LocalBridge, ReplyListener};
pub use error::{Error, Result};
pub use registry::ServiceId;
pub use server::{BrokerServer, ServerConfig};
