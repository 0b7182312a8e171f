//! Connection runtime shared by the broker and initiators
//!
//! An [`Endpoint`] is one side of one physical connection: a reader task, a
//! writer task, an outbound queue, a [`ChannelTable`] of virtual channels and
//! a [`Correlator`] for request nonces. The broker runs one per accepted
//! socket; an initiator runs one per broker connection.
//!
//! Application code plugs in through the traits in [`handler`]. Role
//! specific behavior plugs in through [`FrameHandler`].

pub mod channel;
pub mod config;
pub mod correlator;
pub mod handler;
pub mod runtime;

pub use channel::{ChannelHandle, ChannelTable, ChannelTarget};
pub use config::EndpointConfig;
pub use correlator::{deliver_reply, Correlator, ReplyCallback};
pub use handler::{HostOwner, LocalBridge, ReplyListener};
pub use runtime::{Endpoint, FrameHandler, Role};
