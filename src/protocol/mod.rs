//! Wire protocol
//!
//! One physical connection carries two kinds of traffic: correlated
//! requests from an initiator (each with a nonce, answered by a RESPONSE
//! carrying the same nonce) and uncorrelated pushes from the broker. Both
//! share the same set of kind tags; [`kind`] decides per direction which
//! shape a tag has, and [`codec`] turns bytes into [`Frame`]s accordingly.

pub mod codec;
pub mod constants;
pub mod kind;
pub mod message;

pub use codec::{encode, encode_into, FrameDecoder};
pub use kind::{Direction, MessageKind};
pub use message::{Frame, Push, Reply, Request};
