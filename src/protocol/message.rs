//! Typed protocol messages
//!
//! A decoded frame is one of three shapes: a correlated request travelling
//! toward the broker, a RESPONSE wrapping the reply to such a request, or an
//! uncorrelated push travelling from the broker. Which shape a kind byte
//! decodes into is decided by the codec from the direction of travel.

use bytes::Bytes;

use super::kind::MessageKind;
use crate::registry::ServiceId;

/// A request sent by an initiator
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Request {
    /// Register a host under `name`; replied with the assigned id
    Register { name: String },
    /// Drop a registration this endpoint owns
    Unregister { service: ServiceId },
    /// Open a channel to an exact host; replied with a channel id
    Connect { service: ServiceId },
    /// Open a channel to the only host named `name`; replied with a channel id
    ConnectName { name: String },
    /// Wildcard search; replied with matching hosts
    Lookup { query: String },
    /// Data for an open channel
    Send { channel: u32, data: Bytes },
    /// Close an open channel
    Close { channel: u32 },
    /// Graceful shutdown announcement
    EndSession,
}

impl Request {
    /// Kind tag for this request
    pub fn kind(&self) -> MessageKind {
        match self {
            Request::Register { .. } => MessageKind::Register,
            Request::Unregister { .. } => MessageKind::Unregister,
            Request::Connect { .. } => MessageKind::Connect,
            Request::ConnectName { .. } => MessageKind::ConnectName,
            Request::Lookup { .. } => MessageKind::Lookup,
            Request::Send { .. } => MessageKind::Send,
            Request::Close { .. } => MessageKind::Close,
            Request::EndSession => MessageKind::EndSession,
        }
    }
}

/// Reply payload carried by a RESPONSE
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reply {
    /// Id assigned to a REGISTER
    Registered { id: u32 },
    /// Channel opened by CONNECT (`by_name == false`) or CONNECT_NAME;
    /// [`NULL_CHANNEL`](super::constants::NULL_CHANNEL) when unresolved
    Connected { by_name: bool, channel: u32 },
    /// Hosts matching a LOOKUP
    LookupResult { hosts: Vec<ServiceId> },
}

impl Reply {
    /// Kind of the request this reply answers
    pub fn original_kind(&self) -> MessageKind {
        match self {
            Reply::Registered { .. } => MessageKind::Register,
            Reply::Connected { by_name: false, .. } => MessageKind::Connect,
            Reply::Connected { by_name: true, .. } => MessageKind::ConnectName,
            Reply::LookupResult { .. } => MessageKind::Lookup,
        }
    }
}

/// An uncorrelated message from the broker
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Push {
    /// A new channel to one of this endpoint's hosts
    Connect { service: ServiceId, channel: u32 },
    /// Data for an open channel
    Send { channel: u32, data: Bytes },
    /// The remote half of a channel closed
    Close { channel: u32 },
    /// Graceful shutdown announcement
    EndSession,
}

impl Push {
    /// Kind tag for this push
    pub fn kind(&self) -> MessageKind {
        match self {
            Push::Connect { .. } => MessageKind::Connect,
            Push::Send { .. } => MessageKind::Send,
            Push::Close { .. } => MessageKind::Close,
            Push::EndSession => MessageKind::EndSession,
        }
    }
}

/// One frame on the wire
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    /// Initiator request with its nonce
    Request { nonce: u32, request: Request },
    /// Broker reply to the request carrying `nonce`
    Response { nonce: u32, reply: Reply },
    /// Broker push
    Push(Push),
}

impl Frame {
    /// Kind tag written first on the wire
    pub fn kind(&self) -> MessageKind {
        match self {
            Frame::Request { request, .. } => request.kind(),
            Frame::Response { .. } => MessageKind::Response,
            Frame::Push(push) => push.kind(),
        }
    }
}
