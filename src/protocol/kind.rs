//! Message kinds and the per-direction nonce table
//!
//! Several kinds are used in both directions with different shapes. CONNECT
//! is a correlated request when an initiator sends it and an uncorrelated
//! push when the broker sends it. Whether a frame carries a nonce after its
//! kind byte depends only on (kind, direction) and is fixed here:
//!
//! ```text
//!                 toward broker   from broker
//! RESPONSE        -               nonce in payload
//! REGISTER        nonce           -
//! UNREGISTER      nonce           -
//! CONNECT         nonce           no nonce (push)
//! CONNECT_NAME    nonce           -
//! LOOKUP          nonce           -
//! SEND            nonce           no nonce
//! CLOSE           nonce           no nonce
//! END_SESSION     nonce           no nonce
//! ```

use std::fmt;

use crate::error::ProtocolError;

/// Message kind tag (single byte on the wire)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum MessageKind {
    Response = 0,
    Register = 1,
    Unregister = 2,
    Connect = 3,
    ConnectName = 4,
    Lookup = 5,
    Send = 6,
    Close = 7,
    EndSession = 8,
}

/// Which way a frame travels
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Direction {
    /// Initiator to broker
    ToBroker,
    /// Broker to initiator
    FromBroker,
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Direction::ToBroker => write!(f, "toward the broker"),
            Direction::FromBroker => write!(f, "from the broker"),
        }
    }
}

/// How a kind is framed in one direction
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Framing {
    /// Not legal in this direction
    Forbidden,
    /// Kind byte, nonce, payload
    WithNonce,
    /// Kind byte, payload
    Bare,
}

/// Indexed by kind tag: (toward broker, from broker)
const FRAMING: [(Framing, Framing); 9] = [
    (Framing::Forbidden, Framing::Bare),     // RESPONSE (nonce lives in its payload)
    (Framing::WithNonce, Framing::Forbidden), // REGISTER
    (Framing::WithNonce, Framing::Forbidden), // UNREGISTER
    (Framing::WithNonce, Framing::Bare),      // CONNECT
    (Framing::WithNonce, Framing::Forbidden), // CONNECT_NAME
    (Framing::WithNonce, Framing::Forbidden), // LOOKUP
    (Framing::WithNonce, Framing::Bare),      // SEND
    (Framing::WithNonce, Framing::Bare),      // CLOSE
    (Framing::WithNonce, Framing::Bare),      // END_SESSION
];

impl MessageKind {
    /// Framing of this kind when travelling in `direction`
    pub fn framing(self, direction: Direction) -> Framing {
        let (to_broker, from_broker) = FRAMING[self as usize];
        match direction {
            Direction::ToBroker => to_broker,
            Direction::FromBroker => from_broker,
        }
    }

    /// Whether a nonce follows the kind byte in `direction`
    pub fn carries_nonce(self, direction: Direction) -> bool {
        self.framing(direction) == Framing::WithNonce
    }

    /// Whether a RESPONSE to this kind carries a reply payload
    pub fn has_reply(self) -> bool {
        matches!(
            self,
            MessageKind::Register
                | MessageKind::Connect
                | MessageKind::ConnectName
                | MessageKind::Lookup
        )
    }
}

impl TryFrom<u8> for MessageKind {
    type Error = ProtocolError;

    fn try_from(tag: u8) -> Result<Self, Self::Error> {
        Ok(match tag {
            0 => MessageKind::Response,
            1 => MessageKind::Register,
            2 => MessageKind::Unregister,
            3 => MessageKind::Connect,
            4 => MessageKind::ConnectName,
            5 => MessageKind::Lookup,
            6 => MessageKind::Send,
            7 => MessageKind::Close,
            8 => MessageKind::EndSession,
            other => return Err(ProtocolError::UnknownKind(other)),
        })
    }
}

impl From<MessageKind> for u8 {
    fn from(kind: MessageKind) -> u8 {
        kind as u8
    }
}
