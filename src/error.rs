//! Error types
//!
//! Only conditions that break an endpoint show up here. Protocol-level
//! "soft" outcomes (unknown host, stale nonce, dangling channel id,
//! unregister by a non-owner) are handled in place and never become errors.

use std::fmt;

use crate::protocol::kind::{Direction, MessageKind};

/// Crate-wide result alias
pub type Result<T> = std::result::Result<T, Error>;

/// Top-level error type
#[derive(Debug)]
pub enum Error {
    /// Socket I/O failed
    Io(std::io::Error),
    /// The peer sent something that cannot be framed
    Protocol(ProtocolError),
    /// The endpoint has already been torn down
    ConnectionClosed,
    /// Connecting to the broker did not complete in time
    Timeout,
    /// A request was issued but the endpoint closed before its reply arrived
    ReplyDropped,
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Io(e) => write!(f, "I/O error: {}", e),
            Error::Protocol(e) => write!(f, "Protocol error: {}", e),
            Error::ConnectionClosed => write!(f, "Connection closed"),
            Error::Timeout => write!(f, "Timed out"),
            Error::ReplyDropped => write!(f, "Endpoint closed before the reply arrived"),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Io(e) => Some(e),
            Error::Protocol(e) => Some(e),
            _ => None,
        }
    }
}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        Error::Io(e)
    }
}

impl From<ProtocolError> for Error {
    fn from(e: ProtocolError) -> Self {
        Error::Protocol(e)
    }
}

/// Fatal framing errors
///
/// Any of these tears down the endpoint that produced it and nothing else.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    /// Kind byte does not name a message
    UnknownKind(u8),
    /// Kind is valid but not allowed in this direction
    UnexpectedKind {
        kind: MessageKind,
        direction: Direction,
    },
    /// RESPONSE names an original kind that has no reply payload
    UnexpectedReply(MessageKind),
    /// Stream ended in the middle of a frame
    Truncated,
    /// Length prefix larger than the configured limit
    FieldTooLarge { size: u32, max: u32 },
    /// String field is not valid UTF-8
    InvalidUtf8,
}

impl fmt::Display for ProtocolError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProtocolError::UnknownKind(tag) => write!(f, "Unknown message kind: {}", tag),
            ProtocolError::UnexpectedKind { kind, direction } => {
                write!(f, "Message {:?} not allowed {}", kind, direction)
            }
            ProtocolError::UnexpectedReply(kind) => {
                write!(f, "Response to {:?} has no reply payload", kind)
            }
            ProtocolError::Truncated => write!(f, "Truncated frame"),
            ProtocolError::FieldTooLarge { size, max } => {
                write!(f, "Field too large: {} bytes (max {})", size, max)
            }
            ProtocolError::InvalidUtf8 => write!(f, "Invalid UTF-8 in string field"),
        }
    }
}

impl std::error::Error for ProtocolError {}
