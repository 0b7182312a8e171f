//! Protocol constants

use std::time::Duration;

/// Default broker TCP port
pub const DEFAULT_PORT: u16 = 11717;

/// Channel id reserved to mean "no connection"
///
/// Never assigned to a live channel. A CONNECT reply carrying it means the
/// broker could not resolve the host.
pub const NULL_CHANNEL: u32 = 0;

/// First channel id a broker session hands out
pub const FIRST_CHANNEL_ID: u32 = 1;

/// Owner id used for hosts registered by the broker process itself
///
/// Session ids start at 1, so this never collides with a connected endpoint.
pub const BROKER_OWNER_ID: u64 = 0;

/// Default cap on any length-prefixed field (16 MB)
pub const DEFAULT_MAX_FIELD_SIZE: u32 = 16 * 1024 * 1024;

/// Default socket read buffer size
pub const DEFAULT_READ_BUFFER_SIZE: usize = 64 * 1024;

/// How long a closing endpoint keeps flushing queued frames
pub const DEFAULT_CLOSE_TIMEOUT: Duration = Duration::from_secs(5);

/// Size of a kind tag on the wire
pub const KIND_SIZE: usize = 1;

/// Size of every integer on the wire
pub const INT_SIZE: usize = 4;
