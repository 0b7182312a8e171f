//! Capability traits implemented outside the core
//!
//! The endpoint never touches raw local streams or application logic. It
//! calls into these traits instead:
//!
//! - [`LocalBridge`]: one virtual channel wired to something local (a TCP
//!   stream in the demos, a test recorder in the tests)
//! - [`HostOwner`]: a service that accepts incoming virtual connections
//! - [`ReplyListener`]: receives correlated replies for raw requests
//!
//! All methods are called from an endpoint's reader task, so they must not
//! block. Hand work off to a spawned task if it can wait on I/O.

use std::sync::Arc;

use bytes::Bytes;

use super::channel::ChannelHandle;
use crate::registry::ServiceId;

/// Local end of a virtual channel
pub trait LocalBridge: Send + Sync + 'static {
    /// The channel is open; write back through `handle`
    fn on_assigned(&self, handle: ChannelHandle);

    /// Bytes arrived for `channel`, in send order
    fn on_data(&self, data: Bytes, channel: u32);

    /// The channel is gone
    ///
    /// `channel` is [`NULL_CHANNEL`](crate::protocol::constants::NULL_CHANNEL)
    /// when a connect request was refused before any channel existed.
    fn on_closed(&self, channel: u32);
}

/// A service that accepts virtual connections
pub trait HostOwner: Send + Sync + 'static {
    /// The broker assigned `id` to a registration under `name`
    fn on_id_assigned(&self, id: u32, name: &str);

    /// Someone opened a channel to `service`
    ///
    /// Returning `None` refuses the connection.
    fn new_connection(
        &self,
        handle: ChannelHandle,
        service: &ServiceId,
    ) -> Option<Arc<dyn LocalBridge>>;

    /// The registration for `service` is gone because its endpoint closed
    fn on_owner_closed(&self, service: &ServiceId);
}

/// Receives replies to raw requests, tagged with the request's nonce
pub trait ReplyListener: Send + Sync + 'static {
    fn on_registered(&self, nonce: u32, id: u32);

    /// `channel` is zero when the host could not be resolved
    fn on_connected(&self, nonce: u32, channel: u32);

    fn on_lookup_result(&self, nonce: u32, hosts: Vec<ServiceId>);
}
