//! Request/response correlation
//!
//! Every request an initiator sends takes the next nonce. Requests that
//! expect a reply also park a callback under that nonce; the matching
//! RESPONSE removes it and runs it exactly once. A RESPONSE for a nonce
//! with nothing parked is dropped.

use std::sync::atomic::{AtomicU32, Ordering};

use dashmap::DashMap;

use super::handler::ReplyListener;
use crate::protocol::Reply;

/// Callback run with the nonce and reply of one request
pub type ReplyCallback = Box<dyn FnOnce(u32, Reply) + Send + Sync>;

/// Nonce allocator and pending-reply table for one endpoint
pub struct Correlator {
    next_nonce: AtomicU32,
    pending: DashMap<u32, ReplyCallback>,
}

impl Correlator {
    pub fn new() -> Self {
        Self {
            next_nonce: AtomicU32::new(0),
            pending: DashMap::new(),
        }
    }

    /// Take a nonce for a request that expects no reply
    pub fn next_nonce(&self) -> u32 {
        self.next_nonce.fetch_add(1, Ordering::Relaxed)
    }

    /// Take a nonce and park `callback` under it
    pub fn register(&self, callback: ReplyCallback) -> u32 {
        let nonce = self.next_nonce();
        self.pending.insert(nonce, callback);
        nonce
    }

    /// Forget a parked callback without running it
    pub fn cancel(&self, nonce: u32) -> bool {
        self.pending.remove(&nonce).is_some()
    }

    /// Route a reply to the callback parked under `nonce`
    ///
    /// Returns false if nothing was waiting for it.
    pub fn complete(&self, nonce: u32, reply: Reply) -> bool {
        // The map entry is released before the callback runs, so callbacks
        // are free to issue new requests.
        let Some((_, callback)) = self.pending.remove(&nonce) else {
            tracing::trace!(nonce = nonce, "Discarding reply for unknown nonce");
            return false;
        };

        callback(nonce, reply);
        true
    }

    /// Number of requests still waiting for a reply
    pub fn pending(&self) -> usize {
        self.pending.len()
    }

    /// Drop every parked callback
    pub fn clear(&self) {
        self.pending.clear();
    }
}

impl Default for Correlator {
    fn default() -> Self {
        Self::new()
    }
}

/// Hand a reply to the matching [`ReplyListener`] method
pub fn deliver_reply(listener: &dyn ReplyListener, nonce: u32, reply: Reply) {
    match reply {
        Reply::Registered { id } => listener.on_registered(nonce, id),
        Reply::Connected { channel, .. } => listener.on_connected(nonce, channel),
        Reply::LookupResult { hosts } => listener.on_lookup_result(nonce, hosts),
    }
}
