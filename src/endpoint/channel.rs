//! Virtual channel table
//!
//! Each endpoint maps its channel ids to a [`ChannelTarget`]. On an
//! initiator every live channel is [`ChannelTarget::Local`]. On the broker a
//! relayed channel is [`ChannelTarget::Relay`] and names the peer endpoint
//! and the peer's channel id, so a bridged pair looks like this:
//!
//! ```text
//!   session A table                 session B table
//!   ┌──────────────────────┐        ┌──────────────────────┐
//!   │ 3 ─► Relay { B, 7 }  │        │ 7 ─► Relay { A, 3 }  │
//!   └──────────────────────┘        └──────────────────────┘
//!   SEND(3) from A  ──────────────► SEND(7) to B
//!   CLOSE(7) from B ◄────────────── CLOSE(3) to A
//! ```
//!
//! Tables are touched by their own endpoint's reader task and by the reader
//! tasks of relay peers, so they sit in a `DashMap`. Never call into another
//! table or a bridge while holding an entry.

use std::fmt;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;

use super::handler::LocalBridge;
use super::runtime::Endpoint;
use crate::error::Result;
use crate::protocol::constants::{FIRST_CHANNEL_ID, NULL_CHANNEL};

/// Where traffic on a channel goes
#[derive(Clone)]
pub enum ChannelTarget {
    /// Id reserved while a connect handshake is wired up
    Pending,
    /// Delivered to a local bridge
    Local(Arc<dyn LocalBridge>),
    /// Forwarded unchanged to `channel` on `peer`
    Relay { peer: Arc<Endpoint>, channel: u32 },
}

impl fmt::Debug for ChannelTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ChannelTarget::Pending => write!(f, "Pending"),
            ChannelTarget::Local(_) => write!(f, "Local"),
            ChannelTarget::Relay { peer, channel } => f
                .debug_struct("Relay")
                .field("peer", &peer.id())
                .field("channel", channel)
                .finish(),
        }
    }
}

/// Channel id to target mapping for one endpoint
pub struct ChannelTable {
    entries: DashMap<u32, ChannelTarget>,
    next_id: AtomicU32,
}

impl ChannelTable {
    pub fn new() -> Self {
        Self {
            entries: DashMap::new(),
            next_id: AtomicU32::new(FIRST_CHANNEL_ID),
        }
    }

    /// Insert under a fresh id and return it
    ///
    /// Ids count up from 1, wrap around, and skip 0 and anything still live.
    pub fn allocate(&self, target: ChannelTarget) -> u32 {
        loop {
            let id = self.next_id.fetch_add(1, Ordering::Relaxed);
            if id == NULL_CHANNEL {
                continue;
            }
            if let Entry::Vacant(slot) = self.entries.entry(id) {
                slot.insert(target);
                return id;
            }
        }
    }

    /// Allocate an id whose target is filled in later with [`set`](Self::set)
    pub fn reserve(&self) -> u32 {
        self.allocate(ChannelTarget::Pending)
    }

    /// Insert under an id chosen by the remote side
    pub fn insert(&self, channel: u32, target: ChannelTarget) {
        self.entries.insert(channel, target);
    }

    /// Replace the target of an existing entry
    ///
    /// Returns false if the channel was closed in the meantime.
    pub fn set(&self, channel: u32, target: ChannelTarget) -> bool {
        match self.entries.get_mut(&channel) {
            Some(mut entry) => {
                *entry = target;
                true
            }
            None => false,
        }
    }

    /// Clone of the target for `channel`
    pub fn get(&self, channel: u32) -> Option<ChannelTarget> {
        self.entries.get(&channel).map(|entry| entry.value().clone())
    }

    pub fn remove(&self, channel: u32) -> Option<ChannelTarget> {
        self.entries.remove(&channel).map(|(_, target)| target)
    }

    pub fn contains(&self, channel: u32) -> bool {
        self.entries.contains_key(&channel)
    }

    /// Remove and return every entry
    pub fn drain(&self) -> Vec<(u32, ChannelTarget)> {
        let ids: Vec<u32> = self.entries.iter().map(|entry| *entry.key()).collect();
        ids.into_iter()
            .filter_map(|id| self.remove(id).map(|target| (id, target)))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    #[cfg(test)]
    pub(crate) fn set_next_id(&self, id: u32) {
        self.next_id.store(id, Ordering::Relaxed);
    }
}

impl Default for ChannelTable {
    fn default() -> Self {
        Self::new()
    }
}

/// Write side of one virtual channel
///
/// Handed to a [`LocalBridge`] when its channel opens. Cloning is cheap.
#[derive(Clone)]
pub struct ChannelHandle {
    endpoint: Arc<Endpoint>,
    channel: u32,
}

impl ChannelHandle {
    pub(crate) fn new(endpoint: Arc<Endpoint>, channel: u32) -> Self {
        Self { endpoint, channel }
    }

    /// Channel id on the owning endpoint
    pub fn id(&self) -> u32 {
        self.channel
    }

    /// Send bytes to the remote half
    pub fn send(&self, data: Bytes) -> Result<()> {
        self.endpoint.send_data(self.channel, data)
    }

    /// Close the channel and tell the remote half
    pub fn close(&self) {
        let _ = self.endpoint.close_channel(self.channel);
    }

    /// Whether the channel is still in its endpoint's table
    pub fn is_open(&self) -> bool {
        !self.endpoint.is_closed() && self.endpoint.channels().contains(self.channel)
    }
}

impl fmt::Debug for ChannelHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChannelHandle")
            .field("endpoint", &self.endpoint.id())
            .field("channel", &self.channel)
            .finish()
    }
}
