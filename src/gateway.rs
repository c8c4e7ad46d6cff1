//! Broadcast gateway — per-connection addressing and per-room multicast.
//!
//! DESIGN
//! ======
//! Each websocket connection registers an outbound `mpsc::Sender<Frame>`.
//! The gateway pairs those senders with the `RoomRegistry` under a single
//! short-lived `std::sync::Mutex`: membership moves and fan-out are each
//! one critical section, so a broadcast never observes a half-moved
//! connection. Delivery is `try_send`, never awaited. A closed channel is
//! skipped. A full channel means the peer has fallen behind the room: it is
//! evicted (sender and membership dropped), which ends its socket loop so
//! the client reconnects and bootstraps a fresh snapshot instead of keeping
//! a mirror with a silent gap.
//!
//! The gateway never mutates canvas state. Callers that need per-room
//! ordering broadcast while holding their canvas lock.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::sync::mpsc;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::frame::Frame;
use crate::rooms::RoomRegistry;

#[derive(Clone, Default)]
pub struct Gateway {
    inner: Arc<Mutex<GatewayInner>>,
}

#[derive(Default)]
struct GatewayInner {
    registry: RoomRegistry,
    peers: HashMap<Uuid, mpsc::Sender<Frame>>,
}

impl Gateway {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, GatewayInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    // =========================================================================
    // CONNECTIONS
    // =========================================================================

    /// Register a connection's outbound channel.
    pub fn connect(&self, connection_id: Uuid, tx: mpsc::Sender<Frame>) {
        self.lock().peers.insert(connection_id, tx);
    }

    /// Drop a connection and its room membership in one step. Returns the
    /// room it occupied.
    pub fn disconnect(&self, connection_id: Uuid) -> Option<String> {
        let mut inner = self.lock();
        inner.peers.remove(&connection_id);
        inner.registry.leave(connection_id)
    }

    // =========================================================================
    // ROOMS
    // =========================================================================

    /// Move `connection_id` into `room_id`. Returns the previous room.
    ///
    /// A connection without a registered channel (closed or evicted) is
    /// left out of every room.
    pub fn join_room(&self, connection_id: Uuid, room_id: &str) -> Option<String> {
        let mut inner = self.lock();
        if !inner.peers.contains_key(&connection_id) {
            return None;
        }
        inner.registry.join(connection_id, room_id)
    }

    /// Leave `room_id` if the connection is currently in it.
    pub fn leave_room(&self, connection_id: Uuid, room_id: &str) -> bool {
        let mut inner = self.lock();
        if inner.registry.room_of(connection_id) != Some(room_id) {
            return false;
        }
        inner.registry.leave(connection_id);
        true
    }

    #[must_use]
    pub fn room_of(&self, connection_id: Uuid) -> Option<String> {
        self.lock().registry.room_of(connection_id).map(str::to_owned)
    }

    #[must_use]
    pub fn is_member(&self, connection_id: Uuid, room_id: &str) -> bool {
        self.lock().registry.room_of(connection_id) == Some(room_id)
    }

    #[must_use]
    pub fn member_count(&self, room_id: &str) -> usize {
        self.lock().registry.member_count(room_id)
    }

    #[cfg(test)]
    #[must_use]
    pub fn members_of(&self, room_id: &str) -> Vec<Uuid> {
        self.lock().registry.members_of(room_id).collect()
    }

    // =========================================================================
    // DELIVERY
    // =========================================================================

    /// Send `frame` to every member of `room_id`, optionally skipping one
    /// connection. Returns how many channels accepted the frame.
    pub fn broadcast(&self, room_id: &str, frame: &Frame, exclude: Option<Uuid>) -> usize {
        let mut inner = self.lock();
        let mut delivered = 0;
        let mut lagging = Vec::new();
        for member in inner.registry.members_of(room_id) {
            if exclude == Some(member) {
                continue;
            }
            let Some(tx) = inner.peers.get(&member) else {
                continue;
            };
            match tx.try_send(frame.clone()) {
                Ok(()) => delivered += 1,
                Err(mpsc::error::TrySendError::Full(_)) => lagging.push(member),
                Err(mpsc::error::TrySendError::Closed(_)) => {
                    debug!(connection_id = %member, event = %frame.event, "gateway: peer closed; frame skipped");
                }
            }
        }
        for member in lagging {
            inner.evict(member, &frame.event);
        }
        delivered
    }

    /// Send `frame` to one connection. Returns whether it was accepted.
    pub fn unicast(&self, connection_id: Uuid, frame: Frame) -> bool {
        let mut inner = self.lock();
        let Some(tx) = inner.peers.get(&connection_id) else {
            return false;
        };
        match tx.try_send(frame) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(frame)) => {
                inner.evict(connection_id, &frame.event);
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => false,
        }
    }

    /// Drop every peer and all memberships. Each socket loop sees its channel
    /// close and exits.
    pub fn close_all(&self) -> usize {
        let mut inner = self.lock();
        let closed = inner.peers.len();
        inner.peers.clear();
        inner.registry = RoomRegistry::default();
        closed
    }
}

impl GatewayInner {
    fn evict(&mut self, connection_id: Uuid, event: &str) {
        self.peers.remove(&connection_id);
        let room_id = self.registry.leave(connection_id);
        warn!(%connection_id, ?room_id, event, "gateway: peer channel full; evicting lagging connection");
    }
}
