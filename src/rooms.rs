//! Room registry — which connection listens to which canvas room.
//!
//! DESIGN
//! ======
//! Two indexes kept in lockstep: room -> members and connection -> room.
//! A connection sits in at most one room; `join` moves it, `leave` drops
//! it. Empty rooms are removed. The registry holds no lock of its own;
//! `gateway::Gateway` wraps it so that membership changes and fan-out
//! never interleave.

use std::collections::{HashMap, HashSet};

use uuid::Uuid;

#[derive(Debug, Default)]
pub struct RoomRegistry {
    rooms: HashMap<String, HashSet<Uuid>>,
    membership: HashMap<Uuid, String>,
}

impl RoomRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Put `connection_id` in `room_id`, leaving any previous room first.
    /// Returns the room it was moved out of, if different.
    pub fn join(&mut self, connection_id: Uuid, room_id: &str) -> Option<String> {
        if self.room_of(connection_id) == Some(room_id) {
            return None;
        }
        let previous = self.leave(connection_id);
        self.rooms
            .entry(room_id.to_owned())
            .or_default()
            .insert(connection_id);
        self.membership.insert(connection_id, room_id.to_owned());
        previous
    }

    /// Remove `connection_id` from whatever room it occupies. No-op for
    /// non-members.
    pub fn leave(&mut self, connection_id: Uuid) -> Option<String> {
        let room_id = self.membership.remove(&connection_id)?;
        if let Some(members) = self.rooms.get_mut(&room_id) {
            members.remove(&connection_id);
            if members.is_empty() {
                self.rooms.remove(&room_id);
            }
        }
        Some(room_id)
    }

    #[must_use]
    pub fn room_of(&self, connection_id: Uuid) -> Option<&str> {
        self.membership.get(&connection_id).map(String::as_str)
    }

    /// Current members of `room_id` (empty for unknown rooms).
    pub fn members_of(&self, room_id: &str) -> impl Iterator<Item = Uuid> + '_ {
        self.rooms.get(room_id).into_iter().flatten().copied()
    }

    #[must_use]
    pub fn member_count(&self, room_id: &str) -> usize {
        self.rooms.get(room_id).map_or(0, HashSet::len)
    }
}
