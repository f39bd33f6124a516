//! Tracks the participants spawned into the current world and remembers
//! which one is the local player.

use std::collections::HashMap;

use crate::text::TextRecord;

pub const NO_LOCAL_NET_ID: i32 = -1;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Participant {
    pub net_id: i32,
    pub user_id: i32,
    pub name: String,
    pub kind: String,
    pub spawn_tag: String,
}

impl Participant {
    /// Parses the pipe-record payload of an `OnSpawn` call. Participants
    /// without a non-negative `netID` are rejected.
    pub fn from_spawn_record(record: &TextRecord) -> Option<Self> {
        let net_id = record.get_int("netID", 0, -1);
        if net_id < 0 {
            return None;
        }
        Some(Self {
            net_id: net_id as i32,
            user_id: record.get_int("userID", 0, 0) as i32,
            name: record.get("name", 0).to_string(),
            kind: record.get("type", 0).to_string(),
            spawn_tag: record.get("spawn", 0).to_string(),
        })
    }

    pub fn is_local(&self) -> bool {
        self.kind == "local"
    }
}

#[derive(Debug)]
pub struct World {
    participants: HashMap<i32, Participant>,
    local_net_id: i32,
}

impl Default for World {
    fn default() -> Self {
        Self::new()
    }
}

impl World {
    pub fn new() -> Self {
        Self {
            participants: HashMap::new(),
            local_net_id: NO_LOCAL_NET_ID,
        }
    }

    /// Inserts or overwrites the participant keyed by its net-id.
    pub fn on_spawn(&mut self, participant: Participant) {
        if participant.is_local() {
            self.local_net_id = participant.net_id;
        }
        self.participants
            .insert(participant.net_id, participant);
    }

    pub fn on_remove(&mut self, net_id: i32) {
        self.participants.remove(&net_id);
        if self.local_net_id == net_id {
            self.local_net_id = NO_LOCAL_NET_ID;
        }
    }

    pub fn clear(&mut self) {
        self.participants.clear();
        self.local_net_id = NO_LOCAL_NET_ID;
    }

    pub fn local_net_id(&self) -> i32 {
        self.local_net_id
    }

    pub fn get(&self, net_id: i32) -> Option<&Participant> {
        self.participants.get(&net_id)
    }

    pub fn len(&self) -> usize {
        self.participants.len()
    }

    pub fn is_empty(&self) -> bool {
        self.participants.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Participant> {
        self.participants.values()
    }
}
