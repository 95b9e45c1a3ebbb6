//! Control-side registry of live streams.
//!
//! Holds metadata only; the live `Rstream` (shm mapping, audio socket)
//! is owned by the audio thread while the stream is attached.

use std::collections::HashMap;
use std::path::PathBuf;

use chorus_proto::ids::{ClientId, StreamId};
use chorus_proto::types::Direction;

#[derive(Debug, Clone)]
pub struct StreamEntry {
    pub id: StreamId,
    pub client_id: ClientId,
    pub direction: Direction,
    pub shm_path: PathBuf,
    pub buffer_frames: u32,
    pub cb_threshold: u32,
}

#[derive(Default)]
pub struct StreamList {
    entries: HashMap<StreamId, StreamEntry>,
}

impl StreamList {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, entry: StreamEntry) {
        self.entries.insert(entry.id, entry);
    }

    pub fn remove(&mut self, id: StreamId) -> Option<StreamEntry> {
        self.entries.remove(&id)
    }

    pub fn get(&self, id: StreamId) -> Option<&StreamEntry> {
        self.entries.get(&id)
    }

    pub fn contains(&self, id: StreamId) -> bool {
        self.entries.contains_key(&id)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn ids_for_client(&self, client_id: ClientId) -> Vec<StreamId> {
        self.entries
            .keys()
            .copied()
            .filter(|id| id.client_id() == client_id)
            .collect()
    }

    pub fn owner_of(&self, id: StreamId) -> Option<ClientId> {
        self.entries.get(&id).map(|e| e.client_id)
    }
}
