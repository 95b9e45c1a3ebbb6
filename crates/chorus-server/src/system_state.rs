//! System-wide audio state, published through the server-state shm.
//!
//! The control thread is the single writer; every mutation goes through the
//! region's sequence lock so clients always read a consistent snapshot.

use std::time::{SystemTime, UNIX_EPOCH};

use chorus_proto::ids::ClientId;
use chorus_shm::server_state::{ServerStateData, MAX_ATTACHED_CLIENTS};
use chorus_shm::ServerStateShm;

use crate::error::ServerError;

pub const MAX_VOLUME: u32 = 100;
const MIN_CAPTURE_GAIN: i32 = -5000;
const MAX_CAPTURE_GAIN: i32 = 5000;

pub struct SystemState {
    shm: ServerStateShm,
}

impl SystemState {
    pub fn new(shm: ServerStateShm) -> Self {
        let mut state = Self { shm };
        state.shm.update(|data| {
            data.volume = MAX_VOLUME;
        });
        state
    }

    pub fn snapshot(&self) -> ServerStateData {
        self.shm.snapshot()
    }

    pub fn update<R>(&mut self, mutate: impl FnOnce(&mut ServerStateData) -> R) -> R {
        self.shm.update(mutate)
    }

    /// Set the system volume, clamped to `[0, MAX_VOLUME]`.
    pub fn set_volume(&mut self, volume: u32) {
        let volume = volume.min(MAX_VOLUME);
        self.shm.update(|data| data.volume = volume);
    }

    pub fn volume(&self) -> u32 {
        self.snapshot().volume
    }

    /// Returns false when the mute state is locked and unchanged.
    pub fn set_mute(&mut self, mute: bool) -> bool {
        self.shm.update(|data| {
            if data.mute_locked != 0 {
                return false;
            }
            data.mute = u32::from(mute);
            true
        })
    }

    pub fn set_mute_locked(&mut self, locked: bool) {
        self.shm.update(|data| data.mute_locked = u32::from(locked));
    }

    pub fn muted(&self) -> bool {
        self.snapshot().mute != 0
    }

    /// Capture gain in hundredths of dB, clamped to the supported range.
    pub fn set_capture_gain(&mut self, gain: i32) -> Result<(), ServerError> {
        let gain = gain.clamp(MIN_CAPTURE_GAIN, MAX_CAPTURE_GAIN);
        self.shm.update(|data| data.capture_gain = gain);
        Ok(())
    }

    pub fn set_capture_mute(&mut self, mute: bool) -> bool {
        self.shm.update(|data| {
            if data.capture_mute_locked != 0 {
                return false;
            }
            data.capture_mute = u32::from(mute);
            true
        })
    }

    pub fn set_capture_mute_locked(&mut self, locked: bool) {
        self.shm
            .update(|data| data.capture_mute_locked = u32::from(locked));
    }

    pub fn stream_attached(&mut self) {
        let now = wall_nanos();
        self.shm.update(|data| {
            data.num_streams_attached += 1;
            data.num_active_streams += 1;
            data.last_active_stream_time_nanos = now;
        });
    }

    pub fn stream_detached(&mut self) {
        let now = wall_nanos();
        self.shm.update(|data| {
            data.num_active_streams = data.num_active_streams.saturating_sub(1);
            data.last_active_stream_time_nanos = now;
        });
    }

    pub fn client_attached(&mut self, id: ClientId) {
        self.shm.update(|data| {
            let n = data.num_attached_clients as usize;
            if n < MAX_ATTACHED_CLIENTS {
                data.attached_clients[n] = id;
                data.num_attached_clients += 1;
            }
        });
    }

    pub fn client_detached(&mut self, id: ClientId) {
        self.shm.update(|data| {
            let n = data.num_attached_clients as usize;
            if let Some(pos) = data.attached_clients[..n].iter().position(|&c| c == id) {
                data.attached_clients.copy_within(pos + 1..n, pos);
                data.num_attached_clients -= 1;
            }
        });
    }

    pub fn attached_clients(&self) -> Vec<ClientId> {
        let snap = self.snapshot();
        snap.attached_clients[..snap.num_attached_clients as usize].to_vec()
    }
}

fn wall_nanos() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_nanos() as u64
}
