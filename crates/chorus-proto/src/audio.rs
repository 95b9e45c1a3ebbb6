//! Fixed-size records exchanged on the per-stream audio socket.
//!
//! The audio side-channel carries exactly one record shape in both
//! directions, so a reader can always issue a fixed-size read. Records are
//! 12 bytes: `{id: u32, error: i32, frames: u32}`, little endian.

use crate::error::ProtoError;

/// Wire size of one [`AudioMessage`].
pub const AUDIO_MESSAGE_LEN: usize = 12;

/// Kind of audio-socket record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AudioMessageId {
    /// Daemon -> client: fill `frames` frames of playback data.
    RequestData,
    /// Client -> daemon (playback) or daemon -> client (capture): `frames`
    /// frames are ready in shared memory.
    DataReady,
}

impl AudioMessageId {
    fn to_wire(self) -> u32 {
        match self {
            AudioMessageId::RequestData => 1,
            AudioMessageId::DataReady => 2,
        }
    }

    fn from_wire(value: u32) -> Option<Self> {
        match value {
            1 => Some(AudioMessageId::RequestData),
            2 => Some(AudioMessageId::DataReady),
            _ => None,
        }
    }
}

/// One audio side-channel record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AudioMessage {
    pub id: AudioMessageId,
    pub error: i32,
    pub frames: u32,
}

impl AudioMessage {
    pub fn request_data(frames: u32) -> Self {
        Self {
            id: AudioMessageId::RequestData,
            error: 0,
            frames,
        }
    }

    pub fn data_ready(frames: u32) -> Self {
        Self {
            id: AudioMessageId::DataReady,
            error: 0,
            frames,
        }
    }

    pub fn encode(&self) -> [u8; AUDIO_MESSAGE_LEN] {
        let mut out = [0u8; AUDIO_MESSAGE_LEN];
        out[0..4].copy_from_slice(&self.id.to_wire().to_le_bytes());
        out[4..8].copy_from_slice(&self.error.to_le_bytes());
        out[8..12].copy_from_slice(&self.frames.to_le_bytes());
        out
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, ProtoError> {
        if bytes.len() < AUDIO_MESSAGE_LEN {
            return Err(ProtoError::Truncated {
                got: bytes.len(),
                want: AUDIO_MESSAGE_LEN,
            });
        }
        let raw_id = u32::from_le_bytes(bytes[0..4].try_into().unwrap());
        let id = AudioMessageId::from_wire(raw_id).ok_or(ProtoError::IdMismatch {
            header_id: raw_id,
            message_id: 0,
        })?;
        Ok(Self {
            id,
            error: i32::from_le_bytes(bytes[4..8].try_into().unwrap()),
            frames: u32::from_le_bytes(bytes[8..12].try_into().unwrap()),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::{AudioMessage, AudioMessageId, AUDIO_MESSAGE_LEN};

    #[test]
    fn audio_message_round_trip() {
        let msg = AudioMessage::data_ready(480);
        let bytes = msg.encode();
        assert_eq!(bytes.len(), AUDIO_MESSAGE_LEN);
        assert_eq!(AudioMessage::decode(&bytes).unwrap(), msg);
    }

    #[test]
    fn request_data_encodes_frames() {
        let bytes = AudioMessage::request_data(1024).encode();
        let msg = AudioMessage::decode(&bytes).unwrap();
        assert_eq!(msg.id, AudioMessageId::RequestData);
        assert_eq!(msg.frames, 1024);
        assert_eq!(msg.error, 0);
    }

    #[test]
    fn truncated_record_is_refused() {
        let bytes = AudioMessage::data_ready(1).encode();
        assert!(AudioMessage::decode(&bytes[..11]).is_err());
    }

    #[test]
    fn unknown_id_is_refused() {
        let mut bytes = AudioMessage::data_ready(1).encode();
        bytes[0] = 0xff;
        assert!(AudioMessage::decode(&bytes).is_err());
    }
}
