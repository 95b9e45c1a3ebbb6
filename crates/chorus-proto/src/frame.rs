//! Length-prefixed control-message framing.
//!
//! Every control frame starts with a fixed header: a 4-byte little-endian
//! total length (header included) followed by a 4-byte little-endian message
//! id. The body is a postcard-encoded message whose own id must agree with
//! the header; frames with an inconsistent declared length or id are refused
//! rather than best-effort parsed.

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::error::ProtoError;

/// Size of the `{length, id}` frame header.
pub const FRAME_HEADER_LEN: usize = 8;

/// Sanity limit for a single control frame. Control messages are small;
/// anything near this size is a corrupt or hostile peer.
pub const MAX_FRAME_LEN: usize = 64 * 1024;

/// A message that travels inside a control frame.
pub trait FramedMessage: Serialize + DeserializeOwned {
    /// Stable wire id of this message.
    fn id(&self) -> u32;
}

/// Encode `msg` into a complete frame.
pub fn encode_frame<M: FramedMessage>(msg: &M) -> Result<Vec<u8>, ProtoError> {
    let body = postcard::to_stdvec(msg)?;
    let total = FRAME_HEADER_LEN + body.len();
    if total > MAX_FRAME_LEN {
        return Err(ProtoError::FrameTooLarge {
            len: total,
            max: MAX_FRAME_LEN,
        });
    }
    let mut frame = Vec::with_capacity(total);
    frame.extend_from_slice(&(total as u32).to_le_bytes());
    frame.extend_from_slice(&msg.id().to_le_bytes());
    frame.extend_from_slice(&body);
    Ok(frame)
}

/// Decode one complete frame body that was split off by [`FrameBuffer`].
pub fn decode_frame<M: FramedMessage>(header_id: u32, body: &[u8]) -> Result<M, ProtoError> {
    let msg: M = postcard::from_bytes(body)?;
    if msg.id() != header_id {
        return Err(ProtoError::IdMismatch {
            header_id,
            message_id: msg.id(),
        });
    }
    Ok(msg)
}

/// Reassembly buffer for a byte-stream transport.
///
/// Stream sockets deliver partial frames; bytes are appended as they arrive
/// and complete frames are popped off the front.
#[derive(Default)]
pub struct FrameBuffer {
    buf: Vec<u8>,
}

impl FrameBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn extend_from_slice(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    /// Pop the next complete frame, returning its header id and body bytes.
    ///
    /// Returns `Ok(None)` while the frame is still incomplete. A frame with
    /// an invalid declared length poisons the connection and is returned as
    /// an error; the caller is expected to drop the peer.
    pub fn next_frame(&mut self) -> Result<Option<(u32, Vec<u8>)>, ProtoError> {
        if self.buf.len() < FRAME_HEADER_LEN {
            return Ok(None);
        }
        let total = u32::from_le_bytes(self.buf[0..4].try_into().unwrap()) as usize;
        if total < FRAME_HEADER_LEN {
            return Err(ProtoError::FrameTooShort { len: total });
        }
        if total > MAX_FRAME_LEN {
            return Err(ProtoError::FrameTooLarge {
                len: total,
                max: MAX_FRAME_LEN,
            });
        }
        if self.buf.len() < total {
            return Ok(None);
        }
        let id = u32::from_le_bytes(self.buf[4..8].try_into().unwrap());
        let body = self.buf[FRAME_HEADER_LEN..total].to_vec();
        self.buf.drain(..total);
        Ok(Some((id, body)))
    }
}
