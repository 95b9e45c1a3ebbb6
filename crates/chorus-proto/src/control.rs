//! Control-channel message set.
//!
//! `ServerMessage` travels client -> daemon, `ClientMessage` daemon ->
//! client, both inside [`crate::frame`] frames. Wire ids are stable; new
//! messages get new ids, existing ids are never reused.

use serde::{Deserialize, Serialize};

use chorus_dsp::format::AudioFormat;

use crate::frame::FramedMessage;
use crate::ids::{ClientId, NodeId, StreamId};
use crate::types::{Direction, IodevInfo, IonodeInfo, NodeAttr, StreamFlags};

/// Messages a client sends to the daemon.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ServerMessage {
    /// Request a new audio stream. The stream id is allocated by the client
    /// from its own id space; the daemon validates the client half.
    ConnectStream {
        stream_id: StreamId,
        direction: Direction,
        format: AudioFormat,
        buffer_frames: u32,
        cb_threshold: u32,
        min_cb_level: u32,
        flags: StreamFlags,
    },
    DisconnectStream {
        stream_id: StreamId,
    },
    /// Pin every stream of `stream_type` to the given device.
    SwitchStreamTypeIodev {
        stream_type: u32,
        iodev_index: u32,
    },
    SetSystemVolume {
        volume: u32,
    },
    SetSystemMute {
        mute: bool,
    },
    SetSystemMuteLocked {
        locked: bool,
    },
    SetSystemCaptureGain {
        gain: i32,
    },
    SetSystemCaptureMute {
        mute: bool,
    },
    SetSystemCaptureMuteLocked {
        locked: bool,
    },
    ReloadDsp,
    DumpDsp,
    SelectNode {
        direction: Direction,
        node_id: NodeId,
    },
    SetNodeAttr {
        node_id: NodeId,
        attr: NodeAttr,
        value: i32,
    },
    SetNodeVolume {
        node_id: NodeId,
        volume: u32,
    },
}

impl FramedMessage for ServerMessage {
    fn id(&self) -> u32 {
        match self {
            ServerMessage::ConnectStream { .. } => 1,
            ServerMessage::DisconnectStream { .. } => 2,
            ServerMessage::SwitchStreamTypeIodev { .. } => 3,
            ServerMessage::SetSystemVolume { .. } => 4,
            ServerMessage::SetSystemMute { .. } => 5,
            ServerMessage::SetSystemMuteLocked { .. } => 6,
            ServerMessage::SetSystemCaptureGain { .. } => 7,
            ServerMessage::SetSystemCaptureMute { .. } => 8,
            ServerMessage::SetSystemCaptureMuteLocked { .. } => 9,
            ServerMessage::ReloadDsp => 10,
            ServerMessage::DumpDsp => 11,
            ServerMessage::SelectNode { .. } => 12,
            ServerMessage::SetNodeAttr { .. } => 13,
            ServerMessage::SetNodeVolume { .. } => 14,
        }
    }
}

/// Messages the daemon sends to a client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ClientMessage {
    /// First message on a fresh connection; carries the assigned client id.
    Connected {
        client_id: ClientId,
    },
    /// Reply to `ConnectStream`. `err` is zero on success; on failure the
    /// remaining fields are defaulted and the stream does not exist.
    StreamConnected {
        err: i32,
        stream_id: StreamId,
        format: AudioFormat,
        shm_key: String,
        shm_max_size: u64,
        buffer_frames: u32,
        cb_threshold: u32,
    },
    /// The stream lost its device and was moved; the client should tear
    /// down and re-create its side.
    StreamReattach {
        stream_id: StreamId,
    },
    IodevList {
        devices: Vec<IodevInfo>,
        nodes: Vec<IonodeInfo>,
    },
    VolumeUpdate {
        volume: u32,
        muted: bool,
        mute_locked: bool,
        capture_gain: i32,
        capture_muted: bool,
        capture_mute_locked: bool,
    },
    ClientListUpdate {
        clients: Vec<ClientId>,
    },
    /// Reply to `DumpDsp` with a human-readable description of the active
    /// DSP configuration.
    DspDump {
        dump: String,
    },
}

impl FramedMessage for ClientMessage {
    fn id(&self) -> u32 {
        match self {
            ClientMessage::Connected { .. } => 100,
            ClientMessage::StreamConnected { .. } => 101,
            ClientMessage::StreamReattach { .. } => 102,
            ClientMessage::IodevList { .. } => 103,
            ClientMessage::VolumeUpdate { .. } => 104,
            ClientMessage::ClientListUpdate { .. } => 105,
            ClientMessage::DspDump { .. } => 106,
        }
    }
}

#[cfg(test)]
mod tests {
    use chorus_dsp::format::{AudioFormat, SampleFormat};

    use crate::frame::{decode_frame, encode_frame, FrameBuffer};
    use crate::ids::StreamId;
    use crate::types::{Direction, StreamFlags};

    use super::{ClientMessage, ServerMessage};

    #[test]
    fn connect_stream_round_trip() {
        let msg = ServerMessage::ConnectStream {
            stream_id: StreamId::new(2, 1),
            direction: Direction::Output,
            format: AudioFormat::new(SampleFormat::S16LE, 48000, 2),
            buffer_frames: 2048,
            cb_threshold: 1024,
            min_cb_level: 1024,
            flags: StreamFlags::NONE,
        };
        let frame = encode_frame(&msg).unwrap();
        let mut buf = FrameBuffer::new();
        buf.extend_from_slice(&frame);
        let (id, body) = buf.next_frame().unwrap().unwrap();
        assert_eq!(id, 1);
        assert_eq!(decode_frame::<ServerMessage>(id, &body).unwrap(), msg);
    }

    #[test]
    fn stream_connected_round_trip() {
        let msg = ClientMessage::StreamConnected {
            err: 0,
            stream_id: StreamId::new(1, 1),
            format: AudioFormat::new(SampleFormat::S16LE, 44100, 2),
            shm_key: "stream-10001".to_string(),
            shm_max_size: 16384,
            buffer_frames: 2048,
            cb_threshold: 1024,
        };
        let frame = encode_frame(&msg).unwrap();
        let mut buf = FrameBuffer::new();
        buf.extend_from_slice(&frame);
        let (id, body) = buf.next_frame().unwrap().unwrap();
        assert_eq!(id, 101);
        assert_eq!(decode_frame::<ClientMessage>(id, &body).unwrap(), msg);
    }
}
