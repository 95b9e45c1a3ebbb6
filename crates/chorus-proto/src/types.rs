use serde::{Deserialize, Serialize};

use crate::ids::NodeId;

/// Direction of an audio stream or device, seen from the daemon.
///
/// Unknown wire values fail to decode and are treated as protocol errors;
/// there is deliberately no duplex variant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    /// Samples flow client -> daemon -> device.
    Output,
    /// Samples flow device -> daemon -> client.
    Input,
}

impl Direction {
    pub fn is_output(self) -> bool {
        matches!(self, Direction::Output)
    }

    pub fn is_input(self) -> bool {
        matches!(self, Direction::Input)
    }
}

/// Per-stream behavior flags.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct StreamFlags(u32);

impl StreamFlags {
    pub const NONE: StreamFlags = StreamFlags(0);
    /// Always-on detection stream; wakes are driven by its socket once the
    /// shared buffer holds a full callback of samples.
    pub const HOTWORD: StreamFlags = StreamFlags(1 << 0);

    pub fn contains(self, other: StreamFlags) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn bits(self) -> u32 {
        self.0
    }
}

impl std::ops::BitOr for StreamFlags {
    type Output = StreamFlags;

    fn bitor(self, rhs: StreamFlags) -> StreamFlags {
        StreamFlags(self.0 | rhs.0)
    }
}

/// Kind of endpoint an ionode represents.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeType {
    InternalSpeaker,
    Headphone,
    InternalMic,
    Mic,
    Hotword,
    PostMixLoopback,
    PostDspLoopback,
    Unknown,
}

/// Node attribute mutated by `SetNodeAttr`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeAttr {
    Plugged,
    Volume,
    CaptureGain,
    SwapLeftRight,
}

/// Device summary published to clients.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IodevInfo {
    pub index: u32,
    pub name: String,
    pub direction: Direction,
}

/// Node summary published to clients.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IonodeInfo {
    pub id: NodeId,
    pub node_type: NodeType,
    pub name: String,
    pub plugged: bool,
    pub active: bool,
    pub priority: u32,
    pub volume: u32,
    pub capture_gain: i32,
    pub left_right_swapped: bool,
}
