//! Selectable endpoints within an iodev.

use chorus_proto::ids::NodeId;
use chorus_proto::types::{IonodeInfo, NodeType};

/// One selectable input/output endpoint of a device, e.g. the speaker and
/// the headphone jack of a single sound card. Created on hotplug detection,
/// destroyed on unplug; attribute changes come from the control thread.
#[derive(Debug, Clone)]
pub struct Ionode {
    pub id: NodeId,
    pub node_type: NodeType,
    pub name: String,
    pub plugged: bool,
    pub priority: u32,
    pub volume: u32,
    pub capture_gain: i32,
    pub active: bool,
    pub left_right_swapped: bool,
}

impl Ionode {
    pub fn new(id: NodeId, node_type: NodeType, name: impl Into<String>) -> Self {
        Self {
            id,
            node_type,
            name: name.into(),
            plugged: false,
            priority: 0,
            volume: 100,
            capture_gain: 0,
            active: false,
            left_right_swapped: false,
        }
    }

    pub fn plugged(mut self, plugged: bool) -> Self {
        self.plugged = plugged;
        self
    }

    pub fn priority(mut self, priority: u32) -> Self {
        self.priority = priority;
        self
    }

    pub fn info(&self) -> IonodeInfo {
        IonodeInfo {
            id: self.id,
            node_type: self.node_type,
            name: self.name.clone(),
            plugged: self.plugged,
            active: self.active,
            priority: self.priority,
            volume: self.volume,
            capture_gain: self.capture_gain,
            left_right_swapped: self.left_right_swapped,
        }
    }
}
