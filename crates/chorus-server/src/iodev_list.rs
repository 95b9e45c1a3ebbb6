//! Registry of every known device and its nodes.
//!
//! The control thread owns the registry and all node records. A device's
//! driver object lives here while inactive; selecting one of its nodes
//! hands the driver to the audio thread, and unselecting (or suspension)
//! hands it back. Device indices start at 1 so that node id zero stays the
//! reserved "no node" value.

use std::sync::Arc;

use tracing::{info, warn};

use chorus_audio::loopback_iodev::LoopbackRing;
use chorus_audio::{AudioThreadHandle, Iodev, Ionode};
use chorus_proto::ids::NodeId;
use chorus_proto::types::{Direction, IodevInfo, IonodeInfo, NodeAttr};
use chorus_shm::server_state::{set_shm_name, ServerStateData, MAX_IODEVS, MAX_IONODES};

use crate::error::ServerError;

pub struct DeviceRecord {
    pub index: u32,
    pub name: String,
    pub direction: Direction,
    pub nodes: Vec<Ionode>,
    pub active: bool,
    /// Present while the driver is parked here; `None` while the audio
    /// thread owns it.
    dev: Option<Box<dyn Iodev>>,
    loopback: Option<Arc<LoopbackRing>>,
}

pub struct IodevList {
    devices: Vec<DeviceRecord>,
    next_index: u32,
    selected_output: NodeId,
    selected_input: NodeId,
}

impl Default for IodevList {
    fn default() -> Self {
        Self::new()
    }
}

impl IodevList {
    pub fn new() -> Self {
        Self {
            devices: Vec::new(),
            next_index: 1,
            selected_output: NodeId::NONE,
            selected_input: NodeId::NONE,
        }
    }

    /// Register a device. Loopback capture devices carry their tap ring so
    /// activation can register it on the playback path.
    pub fn add_device(
        &mut self,
        dev: Box<dyn Iodev>,
        loopback: Option<Arc<LoopbackRing>>,
    ) -> u32 {
        let index = self.next_index;
        self.next_index += 1;

        let mut nodes: Vec<Ionode> = dev.nodes().to_vec();
        for (i, node) in nodes.iter_mut().enumerate() {
            node.id = NodeId::new(index, i as u32);
        }
        let record = DeviceRecord {
            index,
            name: dev.name().to_string(),
            direction: dev.direction(),
            nodes,
            active: false,
            dev: Some(dev),
            loopback,
        };
        info!(dev = index, name = %record.name, "device registered");
        self.devices.push(record);
        index
    }

    /// Unregister a device, deactivating it first when needed.
    pub fn rm_device(
        &mut self,
        index: u32,
        audio: &AudioThreadHandle,
    ) -> Result<Box<dyn Iodev>, ServerError> {
        let pos = self
            .devices
            .iter()
            .position(|d| d.index == index)
            .ok_or(ServerError::Inval("unknown device"))?;
        if self.devices[pos].active {
            let dev = audio.remove_active_dev(index)?;
            self.devices[pos].dev = Some(dev);
            self.clear_selection_of(index);
        }
        let record = self.devices.remove(pos);
        info!(dev = index, "device unregistered");
        record.dev.ok_or(ServerError::Inval("device driver missing"))
    }

    pub fn selected_node(&self, direction: Direction) -> NodeId {
        match direction {
            Direction::Output => self.selected_output,
            Direction::Input => self.selected_input,
        }
    }

    fn record_mut(&mut self, index: u32) -> Option<&mut DeviceRecord> {
        self.devices.iter_mut().find(|d| d.index == index)
    }

    fn clear_selection_of(&mut self, index: u32) {
        if self.selected_output.dev_index() == index {
            self.selected_output = NodeId::NONE;
        }
        if self.selected_input.dev_index() == index {
            self.selected_input = NodeId::NONE;
        }
    }

    /// Select `node_id` as the preferred endpoint for `direction`,
    /// activating its device on the audio thread. Node id zero unselects.
    pub fn select_node(
        &mut self,
        direction: Direction,
        node_id: NodeId,
        audio: &AudioThreadHandle,
    ) -> Result<(), ServerError> {
        let current = self.selected_node(direction);
        if current == node_id {
            return Ok(());
        }

        // Deactivate the previous selection.
        if !current.is_none() {
            let index = current.dev_index();
            if let Some(record) = self.record_mut(index) {
                if record.active {
                    match audio.remove_active_dev(index) {
                        Ok(dev) => {
                            record.dev = Some(dev);
                            record.active = false;
                        },
                        Err(e) => {
                            warn!(dev = index, error = %e, "deactivation failed");
                        },
                    }
                }
                for node in record.nodes.iter_mut() {
                    node.active = false;
                }
            }
        }
        match direction {
            Direction::Output => self.selected_output = NodeId::NONE,
            Direction::Input => self.selected_input = NodeId::NONE,
        }

        if node_id.is_none() {
            return Ok(());
        }

        let index = node_id.dev_index();
        let node_pos = node_id.node_index() as usize;
        let (dev, loopback) = {
            let record = self
                .record_mut(index)
                .ok_or(ServerError::Inval("unknown device"))?;
            if record.direction != direction {
                return Err(ServerError::Inval("node direction mismatch"));
            }
            if node_pos >= record.nodes.len() {
                return Err(ServerError::Inval("unknown node"));
            }
            let dev = record
                .dev
                .take()
                .ok_or(ServerError::Inval("device already in use"))?;
            (dev, record.loopback.clone())
        };

        match audio.add_active_dev(index, dev, loopback) {
            Ok(()) => {
                if let Some(record) = self.record_mut(index) {
                    record.active = true;
                    record.nodes[node_pos].active = true;
                }
                match direction {
                    Direction::Output => self.selected_output = node_id,
                    Direction::Input => self.selected_input = node_id,
                }
                Ok(())
            },
            Err(e) => {
                warn!(dev = index, error = %e, "activation failed");
                Err(e.into())
            },
        }
    }

    /// Store back a driver the audio thread suspended.
    pub fn on_device_suspended(&mut self, index: u32, dev: Box<dyn Iodev>) {
        self.clear_selection_of(index);
        if let Some(record) = self.record_mut(index) {
            record.dev = Some(dev);
            record.active = false;
            for node in record.nodes.iter_mut() {
                node.active = false;
            }
        }
    }

    fn node_mut(&mut self, node_id: NodeId) -> Option<&mut Ionode> {
        let record = self.record_mut(node_id.dev_index())?;
        record.nodes.get_mut(node_id.node_index() as usize)
    }

    pub fn set_node_attr(
        &mut self,
        node_id: NodeId,
        attr: NodeAttr,
        value: i32,
    ) -> Result<(), ServerError> {
        let node = self
            .node_mut(node_id)
            .ok_or(ServerError::Inval("unknown node"))?;
        match attr {
            NodeAttr::Plugged => node.plugged = value != 0,
            NodeAttr::Volume => node.volume = (value.max(0) as u32).min(100),
            NodeAttr::CaptureGain => node.capture_gain = value,
            NodeAttr::SwapLeftRight => node.left_right_swapped = value != 0,
        }
        Ok(())
    }

    pub fn set_node_volume(&mut self, node_id: NodeId, volume: u32) -> Result<(), ServerError> {
        let node = self
            .node_mut(node_id)
            .ok_or(ServerError::Inval("unknown node"))?;
        node.volume = volume.min(100);
        Ok(())
    }

    /// The plugged node with the highest priority on a device.
    pub fn best_node_of_device(&self, index: u32) -> Option<NodeId> {
        let record = self.devices.iter().find(|d| d.index == index)?;
        record
            .nodes
            .iter()
            .filter(|n| n.plugged)
            .max_by_key(|n| n.priority)
            .map(|n| n.id)
    }

    pub fn device_direction(&self, index: u32) -> Option<Direction> {
        self.devices
            .iter()
            .find(|d| d.index == index)
            .map(|d| d.direction)
    }

    /// Wire-format device and node lists for client broadcast.
    pub fn infos(&self) -> (Vec<IodevInfo>, Vec<IonodeInfo>) {
        let devices = self
            .devices
            .iter()
            .map(|d| IodevInfo {
                index: d.index,
                name: d.name.clone(),
                direction: d.direction,
            })
            .collect();
        let nodes = self
            .devices
            .iter()
            .flat_map(|d| d.nodes.iter().map(|n| n.info()))
            .collect();
        (devices, nodes)
    }

    /// Write device, node and selection data into the server-state shm.
    pub fn publish(&self, data: &mut ServerStateData) {
        data.selected_output_node = self.selected_output.as_u64();
        data.selected_input_node = self.selected_input.as_u64();

        let mut out_devs = 0usize;
        let mut in_devs = 0usize;
        let mut out_nodes = 0usize;
        let mut in_nodes = 0usize;
        for record in self.devices.iter() {
            match record.direction {
                Direction::Output if out_devs < MAX_IODEVS => {
                    let slot = &mut data.output_devs[out_devs];
                    slot.index = record.index;
                    slot.direction = 0;
                    set_shm_name(&mut slot.name, &record.name);
                    out_devs += 1;
                },
                Direction::Input if in_devs < MAX_IODEVS => {
                    let slot = &mut data.input_devs[in_devs];
                    slot.index = record.index;
                    slot.direction = 1;
                    set_shm_name(&mut slot.name, &record.name);
                    in_devs += 1;
                },
                _ => {},
            }
            for node in record.nodes.iter() {
                let (slots, count) = match record.direction {
                    Direction::Output => (&mut data.output_nodes, &mut out_nodes),
                    Direction::Input => (&mut data.input_nodes, &mut in_nodes),
                };
                if *count >= MAX_IONODES {
                    continue;
                }
                let slot = &mut slots[*count];
                slot.id = node.id.as_u64();
                slot.node_type = node.node_type as u32;
                slot.plugged = u32::from(node.plugged);
                slot.active = u32::from(node.active);
                slot.priority = node.priority;
                slot.volume = node.volume;
                slot.capture_gain = node.capture_gain;
                slot.left_right_swapped = u32::from(node.left_right_swapped);
                set_shm_name(&mut slot.name, &node.name);
                *count += 1;
            }
        }
        data.num_output_devs = out_devs as u32;
        data.num_input_devs = in_devs as u32;
        data.num_output_nodes = out_nodes as u32;
        data.num_input_nodes = in_nodes as u32;
    }
}

#[cfg(test)]
mod tests {
    use chorus_audio::empty_iodev::EmptyIodev;
    use chorus_proto::ids::NodeId;
    use chorus_proto::types::{Direction, NodeAttr};

    use super::IodevList;

    #[test]
    fn indices_start_at_one_and_nodes_get_ids() {
        let mut list = IodevList::new();
        let index = list.add_device(Box::new(EmptyIodev::new(Direction::Output)), None);
        assert_eq!(index, 1);
        let (devices, nodes) = list.infos();
        assert_eq!(devices.len(), 1);
        assert_eq!(nodes.len(), 1);
        assert_eq!(nodes[0].id, NodeId::new(1, 0));
        assert!(!nodes[0].id.is_none());
    }

    #[test]
    fn node_attrs_update_records() {
        let mut list = IodevList::new();
        let index = list.add_device(Box::new(EmptyIodev::new(Direction::Input)), None);
        let node_id = NodeId::new(index, 0);
        list.set_node_attr(node_id, NodeAttr::Volume, 250).unwrap();
        list.set_node_volume(node_id, 80).unwrap();
        list.set_node_attr(node_id, NodeAttr::SwapLeftRight, 1).unwrap();
        let (_, nodes) = list.infos();
        assert_eq!(nodes[0].volume, 80);
        assert!(nodes[0].left_right_swapped);
        assert!(list
            .set_node_attr(NodeId::new(99, 0), NodeAttr::Volume, 1)
            .is_err());
    }

    #[test]
    fn best_node_prefers_priority_among_plugged() {
        let mut list = IodevList::new();
        let index = list.add_device(Box::new(EmptyIodev::new(Direction::Output)), None);
        // The empty device exposes one plugged node.
        assert_eq!(list.best_node_of_device(index), Some(NodeId::new(index, 0)));
        assert_eq!(list.best_node_of_device(777), None);
    }
}
