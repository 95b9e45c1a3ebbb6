use serde::{Deserialize, Serialize};

/// Identifier the control thread assigns to each connected client.
pub type ClientId = u32;

/// Stream identifier, unique across the server.
///
/// Packs the owning client id in the upper half and a per-client counter in
/// the lower half, so a client can allocate ids for new streams without a
/// round trip.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct StreamId(u32);

impl StreamId {
    pub fn new(client_id: ClientId, stream_index: u16) -> Self {
        Self((client_id << 16) | u32::from(stream_index))
    }

    pub fn client_id(self) -> ClientId {
        self.0 >> 16
    }

    pub fn stream_index(self) -> u16 {
        (self.0 & 0xffff) as u16
    }

    pub fn as_u32(self) -> u32 {
        self.0
    }
}

impl From<u32> for StreamId {
    fn from(value: u32) -> Self {
        Self(value)
    }
}

impl std::fmt::Display for StreamId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:x}", self.0)
    }
}

/// Identifier of one selectable endpoint: device index plus node index
/// within that device. Id zero is reserved to mean "no node".
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NodeId(u64);

impl NodeId {
    pub const NONE: NodeId = NodeId(0);

    pub fn new(dev_index: u32, node_index: u32) -> Self {
        Self((u64::from(dev_index) << 32) | u64::from(node_index))
    }

    pub fn dev_index(self) -> u32 {
        (self.0 >> 32) as u32
    }

    pub fn node_index(self) -> u32 {
        (self.0 & 0xffff_ffff) as u32
    }

    pub fn is_none(self) -> bool {
        self.0 == 0
    }

    pub fn as_u64(self) -> u64 {
        self.0
    }
}

impl From<u64> for NodeId {
    fn from(value: u64) -> Self {
        Self(value)
    }
}

impl std::fmt::Display for NodeId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.dev_index(), self.node_index())
    }
}

#[cfg(test)]
mod tests {
    use super::{NodeId, StreamId};

    #[test]
    fn stream_id_packs_client_and_index() {
        let id = StreamId::new(7, 42);
        assert_eq!(id.client_id(), 7);
        assert_eq!(id.stream_index(), 42);
        assert_eq!(StreamId::from(id.as_u32()), id);
    }

    #[test]
    fn node_id_packs_dev_and_node() {
        let id = NodeId::new(3, 1);
        assert_eq!(id.dev_index(), 3);
        assert_eq!(id.node_index(), 1);
        assert!(!id.is_none());
        assert!(NodeId::NONE.is_none());
    }
}
