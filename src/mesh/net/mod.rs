use std::fmt;

use rkyv::{Archive, Deserialize, Serialize};

pub mod channel;
pub mod error;
pub mod link;
pub mod router;
pub mod wire;

/// Hard ceiling on mesh population, two chassis of eight.
pub const MAX_NODES: usize = 16;
pub const NODES_PER_PARTITION: u8 = 8;
/// A channel is one or two parallel cables between the same pair of nodes.
pub const MAX_LINKS_PER_CHANNEL: usize = 2;
/// Hardware data paths each link can demultiplex inbound traffic onto.
pub const DATA_PATHS_PER_LINK: usize = 4;

pub type RegionId = u32;

/// One participant in the mesh. The extended id `partition * 8 + rank` is
/// what goes on the wire and what orders the two ends of a channel into
/// principal and agent roles.
#[derive(
    Archive, Serialize, Deserialize, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Debug,
)]
#[archive(check_bytes)]
pub struct NodeId(u8);

impl NodeId {
    pub fn new(partition: u8, rank: u8) -> Self {
        Self(partition * NODES_PER_PARTITION + rank)
    }

    pub fn from_extended(extended: u8) -> Self {
        Self(extended)
    }

    pub fn extended(self) -> u8 {
        self.0
    }

    pub fn partition(self) -> u8 {
        self.0 / NODES_PER_PARTITION
    }

    pub fn rank(self) -> u8 {
        self.0 % NODES_PER_PARTITION
    }

    pub fn index(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.partition(), self.rank())
    }
}

/// A set of nodes as a bitmask over extended ids.
#[derive(Clone, Copy, PartialEq, Eq, Debug, Default)]
pub struct NodeMask(u16);

impl NodeMask {
    pub fn empty() -> Self {
        Self(0)
    }

    /// Every node below `node_count`.
    pub fn all(node_count: usize) -> Self {
        debug_assert!(node_count <= MAX_NODES);
        if node_count == MAX_NODES {
            Self(u16::MAX)
        } else {
            Self((1u16 << node_count) - 1)
        }
    }

    pub fn single(node: NodeId) -> Self {
        Self(1 << node.index())
    }

    pub fn insert(&mut self, node: NodeId) {
        self.0 |= 1 << node.index();
    }

    pub fn remove(&mut self, node: NodeId) {
        self.0 &= !(1 << node.index());
    }

    pub fn contains(self, node: NodeId) -> bool {
        self.0 & (1 << node.index()) != 0
    }

    pub fn is_empty(self) -> bool {
        self.0 == 0
    }

    pub fn len(self) -> usize {
        self.0.count_ones() as usize
    }

    pub fn iter(self) -> impl Iterator<Item = NodeId> {
        (0..MAX_NODES as u8)
            .filter(move |i| self.0 & (1 << i) != 0)
            .map(NodeId::from_extended)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extended_id_round_trip() {
        let node = NodeId::new(1, 3);
        assert_eq!(node.extended(), 11);
        assert_eq!(node.partition(), 1);
        assert_eq!(node.rank(), 3);
        assert_eq!(NodeId::from_extended(11), node);
    }

    #[test]
    fn mask_membership() {
        let mut mask = NodeMask::all(4);
        assert_eq!(mask.len(), 4);
        mask.remove(NodeId::new(0, 2));
        assert!(!mask.contains(NodeId::new(0, 2)));
        assert_eq!(mask.iter().count(), 3);
    }
}
