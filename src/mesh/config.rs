use std::time::Duration;

use arrayref::array_ref;
use petgraph::algo::astar;
use petgraph::prelude::UnGraphMap;
use typed_builder::TypedBuilder;

use super::net::error::Error;
use super::net::{NodeId, MAX_LINKS_PER_CHANNEL, MAX_NODES};

/// Static description of one fabric instance. Identical cabling must be
/// configured on every node; routing and relay planning depend on all
/// participants deriving the same paths from it.
#[derive(Clone, TypedBuilder)]
pub struct FabricConfig {
    pub local: NodeId,
    /// Serial of the chassis this node sits in; the hardware node id is
    /// derived from it.
    pub chassis_serial: String,
    pub node_count: usize,
    /// Directly cabled node pairs.
    pub cabling: Vec<(NodeId, NodeId)>,
    #[builder(default = 1)]
    pub links_per_channel: usize,
    /// Budget for every blocking client-facing wait.
    #[builder(default = Duration::from_secs(5))]
    pub max_wait: Duration,
    #[builder(default = Duration::from_millis(1))]
    pub poll_interval: Duration,
    /// Bytes allowed to sit prepared in the transport queue per direction.
    #[builder(default = 1 << 20)]
    pub inflight_limit: usize,
    /// Relay pipeline group size when the client does not override it.
    #[builder(default = 8)]
    pub chain_group: usize,
    #[builder(default = 256)]
    pub forward_pool: usize,
    #[builder(default = 64)]
    pub chain_pool: usize,
}

impl FabricConfig {
    /// Bad geometry is rejected here, synchronously, never coerced.
    pub fn validate(&self) -> Result<(), Error> {
        if self.node_count == 0 || self.node_count > MAX_NODES {
            return Err(Error::TooManyNodes(self.node_count));
        }
        if self.local.index() >= self.node_count {
            return Err(Error::InvalidArgument("local node outside the mesh"));
        }
        if self.links_per_channel == 0 || self.links_per_channel > MAX_LINKS_PER_CHANNEL {
            return Err(Error::UnsupportedLinkCount(self.links_per_channel));
        }
        if self.chain_group == 0 || self.forward_pool == 0 || self.chain_pool == 0 {
            return Err(Error::InvalidArgument("zero-sized pipeline pool"));
        }
        for &(a, b) in &self.cabling {
            if a == b || a.index() >= self.node_count || b.index() >= self.node_count {
                return Err(Error::InvalidArgument("cabling references an invalid node"));
            }
        }
        Ok(())
    }

    /// Hardware node id: truncated digest of the chassis serial and rank.
    pub fn hardware_id(&self) -> u64 {
        let mut hasher = blake3::Hasher::new();
        hasher.update(self.chassis_serial.as_bytes());
        hasher.update(&[self.local.extended()]);
        let digest = hasher.finalize();
        u64::from_le_bytes(*array_ref![digest.as_bytes(), 0, 8])
    }

    fn graph(&self) -> UnGraphMap<u8, ()> {
        let mut graph = UnGraphMap::new();
        for i in 0..self.node_count {
            graph.add_node(i as u8);
        }
        for &(a, b) in &self.cabling {
            graph.add_edge(a.extended(), b.extended(), ());
        }
        graph
    }

    /// Shortest cabling path between two nodes, endpoints included. Every
    /// node derives the same paths because every node carries the same
    /// cabling list, which is what lets relays pick their legs without
    /// negotiation.
    pub fn shortest_path(&self, from: NodeId, to: NodeId) -> Option<Vec<NodeId>> {
        if from == to {
            return Some(vec![from]);
        }
        let graph = self.graph();
        let (_, path) = astar(
            &graph,
            from.extended(),
            |n| n == to.extended(),
            |_| 1u32,
            |_| 0,
        )?;
        Some(path.into_iter().map(NodeId::from_extended).collect())
    }

    /// First hop on the path toward `to`.
    pub fn next_hop(&self, from: NodeId, to: NodeId) -> Option<NodeId> {
        self.shortest_path(from, to)
            .and_then(|p| p.get(1).copied())
    }

    /// Hop-count cost matrix over the cabling graph; `u32::MAX` marks an
    /// unreachable pair.
    pub fn ensemble_map(&self) -> Vec<Vec<u32>> {
        let graph = self.graph();
        (0..self.node_count)
            .map(|a| {
                (0..self.node_count)
                    .map(|b| {
                        if a == b {
                            return 0;
                        }
                        astar(&graph, a as u8, |n| n == b as u8, |_| 1u32, |_| 0)
                            .map_or(u32::MAX, |(cost, _)| cost)
                    })
                    .collect()
            })
            .collect()
    }
}
