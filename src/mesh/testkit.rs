//! In-process mesh builder for tests: N fabrics cabled with memory links.

use std::sync::Arc;
use std::time::Duration;

use super::config::FabricConfig;
use super::fabric::Fabric;
use super::net::link::MemoryLink;
use super::net::NodeId;

pub const TEST_MTU: usize = 16;
pub const TEST_QUEUE: usize = 1 << 16;

pub struct TestMesh {
    pub fabrics: Vec<Fabric>,
    /// Link pairs in registration order, one entry per (cable, link slot);
    /// `.0` belongs to the lower-numbered node.
    pub links: Vec<(Arc<MemoryLink>, Arc<MemoryLink>)>,
}

impl TestMesh {
    /// Nodes 0..n cabled in a line: 0-1, 1-2, ...
    pub async fn line(n: usize, links_per_channel: usize) -> Self {
        let cabling: Vec<_> = (0..n - 1)
            .map(|i| (NodeId::from_extended(i as u8), NodeId::from_extended(i as u8 + 1)))
            .collect();
        Self::build(n, links_per_channel, cabling).await
    }

    /// Every pair directly cabled.
    pub async fn full(n: usize, links_per_channel: usize) -> Self {
        let mut cabling = Vec::new();
        for a in 0..n {
            for b in a + 1..n {
                cabling.push((NodeId::from_extended(a as u8), NodeId::from_extended(b as u8)));
            }
        }
        Self::build(n, links_per_channel, cabling).await
    }

    pub async fn build(n: usize, links_per_channel: usize, cabling: Vec<(NodeId, NodeId)>) -> Self {
        let fabrics: Vec<Fabric> = (0..n)
            .map(|i| {
                let config = FabricConfig::builder()
                    .local(NodeId::from_extended(i as u8))
                    .chassis_serial("test-chassis".into())
                    .node_count(n)
                    .cabling(cabling.clone())
                    .links_per_channel(links_per_channel)
                    .max_wait(Duration::from_secs(2))
                    .poll_interval(Duration::from_millis(1))
                    .build();
                Fabric::new(config).unwrap()
            })
            .collect();

        let mut links = Vec::new();
        for &(a, b) in &cabling {
            for _ in 0..links_per_channel {
                let (la, lb) = MemoryLink::pair(TEST_MTU, TEST_QUEUE);
                fabrics[a.index()].register_link(la.clone()).unwrap();
                fabrics[b.index()].register_link(lb.clone()).unwrap();
                links.push((la, lb));
            }
        }

        for &(a, b) in &cabling {
            fabrics[a.index()]
                .wait_channel_verified(b, Duration::from_secs(2))
                .await
                .unwrap();
            fabrics[b.index()]
                .wait_channel_verified(a, Duration::from_secs(2))
                .await
                .unwrap();
        }
        Self { fabrics, links }
    }

    pub fn claim_all(&self) {
        for fabric in &self.fabrics {
            fabric.claim().unwrap();
        }
    }
}
