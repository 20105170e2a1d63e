use std::time::Duration;

use plexus::mesh::config::FabricConfig;
use plexus::mesh::fabric::Fabric;
use plexus::mesh::net::link::MemoryLink;
use plexus::mesh::net::NodeId;
use tracing::info;

/// Brings up a two-node mesh over in-process links, runs one
/// broadcast-and-gather round and a barrier, and prints what landed.
#[tokio::main]
async fn main() {
    tracing_subscriber::fmt::init();

    let node_a = NodeId::new(0, 0);
    let node_b = NodeId::new(0, 1);
    let cabling = vec![(node_a, node_b)];

    let fabric = |local: NodeId, serial: &str| {
        let config = FabricConfig::builder()
            .local(local)
            .chassis_serial(serial.into())
            .node_count(2)
            .cabling(cabling.clone())
            .links_per_channel(2)
            .max_wait(Duration::from_secs(2))
            .build();
        Fabric::new(config).unwrap()
    };
    let a = fabric(node_a, "chassis-a");
    let b = fabric(node_b, "chassis-a");

    for _ in 0..2 {
        let (la, lb) = MemoryLink::pair(4096, 1 << 20);
        a.register_link(la).unwrap();
        b.register_link(lb).unwrap();
    }
    a.wait_channel_verified(node_b, Duration::from_secs(2))
        .await
        .unwrap();
    b.wait_channel_verified(node_a, Duration::from_secs(2))
        .await
        .unwrap();
    info!("channels verified");

    a.claim().unwrap();
    b.claim().unwrap();

    let (size, block, chunk) = (8192u64, 4096u64, 1024u32);
    let seed = |node: NodeId| {
        let mut buf = vec![0u8; size as usize];
        let start = node.index() * block as usize;
        for (i, byte) in buf[start..start + block as usize].iter_mut().enumerate() {
            *byte = (i as u8).wrapping_add(node.extended());
        }
        vec![buf]
    };
    let set_a = a.setup_buffers(1, size, block, chunk, seed(node_a)).unwrap();
    let set_b = b.setup_buffers(1, size, block, chunk, seed(node_b)).unwrap();

    let (ra, rb) = tokio::join!(
        a.assign_buffers_to_readers(&set_a, 4),
        b.assign_buffers_to_readers(&set_b, 4),
    );
    ra.unwrap();
    rb.unwrap();

    let (ra, rb) = tokio::join!(a.broadcast_and_gather(&set_a), b.broadcast_and_gather(&set_b));
    let (idx_a, idx_b) = (ra.unwrap(), rb.unwrap());
    info!(idx_a, idx_b, "broadcast round complete");

    for (name, set) in [("a", &set_a), ("b", &set_b)] {
        let bytes = set.region(0).read(0, size as usize);
        let digest = blake3::hash(&bytes);
        info!(node = name, digest = %digest.to_hex(), "gathered buffer");
    }

    let (ra, rb) = tokio::join!(a.barrier(), b.barrier());
    ra.unwrap();
    rb.unwrap();
    info!("barrier passed, mesh idle");

    a.release_claim().unwrap();
    b.release_claim().unwrap();
}
