use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use hashbrown::HashSet;
use tracing::debug;

use super::fabric::{poll_until, Fabric};
use super::forward::{LegSpec, OutLeg};
use super::net::error::Error;
use super::net::link::Link;
use super::net::wire::ControlMessage;
use super::net::{NodeId, NodeMask, RegionId};
use super::region::{Direction, SharedRegion};

/// Most buffers one set may carry; region ids are carved out of the set id
/// in blocks of this size.
const BUFFERS_PER_SET: u32 = 64;

/// Client handle naming the leader of leader-rooted collectives.
#[derive(Debug, Clone, Copy)]
pub struct CollectiveHandle {
    pub leader: NodeId,
}

/// One contiguous range moving through the mesh: `source`'s bytes at
/// `offset` land at every node in `receivers`.
#[derive(Clone)]
struct PlannedRange {
    offset: u64,
    size: u64,
    source: NodeId,
    receivers: NodeMask,
}

/// A registered ring of buffers for broadcast-and-gather. Buffers rotate
/// round-robin; a logical round owns its buffer exclusively until it
/// completes, so queued rounds can never alias one physical buffer.
pub struct BufferSet {
    id: u32,
    regions: Vec<Arc<SharedRegion>>,
    busy: Vec<AtomicBool>,
    round: AtomicU64,
    /// Relay legs built at assignment time, per buffer, so a reused buffer
    /// can rebuild its pipelines.
    relay_specs: Mutex<Vec<Vec<LegSpec>>>,
}

impl BufferSet {
    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn buffer_count(&self) -> usize {
        self.regions.len()
    }

    pub fn region(&self, idx: usize) -> &Arc<SharedRegion> {
        &self.regions[idx]
    }

    /// Which buffer the next broadcast round will use.
    pub fn next_buffer(&self) -> usize {
        (self.round.load(Ordering::Acquire) as usize) % self.regions.len()
    }
}

/// One-shot distribution buffer for send-to-all or scatter-to-all.
pub struct OneShot {
    region: Arc<SharedRegion>,
    leader: NodeId,
    scatter: bool,
}

impl OneShot {
    pub fn region(&self) -> &Arc<SharedRegion> {
        &self.region
    }

    pub fn leader(&self) -> NodeId {
        self.leader
    }
}

/// Largest chunk that still divides the block and splits into at most the
/// sub-command bitmap width.
fn derived_chunk_size(block: u64, mtu: usize) -> u32 {
    let cap = (mtu as u64 * super::region::MAX_SUB_COMMANDS as u64)
        .min(4096)
        .min(block);
    let mut chunk = 1u64;
    while chunk * 2 <= cap && block % (chunk * 2) == 0 {
        chunk *= 2;
    }
    chunk as u32
}

impl Fabric {
    pub fn create_handle(&self, leader: NodeId) -> CollectiveHandle {
        CollectiveHandle { leader }
    }

    /// Hop-count cost matrix of the configured cabling.
    pub fn ensemble_map(&self) -> Vec<Vec<u32>> {
        self.config().ensemble_map()
    }

    fn link_mtu(&self) -> Result<usize, Error> {
        self.inner()
            .links
            .lock()
            .unwrap()
            .values()
            .next()
            .map(|l| l.mtu())
            .ok_or(Error::InvalidArgument("no links registered"))
    }

    /// Registers a ring of equally sized buffers. Geometry that does not
    /// divide cleanly is rejected here, never coerced.
    pub fn setup_buffers(
        &self,
        id: u32,
        size: u64,
        block_size: u64,
        chunk_size: u32,
        buffers: Vec<Vec<u8>>,
    ) -> Result<Arc<BufferSet>, Error> {
        if !self.is_claimed() {
            return Err(Error::NotClaimed);
        }
        if buffers.is_empty() || buffers.len() > BUFFERS_PER_SET as usize {
            return Err(Error::InvalidArgument("buffer count out of range"));
        }
        let node_count = self.config().node_count;
        if block_size * node_count as u64 != size {
            return Err(Error::BadBufferGeometry {
                total: size,
                block: block_size,
                chunk: chunk_size,
            });
        }
        let mtu = self.link_mtu()?;
        let mut regions = Vec::with_capacity(buffers.len());
        for (i, buf) in buffers.iter().enumerate() {
            if !buf.is_empty() && buf.len() as u64 != size {
                return Err(Error::InvalidArgument("buffer length mismatch"));
            }
            let region_id: RegionId = id
                .checked_mul(BUFFERS_PER_SET)
                .and_then(|base| base.checked_add(i as u32))
                .ok_or(Error::InvalidArgument("buffer set id overflow"))?;
            let region = SharedRegion::new(
                region_id,
                size,
                chunk_size,
                node_count,
                self.config().links_per_channel,
                mtu as u32,
            )?;
            if !buf.is_empty() {
                region.write(0, buf);
            }
            let mut table = self.inner().regions.lock().unwrap();
            if table.contains_key(&region_id) {
                return Err(Error::InvalidArgument("buffer set id already in use"));
            }
            table.insert(region_id, region.clone());
            regions.push(region);
        }
        debug!(id, buffers = regions.len(), "buffer set registered");
        Ok(Arc::new(BufferSet {
            id,
            busy: (0..regions.len()).map(|_| AtomicBool::new(false)).collect(),
            round: AtomicU64::new(0),
            relay_specs: Mutex::new(vec![Vec::new(); regions.len()]),
            regions,
        }))
    }

    /// Creates every assignment and relay pipeline the broadcast pattern
    /// needs: each node's block travels to every other node. `max_reads`
    /// bounds how many chunks per relay leg may sit prepared ahead of the
    /// hardware.
    pub async fn assign_buffers_to_readers(&self, set: &BufferSet, max_reads: usize) -> Result<(), Error> {
        if !self.is_claimed() {
            return Err(Error::NotClaimed);
        }
        let group = max_reads.max(1);
        let node_count = self.config().node_count;
        let block = set.regions[0].block_size();
        let plan: Vec<PlannedRange> = (0..node_count)
            .map(|s| {
                let source = NodeId::from_extended(s as u8);
                let mut receivers = NodeMask::all(node_count);
                receivers.remove(source);
                PlannedRange {
                    offset: set.regions[0].block_offset(source),
                    size: block,
                    source,
                    receivers,
                }
            })
            .collect();
        for (idx, region) in set.regions.iter().enumerate() {
            let specs = self.apply_plan(region, &plan, group).await?;
            set.relay_specs.lock().unwrap()[idx] = specs;
        }
        Ok(())
    }

    /// Walks a distribution plan from this node's point of view: create
    /// the outbound assignment and binds for ranges it originates, and the
    /// inbound assignment plus any relay pipelines for ranges it receives
    /// or carries. Returns the relay specs built, for later rebuilds.
    async fn apply_plan(
        &self,
        region: &Arc<SharedRegion>,
        plan: &[PlannedRange],
        group: usize,
    ) -> Result<Vec<LegSpec>, Error> {
        let inner = self.inner().clone();
        let local = self.local();
        let config = self.config();
        let links = config.links_per_channel;

        // Outbound side first; it never blocks, and the notifications it
        // sends are what the inbound side of other nodes gates on.
        for range in plan.iter().filter(|r| r.source == local) {
            let outcome =
                region.create_assignment(range.offset, Direction::Out, range.receivers, range.size)?;
            let mut hops: HashSet<NodeId> = HashSet::new();
            for receiver in range.receivers.iter() {
                let hop = config.next_hop(local, receiver).ok_or(Error::NoRoute(receiver))?;
                hops.insert(hop);
            }
            let assignment = outcome.assignment();
            assignment.set_expected_tx_chunks(assignment.chunk_count() * hops.len() as u32);
            for hop in hops {
                let channel = inner.channel_index(hop).ok_or(Error::ChannelNotReady(hop))?;
                inner.bind_tx(channel, local)?;
            }
        }

        let mut specs = Vec::new();
        for range in plan.iter().filter(|r| r.source != local) {
            let receives = range.receivers.contains(local);
            let mut downstream: Vec<NodeId> = Vec::new();
            for receiver in range.receivers.iter().filter(|&r| r != local) {
                let path = config
                    .shortest_path(range.source, receiver)
                    .ok_or(Error::NoRoute(receiver))?;
                if let Some(pos) = path.iter().position(|&n| n == local) {
                    if pos > 0 && pos + 1 < path.len() {
                        let next = path[pos + 1];
                        if !downstream.contains(&next) {
                            downstream.push(next);
                        }
                    }
                }
            }
            if !receives && downstream.is_empty() {
                continue;
            }

            let prev_hop = config
                .next_hop(local, range.source)
                .ok_or(Error::NoRoute(range.source))?;
            let arrival = inner
                .channel_index(prev_hop)
                .ok_or(Error::ChannelNotReady(prev_hop))?;
            // An inbound assignment may only exist once the transmitting
            // side has announced its data path for this source.
            let gate = inner.clone();
            let source = range.source;
            poll_until(config.max_wait, config.poll_interval, move || {
                gate.partner_tx_ready(arrival, source)
            })
            .await?;
            let rx_paths = inner.assign_rx_paths(arrival, range.source);
            let inbound = region.create_assignment(
                range.offset,
                Direction::In,
                NodeMask::single(range.source),
                range.size,
            )?;
            for (slot, path) in rx_paths.iter().enumerate() {
                if let Some(path) = path {
                    inbound.assignment().set_path(slot, *path);
                }
            }

            if downstream.is_empty() {
                continue;
            }
            let mut mask = NodeMask::empty();
            for &n in &downstream {
                mask.insert(n);
            }
            // The normal forwarding case: the inbound range just created
            // gains an outbound side.
            region.create_assignment(range.offset, Direction::Out, mask, range.size)?;
            for &next in &downstream {
                let out_channel = inner.channel_index(next).ok_or(Error::ChannelNotReady(next))?;
                inner.bind_tx(out_channel, range.source)?;
                let mut legs = [
                    OutLeg { channel: out_channel, link_slot: 0, path: 0 },
                    OutLeg { channel: out_channel, link_slot: 1, path: 0 },
                ];
                for (slot, leg) in legs.iter_mut().enumerate().take(links) {
                    let link = inner
                        .channel_link(out_channel, slot)
                        .ok_or(Error::ChannelNotReady(next))?;
                    leg.path = link.assign_tx_path(range.source)?;
                }
                let spec = LegSpec {
                    region: region.id(),
                    source: range.source,
                    receiver: next,
                    chunks: region.chunk_offsets(range.offset, range.size).collect(),
                    group_size: group,
                    link_count: links,
                    legs,
                    sub_count: region.sub_count(),
                };
                inner.forwarder.build_leg(&*inner, spec.clone())?;
                specs.push(spec);
                inner.route_and_send(
                    range.source,
                    ControlMessage::TxForwardNotification {
                        forwarder: local,
                        source_node: range.source,
                        receiver: next,
                    },
                )?;
            }
        }
        Ok(specs)
    }

    /// One broadcast-and-gather round: send this node's block to every
    /// peer and return once every peer's block has landed here. Returns
    /// the buffer index the round used.
    pub async fn broadcast_and_gather(&self, set: &BufferSet) -> Result<usize, Error> {
        if !self.is_claimed() {
            return Err(Error::NotClaimed);
        }
        let round = set.round.fetch_add(1, Ordering::AcqRel);
        let idx = (round as usize) % set.regions.len();
        let config = self.config();
        // Claim the physical buffer; an earlier logical round may still be
        // draining it.
        poll_until(config.max_wait, config.poll_interval, || {
            set.busy[idx]
                .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
        })
        .await?;
        let result = self.run_round(set, round, idx).await;
        set.busy[idx].store(false, Ordering::Release);
        result.map(|_| idx)
    }

    async fn run_round(&self, set: &BufferSet, round: u64, idx: usize) -> Result<(), Error> {
        let region = &set.regions[idx];
        if region.interrupted() {
            return Err(Error::Interrupted);
        }
        let config = self.config();
        let local = self.local();
        let node_count = config.node_count;
        let block = region.block_size();

        // A reused buffer must not carry the previous round's readiness:
        // drop inbound state, re-arm outbound counters, rebuild relays.
        // The barrier keeps any peer from retransmitting into a buffer a
        // slower node has not re-armed yet; holds must never race fresh
        // arrivals.
        if round as usize >= set.regions.len() {
            for s in 0..node_count {
                let source = NodeId::from_extended(s as u8);
                if source == local {
                    continue;
                }
                region.hold_range(region.block_offset(source), block);
            }
            if let Some(own) = region.assignment_at(region.block_offset(local)) {
                own.reset_tx();
            }
            let specs = set.relay_specs.lock().unwrap()[idx].clone();
            if !specs.is_empty() {
                self.disassociate_region(region.id()).await?;
                for spec in specs {
                    self.inner().forwarder.build_leg(&**self.inner(), spec)?;
                }
            }
            self.barrier().await?;
        }

        let mut receivers = NodeMask::all(node_count);
        receivers.remove(local);
        self.send_range(region, region.block_offset(local), block, receivers, local)?;

        for s in 0..node_count {
            let source = NodeId::from_extended(s as u8);
            if source == local {
                continue;
            }
            for chunk in region.chunk_offsets(region.block_offset(source), block) {
                region
                    .wait_chunk_ready(chunk, config.max_wait, config.poll_interval)
                    .await?;
            }
        }
        Ok(())
    }

    /// Transmits a range toward every receiver, one copy per next-hop
    /// channel, duplicated across the channel's links. Chunks go out in
    /// the assignment's first-to-last order.
    fn send_range(
        &self,
        region: &Arc<SharedRegion>,
        offset: u64,
        size: u64,
        receivers: NodeMask,
        source: NodeId,
    ) -> Result<(), Error> {
        let inner = self.inner();
        let config = self.config();
        let (first, last) = match region.assignment_at(offset) {
            Some(a) => (a.link(0).first_chunk_offset, a.link(0).last_chunk_offset),
            None => (offset, offset + size - region.chunk_size() as u64),
        };
        let mut hops: Vec<NodeId> = Vec::new();
        for receiver in receivers.iter() {
            let hop = config.next_hop(self.local(), receiver).ok_or(Error::NoRoute(receiver))?;
            if !hops.contains(&hop) {
                hops.push(hop);
            }
        }
        for hop in hops {
            let channel = inner.channel_index(hop).ok_or(Error::ChannelNotReady(hop))?;
            for chunk in (first..=last).step_by(region.chunk_size() as usize) {
                // One tag per chunk per hop; both parallel links carry the
                // same tag so the receiver can cross-check its copies.
                let trailer: u64 = rand::random();
                for slot in 0..config.links_per_channel {
                    let link = inner.channel_link(channel, slot).ok_or(Error::LinkDetached)?;
                    let path = link.assign_tx_path(source)?;
                    inner.send_chunk(region, chunk, channel, slot, path, trailer)?;
                }
            }
        }
        Ok(())
    }

    /// Registers the replication buffer on every participant. The leader's
    /// copy carries the payload.
    pub fn setup_send_to_all(
        &self,
        handle: &CollectiveHandle,
        id: u32,
        buf: &[u8],
        size: u64,
    ) -> Result<Arc<OneShot>, Error> {
        self.setup_one_shot(handle, id, buf, size, false)
    }

    pub fn setup_scatter_to_all(
        &self,
        handle: &CollectiveHandle,
        id: u32,
        buf: &[u8],
        size: u64,
    ) -> Result<Arc<OneShot>, Error> {
        self.setup_one_shot(handle, id, buf, size, true)
    }

    fn setup_one_shot(
        &self,
        handle: &CollectiveHandle,
        id: u32,
        buf: &[u8],
        size: u64,
        scatter: bool,
    ) -> Result<Arc<OneShot>, Error> {
        if !self.is_claimed() {
            return Err(Error::NotClaimed);
        }
        let node_count = self.config().node_count;
        if size == 0 || size % node_count as u64 != 0 {
            return Err(Error::InvalidArgument("buffer does not divide across nodes"));
        }
        let mtu = self.link_mtu()?;
        let chunk = derived_chunk_size(size / node_count as u64, mtu);
        let region = SharedRegion::new(
            id,
            size,
            chunk,
            node_count,
            self.config().links_per_channel,
            mtu as u32,
        )?;
        if self.local() == handle.leader {
            if buf.len() as u64 != size {
                return Err(Error::InvalidArgument("buffer length mismatch"));
            }
            region.write(0, buf);
        }
        let mut table = self.inner().regions.lock().unwrap();
        if table.contains_key(&id) {
            return Err(Error::InvalidArgument("region id already in use"));
        }
        table.insert(id, region.clone());
        Ok(Arc::new(OneShot {
            region,
            leader: handle.leader,
            scatter,
        }))
    }

    fn one_shot_plan(&self, shot: &OneShot, mask: Option<NodeMask>) -> Vec<PlannedRange> {
        let node_count = self.config().node_count;
        let mut receivers = mask.unwrap_or_else(|| NodeMask::all(node_count));
        receivers.remove(shot.leader);
        if shot.scatter {
            let block = shot.region.block_size();
            receivers
                .iter()
                .map(|r| PlannedRange {
                    offset: shot.region.block_offset(r),
                    size: block,
                    source: shot.leader,
                    receivers: NodeMask::single(r),
                })
                .collect()
        } else {
            vec![PlannedRange {
                offset: 0,
                size: shot.region.total_size(),
                source: shot.leader,
                receivers,
            }]
        }
    }

    /// Leader side of send-to-all: replicate the buffer verbatim to every
    /// follower in the mask.
    pub async fn send_to_all_peers(&self, shot: &OneShot, mask: Option<NodeMask>) -> Result<(), Error> {
        if self.local() != shot.leader {
            return Err(Error::InvalidArgument("only the leader transmits"));
        }
        if shot.scatter {
            return Err(Error::InvalidArgument("scatter buffer used for send-to-all"));
        }
        self.run_leader(shot, mask).await
    }

    /// Leader side of scatter-to-all: each follower receives only its own
    /// slice; the leader's slice is never transmitted.
    pub async fn scatter_to_all(&self, shot: &OneShot, mask: Option<NodeMask>) -> Result<(), Error> {
        if self.local() != shot.leader {
            return Err(Error::InvalidArgument("only the leader transmits"));
        }
        if !shot.scatter {
            return Err(Error::InvalidArgument("send-to-all buffer used for scatter"));
        }
        self.run_leader(shot, mask).await
    }

    async fn run_leader(&self, shot: &OneShot, mask: Option<NodeMask>) -> Result<(), Error> {
        let plan = self.one_shot_plan(shot, mask);
        if plan.iter().all(|r| r.receivers.is_empty()) {
            return Ok(());
        }
        let group = self.config().chain_group;
        self.apply_plan(&shot.region, &plan, group).await?;
        let config = self.config();
        for range in &plan {
            self.send_range(&shot.region, range.offset, range.size, range.receivers, shot.leader)?;
        }
        for range in &plan {
            let assignment = shot
                .region
                .assignment_at(range.offset)
                .ok_or(Error::InvalidArgument("missing outbound assignment"))?;
            let links = config.links_per_channel;
            shot.region
                .wait_until(config.max_wait, config.poll_interval, || {
                    Ok(assignment.check_tx_ready(links))
                })
                .await?;
        }
        Ok(())
    }

    /// Follower side of both one-shot collectives, default budget.
    pub async fn receive_from_leader(&self, shot: &OneShot, mask: Option<NodeMask>) -> Result<Vec<u8>, Error> {
        self.receive_from_leader_ex(shot, mask, self.config().max_wait).await
    }

    /// Follower side with an explicit wait budget. Relays excluded from
    /// the mask still participate here and return an empty buffer.
    pub async fn receive_from_leader_ex(
        &self,
        shot: &OneShot,
        mask: Option<NodeMask>,
        budget: Duration,
    ) -> Result<Vec<u8>, Error> {
        if self.local() == shot.leader {
            return Err(Error::InvalidArgument("leader receiving from itself"));
        }
        let plan = self.one_shot_plan(shot, mask);
        let group = self.config().chain_group;
        self.apply_plan(&shot.region, &plan, group).await?;
        let local = self.local();
        let Some(range) = plan.iter().find(|r| r.receivers.contains(local)) else {
            return Ok(Vec::new());
        };
        for chunk in shot.region.chunk_offsets(range.offset, range.size) {
            shot.region
                .wait_chunk_ready(chunk, budget, self.config().poll_interval)
                .await?;
        }
        Ok(shot.region.read(range.offset, range.size as usize))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mesh::testkit::TestMesh;

    /// Per-node buffer contents: node i's block filled with byte i + 1.
    fn seeded_buffer(local: NodeId, size: u64, block: u64) -> Vec<u8> {
        let mut buf = vec![0u8; size as usize];
        let start = (local.index() as u64 * block) as usize;
        for b in &mut buf[start..start + block as usize] {
            *b = local.extended() + 1;
        }
        buf
    }

    fn expected_gathered(size: u64, block: u64, node_count: usize) -> Vec<u8> {
        let mut buf = vec![0u8; size as usize];
        for node in 0..node_count {
            let start = node * block as usize;
            for b in &mut buf[start..start + block as usize] {
                *b = node as u8 + 1;
            }
        }
        buf
    }

    async fn setup_and_assign(mesh: &TestMesh, size: u64, block: u64, chunk: u32, buffers: usize) -> Vec<Arc<BufferSet>> {
        let mut sets = Vec::new();
        for fabric in &mesh.fabrics {
            let bufs = (0..buffers)
                .map(|_| seeded_buffer(fabric.local(), size, block))
                .collect();
            sets.push(fabric.setup_buffers(1, size, block, chunk, bufs).unwrap());
        }
        let mut tasks = Vec::new();
        for (fabric, set) in mesh.fabrics.iter().zip(&sets) {
            let fabric = fabric.clone();
            let set = set.clone();
            tasks.push(tokio::spawn(async move {
                fabric.assign_buffers_to_readers(&set, 2).await
            }));
        }
        for task in tasks {
            task.await.unwrap().unwrap();
        }
        sets
    }

    async fn run_rounds(mesh: &TestMesh, sets: &[Arc<BufferSet>]) -> Vec<usize> {
        let mut tasks = Vec::new();
        for (fabric, set) in mesh.fabrics.iter().zip(sets) {
            let fabric = fabric.clone();
            let set = set.clone();
            tasks.push(tokio::spawn(async move {
                fabric.broadcast_and_gather(&set).await
            }));
        }
        let mut indexes = Vec::new();
        for task in tasks {
            indexes.push(task.await.unwrap().unwrap());
        }
        indexes
    }

    #[tokio::test]
    async fn ensemble_map_via_fabric() {
        let mesh = TestMesh::line(3, 1).await;
        let map = mesh.fabrics[0].ensemble_map();
        assert_eq!(map[0][2], 2);
        assert_eq!(map[0][1], 1);
    }

    #[tokio::test]
    async fn broadcast_gather_direct_mesh() {
        // The reference scenario: four nodes all directly cabled to each
        // other, two links per channel, one buffer of four chunks per
        // block owner.
        let mesh = TestMesh::full(4, 2).await;
        mesh.claim_all();
        let (block, chunk) = (128u64, 32u32);
        let size = block * 4;
        let sets = setup_and_assign(&mesh, size, block, chunk, 2).await;
        let indexes = run_rounds(&mesh, &sets).await;
        assert!(indexes.iter().all(|&i| i == 0));

        let expected = expected_gathered(size, block, 4);
        for set in &sets {
            assert_eq!(set.region(0).read(0, size as usize), expected);
            // The second buffer saw no traffic.
            assert_ne!(set.region(1).read(0, size as usize), expected);
        }
    }

    #[tokio::test]
    async fn broadcast_gather_relays_across_a_line() {
        // 0-1-2: the end nodes have no direct channel, so node 1 relays
        // both directions.
        let mesh = TestMesh::line(3, 1).await;
        mesh.claim_all();
        let (block, chunk) = (64u64, 32u32);
        let size = block * 3;
        let sets = setup_and_assign(&mesh, size, block, chunk, 1).await;
        run_rounds(&mesh, &sets).await;

        let expected = expected_gathered(size, block, 3);
        for set in &sets {
            assert_eq!(set.region(0).read(0, size as usize), expected);
        }
        // The end nodes learned their relayed routes from announcements.
        let route = mesh.fabrics[0].route_to(NodeId::new(0, 2)).unwrap();
        assert_eq!(route.forwarder, NodeId::new(0, 1));
    }

    #[tokio::test]
    async fn broadcast_gather_two_link_relay() {
        let mesh = TestMesh::line(3, 2).await;
        mesh.claim_all();
        let (block, chunk) = (64u64, 32u32);
        let size = block * 3;
        let sets = setup_and_assign(&mesh, size, block, chunk, 1).await;
        run_rounds(&mesh, &sets).await;
        let expected = expected_gathered(size, block, 3);
        for set in &sets {
            assert_eq!(set.region(0).read(0, size as usize), expected);
        }
    }

    #[tokio::test]
    async fn buffer_rotation_does_not_alias_rounds() {
        let mesh = TestMesh::full(2, 1).await;
        mesh.claim_all();
        let (block, chunk) = (64u64, 32u32);
        let size = block * 2;
        let sets = setup_and_assign(&mesh, size, block, chunk, 2).await;

        let first = run_rounds(&mesh, &sets).await;
        assert!(first.iter().all(|&i| i == 0));
        let second = run_rounds(&mesh, &sets).await;
        assert!(second.iter().all(|&i| i == 1));

        // Third round wraps onto buffer 0; fresh data must flow rather
        // than the first round's readiness being reused.
        for (fabric, set) in mesh.fabrics.iter().zip(&sets) {
            let region = set.region(set.next_buffer());
            let offset = region.block_offset(fabric.local());
            let fresh = vec![fabric.local().extended() + 101; block as usize];
            region.write(offset, &fresh);
        }
        let third = run_rounds(&mesh, &sets).await;
        assert!(third.iter().all(|&i| i == 0));
        for (i, set) in sets.iter().enumerate() {
            let other = 1 - i;
            let got = set.region(0).read(other as u64 * block, block as usize);
            assert_eq!(got, vec![other as u8 + 101; block as usize]);
        }
    }

    #[tokio::test]
    async fn relayed_rounds_rebuild_their_pipelines() {
        let mesh = TestMesh::line(3, 1).await;
        mesh.claim_all();
        let (block, chunk) = (64u64, 32u32);
        let size = block * 3;
        let sets = setup_and_assign(&mesh, size, block, chunk, 1).await;
        run_rounds(&mesh, &sets).await;

        // Second round reuses the only buffer; node 1's relay chains are
        // torn down and rebuilt before fresh data flows end to end.
        for (fabric, set) in mesh.fabrics.iter().zip(&sets) {
            let region = set.region(0);
            let offset = region.block_offset(fabric.local());
            let fresh = vec![fabric.local().extended() + 201; block as usize];
            region.write(offset, &fresh);
        }
        run_rounds(&mesh, &sets).await;
        let got = sets[2].region(0).read(0, block as usize);
        assert_eq!(got, vec![201u8; block as usize]);
        let got = sets[0].region(0).read(2 * block, block as usize);
        assert_eq!(got, vec![203u8; block as usize]);
    }

    #[tokio::test]
    async fn send_to_all_replicates_through_a_relay() {
        let mesh = TestMesh::line(3, 1).await;
        mesh.claim_all();
        let leader = NodeId::new(0, 0);
        let payload: Vec<u8> = (0u8..96).collect();
        let mut shots = Vec::new();
        for fabric in &mesh.fabrics {
            let handle = fabric.create_handle(leader);
            shots.push(fabric.setup_send_to_all(&handle, 7, &payload, 96).unwrap());
        }

        let mut tasks = Vec::new();
        for (i, fabric) in mesh.fabrics.iter().enumerate() {
            let fabric = fabric.clone();
            let shot = shots[i].clone();
            tasks.push(tokio::spawn(async move {
                if fabric.local() == leader {
                    fabric.send_to_all_peers(&shot, None).await.map(|_| Vec::new())
                } else {
                    fabric.receive_from_leader(&shot, None).await
                }
            }));
        }
        let mut results = Vec::new();
        for task in tasks {
            results.push(task.await.unwrap().unwrap());
        }
        assert_eq!(results[1], payload);
        assert_eq!(results[2], payload);
    }

    #[tokio::test]
    async fn scatter_delivers_disjoint_slices() {
        let mesh = TestMesh::line(3, 1).await;
        mesh.claim_all();
        let leader = NodeId::new(0, 0);
        let payload: Vec<u8> = (0u8..96).collect();
        let block = 32usize;
        let mut shots = Vec::new();
        for fabric in &mesh.fabrics {
            let handle = fabric.create_handle(leader);
            shots.push(fabric.setup_scatter_to_all(&handle, 8, &payload, 96).unwrap());
        }

        let mut tasks = Vec::new();
        for (i, fabric) in mesh.fabrics.iter().enumerate() {
            let fabric = fabric.clone();
            let shot = shots[i].clone();
            tasks.push(tokio::spawn(async move {
                if fabric.local() == leader {
                    fabric.scatter_to_all(&shot, None).await.map(|_| Vec::new())
                } else {
                    fabric.receive_from_leader(&shot, None).await
                }
            }));
        }
        let mut results = Vec::new();
        for task in tasks {
            results.push(task.await.unwrap().unwrap());
        }
        assert_eq!(results[1], payload[block..2 * block].to_vec());
        assert_eq!(results[2], payload[2 * block..3 * block].to_vec());
        // The leader's own slice stays home: no region but the leader's
        // ever holds it.
        assert_eq!(
            shots[2].region().read(0, block),
            vec![0u8; block],
        );
    }

    #[tokio::test]
    async fn collectives_require_a_claim() {
        let mesh = TestMesh::full(2, 1).await;
        let fabric = &mesh.fabrics[0];
        assert!(matches!(
            fabric.setup_buffers(1, 64, 32, 32, vec![vec![0u8; 64]]),
            Err(Error::NotClaimed)
        ));
    }

    #[tokio::test]
    async fn bad_buffer_geometry_is_rejected() {
        let mesh = TestMesh::full(2, 1).await;
        mesh.claim_all();
        let fabric = &mesh.fabrics[0];
        assert!(matches!(
            fabric.setup_buffers(1, 96, 32, 32, vec![vec![0u8; 96]]),
            Err(Error::BadBufferGeometry { .. })
        ));
        // Chunk that does not divide the block.
        assert!(matches!(
            fabric.setup_buffers(1, 64, 32, 24, vec![vec![0u8; 64]]),
            Err(Error::BadBufferGeometry { .. })
        ));
    }

    #[test]
    fn derived_chunk_divides_blocks() {
        assert_eq!(derived_chunk_size(32, 16), 32);
        assert_eq!(derived_chunk_size(4096, 16), 256);
        assert_eq!(derived_chunk_size(24, 16), 8);
        assert_eq!(derived_chunk_size(7, 16), 1);
    }
}
