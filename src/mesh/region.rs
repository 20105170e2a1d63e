use std::sync::atomic::{AtomicBool, AtomicU16, AtomicU32, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, Instant};

use hashbrown::HashMap;
use tracing::{debug, warn};

use super::net::error::Error;
use super::net::link::PathIndex;
use super::net::{NodeId, NodeMask, RegionId, MAX_LINKS_PER_CHANNEL};

/// Sub-command bitmaps are u16, which caps how finely a chunk may be split.
pub const MAX_SUB_COMMANDS: u32 = 16;

/// Which way an assignment moves data relative to this node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// Data arrives here from one source node.
    In,
    /// Data leaves here toward a set of destination nodes.
    Out,
}

/// Result of `create_assignment`. Creating the inbound side twice is a
/// no-op; attaching an outbound side to an existing inbound assignment is
/// the normal forwarding case.
pub enum CreateOutcome {
    Created(Arc<Assignment>),
    Extended(Arc<Assignment>),
    AlreadyExists(Arc<Assignment>),
}

impl CreateOutcome {
    pub fn assignment(&self) -> &Arc<Assignment> {
        match self {
            CreateOutcome::Created(a) | CreateOutcome::Extended(a) | CreateOutcome::AlreadyExists(a) => a,
        }
    }
}

/// Per-physical-link bookkeeping for one assignment: the chunk range it
/// owns (first to submit, last whose completion to poll) and outbound
/// completion progress.
pub struct LinkBinding {
    pub first_chunk_offset: u64,
    pub last_chunk_offset: u64,
    tx_done_chunks: AtomicU32,
    tx_ready: AtomicBool,
}

impl LinkBinding {
    fn new(first: u64, last: u64) -> Self {
        Self {
            first_chunk_offset: first,
            last_chunk_offset: last,
            tx_done_chunks: AtomicU32::new(0),
            tx_ready: AtomicBool::new(false),
        }
    }
}

/// Binding of one contiguous chunk range to a transfer direction. Created
/// exactly once per `(offset, direction)`; an inbound assignment may later
/// gain an outbound side when this node relays the range onward.
pub struct Assignment {
    region: RegionId,
    offset: u64,
    size: u64,
    chunk_count: u32,
    inbound: Mutex<Option<NodeId>>,
    outbound: Mutex<Option<NodeMask>>,
    links: [LinkBinding; MAX_LINKS_PER_CHANNEL],
    /// Data path each link slot transmits or receives this range on.
    paths: Mutex<[Option<PathIndex>; MAX_LINKS_PER_CHANNEL]>,
    /// Chunk completions expected per link before TX-ready; one per chunk
    /// per next-hop channel the range fans out over.
    expected_tx_chunks: AtomicU32,
}

impl Assignment {
    fn new(region: RegionId, offset: u64, size: u64, chunk_size: u32) -> Self {
        let chunk_count = (size / chunk_size as u64) as u32;
        let last = offset + size - chunk_size as u64;
        Self {
            region,
            offset,
            size,
            chunk_count,
            inbound: Mutex::new(None),
            outbound: Mutex::new(None),
            links: [LinkBinding::new(offset, last), LinkBinding::new(offset, last)],
            paths: Mutex::new([None; MAX_LINKS_PER_CHANNEL]),
            expected_tx_chunks: AtomicU32::new(chunk_count),
        }
    }

    pub fn region(&self) -> RegionId {
        self.region
    }

    pub fn offset(&self) -> u64 {
        self.offset
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn chunk_count(&self) -> u32 {
        self.chunk_count
    }

    pub fn link(&self, slot: usize) -> &LinkBinding {
        &self.links[slot]
    }

    pub fn inbound_source(&self) -> Option<NodeId> {
        *self.inbound.lock().unwrap()
    }

    pub fn outbound_mask(&self) -> Option<NodeMask> {
        *self.outbound.lock().unwrap()
    }

    /// True once this inbound range has been bound onward, meaning chunks
    /// landing here must be relayed.
    pub fn is_forwarded(&self) -> bool {
        self.inbound_source().is_some() && self.outbound_mask().is_some()
    }

    pub fn set_path(&self, slot: usize, path: PathIndex) {
        self.paths.lock().unwrap()[slot] = Some(path);
    }

    pub fn path(&self, slot: usize) -> Option<PathIndex> {
        self.paths.lock().unwrap()[slot]
    }

    /// A range fanning out over several next-hop channels completes each
    /// chunk once per hop.
    pub fn set_expected_tx_chunks(&self, expected: u32) {
        self.expected_tx_chunks.store(expected, Ordering::Release);
    }

    /// Records one chunk's outbound completion on a link. The binding
    /// becomes TX-ready when every expected completion has been observed.
    pub fn note_tx_chunk_done(&self, slot: usize) {
        let done = self.links[slot].tx_done_chunks.fetch_add(1, Ordering::AcqRel) + 1;
        if done >= self.expected_tx_chunks.load(Ordering::Acquire) {
            self.links[slot].tx_ready.store(true, Ordering::Release);
        }
    }

    /// Memoized per link, like the inbound side: true once every chunk's
    /// final completion was observed on all `link_count` links.
    pub fn check_tx_ready(&self, link_count: usize) -> bool {
        (0..link_count).all(|slot| self.links[slot].tx_ready.load(Ordering::Acquire))
    }

    /// Re-arms outbound tracking before the range is transmitted again.
    pub fn reset_tx(&self) {
        for link in &self.links {
            link.tx_done_chunks.store(0, Ordering::Release);
            link.tx_ready.store(false, Ordering::Release);
        }
    }
}

/// Inbound state of one chunk on one physical link. `ready` transitions
/// false to true only on the completion path and true to false only
/// through `hold`, so readers never need a lock.
struct ChunkLinkState {
    arrived: AtomicU16,
    ready: AtomicBool,
    trailer: AtomicU64,
}

impl ChunkLinkState {
    fn new() -> Self {
        Self {
            arrived: AtomicU16::new(0),
            ready: AtomicBool::new(false),
            trailer: AtomicU64::new(0),
        }
    }

    fn reset(&self) {
        self.ready.store(false, Ordering::Release);
        self.arrived.store(0, Ordering::Release);
        self.trailer.store(0, Ordering::Release);
    }
}

struct ChunkState {
    links: [ChunkLinkState; MAX_LINKS_PER_CHANNEL],
}

struct AssignmentTable {
    by_offset: HashMap<u64, Arc<Assignment>>,
    /// Chunk index to the offset of the assignment owning it.
    chunk_owner: Vec<Option<u64>>,
}

/// One client-registered buffer: a ring of fixed-size chunks plus the
/// assignment map tracking what each range is doing. Shared by reference
/// between the command path and the forwarder while packets are in flight.
pub struct SharedRegion {
    id: RegionId,
    total_size: u64,
    chunk_size: u32,
    block_size: u64,
    node_count: usize,
    link_count: usize,
    sub_size: u32,
    sub_count: u8,
    bytes: RwLock<Box<[u8]>>,
    chunks: Box<[ChunkState]>,
    assignments: Mutex<AssignmentTable>,
    interrupted: AtomicBool,
    /// Why the region was interrupted, when a specific I/O or integrity
    /// fault caused it; waiters surface this instead of a bare interrupt.
    fault: Mutex<Option<Error>>,
    outstanding_forwards: AtomicU32,
    /// Lowest offset that gained an outbound side after its inbound side,
    /// which is where relaying starts for this region.
    forward_start: Mutex<Option<u64>>,
}

impl SharedRegion {
    pub fn new(
        id: RegionId,
        total_size: u64,
        chunk_size: u32,
        node_count: usize,
        link_count: usize,
        sub_size: u32,
    ) -> Result<Arc<Self>, Error> {
        if node_count == 0 || total_size == 0 || chunk_size == 0 || sub_size == 0 {
            return Err(Error::InvalidArgument("zero-sized buffer geometry"));
        }
        if link_count == 0 || link_count > MAX_LINKS_PER_CHANNEL {
            return Err(Error::UnsupportedLinkCount(link_count));
        }
        let block_size = total_size / node_count as u64;
        if block_size * node_count as u64 != total_size || block_size % chunk_size as u64 != 0 {
            return Err(Error::BadBufferGeometry {
                total: total_size,
                block: block_size,
                chunk: chunk_size,
            });
        }
        let sub_count = (chunk_size + sub_size - 1) / sub_size;
        if sub_count > MAX_SUB_COMMANDS {
            return Err(Error::ChunkTooManySubCommands {
                chunk: chunk_size,
                mtu: sub_size as usize,
            });
        }
        let chunk_count = (total_size / chunk_size as u64) as usize;
        let chunks = (0..chunk_count)
            .map(|_| ChunkState {
                links: [ChunkLinkState::new(), ChunkLinkState::new()],
            })
            .collect::<Vec<_>>()
            .into_boxed_slice();
        Ok(Arc::new(Self {
            id,
            total_size,
            chunk_size,
            block_size,
            node_count,
            link_count,
            sub_size,
            sub_count: sub_count as u8,
            bytes: RwLock::new(vec![0u8; total_size as usize].into_boxed_slice()),
            chunks,
            assignments: Mutex::new(AssignmentTable {
                by_offset: HashMap::new(),
                chunk_owner: vec![None; chunk_count],
            }),
            interrupted: AtomicBool::new(false),
            fault: Mutex::new(None),
            outstanding_forwards: AtomicU32::new(0),
            forward_start: Mutex::new(None),
        }))
    }

    pub fn id(&self) -> RegionId {
        self.id
    }

    pub fn total_size(&self) -> u64 {
        self.total_size
    }

    pub fn chunk_size(&self) -> u32 {
        self.chunk_size
    }

    pub fn block_size(&self) -> u64 {
        self.block_size
    }

    pub fn node_count(&self) -> usize {
        self.node_count
    }

    pub fn link_count(&self) -> usize {
        self.link_count
    }

    pub fn sub_count(&self) -> u8 {
        self.sub_count
    }

    pub fn sub_size(&self) -> u32 {
        self.sub_size
    }

    /// Offset of the block owned by `node`.
    pub fn block_offset(&self, node: NodeId) -> u64 {
        node.index() as u64 * self.block_size
    }

    fn chunk_index(&self, chunk_offset: u64) -> usize {
        (chunk_offset / self.chunk_size as u64) as usize
    }

    /// Chunk offsets covering `[offset, offset + size)`.
    pub fn chunk_offsets(&self, offset: u64, size: u64) -> impl Iterator<Item = u64> {
        let chunk = self.chunk_size as u64;
        (offset..offset + size).step_by(chunk as usize).map(move |o| o - o % chunk)
    }

    pub fn write(&self, offset: u64, data: &[u8]) {
        let mut bytes = self.bytes.write().unwrap();
        bytes[offset as usize..offset as usize + data.len()].copy_from_slice(data);
    }

    pub fn read(&self, offset: u64, len: usize) -> Vec<u8> {
        let bytes = self.bytes.read().unwrap();
        bytes[offset as usize..offset as usize + len].to_vec()
    }

    /// Byte range of one sub-command within its chunk. The final
    /// sub-command may be short.
    pub fn sub_range(&self, chunk_offset: u64, sub_index: u8) -> (u64, usize) {
        let start = chunk_offset + sub_index as u64 * self.sub_size as u64;
        let chunk_end = chunk_offset + self.chunk_size as u64;
        let len = (chunk_end - start).min(self.sub_size as u64) as usize;
        (start, len)
    }

    pub fn read_sub(&self, chunk_offset: u64, sub_index: u8) -> Vec<u8> {
        let (start, len) = self.sub_range(chunk_offset, sub_index);
        self.read(start, len)
    }

    pub fn write_sub(&self, chunk_offset: u64, sub_index: u8, data: &[u8]) {
        let (start, _) = self.sub_range(chunk_offset, sub_index);
        self.write(start, data);
    }

    /// Creates (or extends) the assignment at `offset`. See the collision
    /// matrix in the module tests; anything but the documented transitions
    /// is a fatal usage error.
    pub fn create_assignment(
        &self,
        offset: u64,
        direction: Direction,
        nodes: NodeMask,
        size: u64,
    ) -> Result<CreateOutcome, Error> {
        if nodes.is_empty() {
            return Err(Error::InvalidArgument("assignment with no nodes"));
        }
        if direction == Direction::In && nodes.len() != 1 {
            return Err(Error::InvalidArgument("inbound assignment needs exactly one source"));
        }
        if offset % self.chunk_size as u64 != 0
            || size == 0
            || size % self.chunk_size as u64 != 0
            || offset + size > self.total_size
        {
            return Err(Error::InvalidArgument("assignment not chunk aligned"));
        }

        let mut table = self.assignments.lock().unwrap();
        if let Some(existing) = table.by_offset.get(&offset).cloned() {
            if existing.size() != size {
                return Err(Error::AssignmentDirectionConflict {
                    region: self.id,
                    offset,
                });
            }
            return match direction {
                Direction::In => {
                    let inbound = existing.inbound_source();
                    match inbound {
                        Some(source) if NodeMask::single(source) == nodes => {
                            Ok(CreateOutcome::AlreadyExists(existing))
                        }
                        Some(_) => Err(Error::AssignmentSourceConflict {
                            region: self.id,
                            offset,
                        }),
                        // In after Out never happens in a correct mesh.
                        None => Err(Error::AssignmentDirectionConflict {
                            region: self.id,
                            offset,
                        }),
                    }
                }
                Direction::Out => {
                    if existing.outbound_mask().is_some() {
                        return Err(Error::AssignmentDirectionConflict {
                            region: self.id,
                            offset,
                        });
                    }
                    // Inbound range now bound onward: the forwarding case.
                    *existing.outbound.lock().unwrap() = Some(nodes);
                    let mut start = self.forward_start.lock().unwrap();
                    *start = Some(start.map_or(offset, |s: u64| s.min(offset)));
                    debug!(region = self.id, offset, "assignment extended for forwarding");
                    Ok(CreateOutcome::Extended(existing))
                }
            };
        }

        let first = self.chunk_index(offset);
        let last = self.chunk_index(offset + size - 1);
        if table.chunk_owner[first..=last].iter().any(|o| o.is_some()) {
            return Err(Error::InvalidArgument("assignment overlaps an existing range"));
        }
        let assignment = Arc::new(Assignment::new(self.id, offset, size, self.chunk_size));
        match direction {
            Direction::In => *assignment.inbound.lock().unwrap() = Some(nodes.iter().next().unwrap()),
            Direction::Out => *assignment.outbound.lock().unwrap() = Some(nodes),
        }
        for owner in &mut table.chunk_owner[first..=last] {
            *owner = Some(offset);
        }
        table.by_offset.insert(offset, assignment.clone());
        Ok(CreateOutcome::Created(assignment))
    }

    pub fn assignment_at(&self, offset: u64) -> Option<Arc<Assignment>> {
        self.assignments.lock().unwrap().by_offset.get(&offset).cloned()
    }

    /// Assignment owning the chunk at `chunk_offset`.
    pub fn owning_assignment(&self, chunk_offset: u64) -> Option<Arc<Assignment>> {
        let table = self.assignments.lock().unwrap();
        let owner = (*table.chunk_owner.get(self.chunk_index(chunk_offset))?)?;
        table.by_offset.get(&owner).cloned()
    }

    pub fn forward_start(&self) -> Option<u64> {
        *self.forward_start.lock().unwrap()
    }

    /// Marks one sub-command landed. Returns true when this completed the
    /// chunk on that link. Duplicate arrivals are ignored.
    pub fn mark_sub_arrival(
        &self,
        chunk_offset: u64,
        link_slot: usize,
        sub_index: u8,
        trailer: u64,
    ) -> bool {
        let state = &self.chunks[self.chunk_index(chunk_offset)].links[link_slot];
        let bit = 1u16 << sub_index;
        // The trailer must be visible before the arrival bit that lets a
        // relay read it.
        if sub_index == self.sub_count - 1 {
            state.trailer.store(trailer, Ordering::Release);
        }
        let old = state.arrived.fetch_or(bit, Ordering::AcqRel);
        if old & bit != 0 {
            return false;
        }
        let now = old | bit;
        if now.count_ones() == self.sub_count as u32 {
            state.ready.store(true, Ordering::Release);
            true
        } else {
            false
        }
    }

    pub fn arrived_bits(&self, chunk_offset: u64, link_slot: usize) -> u16 {
        self.chunks[self.chunk_index(chunk_offset)].links[link_slot]
            .arrived
            .load(Ordering::Acquire)
    }

    pub fn chunk_link_ready(&self, chunk_offset: u64, link_slot: usize) -> bool {
        self.chunks[self.chunk_index(chunk_offset)].links[link_slot]
            .ready
            .load(Ordering::Acquire)
    }

    pub fn trailer(&self, chunk_offset: u64, link_slot: usize) -> u64 {
        self.chunks[self.chunk_index(chunk_offset)].links[link_slot]
            .trailer
            .load(Ordering::Acquire)
    }

    /// Link-granular inbound readiness for one chunk. With two links the
    /// duplicated trailers must agree byte for byte; disagreement means the
    /// parallel copies diverged and the region is faulted rather than
    /// guessing which copy to trust.
    pub fn check_ready(&self, chunk_offset: u64) -> Result<bool, Error> {
        let state = &self.chunks[self.chunk_index(chunk_offset)];
        for slot in 0..self.link_count {
            if !state.links[slot].ready.load(Ordering::Acquire) {
                return Ok(false);
            }
        }
        if self.link_count == 2 {
            let a = state.links[0].trailer.load(Ordering::Acquire);
            let b = state.links[1].trailer.load(Ordering::Acquire);
            if a != b {
                let err = Error::TrailerMismatch {
                    region: self.id,
                    offset: chunk_offset,
                    primary: a,
                    secondary: b,
                };
                self.fault_with(err.clone());
                return Err(err);
            }
        }
        Ok(true)
    }

    /// Clears a chunk's readiness ahead of re-preparation. Single writer:
    /// must never race a live completion on the same chunk.
    pub fn hold(&self, chunk_offset: u64) {
        for link in &self.chunks[self.chunk_index(chunk_offset)].links {
            link.reset();
        }
    }

    pub fn hold_range(&self, offset: u64, size: u64) {
        for chunk in self.chunk_offsets(offset, size) {
            self.hold(chunk);
        }
    }

    pub fn interrupted(&self) -> bool {
        self.interrupted.load(Ordering::Acquire)
    }

    /// Cancels every polling wait on this region. Safe from any thread;
    /// every loop observes it before its next blocking iteration.
    pub fn interrupt_io_threads(&self) {
        if !self.interrupted.swap(true, Ordering::AcqRel) {
            warn!(region = self.id, "region interrupted");
        }
    }

    /// Interrupts the region with a recorded cause, so every waiter fails
    /// with the actual fault rather than a bare interrupt.
    pub fn fault_with(&self, err: Error) {
        let mut fault = self.fault.lock().unwrap();
        if fault.is_none() {
            *fault = Some(err);
        }
        drop(fault);
        self.interrupt_io_threads();
    }

    pub fn fault(&self) -> Option<Error> {
        self.fault.lock().unwrap().clone()
    }

    pub fn clear_interrupt_state(&self) {
        self.fault.lock().unwrap().take();
        self.interrupted.store(false, Ordering::Release);
    }

    pub fn begin_forward(&self) {
        self.outstanding_forwards.fetch_add(1, Ordering::AcqRel);
    }

    pub fn end_forward(&self) {
        self.outstanding_forwards.fetch_sub(1, Ordering::AcqRel);
    }

    pub fn outstanding_forwards(&self) -> u32 {
        self.outstanding_forwards.load(Ordering::Acquire)
    }

    /// Release is only legal once every relay referencing the region has
    /// drained.
    pub fn can_release(&self) -> bool {
        self.outstanding_forwards() == 0
    }

    /// Polls `condition` until true, the budget expires, or the region is
    /// interrupted. A timeout interrupts the region so every other waiter
    /// fails fast instead of hanging.
    pub async fn wait_until<F>(&self, budget: Duration, poll: Duration, condition: F) -> Result<(), Error>
    where
        F: Fn() -> Result<bool, Error>,
    {
        let deadline = Instant::now() + budget;
        loop {
            if self.interrupted() {
                return Err(self.fault().unwrap_or(Error::Interrupted));
            }
            if condition()? {
                return Ok(());
            }
            if Instant::now() >= deadline {
                self.interrupt_io_threads();
                return Err(Error::TimedOut);
            }
            tokio::time::sleep(poll).await;
        }
    }

    pub async fn wait_chunk_ready(
        &self,
        chunk_offset: u64,
        budget: Duration,
        poll: Duration,
    ) -> Result<(), Error> {
        self.wait_until(budget, poll, || self.check_ready(chunk_offset)).await
    }
}

/// Bounds how many bytes may sit prepared in the transport queue for one
/// direction. When the gate is full, work is deferred to the drip queue
/// instead of pinning more memory.
pub struct InflightGate {
    limit: usize,
    current: AtomicUsize,
}

impl InflightGate {
    pub fn new(limit: usize) -> Self {
        Self {
            limit,
            current: AtomicUsize::new(0),
        }
    }

    pub fn try_acquire(&self, len: usize) -> bool {
        let mut current = self.current.load(Ordering::Acquire);
        loop {
            if current + len > self.limit {
                return false;
            }
            match self.current.compare_exchange_weak(
                current,
                current + len,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return true,
                Err(now) => current = now,
            }
        }
    }

    pub fn release(&self, len: usize) {
        self.current.fetch_sub(len, Ordering::AcqRel);
    }

    pub fn in_flight(&self) -> usize {
        self.current.load(Ordering::Acquire)
    }
}

/// One deferred chunk preparation: advance exactly one (offset, link) pair.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DripItem {
    pub region: RegionId,
    pub offset: u64,
    pub channel: usize,
    pub link_slot: usize,
    pub path: PathIndex,
    /// Trailer chosen when the chunk was first queued, shared with the
    /// paired link's copy so the two stay identical.
    pub trailer: u64,
}

/// Queue of deferred preparations, drained by the commandeer helper so the
/// foreground path never blocks on a full transport queue.
pub struct DripQueue {
    items: Mutex<std::collections::VecDeque<DripItem>>,
}

impl DripQueue {
    pub fn new() -> Self {
        Self {
            items: Mutex::new(std::collections::VecDeque::new()),
        }
    }

    pub fn push(&self, item: DripItem) {
        self.items.lock().unwrap().push_back(item);
    }

    /// Returns an item whose turn has not come after all; order preserved.
    pub fn push_front(&self, item: DripItem) {
        self.items.lock().unwrap().push_front(item);
    }

    pub fn pop(&self) -> Option<DripItem> {
        self.items.lock().unwrap().pop_front()
    }

    pub fn len(&self) -> usize {
        self.items.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for DripQueue {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn region() -> Arc<SharedRegion> {
        // 4 nodes, 64-byte blocks of two 32-byte chunks, 16-byte subs.
        SharedRegion::new(1, 256, 32, 4, 2, 16).unwrap()
    }

    fn n(rank: u8) -> NodeId {
        NodeId::new(0, rank)
    }

    #[test]
    fn geometry_is_validated() {
        assert!(matches!(
            SharedRegion::new(1, 250, 32, 4, 2, 16),
            Err(Error::BadBufferGeometry { .. })
        ));
        assert!(matches!(
            SharedRegion::new(1, 256, 32, 4, 3, 16),
            Err(Error::UnsupportedLinkCount(3))
        ));
        assert!(matches!(
            SharedRegion::new(1, 256 * 32, 32 * 32, 4, 2, 1),
            Err(Error::ChunkTooManySubCommands { .. })
        ));
    }

    #[test]
    fn assignment_collision_matrix() {
        let r = region();
        // In twice with the same source: second is a no-op.
        assert!(matches!(
            r.create_assignment(0, Direction::In, NodeMask::single(n(1)), 64),
            Ok(CreateOutcome::Created(_))
        ));
        assert!(matches!(
            r.create_assignment(0, Direction::In, NodeMask::single(n(1)), 64),
            Ok(CreateOutcome::AlreadyExists(_))
        ));
        // In with a different source conflicts.
        assert!(matches!(
            r.create_assignment(0, Direction::In, NodeMask::single(n(2)), 64),
            Err(Error::AssignmentSourceConflict { .. })
        ));
        // Out after In is the forwarding case and records the start index.
        assert!(r.forward_start().is_none());
        assert!(matches!(
            r.create_assignment(0, Direction::Out, NodeMask::single(n(3)), 64),
            Ok(CreateOutcome::Extended(_))
        ));
        assert_eq!(r.forward_start(), Some(0));
        // Out twice is fatal.
        assert!(matches!(
            r.create_assignment(0, Direction::Out, NodeMask::single(n(2)), 64),
            Err(Error::AssignmentDirectionConflict { .. })
        ));
        // Pure Out elsewhere, then In on top of it is fatal.
        assert!(matches!(
            r.create_assignment(64, Direction::Out, NodeMask::single(n(1)), 64),
            Ok(CreateOutcome::Created(_))
        ));
        assert!(matches!(
            r.create_assignment(64, Direction::In, NodeMask::single(n(1)), 64),
            Err(Error::AssignmentDirectionConflict { .. })
        ));
    }

    #[test]
    fn overlapping_ranges_are_rejected() {
        let r = region();
        r.create_assignment(0, Direction::In, NodeMask::single(n(1)), 64)
            .unwrap();
        assert!(matches!(
            r.create_assignment(32, Direction::In, NodeMask::single(n(2)), 64),
            Err(Error::InvalidArgument(_))
        ));
    }

    #[test]
    fn readiness_is_memoized_until_hold() {
        let r = region();
        // Chunk 0 on both links, two subs each.
        for slot in 0..2 {
            assert!(!r.mark_sub_arrival(0, slot, 0, 0));
            assert!(r.mark_sub_arrival(0, slot, 1, 0xbeef));
        }
        assert!(r.check_ready(0).unwrap());
        // Duplicate arrival does not disturb the ready flag.
        assert!(!r.mark_sub_arrival(0, 0, 1, 0xbeef));
        assert!(r.check_ready(0).unwrap());
        r.hold(0);
        assert!(!r.check_ready(0).unwrap());
        assert_eq!(r.arrived_bits(0, 0), 0);
    }

    #[test]
    fn trailer_mismatch_faults_the_region() {
        let r = region();
        for sub in 0..2 {
            r.mark_sub_arrival(0, 0, sub, 0xaaaa);
        }
        for sub in 0..2 {
            r.mark_sub_arrival(0, 1, sub, 0xbbbb);
        }
        assert!(matches!(
            r.check_ready(0),
            Err(Error::TrailerMismatch {
                primary: 0xaaaa,
                secondary: 0xbbbb,
                ..
            })
        ));
        assert!(r.interrupted());
    }

    #[test]
    fn sub_ranges_cover_the_chunk() {
        let r = region();
        assert_eq!(r.sub_range(32, 0), (32, 16));
        assert_eq!(r.sub_range(32, 1), (48, 16));
        r.write_sub(32, 1, &[7u8; 16]);
        assert_eq!(r.read_sub(32, 1), vec![7u8; 16]);
        assert_eq!(r.read_sub(32, 0), vec![0u8; 16]);
    }

    #[tokio::test]
    async fn timeout_interrupts_the_region() {
        let r = region();
        let err = r
            .wait_chunk_ready(0, Duration::from_millis(5), Duration::from_millis(1))
            .await
            .unwrap_err();
        assert_eq!(err, Error::TimedOut);
        assert!(r.interrupted());
        // Other waiters now fail fast.
        let err = r
            .wait_chunk_ready(32, Duration::from_secs(5), Duration::from_millis(1))
            .await
            .unwrap_err();
        assert_eq!(err, Error::Interrupted);
    }

    #[tokio::test]
    async fn interrupt_fences_every_waiter() {
        let r = region();
        let mut waiters = Vec::new();
        for chunk in [0u64, 32, 64] {
            let r = r.clone();
            waiters.push(tokio::spawn(async move {
                r.wait_chunk_ready(chunk, Duration::from_secs(10), Duration::from_millis(1))
                    .await
            }));
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
        r.interrupt_io_threads();
        for waiter in waiters {
            assert_eq!(waiter.await.unwrap(), Err(Error::Interrupted));
        }
        r.clear_interrupt_state();
        assert!(!r.interrupted());
    }

    #[test]
    fn inflight_gate_bounds_prepared_bytes() {
        let gate = InflightGate::new(64);
        assert!(gate.try_acquire(32));
        assert!(gate.try_acquire(32));
        assert!(!gate.try_acquire(1));
        gate.release(32);
        assert!(gate.try_acquire(16));
        assert_eq!(gate.in_flight(), 48);
    }

    #[test]
    fn tx_readiness_counts_chunk_completions() {
        let r = region();
        let outcome = r
            .create_assignment(0, Direction::Out, NodeMask::single(n(1)), 64)
            .unwrap();
        let a = outcome.assignment().clone();
        a.note_tx_chunk_done(0);
        a.note_tx_chunk_done(1);
        assert!(!a.check_tx_ready(2));
        a.note_tx_chunk_done(0);
        a.note_tx_chunk_done(1);
        assert!(a.check_tx_ready(2));
        a.reset_tx();
        assert!(!a.check_tx_ready(2));
    }
}
