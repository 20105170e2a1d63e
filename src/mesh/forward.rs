use std::sync::atomic::{AtomicBool, AtomicU16, AtomicU32, AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, Mutex};

use hashbrown::HashMap;
use tracing::{debug, warn};

use super::net::error::Error;
use super::net::link::{CompletionStatus, PathIndex, TransferId};
use super::net::{NodeId, RegionId, MAX_LINKS_PER_CHANNEL};
use super::region::SharedRegion;

pub type ActionHandle = u32;
pub type ChainHandle = u32;

/// Relay pipeline stages for one chunk. A chunk's outbound transfer is
/// prepared ahead of its data, flows sub-command by sub-command as the
/// inbound side lands, and completes strictly after its chain predecessor.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ForwardState {
    WaitingRxStart = 0,
    /// In a chain element whose pipeline group has not been prepared yet.
    WaitingPrepare = 1,
    /// Prepare now (or retry a prepare the transport previously refused).
    StartTxPrepare = 2,
    WaitingPreviousTxComplete = 3,
    TxReadyToFlow = 4,
    WaitingTxFlowComplete = 5,
    /// Everything submitted so far is confirmed; more inbound subs pending.
    WaitingRxFlow = 6,
    PrepareOrComplete = 7,
    Disabled = 8,
}

impl ForwardState {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => ForwardState::WaitingRxStart,
            1 => ForwardState::WaitingPrepare,
            2 => ForwardState::StartTxPrepare,
            3 => ForwardState::WaitingPreviousTxComplete,
            4 => ForwardState::TxReadyToFlow,
            5 => ForwardState::WaitingTxFlowComplete,
            6 => ForwardState::WaitingRxFlow,
            7 => ForwardState::PrepareOrComplete,
            _ => ForwardState::Disabled,
        }
    }
}

/// Outbound half of a relay leg: which channel, which of its links, and
/// which data path carries the traffic.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OutLeg {
    pub channel: usize,
    pub link_slot: usize,
    pub path: PathIndex,
}

/// One in-flight relay of a single chunk through this node. All mutable
/// state is atomic; the forwarder core lock only guards the tables that
/// find actions, never the per-action hot path.
pub struct ForwardAction {
    region: RegionId,
    offset: u64,
    source: NodeId,
    receiver: NodeId,
    leg: OutLeg,
    /// Inbound link slot this action tracks. Even chain positions ride the
    /// primary link, odd the secondary; behavior past two links per
    /// channel is undefined and rejected at configuration.
    in_slot: usize,
    sub_count: u8,
    prev: Option<ActionHandle>,
    next: Option<ActionHandle>,
    /// Companion action on the other physical link, kept in lock-step.
    carry: Option<ActionHandle>,
    driver_chain: ChainHandle,
    element: usize,
    state: AtomicU8,
    transfer: AtomicU64,
    submitted: AtomicU16,
    confirmed: AtomicU16,
    prepared: AtomicBool,
    done: AtomicBool,
}

impl ForwardAction {
    pub fn state(&self) -> ForwardState {
        ForwardState::from_u8(self.state.load(Ordering::Acquire))
    }

    fn set_state(&self, state: ForwardState) {
        self.state.store(state as u8, Ordering::Release);
    }

    pub fn done(&self) -> bool {
        self.done.load(Ordering::Acquire)
    }

    pub fn prepared(&self) -> bool {
        self.prepared.load(Ordering::Acquire)
    }

    fn transfer(&self) -> TransferId {
        self.transfer.load(Ordering::Acquire)
    }

    fn submitted(&self) -> u16 {
        self.submitted.load(Ordering::Acquire)
    }

    fn confirmed(&self) -> u16 {
        self.confirmed.load(Ordering::Acquire)
    }

    pub fn offset(&self) -> u64 {
        self.offset
    }

    pub fn source(&self) -> NodeId {
        self.source
    }

    pub fn receiver(&self) -> NodeId {
        self.receiver
    }
}

/// Precomputed pipeline of the relays for one leg over one physical link.
/// The chain on the primary link drives group advancement; its partner on
/// the secondary link moves in lock-step and stops with it.
struct ForwardChain {
    actions: Vec<ActionHandle>,
    region: RegionId,
    group_size: usize,
    /// Elements staged into the transport queue so far. The next group is
    /// prepared only once the current one fully drains, bounding how far
    /// the pipeline runs ahead of the hardware.
    prepared_elements: usize,
    completed_elements: usize,
    partner: Option<ChainHandle>,
    is_driver: bool,
    stopped: bool,
}

/// What the forwarder needs from its surroundings. The fabric implements
/// this against real channels; tests drive the state machine directly.
pub trait ForwardContext {
    fn region(&self, id: RegionId) -> Option<Arc<SharedRegion>>;
    /// Stage one chunk into the out leg's transport queue.
    fn prepare_transfer(&self, leg: &OutLeg, region: RegionId, offset: u64) -> Result<TransferId, Error>;
    /// Submit the sub-commands in `bits` against a prepared transfer.
    fn submit_subs(
        &self,
        leg: &OutLeg,
        transfer: TransferId,
        region: RegionId,
        offset: u64,
        bits: u16,
    ) -> Result<(), Error>;
    /// One relayed chunk fully confirmed on its leg.
    fn forward_complete(&self, region: RegionId, offset: u64, receiver: NodeId);
    /// A transmit completion reported failure.
    fn transfer_failed(&self, region: RegionId, status: CompletionStatus);
}

/// Everything needed to build the relay pipeline for one (source,
/// receiver) leg passing through this node.
#[derive(Clone)]
pub struct LegSpec {
    pub region: RegionId,
    pub source: NodeId,
    pub receiver: NodeId,
    /// Chunk offsets in relay order.
    pub chunks: Vec<u64>,
    pub group_size: usize,
    pub link_count: usize,
    pub legs: [OutLeg; MAX_LINKS_PER_CHANNEL],
    pub sub_count: u8,
}

struct Core {
    actions: Vec<Option<Arc<ForwardAction>>>,
    free_actions: Vec<ActionHandle>,
    chains: Vec<Option<ForwardChain>>,
    free_chains: Vec<ChainHandle>,
    by_chunk: HashMap<(RegionId, u64), Vec<ActionHandle>>,
    by_transfer: HashMap<TransferId, ActionHandle>,
}

impl Core {
    fn action(&self, h: ActionHandle) -> Option<Arc<ForwardAction>> {
        self.actions.get(h as usize).and_then(|a| a.clone())
    }

    fn alloc_action(&mut self, capacity: usize, action: ForwardAction) -> Result<ActionHandle, Error> {
        if let Some(h) = self.free_actions.pop() {
            self.actions[h as usize] = Some(Arc::new(action));
            return Ok(h);
        }
        if self.actions.len() >= capacity {
            return Err(Error::ForwardPoolExhausted);
        }
        let h = self.actions.len() as ActionHandle;
        self.actions.push(Some(Arc::new(action)));
        Ok(h)
    }

    fn alloc_chain(&mut self, capacity: usize, chain: ForwardChain) -> Result<ChainHandle, Error> {
        if let Some(h) = self.free_chains.pop() {
            self.chains[h as usize] = Some(chain);
            return Ok(h);
        }
        if self.chains.len() >= capacity {
            return Err(Error::ChainPoolExhausted);
        }
        let h = self.chains.len() as ChainHandle;
        self.chains.push(Some(chain));
        Ok(h)
    }
}

/// The relay engine. Owns the bounded pools of actions and chains; both
/// are sized from the fixed mesh, so running out is a configuration fault
/// rather than a load condition.
pub struct Forwarder {
    core: Mutex<Core>,
    /// Commandeer slot: 0 when free, otherwise handle + 1. A single
    /// compare-and-swap slot means at most one helper per fabric.
    help_slot: AtomicU32,
    paused: AtomicBool,
    action_capacity: usize,
    chain_capacity: usize,
}

impl Forwarder {
    pub fn new(action_capacity: usize, chain_capacity: usize) -> Self {
        Self {
            core: Mutex::new(Core {
                actions: Vec::new(),
                free_actions: Vec::new(),
                chains: Vec::new(),
                free_chains: Vec::new(),
                by_chunk: HashMap::new(),
                by_transfer: HashMap::new(),
            }),
            help_slot: AtomicU32::new(0),
            paused: AtomicBool::new(false),
            action_capacity,
            chain_capacity,
        }
    }

    pub fn paused(&self) -> bool {
        self.paused.load(Ordering::Acquire)
    }

    pub fn outstanding(&self) -> usize {
        self.core
            .lock()
            .unwrap()
            .actions
            .iter()
            .filter(|a| a.is_some())
            .count()
    }

    pub fn action(&self, h: ActionHandle) -> Option<Arc<ForwardAction>> {
        self.core.lock().unwrap().action(h)
    }

    /// Builds the chain (pair) for one relay leg and prepares its first
    /// pipeline group. Returns the driver chain's handle.
    pub fn build_leg(&self, ctx: &dyn ForwardContext, spec: LegSpec) -> Result<ChainHandle, Error> {
        if spec.chunks.is_empty() || spec.group_size == 0 {
            return Err(Error::InvalidArgument("empty forward leg"));
        }
        if spec.link_count == 0 || spec.link_count > MAX_LINKS_PER_CHANNEL {
            return Err(Error::UnsupportedLinkCount(spec.link_count));
        }
        let region = ctx.region(spec.region).ok_or(Error::UnknownRegion(spec.region))?;

        let mut core = self.core.lock().unwrap();
        let driver = core.alloc_chain(
            self.chain_capacity,
            ForwardChain {
                actions: Vec::with_capacity(spec.chunks.len()),
                region: spec.region,
                group_size: spec.group_size,
                prepared_elements: 0,
                completed_elements: 0,
                partner: None,
                is_driver: true,
                stopped: false,
            },
        )?;
        let partner = if spec.link_count == 2 {
            let h = core.alloc_chain(
                self.chain_capacity,
                ForwardChain {
                    actions: Vec::with_capacity(spec.chunks.len()),
                    region: spec.region,
                    group_size: spec.group_size,
                    prepared_elements: 0,
                    completed_elements: 0,
                    partner: Some(driver),
                    is_driver: false,
                    stopped: false,
                },
            )?;
            core.chains[driver as usize].as_mut().unwrap().partner = Some(h);
            Some(h)
        } else {
            None
        };

        // Allocate element by element, interleaving links: even positions
        // drive the primary link, odd the secondary.
        let mut prev: [Option<ActionHandle>; MAX_LINKS_PER_CHANNEL] = [None, None];
        let mut element_handles: Vec<[Option<ActionHandle>; MAX_LINKS_PER_CHANNEL]> = Vec::new();
        for (element, &offset) in spec.chunks.iter().enumerate() {
            let mut handles = [None, None];
            for slot in 0..spec.link_count {
                let position = element * spec.link_count + slot;
                let in_slot = position % spec.link_count.max(1);
                let action = ForwardAction {
                    region: spec.region,
                    offset,
                    source: spec.source,
                    receiver: spec.receiver,
                    leg: spec.legs[slot],
                    in_slot,
                    sub_count: spec.sub_count,
                    prev: prev[slot],
                    next: None,
                    carry: None,
                    driver_chain: driver,
                    element,
                    state: AtomicU8::new(ForwardState::WaitingRxStart as u8),
                    transfer: AtomicU64::new(0),
                    submitted: AtomicU16::new(0),
                    confirmed: AtomicU16::new(0),
                    prepared: AtomicBool::new(false),
                    done: AtomicBool::new(false),
                };
                let h = core.alloc_action(self.action_capacity, action)?;
                handles[slot] = Some(h);
                prev[slot] = Some(h);
                region.begin_forward();
                let chain_h = if slot == 0 { driver } else { partner.unwrap() };
                core.chains[chain_h as usize].as_mut().unwrap().actions.push(h);
                core.by_chunk
                    .entry((spec.region, offset))
                    .or_default()
                    .push(h);
            }
            element_handles.push(handles);
        }

        // Back-fill next and carry pointers now that every handle exists.
        // Actions are not shared with any other context until this lock
        // drops, so the one-time writes below are safe.
        for (element, handles) in element_handles.iter().enumerate() {
            for slot in 0..spec.link_count {
                let h = handles[slot].unwrap();
                let next = element_handles.get(element + 1).and_then(|n| n[slot]);
                let carry = handles[1 - slot].filter(|_| spec.link_count == 2);
                let arc = core.actions[h as usize].as_mut().unwrap();
                let action = Arc::get_mut(arc).expect("freshly built action is unshared");
                action.next = next;
                action.carry = carry;
            }
        }

        let mut work = Vec::new();
        Self::prepare_window(&mut core, ctx, driver, 0, spec.group_size.min(spec.chunks.len()), &mut work);
        self.run(&mut core, ctx, work);
        debug!(
            region = spec.region,
            source = %spec.source,
            receiver = %spec.receiver,
            chunks = spec.chunks.len(),
            "forward leg built"
        );
        Ok(driver)
    }

    pub fn chain_stopped(&self, chain: ChainHandle) -> bool {
        self.core.lock().unwrap().chains[chain as usize]
            .as_ref()
            .map_or(true, |c| c.stopped)
    }

    /// Inbound progress landed on a chunk some relay is waiting on.
    pub fn on_rx_progress(&self, ctx: &dyn ForwardContext, region: RegionId, chunk_offset: u64) {
        if self.paused() {
            return;
        }
        let mut core = self.core.lock().unwrap();
        let Some(handles) = core.by_chunk.get(&(region, chunk_offset)).cloned() else {
            return;
        };
        self.run(&mut core, ctx, handles);
    }

    /// Transmit completion for a forwarded transfer. Unknown transfer ids
    /// belong to the direct send path and are ignored here.
    pub fn on_tx_complete(
        &self,
        ctx: &dyn ForwardContext,
        transfer: TransferId,
        bits: u16,
        status: CompletionStatus,
    ) {
        let mut core = self.core.lock().unwrap();
        let Some(&h) = core.by_transfer.get(&transfer) else {
            return;
        };
        let Some(action) = core.action(h) else { return };
        if status != CompletionStatus::Success {
            ctx.transfer_failed(action.region, status);
            return;
        }
        action.confirmed.fetch_or(bits, Ordering::AcqRel);
        if self.paused() {
            return;
        }
        self.run(&mut core, ctx, vec![h]);
    }

    /// Claims the commandeer slot for one action. At most one helper may
    /// hold the slot; a second caller fails until the first clears it.
    pub fn commandeer_forward_help(&self, h: ActionHandle) -> bool {
        self.help_slot
            .compare_exchange(0, h + 1, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    pub fn clear_commandeer_forward_help(&self) {
        self.help_slot.store(0, Ordering::Release);
    }

    /// Steals one stalled action, drives it, releases the slot. Called from
    /// the commandeer loop to cover the forwarder being busy elsewhere.
    pub fn commandeer_once(&self, ctx: &dyn ForwardContext) -> bool {
        if self.paused() {
            return false;
        }
        let candidate = {
            let core = self.core.lock().unwrap();
            core.actions
                .iter()
                .enumerate()
                .filter_map(|(i, a)| a.as_ref().map(|a| (i as ActionHandle, a.clone())))
                .find(|(_, a)| {
                    !a.done()
                        && matches!(
                            a.state(),
                            ForwardState::StartTxPrepare
                                | ForwardState::WaitingPreviousTxComplete
                                | ForwardState::TxReadyToFlow
                                | ForwardState::WaitingRxFlow
                        )
                })
                .map(|(h, _)| h)
        };
        let Some(h) = candidate else {
            return false;
        };
        if !self.commandeer_forward_help(h) {
            return false;
        }
        let mut core = self.core.lock().unwrap();
        self.run(&mut core, ctx, vec![h]);
        drop(core);
        self.clear_commandeer_forward_help();
        true
    }

    /// First phase of tearing a region out of the relay engine: stop every
    /// transition and pause new dispatch until cleanup finishes.
    pub fn disable_actions_for_region(&self, region: RegionId) {
        self.paused.store(true, Ordering::Release);
        let core = self.core.lock().unwrap();
        for action in core.actions.iter().flatten() {
            if action.region == region && !action.done() {
                action.set_state(ForwardState::Disabled);
            }
        }
        debug!(region, "forward actions disabled");
    }

    /// True once nothing for this region is still in flight on the wire.
    pub fn actions_drained_for_region(&self, region: RegionId) -> bool {
        let core = self.core.lock().unwrap();
        core.actions
            .iter()
            .flatten()
            .filter(|a| a.region == region)
            .all(|a| a.submitted() == a.confirmed())
    }

    /// Final phase: return the region's actions and chains to their pools
    /// and resume dispatch.
    pub fn cleanup_actions_for_region(&self, ctx: &dyn ForwardContext, region: RegionId) {
        let mut core = self.core.lock().unwrap();
        let shared = ctx.region(region);
        for i in 0..core.actions.len() {
            let Some(action) = core.actions[i].clone() else {
                continue;
            };
            if action.region != region {
                continue;
            }
            if !action.done() {
                if let Some(r) = &shared {
                    r.end_forward();
                }
            }
            core.actions[i] = None;
            core.free_actions.push(i as ActionHandle);
        }
        for i in 0..core.chains.len() {
            if core.chains[i].as_ref().is_some_and(|c| c.region == region) {
                core.chains[i] = None;
                core.free_chains.push(i as ChainHandle);
            }
        }
        core.by_chunk.retain(|(r, _), _| *r != region);
        let live: Vec<TransferId> = core
            .by_transfer
            .iter()
            .filter(|(_, h)| core.actions[**h as usize].is_none())
            .map(|(t, _)| *t)
            .collect();
        for t in live {
            core.by_transfer.remove(&t);
        }
        self.paused.store(false, Ordering::Release);
        debug!(region, "forward actions cleaned up");
    }

    fn run(&self, core: &mut Core, ctx: &dyn ForwardContext, mut work: Vec<ActionHandle>) {
        while let Some(h) = work.pop() {
            if Self::step_action(core, ctx, h, &mut work) {
                Self::complete_action(core, ctx, h, &mut work);
            }
        }
    }

    /// Runs one action's transition function to a fixed point. Returns
    /// true when it reached completion.
    fn step_action(core: &mut Core, ctx: &dyn ForwardContext, h: ActionHandle, work: &mut Vec<ActionHandle>) -> bool {
        let Some(a) = core.action(h) else {
            return false;
        };
        if a.done() {
            return false;
        }
        let Some(region) = ctx.region(a.region) else {
            return false;
        };
        // An interrupted region gets no further transitions until it is
        // disassociated and cleaned up.
        if region.interrupted() {
            return false;
        }
        loop {
            match a.state() {
                ForwardState::Disabled => return false,
                ForwardState::WaitingRxStart => {
                    if a.done() || region.arrived_bits(a.offset, a.in_slot) == 0 {
                        return false;
                    }
                    if a.prepared() {
                        a.set_state(ForwardState::WaitingPreviousTxComplete);
                        continue;
                    }
                    let window = core.chains[a.driver_chain as usize]
                        .as_ref()
                        .map_or(0, |c| c.prepared_elements);
                    if a.element < window {
                        a.set_state(ForwardState::StartTxPrepare);
                    } else {
                        a.set_state(ForwardState::WaitingPrepare);
                        return false;
                    }
                }
                ForwardState::WaitingPrepare => {
                    if !a.prepared() {
                        return false;
                    }
                    a.set_state(ForwardState::WaitingPreviousTxComplete);
                }
                ForwardState::StartTxPrepare => match ctx.prepare_transfer(&a.leg, a.region, a.offset) {
                    Ok(tid) => {
                        a.transfer.store(tid, Ordering::Release);
                        core.by_transfer.insert(tid, h);
                        a.prepared.store(true, Ordering::Release);
                        if let Some(c) = a.carry {
                            work.push(c);
                        }
                        a.set_state(ForwardState::WaitingPreviousTxComplete);
                    }
                    // Transport queue full; the commandeer helper retries.
                    Err(_) => return false,
                },
                ForwardState::WaitingPreviousTxComplete => {
                    let prev_done = a
                        .prev
                        .map_or(true, |p| core.action(p).map_or(true, |pa| pa.done()));
                    let carry_prepared = a
                        .carry
                        .map_or(true, |c| core.action(c).map_or(true, |ca| ca.prepared()));
                    if !prev_done || !carry_prepared {
                        return false;
                    }
                    a.set_state(ForwardState::TxReadyToFlow);
                }
                ForwardState::TxReadyToFlow => {
                    let arrived = region.arrived_bits(a.offset, a.in_slot);
                    let pending = arrived & !a.submitted();
                    if pending == 0 {
                        return false;
                    }
                    let tid = a.transfer();
                    if tid == 0 {
                        return false;
                    }
                    match ctx.submit_subs(&a.leg, tid, a.region, a.offset, pending) {
                        Ok(()) => {
                            a.submitted.fetch_or(pending, Ordering::AcqRel);
                            a.set_state(ForwardState::WaitingTxFlowComplete);
                        }
                        Err(e) => {
                            warn!(region = a.region, offset = a.offset, ?e, "relay submit failed");
                            return false;
                        }
                    }
                }
                ForwardState::WaitingTxFlowComplete => {
                    let submitted = a.submitted();
                    if a.confirmed() != submitted {
                        return false;
                    }
                    if submitted.count_ones() as u8 == a.sub_count {
                        a.set_state(ForwardState::PrepareOrComplete);
                        continue;
                    }
                    if region.arrived_bits(a.offset, a.in_slot) & !submitted != 0 {
                        a.set_state(ForwardState::TxReadyToFlow);
                    } else {
                        a.set_state(ForwardState::WaitingRxFlow);
                        return false;
                    }
                }
                ForwardState::WaitingRxFlow => {
                    if region.arrived_bits(a.offset, a.in_slot) & !a.submitted() == 0 {
                        return false;
                    }
                    a.set_state(ForwardState::TxReadyToFlow);
                }
                ForwardState::PrepareOrComplete => return true,
            }
        }
    }

    fn complete_action(core: &mut Core, ctx: &dyn ForwardContext, h: ActionHandle, work: &mut Vec<ActionHandle>) {
        let Some(a) = core.action(h) else { return };
        a.done.store(true, Ordering::Release);
        a.set_state(ForwardState::WaitingRxStart);
        if let Some(next) = a.next {
            work.push(next);
        }
        if let Some(region) = ctx.region(a.region) {
            region.end_forward();
        }

        let element_done = a
            .carry
            .map_or(true, |c| core.action(c).map_or(true, |ca| ca.done()));
        if !element_done {
            return;
        }
        ctx.forward_complete(a.region, a.offset, a.receiver);

        let driver = a.driver_chain;
        let advance = {
            let Some(chain) = core.chains[driver as usize].as_mut() else {
                return;
            };
            debug_assert!(chain.is_driver);
            chain.completed_elements += 1;
            let total = chain.actions.len();
            if chain.completed_elements >= total {
                chain.stopped = true;
                let partner = chain.partner;
                if let Some(p) = partner {
                    if let Some(pc) = core.chains[p as usize].as_mut() {
                        pc.stopped = true;
                    }
                }
                debug!(region = a.region, "forward chain stopped");
                return;
            }
            let ready = chain.completed_elements >= chain.prepared_elements
                && chain.prepared_elements < total;
            let start = chain.prepared_elements;
            let end = (start + chain.group_size).min(total);
            ready.then_some((start, end))
        };
        if let Some((start, end)) = advance {
            Self::prepare_window(core, ctx, driver, start, end, work);
        }
    }

    /// Prepares elements `[start, end)` on the driver chain and its
    /// partner, in lock-step.
    fn prepare_window(
        core: &mut Core,
        ctx: &dyn ForwardContext,
        driver: ChainHandle,
        start: usize,
        end: usize,
        work: &mut Vec<ActionHandle>,
    ) {
        let mut chain_handles = vec![driver];
        if let Some(p) = core.chains[driver as usize].as_ref().and_then(|c| c.partner) {
            chain_handles.push(p);
        }
        for &ch in &chain_handles {
            if let Some(chain) = core.chains[ch as usize].as_mut() {
                chain.prepared_elements = end;
            }
        }
        for ch in chain_handles {
            for element in start..end {
                let Some(&ah) = core.chains[ch as usize]
                    .as_ref()
                    .and_then(|c| c.actions.get(element))
                else {
                    continue;
                };
                let Some(a) = core.action(ah) else { continue };
                if a.prepared() {
                    continue;
                }
                match ctx.prepare_transfer(&a.leg, a.region, a.offset) {
                    Ok(tid) => {
                        a.transfer.store(tid, Ordering::Release);
                        core.by_transfer.insert(tid, ah);
                        a.prepared.store(true, Ordering::Release);
                        work.push(ah);
                    }
                    Err(_) => {
                        // Left unprepared; the rx-start path retries it as
                        // StartTxPrepare once data shows up.
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mesh::net::NodeMask;
    use crate::mesh::region::Direction;
    use std::sync::atomic::AtomicU64 as TestAtomicU64;

    struct MockCtx {
        region: Arc<SharedRegion>,
        next_tid: TestAtomicU64,
        submits: Mutex<Vec<(TransferId, u64, u16, usize)>>,
        completed: Mutex<Vec<u64>>,
        fail_prepare: AtomicBool,
    }

    impl MockCtx {
        fn new(region: Arc<SharedRegion>) -> Self {
            Self {
                region,
                next_tid: TestAtomicU64::new(1),
                submits: Mutex::new(Vec::new()),
                completed: Mutex::new(Vec::new()),
                fail_prepare: AtomicBool::new(false),
            }
        }

        fn take_submits(&self) -> Vec<(TransferId, u64, u16, usize)> {
            std::mem::take(&mut self.submits.lock().unwrap())
        }

        fn completed(&self) -> Vec<u64> {
            self.completed.lock().unwrap().clone()
        }
    }

    impl ForwardContext for MockCtx {
        fn region(&self, id: RegionId) -> Option<Arc<SharedRegion>> {
            (self.region.id() == id).then(|| self.region.clone())
        }

        fn prepare_transfer(&self, _leg: &OutLeg, _region: RegionId, _offset: u64) -> Result<TransferId, Error> {
            if self.fail_prepare.load(Ordering::Acquire) {
                return Err(Error::LinkDetached);
            }
            Ok(self.next_tid.fetch_add(1, Ordering::Relaxed))
        }

        fn submit_subs(
            &self,
            leg: &OutLeg,
            transfer: TransferId,
            _region: RegionId,
            offset: u64,
            bits: u16,
        ) -> Result<(), Error> {
            self.submits.lock().unwrap().push((transfer, offset, bits, leg.link_slot));
            Ok(())
        }

        fn forward_complete(&self, _region: RegionId, offset: u64, _receiver: NodeId) {
            self.completed.lock().unwrap().push(offset);
        }

        fn transfer_failed(&self, _region: RegionId, _status: CompletionStatus) {
            self.region.interrupt_io_threads();
        }
    }

    fn test_region(link_count: usize) -> Arc<SharedRegion> {
        // 4 nodes, 128-byte blocks, 32-byte chunks, 16-byte subs.
        SharedRegion::new(9, 512, 32, 4, link_count, 16).unwrap()
    }

    fn leg_spec(region: &SharedRegion, chunks: Vec<u64>, group: usize, link_count: usize) -> LegSpec {
        LegSpec {
            region: region.id(),
            source: NodeId::new(0, 0),
            receiver: NodeId::new(0, 2),
            chunks,
            group_size: group,
            link_count,
            legs: [
                OutLeg { channel: 1, link_slot: 0, path: 0 },
                OutLeg { channel: 1, link_slot: 1, path: 0 },
            ],
            sub_count: region.sub_count(),
        }
    }

    /// Feeds every sub-command of a chunk on the given link slots.
    fn arrive_chunk(fwd: &Forwarder, ctx: &MockCtx, offset: u64, slots: &[usize]) {
        for sub in 0..ctx.region.sub_count() {
            for &slot in slots {
                ctx.region.mark_sub_arrival(offset, slot, sub, 0x42);
            }
            fwd.on_rx_progress(ctx, ctx.region.id(), offset);
        }
    }

    /// Confirms every submit the mock transport has accepted so far.
    fn drain_completions(fwd: &Forwarder, ctx: &MockCtx) {
        loop {
            let submits = ctx.take_submits();
            if submits.is_empty() {
                return;
            }
            for (tid, _, bits, _) in submits {
                fwd.on_tx_complete(ctx, tid, bits, CompletionStatus::Success);
            }
        }
    }

    #[test]
    fn completions_are_fifo_per_leg() {
        let region = test_region(1);
        let ctx = MockCtx::new(region.clone());
        let fwd = Forwarder::new(64, 8);
        region
            .create_assignment(0, Direction::In, NodeMask::single(NodeId::new(0, 0)), 128)
            .unwrap();
        fwd.build_leg(&ctx, leg_spec(&region, vec![0, 32, 64, 96], 4, 1)).unwrap();

        // Later chunks arrive first; nothing may complete out of order.
        arrive_chunk(&fwd, &ctx, 96, &[0]);
        arrive_chunk(&fwd, &ctx, 64, &[0]);
        drain_completions(&fwd, &ctx);
        assert_eq!(ctx.completed(), Vec::<u64>::new());

        arrive_chunk(&fwd, &ctx, 0, &[0]);
        arrive_chunk(&fwd, &ctx, 32, &[0]);
        drain_completions(&fwd, &ctx);
        assert_eq!(ctx.completed(), vec![0, 32, 64, 96]);
    }

    #[test]
    fn cut_through_submits_partial_chunks() {
        let region = test_region(1);
        let ctx = MockCtx::new(region.clone());
        let fwd = Forwarder::new(16, 4);
        fwd.build_leg(&ctx, leg_spec(&region, vec![0], 1, 1)).unwrap();

        // First sub-command lands; the relay transmits it without waiting
        // for the rest of the chunk.
        region.mark_sub_arrival(0, 0, 0, 0);
        fwd.on_rx_progress(&ctx, region.id(), 0);
        let first = ctx.take_submits();
        assert_eq!(first.len(), 1);
        assert_eq!(first[0].2, 0b01);
        fwd.on_tx_complete(&ctx, first[0].0, first[0].2, CompletionStatus::Success);

        region.mark_sub_arrival(0, 0, 1, 0x42);
        fwd.on_rx_progress(&ctx, region.id(), 0);
        let second = ctx.take_submits();
        assert_eq!(second.len(), 1);
        assert_eq!(second[0].2, 0b10);
        fwd.on_tx_complete(&ctx, second[0].0, second[0].2, CompletionStatus::Success);
        assert_eq!(ctx.completed(), vec![0]);
    }

    #[test]
    fn carry_partners_move_in_lock_step() {
        let region = test_region(2);
        let ctx = MockCtx::new(region.clone());
        let fwd = Forwarder::new(16, 4);
        fwd.build_leg(&ctx, leg_spec(&region, vec![0, 32], 2, 2)).unwrap();

        arrive_chunk(&fwd, &ctx, 0, &[0, 1]);
        let first = ctx.take_submits();
        let slots: Vec<usize> = first.iter().map(|s| s.3).collect();
        assert!(slots.contains(&0) && slots.contains(&1));
        for (tid, _, bits, _) in first {
            fwd.on_tx_complete(&ctx, tid, bits, CompletionStatus::Success);
        }
        drain_completions(&fwd, &ctx);
        // One completion per element even though two links carried it.
        assert_eq!(ctx.completed(), vec![0]);

        arrive_chunk(&fwd, &ctx, 32, &[0, 1]);
        drain_completions(&fwd, &ctx);
        assert_eq!(ctx.completed(), vec![0, 32]);
    }

    #[test]
    fn groups_bound_pipeline_run_ahead() {
        let region = test_region(1);
        let ctx = MockCtx::new(region.clone());
        let fwd = Forwarder::new(64, 8);
        let chain = fwd
            .build_leg(&ctx, leg_spec(&region, vec![0, 32, 64, 96], 2, 1))
            .unwrap();

        // Only the first group is prepared up front.
        {
            let core = fwd.core.lock().unwrap();
            let prepared: usize = core
                .actions
                .iter()
                .flatten()
                .filter(|a| a.prepared())
                .count();
            assert_eq!(prepared, 2);
        }

        for offset in [0u64, 32, 64, 96] {
            arrive_chunk(&fwd, &ctx, offset, &[0]);
            drain_completions(&fwd, &ctx);
        }
        assert_eq!(ctx.completed(), vec![0, 32, 64, 96]);
        assert!(fwd.chain_stopped(chain));
    }

    #[test]
    fn commandeer_slot_is_exclusive() {
        let fwd = Forwarder::new(16, 4);
        assert!(fwd.commandeer_forward_help(3));
        assert!(!fwd.commandeer_forward_help(3));
        assert!(!fwd.commandeer_forward_help(5));
        fwd.clear_commandeer_forward_help();
        assert!(fwd.commandeer_forward_help(5));
        fwd.clear_commandeer_forward_help();
    }

    #[test]
    fn commandeer_retries_refused_prepares() {
        let region = test_region(1);
        let ctx = MockCtx::new(region.clone());
        let fwd = Forwarder::new(16, 4);
        ctx.fail_prepare.store(true, Ordering::Release);
        fwd.build_leg(&ctx, leg_spec(&region, vec![0], 1, 1)).unwrap();

        // Data arrives while the transport queue is refusing prepares.
        region.mark_sub_arrival(0, 0, 0, 0);
        region.mark_sub_arrival(0, 0, 1, 0x42);
        fwd.on_rx_progress(&ctx, region.id(), 0);
        assert!(ctx.take_submits().is_empty());

        ctx.fail_prepare.store(false, Ordering::Release);
        assert!(fwd.commandeer_once(&ctx));
        drain_completions(&fwd, &ctx);
        assert_eq!(ctx.completed(), vec![0]);
    }

    #[test]
    fn interrupted_region_freezes_transitions() {
        let region = test_region(1);
        let ctx = MockCtx::new(region.clone());
        let fwd = Forwarder::new(16, 4);
        fwd.build_leg(&ctx, leg_spec(&region, vec![0], 1, 1)).unwrap();

        region.interrupt_io_threads();
        arrive_chunk(&fwd, &ctx, 0, &[0]);
        assert!(ctx.take_submits().is_empty());
        assert!(ctx.completed().is_empty());
    }

    #[test]
    fn disable_drain_cleanup_returns_the_pool() {
        let region = test_region(1);
        let ctx = MockCtx::new(region.clone());
        let fwd = Forwarder::new(16, 4);
        fwd.build_leg(&ctx, leg_spec(&region, vec![0, 32], 2, 1)).unwrap();
        assert_eq!(region.outstanding_forwards(), 2);

        region.interrupt_io_threads();
        fwd.disable_actions_for_region(region.id());
        assert!(fwd.paused());
        assert!(fwd.actions_drained_for_region(region.id()));
        fwd.cleanup_actions_for_region(&ctx, region.id());
        assert!(!fwd.paused());
        assert_eq!(fwd.outstanding(), 0);
        assert_eq!(region.outstanding_forwards(), 0);
        assert!(region.can_release());
    }

    #[test]
    fn pool_exhaustion_is_a_hard_error() {
        let region = test_region(1);
        let ctx = MockCtx::new(region.clone());
        let fwd = Forwarder::new(1, 4);
        assert!(matches!(
            fwd.build_leg(&ctx, leg_spec(&region, vec![0, 32], 2, 1)),
            Err(Error::ForwardPoolExhausted)
        ));
    }
}
