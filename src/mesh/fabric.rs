use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::{Duration, Instant};

use hashbrown::HashMap;
use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender};
use tokio::sync::watch;
use tracing::{debug, debug_span, trace, warn};

use super::config::FabricConfig;
use super::forward::{ForwardContext, Forwarder, OutLeg};
use super::net::channel::Channel;
use super::net::error::Error;
use super::net::link::{
    CompletionStatus, DataFrame, Link, LinkEvent, LinkId, PathIndex, PreparedTransfer,
    TransferDescriptor, TransferId,
};
use super::net::router::{CommandRouter, ForwardNotice};
use super::net::wire::{raw_message, ControlFrame, ControlMessage};
use super::net::{NodeId, RegionId, MAX_NODES};
use super::region::{DripItem, DripQueue, InflightGate, SharedRegion};

/// Latest channel readiness transition, published to subscribers.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChannelChange {
    pub partner: Option<NodeId>,
    pub ready: bool,
    pub verified: bool,
}

pub(crate) struct ChannelTable {
    pub list: Vec<Channel>,
    pub by_partner: HashMap<NodeId, usize>,
    pub by_link: HashMap<LinkId, usize>,
}

struct PreparedEntry {
    prepared: PreparedTransfer,
    region: RegionId,
    offset: u64,
    link_slot: usize,
    sub_count: u8,
    bytes: usize,
    confirmed: u16,
    forward: bool,
}

pub(crate) struct Inner {
    pub config: FabricConfig,
    pub local: NodeId,
    pub hardware_id: u64,
    pub claimed: AtomicBool,
    /// Claim nonce; regenerated on every successful claim.
    pub generation: AtomicU32,
    pub barrier_round: AtomicU32,
    pub barrier_seen: [AtomicU32; MAX_NODES],
    pub links: Mutex<HashMap<LinkId, Arc<dyn Link>>>,
    pub channels: Mutex<ChannelTable>,
    pub router: Mutex<CommandRouter>,
    pub regions: Mutex<HashMap<RegionId, Arc<SharedRegion>>>,
    pub forwarder: Forwarder,
    pub drip: DripQueue,
    pub inflight: InflightGate,
    prepared: Mutex<HashMap<TransferId, PreparedEntry>>,
    pub events_tx: UnboundedSender<LinkEvent>,
    changes_tx: watch::Sender<ChannelChange>,
    pub raw_in: Mutex<VecDeque<(NodeId, Vec<u8>)>>,
}

/// The orchestrator: owns every channel, link, region and the forwarder,
/// and exposes the collective operations. One control loop dispatches all
/// inbound link events; client calls never run on that loop.
pub struct Fabric {
    inner: Arc<Inner>,
}

impl Clone for Fabric {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

/// Polls a condition against a wall-clock budget. The fabric-level analog
/// of the region wait, for state that has no owning region.
pub(crate) async fn poll_until<F>(budget: Duration, poll: Duration, condition: F) -> Result<(), Error>
where
    F: Fn() -> bool,
{
    let deadline = Instant::now() + budget;
    loop {
        if condition() {
            return Ok(());
        }
        if Instant::now() >= deadline {
            return Err(Error::TimedOut);
        }
        tokio::time::sleep(poll).await;
    }
}

impl Fabric {
    pub fn new(config: FabricConfig) -> Result<Self, Error> {
        config.validate()?;
        let (events_tx, events_rx) = unbounded_channel();
        let (changes_tx, _) = watch::channel(ChannelChange::default());
        let inner = Arc::new(Inner {
            local: config.local,
            hardware_id: config.hardware_id(),
            claimed: AtomicBool::new(false),
            generation: AtomicU32::new(0),
            barrier_round: AtomicU32::new(0),
            barrier_seen: std::array::from_fn(|_| AtomicU32::new(0)),
            links: Mutex::new(HashMap::new()),
            channels: Mutex::new(ChannelTable {
                list: Vec::new(),
                by_partner: HashMap::new(),
                by_link: HashMap::new(),
            }),
            router: Mutex::new(CommandRouter::new(config.local)),
            regions: Mutex::new(HashMap::new()),
            forwarder: Forwarder::new(config.forward_pool, config.chain_pool),
            drip: DripQueue::new(),
            inflight: InflightGate::new(config.inflight_limit),
            prepared: Mutex::new(HashMap::new()),
            events_tx,
            changes_tx,
            raw_in: Mutex::new(VecDeque::new()),
            config,
        });
        tokio::spawn(Self::control_loop(Arc::downgrade(&inner), events_rx));
        tokio::spawn(Self::commandeer_loop(Arc::downgrade(&inner)));
        Ok(Self { inner })
    }

    /// Dispatches every inbound link event. Handlers never block; anything
    /// that must wait is queued for a client task or the commandeer.
    async fn control_loop(inner: Weak<Inner>, mut events_rx: UnboundedReceiver<LinkEvent>) {
        let span = debug_span!("fabric");
        let _guard = span.enter();
        debug!("control loop started");
        while let Some(event) = events_rx.recv().await {
            let Some(inner) = inner.upgrade() else {
                break;
            };
            inner.handle_event(event);
        }
        debug!("control loop stopped");
    }

    /// Background helper: drains deferred drip preparations and steals at
    /// most one stalled forward action per pass.
    async fn commandeer_loop(inner: Weak<Inner>) {
        loop {
            let Some(inner) = inner.upgrade() else {
                break;
            };
            let poll = inner.config.poll_interval;
            inner.pump_drip();
            inner.forwarder.commandeer_once(&*inner);
            drop(inner);
            tokio::time::sleep(poll).await;
        }
    }

    pub fn local(&self) -> NodeId {
        self.inner.local
    }

    pub fn hardware_id(&self) -> u64 {
        self.inner.hardware_id
    }

    pub fn config(&self) -> &FabricConfig {
        &self.inner.config
    }

    pub(crate) fn inner(&self) -> &Arc<Inner> {
        &self.inner
    }

    /// Hands a link to the fabric. Identification goes out immediately;
    /// the channel appears lazily when the peer identifies itself.
    pub fn register_link(&self, link: Arc<dyn Link>) -> Result<(), Error> {
        link.attach(self.inner.events_tx.clone());
        // The link must be in the table before identification goes out,
        // or the peer's reply can race past the dispatch loop.
        self.inner.links.lock().unwrap().insert(link.id(), link.clone());
        let frame = ControlFrame::new(ControlMessage::NodeIdentificationRequest {
            config_node: self.inner.local,
            hardware_node: self.inner.hardware_id,
            chassis: self.inner.local.partition(),
        });
        if let Err(e) = link.send_control(&frame) {
            self.inner.links.lock().unwrap().remove(&link.id());
            return Err(e);
        }
        Ok(())
    }

    pub fn subscribe_changes(&self) -> watch::Receiver<ChannelChange> {
        self.inner.changes_tx.subscribe()
    }

    /// (ready, verified) of the channel to `partner`, if one exists.
    pub fn channel_state(&self, partner: NodeId) -> Option<(bool, bool)> {
        let channels = self.inner.channels.lock().unwrap();
        let idx = *channels.by_partner.get(&partner)?;
        let ch = &channels.list[idx];
        Some((ch.is_ready(), ch.is_verified()))
    }

    pub fn route_to(&self, dest: NodeId) -> Option<super::net::router::Route> {
        self.inner.router.lock().unwrap().route(dest)
    }

    pub fn is_claimed(&self) -> bool {
        self.inner.claimed.load(Ordering::Acquire)
    }

    /// Nonce of the current claim; changes on every successful claim.
    pub fn claim_generation(&self) -> u32 {
        self.inner.generation.load(Ordering::Acquire)
    }

    /// Claims the mesh: initializes the routing tables from the static
    /// cabling and stamps a fresh claim generation.
    pub fn claim(&self) -> Result<(), Error> {
        if self.inner.claimed.swap(true, Ordering::AcqRel) {
            return Err(Error::AlreadyClaimed);
        }
        self.inner.generation.store(rand::random::<u32>(), Ordering::Release);
        self.inner.barrier_round.store(0, Ordering::Release);
        for seen in &self.inner.barrier_seen {
            seen.store(0, Ordering::Release);
        }
        let channels = self.inner.channels.lock().unwrap();
        let mut router = self.inner.router.lock().unwrap();
        router.clear();
        for dest_idx in 0..self.inner.config.node_count {
            let dest = NodeId::from_extended(dest_idx as u8);
            if dest == self.inner.local {
                continue;
            }
            let Some(hop) = self.inner.config.next_hop(self.inner.local, dest) else {
                continue;
            };
            let Some(&channel) = channels.by_partner.get(&hop) else {
                continue;
            };
            let forwarder = if hop == dest { self.inner.local } else { hop };
            router.add_route(dest, channel, forwarder, true);
        }
        debug!(local = %self.inner.local, "mesh claimed");
        Ok(())
    }

    /// Releases the mesh. Refused while any region still has relays in
    /// flight; teardown order is disassociate, drain, then release.
    pub fn release_claim(&self) -> Result<(), Error> {
        if !self.inner.claimed.load(Ordering::Acquire) {
            return Err(Error::NotClaimed);
        }
        {
            let regions = self.inner.regions.lock().unwrap();
            for region in regions.values() {
                if !region.can_release() {
                    return Err(Error::RegionBusy(region.id()));
                }
            }
        }
        self.inner.regions.lock().unwrap().clear();
        self.inner.router.lock().unwrap().clear();
        self.inner.claimed.store(false, Ordering::Release);
        debug!(local = %self.inner.local, "mesh released");
        Ok(())
    }

    /// Tears one region out of the relay engine: stop transitions, wait
    /// for the wire to drain, then return pool resources. The forwarder
    /// pauses new dispatch for the duration.
    pub async fn disassociate_region(&self, region: RegionId) -> Result<(), Error> {
        self.inner.forwarder.disable_actions_for_region(region);
        let inner = self.inner.clone();
        poll_until(self.inner.config.max_wait, self.inner.config.poll_interval, || {
            inner.forwarder.actions_drained_for_region(region)
        })
        .await?;
        self.inner.forwarder.cleanup_actions_for_region(&*self.inner, region);
        // Relay transfers prepared but never flowed still pin transport
        // budget; give it back with the pool.
        let mut prepared = self.inner.prepared.lock().unwrap();
        let stale: Vec<TransferId> = prepared
            .iter()
            .filter(|(_, e)| e.forward && e.region == region)
            .map(|(t, _)| *t)
            .collect();
        for t in stale {
            if let Some(entry) = prepared.remove(&t) {
                self.inner.inflight.release(entry.bytes);
            }
        }
        Ok(())
    }

    /// Sends a small message over the control path, relayed hop by hop.
    pub fn send_raw(&self, dest: NodeId, bytes: &[u8]) -> Result<(), Error> {
        if dest == self.inner.local {
            return Err(Error::InvalidArgument("raw message to self"));
        }
        let msg = raw_message(self.inner.local, dest, bytes)?;
        self.inner.route_and_send(dest, msg)
    }

    /// Receives the next raw message, waiting up to the configured budget.
    pub async fn recv_raw(&self) -> Result<(NodeId, Vec<u8>), Error> {
        self.recv_raw_ex(self.inner.config.max_wait).await
    }

    pub async fn recv_raw_ex(&self, budget: Duration) -> Result<(NodeId, Vec<u8>), Error> {
        let deadline = Instant::now() + budget;
        loop {
            if let Some(msg) = self.inner.raw_in.lock().unwrap().pop_front() {
                return Ok(msg);
            }
            if Instant::now() >= deadline {
                return Err(Error::TimedOut);
            }
            tokio::time::sleep(self.inner.config.poll_interval).await;
        }
    }

    /// All nodes must reach the barrier before any returns. Pure control
    /// path synchronization, independent of buffer state.
    pub async fn barrier(&self) -> Result<(), Error> {
        self.barrier_ex(self.inner.config.max_wait).await
    }

    pub async fn barrier_ex(&self, budget: Duration) -> Result<(), Error> {
        if !self.is_claimed() {
            return Err(Error::NotClaimed);
        }
        let round = self.inner.barrier_round.fetch_add(1, Ordering::AcqRel) + 1;
        for dest_idx in 0..self.inner.config.node_count {
            let dest = NodeId::from_extended(dest_idx as u8);
            if dest == self.inner.local {
                continue;
            }
            self.inner.route_and_send(
                dest,
                ControlMessage::NewGeneration {
                    source: self.inner.local,
                    destination: dest,
                    generation: round,
                },
            )?;
        }
        let inner = self.inner.clone();
        let node_count = self.inner.config.node_count;
        let local = self.inner.local;
        poll_until(budget, self.inner.config.poll_interval, move || {
            (0..node_count)
                .filter(|&i| i != local.index())
                .all(|i| inner.barrier_seen[i].load(Ordering::Acquire) >= round)
        })
        .await
    }

    /// Waits until the channel to `partner` reports verified.
    pub async fn wait_channel_verified(&self, partner: NodeId, budget: Duration) -> Result<(), Error> {
        let inner = self.inner.clone();
        poll_until(budget, self.inner.config.poll_interval, move || {
            let channels = inner.channels.lock().unwrap();
            channels
                .by_partner
                .get(&partner)
                .is_some_and(|&idx| channels.list[idx].is_verified())
        })
        .await
    }
}

impl Inner {
    fn handle_event(self: &Arc<Self>, event: LinkEvent) {
        match event {
            LinkEvent::Control { link, frame } => self.handle_control(link, frame.msg),
            LinkEvent::Data { link, frame } => self.handle_data(link, frame),
            LinkEvent::TxComplete {
                transfer, subs, status, ..
            } => self.handle_tx_complete(transfer, subs, status),
            LinkEvent::Dropped { link } => self.handle_dropped(link),
        }
    }

    fn handle_control(self: &Arc<Self>, link: LinkId, msg: ControlMessage) {
        trace!(link, msg = msg.name(), "control message");
        match msg {
            ControlMessage::NodeIdentificationRequest {
                config_node,
                hardware_node,
                ..
            } => {
                let reply = ControlFrame::new(ControlMessage::NodeIdentificationResponse {
                    config_node: self.local,
                    hardware_node: self.hardware_id,
                    chassis: self.local.partition(),
                });
                if let Some(l) = self.links.lock().unwrap().get(&link) {
                    if let Err(e) = l.send_control(&reply) {
                        warn!(link, ?e, "identification reply failed");
                    }
                }
                self.ensure_channel(config_node, hardware_node, link);
            }
            ControlMessage::NodeIdentificationResponse {
                config_node,
                hardware_node,
                ..
            } => {
                self.ensure_channel(config_node, hardware_node, link);
            }
            ControlMessage::LinkIdentification { node, link_index } => {
                self.with_channel(link, |ch| ch.handle_identification(link, node, link_index).map(|_| Vec::new()));
            }
            ControlMessage::ChannelLinkSwap => {
                self.with_channel(link, |ch| ch.handle_link_swap().map(|_| Vec::new()));
            }
            ControlMessage::ChannelReady { .. } => {
                self.with_channel(link, |ch| ch.handle_channel_ready().map(|_| Vec::new()));
            }
            ControlMessage::PrimaryLinkPing => {
                self.with_channel(link, |ch| ch.handle_ping());
            }
            ControlMessage::SecondaryLinkPong => {
                self.with_channel(link, |ch| ch.handle_pong());
            }
            ControlMessage::TxAssignmentNotification {
                source_node,
                path_index,
            } => {
                let mut channels = self.channels.lock().unwrap();
                if let Some(&idx) = channels.by_link.get(&link) {
                    channels.list[idx].record_path_source(path_index, source_node);
                } else {
                    warn!(link, "path notification on unknown channel dropped");
                }
            }
            ControlMessage::TxForwardNotification {
                forwarder,
                source_node,
                receiver,
            } => {
                let arrived_on = {
                    let channels = self.channels.lock().unwrap();
                    channels.by_link.get(&link).copied()
                };
                let Some(arrived_on) = arrived_on else {
                    warn!(link, "forward notification on unknown channel dropped");
                    return;
                };
                let notice = self.router.lock().unwrap().handle_forward_notification(
                    forwarder,
                    source_node,
                    receiver,
                    arrived_on,
                );
                match notice {
                    ForwardNotice::Relay(channel) => {
                        self.send_on_channel(
                            channel,
                            ControlMessage::TxForwardNotification {
                                forwarder,
                                source_node,
                                receiver,
                            },
                        );
                    }
                    ForwardNotice::RefusedLoop => {
                        trace!(%source_node, %receiver, "announcement loop refused");
                    }
                    ForwardNotice::Recorded | ForwardNotice::Ignored => {}
                }
            }
            ControlMessage::RawMessage {
                source,
                destination,
                length,
                payload,
            } => {
                self.note_arrival(source, link);
                if destination == self.local {
                    let bytes = payload[..length as usize].to_vec();
                    self.raw_in.lock().unwrap().push_back((source, bytes));
                } else {
                    self.relay_control(
                        link,
                        destination,
                        ControlMessage::RawMessage {
                            source,
                            destination,
                            length,
                            payload,
                        },
                    );
                }
            }
            ControlMessage::NewGeneration {
                source,
                destination,
                generation,
            } => {
                self.note_arrival(source, link);
                if destination == self.local {
                    self.barrier_seen[source.index()].fetch_max(generation, Ordering::AcqRel);
                } else {
                    self.relay_control(
                        link,
                        destination,
                        ControlMessage::NewGeneration {
                            source,
                            destination,
                            generation,
                        },
                    );
                }
            }
        }
    }

    /// Looks up the channel a link belongs to and runs a handshake handler
    /// on it, flushing any binds released by verification and publishing
    /// readiness transitions. Messages for unknown channels are dropped;
    /// a channel that is not up yet ignoring strays is expected behavior.
    fn with_channel<F>(self: &Arc<Self>, link: LinkId, f: F)
    where
        F: FnOnce(&mut Channel) -> Result<Vec<NodeId>, Error>,
    {
        let mut channels = self.channels.lock().unwrap();
        let Some(&idx) = channels.by_link.get(&link) else {
            trace!(link, "control message before channel exists dropped");
            return;
        };
        let ch = &mut channels.list[idx];
        let before = (ch.is_ready(), ch.is_verified());
        match f(ch) {
            Ok(flushed) => {
                for source in flushed {
                    Self::bind_now(ch, source);
                }
                let after = (ch.is_ready(), ch.is_verified());
                if before != after {
                    let change = ChannelChange {
                        partner: Some(ch.partner()),
                        ready: after.0,
                        verified: after.1,
                    };
                    drop(channels);
                    let _ = self.changes_tx.send_replace(change);
                }
            }
            Err(e) => warn!(link, ?e, "handshake handler failed"),
        }
    }

    fn ensure_channel(self: &Arc<Self>, partner: NodeId, hardware: u64, link: LinkId) {
        if partner == self.local {
            warn!("link identified our own node id, mis-cabled loopback ignored");
            return;
        }
        let link_arc = match self.links.lock().unwrap().get(&link) {
            Some(l) => l.clone(),
            None => return,
        };
        let mut channels = self.channels.lock().unwrap();
        let idx = match channels.by_partner.get(&partner).copied() {
            Some(idx) => {
                let ch = &mut channels.list[idx];
                if ch.partner_hardware() != hardware {
                    warn!(
                        partner = %partner,
                        expected = ch.partner_hardware(),
                        actual = hardware,
                        "hardware partner identity mismatch, channel failed"
                    );
                    ch.mark_failed();
                    return;
                }
                idx
            }
            None => {
                let idx = channels.list.len();
                match Channel::new(self.local, partner, hardware, idx, self.config.links_per_channel) {
                    Ok(ch) => {
                        channels.list.push(ch);
                        channels.by_partner.insert(partner, idx);
                        debug!(partner = %partner, channel = idx, "channel created");
                        idx
                    }
                    Err(e) => {
                        warn!(?e, "channel creation failed");
                        return;
                    }
                }
            }
        };
        channels.by_link.insert(link, idx);
        if let Err(e) = channels.list[idx].register_link(link_arc) {
            warn!(?e, "link registration failed");
        }
        drop(channels);
        self.router
            .lock()
            .unwrap()
            .add_route(partner, idx, self.local, true);
    }

    fn handle_data(self: &Arc<Self>, link: LinkId, frame: DataFrame) {
        let (channel_idx, slot, source) = {
            let channels = self.channels.lock().unwrap();
            let Some(&idx) = channels.by_link.get(&link) else {
                trace!(link, "data on unknown channel dropped");
                return;
            };
            let ch = &channels.list[idx];
            let Some(slot) = ch.slot_of(link) else {
                return;
            };
            (idx, slot, ch.path_source(frame.path))
        };
        let Some(region) = self.regions.lock().unwrap().get(&frame.region).cloned() else {
            trace!(region = frame.region, "data for unknown region dropped");
            return;
        };
        if region.interrupted() {
            trace!(region = frame.region, "data for interrupted region dropped");
            return;
        }
        if let Some(source) = source {
            self.router.lock().unwrap().note_arrival(source, channel_idx);
        }
        region.write_sub(frame.offset, frame.sub_index, &frame.bytes);
        let completed = region.mark_sub_arrival(frame.offset, slot, frame.sub_index, frame.trailer);
        if completed {
            trace!(region = frame.region, offset = frame.offset, slot, "chunk landed");
        }
        self.forwarder.on_rx_progress(&**self, frame.region, frame.offset);
    }

    fn handle_tx_complete(self: &Arc<Self>, transfer: TransferId, subs: u16, status: CompletionStatus) {
        if status != CompletionStatus::Success {
            let entry = self.prepared.lock().unwrap().remove(&transfer);
            if let Some(entry) = entry {
                warn!(region = entry.region, ?status, "transmit failed");
                self.inflight.release(entry.bytes);
                if let Some(region) = self.regions.lock().unwrap().get(&entry.region) {
                    region.fault_with(Error::TransferFailed(status));
                }
            }
            self.forwarder.on_tx_complete(&**self, transfer, subs, status);
            return;
        }
        let finished = {
            let mut prepared = self.prepared.lock().unwrap();
            match prepared.get_mut(&transfer) {
                Some(entry) => {
                    entry.confirmed |= subs;
                    if entry.confirmed.count_ones() as u8 == entry.sub_count {
                        prepared.remove(&transfer)
                    } else {
                        None
                    }
                }
                None => None,
            }
        };
        if let Some(entry) = finished {
            self.inflight.release(entry.bytes);
            if !entry.forward {
                if let Some(region) = self.regions.lock().unwrap().get(&entry.region).cloned() {
                    if let Some(assignment) = region.owning_assignment(entry.offset) {
                        assignment.note_tx_chunk_done(entry.link_slot);
                    }
                }
            }
        }
        self.forwarder.on_tx_complete(&**self, transfer, subs, status);
        self.pump_drip();
    }

    fn handle_dropped(self: &Arc<Self>, link: LinkId) {
        self.links.lock().unwrap().remove(&link);
        let (idx, change) = {
            let mut channels = self.channels.lock().unwrap();
            let Some(idx) = channels.by_link.remove(&link) else {
                return;
            };
            let ch = &mut channels.list[idx];
            if !ch.link_dropped(link) {
                return;
            }
            (
                idx,
                ChannelChange {
                    partner: Some(ch.partner()),
                    ready: false,
                    verified: false,
                },
            )
        };
        self.router.lock().unwrap().clear_channel(idx);
        let _ = self.changes_tx.send_replace(change);
    }

    fn note_arrival(&self, source: NodeId, link: LinkId) {
        let channels = self.channels.lock().unwrap();
        if let Some(&idx) = channels.by_link.get(&link) {
            drop(channels);
            self.router.lock().unwrap().note_arrival(source, idx);
        }
    }

    /// Routes a control message by destination, or fails with no route.
    pub(crate) fn route_and_send(&self, dest: NodeId, msg: ControlMessage) -> Result<(), Error> {
        let route = self
            .router
            .lock()
            .unwrap()
            .route(dest)
            .ok_or(Error::NoRoute(dest))?;
        self.send_on_channel_checked(route.channel, msg)
    }

    /// Relays a message not addressed to us, refusing to bounce it back
    /// out the channel it arrived on.
    fn relay_control(&self, arrival_link: LinkId, dest: NodeId, msg: ControlMessage) {
        let arrived_on = {
            let channels = self.channels.lock().unwrap();
            channels.by_link.get(&arrival_link).copied()
        };
        let Some(route) = self.router.lock().unwrap().route(dest) else {
            warn!(%dest, "no route for relayed control message, dropped");
            return;
        };
        if Some(route.channel) == arrived_on {
            warn!(%dest, "relay would loop back to its arrival channel, dropped");
            return;
        }
        self.send_on_channel(route.channel, msg);
    }

    fn send_on_channel(&self, channel: usize, msg: ControlMessage) {
        if let Err(e) = self.send_on_channel_checked(channel, msg) {
            warn!(channel, ?e, "control send failed");
        }
    }

    fn send_on_channel_checked(&self, channel: usize, msg: ControlMessage) -> Result<(), Error> {
        let link = {
            let channels = self.channels.lock().unwrap();
            let ch = channels
                .list
                .get(channel)
                .ok_or(Error::InvalidArgument("channel index out of range"))?;
            ch.primary()?.clone()
        };
        link.send_control(&ControlFrame::new(msg))
    }

    /// Binds an outbound data path for `source` on every link of a channel
    /// and announces it, or queues the bind until the channel verifies.
    pub(crate) fn bind_tx(&self, channel: usize, source: NodeId) -> Result<(), Error> {
        let mut channels = self.channels.lock().unwrap();
        let ch = channels
            .list
            .get_mut(channel)
            .ok_or(Error::InvalidArgument("channel index out of range"))?;
        if ch.queue_bind(source) {
            Self::bind_now(ch, source);
        }
        Ok(())
    }

    fn bind_now(ch: &mut Channel, source: NodeId) {
        for slot in 0..ch.expected_links() {
            let Some(link) = ch.link(slot).cloned() else {
                continue;
            };
            match link.assign_tx_path(source) {
                Ok(path) => {
                    let frame = ControlFrame::new(ControlMessage::TxAssignmentNotification {
                        source_node: source,
                        path_index: path,
                    });
                    if let Err(e) = link.send_control(&frame) {
                        warn!(?e, "path notification failed");
                    }
                }
                Err(e) => warn!(?e, "tx path bind failed"),
            }
        }
    }

    /// True once the partner on `channel` has announced a transmit path
    /// for traffic from `source`.
    pub(crate) fn partner_tx_ready(&self, channel: usize, source: NodeId) -> bool {
        let channels = self.channels.lock().unwrap();
        channels
            .list
            .get(channel)
            .is_some_and(|ch| ch.is_partner_tx_ready(source))
    }

    pub(crate) fn channel_index(&self, partner: NodeId) -> Option<usize> {
        self.channels.lock().unwrap().by_partner.get(&partner).copied()
    }

    pub(crate) fn channel_link(&self, channel: usize, slot: usize) -> Option<Arc<dyn Link>> {
        let channels = self.channels.lock().unwrap();
        channels.list.get(channel).and_then(|ch| ch.link(slot).cloned())
    }

    /// Binds inbound data paths for `source` on every link of a channel,
    /// returning the per-slot path indices.
    pub(crate) fn assign_rx_paths(
        &self,
        channel: usize,
        source: NodeId,
    ) -> [Option<PathIndex>; super::net::MAX_LINKS_PER_CHANNEL] {
        let mut paths = [None; super::net::MAX_LINKS_PER_CHANNEL];
        let channels = self.channels.lock().unwrap();
        let Some(ch) = channels.list.get(channel) else {
            return paths;
        };
        for slot in 0..ch.expected_links() {
            if let Some(link) = ch.link(slot) {
                match link.assign_rx_path(source) {
                    Ok(path) => paths[slot] = Some(path),
                    Err(e) => warn!(?e, "rx path bind failed"),
                }
            }
        }
        paths
    }

    /// Transmits one chunk on one link of a channel, or defers it to the
    /// drip queue when the transport's in-flight budget is exhausted.
    pub(crate) fn send_chunk(
        self: &Arc<Self>,
        region: &Arc<SharedRegion>,
        offset: u64,
        channel: usize,
        slot: usize,
        path: PathIndex,
        trailer: u64,
    ) -> Result<(), Error> {
        let len = region.chunk_size() as usize;
        if !self.inflight.try_acquire(len) {
            self.drip.push(DripItem {
                region: region.id(),
                offset,
                channel,
                link_slot: slot,
                path,
                trailer,
            });
            return Ok(());
        }
        self.dispatch_chunk(region, offset, channel, slot, path, trailer)
    }

    /// The in-flight budget must already be held for the chunk.
    fn dispatch_chunk(
        self: &Arc<Self>,
        region: &Arc<SharedRegion>,
        offset: u64,
        channel: usize,
        slot: usize,
        path: PathIndex,
        trailer: u64,
    ) -> Result<(), Error> {
        let link = self
            .channel_link(channel, slot)
            .ok_or(Error::LinkDetached)?;
        let desc = TransferDescriptor {
            region: region.id(),
            offset,
            len: region.chunk_size(),
            path,
        };
        let prepared = match link.prepare(&desc) {
            Ok(p) => p,
            Err(e) => {
                self.inflight.release(region.chunk_size() as usize);
                return Err(e);
            }
        };
        let sub_count = region.sub_count();
        self.prepared.lock().unwrap().insert(
            prepared.id,
            PreparedEntry {
                prepared: prepared.clone(),
                region: region.id(),
                offset,
                link_slot: slot,
                sub_count,
                bytes: region.chunk_size() as usize,
                confirmed: 0,
                forward: false,
            },
        );
        for sub in 0..sub_count {
            let bytes = region.read_sub(offset, sub);
            link.submit_sub(&prepared, sub, sub_count, bytes, trailer)?;
        }
        Ok(())
    }

    /// Advances deferred preparations one (offset, link) pair at a time,
    /// in order, as in-flight budget frees up.
    pub(crate) fn pump_drip(self: &Arc<Self>) {
        loop {
            let Some(item) = self.drip.pop() else {
                return;
            };
            let region = self.regions.lock().unwrap().get(&item.region).cloned();
            let Some(region) = region else {
                continue;
            };
            if !self.inflight.try_acquire(region.chunk_size() as usize) {
                self.drip.push_front(item);
                return;
            }
            if let Err(e) = self.dispatch_chunk(
                &region,
                item.offset,
                item.channel,
                item.link_slot,
                item.path,
                item.trailer,
            ) {
                warn!(?e, "drip dispatch failed");
            }
        }
    }
}

impl ForwardContext for Inner {
    fn region(&self, id: RegionId) -> Option<Arc<SharedRegion>> {
        self.regions.lock().unwrap().get(&id).cloned()
    }

    fn prepare_transfer(&self, leg: &OutLeg, region: RegionId, offset: u64) -> Result<TransferId, Error> {
        let shared = self
            .regions
            .lock()
            .unwrap()
            .get(&region)
            .cloned()
            .ok_or(Error::UnknownRegion(region))?;
        let link = self
            .channel_link(leg.channel, leg.link_slot)
            .ok_or(Error::LinkDetached)?;
        let len = shared.chunk_size() as usize;
        if !self.inflight.try_acquire(len) {
            return Err(Error::TransportQueueFull);
        }
        let desc = TransferDescriptor {
            region,
            offset,
            len: shared.chunk_size(),
            path: leg.path,
        };
        let prepared = match link.prepare(&desc) {
            Ok(p) => p,
            Err(e) => {
                self.inflight.release(len);
                return Err(e);
            }
        };
        let id = prepared.id;
        self.prepared.lock().unwrap().insert(
            id,
            PreparedEntry {
                prepared,
                region,
                offset,
                link_slot: leg.link_slot,
                sub_count: shared.sub_count(),
                bytes: len,
                confirmed: 0,
                forward: true,
            },
        );
        Ok(id)
    }

    fn submit_subs(
        &self,
        leg: &OutLeg,
        transfer: TransferId,
        region: RegionId,
        offset: u64,
        bits: u16,
    ) -> Result<(), Error> {
        let shared = self
            .regions
            .lock()
            .unwrap()
            .get(&region)
            .cloned()
            .ok_or(Error::UnknownRegion(region))?;
        let link = self
            .channel_link(leg.channel, leg.link_slot)
            .ok_or(Error::LinkDetached)?;
        let prepared = {
            let table = self.prepared.lock().unwrap();
            table
                .get(&transfer)
                .map(|e| e.prepared.clone())
                .ok_or(Error::InvalidArgument("unknown prepared transfer"))?
        };
        let sub_count = shared.sub_count();
        for sub in 0..sub_count {
            if bits & (1 << sub) == 0 {
                continue;
            }
            let bytes = shared.read_sub(offset, sub);
            // The trailer rides the final sub-command; relays copy the
            // inbound tag through unchanged.
            let trailer = shared.trailer(offset, leg.link_slot);
            link.submit_sub(&prepared, sub, sub_count, bytes, trailer)?;
        }
        Ok(())
    }

    fn forward_complete(&self, region: RegionId, offset: u64, receiver: NodeId) {
        trace!(region, offset, receiver = %receiver, "chunk relayed");
    }

    fn transfer_failed(&self, region: RegionId, status: CompletionStatus) {
        warn!(region, ?status, "relay transmit failed");
        if let Some(shared) = self.regions.lock().unwrap().get(&region) {
            shared.fault_with(Error::TransferFailed(status));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mesh::testkit;

    #[tokio::test]
    async fn two_node_channels_verify() {
        let mesh = testkit::TestMesh::line(2, 2).await;
        let a = &mesh.fabrics[0];
        let b = &mesh.fabrics[1];
        assert_eq!(a.channel_state(b.local()), Some((true, true)));
        assert_eq!(b.channel_state(a.local()), Some((true, true)));
        let route = a.route_to(b.local()).unwrap();
        assert_eq!(route.forwarder, a.local());
    }

    #[tokio::test]
    async fn hardware_mismatch_fails_the_channel() {
        // A replacement cable claiming node 1's id with the wrong hardware
        // id after the real node 1 already identified.
        let mesh = testkit::TestMesh::line(2, 1).await;
        let a = &mesh.fabrics[0];
        let (extra, _peer) = crate::mesh::net::link::MemoryLink::pair(testkit::TEST_MTU, testkit::TEST_QUEUE);
        let extra_id = extra.id();
        a.register_link(extra).unwrap();
        let inner = a.inner().clone();
        inner.ensure_channel(NodeId::new(0, 1), 0xbad, extra_id);
        let channels = inner.channels.lock().unwrap();
        let idx = channels.by_partner[&NodeId::new(0, 1)];
        assert!(channels.list[idx].is_failed());
    }

    #[tokio::test]
    async fn raw_messages_route_across_a_line() {
        let mesh = testkit::TestMesh::line(3, 1).await;
        mesh.claim_all();
        let a = &mesh.fabrics[0];
        let c = &mesh.fabrics[2];
        // 0 and 2 are not directly cabled; node 1 relays on the control
        // path.
        assert!(a.channel_state(c.local()).is_none());
        a.send_raw(c.local(), b"over the hill").unwrap();
        let (from, bytes) = c.recv_raw().await.unwrap();
        assert_eq!(from, a.local());
        assert_eq!(bytes, b"over the hill");
    }

    #[tokio::test]
    async fn barrier_synchronizes_all_nodes() {
        let mesh = testkit::TestMesh::line(3, 1).await;
        mesh.claim_all();
        let mut tasks = Vec::new();
        for fabric in &mesh.fabrics {
            let fabric = fabric.clone();
            tasks.push(tokio::spawn(async move { fabric.barrier().await }));
        }
        for task in tasks {
            task.await.unwrap().unwrap();
        }
    }

    #[tokio::test]
    async fn barrier_times_out_without_peers() {
        let mesh = testkit::TestMesh::line(2, 1).await;
        mesh.claim_all();
        // Only node 0 reaches the barrier.
        let err = mesh.fabrics[0]
            .barrier_ex(Duration::from_millis(30))
            .await
            .unwrap_err();
        assert_eq!(err, Error::TimedOut);
    }

    #[tokio::test]
    async fn dropped_link_demotes_until_recabled() {
        let mesh = testkit::TestMesh::line(2, 1).await;
        let a = &mesh.fabrics[0];
        let b = &mesh.fabrics[1];
        let mut changes = a.subscribe_changes();
        mesh.links[0].0.sever();
        poll_until(Duration::from_secs(1), Duration::from_millis(1), || {
            a.channel_state(b.local()) == Some((false, false))
        })
        .await
        .unwrap();
        assert!(a.route_to(b.local()).is_none());
        // Consumers heard about the demotion.
        assert_eq!(
            *changes.borrow_and_update(),
            ChannelChange {
                partner: Some(b.local()),
                ready: false,
                verified: false,
            }
        );

        // A replacement cable re-runs the handshake on the same channel.
        let (la, lb) = crate::mesh::net::link::MemoryLink::pair(testkit::TEST_MTU, testkit::TEST_QUEUE);
        a.register_link(la).unwrap();
        b.register_link(lb).unwrap();
        a.wait_channel_verified(b.local(), Duration::from_secs(1))
            .await
            .unwrap();
        assert!(a.route_to(b.local()).is_some());
    }

    #[tokio::test]
    async fn release_claim_requires_drained_regions() {
        let mesh = testkit::TestMesh::line(2, 1).await;
        mesh.claim_all();
        let a = &mesh.fabrics[0];
        let region = crate::mesh::region::SharedRegion::new(5, 128, 32, 2, 1, 16).unwrap();
        region.begin_forward();
        a.inner().regions.lock().unwrap().insert(5, region.clone());
        assert_eq!(a.release_claim(), Err(Error::RegionBusy(5)));
        region.end_forward();
        a.release_claim().unwrap();
        assert!(!a.is_claimed());
    }
}
