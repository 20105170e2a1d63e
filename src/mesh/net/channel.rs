use std::sync::Arc;

use tracing::{debug, warn};

use super::error::Error;
use super::link::{Link, LinkId};
use super::wire::{ControlFrame, ControlMessage};
use super::{NodeId, DATA_PATHS_PER_LINK, MAX_LINKS_PER_CHANNEL};

/// Where the channel is in its bring-up sequence. `ready` and `verified`
/// are tracked separately because consumers care about both transitions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandshakeState {
    /// Waiting for all configured links to register.
    Collecting,
    /// Links registered, link-order identification in flight.
    Identifying,
    /// Link ordering agreed.
    Ready,
    /// Primary/secondary ping-pong confirmed.
    Verified,
}

/// The logical connection between this node and one directly cabled
/// partner. Survives individual link loss; identity is fixed at creation.
///
/// The side with the lower extended node id is the principal. Both ends
/// compute this independently, so roles never need negotiating.
pub struct Channel {
    local: NodeId,
    partner: NodeId,
    partner_hardware: u64,
    index: usize,
    expected_links: usize,
    links: [Option<Arc<dyn Link>>; MAX_LINKS_PER_CHANNEL],
    state: HandshakeState,
    ready: bool,
    verified: bool,
    failed: bool,
    /// Remote link index claimed over each of our link slots.
    remote_order: [Option<u8>; MAX_LINKS_PER_CHANNEL],
    /// Which remote source node's traffic the partner routed onto each of
    /// our inbound data paths.
    path_sources: [Option<NodeId>; DATA_PATHS_PER_LINK],
    /// Outbound path binds queued until the channel verifies.
    pending_binds: Vec<NodeId>,
}

impl Channel {
    pub fn new(
        local: NodeId,
        partner: NodeId,
        partner_hardware: u64,
        index: usize,
        expected_links: usize,
    ) -> Result<Self, Error> {
        if expected_links == 0 || expected_links > MAX_LINKS_PER_CHANNEL {
            return Err(Error::UnsupportedLinkCount(expected_links));
        }
        Ok(Self {
            local,
            partner,
            partner_hardware,
            index,
            expected_links,
            links: [None, None],
            state: HandshakeState::Collecting,
            ready: false,
            verified: false,
            failed: false,
            remote_order: [None; MAX_LINKS_PER_CHANNEL],
            path_sources: [None; DATA_PATHS_PER_LINK],
            pending_binds: Vec::new(),
        })
    }

    pub fn partner(&self) -> NodeId {
        self.partner
    }

    pub fn partner_hardware(&self) -> u64 {
        self.partner_hardware
    }

    pub fn index(&self) -> usize {
        self.index
    }

    pub fn is_principal(&self) -> bool {
        self.local.extended() < self.partner.extended()
    }

    pub fn state(&self) -> HandshakeState {
        self.state
    }

    pub fn is_ready(&self) -> bool {
        self.ready
    }

    pub fn is_verified(&self) -> bool {
        self.verified
    }

    pub fn is_failed(&self) -> bool {
        self.failed
    }

    /// Fatal protocol mismatch. The channel stops participating; recovery
    /// requires a mesh teardown.
    pub fn mark_failed(&mut self) {
        self.failed = true;
        self.ready = false;
        self.verified = false;
    }

    pub fn slot_of(&self, link: LinkId) -> Option<usize> {
        self.links
            .iter()
            .position(|l| l.as_ref().map(|l| l.id()) == Some(link))
    }

    pub fn link(&self, slot: usize) -> Option<&Arc<dyn Link>> {
        self.links.get(slot).and_then(|l| l.as_ref())
    }

    pub fn expected_links(&self) -> usize {
        self.expected_links
    }

    /// Primary control link. Fixed as slot 0 once registration completes.
    pub fn primary(&self) -> Result<&Arc<dyn Link>, Error> {
        self.links[0].as_ref().ok_or(Error::ChannelNotReady(self.partner))
    }

    /// Secondary control link: slot 1, or slot 0 on a single-link channel.
    pub fn secondary(&self) -> Result<&Arc<dyn Link>, Error> {
        let slot = if self.expected_links == 1 { 0 } else { 1 };
        self.links[slot].as_ref().ok_or(Error::ChannelNotReady(self.partner))
    }

    fn registered_links(&self) -> usize {
        self.links.iter().filter(|l| l.is_some()).count()
    }

    /// Records a link in the first free slot. Once all expected links are
    /// present, identification goes out over every one of them.
    pub fn register_link(&mut self, link: Arc<dyn Link>) -> Result<(), Error> {
        if self.failed {
            return Ok(());
        }
        if self.slot_of(link.id()).is_some() {
            return Ok(());
        }
        let slot = match self.links.iter().position(|l| l.is_none()) {
            Some(slot) if slot < self.expected_links => slot,
            _ => {
                warn!(
                    channel = self.index,
                    partner = %self.partner,
                    "link registration beyond configured count ignored"
                );
                return Ok(());
            }
        };
        self.links[slot] = Some(link);
        if self.registered_links() == self.expected_links {
            self.begin_identification()?;
        }
        Ok(())
    }

    fn begin_identification(&mut self) -> Result<(), Error> {
        self.state = HandshakeState::Identifying;
        self.remote_order = [None; MAX_LINKS_PER_CHANNEL];
        for slot in 0..self.expected_links {
            if let Some(link) = &self.links[slot] {
                link.send_control(&ControlFrame::new(ControlMessage::LinkIdentification {
                    node: self.local,
                    link_index: slot as u8,
                }))?;
            }
        }
        Ok(())
    }

    /// The partner told us which of its link slots this wire is, letting
    /// the principal verify that both ends enumerated the cables the same
    /// way round.
    pub fn handle_identification(
        &mut self,
        link: LinkId,
        remote_node: NodeId,
        remote_index: u8,
    ) -> Result<(), Error> {
        if self.failed {
            return Ok(());
        }
        if remote_node != self.partner {
            warn!(
                channel = self.index,
                partner = %self.partner,
                claimed = %remote_node,
                "identification for the wrong partner ignored"
            );
            return Ok(());
        }
        let Some(slot) = self.slot_of(link) else {
            return Ok(());
        };
        self.remote_order[slot] = Some(remote_index);
        if self.registered_links() < self.expected_links {
            return Ok(());
        }
        let complete = (0..self.expected_links).all(|i| self.remote_order[i].is_some());
        if !complete || !self.is_principal() {
            return Ok(());
        }
        let ordered = (0..self.expected_links).all(|i| self.remote_order[i] == Some(i as u8));
        if ordered {
            debug!(channel = self.index, partner = %self.partner, "link order matched");
            self.ready = true;
            self.state = HandshakeState::Ready;
            self.primary()?.send_control(&ControlFrame::new(ControlMessage::ChannelReady {
                node_a: self.local,
                node_b: self.partner,
            }))?;
        } else {
            // Ordering is binary, so one agent-side swap either fixes it or
            // the link layer is lying to us; the next round re-verifies.
            debug!(channel = self.index, partner = %self.partner, "link order crossed, requesting swap");
            self.remote_order = [None; MAX_LINKS_PER_CHANNEL];
            self.primary()?
                .send_control(&ControlFrame::new(ControlMessage::ChannelLinkSwap))?;
            self.begin_identification()?;
        }
        Ok(())
    }

    /// Agent side of a swap request: exchange the slots and identify again.
    pub fn handle_link_swap(&mut self) -> Result<(), Error> {
        if self.failed {
            return Ok(());
        }
        if self.is_principal() {
            warn!(channel = self.index, "principal received a link swap, ignoring");
            return Ok(());
        }
        self.links.swap(0, 1);
        self.begin_identification()
    }

    /// Agent learns the ordering verified; it opens the ping-pong round.
    pub fn handle_channel_ready(&mut self) -> Result<(), Error> {
        if self.failed {
            return Ok(());
        }
        self.ready = true;
        self.state = HandshakeState::Ready;
        self.primary()?
            .send_control(&ControlFrame::new(ControlMessage::PrimaryLinkPing))?;
        Ok(())
    }

    /// Either side receiving the ping is verified and answers on the
    /// secondary link. Returns the outbound binds that were queued while
    /// the channel was still unverified.
    pub fn handle_ping(&mut self) -> Result<Vec<NodeId>, Error> {
        if self.failed {
            return Ok(Vec::new());
        }
        self.secondary()?
            .send_control(&ControlFrame::new(ControlMessage::SecondaryLinkPong))?;
        Ok(self.mark_verified())
    }

    pub fn handle_pong(&mut self) -> Result<Vec<NodeId>, Error> {
        if self.failed {
            return Ok(Vec::new());
        }
        Ok(self.mark_verified())
    }

    fn mark_verified(&mut self) -> Vec<NodeId> {
        self.verified = true;
        self.state = HandshakeState::Verified;
        debug!(channel = self.index, partner = %self.partner, "channel verified");
        std::mem::take(&mut self.pending_binds)
    }

    /// Queues an outbound path bind for `source` if the channel is not yet
    /// verified. Returns true when the caller may bind immediately.
    pub fn queue_bind(&mut self, source: NodeId) -> bool {
        if self.verified {
            return true;
        }
        if !self.pending_binds.contains(&source) {
            self.pending_binds.push(source);
        }
        false
    }

    pub fn record_path_source(&mut self, path: u8, source: NodeId) {
        let Some(slot) = self.path_sources.get_mut(path as usize) else {
            warn!(channel = self.index, path, "path index out of range ignored");
            return;
        };
        *slot = Some(source);
    }

    /// Has the partner announced a transmit path carrying `source`'s
    /// traffic? Gates creation of the matching inbound assignment.
    pub fn is_partner_tx_ready(&self, source: NodeId) -> bool {
        self.path_sources.iter().any(|s| *s == Some(source))
    }

    /// Source node whose traffic the partner routed onto `path`.
    pub fn path_source(&self, path: u8) -> Option<NodeId> {
        self.path_sources.get(path as usize).copied().flatten()
    }

    /// A dropped link demotes the channel but never destroys it; a
    /// replacement re-runs the handshake from registration.
    pub fn link_dropped(&mut self, link: LinkId) -> bool {
        let Some(slot) = self.slot_of(link) else {
            return false;
        };
        self.links[slot] = None;
        self.ready = false;
        self.verified = false;
        self.state = HandshakeState::Collecting;
        self.remote_order = [None; MAX_LINKS_PER_CHANNEL];
        self.path_sources = [None; DATA_PATHS_PER_LINK];
        debug!(channel = self.index, partner = %self.partner, "link lost, channel demoted");
        true
    }
}
