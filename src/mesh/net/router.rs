use std::collections::VecDeque;

use ahash::RandomState;
use hashbrown::{HashMap, HashSet};
use tracing::{debug, warn};

use super::NodeId;

/// How to reach one destination: the local channel to send on, and which
/// node relays for us (`forwarder == local` means directly cabled).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Route {
    pub channel: usize,
    pub forwarder: NodeId,
}

/// Outcome of processing a relayed forward announcement.
#[derive(Debug, PartialEq, Eq)]
pub enum ForwardNotice {
    /// We are the true source; the route to the receiver was recorded.
    Recorded,
    /// Pass the announcement along on this channel toward the source.
    Relay(usize),
    /// The next hop toward the source is the channel the announcement
    /// arrived on. Re-forwarding would loop, so drop it.
    RefusedLoop,
    Ignored,
}

/// Per-node table mapping every reachable node to the channel that gets
/// there. Entries exist only for channels that exist; lifetime matches the
/// fabric and entries are cleared on channel disconnect.
pub struct CommandRouter {
    local: NodeId,
    routes: HashMap<NodeId, Route, RandomState>,
    /// Source node to the channel its traffic was last observed on,
    /// populated passively as control and data traffic flows.
    arrivals: HashMap<NodeId, usize, RandomState>,
    recent: RecentSet,
}

impl CommandRouter {
    pub fn new(local: NodeId) -> Self {
        Self {
            local,
            routes: HashMap::default(),
            arrivals: HashMap::default(),
            recent: RecentSet::new(256),
        }
    }

    /// Adding a route for a channel that does not exist yet is a caller
    /// error: logged and ignored, per the table's invariant.
    pub fn add_route(&mut self, dest: NodeId, channel: usize, forwarder: NodeId, channel_exists: bool) {
        if !channel_exists {
            warn!(%dest, channel, "route added before its channel exists, ignoring");
            return;
        }
        self.routes.insert(dest, Route { channel, forwarder });
    }

    pub fn route(&self, dest: NodeId) -> Option<Route> {
        self.routes.get(&dest).copied()
    }

    pub fn note_arrival(&mut self, source: NodeId, channel: usize) {
        self.arrivals.insert(source, channel);
    }

    /// Which channel did `source`'s traffic last arrive on?
    pub fn arrival_channel(&self, source: NodeId) -> Option<usize> {
        self.arrivals.get(&source).copied()
    }

    pub fn clear_channel(&mut self, channel: usize) {
        self.routes.retain(|_, r| r.channel != channel);
        self.arrivals.retain(|_, c| *c != channel);
    }

    pub fn clear(&mut self) {
        self.routes.clear();
        self.arrivals.clear();
        self.recent.clear();
    }

    /// A relay announced "I forward `source`'s traffic to `receiver`". The
    /// true source learns the reverse route; everyone in between passes the
    /// announcement back toward the source.
    pub fn handle_forward_notification(
        &mut self,
        forwarder: NodeId,
        source: NodeId,
        receiver: NodeId,
        arrived_on: usize,
    ) -> ForwardNotice {
        if source == self.local {
            let Some(via) = self.routes.get(&forwarder).copied() else {
                warn!(%forwarder, "forward announcement from unrouted relay ignored");
                return ForwardNotice::Ignored;
            };
            debug!(%receiver, %forwarder, "learned relayed route");
            self.routes.insert(
                receiver,
                Route {
                    channel: via.channel,
                    forwarder,
                },
            );
            return ForwardNotice::Recorded;
        }
        if !self.recent.insert([forwarder.extended(), source.extended(), receiver.extended()]) {
            return ForwardNotice::Ignored;
        }
        let Some(toward_source) = self.routes.get(&source).copied() else {
            warn!(%source, "no route toward announcement source, dropping");
            return ForwardNotice::Ignored;
        };
        if toward_source.channel == arrived_on {
            ForwardNotice::RefusedLoop
        } else {
            ForwardNotice::Relay(toward_source.channel)
        }
    }
}

/// Bounded set of recently seen announcement keys, evicting oldest first.
/// Keeps re-forwarded announcements from echoing around cyclic cabling.
struct RecentSet {
    cap: usize,
    set: HashSet<[u8; 3], RandomState>,
    order: VecDeque<[u8; 3]>,
}

impl RecentSet {
    fn new(cap: usize) -> Self {
        Self {
            cap,
            set: HashSet::default(),
            order: VecDeque::new(),
        }
    }

    /// Returns false if the key was already present.
    fn insert(&mut self, key: [u8; 3]) -> bool {
        if !self.set.insert(key) {
            return false;
        }
        self.order.push_back(key);
        if self.order.len() > self.cap {
            if let Some(old) = self.order.pop_front() {
                self.set.remove(&old);
            }
        }
        true
    }

    fn clear(&mut self) {
        self.set.clear();
        self.order.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn n(rank: u8) -> NodeId {
        NodeId::new(0, rank)
    }

    #[test]
    fn route_before_channel_is_ignored() {
        let mut router = CommandRouter::new(n(0));
        router.add_route(n(1), 0, n(0), false);
        assert_eq!(router.route(n(1)), None);
        router.add_route(n(1), 0, n(0), true);
        assert_eq!(
            router.route(n(1)),
            Some(Route {
                channel: 0,
                forwarder: n(0)
            })
        );
    }

    #[test]
    fn source_records_relayed_route() {
        let mut router = CommandRouter::new(n(0));
        // Direct channel 0 to node 1, which relays for node 2.
        router.add_route(n(1), 0, n(0), true);
        assert_eq!(
            router.handle_forward_notification(n(1), n(0), n(2), 0),
            ForwardNotice::Recorded
        );
        assert_eq!(
            router.route(n(2)),
            Some(Route {
                channel: 0,
                forwarder: n(1)
            })
        );
    }

    #[test]
    fn intermediate_relays_toward_source() {
        // Local node 1 sits between source 0 (channel 0) and relay 2.
        let mut router = CommandRouter::new(n(1));
        router.add_route(n(0), 0, n(1), true);
        router.add_route(n(2), 1, n(1), true);
        assert_eq!(
            router.handle_forward_notification(n(2), n(0), n(3), 1),
            ForwardNotice::Relay(0)
        );
    }

    #[test]
    fn relay_refuses_to_loop() {
        let mut router = CommandRouter::new(n(1));
        router.add_route(n(0), 0, n(1), true);
        assert_eq!(
            router.handle_forward_notification(n(2), n(0), n(3), 0),
            ForwardNotice::RefusedLoop
        );
    }

    #[test]
    fn duplicate_announcements_are_suppressed() {
        let mut router = CommandRouter::new(n(1));
        router.add_route(n(0), 0, n(1), true);
        assert_eq!(
            router.handle_forward_notification(n(2), n(0), n(3), 1),
            ForwardNotice::Relay(0)
        );
        assert_eq!(
            router.handle_forward_notification(n(2), n(0), n(3), 1),
            ForwardNotice::Ignored
        );
    }

    #[test]
    fn disconnect_clears_channel_state() {
        let mut router = CommandRouter::new(n(0));
        router.add_route(n(1), 0, n(0), true);
        router.add_route(n(2), 1, n(0), true);
        router.note_arrival(n(1), 0);
        router.clear_channel(0);
        assert_eq!(router.route(n(1)), None);
        assert_eq!(router.arrival_channel(n(1)), None);
        assert!(router.route(n(2)).is_some());
    }
}
