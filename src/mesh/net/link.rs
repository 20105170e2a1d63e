use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};

use tokio::sync::mpsc::UnboundedSender;
use tracing::trace;

use super::error::Error;
use super::wire::ControlFrame;
use super::{NodeId, RegionId, DATA_PATHS_PER_LINK};

pub type LinkId = u64;
pub type PathIndex = u8;
pub type TransferId = u64;

/// Status delivered with every transmit completion.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompletionStatus {
    Success,
    CrcError,
    Timeout,
}

/// Describes one chunk's worth of outbound data on a specific data path.
/// The trailer tag rides in-band with the final sub-command.
#[derive(Debug, Clone)]
pub struct TransferDescriptor {
    pub region: RegionId,
    pub offset: u64,
    pub len: u32,
    pub path: PathIndex,
}

/// A transfer staged into the transport queue. Sub-commands are submitted
/// against it as their bytes become available, which is what lets a relay
/// start transmitting a chunk before all of it has arrived.
#[derive(Debug, Clone)]
pub struct PreparedTransfer {
    pub id: TransferId,
    pub desc: TransferDescriptor,
}

/// One sub-command's worth of data landing on the receive side.
#[derive(Debug, Clone)]
pub struct DataFrame {
    pub region: RegionId,
    /// Chunk offset within the region.
    pub offset: u64,
    pub path: PathIndex,
    pub sub_index: u8,
    pub sub_count: u8,
    pub bytes: Vec<u8>,
    /// Only meaningful on the final sub-command of a chunk.
    pub trailer: u64,
}

/// Everything a link reports back to its owning fabric.
#[derive(Debug)]
pub enum LinkEvent {
    Control {
        link: LinkId,
        frame: ControlFrame,
    },
    Data {
        link: LinkId,
        frame: DataFrame,
    },
    TxComplete {
        link: LinkId,
        transfer: TransferId,
        /// Bitmap of the sub-commands this completion covers.
        subs: u16,
        status: CompletionStatus,
    },
    Dropped {
        link: LinkId,
    },
}

/// Capability surface of one physical point-to-point connection. The real
/// transport lives outside this crate; `MemoryLink` below is the in-process
/// implementation the tests and the cli run against.
pub trait Link: Send + Sync {
    fn id(&self) -> LinkId;

    /// Largest sub-command the transport moves in one piece.
    fn mtu(&self) -> usize;

    /// Bytes that may sit prepared in the transport queue at once.
    fn queue_capacity(&self) -> usize;

    /// Wires the link's event stream into the owning fabric.
    fn attach(&self, events: UnboundedSender<LinkEvent>);

    fn send_control(&self, frame: &ControlFrame) -> Result<(), Error>;

    /// Binds an inbound data path to traffic originating at `source`.
    /// Returns the existing index if the source is already bound.
    fn assign_rx_path(&self, source: NodeId) -> Result<PathIndex, Error>;

    /// Binds an outbound data path for traffic originating at `source`.
    fn assign_tx_path(&self, source: NodeId) -> Result<PathIndex, Error>;

    /// Reserves transport queue space for one chunk.
    fn prepare(&self, desc: &TransferDescriptor) -> Result<PreparedTransfer, Error>;

    /// Submits one sub-command of a prepared transfer.
    fn submit_sub(
        &self,
        prepared: &PreparedTransfer,
        sub_index: u8,
        sub_count: u8,
        bytes: Vec<u8>,
        trailer: u64,
    ) -> Result<(), Error>;
}

static NEXT_LINK_ID: AtomicU64 = AtomicU64::new(1);

fn path_bind(table: &mut [Option<NodeId>; DATA_PATHS_PER_LINK], node: NodeId) -> Result<PathIndex, Error> {
    for (i, slot) in table.iter().enumerate() {
        if *slot == Some(node) {
            return Ok(i as PathIndex);
        }
    }
    for (i, slot) in table.iter_mut().enumerate() {
        if slot.is_none() {
            *slot = Some(node);
            return Ok(i as PathIndex);
        }
    }
    Err(Error::DataPathsExhausted)
}

/// In-process link: two halves joined back to back, each delivering frames
/// straight into the peer half's event queue. Completions fire as soon as a
/// sub-command has been handed over, which models a transport that confirms
/// on queue drain.
pub struct MemoryLink {
    id: LinkId,
    mtu: usize,
    queue_capacity: usize,
    peer: Mutex<Option<Weak<MemoryLink>>>,
    events: Mutex<Option<UnboundedSender<LinkEvent>>>,
    severed: AtomicBool,
    next_transfer: AtomicU64,
    rx_paths: Mutex<[Option<NodeId>; DATA_PATHS_PER_LINK]>,
    tx_paths: Mutex<[Option<NodeId>; DATA_PATHS_PER_LINK]>,
}

impl MemoryLink {
    /// Creates a connected pair of links.
    pub fn pair(mtu: usize, queue_capacity: usize) -> (Arc<Self>, Arc<Self>) {
        let make = || {
            Arc::new(Self {
                id: NEXT_LINK_ID.fetch_add(1, Ordering::Relaxed),
                mtu,
                queue_capacity,
                peer: Mutex::new(None),
                events: Mutex::new(None),
                severed: AtomicBool::new(false),
                next_transfer: AtomicU64::new(1),
                rx_paths: Mutex::new([None; DATA_PATHS_PER_LINK]),
                tx_paths: Mutex::new([None; DATA_PATHS_PER_LINK]),
            })
        };
        let a = make();
        let b = make();
        *a.peer.lock().unwrap() = Some(Arc::downgrade(&b));
        *b.peer.lock().unwrap() = Some(Arc::downgrade(&a));
        (a, b)
    }

    /// Simulates losing the physical cable. Both ends observe the drop.
    pub fn sever(self: &Arc<Self>) {
        let peer = self.peer.lock().unwrap().take().and_then(|w| w.upgrade());
        self.severed.store(true, Ordering::Release);
        self.emit(LinkEvent::Dropped { link: self.id });
        if let Some(peer) = peer {
            peer.peer.lock().unwrap().take();
            peer.severed.store(true, Ordering::Release);
            peer.emit(LinkEvent::Dropped { link: peer.id });
        }
    }

    fn peer(&self) -> Result<Arc<MemoryLink>, Error> {
        if self.severed.load(Ordering::Acquire) {
            return Err(Error::LinkDetached);
        }
        self.peer
            .lock()
            .unwrap()
            .as_ref()
            .and_then(|w| w.upgrade())
            .ok_or(Error::LinkDetached)
    }

    fn emit(&self, event: LinkEvent) {
        if let Some(tx) = self.events.lock().unwrap().as_ref() {
            // A full teardown on the receiving side is indistinguishable
            // from a dropped cable; nothing to do if the fabric is gone.
            let _ = tx.send(event);
        } else {
            trace!(link = self.id, "event on unattached link discarded");
        }
    }
}

impl Link for MemoryLink {
    fn id(&self) -> LinkId {
        self.id
    }

    fn mtu(&self) -> usize {
        self.mtu
    }

    fn queue_capacity(&self) -> usize {
        self.queue_capacity
    }

    fn attach(&self, events: UnboundedSender<LinkEvent>) {
        *self.events.lock().unwrap() = Some(events);
    }

    fn send_control(&self, frame: &ControlFrame) -> Result<(), Error> {
        let peer = self.peer()?;
        peer.emit(LinkEvent::Control {
            link: peer.id,
            frame: frame.clone(),
        });
        Ok(())
    }

    fn assign_rx_path(&self, source: NodeId) -> Result<PathIndex, Error> {
        path_bind(&mut self.rx_paths.lock().unwrap(), source)
    }

    fn assign_tx_path(&self, source: NodeId) -> Result<PathIndex, Error> {
        path_bind(&mut self.tx_paths.lock().unwrap(), source)
    }

    fn prepare(&self, desc: &TransferDescriptor) -> Result<PreparedTransfer, Error> {
        self.peer()?;
        Ok(PreparedTransfer {
            id: self.next_transfer.fetch_add(1, Ordering::Relaxed),
            desc: desc.clone(),
        })
    }

    fn submit_sub(
        &self,
        prepared: &PreparedTransfer,
        sub_index: u8,
        sub_count: u8,
        bytes: Vec<u8>,
        trailer: u64,
    ) -> Result<(), Error> {
        let peer = self.peer()?;
        peer.emit(LinkEvent::Data {
            link: peer.id,
            frame: DataFrame {
                region: prepared.desc.region,
                offset: prepared.desc.offset,
                path: prepared.desc.path,
                sub_index,
                sub_count,
                bytes,
                trailer,
            },
        });
        self.emit(LinkEvent::TxComplete {
            link: self.id,
            transfer: prepared.id,
            subs: 1 << sub_index,
            status: CompletionStatus::Success,
        });
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc::unbounded_channel;

    #[test]
    fn control_crosses_the_pair() {
        let (a, b) = MemoryLink::pair(16, 1024);
        let (tx, mut rx) = unbounded_channel();
        b.attach(tx);
        let frame = ControlFrame::new(super::super::wire::ControlMessage::PrimaryLinkPing);
        a.send_control(&frame).unwrap();
        match rx.try_recv().unwrap() {
            LinkEvent::Control { link, frame: got } => {
                assert_eq!(link, b.id());
                assert_eq!(got, frame);
            }
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[test]
    fn submit_delivers_data_and_completion() {
        let (a, b) = MemoryLink::pair(16, 1024);
        let (atx, mut arx) = unbounded_channel();
        let (btx, mut brx) = unbounded_channel();
        a.attach(atx);
        b.attach(btx);

        let prepared = a
            .prepare(&TransferDescriptor {
                region: 7,
                offset: 64,
                len: 32,
                path: 0,
            })
            .unwrap();
        a.submit_sub(&prepared, 1, 2, vec![0xaa; 16], 0xfeed).unwrap();

        match brx.try_recv().unwrap() {
            LinkEvent::Data { frame, .. } => {
                assert_eq!(frame.region, 7);
                assert_eq!(frame.offset, 64);
                assert_eq!(frame.sub_index, 1);
                assert_eq!(frame.trailer, 0xfeed);
            }
            other => panic!("unexpected event {other:?}"),
        }
        match arx.try_recv().unwrap() {
            LinkEvent::TxComplete { transfer, subs, status, .. } => {
                assert_eq!(transfer, prepared.id);
                assert_eq!(subs, 1 << 1);
                assert_eq!(status, CompletionStatus::Success);
            }
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[test]
    fn severed_link_rejects_traffic() {
        let (a, b) = MemoryLink::pair(16, 1024);
        let (tx, mut rx) = unbounded_channel();
        a.attach(tx);
        a.sever();
        match rx.try_recv().unwrap() {
            LinkEvent::Dropped { link } => assert_eq!(link, a.id()),
            other => panic!("unexpected event {other:?}"),
        }
        let frame = ControlFrame::new(super::super::wire::ControlMessage::PrimaryLinkPing);
        assert_eq!(a.send_control(&frame), Err(Error::LinkDetached));
        assert_eq!(b.send_control(&frame), Err(Error::LinkDetached));
    }

    #[test]
    fn path_table_reuses_and_exhausts() {
        let (a, _b) = MemoryLink::pair(16, 1024);
        let n0 = NodeId::new(0, 0);
        let p0 = a.assign_rx_path(n0).unwrap();
        assert_eq!(a.assign_rx_path(n0).unwrap(), p0);
        for i in 1..DATA_PATHS_PER_LINK {
            a.assign_rx_path(NodeId::new(0, i as u8)).unwrap();
        }
        assert_eq!(
            a.assign_rx_path(NodeId::new(0, 7)),
            Err(Error::DataPathsExhausted)
        );
    }
}
