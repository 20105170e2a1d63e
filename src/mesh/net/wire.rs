use byteorder::{ByteOrder, LittleEndian};
use chrono::Utc;
use rkyv::{Archive, Deserialize, Serialize};

use super::error::Error;
use super::NodeId;

/// Largest payload a raw point-to-point message may carry in-band on the
/// control path. Anything bigger belongs in a shared-memory region.
pub const RAW_PAYLOAD_MAX: usize = 64;

/// Bytes preceding the message body on the wire: u32 length, then the
/// sender's microsecond timestamp.
pub const FRAME_PREFIX_LEN: usize = 4 + 8;

/// Control-plane message set. Every variant has a small fixed layout; the
/// control loop matches on this exhaustively and logs-and-drops anything it
/// does not expect in the current channel state.
#[derive(Archive, Serialize, Deserialize, Clone, Debug, PartialEq)]
#[archive(check_bytes)]
pub enum ControlMessage {
    /// First message either end sends once a cable comes up.
    NodeIdentificationRequest {
        config_node: NodeId,
        hardware_node: u64,
        chassis: u8,
    },
    NodeIdentificationResponse {
        config_node: NodeId,
        hardware_node: u64,
        chassis: u8,
    },
    /// Sent over every link of a channel so the peer can verify that both
    /// sides agree on link ordering.
    LinkIdentification { node: NodeId, link_index: u8 },
    /// Principal's request that both sides swap their link 0/1 slots.
    ChannelLinkSwap,
    ChannelReady { node_a: NodeId, node_b: NodeId },
    /// Agent pings on the primary link once the channel is ready.
    PrimaryLinkPing,
    /// Answered on the secondary link by whichever side got the ping.
    SecondaryLinkPong,
    /// "I have bound data path `path_index` to traffic from `source_node`."
    TxAssignmentNotification { source_node: NodeId, path_index: u8 },
    /// A relay announcing "I am forwarding `source_node`'s traffic to
    /// `receiver`", propagated hop by hop back toward the source.
    TxForwardNotification {
        forwarder: NodeId,
        source_node: NodeId,
        receiver: NodeId,
    },
    RawMessage {
        source: NodeId,
        destination: NodeId,
        length: u16,
        payload: [u8; RAW_PAYLOAD_MAX],
    },
    NewGeneration {
        source: NodeId,
        destination: NodeId,
        generation: u32,
    },
}

impl ControlMessage {
    pub fn encode(&self) -> Result<rkyv::AlignedVec, Error> {
        rkyv::to_bytes::<_, 256>(self).map_err(|_| Error::CouldNotEncodeMessage)
    }

    pub fn decode(buf: &[u8]) -> Result<Self, Error> {
        rkyv::from_bytes(buf).map_err(|_| Error::CouldNotDecodeMessage)
    }

    pub fn name(&self) -> &'static str {
        match self {
            ControlMessage::NodeIdentificationRequest { .. } => "NodeIdentificationRequest",
            ControlMessage::NodeIdentificationResponse { .. } => "NodeIdentificationResponse",
            ControlMessage::LinkIdentification { .. } => "LinkIdentification",
            ControlMessage::ChannelLinkSwap => "ChannelLinkSwap",
            ControlMessage::ChannelReady { .. } => "ChannelReady",
            ControlMessage::PrimaryLinkPing => "PrimaryLinkPing",
            ControlMessage::SecondaryLinkPong => "SecondaryLinkPong",
            ControlMessage::TxAssignmentNotification { .. } => "TxAssignmentNotification",
            ControlMessage::TxForwardNotification { .. } => "TxForwardNotification",
            ControlMessage::RawMessage { .. } => "RawMessage",
            ControlMessage::NewGeneration { .. } => "NewGeneration",
        }
    }
}

/// One framed control message: `len | sent_at | body`.
#[derive(Clone, Debug, PartialEq)]
pub struct ControlFrame {
    /// Microsecond timestamp stamped by the sender.
    pub sent_at: i64,
    pub msg: ControlMessage,
}

impl ControlFrame {
    pub fn new(msg: ControlMessage) -> Self {
        Self {
            sent_at: Utc::now().timestamp_micros(),
            msg,
        }
    }

    pub fn encode(&self) -> Result<Vec<u8>, Error> {
        let body = self.msg.encode()?;
        let len =
            u32::try_from(body.len()).map_err(|_| Error::MessageLengthOverflowed)?;
        let mut buf = Vec::with_capacity(FRAME_PREFIX_LEN + body.len());
        buf.extend_from_slice(&len.to_le_bytes());
        buf.extend_from_slice(&self.sent_at.to_le_bytes());
        buf.extend_from_slice(&body);
        Ok(buf)
    }

    pub fn decode(buf: &[u8]) -> Result<Self, Error> {
        if buf.len() < FRAME_PREFIX_LEN {
            return Err(Error::FrameTruncated);
        }
        let len = LittleEndian::read_u32(&buf[0..4]) as usize;
        let sent_at = LittleEndian::read_i64(&buf[4..12]);
        let end = FRAME_PREFIX_LEN
            .checked_add(len)
            .ok_or(Error::MessageLengthOverflowed)?;
        if buf.len() < end {
            return Err(Error::FrameTruncated);
        }
        let msg = ControlMessage::decode(&buf[FRAME_PREFIX_LEN..end])?;
        Ok(Self { sent_at, msg })
    }
}

/// Builds a raw message, rejecting payloads over the in-band limit.
pub fn raw_message(source: NodeId, destination: NodeId, bytes: &[u8]) -> Result<ControlMessage, Error> {
    if bytes.len() > RAW_PAYLOAD_MAX {
        return Err(Error::PayloadTooLarge {
            len: bytes.len(),
            max: RAW_PAYLOAD_MAX,
        });
    }
    let mut payload = [0u8; RAW_PAYLOAD_MAX];
    payload[..bytes.len()].copy_from_slice(bytes);
    Ok(ControlMessage::RawMessage {
        source,
        destination,
        length: bytes.len() as u16,
        payload,
    })
}
