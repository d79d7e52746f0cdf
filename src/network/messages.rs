//! Protocol message model.
//!
//! Every datagram carries exactly one [`Message`]: a fixed [`MessageHeader`]
//! followed by one [`MessageBody`] variant selected by the header's type tag.
//! The byte layout lives in [`wire`](crate::network::wire); this module only
//! describes the values.

use smallvec::SmallVec;

use crate::Frame;

/// One entry of the connect-status gossip table.
///
/// `last_frame` only ever moves forward and `disconnected` is never cleared once set.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub struct ConnectStatus {
    /// Whether this queue has disconnected.
    pub disconnected: bool,
    /// The last frame confirmed for this queue.
    pub last_frame: Frame,
}

impl Default for ConnectStatus {
    fn default() -> Self {
        Self {
            disconnected: false,
            last_frame: Frame::NULL,
        }
    }
}

/// Connect-status table as it travels on the wire. Sized inline for up to four queues.
pub type ConnectStatusTable = SmallVec<[ConnectStatus; 4]>;

/// Wire tag of a message. `0` is never a valid tag.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum MessageType {
    /// [`SyncRequest`]
    SyncRequest = 1,
    /// [`SyncReply`]
    SyncReply = 2,
    /// [`Input`]
    Input = 3,
    /// [`QualityReport`]
    QualityReport = 4,
    /// [`QualityReply`]
    QualityReply = 5,
    /// [`InputAck`]
    InputAck = 6,
    /// Keep-alive, no payload.
    KeepAlive = 7,
    /// [`ConsistencyCheckRequest`]
    ConsistencyCheckRequest = 8,
    /// [`ConsistencyCheckReply`]
    ConsistencyCheckReply = 9,
}

impl MessageType {
    /// Maps a wire tag back to a message type, `None` for unknown tags.
    #[must_use]
    pub const fn from_tag(tag: u8) -> Option<Self> {
        match tag {
            1 => Some(Self::SyncRequest),
            2 => Some(Self::SyncReply),
            3 => Some(Self::Input),
            4 => Some(Self::QualityReport),
            5 => Some(Self::QualityReply),
            6 => Some(Self::InputAck),
            7 => Some(Self::KeepAlive),
            8 => Some(Self::ConsistencyCheckRequest),
            9 => Some(Self::ConsistencyCheckReply),
            _ => None,
        }
    }

    /// The wire tag.
    #[must_use]
    pub const fn tag(self) -> u8 {
        self as u8
    }

    /// Whether this type belongs to the handshake, which is exempt from the
    /// running-state, magic and sequence checks.
    #[must_use]
    pub const fn is_handshake(self) -> bool {
        matches!(self, Self::SyncRequest | Self::SyncReply)
    }
}

/// Handshake request: please echo `random_request` back.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Default)]
pub struct SyncRequest {
    /// Nonce the reply must echo.
    pub random_request: u32,
    /// Sender's clock, in milliseconds, echoed as `pong`.
    pub ping: u64,
}

/// Handshake answer.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Default)]
pub struct SyncReply {
    /// The nonce of the request being answered.
    pub random_reply: u32,
    /// The request's `ping`, unchanged.
    pub pong: u64,
}

/// A delta-compressed run of input frames plus piggybacked acknowledgement and gossip.
#[derive(Clone, PartialEq, Eq)]
pub struct Input {
    /// Frame of the first encoded input.
    pub start_frame: Frame,
    /// Size of one input frame, in bytes.
    pub input_size: u16,
    /// Number of meaningful bits in `bits`.
    pub num_bits: u16,
    /// Last input frame the sender received from us.
    pub ack_frame: Frame,
    /// Sender is leaving the session.
    pub disconnect_requested: bool,
    /// Sender's view of every queue's connect status.
    pub peer_connect_status: ConnectStatusTable,
    /// Encoded diff stream. Only the first `num_bits` bits are meaningful.
    pub bits: Vec<u8>,
}

impl Default for Input {
    fn default() -> Self {
        Self {
            start_frame: Frame::NULL,
            input_size: 0,
            num_bits: 0,
            ack_frame: Frame::NULL,
            disconnect_requested: false,
            peer_connect_status: ConnectStatusTable::new(),
            bits: Vec::new(),
        }
    }
}

impl std::fmt::Debug for Input {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let Self {
            start_frame,
            input_size,
            num_bits,
            ack_frame,
            disconnect_requested,
            peer_connect_status,
            bits,
        } = self;

        f.debug_struct("Input")
            .field("start_frame", start_frame)
            .field("input_size", input_size)
            .field("num_bits", num_bits)
            .field("ack_frame", ack_frame)
            .field("disconnect_requested", disconnect_requested)
            .field("peer_connect_status", peer_connect_status)
            .field("bits", &BytesDebug(bits))
            .finish()
    }
}

struct BytesDebug<'a>(&'a [u8]);

impl std::fmt::Debug for BytesDebug<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("0x")?;
        for byte in self.0 {
            write!(f, "{:02x}", byte)?;
        }
        Ok(())
    }
}

/// Standalone acknowledgement of received inputs.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct InputAck {
    /// Last input frame received.
    pub ack_frame: Frame,
}

impl Default for InputAck {
    fn default() -> Self {
        Self {
            ack_frame: Frame::NULL,
        }
    }
}

/// Periodic ping plus the sender's frame advantage.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Default)]
pub struct QualityReport {
    /// Sender's clock, in milliseconds.
    pub ping: u64,
    /// How many frames the sender believes it is ahead of us.
    ///
    /// An `i16` survives a peer being paused for minutes without clamping.
    pub frame_advantage: i16,
}

/// Answer to a [`QualityReport`].
#[derive(Copy, Clone, Debug, PartialEq, Eq, Default)]
pub struct QualityReply {
    /// The report's `ping`, unchanged.
    pub pong: u64,
}

/// Asks the peer for its state checksum at `frame`.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct ConsistencyCheckRequest {
    /// The audited frame.
    pub frame: Frame,
}

/// The peer's state checksum at `frame`.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct ConsistencyCheckReply {
    /// The audited frame.
    pub frame: Frame,
    /// Checksum of the peer's saved state at `frame`.
    pub checksum: u128,
}

/// Fixed header shared by every message.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Default)]
pub struct MessageHeader {
    /// Sender's session magic. Stamped by the outbound pump.
    pub magic: u16,
    /// Per-connection wrapping sequence number. Stamped by the outbound pump.
    pub sequence: u16,
}

/// Payload variants; the header's type tag is derived from the variant.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum MessageBody {
    /// Handshake request.
    SyncRequest(SyncRequest),
    /// Handshake answer.
    SyncReply(SyncReply),
    /// Compressed input run.
    Input(Input),
    /// Input acknowledgement.
    InputAck(InputAck),
    /// Ping and frame advantage.
    QualityReport(QualityReport),
    /// Ping answer.
    QualityReply(QualityReply),
    /// No-op to keep the connection alive.
    KeepAlive,
    /// Checksum audit request.
    ConsistencyCheckRequest(ConsistencyCheckRequest),
    /// Checksum audit answer.
    ConsistencyCheckReply(ConsistencyCheckReply),
}

impl MessageBody {
    /// The wire type of this payload.
    #[must_use]
    pub const fn message_type(&self) -> MessageType {
        match self {
            Self::SyncRequest(_) => MessageType::SyncRequest,
            Self::SyncReply(_) => MessageType::SyncReply,
            Self::Input(_) => MessageType::Input,
            Self::InputAck(_) => MessageType::InputAck,
            Self::QualityReport(_) => MessageType::QualityReport,
            Self::QualityReply(_) => MessageType::QualityReply,
            Self::KeepAlive => MessageType::KeepAlive,
            Self::ConsistencyCheckRequest(_) => MessageType::ConsistencyCheckRequest,
            Self::ConsistencyCheckReply(_) => MessageType::ConsistencyCheckReply,
        }
    }
}

/// The unit that [`NonBlockingSocket`] sends and receives.
///
/// [`NonBlockingSocket`]: crate::NonBlockingSocket
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Message {
    /// Magic and sequence number.
    pub header: MessageHeader,
    /// The payload.
    pub body: MessageBody,
}

impl Message {
    /// Builds a message with an unstamped header. The outbound pump fills it in.
    #[must_use]
    pub fn unstamped(body: MessageBody) -> Self {
        Self {
            header: MessageHeader::default(),
            body,
        }
    }

    /// The wire type of this message.
    #[must_use]
    pub const fn message_type(&self) -> MessageType {
        self.body.message_type()
    }
}

#[cfg(test)]
#[allow(
    clippy::panic,
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::indexing_slicing
)]
mod tests {
    use super::*;

    #[test]
    fn connect_status_default_is_null_and_connected() {
        let status = ConnectStatus::default();
        assert!(!status.disconnected);
        assert_eq!(status.last_frame, Frame::NULL);
    }

    #[test]
    fn every_tag_round_trips() {
        for tag in 1..=9u8 {
            let ty = MessageType::from_tag(tag).unwrap();
            assert_eq!(ty.tag(), tag);
        }
        assert_eq!(MessageType::from_tag(0), None);
        assert_eq!(MessageType::from_tag(10), None);
        assert_eq!(MessageType::from_tag(u8::MAX), None);
    }

    #[test]
    fn only_sync_messages_are_handshake() {
        assert!(MessageType::SyncRequest.is_handshake());
        assert!(MessageType::SyncReply.is_handshake());
        assert!(!MessageType::Input.is_handshake());
        assert!(!MessageType::KeepAlive.is_handshake());
    }

    #[test]
    fn body_reports_its_type() {
        let msg = Message::unstamped(MessageBody::ConsistencyCheckRequest(
            ConsistencyCheckRequest {
                frame: Frame::new(12),
            },
        ));
        assert_eq!(msg.message_type(), MessageType::ConsistencyCheckRequest);
        assert_eq!(msg.header, MessageHeader::default());
    }

    #[test]
    fn input_debug_renders_bits_as_hex() {
        let input = Input {
            bits: vec![0xAB, 0x01],
            ..Input::default()
        };
        let debug = format!("{:?}", input);
        assert!(debug.contains("0xab01"));
    }
}
