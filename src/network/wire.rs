//! Fixed-layout wire codec for [`Message`].
//!
//! The layout is independent of host endianness; the byte order of every
//! multi-byte field is chosen by [`Endianness`] at the codec boundary and both
//! peers must agree on it.
//!
//! ```text
//! header   | type:u8 | magic:u16 | sequence:u16 |
//! SyncRequest              | random_request:u32 | ping:u64 |
//! SyncReply                | random_reply:u32   | pong:u64 |
//! Input                    | start_frame:i32 | input_size:u16 | num_bits:u16 | ack_frame:i32 |
//!                          | disconnect_requested:u8 | peer_count:u8 |
//!                          | peer_count x (last_frame:i32 | disconnected:u8) |
//!                          | ceil(num_bits / 8) bytes of bits |
//! QualityReport            | ping:u64 | frame_advantage:i16 |
//! QualityReply             | pong:u64 |
//! InputAck                 | ack_frame:i32 |
//! KeepAlive                | (empty) |
//! ConsistencyCheckRequest  | frame:i32 |
//! ConsistencyCheckReply    | frame:i32 | checksum:u128 |
//! ```
//!
//! Decoding rejects unknown type tags before looking at the payload.

use std::fmt;

use crate::network::messages::{
    ConnectStatus, ConnectStatusTable, ConsistencyCheckReply, ConsistencyCheckRequest, Input,
    InputAck, Message, MessageBody, MessageHeader, MessageType, QualityReply, QualityReport,
    SyncReply, SyncRequest,
};
use crate::Frame;

/// Size of [`MessageHeader`] on the wire, including the type tag.
pub const HEADER_SIZE: usize = 5;

/// Size of the IPv4 + UDP headers, counted as overhead in bandwidth statistics.
pub const UDP_HEADER_SIZE: usize = 28;

/// Byte order of multi-byte fields.
#[derive(Debug, Default, Copy, Clone, PartialEq, Eq, Hash)]
pub enum Endianness {
    /// Least significant byte first.
    #[default]
    Little,
    /// Most significant byte first (network order).
    Big,
}

/// Reasons a datagram could not be decoded, or a message could not be encoded.
#[derive(Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum WireError {
    /// The type tag does not name a known message.
    UnknownType {
        /// The tag found in the header.
        tag: u8,
    },
    /// The datagram ended before a field could be read.
    Truncated {
        /// Bytes required by the next field.
        needed: usize,
        /// Bytes left in the datagram.
        remaining: usize,
    },
    /// A field held a value outside of its domain.
    InvalidField {
        /// Name of the field.
        field: &'static str,
        /// The raw value, widened for display.
        value: u64,
    },
    /// Bytes remained after the payload was fully read.
    TrailingBytes {
        /// Number of unread bytes.
        count: usize,
    },
}

impl fmt::Display for WireError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::UnknownType { tag } => write!(f, "unknown message type tag {tag}"),
            Self::Truncated { needed, remaining } => write!(
                f,
                "datagram truncated: needed {needed} bytes, {remaining} remaining"
            ),
            Self::InvalidField { field, value } => {
                write!(f, "invalid value {value} for field {field}")
            },
            Self::TrailingBytes { count } => {
                write!(f, "{count} unexpected trailing bytes after payload")
            },
        }
    }
}

impl std::error::Error for WireError {}

macro_rules! put_int {
    ($name:ident, $ty:ty) => {
        fn $name(&mut self, value: $ty) {
            match self.endianness {
                Endianness::Little => self.buf.extend_from_slice(&value.to_le_bytes()),
                Endianness::Big => self.buf.extend_from_slice(&value.to_be_bytes()),
            }
        }
    };
}

macro_rules! get_int {
    ($name:ident, $ty:ty) => {
        fn $name(&mut self) -> Result<$ty, WireError> {
            const N: usize = std::mem::size_of::<$ty>();
            let bytes = self.take(N)?;
            let mut array = [0u8; N];
            array.copy_from_slice(bytes);
            Ok(match self.endianness {
                Endianness::Little => <$ty>::from_le_bytes(array),
                Endianness::Big => <$ty>::from_be_bytes(array),
            })
        }
    };
}

struct WireWriter<'a> {
    buf: &'a mut Vec<u8>,
    endianness: Endianness,
}

impl WireWriter<'_> {
    fn put_u8(&mut self, value: u8) {
        self.buf.push(value);
    }

    fn put_bool(&mut self, value: bool) {
        self.buf.push(u8::from(value));
    }

    fn put_frame(&mut self, frame: Frame) {
        self.put_i32(frame.as_i32());
    }

    put_int!(put_u16, u16);
    put_int!(put_i16, i16);
    put_int!(put_u32, u32);
    put_int!(put_i32, i32);
    put_int!(put_u64, u64);
    put_int!(put_u128, u128);
}

struct WireReader<'a> {
    bytes: &'a [u8],
    pos: usize,
    endianness: Endianness,
}

impl<'a> WireReader<'a> {
    fn take(&mut self, n: usize) -> Result<&'a [u8], WireError> {
        let remaining = self.bytes.len().saturating_sub(self.pos);
        let slice = self
            .bytes
            .get(self.pos..self.pos + n)
            .ok_or(WireError::Truncated {
                needed: n,
                remaining,
            })?;
        self.pos += n;
        Ok(slice)
    }

    fn get_u8(&mut self) -> Result<u8, WireError> {
        Ok(self.take(1)?[0])
    }

    fn get_bool(&mut self, field: &'static str) -> Result<bool, WireError> {
        match self.get_u8()? {
            0 => Ok(false),
            1 => Ok(true),
            other => Err(WireError::InvalidField {
                field,
                value: u64::from(other),
            }),
        }
    }

    fn get_frame(&mut self) -> Result<Frame, WireError> {
        self.get_i32().map(Frame::new)
    }

    fn finish(&self) -> Result<(), WireError> {
        match self.bytes.len() - self.pos {
            0 => Ok(()),
            count => Err(WireError::TrailingBytes { count }),
        }
    }

    get_int!(get_u16, u16);
    get_int!(get_i16, i16);
    get_int!(get_u32, u32);
    get_int!(get_i32, i32);
    get_int!(get_u64, u64);
    get_int!(get_u128, u128);
}

/// Number of bytes needed to hold `num_bits` bits.
#[must_use]
pub const fn bits_to_bytes(num_bits: usize) -> usize {
    num_bits.div_ceil(8)
}

/// Encoded size of `msg`, in bytes.
#[must_use]
pub fn encoded_len(msg: &Message) -> usize {
    HEADER_SIZE
        + match &msg.body {
            MessageBody::SyncRequest(_) | MessageBody::SyncReply(_) => 12,
            MessageBody::Input(input) => {
                14 + input.peer_connect_status.len() * 5 + bits_to_bytes(input.num_bits as usize)
            },
            MessageBody::InputAck(_) | MessageBody::ConsistencyCheckRequest(_) => 4,
            MessageBody::QualityReport(_) => 10,
            MessageBody::QualityReply(_) => 8,
            MessageBody::KeepAlive => 0,
            MessageBody::ConsistencyCheckReply(_) => 20,
        }
}

/// Encodes `msg` and returns the bytes.
pub fn encode(msg: &Message, endianness: Endianness) -> Result<Vec<u8>, WireError> {
    let mut buf = Vec::with_capacity(encoded_len(msg));
    encode_into(msg, endianness, &mut buf)?;
    Ok(buf)
}

/// Appends the encoding of `msg` to `buf`, returning the number of bytes written.
///
/// On error `buf` is left at its original length.
pub fn encode_into(
    msg: &Message,
    endianness: Endianness,
    buf: &mut Vec<u8>,
) -> Result<usize, WireError> {
    let start = buf.len();
    let result = write_message(
        msg,
        &mut WireWriter {
            buf: &mut *buf,
            endianness,
        },
    );
    match result {
        Ok(()) => Ok(buf.len() - start),
        Err(err) => {
            buf.truncate(start);
            Err(err)
        },
    }
}

fn write_message(msg: &Message, w: &mut WireWriter<'_>) -> Result<(), WireError> {
    w.put_u8(msg.message_type().tag());
    w.put_u16(msg.header.magic);
    w.put_u16(msg.header.sequence);

    match &msg.body {
        MessageBody::SyncRequest(body) => {
            w.put_u32(body.random_request);
            w.put_u64(body.ping);
        },
        MessageBody::SyncReply(body) => {
            w.put_u32(body.random_reply);
            w.put_u64(body.pong);
        },
        MessageBody::Input(body) => write_input(body, w)?,
        MessageBody::InputAck(body) => w.put_frame(body.ack_frame),
        MessageBody::QualityReport(body) => {
            w.put_u64(body.ping);
            w.put_i16(body.frame_advantage);
        },
        MessageBody::QualityReply(body) => w.put_u64(body.pong),
        MessageBody::KeepAlive => {},
        MessageBody::ConsistencyCheckRequest(body) => w.put_frame(body.frame),
        MessageBody::ConsistencyCheckReply(body) => {
            w.put_frame(body.frame);
            w.put_u128(body.checksum);
        },
    }
    Ok(())
}

fn write_input(body: &Input, w: &mut WireWriter<'_>) -> Result<(), WireError> {
    let peer_count =
        u8::try_from(body.peer_connect_status.len()).map_err(|_| WireError::InvalidField {
            field: "peer_count",
            value: body.peer_connect_status.len() as u64,
        })?;
    let bit_bytes = bits_to_bytes(body.num_bits as usize);
    let bits = body.bits.get(..bit_bytes).ok_or(WireError::InvalidField {
        field: "num_bits",
        value: u64::from(body.num_bits),
    })?;

    w.put_frame(body.start_frame);
    w.put_u16(body.input_size);
    w.put_u16(body.num_bits);
    w.put_frame(body.ack_frame);
    w.put_bool(body.disconnect_requested);
    w.put_u8(peer_count);
    for status in &body.peer_connect_status {
        w.put_frame(status.last_frame);
        w.put_bool(status.disconnected);
    }
    w.buf.extend_from_slice(bits);
    Ok(())
}

/// Decodes one datagram.
///
/// Fails with [`WireError::UnknownType`] before touching the payload when the
/// tag is not recognised.
pub fn decode(bytes: &[u8], endianness: Endianness) -> Result<Message, WireError> {
    let mut r = WireReader {
        bytes,
        pos: 0,
        endianness,
    };
    let tag = r.get_u8()?;
    let ty = MessageType::from_tag(tag).ok_or(WireError::UnknownType { tag })?;
    let header = MessageHeader {
        magic: r.get_u16()?,
        sequence: r.get_u16()?,
    };

    let body = match ty {
        MessageType::SyncRequest => MessageBody::SyncRequest(SyncRequest {
            random_request: r.get_u32()?,
            ping: r.get_u64()?,
        }),
        MessageType::SyncReply => MessageBody::SyncReply(SyncReply {
            random_reply: r.get_u32()?,
            pong: r.get_u64()?,
        }),
        MessageType::Input => MessageBody::Input(read_input(&mut r)?),
        MessageType::QualityReport => MessageBody::QualityReport(QualityReport {
            ping: r.get_u64()?,
            frame_advantage: r.get_i16()?,
        }),
        MessageType::QualityReply => MessageBody::QualityReply(QualityReply {
            pong: r.get_u64()?,
        }),
        MessageType::InputAck => MessageBody::InputAck(InputAck {
            ack_frame: r.get_frame()?,
        }),
        MessageType::KeepAlive => MessageBody::KeepAlive,
        MessageType::ConsistencyCheckRequest => {
            MessageBody::ConsistencyCheckRequest(ConsistencyCheckRequest {
                frame: r.get_frame()?,
            })
        },
        MessageType::ConsistencyCheckReply => {
            MessageBody::ConsistencyCheckReply(ConsistencyCheckReply {
                frame: r.get_frame()?,
                checksum: r.get_u128()?,
            })
        },
    };
    r.finish()?;

    Ok(Message { header, body })
}

fn read_input(r: &mut WireReader<'_>) -> Result<Input, WireError> {
    let start_frame = r.get_frame()?;
    let input_size = r.get_u16()?;
    let num_bits = r.get_u16()?;
    let ack_frame = r.get_frame()?;
    let disconnect_requested = r.get_bool("disconnect_requested")?;
    let peer_count = r.get_u8()?;

    let mut peer_connect_status = ConnectStatusTable::with_capacity(peer_count as usize);
    for _ in 0..peer_count {
        let last_frame = r.get_frame()?;
        let disconnected = r.get_bool("disconnected")?;
        peer_connect_status.push(ConnectStatus {
            disconnected,
            last_frame,
        });
    }

    // stop at num_bits, never at buffer capacity
    let bits = r.take(bits_to_bytes(num_bits as usize))?.to_vec();

    Ok(Input {
        start_frame,
        input_size,
        num_bits,
        ack_frame,
        disconnect_requested,
        peer_connect_status,
        bits,
    })
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
    use smallvec::smallvec;

    fn header() -> MessageHeader {
        MessageHeader {
            magic: 0xBEEF,
            sequence: 0x0102,
        }
    }

    fn sample_input() -> Message {
        Message {
            header: header(),
            body: MessageBody::Input(Input {
                start_frame: Frame::new(10),
                input_size: 4,
                num_bits: 11,
                ack_frame: Frame::new(7),
                disconnect_requested: false,
                peer_connect_status: smallvec![
                    ConnectStatus {
                        disconnected: false,
                        last_frame: Frame::new(9),
                    },
                    ConnectStatus {
                        disconnected: true,
                        last_frame: Frame::NULL,
                    },
                ],
                bits: vec![0b1010_1010, 0b0000_0101],
            }),
        }
    }

    // ==========================================
    // Layout
    // ==========================================

    #[test]
    fn header_layout_little_endian() {
        let msg = Message {
            header: header(),
            body: MessageBody::KeepAlive,
        };
        let bytes = encode(&msg, Endianness::Little).unwrap();
        assert_eq!(bytes, vec![7, 0xEF, 0xBE, 0x02, 0x01]);
    }

    #[test]
    fn header_layout_big_endian() {
        let msg = Message {
            header: header(),
            body: MessageBody::KeepAlive,
        };
        let bytes = encode(&msg, Endianness::Big).unwrap();
        assert_eq!(bytes, vec![7, 0xBE, 0xEF, 0x01, 0x02]);
    }

    #[test]
    fn consistency_reply_layout_big_endian() {
        let msg = Message {
            header: header(),
            body: MessageBody::ConsistencyCheckReply(ConsistencyCheckReply {
                frame: Frame::new(0x0A0B0C0D),
                checksum: 1,
            }),
        };
        let bytes = encode(&msg, Endianness::Big).unwrap();
        assert_eq!(bytes.len(), encoded_len(&msg));
        assert_eq!(&bytes[5..9], &[0x0A, 0x0B, 0x0C, 0x0D]);
        assert_eq!(bytes[24], 1);
        assert!(bytes[9..24].iter().all(|b| *b == 0));
    }

    #[test]
    fn input_layout_matches_field_order() {
        let msg = sample_input();
        let bytes = encode(&msg, Endianness::Little).unwrap();
        assert_eq!(bytes.len(), encoded_len(&msg));
        // start_frame
        assert_eq!(&bytes[5..9], &10i32.to_le_bytes());
        // input_size, num_bits
        assert_eq!(&bytes[9..11], &4u16.to_le_bytes());
        assert_eq!(&bytes[11..13], &11u16.to_le_bytes());
        // ack_frame, disconnect_requested, peer_count
        assert_eq!(&bytes[13..17], &7i32.to_le_bytes());
        assert_eq!(bytes[17], 0);
        assert_eq!(bytes[18], 2);
        // second status: NULL frame, disconnected
        assert_eq!(&bytes[24..28], &(-1i32).to_le_bytes());
        assert_eq!(bytes[28], 1);
        // bits
        assert_eq!(&bytes[29..], &[0b1010_1010, 0b0000_0101]);
    }

    // ==========================================
    // Round trips
    // ==========================================

    #[test]
    fn every_variant_round_trips_in_both_byte_orders() {
        let bodies = vec![
            MessageBody::SyncRequest(SyncRequest {
                random_request: 0xDEAD_BEEF,
                ping: 123_456_789,
            }),
            MessageBody::SyncReply(SyncReply {
                random_reply: 42,
                pong: u64::MAX,
            }),
            MessageBody::InputAck(InputAck {
                ack_frame: Frame::new(99),
            }),
            MessageBody::QualityReport(QualityReport {
                ping: 5,
                frame_advantage: -3,
            }),
            MessageBody::QualityReply(QualityReply { pong: 77 }),
            MessageBody::KeepAlive,
            MessageBody::ConsistencyCheckRequest(ConsistencyCheckRequest {
                frame: Frame::new(300),
            }),
            MessageBody::ConsistencyCheckReply(ConsistencyCheckReply {
                frame: Frame::new(300),
                checksum: u128::MAX - 5,
            }),
        ];
        for endianness in [Endianness::Little, Endianness::Big] {
            for body in &bodies {
                let msg = Message {
                    header: header(),
                    body: body.clone(),
                };
                let bytes = encode(&msg, endianness).unwrap();
                assert_eq!(bytes.len(), encoded_len(&msg));
                assert_eq!(decode(&bytes, endianness).unwrap(), msg);
            }
            let input = sample_input();
            let bytes = encode(&input, endianness).unwrap();
            assert_eq!(decode(&bytes, endianness).unwrap(), input);
        }
    }

    #[test]
    fn encoding_ignores_bit_buffer_capacity_beyond_num_bits() {
        let mut msg = sample_input();
        if let MessageBody::Input(input) = &mut msg.body {
            input.bits.extend_from_slice(&[0xFF; 8]);
        }
        let bytes = encode(&msg, Endianness::Little).unwrap();
        let decoded = decode(&bytes, Endianness::Little).unwrap();
        match decoded.body {
            MessageBody::Input(input) => assert_eq!(input.bits.len(), 2),
            other => panic!("unexpected body {other:?}"),
        }
    }

    // ==========================================
    // Rejection
    // ==========================================

    #[test]
    fn unknown_type_is_rejected_before_payload() {
        let bytes = [0u8, 0xAA, 0xBB, 0, 0, 1, 2, 3];
        assert_eq!(
            decode(&bytes, Endianness::Little),
            Err(WireError::UnknownType { tag: 0 })
        );
        let bytes = [200u8];
        assert_eq!(
            decode(&bytes, Endianness::Little),
            Err(WireError::UnknownType { tag: 200 })
        );
    }

    #[test]
    fn truncated_payload_is_rejected() {
        let msg = sample_input();
        let bytes = encode(&msg, Endianness::Little).unwrap();
        for cut in 0..bytes.len() {
            assert!(
                decode(&bytes[..cut], Endianness::Little).is_err(),
                "prefix of length {cut} decoded"
            );
        }
    }

    #[test]
    fn trailing_bytes_are_rejected() {
        let msg = Message {
            header: header(),
            body: MessageBody::KeepAlive,
        };
        let mut bytes = encode(&msg, Endianness::Little).unwrap();
        bytes.push(0);
        assert_eq!(
            decode(&bytes, Endianness::Little),
            Err(WireError::TrailingBytes { count: 1 })
        );
    }

    #[test]
    fn non_boolean_flag_is_rejected() {
        let msg = sample_input();
        let mut bytes = encode(&msg, Endianness::Little).unwrap();
        bytes[17] = 2;
        assert!(matches!(
            decode(&bytes, Endianness::Little),
            Err(WireError::InvalidField {
                field: "disconnect_requested",
                value: 2
            })
        ));
    }

    #[test]
    fn short_bit_buffer_fails_to_encode_and_leaves_buffer_untouched() {
        let mut msg = sample_input();
        if let MessageBody::Input(input) = &mut msg.body {
            input.num_bits = 64;
        }
        let mut buf = vec![1, 2, 3];
        assert!(encode_into(&msg, Endianness::Little, &mut buf).is_err());
        assert_eq!(buf, vec![1, 2, 3]);
    }
}
