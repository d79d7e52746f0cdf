//! Blocking-free UDP socket on top of [`std::net::UdpSocket`].
//!
//! Also holds the datagram helpers shared with the tokio socket: decoding
//! with a drop policy, and the oversized-packet warning.

use std::io::ErrorKind;
use std::net::{IpAddr, Ipv4Addr, SocketAddr, UdpSocket};

use crate::network::messages::Message;
use crate::network::wire::{self, Endianness, WireError};
use crate::report_violation;
use crate::telemetry::{ViolationKind, ViolationSeverity};
use crate::NonBlockingSocket;

/// Largest datagram read in one `recv_from`.
pub(crate) const RECV_BUFFER_SIZE: usize = 4096;
/// Initial capacity of the reused send buffer.
pub(crate) const SEND_BUFFER_SIZE: usize = 1024;
/// Datagrams above this size risk IP fragmentation; losing any fragment loses the datagram.
pub(crate) const IDEAL_MAX_UDP_PACKET_SIZE: usize = 508;

/// Decodes one datagram from `from`, or explains why it was dropped.
///
/// Unknown message types are reported as violations since they usually mean
/// a version mismatch; anything else malformed is only traced.
pub(crate) fn decode_datagram(
    datagram: &[u8],
    from: SocketAddr,
    endianness: Endianness,
) -> Option<Message> {
    match wire::decode(datagram, endianness) {
        Ok(msg) => Some(msg),
        Err(WireError::UnknownType { tag }) => {
            report_violation!(
                ViolationSeverity::Warning,
                ViolationKind::NetworkProtocol,
                "dropping datagram from {} with unknown message type {}",
                from,
                tag
            );
            None
        },
        Err(err) => {
            tracing::debug!(%from, len = datagram.len(), error = %err, "dropping undecodable datagram");
            None
        },
    }
}

/// Warns when a datagram is large enough to be fragmented.
///
/// Usually a large input type or a long unacknowledged backlog. Harmless once
/// in a while, so it is only a warning.
pub(crate) fn warn_if_oversized(len: usize, to: &SocketAddr) {
    if len > IDEAL_MAX_UDP_PACKET_SIZE {
        report_violation!(
            ViolationSeverity::Warning,
            ViolationKind::NetworkProtocol,
            "sending {} byte datagram to {}, above the {} byte fragmentation threshold",
            len,
            to,
            IDEAL_MAX_UDP_PACKET_SIZE
        );
    }
}

/// A non-blocking UDP socket for a [`PeerSession`](crate::sessions::peer_session::PeerSession).
///
/// Messages use the fixed layout from [`wire`](crate::network::wire) in the
/// byte order given at construction; both ends must agree on it.
#[derive(Debug)]
pub struct UdpNonBlockingSocket {
    socket: UdpSocket,
    endianness: Endianness,
    recv_buffer: Box<[u8; RECV_BUFFER_SIZE]>,
    send_buffer: Vec<u8>,
    dropped: u64,
}

impl UdpNonBlockingSocket {
    /// Binds to `0.0.0.0:port`. Port 0 lets the OS choose.
    ///
    /// # Errors
    ///
    /// Binding failed or the socket could not be made non-blocking.
    pub fn bind_to_port(port: u16) -> Result<Self, std::io::Error> {
        Self::bind(SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), port))
    }

    /// Binds to `addr`, which may be IPv6 or a single interface.
    ///
    /// # Errors
    ///
    /// Binding failed or the socket could not be made non-blocking.
    pub fn bind(addr: SocketAddr) -> Result<Self, std::io::Error> {
        Self::from_std(UdpSocket::bind(addr)?, Endianness::default())
    }

    /// Like [`bind_to_port`](Self::bind_to_port) with an explicit byte order.
    ///
    /// # Errors
    ///
    /// Same as [`bind_to_port`](Self::bind_to_port).
    pub fn bind_to_port_with(port: u16, endianness: Endianness) -> Result<Self, std::io::Error> {
        let socket = UdpSocket::bind(SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), port))?;
        Self::from_std(socket, endianness)
    }

    /// Adopts an already bound socket and switches it to non-blocking mode.
    ///
    /// # Errors
    ///
    /// The socket refused non-blocking mode.
    pub fn from_std(socket: UdpSocket, endianness: Endianness) -> Result<Self, std::io::Error> {
        socket.set_nonblocking(true)?;
        Ok(Self {
            socket,
            endianness,
            recv_buffer: Box::new([0; RECV_BUFFER_SIZE]),
            send_buffer: Vec::with_capacity(SEND_BUFFER_SIZE),
            dropped: 0,
        })
    }

    /// The address the socket is bound to.
    ///
    /// # Errors
    ///
    /// The OS could not report it.
    pub fn local_addr(&self) -> Result<SocketAddr, std::io::Error> {
        self.socket.local_addr()
    }

    /// The byte order used on the wire.
    #[must_use]
    pub fn endianness(&self) -> Endianness {
        self.endianness
    }

    /// Datagrams received so far that did not decode.
    #[must_use]
    pub fn dropped_datagrams(&self) -> u64 {
        self.dropped
    }
}

impl NonBlockingSocket<SocketAddr> for UdpNonBlockingSocket {
    fn send_to(&mut self, msg: &Message, addr: &SocketAddr) {
        self.send_buffer.clear();
        if let Err(err) = wire::encode_into(msg, self.endianness, &mut self.send_buffer) {
            report_violation!(
                ViolationSeverity::Error,
                ViolationKind::NetworkProtocol,
                "could not encode {:?} for {}: {}",
                msg.message_type(),
                addr,
                err
            );
            return;
        }
        warn_if_oversized(self.send_buffer.len(), addr);
        // best effort: a lost send looks like a lost packet to the protocol
        if let Err(err) = self.socket.send_to(&self.send_buffer, addr) {
            tracing::debug!(%addr, error = %err, "send_to failed");
        }
    }

    fn receive_all_messages(&mut self) -> Vec<(SocketAddr, Message)> {
        let mut received = Vec::new();
        loop {
            let (len, from) = match self.socket.recv_from(self.recv_buffer.as_mut_slice()) {
                Ok(datagram) => datagram,
                Err(err) if err.kind() == ErrorKind::WouldBlock => break,
                // ICMP port unreachable from an earlier send surfaces here on some platforms
                Err(err) if err.kind() == ErrorKind::ConnectionReset => continue,
                Err(err) => {
                    report_violation!(
                        ViolationSeverity::Error,
                        ViolationKind::NetworkProtocol,
                        "recv_from failed: {:?}: {}",
                        err.kind(),
                        err
                    );
                    break;
                },
            };
            let decoded = self
                .recv_buffer
                .get(..len)
                .and_then(|datagram| decode_datagram(datagram, from, self.endianness));
            match decoded {
                Some(msg) => received.push((from, msg)),
                None => self.dropped += 1,
            }
        }
        received
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
    use crate::network::messages::{InputAck, MessageBody, MessageHeader};
    use crate::Frame;

    fn keep_alive(magic: u16, sequence: u16) -> Message {
        Message {
            header: MessageHeader { magic, sequence },
            body: MessageBody::KeepAlive,
        }
    }

    /// Where peers on this host reach `socket`; 0.0.0.0 is not a valid destination everywhere.
    #[cfg(not(miri))]
    fn loopback(socket: &UdpNonBlockingSocket) -> SocketAddr {
        SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), socket.local_addr().unwrap().port())
    }

    /// Polls until `count` messages arrived or a second passed.
    #[cfg(not(miri))]
    fn drain(socket: &mut UdpNonBlockingSocket, count: usize) -> Vec<(SocketAddr, Message)> {
        let mut all = Vec::new();
        for _ in 0..50 {
            all.extend(socket.receive_all_messages());
            if all.len() >= count {
                break;
            }
            std::thread::sleep(std::time::Duration::from_millis(20));
        }
        all
    }

    #[test]
    #[cfg(not(miri))] // sockets are foreign calls
    fn os_assigns_a_port() {
        let socket = UdpNonBlockingSocket::bind_to_port(0).unwrap();
        let local = socket.local_addr().unwrap();
        assert_ne!(local.port(), 0);
        assert!(local.ip().is_unspecified());
    }

    #[test]
    #[cfg(not(miri))]
    fn empty_socket_returns_immediately() {
        let mut socket = UdpNonBlockingSocket::bind(SocketAddr::new(Ipv4Addr::LOCALHOST.into(), 0)).unwrap();
        assert!(socket.receive_all_messages().is_empty());
    }

    #[test]
    #[cfg(not(miri))]
    fn message_crosses_the_loopback() {
        let mut a = UdpNonBlockingSocket::bind_to_port(0).unwrap();
        let mut b = UdpNonBlockingSocket::bind_to_port(0).unwrap();
        let msg = Message {
            header: MessageHeader {
                magic: 0x1234,
                sequence: 7,
            },
            body: MessageBody::InputAck(InputAck {
                ack_frame: Frame::new(42),
            }),
        };
        a.send_to(&msg, &loopback(&b));

        let received = drain(&mut b, 1);
        assert_eq!(received.len(), 1);
        assert_eq!(received[0].0.port(), loopback(&a).port());
        assert_eq!(received[0].1, msg);
    }

    #[test]
    #[cfg(not(miri))]
    fn big_endian_sockets_agree() {
        let mut a = UdpNonBlockingSocket::bind_to_port_with(0, Endianness::Big).unwrap();
        let mut b = UdpNonBlockingSocket::bind_to_port_with(0, Endianness::Big).unwrap();
        assert_eq!(a.endianness(), Endianness::Big);
        a.send_to(&keep_alive(0xBEEF, 300), &loopback(&b));
        assert_eq!(drain(&mut b, 1)[0].1, keep_alive(0xBEEF, 300));
    }

    #[test]
    #[cfg(not(miri))]
    fn garbage_is_counted_and_skipped() {
        let raw = UdpSocket::bind("127.0.0.1:0").unwrap();
        let mut socket = UdpNonBlockingSocket::bind_to_port(0).unwrap();
        let addr = loopback(&socket);

        raw.send_to(&[0xEE, 0, 0, 0, 0], addr).unwrap();
        raw.send_to(&[0x01], addr).unwrap();
        let mut sender = UdpNonBlockingSocket::bind_to_port(0).unwrap();
        sender.send_to(&keep_alive(1, 1), &addr);

        let received = drain(&mut socket, 1);
        assert_eq!(received.len(), 1);
        assert_eq!(received[0].1, keep_alive(1, 1));
        assert_eq!(socket.dropped_datagrams(), 2);
    }

    #[test]
    #[cfg(not(miri))]
    fn unreachable_destination_is_tolerated() {
        let mut socket = UdpNonBlockingSocket::bind_to_port(0).unwrap();
        socket.send_to(&keep_alive(1, 0), &SocketAddr::new(Ipv4Addr::UNSPECIFIED.into(), 0));
        assert!(socket.receive_all_messages().is_empty());
    }

    #[test]
    fn decode_datagram_drops_unknown_tags() {
        let from = SocketAddr::new(Ipv4Addr::LOCALHOST.into(), 9);
        let bytes = wire::encode(&keep_alive(3, 4), Endianness::Little).unwrap();
        assert_eq!(
            decode_datagram(&bytes, from, Endianness::Little),
            Some(keep_alive(3, 4))
        );
        assert_eq!(decode_datagram(&[0xEE, 0, 0, 0, 0], from, Endianness::Little), None);
        assert_eq!(decode_datagram(&[], from, Endianness::Little), None);
    }
}
