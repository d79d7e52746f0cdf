//! Tokio async runtime adapter.
//!
//! [`TokioUdpSocket`] wraps a [`tokio::net::UdpSocket`] and implements
//! [`NonBlockingSocket`], so a [`PeerSession`] can be ticked from an async game
//! loop. It supports two modes:
//!
//! | Mode | Receiving | Sending |
//! |------|-----------|---------|
//! | Polled | `try_recv_from` inside `receive_all_messages()` | `try_send_to` when the session flushes its pumps |
//! | Tasks | [`spawn_receive_loop`](TokioUdpSocket::spawn_receive_loop) forwards datagrams over an mpsc channel | [`spawn_outbound_pump`](crate::network::pump::spawn_outbound_pump) per peer |
//!
//! In task mode the session only drains the channel on each tick; every
//! outbound pump owns the stamping and sending for its peer.
//!
//! # Example
//!
//! ```no_run
//! use bastion_netcode::network::tokio_socket::TokioUdpSocket;
//! use bastion_netcode::network::cancel::CancellationToken;
//!
//! # async fn example() -> std::io::Result<()> {
//! let mut socket = TokioUdpSocket::bind_to_port(7000).await?;
//! let shared = socket.socket();
//! let stop = CancellationToken::new();
//! let _receiver = socket.spawn_receive_loop(stop.clone());
//! // hand `socket` to a PeerSession, start it, then spawn its pumps on `shared`
//! # drop(shared);
//! # Ok(())
//! # }
//! ```
//!
//! This module requires the `tokio` feature flag.
//!
//! [`PeerSession`]: crate::sessions::peer_session::PeerSession
//! [`NonBlockingSocket`]: crate::NonBlockingSocket

use std::io::ErrorKind;
use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::network::cancel::CancellationToken;
use crate::network::udp_socket::{decode_datagram, warn_if_oversized, RECV_BUFFER_SIZE, SEND_BUFFER_SIZE};
use crate::network::wire::{self, Endianness};
use crate::report_violation;
use crate::telemetry::{ViolationKind, ViolationSeverity};
use crate::{network::messages::Message, NonBlockingSocket};

/// Datagrams the receive loop may buffer before it waits for the session.
const INBOUND_CHANNEL_CAPACITY: usize = 1024;

/// A Tokio-backed UDP socket usable by a session.
///
/// # Thread Safety
///
/// The underlying socket is shared behind an [`Arc`], so the receive loop and
/// every outbound pump can use it concurrently.
#[derive(Debug)]
pub struct TokioUdpSocket {
    socket: Arc<UdpSocket>,
    endianness: Endianness,
    /// Set once the receive loop owns receiving.
    inbound: Option<mpsc::Receiver<(SocketAddr, Message)>>,
    recv_buffer: Vec<u8>,
    send_buffer: Vec<u8>,
}

impl TokioUdpSocket {
    /// Wraps a bound socket, using little-endian wire encoding.
    #[must_use]
    pub fn new(socket: UdpSocket) -> Self {
        Self::with_endianness(socket, Endianness::default())
    }

    /// Wraps a bound socket with an explicit byte order.
    #[must_use]
    pub fn with_endianness(socket: UdpSocket, endianness: Endianness) -> Self {
        Self {
            socket: Arc::new(socket),
            endianness,
            inbound: None,
            recv_buffer: vec![0; RECV_BUFFER_SIZE],
            send_buffer: Vec::with_capacity(SEND_BUFFER_SIZE),
        }
    }

    /// Binds to the given port on all interfaces (0.0.0.0). Port 0 lets the OS choose.
    ///
    /// # Errors
    ///
    /// Returns an error if the socket cannot be bound (e.g., port already in use).
    pub async fn bind_to_port(port: u16) -> Result<Self, std::io::Error> {
        let addr = SocketAddr::new(std::net::IpAddr::V4(std::net::Ipv4Addr::UNSPECIFIED), port);
        let socket = UdpSocket::bind(addr).await?;
        Ok(Self::new(socket))
    }

    /// Returns the local address that this socket is bound to.
    ///
    /// # Errors
    ///
    /// Returns an error if the local address cannot be determined.
    pub fn local_addr(&self) -> Result<SocketAddr, std::io::Error> {
        self.socket.local_addr()
    }

    /// The shared socket, for [`spawn_outbound_pump`](crate::network::pump::spawn_outbound_pump).
    #[must_use]
    pub fn socket(&self) -> Arc<UdpSocket> {
        Arc::clone(&self.socket)
    }

    /// The byte order used on the wire.
    #[must_use]
    pub fn endianness(&self) -> Endianness {
        self.endianness
    }

    /// Whether a receive loop has taken over receiving.
    #[must_use]
    pub fn has_receive_loop(&self) -> bool {
        self.inbound.is_some()
    }

    /// Starts a task that receives and decodes datagrams until `cancel` fires.
    ///
    /// From then on [`receive_all_messages`](NonBlockingSocket::receive_all_messages)
    /// drains what the task forwarded instead of reading the socket.
    pub fn spawn_receive_loop(&mut self, cancel: CancellationToken) -> JoinHandle<()> {
        let (tx, rx) = mpsc::channel(INBOUND_CHANNEL_CAPACITY);
        self.inbound = Some(rx);
        let socket = Arc::clone(&self.socket);
        let endianness = self.endianness;
        tokio::spawn(async move {
            let mut buffer = vec![0u8; RECV_BUFFER_SIZE];
            loop {
                let received = tokio::select! {
                    () = cancel.cancelled() => break,
                    received = socket.recv_from(&mut buffer) => received,
                };
                match received {
                    Ok((len, from)) => {
                        let Some(msg) = buffer
                            .get(..len)
                            .and_then(|datagram| decode_datagram(datagram, from, endianness))
                        else {
                            continue;
                        };
                        if tx.send((from, msg)).await.is_err() {
                            // the session dropped its socket
                            break;
                        }
                    },
                    Err(ref err) if err.kind() == ErrorKind::ConnectionReset => continue,
                    Err(err) => {
                        report_violation!(
                            ViolationSeverity::Error,
                            ViolationKind::NetworkProtocol,
                            "receive loop stopping after socket error: {:?}: {}",
                            err.kind(),
                            err
                        );
                        break;
                    },
                }
            }
            tracing::debug!("receive loop stopped");
        })
    }

    /// Waits until the socket is readable, then receives all available messages.
    pub async fn recv_all(&mut self) -> Vec<(SocketAddr, Message)> {
        if self.inbound.is_none() && self.socket.readable().await.is_err() {
            return Vec::new();
        }
        self.receive_all_messages()
    }

    /// Waits until the socket is writable.
    ///
    /// # Errors
    ///
    /// The socket's readiness error.
    pub async fn wait_writable(&self) -> Result<(), std::io::Error> {
        self.socket.writable().await
    }

    fn send_encoded(&self, addr: &SocketAddr) {
        warn_if_oversized(self.send_buffer.len(), addr);
        match self.socket.try_send_to(&self.send_buffer, *addr) {
            Ok(_) => {},
            // the kernel buffer is full; the protocol resends what matters
            Err(err) if err.kind() == ErrorKind::WouldBlock => {
                tracing::debug!(%addr, "socket not writable, datagram dropped");
            },
            Err(err) => tracing::debug!(%addr, error = %err, "try_send_to failed"),
        }
    }
}

impl NonBlockingSocket<SocketAddr> for TokioUdpSocket {
    fn send_to(&mut self, msg: &Message, addr: &SocketAddr) {
        self.send_buffer.clear();
        match wire::encode_into(msg, self.endianness, &mut self.send_buffer) {
            Ok(_) => self.send_encoded(addr),
            Err(err) => report_violation!(
                ViolationSeverity::Error,
                ViolationKind::NetworkProtocol,
                "could not encode {:?} for {}: {}",
                msg.message_type(),
                addr,
                err
            ),
        }
    }

    fn receive_all_messages(&mut self) -> Vec<(SocketAddr, Message)> {
        let mut received_messages = Vec::with_capacity(4);
        if let Some(inbound) = self.inbound.as_mut() {
            while let Ok(item) = inbound.try_recv() {
                received_messages.push(item);
            }
            return received_messages;
        }

        loop {
            match self.socket.try_recv_from(&mut self.recv_buffer) {
                Ok((number_of_bytes, src_addr)) => {
                    if let Some(msg) = self
                        .recv_buffer
                        .get(..number_of_bytes)
                        .and_then(|datagram| decode_datagram(datagram, src_addr, self.endianness))
                    {
                        received_messages.push((src_addr, msg));
                    }
                },
                Err(ref err) if err.kind() == ErrorKind::WouldBlock => return received_messages,
                Err(ref err) if err.kind() == ErrorKind::ConnectionReset => continue,
                Err(err) => {
                    report_violation!(
                        ViolationSeverity::Error,
                        ViolationKind::NetworkProtocol,
                        "try_recv_from failed: {:?}: {}",
                        err.kind(),
                        err
                    );
                    return received_messages;
                },
            }
        }
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
    use crate::network::messages::{MessageBody, MessageHeader};

    fn loopback(socket: &TokioUdpSocket) -> SocketAddr {
        let port = socket.local_addr().unwrap().port();
        SocketAddr::new(std::net::IpAddr::V4(std::net::Ipv4Addr::LOCALHOST), port)
    }

    fn keep_alive(magic: u16) -> Message {
        Message {
            header: MessageHeader { magic, sequence: 1 },
            body: MessageBody::KeepAlive,
        }
    }

    async fn receive(socket: &mut TokioUdpSocket, expected: usize) -> Vec<(SocketAddr, Message)> {
        let mut all = Vec::new();
        for _ in 0..40 {
            all.extend(socket.receive_all_messages());
            if all.len() >= expected {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(25)).await;
        }
        all
    }

    #[tokio::test]
    async fn polled_send_and_receive() {
        let mut sender = TokioUdpSocket::bind_to_port(0).await.unwrap();
        let mut receiver = TokioUdpSocket::bind_to_port(0).await.unwrap();
        let target = loopback(&receiver);

        sender.wait_writable().await.unwrap();
        sender.send_to(&keep_alive(0xAAAA), &target);

        let received = receive(&mut receiver, 1).await;
        assert_eq!(received.len(), 1);
        assert_eq!(received[0].1, keep_alive(0xAAAA));
    }

    #[tokio::test]
    async fn receive_loop_forwards_over_the_channel() {
        let mut sender = TokioUdpSocket::bind_to_port(0).await.unwrap();
        let mut receiver = TokioUdpSocket::bind_to_port(0).await.unwrap();
        let target = loopback(&receiver);
        let cancel = CancellationToken::new();
        let task = receiver.spawn_receive_loop(cancel.clone());
        assert!(receiver.has_receive_loop());

        sender.wait_writable().await.unwrap();
        sender.send_to(&keep_alive(1), &target);
        sender.send_to(&keep_alive(2), &target);
        let received = receive(&mut receiver, 2).await;
        let magics: Vec<_> = received.iter().map(|(_, msg)| msg.header.magic).collect();
        assert_eq!(magics, vec![1, 2]);

        cancel.cancel();
        task.await.unwrap();
    }

    #[tokio::test]
    async fn garbage_is_dropped() {
        let raw = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let mut receiver = TokioUdpSocket::bind_to_port(0).await.unwrap();
        let target = loopback(&receiver);

        raw.send_to(&[0xEE, 1, 2], target).await.unwrap();
        raw.send_to(&[0x01], target).await.unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        assert!(receiver.receive_all_messages().is_empty());
    }

    #[tokio::test]
    async fn shared_socket_is_the_same() {
        let socket = TokioUdpSocket::bind_to_port(0).await.unwrap();
        let shared = socket.socket();
        assert_eq!(shared.local_addr().unwrap(), socket.local_addr().unwrap());
        assert_eq!(socket.endianness(), Endianness::Little);
    }
}
