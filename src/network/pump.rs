//! Outbound pump: the only place where magic and sequence numbers are stamped.
//!
//! A connection pushes unstamped messages into its [`Outbox`]. The pump drains
//! the outbox in order, waits out any configured artificial delay, stamps the
//! header and hands the datagram to the socket. It runs either synchronously
//! ([`OutboundPump::flush`], once per session tick) or as a tokio task
//! ([`spawn_outbound_pump`]).

use std::sync::Arc;

use parking_lot::Mutex;
use web_time::{Duration, Instant};

use crate::network::messages::{Message, MessageHeader};
use crate::network::network_stats::PeerStatsCounters;
use crate::network::outbox::{Outbox, QueueEntry};
use crate::network::wire;
use crate::rng::Pcg32;
use crate::sessions::config::{DelayConfig, DelayStrategy};
use crate::{BastionError, NonBlockingSocket};

/// Draws per-message delays from a [`DelayConfig`].
#[derive(Debug, Clone)]
pub struct DelaySampler {
    config: DelayConfig,
    rng: Pcg32,
}

impl DelaySampler {
    /// Creates a sampler, seeded from the config or from entropy.
    #[must_use]
    pub fn new(config: DelayConfig) -> Self {
        Self {
            config,
            rng: Pcg32::from_optional_seed(config.seed),
        }
    }

    /// Draws the next delay. Never negative.
    pub fn sample(&mut self) -> Duration {
        let base = self.config.base_latency.as_secs_f64();
        let secs = match self.config.strategy {
            DelayStrategy::None => return Duration::ZERO,
            DelayStrategy::Constant => base,
            DelayStrategy::Gaussian { std_dev } => {
                base + std_dev.as_secs_f64() * self.standard_normal()
            },
            DelayStrategy::ContinuousUniform { spread } => {
                let spread = spread.as_secs_f64();
                base - spread + 2.0 * spread * self.rng.next_f64()
            },
        };
        Duration::try_from_secs_f64(secs.max(0.0)).unwrap_or(Duration::ZERO)
    }

    // Box-Muller
    fn standard_normal(&mut self) -> f64 {
        let u1 = 1.0 - self.rng.next_f64();
        let u2 = self.rng.next_f64();
        (-2.0 * u1.ln()).sqrt() * (std::f64::consts::TAU * u2).cos()
    }
}

/// Errors raised by background tasks, collected for the session to surface.
#[derive(Debug, Clone, Default)]
pub struct TaskErrors {
    inner: Arc<Mutex<Vec<BastionError>>>,
}

impl TaskErrors {
    /// Creates an empty sink.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Records a failure.
    pub fn push(&self, error: BastionError) {
        tracing::error!(%error, "background task failed");
        self.inner.lock().push(error);
    }

    /// Removes and returns every recorded failure.
    #[must_use]
    pub fn take(&self) -> Vec<BastionError> {
        std::mem::take(&mut *self.inner.lock())
    }

    /// Whether no failure is recorded.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.inner.lock().is_empty()
    }
}

/// Drains one connection's outbox onto the wire.
#[derive(Debug)]
pub struct OutboundPump {
    outbox: Arc<Outbox>,
    counters: Arc<PeerStatsCounters>,
    magic: u16,
    next_sequence: u16,
    delay: DelaySampler,
    // head of the queue while its delay has not elapsed
    held: Option<(Instant, Message)>,
}

impl OutboundPump {
    /// Creates a pump stamping `magic` onto everything it sends.
    #[must_use]
    pub fn new(
        outbox: Arc<Outbox>,
        counters: Arc<PeerStatsCounters>,
        magic: u16,
        delay: DelayConfig,
    ) -> Self {
        Self {
            outbox,
            counters,
            magic,
            next_sequence: 0,
            delay: DelaySampler::new(delay),
            held: None,
        }
    }

    /// The magic number this pump stamps.
    #[must_use]
    pub fn magic(&self) -> u16 {
        self.magic
    }

    /// The sequence number the next message will carry.
    #[must_use]
    pub fn next_sequence(&self) -> u16 {
        self.next_sequence
    }

    fn stamp(&mut self, message: &mut Message) {
        message.header = MessageHeader {
            magic: self.magic,
            sequence: self.next_sequence,
        };
        self.next_sequence = self.next_sequence.wrapping_add(1);
    }

    fn schedule(&mut self, entry: QueueEntry) -> (Instant, Message) {
        let due = entry.queued_at + self.delay.sample();
        (due, entry.message)
    }

    /// Sends every queued message whose delay has elapsed at `now`.
    ///
    /// Messages leave in queue order; a message still waiting blocks the ones
    /// behind it. Returns the number of datagrams sent.
    pub fn flush<A, S>(&mut self, socket: &mut S, addr: &A, now: Instant) -> usize
    where
        S: NonBlockingSocket<A> + ?Sized,
        A: Clone + PartialEq + Eq + std::hash::Hash,
    {
        let mut sent = 0;
        loop {
            let (due, mut message) = match self.held.take() {
                Some(held) => held,
                None => match self.outbox.pop() {
                    Some(entry) => self.schedule(entry),
                    None => break,
                },
            };
            if due > now {
                self.held = Some((due, message));
                break;
            }
            self.stamp(&mut message);
            socket.send_to(&message, addr);
            self.counters.record_send(wire::encoded_len(&message));
            tracing::trace!(
                message_type = ?message.message_type(),
                sequence = message.header.sequence,
                "sent message"
            );
            sent += 1;
        }
        sent
    }

    /// Whether a message is waiting, queued or held back by delay.
    #[must_use]
    pub fn has_pending(&self) -> bool {
        self.held.is_some() || !self.outbox.is_empty()
    }
}

/// Runs `pump` as a tokio task sending to `addr` over `socket` until `cancel` fires.
///
/// Encoding or socket failures are recorded in `errors` and the task keeps
/// going; UDP send errors are usually transient.
#[cfg(feature = "tokio")]
pub fn spawn_outbound_pump(
    mut pump: OutboundPump,
    socket: Arc<tokio::net::UdpSocket>,
    addr: std::net::SocketAddr,
    endianness: wire::Endianness,
    cancel: crate::network::cancel::CancellationToken,
    errors: TaskErrors,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut buffer = Vec::with_capacity(1024);
        loop {
            let entry = tokio::select! {
                () = cancel.cancelled() => break,
                entry = pump.outbox.recv() => entry,
            };
            let (due, mut message) = pump.schedule(entry);
            let wait = due.saturating_duration_since(Instant::now());
            if !wait.is_zero() {
                tokio::select! {
                    () = cancel.cancelled() => break,
                    () = tokio::time::sleep(wait) => {},
                }
            }
            pump.stamp(&mut message);
            buffer.clear();
            if let Err(err) = wire::encode_into(&message, endianness, &mut buffer) {
                errors.push(BastionError::BackgroundTask {
                    peer: addr.to_string(),
                    context: format!("encoding {:?}: {}", message.message_type(), err),
                });
                continue;
            }
            match socket.send_to(&buffer, addr).await {
                Ok(_) => pump.counters.record_send(buffer.len()),
                Err(err) => errors.push(BastionError::BackgroundTask {
                    peer: addr.to_string(),
                    context: format!("send_to failed: {}", err),
                }),
            }
        }
        tracing::debug!(%addr, "outbound pump stopped");
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
    use crate::network::messages::MessageBody;

    #[derive(Default)]
    struct RecordingSocket {
        sent: Vec<(u8, Message)>,
    }

    impl NonBlockingSocket<u8> for RecordingSocket {
        fn send_to(&mut self, msg: &Message, addr: &u8) {
            self.sent.push((*addr, msg.clone()));
        }

        fn receive_all_messages(&mut self) -> Vec<(u8, Message)> {
            Vec::new()
        }
    }

    fn pump_with(delay: DelayConfig, capacity: usize) -> (Arc<Outbox>, OutboundPump) {
        let outbox = Arc::new(Outbox::new(capacity));
        let counters = Arc::new(PeerStatsCounters::default());
        let pump = OutboundPump::new(outbox.clone(), counters, 0xBEEF, delay);
        (outbox, pump)
    }

    #[test]
    fn stamps_magic_and_increasing_sequence() {
        let (outbox, mut pump) = pump_with(DelayConfig::default(), 8);
        let now = Instant::now();
        for _ in 0..3 {
            outbox.push(Message::unstamped(MessageBody::KeepAlive), now);
        }
        let mut socket = RecordingSocket::default();
        assert_eq!(pump.flush(&mut socket, &7, now), 3);

        let sequences: Vec<u16> = socket.sent.iter().map(|(_, m)| m.header.sequence).collect();
        assert_eq!(sequences, vec![0, 1, 2]);
        assert!(socket.sent.iter().all(|(addr, m)| *addr == 7 && m.header.magic == 0xBEEF));
        assert_eq!(pump.counters.packets_sent(), 3);
    }

    #[test]
    fn sequence_wraps() {
        let (outbox, mut pump) = pump_with(DelayConfig::default(), 8);
        pump.next_sequence = u16::MAX;
        let now = Instant::now();
        outbox.push(Message::unstamped(MessageBody::KeepAlive), now);
        outbox.push(Message::unstamped(MessageBody::KeepAlive), now);
        let mut socket = RecordingSocket::default();
        pump.flush(&mut socket, &1, now);
        assert_eq!(socket.sent[0].1.header.sequence, u16::MAX);
        assert_eq!(socket.sent[1].1.header.sequence, 0);
    }

    #[test]
    fn constant_delay_holds_messages_in_order() {
        let delay = DelayConfig::constant(Duration::from_millis(50));
        let (outbox, mut pump) = pump_with(delay, 8);
        let start = Instant::now();
        outbox.push(Message::unstamped(MessageBody::KeepAlive), start);
        outbox.push(
            Message::unstamped(MessageBody::KeepAlive),
            start + Duration::from_millis(10),
        );

        let mut socket = RecordingSocket::default();
        assert_eq!(pump.flush(&mut socket, &1, start), 0);
        assert!(pump.has_pending());
        assert_eq!(pump.flush(&mut socket, &1, start + Duration::from_millis(50)), 1);
        assert_eq!(pump.flush(&mut socket, &1, start + Duration::from_millis(60)), 1);
        assert!(!pump.has_pending());
        // sequence numbers are assigned at send time
        assert_eq!(socket.sent[1].1.header.sequence, 1);
    }

    #[test]
    fn sampler_is_reproducible_and_non_negative() {
        let config =
            DelayConfig::gaussian(Duration::from_millis(5), Duration::from_millis(20)).with_seed(9);
        let mut a = DelaySampler::new(config);
        let mut b = DelaySampler::new(config);
        for _ in 0..1000 {
            let sample = a.sample();
            assert_eq!(sample, b.sample());
        }
    }

    #[test]
    fn uniform_sampler_stays_in_range() {
        let config =
            DelayConfig::uniform(Duration::from_millis(40), Duration::from_millis(10)).with_seed(1);
        let mut sampler = DelaySampler::new(config);
        for _ in 0..1000 {
            let sample = sampler.sample();
            assert!(sample >= Duration::from_millis(30));
            assert!(sample <= Duration::from_millis(50));
        }
    }

    #[test]
    fn no_strategy_means_no_delay() {
        let config = DelayConfig {
            base_latency: Duration::from_secs(1),
            ..DelayConfig::default()
        };
        assert_eq!(DelaySampler::new(config).sample(), Duration::ZERO);
    }

    #[test]
    fn task_errors_take_drains() {
        let errors = TaskErrors::new();
        assert!(errors.is_empty());
        errors.push(BastionError::SocketError {
            context: "boom".to_owned(),
        });
        assert_eq!(errors.take().len(), 1);
        assert!(errors.is_empty());
    }
}
