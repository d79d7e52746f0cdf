//! Per-peer protocol engine.
//!
//! A [`PeerConnection`] owns everything about one remote endpoint: the
//! handshake, the unacknowledged local inputs, the last input received, the
//! remote's connect-status table, the timers and the outbound queue. It never
//! touches a socket directly; the owner feeds it received messages and flushes
//! its [`OutboundPump`] (or detaches the pump into a task).
//!
//! Time is passed in explicitly. Every timer is a threshold checked in
//! [`PeerConnection::poll`], so there are no callbacks and no reentrancy.

mod event;
mod inbound;
mod input_buffer;
mod input_bytes;
mod state;
mod sync;

pub use event::ProtocolEvent;
pub use input_buffer::{FlushOutcome, LocalInputBuffer, PendingRun};
pub use input_bytes::InputBytes;
pub use state::{PeerStatus, ProtocolState};

use std::collections::vec_deque::Drain;
use std::collections::VecDeque;
use std::sync::Arc;

use tracing::{debug, trace};
use web_time::{Duration, Instant};

use crate::error::SendInputError;
use crate::network::cancel::CancellationToken;
use crate::network::compression::{max_frame_bits, MAX_INPUT_BYTES};
use crate::network::messages::{
    ConnectStatus, ConsistencyCheckRequest, Input, InputAck, Message, MessageBody, QualityReport,
};
use crate::network::network_stats::{bandwidth, NetworkStats, PeerStatsCounters};
use crate::network::outbox::Outbox;
use crate::network::pump::OutboundPump;
use crate::network::wire::Endianness;
use crate::report_violation_to;
use crate::rng::Pcg32;
use crate::sessions::config::{
    check_range, ConsistencyConfig, ProtocolConfig, SessionConfig, SyncConfig,
};
use crate::telemetry::{ViolationKind, ViolationObserver, ViolationSeverity};
use crate::time_sync::TimeSync;
use crate::{BastionError, ChecksumStore, Config, Frame, NonBlockingSocket, PlayerHandle};

use sync::SyncState;

/// Frame rate used to turn round-trip time into frames.
const FRAME_RATE: u64 = 60;

fn elapsed(since: Instant, now: Instant) -> Duration {
    now.saturating_duration_since(since)
}

/// Outstanding consistency audit and its bookkeeping.
#[derive(Debug, Clone, Copy, Default)]
struct ConsistencyState {
    asked: Option<(Frame, u128)>,
    last_check_at: Option<Instant>,
}

/// One remote endpoint: a player host or a spectator.
///
/// # Note
///
/// This type is re-exported in [`__internal`](crate::__internal) for testing.
/// It is not part of the stable public API.
pub struct PeerConnection<T>
where
    T: Config,
{
    peer_addr: T::Address,
    /// Queues whose inputs arrive over this connection, ascending.
    handles: Vec<PlayerHandle>,
    state: ProtocolState,
    events: VecDeque<ProtocolEvent<T>>,

    sync_config: SyncConfig,
    protocol_config: ProtocolConfig,
    consistency_config: ConsistencyConfig,
    endianness: Endianness,
    observer: Option<Arc<dyn ViolationObserver>>,

    // handshake
    sync: SyncState,
    rng: Pcg32,
    magic: u16,
    remote_magic: u16,
    next_recv_seq: u16,

    // outbound
    outbox: Arc<Outbox>,
    pump: Option<OutboundPump>,
    counters: Arc<PeerStatsCounters>,
    cancel: CancellationToken,
    last_send_at: Option<Instant>,

    // inputs
    input_size: usize,
    local_inputs: LocalInputBuffer,
    last_received_input: InputBytes,
    peer_connect_status: Vec<ConnectStatus>,

    // fairness
    time_sync: TimeSync,
    local_frame_advantage: i32,
    remote_frame_advantage: i32,

    // timers
    origin: Instant,
    stats_start: Instant,
    last_recv_at: Instant,
    last_input_recv_at: Instant,
    last_quality_report_at: Instant,
    last_stats_at: Instant,
    shutdown_at: Option<Instant>,
    disconnect_notify_sent: bool,
    disconnect_event_sent: bool,

    // stats
    round_trip_time: Option<Duration>,
    packets_received: u64,
    bytes_received: u64,
    stats: NetworkStats,
    consistency: ConsistencyState,
}

impl<T: Config> std::fmt::Debug for PeerConnection<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PeerConnection")
            .field("peer_addr", &self.peer_addr)
            .field("handles", &self.handles)
            .field("state", &self.state)
            .field("magic", &self.magic)
            .field("remote_magic", &self.remote_magic)
            .field("last_received_frame", &self.last_received_input.frame)
            .field("last_acked_frame", &self.local_inputs.last_acked_frame())
            .field("pending", &self.local_inputs.len())
            .finish_non_exhaustive()
    }
}

impl<T: Config> PeerConnection<T> {
    /// Creates a connection in [`ProtocolState::Initializing`].
    ///
    /// `handles` are the queues this peer sends inputs for (empty for a
    /// spectator). `input_size` is the serialized size of one player's input
    /// and `send_frame_size` the size of one outgoing frame, which covers
    /// every queue we forward to this peer.
    ///
    /// # Errors
    ///
    /// [`BastionError::InputSizeOutOfRange`] if either frame exceeds what the
    /// delta codec can address, [`BastionError::ConfigValueOutOfRange`] if
    /// `max_input_bits` can't hold two worst-case outgoing frames.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        peer_addr: T::Address,
        mut handles: Vec<PlayerHandle>,
        num_players: usize,
        input_size: usize,
        send_frame_size: usize,
        config: &SessionConfig,
        rng_seed: Option<u64>,
        observer: Option<Arc<dyn ViolationObserver>>,
        now: Instant,
    ) -> Result<Self, BastionError> {
        handles.sort_unstable();
        handles.dedup();
        let recv_frame_size = input_size * handles.len();
        for size in [recv_frame_size, send_frame_size] {
            if size > MAX_INPUT_BYTES {
                return Err(BastionError::InputSizeOutOfRange {
                    size,
                    max: MAX_INPUT_BYTES,
                });
            }
        }
        // the acknowledged frame is resent ahead of the newest one
        check_range(
            "max_input_bits",
            config.protocol.max_input_bits as u64,
            2 * max_frame_bits(send_frame_size) as u64,
            65_535,
        )?;

        let mut rng = Pcg32::from_optional_seed(rng_seed);
        let magic = rng.next_nonzero_u16();
        let outbox = Arc::new(Outbox::new(config.protocol.outbox_capacity));
        let counters = Arc::new(PeerStatsCounters::default());
        let pump = OutboundPump::new(outbox.clone(), counters.clone(), magic, config.delay);

        Ok(Self {
            peer_addr,
            handles,
            state: ProtocolState::Initializing,
            events: VecDeque::new(),

            sync_config: config.sync,
            protocol_config: config.protocol,
            consistency_config: config.consistency,
            endianness: config.protocol.endianness,
            observer,

            sync: SyncState::new(config.sync.num_sync_roundtrips),
            rng,
            magic,
            remote_magic: 0,
            next_recv_seq: 0,

            outbox,
            pump: Some(pump),
            counters,
            cancel: CancellationToken::new(),
            last_send_at: None,

            input_size,
            local_inputs: LocalInputBuffer::new(
                send_frame_size,
                config.protocol.pending_output_limit,
            ),
            last_received_input: InputBytes::zeroed(recv_frame_size),
            peer_connect_status: vec![ConnectStatus::default(); num_players],

            time_sync: TimeSync::with_config(config.time_sync),
            local_frame_advantage: 0,
            remote_frame_advantage: 0,

            origin: now,
            stats_start: now,
            last_recv_at: now,
            last_input_recv_at: now,
            last_quality_report_at: now,
            last_stats_at: now,
            shutdown_at: None,
            disconnect_notify_sent: false,
            disconnect_event_sent: false,

            round_trip_time: None,
            packets_received: 0,
            bytes_received: 0,
            stats: NetworkStats::default(),
            consistency: ConsistencyState::default(),
        })
    }

    // =========================================================================
    // Accessors
    // =========================================================================

    /// The remote address.
    #[must_use]
    pub fn peer_addr(&self) -> &T::Address {
        &self.peer_addr
    }

    /// Queues this peer sends inputs for.
    #[must_use]
    pub fn handles(&self) -> &[PlayerHandle] {
        &self.handles
    }

    /// Internal lifecycle state.
    #[must_use]
    pub fn state(&self) -> ProtocolState {
        self.state
    }

    /// Caller-facing status.
    #[must_use]
    pub fn status(&self) -> PeerStatus {
        self.state.status()
    }

    /// Whether inputs are flowing.
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.state == ProtocolState::Running
    }

    /// Whether the handshake completed at some point.
    #[must_use]
    pub fn is_synchronized(&self) -> bool {
        matches!(
            self.state,
            ProtocolState::Running | ProtocolState::Disconnected | ProtocolState::Shutdown
        )
    }

    /// Our magic number, stamped on everything we send.
    #[must_use]
    pub fn magic(&self) -> u16 {
        self.magic
    }

    /// The peer's magic number, zero until the handshake completes.
    #[must_use]
    pub fn remote_magic(&self) -> u16 {
        self.remote_magic
    }

    /// Frame of the newest input received from the peer.
    #[must_use]
    pub fn last_received_frame(&self) -> Frame {
        self.last_received_input.frame
    }

    /// The peer's newest acknowledgement of our inputs.
    #[must_use]
    pub fn last_acked_frame(&self) -> Frame {
        self.local_inputs.last_acked_frame()
    }

    /// Unacknowledged local inputs.
    #[must_use]
    pub fn pending_output_len(&self) -> usize {
        self.local_inputs.len()
    }

    /// Remaining handshake roundtrips.
    #[must_use]
    pub fn remaining_roundtrips(&self) -> u32 {
        self.sync.remaining
    }

    /// Latest measured round-trip time.
    #[must_use]
    pub fn round_trip_time(&self) -> Option<Duration> {
        self.round_trip_time
    }

    /// The peer's view of one queue's connect status.
    #[must_use]
    pub fn peer_connect_status(&self, handle: PlayerHandle) -> ConnectStatus {
        self.peer_connect_status
            .get(handle.as_usize())
            .copied()
            .unwrap_or_default()
    }

    /// The peer's whole connect-status table.
    #[must_use]
    pub fn peer_connect_statuses(&self) -> &[ConnectStatus] {
        &self.peer_connect_status
    }

    /// Token cancelled when the connection shuts down.
    #[must_use]
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Averaged frame advantage over the fairness window.
    #[must_use]
    pub fn average_frame_advantage(&self) -> i32 {
        self.time_sync.average_frame_advantage()
    }

    /// Frames the local side should idle so the peer can catch up.
    #[must_use]
    pub fn recommend_frame_delay(&self) -> u32 {
        self.time_sync.recommend_frame_delay()
    }

    /// Network stats for this peer.
    ///
    /// Packet and byte counts and the send queue are live. Bandwidth, ping
    /// and frame advantage come from the last periodic snapshot.
    ///
    /// # Errors
    ///
    /// [`BastionError::NotSynchronized`] before the handshake completes.
    pub fn network_stats(&self) -> Result<NetworkStats, BastionError> {
        if !self.is_synchronized() {
            return Err(BastionError::NotSynchronized);
        }
        Ok(NetworkStats {
            send_queue_len: self.local_inputs.len(),
            packets_sent: self.counters.packets_sent(),
            bytes_sent: self.counters.bytes_sent(),
            packets_received: self.packets_received,
            bytes_received: self.bytes_received,
            ..self.stats
        })
    }

    /// Removes and returns the queued events.
    pub fn drain_events(&mut self) -> Drain<'_, ProtocolEvent<T>> {
        self.events.drain(..)
    }

    fn clock_millis(&self, now: Instant) -> u64 {
        elapsed(self.origin, now).as_millis() as u64
    }

    // =========================================================================
    // Lifecycle
    // =========================================================================

    /// Starts the handshake.
    ///
    /// # Errors
    ///
    /// [`BastionError::InvalidRequest`] unless the connection is `Initializing`.
    pub fn synchronize(&mut self, now: Instant) -> Result<(), BastionError> {
        if self.state != ProtocolState::Initializing {
            return Err(BastionError::InvalidRequest {
                info: format!(
                    "synchronize() needs an Initializing connection, this one is {}",
                    self.state.as_str()
                ),
            });
        }
        self.state = ProtocolState::Syncing;
        self.sync = SyncState::new(self.sync_config.num_sync_roundtrips);
        self.stats_start = now;
        debug!(peer = ?self.peer_addr, magic = self.magic, "synchronizing");
        self.send_sync_request(now);
        Ok(())
    }

    /// Marks the connection disconnected and schedules its shutdown.
    ///
    /// Queued messages still go out until the shutdown deadline. Calling it
    /// again after the deadline shuts down immediately.
    pub fn disconnect(&mut self, now: Instant) {
        match self.state {
            ProtocolState::Shutdown => {},
            ProtocolState::Disconnected => {
                if self.shutdown_at.map_or(true, |deadline| now >= deadline) {
                    self.shut_down();
                }
            },
            _ => {
                debug!(peer = ?self.peer_addr, "disconnecting");
                self.state = ProtocolState::Disconnected;
                self.shutdown_at = Some(now + self.protocol_config.shutdown_delay);
            },
        }
    }

    fn shut_down(&mut self) {
        debug!(peer = ?self.peer_addr, "shutting down connection");
        self.state = ProtocolState::Shutdown;
        self.shutdown_at = None;
        self.cancel.cancel();
    }

    fn push_event(&mut self, event: ProtocolEvent<T>) {
        trace!(peer = ?self.peer_addr, ?event, "protocol event");
        self.events.push_back(event);
    }

    fn emit_disconnected(&mut self) {
        if !self.disconnect_event_sent {
            self.disconnect_event_sent = true;
            self.push_event(ProtocolEvent::Disconnected);
        }
    }

    // =========================================================================
    // Timers
    // =========================================================================

    /// Estimates how far ahead of the peer the local simulation is.
    pub fn update_local_frame_advantage(&mut self, local_frame: Frame) {
        let remote_frame = self.last_received_input.frame;
        if local_frame.is_null() || remote_frame.is_null() {
            return;
        }
        // half the round trip, in frames
        let one_way_ms = self.round_trip_time.map_or(0, |rtt| rtt.as_millis() as u64 / 2);
        let lead = i32::try_from(one_way_ms * FRAME_RATE / 1000).unwrap_or(i32::MAX);
        let estimated_remote = remote_frame.as_i32().saturating_add(lead);
        self.local_frame_advantage = estimated_remote.saturating_sub(local_frame.as_i32());
    }

    /// Runs every timer due at `now`.
    ///
    /// `local_status` is the session's connect-status table, copied into any
    /// input message this poll sends. `checksums` backs consistency audits.
    pub fn poll(&mut self, now: Instant, local_status: &[ConnectStatus], checksums: &dyn ChecksumStore) {
        match self.state {
            ProtocolState::Syncing => self.poll_sync(now),
            ProtocolState::Running => self.poll_running(now, local_status, checksums),
            ProtocolState::Disconnected => {
                if self.shutdown_at.map_or(true, |deadline| now >= deadline) {
                    self.shut_down();
                }
            },
            ProtocolState::Initializing | ProtocolState::Shutdown => {},
        }
    }

    fn poll_running(
        &mut self,
        now: Instant,
        local_status: &[ConnectStatus],
        checksums: &dyn ChecksumStore,
    ) {
        // a lost first packet must not stall the peer forever
        if elapsed(self.last_input_recv_at, now) > self.sync_config.running_retry_interval {
            let _ = self.send_pending_output(local_status, now);
            self.last_input_recv_at = now;
        }

        if elapsed(self.last_quality_report_at, now) > self.protocol_config.quality_report_interval {
            self.send_quality_report(now);
        }

        if elapsed(self.last_stats_at, now) > self.protocol_config.network_stats_interval {
            self.update_network_stats(now);
        }

        let idle = self
            .last_send_at
            .map_or(true, |sent| elapsed(sent, now) > self.sync_config.keepalive_interval);
        if idle {
            self.queue_message(MessageBody::KeepAlive, now);
        }

        self.poll_consistency(now, checksums);

        let silence = elapsed(self.last_recv_at, now);
        if !self.disconnect_notify_sent && silence > self.protocol_config.disconnect_notify_start {
            self.disconnect_notify_sent = true;
            let disconnect_timeout = self
                .protocol_config
                .disconnect_timeout
                .saturating_sub(self.protocol_config.disconnect_notify_start);
            debug!(peer = ?self.peer_addr, ?silence, "network interrupted");
            self.push_event(ProtocolEvent::NetworkInterrupted { disconnect_timeout });
        }
        if silence > self.protocol_config.disconnect_timeout && !self.disconnect_event_sent {
            tracing::info!(peer = ?self.peer_addr, ?silence, "peer timed out");
            self.emit_disconnected();
        }
    }

    fn poll_consistency(&mut self, now: Instant, checksums: &dyn ChecksumStore) {
        let config = self.consistency_config;
        if !config.enabled {
            return;
        }
        if config.require_ping_baseline && self.round_trip_time.is_none() {
            return;
        }
        let due = self
            .consistency
            .last_check_at
            .map_or(true, |checked| elapsed(checked, now) > config.interval);
        if !due {
            return;
        }
        let offset = i32::try_from(config.frame_offset).unwrap_or(i32::MAX);
        let frame = self.last_received_input.frame - offset;
        if !frame.is_valid() {
            return;
        }
        let Some(checksum) = checksums.checksum(frame) else {
            trace!(%frame, "no local checksum to audit yet");
            return;
        };
        self.consistency.asked = Some((frame, checksum));
        self.consistency.last_check_at = Some(now);
        self.queue_message(
            MessageBody::ConsistencyCheckRequest(ConsistencyCheckRequest { frame }),
            now,
        );
    }

    fn update_network_stats(&mut self, now: Instant) {
        self.last_stats_at = now;
        let packets_sent = self.counters.packets_sent();
        let bytes_sent = self.counters.bytes_sent();
        let (kbps_sent, udp_overhead_percent) =
            bandwidth(bytes_sent, packets_sent, elapsed(self.stats_start, now));
        self.stats = NetworkStats {
            send_queue_len: self.local_inputs.len(),
            ping: self.round_trip_time.map_or(0, |rtt| rtt.as_millis() as u64),
            kbps_sent,
            udp_overhead_percent,
            packets_sent,
            bytes_sent,
            packets_received: self.packets_received,
            bytes_received: self.bytes_received,
            local_frames_behind: self.local_frame_advantage,
            remote_frames_behind: self.remote_frame_advantage,
            ..self.stats
        };
    }

    // =========================================================================
    // Sending
    // =========================================================================

    /// Checks whether [`send_input`](Self::send_input) would accept `frame`.
    ///
    /// # Errors
    ///
    /// The error `send_input` would return.
    pub fn check_input(&self, frame: Frame) -> Result<(), SendInputError> {
        if self.state != ProtocolState::Running {
            return Err(SendInputError::NotRunning);
        }
        self.local_inputs.check(frame)
    }

    /// Queues a local input frame and flushes the pending run.
    ///
    /// # Errors
    ///
    /// See [`SendInputError`]. Nothing is queued on error.
    pub fn send_input(
        &mut self,
        input: InputBytes,
        local_status: &[ConnectStatus],
        now: Instant,
    ) -> Result<FlushOutcome, SendInputError> {
        if self.state != ProtocolState::Running {
            return Err(SendInputError::NotRunning);
        }
        let frame = input.frame;
        self.local_inputs.push(input)?;
        self.time_sync
            .advance_frame(frame, self.local_frame_advantage, self.remote_frame_advantage);
        Ok(self.send_pending_output(local_status, now))
    }

    /// Encodes every unacknowledged input into one message.
    pub fn send_pending_output(&mut self, local_status: &[ConnectStatus], now: Instant) -> FlushOutcome {
        let pending = match self.local_inputs.fill(self.protocol_config.max_input_bits) {
            Ok(Some(pending)) => pending,
            Ok(None) => return FlushOutcome::Idle,
            Err(err) => {
                report_violation_to!(
                    self.observer,
                    ViolationSeverity::Error,
                    ViolationKind::InputCodec,
                    "failed to encode pending inputs for {:?}: {}",
                    self.peer_addr,
                    err
                );
                return FlushOutcome::Idle;
            },
        };

        let sent = pending.run.frames;
        if sent > 0 {
            let body = Input {
                start_frame: pending.start_frame,
                input_size: self.local_inputs.frame_size() as u16,
                num_bits: u16::try_from(pending.run.num_bits).unwrap_or(u16::MAX),
                ack_frame: self.last_received_input.frame,
                disconnect_requested: self.state == ProtocolState::Disconnected,
                peer_connect_status: local_status.iter().copied().collect(),
                bits: pending.run.bits,
            };
            trace!(
                start_frame = %body.start_frame,
                frames = sent,
                num_bits = body.num_bits,
                "queued input run"
            );
            self.queue_message(MessageBody::Input(body), now);
        }

        if pending.deferred == 0 {
            FlushOutcome::Sent { frames: sent }
        } else {
            debug!(
                peer = ?self.peer_addr,
                sent,
                deferred = pending.deferred,
                "input run exceeds the message budget"
            );
            FlushOutcome::MessageBodyOverflow {
                sent,
                deferred: pending.deferred,
            }
        }
    }

    /// Acknowledges every input received so far.
    pub fn send_input_ack(&mut self, now: Instant) {
        let body = InputAck {
            ack_frame: self.last_received_input.frame,
        };
        self.queue_message(MessageBody::InputAck(body), now);
    }

    fn send_quality_report(&mut self, now: Instant) {
        self.last_quality_report_at = now;
        let frame_advantage = self
            .local_frame_advantage
            .clamp(i32::from(i16::MIN), i32::from(i16::MAX)) as i16;
        let body = QualityReport {
            ping: self.clock_millis(now),
            frame_advantage,
        };
        self.queue_message(MessageBody::QualityReport(body), now);
    }

    fn queue_message(&mut self, body: MessageBody, now: Instant) {
        if self.state == ProtocolState::Shutdown {
            return;
        }
        self.outbox.push(Message::unstamped(body), now);
        self.last_send_at = Some(now);
    }

    /// Sends whatever the pump has ready. Does nothing once the pump is detached.
    ///
    /// After shutdown the queue is discarded instead.
    pub fn flush_outbound<S>(&mut self, socket: &mut S, now: Instant) -> usize
    where
        S: NonBlockingSocket<T::Address> + ?Sized,
    {
        if self.state == ProtocolState::Shutdown {
            let mut dropped = 0;
            while self.outbox.pop().is_some() {
                dropped += 1;
            }
            if dropped > 0 {
                trace!(dropped, "connection shut down, dropping queued messages");
            }
            return 0;
        }
        match self.pump.as_mut() {
            Some(pump) => pump.flush(socket, &self.peer_addr, now),
            None => 0,
        }
    }

    /// Hands the pump over to a background task.
    ///
    /// Returns `None` if it was already taken.
    pub fn take_pump(&mut self) -> Option<OutboundPump> {
        self.pump.take()
    }
}

#[cfg(test)]
#[allow(
    clippy::panic,
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::indexing_slicing
)]
mod tests;
