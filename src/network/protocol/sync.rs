//! Handshake: `SyncRequest` / `SyncReply` roundtrips.
//!
//! Every roundtrip carries a random nonce the peer must echo. Retries resend
//! the same nonce, so a late reply to an earlier attempt still counts. Once
//! the required number of roundtrips completes the connection is running and
//! adopts the peer's magic number.

use tracing::{debug, info, trace};
use web_time::{Duration, Instant};

use super::event::ProtocolEvent;
use super::state::ProtocolState;
use super::{elapsed, PeerConnection};
use crate::network::messages::{MessageBody, MessageHeader, SyncReply, SyncRequest};
use crate::report_violation_to;
use crate::telemetry::{ViolationKind, ViolationSeverity};
use crate::Config;

/// Handshake progress.
#[derive(Debug, Clone, Copy)]
pub(super) struct SyncState {
    /// Nonce of the outstanding request.
    pub(super) random: u32,
    /// Roundtrips still required.
    pub(super) remaining: u32,
    /// Roundtrips required in total.
    pub(super) total: u32,
    /// Sum of the measured round-trip times.
    pub(super) total_rtt: Duration,
    /// Requests resent without a reply.
    pub(super) retries: u32,
    pub(super) last_request_at: Option<Instant>,
    /// Whether `Connected` was emitted.
    pub(super) connected: bool,
}

impl SyncState {
    pub(super) fn new(roundtrips: u32) -> Self {
        let total = roundtrips.max(1);
        Self {
            random: 0,
            remaining: total,
            total,
            total_rtt: Duration::ZERO,
            retries: 0,
            last_request_at: None,
            connected: false,
        }
    }

    fn completed(&self) -> u32 {
        self.total - self.remaining
    }
}

impl<T: Config> PeerConnection<T> {
    /// Draws a fresh nonce and sends a request with it.
    pub(super) fn send_sync_request(&mut self, now: Instant) {
        self.sync.random = self.rng.next_u32();
        self.resend_sync_request(now);
    }

    fn resend_sync_request(&mut self, now: Instant) {
        self.sync.last_request_at = Some(now);
        let body = SyncRequest {
            random_request: self.sync.random,
            ping: self.clock_millis(now),
        };
        trace!(peer = ?self.peer_addr, nonce = body.random_request, "sync request");
        self.queue_message(MessageBody::SyncRequest(body), now);
    }

    /// Resends the outstanding request once its retry interval elapses.
    pub(super) fn poll_sync(&mut self, now: Instant) {
        let interval = if self.sync.remaining == self.sync.total {
            self.sync_config.sync_first_retry_interval
        } else {
            self.sync_config.sync_retry_interval
        };
        let due = self
            .sync
            .last_request_at
            .map_or(true, |sent| elapsed(sent, now) > interval);
        if !due {
            return;
        }

        if let Some(max) = self.sync_config.max_sync_retries {
            if self.sync.retries >= max {
                report_violation_to!(
                    self.observer,
                    ViolationSeverity::Warning,
                    ViolationKind::Synchronization,
                    "handshake with {:?} abandoned after {} retries",
                    self.peer_addr,
                    self.sync.retries
                );
                self.push_event(ProtocolEvent::SyncFailure);
                self.state = ProtocolState::Disconnected;
                self.shutdown_at = Some(now + self.protocol_config.shutdown_delay);
                return;
            }
        }
        self.sync.retries += 1;
        debug!(
            peer = ?self.peer_addr,
            retry = self.sync.retries,
            completed = self.sync.completed(),
            "resending sync request"
        );
        self.resend_sync_request(now);
    }

    /// Answers a handshake request.
    ///
    /// Accepted in any state but `Shutdown`, so a peer that lost our last
    /// reply can still finish. Once the peer's magic is known, requests
    /// carrying another one are refused.
    pub(super) fn on_sync_request(
        &mut self,
        header: MessageHeader,
        body: SyncRequest,
        now: Instant,
    ) -> bool {
        if self.remote_magic != 0 && header.magic != self.remote_magic {
            trace!(
                peer = ?self.peer_addr,
                magic = header.magic,
                expected = self.remote_magic,
                "sync request from a different session"
            );
            return false;
        }
        let reply = SyncReply {
            random_reply: body.random_request,
            pong: body.ping,
        };
        self.queue_message(MessageBody::SyncReply(reply), now);
        true
    }

    /// Completes one handshake roundtrip.
    pub(super) fn on_sync_reply(
        &mut self,
        header: MessageHeader,
        body: SyncReply,
        now: Instant,
    ) -> bool {
        if self.state != ProtocolState::Syncing {
            // a duplicate reply after we finished
            return header.magic == self.remote_magic;
        }
        if body.random_reply != self.sync.random {
            trace!(
                peer = ?self.peer_addr,
                nonce = body.random_reply,
                expected = self.sync.random,
                "sync reply with stale nonce"
            );
            return false;
        }

        if !self.sync.connected {
            self.sync.connected = true;
            self.push_event(ProtocolEvent::Connected);
        }

        let rtt = Duration::from_millis(self.clock_millis(now).saturating_sub(body.pong));
        self.sync.total_rtt += rtt;
        self.sync.remaining = self.sync.remaining.saturating_sub(1);
        self.sync.retries = 0;

        if self.sync.remaining == 0 {
            let ping = self.sync.total_rtt / self.sync.total;
            info!(
                peer = ?self.peer_addr,
                ?ping,
                remote_magic = header.magic,
                "synchronized"
            );
            self.state = ProtocolState::Running;
            self.remote_magic = header.magic;
            self.last_recv_at = now;
            self.last_input_recv_at = now;
            self.last_quality_report_at = now;
            self.last_stats_at = now;
            self.push_event(ProtocolEvent::Synchronized { ping });
        } else {
            self.push_event(ProtocolEvent::Synchronizing {
                total: self.sync.total,
                count: self.sync.completed(),
            });
            self.send_sync_request(now);
        }
        true
    }
}
