//! Inbound message filtering and dispatch.

use tracing::{debug, trace, warn};
use web_time::{Duration, Instant};

use super::event::ProtocolEvent;
use super::input_bytes::InputBytes;
use super::state::ProtocolState;
use super::PeerConnection;
use crate::frame_info::PlayerInput;
use crate::network::compression::DeltaDecoder;
use crate::network::connect_status::merge_remote;
use crate::network::messages::{
    ConsistencyCheckReply, ConsistencyCheckRequest, Input, InputAck, Message, MessageBody,
    QualityReply, QualityReport,
};
use crate::network::wire::{self, UDP_HEADER_SIZE};
use crate::report_violation_to;
use crate::telemetry::{ViolationKind, ViolationSeverity};
use crate::{ChecksumStore, Config};

impl<T: Config> PeerConnection<T> {
    /// Processes one message received from this peer.
    ///
    /// Anything other than the handshake is dropped unless the connection is
    /// running, the message carries the peer's magic and its sequence number
    /// is within `max_sequence_distance` ahead of the last accepted one.
    /// Dropped and refused messages change nothing, not even the sequence
    /// window.
    pub fn handle_message(&mut self, msg: &Message, now: Instant, checksums: &dyn ChecksumStore) {
        if self.state == ProtocolState::Shutdown {
            trace!(peer = ?self.peer_addr, "connection shut down, ignoring message");
            return;
        }

        let message_type = msg.message_type();
        if !message_type.is_handshake() {
            if self.state != ProtocolState::Running {
                trace!(
                    peer = ?self.peer_addr,
                    ?message_type,
                    state = self.state.as_str(),
                    "dropping message, connection not running"
                );
                return;
            }
            if msg.header.magic != self.remote_magic {
                trace!(
                    peer = ?self.peer_addr,
                    magic = msg.header.magic,
                    expected = self.remote_magic,
                    "dropping message with foreign magic"
                );
                return;
            }
            let distance = msg.header.sequence.wrapping_sub(self.next_recv_seq);
            if distance > self.protocol_config.max_sequence_distance {
                trace!(
                    peer = ?self.peer_addr,
                    sequence = msg.header.sequence,
                    expected = self.next_recv_seq,
                    "dropping out-of-window message"
                );
                return;
            }
        }

        let handled = match &msg.body {
            MessageBody::SyncRequest(body) => self.on_sync_request(msg.header, *body, now),
            MessageBody::SyncReply(body) => self.on_sync_reply(msg.header, *body, now),
            MessageBody::Input(body) => self.on_input(body, now),
            MessageBody::InputAck(body) => self.on_input_ack(*body),
            MessageBody::QualityReport(body) => self.on_quality_report(*body, now),
            MessageBody::QualityReply(body) => self.on_quality_reply(*body, now),
            MessageBody::KeepAlive => true,
            MessageBody::ConsistencyCheckRequest(body) => {
                self.on_consistency_request(*body, now, checksums)
            },
            MessageBody::ConsistencyCheckReply(body) => self.on_consistency_reply(*body, now),
        };

        if handled {
            self.next_recv_seq = msg.header.sequence;
            self.packets_received += 1;
            self.bytes_received += (wire::encoded_len(msg) + UDP_HEADER_SIZE) as u64;
            self.last_recv_at = now;
            if self.disconnect_notify_sent && self.state == ProtocolState::Running {
                self.disconnect_notify_sent = false;
                debug!(peer = ?self.peer_addr, "network resumed");
                self.push_event(ProtocolEvent::NetworkResumed);
            }
        }
    }

    fn on_input(&mut self, body: &Input, now: Instant) -> bool {
        if body.num_bits > 0 && !body.start_frame.is_valid() {
            report_violation_to!(
                self.observer,
                ViolationSeverity::Warning,
                ViolationKind::InputCodec,
                "{:?} sent an input run starting at frame {}",
                self.peer_addr,
                body.start_frame
            );
            return false;
        }
        self.local_inputs.acknowledge(body.ack_frame);

        if body.disconnect_requested {
            if !self.disconnect_event_sent {
                debug!(peer = ?self.peer_addr, "peer requested disconnect");
            }
            self.emit_disconnected();
        } else {
            let regressions = merge_remote(&mut self.peer_connect_status, &body.peer_connect_status);
            for regression in &regressions {
                report_violation_to!(
                    self.observer,
                    ViolationSeverity::Error,
                    ViolationKind::ConnectStatus,
                    "{:?} reported queue {} at frame {}, already known at {}",
                    self.peer_addr,
                    regression.queue,
                    regression.received,
                    regression.known
                );
            }
            if !regressions.is_empty() && self.protocol_config.disconnect_on_status_regression {
                self.emit_disconnected();
                return true;
            }
        }

        if body.num_bits == 0 {
            return true;
        }
        let expected_size = self.last_received_input.bytes.len();
        if usize::from(body.input_size) != expected_size {
            report_violation_to!(
                self.observer,
                ViolationSeverity::Warning,
                ViolationKind::InputCodec,
                "{:?} sent {}-byte input frames, expected {}",
                self.peer_addr,
                body.input_size,
                expected_size
            );
            return true;
        }

        let received = self.decode_inputs(body, now);
        if received > 0 {
            self.send_input_ack(now);
        }
        true
    }

    /// Applies the new frames of an input run. Returns how many were new.
    ///
    /// `body.start_frame` is a valid frame, so the offsets below can't overflow.
    fn decode_inputs(&mut self, body: &Input, now: Instant) -> usize {
        let last = if self.last_received_input.frame.is_null() {
            body.start_frame - 1
        } else {
            self.last_received_input.frame
        };
        let next = last.next();
        if body.start_frame > next {
            trace!(
                peer = ?self.peer_addr,
                start_frame = %body.start_frame,
                expected = %next,
                "input run starts after a gap, waiting for a resend"
            );
            return 0;
        }

        let mut decoder = match DeltaDecoder::new(
            self.last_received_input.bytes.len(),
            &self.last_received_input.bytes,
            &body.bits,
            usize::from(body.num_bits),
        ) {
            Ok(decoder) => decoder,
            Err(err) => {
                report_violation_to!(
                    self.observer,
                    ViolationSeverity::Warning,
                    ViolationKind::InputCodec,
                    "can't decode input from {:?}: {}",
                    self.peer_addr,
                    err
                );
                return 0;
            },
        };

        // frames we already have
        let already = usize::try_from(next - body.start_frame).unwrap_or(0);
        if let Err(err) = decoder.skip(already) {
            report_violation_to!(
                self.observer,
                ViolationSeverity::Warning,
                ViolationKind::InputCodec,
                "corrupt input run from {:?}: {}",
                self.peer_addr,
                err
            );
            return 0;
        }

        let mut received = 0;
        loop {
            let bytes = match decoder.next_frame() {
                Ok(Some(bytes)) => bytes,
                Ok(None) => break,
                Err(err) => {
                    report_violation_to!(
                        self.observer,
                        ViolationSeverity::Warning,
                        ViolationKind::InputCodec,
                        "corrupt input run from {:?} after frame {}: {}",
                        self.peer_addr,
                        self.last_received_input.frame,
                        err
                    );
                    break;
                },
            };
            let frame = if self.last_received_input.frame.is_null() {
                body.start_frame
            } else {
                self.last_received_input.frame.next()
            };
            let input = InputBytes { frame, bytes };
            let decoded = match input.to_inputs::<T::Input>(self.handles.len(), self.endianness) {
                Ok(decoded) => decoded,
                Err(err) => {
                    report_violation_to!(
                        self.observer,
                        ViolationSeverity::Warning,
                        ViolationKind::InputCodec,
                        "undecodable input from {:?}: {}",
                        self.peer_addr,
                        err
                    );
                    break;
                },
            };

            self.last_received_input = input;
            self.last_input_recv_at = now;
            received += 1;
            for (player, value) in self.handles.clone().into_iter().zip(decoded) {
                self.push_event(ProtocolEvent::Input {
                    player,
                    input: PlayerInput::new(frame, value),
                });
            }
        }
        if received > 0 {
            trace!(
                peer = ?self.peer_addr,
                received,
                last_frame = %self.last_received_input.frame,
                "received inputs"
            );
        }
        received
    }

    fn on_input_ack(&mut self, body: InputAck) -> bool {
        self.local_inputs.acknowledge(body.ack_frame);
        true
    }

    fn on_quality_report(&mut self, body: QualityReport, now: Instant) -> bool {
        self.remote_frame_advantage = i32::from(body.frame_advantage);
        self.queue_message(
            MessageBody::QualityReply(QualityReply { pong: body.ping }),
            now,
        );
        true
    }

    fn on_quality_reply(&mut self, body: QualityReply, now: Instant) -> bool {
        let millis = self.clock_millis(now).saturating_sub(body.pong);
        self.round_trip_time = Some(Duration::from_millis(millis));
        true
    }

    fn on_consistency_request(
        &mut self,
        body: ConsistencyCheckRequest,
        now: Instant,
        checksums: &dyn ChecksumStore,
    ) -> bool {
        let Some(checksum) = checksums.checksum(body.frame) else {
            trace!(frame = %body.frame, "no checksum for requested frame");
            return false;
        };
        let reply = ConsistencyCheckReply {
            frame: body.frame,
            checksum,
        };
        self.queue_message(MessageBody::ConsistencyCheckReply(reply), now);
        true
    }

    fn on_consistency_reply(&mut self, body: ConsistencyCheckReply, now: Instant) -> bool {
        let Some((frame, local_checksum)) = self.consistency.asked else {
            trace!(frame = %body.frame, "unsolicited consistency reply");
            return true;
        };
        if body.frame != frame {
            trace!(frame = %body.frame, asked = %frame, "stale consistency reply");
            return true;
        }
        self.consistency.asked = None;
        self.stats.last_compared_frame = Some(frame);

        if body.checksum == local_checksum {
            self.consistency.last_check_at = Some(now);
            self.stats.checksums_match = Some(true);
            trace!(%frame, "consistency check passed");
            return true;
        }

        self.stats.checksums_match = Some(false);
        report_violation_to!(
            self.observer,
            ViolationSeverity::Critical,
            ViolationKind::Consistency,
            "state of {:?} diverged at frame {}: local {:#x}, remote {:#x}",
            self.peer_addr,
            frame,
            local_checksum,
            body.checksum
        );
        warn!(peer = ?self.peer_addr, %frame, "consistency check failed, disconnecting");
        self.push_event(ProtocolEvent::ConsistencyFailure {
            frame,
            local_checksum,
            remote_checksum: body.checksum,
        });
        self.emit_disconnected();
        self.state = ProtocolState::Disconnected;
        self.shutdown_at = Some(now + self.protocol_config.shutdown_delay);
        self.cancel.cancel();
        true
    }
}

