use std::collections::BTreeMap;
use std::net::SocketAddr;

use serde::{Deserialize, Serialize};

use super::*;
use crate::network::messages::{MessageHeader, SyncReply, SyncRequest};
use crate::network::wire::UDP_HEADER_SIZE;
use crate::sessions::config::DelayConfig;
use crate::telemetry::CollectingObserver;

#[repr(C)]
#[derive(Copy, Clone, PartialEq, Eq, Default, Serialize, Deserialize, Debug)]
struct TestInput {
    inp: u32,
}

#[derive(Debug, Clone, PartialEq)]
struct TestConfig;

impl Config for TestConfig {
    type Input = TestInput;
    type Address = SocketAddr;
}

const INPUT_SIZE: usize = 4;

fn addr_a() -> SocketAddr {
    "127.0.0.1:7000".parse().unwrap()
}

fn addr_b() -> SocketAddr {
    "127.0.0.1:7001".parse().unwrap()
}

fn quiet_config() -> SessionConfig {
    SessionConfig {
        consistency: ConsistencyConfig::disabled(),
        delay: DelayConfig::default(),
        ..SessionConfig::default()
    }
}

/// Connection on `a` talking to `b`, where `b` hosts player 1, and the mirror image.
fn create_pair(config: &SessionConfig) -> (PeerConnection<TestConfig>, PeerConnection<TestConfig>) {
    let now = Instant::now();
    let a = PeerConnection::new(
        addr_b(),
        vec![PlayerHandle::new(1)],
        2,
        INPUT_SIZE,
        INPUT_SIZE,
        config,
        Some(1),
        None,
        now,
    )
    .expect("connection a");
    let b = PeerConnection::new(
        addr_a(),
        vec![PlayerHandle::new(0)],
        2,
        INPUT_SIZE,
        INPUT_SIZE,
        config,
        Some(2),
        None,
        now,
    )
    .expect("connection b");
    (a, b)
}

/// Like [`create_pair`], with violations on `b` collected.
fn observed_pair(
    config: &SessionConfig,
) -> (
    PeerConnection<TestConfig>,
    PeerConnection<TestConfig>,
    Arc<CollectingObserver>,
) {
    let observer = Arc::new(CollectingObserver::new());
    let (a, _) = create_pair(config);
    let b = PeerConnection::<TestConfig>::new(
        addr_a(),
        vec![PlayerHandle::new(0)],
        2,
        INPUT_SIZE,
        INPUT_SIZE,
        config,
        Some(2),
        Some(observer.clone() as Arc<dyn ViolationObserver>),
        Instant::now(),
    )
    .expect("connection b");
    (a, b, observer)
}

#[derive(Default)]
struct RecordingSocket {
    sent: Vec<(SocketAddr, Message)>,
}

impl NonBlockingSocket<SocketAddr> for RecordingSocket {
    fn send_to(&mut self, msg: &Message, addr: &SocketAddr) {
        self.sent.push((*addr, msg.clone()));
    }

    fn receive_all_messages(&mut self) -> Vec<(SocketAddr, Message)> {
        Vec::new()
    }
}

fn flush(conn: &mut PeerConnection<TestConfig>, now: Instant) -> Vec<Message> {
    let mut socket = RecordingSocket::default();
    conn.flush_outbound(&mut socket, now);
    socket.sent.into_iter().map(|(_, msg)| msg).collect()
}

fn deliver(
    from: &mut PeerConnection<TestConfig>,
    to: &mut PeerConnection<TestConfig>,
    now: Instant,
    checksums: &dyn ChecksumStore,
) -> usize {
    let messages = flush(from, now);
    for msg in &messages {
        to.handle_message(msg, now, checksums);
    }
    messages.len()
}

fn exchange(a: &mut PeerConnection<TestConfig>, b: &mut PeerConnection<TestConfig>, now: Instant) {
    for _ in 0..64 {
        let moved = deliver(a, b, now, &()) + deliver(b, a, now, &());
        if moved == 0 {
            return;
        }
    }
    panic!("message exchange did not settle");
}

fn complete_sync(
    a: &mut PeerConnection<TestConfig>,
    b: &mut PeerConnection<TestConfig>,
    now: Instant,
) {
    a.synchronize(now).unwrap();
    b.synchronize(now).unwrap();
    exchange(a, b, now);
    assert!(a.is_running(), "a stuck in {:?}", a.state());
    assert!(b.is_running(), "b stuck in {:?}", b.state());
    a.drain_events().for_each(drop);
    b.drain_events().for_each(drop);
}

fn statuses() -> Vec<ConnectStatus> {
    vec![ConnectStatus::default(); 2]
}

fn input(frame: i32, value: u32) -> InputBytes {
    InputBytes::from_inputs(
        Frame::new(frame),
        &[TestInput { inp: value }],
        INPUT_SIZE,
        Endianness::Little,
    )
    .unwrap()
}

fn send_frames(conn: &mut PeerConnection<TestConfig>, frames: std::ops::Range<i32>, now: Instant) {
    for frame in frames {
        let outcome = conn
            .send_input(input(frame, frame as u32 * 10), &statuses(), now)
            .unwrap();
        assert!(matches!(outcome, FlushOutcome::Sent { .. }));
    }
}

fn received_inputs(conn: &mut PeerConnection<TestConfig>) -> Vec<(PlayerHandle, Frame, u32)> {
    conn.drain_events()
        .filter_map(|event| match event {
            ProtocolEvent::Input { player, input } => Some((player, input.frame, input.input.inp)),
            _ => None,
        })
        .collect()
}

// ==========================================
// Construction
// ==========================================

#[test]
fn new_connection_starts_initializing() {
    let (a, _) = create_pair(&quiet_config());
    assert_eq!(a.state(), ProtocolState::Initializing);
    assert_eq!(a.status(), PeerStatus::Syncing);
    assert_ne!(a.magic(), 0);
    assert_eq!(a.remote_magic(), 0);
    assert_eq!(a.last_received_frame(), Frame::NULL);
    assert_eq!(a.handles(), &[PlayerHandle::new(1)]);
}

#[test]
fn oversized_frames_are_rejected() {
    let result = PeerConnection::<TestConfig>::new(
        addr_b(),
        vec![PlayerHandle::new(0)],
        2,
        MAX_INPUT_BYTES + 1,
        INPUT_SIZE,
        &quiet_config(),
        None,
        None,
        Instant::now(),
    );
    assert!(matches!(
        result,
        Err(BastionError::InputSizeOutOfRange { size, .. }) if size == MAX_INPUT_BYTES + 1
    ));
}

#[test]
fn bit_budget_must_hold_two_full_frames() {
    let mut config = quiet_config();
    config.protocol.max_input_bits = 64;
    let build = |config: &SessionConfig| {
        PeerConnection::<TestConfig>::new(
            addr_b(),
            vec![PlayerHandle::new(1)],
            2,
            INPUT_SIZE,
            INPUT_SIZE,
            config,
            None,
            None,
            Instant::now(),
        )
    };
    // 32 bits all flipped: 32 entries of 6 bits plus 2 stop bits, twice
    assert!(matches!(
        build(&config),
        Err(BastionError::ConfigValueOutOfRange {
            field: "max_input_bits",
            min: 388,
            actual: 64,
            ..
        })
    ));
    config.protocol.max_input_bits = 387;
    assert!(build(&config).is_err());
    config.protocol.max_input_bits = 388;
    assert!(build(&config).is_ok());
}

#[test]
fn full_frames_always_move_at_the_smallest_budget() {
    let mut config = quiet_config();
    config.protocol.max_input_bits = 388;
    let (mut a, mut b) = create_pair(&config);
    let now = Instant::now();
    complete_sync(&mut a, &mut b, now);

    // every bit flips on every frame
    for frame in 0..4 {
        let value = if frame % 2 == 0 { u32::MAX } else { 0 };
        let outcome = a.send_input(input(frame, value), &statuses(), now).unwrap();
        assert!(matches!(outcome, FlushOutcome::Sent { .. }), "{outcome:?}");
        exchange(&mut a, &mut b, now);
    }
    let frames: Vec<_> = received_inputs(&mut b)
        .into_iter()
        .map(|(_, frame, value)| (frame.as_i32(), value))
        .collect();
    assert_eq!(frames, vec![(0, u32::MAX), (1, 0), (2, u32::MAX), (3, 0)]);
}

#[test]
fn handles_are_sorted_and_deduplicated() {
    let conn = PeerConnection::<TestConfig>::new(
        addr_b(),
        vec![PlayerHandle::new(3), PlayerHandle::new(1), PlayerHandle::new(3)],
        4,
        INPUT_SIZE,
        INPUT_SIZE,
        &quiet_config(),
        None,
        None,
        Instant::now(),
    )
    .unwrap();
    assert_eq!(conn.handles(), &[PlayerHandle::new(1), PlayerHandle::new(3)]);
}

#[test]
fn stats_need_a_handshake() {
    let (a, _) = create_pair(&quiet_config());
    assert_eq!(a.network_stats(), Err(BastionError::NotSynchronized));
}

// ==========================================
// Handshake
// ==========================================

#[test]
fn handshake_runs_every_roundtrip() {
    let config = quiet_config();
    let (mut a, mut b) = create_pair(&config);
    let now = Instant::now();
    a.synchronize(now).unwrap();
    b.synchronize(now).unwrap();
    exchange(&mut a, &mut b, now);

    assert!(a.is_running());
    assert!(b.is_running());
    assert_eq!(a.remote_magic(), b.magic());
    assert_eq!(b.remote_magic(), a.magic());

    let events: Vec<_> = a.drain_events().collect();
    let total = config.sync.num_sync_roundtrips;
    assert_eq!(events.first(), Some(&ProtocolEvent::Connected));
    let progress = events
        .iter()
        .filter(|event| matches!(event, ProtocolEvent::Synchronizing { .. }))
        .count();
    assert_eq!(progress as u32, total - 1);
    assert_eq!(
        events.last(),
        Some(&ProtocolEvent::Synchronized {
            ping: Duration::ZERO
        })
    );
}

#[test]
fn synchronize_twice_is_rejected() {
    let (mut a, _) = create_pair(&quiet_config());
    let now = Instant::now();
    a.synchronize(now).unwrap();
    assert!(matches!(
        a.synchronize(now),
        Err(BastionError::InvalidRequest { .. })
    ));
}

#[test]
fn sync_reply_with_wrong_nonce_is_ignored() {
    let (mut a, _) = create_pair(&quiet_config());
    let now = Instant::now();
    a.synchronize(now).unwrap();
    let remaining = a.remaining_roundtrips();

    let reply = Message {
        header: MessageHeader {
            magic: 999,
            sequence: 0,
        },
        body: MessageBody::SyncReply(SyncReply {
            random_reply: a.sync.random.wrapping_add(1),
            pong: 0,
        }),
    };
    a.handle_message(&reply, now, &());

    assert_eq!(a.remaining_roundtrips(), remaining);
    assert_eq!(a.drain_events().count(), 0);
}

#[test]
fn duplicated_sync_reply_counts_once() {
    let (mut a, mut b) = create_pair(&quiet_config());
    let now = Instant::now();
    a.synchronize(now).unwrap();
    let remaining = a.remaining_roundtrips();
    assert!(remaining > 1);

    deliver(&mut a, &mut b, now, &());
    let replies = flush(&mut b, now);
    assert_eq!(replies.len(), 1);
    a.handle_message(&replies[0], now, &());
    a.handle_message(&replies[0], now, &());

    assert_eq!(a.remaining_roundtrips(), remaining - 1);
    let progress = a
        .drain_events()
        .filter(|event| matches!(event, ProtocolEvent::Synchronizing { .. }))
        .count();
    assert_eq!(progress, 1);
}

#[test]
fn sync_reply_before_synchronize_is_ignored() {
    let (mut a, _) = create_pair(&quiet_config());
    let reply = Message {
        header: MessageHeader {
            magic: 999,
            sequence: 0,
        },
        body: MessageBody::SyncReply(SyncReply {
            random_reply: 0,
            pong: 0,
        }),
    };
    a.handle_message(&reply, Instant::now(), &());
    assert_eq!(a.state(), ProtocolState::Initializing);
}

#[test]
fn sync_retries_reuse_the_nonce_then_give_up() {
    let mut config = quiet_config();
    config.sync.max_sync_retries = Some(2);
    let (mut a, _) = create_pair(&config);
    let start = Instant::now();
    let step = config.sync.sync_first_retry_interval + Duration::from_millis(1);

    a.synchronize(start).unwrap();
    let first = flush(&mut a, start);

    let mut now = start;
    let mut resent = Vec::new();
    for _ in 0..2 {
        now += step;
        a.poll(now, &statuses(), &());
        resent.extend(flush(&mut a, now));
    }
    let nonce = |msg: &Message| match &msg.body {
        MessageBody::SyncRequest(request) => request.random_request,
        other => panic!("expected a sync request, got {:?}", other),
    };
    assert_eq!(resent.len(), 2);
    for msg in &resent {
        assert_eq!(nonce(msg), nonce(&first[0]));
    }

    now += step;
    a.poll(now, &statuses(), &());
    let events: Vec<_> = a.drain_events().collect();
    assert_eq!(events, vec![ProtocolEvent::SyncFailure]);
    assert_eq!(a.status(), PeerStatus::Disconnected);
}

#[test]
fn sync_retry_waits_for_the_interval() {
    let (mut a, _) = create_pair(&quiet_config());
    let now = Instant::now();
    a.synchronize(now).unwrap();
    flush(&mut a, now);

    // exactly on the interval is not past it
    a.poll(now + quiet_config().sync.sync_first_retry_interval, &statuses(), &());
    assert!(flush(&mut a, now + Duration::from_secs(1)).is_empty());
}

// ==========================================
// Inputs
// ==========================================

#[test]
fn send_input_requires_running() {
    let (mut a, _) = create_pair(&quiet_config());
    let result = a.send_input(input(0, 1), &statuses(), Instant::now());
    assert_eq!(result, Err(SendInputError::NotRunning));
    assert_eq!(a.check_input(Frame::new(0)), Err(SendInputError::NotRunning));
}

#[test]
fn inputs_reach_the_peer_in_order() {
    let (mut a, mut b) = create_pair(&quiet_config());
    let now = Instant::now();
    complete_sync(&mut a, &mut b, now);

    send_frames(&mut a, 0..5, now);
    exchange(&mut a, &mut b, now);

    let received = received_inputs(&mut b);
    let expected: Vec<_> = (0..5)
        .map(|frame| (PlayerHandle::new(0), Frame::new(frame), frame as u32 * 10))
        .collect();
    assert_eq!(received, expected);
    assert_eq!(b.last_received_frame(), Frame::new(4));
}

#[test]
fn ack_trims_the_pending_queue() {
    let (mut a, mut b) = create_pair(&quiet_config());
    let now = Instant::now();
    complete_sync(&mut a, &mut b, now);

    send_frames(&mut a, 0..5, now);
    assert_eq!(a.pending_output_len(), 5);
    exchange(&mut a, &mut b, now);

    // frame 4 stays as the peer's acknowledgement boundary
    assert_eq!(a.last_acked_frame(), Frame::new(4));
    assert_eq!(a.pending_output_len(), 1);
}

#[test]
fn resent_frames_are_not_delivered_twice() {
    let (mut a, mut b) = create_pair(&quiet_config());
    let now = Instant::now();
    complete_sync(&mut a, &mut b, now);

    send_frames(&mut a, 0..3, now);
    exchange(&mut a, &mut b, now);
    assert_eq!(received_inputs(&mut b).len(), 3);

    let _ = a.send_pending_output(&statuses(), now);
    exchange(&mut a, &mut b, now);
    assert!(received_inputs(&mut b).is_empty());

    send_frames(&mut a, 3..4, now);
    exchange(&mut a, &mut b, now);
    assert_eq!(
        received_inputs(&mut b),
        vec![(PlayerHandle::new(0), Frame::new(3), 30)]
    );
}

#[test]
fn lost_messages_are_recovered_by_the_next_run() {
    let (mut a, mut b) = create_pair(&quiet_config());
    let now = Instant::now();
    complete_sync(&mut a, &mut b, now);

    send_frames(&mut a, 0..3, now);
    // drop everything on the floor
    flush(&mut a, now);

    send_frames(&mut a, 3..4, now);
    exchange(&mut a, &mut b, now);
    let frames: Vec<_> = received_inputs(&mut b)
        .into_iter()
        .map(|(_, frame, _)| frame.as_i32())
        .collect();
    assert_eq!(frames, vec![0, 1, 2, 3]);
}

#[test]
fn gap_is_not_applied() {
    let (mut a, mut b) = create_pair(&quiet_config());
    let now = Instant::now();
    complete_sync(&mut a, &mut b, now);

    send_frames(&mut a, 0..2, now);
    exchange(&mut a, &mut b, now);
    received_inputs(&mut b);

    let gap = Message {
        header: MessageHeader {
            magic: a.magic(),
            sequence: b.next_recv_seq.wrapping_add(1),
        },
        body: MessageBody::Input(Input {
            start_frame: Frame::new(5),
            input_size: INPUT_SIZE as u16,
            num_bits: 8,
            ack_frame: Frame::NULL,
            disconnect_requested: false,
            peer_connect_status: statuses().into_iter().collect(),
            bits: vec![0],
        }),
    };
    b.handle_message(&gap, now, &());
    assert!(received_inputs(&mut b).is_empty());
    assert_eq!(b.last_received_frame(), Frame::new(1));
}

#[test]
fn disconnect_request_reaches_the_peer() {
    let (mut a, mut b) = create_pair(&quiet_config());
    let now = Instant::now();
    complete_sync(&mut a, &mut b, now);

    send_frames(&mut a, 0..3, now);
    exchange(&mut a, &mut b, now);
    b.drain_events().for_each(drop);

    a.disconnect(now);
    assert_eq!(a.status(), PeerStatus::Disconnected);
    let _ = a.send_pending_output(&statuses(), now);
    deliver(&mut a, &mut b, now, &());

    let events: Vec<_> = b.drain_events().collect();
    assert_eq!(events, vec![ProtocolEvent::Disconnected]);
}

// ==========================================
// Filtering
// ==========================================

#[test]
fn foreign_magic_is_dropped() {
    let (mut a, mut b) = create_pair(&quiet_config());
    let now = Instant::now();
    complete_sync(&mut a, &mut b, now);
    let before = b.packets_received;

    let msg = Message {
        header: MessageHeader {
            magic: a.magic().wrapping_add(1),
            sequence: b.next_recv_seq.wrapping_add(1),
        },
        body: MessageBody::KeepAlive,
    };
    b.handle_message(&msg, now, &());
    assert_eq!(b.packets_received, before);
}

#[test]
fn far_sequence_is_dropped() {
    let (mut a, mut b) = create_pair(&quiet_config());
    let now = Instant::now();
    complete_sync(&mut a, &mut b, now);
    let before = b.packets_received;
    let next = b.next_recv_seq;

    let far = Message {
        header: MessageHeader {
            magic: a.magic(),
            sequence: next.wrapping_add(40_000),
        },
        body: MessageBody::KeepAlive,
    };
    b.handle_message(&far, now, &());
    assert_eq!(b.packets_received, before);
    assert_eq!(b.next_recv_seq, next);

    let near = Message {
        header: MessageHeader {
            magic: a.magic(),
            sequence: next.wrapping_add(3),
        },
        body: MessageBody::KeepAlive,
    };
    b.handle_message(&near, now, &());
    assert_eq!(b.packets_received, before + 1);
    assert_eq!(b.next_recv_seq, next.wrapping_add(3));
}

#[test]
fn input_run_before_frame_zero_is_refused() {
    let (mut a, mut b, observer) = observed_pair(&quiet_config());
    let now = Instant::now();
    complete_sync(&mut a, &mut b, now);
    let next = b.next_recv_seq;

    for start_frame in [i32::MIN, -1] {
        let bogus = Message {
            header: MessageHeader {
                magic: a.magic(),
                sequence: next.wrapping_add(1),
            },
            body: MessageBody::Input(Input {
                start_frame: Frame::new(start_frame),
                input_size: INPUT_SIZE as u16,
                num_bits: 2,
                ack_frame: Frame::NULL,
                disconnect_requested: false,
                peer_connect_status: statuses().into_iter().collect(),
                bits: vec![0],
            }),
        };
        b.handle_message(&bogus, now, &());
    }

    crate::assert_violation!(observer, ViolationKind::InputCodec);
    assert_eq!(b.next_recv_seq, next);
    assert_eq!(b.last_received_frame(), Frame::NULL);
    assert!(received_inputs(&mut b).is_empty());

    // the real stream still gets through
    send_frames(&mut a, 0..2, now);
    exchange(&mut a, &mut b, now);
    assert_eq!(received_inputs(&mut b).len(), 2);
}

#[test]
fn refused_handshake_leaves_the_window_alone() {
    let (mut a, mut b) = create_pair(&quiet_config());
    let now = Instant::now();
    complete_sync(&mut a, &mut b, now);
    let next = b.next_recv_seq;
    let before = b.packets_received;

    // a restarted peer on the same address
    let intruder = Message {
        header: MessageHeader {
            magic: a.magic().wrapping_add(7),
            sequence: next.wrapping_add(20_000),
        },
        body: MessageBody::SyncRequest(SyncRequest {
            random_request: 1,
            ping: 0,
        }),
    };
    b.handle_message(&intruder, now, &());
    assert_eq!(b.next_recv_seq, next);
    assert_eq!(b.packets_received, before);
    assert!(!flush(&mut b, now)
        .iter()
        .any(|msg| matches!(msg.body, MessageBody::SyncReply(_))));

    let genuine = Message {
        header: MessageHeader {
            magic: a.magic(),
            sequence: next.wrapping_add(1),
        },
        body: MessageBody::KeepAlive,
    };
    b.handle_message(&genuine, now, &());
    assert_eq!(b.next_recv_seq, next.wrapping_add(1));
    assert_eq!(b.packets_received, before + 1);
}

#[test]
fn non_handshake_before_running_is_dropped() {
    let (_, mut b) = create_pair(&quiet_config());
    let msg = Message {
        header: MessageHeader {
            magic: 5,
            sequence: 0,
        },
        body: MessageBody::KeepAlive,
    };
    b.handle_message(&msg, Instant::now(), &());
    assert_eq!(b.packets_received, 0);
}

// ==========================================
// Timers
// ==========================================

#[test]
fn silence_interrupts_then_disconnects_once() {
    let config = quiet_config();
    let (mut a, mut b) = create_pair(&config);
    let start = Instant::now();
    complete_sync(&mut a, &mut b, start);

    let notify_at = start + config.protocol.disconnect_notify_start + Duration::from_millis(1);
    b.poll(notify_at, &statuses(), &());
    let events: Vec<_> = b.drain_events().collect();
    assert_eq!(
        events,
        vec![ProtocolEvent::NetworkInterrupted {
            disconnect_timeout: config.protocol.disconnect_timeout
                - config.protocol.disconnect_notify_start
        }]
    );

    a.poll(notify_at, &statuses(), &());
    deliver(&mut a, &mut b, notify_at, &());
    let events: Vec<_> = b.drain_events().collect();
    assert_eq!(events, vec![ProtocolEvent::NetworkResumed]);

    let timeout_at = notify_at + config.protocol.disconnect_timeout + Duration::from_millis(1);
    b.poll(timeout_at, &statuses(), &());
    b.poll(timeout_at + Duration::from_millis(10), &statuses(), &());
    let disconnects = b
        .drain_events()
        .filter(|event| matches!(event, ProtocolEvent::Disconnected))
        .count();
    assert_eq!(disconnects, 1);
}

#[test]
fn keepalive_fills_quiet_periods() {
    let config = quiet_config();
    let (mut a, mut b) = create_pair(&config);
    let start = Instant::now();
    complete_sync(&mut a, &mut b, start);

    let later = start + config.sync.keepalive_interval + Duration::from_millis(1);
    a.poll(later, &statuses(), &());
    let sent = flush(&mut a, later);
    assert!(sent
        .iter()
        .any(|msg| matches!(msg.body, MessageBody::KeepAlive)));
}

#[test]
fn quality_report_measures_round_trip() {
    let config = quiet_config();
    let (mut a, mut b) = create_pair(&config);
    let start = Instant::now();
    complete_sync(&mut a, &mut b, start);
    assert_eq!(a.round_trip_time(), None);

    let report_at = start + config.protocol.quality_report_interval + Duration::from_millis(1);
    a.poll(report_at, &statuses(), &());
    deliver(&mut a, &mut b, report_at, &());
    let reply_at = report_at + Duration::from_millis(30);
    deliver(&mut b, &mut a, reply_at, &());

    assert_eq!(a.round_trip_time(), Some(Duration::from_millis(30)));
}

#[test]
fn disconnect_shuts_down_after_the_delay() {
    let config = quiet_config();
    let (mut a, mut b) = create_pair(&config);
    let start = Instant::now();
    complete_sync(&mut a, &mut b, start);
    let token = a.cancellation_token();

    a.disconnect(start);
    a.poll(start + Duration::from_millis(1), &statuses(), &());
    assert_eq!(a.state(), ProtocolState::Disconnected);
    assert!(!token.is_cancelled());

    a.poll(start + config.protocol.shutdown_delay, &statuses(), &());
    assert_eq!(a.state(), ProtocolState::Shutdown);
    assert!(token.is_cancelled());

    // shut down connections accept and send nothing
    a.handle_message(
        &Message {
            header: MessageHeader::default(),
            body: MessageBody::KeepAlive,
        },
        start,
        &(),
    );
    assert!(flush(&mut a, start + config.protocol.shutdown_delay).is_empty());
}

#[test]
fn frame_advantage_accounts_for_latency() {
    let (mut a, mut b) = create_pair(&quiet_config());
    let now = Instant::now();
    complete_sync(&mut a, &mut b, now);

    send_frames(&mut b, 0..11, now);
    exchange(&mut a, &mut b, now);
    a.round_trip_time = Some(Duration::from_millis(100));

    // 50ms one way is 3 frames at 60fps
    a.update_local_frame_advantage(Frame::new(4));
    assert_eq!(a.local_frame_advantage, 10 + 3 - 4);
}

// ==========================================
// Consistency
// ==========================================

fn auditing_config() -> SessionConfig {
    SessionConfig {
        consistency: ConsistencyConfig {
            enabled: true,
            interval: Duration::from_millis(100),
            frame_offset: 0,
            require_ping_baseline: false,
        },
        ..quiet_config()
    }
}

fn audit(
    local: u128,
    remote: u128,
) -> (PeerConnection<TestConfig>, PeerConnection<TestConfig>, Instant) {
    let (mut a, mut b) = create_pair(&auditing_config());
    let start = Instant::now();
    complete_sync(&mut a, &mut b, start);
    send_frames(&mut a, 0..4, start);
    exchange(&mut a, &mut b, start);
    b.drain_events().for_each(drop);

    let b_sums: BTreeMap<Frame, u128> = [(Frame::new(3), local)].into_iter().collect();
    let a_sums: BTreeMap<Frame, u128> = [(Frame::new(3), remote)].into_iter().collect();
    let now = start + Duration::from_millis(150);
    b.poll(now, &statuses(), &b_sums);
    deliver(&mut b, &mut a, now, &a_sums);
    deliver(&mut a, &mut b, now, &b_sums);
    (a, b, now)
}

#[test]
fn matching_checksums_pass() {
    let (_, b, _) = audit(0xAB, 0xAB);
    let stats = b.network_stats().unwrap();
    assert_eq!(stats.last_compared_frame, Some(Frame::new(3)));
    assert_eq!(stats.checksums_match, Some(true));
    assert!(b.is_running());
}

#[test]
fn diverging_checksums_disconnect() {
    let (mut a, mut b, now) = audit(0xAB, 0xCD);
    let events: Vec<_> = b.drain_events().collect();
    assert!(events.contains(&ProtocolEvent::ConsistencyFailure {
        frame: Frame::new(3),
        local_checksum: 0xAB,
        remote_checksum: 0xCD,
    }));
    assert_eq!(events.last(), Some(&ProtocolEvent::Disconnected));
    assert_eq!(b.status(), PeerStatus::Disconnected);
    assert!(b.cancellation_token().is_cancelled());
    assert_eq!(b.network_stats().unwrap().checksums_match, Some(false));

    // nothing the peer sends afterwards reaches the simulator
    send_frames(&mut a, 4..6, now);
    deliver(&mut a, &mut b, now, &());
    assert!(received_inputs(&mut b).is_empty());
    assert_eq!(b.last_received_frame(), Frame::new(3));
}

#[test]
fn audit_interval_runs_from_the_confirmed_check() {
    let (mut a, mut b) = create_pair(&auditing_config());
    let start = Instant::now();
    complete_sync(&mut a, &mut b, start);
    send_frames(&mut a, 0..4, start);
    exchange(&mut a, &mut b, start);
    b.drain_events().for_each(drop);
    let sums: BTreeMap<Frame, u128> = [(Frame::new(3), 0xAB)].into_iter().collect();
    let is_request = |msg: &Message| matches!(msg.body, MessageBody::ConsistencyCheckRequest(_));

    let asked_at = start + Duration::from_millis(150);
    b.poll(asked_at, &statuses(), &sums);
    deliver(&mut b, &mut a, asked_at, &sums);
    // the reply takes 80ms to come back
    let confirmed_at = asked_at + Duration::from_millis(80);
    deliver(&mut a, &mut b, confirmed_at, &sums);
    assert_eq!(b.network_stats().unwrap().checksums_match, Some(true));

    let interval = auditing_config().consistency.interval;
    let early = asked_at + interval + Duration::from_millis(10);
    b.poll(early, &statuses(), &sums);
    assert!(!flush(&mut b, early).iter().any(is_request));

    let due = confirmed_at + interval + Duration::from_millis(10);
    b.poll(due, &statuses(), &sums);
    assert!(flush(&mut b, due).iter().any(is_request));
}

#[test]
fn audit_waits_for_a_local_checksum() {
    let (mut a, mut b) = create_pair(&auditing_config());
    let start = Instant::now();
    complete_sync(&mut a, &mut b, start);
    send_frames(&mut a, 0..4, start);
    exchange(&mut a, &mut b, start);

    let now = start + Duration::from_millis(150);
    b.poll(now, &statuses(), &());
    assert!(!flush(&mut b, now)
        .iter()
        .any(|msg| matches!(msg.body, MessageBody::ConsistencyCheckRequest(_))));
}

// ==========================================
// Connect status
// ==========================================

fn status_message(conn: &PeerConnection<TestConfig>, magic: u16, sequence: u16, frame: i32) -> Message {
    let mut table = statuses();
    table[0].last_frame = Frame::new(frame);
    Message {
        header: MessageHeader { magic, sequence },
        body: MessageBody::Input(Input {
            start_frame: Frame::new(0),
            input_size: conn.local_inputs.frame_size() as u16,
            num_bits: 0,
            ack_frame: Frame::NULL,
            disconnect_requested: false,
            peer_connect_status: table.into_iter().collect(),
            bits: Vec::new(),
        }),
    }
}

#[test]
fn status_regression_is_reported_and_ignored() {
    let (mut a, mut b, observer) = observed_pair(&quiet_config());
    let now = Instant::now();
    complete_sync(&mut a, &mut b, now);
    let seq = b.next_recv_seq;

    b.handle_message(&status_message(&b, a.magic(), seq.wrapping_add(1), 10), now, &());
    b.handle_message(&status_message(&b, a.magic(), seq.wrapping_add(2), 5), now, &());

    crate::assert_violation!(observer, ViolationKind::ConnectStatus);
    assert_eq!(
        b.peer_connect_status(PlayerHandle::new(0)).last_frame,
        Frame::new(10)
    );
    assert!(b.is_running());
    assert_eq!(b.drain_events().count(), 0);
}

#[test]
fn status_regression_can_disconnect() {
    let mut config = quiet_config();
    config.protocol.disconnect_on_status_regression = true;
    let (mut a, mut b) = create_pair(&config);
    let now = Instant::now();
    complete_sync(&mut a, &mut b, now);
    let seq = b.next_recv_seq;

    b.handle_message(&status_message(&b, a.magic(), seq.wrapping_add(1), 10), now, &());
    b.handle_message(&status_message(&b, a.magic(), seq.wrapping_add(2), 5), now, &());

    let events: Vec<_> = b.drain_events().collect();
    assert_eq!(events, vec![ProtocolEvent::Disconnected]);
}

#[test]
fn earlier_disconnect_frame_is_not_a_regression() {
    let mut config = quiet_config();
    config.protocol.disconnect_on_status_regression = true;
    let (mut a, mut b, observer) = observed_pair(&config);
    let now = Instant::now();
    complete_sync(&mut a, &mut b, now);
    let seq = b.next_recv_seq;

    b.handle_message(&status_message(&b, a.magic(), seq.wrapping_add(1), 14), now, &());
    let mut dropped = status_message(&b, a.magic(), seq.wrapping_add(2), 9);
    if let MessageBody::Input(body) = &mut dropped.body {
        body.peer_connect_status[0].disconnected = true;
    }
    b.handle_message(&dropped, now, &());

    crate::assert_no_violations!(observer);
    assert!(b.is_running());
    assert_eq!(b.drain_events().count(), 0);
    let status = b.peer_connect_status(PlayerHandle::new(0));
    assert!(status.disconnected);
    assert_eq!(status.last_frame, Frame::new(14));
}

// ==========================================
// Outbound
// ==========================================

#[test]
fn detached_pump_leaves_flush_idle() {
    let (mut a, _) = create_pair(&quiet_config());
    let now = Instant::now();
    a.synchronize(now).unwrap();
    let mut pump = a.take_pump().expect("pump");
    assert!(a.take_pump().is_none());
    assert!(flush(&mut a, now).is_empty());

    let mut socket = RecordingSocket::default();
    assert_eq!(pump.flush(&mut socket, &addr_b(), now), 1);
    assert_eq!(socket.sent[0].1.header.magic, a.magic());
}

#[test]
fn sent_bytes_include_udp_headers() {
    let (mut a, mut b) = create_pair(&quiet_config());
    let now = Instant::now();
    complete_sync(&mut a, &mut b, now);
    let later = now + Duration::from_secs(2);
    a.poll(later, &statuses(), &());
    let stats = a.network_stats().unwrap();
    assert!(stats.packets_sent > 0);
    assert!(stats.bytes_sent >= stats.packets_sent * UDP_HEADER_SIZE as u64);
    assert!(stats.packets_received > 0);
}

#[test]
fn counters_are_live_between_snapshots() {
    let (mut a, mut b) = create_pair(&quiet_config());
    let now = Instant::now();
    complete_sync(&mut a, &mut b, now);
    send_frames(&mut a, 0..3, now);
    exchange(&mut a, &mut b, now);

    // no stats interval has passed
    let stats = a.network_stats().unwrap();
    assert!(stats.packets_sent > 0);
    assert!(stats.bytes_sent > 0);
    assert!(stats.packets_received > 0);
    assert_eq!(stats.send_queue_len, a.pending_output_len());
    assert_eq!(stats.kbps_sent, 0);
}
