//! Two-peer session integration tests.

#![allow(
    clippy::panic,
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::indexing_slicing
)]

use crate::common::stubs::scripted_input;
use crate::common::{
    play_frames, quiet_config, run_until, settle, synchronize, test_addr, LoopbackNetwork,
    TestClock, TestPeer, TICK,
};
use bastion_netcode::{BastionError, Frame, PeerEvent, PlayerHandle, PlayerType};
use std::net::SocketAddr;
use web_time::Duration;

fn addrs() -> (SocketAddr, SocketAddr) {
    (test_addr(7000), test_addr(7001))
}

/// Peer 0 runs player 0 and peer 1 runs player 1.
fn two_peers(network: &LoopbackNetwork, clock: &TestClock) -> Vec<TestPeer> {
    let (a, b) = addrs();
    vec![
        TestPeer::start(
            network,
            a,
            quiet_config(2),
            &[(0, PlayerType::Local), (1, PlayerType::Remote(b))],
            clock.now(),
        ),
        TestPeer::start(
            network,
            b,
            quiet_config(2),
            &[(0, PlayerType::Remote(a)), (1, PlayerType::Local)],
            clock.now(),
        ),
    ]
}

// ==========================================
// Synchronization
// ==========================================

#[test]
fn peers_synchronize_over_the_loopback() {
    let network = LoopbackNetwork::new();
    let mut clock = TestClock::new();
    let mut peers = two_peers(&network, &clock);
    let (a, b) = addrs();

    assert!(!peers[0].is_running());
    synchronize(&mut peers, &mut clock);

    assert_eq!(peers[0].events.first(), Some(&PeerEvent::Connected { addr: b }));
    assert_eq!(peers[1].events.first(), Some(&PeerEvent::Connected { addr: a }));
    let progress = peers[0]
        .events
        .iter()
        .filter(|event| matches!(event, PeerEvent::Synchronizing { addr, .. } if *addr == b))
        .count();
    assert_eq!(progress, 4, "five roundtrips report four progress steps");
    assert!(peers[0].saw(|event| matches!(event, PeerEvent::Synchronized { addr, .. } if *addr == b)));
}

#[test]
fn unreachable_peer_keeps_the_session_synchronizing() {
    let network = LoopbackNetwork::new();
    let mut clock = TestClock::new();
    let (_, b) = addrs();
    let mut peers = two_peers(&network, &clock);
    network.isolate(b);

    for _ in 0..100 {
        let now = clock.advance(TICK);
        peers[0].poll(now);
    }
    assert!(!peers[0].is_running());
    assert_eq!(
        peers[0].session.add_local_input(
            Frame::new(0),
            PlayerHandle::new(0),
            scripted_input(PlayerHandle::new(0), 0),
            clock.now(),
        ),
        Err(BastionError::NotSynchronized)
    );
}

// ==========================================
// Input Exchange
// ==========================================

#[test]
fn inputs_cross_in_frame_order() {
    let network = LoopbackNetwork::new();
    let mut clock = TestClock::new();
    let mut peers = two_peers(&network, &clock);
    synchronize(&mut peers, &mut clock);

    play_frames(&mut peers, &mut clock, 20);

    let expected: Vec<i32> = (0..20).collect();
    assert_eq!(peers[0].sim.remote_frames(PlayerHandle::new(1)), expected);
    assert_eq!(peers[1].sim.remote_frames(PlayerHandle::new(0)), expected);
    for frame in 0..20 {
        assert_eq!(
            peers[0].sim.input_of(PlayerHandle::new(1), Frame::new(frame)),
            Some(scripted_input(PlayerHandle::new(1), frame))
        );
    }
}

#[test]
fn both_peers_confirm_the_last_shared_frame() {
    let network = LoopbackNetwork::new();
    let mut clock = TestClock::new();
    let mut peers = two_peers(&network, &clock);
    synchronize(&mut peers, &mut clock);

    play_frames(&mut peers, &mut clock, 12);

    for peer in &peers {
        assert_eq!(peer.session.confirmed_frame(), Frame::new(11));
        assert_eq!(peer.sim.last_confirmed, Frame::new(11));
    }
}

#[test]
fn confirmation_waits_for_the_slower_peer() {
    let network = LoopbackNetwork::new();
    let mut clock = TestClock::new();
    let mut peers = two_peers(&network, &clock);
    synchronize(&mut peers, &mut clock);

    play_frames(&mut peers, &mut clock, 5);
    // only peer 0 keeps going
    for _ in 0..5 {
        let now = clock.advance(TICK);
        peers[0].send_next_frame(now).unwrap();
        crate::common::poll_all(&mut peers, now);
    }
    settle(&mut peers, &mut clock);

    assert_eq!(peers[0].session.confirmed_frame(), Frame::new(4));
    assert_eq!(peers[1].session.confirmed_frame(), Frame::new(4));
    assert_eq!(peers[1].sim.remote_frames(PlayerHandle::new(0)).len(), 10);
}

#[test]
fn skipped_frame_is_rejected() {
    let network = LoopbackNetwork::new();
    let mut clock = TestClock::new();
    let mut peers = two_peers(&network, &clock);
    synchronize(&mut peers, &mut clock);

    let now = clock.advance(TICK);
    peers[0].send_next_frame(now).unwrap();
    let err = peers[0]
        .session
        .add_local_input(
            Frame::new(2),
            PlayerHandle::new(0),
            scripted_input(PlayerHandle::new(0), 2),
            now,
        )
        .unwrap_err();
    assert!(matches!(err, BastionError::InvalidRequest { .. }), "{:?}", err);

    // the rejected frame left nothing behind
    assert_eq!(peers[0].send_next_frame(now).unwrap(), Frame::new(1));
}

#[test]
fn remote_handle_takes_no_local_input() {
    let network = LoopbackNetwork::new();
    let mut clock = TestClock::new();
    let mut peers = two_peers(&network, &clock);
    synchronize(&mut peers, &mut clock);

    let err = peers[0]
        .session
        .add_local_input(
            Frame::new(0),
            PlayerHandle::new(1),
            scripted_input(PlayerHandle::new(1), 0),
            clock.now(),
        )
        .unwrap_err();
    assert!(matches!(err, BastionError::InvalidRequest { .. }));
}

// ==========================================
// Network Health
// ==========================================

#[test]
fn interruption_is_reported_then_resumed() {
    let network = LoopbackNetwork::new();
    let mut clock = TestClock::new();
    let mut peers = two_peers(&network, &clock);
    let (a, b) = addrs();
    synchronize(&mut peers, &mut clock);

    network.cut_link(a, b);
    run_until(&mut peers, &mut clock, TICK, |peers| {
        peers[0].saw(|event| matches!(event, PeerEvent::NetworkInterrupted { addr, .. } if *addr == b))
    });
    let interrupted = peers[0].events.iter().find_map(|event| match event {
        PeerEvent::NetworkInterrupted {
            disconnect_timeout, ..
        } => Some(*disconnect_timeout),
        _ => None,
    });
    assert_eq!(interrupted, Some(Duration::from_millis(5000 - 750)));

    network.heal_link(a, b);
    run_until(&mut peers, &mut clock, TICK, |peers| {
        peers[0].saw(|event| matches!(event, PeerEvent::NetworkResumed { addr } if *addr == b))
    });
    assert!(!peers[0].saw(|event| matches!(event, PeerEvent::Disconnected { .. })));
}

#[test]
fn network_stats_count_traffic() {
    let network = LoopbackNetwork::new();
    let mut clock = TestClock::new();
    let mut peers = two_peers(&network, &clock);
    synchronize(&mut peers, &mut clock);
    play_frames(&mut peers, &mut clock, 10);
    // let the stats timer fire
    run_until(&mut peers, &mut clock, Duration::from_millis(100), |peers| {
        peers[0]
            .session
            .network_stats(PlayerHandle::new(1))
            .map_or(false, |stats| stats.packets_received > 0)
    });

    let stats = peers[0].session.network_stats(PlayerHandle::new(1)).unwrap();
    assert!(stats.packets_sent > 0);
    assert!(stats.bytes_sent >= stats.packets_sent * 28);
    assert!(matches!(
        peers[0].session.network_stats(PlayerHandle::new(0)),
        Err(BastionError::InvalidRequest { .. })
    ));
    assert!(network.delivered() > 0);
}
