//! Checksum audits between two running sessions.

#![allow(
    clippy::panic,
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::indexing_slicing
)]

use crate::common::{
    play_frames, run_until, synchronize, test_addr, LoopbackNetwork, TestClock, TestPeer,
};
use bastion_netcode::sessions::config::ConsistencyConfig;
use bastion_netcode::{Frame, PeerEvent, PlayerHandle, PlayerType, SessionConfig};
use std::net::SocketAddr;
use web_time::Duration;

const STEP: Duration = Duration::from_millis(50);

fn addrs() -> (SocketAddr, SocketAddr) {
    (test_addr(7400), test_addr(7401))
}

fn auditing_config() -> SessionConfig {
    SessionConfig {
        consistency: ConsistencyConfig {
            interval: Duration::from_millis(500),
            frame_offset: 2,
            ..ConsistencyConfig::default()
        },
        ..SessionConfig::default()
    }
}

/// Two running peers whose checksum stores hold `checksum(frame)` for the first 30 frames.
fn audited_pair(
    network: &LoopbackNetwork,
    clock: &mut TestClock,
    checksum_a: fn(i32) -> u128,
    checksum_b: fn(i32) -> u128,
) -> Vec<TestPeer> {
    let (a, b) = addrs();
    let mut peers = vec![
        TestPeer::start(
            network,
            a,
            auditing_config(),
            &[(0, PlayerType::Local), (1, PlayerType::Remote(b))],
            clock.now(),
        ),
        TestPeer::start(
            network,
            b,
            auditing_config(),
            &[(0, PlayerType::Remote(a)), (1, PlayerType::Local)],
            clock.now(),
        ),
    ];
    for frame in 0..30 {
        peers[0].checksums.insert(Frame::new(frame), checksum_a(frame));
        peers[1].checksums.insert(Frame::new(frame), checksum_b(frame));
    }
    synchronize(&mut peers, clock);
    peers
}

#[test]
fn matching_states_pass_the_audit() {
    let network = LoopbackNetwork::new();
    let mut clock = TestClock::new();
    let mut peers = audited_pair(&network, &mut clock, |frame| frame as u128 * 7, |frame| {
        frame as u128 * 7
    });
    play_frames(&mut peers, &mut clock, 10);

    run_until(&mut peers, &mut clock, STEP, |peers| {
        peers[0]
            .session
            .network_stats(PlayerHandle::new(1))
            .map_or(false, |stats| stats.checksums_match.is_some())
    });

    let stats = peers[0].session.network_stats(PlayerHandle::new(1)).unwrap();
    assert_eq!(stats.checksums_match, Some(true));
    let audited = stats.last_compared_frame.unwrap();
    assert!(audited.is_valid() && audited <= Frame::new(7), "{}", audited);
    assert!(!peers[0].saw(|event| matches!(event, PeerEvent::ConsistencyFailure { .. })));
}

#[test]
fn diverging_states_fail_the_audit_and_disconnect() {
    let network = LoopbackNetwork::new();
    let mut clock = TestClock::new();
    let (_, b) = addrs();
    let mut peers = audited_pair(&network, &mut clock, |frame| frame as u128, |frame| {
        frame as u128 + 1
    });
    play_frames(&mut peers, &mut clock, 10);

    run_until(&mut peers, &mut clock, STEP, |peers| {
        peers[0].saw(|event| matches!(event, PeerEvent::ConsistencyFailure { .. }))
    });

    let failure = peers[0]
        .events
        .iter()
        .find_map(|event| match event {
            PeerEvent::ConsistencyFailure {
                addr,
                frame,
                local_checksum,
                remote_checksum,
            } => Some((*addr, *frame, *local_checksum, *remote_checksum)),
            _ => None,
        })
        .unwrap();
    let (addr, frame, local, remote) = failure;
    assert_eq!(addr, b);
    assert_eq!(local, frame.as_i32() as u128);
    assert_eq!(remote, local + 1);
    assert!(peers[0].saw(|event| matches!(event, PeerEvent::Disconnected { addr } if *addr == b)));
    assert!(peers[0]
        .session
        .connect_status()
        .is_disconnected(PlayerHandle::new(1)));
}
