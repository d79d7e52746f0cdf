//! Disconnect handling across two sessions.

#![allow(
    clippy::panic,
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::indexing_slicing
)]

use crate::common::{
    play_frames, poll_all, quiet_config, run_until, synchronize, test_addr, LoopbackNetwork,
    TestClock, TestPeer, TICK,
};
use bastion_netcode::{BastionError, Frame, PeerEvent, PlayerHandle, PlayerType};
use std::net::SocketAddr;
use web_time::Duration;

/// Polling step for tests that wait out the five second timeout.
const SLOW_TICK: Duration = Duration::from_millis(50);

fn addrs() -> (SocketAddr, SocketAddr) {
    (test_addr(7300), test_addr(7301))
}

fn running_pair(network: &LoopbackNetwork, clock: &mut TestClock) -> Vec<TestPeer> {
    let (a, b) = addrs();
    let mut peers = vec![
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
    ];
    synchronize(&mut peers, clock);
    peers
}

fn position(
    events: &[PeerEvent<SocketAddr>],
    predicate: impl Fn(&PeerEvent<SocketAddr>) -> bool,
) -> usize {
    events
        .iter()
        .position(|event| predicate(event))
        .expect("event not found")
}

fn disconnect(peer: &mut TestPeer, handle: usize, now: web_time::Instant) -> Result<(), BastionError> {
    peer.session
        .disconnect_player(PlayerHandle::new(handle), &mut peer.sim, now)
}

#[test]
fn explicit_disconnect_rolls_back_and_reports() {
    let network = LoopbackNetwork::new();
    let mut clock = TestClock::new();
    let mut peers = running_pair(&network, &mut clock);
    play_frames(&mut peers, &mut clock, 5);

    disconnect(&mut peers[0], 1, clock.now()).unwrap();

    let status = peers[0]
        .session
        .connect_status()
        .get(PlayerHandle::new(1))
        .unwrap();
    assert!(status.disconnected);
    assert_eq!(status.last_frame, Frame::new(4));
    // the stub already stands on frame 5
    assert_eq!(peers[0].sim.adjusted, vec![Frame::new(4)]);
    let peer = &mut peers[0];
    peer.events.extend(peer.session.events());
    assert!(peer.saw(|event| matches!(
        event,
        PeerEvent::PlayerDisconnected { player, frame, .. }
            if *player == PlayerHandle::new(1) && *frame == Frame::new(4)
    )));
}

#[test]
fn disconnecting_twice_fails() {
    let network = LoopbackNetwork::new();
    let mut clock = TestClock::new();
    let mut peers = running_pair(&network, &mut clock);

    disconnect(&mut peers[0], 1, clock.now()).unwrap();
    assert!(matches!(
        disconnect(&mut peers[0], 1, clock.now()),
        Err(BastionError::InvalidRequest { .. })
    ));
    assert!(matches!(
        disconnect(&mut peers[0], 0, clock.now()),
        Err(BastionError::InvalidRequest { .. })
    ));
    assert!(matches!(
        disconnect(&mut peers[0], 9, clock.now()),
        Err(BastionError::InvalidPlayerHandle { .. })
    ));
}

#[test]
fn remote_side_learns_of_the_disconnect() {
    let network = LoopbackNetwork::new();
    let mut clock = TestClock::new();
    let (a, _) = addrs();
    let mut peers = running_pair(&network, &mut clock);
    play_frames(&mut peers, &mut clock, 5);

    disconnect(&mut peers[0], 1, clock.now()).unwrap();
    run_until(&mut peers, &mut clock, SLOW_TICK, |peers| {
        peers[1].saw(|event| matches!(event, PeerEvent::Disconnected { .. }))
    });

    assert!(peers[1].saw(|event| matches!(event, PeerEvent::Disconnected { addr } if *addr == a)));
    assert!(peers[1]
        .session
        .connect_status()
        .is_disconnected(PlayerHandle::new(0)));
}

#[test]
fn survivor_confirms_alone_after_the_disconnect() {
    let network = LoopbackNetwork::new();
    let mut clock = TestClock::new();
    let mut peers = running_pair(&network, &mut clock);
    play_frames(&mut peers, &mut clock, 5);
    disconnect(&mut peers[0], 1, clock.now()).unwrap();

    let mut survivor: Vec<TestPeer> = peers.drain(..1).collect();
    for _ in 0..4 {
        let now = clock.advance(TICK);
        survivor[0].send_next_frame(now).unwrap();
        poll_all(&mut survivor, now);
    }
    assert_eq!(survivor[0].session.confirmed_frame(), Frame::new(8));
    assert_eq!(survivor[0].sim.last_confirmed, Frame::new(8));
}

#[test]
fn silence_times_out_the_peer() {
    let network = LoopbackNetwork::new();
    let mut clock = TestClock::new();
    let (a, b) = addrs();
    let mut peers = running_pair(&network, &mut clock);
    play_frames(&mut peers, &mut clock, 3);

    network.cut_link(a, b);
    run_until(&mut peers, &mut clock, SLOW_TICK, |peers| {
        peers[0].saw(|event| matches!(event, PeerEvent::Disconnected { .. }))
    });

    let events = &peers[0].events;
    let interrupted = position(events, |event| {
        matches!(event, PeerEvent::NetworkInterrupted { addr, .. } if *addr == b)
    });
    let disconnected = position(events, |event| {
        matches!(event, PeerEvent::Disconnected { addr } if *addr == b)
    });
    let player = position(events, |event| {
        matches!(event, PeerEvent::PlayerDisconnected { player, frame, .. }
            if *player == PlayerHandle::new(1) && *frame == Frame::new(2))
    });
    assert!(interrupted < player);
    assert!(player < disconnected, "the queue is dropped while handling the disconnect");
}
