//! Spectator integration tests.
//!
//! A viewer is a session with no local players whose every queue is hosted by
//! the same address: the host forwards confirmed frames of all players in one
//! stream.

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
use bastion_netcode::{Frame, PeerEvent, PlayerHandle, PlayerType};
use std::net::SocketAddr;

const HOST: usize = 0;
const GUEST: usize = 1;
const VIEWER: usize = 2;

fn addrs() -> [SocketAddr; 3] {
    [test_addr(7200), test_addr(7201), test_addr(7202)]
}

fn spectator_handle() -> PlayerHandle {
    PlayerHandle::new(2)
}

/// Host and guest play; the viewer watches through the host.
fn host_guest_viewer(network: &LoopbackNetwork, clock: &TestClock) -> Vec<TestPeer> {
    let [host, guest, viewer] = addrs();
    vec![
        TestPeer::start(
            network,
            host,
            quiet_config(2),
            &[
                (0, PlayerType::Local),
                (1, PlayerType::Remote(guest)),
                (2, PlayerType::Spectator(viewer)),
            ],
            clock.now(),
        ),
        TestPeer::start(
            network,
            guest,
            quiet_config(2),
            &[(0, PlayerType::Remote(host)), (1, PlayerType::Local)],
            clock.now(),
        ),
        TestPeer::start(
            network,
            viewer,
            quiet_config(2),
            &[(0, PlayerType::Remote(host)), (1, PlayerType::Remote(host))],
            clock.now(),
        ),
    ]
}

fn viewer_synchronized(peers: &[TestPeer]) -> bool {
    peers.iter().all(TestPeer::is_running)
        && peers[HOST]
            .session
            .connection(spectator_handle())
            .map_or(false, |connection| connection.is_synchronized())
}

fn assert_viewer_saw_frames(viewer: &TestPeer, frames: i32) {
    for handle in [PlayerHandle::new(0), PlayerHandle::new(1)] {
        assert_eq!(
            viewer.sim.remote_frames(handle),
            (0..frames).collect::<Vec<_>>(),
            "frames for player {}",
            handle
        );
        for frame in 0..frames {
            assert_eq!(
                viewer.sim.input_of(handle, Frame::new(frame)),
                Some(scripted_input(handle, frame))
            );
        }
    }
}

#[test]
fn viewer_receives_every_confirmed_frame() {
    let network = LoopbackNetwork::new();
    let mut clock = TestClock::new();
    let mut peers = host_guest_viewer(&network, &clock);
    run_until(&mut peers, &mut clock, TICK, viewer_synchronized);

    assert_eq!(peers[HOST].session.num_spectators(), 1);
    assert!(peers[VIEWER].session.local_player_handles().is_empty());

    play_frames(&mut peers, &mut clock, 10);

    assert_viewer_saw_frames(&peers[VIEWER], 10);
    assert_eq!(peers[VIEWER].session.confirmed_frame(), Frame::new(9));
    // the guest never hears of the viewer
    assert_eq!(peers[GUEST].session.num_spectators(), 0);
    assert!(!peers[GUEST].saw(|event| matches!(event, PeerEvent::Connected { addr } if *addr == addrs()[VIEWER])));
}

#[test]
fn late_viewer_catches_up_from_frame_zero() {
    let network = LoopbackNetwork::new();
    let mut clock = TestClock::new();
    let [host, _, viewer] = addrs();
    let mut peers = host_guest_viewer(&network, &clock);
    network.cut_link(host, viewer);

    synchronize(&mut peers[..2], &mut clock);
    play_frames(&mut peers, &mut clock, 6);
    assert!(peers[VIEWER].sim.remote.is_empty());

    network.heal_link(host, viewer);
    run_until(&mut peers, &mut clock, TICK, viewer_synchronized);
    settle(&mut peers, &mut clock);

    assert_viewer_saw_frames(&peers[VIEWER], 6);
    assert_eq!(peers[VIEWER].session.confirmed_frame(), Frame::new(5));
}

#[test]
fn dropped_viewer_times_out_on_its_side() {
    let network = LoopbackNetwork::new();
    let mut clock = TestClock::new();
    let [host, _, _] = addrs();
    let mut peers = host_guest_viewer(&network, &clock);
    run_until(&mut peers, &mut clock, TICK, viewer_synchronized);
    play_frames(&mut peers, &mut clock, 3);

    {
        let host_peer = &mut peers[HOST];
        let now = clock.now();
        host_peer
            .session
            .disconnect_player(spectator_handle(), &mut host_peer.sim, now)
            .unwrap();
    }

    run_until(
        &mut peers,
        &mut clock,
        web_time::Duration::from_millis(50),
        |peers| peers[VIEWER].saw(|event| matches!(event, PeerEvent::Disconnected { .. })),
    );
    assert!(peers[VIEWER].saw(|event| matches!(event, PeerEvent::Disconnected { addr } if *addr == host)));
    // the players themselves are unaffected
    assert!(!peers[GUEST].saw(|event| matches!(event, PeerEvent::Disconnected { .. })));
    assert!(peers[HOST].is_running());
}
