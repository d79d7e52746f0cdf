//! Three peers, one player each, fully meshed.

#![allow(
    clippy::panic,
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::indexing_slicing
)]

use crate::common::{
    play_frames, poll_all, quiet_config, run_until, settle, synchronize, test_addr,
    LoopbackNetwork, TestClock, TestPeer, TICK,
};
use bastion_netcode::{Frame, PeerEvent, PlayerHandle, PlayerType};
use std::net::SocketAddr;

fn addrs() -> [SocketAddr; 3] {
    [test_addr(7100), test_addr(7101), test_addr(7102)]
}

fn mesh(network: &LoopbackNetwork, clock: &TestClock) -> Vec<TestPeer> {
    let addrs = addrs();
    (0..3)
        .map(|me| {
            let players: Vec<(usize, PlayerType<SocketAddr>)> = (0..3)
                .map(|handle| {
                    if handle == me {
                        (handle, PlayerType::Local)
                    } else {
                        (handle, PlayerType::Remote(addrs[handle]))
                    }
                })
                .collect();
            TestPeer::start(network, addrs[me], quiet_config(3), &players, clock.now())
        })
        .collect()
}

#[test]
fn every_peer_confirms_the_common_minimum() {
    let network = LoopbackNetwork::new();
    let mut clock = TestClock::new();
    let mut peers = mesh(&network, &clock);
    synchronize(&mut peers, &mut clock);

    play_frames(&mut peers, &mut clock, 10);

    for peer in &peers {
        assert_eq!(peer.session.confirmed_frame(), Frame::new(9));
        for handle in peer.session.remote_player_handles() {
            assert_eq!(peer.sim.remote_frames(handle), (0..10).collect::<Vec<_>>());
        }
    }
}

#[test]
fn lagging_player_holds_back_confirmation() {
    let network = LoopbackNetwork::new();
    let mut clock = TestClock::new();
    let mut peers = mesh(&network, &clock);
    synchronize(&mut peers, &mut clock);

    play_frames(&mut peers, &mut clock, 4);
    for _ in 0..6 {
        let now = clock.advance(TICK);
        peers[0].send_next_frame(now).unwrap();
        peers[1].send_next_frame(now).unwrap();
        poll_all(&mut peers, now);
    }
    settle(&mut peers, &mut clock);

    for peer in &peers {
        assert_eq!(peer.session.confirmed_frame(), Frame::new(3));
    }
}

#[test]
fn isolated_peer_is_dropped_and_the_rest_continue() {
    let network = LoopbackNetwork::new();
    let mut clock = TestClock::new();
    let mut peers = mesh(&network, &clock);
    let addrs = addrs();
    synchronize(&mut peers, &mut clock);
    play_frames(&mut peers, &mut clock, 5);

    network.isolate(addrs[2]);
    let dropped = PlayerHandle::new(2);
    let survivors_dropped_it = |peers: &[TestPeer]| {
        peers[..2]
            .iter()
            .all(|peer| peer.session.connect_status().is_disconnected(dropped))
    };
    // the disconnect timeout is five seconds; step faster than the default tick
    run_until(
        &mut peers,
        &mut clock,
        web_time::Duration::from_millis(50),
        survivors_dropped_it,
    );

    for peer in &peers[..2] {
        let status = peer.session.connect_status().get(dropped).unwrap();
        assert_eq!(status.last_frame, Frame::new(4));
        assert!(peer.saw(|event| matches!(
            event,
            PeerEvent::PlayerDisconnected { player, frame, .. }
                if *player == dropped && *frame == Frame::new(4)
        )));
        assert!(peer.saw(|event| matches!(event, PeerEvent::Disconnected { addr } if *addr == addrs[2])));
    }

    // the two survivors keep confirming without player 2
    let mut survivors: Vec<TestPeer> = peers.drain(..2).collect();
    play_frames(&mut survivors, &mut clock, 6);
    for peer in &survivors {
        assert_eq!(peer.session.confirmed_frame(), Frame::new(10));
    }
}
