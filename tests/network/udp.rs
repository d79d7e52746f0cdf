//! Two sessions over [`UdpNonBlockingSocket`]s on 127.0.0.1.

#![allow(
    clippy::panic,
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::indexing_slicing
)]

use crate::common::stubs::{scripted_input, SimulatorStub, StubConfig};
use crate::common::{quiet_config, test_addr};
use bastion_netcode::{
    Frame, PeerEvent, PeerSession, PlayerHandle, PlayerType, SessionState, UdpNonBlockingSocket,
};
use serial_test::serial;
use std::collections::BTreeMap;
use std::net::SocketAddr;
use web_time::{Duration, Instant};

/// Real-time polls before a test gives up.
const MAX_POLLS: usize = 3000;
const POLL_INTERVAL: Duration = Duration::from_millis(2);

struct UdpPeer {
    session: PeerSession<StubConfig>,
    sim: SimulatorStub,
    events: Vec<PeerEvent<SocketAddr>>,
}

impl UdpPeer {
    fn poll(&mut self) {
        self.session
            .poll(&mut self.sim, &BTreeMap::<Frame, u128>::new(), Instant::now());
        self.events.extend(self.session.events());
    }
}

/// Two sessions on OS-assigned ports, player 0 local to the first.
fn bound_pair() -> [UdpPeer; 2] {
    let socket_a = UdpNonBlockingSocket::bind_to_port(0).unwrap();
    let socket_b = UdpNonBlockingSocket::bind_to_port(0).unwrap();
    let addr_a = test_addr(socket_a.local_addr().unwrap().port());
    let addr_b = test_addr(socket_b.local_addr().unwrap().port());

    let mut session_a = PeerSession::<StubConfig>::new(quiet_config(2), Box::new(socket_a)).unwrap();
    session_a.add_player(PlayerType::Local, PlayerHandle::new(0)).unwrap();
    session_a
        .add_player(PlayerType::Remote(addr_b), PlayerHandle::new(1))
        .unwrap();

    let mut session_b = PeerSession::<StubConfig>::new(quiet_config(2), Box::new(socket_b)).unwrap();
    session_b
        .add_player(PlayerType::Remote(addr_a), PlayerHandle::new(0))
        .unwrap();
    session_b.add_player(PlayerType::Local, PlayerHandle::new(1)).unwrap();

    let now = Instant::now();
    session_a.start(now).unwrap();
    session_b.start(now).unwrap();
    [session_a, session_b].map(|session| UdpPeer {
        session,
        sim: SimulatorStub::new(2),
        events: Vec::new(),
    })
}

fn poll_until(peers: &mut [UdpPeer; 2], done: impl Fn(&[UdpPeer; 2]) -> bool) {
    for _ in 0..MAX_POLLS {
        if done(peers) {
            return;
        }
        for peer in peers.iter_mut() {
            peer.poll();
        }
        std::thread::sleep(POLL_INTERVAL);
    }
    panic!("condition not reached over UDP");
}

fn both_running(peers: &[UdpPeer; 2]) -> bool {
    peers
        .iter()
        .all(|peer| peer.session.current_state() == SessionState::Running)
}

#[test]
#[serial]
fn sessions_synchronize_over_udp() {
    let mut peers = bound_pair();
    poll_until(&mut peers, both_running);

    for peer in &peers {
        assert!(peer
            .events
            .iter()
            .any(|event| matches!(event, PeerEvent::Synchronized { .. })));
    }
}

#[test]
#[serial]
fn inputs_cross_over_udp() {
    let mut peers = bound_pair();
    poll_until(&mut peers, both_running);

    for frame in 0..8 {
        for (index, peer) in peers.iter_mut().enumerate() {
            let handle = PlayerHandle::new(index);
            let input = scripted_input(handle, frame);
            peer.session
                .add_local_input(Frame::new(frame), handle, input, Instant::now())
                .unwrap();
            peer.sim.record_local(handle, Frame::new(frame), input);
            peer.sim.advance();
        }
        for peer in peers.iter_mut() {
            peer.poll();
        }
    }
    poll_until(&mut peers, |peers| {
        peers[0].sim.remote_frames(PlayerHandle::new(1)).len() == 8
            && peers[1].sim.remote_frames(PlayerHandle::new(0)).len() == 8
    });

    let expected: Vec<i32> = (0..8).collect();
    assert_eq!(peers[0].sim.remote_frames(PlayerHandle::new(1)), expected);
    assert_eq!(peers[1].sim.remote_frames(PlayerHandle::new(0)), expected);
    assert_eq!(
        peers[1].sim.input_of(PlayerHandle::new(0), Frame::new(5)),
        Some(scripted_input(PlayerHandle::new(0), 5))
    );
    let stats = peers[0].session.network_stats(PlayerHandle::new(1)).unwrap();
    assert!(stats.bytes_sent > 0);
}
