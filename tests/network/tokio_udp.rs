//! Two sessions over [`TokioUdpSocket`]s with background receive loops and
//! outbound pump tasks.

#![allow(
    clippy::panic,
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::indexing_slicing
)]

use crate::common::stubs::{scripted_input, SimulatorStub, StubConfig};
use crate::common::{quiet_config, test_addr};
use bastion_netcode::network::cancel::CancellationToken;
use bastion_netcode::{
    Frame, PeerSession, PlayerHandle, PlayerType, SessionState, TokioUdpSocket,
};
use serial_test::serial;
use std::collections::BTreeMap;
use web_time::{Duration, Instant};

const MAX_POLLS: usize = 3000;

struct TokioPeer {
    session: PeerSession<StubConfig>,
    sim: SimulatorStub,
}

impl TokioPeer {
    fn poll(&mut self) {
        self.session
            .poll(&mut self.sim, &BTreeMap::<Frame, u128>::new(), Instant::now());
        let _ = self.session.events().count();
    }
}

async fn spawned_pair(cancel: &CancellationToken) -> [TokioPeer; 2] {
    let mut socket_a = TokioUdpSocket::bind_to_port(0).await.unwrap();
    let mut socket_b = TokioUdpSocket::bind_to_port(0).await.unwrap();
    let addr_a = test_addr(socket_a.local_addr().unwrap().port());
    let addr_b = test_addr(socket_b.local_addr().unwrap().port());
    socket_a.spawn_receive_loop(cancel.clone());
    socket_b.spawn_receive_loop(cancel.clone());
    let shared_a = socket_a.socket();
    let shared_b = socket_b.socket();

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
    assert_eq!(session_a.spawn_outbound_pumps(shared_a).len(), 1);
    assert_eq!(session_b.spawn_outbound_pumps(shared_b).len(), 1);

    [session_a, session_b].map(|session| TokioPeer {
        session,
        sim: SimulatorStub::new(2),
    })
}

async fn poll_until(peers: &mut [TokioPeer; 2], done: impl Fn(&[TokioPeer; 2]) -> bool) {
    for _ in 0..MAX_POLLS {
        if done(peers) {
            return;
        }
        for peer in peers.iter_mut() {
            peer.poll();
        }
        tokio::time::sleep(Duration::from_millis(2)).await;
    }
    panic!("condition not reached over tokio sockets");
}

#[tokio::test]
#[serial]
async fn pumped_sessions_exchange_inputs() {
    let cancel = CancellationToken::new();
    let mut peers = spawned_pair(&cancel).await;
    poll_until(&mut peers, |peers| {
        peers
            .iter()
            .all(|peer| peer.session.current_state() == SessionState::Running)
    })
    .await;

    for frame in 0..5 {
        for (index, peer) in peers.iter_mut().enumerate() {
            let handle = PlayerHandle::new(index);
            let input = scripted_input(handle, frame);
            peer.session
                .add_local_input(Frame::new(frame), handle, input, Instant::now())
                .unwrap();
            peer.sim.record_local(handle, Frame::new(frame), input);
            peer.sim.advance();
        }
    }
    poll_until(&mut peers, |peers| {
        peers[0].session.confirmed_frame() == Frame::new(4)
            && peers[1].session.confirmed_frame() == Frame::new(4)
    })
    .await;

    assert_eq!(
        peers[0].sim.input_of(PlayerHandle::new(1), Frame::new(3)),
        Some(scripted_input(PlayerHandle::new(1), 3))
    );
    for peer in &peers {
        assert!(peer.session.check_background_errors().is_ok());
    }
    cancel.cancel();
}
