//! Shared test utilities for integration tests.
//!
//! Sessions in these tests talk through a [`LoopbackNetwork`]: an in-memory
//! datagram switch that delivers instantly and can cut individual links.
//! Time is virtual; every helper takes the `Instant` to poll at, so timeouts
//! are reached by stepping a [`TestClock`] instead of sleeping.

#![allow(
    clippy::panic,
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::indexing_slicing
)]

use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;

use bastion_netcode::sessions::config::ConsistencyConfig;
use bastion_netcode::{
    BastionError, Frame, Message, NonBlockingSocket, PeerEvent, PeerSession, PlayerHandle,
    PlayerType, SessionConfig, SessionState,
};
use parking_lot::Mutex;
use web_time::{Duration, Instant};

use super::stubs::{scripted_input, SimulatorStub, StubConfig};

/// Sends crate logs to the test output when `BASTION_TEST_LOG` names a level.
///
/// `BASTION_TEST_LOG=debug cargo test -- --nocapture` shows handshakes and disconnects.
pub fn init_test_logging() {
    static INIT: std::sync::Once = std::sync::Once::new();
    INIT.call_once(|| {
        let Some(level) = std::env::var("BASTION_TEST_LOG")
            .ok()
            .and_then(|level| level.parse::<tracing::Level>().ok())
        else {
            return;
        };
        let subscriber = tracing_subscriber::FmtSubscriber::builder()
            .with_max_level(level)
            .with_test_writer()
            .finish();
        // another test harness may have installed one already
        let _ = tracing::subscriber::set_global_default(subscriber);
    });
}

/// Upper bound on polls while waiting for a condition.
pub const MAX_SYNC_ITERATIONS: usize = 400;

/// Virtual time between two polls.
pub const TICK: Duration = Duration::from_millis(16);

#[must_use]
pub fn test_addr(port: u16) -> SocketAddr {
    SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), port)
}

/// Session settings without checksum audits.
#[must_use]
pub fn quiet_config(num_players: usize) -> SessionConfig {
    SessionConfig {
        num_players,
        consistency: ConsistencyConfig::disabled(),
        ..SessionConfig::default()
    }
}

// ============================================================================
// Virtual Clock
// ============================================================================

#[derive(Debug, Clone, Copy)]
pub struct TestClock {
    now: Instant,
}

impl Default for TestClock {
    fn default() -> Self {
        Self::new()
    }
}

impl TestClock {
    #[must_use]
    pub fn new() -> Self {
        Self {
            now: Instant::now(),
        }
    }

    #[must_use]
    pub fn now(&self) -> Instant {
        self.now
    }

    pub fn advance(&mut self, by: Duration) -> Instant {
        self.now += by;
        self.now
    }
}

// ============================================================================
// Loopback Network
// ============================================================================

#[derive(Debug, Default)]
struct Switch {
    inboxes: BTreeMap<SocketAddr, VecDeque<(SocketAddr, Message)>>,
    /// Links that drop everything, stored with the smaller address first.
    cut: BTreeSet<(SocketAddr, SocketAddr)>,
    delivered: u64,
    dropped: u64,
}

fn link(a: SocketAddr, b: SocketAddr) -> (SocketAddr, SocketAddr) {
    if a <= b {
        (a, b)
    } else {
        (b, a)
    }
}

/// An in-memory datagram network shared by every socket created from it.
#[derive(Debug, Clone, Default)]
pub struct LoopbackNetwork {
    switch: Arc<Mutex<Switch>>,
}

impl LoopbackNetwork {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// A socket bound to `addr` on this network.
    #[must_use]
    pub fn socket(&self, addr: SocketAddr) -> LoopbackSocket {
        self.switch.lock().inboxes.entry(addr).or_default();
        LoopbackSocket {
            addr,
            switch: Arc::clone(&self.switch),
        }
    }

    /// Drops every datagram between `a` and `b`, both ways.
    pub fn cut_link(&self, a: SocketAddr, b: SocketAddr) {
        self.switch.lock().cut.insert(link(a, b));
    }

    /// Restores a link cut with [`cut_link`](Self::cut_link).
    #[allow(dead_code)]
    pub fn heal_link(&self, a: SocketAddr, b: SocketAddr) {
        self.switch.lock().cut.remove(&link(a, b));
    }

    /// Cuts every link touching `addr`.
    #[allow(dead_code)]
    pub fn isolate(&self, addr: SocketAddr) {
        let mut switch = self.switch.lock();
        let others: Vec<SocketAddr> = switch.inboxes.keys().copied().collect();
        for other in others.into_iter().filter(|other| *other != addr) {
            switch.cut.insert(link(addr, other));
        }
    }

    #[allow(dead_code)]
    #[must_use]
    pub fn delivered(&self) -> u64 {
        self.switch.lock().delivered
    }

    #[allow(dead_code)]
    #[must_use]
    pub fn dropped(&self) -> u64 {
        self.switch.lock().dropped
    }
}

/// One endpoint of a [`LoopbackNetwork`].
#[derive(Debug)]
pub struct LoopbackSocket {
    addr: SocketAddr,
    switch: Arc<Mutex<Switch>>,
}

impl NonBlockingSocket<SocketAddr> for LoopbackSocket {
    fn send_to(&mut self, msg: &Message, addr: &SocketAddr) {
        let mut switch = self.switch.lock();
        if switch.cut.contains(&link(self.addr, *addr)) {
            switch.dropped += 1;
            return;
        }
        match switch.inboxes.get_mut(addr) {
            Some(inbox) => {
                inbox.push_back((self.addr, msg.clone()));
                switch.delivered += 1;
            },
            None => switch.dropped += 1,
        }
    }

    fn receive_all_messages(&mut self) -> Vec<(SocketAddr, Message)> {
        self.switch
            .lock()
            .inboxes
            .get_mut(&self.addr)
            .map(|inbox| inbox.drain(..).collect())
            .unwrap_or_default()
    }
}

// ============================================================================
// Test Peers
// ============================================================================

/// A session together with the simulator and checksums it is polled with.
pub struct TestPeer {
    pub addr: SocketAddr,
    pub session: PeerSession<StubConfig>,
    pub sim: SimulatorStub,
    pub checksums: BTreeMap<Frame, u128>,
    /// Every event drained so far.
    pub events: Vec<PeerEvent<SocketAddr>>,
}

impl TestPeer {
    /// Creates and starts a session at `addr` with the given registrations.
    pub fn start(
        network: &LoopbackNetwork,
        addr: SocketAddr,
        config: SessionConfig,
        players: &[(usize, PlayerType<SocketAddr>)],
        now: Instant,
    ) -> Self {
        init_test_logging();
        let num_players = config.num_players;
        let mut session =
            PeerSession::<StubConfig>::new(config, Box::new(network.socket(addr))).unwrap();
        for (handle, player_type) in players {
            session
                .add_player(*player_type, PlayerHandle::new(*handle))
                .unwrap();
        }
        session.start(now).unwrap();
        Self {
            addr,
            session,
            sim: SimulatorStub::new(num_players),
            checksums: BTreeMap::new(),
            events: Vec::new(),
        }
    }

    pub fn poll(&mut self, now: Instant) {
        self.session.poll(&mut self.sim, &self.checksums, now);
        self.events.extend(self.session.events());
    }

    #[must_use]
    pub fn is_running(&self) -> bool {
        self.session.current_state() == SessionState::Running
    }

    /// Sends the scripted input for every local player at the simulator's
    /// current frame, then advances the simulator.
    pub fn send_next_frame(&mut self, now: Instant) -> Result<Frame, BastionError> {
        let frame = Frame::new(self.sim.frame);
        for handle in self.session.local_player_handles() {
            let input = scripted_input(handle, frame.as_i32());
            self.session.add_local_input(frame, handle, input, now)?;
            self.sim.record_local(handle, frame, input);
        }
        self.sim.advance();
        Ok(frame)
    }

    #[allow(dead_code)]
    pub fn take_events(&mut self) -> Vec<PeerEvent<SocketAddr>> {
        std::mem::take(&mut self.events)
    }

    #[allow(dead_code)]
    #[must_use]
    pub fn saw(&self, predicate: impl Fn(&PeerEvent<SocketAddr>) -> bool) -> bool {
        self.events.iter().any(predicate)
    }
}

/// Polls every peer once at `now`.
pub fn poll_all(peers: &mut [TestPeer], now: Instant) {
    for peer in peers.iter_mut() {
        peer.poll(now);
    }
}

/// Steps the clock and polls every peer until `done` holds.
///
/// Returns the number of iterations it took.
///
/// # Panics
///
/// If `done` does not hold within [`MAX_SYNC_ITERATIONS`] ticks.
pub fn run_until(
    peers: &mut [TestPeer],
    clock: &mut TestClock,
    step: Duration,
    done: impl Fn(&[TestPeer]) -> bool,
) -> usize {
    for iteration in 0..MAX_SYNC_ITERATIONS {
        if done(peers) {
            return iteration;
        }
        let now = clock.advance(step);
        poll_all(peers, now);
    }
    panic!(
        "condition not reached after {} iterations; states: {:?}",
        MAX_SYNC_ITERATIONS,
        peers
            .iter()
            .map(|peer| (peer.addr, peer.session.current_state()))
            .collect::<Vec<_>>()
    );
}

/// Polls until every peer is [`SessionState::Running`].
pub fn synchronize(peers: &mut [TestPeer], clock: &mut TestClock) -> usize {
    run_until(peers, clock, TICK, |peers| peers.iter().all(TestPeer::is_running))
}

/// Every peer sends `frames` scripted frames, one per tick, and the network
/// then settles for a few more ticks.
pub fn play_frames(peers: &mut [TestPeer], clock: &mut TestClock, frames: usize) {
    for _ in 0..frames {
        let now = clock.advance(TICK);
        for peer in peers.iter_mut() {
            if !peer.session.local_player_handles().is_empty() {
                peer.send_next_frame(now).unwrap();
            }
        }
        poll_all(peers, now);
    }
    settle(peers, clock);
}

/// Ticks without new inputs until acknowledgements and the gossiped
/// connect status have caught up. Longer than the running retry interval, so
/// every connection resends its newest status at least once.
pub fn settle(peers: &mut [TestPeer], clock: &mut TestClock) {
    for _ in 0..24 {
        let now = clock.advance(TICK);
        poll_all(peers, now);
    }
}
