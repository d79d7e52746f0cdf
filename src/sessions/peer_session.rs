//! The session that ties peer connections, the socket and the consensus together.
//!
//! A [`PeerSession`] owns one socket and one [`PeerConnection`] per remote
//! address. Each tick it receives datagrams, routes them to their connection,
//! runs every connection's timers, forwards remote inputs to the
//! [`RollbackSimulator`], computes the minimum confirmed frame and finally
//! flushes the outbound queues.
//!
//! The simulator and the checksum store are passed into every call instead of
//! being owned, so the session never holds game state.

use std::collections::vec_deque::Drain;
use std::collections::{BTreeMap, VecDeque};
use std::sync::Arc;

use tracing::{debug, info, trace};
use web_time::Instant;

use crate::error::BastionError;
use crate::network::codec;
use crate::network::compression::MAX_INPUT_BYTES;
use crate::network::connect_status::ConnectionsState;
use crate::network::network_stats::NetworkStats;
use crate::network::protocol::{InputBytes, PeerConnection, ProtocolEvent};
use crate::network::pump::TaskErrors;
use crate::report_violation_to;
use crate::sessions::config::SessionConfig;
use crate::sessions::consensus::{self, EndpointReport};
use crate::sessions::player_registry::PlayerRegistry;
use crate::telemetry::{ViolationKind, ViolationObserver, ViolationSeverity};
use crate::{
    ChecksumStore, Config, Frame, NonBlockingSocket, PeerEvent, PlayerHandle, PlayerType,
    RollbackSimulator, SessionState,
};

/// Events beyond this are dropped, oldest first.
const MAX_EVENT_QUEUE_SIZE: usize = 100;

/// Mixes the configured seed so every connection draws a different magic number.
const SEED_STRIDE: u64 = 0x9E37_79B9_7F4A_7C15;

/// Which side of the registry a connection event came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Role {
    Player,
    Spectator,
}

/// A peer-to-peer session: local players, remote players and spectators.
///
/// Players are registered with [`add_player`](Self::add_player) and the
/// handshakes begin with [`start`](Self::start). From then on the host calls
/// [`add_local_input`](Self::add_local_input) once per local player and frame,
/// and [`poll`](Self::poll) once per tick.
pub struct PeerSession<T>
where
    T: Config,
{
    config: SessionConfig,
    input_size: usize,
    socket: Box<dyn NonBlockingSocket<T::Address>>,
    registry: PlayerRegistry<T>,
    started: bool,

    local_connect_status: ConnectionsState,
    /// Inputs collected for `local_input_frame`, sent once every local player has one.
    local_inputs: BTreeMap<PlayerHandle, T::Input>,
    local_input_frame: Frame,

    next_spectator_frame: Frame,
    last_confirmed_frame: Frame,

    events: VecDeque<PeerEvent<T::Address>>,
    observer: Option<Arc<dyn ViolationObserver>>,
    task_errors: TaskErrors,
}

impl<T: Config> std::fmt::Debug for PeerSession<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PeerSession")
            .field("num_players", &self.config.num_players)
            .field("input_size", &self.input_size)
            .field("registry", &self.registry)
            .field("started", &self.started)
            .field("local_connect_status", &self.local_connect_status)
            .field("last_confirmed_frame", &self.last_confirmed_frame)
            .finish_non_exhaustive()
    }
}

impl<T: Config> PeerSession<T> {
    /// Creates a session talking through `socket`.
    ///
    /// # Errors
    ///
    /// - Any [`SessionConfig::validate`] failure.
    /// - [`BastionError::SerializationError`] if `T::Input` can't be serialized.
    /// - [`BastionError::InputSizeOutOfRange`] if it serializes to nothing or
    ///   to more than the delta codec supports.
    pub fn new(
        config: SessionConfig,
        socket: Box<dyn NonBlockingSocket<T::Address>>,
    ) -> Result<Self, BastionError> {
        config.validate()?;
        let input_size = codec::input_size::<T::Input>(config.protocol.endianness).map_err(|err| {
            BastionError::SerializationError {
                context: format!("measuring the input size: {}", err),
            }
        })?;
        if input_size == 0 || input_size > MAX_INPUT_BYTES {
            return Err(BastionError::InputSizeOutOfRange {
                size: input_size,
                max: MAX_INPUT_BYTES,
            });
        }

        Ok(Self {
            input_size,
            socket,
            registry: PlayerRegistry::new(),
            started: false,
            local_connect_status: ConnectionsState::new(config.num_players),
            local_inputs: BTreeMap::new(),
            local_input_frame: Frame::NULL,
            next_spectator_frame: Frame::new(0),
            last_confirmed_frame: Frame::NULL,
            events: VecDeque::new(),
            observer: None,
            task_errors: TaskErrors::new(),
            config,
        })
    }

    /// Routes protocol violations to `observer` in addition to the log.
    pub fn with_violation_observer(mut self, observer: Arc<dyn ViolationObserver>) -> Self {
        self.observer = Some(observer);
        self
    }

    /// Registers a player or spectator. Only allowed before [`start`](Self::start).
    ///
    /// # Errors
    ///
    /// [`BastionError::InvalidRequest`] after `start`, plus everything
    /// [`PlayerRegistry::register`] rejects.
    pub fn add_player(
        &mut self,
        player_type: PlayerType<T::Address>,
        handle: PlayerHandle,
    ) -> Result<(), BastionError> {
        if self.started {
            return Err(BastionError::InvalidRequest {
                info: "players must be added before the session starts".to_owned(),
            });
        }
        self.registry
            .register(handle, player_type, self.config.num_players)
    }

    /// Creates a connection per remote address and starts every handshake.
    ///
    /// # Errors
    ///
    /// [`BastionError::InvalidRequest`] if the session already started or a
    /// player queue was never registered, and any connection construction
    /// error.
    pub fn start(&mut self, now: Instant) -> Result<(), BastionError> {
        if self.started {
            return Err(BastionError::InvalidRequest {
                info: "the session already started".to_owned(),
            });
        }
        if let Some(missing) = (0..self.config.num_players)
            .map(PlayerHandle::new)
            .find(|handle| !self.registry.handles.contains_key(handle))
        {
            return Err(BastionError::InvalidRequest {
                info: format!("player {} was never added", missing),
            });
        }

        let num_players = self.config.num_players;
        let num_local = self.registry.num_local();
        let mut index = 0_u64;

        for (addr, handles) in self.registry.remote_hosts() {
            index += 1;
            let mut connection = PeerConnection::new(
                addr.clone(),
                handles,
                num_players,
                self.input_size,
                self.input_size * num_local,
                &self.config,
                self.connection_seed(index),
                self.observer.clone(),
                now,
            )?;
            connection.synchronize(now)?;
            self.registry.remotes.insert(addr, connection);
        }

        for addr in self.registry.spectator_addresses() {
            index += 1;
            // spectators receive every queue and send nothing
            let mut connection = PeerConnection::new(
                addr.clone(),
                Vec::new(),
                num_players,
                self.input_size,
                self.input_size * num_players,
                &self.config,
                self.connection_seed(index),
                self.observer.clone(),
                now,
            )?;
            connection.synchronize(now)?;
            self.registry.spectators.insert(addr, connection);
        }

        self.started = true;
        info!(
            num_players,
            num_local,
            remotes = self.registry.remotes.len(),
            spectators = self.registry.spectators.len(),
            "session started"
        );
        Ok(())
    }

    fn connection_seed(&self, index: u64) -> Option<u64> {
        self.config
            .protocol
            .protocol_rng_seed
            .map(|seed| seed ^ index.wrapping_mul(SEED_STRIDE))
    }

    // =========================================================================
    // Queries
    // =========================================================================

    /// [`SessionState::Running`] once every remote player finished its handshake.
    ///
    /// Peers that failed or disconnected count as finished.
    #[must_use]
    pub fn current_state(&self) -> SessionState {
        let synchronized = self.started
            && self
                .registry
                .remotes
                .values()
                .all(PeerConnection::is_synchronized);
        if synchronized {
            SessionState::Running
        } else {
            SessionState::Synchronizing
        }
    }

    /// Number of player queues.
    #[must_use]
    pub fn num_players(&self) -> usize {
        self.config.num_players
    }

    /// Number of registered spectators.
    #[must_use]
    pub fn num_spectators(&self) -> usize {
        self.registry.num_spectators()
    }

    /// Serialized size of one player's input.
    #[must_use]
    pub fn input_size(&self) -> usize {
        self.input_size
    }

    /// Handles of the local players.
    #[must_use]
    pub fn local_player_handles(&self) -> Vec<PlayerHandle> {
        self.registry.local_player_handles()
    }

    /// Handles of the remote players.
    #[must_use]
    pub fn remote_player_handles(&self) -> Vec<PlayerHandle> {
        self.registry.remote_player_handles()
    }

    /// Handles of the spectators.
    #[must_use]
    pub fn spectator_handles(&self) -> Vec<PlayerHandle> {
        self.registry.spectator_handles()
    }

    /// The minimum frame every connected queue confirmed at the last poll.
    #[must_use]
    pub fn confirmed_frame(&self) -> Frame {
        self.last_confirmed_frame
    }

    /// The session's connect-status table, as gossiped to peers.
    #[must_use]
    pub fn connect_status(&self) -> &ConnectionsState {
        &self.local_connect_status
    }

    /// The connection serving `handle`, if it is remote and the session started.
    #[must_use]
    pub fn connection(&self, handle: PlayerHandle) -> Option<&PeerConnection<T>> {
        self.registry.connection(handle)
    }

    /// The violation observer, if one was set.
    #[must_use]
    pub fn violation_observer(&self) -> Option<&Arc<dyn ViolationObserver>> {
        self.observer.as_ref()
    }

    /// Returns all events that happened since last queried for events. If the
    /// number of stored events exceeds `MAX_EVENT_QUEUE_SIZE`, the oldest
    /// events will be discarded.
    pub fn events(&mut self) -> Drain<'_, PeerEvent<T::Address>> {
        self.events.drain(..)
    }

    /// Network statistics for the connection serving `handle`.
    ///
    /// # Errors
    ///
    /// - [`BastionError::InvalidPlayerHandle`] for an unknown handle.
    /// - [`BastionError::InvalidRequest`] for a local player.
    /// - [`BastionError::NotSynchronized`] before the session started or the
    ///   handshake finished.
    pub fn network_stats(&self, handle: PlayerHandle) -> Result<NetworkStats, BastionError> {
        match self.registry.handles.get(&handle) {
            None => Err(BastionError::InvalidPlayerHandle {
                handle,
                num_players: self.config.num_players,
            }),
            Some(PlayerType::Local) => Err(BastionError::InvalidRequest {
                info: format!("player {} is local and has no network stats", handle),
            }),
            Some(_) => self
                .registry
                .connection(handle)
                .ok_or(BastionError::NotSynchronized)?
                .network_stats(),
        }
    }

    /// Frames the local simulation should wait so slower peers can catch up.
    ///
    /// The largest recommendation across running player connections.
    #[must_use]
    pub fn recommend_frame_delay(&self) -> u32 {
        self.registry
            .remotes
            .values()
            .filter(|connection| connection.is_running())
            .map(PeerConnection::recommend_frame_delay)
            .max()
            .unwrap_or(0)
    }

    /// Removes and returns failures reported by detached background tasks.
    ///
    /// # Errors
    ///
    /// The first failure, with every other one folded into its context.
    pub fn check_background_errors(&self) -> Result<(), BastionError> {
        let mut errors = self.task_errors.take().into_iter();
        let Some(first) = errors.next() else {
            return Ok(());
        };
        let rest: Vec<String> = errors.map(|err| err.to_string()).collect();
        if rest.is_empty() {
            return Err(first);
        }
        match first {
            BastionError::BackgroundTask { peer, context } => Err(BastionError::BackgroundTask {
                peer,
                context: format!("{} (and {} more: {})", context, rest.len(), rest.join("; ")),
            }),
            other => Err(other),
        }
    }

    /// The sink detached tasks report their failures to.
    #[must_use]
    pub fn task_errors(&self) -> TaskErrors {
        self.task_errors.clone()
    }

    // =========================================================================
    // Input
    // =========================================================================

    /// Records a local player's input for `frame`.
    ///
    /// Once every local player has an input for the frame, the combined frame
    /// is queued on every running player connection and the local queues'
    /// confirmed frame advances. Adding the same player twice for one frame
    /// overwrites the earlier input.
    ///
    /// # Errors
    ///
    /// - [`BastionError::NotSynchronized`] until every handshake finished.
    /// - [`BastionError::InvalidPlayerHandle`] / [`BastionError::InvalidRequest`]
    ///   if `handle` is not a local player.
    /// - [`BastionError::InvalidFrame`] for a null frame, a frame already sent,
    ///   or a frame other than the one being collected.
    /// - [`BastionError::InvalidRequest`] if a connection can't take the frame
    ///   right now (its pending queue is full); retry on a later tick.
    /// - [`BastionError::SerializationError`] if an input fails to serialize.
    pub fn add_local_input(
        &mut self,
        frame: Frame,
        handle: PlayerHandle,
        input: T::Input,
        now: Instant,
    ) -> Result<(), BastionError> {
        if self.current_state() != SessionState::Running {
            return Err(BastionError::NotSynchronized);
        }
        match self.registry.handles.get(&handle) {
            Some(PlayerType::Local) => {},
            Some(_) => {
                return Err(BastionError::InvalidRequest {
                    info: format!("player {} is not local", handle),
                });
            },
            None => {
                return Err(BastionError::InvalidPlayerHandle {
                    handle,
                    num_players: self.config.num_players,
                });
            },
        }
        if !frame.is_valid() {
            return Err(BastionError::InvalidFrame {
                frame,
                reason: "local inputs need a valid frame".to_owned(),
            });
        }
        let sent = self
            .local_connect_status
            .get(handle)
            .map_or(Frame::NULL, |status| status.last_frame);
        if !sent.is_null() && frame <= sent {
            return Err(BastionError::InvalidFrame {
                frame,
                reason: format!("inputs up to frame {} were already sent", sent),
            });
        }
        if !self.local_inputs.is_empty() && frame != self.local_input_frame {
            return Err(BastionError::InvalidFrame {
                frame,
                reason: format!("still collecting inputs for frame {}", self.local_input_frame),
            });
        }

        let local_handles = self.registry.local_player_handles();
        let completes_frame = local_handles
            .iter()
            .all(|local| *local == handle || self.local_inputs.contains_key(local));
        if completes_frame {
            // every running connection must accept before anything is recorded
            for connection in self.registry.remotes.values().filter(|c| c.is_running()) {
                connection.check_input(frame)?;
            }
        }

        self.local_input_frame = frame;
        self.local_inputs.insert(handle, input);
        if !completes_frame {
            return Ok(());
        }

        let inputs: Vec<T::Input> = std::mem::take(&mut self.local_inputs)
            .into_values()
            .collect();
        let bytes = InputBytes::from_inputs(
            frame,
            &inputs,
            self.input_size,
            self.config.protocol.endianness,
        )?;
        for &handle in &local_handles {
            self.local_connect_status.advance(handle, frame);
        }

        let local_status = self.local_connect_status.snapshot();
        for connection in self.registry.remotes.values_mut().filter(|c| c.is_running()) {
            let outcome = connection.send_input(bytes.clone(), &local_status, now)?;
            trace!(peer = ?connection.peer_addr(), %frame, ?outcome, "local input queued");
        }
        Ok(())
    }

    // =========================================================================
    // Tick
    // =========================================================================

    /// [`poll`](Self::poll) at the current time.
    pub fn tick<S>(&mut self, simulator: &mut S, checksums: &dyn ChecksumStore)
    where
        S: RollbackSimulator<T::Input> + ?Sized,
    {
        self.poll(simulator, checksums, Instant::now());
    }

    /// Does one tick of network work.
    ///
    /// Receives and dispatches datagrams, runs every connection's timers,
    /// hands remote inputs to `simulator`, applies disconnects, computes the
    /// minimum confirmed frame, forwards confirmed frames to spectators and
    /// flushes the outbound queues. Does nothing before [`start`](Self::start).
    pub fn poll<S>(&mut self, simulator: &mut S, checksums: &dyn ChecksumStore, now: Instant)
    where
        S: RollbackSimulator<T::Input> + ?Sized,
    {
        if !self.started {
            return;
        }

        self.receive_messages(checksums, now);

        let current_frame = simulator.current_frame();
        for connection in self.registry.remotes.values_mut() {
            if connection.is_running() {
                connection.update_local_frame_advantage(current_frame);
            }
        }
        let local_status = self.local_connect_status.snapshot();
        for connection in self.registry.connections_mut() {
            connection.poll(now, &local_status, checksums);
        }

        self.handle_connection_events(simulator, now);

        if self.current_state() == SessionState::Running {
            let confirmed = self.run_consensus(simulator, now);
            if let Some(confirmed) = confirmed.filter(|frame| frame.is_valid()) {
                self.send_confirmed_inputs_to_spectators(simulator, confirmed, now);
                self.last_confirmed_frame = confirmed;
                simulator.set_last_confirmed_frame(confirmed);
            }
        }

        self.flush(now);
    }

    fn receive_messages(&mut self, checksums: &dyn ChecksumStore, now: Instant) {
        for (from_addr, msg) in self.socket.receive_all_messages() {
            if let Some(connection) = self.registry.remotes.get_mut(&from_addr) {
                connection.handle_message(&msg, now, checksums);
            } else if let Some(connection) = self.registry.spectators.get_mut(&from_addr) {
                connection.handle_message(&msg, now, checksums);
            } else {
                trace!(?from_addr, "dropping message from unknown address");
            }
        }
    }

    fn handle_connection_events<S>(&mut self, simulator: &mut S, now: Instant)
    where
        S: RollbackSimulator<T::Input> + ?Sized,
    {
        let mut pending = Vec::new();
        for connection in self.registry.remotes.values_mut() {
            let addr = connection.peer_addr().clone();
            pending.extend(
                connection
                    .drain_events()
                    .map(|event| (Role::Player, addr.clone(), event)),
            );
        }
        for connection in self.registry.spectators.values_mut() {
            let addr = connection.peer_addr().clone();
            pending.extend(
                connection
                    .drain_events()
                    .map(|event| (Role::Spectator, addr.clone(), event)),
            );
        }
        for (role, addr, event) in pending {
            self.handle_event(role, addr, event, simulator, now);
        }
    }

    fn handle_event<S>(
        &mut self,
        role: Role,
        addr: T::Address,
        event: ProtocolEvent<T>,
        simulator: &mut S,
        now: Instant,
    ) where
        S: RollbackSimulator<T::Input> + ?Sized,
    {
        match event {
            ProtocolEvent::Connected => self.push_event(PeerEvent::Connected { addr }),
            ProtocolEvent::Synchronizing { total, count } => {
                self.push_event(PeerEvent::Synchronizing { addr, total, count });
            },
            ProtocolEvent::Synchronized { ping } => {
                info!(peer = ?addr, ?ping, "peer synchronized");
                self.push_event(PeerEvent::Synchronized { addr, ping });
            },
            ProtocolEvent::SyncFailure => {
                info!(peer = ?addr, "handshake failed");
                self.push_event(PeerEvent::SyncFailure { addr: addr.clone() });
                if role == Role::Player {
                    self.disconnect_endpoint(&addr, simulator, now);
                }
            },
            ProtocolEvent::Input { player, input } => {
                if self.local_connect_status.is_disconnected(player) {
                    trace!(%player, frame = %input.frame, "ignoring input for disconnected queue");
                    return;
                }
                simulator.add_remote_input(player, input);
                self.local_connect_status.advance(player, input.frame);
            },
            ProtocolEvent::NetworkInterrupted { disconnect_timeout } => {
                self.push_event(PeerEvent::NetworkInterrupted {
                    addr,
                    disconnect_timeout,
                });
            },
            ProtocolEvent::NetworkResumed => self.push_event(PeerEvent::NetworkResumed { addr }),
            ProtocolEvent::Disconnected => {
                info!(peer = ?addr, "peer disconnected");
                match role {
                    Role::Player => self.disconnect_endpoint(&addr, simulator, now),
                    Role::Spectator => {
                        if let Some(connection) = self.registry.spectators.get_mut(&addr) {
                            connection.disconnect(now);
                        }
                    },
                }
                self.push_event(PeerEvent::Disconnected { addr });
            },
            ProtocolEvent::ConsistencyFailure {
                frame,
                local_checksum,
                remote_checksum,
            } => {
                self.push_event(PeerEvent::ConsistencyFailure {
                    addr,
                    frame,
                    local_checksum,
                    remote_checksum,
                });
            },
        }
    }

    /// Disconnects every queue `addr` hosts at the frame last received for it.
    fn disconnect_endpoint<S>(&mut self, addr: &T::Address, simulator: &mut S, now: Instant)
    where
        S: RollbackSimulator<T::Input> + ?Sized,
    {
        let Some(connection) = self.registry.remotes.get_mut(addr) else {
            return;
        };
        connection.disconnect(now);
        let handles = connection.handles().to_vec();
        for handle in handles {
            let Some(status) = self.local_connect_status.get(handle) else {
                continue;
            };
            if !status.disconnected {
                self.disconnect_player_queue(handle, status.last_frame, simulator);
            }
        }
    }

    /// Marks `handle` disconnected as of `sync_to`, rolling the simulator back if it ran past it.
    fn disconnect_player_queue<S>(&mut self, handle: PlayerHandle, sync_to: Frame, simulator: &mut S)
    where
        S: RollbackSimulator<T::Input> + ?Sized,
    {
        let current_frame = simulator.current_frame();
        self.local_connect_status.mark_disconnected(handle, sync_to);
        debug!(%handle, %sync_to, %current_frame, "player queue disconnected");
        if sync_to < current_frame {
            simulator.adjust_simulation(sync_to);
        }
        if let Some(PlayerType::Remote(addr)) = self.registry.handles.get(&handle) {
            let addr = addr.clone();
            self.push_event(PeerEvent::PlayerDisconnected {
                addr,
                player: handle,
                frame: sync_to,
            });
        }
    }

    fn run_consensus<S>(&mut self, simulator: &mut S, now: Instant) -> Option<Frame>
    where
        S: RollbackSimulator<T::Input> + ?Sized,
    {
        let outcome = {
            let reports: Vec<EndpointReport<'_>> = self
                .registry
                .remotes
                .values()
                .map(|connection| EndpointReport {
                    handles: connection.handles(),
                    running: connection.is_running(),
                    peer_status: connection.peer_connect_statuses(),
                })
                .collect();
            consensus::min_confirmed_frame(self.local_connect_status.as_slice(), &reports)
        };

        for (handle, sync_to) in outcome.disconnects {
            debug!(%handle, %sync_to, "peers report the queue disconnected");
            self.disconnect_player_queue(handle, sync_to, simulator);
        }
        trace!(min_confirmed = ?outcome.min_confirmed, ?now, "consensus");
        outcome.min_confirmed
    }

    fn send_confirmed_inputs_to_spectators<S>(&mut self, simulator: &S, confirmed: Frame, now: Instant)
    where
        S: RollbackSimulator<T::Input> + ?Sized,
    {
        if self.registry.spectators.is_empty() {
            return;
        }
        // a spectator that is still syncing would miss frames
        if !self
            .registry
            .spectators
            .values()
            .all(PeerConnection::is_synchronized)
        {
            return;
        }

        let local_status = self.local_connect_status.snapshot();
        while self.next_spectator_frame <= confirmed {
            let frame = self.next_spectator_frame;
            let Some(inputs) = simulator.confirmed_inputs(frame) else {
                debug!(%frame, "simulator has no confirmed inputs for spectators yet");
                return;
            };
            if inputs.len() != self.config.num_players {
                report_violation_to!(
                    self.observer,
                    ViolationSeverity::Error,
                    ViolationKind::InternalError,
                    "confirmed_inputs returned {} inputs but expected {} - skipping spectator send for frame {}",
                    inputs.len(),
                    self.config.num_players,
                    frame
                );
                self.next_spectator_frame = frame.next();
                continue;
            }

            let values: Vec<T::Input> = inputs.iter().map(|input| input.input).collect();
            match InputBytes::from_inputs(
                frame,
                &values,
                self.input_size,
                self.config.protocol.endianness,
            ) {
                Ok(bytes) => {
                    for connection in self
                        .registry
                        .spectators
                        .values_mut()
                        .filter(|c| c.is_running())
                    {
                        if let Err(err) = connection.send_input(bytes.clone(), &local_status, now) {
                            debug!(peer = ?connection.peer_addr(), %frame, %err, "spectator did not take frame");
                        }
                    }
                },
                Err(err) => {
                    report_violation_to!(
                        self.observer,
                        ViolationSeverity::Error,
                        ViolationKind::InputCodec,
                        "failed to serialize confirmed inputs for frame {}: {}",
                        frame,
                        err
                    );
                },
            }
            self.next_spectator_frame = frame.next();
        }
    }

    fn flush(&mut self, now: Instant) {
        let socket = self.socket.as_mut();
        for connection in self
            .registry
            .remotes
            .values_mut()
            .chain(self.registry.spectators.values_mut())
        {
            connection.flush_outbound(&mut *socket, now);
        }
    }

    fn push_event(&mut self, event: PeerEvent<T::Address>) {
        self.events.push_back(event);
        while self.events.len() > MAX_EVENT_QUEUE_SIZE {
            self.events.pop_front();
        }
    }

    // =========================================================================
    // Disconnect
    // =========================================================================

    /// Disconnects a remote player and all other remote players with the same
    /// address, or a spectator.
    ///
    /// The peer is told through the next input message, if one is pending.
    ///
    /// # Errors
    ///
    /// - [`BastionError::InvalidPlayerHandle`] for an unknown handle.
    /// - [`BastionError::InvalidRequest`] for a local player, a player that is
    ///   already disconnected, or before the session started.
    pub fn disconnect_player<S>(
        &mut self,
        handle: PlayerHandle,
        simulator: &mut S,
        now: Instant,
    ) -> Result<(), BastionError>
    where
        S: RollbackSimulator<T::Input> + ?Sized,
    {
        let player_type = self
            .registry
            .handles
            .get(&handle)
            .cloned()
            .ok_or(BastionError::InvalidPlayerHandle {
                handle,
                num_players: self.config.num_players,
            })?;
        if !self.started {
            return Err(BastionError::InvalidRequest {
                info: "the session has not started".to_owned(),
            });
        }
        match player_type {
            PlayerType::Local => Err(BastionError::InvalidRequest {
                info: "Local Player cannot be disconnected.".to_owned(),
            }),
            PlayerType::Remote(addr) => {
                if self.local_connect_status.is_disconnected(handle) {
                    return Err(BastionError::InvalidRequest {
                        info: "Player already disconnected.".to_owned(),
                    });
                }
                self.disconnect_endpoint(&addr, simulator, now);
                let local_status = self.local_connect_status.snapshot();
                if let Some(connection) = self.registry.remotes.get_mut(&addr) {
                    let _ = connection.send_pending_output(&local_status, now);
                }
                Ok(())
            },
            PlayerType::Spectator(addr) => {
                if let Some(connection) = self.registry.spectators.get_mut(&addr) {
                    connection.disconnect(now);
                }
                Ok(())
            },
        }
    }
}

#[cfg(feature = "tokio")]
impl<T> PeerSession<T>
where
    T: Config<Address = std::net::SocketAddr>,
{
    /// Moves every connection's outbound pump into its own tokio task sending on `socket`.
    ///
    /// Afterwards [`poll`](Self::poll) no longer flushes; the tasks do, until
    /// the connection's cancellation token fires. Failures land in
    /// [`check_background_errors`](Self::check_background_errors).
    pub fn spawn_outbound_pumps(
        &mut self,
        socket: Arc<tokio::net::UdpSocket>,
    ) -> Vec<tokio::task::JoinHandle<()>> {
        let endianness = self.config.protocol.endianness;
        let errors = self.task_errors.clone();
        let mut tasks = Vec::new();
        for connection in self.registry.connections_mut() {
            let Some(pump) = connection.take_pump() else {
                continue;
            };
            let addr = *connection.peer_addr();
            tasks.push(crate::network::pump::spawn_outbound_pump(
                pump,
                Arc::clone(&socket),
                addr,
                endianness,
                connection.cancellation_token(),
                errors.clone(),
            ));
        }
        tasks
    }
}

#[cfg(test)]
#[allow(
    clippy::panic,
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::indexing_slicing
)]
mod tests {
    use super::*;
    use crate::frame_info::PlayerInput;
    use crate::network::messages::Message;
    use crate::test_config::{TestConfig, TestInput};
    use std::net::{IpAddr, Ipv4Addr, SocketAddr};
    use web_time::Duration;

    fn test_addr(port: u16) -> SocketAddr {
        SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), port)
    }

    struct DummySocket;

    impl NonBlockingSocket<SocketAddr> for DummySocket {
        fn send_to(&mut self, _msg: &Message, _addr: &SocketAddr) {}
        fn receive_all_messages(&mut self) -> Vec<(SocketAddr, Message)> {
            Vec::new()
        }
    }

    #[derive(Default)]
    struct RecordingSimulator {
        frame: i32,
        remote: Vec<(PlayerHandle, PlayerInput<TestInput>)>,
        adjusted: Vec<Frame>,
        confirmed: Vec<Frame>,
    }

    impl RollbackSimulator<TestInput> for RecordingSimulator {
        fn current_frame(&self) -> Frame {
            Frame::new(self.frame)
        }
        fn add_remote_input(&mut self, player: PlayerHandle, input: PlayerInput<TestInput>) {
            self.remote.push((player, input));
        }
        fn adjust_simulation(&mut self, to: Frame) {
            self.adjusted.push(to);
        }
        fn set_last_confirmed_frame(&mut self, frame: Frame) {
            self.confirmed.push(frame);
        }
        fn confirmed_inputs(&self, _frame: Frame) -> Option<Vec<PlayerInput<TestInput>>> {
            None
        }
    }

    fn session(num_players: usize) -> PeerSession<TestConfig> {
        let config = SessionConfig {
            num_players,
            ..SessionConfig::default()
        };
        PeerSession::new(config, Box::new(DummySocket)).unwrap()
    }

    fn local_only() -> PeerSession<TestConfig> {
        let mut session = session(1);
        session
            .add_player(PlayerType::Local, PlayerHandle::new(0))
            .unwrap();
        session.start(Instant::now()).unwrap();
        session
    }

    fn two_player() -> PeerSession<TestConfig> {
        let mut session = session(2);
        session
            .add_player(PlayerType::Local, PlayerHandle::new(0))
            .unwrap();
        session
            .add_player(PlayerType::Remote(test_addr(7001)), PlayerHandle::new(1))
            .unwrap();
        session.start(Instant::now()).unwrap();
        session
    }

    // ==========================================
    // Construction
    // ==========================================

    #[test]
    fn max_event_queue_size_is_reasonable() {
        const _: () = assert!(MAX_EVENT_QUEUE_SIZE >= 50);
        assert_eq!(MAX_EVENT_QUEUE_SIZE, 100);
    }

    #[test]
    fn input_size_comes_from_the_input_type() {
        assert_eq!(session(2).input_size(), 4);
    }

    #[test]
    fn invalid_config_is_rejected() {
        let config = SessionConfig {
            num_players: 0,
            ..SessionConfig::default()
        };
        let err = PeerSession::<TestConfig>::new(config, Box::new(DummySocket)).unwrap_err();
        assert!(matches!(err, BastionError::ConfigValueOutOfRange { .. }));
    }

    #[test]
    fn start_requires_every_player() {
        let mut session = session(2);
        session
            .add_player(PlayerType::Local, PlayerHandle::new(0))
            .unwrap();
        let err = session.start(Instant::now()).unwrap_err();
        assert!(matches!(err, BastionError::InvalidRequest { .. }));
    }

    #[test]
    fn players_cannot_be_added_after_start() {
        let mut session = local_only();
        let err = session
            .add_player(PlayerType::Spectator(test_addr(9000)), PlayerHandle::new(1))
            .unwrap_err();
        assert!(matches!(err, BastionError::InvalidRequest { .. }));
        assert!(session.start(Instant::now()).is_err());
    }

    // ==========================================
    // State
    // ==========================================

    #[test]
    fn local_only_session_runs_immediately() {
        let session = local_only();
        assert_eq!(session.current_state(), SessionState::Running);
    }

    #[test]
    fn remote_session_synchronizes_first() {
        let session = two_player();
        assert_eq!(session.current_state(), SessionState::Synchronizing);
        let connection = session.connection(PlayerHandle::new(1)).unwrap();
        assert!(!connection.is_running());
    }

    #[test]
    fn unstarted_session_is_synchronizing() {
        assert_eq!(session(1).current_state(), SessionState::Synchronizing);
    }

    // ==========================================
    // Input
    // ==========================================

    #[test]
    fn add_local_input_before_sync_fails() {
        let mut session = two_player();
        let err = session
            .add_local_input(Frame::new(0), PlayerHandle::new(0), TestInput { inp: 1 }, Instant::now())
            .unwrap_err();
        assert_eq!(err, BastionError::NotSynchronized);
    }

    #[test]
    fn add_local_input_advances_local_status() {
        let mut session = local_only();
        let now = Instant::now();
        session
            .add_local_input(Frame::new(0), PlayerHandle::new(0), TestInput { inp: 1 }, now)
            .unwrap();
        let status = session.connect_status().get(PlayerHandle::new(0)).unwrap();
        assert_eq!(status.last_frame, Frame::new(0));
    }

    #[test]
    fn add_local_input_rejects_sent_frames() {
        let mut session = local_only();
        let now = Instant::now();
        session
            .add_local_input(Frame::new(0), PlayerHandle::new(0), TestInput { inp: 1 }, now)
            .unwrap();
        let err = session
            .add_local_input(Frame::new(0), PlayerHandle::new(0), TestInput { inp: 2 }, now)
            .unwrap_err();
        assert!(matches!(err, BastionError::InvalidFrame { .. }));
    }

    #[test]
    fn add_local_input_rejects_null_frame() {
        let mut session = local_only();
        let err = session
            .add_local_input(Frame::NULL, PlayerHandle::new(0), TestInput::default(), Instant::now())
            .unwrap_err();
        assert!(matches!(err, BastionError::InvalidFrame { .. }));
    }

    #[test]
    fn add_local_input_for_unknown_handle_fails() {
        let mut session = local_only();
        let err = session
            .add_local_input(Frame::new(0), PlayerHandle::new(5), TestInput::default(), Instant::now())
            .unwrap_err();
        assert!(matches!(err, BastionError::InvalidPlayerHandle { .. }));
    }

    #[test]
    fn two_local_players_send_together() {
        let mut session = session(2);
        session
            .add_player(PlayerType::Local, PlayerHandle::new(0))
            .unwrap();
        session
            .add_player(PlayerType::Local, PlayerHandle::new(1))
            .unwrap();
        let now = Instant::now();
        session.start(now).unwrap();

        session
            .add_local_input(Frame::new(0), PlayerHandle::new(1), TestInput { inp: 1 }, now)
            .unwrap();
        // still waiting for player 0
        assert!(session
            .connect_status()
            .get(PlayerHandle::new(1))
            .unwrap()
            .last_frame
            .is_null());
        let err = session
            .add_local_input(Frame::new(1), PlayerHandle::new(0), TestInput { inp: 1 }, now)
            .unwrap_err();
        assert!(matches!(err, BastionError::InvalidFrame { .. }));

        session
            .add_local_input(Frame::new(0), PlayerHandle::new(0), TestInput { inp: 2 }, now)
            .unwrap();
        for handle in [PlayerHandle::new(0), PlayerHandle::new(1)] {
            assert_eq!(
                session.connect_status().get(handle).unwrap().last_frame,
                Frame::new(0)
            );
        }
    }

    // ==========================================
    // Poll and consensus
    // ==========================================

    #[test]
    fn local_only_poll_confirms_local_frames() {
        let mut session = local_only();
        let mut simulator = RecordingSimulator::default();
        let now = Instant::now();
        session
            .add_local_input(Frame::new(0), PlayerHandle::new(0), TestInput { inp: 1 }, now)
            .unwrap();
        session.poll(&mut simulator, &(), now);
        assert_eq!(session.confirmed_frame(), Frame::new(0));
        assert_eq!(simulator.confirmed, vec![Frame::new(0)]);
    }

    #[test]
    fn poll_before_start_does_nothing() {
        let mut session = session(1);
        let mut simulator = RecordingSimulator::default();
        session.poll(&mut simulator, &(), Instant::now());
        assert!(simulator.confirmed.is_empty());
    }

    #[test]
    fn sync_failure_disconnects_the_queue() {
        let config = SessionConfig {
            sync: crate::sessions::config::SyncConfig {
                max_sync_retries: Some(1),
                ..Default::default()
            },
            ..SessionConfig::default()
        };
        let observer = Arc::new(crate::telemetry::CollectingObserver::new());
        let mut session = PeerSession::<TestConfig>::new(config, Box::new(DummySocket))
            .unwrap()
            .with_violation_observer(observer.clone());
        assert!(session.violation_observer().is_some());
        session
            .add_player(PlayerType::Local, PlayerHandle::new(0))
            .unwrap();
        session
            .add_player(PlayerType::Remote(test_addr(7001)), PlayerHandle::new(1))
            .unwrap();
        let start = Instant::now();
        session.start(start).unwrap();

        let mut simulator = RecordingSimulator::default();
        for step in 1..=10 {
            session.poll(&mut simulator, &(), start + Duration::from_secs(step));
        }
        let events: Vec<_> = session.events().collect();
        assert!(events.contains(&PeerEvent::SyncFailure {
            addr: test_addr(7001)
        }));
        assert!(events.iter().any(|event| matches!(
            event,
            PeerEvent::PlayerDisconnected { player, .. } if *player == PlayerHandle::new(1)
        )));
        assert_eq!(session.current_state(), SessionState::Running);
        assert!(session.connect_status().is_disconnected(PlayerHandle::new(1)));
        crate::assert_violation!(observer, ViolationKind::Synchronization);
    }

    // ==========================================
    // Disconnect and stats
    // ==========================================

    #[test]
    fn local_player_cannot_be_disconnected() {
        let mut session = two_player();
        let mut simulator = RecordingSimulator::default();
        let err = session
            .disconnect_player(PlayerHandle::new(0), &mut simulator, Instant::now())
            .unwrap_err();
        assert!(matches!(err, BastionError::InvalidRequest { .. }));
    }

    #[test]
    fn disconnecting_a_remote_player_twice_fails() {
        let mut session = two_player();
        let mut simulator = RecordingSimulator::default();
        let now = Instant::now();
        session
            .disconnect_player(PlayerHandle::new(1), &mut simulator, now)
            .unwrap();
        assert!(session.connect_status().is_disconnected(PlayerHandle::new(1)));
        assert!(session
            .disconnect_player(PlayerHandle::new(1), &mut simulator, now)
            .is_err());
    }

    #[test]
    fn disconnect_behind_current_frame_adjusts_the_simulation() {
        let mut session = two_player();
        let mut simulator = RecordingSimulator {
            frame: 5,
            ..Default::default()
        };
        session
            .disconnect_player(PlayerHandle::new(1), &mut simulator, Instant::now())
            .unwrap();
        // nothing was received, so the queue syncs to the null frame
        assert_eq!(simulator.adjusted, vec![Frame::NULL]);
    }

    #[test]
    fn network_stats_checks_the_handle() {
        let session = two_player();
        assert!(matches!(
            session.network_stats(PlayerHandle::new(0)),
            Err(BastionError::InvalidRequest { .. })
        ));
        assert!(matches!(
            session.network_stats(PlayerHandle::new(7)),
            Err(BastionError::InvalidPlayerHandle { .. })
        ));
        assert_eq!(
            session.network_stats(PlayerHandle::new(1)),
            Err(BastionError::NotSynchronized)
        );
    }

    #[test]
    fn background_errors_are_folded() {
        let session = local_only();
        assert!(session.check_background_errors().is_ok());
        let errors = session.task_errors();
        errors.push(BastionError::BackgroundTask {
            peer: "a".to_owned(),
            context: "first".to_owned(),
        });
        errors.push(BastionError::BackgroundTask {
            peer: "b".to_owned(),
            context: "second".to_owned(),
        });
        match session.check_background_errors() {
            Err(BastionError::BackgroundTask { peer, context }) => {
                assert_eq!(peer, "a");
                assert!(context.contains("second"));
            },
            other => panic!("unexpected {:?}", other),
        }
        assert!(session.check_background_errors().is_ok());
    }

    #[test]
    fn event_queue_drops_oldest() {
        let mut session = local_only();
        for port in 0..(MAX_EVENT_QUEUE_SIZE as u16 + 5) {
            session.push_event(PeerEvent::NetworkResumed {
                addr: test_addr(port),
            });
        }
        let events: Vec<_> = session.events().collect();
        assert_eq!(events.len(), MAX_EVENT_QUEUE_SIZE);
        assert_eq!(events[0], PeerEvent::NetworkResumed { addr: test_addr(5) });
    }
}
