//! # Bastion Netcode
//!
//! Bastion Netcode is the transport half of a peer-to-peer rollback netcode
//! stack, written in 100% safe Rust. It runs a small protocol over unreliable
//! UDP datagrams: a magic-number handshake, delta-compressed input streaming
//! with acknowledgements, disconnect detection, periodic checksum audits, and
//! a consensus over every peer's connect-status table that yields the single
//! frame every peer has confirmed.
//!
//! The rollback simulator itself is not part of this crate. A
//! [`PeerSession`] hands remote inputs to your [`RollbackSimulator`] and tells
//! it how far it may confirm; checksums for audits come from a
//! [`ChecksumStore`].

#![forbid(unsafe_code)]
#![deny(missing_docs)]
#![deny(rustdoc::broken_intra_doc_links)]
use std::collections::BTreeMap;
use std::fmt::Debug;
use std::hash::Hash;

pub use error::{BastionError, SendInputError};
pub use frame_info::PlayerInput;
pub use network::messages::Message;
pub use network::network_stats::NetworkStats;
#[cfg(feature = "tokio")]
pub use network::tokio_socket::TokioUdpSocket;
pub use network::udp_socket::UdpNonBlockingSocket;
pub use network::wire::Endianness;
pub use sessions::config::{
    ConsistencyConfig, DelayConfig, DelayStrategy, ProtocolConfig, SessionConfig, SyncConfig,
};
pub use sessions::peer_session::PeerSession;
pub use time_sync::TimeSyncConfig;

use serde::{de::DeserializeOwned, Serialize};

#[doc(hidden)]
pub mod error;
#[doc(hidden)]
pub mod frame_info;
/// Deterministic pseudo-random numbers for magic numbers, nonces and delay jitter.
pub mod rng;
pub mod telemetry;
#[doc(hidden)]
pub mod time_sync;
#[doc(hidden)]
pub mod sessions {
    #[doc(hidden)]
    pub mod config;
    #[doc(hidden)]
    pub mod consensus;
    #[doc(hidden)]
    pub mod peer_session;
    #[doc(hidden)]
    pub mod player_registry;
}
#[doc(hidden)]
pub mod network {
    #[doc(hidden)]
    pub mod bits;
    #[doc(hidden)]
    pub mod cancel;
    #[doc(hidden)]
    pub mod codec;
    #[doc(hidden)]
    pub mod compression;
    #[doc(hidden)]
    pub mod connect_status;
    #[doc(hidden)]
    pub mod messages;
    #[doc(hidden)]
    pub mod network_stats;
    #[doc(hidden)]
    pub mod outbox;
    #[doc(hidden)]
    pub mod protocol;
    #[doc(hidden)]
    pub mod pump;
    #[cfg(feature = "tokio")]
    #[doc(hidden)]
    pub mod tokio_socket;
    #[doc(hidden)]
    pub mod udp_socket;
    #[doc(hidden)]
    pub mod wire;
}

#[cfg(test)]
mod test_config;

/// Internal types exposed for integration tests and fuzzing.
///
/// Nothing here is covered by semver.
///
/// ```
/// use bastion_netcode::__internal::{ConnectionsState, PeerConnection};
/// ```
#[doc(hidden)]
pub mod __internal {
    // Network internals
    pub use crate::network::compression::{decode_run, encode_run, DeltaDecoder, EncodedRun};
    pub use crate::network::connect_status::{merge_remote, ConnectionsState};
    pub use crate::network::messages::{ConnectStatus, MessageBody, MessageHeader};
    pub use crate::network::protocol::{
        FlushOutcome, InputBytes, LocalInputBuffer, PeerConnection, ProtocolEvent, ProtocolState,
    };
    pub use crate::network::wire::{decode as wire_decode, encode as wire_encode};

    // Session internals
    pub use crate::sessions::consensus::{min_confirmed_frame, ConsensusOutcome, EndpointReport};
    pub use crate::sessions::player_registry::PlayerRegistry;
    pub use crate::time_sync::TimeSync;
}

/// Raw value of [`Frame::NULL`].
pub const NULL_FRAME: i32 = -1;

/// A simulation step number.
///
/// Inputs, acknowledgements, audits and connect-status entries are all
/// stamped with a frame. Real frames count up from 0; [`Frame::NULL`] stands
/// for "none yet" and sorts before every real frame.
///
/// ```
/// use bastion_netcode::Frame;
///
/// let first = Frame::new(0);
/// assert!(first.is_valid());
/// assert_eq!(Frame::NULL.next(), first);
/// assert_eq!(first.previous(), Frame::NULL);
/// assert_eq!(Frame::new(9) - first, 9);
/// ```
#[derive(
    Debug,
    Copy,
    Clone,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    Default,
    serde::Serialize,
    serde::Deserialize,
)]
pub struct Frame(i32);

impl Frame {
    /// No frame.
    pub const NULL: Frame = Frame(NULL_FRAME);

    /// Wraps a raw frame number. Negative values are accepted but not [valid](Self::is_valid).
    #[inline]
    #[must_use]
    pub const fn new(frame: i32) -> Self {
        Frame(frame)
    }

    /// The raw frame number.
    #[inline]
    #[must_use]
    pub const fn as_i32(self) -> i32 {
        self.0
    }

    /// Whether this is [`Frame::NULL`].
    #[inline]
    #[must_use]
    pub const fn is_null(self) -> bool {
        self.0 == NULL_FRAME
    }

    /// Whether this is a real frame, 0 or later.
    #[inline]
    #[must_use]
    pub const fn is_valid(self) -> bool {
        self.0 >= 0
    }

    /// The frame after this one; [`Frame::NULL`] is followed by frame 0.
    #[inline]
    #[must_use]
    pub const fn next(self) -> Self {
        Frame(self.0.saturating_add(1))
    }

    /// The frame before this one; frame 0 is preceded by [`Frame::NULL`].
    #[inline]
    #[must_use]
    pub const fn previous(self) -> Self {
        Frame(self.0.saturating_sub(1))
    }
}

impl std::fmt::Display for Frame {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.0 {
            NULL_FRAME => f.write_str("NULL_FRAME"),
            frame => write!(f, "{frame}"),
        }
    }
}

impl std::ops::Add<i32> for Frame {
    type Output = Frame;

    #[inline]
    fn add(self, frames: i32) -> Frame {
        Frame(self.0 + frames)
    }
}

impl std::ops::AddAssign<i32> for Frame {
    #[inline]
    fn add_assign(&mut self, frames: i32) {
        *self = *self + frames;
    }
}

impl std::ops::Sub<i32> for Frame {
    type Output = Frame;

    #[inline]
    fn sub(self, frames: i32) -> Frame {
        Frame(self.0 - frames)
    }
}

/// Distance between two frames.
impl std::ops::Sub<Frame> for Frame {
    type Output = i32;

    #[inline]
    fn sub(self, earlier: Frame) -> i32 {
        self.0 - earlier.0
    }
}

/// Identifies a player queue or a spectator slot.
///
/// With `num_players` players, handles `0..num_players` are player queues
/// and index every connect-status table. Higher handles name spectators.
///
/// ```
/// use bastion_netcode::PlayerHandle;
///
/// assert!(PlayerHandle::new(1).is_valid_player_for(2));
/// assert!(PlayerHandle::new(2).is_spectator_for(2));
/// ```
#[derive(
    Debug,
    Copy,
    Clone,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    Default,
    serde::Serialize,
    serde::Deserialize,
)]
pub struct PlayerHandle(usize);

impl PlayerHandle {
    /// Wraps a raw handle.
    #[inline]
    #[must_use]
    pub const fn new(handle: usize) -> Self {
        PlayerHandle(handle)
    }

    /// The raw handle, also the queue's index in connect-status tables.
    #[inline]
    #[must_use]
    pub const fn as_usize(self) -> usize {
        self.0
    }

    /// Whether this names a player queue when there are `num_players` players.
    #[inline]
    #[must_use]
    pub const fn is_valid_player_for(self, num_players: usize) -> bool {
        self.0 < num_players
    }

    /// Whether this names a spectator slot when there are `num_players` players.
    #[inline]
    #[must_use]
    pub const fn is_spectator_for(self, num_players: usize) -> bool {
        !self.is_valid_player_for(num_players)
    }
}

impl std::fmt::Display for PlayerHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        std::fmt::Display::fmt(&self.0, f)
    }
}

impl From<usize> for PlayerHandle {
    #[inline]
    fn from(handle: usize) -> Self {
        PlayerHandle(handle)
    }
}

/// How a handle is attached to the session.
///
/// Remote players and spectators carry the address of the endpoint hosting
/// them. Several handles may share one address; they then share a connection.
#[derive(Debug, Copy, Clone, Hash, PartialEq, Eq, PartialOrd, Ord)]
pub enum PlayerType<A> {
    /// Input comes from this process.
    Local,
    /// Input comes from the endpoint at the address.
    Remote(A),
    /// The endpoint at the address only watches; it is fed confirmed inputs.
    Spectator(A),
}

/// Handles are local unless told otherwise.
impl<A> Default for PlayerType<A> {
    fn default() -> Self {
        PlayerType::Local
    }
}

/// Where a [`PeerSession`] is in its lifetime.
///
/// See [`PeerSession::current_state`].
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum SessionState {
    /// At least one endpoint has not finished its handshake.
    Synchronizing,
    /// Every endpoint finished its handshake; inputs flow.
    Running,
}

/// What a [`PeerSession`] reports through [`PeerSession::events`].
///
/// Marked `#[non_exhaustive]`; match with a wildcard arm.
#[derive(Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum PeerEvent<A> {
    /// The endpoint answered its first handshake request.
    Connected {
        /// Endpoint address.
        addr: A,
    },
    /// One more handshake roundtrip succeeded.
    Synchronizing {
        /// Endpoint address.
        addr: A,
        /// Roundtrips required.
        total: u32,
        /// Roundtrips done.
        count: u32,
    },
    /// The handshake with the endpoint completed.
    Synchronized {
        /// Endpoint address.
        addr: A,
        /// Mean handshake round-trip time.
        ping: web_time::Duration,
    },
    /// The handshake gave up; the endpoint's players are disconnected.
    SyncFailure {
        /// Endpoint address.
        addr: A,
    },
    /// The endpoint went quiet and is dropped after `disconnect_timeout` more silence.
    NetworkInterrupted {
        /// Endpoint address.
        addr: A,
        /// Silence left before the disconnect.
        disconnect_timeout: web_time::Duration,
    },
    /// The endpoint spoke again after a [`PeerEvent::NetworkInterrupted`].
    NetworkResumed {
        /// Endpoint address.
        addr: A,
    },
    /// The connection to the endpoint is closed.
    Disconnected {
        /// Endpoint address.
        addr: A,
    },
    /// The endpoint's checksum for an audited frame differs from ours; it is dropped.
    ConsistencyFailure {
        /// Endpoint address.
        addr: A,
        /// The audited frame.
        frame: Frame,
        /// Our checksum.
        local_checksum: u128,
        /// The endpoint's checksum.
        remote_checksum: u128,
    },
    /// A player queue was marked disconnected.
    PlayerDisconnected {
        /// Address that hosted the queue.
        addr: A,
        /// The queue.
        player: PlayerHandle,
        /// Last frame with a real input from the queue.
        frame: Frame,
    },
}

/// Bundles a session's generic parameters.
///
/// ```
/// use bastion_netcode::Config;
/// use serde::{Deserialize, Serialize};
/// use std::net::SocketAddr;
///
/// #[derive(Copy, Clone, PartialEq, Default, Serialize, Deserialize)]
/// struct Pad {
///     buttons: u16,
///     stick: [i8; 2],
/// }
///
/// struct Game;
///
/// impl Config for Game {
///     type Input = Pad;
///     type Address = SocketAddr;
/// }
/// ```
#[cfg(feature = "sync-send")]
pub trait Config: 'static + Send + Sync {
    /// One player's input for one frame, the only game data on the wire.
    ///
    /// Every value must encode to the same size as [`Default`], which also
    /// stands in for a disconnected player.
    type Input: Copy + Clone + PartialEq + Default + Serialize + DeserializeOwned + Send + Sync;

    /// Identifies an endpoint.
    type Address: Clone + PartialEq + Eq + PartialOrd + Ord + Hash + Send + Sync + Debug;
}

/// Datagram transport used by a [`PeerSession`].
///
/// Delivery may drop, duplicate or reorder messages; the protocol copes.
/// Neither method may block.
#[cfg(feature = "sync-send")]
pub trait NonBlockingSocket<A>: Send + Sync
where
    A: Clone + PartialEq + Eq + Hash + Send + Sync,
{
    /// Sends `msg` to `addr`, best effort.
    fn send_to(&mut self, msg: &Message, addr: &A);

    /// Everything received since the previous call, with sender addresses.
    fn receive_all_messages(&mut self) -> Vec<(A, Message)>;
}

/// Bundles a session's generic parameters.
#[cfg(not(feature = "sync-send"))]
pub trait Config: 'static {
    /// One player's input for one frame, the only game data on the wire.
    ///
    /// Every value must encode to the same size as [`Default`], which also
    /// stands in for a disconnected player.
    type Input: Copy + Clone + PartialEq + Default + Serialize + DeserializeOwned;

    /// Identifies an endpoint.
    type Address: Clone + PartialEq + Eq + PartialOrd + Ord + Hash + Debug;
}

/// Datagram transport used by a [`PeerSession`].
///
/// Delivery may drop, duplicate or reorder messages; the protocol copes.
/// Neither method may block.
#[cfg(not(feature = "sync-send"))]
pub trait NonBlockingSocket<A>
where
    A: Clone + PartialEq + Eq + Hash,
{
    /// Sends `msg` to `addr`, best effort.
    fn send_to(&mut self, msg: &Message, addr: &A);

    /// Everything received since the previous call, with sender addresses.
    fn receive_all_messages(&mut self) -> Vec<(A, Message)>;
}

/// Where checksums for consistency audits come from.
///
/// Return `None` for frames that were not simulated yet or are no longer kept;
/// the audit is then skipped (or the peer's request rejected).
pub trait ChecksumStore {
    /// The checksum of the confirmed state at `frame`.
    fn checksum(&self, frame: Frame) -> Option<u128>;
}

/// No checksums: audits never run.
impl ChecksumStore for () {
    fn checksum(&self, _frame: Frame) -> Option<u128> {
        None
    }
}

impl ChecksumStore for BTreeMap<Frame, u128> {
    fn checksum(&self, frame: Frame) -> Option<u128> {
        self.get(&frame).copied()
    }
}

/// The rollback simulator a [`PeerSession`] drives.
///
/// The session never saves or loads state; it reports what arrived and how
/// far the simulation is confirmed.
pub trait RollbackSimulator<I>
where
    I: Copy + Clone + PartialEq,
{
    /// The frame the simulation is about to run.
    fn current_frame(&self) -> Frame;

    /// A confirmed remote input. Inputs arrive in frame order per player.
    fn add_remote_input(&mut self, player: PlayerHandle, input: PlayerInput<I>);

    /// Roll back and resimulate from `to`, because a player disconnected
    /// there and later frames used inputs it never sent.
    fn adjust_simulation(&mut self, to: Frame);

    /// Every frame up to `frame` has inputs from every connected player.
    fn set_last_confirmed_frame(&mut self, frame: Frame);

    /// Every player's confirmed input for `frame`, in handle order, for
    /// spectators. `None` if the frame is not confirmed or already discarded.
    fn confirmed_inputs(&self, frame: Frame) -> Option<Vec<PlayerInput<I>>>;
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
    use std::net::{Ipv4Addr, SocketAddr};

    fn local(port: u16) -> SocketAddr {
        (Ipv4Addr::LOCALHOST, port).into()
    }

    #[test]
    fn null_frame_is_before_everything() {
        assert!(Frame::NULL.is_null());
        assert!(!Frame::NULL.is_valid());
        assert_eq!(Frame::NULL.as_i32(), NULL_FRAME);
        assert!(Frame::NULL < Frame::new(0));
        assert_eq!(Frame::default(), Frame::new(0));
    }

    #[test]
    fn stepping_saturates_at_the_top() {
        assert_eq!(Frame::NULL.next(), Frame::new(0));
        assert_eq!(Frame::new(0).previous(), Frame::NULL);
        assert_eq!(Frame::new(i32::MAX).next(), Frame::new(i32::MAX));
        assert_eq!(Frame::new(i32::MIN).previous(), Frame::new(i32::MIN));
    }

    #[test]
    fn offsets_and_distances() {
        let mut frame = Frame::new(20) + 4;
        frame += 1;
        assert_eq!(frame, Frame::new(25));
        assert_eq!(frame - 25, Frame::new(0));
        assert_eq!(frame - Frame::new(5), 20);
        assert_eq!(Frame::new(5) - frame, -20);
    }

    #[test]
    fn null_frame_prints_by_name() {
        assert_eq!(format!("{}..{}", Frame::new(3), Frame::new(8)), "3..8");
        assert_eq!(Frame::NULL.to_string(), "NULL_FRAME");
    }

    #[test]
    fn handles_split_into_players_and_spectators() {
        let players = 3;
        let (queues, watchers): (Vec<_>, Vec<_>) = (0..6usize)
            .map(PlayerHandle::from)
            .partition(|handle| handle.is_valid_player_for(players));
        assert_eq!(queues.len(), 3);
        assert!(watchers.iter().all(|handle| handle.is_spectator_for(players)));
        assert_eq!(watchers[0].as_usize(), 3);
        assert_eq!(PlayerHandle::new(12).to_string(), "12");
    }

    #[test]
    fn player_types_compare_kind_and_address() {
        assert_eq!(PlayerType::<SocketAddr>::default(), PlayerType::Local);
        assert_ne!(PlayerType::Remote(local(1)), PlayerType::Spectator(local(1)));
        assert_ne!(PlayerType::Remote(local(1)), PlayerType::Remote(local(2)));
    }

    #[test]
    fn events_compare_every_field() {
        let interrupted = PeerEvent::NetworkInterrupted {
            addr: local(7),
            disconnect_timeout: web_time::Duration::from_millis(4250),
        };
        assert_eq!(interrupted.clone(), interrupted);
        assert_ne!(
            interrupted,
            PeerEvent::NetworkInterrupted {
                addr: local(7),
                disconnect_timeout: web_time::Duration::from_millis(4000),
            }
        );
        assert!(matches!(
            PeerEvent::PlayerDisconnected {
                addr: local(7),
                player: PlayerHandle::new(1),
                frame: Frame::new(30),
            },
            PeerEvent::PlayerDisconnected { frame, .. } if frame == Frame::new(30)
        ));
    }

    #[test]
    fn checksum_stores() {
        assert_eq!(().checksum(Frame::new(0)), None);

        let store: BTreeMap<Frame, u128> = [(Frame::new(4), 0xABCD)].into_iter().collect();
        let store: &dyn ChecksumStore = &store;
        assert_eq!(store.checksum(Frame::new(4)), Some(0xABCD));
        assert_eq!(store.checksum(Frame::new(5)), None);
    }
}
