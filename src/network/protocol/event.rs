use web_time::Duration;

use crate::frame_info::PlayerInput;
use crate::{Config, Frame, PlayerHandle};

/// Something a peer connection wants its owner to know about.
///
/// Drained with [`PeerConnection::drain_events`](super::PeerConnection::drain_events).
#[derive(Clone, PartialEq)]
pub enum ProtocolEvent<T>
where
    T: Config,
{
    /// The first valid sync reply arrived.
    Connected,
    /// A handshake roundtrip completed; `count` of `total` done.
    Synchronizing {
        /// Roundtrips required.
        total: u32,
        /// Roundtrips completed.
        count: u32,
    },
    /// The handshake finished and inputs can flow.
    Synchronized {
        /// Mean handshake round-trip time.
        ping: Duration,
    },
    /// The handshake gave up after too many retries.
    SyncFailure,
    /// A confirmed remote input, in frame order per player.
    Input {
        /// The queue the input belongs to.
        player: PlayerHandle,
        /// The input itself.
        input: PlayerInput<T::Input>,
    },
    /// Nothing received for a while; the peer will be dropped after `disconnect_timeout`.
    NetworkInterrupted {
        /// Time left before the hard timeout.
        disconnect_timeout: Duration,
    },
    /// Traffic resumed after a [`ProtocolEvent::NetworkInterrupted`].
    NetworkResumed,
    /// The peer timed out, asked to leave, or failed a consistency check.
    Disconnected,
    /// The peer's state checksum differs from ours. Always followed by `Disconnected`.
    ConsistencyFailure {
        /// The audited frame.
        frame: Frame,
        /// Our checksum.
        local_checksum: u128,
        /// The peer's checksum.
        remote_checksum: u128,
    },
}

// Manual impl: `Config::Input` is not required to be `Debug`, so the input
// payload itself is elided.
impl<T: Config> std::fmt::Debug for ProtocolEvent<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Connected => f.write_str("Connected"),
            Self::Synchronizing { total, count } => f
                .debug_struct("Synchronizing")
                .field("total", total)
                .field("count", count)
                .finish(),
            Self::Synchronized { ping } => f.debug_struct("Synchronized").field("ping", ping).finish(),
            Self::SyncFailure => f.write_str("SyncFailure"),
            Self::Input { player, input } => f
                .debug_struct("Input")
                .field("player", player)
                .field("frame", &input.frame)
                .finish_non_exhaustive(),
            Self::NetworkInterrupted { disconnect_timeout } => f
                .debug_struct("NetworkInterrupted")
                .field("disconnect_timeout", disconnect_timeout)
                .finish(),
            Self::NetworkResumed => f.write_str("NetworkResumed"),
            Self::Disconnected => f.write_str("Disconnected"),
            Self::ConsistencyFailure {
                frame,
                local_checksum,
                remote_checksum,
            } => f
                .debug_struct("ConsistencyFailure")
                .field("frame", frame)
                .field("local_checksum", local_checksum)
                .field("remote_checksum", remote_checksum)
                .finish(),
        }
    }
}
