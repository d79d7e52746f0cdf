use std::error::Error;
use std::fmt;
use std::fmt::Display;

use crate::{Frame, PlayerHandle};

/// This enum contains all error messages this library can return. Most API functions will generally return a [`Result<(), BastionError>`].
///
/// [`Result<(), BastionError>`]: std::result::Result
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum BastionError {
    /// You made an invalid request, usually by using wrong parameters for function calls.
    InvalidRequest {
        /// Further specifies why the request was invalid.
        info: String,
    },
    /// A configuration value fell outside of its accepted range.
    ConfigValueOutOfRange {
        /// The name of the offending field.
        field: &'static str,
        /// Smallest accepted value.
        min: u64,
        /// Largest accepted value.
        max: u64,
        /// The value that was supplied.
        actual: u64,
    },
    /// The connection is not synchronized yet. Wait for the handshake to complete.
    NotSynchronized,
    /// An invalid frame number was provided.
    InvalidFrame {
        /// The frame that was invalid.
        frame: Frame,
        /// A description of why the frame was invalid.
        reason: String,
    },
    /// A player handle outside of the session's player range was provided.
    InvalidPlayerHandle {
        /// The player handle that was invalid.
        handle: PlayerHandle,
        /// Number of players in the session.
        num_players: usize,
    },
    /// The serialized input type does not fit the delta codec.
    InputSizeOutOfRange {
        /// Serialized size of one input frame, in bytes.
        size: usize,
        /// Largest supported size, in bytes.
        max: usize,
    },
    /// Serialization or deserialization of data failed.
    SerializationError {
        /// A description of what failed to serialize/deserialize.
        context: String,
    },
    /// A network socket operation failed.
    SocketError {
        /// A description of the socket error.
        context: String,
    },
    /// A background task (outbound pump or receive loop) terminated abnormally.
    BackgroundTask {
        /// The peer the task was serving, formatted for display.
        peer: String,
        /// A description of the failure.
        context: String,
    },
    /// A consistency check found that a peer simulated a frame differently.
    ConsistencyFailure {
        /// The audited frame.
        frame: Frame,
        /// Checksum computed locally.
        local: u128,
        /// Checksum reported by the peer.
        remote: u128,
    },
}

impl Display for BastionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BastionError::InvalidRequest { info } => {
                write!(f, "Invalid Request: {}", info)
            },
            BastionError::ConfigValueOutOfRange {
                field,
                min,
                max,
                actual,
            } => {
                write!(
                    f,
                    "Configuration value {} = {} is out of range [{}, {}]",
                    field, actual, min, max
                )
            },
            BastionError::NotSynchronized => {
                write!(f, "The connection is not yet synchronized with the remote peer.")
            },
            BastionError::InvalidFrame { frame, reason } => {
                write!(f, "Invalid frame {}: {}", frame, reason)
            },
            BastionError::InvalidPlayerHandle {
                handle,
                num_players,
            } => {
                write!(
                    f,
                    "Invalid player handle {}: session has {} players",
                    handle, num_players
                )
            },
            BastionError::InputSizeOutOfRange { size, max } => {
                write!(
                    f,
                    "Serialized input is {} bytes, the delta codec supports 1 to {} bytes",
                    size, max
                )
            },
            BastionError::SerializationError { context } => {
                write!(f, "Serialization error: {}", context)
            },
            BastionError::SocketError { context } => {
                write!(f, "Socket error: {}", context)
            },
            BastionError::BackgroundTask { peer, context } => {
                write!(f, "Background task for peer {} failed: {}", peer, context)
            },
            BastionError::ConsistencyFailure {
                frame,
                local,
                remote,
            } => {
                write!(
                    f,
                    "Simulation diverged at frame {}: local checksum 0x{:032x}, remote checksum 0x{:032x}",
                    frame, local, remote
                )
            },
        }
    }
}

impl Error for BastionError {}

/// Reasons a local input could not be queued for a peer.
///
/// These are transient: the caller is expected to retry on a later tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SendInputError {
    /// The pending-output queue is at capacity; the peer is not acknowledging inputs.
    FullQueue {
        /// Number of unacknowledged inputs currently queued.
        pending: usize,
    },
    /// The input's frame is already covered by the peer's acknowledgement.
    AlreadyAcked {
        /// The rejected frame.
        frame: Frame,
        /// The peer's last acknowledged frame.
        last_acked: Frame,
    },
    /// The input does not directly follow the last queued frame.
    OutOfOrder {
        /// The rejected frame.
        frame: Frame,
        /// The frame that was expected.
        expected: Frame,
    },
    /// The connection has not finished its handshake or has been disconnected.
    NotRunning,
}

impl Display for SendInputError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SendInputError::FullQueue { pending } => {
                write!(f, "pending output queue is full ({} inputs)", pending)
            },
            SendInputError::AlreadyAcked { frame, last_acked } => {
                write!(
                    f,
                    "input for frame {} is behind the last acknowledged frame {}",
                    frame, last_acked
                )
            },
            SendInputError::OutOfOrder { frame, expected } => {
                write!(f, "input for frame {} is out of order, expected {}", frame, expected)
            },
            SendInputError::NotRunning => write!(f, "connection is not running"),
        }
    }
}

impl Error for SendInputError {}

impl From<SendInputError> for BastionError {
    fn from(err: SendInputError) -> Self {
        BastionError::InvalidRequest {
            info: err.to_string(),
        }
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

    #[test]
    fn config_out_of_range_names_field_and_bounds() {
        let err = BastionError::ConfigValueOutOfRange {
            field: "pending_output_limit",
            min: 1,
            max: 4096,
            actual: 0,
        };
        let msg = err.to_string();
        assert!(msg.contains("pending_output_limit"));
        assert!(msg.contains("[1, 4096]"));
    }

    #[test]
    fn consistency_failure_display_includes_both_checksums() {
        let err = BastionError::ConsistencyFailure {
            frame: Frame::new(42),
            local: 0xAB,
            remote: 0xCD,
        };
        let msg = err.to_string();
        assert!(msg.contains("frame 42"));
        assert!(msg.contains("ab"));
        assert!(msg.contains("cd"));
    }

    #[test]
    fn send_input_error_converts_to_invalid_request() {
        let err: BastionError = SendInputError::AlreadyAcked {
            frame: Frame::new(3),
            last_acked: Frame::new(5),
        }
        .into();
        match err {
            BastionError::InvalidRequest { info } => {
                assert!(info.contains("frame 3"));
                assert!(info.contains("5"));
            },
            other => panic!("unexpected error {other:?}"),
        }
    }

    #[test]
    fn errors_are_std_errors() {
        fn takes_error(_: &dyn Error) {}
        takes_error(&BastionError::NotSynchronized);
        takes_error(&SendInputError::NotRunning);
    }
}
