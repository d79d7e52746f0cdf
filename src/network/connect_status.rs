//! Connect-status gossip table.
//!
//! Every session keeps one [`ConnectionsState`] describing what it knows about
//! each player queue, and every peer connection keeps a second table holding
//! the remote's view, refreshed from incoming input messages by
//! [`merge_remote`]. Both only ever move forward: `last_frame` never decreases
//! and `disconnected` is never cleared.

use crate::network::messages::{ConnectStatus, ConnectStatusTable};
use crate::{Frame, PlayerHandle};

/// A queue whose gossiped `last_frame` went backward.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StatusRegression {
    /// Queue index.
    pub queue: usize,
    /// The value we already had, which is kept.
    pub known: Frame,
    /// The smaller value the peer sent.
    pub received: Frame,
}

/// Folds a remote table into `local`.
///
/// For every index present in both, `disconnected` is or-ed and `last_frame`
/// takes the maximum. Connected entries the remote reports backward are
/// returned so the caller can report them; the local value is never lowered.
/// A disconnected entry may legitimately carry an earlier frame, since a
/// disconnect is synced back to the frame where the queue dropped.
pub fn merge_remote(local: &mut [ConnectStatus], remote: &[ConnectStatus]) -> Vec<StatusRegression> {
    let mut regressions = Vec::new();
    for (queue, (mine, theirs)) in local.iter_mut().zip(remote).enumerate() {
        if !theirs.disconnected && theirs.last_frame < mine.last_frame {
            regressions.push(StatusRegression {
                queue,
                known: mine.last_frame,
                received: theirs.last_frame,
            });
        }
        mine.disconnected |= theirs.disconnected;
        mine.last_frame = std::cmp::max(mine.last_frame, theirs.last_frame);
    }
    regressions
}

/// The local session's connect status for every player queue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionsState {
    statuses: ConnectStatusTable,
}

impl ConnectionsState {
    /// Creates a table for `num_players` queues, all connected with no frame.
    #[must_use]
    pub fn new(num_players: usize) -> Self {
        Self {
            statuses: std::iter::repeat(ConnectStatus::default())
                .take(num_players)
                .collect(),
        }
    }

    /// Number of queues.
    #[must_use]
    pub fn len(&self) -> usize {
        self.statuses.len()
    }

    /// Whether the table has no queues.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.statuses.is_empty()
    }

    /// Status of one queue, `None` for an unknown handle.
    #[must_use]
    pub fn get(&self, handle: PlayerHandle) -> Option<ConnectStatus> {
        self.statuses.get(handle.as_usize()).copied()
    }

    /// Whether the queue is marked disconnected. Unknown handles count as disconnected.
    #[must_use]
    pub fn is_disconnected(&self, handle: PlayerHandle) -> bool {
        self.get(handle).map_or(true, |status| status.disconnected)
    }

    /// Moves the queue's confirmed frame forward. Smaller frames are ignored.
    ///
    /// Returns whether the value changed.
    pub fn advance(&mut self, handle: PlayerHandle, frame: Frame) -> bool {
        match self.statuses.get_mut(handle.as_usize()) {
            Some(status) if frame > status.last_frame => {
                status.last_frame = frame;
                true
            },
            _ => false,
        }
    }

    /// Marks the queue disconnected as of `frame`.
    ///
    /// The queue's frame is set to `frame` even if that is earlier: inputs past
    /// the disconnect point are discarded by the simulator, so the table must
    /// not advertise them. Returns whether the queue was connected before.
    pub fn mark_disconnected(&mut self, handle: PlayerHandle, frame: Frame) -> bool {
        match self.statuses.get_mut(handle.as_usize()) {
            Some(status) => {
                let was_connected = !status.disconnected;
                status.disconnected = true;
                status.last_frame = frame;
                was_connected
            },
            None => false,
        }
    }

    /// Copies the table for an outgoing message.
    #[must_use]
    pub fn snapshot(&self) -> ConnectStatusTable {
        self.statuses.clone()
    }

    /// Read-only view of every entry.
    #[must_use]
    pub fn as_slice(&self) -> &[ConnectStatus] {
        &self.statuses
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

    fn status(last_frame: i32, disconnected: bool) -> ConnectStatus {
        ConnectStatus {
            disconnected,
            last_frame: Frame::new(last_frame),
        }
    }

    #[test]
    fn merge_takes_max_and_ors_disconnect() {
        let mut local = vec![status(3, false), status(7, false)];
        let remote = vec![status(5, true), status(7, false)];
        let regressions = merge_remote(&mut local, &remote);
        assert!(regressions.is_empty());
        assert_eq!(local, vec![status(5, true), status(7, false)]);
    }

    #[test]
    fn merge_never_clears_disconnect() {
        let mut local = vec![status(4, true)];
        merge_remote(&mut local, &[status(6, false)]);
        assert_eq!(local[0], status(6, true));
    }

    #[test]
    fn merge_reports_and_ignores_regression() {
        let mut local = vec![status(10, false), status(2, false)];
        let regressions = merge_remote(&mut local, &[status(8, false), status(3, false)]);
        assert_eq!(
            regressions,
            vec![StatusRegression {
                queue: 0,
                known: Frame::new(10),
                received: Frame::new(8),
            }]
        );
        assert_eq!(local[0].last_frame, Frame::new(10));
        assert_eq!(local[1].last_frame, Frame::new(3));
    }

    #[test]
    fn earlier_disconnect_frame_is_not_a_regression() {
        let mut local = vec![status(20, false), status(14, false)];
        let regressions = merge_remote(&mut local, &[status(20, false), status(9, true)]);
        assert!(regressions.is_empty());
        assert_eq!(local[1], status(14, true));

        // still reported when the queue is connected
        let regressions = merge_remote(&mut local, &[status(12, false), status(9, true)]);
        assert_eq!(regressions.len(), 1);
        assert_eq!(regressions[0].queue, 0);
    }

    #[test]
    fn merge_tolerates_length_mismatch() {
        let mut local = vec![status(1, false), status(1, false)];
        merge_remote(&mut local, &[status(2, false)]);
        assert_eq!(local, vec![status(2, false), status(1, false)]);
    }

    #[test]
    fn advance_is_monotonic() {
        let mut state = ConnectionsState::new(2);
        let handle = PlayerHandle::new(1);
        assert!(state.advance(handle, Frame::new(4)));
        assert!(!state.advance(handle, Frame::new(2)));
        assert_eq!(state.get(handle).unwrap().last_frame, Frame::new(4));
        assert!(!state.advance(PlayerHandle::new(9), Frame::new(1)));
    }

    #[test]
    fn mark_disconnected_once() {
        let mut state = ConnectionsState::new(2);
        let handle = PlayerHandle::new(0);
        state.advance(handle, Frame::new(9));
        assert!(state.mark_disconnected(handle, Frame::new(6)));
        assert!(!state.mark_disconnected(handle, Frame::new(6)));
        assert_eq!(state.get(handle), Some(status(6, true)));
        assert!(state.is_disconnected(handle));
        assert!(state.is_disconnected(PlayerHandle::new(5)));
    }

    #[test]
    fn snapshot_is_a_copy() {
        let mut state = ConnectionsState::new(1);
        let snapshot = state.snapshot();
        state.advance(PlayerHandle::new(0), Frame::new(1));
        assert_eq!(snapshot[0].last_frame, Frame::NULL);
    }
}
