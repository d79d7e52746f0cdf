//! Minimum-confirmed-frame consensus.
//!
//! Once per tick the session folds its own connect-status table together with
//! every player endpoint's view of it. The result bounds how far the simulator
//! may advance: every frame up to the minimum has inputs from every connected
//! queue. Queues a peer reports disconnected are returned with the frame the
//! disconnect should be synchronized to.
//!
//! With two players the direct link is the only witness. With more, a queue is
//! connected only if every running endpoint agrees, because a disconnect seen
//! by one peer may reach us only through another.

use crate::network::messages::ConnectStatus;
use crate::{Frame, PlayerHandle};

/// One player endpoint as the consensus sees it.
#[derive(Debug, Clone, Copy)]
pub struct EndpointReport<'a> {
    /// Queues the endpoint hosts.
    pub handles: &'a [PlayerHandle],
    /// Whether the endpoint finished its handshake and is still up.
    pub running: bool,
    /// The endpoint's gossiped connect-status table.
    pub peer_status: &'a [ConnectStatus],
}

impl EndpointReport<'_> {
    fn status(&self, queue: usize) -> ConnectStatus {
        self.peer_status.get(queue).copied().unwrap_or_default()
    }
}

/// What a consensus pass decided.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
#[must_use]
pub struct ConsensusOutcome {
    /// The minimum frame confirmed by every connected queue, `None` when no
    /// queue is connected.
    pub min_confirmed: Option<Frame>,
    /// Queues to disconnect locally, with the frame to synchronize them to.
    pub disconnects: Vec<(PlayerHandle, Frame)>,
}

/// Picks the two-player or N-player pass by the size of `local`.
pub fn min_confirmed_frame(local: &[ConnectStatus], endpoints: &[EndpointReport<'_>]) -> ConsensusOutcome {
    if local.len() <= 2 {
        poll_two_players(local, endpoints)
    } else {
        poll_n_players(local, endpoints)
    }
}

/// Consensus where each queue has exactly one remote witness: its host.
///
/// A queue its host reports disconnected is dropped at the running minimum,
/// which already includes our own frame for that queue.
pub fn poll_two_players(local: &[ConnectStatus], endpoints: &[EndpointReport<'_>]) -> ConsensusOutcome {
    let mut total_min = i32::MAX;
    let mut disconnects = Vec::new();

    for (queue, mine) in local.iter().enumerate() {
        let handle = PlayerHandle::new(queue);
        let mut queue_connected = true;

        let host = endpoints
            .iter()
            .find(|endpoint| endpoint.handles.contains(&handle));
        if let Some(host) = host.filter(|host| host.running) {
            queue_connected = !host.status(queue).disconnected;
        }

        if !mine.disconnected {
            total_min = total_min.min(mine.last_frame.as_i32());
        }
        if !queue_connected && !mine.disconnected {
            disconnects.push((handle, Frame::new(total_min)));
        }
    }

    finish(total_min, disconnects)
}

/// Consensus where every running endpoint must agree on every queue.
pub fn poll_n_players(local: &[ConnectStatus], endpoints: &[EndpointReport<'_>]) -> ConsensusOutcome {
    let mut total_min = i32::MAX;
    let mut disconnects = Vec::new();

    for (queue, mine) in local.iter().enumerate() {
        let mut queue_connected = true;
        let mut queue_min = i32::MAX;

        for endpoint in endpoints.iter().filter(|endpoint| endpoint.running) {
            let theirs = endpoint.status(queue);
            queue_connected &= !theirs.disconnected;
            queue_min = queue_min.min(theirs.last_frame.as_i32());
        }

        // our own view only counts while we still consider the queue connected
        if !mine.disconnected {
            queue_min = queue_min.min(mine.last_frame.as_i32());
        }

        if queue_connected {
            total_min = total_min.min(queue_min);
        } else if !mine.disconnected || mine.last_frame.as_i32() > queue_min {
            // a peer saw the queue drop, possibly earlier than we recorded
            disconnects.push((PlayerHandle::new(queue), Frame::new(queue_min)));
        }
    }

    finish(total_min, disconnects)
}

fn finish(total_min: i32, disconnects: Vec<(PlayerHandle, Frame)>) -> ConsensusOutcome {
    ConsensusOutcome {
        min_confirmed: (total_min != i32::MAX).then(|| Frame::new(total_min)),
        disconnects,
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

    fn handles(raw: &[usize]) -> Vec<PlayerHandle> {
        raw.iter().copied().map(PlayerHandle::new).collect()
    }

    // ==========================================
    // Two players
    // ==========================================

    #[test]
    fn two_players_take_the_local_minimum() {
        let local = [status(10, false), status(7, false)];
        let remote = [status(10, false), status(9, false)];
        let hosted = handles(&[1]);
        let endpoints = [EndpointReport {
            handles: &hosted,
            running: true,
            peer_status: &remote,
        }];
        let outcome = poll_two_players(&local, &endpoints);
        assert_eq!(outcome.min_confirmed, Some(Frame::new(7)));
        assert!(outcome.disconnects.is_empty());
    }

    #[test]
    fn two_players_skip_disconnected_queues() {
        let local = [status(10, false), status(3, true)];
        let outcome = poll_two_players(&local, &[]);
        assert_eq!(outcome.min_confirmed, Some(Frame::new(10)));
    }

    #[test]
    fn remote_disconnect_report_disconnects_locally() {
        let local = [status(10, false), status(8, false)];
        let remote = [status(10, false), status(6, true)];
        let hosted = handles(&[1]);
        let endpoints = [EndpointReport {
            handles: &hosted,
            running: true,
            peer_status: &remote,
        }];
        let outcome = poll_two_players(&local, &endpoints);
        assert_eq!(outcome.disconnects, vec![(PlayerHandle::new(1), Frame::new(8))]);
        assert_eq!(outcome.min_confirmed, Some(Frame::new(8)));
    }

    #[test]
    fn remote_disconnect_syncs_to_the_minimum_so_far() {
        // queue 0 is behind, so the drop of queue 1 lands on its frame
        let local = [status(5, false), status(9, false)];
        let remote = [status(5, false), status(12, true)];
        let hosted = handles(&[1]);
        let endpoints = [EndpointReport {
            handles: &hosted,
            running: true,
            peer_status: &remote,
        }];
        let outcome = poll_two_players(&local, &endpoints);
        assert_eq!(outcome.disconnects, vec![(PlayerHandle::new(1), Frame::new(5))]);
    }

    #[test]
    fn syncing_endpoint_is_not_a_witness() {
        let local = [status(4, false), status(2, false)];
        let remote = [status(0, true), status(0, true)];
        let hosted = handles(&[1]);
        let endpoints = [EndpointReport {
            handles: &hosted,
            running: false,
            peer_status: &remote,
        }];
        let outcome = poll_two_players(&local, &endpoints);
        assert!(outcome.disconnects.is_empty());
        assert_eq!(outcome.min_confirmed, Some(Frame::new(2)));
    }

    #[test]
    fn nothing_connected_confirms_nothing() {
        let local = [status(4, true), status(2, true)];
        assert_eq!(poll_two_players(&local, &[]).min_confirmed, None);
    }

    // ==========================================
    // N players
    // ==========================================

    #[test]
    fn n_players_take_the_minimum_across_endpoints() {
        let local = [status(20, false), status(15, false), status(18, false)];
        let view_1 = [status(19, false), status(15, false), status(12, false)];
        let view_2 = [status(20, false), status(14, false), status(18, false)];
        let (h1, h2) = (handles(&[1]), handles(&[2]));
        let endpoints = [
            EndpointReport {
                handles: &h1,
                running: true,
                peer_status: &view_1,
            },
            EndpointReport {
                handles: &h2,
                running: true,
                peer_status: &view_2,
            },
        ];
        let outcome = poll_n_players(&local, &endpoints);
        assert_eq!(outcome.min_confirmed, Some(Frame::new(12)));
        assert!(outcome.disconnects.is_empty());
    }

    #[test]
    fn one_dissenting_endpoint_disconnects_the_queue() {
        let local = [status(20, false), status(15, false), status(18, false)];
        let view_1 = [status(20, false), status(15, false), status(11, true)];
        let view_2 = [status(20, false), status(15, false), status(18, false)];
        let (h1, h2) = (handles(&[1]), handles(&[2]));
        let endpoints = [
            EndpointReport {
                handles: &h1,
                running: true,
                peer_status: &view_1,
            },
            EndpointReport {
                handles: &h2,
                running: true,
                peer_status: &view_2,
            },
        ];
        let outcome = poll_n_players(&local, &endpoints);
        assert_eq!(outcome.disconnects, vec![(PlayerHandle::new(2), Frame::new(11))]);
        // the dropped queue no longer holds back the others
        assert_eq!(outcome.min_confirmed, Some(Frame::new(15)));
    }

    #[test]
    fn earlier_disconnect_frame_resyncs() {
        let local = [status(20, false), status(15, false), status(14, true)];
        let view = [status(20, false), status(15, false), status(9, true)];
        let hosted = handles(&[1]);
        let endpoints = [EndpointReport {
            handles: &hosted,
            running: true,
            peer_status: &view,
        }];
        let outcome = poll_n_players(&local, &endpoints);
        assert_eq!(outcome.disconnects, vec![(PlayerHandle::new(2), Frame::new(9))]);
    }

    #[test]
    fn agreeing_disconnect_is_not_repeated() {
        let local = [status(20, false), status(15, false), status(9, true)];
        let view = [status(20, false), status(15, false), status(9, true)];
        let hosted = handles(&[1]);
        let endpoints = [EndpointReport {
            handles: &hosted,
            running: true,
            peer_status: &view,
        }];
        let outcome = poll_n_players(&local, &endpoints);
        assert!(outcome.disconnects.is_empty());
    }

    #[test]
    fn dispatch_by_player_count() {
        let two = [status(1, false), status(2, false)];
        assert_eq!(min_confirmed_frame(&two, &[]), poll_two_players(&two, &[]));
        let three = [status(1, false), status(2, false), status(3, false)];
        assert_eq!(min_confirmed_frame(&three, &[]), poll_n_players(&three, &[]));
    }
}
