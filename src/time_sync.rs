//! Frame-advantage estimation.
//!
//! Every time a local input is queued for a peer, the connection records two
//! numbers: how far ahead we believe we are (`local`) and how far ahead the
//! peer says it is (`remote`, from its last quality report). Averaged over a
//! window, half their difference is how many frames the leading side should
//! idle so both meet in the middle.

use crate::report_violation;
use crate::telemetry::{ViolationKind, ViolationSeverity};
use crate::Frame;

/// Tuning for [`TimeSync`].
///
/// ```
/// use bastion_netcode::TimeSyncConfig;
///
/// let smooth = TimeSyncConfig {
///     window_size: 60,
///     ..TimeSyncConfig::default()
/// };
/// assert_eq!(smooth.min_frame_advantage, 3);
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[must_use = "TimeSyncConfig has no effect unless placed in a SessionConfig"]
pub struct TimeSyncConfig {
    /// Number of frames the averages span. Default 30, half a second at 60 FPS.
    pub window_size: usize,
    /// Recommendations smaller than this become zero so jitter doesn't stutter
    /// the game. Default 3.
    pub min_frame_advantage: i32,
    /// Cap on a single recommendation. Default 9.
    pub max_frame_advantage: i32,
}

impl Default for TimeSyncConfig {
    fn default() -> Self {
        Self {
            window_size: 30,
            min_frame_advantage: 3,
            max_frame_advantage: 9,
        }
    }
}

impl TimeSyncConfig {
    /// The default tuning.
    pub fn new() -> Self {
        Self::default()
    }

    /// Half the window: reacts to drift twice as fast.
    pub fn responsive() -> Self {
        Self {
            window_size: 15,
            ..Self::default()
        }
    }

    /// Short window and a lower threshold for stable local networks.
    pub fn lan() -> Self {
        Self {
            window_size: 10,
            min_frame_advantage: 2,
            ..Self::default()
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
struct Sample {
    local: i32,
    remote: i32,
}

/// Windowed local/remote frame-advantage estimator.
///
/// The window starts filled with zeroes, so early estimates are damped.
/// Samples are slotted by frame number; a frame reported twice overwrites
/// its own slot.
///
/// Re-exported in [`__internal`](crate::__internal) for tests.
#[derive(Debug, Clone)]
pub struct TimeSync {
    samples: Vec<Sample>,
    local_sum: i64,
    remote_sum: i64,
    min_frame_advantage: i32,
    max_frame_advantage: i32,
}

impl Default for TimeSync {
    fn default() -> Self {
        Self::with_config(TimeSyncConfig::default())
    }
}

impl TimeSync {
    /// An estimator with the default tuning.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// An estimator with `config`. A zero window is treated as one frame.
    #[must_use]
    pub fn with_config(config: TimeSyncConfig) -> Self {
        Self {
            samples: vec![Sample::default(); config.window_size.max(1)],
            local_sum: 0,
            remote_sum: 0,
            min_frame_advantage: config.min_frame_advantage,
            max_frame_advantage: config.max_frame_advantage,
        }
    }

    /// Records the advantages seen when the input for `frame` was queued.
    pub fn advance_frame(&mut self, frame: Frame, local_adv: i32, remote_adv: i32) {
        if !frame.is_valid() {
            report_violation!(
                ViolationSeverity::Warning,
                ViolationKind::Synchronization,
                "ignoring frame advantage sample for invalid frame {}",
                frame
            );
            return;
        }
        let window = self.samples.len();
        let Some(slot) = self.samples.get_mut(frame.as_i32() as usize % window) else {
            return;
        };
        self.local_sum += i64::from(local_adv) - i64::from(slot.local);
        self.remote_sum += i64::from(remote_adv) - i64::from(slot.remote);
        *slot = Sample {
            local: local_adv,
            remote: remote_adv,
        };
    }

    /// Sum of `remote - local` over the window, and twice the window length.
    fn spread(&self) -> (i64, i64) {
        (self.remote_sum - self.local_sum, 2 * self.samples.len() as i64)
    }

    /// Half the average gap between remote and local advantage, rounded toward zero.
    ///
    /// Positive when the peer is ahead of us.
    #[must_use]
    pub fn average_frame_advantage(&self) -> i32 {
        let (spread, divisor) = self.spread();
        (spread / divisor) as i32
    }

    /// How many frames we should idle so the peer can catch up.
    ///
    /// Half the average gap rounded to the nearest frame, zero below the
    /// configured minimum, capped at the maximum.
    #[must_use]
    pub fn recommend_frame_delay(&self) -> u32 {
        let (spread, divisor) = self.spread();
        if spread <= 0 {
            return 0;
        }
        let frames = (spread + divisor / 2) / divisor;
        if frames < i64::from(self.min_frame_advantage) {
            return 0;
        }
        frames.min(i64::from(self.max_frame_advantage)).max(0) as u32
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

    const WINDOW: i32 = 30;

    fn filled(local_adv: i32, remote_adv: i32) -> TimeSync {
        let mut time_sync = TimeSync::default();
        for frame in 0..WINDOW {
            time_sync.advance_frame(Frame::new(frame), local_adv, remote_adv);
        }
        time_sync
    }

    #[test]
    fn even_peers_need_no_delay() {
        let time_sync = filled(0, 0);
        assert_eq!(time_sync.average_frame_advantage(), 0);
        assert_eq!(time_sync.recommend_frame_delay(), 0);
    }

    #[test]
    fn leading_peer_is_told_to_wait() {
        let time_sync = filled(-4, 4);
        assert_eq!(time_sync.average_frame_advantage(), 4);
        assert_eq!(time_sync.recommend_frame_delay(), 4);
    }

    #[test]
    fn trailing_peer_never_waits() {
        let time_sync = filled(5, -5);
        assert_eq!(time_sync.average_frame_advantage(), -5);
        assert_eq!(time_sync.recommend_frame_delay(), 0);
    }

    #[test]
    fn small_gap_rounds_to_nothing() {
        // (2 - -2) / 2 = 2, under the minimum of 3
        assert_eq!(filled(-2, 2).recommend_frame_delay(), 0);
    }

    #[test]
    fn recommendation_rounds_half_up() {
        // gap 5 per frame: 2.5 rounds to 3
        assert_eq!(filled(0, 5).recommend_frame_delay(), 3);
        assert_eq!(filled(0, 5).average_frame_advantage(), 2);
    }

    #[test]
    fn recommendation_is_capped() {
        let time_sync = filled(-40, 40);
        assert_eq!(time_sync.average_frame_advantage(), 40);
        assert_eq!(time_sync.recommend_frame_delay(), 9);
    }

    #[test]
    fn newer_frames_replace_older_ones() {
        let mut time_sync = filled(10, -10);
        for frame in WINDOW..2 * WINDOW {
            time_sync.advance_frame(Frame::new(frame), -10, 10);
        }
        assert_eq!(time_sync.average_frame_advantage(), 10);
    }

    #[test]
    fn unfilled_slots_damp_the_average() {
        let mut time_sync = TimeSync::default();
        for frame in 0..WINDOW / 2 {
            time_sync.advance_frame(Frame::new(frame), 10, -10);
        }
        assert_eq!(time_sync.average_frame_advantage(), -5);
    }

    #[test]
    fn repeated_frame_overwrites_its_slot() {
        let mut time_sync = TimeSync::default();
        time_sync.advance_frame(Frame::new(1000), 0, 300);
        time_sync.advance_frame(Frame::new(1000), 0, 0);
        assert_eq!(time_sync.average_frame_advantage(), 0);
    }

    #[test]
    fn null_frame_is_ignored() {
        let mut time_sync = TimeSync::default();
        time_sync.advance_frame(Frame::NULL, -99, 99);
        assert_eq!(time_sync.average_frame_advantage(), 0);
    }

    #[test]
    fn custom_limits_apply() {
        let mut time_sync = TimeSync::with_config(TimeSyncConfig {
            window_size: 1,
            min_frame_advantage: 1,
            max_frame_advantage: 2,
        });
        time_sync.advance_frame(Frame::new(0), 0, 4);
        assert_eq!(time_sync.recommend_frame_delay(), 2);
    }

    #[test]
    fn zero_window_behaves_like_one() {
        let mut time_sync = TimeSync::with_config(TimeSyncConfig {
            window_size: 0,
            ..TimeSyncConfig::default()
        });
        time_sync.advance_frame(Frame::new(7), -3, 3);
        assert_eq!(time_sync.average_frame_advantage(), 3);
    }
}
