use std::sync::atomic::{AtomicU64, Ordering};

use web_time::Duration;

use crate::network::wire::UDP_HEADER_SIZE;
use crate::Frame;

/// A snapshot of one connection's traffic and timing.
///
/// Refreshed whenever the connection's stats timer fires, so a value can lag
/// by one interval. See [`PeerSession::network_stats`](crate::PeerSession::network_stats).
#[derive(Debug, Default, Clone, Copy, PartialEq)]
#[must_use = "NetworkStats is a snapshot and does nothing on its own"]
pub struct NetworkStats {
    /// Local inputs sent but not yet acknowledged.
    pub send_queue_len: usize,
    /// Round-trip time in milliseconds, measured with quality reports.
    pub ping: u64,
    /// Outgoing bandwidth in kilobits per second.
    pub kbps_sent: usize,
    /// Percentage of sent bytes spent on UDP/IP headers.
    pub udp_overhead_percent: f32,
    /// Datagrams sent.
    pub packets_sent: u64,
    /// Bytes sent including headers.
    pub bytes_sent: u64,
    /// Datagrams accepted.
    pub packets_received: u64,
    /// Bytes accepted including headers.
    pub bytes_received: u64,
    /// Frames we trail the peer by.
    pub local_frames_behind: i32,
    /// Frames the peer says it trails us by.
    pub remote_frames_behind: i32,
    /// Newest frame a checksum audit settled.
    pub last_compared_frame: Option<Frame>,
    /// Outcome of that audit.
    pub checksums_match: Option<bool>,
}

impl std::fmt::Display for NetworkStats {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "ping {}ms, {} queued, {} kbps ({:.1}% overhead), tx {} pkts/{} B, rx {} pkts/{} B, behind local {} remote {}",
            self.ping,
            self.send_queue_len,
            self.kbps_sent,
            self.udp_overhead_percent,
            self.packets_sent,
            self.bytes_sent,
            self.packets_received,
            self.bytes_received,
            self.local_frames_behind,
            self.remote_frames_behind,
        )?;
        match (self.last_compared_frame, self.checksums_match) {
            (Some(frame), Some(true)) => write!(f, ", audit {frame} ok"),
            (Some(frame), Some(false)) => write!(f, ", audit {frame} MISMATCH"),
            (Some(frame), None) => write!(f, ", audit {frame} pending"),
            (None, _) => Ok(()),
        }
    }
}

/// Send-side counters shared between a connection and its outbound pump.
///
/// The pump is the only writer; the connection reads them on the tick thread.
#[derive(Debug, Default)]
pub struct PeerStatsCounters {
    packets_sent: AtomicU64,
    bytes_sent: AtomicU64,
}

impl PeerStatsCounters {
    /// Records one sent datagram of `payload_len` bytes.
    pub fn record_send(&self, payload_len: usize) {
        self.packets_sent.fetch_add(1, Ordering::Relaxed);
        self.bytes_sent
            .fetch_add((payload_len + UDP_HEADER_SIZE) as u64, Ordering::Relaxed);
    }

    /// Datagrams sent so far.
    #[must_use]
    pub fn packets_sent(&self) -> u64 {
        self.packets_sent.load(Ordering::Relaxed)
    }

    /// Bytes sent so far, UDP/IP headers included.
    #[must_use]
    pub fn bytes_sent(&self) -> u64 {
        self.bytes_sent.load(Ordering::Relaxed)
    }
}

/// Bandwidth and overhead derived from the counters over `elapsed`.
///
/// Returns `(kbps_sent, udp_overhead_percent)`.
#[must_use]
pub fn bandwidth(bytes_sent: u64, packets_sent: u64, elapsed: Duration) -> (usize, f32) {
    let seconds = elapsed.as_secs_f64();
    if seconds <= 0.0 || bytes_sent == 0 {
        return (0, 0.0);
    }
    let bytes_per_second = bytes_sent as f64 / seconds;
    let overhead = 100.0 * (UDP_HEADER_SIZE as f64 * packets_sent as f64) / bytes_sent as f64;
    ((bytes_per_second * 8.0 / 1000.0) as usize, overhead as f32)
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
    fn fresh_snapshot_is_zeroed() {
        let stats = NetworkStats::default();
        assert_eq!((stats.ping, stats.send_queue_len, stats.bytes_received), (0, 0, 0));
        assert!(stats.last_compared_frame.is_none() && stats.checksums_match.is_none());
    }

    #[test]
    fn display_omits_audit_until_one_ran() {
        let stats = NetworkStats {
            ping: 38,
            send_queue_len: 4,
            local_frames_behind: -2,
            ..NetworkStats::default()
        };
        let line = stats.to_string();
        assert!(line.starts_with("ping 38ms, 4 queued"));
        assert!(line.contains("behind local -2 remote 0"));
        assert!(!line.contains("audit"));
    }

    #[test]
    fn display_flags_mismatched_audit() {
        let stats = NetworkStats {
            last_compared_frame: Some(Frame::new(120)),
            checksums_match: Some(false),
            ..NetworkStats::default()
        };
        assert!(stats.to_string().ends_with(", audit 120 MISMATCH"));
    }

    #[test]
    fn counters_include_udp_header() {
        let counters = PeerStatsCounters::default();
        counters.record_send(100);
        counters.record_send(20);

        assert_eq!(counters.packets_sent(), 2);
        assert_eq!(counters.bytes_sent(), (100 + 20 + 2 * UDP_HEADER_SIZE) as u64);
    }

    #[test]
    fn bandwidth_over_one_second() {
        let (kbps, overhead) = bandwidth(1000, 10, Duration::from_secs(1));
        assert_eq!(kbps, 8);
        assert!((overhead - 28.0).abs() < f32::EPSILON);
    }

    #[test]
    fn bandwidth_with_no_traffic_is_zero() {
        assert_eq!(bandwidth(0, 0, Duration::from_secs(5)), (0, 0.0));
        assert_eq!(bandwidth(100, 1, Duration::ZERO), (0, 0.0));
    }
}
