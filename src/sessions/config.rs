//! Configuration types for peer connections and sessions.
//!
//! | Config Type | Purpose | Key Presets |
//! |-------------|---------|-------------|
//! | `SyncConfig` | Sync handshake and idle traffic | `lan()`, `high_latency()`, `lossy()` |
//! | `ProtocolConfig` | Protocol timers, limits and wire options | `competitive()`, `mobile()`, `deterministic()` |
//! | `ConsistencyConfig` | Periodic checksum audits | `disabled()` |
//! | `DelayConfig` | Artificial latency for the outbound pump | `constant()`, `gaussian()` |
//! | `TimeSyncConfig` | Frame advantage window | `lan()`, `responsive()` |
//!
//! # Example
//!
//! ```
//! use bastion_netcode::sessions::config::{ProtocolConfig, SessionConfig, SyncConfig};
//!
//! let config = SessionConfig {
//!     num_players: 2,
//!     sync: SyncConfig::lan(),
//!     protocol: ProtocolConfig::competitive(),
//!     ..SessionConfig::default()
//! };
//! assert!(config.validate().is_ok());
//! ```

use web_time::Duration;

use crate::network::wire::Endianness;
use crate::report_violation;
use crate::telemetry::{ViolationKind, ViolationSeverity};
use crate::BastionError;

pub use crate::time_sync::TimeSyncConfig;

pub(crate) fn check_range(field: &'static str, actual: u64, min: u64, max: u64) -> Result<(), BastionError> {
    if actual < min || actual > max {
        report_violation!(
            ViolationSeverity::Error,
            ViolationKind::Configuration,
            "{} = {} outside [{}, {}]",
            field,
            actual,
            min,
            max
        );
        return Err(BastionError::ConfigValueOutOfRange {
            field,
            min,
            max,
            actual,
        });
    }
    Ok(())
}

fn check_millis(
    field: &'static str,
    actual: Duration,
    min_ms: u64,
    max_ms: u64,
) -> Result<(), BastionError> {
    check_range(field, actual.as_millis() as u64, min_ms, max_ms)
}

/// Configuration for the synchronization handshake and idle traffic.
///
/// # Forward Compatibility
///
/// New fields may be added in future versions. Construct instances with the
/// `..SyncConfig::default()` pattern.
///
/// # Example
///
/// ```
/// use bastion_netcode::sessions::config::SyncConfig;
/// use web_time::Duration;
///
/// let patient = SyncConfig {
///     max_sync_retries: None,
///     sync_retry_interval: Duration::from_millis(500),
///     ..SyncConfig::default()
/// };
/// assert_eq!(patient.num_sync_roundtrips, 5);
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[must_use = "SyncConfig has no effect unless placed in a SessionConfig"]
pub struct SyncConfig {
    /// Successful request/reply roundtrips required before the connection is
    /// considered synchronized.
    ///
    /// Default: 5
    pub num_sync_roundtrips: u32,

    /// Wait before resending the very first sync request.
    ///
    /// Default: 500ms
    pub sync_first_retry_interval: Duration,

    /// Wait before resending any later sync request.
    ///
    /// Default: 200ms
    pub sync_retry_interval: Duration,

    /// Resends allowed before the handshake is abandoned with `SyncFailure`.
    /// `None` retries forever.
    ///
    /// Default: `Some(50)`
    pub max_sync_retries: Option<u32>,

    /// Time without receiving anything after which pending inputs are pushed again.
    ///
    /// Default: 200ms
    pub running_retry_interval: Duration,

    /// Time without sending anything after which a keep-alive goes out.
    ///
    /// Default: 200ms
    pub keepalive_interval: Duration,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            num_sync_roundtrips: 5,
            sync_first_retry_interval: Duration::from_millis(500),
            sync_retry_interval: Duration::from_millis(200),
            max_sync_retries: Some(50),
            running_retry_interval: Duration::from_millis(200),
            keepalive_interval: Duration::from_millis(200),
        }
    }
}

impl SyncConfig {
    /// Creates a new `SyncConfig` with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Preset for LAN play: short intervals, fewer roundtrips.
    pub fn lan() -> Self {
        Self {
            num_sync_roundtrips: 3,
            sync_first_retry_interval: Duration::from_millis(200),
            sync_retry_interval: Duration::from_millis(100),
            max_sync_retries: Some(50),
            running_retry_interval: Duration::from_millis(100),
            keepalive_interval: Duration::from_millis(100),
        }
    }

    /// Preset for high-latency networks (100-200ms RTT).
    pub fn high_latency() -> Self {
        Self {
            num_sync_roundtrips: 5,
            sync_first_retry_interval: Duration::from_millis(800),
            sync_retry_interval: Duration::from_millis(400),
            max_sync_retries: Some(60),
            running_retry_interval: Duration::from_millis(400),
            keepalive_interval: Duration::from_millis(400),
        }
    }

    /// Preset for lossy networks (5-15% packet loss).
    pub fn lossy() -> Self {
        Self {
            num_sync_roundtrips: 8,
            max_sync_retries: Some(120),
            ..Self::default()
        }
    }

    /// Validates the sync configuration.
    ///
    /// # Errors
    ///
    /// Returns [`BastionError::ConfigValueOutOfRange`] for the first field out of range.
    pub fn validate(&self) -> Result<(), BastionError> {
        check_range(
            "num_sync_roundtrips",
            u64::from(self.num_sync_roundtrips),
            1,
            100,
        )?;
        check_millis(
            "sync_first_retry_interval",
            self.sync_first_retry_interval,
            1,
            60_000,
        )?;
        check_millis("sync_retry_interval", self.sync_retry_interval, 1, 60_000)?;
        if let Some(retries) = self.max_sync_retries {
            check_range("max_sync_retries", u64::from(retries), 1, 100_000)?;
        }
        check_millis("running_retry_interval", self.running_retry_interval, 1, 60_000)?;
        check_millis("keepalive_interval", self.keepalive_interval, 1, 60_000)?;
        Ok(())
    }
}

/// Configuration for protocol timers, limits and wire options.
///
/// # Example
///
/// ```
/// use bastion_netcode::sessions::config::ProtocolConfig;
/// use web_time::Duration;
///
/// let tolerant = ProtocolConfig {
///     disconnect_timeout: Duration::from_secs(10),
///     disconnect_notify_start: Duration::from_secs(2),
///     ..ProtocolConfig::default()
/// };
/// assert!(tolerant.validate().is_ok());
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[must_use = "ProtocolConfig has no effect unless placed in a SessionConfig"]
pub struct ProtocolConfig {
    /// Interval between quality reports (ping plus frame advantage).
    ///
    /// Default: 1000ms
    pub quality_report_interval: Duration,

    /// Interval between network stats recomputations.
    ///
    /// Default: 1000ms
    pub network_stats_interval: Duration,

    /// Silence after which the peer is declared disconnected.
    ///
    /// Default: 5000ms
    pub disconnect_timeout: Duration,

    /// Silence after which a `NetworkInterrupted` warning is emitted.
    ///
    /// Default: 750ms
    pub disconnect_notify_start: Duration,

    /// Time spent in `Disconnected` before the connection shuts down for good.
    ///
    /// Default: 5000ms
    pub shutdown_delay: Duration,

    /// Unacknowledged local inputs kept before `send_input` reports `FullQueue`.
    ///
    /// Default: 128
    pub pending_output_limit: usize,

    /// Bit budget for the delta-encoded run in one input message.
    ///
    /// Must hold two worst-case frames, the acknowledged one that is resent
    /// and the newest; connections check this against their frame size.
    ///
    /// Default: 8192
    pub max_input_bits: usize,

    /// Largest forward sequence jump accepted from the peer.
    ///
    /// Default: 32768
    pub max_sequence_distance: u16,

    /// Messages the outbound queue holds before dropping the oldest.
    ///
    /// Default: 64
    pub outbox_capacity: usize,

    /// Byte order of the wire format. Both peers must agree.
    ///
    /// Default: `Little`
    pub endianness: Endianness,

    /// Disconnect a peer whose gossip moves a confirmed frame backward.
    /// When false the regression is only reported.
    ///
    /// Default: false
    pub disconnect_on_status_regression: bool,

    /// Seed for magic numbers and handshake nonces. `None` draws from entropy.
    ///
    /// Default: `None`
    pub protocol_rng_seed: Option<u64>,
}

impl Default for ProtocolConfig {
    fn default() -> Self {
        Self {
            quality_report_interval: Duration::from_millis(1000),
            network_stats_interval: Duration::from_millis(1000),
            disconnect_timeout: Duration::from_millis(5000),
            disconnect_notify_start: Duration::from_millis(750),
            shutdown_delay: Duration::from_millis(5000),
            pending_output_limit: 128,
            max_input_bits: 8192,
            max_sequence_distance: 32768,
            outbox_capacity: 64,
            endianness: Endianness::Little,
            disconnect_on_status_regression: false,
            protocol_rng_seed: None,
        }
    }
}

impl ProtocolConfig {
    /// Creates a new `ProtocolConfig` with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Preset for competitive/LAN play: frequent reports, quick disconnects.
    pub fn competitive() -> Self {
        Self {
            quality_report_interval: Duration::from_millis(200),
            disconnect_timeout: Duration::from_millis(3000),
            disconnect_notify_start: Duration::from_millis(500),
            shutdown_delay: Duration::from_millis(3000),
            ..Self::default()
        }
    }

    /// Preset for mobile networks, tolerant of handoffs and jitter.
    pub fn mobile() -> Self {
        Self {
            quality_report_interval: Duration::from_millis(1500),
            network_stats_interval: Duration::from_millis(2000),
            disconnect_timeout: Duration::from_millis(10_000),
            disconnect_notify_start: Duration::from_millis(2000),
            shutdown_delay: Duration::from_millis(15_000),
            pending_output_limit: 256,
            outbox_capacity: 128,
            ..Self::default()
        }
    }

    /// Preset with a fixed RNG seed so magic numbers and nonces are reproducible.
    ///
    /// ```
    /// use bastion_netcode::sessions::config::ProtocolConfig;
    ///
    /// let config = ProtocolConfig::deterministic(42);
    /// assert_eq!(config.protocol_rng_seed, Some(42));
    /// ```
    pub fn deterministic(seed: u64) -> Self {
        Self {
            protocol_rng_seed: Some(seed),
            ..Self::default()
        }
    }

    /// Validates the protocol configuration.
    ///
    /// # Errors
    ///
    /// Returns [`BastionError::ConfigValueOutOfRange`] for the first field out of
    /// range, or [`BastionError::InvalidRequest`] if the notify threshold is not
    /// below the disconnect timeout.
    pub fn validate(&self) -> Result<(), BastionError> {
        check_millis(
            "quality_report_interval",
            self.quality_report_interval,
            1,
            60_000,
        )?;
        check_millis(
            "network_stats_interval",
            self.network_stats_interval,
            1,
            60_000,
        )?;
        check_millis("disconnect_timeout", self.disconnect_timeout, 1, 300_000)?;
        check_millis(
            "disconnect_notify_start",
            self.disconnect_notify_start,
            1,
            300_000,
        )?;
        check_millis("shutdown_delay", self.shutdown_delay, 1, 300_000)?;
        check_range(
            "pending_output_limit",
            self.pending_output_limit as u64,
            1,
            4096,
        )?;
        check_range("max_input_bits", self.max_input_bits as u64, 64, 65_535)?;
        check_range(
            "max_sequence_distance",
            u64::from(self.max_sequence_distance),
            1,
            32768,
        )?;
        check_range("outbox_capacity", self.outbox_capacity as u64, 1, 65_536)?;
        if self.disconnect_notify_start >= self.disconnect_timeout {
            return Err(BastionError::InvalidRequest {
                info: format!(
                    "disconnect_notify_start ({:?}) must be shorter than disconnect_timeout ({:?})",
                    self.disconnect_notify_start, self.disconnect_timeout
                ),
            });
        }
        Ok(())
    }
}

/// Configuration for periodic checksum audits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[must_use = "ConsistencyConfig has no effect unless placed in a SessionConfig"]
pub struct ConsistencyConfig {
    /// Whether audits run at all.
    ///
    /// Default: true
    pub enabled: bool,

    /// Time between audits.
    ///
    /// Default: 3000ms
    pub interval: Duration,

    /// How far behind the last received frame the audited frame is picked.
    ///
    /// Default: 8
    pub frame_offset: u32,

    /// Only audit once a quality report roundtrip has measured the ping.
    ///
    /// Default: true
    pub require_ping_baseline: bool,
}

impl Default for ConsistencyConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval: Duration::from_millis(3000),
            frame_offset: 8,
            require_ping_baseline: true,
        }
    }
}

impl ConsistencyConfig {
    /// Audits switched off.
    pub fn disabled() -> Self {
        Self {
            enabled: false,
            ..Self::default()
        }
    }

    /// Validates the consistency configuration.
    ///
    /// # Errors
    ///
    /// Returns [`BastionError::ConfigValueOutOfRange`] for an out-of-range field.
    pub fn validate(&self) -> Result<(), BastionError> {
        check_millis("consistency_interval", self.interval, 1, 600_000)?;
        check_range(
            "consistency_frame_offset",
            u64::from(self.frame_offset),
            0,
            1024,
        )?;
        Ok(())
    }
}

/// Distribution of the artificial delay added by the outbound pump.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub enum DelayStrategy {
    /// Send immediately; `base_latency` is ignored.
    #[default]
    None,
    /// Always wait `base_latency`.
    Constant,
    /// `base_latency` plus normally distributed jitter, clamped at zero.
    Gaussian {
        /// Standard deviation of the jitter.
        std_dev: Duration,
    },
    /// Uniform in `base_latency ± spread`, clamped at zero.
    ContinuousUniform {
        /// Half-width of the interval.
        spread: Duration,
    },
}

/// Network condition emulation for the outbound pump.
///
/// # Example
///
/// ```
/// use bastion_netcode::sessions::config::DelayConfig;
/// use web_time::Duration;
///
/// let wan = DelayConfig::gaussian(Duration::from_millis(60), Duration::from_millis(15));
/// assert!(wan.is_active());
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Default)]
#[must_use = "DelayConfig has no effect unless placed in a SessionConfig"]
pub struct DelayConfig {
    /// Latency every sample is centered on.
    pub base_latency: Duration,
    /// How samples are drawn.
    pub strategy: DelayStrategy,
    /// Seed for the sampling RNG. `None` draws from entropy.
    pub seed: Option<u64>,
}

impl DelayConfig {
    /// A fixed delay.
    pub fn constant(latency: Duration) -> Self {
        Self {
            base_latency: latency,
            strategy: DelayStrategy::Constant,
            seed: None,
        }
    }

    /// A delay with gaussian jitter.
    pub fn gaussian(base_latency: Duration, std_dev: Duration) -> Self {
        Self {
            base_latency,
            strategy: DelayStrategy::Gaussian { std_dev },
            seed: None,
        }
    }

    /// A delay drawn uniformly from `base_latency ± spread`.
    pub fn uniform(base_latency: Duration, spread: Duration) -> Self {
        Self {
            base_latency,
            strategy: DelayStrategy::ContinuousUniform { spread },
            seed: None,
        }
    }

    /// Uses `seed` for reproducible samples.
    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = Some(seed);
        self
    }

    /// Whether any delay is applied.
    #[must_use]
    pub fn is_active(&self) -> bool {
        !matches!(self.strategy, DelayStrategy::None)
    }
}

/// Everything a [`PeerSession`](crate::sessions::peer_session::PeerSession) is configured with.
///
/// The input size is not configured here; it is derived from
/// [`Config::Input`](crate::Config::Input) when the session is created.
#[derive(Debug, Clone, Copy, PartialEq)]
#[must_use = "SessionConfig has no effect unless passed to PeerSession::new()"]
pub struct SessionConfig {
    /// Number of player queues, local and remote.
    ///
    /// Default: 2
    pub num_players: usize,
    /// Handshake settings.
    pub sync: SyncConfig,
    /// Protocol settings.
    pub protocol: ProtocolConfig,
    /// Checksum audit settings.
    pub consistency: ConsistencyConfig,
    /// Frame advantage settings.
    pub time_sync: TimeSyncConfig,
    /// Outbound delay emulation.
    pub delay: DelayConfig,
}

/// Most player queues a session supports.
pub const MAX_PLAYERS: usize = 16;

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            num_players: 2,
            sync: SyncConfig::default(),
            protocol: ProtocolConfig::default(),
            consistency: ConsistencyConfig::default(),
            time_sync: TimeSyncConfig::default(),
            delay: DelayConfig::default(),
        }
    }
}

impl SessionConfig {
    /// Validates every nested configuration.
    ///
    /// # Errors
    ///
    /// The first validation failure found.
    pub fn validate(&self) -> Result<(), BastionError> {
        check_range("num_players", self.num_players as u64, 1, MAX_PLAYERS as u64)?;
        self.sync.validate()?;
        self.protocol.validate()?;
        self.consistency.validate()?;
        check_range("window_size", self.time_sync.window_size as u64, 1, 600)?;
        Ok(())
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
    fn defaults_validate() {
        SyncConfig::default().validate().unwrap();
        ProtocolConfig::default().validate().unwrap();
        ConsistencyConfig::default().validate().unwrap();
        SessionConfig::default().validate().unwrap();
    }

    #[test]
    fn presets_validate() {
        for sync in [SyncConfig::lan(), SyncConfig::high_latency(), SyncConfig::lossy()] {
            sync.validate().unwrap();
        }
        for protocol in [
            ProtocolConfig::competitive(),
            ProtocolConfig::mobile(),
            ProtocolConfig::deterministic(7),
        ] {
            protocol.validate().unwrap();
        }
    }

    #[test]
    fn documented_defaults() {
        let sync = SyncConfig::default();
        assert_eq!(sync.num_sync_roundtrips, 5);
        assert_eq!(sync.sync_first_retry_interval, Duration::from_millis(500));
        assert_eq!(sync.max_sync_retries, Some(50));

        let protocol = ProtocolConfig::default();
        assert_eq!(protocol.disconnect_timeout, Duration::from_millis(5000));
        assert_eq!(protocol.disconnect_notify_start, Duration::from_millis(750));
        assert_eq!(protocol.max_sequence_distance, 32768);
        assert_eq!(protocol.endianness, Endianness::Little);
        assert!(!protocol.disconnect_on_status_regression);

        let consistency = ConsistencyConfig::default();
        assert!(consistency.enabled);
        assert_eq!(consistency.frame_offset, 8);
    }

    #[test]
    fn zero_roundtrips_rejected() {
        let config = SyncConfig {
            num_sync_roundtrips: 0,
            ..SyncConfig::default()
        };
        assert_eq!(
            config.validate(),
            Err(BastionError::ConfigValueOutOfRange {
                field: "num_sync_roundtrips",
                min: 1,
                max: 100,
                actual: 0,
            })
        );
    }

    #[test]
    fn notify_must_precede_timeout() {
        let config = ProtocolConfig {
            disconnect_notify_start: Duration::from_millis(6000),
            ..ProtocolConfig::default()
        };
        assert!(matches!(
            config.validate(),
            Err(BastionError::InvalidRequest { .. })
        ));
    }

    #[test]
    fn huge_frame_offset_rejected() {
        let config = ConsistencyConfig {
            frame_offset: 5000,
            ..ConsistencyConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn too_many_players_rejected() {
        let config = SessionConfig {
            num_players: MAX_PLAYERS + 1,
            ..SessionConfig::default()
        };
        assert!(matches!(
            config.validate(),
            Err(BastionError::ConfigValueOutOfRange {
                field: "num_players",
                ..
            })
        ));
    }

    #[test]
    fn delay_presets() {
        assert!(!DelayConfig::default().is_active());
        let constant = DelayConfig::constant(Duration::from_millis(20)).with_seed(3);
        assert_eq!(constant.strategy, DelayStrategy::Constant);
        assert_eq!(constant.seed, Some(3));
    }
}
