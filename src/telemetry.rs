//! Structured reports of misbehaving peers and broken invariants.
//!
//! Anything on the far side of a UDP socket can be stale, buggy or hostile.
//! Whenever the transport drops a packet, ignores a field or gives up on a
//! peer for such a reason it builds a [`Violation`] and hands it to a
//! [`ViolationObserver`]. Without an observer the report is logged through
//! `tracing` by [`TracingObserver`].
//!
//! ```
//! use bastion_netcode::telemetry::{CollectingObserver, ViolationKind};
//!
//! let observer = CollectingObserver::new();
//! assert_eq!(observer.count(ViolationKind::NetworkProtocol), 0);
//! ```

use crate::Frame;
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

/// Writes `None` and [`Frame::NULL`] as `null`.
mod optional_frame {
    use crate::Frame;
    use serde::Serializer;

    #[allow(clippy::ref_option)]
    pub fn serialize<S>(frame: &Option<Frame>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        match frame.filter(|frame| !frame.is_null()) {
            Some(frame) => serializer.serialize_i32(frame.as_i32()),
            None => serializer.serialize_none(),
        }
    }
}

/// How bad a violation is, from least to most severe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ViolationSeverity {
    /// The offending packet or request was dropped and nothing else changed.
    Warning,
    /// A peer misbehaved and its connection may degrade.
    Error,
    /// Simulations diverged or an internal invariant broke.
    Critical,
}

impl ViolationSeverity {
    /// Label for logs and metrics.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Warning => "warning",
            Self::Error => "error",
            Self::Critical => "critical",
        }
    }
}

impl fmt::Display for ViolationSeverity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The part of the transport that noticed the violation.
///
/// Marked `#[non_exhaustive]`; match with a wildcard arm.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, serde::Serialize)]
#[serde(rename_all = "snake_case")]
#[non_exhaustive]
pub enum ViolationKind {
    /// Datagram problems: unknown types, foreign magic numbers, socket failures.
    NetworkProtocol,
    /// The handshake stalled or was abandoned.
    Synchronization,
    /// A delta-encoded input run could not be encoded, decoded or applied.
    InputCodec,
    /// Gossiped connect status tried to move a `last_frame` backward.
    ConnectStatus,
    /// Peers reported different checksums for the same frame.
    Consistency,
    /// A setting was rejected or adjusted.
    Configuration,
    /// A bug in this crate.
    InternalError,
}

impl ViolationKind {
    /// Label for logs and metrics.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::NetworkProtocol => "network_protocol",
            Self::Synchronization => "synchronization",
            Self::InputCodec => "input_codec",
            Self::ConnectStatus => "connect_status",
            Self::Consistency => "consistency",
            Self::Configuration => "configuration",
            Self::InternalError => "internal_error",
        }
    }
}

impl fmt::Display for ViolationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One reported violation.
///
/// ```
/// use bastion_netcode::telemetry::{Violation, ViolationKind, ViolationSeverity};
/// use bastion_netcode::Frame;
///
/// let violation = Violation::new(
///     ViolationSeverity::Error,
///     ViolationKind::ConnectStatus,
///     "last_frame regressed",
///     "protocol.rs:42",
/// )
/// .with_peer("127.0.0.1:7000")
/// .with_frame(Frame::new(100))
/// .with_context("known", "120");
///
/// assert_eq!(violation.peer.as_deref(), Some("127.0.0.1:7000"));
/// ```
#[derive(Debug, Clone, PartialEq, serde::Serialize)]
pub struct Violation {
    /// How bad it is.
    pub severity: ViolationSeverity,
    /// Where it was noticed.
    pub kind: ViolationKind,
    /// What went wrong.
    pub message: String,
    /// `file:line` of the report.
    pub location: &'static str,
    /// The remote endpoint involved, rendered with `Debug`.
    pub peer: Option<String>,
    /// The frame involved.
    #[serde(serialize_with = "optional_frame::serialize")]
    pub frame: Option<Frame>,
    /// Extra key-value details.
    pub context: BTreeMap<String, String>,
}

impl Violation {
    /// Creates a report with no peer, frame or context.
    #[must_use]
    pub fn new(
        severity: ViolationSeverity,
        kind: ViolationKind,
        message: impl Into<String>,
        location: &'static str,
    ) -> Self {
        Self {
            severity,
            kind,
            message: message.into(),
            location,
            peer: None,
            frame: None,
            context: BTreeMap::new(),
        }
    }

    /// Names the remote endpoint.
    #[must_use]
    pub fn with_peer(mut self, peer: impl Into<String>) -> Self {
        self.peer = Some(peer.into());
        self
    }

    /// Attaches the frame involved.
    #[must_use]
    pub fn with_frame(mut self, frame: Frame) -> Self {
        self.frame = Some(frame);
        self
    }

    /// Adds one context entry. A repeated key replaces the earlier value.
    #[must_use]
    pub fn with_context(mut self, key: impl Into<String>, value: impl ToString) -> Self {
        self.context.insert(key.into(), value.to_string());
        self
    }

    /// The report as one line of JSON.
    #[cfg(feature = "json")]
    #[must_use]
    pub fn to_json(&self) -> Option<String> {
        serde_json::to_string(self).ok()
    }
}

impl fmt::Display for Violation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}: {}", self.severity, self.kind, self.message)?;
        if let Some(peer) = &self.peer {
            write!(f, " peer={peer}")?;
        }
        if let Some(frame) = self.frame {
            write!(f, " frame={frame}")?;
        }
        for (key, value) in &self.context {
            write!(f, " {key}={value}")?;
        }
        write!(f, " ({})", self.location)
    }
}

/// Receives violations as they are reported.
///
/// Called on the thread that polls the session; keep it cheap.
#[cfg(feature = "sync-send")]
pub trait ViolationObserver: Send + Sync {
    /// Handles one report.
    fn on_violation(&self, violation: &Violation);
}

/// Receives violations as they are reported.
///
/// Called on the thread that polls the session; keep it cheap.
#[cfg(not(feature = "sync-send"))]
pub trait ViolationObserver {
    /// Handles one report.
    fn on_violation(&self, violation: &Violation);
}

/// Logs every violation through `tracing`.
///
/// Warnings go to `warn!`, everything more severe to `error!`.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingObserver;

impl ViolationObserver for TracingObserver {
    fn on_violation(&self, violation: &Violation) {
        let peer = violation.peer.as_deref().unwrap_or("-");
        let frame = violation
            .frame
            .filter(|frame| !frame.is_null())
            .map(Frame::as_i32);
        if violation.severity == ViolationSeverity::Warning {
            tracing::warn!(
                kind = violation.kind.as_str(),
                location = violation.location,
                peer,
                frame,
                context = ?violation.context,
                "{}",
                violation.message
            );
        } else {
            tracing::error!(
                severity = violation.severity.as_str(),
                kind = violation.kind.as_str(),
                location = violation.location,
                peer,
                frame,
                context = ?violation.context,
                "{}",
                violation.message
            );
        }
    }
}

/// Keeps every violation in memory.
///
/// ```
/// use bastion_netcode::telemetry::{
///     CollectingObserver, Violation, ViolationKind, ViolationObserver, ViolationSeverity,
/// };
///
/// let observer = CollectingObserver::new();
/// observer.on_violation(&Violation::new(
///     ViolationSeverity::Warning,
///     ViolationKind::NetworkProtocol,
///     "foreign magic",
///     "inbound.rs:1",
/// ));
/// assert!(observer.has_violation(ViolationKind::NetworkProtocol));
/// assert_eq!(observer.worst(), Some(ViolationSeverity::Warning));
/// ```
#[derive(Debug, Default)]
pub struct CollectingObserver {
    violations: Mutex<Vec<Violation>>,
}

impl CollectingObserver {
    /// An empty collector.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Copies of everything collected so far.
    #[must_use]
    pub fn violations(&self) -> Vec<Violation> {
        self.violations.lock().clone()
    }

    /// Removes and returns everything collected so far.
    pub fn take(&self) -> Vec<Violation> {
        std::mem::take(&mut *self.violations.lock())
    }

    /// Number of collected reports.
    #[must_use]
    pub fn len(&self) -> usize {
        self.violations.lock().len()
    }

    /// Whether nothing was collected.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.violations.lock().is_empty()
    }

    /// Number of collected reports of `kind`.
    #[must_use]
    pub fn count(&self, kind: ViolationKind) -> usize {
        self.violations
            .lock()
            .iter()
            .filter(|violation| violation.kind == kind)
            .count()
    }

    /// Whether a report of `kind` was collected.
    #[must_use]
    pub fn has_violation(&self, kind: ViolationKind) -> bool {
        self.count(kind) > 0
    }

    /// The highest severity collected.
    #[must_use]
    pub fn worst(&self) -> Option<ViolationSeverity> {
        self.violations
            .lock()
            .iter()
            .map(|violation| violation.severity)
            .max()
    }
}

impl ViolationObserver for CollectingObserver {
    fn on_violation(&self, violation: &Violation) {
        self.violations.lock().push(violation.clone());
    }
}

/// Forwards only violations at or above a severity.
///
/// ```
/// use bastion_netcode::telemetry::{
///     CollectingObserver, SeverityFilter, Violation, ViolationKind, ViolationObserver,
///     ViolationSeverity,
/// };
/// use std::sync::Arc;
///
/// let inner = Arc::new(CollectingObserver::new());
/// let filter = SeverityFilter::new(ViolationSeverity::Error, inner.clone());
/// filter.on_violation(&Violation::new(
///     ViolationSeverity::Warning,
///     ViolationKind::NetworkProtocol,
///     "dropped",
///     "x.rs:1",
/// ));
/// assert!(inner.is_empty());
/// ```
pub struct SeverityFilter {
    threshold: ViolationSeverity,
    inner: Arc<dyn ViolationObserver>,
}

impl SeverityFilter {
    /// Forwards to `inner` whatever is at least `threshold`.
    #[must_use]
    pub fn new(threshold: ViolationSeverity, inner: Arc<dyn ViolationObserver>) -> Self {
        Self { threshold, inner }
    }
}

impl fmt::Debug for SeverityFilter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SeverityFilter")
            .field("threshold", &self.threshold)
            .finish_non_exhaustive()
    }
}

impl ViolationObserver for SeverityFilter {
    fn on_violation(&self, violation: &Violation) {
        if violation.severity >= self.threshold {
            self.inner.on_violation(violation);
        }
    }
}

/// Hands `violation` to `observer`, or logs it when there is none.
pub fn report_to_observer(observer: Option<&Arc<dyn ViolationObserver>>, violation: &Violation) {
    match observer {
        Some(observer) => observer.on_violation(violation),
        None => TracingObserver.on_violation(violation),
    }
}

/// Logs a violation tagged with the calling file and line.
///
/// ```
/// use bastion_netcode::{report_violation, telemetry::{ViolationKind, ViolationSeverity}};
///
/// report_violation!(
///     ViolationSeverity::Warning,
///     ViolationKind::NetworkProtocol,
///     "dropping datagram with tag {}",
///     42
/// );
/// ```
#[macro_export]
macro_rules! report_violation {
    ($severity:expr, $kind:expr, $($arg:tt)+) => {{
        use $crate::telemetry::ViolationObserver as _;
        $crate::telemetry::TracingObserver.on_violation(&$crate::telemetry::Violation::new(
            $severity,
            $kind,
            format!($($arg)+),
            concat!(file!(), ":", line!()),
        ));
    }};
}

/// Like [`report_violation!`], routed through an `Option<Arc<dyn ViolationObserver>>`.
#[macro_export]
macro_rules! report_violation_to {
    ($observer:expr, $severity:expr, $kind:expr, $($arg:tt)+) => {{
        $crate::telemetry::report_to_observer(
            $observer.as_ref(),
            &$crate::telemetry::Violation::new(
                $severity,
                $kind,
                format!($($arg)+),
                concat!(file!(), ":", line!()),
            ),
        );
    }};
}

/// Panics unless `observer` collected a violation of `kind`.
///
/// Meant for tests driving a [`CollectingObserver`].
#[macro_export]
macro_rules! assert_violation {
    ($observer:expr, $kind:expr) => {{
        let kind = $kind;
        assert!(
            $observer.has_violation(kind),
            "no {} violation among {:#?}",
            kind,
            $observer.violations()
        );
    }};
}

/// Panics if `observer` collected anything.
#[macro_export]
macro_rules! assert_no_violations {
    ($observer:expr) => {{
        let seen = $observer.violations();
        assert!(seen.is_empty(), "unexpected violations: {:#?}", seen);
    }};
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

    fn warning(kind: ViolationKind) -> Violation {
        Violation::new(ViolationSeverity::Warning, kind, "w", "t.rs:1")
    }

    #[test]
    fn severities_are_ordered() {
        assert!(ViolationSeverity::Warning < ViolationSeverity::Error);
        assert!(ViolationSeverity::Error < ViolationSeverity::Critical);
    }

    #[test]
    fn labels_are_snake_case() {
        assert_eq!(ViolationKind::ConnectStatus.as_str(), "connect_status");
        assert_eq!(ViolationKind::InputCodec.to_string(), "input_codec");
        assert_eq!(ViolationSeverity::Critical.to_string(), "critical");
    }

    #[test]
    fn display_lists_peer_frame_and_context() {
        let violation = Violation::new(
            ViolationSeverity::Error,
            ViolationKind::InputCodec,
            "gap in input run",
            "inbound.rs:10",
        )
        .with_peer("127.0.0.1:7001")
        .with_frame(Frame::new(50))
        .with_context("expected", 49);

        assert_eq!(
            violation.to_string(),
            "error input_codec: gap in input run peer=127.0.0.1:7001 frame=50 expected=49 (inbound.rs:10)"
        );
    }

    #[test]
    fn collector_counts_and_drains() {
        let observer = CollectingObserver::new();
        crate::assert_no_violations!(observer);
        observer.on_violation(&warning(ViolationKind::NetworkProtocol));
        observer.on_violation(&warning(ViolationKind::NetworkProtocol));
        observer.on_violation(&Violation::new(
            ViolationSeverity::Critical,
            ViolationKind::Consistency,
            "diverged",
            "t.rs:2",
        ));

        assert_eq!(observer.count(ViolationKind::NetworkProtocol), 2);
        crate::assert_violation!(observer, ViolationKind::Consistency);
        assert_eq!(observer.worst(), Some(ViolationSeverity::Critical));
        assert_eq!(observer.take().len(), 3);
        assert!(observer.is_empty());
        assert_eq!(observer.worst(), None);
    }

    #[test]
    fn filter_forwards_at_threshold() {
        let inner = Arc::new(CollectingObserver::new());
        let filter = SeverityFilter::new(ViolationSeverity::Error, inner.clone());
        filter.on_violation(&warning(ViolationKind::Synchronization));
        filter.on_violation(&Violation::new(
            ViolationSeverity::Error,
            ViolationKind::Synchronization,
            "gave up",
            "t.rs:3",
        ));
        assert_eq!(inner.len(), 1);
        assert_eq!(inner.violations()[0].severity, ViolationSeverity::Error);
    }

    #[test]
    fn macro_routes_to_observer() {
        let collecting = Arc::new(CollectingObserver::new());
        let observer: Option<Arc<dyn ViolationObserver>> = Some(collecting.clone());
        report_violation_to!(
            observer,
            ViolationSeverity::Warning,
            ViolationKind::Synchronization,
            "retry {}",
            3
        );
        report_violation_to!(
            observer,
            ViolationSeverity::Warning,
            ViolationKind::Synchronization,
            "plain"
        );
        let messages: Vec<String> = collecting
            .violations()
            .into_iter()
            .map(|violation| violation.message)
            .collect();
        assert_eq!(messages, ["retry 3", "plain"]);
    }

    #[test]
    fn missing_observer_logs_instead() {
        let observer: Option<Arc<dyn ViolationObserver>> = None;
        report_violation_to!(
            observer,
            ViolationSeverity::Error,
            ViolationKind::InternalError,
            "logged only"
        );
        report_violation!(
            ViolationSeverity::Warning,
            ViolationKind::NetworkProtocol,
            "plain {}",
            "macro"
        );
    }

    #[cfg(feature = "json")]
    #[test]
    fn json_writes_null_frame() {
        let violation = warning(ViolationKind::NetworkProtocol).with_frame(Frame::NULL);
        let json = violation.to_json().unwrap();
        assert!(json.contains(r#""frame":null"#));
        assert!(json.contains(r#""peer":null"#));
    }
}
