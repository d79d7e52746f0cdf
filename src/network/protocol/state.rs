//! Connection state machine.
//!
//! # State Machine Diagram
//!
//! ```text
//! ┌──────────────┐  synchronize()  ┌─────────┐  last sync reply  ┌─────────┐
//! │ Initializing │ ───────────────►│ Syncing │ ─────────────────►│ Running │
//! └──────────────┘                 └────┬────┘                   └────┬────┘
//!                                       │ retries exhausted           │ disconnect()
//!                                       │ (SyncFailure)               │ or checksum mismatch
//!                                       ▼                             ▼
//!                                 ┌──────────────┐◄──────────────────┘
//!                                 │ Disconnected │
//!                                 └──────┬───────┘
//!                                        │ shutdown_delay elapsed
//!                                        ▼
//!                                  ┌──────────┐
//!                                  │ Shutdown │
//!                                  └──────────┘
//! ```
//!
//! ## State Transitions
//!
//! | From         | To           | Trigger                                      |
//! |--------------|--------------|----------------------------------------------|
//! | Initializing | Syncing      | `synchronize()`                              |
//! | Syncing      | Running      | Every handshake roundtrip completed          |
//! | Syncing      | Disconnected | `max_sync_retries` exceeded                  |
//! | Running      | Disconnected | `disconnect()`, consistency failure          |
//! | Disconnected | Shutdown     | `shutdown_delay` elapsed, token cancelled    |
//!
//! A silent peer does not change the state by itself: the connection emits
//! `Disconnected` and the owning session calls `disconnect()`.

/// Where a peer connection is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ProtocolState {
    /// Created, handshake not started. Nothing is sent or processed.
    Initializing,

    /// Exchanging `SyncRequest` / `SyncReply` roundtrips.
    ///
    /// Only handshake messages are accepted; the sync retry timer is the only
    /// timer running.
    Syncing,

    /// Normal operation: inputs, acks, quality reports and consistency checks
    /// flow, and every periodic timer runs.
    Running,

    /// Peer gone or dropped. Only pending sends are flushed until the shutdown
    /// deadline passes.
    Disconnected,

    /// Terminal. The cancellation token has fired and the connection should
    /// be discarded.
    Shutdown,
}

impl ProtocolState {
    /// The status reported to callers.
    #[must_use]
    pub const fn status(self) -> PeerStatus {
        match self {
            Self::Initializing | Self::Syncing => PeerStatus::Syncing,
            Self::Running => PeerStatus::Running,
            Self::Disconnected | Self::Shutdown => PeerStatus::Disconnected,
        }
    }

    /// Short name for logs.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Initializing => "Initializing",
            Self::Syncing => "Syncing",
            Self::Running => "Running",
            Self::Disconnected => "Disconnected",
            Self::Shutdown => "Shutdown",
        }
    }
}

/// Caller-facing connection status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PeerStatus {
    /// Handshake not finished.
    Syncing,
    /// Exchanging inputs.
    Running,
    /// No longer exchanging inputs.
    Disconnected,
}
