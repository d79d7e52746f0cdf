//! Common test infrastructure shared across integration tests.
//!
//! This module provides:
//! - `stubs`: A simulator stub and a struct-based input type
//! - `test_utils`: The loopback network, the virtual clock and peer helpers
//!
//! # Usage
//!
//! From any integration test file:
//! ```ignore
//! #[path = "common/mod.rs"]
//! mod common;
//! use common::{synchronize, test_addr, LoopbackNetwork, TestClock, TestPeer};
//! ```

pub mod stubs;
pub mod test_utils;

// Re-export commonly used items for convenience.
// Not every test binary uses every helper.
#[allow(unused_imports)]
pub use test_utils::{
    play_frames, poll_all, quiet_config, run_until, settle, synchronize, test_addr,
    LoopbackNetwork, LoopbackSocket, TestClock, TestPeer, MAX_SYNC_ITERATIONS, TICK,
};
