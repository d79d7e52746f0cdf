//! Shared unit-test fixtures.
//!
//! Under Miri the proptest case count drops so the interpreter finishes in
//! reasonable time.

use std::net::SocketAddr;

use serde::{Deserialize, Serialize};

use crate::Config;

/// Number of cases for property-based tests: 256 normally, 5 under Miri.
#[must_use]
pub const fn case_count() -> u32 {
    if cfg!(miri) {
        5
    } else {
        256
    }
}

/// A four-byte input.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct TestInput {
    pub inp: u32,
}

/// Sessions over real socket addresses carrying [`TestInput`].
#[derive(Debug, Clone, PartialEq)]
pub struct TestConfig;

impl Config for TestConfig {
    type Input = TestInput;
    type Address = SocketAddr;
}
