//! Small PCG32 generator for non-cryptographic randomness.
//!
//! Used for session magic numbers, handshake nonces and the simulated latency
//! of the outbound pump. Seeding it makes all three reproducible in tests.
//!
//! ```rust
//! use bastion_netcode::rng::Pcg32;
//!
//! let mut a = Pcg32::seeded(12345);
//! let mut b = Pcg32::seeded(12345);
//! assert_eq!(a.next_u32(), b.next_u32());
//! assert_ne!(a.next_nonzero_u16(), 0);
//! ```

const MULTIPLIER: u64 = 6_364_136_223_846_793_005;
const DEFAULT_STREAM: u64 = 1_442_695_040_888_963_407;

/// PCG-XSH-RR: 64-bit state, 32-bit output. Not cryptographically secure.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Pcg32 {
    state: u64,
    increment: u64,
}

impl Pcg32 {
    /// A generator on `stream` starting from `seed`.
    #[must_use]
    pub const fn with_stream(seed: u64, stream: u64) -> Self {
        let increment = (stream << 1) | 1;
        let state = increment
            .wrapping_add(seed)
            .wrapping_mul(MULTIPLIER)
            .wrapping_add(increment);
        Self { state, increment }
    }

    /// A generator on the default stream starting from `seed`.
    #[must_use]
    pub const fn seeded(seed: u64) -> Self {
        Self::with_stream(seed, DEFAULT_STREAM)
    }

    /// A generator seeded from the OS-keyed std hasher, the clock and the thread id.
    ///
    /// On wasm32 the std hasher keys are fixed, so `Math.random()` is mixed in.
    #[must_use]
    pub fn from_entropy() -> Self {
        use std::collections::hash_map::RandomState;
        use std::hash::{BuildHasher, Hash, Hasher};

        let mut hasher = RandomState::new().build_hasher();
        if let Ok(elapsed) = web_time::SystemTime::now().duration_since(web_time::UNIX_EPOCH) {
            hasher.write_u128(elapsed.as_nanos());
        }
        std::thread::current().id().hash(&mut hasher);
        #[cfg(target_arch = "wasm32")]
        hasher.write_u64(js_sys::Math::random().to_bits());
        Self::seeded(hasher.finish())
    }

    /// [`seeded`](Self::seeded) when a seed is configured, [`from_entropy`](Self::from_entropy) otherwise.
    #[must_use]
    pub fn from_optional_seed(seed: Option<u64>) -> Self {
        seed.map_or_else(Self::from_entropy, Self::seeded)
    }

    /// The next 32 random bits.
    #[inline]
    pub fn next_u32(&mut self) -> u32 {
        let old = self.state;
        self.state = old.wrapping_mul(MULTIPLIER).wrapping_add(self.increment);
        let xorshifted = (((old >> 18) ^ old) >> 27) as u32;
        xorshifted.rotate_right((old >> 59) as u32)
    }

    /// The next 64 random bits.
    #[inline]
    pub fn next_u64(&mut self) -> u64 {
        (u64::from(self.next_u32()) << 32) | u64::from(self.next_u32())
    }

    /// Uniform in `[0, 1)` with 53 bits of precision.
    pub fn next_f64(&mut self) -> f64 {
        const SCALE: f64 = 1.0 / (1u64 << 53) as f64;
        (self.next_u64() >> 11) as f64 * SCALE
    }

    /// A random `u16` other than zero. Zero marks an unknown magic number.
    pub fn next_nonzero_u16(&mut self) -> u16 {
        loop {
            let value = (self.next_u32() >> 16) as u16;
            if value != 0 {
                return value;
            }
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
    fn equal_seeds_give_equal_sequences() {
        let mut a = Pcg32::seeded(12345);
        let mut b = Pcg32::seeded(12345);
        for _ in 0..1000 {
            assert_eq!(a.next_u32(), b.next_u32());
        }
    }

    #[test]
    fn streams_are_independent() {
        let mut a = Pcg32::with_stream(1, 1);
        let mut b = Pcg32::with_stream(1, 2);
        let equal = (0..100).filter(|_| a.next_u32() == b.next_u32()).count();
        assert!(equal < 10);
    }

    #[test]
    fn unit_interval_is_half_open() {
        let mut rng = Pcg32::seeded(99);
        for _ in 0..10_000 {
            let value = rng.next_f64();
            assert!((0.0..1.0).contains(&value));
        }
    }

    #[test]
    fn magic_is_never_zero() {
        let mut rng = Pcg32::seeded(0);
        for _ in 0..10_000 {
            assert_ne!(rng.next_nonzero_u16(), 0);
        }
    }

    #[test]
    fn configured_seed_wins_over_entropy() {
        let mut configured = Pcg32::from_optional_seed(Some(3));
        assert_eq!(configured.next_u64(), Pcg32::seeded(3).next_u64());
    }
}
