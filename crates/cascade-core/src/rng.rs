//! Deterministic PRNG for simulation use (failure rolls, hit rolls, jitter).
//!
//! Uses the SplitMix64 algorithm: fast, 8 bytes of state, excellent
//! statistical properties, and trivially serializable. Every probabilistic
//! decision in the engine draws from one engine-owned instance, so a seed
//! fully determines a run and tests can force always-fail / never-fail
//! paths with probabilities of 1 and 0.

use crate::fixed::Fixed64;

/// SplitMix64 pseudo-random number generator.
///
/// Deterministic across platforms — required for reproducible failure
/// traces.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct SimRng {
    state: u64,
}

impl SimRng {
    /// Create a new RNG with the given seed.
    pub fn new(seed: u64) -> Self {
        Self { state: seed }
    }

    /// Generate the next `u64` in the sequence.
    pub fn next_u64(&mut self) -> u64 {
        self.state = self.state.wrapping_add(0x9E37_79B9_7F4A_7C15);
        let mut z = self.state;
        z = (z ^ (z >> 30)).wrapping_mul(0xBF58_476D_1CE4_E5B9);
        z = (z ^ (z >> 27)).wrapping_mul(0x94D0_49BB_1331_11EB);
        z ^ (z >> 31)
    }

    /// Returns `true` with the given probability (Fixed64 in [0, 1]).
    ///
    /// - probability <= 0 always returns false
    /// - probability >= 1 always returns true
    pub fn chance(&mut self, probability: Fixed64) -> bool {
        if probability <= Fixed64::ZERO {
            return false;
        }
        if probability >= Fixed64::ONE {
            return true;
        }
        // Fixed64 is Q32.32. For p in (0,1) the raw bits hold the fraction
        // scaled to [0, 2^32); compare against a uniform u32 draw.
        let upper = self.next_u64() >> 32;
        upper < probability.to_bits() as u64
    }

    /// Uniform Fixed64 in [0, 1).
    pub fn uniform(&mut self) -> Fixed64 {
        Fixed64::from_bits((self.next_u64() >> 32) as i64)
    }

    /// Uniform Fixed64 in [lo, hi). Latency jitter multipliers come from
    /// here (e.g. `jitter(0.8, 1.2)` for ±20% noise).
    pub fn jitter(&mut self, lo: Fixed64, hi: Fixed64) -> Fixed64 {
        lo + self.uniform() * (hi - lo)
    }

    /// Uniform u32 in [0, n). Returns 0 when n is 0.
    pub fn next_range(&mut self, n: u32) -> u32 {
        if n == 0 {
            return 0;
        }
        // Multiply-shift keeps the draw unbiased without rejection.
        (((self.next_u64() >> 32) * u64::from(n)) >> 32) as u32
    }

    /// Get the internal state (for diagnostics).
    pub fn state(&self) -> u64 {
        self.state
    }
}
