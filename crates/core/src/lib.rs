#![warn(missing_docs)]
//! Core primitives shared across the workspace.

use rand::{rngs::StdRng, SeedableRng};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

/// Default simulation rate (20 TPS => 50 ms per tick).
pub const DEFAULT_TICK_RATE: u32 = 20;

/// Fixed simulation tick counter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
pub struct SimTick(pub u64);

impl SimTick {
    /// First tick in any deterministic timeline.
    pub const ZERO: Self = Self(0);

    /// Advance by `delta` ticks.
    pub fn advance(self, delta: u64) -> Self {
        Self(self.0 + delta)
    }

    /// Ticks elapsed since `earlier`, saturating at zero.
    pub fn since(self, earlier: SimTick) -> u64 {
        self.0.saturating_sub(earlier.0)
    }
}

impl fmt::Display for SimTick {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Stable handle for one logical session.
///
/// Ids are allocated by the session manager and never reused within a process, so a
/// reconnecting peer always receives a fresh id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct PeerId(pub u64);

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "peer#{}", self.0)
    }
}

/// Duration of one fixed step at `tick_rate` ticks per second.
pub fn tick_duration(tick_rate: u32) -> Duration {
    Duration::from_micros(1_000_000 / u64::from(tick_rate.max(1)))
}

/// Helper to derive a reproducible RNG seeded by match + layer domains.
pub fn scoped_rng(match_seed: u64, layer_hash: u64, tick: SimTick) -> StdRng {
    let seed = match_seed ^ layer_hash ^ tick.0;
    StdRng::seed_from_u64(seed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::Rng;

    #[test]
    fn tick_advance_and_since() {
        let t = SimTick::ZERO.advance(5);
        assert_eq!(t, SimTick(5));
        assert_eq!(t.since(SimTick(2)), 3);
        assert_eq!(SimTick(2).since(t), 0);
    }

    #[test]
    fn tick_duration_matches_rate() {
        assert_eq!(tick_duration(20), Duration::from_millis(50));
        assert_eq!(tick_duration(0), Duration::from_secs(1));
    }

    #[test]
    fn scoped_rng_is_reproducible() {
        let a: u64 = scoped_rng(7, 3, SimTick(9)).gen();
        let b: u64 = scoped_rng(7, 3, SimTick(9)).gen();
        assert_eq!(a, b);
    }

    #[test]
    fn peer_id_display() {
        assert_eq!(PeerId(12).to_string(), "peer#12");
    }
}
