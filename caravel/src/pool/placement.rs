//! Sub-pool placement policies.
//!
//! A pool spreads actors across its worker sub-processes by index. The
//! index chosen for a uid is stable for the actor's lifetime; policies
//! only decide the initial assignment.

use std::sync::atomic::{AtomicU64, Ordering};

/// Pool-level default policy for new actors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlacementPolicy {
    /// Next index by monotonic counter.
    RoundRobin,
    /// Smallest summed inbox depth, ties broken round-robin.
    LeastLoaded,
    /// `crc32c(uid) mod N`, deterministic.
    Affinity,
}

impl std::str::FromStr for PlacementPolicy {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "round-robin" | "round_robin" => Ok(Self::RoundRobin),
            "least-loaded" | "least_loaded" => Ok(Self::LeastLoaded),
            "affinity" => Ok(Self::Affinity),
            other => Err(format!("unknown placement policy {other:?}")),
        }
    }
}

/// Per-create placement directive.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum Placement {
    /// Use the pool's configured policy.
    #[default]
    Default,
    RoundRobin,
    LeastLoaded,
    /// Deterministic assignment from an explicit key.
    Affinity(Vec<u8>),
    /// Pin to the main process (no sub-pool).
    Main,
    /// Pin to a specific sub-pool index.
    SubPool(u32),
}

/// Stateful index chooser shared by the supervisor.
pub(crate) struct Allocator {
    n: u32,
    counter: AtomicU64,
}

impl Allocator {
    pub(crate) fn new(n: u32) -> Self {
        Self {
            n,
            counter: AtomicU64::new(0),
        }
    }

    pub(crate) fn n(&self) -> u32 {
        self.n
    }

    pub(crate) fn round_robin(&self) -> u32 {
        (self.counter.fetch_add(1, Ordering::Relaxed) % self.n as u64) as u32
    }

    /// Deterministic: same key, same index, as long as N is unchanged.
    pub(crate) fn affinity(&self, key: &[u8]) -> u32 {
        crc32c::crc32c(key) % self.n
    }

    /// `loads[i]` is the summed inbox depth of sub-pool `i`.
    pub(crate) fn least_loaded(&self, loads: &[u64]) -> u32 {
        debug_assert_eq!(loads.len(), self.n as usize);
        let min = loads.iter().copied().min().unwrap_or(0);
        let candidates: Vec<u32> = loads
            .iter()
            .enumerate()
            .filter(|(_, l)| **l == min)
            .map(|(i, _)| i as u32)
            .collect();
        if candidates.len() == 1 {
            candidates[0]
        } else {
            let pick = self.counter.fetch_add(1, Ordering::Relaxed) as usize;
            candidates[pick % candidates.len()]
        }
    }
}
