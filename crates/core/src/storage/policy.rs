//! Victim selection policies for the associative arrays.
//!
//! Different array instances use different associativities, so the policy is
//! pluggable behind a trait. Two implementations are provided: round-robin
//! (one counter per set, what the hardware actually builds) and LRU.

use crate::config::ReplacementPolicyKind;

/// Per-set victim selection.
pub trait ReplacementPolicy {
    /// Selects the way to evict in `set`.
    fn victim(&self, set: usize) -> usize;

    /// Records a use of `way` in `set` (hit or install).
    fn touch(&mut self, set: usize, way: usize);
}

/// Round-robin victim selection: one wrapping counter per set.
#[derive(Clone, Debug)]
pub struct RoundRobinPolicy {
    counters: Vec<usize>,
    ways: usize,
}

impl RoundRobinPolicy {
    /// Creates counters for `sets` sets of `ways` ways.
    pub fn new(sets: usize, ways: usize) -> Self {
        Self {
            counters: vec![0; sets],
            ways,
        }
    }
}

impl ReplacementPolicy for RoundRobinPolicy {
    fn victim(&self, set: usize) -> usize {
        self.counters[set]
    }

    fn touch(&mut self, set: usize, way: usize) {
        // Only installs advance the counter; a hit on the next victim just
        // steps past it so it is not evicted immediately after use.
        if self.counters[set] == way {
            self.counters[set] = (way + 1) % self.ways;
        }
    }
}

/// LRU victim selection: per-set age stamps.
#[derive(Clone, Debug)]
pub struct LruPolicy {
    ages: Vec<u64>,
    clock: u64,
    ways: usize,
}

impl LruPolicy {
    /// Creates age stamps for `sets` sets of `ways` ways.
    pub fn new(sets: usize, ways: usize) -> Self {
        Self {
            ages: vec![0; sets * ways],
            clock: 0,
            ways,
        }
    }
}

impl ReplacementPolicy for LruPolicy {
    fn victim(&self, set: usize) -> usize {
        let base = set * self.ways;
        let mut way = 0;
        let mut oldest = u64::MAX;
        for w in 0..self.ways {
            if self.ages[base + w] < oldest {
                oldest = self.ages[base + w];
                way = w;
            }
        }
        way
    }

    fn touch(&mut self, set: usize, way: usize) {
        self.clock += 1;
        self.ages[set * self.ways + way] = self.clock;
    }
}

/// Builds the configured policy for an array of `sets` x `ways`.
pub fn build(kind: ReplacementPolicyKind, sets: usize, ways: usize) -> Box<dyn ReplacementPolicy> {
    match kind {
        ReplacementPolicyKind::RoundRobin => Box::new(RoundRobinPolicy::new(sets, ways)),
        ReplacementPolicyKind::Lru => Box::new(LruPolicy::new(sets, ways)),
    }
}
