//! Configuration surface of the controller.
//!
//! All geometry is fixed at construction time and immutable thereafter. This
//! module provides:
//! 1. **Defaults:** baseline geometry matching the reference platform.
//! 2. **Structures:** per-array geometry and the top-level `Config`.
//! 3. **Validation:** power-of-two and width checks, reported as `ConfigError`.
//!
//! Configuration is supplied as JSON (`Config::from_json`) or built in code
//! with `Config::default()`.

use serde::Deserialize;
use thiserror::Error;

/// Default configuration constants.
mod defaults {
    /// Instruction cache ways.
    pub const ICACHE_WAYS: usize = 4;
    /// Instruction cache sets.
    pub const ICACHE_SETS: usize = 64;
    /// Data cache ways.
    pub const DCACHE_WAYS: usize = 4;
    /// Data cache sets.
    pub const DCACHE_SETS: usize = 64;
    /// Words per cache line (shared by both caches).
    pub const LINE_WORDS: usize = 8;
    /// Instruction TLB ways.
    pub const ITLB_WAYS: usize = 2;
    /// Instruction TLB sets.
    pub const ITLB_SETS: usize = 8;
    /// Data TLB ways.
    pub const DTLB_WAYS: usize = 2;
    /// Data TLB sets.
    pub const DTLB_SETS: usize = 8;
    /// Write buffer depth.
    pub const WBUF_DEPTH: usize = 8;
    /// Physical address width in bits.
    pub const PADDR_WIDTH: u32 = 32;
    /// Base of the uncacheable segment used when the MMU is off.
    pub const UNCACHED_BASE: u64 = 0xF000_0000;
    /// Size of the uncacheable segment used when the MMU is off.
    pub const UNCACHED_SIZE: u64 = 0x1000_0000;
}

/// Replacement victim selection policies.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReplacementPolicyKind {
    /// Round-robin counter per set (the hardware's cheap default).
    #[default]
    RoundRobin,
    /// Least-recently-used ordering per set.
    Lru,
}

/// Geometry of one associative array (cache or TLB).
#[derive(Clone, Copy, Debug, Deserialize)]
#[serde(default)]
pub struct ArrayConfig {
    /// Number of ways (associativity).
    pub ways: usize,
    /// Number of sets.
    pub sets: usize,
    /// Victim selection policy.
    pub policy: ReplacementPolicyKind,
}

impl Default for ArrayConfig {
    fn default() -> Self {
        Self {
            ways: defaults::ICACHE_WAYS,
            sets: defaults::ICACHE_SETS,
            policy: ReplacementPolicyKind::RoundRobin,
        }
    }
}

/// Top-level controller configuration.
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Instruction cache geometry.
    pub icache: ArrayConfig,
    /// Data cache geometry.
    pub dcache: ArrayConfig,
    /// Instruction TLB geometry.
    pub itlb: ArrayConfig,
    /// Data TLB geometry.
    pub dtlb: ArrayConfig,
    /// Words per cache line (shared by both caches; at least 2 so that one
    /// 8-byte page-table entry never straddles a line).
    pub line_words: usize,
    /// Write buffer depth.
    pub wbuf_depth: usize,
    /// Physical address width in bits (32..=40).
    pub paddr_width: u32,
    /// Base of the address range treated as uncacheable when the MMU is off.
    pub uncached_base: u64,
    /// Size of the uncacheable range.
    pub uncached_size: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            icache: ArrayConfig {
                ways: defaults::ICACHE_WAYS,
                sets: defaults::ICACHE_SETS,
                policy: ReplacementPolicyKind::RoundRobin,
            },
            dcache: ArrayConfig {
                ways: defaults::DCACHE_WAYS,
                sets: defaults::DCACHE_SETS,
                policy: ReplacementPolicyKind::RoundRobin,
            },
            itlb: ArrayConfig {
                ways: defaults::ITLB_WAYS,
                sets: defaults::ITLB_SETS,
                policy: ReplacementPolicyKind::RoundRobin,
            },
            dtlb: ArrayConfig {
                ways: defaults::DTLB_WAYS,
                sets: defaults::DTLB_SETS,
                policy: ReplacementPolicyKind::RoundRobin,
            },
            line_words: defaults::LINE_WORDS,
            wbuf_depth: defaults::WBUF_DEPTH,
            paddr_width: defaults::PADDR_WIDTH,
            uncached_base: defaults::UNCACHED_BASE,
            uncached_size: defaults::UNCACHED_SIZE,
        }
    }
}

/// Configuration validation errors.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    /// An array dimension must be a non-zero power of two.
    #[error("{field} must be a non-zero power of two, got {value}")]
    NotPowerOfTwo {
        /// Offending field name.
        field: &'static str,
        /// Offending value.
        value: usize,
    },
    /// The line must hold at least one 8-byte page-table entry.
    #[error("line_words must be at least 2, got {0}")]
    LineTooShort(usize),
    /// The write buffer must have at least one slot.
    #[error("wbuf_depth must be at least 1, got {0}")]
    EmptyWriteBuffer(usize),
    /// Physical address width out of the supported range.
    #[error("paddr_width must be in 32..=40, got {0}")]
    BadPaddrWidth(u32),
}

impl Config {
    /// Deserializes a configuration from a JSON document.
    ///
    /// # Errors
    ///
    /// Returns the underlying `serde_json` error for malformed documents.
    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }

    /// Validates the geometry.
    ///
    /// # Errors
    ///
    /// Returns the first `ConfigError` found.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let pow2 = |field: &'static str, value: usize| {
            if value.is_power_of_two() {
                Ok(())
            } else {
                Err(ConfigError::NotPowerOfTwo { field, value })
            }
        };
        pow2("icache.ways", self.icache.ways)?;
        pow2("icache.sets", self.icache.sets)?;
        pow2("dcache.ways", self.dcache.ways)?;
        pow2("dcache.sets", self.dcache.sets)?;
        pow2("itlb.ways", self.itlb.ways)?;
        pow2("itlb.sets", self.itlb.sets)?;
        pow2("dtlb.ways", self.dtlb.ways)?;
        pow2("dtlb.sets", self.dtlb.sets)?;
        pow2("line_words", self.line_words)?;
        if self.line_words < 2 {
            return Err(ConfigError::LineTooShort(self.line_words));
        }
        if self.wbuf_depth == 0 {
            return Err(ConfigError::EmptyWriteBuffer(self.wbuf_depth));
        }
        if !(32..=40).contains(&self.paddr_width) {
            return Err(ConfigError::BadPaddrWidth(self.paddr_width));
        }
        Ok(())
    }

    /// Shift from a physical byte address to its line number.
    pub fn line_shift(&self) -> u32 {
        2 + self.line_words.trailing_zeros()
    }

    /// Returns true when `paddr` falls in the uncacheable segment.
    ///
    /// With the MMU off there is no PTE cacheability flag, so cacheability
    /// comes from this fixed range check instead.
    pub fn is_uncached(&self, paddr: u64) -> bool {
        paddr >= self.uncached_base && paddr < self.uncached_base + self.uncached_size
    }
}
