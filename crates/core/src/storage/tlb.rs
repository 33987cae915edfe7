//! Set-associative translation lookaside buffer.
//!
//! Each entry caches one 4 KiB translation together with the physical address
//! of the page-table entry it came from and the number of the cache line that
//! backed the walk read. There is no reverse map from lines to entries, so
//! eviction of a backing line is handled by an associative scan over the
//! whole array (`probe`, one way/set per tick).

use super::policy::{self, ReplacementPolicy};
use crate::common::addr::{LineNumber, PhysAddr};
use crate::config::ArrayConfig;

/// Permission and attribute flags of a TLB entry.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct TlbFlags {
    /// Page is cacheable.
    pub cacheable: bool,
    /// Page is writable.
    pub writable: bool,
    /// Page is executable.
    pub executable: bool,
    /// Page is accessible from user mode.
    pub user: bool,
    /// Entry survives non-global flushes.
    pub global: bool,
    /// Page has been written (dirty bit already set in the PTE).
    pub dirty: bool,
}

/// One TLB entry.
#[derive(Clone, Copy, Debug, Default)]
pub struct TlbEntry {
    /// Entry holds a live translation.
    pub valid: bool,
    /// Virtual page number.
    pub vpn: u32,
    /// Physical page number.
    pub ppn: u32,
    /// Permission and attribute flags.
    pub flags: TlbFlags,
    /// Physical address of the backing page-table entry's flags word.
    pub pte_addr: PhysAddr,
    /// Cache line that backed the walk read of this entry.
    pub nline: LineNumber,
}

/// Set-associative TLB.
pub struct Tlb {
    entries: Vec<TlbEntry>,
    sets: usize,
    ways: usize,
    policy: Box<dyn ReplacementPolicy>,
}

impl Tlb {
    /// Creates an empty TLB with the given geometry.
    pub fn new(cfg: &ArrayConfig) -> Self {
        Self {
            entries: vec![TlbEntry::default(); cfg.sets * cfg.ways],
            sets: cfg.sets,
            ways: cfg.ways,
            policy: policy::build(cfg.policy, cfg.sets, cfg.ways),
        }
    }

    /// Number of sets.
    pub fn sets(&self) -> usize {
        self.sets
    }

    /// Number of ways.
    pub fn ways(&self) -> usize {
        self.ways
    }

    #[inline]
    fn set_of(&self, vpn: u32) -> usize {
        (vpn as usize) & (self.sets - 1)
    }

    #[inline]
    fn slot(&self, set: usize, way: usize) -> usize {
        set * self.ways + way
    }

    fn find(&self, vpn: u32) -> Option<(usize, usize)> {
        let set = self.set_of(vpn);
        (0..self.ways).find_map(|way| {
            let e = &self.entries[self.slot(set, way)];
            (e.valid && e.vpn == vpn).then_some((set, way))
        })
    }

    /// Translates `vpn`, touching the policy on hit.
    pub fn translate(&mut self, vpn: u32) -> Option<TlbEntry> {
        let (set, way) = self.find(vpn)?;
        self.policy.touch(set, way);
        Some(self.entries[self.slot(set, way)])
    }

    /// Installs `entry`, evicting by policy if the set is full.
    pub fn insert(&mut self, entry: TlbEntry) {
        let set = self.set_of(entry.vpn);
        // Re-installing an existing vpn reuses its slot.
        let way = self
            .find(entry.vpn)
            .map(|(_, way)| way)
            .or_else(|| (0..self.ways).find(|&w| !self.entries[self.slot(set, w)].valid))
            .unwrap_or_else(|| self.policy.victim(set));
        let slot = self.slot(set, way);
        self.entries[slot] = entry;
        self.policy.touch(set, way);
    }

    /// Sets the dirty flag of the entry for `vpn`, if present.
    pub fn set_dirty(&mut self, vpn: u32) {
        if let Some((set, way)) = self.find(vpn) {
            let slot = self.slot(set, way);
            self.entries[slot].flags.dirty = true;
        }
    }

    /// Invalidates the entry for `vpn`, returning its backing line.
    pub fn invalidate_vpn(&mut self, vpn: u32) -> Option<LineNumber> {
        let (set, way) = self.find(vpn)?;
        let slot = self.slot(set, way);
        self.entries[slot].valid = false;
        Some(self.entries[slot].nline)
    }

    /// Scanner probe: invalidates the entry at `(set, way)` if its backing
    /// line is `nline`. One probe is one tick of scan work.
    pub fn probe(&mut self, set: usize, way: usize, nline: LineNumber) -> bool {
        let slot = self.slot(set, way);
        let e = &mut self.entries[slot];
        if e.valid && e.nline == nline {
            e.valid = false;
            return true;
        }
        false
    }

    /// Reads the entry at flush slot `index` (set-major order). The flush
    /// states walk one slot per tick.
    pub fn flush_slot(&self, index: usize) -> TlbEntry {
        let set = index / self.ways;
        let way = index % self.ways;
        self.entries[self.slot(set, way)]
    }

    /// Invalidates the entry at flush slot `index`.
    pub fn invalidate_slot(&mut self, index: usize) {
        let set = index / self.ways;
        let way = index % self.ways;
        let slot = self.slot(set, way);
        self.entries[slot].valid = false;
    }

    /// Total number of slots, for flush and scan iteration.
    pub fn slots(&self) -> usize {
        self.sets * self.ways
    }
}
