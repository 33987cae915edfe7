//! Set-associative cache line array.
//!
//! Shared by the instruction and data sides (one instance each). Beyond the
//! usual tag/valid/data fields, every line carries two marker bits recording
//! whether a TLB entry was filled from this line. Page-table entries are
//! fetched through the data cache's ordinary read port, so a data cache line
//! can back live translations; evicting such a line must notify the TLB
//! scanners before the slot is reused.

use super::policy::{self, ReplacementPolicy};
use crate::common::addr::{LineNumber, PhysAddr};
use crate::config::ArrayConfig;
use crate::iface::bus::Side;

/// One cache line.
#[derive(Clone, Debug, Default)]
struct Line {
    tag: u64,
    valid: bool,
    /// Set when an instruction TLB entry was filled from this line.
    in_itlb: bool,
    /// Set when a data TLB entry was filled from this line.
    in_dtlb: bool,
    data: Vec<u32>,
}

/// Victim slot description returned by `Cache::victim`.
///
/// The caller chains the required cleanup (valid victims) and TLB scans
/// (marked victims) before reusing the slot.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct VictimInfo {
    /// Set of the chosen slot.
    pub set: usize,
    /// Way of the chosen slot.
    pub way: usize,
    /// Whether the slot currently holds a valid line.
    pub valid: bool,
    /// Line number of the current occupant (meaningful when `valid`).
    pub nline: LineNumber,
    /// Whether the occupant backs an instruction TLB entry.
    pub in_itlb: bool,
    /// Whether the occupant backs a data TLB entry.
    pub in_dtlb: bool,
}

/// Set-associative, write-through cache array.
pub struct Cache {
    lines: Vec<Line>,
    sets: usize,
    ways: usize,
    words: usize,
    line_shift: u32,
    policy: Box<dyn ReplacementPolicy>,
}

impl Cache {
    /// Creates an empty cache with the given geometry.
    pub fn new(cfg: &ArrayConfig, words: usize) -> Self {
        let mut lines = Vec::with_capacity(cfg.sets * cfg.ways);
        lines.resize_with(cfg.sets * cfg.ways, || Line {
            data: vec![0; words],
            ..Line::default()
        });
        Self {
            lines,
            sets: cfg.sets,
            ways: cfg.ways,
            words,
            line_shift: 2 + words.trailing_zeros(),
            policy: policy::build(cfg.policy, cfg.sets, cfg.ways),
        }
    }

    /// Words per line.
    pub fn words(&self) -> usize {
        self.words
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
    fn split(&self, nline: LineNumber) -> (usize, u64) {
        ((nline as usize) & (self.sets - 1), nline >> self.sets.trailing_zeros())
    }

    #[inline]
    fn slot(&self, set: usize, way: usize) -> usize {
        set * self.ways + way
    }

    fn find(&self, nline: LineNumber) -> Option<(usize, usize)> {
        let (set, tag) = self.split(nline);
        (0..self.ways).find_map(|way| {
            let line = &self.lines[self.slot(set, way)];
            (line.valid && line.tag == tag).then_some((set, way))
        })
    }

    /// Reads the word at `paddr` if its line is resident, touching the policy.
    pub fn lookup(&mut self, paddr: PhysAddr) -> Option<u32> {
        let (set, way) = self.find(paddr.line(self.line_shift))?;
        self.policy.touch(set, way);
        let word = paddr.word_of_line(self.words);
        Some(self.lines[self.slot(set, way)].data[word])
    }

    /// Reads two consecutive words at `paddr` (an 8-byte-aligned page-table
    /// entry) if its line is resident.
    pub fn lookup_pair(&mut self, paddr: PhysAddr) -> Option<(u32, u32)> {
        let (set, way) = self.find(paddr.line(self.line_shift))?;
        self.policy.touch(set, way);
        let word = paddr.word_of_line(self.words);
        let data = &self.lines[self.slot(set, way)].data;
        Some((data[word], data[word + 1]))
    }

    /// Returns true if `nline` is resident.
    pub fn contains(&self, nline: LineNumber) -> bool {
        self.find(nline).is_some()
    }

    /// Selects the victim slot for a refill of the line containing `paddr`.
    ///
    /// Invalid ways are preferred; otherwise the policy picks. The occupant
    /// is reported so the caller can chain a cleanup and any TLB scan.
    pub fn victim(&self, paddr: PhysAddr) -> VictimInfo {
        let nline = paddr.line(self.line_shift);
        let (set, _) = self.split(nline);
        let way = (0..self.ways)
            .find(|&w| !self.lines[self.slot(set, w)].valid)
            .unwrap_or_else(|| self.policy.victim(set));
        let line = &self.lines[self.slot(set, way)];
        VictimInfo {
            set,
            way,
            valid: line.valid,
            nline: self.nline_of(set, way),
            in_itlb: line.in_itlb,
            in_dtlb: line.in_dtlb,
        }
    }

    fn nline_of(&self, set: usize, way: usize) -> LineNumber {
        let line = &self.lines[self.slot(set, way)];
        (line.tag << self.sets.trailing_zeros()) | set as u64
    }

    /// Invalidates the slot at `(set, way)` without reporting anything.
    pub fn invalidate_slot(&mut self, set: usize, way: usize) {
        let slot = self.slot(set, way);
        self.lines[slot].valid = false;
        self.lines[slot].in_itlb = false;
        self.lines[slot].in_dtlb = false;
    }

    /// Installs `data` into the slot at `(set, way)` for the line containing
    /// `paddr`. The slot must have been reserved with `victim`.
    pub fn refill(&mut self, set: usize, way: usize, paddr: PhysAddr, data: &[u32]) {
        debug_assert_eq!(data.len(), self.words);
        let nline = paddr.line(self.line_shift);
        let (_, tag) = self.split(nline);
        let slot = self.slot(set, way);
        let line = &mut self.lines[slot];
        line.tag = tag;
        line.valid = true;
        line.in_itlb = false;
        line.in_dtlb = false;
        line.data.copy_from_slice(data);
        self.policy.touch(set, way);
    }

    /// Reads the marker bits of `nline` without invalidating, if resident.
    ///
    /// Callers use this to reserve the TLB scanners before committing to an
    /// invalidation.
    pub fn markers(&self, nline: LineNumber) -> Option<(bool, bool)> {
        let (set, way) = self.find(nline)?;
        let line = &self.lines[self.slot(set, way)];
        Some((line.in_itlb, line.in_dtlb))
    }

    /// Invalidates `nline` if resident, returning its marker bits.
    pub fn invalidate(&mut self, nline: LineNumber) -> Option<(bool, bool)> {
        let (set, way) = self.find(nline)?;
        let slot = self.slot(set, way);
        let markers = (self.lines[slot].in_itlb, self.lines[slot].in_dtlb);
        self.invalidate_slot(set, way);
        Some(markers)
    }

    /// Write-through update of the word at `paddr` under byte enables.
    ///
    /// Returns true on hit. A miss changes nothing (no write allocation).
    pub fn write(&mut self, paddr: PhysAddr, data: u32, be: u8) -> bool {
        let Some((set, way)) = self.find(paddr.line(self.line_shift)) else {
            return false;
        };
        self.policy.touch(set, way);
        let word = paddr.word_of_line(self.words);
        let slot = self.slot(set, way);
        let old = self.lines[slot].data[word];
        self.lines[slot].data[word] = merge(old, data, be);
        true
    }

    /// Snoop update of one word of `nline` under byte enables.
    ///
    /// Returns true on hit. Does not touch the policy: the update comes from
    /// the fabric, not from a local use.
    pub fn update_word(&mut self, nline: LineNumber, word: usize, data: u32, be: u8) -> bool {
        let Some((set, way)) = self.find(nline) else {
            return false;
        };
        let slot = self.slot(set, way);
        let old = self.lines[slot].data[word];
        self.lines[slot].data[word] = merge(old, data, be);
        true
    }

    /// Marks `nline` as backing a TLB entry on `side`.
    ///
    /// A no-op if the line was evicted between the walk read and the TLB
    /// install; the scanner will simply never be asked about it.
    pub fn set_marker(&mut self, nline: LineNumber, side: Side) {
        if let Some((set, way)) = self.find(nline) {
            let slot = self.slot(set, way);
            match side {
                Side::Inst => self.lines[slot].in_itlb = true,
                Side::Data => self.lines[slot].in_dtlb = true,
            }
        }
    }

    /// Iterates over the occupant of flush slot `index` (set-major order),
    /// reporting `(nline, valid)`. Used by the flush states, which walk one
    /// slot per tick.
    pub fn flush_slot(&self, index: usize) -> (usize, usize, bool, LineNumber) {
        let set = index / self.ways;
        let way = index % self.ways;
        let valid = self.lines[self.slot(set, way)].valid;
        (set, way, valid, self.nline_of(set, way))
    }

    /// Total number of slots, for flush iteration.
    pub fn slots(&self) -> usize {
        self.sets * self.ways
    }
}

/// Merges `data` into `old` under the byte-enable mask.
#[inline]
fn merge(old: u32, data: u32, be: u8) -> u32 {
    let mut mask = 0u32;
    for byte in 0..4 {
        if be & (1 << byte) != 0 {
            mask |= 0xFF << (byte * 8);
        }
    }
    (old & !mask) | (data & mask)
}
