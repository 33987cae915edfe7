//! Physical and Virtual Address types.
//!
//! This module defines strong types for the two address spaces the controller
//! works in, to prevent accidental mixing. It provides the following:
//! 1. **Type Safety:** Virtual addresses are 32-bit processor addresses; physical
//!    addresses are up to 40-bit bus addresses.
//! 2. **Page Arithmetic:** Helpers for extracting virtual page numbers, page-table
//!    indices, and page offsets.
//! 3. **Line Arithmetic:** Helpers for extracting physical line numbers, the unit
//!    the coherence protocol speaks in.

/// Page size shift (4 KiB pages).
pub const PAGE_SHIFT: u32 = 12;

/// Number of entries covered by one level-1 page-table index (10 bits).
pub const L1_INDEX_BITS: u32 = 10;

/// Bit mask for one page-table index field.
pub const INDEX_MASK: u32 = (1 << L1_INDEX_BITS) - 1;

/// A physical line number: a physical address shifted right by the line shift.
///
/// Line numbers are the currency of the coherence protocol: snoop invalidates,
/// snoop updates, and cleanup notifications all name lines, never bytes.
pub type LineNumber = u64;

/// A virtual address as issued by the processor.
///
/// Virtual addresses are 32-bit and are translated to physical addresses by
/// the controller's TLBs (or used untranslated when the MMU is off).
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub struct VirtAddr(pub u32);

/// A physical address on the system bus.
///
/// Physical addresses are produced by address translation and may be wider
/// than the 32-bit virtual space (up to 40 bits, set by `Config::paddr_width`).
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord)]
pub struct PhysAddr(pub u64);

impl VirtAddr {
    /// Creates a new virtual address from a raw 32-bit value.
    #[inline(always)]
    pub fn new(addr: u32) -> Self {
        Self(addr)
    }

    /// Returns the raw 32-bit address value.
    #[inline(always)]
    pub fn val(&self) -> u32 {
        self.0
    }

    /// Extracts the virtual page number (upper 20 bits).
    #[inline]
    pub fn vpn(&self) -> u32 {
        self.0 >> PAGE_SHIFT
    }

    /// Extracts the level-1 page-table index (bits 31..22 of the address).
    #[inline]
    pub fn ix1(&self) -> u32 {
        (self.0 >> (PAGE_SHIFT + L1_INDEX_BITS)) & INDEX_MASK
    }

    /// Extracts the level-2 page-table index (bits 21..12 of the address).
    #[inline]
    pub fn ix2(&self) -> u32 {
        (self.0 >> PAGE_SHIFT) & INDEX_MASK
    }

    /// Extracts the byte offset within a 4 KiB page.
    #[inline]
    pub fn page_offset(&self) -> u32 {
        self.0 & ((1 << PAGE_SHIFT) - 1)
    }

    /// Builds the physical address for this virtual address given a physical
    /// page number.
    #[inline]
    pub fn with_ppn(&self, ppn: u32) -> PhysAddr {
        PhysAddr((u64::from(ppn) << PAGE_SHIFT) | u64::from(self.page_offset()))
    }

    /// Identity translation, used when the MMU is disabled.
    #[inline]
    pub fn identity(&self) -> PhysAddr {
        PhysAddr(u64::from(self.0))
    }
}

impl PhysAddr {
    /// Creates a new physical address from a raw 64-bit value.
    #[inline(always)]
    pub fn new(addr: u64) -> Self {
        Self(addr)
    }

    /// Returns the raw 64-bit address value.
    #[inline(always)]
    pub fn val(&self) -> u64 {
        self.0
    }

    /// Extracts the physical line number for a given line shift.
    #[inline]
    pub fn line(&self, line_shift: u32) -> LineNumber {
        self.0 >> line_shift
    }

    /// Extracts the word index within a line for a given word count.
    #[inline]
    pub fn word_of_line(&self, words: usize) -> usize {
        ((self.0 >> 2) as usize) & (words - 1)
    }

    /// Returns the address of the first byte of the containing line.
    #[inline]
    pub fn line_base(&self, line_shift: u32) -> Self {
        Self(self.0 & !((1 << line_shift) - 1))
    }

    /// Extracts the physical page number (address shifted by the page size).
    #[inline]
    pub fn ppn(&self) -> u32 {
        (self.0 >> PAGE_SHIFT) as u32
    }
}

impl std::fmt::Display for VirtAddr {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:#010x}", self.0)
    }
}

impl std::fmt::Display for PhysAddr {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:#012x}", self.0)
    }
}
