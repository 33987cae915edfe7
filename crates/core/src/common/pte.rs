//! Two-level page-table entry encodings.
//!
//! The page table walked by the controller has two levels:
//! 1. **Level 1:** one 4-byte descriptor per 4 MiB region. A valid descriptor
//!    (PTD) carries the physical page number of the level-2 table.
//! 2. **Level 2:** one 8-byte entry per 4 KiB page: a 32-bit flags word
//!    followed by a 32-bit physical page number word.
//!
//! Both levels live in ordinary cacheable memory and are fetched through the
//! data cache port, which is why the walker returns the line number that
//! backed each read. The accessed and dirty flags are maintained lazily with
//! LL/SC pairs against the flags word.

/// A strongly-typed wrapper around a raw 32-bit level-1 page-table descriptor.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PageDescriptor(u32);

/// A strongly-typed wrapper around the raw 32-bit flags word of a level-2
/// page-table entry.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PageTableEntry(u32);

/// Descriptor/entry valid bit (bit 31, both levels).
pub const PTE_VALID: u32 = 1 << 31;

/// Cacheable flag (bit 30, level 2).
pub const PTE_CACHEABLE: u32 = 1 << 30;

/// Writable flag (bit 29, level 2).
pub const PTE_WRITABLE: u32 = 1 << 29;

/// Executable flag (bit 28, level 2).
pub const PTE_EXECUTABLE: u32 = 1 << 28;

/// User-accessible flag (bit 27, level 2).
pub const PTE_USER: u32 = 1 << 27;

/// Global flag (bit 26, level 2): survives context-switch TLB flushes.
pub const PTE_GLOBAL: u32 = 1 << 26;

/// Dirty flag (bit 25, level 2): set by the first write to the page.
pub const PTE_DIRTY: u32 = 1 << 25;

/// Accessed flag (bit 24, level 2): set by the first use of the entry.
pub const PTE_ACCESSED: u32 = 1 << 24;

/// Physical page number field of a level-1 descriptor (28 bits).
pub const PTD_PPN_MASK: u32 = 0x0FFF_FFFF;

/// Size in bytes of a level-1 descriptor.
pub const PTD_BYTES: u64 = 4;

/// Size in bytes of a level-2 entry (flags word + PPN word).
pub const PTE_BYTES: u64 = 8;

impl PageDescriptor {
    /// Wraps a raw level-1 descriptor word.
    pub fn new(raw: u32) -> Self {
        Self(raw)
    }

    /// Returns true if the descriptor maps a level-2 table.
    pub fn is_valid(&self) -> bool {
        self.0 & PTE_VALID != 0
    }

    /// Physical base address of the level-2 table this descriptor points to.
    pub fn table_base(&self) -> u64 {
        u64::from(self.0 & PTD_PPN_MASK) << super::addr::PAGE_SHIFT
    }
}

impl PageTableEntry {
    /// Wraps a raw level-2 flags word.
    pub fn new(raw: u32) -> Self {
        Self(raw)
    }

    /// Returns the underlying raw flags word.
    pub fn raw(&self) -> u32 {
        self.0
    }

    /// Returns true if the Valid bit is set.
    pub fn is_valid(&self) -> bool {
        self.0 & PTE_VALID != 0
    }

    /// Returns true if the page is cacheable.
    pub fn is_cacheable(&self) -> bool {
        self.0 & PTE_CACHEABLE != 0
    }

    /// Returns true if the page is writable.
    pub fn is_writable(&self) -> bool {
        self.0 & PTE_WRITABLE != 0
    }

    /// Returns true if the page is executable.
    pub fn is_executable(&self) -> bool {
        self.0 & PTE_EXECUTABLE != 0
    }

    /// Returns true if the page is accessible from user mode.
    pub fn is_user(&self) -> bool {
        self.0 & PTE_USER != 0
    }

    /// Returns true if the entry survives non-global TLB flushes.
    pub fn is_global(&self) -> bool {
        self.0 & PTE_GLOBAL != 0
    }

    /// Returns true if the Dirty bit is set.
    pub fn is_dirty(&self) -> bool {
        self.0 & PTE_DIRTY != 0
    }

    /// Returns true if the Accessed bit is set.
    pub fn is_accessed(&self) -> bool {
        self.0 & PTE_ACCESSED != 0
    }

    /// Returns a new flags word with the Accessed bit set.
    pub fn with_accessed(&self) -> Self {
        Self(self.0 | PTE_ACCESSED)
    }

    /// Returns a new flags word with the Dirty bit set.
    pub fn with_dirty(&self) -> Self {
        Self(self.0 | PTE_DIRTY)
    }
}
