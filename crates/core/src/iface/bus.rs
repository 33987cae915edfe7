//! Bus-facing packet records: commands, responses, snoops, cleanups.
//!
//! The bus is split-transaction: commands and responses travel on separate
//! channels and are matched by the transaction tag carried in the command and
//! echoed in every response cell. The tag is an explicit tagged union rather
//! than a packed id field, so the response engine demultiplexes without any
//! address comparison or bit slicing.

use crate::common::addr::{LineNumber, PhysAddr};

/// Which side of the controller a transaction or cleanup belongs to.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum Side {
    /// Instruction side.
    #[default]
    Inst,
    /// Data side.
    Data,
}

/// The lazily-maintained PTE flag a locked read-modify-write targets.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AtomicKind {
    /// Accessed bit, set on first use of a translation.
    Access,
    /// Dirty bit, set on first write to a clean page.
    Dirty,
}

/// Transaction tags: one variant per outstanding-transaction type.
///
/// At most one read-type transaction is outstanding per side at a time;
/// posted writes are identified by their write-buffer index and ride
/// alongside. The fixed command priority order is defined over these tags
/// (see `ctrl::vci`).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TxTag {
    /// Page-table read on behalf of the instruction TLB (data cache port).
    ItlbRead,
    /// Page-table read on behalf of the data TLB.
    DtlbRead,
    /// Locked read of a PTE flags word (LL half of the RMW pair).
    PteLl(Side, AtomicKind),
    /// Store-conditional of a PTE flags word (SC half of the RMW pair).
    PteSc(Side, AtomicKind),
    /// Instruction cache line refill.
    InsMiss,
    /// Uncached instruction fetch.
    InsUnc,
    /// Data cache line refill.
    DataMiss,
    /// Uncached data read.
    DataUnc,
    /// Uncached load-linked.
    DataLl,
    /// Uncached store-conditional.
    DataSc,
    /// Uncached atomic swap.
    DataSwap,
    /// Posted write; the payload is the write-buffer slot index.
    Write(usize),
}

/// Bus command kinds.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum VciCmdKind {
    /// Plain read (single word or line burst).
    Read,
    /// Plain write.
    Write,
    /// Locked read establishing a reservation (LL).
    LockedRead,
    /// Store-conditional (SC); the response data reports success.
    StoreCond,
    /// Atomic swap; the response data is the previous memory word.
    Swap,
}

/// One bus command cell.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct VciCmd {
    /// Physical byte address.
    pub paddr: PhysAddr,
    /// Command kind.
    pub kind: VciCmdKind,
    /// Byte enables (writes only).
    pub be: u8,
    /// Write data (writes and SC only).
    pub wdata: u32,
    /// Number of words expected in the response burst (reads).
    pub burst: usize,
    /// Transaction tag, echoed in every response cell.
    pub tag: TxTag,
    /// End-of-packet marker.
    pub eop: bool,
}

/// One bus response cell.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct VciRsp {
    /// Response data word (one word per cell in a burst).
    pub data: u32,
    /// Error flag; a flagged cell poisons the whole transaction.
    pub error: bool,
    /// End-of-packet marker.
    pub eop: bool,
    /// Echoed transaction tag.
    pub tag: TxTag,
}

/// Snoop-target command operations (header and data cells).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TgtOp {
    /// Invalidate one line wherever it is held (instruction or data cache).
    Inval(LineNumber),
    /// Invalidate one line in both units unconditionally; acknowledged with
    /// one response per unit (two in total).
    Broadcast(LineNumber),
    /// Header of a masked multi-word line update starting at `word`.
    Update {
        /// Target line.
        nline: LineNumber,
        /// First word index of the payload within the line.
        word: usize,
    },
    /// One payload word of an open update, with its byte enables.
    Data {
        /// Payload word.
        word: u32,
        /// Byte enables for this word.
        be: u8,
    },
}

/// One snoop-target command cell.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TgtCell {
    /// Operation or payload carried by this cell.
    pub op: TgtOp,
    /// End-of-packet marker.
    pub eop: bool,
}

/// Snoop-target response cell (acknowledgement only, no data payload).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TgtRsp {
    /// Unit acknowledging the snoop.
    pub side: Side,
    /// End-of-packet marker.
    pub eop: bool,
}

/// Cleanup command: this controller no longer holds `nline`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CleanupCmd {
    /// Evicted physical line.
    pub nline: LineNumber,
    /// Side that held the line (or the TLB entry backed by it).
    pub side: Side,
    /// End-of-packet marker.
    pub eop: bool,
}

/// Cleanup acknowledgement from the coherence fabric.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CleanupAck {
    /// Side echoed from the cleanup command.
    pub side: Side,
    /// End-of-packet marker.
    pub eop: bool,
}
