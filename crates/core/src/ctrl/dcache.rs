//! Data-side FSM.
//!
//! A superset of the instruction side: load/store classification, data TLB,
//! data cache, posted writes, plus three responsibilities the instruction
//! side delegates here because they all need the data cache port:
//!
//! 1. **Page-table walking.** Both walk levels are ordinary cached reads
//!    against the data cache, even when the walk serves an instruction TLB
//!    miss. Lines fetched this way are marked as TLB-backing so eviction can
//!    trigger the scanners.
//! 2. **Access/dirty-bit maintenance.** The lazily-maintained PTE flags are
//!    set with an uncached LL/SC pair against the flags word; a failed SC
//!    re-issues the LL. If the LL shows the bit already set (another core got
//!    there first) no SC is issued at all.
//! 3. **The XTN surface.** Software-visible controller registers and
//!    maintenance operations arrive as pseudo memory operations on the data
//!    port and are dispatched here, including the ones whose work happens on
//!    the instruction side.

use tracing::trace;

use crate::common::addr::{LineNumber, PhysAddr, VirtAddr, PAGE_SHIFT};
use crate::common::error::FaultCause;
use crate::common::pte::{
    PageDescriptor, PageTableEntry, PTD_BYTES, PTE_ACCESSED, PTE_BYTES, PTE_DIRTY,
};
use crate::iface::bus::{AtomicKind, Side, TxTag, VciCmdKind};
use crate::iface::proc::{DataOp, DataRequest, DataResponse, PrivilegeMode};
use crate::storage::{TlbEntry, TlbFlags};

use super::cleanup::ScanReason;
use super::vci::TxReq;
use super::{CcOp, Controller, HitP, MmuMode, SpecTrans, TickInputs, WalkLevel, WalkRsp};

/// Data-side FSM states.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub(crate) enum DcacheState {
    /// Classify the held data request (or service a cross-side request).
    #[default]
    Idle,
    /// Retranslate after a walk completed; same classification as `Idle`
    /// without re-polling the cross-side request registers.
    Bis,
    /// Store stalled on a full write buffer.
    WriteReq,
    /// Walk level 1: look up the descriptor in the data cache.
    Tlb1Read,
    /// Walk level 1: line refill outstanding.
    Tlb1Wait,
    /// Walk level 1: install the refilled line and decode the descriptor.
    Tlb1Updt,
    /// Walk level 2: look up the entry in the data cache.
    Tlb2Read,
    /// Walk level 2: line refill outstanding.
    Tlb2Wait,
    /// Walk level 2: install the refilled line and decode the entry.
    Tlb2Updt,
    /// Locked read of a PTE flags word outstanding.
    LlWait,
    /// Store-conditional of a PTE flags word outstanding.
    ScWait,
    /// Line refill for an instruction-side walk step outstanding.
    ItlbWait,
    /// Install the refilled line and answer the instruction-side walk step.
    ItlbUpdt,
    /// Data line refill outstanding.
    MissWait,
    /// Refill complete; install the line and respond.
    MissUpdate,
    /// Uncached access (read, LL, SC, swap) outstanding.
    UncWait,
    /// Deliver the error response for a latched fault.
    Error,
    /// Servicing a snoop invalidate.
    CcInval,
    /// Servicing a snoop update.
    CcUpdate,
    /// Waiting for coherence-triggered TLB scrubs to finish.
    TlbCcInval,
    /// XTN sync: wait for the write buffer to drain.
    XtnSync,
    /// XTN whole-data-cache flush, one slot per tick.
    XtnDcacheFlush,
    /// XTN single-line data cache invalidate.
    XtnDcacheInval,
    /// XTN context switch: drop all non-global data TLB entries.
    XtnDtlbFlush,
    /// XTN single-entry data TLB invalidate.
    XtnDtlbInval,
    /// Waiting for the instruction side to finish its half of an XTN op.
    XtnIcacheWait,
}

/// Data-side FSM registers.
pub(crate) struct DcacheRegs {
    pub state: DcacheState,
    /// State to resume after a coherence service.
    save: DcacheState,
    /// Speculative same-page translation from the previous access.
    pub(super) spec: SpecTrans,
    /// Cached level-1 descriptor from the previous walk.
    pub(super) hit_p: HitP,
    /// Virtual address being walked.
    walk_vaddr: VirtAddr,
    /// The walked access is a store (dirty-bit logic applies on retry).
    walk_is_store: bool,
    /// Physical address of the level-2 entry's flags word.
    walk_pte_addr: PhysAddr,
    /// Entry waiting for the accessed-bit update before install.
    pending: Option<TlbEntry>,
    /// The pending entry's backing line died; discard instead of installing.
    walk_aborted: bool,
    /// Atomic RMW context: requesting side, target flag, flags-word address.
    at_side: Side,
    at_kind: AtomicKind,
    at_addr: PhysAddr,
    /// VPN whose data TLB entry gets the dirty flag after a successful SC.
    at_vpn: u32,
    /// Flags word to store in the SC (observed LL value with the bit set).
    at_flags: u32,
    /// Uncached store (SC, swap) in flight: address, data, and whether the
    /// write only lands when the response status word is zero (SC).
    unc_store: Option<(PhysAddr, u32, bool)>,
    /// Access address saved across a miss or uncached access.
    miss_vaddr: VirtAddr,
    /// Line-aligned physical address of the refill.
    miss_paddr: PhysAddr,
    /// Reserved victim slot for the refill.
    miss_slot: (usize, usize),
    /// Word index of the access within the refilled line.
    miss_word: usize,
    /// Line currently being refilled; the snoop target matches against this.
    pub refill_nline: Option<LineNumber>,
    /// A snoop hit the in-flight refill; discard it on completion.
    pub cancel: bool,
    /// Instruction-side walk step being serviced through this cache.
    iwalk_addr: PhysAddr,
    iwalk_level: WalkLevel,
    /// Store stalled in `WriteReq`: (address, data, byte enables).
    wreq: (PhysAddr, u32, u8),
    /// XTN operand (line address or virtual address, by operation).
    xtn_arg: u32,
    /// Flush progress cursor.
    flush_ix: usize,
}

impl Default for DcacheRegs {
    fn default() -> Self {
        Self {
            state: DcacheState::Idle,
            save: DcacheState::Idle,
            spec: SpecTrans::default(),
            hit_p: HitP::default(),
            walk_vaddr: VirtAddr(0),
            walk_is_store: false,
            walk_pte_addr: PhysAddr(0),
            pending: None,
            walk_aborted: false,
            at_side: Side::Data,
            at_kind: AtomicKind::Access,
            at_addr: PhysAddr(0),
            at_vpn: 0,
            at_flags: 0,
            unc_store: None,
            miss_vaddr: VirtAddr(0),
            miss_paddr: PhysAddr(0),
            miss_slot: (0, 0),
            miss_word: 0,
            refill_nline: None,
            cancel: false,
            iwalk_addr: PhysAddr(0),
            iwalk_level: WalkLevel::One,
            wreq: (PhysAddr(0), 0, 0),
            xtn_arg: 0,
            flush_ix: 0,
        }
    }
}

impl Controller {
    /// Data-side FSM transition.
    pub(crate) fn dcache_tick(&mut self, inputs: &TickInputs) {
        // Snoop-wins guard, mirrored from the instruction side.
        if let Some(cc) = self.cc_dreq {
            if !matches!(
                self.dfsm.state,
                DcacheState::CcInval | DcacheState::CcUpdate | DcacheState::TlbCcInval
            ) {
                self.dfsm.save = self.dfsm.state;
                self.dfsm.state = match cc.op {
                    CcOp::Inval => DcacheState::CcInval,
                    CcOp::Update { .. } => DcacheState::CcUpdate,
                };
            }
        }

        match self.dfsm.state {
            DcacheState::Idle | DcacheState::Bis => self.dcache_idle(inputs),
            DcacheState::WriteReq => self.dcache_write_req(),
            DcacheState::Tlb1Read => self.dcache_tlb1_read(),
            DcacheState::Tlb1Wait => self.dcache_refill_wait(DcacheState::Tlb1Updt, true),
            DcacheState::Tlb1Updt => self.dcache_tlb1_updt(),
            DcacheState::Tlb2Read => self.dcache_tlb2_read(),
            DcacheState::Tlb2Wait => self.dcache_refill_wait(DcacheState::Tlb2Updt, true),
            DcacheState::Tlb2Updt => self.dcache_tlb2_updt(),
            DcacheState::LlWait => self.dcache_ll_wait(),
            DcacheState::ScWait => self.dcache_sc_wait(),
            DcacheState::ItlbWait => self.dcache_refill_wait(DcacheState::ItlbUpdt, true),
            DcacheState::ItlbUpdt => self.dcache_itlb_updt(),
            DcacheState::MissWait => self.dcache_refill_wait(DcacheState::MissUpdate, false),
            DcacheState::MissUpdate => self.dcache_miss_update(),
            DcacheState::UncWait => self.dcache_unc_wait(),
            DcacheState::Error => {
                self.drsp = Some(DataResponse::fault());
                self.dfsm.state = DcacheState::Idle;
            }
            DcacheState::CcInval => self.dcache_cc_inval(),
            DcacheState::CcUpdate => self.dcache_cc_update(),
            DcacheState::TlbCcInval => {
                if !self.itlb_scan.busy() && !self.dtlb_scan.busy() {
                    self.cc_dreq = None;
                    self.dfsm.state = self.dfsm.save;
                }
            }
            DcacheState::XtnSync => {
                if self.wbuf.is_empty() {
                    self.drsp = Some(DataResponse::ok(0));
                    self.dfsm.state = DcacheState::Idle;
                }
            }
            DcacheState::XtnDcacheFlush => self.dcache_xtn_cache_flush(),
            DcacheState::XtnDcacheInval => self.dcache_xtn_cache_inval(),
            DcacheState::XtnDtlbFlush => self.dcache_xtn_tlb_flush(),
            DcacheState::XtnDtlbInval => self.dcache_xtn_tlb_inval(),
            DcacheState::XtnIcacheWait => {
                if !self.icache_flush_req
                    && !self.itlb_flush_req
                    && self.itlb_inval_req.is_none()
                    && self.icache_inval_req.is_none()
                {
                    self.drsp = Some(DataResponse::ok(0));
                    self.dfsm.state = DcacheState::Idle;
                }
            }
        }
    }

    fn dcache_fault(&mut self, cause: FaultCause, vaddr: VirtAddr) {
        self.dfault(cause, vaddr);
        self.dfsm.state = DcacheState::Error;
    }

    /// Classifies the held data request, after servicing any cross-side
    /// walk or atomic request from the instruction side.
    fn dcache_idle(&mut self, inputs: &TickInputs) {
        if self.dfsm.state == DcacheState::Idle {
            if self.iwalk_req.is_some() {
                self.dcache_serve_iwalk();
                return;
            }
            if let Some(addr) = self.iacc_req {
                if self.vci.d_idle() {
                    self.iacc_req = None;
                    self.dfsm.at_side = Side::Inst;
                    self.dfsm.at_kind = AtomicKind::Access;
                    self.dfsm.at_addr = addr;
                    self.vci
                        .post_d(TxReq::locked(TxTag::PteLl(Side::Inst, AtomicKind::Access), addr));
                    self.dfsm.state = DcacheState::LlWait;
                }
                return;
            }
        }
        self.dfsm.state = DcacheState::Idle;
        let Some(req) = inputs.dreq else {
            return;
        };

        if matches!(req.op, DataOp::XtnRead | DataOp::XtnWrite) {
            self.dcache_xtn(req);
            return;
        }
        if req.vaddr.val() & 3 != 0 {
            self.dcache_fault(FaultCause::Misaligned, req.vaddr);
            return;
        }

        let vaddr = req.vaddr;
        let is_store = matches!(req.op, DataOp::Write | DataOp::Sc | DataOp::Swap);
        let (paddr, cacheable) = if !self.mode.dtlb_on {
            let paddr = vaddr.identity();
            (
                paddr,
                self.mode.dcache_on && !self.cfg.is_uncached(paddr.val()),
            )
        } else {
            let entry = if self.dfsm.spec.valid && self.dfsm.spec.vpn == vaddr.vpn() {
                self.stats.dtlb_hits += 1;
                // The speculative registers do not carry the PTE address a
                // dirty update would need; fall back to the TLB for that.
                if is_store && !self.dfsm.spec.flags.dirty {
                    self.dtlb.translate(vaddr.vpn())
                } else {
                    Some(TlbEntry {
                        valid: true,
                        vpn: self.dfsm.spec.vpn,
                        ppn: self.dfsm.spec.ppn,
                        flags: self.dfsm.spec.flags,
                        pte_addr: PhysAddr(0),
                        nline: 0,
                    })
                }
            } else {
                let hit = self.dtlb.translate(vaddr.vpn());
                if hit.is_some() {
                    self.stats.dtlb_hits += 1;
                }
                hit
            };
            let Some(entry) = entry else {
                self.stats.dtlb_misses += 1;
                self.dcache_start_walk(vaddr, is_store);
                return;
            };
            if req.mode == PrivilegeMode::User && !entry.flags.user {
                self.dcache_fault(FaultCause::PrivilegeViolation, vaddr);
                return;
            }
            if is_store && !entry.flags.writable {
                self.dcache_fault(FaultCause::WriteViolation, vaddr);
                return;
            }
            if is_store && !entry.flags.dirty {
                // First store to a clean page: set the dirty bit in memory
                // before the store may proceed. The store retries once the
                // TLB entry is marked dirty.
                if self.vci.d_idle() {
                    self.dfsm.at_side = Side::Data;
                    self.dfsm.at_kind = AtomicKind::Dirty;
                    self.dfsm.at_addr = entry.pte_addr;
                    self.dfsm.at_vpn = entry.vpn;
                    self.dfsm.walk_vaddr = vaddr;
                    self.vci.post_d(TxReq::locked(
                        TxTag::PteLl(Side::Data, AtomicKind::Dirty),
                        entry.pte_addr,
                    ));
                    self.dfsm.state = DcacheState::LlWait;
                }
                return;
            }
            self.dfsm.spec = SpecTrans {
                valid: true,
                vpn: entry.vpn,
                ppn: entry.ppn,
                flags: entry.flags,
            };
            (
                vaddr.with_ppn(entry.ppn),
                entry.flags.cacheable && self.mode.dcache_on,
            )
        };

        match req.op {
            DataOp::Read => self.dcache_read(vaddr, paddr, cacheable),
            DataOp::Write => self.dcache_write(paddr, req.wdata, req.be),
            DataOp::Ll => self.dcache_uncached(vaddr, TxReq::locked(TxTag::DataLl, paddr)),
            DataOp::Sc => {
                self.dcache_uncached(vaddr, TxReq::store_cond(TxTag::DataSc, paddr, req.wdata));
            }
            DataOp::Swap => {
                self.dcache_uncached(vaddr, TxReq::swap(TxTag::DataSwap, paddr, req.wdata));
            }
            DataOp::XtnRead | DataOp::XtnWrite => unreachable!("dispatched above"),
        }
    }

    fn dcache_read(&mut self, vaddr: VirtAddr, paddr: PhysAddr, cacheable: bool) {
        if !cacheable {
            self.dcache_uncached(vaddr, TxReq::read(TxTag::DataUnc, paddr, 1));
            return;
        }
        if let Some(word) = self.dcache.lookup(paddr) {
            self.stats.dcache_read_hits += 1;
            self.drsp = Some(DataResponse::ok(word));
            return;
        }
        // A read must not bypass a buffered write to its line.
        if self.wbuf.would_hazard(paddr) {
            self.stats.wbuf_hazard_stalls += 1;
            return;
        }
        if !self.vci.d_idle() {
            return;
        }
        let Some((set, way)) = self.dcache_reserve(paddr) else {
            return;
        };
        self.stats.dcache_read_misses += 1;
        self.dfsm.miss_vaddr = vaddr;
        self.dfsm.miss_paddr = paddr.line_base(self.line_shift);
        self.dfsm.miss_slot = (set, way);
        self.dfsm.miss_word = paddr.word_of_line(self.cfg.line_words);
        self.dfsm.refill_nline = Some(paddr.line(self.line_shift));
        self.dfsm.cancel = false;
        self.vci
            .post_d(TxReq::read(TxTag::DataMiss, self.dfsm.miss_paddr, self.cfg.line_words));
        self.dfsm.state = DcacheState::MissWait;
    }

    fn dcache_write(&mut self, paddr: PhysAddr, data: u32, be: u8) {
        if self.wbuf.is_full() {
            self.stats.wbuf_full_stalls += 1;
            self.dfsm.wreq = (paddr, data, be);
            self.dfsm.state = DcacheState::WriteReq;
            return;
        }
        self.dcache_post_write(paddr, data, be);
    }

    /// Posts the write and updates a resident line in place (write-through,
    /// no allocation on miss). The processor is answered immediately.
    fn dcache_post_write(&mut self, paddr: PhysAddr, data: u32, be: u8) {
        let _ = self.wbuf.push(paddr, data, be);
        self.stats.wbuf_writes += 1;
        if self.dcache.write(paddr, data, be) {
            self.stats.dcache_write_hits += 1;
        } else {
            self.stats.dcache_write_misses += 1;
        }
        self.drsp = Some(DataResponse::ok(0));
        self.dfsm.state = DcacheState::Idle;
    }

    fn dcache_write_req(&mut self) {
        if self.wbuf.is_full() {
            self.stats.wbuf_full_stalls += 1;
            return;
        }
        let (paddr, data, be) = self.dfsm.wreq;
        self.dcache_post_write(paddr, data, be);
    }

    fn dcache_uncached(&mut self, vaddr: VirtAddr, req: TxReq) {
        if self.wbuf.would_hazard(req.paddr) {
            self.stats.wbuf_hazard_stalls += 1;
            return;
        }
        if !self.vci.d_idle() {
            return;
        }
        self.stats.dcache_unc += 1;
        self.dfsm.miss_vaddr = vaddr;
        self.dfsm.unc_store = match req.kind {
            VciCmdKind::StoreCond => Some((req.paddr, req.wdata, true)),
            VciCmdKind::Swap => Some((req.paddr, req.wdata, false)),
            _ => None,
        };
        self.vci.post_d(req);
        self.dfsm.state = DcacheState::UncWait;
    }

    /// Reserves the victim slot for a refill into the data cache, chaining
    /// the cleanup and any TLB scans the occupant requires. Returns `None`
    /// while a required resource is busy; the caller retries next tick.
    fn dcache_reserve(&mut self, paddr: PhysAddr) -> Option<(usize, usize)> {
        let victim = self.dcache.victim(paddr);
        if victim.valid {
            if self.clean.d_req.is_some() {
                return None;
            }
            if (victim.in_itlb && self.itlb_scan.busy())
                || (victim.in_dtlb && self.dtlb_scan.busy())
            {
                return None;
            }
            if victim.in_itlb {
                self.itlb_scan.start(victim.nline, ScanReason::Evict);
                self.ifsm.spec.valid = false;
                self.ifsm.hit_p.valid = false;
            }
            if victim.in_dtlb {
                self.dtlb_scan.start(victim.nline, ScanReason::Evict);
                self.dfsm.spec.valid = false;
                self.dfsm.hit_p.valid = false;
            }
            self.dcache.invalidate_slot(victim.set, victim.way);
            self.clean.d_req = Some(victim.nline);
        }
        Some((victim.set, victim.way))
    }

    // ------------------------------------------------------------------
    // Page-table walk (data side's own misses).
    // ------------------------------------------------------------------

    fn dcache_start_walk(&mut self, vaddr: VirtAddr, is_store: bool) {
        self.dfsm.walk_vaddr = vaddr;
        self.dfsm.walk_is_store = is_store;
        self.dfsm.walk_aborted = false;
        if self.dfsm.hit_p.valid && self.dfsm.hit_p.ix1 == vaddr.ix1() {
            self.dfsm.state = DcacheState::Tlb2Read;
        } else {
            self.dfsm.state = DcacheState::Tlb1Read;
        }
    }

    fn dcache_tlb1_read(&mut self) {
        let vaddr = self.dfsm.walk_vaddr;
        let addr = PhysAddr(self.ptpr.val() + u64::from(vaddr.ix1()) * PTD_BYTES);
        if self.wbuf.would_hazard(addr) {
            self.stats.wbuf_hazard_stalls += 1;
            return;
        }
        if let Some(flags) = self.dcache.lookup(addr) {
            self.dcache_walk_l1_decode(flags);
            return;
        }
        self.dcache_walk_fetch(addr, DcacheState::Tlb1Wait);
    }

    fn dcache_tlb1_updt(&mut self) {
        if self.dcache_refill_install() {
            let word = self.vci.d.refill()[self.dfsm.miss_word];
            self.dcache_walk_l1_decode(word);
        }
    }

    fn dcache_walk_l1_decode(&mut self, raw: u32) {
        let ptd = PageDescriptor::new(raw);
        if !ptd.is_valid() {
            self.dcache_fault(FaultCause::Pt1Unmapped, self.dfsm.walk_vaddr);
            return;
        }
        self.dfsm.hit_p = HitP {
            valid: true,
            ix1: self.dfsm.walk_vaddr.ix1(),
            l2_base: ptd.table_base(),
        };
        self.dfsm.state = DcacheState::Tlb2Read;
    }

    fn dcache_tlb2_read(&mut self) {
        let vaddr = self.dfsm.walk_vaddr;
        let addr = PhysAddr(self.dfsm.hit_p.l2_base + u64::from(vaddr.ix2()) * PTE_BYTES);
        self.dfsm.walk_pte_addr = addr;
        if self.wbuf.would_hazard(addr) {
            self.stats.wbuf_hazard_stalls += 1;
            return;
        }
        if let Some((flags, ppn)) = self.dcache.lookup_pair(addr) {
            // Install may not race a scrub of the same array.
            if self.dtlb_scan.busy() {
                return;
            }
            let nline = addr.line(self.line_shift);
            self.dcache_walk_l2_decode(flags, ppn, nline);
            return;
        }
        self.dcache_walk_fetch(addr, DcacheState::Tlb2Wait);
    }

    fn dcache_tlb2_updt(&mut self) {
        if self.dcache_refill_install() {
            let word = self.dfsm.miss_word;
            let flags = self.vci.d.refill()[word];
            let ppn = self.vci.d.refill()[word + 1];
            let nline = self.dfsm.walk_pte_addr.line(self.line_shift);
            self.dcache_walk_l2_decode(flags, ppn, nline);
        }
    }

    fn dcache_walk_l2_decode(&mut self, flags: u32, ppn: u32, nline: LineNumber) {
        let pte = PageTableEntry::new(flags);
        if !pte.is_valid() {
            self.dcache_fault(FaultCause::Pt2Unmapped, self.dfsm.walk_vaddr);
            return;
        }
        let entry = TlbEntry {
            valid: true,
            vpn: self.dfsm.walk_vaddr.vpn(),
            ppn,
            flags: TlbFlags {
                cacheable: pte.is_cacheable(),
                writable: pte.is_writable(),
                executable: pte.is_executable(),
                user: pte.is_user(),
                global: pte.is_global(),
                dirty: pte.is_dirty(),
            },
            pte_addr: self.dfsm.walk_pte_addr,
            nline,
        };
        if pte.is_accessed() {
            self.dcache_install(entry);
            self.dfsm.state = DcacheState::Bis;
        } else {
            self.dfsm.pending = Some(entry);
            self.dfsm.walk_aborted = false;
            if self.vci.d_idle() {
                self.dfsm.at_side = Side::Data;
                self.dfsm.at_kind = AtomicKind::Access;
                self.dfsm.at_addr = self.dfsm.walk_pte_addr;
                self.vci.post_d(TxReq::locked(
                    TxTag::PteLl(Side::Data, AtomicKind::Access),
                    self.dfsm.walk_pte_addr,
                ));
                self.dfsm.state = DcacheState::LlWait;
            } else {
                // The lane drains within bounded ticks; retry the decode.
                self.dfsm.state = DcacheState::Tlb2Read;
                self.dfsm.pending = None;
            }
        }
    }

    /// Installs a walked entry: TLB, backing-line marker, speculative
    /// translation registers.
    fn dcache_install(&mut self, entry: TlbEntry) {
        trace!(vpn = entry.vpn, ppn = entry.ppn, "dtlb install");
        self.dtlb.insert(entry);
        self.dcache.set_marker(entry.nline, Side::Data);
        self.dfsm.spec = SpecTrans {
            valid: true,
            vpn: entry.vpn,
            ppn: entry.ppn,
            flags: entry.flags,
        };
    }

    /// Reserves a victim slot and posts a line read for a walk step (either
    /// side). Stays in the current state while resources are busy.
    fn dcache_walk_fetch(&mut self, addr: PhysAddr, wait: DcacheState) {
        if !self.vci.d_idle() {
            return;
        }
        let Some((set, way)) = self.dcache_reserve(addr) else {
            return;
        };
        let tag = if wait == DcacheState::ItlbWait {
            TxTag::ItlbRead
        } else {
            TxTag::DtlbRead
        };
        self.stats.walk_reads += 1;
        self.dfsm.miss_paddr = addr.line_base(self.line_shift);
        self.dfsm.miss_slot = (set, way);
        self.dfsm.miss_word = addr.word_of_line(self.cfg.line_words);
        self.dfsm.refill_nline = Some(addr.line(self.line_shift));
        self.dfsm.cancel = false;
        self.vci
            .post_d(TxReq::read(tag, self.dfsm.miss_paddr, self.cfg.line_words));
        self.dfsm.state = wait;
    }

    /// Shared wait state for all data-side line refills: handles snoop
    /// cancellation and bus errors, then advances to the install state.
    ///
    /// `walk` selects the fault cause and the abort path for walk reads.
    fn dcache_refill_wait(&mut self, next: DcacheState, walk: bool) {
        if self.dfsm.cancel {
            self.dcache_discard_refill(true, walk);
            return;
        }
        let Some(done) = self.vci.d.done.take() else {
            return;
        };
        if done.error {
            self.dfsm.refill_nline = None;
            if walk {
                self.dcache_walk_error();
            } else {
                self.dcache_fault(FaultCause::BusError, self.dfsm.miss_vaddr);
            }
            return;
        }
        self.dfsm.state = next;
    }

    /// Routes a bus error on a walk-step read to the requesting side.
    fn dcache_walk_error(&mut self) {
        match self.dfsm.state {
            DcacheState::ItlbWait => {
                self.iwalk_rsp = Some(WalkRsp {
                    flags: 0,
                    ppn: 0,
                    nline: 0,
                    error: true,
                });
                self.dfsm.state = DcacheState::Idle;
            }
            DcacheState::Tlb1Wait => {
                self.dcache_fault(FaultCause::Pt1BusError, self.dfsm.walk_vaddr);
            }
            _ => self.dcache_fault(FaultCause::Pt2BusError, self.dfsm.walk_vaddr),
        }
    }

    /// Converts a canceled refill into a cleanup. Walk reads additionally
    /// tell the requesting side to restart; data misses restart silently.
    fn dcache_discard_refill(&mut self, wait_rsp: bool, walk: bool) {
        if wait_rsp && self.vci.d.done.is_none() {
            return;
        }
        if self.clean.d_req.is_some() {
            return;
        }
        self.vci.d.done = None;
        if let Some(nline) = self.dfsm.refill_nline.take() {
            self.clean.d_req = Some(nline);
        }
        self.dfsm.cancel = false;
        self.stats.snoop_cancels += 1;
        if walk && matches!(self.dfsm.state, DcacheState::ItlbWait | DcacheState::ItlbUpdt) {
            self.iwalk_abort = true;
        }
        self.dfsm.state = DcacheState::Idle;
    }

    /// Installs the refilled line into the reserved slot once the scanners
    /// are idle. Returns true when the install happened this tick.
    fn dcache_refill_install(&mut self) -> bool {
        if self.dfsm.cancel {
            let walk = !matches!(self.dfsm.state, DcacheState::MissUpdate);
            self.dcache_discard_refill(false, walk);
            return false;
        }
        if self.itlb_scan.busy() || self.dtlb_scan.busy() {
            return false;
        }
        let (set, way) = self.dfsm.miss_slot;
        self.dcache
            .refill(set, way, self.dfsm.miss_paddr, self.vci.d.refill());
        self.dfsm.refill_nline = None;
        true
    }

    fn dcache_miss_update(&mut self) {
        if self.dcache_refill_install() {
            let word = self.vci.d.refill()[self.dfsm.miss_word];
            self.drsp = Some(DataResponse::ok(word));
            self.dfsm.state = DcacheState::Idle;
        }
    }

    fn dcache_unc_wait(&mut self) {
        let Some(done) = self.vci.d.done.take() else {
            return;
        };
        let unc_store = self.dfsm.unc_store.take();
        if done.error {
            self.dcache_fault(FaultCause::BusError, self.dfsm.miss_vaddr);
            return;
        }
        if let Some((paddr, wdata, conditional)) = unc_store {
            // The store landed in memory (SC status 0, or a swap, which
            // always lands); keep any resident copy of the word coherent,
            // as the write-through path does.
            if !conditional || done.data == 0 {
                let _ = self.dcache.write(paddr, wdata, 0xF);
            }
        }
        self.drsp = Some(DataResponse::ok(done.data));
        self.dfsm.state = DcacheState::Idle;
    }

    // ------------------------------------------------------------------
    // Instruction-side walk service.
    // ------------------------------------------------------------------

    fn dcache_serve_iwalk(&mut self) {
        let Some(step) = self.iwalk_req else {
            return;
        };
        if self.wbuf.would_hazard(step.addr) {
            self.stats.wbuf_hazard_stalls += 1;
            return;
        }
        match step.level {
            WalkLevel::One => {
                if let Some(flags) = self.dcache.lookup(step.addr) {
                    self.iwalk_req = None;
                    self.iwalk_rsp = Some(WalkRsp {
                        flags,
                        ppn: 0,
                        nline: step.addr.line(self.line_shift),
                        error: false,
                    });
                    return;
                }
            }
            WalkLevel::Two => {
                if let Some((flags, ppn)) = self.dcache.lookup_pair(step.addr) {
                    self.iwalk_req = None;
                    self.iwalk_rsp = Some(WalkRsp {
                        flags,
                        ppn,
                        nline: step.addr.line(self.line_shift),
                        error: false,
                    });
                    return;
                }
            }
        }
        self.dfsm.iwalk_addr = step.addr;
        self.dfsm.iwalk_level = step.level;
        self.dcache_walk_fetch(step.addr, DcacheState::ItlbWait);
        if self.dfsm.state == DcacheState::ItlbWait {
            self.iwalk_req = None;
        }
    }

    fn dcache_itlb_updt(&mut self) {
        if self.dcache_refill_install() {
            let word = self.dfsm.miss_word;
            let (flags, ppn) = match self.dfsm.iwalk_level {
                WalkLevel::One => (self.vci.d.refill()[word], 0),
                WalkLevel::Two => (self.vci.d.refill()[word], self.vci.d.refill()[word + 1]),
            };
            self.iwalk_rsp = Some(WalkRsp {
                flags,
                ppn,
                nline: self.dfsm.iwalk_addr.line(self.line_shift),
                error: false,
            });
            self.dfsm.state = DcacheState::Idle;
        }
    }

    // ------------------------------------------------------------------
    // Access/dirty-bit LL/SC maintenance.
    // ------------------------------------------------------------------

    fn dcache_ll_wait(&mut self) {
        if self.vci.d.done.is_some() && self.dtlb_scan.busy() {
            return;
        }
        let Some(done) = self.vci.d.done.take() else {
            return;
        };
        if done.error {
            self.dcache_atomic_error();
            return;
        }
        let bit = match self.dfsm.at_kind {
            AtomicKind::Access => PTE_ACCESSED,
            AtomicKind::Dirty => PTE_DIRTY,
        };
        if done.data & bit != 0 {
            // Another core already set the bit; no SC needed.
            self.dcache_atomic_finish(done.data);
            return;
        }
        self.dfsm.at_flags = done.data | bit;
        self.vci.post_d(TxReq::store_cond(
            TxTag::PteSc(self.dfsm.at_side, self.dfsm.at_kind),
            self.dfsm.at_addr,
            self.dfsm.at_flags,
        ));
        self.dfsm.state = DcacheState::ScWait;
    }

    fn dcache_sc_wait(&mut self) {
        if self.vci.d.done.is_some() && self.dtlb_scan.busy() {
            return;
        }
        let Some(done) = self.vci.d.done.take() else {
            return;
        };
        if done.error {
            self.dcache_atomic_error();
            return;
        }
        if done.data != 0 {
            // Reservation lost: another core's identical lazy update raced
            // ours. Re-issue the locked read.
            self.stats.sc_retries += 1;
            self.vci.post_d(TxReq::locked(
                TxTag::PteLl(self.dfsm.at_side, self.dfsm.at_kind),
                self.dfsm.at_addr,
            ));
            self.dfsm.state = DcacheState::LlWait;
            return;
        }
        match self.dfsm.at_kind {
            AtomicKind::Access => self.stats.access_updates += 1,
            AtomicKind::Dirty => self.stats.dirty_updates += 1,
        }
        // Keep any cached copy of the flags word coherent with memory.
        let _ = self.dcache.write(self.dfsm.at_addr, self.dfsm.at_flags, 0xF);
        self.dcache_atomic_finish(self.dfsm.at_flags);
    }

    fn dcache_atomic_error(&mut self) {
        if self.dfsm.at_side == Side::Inst {
            self.iacc_done = Some(Err(FaultCause::Pt2BusError));
            self.dfsm.state = DcacheState::Idle;
        } else {
            self.dfsm.pending = None;
            self.dcache_fault(FaultCause::Pt2BusError, self.dfsm.walk_vaddr);
        }
    }

    fn dcache_atomic_finish(&mut self, flags: u32) {
        match (self.dfsm.at_side, self.dfsm.at_kind) {
            (Side::Inst, _) => {
                self.iacc_done = Some(Ok(flags));
                self.dfsm.state = DcacheState::Idle;
            }
            (Side::Data, AtomicKind::Access) => {
                let pending = self.dfsm.pending.take();
                if self.dfsm.walk_aborted {
                    self.dfsm.walk_aborted = false;
                    self.dfsm.state = DcacheState::Idle;
                    return;
                }
                if let Some(entry) = pending {
                    self.dcache_install(entry);
                }
                self.dfsm.state = DcacheState::Bis;
            }
            (Side::Data, AtomicKind::Dirty) => {
                self.dtlb.set_dirty(self.dfsm.at_vpn);
                if self.dfsm.spec.valid && self.dfsm.spec.vpn == self.dfsm.at_vpn {
                    self.dfsm.spec.flags.dirty = true;
                }
                // The store that triggered the update retries from Idle.
                self.dfsm.state = DcacheState::Idle;
            }
        }
    }

    // ------------------------------------------------------------------
    // Coherence service.
    // ------------------------------------------------------------------

    fn dcache_cc_inval(&mut self) {
        let Some(cc) = self.cc_dreq else {
            self.dfsm.state = self.dfsm.save;
            return;
        };
        if self.dfsm.refill_nline == Some(cc.nline) {
            self.dfsm.cancel = true;
        }
        if self.dfsm.pending.is_some_and(|p| p.nline == cc.nline) {
            self.dfsm.walk_aborted = true;
        }
        if self.ifsm.pending.is_some_and(|p| p.nline == cc.nline) {
            self.ifsm.walk_aborted = true;
        }
        // Reserve the scanners the markers require before invalidating.
        if let Some((in_i, in_d)) = self.dcache.markers(cc.nline) {
            if (in_i && self.itlb_scan.busy()) || (in_d && self.dtlb_scan.busy()) {
                return;
            }
        }
        let mut scans = false;
        if let Some((in_i, in_d)) = self.dcache.invalidate(cc.nline) {
            if in_i {
                self.itlb_scan.start(cc.nline, ScanReason::Coherence);
                self.ifsm.spec.valid = false;
                self.ifsm.hit_p.valid = false;
                scans = true;
            }
            if in_d {
                self.dtlb_scan.start(cc.nline, ScanReason::Coherence);
                self.dfsm.spec.valid = false;
                self.dfsm.hit_p.valid = false;
                scans = true;
            }
        }
        if scans {
            // The acknowledgement waits for the scrub (bounded by TLB size),
            // never for the bus.
            self.dfsm.state = DcacheState::TlbCcInval;
        } else {
            self.cc_dreq = None;
            self.dfsm.state = self.dfsm.save;
        }
    }

    fn dcache_cc_update(&mut self) {
        let Some(cc) = self.cc_dreq else {
            self.dfsm.state = self.dfsm.save;
            return;
        };
        if self.dfsm.refill_nline == Some(cc.nline) {
            self.dfsm.cancel = true;
        }
        if let CcOp::Update { first } = cc.op {
            for (k, &(word, be)) in self.tgt.upd_words.iter().enumerate() {
                let _ = self.dcache.update_word(cc.nline, first + k, word, be);
            }
        }
        self.cc_dreq = None;
        self.dfsm.state = self.dfsm.save;
    }

    // ------------------------------------------------------------------
    // XTN surface.
    // ------------------------------------------------------------------

    /// Dispatches an XTN pseudo memory operation. Bits 5..2 of the virtual
    /// address select the controller register.
    fn dcache_xtn(&mut self, req: DataRequest) {
        let index = (req.vaddr.val() >> 2) & 0xF;
        // Only the sync barrier is available from user mode.
        if req.mode == PrivilegeMode::User && index != 8 {
            self.dcache_fault(FaultCause::PrivilegeViolation, req.vaddr);
            return;
        }
        match (index, req.op) {
            (0, DataOp::XtnWrite) => {
                // Context switch: new page-table base, all non-global TLB
                // entries dropped on both sides.
                self.ptpr = PhysAddr(u64::from(req.wdata) << PAGE_SHIFT);
                self.itlb_flush_req = true;
                self.dfsm.spec.valid = false;
                self.dfsm.hit_p.valid = false;
                self.dfsm.flush_ix = 0;
                self.dfsm.state = DcacheState::XtnDtlbFlush;
            }
            (0, DataOp::XtnRead) => {
                self.drsp = Some(DataResponse::ok(self.ptpr.ppn()));
            }
            (1, DataOp::XtnWrite) => {
                self.mode = MmuMode::from_bits(req.wdata);
                self.dfsm.spec.valid = false;
                self.dfsm.hit_p.valid = false;
                self.ifsm.spec.valid = false;
                self.ifsm.hit_p.valid = false;
                self.drsp = Some(DataResponse::ok(0));
            }
            (1, DataOp::XtnRead) => {
                self.drsp = Some(DataResponse::ok(self.mode.to_bits()));
            }
            (2, DataOp::XtnWrite) => {
                self.icache_flush_req = true;
                self.dfsm.state = DcacheState::XtnIcacheWait;
            }
            (3, DataOp::XtnWrite) => {
                self.dfsm.flush_ix = 0;
                self.dfsm.state = DcacheState::XtnDcacheFlush;
            }
            (4, DataOp::XtnWrite) => {
                self.itlb_inval_req = Some(VirtAddr(req.wdata));
                self.dfsm.state = DcacheState::XtnIcacheWait;
            }
            (5, DataOp::XtnWrite) => {
                self.dfsm.xtn_arg = req.wdata;
                self.dfsm.state = DcacheState::XtnDtlbInval;
            }
            (6, DataOp::XtnWrite) => {
                self.icache_inval_req = Some(PhysAddr(u64::from(req.wdata)));
                self.dfsm.state = DcacheState::XtnIcacheWait;
            }
            (7, DataOp::XtnWrite) => {
                self.dfsm.xtn_arg = req.wdata;
                self.dfsm.state = DcacheState::XtnDcacheInval;
            }
            (8, DataOp::XtnWrite) => {
                self.dfsm.state = DcacheState::XtnSync;
            }
            (9, DataOp::XtnRead) => {
                // Reading the cause clears it; the address register persists.
                let code = self.ierr_cause.take().map_or(0, FaultCause::code);
                self.drsp = Some(DataResponse::ok(code));
            }
            (10, DataOp::XtnRead) => {
                self.drsp = Some(DataResponse::ok(self.ierr_addr));
            }
            (11, DataOp::XtnRead) => {
                let code = self.derr_cause.take().map_or(0, FaultCause::code);
                self.drsp = Some(DataResponse::ok(code));
            }
            (12, DataOp::XtnRead) => {
                self.drsp = Some(DataResponse::ok(self.derr_addr));
            }
            _ => self.dcache_fault(FaultCause::UndefinedXtn, req.vaddr),
        }
    }

    fn dcache_xtn_cache_flush(&mut self) {
        if self.dfsm.flush_ix >= self.dcache.slots() {
            if self.itlb_scan.busy() || self.dtlb_scan.busy() {
                return;
            }
            self.drsp = Some(DataResponse::ok(0));
            self.dfsm.state = DcacheState::Idle;
            return;
        }
        let (set, way, valid, nline) = self.dcache.flush_slot(self.dfsm.flush_ix);
        if valid {
            if self.clean.d_req.is_some() {
                return;
            }
            if let Some((in_i, in_d)) = self.dcache.markers(nline) {
                if (in_i && self.itlb_scan.busy()) || (in_d && self.dtlb_scan.busy()) {
                    return;
                }
                if in_i {
                    self.itlb_scan.start(nline, ScanReason::Evict);
                    self.ifsm.spec.valid = false;
                    self.ifsm.hit_p.valid = false;
                }
                if in_d {
                    self.dtlb_scan.start(nline, ScanReason::Evict);
                    self.dfsm.spec.valid = false;
                    self.dfsm.hit_p.valid = false;
                }
            }
            self.dcache.invalidate_slot(set, way);
            self.clean.d_req = Some(nline);
        }
        self.dfsm.flush_ix += 1;
    }

    fn dcache_xtn_cache_inval(&mut self) {
        let paddr = PhysAddr(u64::from(self.dfsm.xtn_arg));
        let nline = paddr.line(self.line_shift);
        if let Some((in_i, in_d)) = self.dcache.markers(nline) {
            if self.clean.d_req.is_some() {
                return;
            }
            if (in_i && self.itlb_scan.busy()) || (in_d && self.dtlb_scan.busy()) {
                return;
            }
            if in_i {
                self.itlb_scan.start(nline, ScanReason::Evict);
                self.ifsm.spec.valid = false;
                self.ifsm.hit_p.valid = false;
            }
            if in_d {
                self.dtlb_scan.start(nline, ScanReason::Evict);
                self.dfsm.spec.valid = false;
                self.dfsm.hit_p.valid = false;
            }
            let _ = self.dcache.invalidate(nline);
            self.clean.d_req = Some(nline);
        }
        self.drsp = Some(DataResponse::ok(0));
        self.dfsm.state = DcacheState::Idle;
    }

    fn dcache_xtn_tlb_flush(&mut self) {
        if self.dfsm.flush_ix >= self.dtlb.slots() {
            self.dfsm.spec.valid = false;
            self.dfsm.hit_p.valid = false;
            // The instruction side runs its own flush; respond once both
            // halves are done.
            self.dfsm.state = DcacheState::XtnIcacheWait;
            return;
        }
        let entry = self.dtlb.flush_slot(self.dfsm.flush_ix);
        if entry.valid && !entry.flags.global {
            if self.clean.d_req.is_some() {
                return;
            }
            self.dtlb.invalidate_slot(self.dfsm.flush_ix);
            self.clean.d_req = Some(entry.nline);
        }
        self.dfsm.flush_ix += 1;
    }

    fn dcache_xtn_tlb_inval(&mut self) {
        if self.clean.d_req.is_some() {
            return;
        }
        let vaddr = VirtAddr(self.dfsm.xtn_arg);
        if let Some(nline) = self.dtlb.invalidate_vpn(vaddr.vpn()) {
            self.clean.d_req = Some(nline);
        }
        self.dfsm.spec.valid = false;
        self.drsp = Some(DataResponse::ok(0));
        self.dfsm.state = DcacheState::Idle;
    }
}
