//! Instruction-side FSM.
//!
//! Serves the fetch port: translation (speculative same-page hit, TLB hit,
//! or a two-level walk delegated to the data side), instruction cache lookup,
//! miss refill, and uncached fetch. Also executes the instruction-side halves
//! of the XTN maintenance operations on behalf of the data side (cache/TLB
//! flush and invalidate), and services coherence requests routed to it by the
//! snoop target.
//!
//! The page-table walk itself runs on the data cache port: this FSM only
//! posts one `WalkStep` at a time and waits for the `WalkRsp`. The
//! accessed-bit read-modify-write is likewise delegated.

use tracing::trace;

use crate::common::addr::{PhysAddr, VirtAddr};
use crate::common::error::FaultCause;
use crate::common::pte::{PageDescriptor, PageTableEntry, PTD_BYTES, PTE_BYTES};
use crate::iface::bus::{Side, TxTag};
use crate::iface::proc::{InstRequest, InstResponse, PrivilegeMode};
use crate::storage::{TlbEntry, TlbFlags};

use super::vci::TxReq;
use super::{CcOp, Controller, HitP, SpecTrans, TickInputs, WalkLevel, WalkStep};
use crate::common::addr::LineNumber;

/// Instruction-side FSM states.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub(crate) enum IcacheState {
    /// Classify the held fetch request (or service a maintenance request).
    #[default]
    Idle,
    /// Retranslate after a walk completed or a prediction went stale; same
    /// classification as `Idle` without re-checking maintenance requests.
    Bis,
    /// Walk step 1 posted to the data side.
    Tlb1Wait,
    /// Walk step 2 posted to the data side.
    Tlb2Wait,
    /// Accessed-bit read-modify-write delegated to the data side.
    AccWait,
    /// Line refill outstanding on the bus.
    MissWait,
    /// Refill complete; install the line and respond.
    MissUpdate,
    /// Uncached fetch outstanding on the bus.
    UncWait,
    /// Deliver the error response for a latched fault.
    Error,
    /// Servicing a snoop invalidate.
    CcInval,
    /// Servicing a snoop update.
    CcUpdate,
    /// Parked while a coherence scrub of the instruction TLB runs.
    TlbCcInval,
    /// Context-switch TLB flush: drop all non-global entries, one slot per
    /// tick, each dropped entry with a cleanup handshake.
    SwFlush,
    /// Whole-cache flush requested via XTN, one slot per tick.
    CacheFlush,
    /// Single-entry TLB invalidate requested via XTN.
    TlbInval,
    /// Single-line cache invalidate requested via XTN.
    CacheInval,
}

/// Instruction-side FSM registers.
pub(crate) struct IcacheRegs {
    pub state: IcacheState,
    /// State to resume after a coherence service.
    save: IcacheState,
    /// Speculative same-page translation from the previous fetch.
    pub(super) spec: SpecTrans,
    /// Cached level-1 descriptor from the previous walk.
    pub(super) hit_p: HitP,
    /// Virtual address being walked.
    walk_vaddr: VirtAddr,
    /// Physical address of the level-2 entry being read.
    walk_pte_addr: PhysAddr,
    /// Entry waiting for the accessed-bit update before install.
    pub(super) pending: Option<TlbEntry>,
    /// The pending entry's backing line died; discard instead of installing.
    pub(super) walk_aborted: bool,
    /// Fetch address saved across a miss or uncached fetch.
    miss_vaddr: VirtAddr,
    /// Line-aligned physical address of the refill.
    miss_paddr: PhysAddr,
    /// Reserved victim slot for the refill.
    miss_slot: (usize, usize),
    /// Word index of the fetch within the refilled line.
    miss_word: usize,
    /// Line currently being refilled; the snoop target matches against this.
    pub refill_nline: Option<LineNumber>,
    /// A snoop hit the in-flight refill; discard it on completion.
    pub cancel: bool,
    /// Flush progress cursor.
    flush_ix: usize,
}

impl Default for IcacheRegs {
    fn default() -> Self {
        Self {
            state: IcacheState::Idle,
            save: IcacheState::Idle,
            spec: SpecTrans::default(),
            hit_p: HitP::default(),
            walk_vaddr: VirtAddr(0),
            walk_pte_addr: PhysAddr(0),
            pending: None,
            walk_aborted: false,
            miss_vaddr: VirtAddr(0),
            miss_paddr: PhysAddr(0),
            miss_slot: (0, 0),
            miss_word: 0,
            refill_nline: None,
            cancel: false,
            flush_ix: 0,
        }
    }
}

impl Controller {
    /// Instruction-side FSM transition.
    pub(crate) fn icache_tick(&mut self, inputs: &TickInputs) {
        // A pending snoop wins over whatever the FSM is doing. Single guard,
        // evaluated before state dispatch, so a snoop arriving in any cycle
        // of a multi-cycle operation is serviced next tick at the latest.
        if let Some(cc) = self.cc_ireq {
            if !matches!(
                self.ifsm.state,
                IcacheState::CcInval | IcacheState::CcUpdate | IcacheState::TlbCcInval
            ) {
                self.ifsm.save = self.ifsm.state;
                self.ifsm.state = match cc.op {
                    CcOp::Inval => IcacheState::CcInval,
                    CcOp::Update { .. } => IcacheState::CcUpdate,
                };
            }
        }
        // No translation while a coherence scrub of the instruction TLB runs.
        if matches!(self.ifsm.state, IcacheState::Idle | IcacheState::Bis)
            && self.itlb_scan.busy_coherence()
        {
            self.ifsm.state = IcacheState::TlbCcInval;
        }

        match self.ifsm.state {
            IcacheState::Idle | IcacheState::Bis => self.icache_idle(inputs),
            IcacheState::Tlb1Wait => self.icache_tlb1_wait(),
            IcacheState::Tlb2Wait => self.icache_tlb2_wait(),
            IcacheState::AccWait => self.icache_acc_wait(),
            IcacheState::MissWait => self.icache_miss_wait(),
            IcacheState::MissUpdate => self.icache_miss_update(),
            IcacheState::UncWait => self.icache_unc_wait(),
            IcacheState::Error => {
                self.irsp = Some(InstResponse::fault());
                self.ifsm.state = IcacheState::Idle;
            }
            IcacheState::CcInval => self.icache_cc_inval(),
            IcacheState::CcUpdate => self.icache_cc_update(),
            IcacheState::TlbCcInval => {
                if !self.itlb_scan.busy() {
                    self.ifsm.state = IcacheState::Idle;
                }
            }
            IcacheState::SwFlush => self.icache_sw_flush(),
            IcacheState::CacheFlush => self.icache_cache_flush(),
            IcacheState::TlbInval => self.icache_tlb_inval(),
            IcacheState::CacheInval => self.icache_cache_inval(),
        }
    }

    fn icache_fault(&mut self, cause: FaultCause, vaddr: VirtAddr) {
        self.ifault(cause, vaddr);
        self.ifsm.state = IcacheState::Error;
    }

    /// Classifies the held fetch request: translation, then cache access.
    fn icache_idle(&mut self, inputs: &TickInputs) {
        if self.ifsm.state == IcacheState::Idle {
            // Maintenance requests from the XTN surface come first; a fetch
            // raced by a flush must see the post-flush state.
            if self.icache_flush_req {
                self.ifsm.flush_ix = 0;
                self.ifsm.state = IcacheState::CacheFlush;
                return;
            }
            if self.itlb_flush_req {
                self.ifsm.flush_ix = 0;
                self.ifsm.state = IcacheState::SwFlush;
                return;
            }
            if self.itlb_inval_req.is_some() {
                self.ifsm.state = IcacheState::TlbInval;
                return;
            }
            if self.icache_inval_req.is_some() {
                self.ifsm.state = IcacheState::CacheInval;
                return;
            }
        }
        self.ifsm.state = IcacheState::Idle;
        let Some(req) = inputs.ireq else {
            return;
        };

        let vaddr = req.vaddr;
        let (paddr, cacheable) = if !self.mode.itlb_on {
            let paddr = vaddr.identity();
            (
                paddr,
                self.mode.icache_on && !self.cfg.is_uncached(paddr.val()),
            )
        } else if self.ifsm.spec.valid && self.ifsm.spec.vpn == vaddr.vpn() {
            self.stats.itlb_hits += 1;
            let flags = self.ifsm.spec.flags;
            if !self.icache_check(flags, req) {
                return;
            }
            (
                vaddr.with_ppn(self.ifsm.spec.ppn),
                flags.cacheable && self.mode.icache_on,
            )
        } else if let Some(entry) = self.itlb.translate(vaddr.vpn()) {
            self.stats.itlb_hits += 1;
            if !self.icache_check(entry.flags, req) {
                return;
            }
            self.ifsm.spec = SpecTrans {
                valid: true,
                vpn: entry.vpn,
                ppn: entry.ppn,
                flags: entry.flags,
            };
            (
                vaddr.with_ppn(entry.ppn),
                entry.flags.cacheable && self.mode.icache_on,
            )
        } else {
            self.stats.itlb_misses += 1;
            self.icache_start_walk(vaddr);
            return;
        };

        if !cacheable {
            if self.vci.i_idle() {
                self.stats.icache_unc += 1;
                self.ifsm.miss_vaddr = vaddr;
                self.vci.post_i(TxReq::read(TxTag::InsUnc, paddr, 1));
                self.ifsm.state = IcacheState::UncWait;
            }
            return;
        }
        if let Some(word) = self.icache.lookup(paddr) {
            self.stats.icache_hits += 1;
            self.irsp = Some(InstResponse::ok(word));
            return;
        }
        if !self.vci.i_idle() {
            return;
        }
        let victim = self.icache.victim(paddr);
        if victim.valid {
            if self.clean.i_req.is_some() {
                return;
            }
            self.icache.invalidate_slot(victim.set, victim.way);
            self.clean.i_req = Some(victim.nline);
        }
        self.stats.icache_misses += 1;
        self.ifsm.miss_vaddr = vaddr;
        self.ifsm.miss_paddr = paddr.line_base(self.line_shift);
        self.ifsm.miss_slot = (victim.set, victim.way);
        self.ifsm.miss_word = paddr.word_of_line(self.cfg.line_words);
        self.ifsm.refill_nline = Some(paddr.line(self.line_shift));
        self.ifsm.cancel = false;
        self.vci
            .post_i(TxReq::read(TxTag::InsMiss, self.ifsm.miss_paddr, self.cfg.line_words));
        self.ifsm.state = IcacheState::MissWait;
    }

    /// Permission checks on a translated fetch. Returns false after routing
    /// to the error state.
    fn icache_check(&mut self, flags: TlbFlags, req: InstRequest) -> bool {
        if !flags.executable {
            self.icache_fault(FaultCause::ExecViolation, req.vaddr);
            return false;
        }
        if req.mode == PrivilegeMode::User && !flags.user {
            self.icache_fault(FaultCause::PrivilegeViolation, req.vaddr);
            return false;
        }
        true
    }

    /// Posts the first walk step, skipping level 1 when the cached
    /// descriptor still covers this address.
    fn icache_start_walk(&mut self, vaddr: VirtAddr) {
        self.ifsm.walk_vaddr = vaddr;
        self.ifsm.walk_aborted = false;
        if self.ifsm.hit_p.valid && self.ifsm.hit_p.ix1 == vaddr.ix1() {
            let addr = PhysAddr(self.ifsm.hit_p.l2_base + u64::from(vaddr.ix2()) * PTE_BYTES);
            self.ifsm.walk_pte_addr = addr;
            self.iwalk_req = Some(WalkStep {
                level: WalkLevel::Two,
                addr,
            });
            self.ifsm.state = IcacheState::Tlb2Wait;
        } else {
            let addr = PhysAddr(self.ptpr.val() + u64::from(vaddr.ix1()) * PTD_BYTES);
            self.iwalk_req = Some(WalkStep {
                level: WalkLevel::One,
                addr,
            });
            self.ifsm.state = IcacheState::Tlb1Wait;
        }
    }

    fn icache_tlb1_wait(&mut self) {
        if self.iwalk_abort {
            self.iwalk_abort = false;
            self.ifsm.state = IcacheState::Idle;
            return;
        }
        let Some(rsp) = self.iwalk_rsp.take() else {
            return;
        };
        if rsp.error {
            self.icache_fault(FaultCause::Pt1BusError, self.ifsm.walk_vaddr);
            return;
        }
        let ptd = PageDescriptor::new(rsp.flags);
        if !ptd.is_valid() {
            self.icache_fault(FaultCause::Pt1Unmapped, self.ifsm.walk_vaddr);
            return;
        }
        self.ifsm.hit_p = HitP {
            valid: true,
            ix1: self.ifsm.walk_vaddr.ix1(),
            l2_base: ptd.table_base(),
        };
        let addr =
            PhysAddr(ptd.table_base() + u64::from(self.ifsm.walk_vaddr.ix2()) * PTE_BYTES);
        self.ifsm.walk_pte_addr = addr;
        self.iwalk_req = Some(WalkStep {
            level: WalkLevel::Two,
            addr,
        });
        self.ifsm.state = IcacheState::Tlb2Wait;
    }

    fn icache_tlb2_wait(&mut self) {
        if self.iwalk_abort {
            self.iwalk_abort = false;
            self.ifsm.state = IcacheState::Idle;
            return;
        }
        // An install must not race a scrub of the same array.
        if self.iwalk_rsp.is_some() && self.itlb_scan.busy() {
            return;
        }
        let Some(rsp) = self.iwalk_rsp.take() else {
            return;
        };
        if rsp.error {
            self.icache_fault(FaultCause::Pt2BusError, self.ifsm.walk_vaddr);
            return;
        }
        let pte = PageTableEntry::new(rsp.flags);
        if !pte.is_valid() {
            self.icache_fault(FaultCause::Pt2Unmapped, self.ifsm.walk_vaddr);
            return;
        }
        let entry = TlbEntry {
            valid: true,
            vpn: self.ifsm.walk_vaddr.vpn(),
            ppn: rsp.ppn,
            flags: TlbFlags {
                cacheable: pte.is_cacheable(),
                writable: pte.is_writable(),
                executable: pte.is_executable(),
                user: pte.is_user(),
                global: pte.is_global(),
                dirty: pte.is_dirty(),
            },
            pte_addr: self.ifsm.walk_pte_addr,
            nline: rsp.nline,
        };
        if pte.is_accessed() {
            self.icache_install(entry);
            self.ifsm.state = IcacheState::Bis;
        } else {
            // First use of this translation: the accessed bit must be set in
            // memory before the entry may be used.
            self.ifsm.pending = Some(entry);
            self.ifsm.walk_aborted = false;
            self.iacc_req = Some(self.ifsm.walk_pte_addr);
            self.ifsm.state = IcacheState::AccWait;
        }
    }

    fn icache_acc_wait(&mut self) {
        if self.iacc_done.is_none() {
            return;
        }
        if !self.ifsm.walk_aborted && self.itlb_scan.busy() {
            return;
        }
        let Some(result) = self.iacc_done.take() else {
            return;
        };
        let pending = self.ifsm.pending.take();
        if self.ifsm.walk_aborted {
            // The backing line died while the update was in flight; the walk
            // restarts from scratch.
            self.ifsm.walk_aborted = false;
            self.ifsm.state = IcacheState::Idle;
            return;
        }
        match (result, pending) {
            (Ok(_), Some(entry)) => {
                self.icache_install(entry);
                self.ifsm.state = IcacheState::Bis;
            }
            (Err(cause), _) => self.icache_fault(cause, self.ifsm.walk_vaddr),
            (Ok(_), None) => self.ifsm.state = IcacheState::Idle,
        }
    }

    /// Installs a walked entry: TLB, backing-line marker, and the
    /// speculative translation registers.
    fn icache_install(&mut self, entry: TlbEntry) {
        trace!(vpn = entry.vpn, ppn = entry.ppn, "itlb install");
        self.itlb.insert(entry);
        self.dcache.set_marker(entry.nline, Side::Inst);
        self.ifsm.spec = SpecTrans {
            valid: true,
            vpn: entry.vpn,
            ppn: entry.ppn,
            flags: entry.flags,
        };
    }

    fn icache_miss_wait(&mut self) {
        if self.ifsm.cancel {
            self.icache_discard_refill(true);
            return;
        }
        let Some(done) = self.vci.i.done.take() else {
            return;
        };
        if done.error {
            self.ifsm.refill_nline = None;
            self.icache_fault(FaultCause::BusError, self.ifsm.miss_vaddr);
            return;
        }
        self.ifsm.state = IcacheState::MissUpdate;
    }

    fn icache_miss_update(&mut self) {
        if self.ifsm.cancel {
            self.icache_discard_refill(false);
            return;
        }
        let (set, way) = self.ifsm.miss_slot;
        self.icache
            .refill(set, way, self.ifsm.miss_paddr, self.vci.i.refill());
        self.ifsm.refill_nline = None;
        let word = self.vci.i.refill()[self.ifsm.miss_word];
        self.stats.icache_hits += 1;
        self.irsp = Some(InstResponse::ok(word));
        self.ifsm.state = IcacheState::Idle;
    }

    /// Converts a canceled refill into a cleanup; the fetch silently
    /// restarts from `Idle`.
    fn icache_discard_refill(&mut self, wait_rsp: bool) {
        if wait_rsp && self.vci.i.done.is_none() {
            return;
        }
        if self.clean.i_req.is_some() {
            return;
        }
        self.vci.i.done = None;
        if let Some(nline) = self.ifsm.refill_nline.take() {
            self.clean.i_req = Some(nline);
        }
        self.ifsm.cancel = false;
        self.stats.snoop_cancels += 1;
        self.ifsm.state = IcacheState::Idle;
    }

    fn icache_unc_wait(&mut self) {
        let Some(done) = self.vci.i.done.take() else {
            return;
        };
        if done.error {
            self.icache_fault(FaultCause::BusError, self.ifsm.miss_vaddr);
            return;
        }
        self.irsp = Some(InstResponse::ok(done.data));
        self.ifsm.state = IcacheState::Idle;
    }

    fn icache_cc_inval(&mut self) {
        let Some(cc) = self.cc_ireq else {
            self.ifsm.state = self.ifsm.save;
            return;
        };
        if self.ifsm.refill_nline == Some(cc.nline) {
            self.ifsm.cancel = true;
        }
        if self.ifsm.pending.is_some_and(|p| p.nline == cc.nline) {
            self.ifsm.walk_aborted = true;
        }
        let _ = self.icache.invalidate(cc.nline);
        self.cc_ireq = None;
        self.ifsm.state = self.ifsm.save;
    }

    fn icache_cc_update(&mut self) {
        let Some(cc) = self.cc_ireq else {
            self.ifsm.state = self.ifsm.save;
            return;
        };
        if self.ifsm.refill_nline == Some(cc.nline) {
            self.ifsm.cancel = true;
        }
        if let CcOp::Update { first } = cc.op {
            for (k, &(word, be)) in self.tgt.upd_words.iter().enumerate() {
                let _ = self.icache.update_word(cc.nline, first + k, word, be);
            }
        }
        self.cc_ireq = None;
        self.ifsm.state = self.ifsm.save;
    }

    fn icache_sw_flush(&mut self) {
        if self.ifsm.flush_ix >= self.itlb.slots() {
            self.itlb_flush_req = false;
            self.ifsm.spec.valid = false;
            self.ifsm.hit_p.valid = false;
            self.ifsm.state = IcacheState::Idle;
            return;
        }
        let entry = self.itlb.flush_slot(self.ifsm.flush_ix);
        if entry.valid && !entry.flags.global {
            if self.clean.i_req.is_some() {
                return;
            }
            self.itlb.invalidate_slot(self.ifsm.flush_ix);
            self.clean.i_req = Some(entry.nline);
        }
        self.ifsm.flush_ix += 1;
    }

    fn icache_cache_flush(&mut self) {
        if self.ifsm.flush_ix >= self.icache.slots() {
            self.icache_flush_req = false;
            self.ifsm.state = IcacheState::Idle;
            return;
        }
        let (set, way, valid, nline) = self.icache.flush_slot(self.ifsm.flush_ix);
        if valid {
            if self.clean.i_req.is_some() {
                return;
            }
            self.icache.invalidate_slot(set, way);
            self.clean.i_req = Some(nline);
        }
        self.ifsm.flush_ix += 1;
    }

    fn icache_tlb_inval(&mut self) {
        let Some(vaddr) = self.itlb_inval_req else {
            self.ifsm.state = IcacheState::Idle;
            return;
        };
        if self.clean.i_req.is_some() {
            return;
        }
        if let Some(nline) = self.itlb.invalidate_vpn(vaddr.vpn()) {
            self.clean.i_req = Some(nline);
        }
        self.ifsm.spec.valid = false;
        self.itlb_inval_req = None;
        self.ifsm.state = IcacheState::Idle;
    }

    fn icache_cache_inval(&mut self) {
        let Some(paddr) = self.icache_inval_req else {
            self.ifsm.state = IcacheState::Idle;
            return;
        };
        let nline = paddr.line(self.line_shift);
        if self.icache.contains(nline) {
            if self.clean.i_req.is_some() {
                return;
            }
            let _ = self.icache.invalidate(nline);
            self.clean.i_req = Some(nline);
        }
        self.icache_inval_req = None;
        self.ifsm.state = IcacheState::Idle;
    }
}
