//! The controller proper: FSMs, tick loop, and cross-FSM registers.
//!
//! Scheduling is single-threaded, synchronous, and cooperative: one call to
//! `Controller::tick` advances every FSM by exactly one state transition,
//! computed from the registered state and the tick's inputs; the returned
//! outputs are then a pure function of the updated registers (second pass).
//! "Waiting for the bus" is nothing more than remaining in the same state
//! across ticks while a response flag is unset.
//!
//! The FSMs and their homes:
//! 1. **ICACHE** (`icache`): fetch path, instruction TLB, instruction cache.
//! 2. **DCACHE** (`dcache`): load/store path, data TLB, page-table walker
//!    (serving both sides), access/dirty maintenance, XTN surface.
//! 3. **TGT** (`target`): coherence snoop target.
//! 4. **CMD/RSP** (`vci`): bus command serialization and response demux.
//! 5. **Cleanup + scanners** (`cleanup`): eviction notification and the
//!    associative TLB scrubbers.

/// Cleanup engine and TLB backing-line scanners.
pub mod cleanup;

/// Data-side FSM: loads, stores, walker, atomics, XTN.
pub mod dcache;

/// Instruction-side FSM.
pub mod icache;

/// Coherence snoop target FSM.
pub mod target;

/// Bus command/response engine.
pub mod vci;

use tracing::trace;

use crate::common::addr::{LineNumber, PhysAddr, VirtAddr};
use crate::common::error::{FaultCause, ProtocolError};
use crate::config::{Config, ConfigError};
use crate::iface::bus::{CleanupAck, CleanupCmd, TgtCell, TgtRsp, VciCmd, VciRsp};
use crate::iface::proc::{DataRequest, DataResponse, InstRequest, InstResponse};
use crate::stats::Stats;
use crate::storage::{Cache, Tlb, WriteBuffer};

use self::cleanup::{CleanupEngine, TlbScanner};
use self::dcache::DcacheRegs;
use self::icache::IcacheRegs;
use self::target::TgtRegs;
use self::vci::VciEngine;

/// Everything the controller samples at the start of a tick.
///
/// Requests are level signals held by their producer until consumed; response
/// and acknowledgement cells are single-tick pulses.
#[derive(Clone, Copy, Debug, Default)]
pub struct TickInputs {
    /// Instruction fetch request (held until the response).
    pub ireq: Option<InstRequest>,
    /// Data access request (held until the response).
    pub dreq: Option<DataRequest>,
    /// Fabric is ready to accept the presented bus command this tick.
    pub cmd_ready: bool,
    /// One bus response cell.
    pub rsp: Option<VciRsp>,
    /// One snoop-target command cell (present only when `tgt_cmd_ready`).
    pub tgt_cmd: Option<TgtCell>,
    /// Fabric is ready to accept the presented snoop response this tick.
    pub tgt_rsp_ready: bool,
    /// Fabric is ready to accept the presented cleanup command this tick.
    pub cleanup_ready: bool,
    /// Cleanup acknowledgement cell.
    pub cleanup_ack: Option<CleanupAck>,
}

/// Everything the controller drives at the end of a tick.
#[derive(Clone, Debug, Default)]
pub struct TickOutputs {
    /// Instruction response (valid for exactly one tick).
    pub irsp: Option<InstResponse>,
    /// Data response (valid for exactly one tick).
    pub drsp: Option<DataResponse>,
    /// Bus command cell, held until `cmd_ready` is seen.
    pub cmd: Option<VciCmd>,
    /// The controller always accepts response cells.
    pub rsp_ready: bool,
    /// The snoop target can accept a command cell next tick.
    pub tgt_cmd_ready: bool,
    /// Snoop response cell, held until `tgt_rsp_ready` is seen.
    pub tgt_rsp: Option<TgtRsp>,
    /// Cleanup command cell, held until `cleanup_ready` is seen.
    pub cleanup: Option<CleanupCmd>,
}

/// MMU and cache enable bits, software-visible through the XTN `Mode`
/// register. The controller resets with both TLBs off (boot runs identity
/// mapped) and both caches on.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct MmuMode {
    /// Instruction TLB enabled.
    pub itlb_on: bool,
    /// Data TLB enabled.
    pub dtlb_on: bool,
    /// Instruction cache enabled.
    pub icache_on: bool,
    /// Data cache enabled.
    pub dcache_on: bool,
}

impl Default for MmuMode {
    fn default() -> Self {
        Self {
            itlb_on: false,
            dtlb_on: false,
            icache_on: true,
            dcache_on: true,
        }
    }
}

impl MmuMode {
    /// Decodes the XTN `Mode` register value (bit 0 ITLB, 1 DTLB, 2 icache,
    /// 3 dcache).
    pub fn from_bits(bits: u32) -> Self {
        Self {
            itlb_on: bits & 0b0001 != 0,
            dtlb_on: bits & 0b0010 != 0,
            icache_on: bits & 0b0100 != 0,
            dcache_on: bits & 0b1000 != 0,
        }
    }

    /// Encodes the XTN `Mode` register value.
    pub fn to_bits(self) -> u32 {
        (self.itlb_on as u32)
            | (self.dtlb_on as u32) << 1
            | (self.icache_on as u32) << 2
            | (self.dcache_on as u32) << 3
    }
}

/// Speculative translation registers: the previous translation of a side.
///
/// Sequential accesses within the same virtual page skip the TLB entirely;
/// the permission flags are kept so checks are still applied per access.
#[derive(Clone, Copy, Debug, Default)]
pub(crate) struct SpecTrans {
    pub valid: bool,
    pub vpn: u32,
    pub ppn: u32,
    pub flags: crate::storage::TlbFlags,
}

/// Cached level-1 descriptor from the previous walk: walks within the same
/// 4 MiB region skip walk step 1.
#[derive(Clone, Copy, Debug, Default)]
pub(crate) struct HitP {
    pub valid: bool,
    pub ix1: u32,
    pub l2_base: u64,
}

/// One page-table read step the instruction side asks the data side to
/// perform through the data cache port.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) struct WalkStep {
    pub level: WalkLevel,
    pub addr: PhysAddr,
}

/// Page-table walk level.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum WalkLevel {
    One,
    Two,
}

/// Completion of a walk step: the descriptor/entry words and the cache line
/// that backed the read.
#[derive(Clone, Copy, Debug)]
pub(crate) struct WalkRsp {
    pub flags: u32,
    pub ppn: u32,
    pub nline: LineNumber,
    /// The bus read backing this step failed.
    pub error: bool,
}

/// Coherence request handed from the snoop target to a cache FSM.
#[derive(Clone, Copy, Debug)]
pub(crate) struct CcReq {
    pub nline: LineNumber,
    pub op: CcOp,
}

/// Coherence operation kind; update payload lives in the TGT capture buffer.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum CcOp {
    Inval,
    Update { first: usize },
}

/// The cache-coherent cache/MMU controller for one processor core.
///
/// Owns its cache and TLB arrays and its write buffer exclusively; coherence
/// with other controllers happens purely through bus transactions.
pub struct Controller {
    pub(crate) cfg: Config,
    pub(crate) line_shift: u32,
    pub(crate) stats: Stats,

    // Software-visible registers.
    pub(crate) mode: MmuMode,
    pub(crate) ptpr: PhysAddr,
    pub(crate) ierr_cause: Option<FaultCause>,
    pub(crate) ierr_addr: u32,
    pub(crate) derr_cause: Option<FaultCause>,
    pub(crate) derr_addr: u32,

    // Storage arrays, exclusively owned.
    pub(crate) icache: Cache,
    pub(crate) dcache: Cache,
    pub(crate) itlb: Tlb,
    pub(crate) dtlb: Tlb,
    pub(crate) wbuf: WriteBuffer,

    // FSM register blocks.
    pub(crate) ifsm: IcacheRegs,
    pub(crate) dfsm: DcacheRegs,
    pub(crate) tgt: TgtRegs,
    pub(crate) vci: VciEngine,
    pub(crate) clean: CleanupEngine,
    pub(crate) itlb_scan: TlbScanner,
    pub(crate) dtlb_scan: TlbScanner,

    // Cross-FSM request registers (instruction side -> data side).
    pub(crate) iwalk_req: Option<WalkStep>,
    pub(crate) iwalk_rsp: Option<WalkRsp>,
    pub(crate) iwalk_abort: bool,
    pub(crate) iacc_req: Option<PhysAddr>,
    pub(crate) iacc_done: Option<Result<u32, FaultCause>>,

    // XTN service requests (data side -> instruction side).
    pub(crate) itlb_flush_req: bool,
    pub(crate) icache_flush_req: bool,
    pub(crate) itlb_inval_req: Option<VirtAddr>,
    pub(crate) icache_inval_req: Option<PhysAddr>,

    // Coherence requests (snoop target -> cache FSMs).
    pub(crate) cc_ireq: Option<CcReq>,
    pub(crate) cc_dreq: Option<CcReq>,

    // Processor response registers (single-tick pulses).
    pub(crate) irsp: Option<InstResponse>,
    pub(crate) drsp: Option<DataResponse>,
}

impl Controller {
    /// Builds a controller from a validated configuration.
    ///
    /// # Errors
    ///
    /// Returns a `ConfigError` when the geometry is invalid.
    pub fn new(cfg: &Config) -> Result<Self, ConfigError> {
        cfg.validate()?;
        let line_shift = cfg.line_shift();
        Ok(Self {
            line_shift,
            stats: Stats::default(),
            mode: MmuMode::default(),
            ptpr: PhysAddr(0),
            ierr_cause: None,
            ierr_addr: 0,
            derr_cause: None,
            derr_addr: 0,
            icache: Cache::new(&cfg.icache, cfg.line_words),
            dcache: Cache::new(&cfg.dcache, cfg.line_words),
            itlb: Tlb::new(&cfg.itlb),
            dtlb: Tlb::new(&cfg.dtlb),
            wbuf: WriteBuffer::new(cfg.wbuf_depth, line_shift),
            ifsm: IcacheRegs::default(),
            dfsm: DcacheRegs::default(),
            tgt: TgtRegs::new(cfg.line_words),
            vci: VciEngine::new(cfg.line_words),
            clean: CleanupEngine::default(),
            itlb_scan: TlbScanner::default(),
            dtlb_scan: TlbScanner::default(),
            iwalk_req: None,
            iwalk_rsp: None,
            iwalk_abort: false,
            iacc_req: None,
            iacc_done: None,
            itlb_flush_req: false,
            icache_flush_req: false,
            itlb_inval_req: None,
            icache_inval_req: None,
            cc_ireq: None,
            cc_dreq: None,
            irsp: None,
            drsp: None,
            cfg: cfg.clone(),
        })
    }

    /// Advances every FSM by one transition.
    ///
    /// # Errors
    ///
    /// Returns a `ProtocolError` when the bus or the coherence fabric breaks
    /// its contract; the simulation must stop.
    pub fn tick(&mut self, inputs: &TickInputs) -> Result<TickOutputs, ProtocolError> {
        self.stats.ticks += 1;
        self.irsp = None;
        self.drsp = None;

        self.target_tick(inputs)?;
        self.rsp_tick(inputs)?;
        self.icache_tick(inputs);
        self.dcache_tick(inputs);
        self.scan_tick();
        self.cleanup_tick(inputs)?;
        self.cmd_tick(inputs);

        Ok(self.outputs())
    }

    /// Computes the output port values from the registered state.
    pub fn outputs(&self) -> TickOutputs {
        TickOutputs {
            irsp: self.irsp,
            drsp: self.drsp,
            cmd: self.vci.cmd_cell(),
            rsp_ready: true,
            tgt_cmd_ready: self.tgt.ready(),
            tgt_rsp: self.tgt.rsp_cell(),
            cleanup: self.clean.cmd_cell(),
        }
    }

    /// Event counters since construction.
    pub fn stats(&self) -> &Stats {
        &self.stats
    }

    /// Current MMU mode register value.
    pub fn mode(&self) -> MmuMode {
        self.mode
    }

    /// Current page-table base register.
    pub fn ptpr(&self) -> PhysAddr {
        self.ptpr
    }

    /// Shift from a physical byte address to its line number.
    pub fn line_shift(&self) -> u32 {
        self.line_shift
    }

    fn scan_tick(&mut self) {
        self.stats.tlb_scrubbed += self.itlb_scan.step(&mut self.itlb);
        self.stats.tlb_scrubbed += self.dtlb_scan.step(&mut self.dtlb);
    }

    /// Latches an instruction-side fault and schedules the error response.
    pub(crate) fn ifault(&mut self, cause: FaultCause, vaddr: VirtAddr) {
        trace!(%cause, %vaddr, "instruction fault");
        self.ierr_cause = Some(cause);
        self.ierr_addr = vaddr.val();
        self.stats.faults += 1;
    }

    /// Latches a data-side fault and schedules the error response.
    pub(crate) fn dfault(&mut self, cause: FaultCause, vaddr: VirtAddr) {
        trace!(%cause, %vaddr, "data fault");
        self.derr_cause = Some(cause);
        self.derr_addr = vaddr.val();
        self.stats.faults += 1;
    }
}

impl std::fmt::Debug for Controller {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Controller")
            .field("icache_state", &self.ifsm.state)
            .field("dcache_state", &self.dfsm.state)
            .field("mode", &self.mode)
            .field("ptpr", &self.ptpr)
            .finish_non_exhaustive()
    }
}
