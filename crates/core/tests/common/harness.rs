//! Test bench for driving a controller through its ports, one tick at a time.
//!
//! The `Fabric` stands in for everything on the other side of the bus: a
//! word-addressed memory, the split-transaction response engine, the
//! coherence directory (snoop source, cleanup sink), and the LL/SC
//! reservation monitor. The `TestBench` owns one controller and one fabric
//! and closes the loop: outputs of tick N become inputs of tick N+1.
//!
//! Injection knobs on the fabric let tests model a slow memory
//! (`extra_latency`), a stalled command channel (`ready`), bus errors
//! (`fail_at`), lost reservations (`force_sc_fail`), and a silent memory
//! that never answers (`mute`), for hand-crafted protocol-violation tests.

use std::collections::{HashMap, HashSet, VecDeque};

use ccvcache_core::common::addr::{LineNumber, PhysAddr, VirtAddr, PAGE_SHIFT};
use ccvcache_core::common::error::ProtocolError;
use ccvcache_core::common::pte::{PTD_BYTES, PTD_PPN_MASK, PTE_BYTES, PTE_VALID};
use ccvcache_core::iface::bus::{
    CleanupAck, Side, TgtCell, TgtOp, TxTag, VciCmd, VciCmdKind, VciRsp,
};
use ccvcache_core::iface::proc::{
    DataOp, DataRequest, DataResponse, InstRequest, InstResponse, PrivilegeMode,
};
use ccvcache_core::{Config, Controller, TickInputs, TickOutputs};

/// Ticks before a blocked request helper panics.
pub const TIMEOUT: usize = 5_000;

/// Everything on the far side of the controller's bus ports.
pub struct Fabric {
    mem: HashMap<u64, u32>,
    rsp_queue: VecDeque<Option<VciRsp>>,
    ack_queue: VecDeque<Option<CleanupAck>>,
    snoops: VecDeque<TgtCell>,
    reservation: Option<u64>,
    next_table: u64,
    fail_words: HashSet<u64>,

    /// Every command cell accepted, in order.
    pub cmd_log: Vec<TxTag>,
    /// Every cleanup notification received, in order.
    pub cleanups: Vec<(LineNumber, Side)>,
    /// Every snoop acknowledgement received, in order.
    pub snoop_acks: Vec<Side>,

    /// Command channel ready; a held cell is not accepted while false.
    pub ready: bool,
    /// Accept commands but never answer them (protocol tests inject
    /// responses by hand).
    pub mute: bool,
    /// Idle ticks inserted before each transaction's first response cell.
    pub extra_latency: usize,
    /// Number of upcoming store-conditionals to fail regardless of the
    /// reservation.
    pub force_sc_fail: usize,
}

impl Default for Fabric {
    fn default() -> Self {
        Self::new()
    }
}

impl Fabric {
    pub fn new() -> Self {
        Self {
            mem: HashMap::new(),
            rsp_queue: VecDeque::new(),
            ack_queue: VecDeque::new(),
            snoops: VecDeque::new(),
            reservation: None,
            next_table: 0,
            fail_words: HashSet::new(),
            cmd_log: Vec::new(),
            cleanups: Vec::new(),
            snoop_acks: Vec::new(),
            ready: true,
            mute: false,
            extra_latency: 0,
            force_sc_fail: 0,
        }
    }

    /// Reads the memory word containing `paddr` (missing words read 0).
    pub fn read_word(&self, paddr: u64) -> u32 {
        self.mem.get(&(paddr & !3)).copied().unwrap_or(0)
    }

    /// Writes the memory word containing `paddr`.
    pub fn write_word(&mut self, paddr: u64, data: u32) {
        let _ = self.mem.insert(paddr & !3, data);
    }

    /// Marks the word at `paddr` as answering every read with a bus error.
    pub fn fail_at(&mut self, paddr: u64) {
        let _ = self.fail_words.insert(paddr & !3);
    }

    /// Installs a 4 KiB mapping in the two-level page table rooted at
    /// `pt_base`, allocating the level-2 table on first use. Returns the
    /// physical address of the entry's flags word.
    ///
    /// `flags` is the raw level-2 flags word; pass the `PTE_*` constants
    /// or'd together (the valid bit included).
    pub fn map_page(&mut self, pt_base: u64, vaddr: u32, ppn: u32, flags: u32) -> u64 {
        if self.next_table == 0 {
            self.next_table = pt_base + 0x1000;
        }
        let va = VirtAddr::new(vaddr);
        let ptd_addr = pt_base + u64::from(va.ix1()) * PTD_BYTES;
        let ptd = self.read_word(ptd_addr);
        let l2_base = if ptd & PTE_VALID != 0 {
            u64::from(ptd & PTD_PPN_MASK) << PAGE_SHIFT
        } else {
            let base = self.next_table;
            self.next_table += 0x1000;
            self.write_word(ptd_addr, PTE_VALID | (base >> PAGE_SHIFT) as u32);
            base
        };
        let pte_addr = l2_base + u64::from(va.ix2()) * PTE_BYTES;
        self.write_word(pte_addr, flags);
        self.write_word(pte_addr + 4, ppn);
        pte_addr
    }

    /// Queues a snoop invalidate for `nline`.
    pub fn push_inval(&mut self, nline: LineNumber) {
        self.snoops.push_back(TgtCell {
            op: TgtOp::Inval(nline),
            eop: true,
        });
    }

    /// Queues an unconditional broadcast invalidate for `nline`.
    pub fn push_broadcast(&mut self, nline: LineNumber) {
        self.snoops.push_back(TgtCell {
            op: TgtOp::Broadcast(nline),
            eop: true,
        });
    }

    /// Queues a masked snoop update of `nline` starting at word `first`.
    pub fn push_update(&mut self, nline: LineNumber, first: usize, words: &[(u32, u8)]) {
        self.snoops.push_back(TgtCell {
            op: TgtOp::Update { nline, word: first },
            eop: words.is_empty(),
        });
        for (k, &(word, be)) in words.iter().enumerate() {
            self.snoops.push_back(TgtCell {
                op: TgtOp::Data { word, be },
                eop: k + 1 == words.len(),
            });
        }
    }

    /// Queues a raw response cell (protocol tests; combine with `mute`).
    pub fn push_rsp(&mut self, cell: VciRsp) {
        self.rsp_queue.push_back(Some(cell));
    }

    /// Builds the next tick's inputs from the previous tick's outputs,
    /// advancing the fabric's own state by one tick.
    ///
    /// Delivery ordering matters: queued cells are drained *before* the
    /// presented command is serviced, so a response can never reach the
    /// controller on the same tick it learns its command was accepted.
    pub fn collect(&mut self, out: &TickOutputs) -> TickInputs {
        let mut inputs = TickInputs {
            cmd_ready: self.ready,
            tgt_rsp_ready: true,
            cleanup_ready: true,
            rsp: self.rsp_queue.pop_front().flatten(),
            cleanup_ack: self.ack_queue.pop_front().flatten(),
            ..TickInputs::default()
        };
        if out.tgt_cmd_ready {
            if let Some(cell) = self.snoops.pop_front() {
                inputs.tgt_cmd = Some(cell);
            }
        }
        if let Some(rsp) = out.tgt_rsp {
            self.snoop_acks.push(rsp.side);
        }
        if let Some(cleanup) = out.cleanup {
            self.cleanups.push((cleanup.nline, cleanup.side));
            self.ack_queue.push_back(Some(CleanupAck {
                side: cleanup.side,
                eop: true,
            }));
        }
        if self.ready {
            if let Some(cmd) = out.cmd {
                self.cmd_log.push(cmd.tag);
                if !self.mute {
                    self.respond(cmd);
                }
            }
        }
        inputs
    }

    /// Answers one accepted command, scheduling its response cells.
    fn respond(&mut self, cmd: VciCmd) {
        for _ in 0..self.extra_latency {
            self.rsp_queue.push_back(None);
        }
        match cmd.kind {
            VciCmdKind::Read => {
                for i in 0..cmd.burst {
                    let addr = cmd.paddr.val() + (i as u64) * 4;
                    self.rsp_queue.push_back(Some(VciRsp {
                        data: self.read_word(addr),
                        error: self.fail_words.contains(&addr),
                        eop: i + 1 == cmd.burst,
                        tag: cmd.tag,
                    }));
                }
            }
            VciCmdKind::LockedRead => {
                let addr = cmd.paddr.val();
                self.reservation = Some(addr);
                self.rsp_queue.push_back(Some(VciRsp {
                    data: self.read_word(addr),
                    error: self.fail_words.contains(&addr),
                    eop: true,
                    tag: cmd.tag,
                }));
            }
            VciCmdKind::StoreCond => {
                let addr = cmd.paddr.val();
                let forced = self.force_sc_fail > 0;
                if forced {
                    self.force_sc_fail -= 1;
                }
                let success = !forced && self.reservation == Some(addr);
                if success {
                    self.apply_write(addr, cmd.wdata, cmd.be);
                    self.reservation = None;
                }
                self.rsp_queue.push_back(Some(VciRsp {
                    data: u32::from(!success),
                    error: self.fail_words.contains(&addr),
                    eop: true,
                    tag: cmd.tag,
                }));
            }
            VciCmdKind::Swap => {
                let addr = cmd.paddr.val();
                let old = self.read_word(addr);
                self.apply_write(addr, cmd.wdata, cmd.be);
                // A swap is a write; it breaks a reservation on the word.
                if self.reservation == Some(addr) {
                    self.reservation = None;
                }
                self.rsp_queue.push_back(Some(VciRsp {
                    data: old,
                    error: self.fail_words.contains(&addr),
                    eop: true,
                    tag: cmd.tag,
                }));
            }
            VciCmdKind::Write => {
                let addr = cmd.paddr.val();
                self.apply_write(addr, cmd.wdata, cmd.be);
                self.rsp_queue.push_back(Some(VciRsp {
                    data: 0,
                    error: self.fail_words.contains(&addr),
                    eop: true,
                    tag: cmd.tag,
                }));
            }
        }
    }

    fn apply_write(&mut self, addr: u64, data: u32, be: u8) {
        let mut mask = 0u32;
        for byte in 0..4 {
            if be & (1 << byte) != 0 {
                mask |= 0xFF << (byte * 8);
            }
        }
        let old = self.read_word(addr);
        self.write_word(addr, (old & !mask) | (data & mask));
    }
}

/// One controller with its fabric and the held processor requests.
pub struct TestBench {
    pub ctl: Controller,
    pub fabric: Fabric,
    /// Instruction request, held as a level signal until answered.
    pub ireq: Option<InstRequest>,
    /// Data request, held as a level signal until answered.
    pub dreq: Option<DataRequest>,
    out: TickOutputs,
}

impl Default for TestBench {
    fn default() -> Self {
        Self::new()
    }
}

impl TestBench {
    pub fn new() -> Self {
        Self::with_config(&Config::default())
    }

    pub fn with_config(cfg: &Config) -> Self {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
        Self {
            ctl: Controller::new(cfg).unwrap(),
            fabric: Fabric::new(),
            ireq: None,
            dreq: None,
            out: TickOutputs::default(),
        }
    }

    /// Advances the pair by one tick. A delivered response drops the held
    /// request, as a processor would.
    pub fn step(&mut self) -> Result<TickOutputs, ProtocolError> {
        let mut inputs = self.fabric.collect(&self.out);
        inputs.ireq = self.ireq;
        inputs.dreq = self.dreq;
        let out = self.ctl.tick(&inputs)?;
        if out.irsp.is_some() {
            self.ireq = None;
        }
        if out.drsp.is_some() {
            self.dreq = None;
        }
        self.out = out.clone();
        Ok(out)
    }

    /// Runs `n` ticks, panicking on any protocol error.
    pub fn run(&mut self, n: usize) {
        for _ in 0..n {
            let _ = self.step().unwrap();
        }
    }

    /// Holds a fetch request until the response arrives.
    pub fn fetch_as(&mut self, vaddr: u32, mode: PrivilegeMode) -> InstResponse {
        self.ireq = Some(InstRequest {
            vaddr: VirtAddr::new(vaddr),
            mode,
        });
        for _ in 0..TIMEOUT {
            if let Some(rsp) = self.step().unwrap().irsp {
                return rsp;
            }
        }
        panic!("fetch of {vaddr:#010x} timed out");
    }

    pub fn fetch(&mut self, vaddr: u32) -> InstResponse {
        self.fetch_as(vaddr, PrivilegeMode::Kernel)
    }

    /// Holds a data request until the response arrives.
    pub fn data(&mut self, req: DataRequest) -> DataResponse {
        self.dreq = Some(req);
        for _ in 0..TIMEOUT {
            if let Some(rsp) = self.step().unwrap().drsp {
                return rsp;
            }
        }
        panic!("data op {:?} at {:#010x} timed out", req.op, req.vaddr.val());
    }

    pub fn load_as(&mut self, vaddr: u32, mode: PrivilegeMode) -> DataResponse {
        self.data(DataRequest {
            vaddr: VirtAddr::new(vaddr),
            op: DataOp::Read,
            be: 0xF,
            wdata: 0,
            mode,
        })
    }

    pub fn load(&mut self, vaddr: u32) -> DataResponse {
        self.load_as(vaddr, PrivilegeMode::Kernel)
    }

    pub fn store(&mut self, vaddr: u32, wdata: u32) -> DataResponse {
        self.data(DataRequest {
            vaddr: VirtAddr::new(vaddr),
            op: DataOp::Write,
            be: 0xF,
            wdata,
            mode: PrivilegeMode::Kernel,
        })
    }

    pub fn ll(&mut self, vaddr: u32) -> DataResponse {
        self.data(DataRequest {
            vaddr: VirtAddr::new(vaddr),
            op: DataOp::Ll,
            be: 0xF,
            wdata: 0,
            mode: PrivilegeMode::Kernel,
        })
    }

    pub fn sc(&mut self, vaddr: u32, wdata: u32) -> DataResponse {
        self.data(DataRequest {
            vaddr: VirtAddr::new(vaddr),
            op: DataOp::Sc,
            be: 0xF,
            wdata,
            mode: PrivilegeMode::Kernel,
        })
    }

    pub fn swap(&mut self, vaddr: u32, wdata: u32) -> DataResponse {
        self.data(DataRequest {
            vaddr: VirtAddr::new(vaddr),
            op: DataOp::Swap,
            be: 0xF,
            wdata,
            mode: PrivilegeMode::Kernel,
        })
    }

    /// XTN register read; `index` selects the register (address bits 5..2).
    pub fn xtn_read(&mut self, index: u32) -> DataResponse {
        self.data(DataRequest {
            vaddr: VirtAddr::new(index << 2),
            op: DataOp::XtnRead,
            be: 0xF,
            wdata: 0,
            mode: PrivilegeMode::Kernel,
        })
    }

    /// XTN register/operation write.
    pub fn xtn_write(&mut self, index: u32, wdata: u32) -> DataResponse {
        self.data(DataRequest {
            vaddr: VirtAddr::new(index << 2),
            op: DataOp::XtnWrite,
            be: 0xF,
            wdata,
            mode: PrivilegeMode::Kernel,
        })
    }

    /// Points the walker at `pt_base` and turns on both TLBs and both
    /// caches, the way a kernel would when entering virtual memory.
    pub fn enable_mmu(&mut self, pt_base: u64) {
        let rsp = self.xtn_write(0, (pt_base >> PAGE_SHIFT) as u32);
        assert!(!rsp.error, "ptpr write faulted");
        let rsp = self.xtn_write(1, 0xF);
        assert!(!rsp.error, "mode write faulted");
    }

    /// Line number of physical byte address `paddr` under the default
    /// geometry of this bench's controller.
    pub fn nline(&self, paddr: u64) -> LineNumber {
        PhysAddr::new(paddr).line(self.ctl.line_shift())
    }
}
