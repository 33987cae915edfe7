//! Bus command and response engine.
//!
//! The CMD engine serializes transaction requests posted by the cache FSMs
//! onto the single command port, one cell per tick, under a fixed priority
//! order defined over the transaction tags. The RSP engine demultiplexes
//! response cells purely on the echoed tag and reassembles line bursts one
//! word per tick into per-side refill buffers.
//!
//! At most one read-type transaction is outstanding per side; posted writes
//! carry their write-buffer slot index in the tag and ride alongside.

use tracing::trace;

use super::{Controller, TickInputs};
use crate::common::addr::PhysAddr;
use crate::common::error::{FaultCause, ProtocolError};
use crate::iface::bus::{Side, TxTag, VciCmd, VciCmdKind, VciRsp};

/// A transaction posted by a cache FSM, waiting for the command port.
#[derive(Clone, Copy, Debug)]
pub(crate) struct TxReq {
    pub tag: TxTag,
    pub paddr: PhysAddr,
    pub kind: VciCmdKind,
    pub wdata: u32,
    pub be: u8,
    pub burst: usize,
}

impl TxReq {
    /// Plain read of `burst` words.
    pub fn read(tag: TxTag, paddr: PhysAddr, burst: usize) -> Self {
        Self {
            tag,
            paddr,
            kind: VciCmdKind::Read,
            wdata: 0,
            be: 0xF,
            burst,
        }
    }

    /// Locked read of one word (LL).
    pub fn locked(tag: TxTag, paddr: PhysAddr) -> Self {
        Self {
            tag,
            paddr,
            kind: VciCmdKind::LockedRead,
            wdata: 0,
            be: 0xF,
            burst: 1,
        }
    }

    /// Store-conditional of one word (SC).
    pub fn store_cond(tag: TxTag, paddr: PhysAddr, wdata: u32) -> Self {
        Self {
            tag,
            paddr,
            kind: VciCmdKind::StoreCond,
            wdata,
            be: 0xF,
            burst: 1,
        }
    }

    /// Atomic swap of one word.
    pub fn swap(tag: TxTag, paddr: PhysAddr, wdata: u32) -> Self {
        Self {
            tag,
            paddr,
            kind: VciCmdKind::Swap,
            wdata,
            be: 0xF,
            burst: 1,
        }
    }
}

/// Completion record handed back to the posting FSM.
#[derive(Clone, Copy, Debug)]
pub(crate) struct RspDone {
    /// Any cell of the transaction carried the error flag.
    pub error: bool,
    /// Response data (single-cell transactions; SC status; first burst word).
    pub data: u32,
}

/// Where the cell currently on the command port came from.
#[derive(Clone, Copy, Debug)]
enum CmdSrc {
    Inst,
    Data,
    Write(usize),
}

/// One side's outstanding-transaction lane: the posted request, the
/// outstanding tag, the refill reassembly buffer, and the completion flag.
pub(crate) struct Lane {
    pub req: Option<TxReq>,
    pub out: Option<TxTag>,
    pub done: Option<RspDone>,
    refill: Vec<u32>,
    count: usize,
    err: bool,
}

impl Lane {
    fn new(words: usize) -> Self {
        Self {
            req: None,
            out: None,
            done: None,
            refill: vec![0; words],
            count: 0,
            err: false,
        }
    }

    fn idle(&self) -> bool {
        self.req.is_none() && self.out.is_none() && self.done.is_none()
    }

    /// Reassembled refill data; meaningful once `done` is set for a burst tag.
    pub fn refill(&self) -> &[u32] {
        &self.refill
    }

    fn collect(&mut self, cell: VciRsp, words: usize) -> Result<(), ProtocolError> {
        let burst = matches!(
            cell.tag,
            TxTag::InsMiss | TxTag::DataMiss | TxTag::ItlbRead | TxTag::DtlbRead
        );
        if burst {
            if self.count >= words {
                return Err(ProtocolError::BurstOverrun {
                    tag: cell.tag,
                    words,
                });
            }
            self.refill[self.count] = cell.data;
            self.count += 1;
            self.err |= cell.error;
            if cell.eop {
                if self.count != words {
                    return Err(ProtocolError::BurstUnderrun {
                        tag: cell.tag,
                        got: self.count,
                        words,
                    });
                }
                self.done = Some(RspDone {
                    error: self.err,
                    data: self.refill[0],
                });
                self.out = None;
            }
        } else {
            self.done = Some(RspDone {
                error: cell.error,
                data: cell.data,
            });
            self.out = None;
        }
        Ok(())
    }
}

/// The command/response engine's registers.
pub(crate) struct VciEngine {
    /// Instruction-side lane (also used by fetches of TLB maintenance run on
    /// behalf of the instruction side).
    pub i: Lane,
    /// Data-side lane (loads, stores' atomics, and all page-table reads).
    pub d: Lane,
    cmd: Option<VciCmd>,
    src: Option<CmdSrc>,
    words: usize,
}

impl VciEngine {
    pub fn new(words: usize) -> Self {
        Self {
            i: Lane::new(words),
            d: Lane::new(words),
            cmd: None,
            src: None,
            words,
        }
    }

    /// True when the instruction lane can take a new transaction.
    pub fn i_idle(&self) -> bool {
        self.i.idle() && !matches!(self.src, Some(CmdSrc::Inst))
    }

    /// True when the data lane can take a new transaction.
    pub fn d_idle(&self) -> bool {
        self.d.idle() && !matches!(self.src, Some(CmdSrc::Data))
    }

    /// Posts an instruction-side transaction. The lane must be idle.
    pub fn post_i(&mut self, req: TxReq) {
        debug_assert!(self.i_idle());
        self.i.req = Some(req);
    }

    /// Posts a data-side transaction. The lane must be idle.
    pub fn post_d(&mut self, req: TxReq) {
        debug_assert!(self.d_idle());
        self.d.req = Some(req);
    }

    /// The cell currently presented on the command port, if any.
    pub fn cmd_cell(&self) -> Option<VciCmd> {
        self.cmd
    }
}

/// Fixed priority over transaction tags; lower wins.
///
/// A store-conditional always outranks everything so the LL/SC pair is never
/// separated by another command from this initiator. Instruction-side
/// traffic outranks data-side traffic, and posted writes drain last, only
/// when no read-type request is pending.
fn prio(tag: TxTag) -> u8 {
    match tag {
        TxTag::PteSc(..) => 0,
        TxTag::PteLl(Side::Inst, _) => 1,
        TxTag::ItlbRead => 2,
        TxTag::InsMiss => 3,
        TxTag::InsUnc => 4,
        TxTag::PteLl(Side::Data, _) => 5,
        TxTag::DtlbRead => 6,
        TxTag::DataMiss => 7,
        TxTag::DataUnc | TxTag::DataLl | TxTag::DataSc | TxTag::DataSwap => 8,
        TxTag::Write(_) => 9,
    }
}

impl Controller {
    /// CMD engine transition: retire the accepted cell, then pick the next
    /// pending request by tag priority.
    pub(crate) fn cmd_tick(&mut self, inputs: &TickInputs) {
        if self.vci.cmd.is_some() {
            if !inputs.cmd_ready {
                return;
            }
            if let Some(cmd) = self.vci.cmd.take() {
                trace!(tag = ?cmd.tag, paddr = %cmd.paddr, "command sent");
                match self.vci.src.take() {
                    Some(CmdSrc::Inst) => {
                        self.vci.i.out = Some(cmd.tag);
                        self.vci.i.count = 0;
                        self.vci.i.err = false;
                    }
                    Some(CmdSrc::Data) => {
                        self.vci.d.out = Some(cmd.tag);
                        self.vci.d.count = 0;
                        self.vci.d.err = false;
                    }
                    Some(CmdSrc::Write(idx)) => self.wbuf.mark_issued(idx),
                    None => {}
                }
            }
        }

        let mut best: Option<(u8, CmdSrc)> = None;
        if let Some(req) = self.vci.i.req {
            best = Some((prio(req.tag), CmdSrc::Inst));
        }
        if let Some(req) = self.vci.d.req {
            let p = prio(req.tag);
            if best.is_none_or(|(b, _)| p < b) {
                best = Some((p, CmdSrc::Data));
            }
        }
        if best.is_none() {
            if let Some((idx, _)) = self.wbuf.next_to_issue() {
                best = Some((prio(TxTag::Write(idx)), CmdSrc::Write(idx)));
            }
        }
        let Some((_, src)) = best else { return };

        let req = match src {
            CmdSrc::Inst => self.vci.i.req.take(),
            CmdSrc::Data => self.vci.d.req.take(),
            CmdSrc::Write(idx) => self.wbuf.next_to_issue().map(|(_, entry)| TxReq {
                tag: TxTag::Write(idx),
                paddr: entry.paddr,
                kind: VciCmdKind::Write,
                wdata: entry.data,
                be: entry.be,
                burst: 1,
            }),
        };
        let Some(req) = req else { return };
        self.vci.cmd = Some(VciCmd {
            paddr: req.paddr,
            kind: req.kind,
            be: req.be,
            wdata: req.wdata,
            burst: req.burst,
            tag: req.tag,
            eop: true,
        });
        self.vci.src = Some(src);
    }

    /// RSP engine transition: route the incoming cell by its echoed tag.
    pub(crate) fn rsp_tick(&mut self, inputs: &TickInputs) -> Result<(), ProtocolError> {
        let Some(cell) = inputs.rsp else {
            return Ok(());
        };
        if let TxTag::Write(idx) = cell.tag {
            if !self.wbuf.pop(idx) {
                return Err(ProtocolError::UnexpectedResponse(cell.tag));
            }
            if cell.error && self.derr_cause.is_none() {
                // The write was posted and acknowledged to the processor long
                // ago; the error is only visible through the fault registers.
                self.derr_cause = Some(FaultCause::BusError);
                self.derr_addr = 0;
            }
            return Ok(());
        }
        if self.vci.i.out == Some(cell.tag) {
            let words = self.vci.words;
            return self.vci.i.collect(cell, words);
        }
        if self.vci.d.out == Some(cell.tag) {
            let words = self.vci.words;
            return self.vci.d.collect(cell, words);
        }
        Err(ProtocolError::UnexpectedResponse(cell.tag))
    }
}
