//! Coherence snoop target FSM.
//!
//! The fabric's directory sends line invalidates, unconditional broadcast
//! invalidates, and masked line updates. The FSM decodes the header cell,
//! captures any update payload, hands the request to the cache FSMs through
//! the coherence request registers, and acknowledges once they have serviced
//! it. Line commands receive one response; broadcasts receive two, one per
//! unit, instruction side first.
//!
//! A snoop is routed to a side when the side's directory holds the line *or*
//! the side has a refill of that line in flight: a miss read that raced the
//! invalidate returns data that is already stale, so the in-flight match
//! arms the cancel flag checked by the cache FSMs.

use tracing::trace;

use crate::common::addr::LineNumber;
use crate::common::error::ProtocolError;
use crate::iface::bus::{Side, TgtOp, TgtRsp};

use super::{CcOp, CcReq, Controller, TickInputs};

/// Snoop target states.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
enum TgtState {
    /// Waiting for a header cell.
    #[default]
    Idle,
    /// Capturing update payload cells.
    UpdtData,
    /// Request handed to the cache FSMs; waiting for them to clear it.
    Req,
    /// Sending the acknowledgement cell(s).
    Rsp,
}

/// Snoop command kinds after header decode.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
enum CcKind {
    #[default]
    Inval,
    Update,
}

/// Snoop target FSM registers.
pub(crate) struct TgtRegs {
    state: TgtState,
    kind: CcKind,
    nline: LineNumber,
    broadcast: bool,
    upd_first: usize,
    /// Captured update payload: masked words starting at `upd_first`.
    /// Cache FSMs read this while servicing an update request.
    pub upd_words: Vec<(u32, u8)>,
    rsp_left: u8,
    rsp_side: Side,
    words: usize,
}

impl TgtRegs {
    pub fn new(words: usize) -> Self {
        Self {
            state: TgtState::default(),
            kind: CcKind::default(),
            nline: 0,
            broadcast: false,
            upd_first: 0,
            upd_words: Vec::with_capacity(words),
            rsp_left: 0,
            rsp_side: Side::Inst,
            words,
        }
    }

    /// First payload word index of the captured update.
    pub fn upd_first(&self) -> usize {
        self.upd_first
    }

    /// True when a command cell can be accepted next tick.
    pub fn ready(&self) -> bool {
        matches!(self.state, TgtState::Idle | TgtState::UpdtData)
    }

    /// The acknowledgement cell currently presented, if any.
    pub fn rsp_cell(&self) -> Option<TgtRsp> {
        if self.state != TgtState::Rsp {
            return None;
        }
        let side = if self.broadcast {
            if self.rsp_left == 2 { Side::Inst } else { Side::Data }
        } else {
            self.rsp_side
        };
        Some(TgtRsp { side, eop: true })
    }
}

impl Controller {
    /// Snoop target transition.
    pub(crate) fn target_tick(&mut self, inputs: &TickInputs) -> Result<(), ProtocolError> {
        match self.tgt.state {
            TgtState::Idle => {
                let Some(cell) = inputs.tgt_cmd else {
                    return Ok(());
                };
                match cell.op {
                    TgtOp::Inval(nline) => {
                        self.tgt.nline = nline;
                        self.tgt.broadcast = false;
                        self.tgt.kind = CcKind::Inval;
                        self.tgt_route();
                    }
                    TgtOp::Broadcast(nline) => {
                        self.tgt.nline = nline;
                        self.tgt.broadcast = true;
                        self.tgt.kind = CcKind::Inval;
                        self.tgt_route();
                    }
                    TgtOp::Update { nline, word } => {
                        self.tgt.nline = nline;
                        self.tgt.broadcast = false;
                        self.tgt.kind = CcKind::Update;
                        self.tgt.upd_first = word;
                        self.tgt.upd_words.clear();
                        if cell.eop {
                            self.tgt_route();
                        } else {
                            self.tgt.state = TgtState::UpdtData;
                        }
                    }
                    TgtOp::Data { .. } => return Err(ProtocolError::StraySnoopData),
                }
            }
            TgtState::UpdtData => {
                let Some(cell) = inputs.tgt_cmd else {
                    return Ok(());
                };
                match cell.op {
                    TgtOp::Data { word, be } => {
                        if self.tgt.upd_first + self.tgt.upd_words.len() >= self.tgt.words {
                            return Err(ProtocolError::SnoopPayloadOverrun {
                                nline: self.tgt.nline,
                            });
                        }
                        self.tgt.upd_words.push((word, be));
                        if cell.eop {
                            self.tgt_route();
                        }
                    }
                    _ => return Err(ProtocolError::SnoopHeaderInPayload),
                }
            }
            TgtState::Req => {
                if self.cc_ireq.is_none() && self.cc_dreq.is_none() {
                    self.tgt.state = TgtState::Rsp;
                }
            }
            TgtState::Rsp => {
                if inputs.tgt_rsp_ready {
                    self.tgt.rsp_left -= 1;
                    if self.tgt.rsp_left == 0 {
                        self.tgt.state = TgtState::Idle;
                    }
                }
            }
        }
        Ok(())
    }

    /// Routes a decoded snoop command to the units that hold the line (or
    /// are fetching it) and arms the acknowledgement counter.
    fn tgt_route(&mut self) {
        let nline = self.tgt.nline;
        let inflight_i = self.ifsm.refill_nline == Some(nline);
        let inflight_d = self.dfsm.refill_nline == Some(nline);
        let hit_i = self.tgt.broadcast || self.icache.contains(nline) || inflight_i;
        let hit_d = self.tgt.broadcast || self.dcache.contains(nline) || inflight_d;
        let op = match self.tgt.kind {
            CcKind::Inval => {
                self.stats.snoop_invals += 1;
                CcOp::Inval
            }
            CcKind::Update => {
                self.stats.snoop_updates += 1;
                CcOp::Update {
                    first: self.tgt.upd_first,
                }
            }
        };
        trace!(nline, hit_i, hit_d, ?op, "snoop routed");
        if hit_i {
            self.cc_ireq = Some(CcReq { nline, op });
        }
        if hit_d {
            self.cc_dreq = Some(CcReq { nline, op });
        }
        self.tgt.rsp_left = if self.tgt.broadcast { 2 } else { 1 };
        self.tgt.rsp_side = if hit_d { Side::Data } else { Side::Inst };
        self.tgt.state = if hit_i || hit_d {
            TgtState::Req
        } else {
            TgtState::Rsp
        };
    }
}
