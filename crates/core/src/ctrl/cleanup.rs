//! Cleanup engine and TLB backing-line scanners.
//!
//! Whenever a valid line leaves a cache for any reason other than a snoop
//! command (capacity eviction, flush, explicit invalidate, canceled refill),
//! the coherence fabric must be told the copy is gone, or its directory
//! would keep snooping this controller forever. The cleanup engine owns that
//! notification channel: one request slot per side, instruction side first,
//! one transaction in flight at a time, each waiting for an acknowledgement.
//!
//! The scanners handle the inverse bookkeeping for the TLBs: cache lines do
//! not know which TLB entries they back, so when a marked data-cache line is
//! dropped the whole TLB is probed associatively, one slot per tick, and
//! every entry filled from that line is invalidated.

use crate::common::addr::LineNumber;
use crate::common::error::ProtocolError;
use crate::iface::bus::{CleanupCmd, Side};
use crate::stats::Stats;
use crate::storage::Tlb;

use super::{Controller, TickInputs};

/// Cleanup engine states.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
enum CleanState {
    /// No cleanup in flight; request slots are polled.
    #[default]
    Idle,
    /// Command presented, waiting for the fabric to accept it.
    Cmd,
    /// Command accepted, waiting for the acknowledgement.
    Ack,
}

/// The cleanup engine: two request slots and one in-flight transaction.
#[derive(Debug, Default)]
pub(crate) struct CleanupEngine {
    /// Instruction-side request slot (served first).
    pub i_req: Option<LineNumber>,
    /// Data-side request slot.
    pub d_req: Option<LineNumber>,
    state: CleanState,
    nline: LineNumber,
    side: Side,
}

impl CleanupEngine {
    /// The command cell currently presented, if any.
    pub fn cmd_cell(&self) -> Option<CleanupCmd> {
        (self.state == CleanState::Cmd).then_some(CleanupCmd {
            nline: self.nline,
            side: self.side,
            eop: true,
        })
    }

    fn step(&mut self, inputs: &TickInputs, stats: &mut Stats) -> Result<(), ProtocolError> {
        if inputs.cleanup_ack.is_some() && self.state != CleanState::Ack {
            return Err(ProtocolError::StrayCleanupAck);
        }
        match self.state {
            CleanState::Idle => {
                if let Some(nline) = self.i_req.take() {
                    self.nline = nline;
                    self.side = Side::Inst;
                    self.state = CleanState::Cmd;
                    stats.cleanups_inst += 1;
                } else if let Some(nline) = self.d_req.take() {
                    self.nline = nline;
                    self.side = Side::Data;
                    self.state = CleanState::Cmd;
                    stats.cleanups_data += 1;
                }
            }
            CleanState::Cmd => {
                if inputs.cleanup_ready {
                    self.state = CleanState::Ack;
                }
            }
            CleanState::Ack => {
                if inputs.cleanup_ack.is_some() {
                    self.state = CleanState::Idle;
                }
            }
        }
        Ok(())
    }
}

/// Why a scan is running; coherence scans additionally park the owning FSM
/// until they finish.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum ScanReason {
    /// Backing line evicted to make room for a refill.
    Evict,
    /// Backing line removed by a snoop command.
    Coherence,
}

/// Associative scan over one TLB for entries backed by a dropped line.
#[derive(Debug, Default)]
pub(crate) struct TlbScanner {
    active: Option<(LineNumber, usize, ScanReason)>,
}

impl TlbScanner {
    /// True while a scan is in progress.
    pub fn busy(&self) -> bool {
        self.active.is_some()
    }

    /// True while a coherence-triggered scan is in progress.
    pub fn busy_coherence(&self) -> bool {
        matches!(self.active, Some((_, _, ScanReason::Coherence)))
    }

    /// Starts a scan for entries backed by `nline`. Only legal when idle.
    pub fn start(&mut self, nline: LineNumber, reason: ScanReason) {
        debug_assert!(self.active.is_none());
        self.active = Some((nline, 0, reason));
    }

    /// Probes one slot; returns the number of entries scrubbed this tick.
    pub fn step(&mut self, tlb: &mut Tlb) -> u64 {
        let Some((nline, index, reason)) = self.active else {
            return 0;
        };
        let scrubbed = u64::from(tlb.probe(index / tlb.ways(), index % tlb.ways(), nline));
        if index + 1 == tlb.slots() {
            self.active = None;
        } else {
            self.active = Some((nline, index + 1, reason));
        }
        scrubbed
    }
}

impl Controller {
    /// Cleanup engine transition.
    pub(crate) fn cleanup_tick(&mut self, inputs: &TickInputs) -> Result<(), ProtocolError> {
        self.clean.step(inputs, &mut self.stats)
    }
}
