//! Fault and protocol error definitions.
//!
//! The controller distinguishes three failure classes:
//! 1. **Precise faults** (`FaultCause`): surfaced to the processor with an
//!    error flag on the next response, latched in the per-side fault
//!    registers readable via XTN. The controller returns to idle and accepts
//!    the next request normally.
//! 2. **Transient retries:** handled internally (failed store-conditional
//!    during access/dirty maintenance, snoop racing an in-flight miss).
//!    These never appear in this module; they leave no trace beyond stats.
//! 3. **Protocol violations** (`ProtocolError`): a malformed coherence packet
//!    or an impossible bus response. These indicate a broken fabric and are
//!    fatal: `Controller::tick` returns `Err` and the simulation must stop.

use thiserror::Error;

use super::addr::LineNumber;
use crate::iface::bus::TxTag;

/// Precise fault causes surfaced to the processor.
///
/// The numeric codes are what an XTN read of the fault-cause register
/// returns; software fault handlers dispatch on them.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u32)]
pub enum FaultCause {
    /// Level-1 page-table descriptor was unmapped.
    Pt1Unmapped = 0x1,
    /// Level-2 page-table entry was unmapped.
    Pt2Unmapped = 0x2,
    /// User-mode access to a kernel-only page or XTN operation.
    PrivilegeViolation = 0x4,
    /// Store to a non-writable page.
    WriteViolation = 0x8,
    /// Fetch from a non-executable page.
    ExecViolation = 0x10,
    /// Undefined XTN operation index.
    UndefinedXtn = 0x20,
    /// Bus error while reading the level-1 descriptor.
    Pt1BusError = 0x40,
    /// Bus error while reading the level-2 entry.
    Pt2BusError = 0x80,
    /// Bus error on the access itself (miss refill or uncached access).
    BusError = 0x100,
    /// Address not aligned for the requested access.
    Misaligned = 0x200,
}

impl FaultCause {
    /// Returns the numeric code latched in the fault-cause register.
    pub fn code(self) -> u32 {
        self as u32
    }
}

impl std::fmt::Display for FaultCause {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Pt1Unmapped => "PT1_UNMAPPED",
            Self::Pt2Unmapped => "PT2_UNMAPPED",
            Self::PrivilegeViolation => "PRIVILEGE_VIOLATION",
            Self::WriteViolation => "WRITE_VIOLATION",
            Self::ExecViolation => "EXEC_VIOLATION",
            Self::UndefinedXtn => "UNDEFINED_XTN",
            Self::Pt1BusError => "PT1_BUS_ERROR",
            Self::Pt2BusError => "PT2_BUS_ERROR",
            Self::BusError => "BUS_ERROR",
            Self::Misaligned => "MISALIGNED",
        };
        write!(f, "{name}")
    }
}

/// Fatal bus/fabric contract violations.
///
/// The coherence protocol's correctness is a hardware-level contract the
/// controller assumes; it cannot defend against a broken fabric at runtime.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum ProtocolError {
    /// A response arrived whose tag names no outstanding transaction.
    #[error("response with tag {0:?} does not match any outstanding transaction")]
    UnexpectedResponse(TxTag),

    /// A burst response carried more words than a cache line holds.
    #[error("burst response for tag {tag:?} overran the {words}-word refill buffer")]
    BurstOverrun {
        /// Tag of the offending transaction.
        tag: TxTag,
        /// Configured words per line.
        words: usize,
    },

    /// A burst response ended before delivering a full line.
    #[error("burst response for tag {tag:?} ended after {got} of {words} words")]
    BurstUnderrun {
        /// Tag of the offending transaction.
        tag: TxTag,
        /// Words received before the early end-of-packet.
        got: usize,
        /// Configured words per line.
        words: usize,
    },

    /// A snoop data cell arrived outside an update capture.
    #[error("snoop data cell received while no update payload is open")]
    StraySnoopData,

    /// A snoop update payload overran the line it targets.
    #[error("snoop update payload for line {nline:#x} overran the line")]
    SnoopPayloadOverrun {
        /// Target line of the update.
        nline: LineNumber,
    },

    /// A snoop header arrived while a previous payload was still open.
    #[error("snoop header received while an update payload is still open")]
    SnoopHeaderInPayload,

    /// A cleanup acknowledgement arrived with no cleanup outstanding.
    #[error("cleanup acknowledgement received with no cleanup in flight")]
    StrayCleanupAck,
}
