//! Processor-facing request and response records.
//!
//! The processor presents requests as level signals: a request stays asserted,
//! unchanged, every tick until the controller delivers the matching response.
//! Responses are valid for exactly one tick.

use crate::common::addr::VirtAddr;

/// Processor privilege level carried with each request.
///
/// Privileged XTN operations and kernel-only pages check this.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum PrivilegeMode {
    /// User mode: subject to the user-accessible page flag.
    User,
    /// Kernel (or hypervisor) mode: may issue privileged XTN operations.
    #[default]
    Kernel,
}

/// Data-side operation kinds.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DataOp {
    /// Ordinary load.
    Read,
    /// Ordinary store.
    Write,
    /// Load-linked: uncached locked read establishing a reservation.
    Ll,
    /// Store-conditional: succeeds only if the reservation still holds.
    /// The response data is 0 on success and non-zero on failure.
    Sc,
    /// Atomic swap: uncached write returning the previous memory word.
    Swap,
    /// Read of a software-visible controller register (XTN pseudo-op).
    XtnRead,
    /// Write of a software-visible controller register (XTN pseudo-op).
    XtnWrite,
}

/// Instruction fetch request.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct InstRequest {
    /// Virtual address of the instruction word.
    pub vaddr: VirtAddr,
    /// Privilege of the fetching context.
    pub mode: PrivilegeMode,
}

/// Instruction fetch response.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct InstResponse {
    /// Fetched instruction word (zero when `error` is set).
    pub inst: u32,
    /// Set when the fetch faulted; the cause is latched in the instruction
    /// fault registers, readable via XTN.
    pub error: bool,
}

/// Data access request.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct DataRequest {
    /// Virtual address of the access (for XTN ops, bits 5..2 select the
    /// target controller register).
    pub vaddr: VirtAddr,
    /// Operation kind.
    pub op: DataOp,
    /// Byte enables within the addressed word.
    pub be: u8,
    /// Write data (stores, SC, and XTN writes).
    pub wdata: u32,
    /// Privilege of the issuing context.
    pub mode: PrivilegeMode,
}

/// Data access response.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct DataResponse {
    /// Read data; for SC, 0 means the store-conditional succeeded.
    pub rdata: u32,
    /// Set when the access faulted; the cause is latched in the data fault
    /// registers, readable via XTN.
    pub error: bool,
}

impl InstResponse {
    /// Builds a successful fetch response.
    pub fn ok(inst: u32) -> Self {
        Self { inst, error: false }
    }

    /// Builds a faulting fetch response.
    pub fn fault() -> Self {
        Self {
            inst: 0,
            error: true,
        }
    }
}

impl DataResponse {
    /// Builds a successful data response.
    pub fn ok(rdata: u32) -> Self {
        Self {
            rdata,
            error: false,
        }
    }

    /// Builds a faulting data response.
    pub fn fault() -> Self {
        Self {
            rdata: 0,
            error: true,
        }
    }
}
