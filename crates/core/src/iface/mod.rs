//! External interface records.
//!
//! The controller talks to the outside world through four channels, all
//! advanced one cell per tick with valid/ready handshakes:
//! 1. **Processor:** one instruction request and at most one data request per
//!    tick, answered with single-cell responses.
//! 2. **Bus command/response:** tagged split transactions to memory.
//! 3. **Snoop target:** coherence invalidate/update commands from the fabric.
//! 4. **Cleanup initiator:** eviction notifications to the fabric.

/// Processor-facing request/response records.
pub mod proc;

/// Bus-facing command, response, snoop, and cleanup records.
pub mod bus;

pub use bus::{CleanupAck, CleanupCmd, TgtCell, TgtOp, TgtRsp, TxTag, VciCmd, VciCmdKind, VciRsp};
pub use proc::{DataOp, DataRequest, DataResponse, InstRequest, InstResponse, PrivilegeMode};
