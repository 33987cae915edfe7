//! Common types shared by every component of the controller model.
//!
//! This module provides the fundamental building blocks used across the
//! cache, TLB, and FSM components. It includes:
//! 1. **Address Types:** Strong types for virtual and physical addresses and line numbers.
//! 2. **Page Table Format:** The two-level page-table entry and descriptor encodings.
//! 3. **Error Handling:** Precise processor-visible faults and fatal protocol violations.

/// Address type definitions (physical and virtual addresses, line numbers).
pub mod addr;

/// Page-table entry and descriptor bit layout.
pub mod pte;

/// Fault causes and protocol error definitions.
pub mod error;

pub use addr::{LineNumber, PhysAddr, VirtAddr};
pub use error::{FaultCause, ProtocolError};
pub use pte::{PageDescriptor, PageTableEntry};
