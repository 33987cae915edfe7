//! Associative storage owned by the controller.
//!
//! One instance of each array exists per controller; nothing here is shared
//! between controller instances; multi-core coherence happens purely through
//! bus transactions. This module provides:
//! 1. **Caches:** set-associative line arrays with TLB back-pointer markers.
//! 2. **TLBs:** set-associative translation arrays with backing-line records.
//! 3. **Write buffer:** the FIFO of posted writes with read-hazard detection.
//! 4. **Policies:** pluggable victim selection (round-robin, LRU).

/// Set-associative cache line array.
pub mod cache;

/// Victim selection policies.
pub mod policy;

/// Set-associative translation lookaside buffer.
pub mod tlb;

/// Posted write buffer.
pub mod write_buffer;

pub use cache::{Cache, VictimInfo};
pub use policy::{LruPolicy, ReplacementPolicy, RoundRobinPolicy};
pub use tlb::{Tlb, TlbEntry, TlbFlags};
pub use write_buffer::{WriteBuffer, WriteEntry};
