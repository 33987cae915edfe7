//! Cache-coherent cache/MMU controller model.
//!
//! This crate implements the cycle-accurate controller that sits between a
//! processor core and a split-transaction system bus, with the following:
//! 1. **Storage:** Associative instruction/data caches, instruction/data TLBs
//!    with backing-line tracking, and a posted write buffer.
//! 2. **Translation:** Two-level hardware page-table walk through the data
//!    cache port, with lazy accessed/dirty-bit maintenance via LL/SC.
//! 3. **Coherence:** Snooped invalidate/update target, eviction cleanup
//!    notifications, and associative TLB scrubbing.
//! 4. **Bus:** Tagged split-transaction command/response engine with fixed
//!    priority arbitration and a one-outstanding-per-side invariant.
//! 5. **Simulation:** Tick-level Moore-style evaluation, configuration, and
//!    statistics collection.

/// Common types (addresses, page-table encodings, faults, protocol errors).
pub mod common;
/// Controller configuration (defaults, geometry, validation).
pub mod config;
/// The controller FSMs and tick loop.
pub mod ctrl;
/// Port-level records exchanged with the processor and the bus.
pub mod iface;
/// Event counters and reporting.
pub mod stats;
/// Associative storage arrays and the write buffer.
pub mod storage;

/// Root configuration type; use `Config::default()` or deserialize from JSON.
pub use crate::config::Config;
/// The controller; drive it with `Controller::tick`.
pub use crate::ctrl::{Controller, MmuMode, TickInputs, TickOutputs};
/// Event counters, reachable through `Controller::stats`.
pub use crate::stats::Stats;
