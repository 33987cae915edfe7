//! # Address Translation Tests
//!
//! Tests for the two-level hardware walk on both sides, the speculative
//! same-page and level-1 shortcuts, and every precise translation fault.
//! The page table lives in ordinary cacheable memory, so these tests also
//! exercise page-table reads through the data cache port.

use crate::common::harness::TestBench;
use ccvcache_core::common::error::FaultCause;
use ccvcache_core::common::pte::{
    PTE_ACCESSED, PTE_CACHEABLE, PTE_DIRTY, PTE_EXECUTABLE, PTE_USER, PTE_VALID, PTE_WRITABLE,
};
use ccvcache_core::iface::proc::PrivilegeMode;
use pretty_assertions::assert_eq;

const PT_BASE: u64 = 0x0004_0000;
const CODE_FLAGS: u32 = PTE_VALID | PTE_CACHEABLE | PTE_EXECUTABLE | PTE_ACCESSED;
const DATA_FLAGS: u32 = PTE_VALID | PTE_CACHEABLE | PTE_WRITABLE | PTE_ACCESSED | PTE_DIRTY;

/// Tests a translated fetch: walk, install, and the TLB hit on reuse.
#[test]
fn fetch_walks_and_caches_translation() {
    let mut bench = TestBench::new();
    let _ = bench.fabric.map_page(PT_BASE, 0x0040_0000, 0x2, CODE_FLAGS);
    bench.fabric.write_word(0x2010, 0xFEED_FACE);
    bench.fabric.write_word(0x2014, 0xCAFE_F00D);
    bench.enable_mmu(PT_BASE);

    let rsp = bench.fetch(0x0040_0010);
    assert!(!rsp.error);
    assert_eq!(rsp.inst, 0xFEED_FACE);
    assert_eq!(bench.ctl.stats().itlb_misses, 1);
    // Both walk levels missed the data cache and went to the bus.
    assert_eq!(bench.ctl.stats().walk_reads, 2);

    // Same page again: the speculative translation answers without a walk,
    // and the second word comes from the already-refilled line.
    assert_eq!(bench.fetch(0x0040_0014).inst, 0xCAFE_F00D);
    assert_eq!(bench.ctl.stats().itlb_misses, 1);
    assert!(bench.ctl.stats().itlb_hits >= 1);
}

/// Tests that a second walk inside the same 4 MiB region reuses the cached
/// level-1 descriptor and the cached page-table line.
#[test]
fn walk_reuses_level1_descriptor() {
    let mut bench = TestBench::new();
    let _ = bench.fabric.map_page(PT_BASE, 0x0040_0000, 0x2, CODE_FLAGS);
    let _ = bench.fabric.map_page(PT_BASE, 0x0040_1000, 0x3, CODE_FLAGS);
    bench.fabric.write_word(0x2000, 1);
    bench.fabric.write_word(0x3000, 2);
    bench.enable_mmu(PT_BASE);

    assert_eq!(bench.fetch(0x0040_0000).inst, 1);
    let walk_reads_after_first = bench.ctl.stats().walk_reads;
    assert_eq!(bench.fetch(0x0040_1000).inst, 2);
    // Adjacent page: level 1 skipped and the entry's line already cached.
    assert_eq!(bench.ctl.stats().walk_reads, walk_reads_after_first);
    assert_eq!(bench.ctl.stats().itlb_misses, 2);
}

/// Tests a translated load and the data-side speculative hit.
#[test]
fn load_walks_and_caches_translation() {
    let mut bench = TestBench::new();
    let _ = bench.fabric.map_page(PT_BASE, 0x1000_0000, 0x5, DATA_FLAGS);
    bench.fabric.write_word(0x5008, 0x0BAD_C0DE);
    bench.enable_mmu(PT_BASE);

    assert_eq!(bench.load(0x1000_0008).rdata, 0x0BAD_C0DE);
    assert_eq!(bench.ctl.stats().dtlb_misses, 1);
    assert_eq!(bench.load(0x1000_0008).rdata, 0x0BAD_C0DE);
    assert_eq!(bench.ctl.stats().dtlb_misses, 1);
    assert!(bench.ctl.stats().dtlb_hits >= 1);
}

/// Tests that an unmapped level-1 descriptor faults with `Pt1Unmapped` and
/// latches the faulting virtual address.
#[test]
fn load_pt1_unmapped_faults() {
    let mut bench = TestBench::new();
    bench.enable_mmu(PT_BASE);
    let rsp = bench.load(0x2000_0004);
    assert!(rsp.error);
    assert_eq!(bench.xtn_read(11).rdata, FaultCause::Pt1Unmapped.code());
    assert_eq!(bench.xtn_read(12).rdata, 0x2000_0004);
    // The cause register clears on read; the address register does not.
    assert_eq!(bench.xtn_read(11).rdata, 0);
    assert_eq!(bench.xtn_read(12).rdata, 0x2000_0004);
}

/// Tests that a valid descriptor with an invalid entry faults with
/// `Pt2Unmapped` on both sides.
#[test]
fn pt2_unmapped_faults_both_sides() {
    let mut bench = TestBench::new();
    // Mapping a neighbor page makes the level-1 descriptor valid while the
    // probed entry itself stays invalid.
    let _ = bench.fabric.map_page(PT_BASE, 0x0040_0000, 0x2, CODE_FLAGS);
    bench.enable_mmu(PT_BASE);

    assert!(bench.load(0x0040_2000).error);
    assert_eq!(bench.xtn_read(11).rdata, FaultCause::Pt2Unmapped.code());
    assert!(bench.fetch(0x0040_3000).error);
    assert_eq!(bench.xtn_read(9).rdata, FaultCause::Pt2Unmapped.code());
    assert_eq!(bench.xtn_read(10).rdata, 0x0040_3000);
}

/// Tests that fetching a non-executable page faults with `ExecViolation`.
#[test]
fn fetch_exec_violation() {
    let mut bench = TestBench::new();
    let _ = bench.fabric.map_page(PT_BASE, 0x0040_0000, 0x2, DATA_FLAGS);
    bench.enable_mmu(PT_BASE);
    assert!(bench.fetch(0x0040_0000).error);
    assert_eq!(bench.xtn_read(9).rdata, FaultCause::ExecViolation.code());
}

/// Tests that user-mode accesses to kernel-only pages fault on both sides.
#[test]
fn user_mode_privilege_violations() {
    let mut bench = TestBench::new();
    let _ = bench.fabric.map_page(PT_BASE, 0x0040_0000, 0x2, CODE_FLAGS);
    let _ = bench.fabric.map_page(PT_BASE, 0x1000_0000, 0x5, DATA_FLAGS);
    bench.enable_mmu(PT_BASE);

    assert!(bench.fetch_as(0x0040_0000, PrivilegeMode::User).error);
    assert_eq!(
        bench.xtn_read(9).rdata,
        FaultCause::PrivilegeViolation.code()
    );
    assert!(bench.load_as(0x1000_0000, PrivilegeMode::User).error);
    assert_eq!(
        bench.xtn_read(11).rdata,
        FaultCause::PrivilegeViolation.code()
    );
}

/// Tests that a user-accessible page serves user-mode accesses normally.
#[test]
fn user_page_allows_user_access() {
    let mut bench = TestBench::new();
    let _ = bench
        .fabric
        .map_page(PT_BASE, 0x1000_0000, 0x5, DATA_FLAGS | PTE_USER);
    bench.fabric.write_word(0x5000, 11);
    bench.enable_mmu(PT_BASE);
    let rsp = bench.load_as(0x1000_0000, PrivilegeMode::User);
    assert!(!rsp.error);
    assert_eq!(rsp.rdata, 11);
}

/// Tests that a store to a read-only page faults with `WriteViolation`.
#[test]
fn store_write_violation() {
    let mut bench = TestBench::new();
    let _ = bench.fabric.map_page(
        PT_BASE,
        0x1000_0000,
        0x5,
        PTE_VALID | PTE_CACHEABLE | PTE_ACCESSED,
    );
    bench.enable_mmu(PT_BASE);
    assert!(bench.store(0x1000_0000, 1).error);
    assert_eq!(bench.xtn_read(11).rdata, FaultCause::WriteViolation.code());
}

/// Tests that bus errors on the two walk levels are distinguished.
#[test]
fn walk_bus_errors_by_level() {
    let mut bench = TestBench::new();
    let _ = bench.fabric.map_page(PT_BASE, 0x1000_0000, 0x5, DATA_FLAGS);
    bench.enable_mmu(PT_BASE);

    // Level 1: poison the descriptor word of an unrelated 4 MiB region.
    let bad_ptd = PT_BASE + u64::from(0x2000_0000u32 >> 22) * 4;
    bench.fabric.fail_at(bad_ptd);
    assert!(bench.load(0x2000_0000).error);
    assert_eq!(bench.xtn_read(11).rdata, FaultCause::Pt1BusError.code());

    // Level 2: poison the entry of a page sharing the mapped region's table.
    let pte = bench.fabric.map_page(PT_BASE, 0x1000_2000, 0x6, DATA_FLAGS);
    bench.fabric.fail_at(pte);
    assert!(bench.load(0x1000_2000).error);
    assert_eq!(bench.xtn_read(11).rdata, FaultCause::Pt2BusError.code());
}

/// Tests that a page mapped uncacheable is read from the bus every time.
#[test]
fn uncacheable_page_bypasses_data_cache() {
    let mut bench = TestBench::new();
    let _ = bench.fabric.map_page(
        PT_BASE,
        0x1000_0000,
        0x5,
        PTE_VALID | PTE_WRITABLE | PTE_ACCESSED | PTE_DIRTY,
    );
    bench.fabric.write_word(0x5000, 21);
    bench.enable_mmu(PT_BASE);

    assert_eq!(bench.load(0x1000_0000).rdata, 21);
    bench.fabric.write_word(0x5000, 22);
    assert_eq!(bench.load(0x1000_0000).rdata, 22);
    assert_eq!(bench.ctl.stats().dcache_unc, 2);
}
