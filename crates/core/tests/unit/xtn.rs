//! # XTN Operation Tests
//!
//! Tests for the pseudo memory-mapped controller surface: the mode and
//! page-table base registers, the sync barrier, cache and TLB flushes and
//! single-entry invalidates, and the privilege rules.

use crate::common::harness::TestBench;
use ccvcache_core::common::addr::VirtAddr;
use ccvcache_core::common::error::FaultCause;
use ccvcache_core::common::pte::{
    PTE_ACCESSED, PTE_CACHEABLE, PTE_DIRTY, PTE_EXECUTABLE, PTE_GLOBAL, PTE_VALID, PTE_WRITABLE,
};
use ccvcache_core::iface::bus::Side;
use ccvcache_core::iface::proc::{DataOp, DataRequest, PrivilegeMode};
use pretty_assertions::assert_eq;

const PT_BASE: u64 = 0x0004_0000;
const CODE_FLAGS: u32 = PTE_VALID | PTE_CACHEABLE | PTE_EXECUTABLE | PTE_ACCESSED;
const DATA_FLAGS: u32 = PTE_VALID | PTE_CACHEABLE | PTE_WRITABLE | PTE_ACCESSED | PTE_DIRTY;

/// Tests the mode register: reset value, write, and read-back.
#[test]
fn mode_register_round_trip() {
    let mut bench = TestBench::new();
    // Reset: caches on, TLBs off.
    assert_eq!(bench.xtn_read(1).rdata, 0b1100);

    assert!(!bench.xtn_write(1, 0b0011).error);
    let mode = bench.ctl.mode();
    assert!(mode.itlb_on && mode.dtlb_on);
    assert!(!mode.icache_on && !mode.dcache_on);
    assert_eq!(bench.xtn_read(1).rdata, 0b0011);
}

/// Tests the page-table base register: written as a page number, read back
/// as one.
#[test]
fn ptpr_register_round_trip() {
    let mut bench = TestBench::new();
    assert!(!bench.xtn_write(0, 0x123).error);
    assert_eq!(bench.ctl.ptpr().val(), 0x123 << 12);
    assert_eq!(bench.xtn_read(0).rdata, 0x123);
}

/// Tests that writing the page-table base drops non-global TLB entries on
/// both sides, as a context switch must.
#[test]
fn ptpr_write_flushes_both_tlbs() {
    let mut bench = TestBench::new();
    let _ = bench.fabric.map_page(PT_BASE, 0x0040_0000, 0x2, CODE_FLAGS);
    let _ = bench.fabric.map_page(PT_BASE, 0x1000_0000, 0x5, DATA_FLAGS);
    bench.enable_mmu(PT_BASE);
    let _ = bench.fetch(0x0040_0000);
    let _ = bench.load(0x1000_0000);
    assert_eq!(bench.ctl.stats().itlb_misses, 1);
    assert_eq!(bench.ctl.stats().dtlb_misses, 1);

    assert!(!bench.xtn_write(0, (PT_BASE >> 12) as u32).error);
    let _ = bench.fetch(0x0040_0000);
    let _ = bench.load(0x1000_0000);
    assert_eq!(bench.ctl.stats().itlb_misses, 2);
    assert_eq!(bench.ctl.stats().dtlb_misses, 2);
}

/// Tests that global entries survive a context switch.
#[test]
fn ptpr_write_keeps_global_entries() {
    let mut bench = TestBench::new();
    let _ = bench
        .fabric
        .map_page(PT_BASE, 0x1000_0000, 0x5, DATA_FLAGS | PTE_GLOBAL);
    bench.enable_mmu(PT_BASE);
    let _ = bench.load(0x1000_0000);
    assert_eq!(bench.ctl.stats().dtlb_misses, 1);

    assert!(!bench.xtn_write(0, (PT_BASE >> 12) as u32).error);
    let _ = bench.load(0x1000_0000);
    assert_eq!(bench.ctl.stats().dtlb_misses, 1);
}

/// Tests that the sync barrier holds its response until the write buffer
/// has drained to the bus.
#[test]
fn sync_waits_for_write_buffer() {
    let mut bench = TestBench::new();
    bench.fabric.ready = false;
    assert!(!bench.store(0x1000, 9).error);

    bench.dreq = Some(DataRequest {
        vaddr: VirtAddr::new(8 << 2),
        op: DataOp::XtnWrite,
        be: 0xF,
        wdata: 0,
        mode: PrivilegeMode::Kernel,
    });
    for _ in 0..10 {
        let out = bench.step().unwrap();
        assert!(out.drsp.is_none(), "sync completed with the write pending");
    }

    bench.fabric.ready = true;
    for _ in 0..50 {
        if bench.step().unwrap().drsp.is_some() {
            break;
        }
    }
    assert!(bench.dreq.is_none(), "sync never completed");
    assert_eq!(bench.fabric.read_word(0x1000), 9);
}

/// Tests that unmatched XTN indices fault with `UndefinedXtn`.
#[test]
fn undefined_xtn_faults() {
    let mut bench = TestBench::new();
    assert!(bench.xtn_write(15, 0).error);
    assert_eq!(bench.xtn_read(11).rdata, FaultCause::UndefinedXtn.code());
    // Index 2 is write-only.
    assert!(bench.xtn_read(2).error);
    assert_eq!(bench.xtn_read(11).rdata, FaultCause::UndefinedXtn.code());
}

/// Tests that user mode may only use the sync barrier.
#[test]
fn user_mode_xtn_restrictions() {
    let mut bench = TestBench::new();
    let rsp = bench.data(DataRequest {
        vaddr: VirtAddr::new(1 << 2),
        op: DataOp::XtnWrite,
        be: 0xF,
        wdata: 0,
        mode: PrivilegeMode::User,
    });
    assert!(rsp.error);
    assert_eq!(
        bench.xtn_read(11).rdata,
        FaultCause::PrivilegeViolation.code()
    );

    let rsp = bench.data(DataRequest {
        vaddr: VirtAddr::new(8 << 2),
        op: DataOp::XtnWrite,
        be: 0xF,
        wdata: 0,
        mode: PrivilegeMode::User,
    });
    assert!(!rsp.error);
}

/// Tests that an instruction cache flush returns every line with a cleanup
/// and discards the copies.
#[test]
fn icache_flush_discards_lines() {
    let mut bench = TestBench::new();
    bench.fabric.write_word(0x1000, 4);
    assert_eq!(bench.fetch(0x1000).inst, 4);

    assert!(!bench.xtn_write(2, 0).error);
    bench.run(8);
    assert!(bench
        .fabric
        .cleanups
        .contains(&(bench.nline(0x1000), Side::Inst)));

    assert_eq!(bench.fetch(0x1000).inst, 4);
    assert_eq!(bench.ctl.stats().icache_misses, 2);
}

/// Tests that a data cache flush returns every line with a cleanup and
/// discards the copies.
#[test]
fn dcache_flush_discards_lines() {
    let mut bench = TestBench::new();
    bench.fabric.write_word(0x2000, 5);
    assert_eq!(bench.load(0x2000).rdata, 5);

    assert!(!bench.xtn_write(3, 0).error);
    bench.run(8);
    assert!(bench
        .fabric
        .cleanups
        .contains(&(bench.nline(0x2000), Side::Data)));

    assert_eq!(bench.load(0x2000).rdata, 5);
    assert_eq!(bench.ctl.stats().dcache_read_misses, 2);
}

/// Tests the single-entry TLB invalidates: the next access to the page
/// walks again.
#[test]
fn tlb_invalidate_forces_rewalk() {
    let mut bench = TestBench::new();
    let _ = bench.fabric.map_page(PT_BASE, 0x0040_0000, 0x2, CODE_FLAGS);
    let _ = bench.fabric.map_page(PT_BASE, 0x1000_0000, 0x5, DATA_FLAGS);
    bench.enable_mmu(PT_BASE);
    let _ = bench.fetch(0x0040_0000);
    let _ = bench.load(0x1000_0000);

    assert!(!bench.xtn_write(4, 0x0040_0000).error);
    let _ = bench.fetch(0x0040_0000);
    assert_eq!(bench.ctl.stats().itlb_misses, 2);

    assert!(!bench.xtn_write(5, 0x1000_0000).error);
    let _ = bench.load(0x1000_0000);
    assert_eq!(bench.ctl.stats().dtlb_misses, 2);
}

/// Tests the single-line cache invalidates, addressed physically.
#[test]
fn line_invalidate_by_physical_address() {
    let mut bench = TestBench::new();
    bench.fabric.write_word(0x3000, 7);
    assert_eq!(bench.fetch(0x3000).inst, 7);
    assert_eq!(bench.load(0x3000).rdata, 7);

    assert!(!bench.xtn_write(6, 0x3000).error);
    assert_eq!(bench.fetch(0x3000).inst, 7);
    assert_eq!(bench.ctl.stats().icache_misses, 2);

    assert!(!bench.xtn_write(7, 0x3000).error);
    bench.run(8);
    assert!(bench
        .fabric
        .cleanups
        .contains(&(bench.nline(0x3000), Side::Data)));
    assert_eq!(bench.load(0x3000).rdata, 7);
    assert_eq!(bench.ctl.stats().dcache_read_misses, 2);
}
