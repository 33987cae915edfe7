//! # Command Priority Tests
//!
//! The command engine serves one lane per tick under a fixed total order.
//! With both processor ports raising a miss on the same tick, the
//! instruction refill must win the first grant.

use crate::common::harness::{TestBench, TIMEOUT};
use ccvcache_core::common::addr::VirtAddr;
use ccvcache_core::iface::bus::TxTag;
use ccvcache_core::iface::proc::{
    DataOp, DataRequest, InstRequest, PrivilegeMode,
};
use pretty_assertions::assert_eq;

/// Tests that a fetch miss and a load miss raised on the same tick are
/// granted in instruction-first order.
#[test]
fn instruction_miss_beats_data_miss() {
    let mut bench = TestBench::new();
    bench.fabric.extra_latency = 4;
    bench.fabric.write_word(0x1000, 0x0000_0A0A);
    bench.fabric.write_word(0x2000, 0x0000_0B0B);

    bench.ireq = Some(InstRequest {
        vaddr: VirtAddr::new(0x1000),
        mode: PrivilegeMode::Kernel,
    });
    bench.dreq = Some(DataRequest {
        vaddr: VirtAddr::new(0x2000),
        op: DataOp::Read,
        be: 0xF,
        wdata: 0,
        mode: PrivilegeMode::Kernel,
    });

    let mut inst = None;
    let mut rdata = None;
    for _ in 0..TIMEOUT {
        let out = bench.step().unwrap();
        if let Some(rsp) = out.irsp {
            inst = Some(rsp.inst);
        }
        if let Some(rsp) = out.drsp {
            rdata = Some(rsp.rdata);
        }
        if inst.is_some() && rdata.is_some() {
            break;
        }
    }
    assert_eq!(inst, Some(0x0000_0A0A));
    assert_eq!(rdata, Some(0x0000_0B0B));
    assert_eq!(bench.fabric.cmd_log, vec![TxTag::InsMiss, TxTag::DataMiss]);
}
