//! Event counters for the controller.
//!
//! This module tracks what the controller did over a run. It provides:
//! 1. **Hit/miss counts:** per cache and per TLB.
//! 2. **Bus activity:** refills, uncached accesses, posted writes, cleanups.
//! 3. **Coherence activity:** snoop invalidates/updates and refill cancellations.
//! 4. **MMU maintenance:** walks, access/dirty updates, and SC retries.

/// Controller event counters, reset at construction.
#[derive(Clone, Debug, Default)]
pub struct Stats {
    /// Ticks elapsed.
    pub ticks: u64,

    /// Instruction cache hits.
    pub icache_hits: u64,
    /// Instruction cache misses (line refills issued).
    pub icache_misses: u64,
    /// Uncached instruction fetches.
    pub icache_unc: u64,

    /// Data cache read hits.
    pub dcache_read_hits: u64,
    /// Data cache read misses (line refills issued).
    pub dcache_read_misses: u64,
    /// Data cache write hits (line updated in place).
    pub dcache_write_hits: u64,
    /// Data cache write misses (posted without allocation).
    pub dcache_write_misses: u64,
    /// Uncached data accesses (reads, LL, SC).
    pub dcache_unc: u64,

    /// Instruction TLB hits (including speculative same-page hits).
    pub itlb_hits: u64,
    /// Instruction TLB misses (walks started).
    pub itlb_misses: u64,
    /// Data TLB hits (including speculative same-page hits).
    pub dtlb_hits: u64,
    /// Data TLB misses (walks started).
    pub dtlb_misses: u64,
    /// Page-table read steps issued on the bus.
    pub walk_reads: u64,

    /// Accessed-bit read-modify-writes completed.
    pub access_updates: u64,
    /// Dirty-bit read-modify-writes completed.
    pub dirty_updates: u64,
    /// Store-conditional retries during access/dirty maintenance.
    pub sc_retries: u64,

    /// Words posted to the write buffer.
    pub wbuf_writes: u64,
    /// Ticks stalled because the write buffer was full.
    pub wbuf_full_stalls: u64,
    /// Ticks a read stalled on a same-line write-buffer hazard.
    pub wbuf_hazard_stalls: u64,

    /// Snoop line/broadcast invalidates serviced.
    pub snoop_invals: u64,
    /// Snoop line updates serviced.
    pub snoop_updates: u64,
    /// In-flight refills discarded because a snoop hit the same line.
    pub snoop_cancels: u64,

    /// Cleanup notifications sent for the instruction side.
    pub cleanups_inst: u64,
    /// Cleanup notifications sent for the data side.
    pub cleanups_data: u64,
    /// TLB entries invalidated by the backing-line scanners.
    pub tlb_scrubbed: u64,

    /// Precise faults delivered to the processor.
    pub faults: u64,
}

impl Stats {
    /// Renders a short human-readable report.
    pub fn report(&self) -> String {
        format!(
            "ticks {}\n\
             icache hits {} misses {} unc {}\n\
             dcache read hits {} misses {} | write hits {} misses {} | unc {}\n\
             itlb hits {} misses {} | dtlb hits {} misses {} | walk reads {}\n\
             access updates {} dirty updates {} sc retries {}\n\
             wbuf writes {} full stalls {} hazard stalls {}\n\
             snoop invals {} updates {} cancels {}\n\
             cleanups I {} D {} | tlb scrubbed {} | faults {}",
            self.ticks,
            self.icache_hits,
            self.icache_misses,
            self.icache_unc,
            self.dcache_read_hits,
            self.dcache_read_misses,
            self.dcache_write_hits,
            self.dcache_write_misses,
            self.dcache_unc,
            self.itlb_hits,
            self.itlb_misses,
            self.dtlb_hits,
            self.dtlb_misses,
            self.walk_reads,
            self.access_updates,
            self.dirty_updates,
            self.sc_retries,
            self.wbuf_writes,
            self.wbuf_full_stalls,
            self.wbuf_hazard_stalls,
            self.snoop_invals,
            self.snoop_updates,
            self.snoop_cancels,
            self.cleanups_inst,
            self.cleanups_data,
            self.tlb_scrubbed,
            self.faults,
        )
    }
}
