//! Simulation counters and their text emission.
//!
//! Stats print as `NAME<tab>value`, one per line, so runs diff cleanly.

use std::fmt::Display;
use std::io::{self, Write};

/// Writes one stat line in the fixed-width `NAME<tab>value` format.
pub fn write_stat<W: Write>(out: &mut W, name: &str, value: impl Display) -> io::Result<()> {
    writeln!(out, "{name:<24}\t{value}")
}

/// Counters kept per rank and folded into the sub-channel totals.
#[derive(Debug, Default, Clone, Copy)]
pub struct RankStats {
    pub read_cmds: u64,
    pub write_cmds: u64,
    pub activates: u64,
    pub precharges: u64,
    /// Precharges synthesized to close a row for a waiting demand.
    pub demand_precharges: u64,
    pub row_buf_hits: u64,
    pub row_buf_misses: u64,
    pub refreshes: u64,
    pub rfm_all_bank: u64,
    pub rfm_same_bank: u64,
    pub alerts: u64,
}

impl RankStats {
    pub fn accumulate(&mut self, other: &RankStats) {
        self.read_cmds += other.read_cmds;
        self.write_cmds += other.write_cmds;
        self.activates += other.activates;
        self.precharges += other.precharges;
        self.demand_precharges += other.demand_precharges;
        self.row_buf_hits += other.row_buf_hits;
        self.row_buf_misses += other.row_buf_misses;
        self.refreshes += other.refreshes;
        self.rfm_all_bank += other.rfm_all_bank;
        self.rfm_same_bank += other.rfm_same_bank;
        self.alerts += other.alerts;
    }
}

/// Counters kept per sub-channel.
#[derive(Debug, Default, Clone, Copy)]
pub struct SubchannelStats {
    pub write_drains: u64,
    pub opportunistic_write_drains: u64,
    pub cycles_between_drains: u64,
    pub cycles_between_opportunistic_drains: u64,
    pub trefi_rounds: u64,
    pub write_forwards: u64,
    pub coalesced_reads: u64,
    pub coalesced_writes: u64,
}

impl SubchannelStats {
    pub fn accumulate(&mut self, other: &SubchannelStats) {
        self.write_drains += other.write_drains;
        self.opportunistic_write_drains += other.opportunistic_write_drains;
        self.cycles_between_drains += other.cycles_between_drains;
        self.cycles_between_opportunistic_drains += other.cycles_between_opportunistic_drains;
        self.trefi_rounds += other.trefi_rounds;
        self.write_forwards += other.write_forwards;
        self.coalesced_reads += other.coalesced_reads;
        self.coalesced_writes += other.coalesced_writes;
    }
}

/// Controller-level totals plus the folded per-level counters.
#[derive(Debug, Default, Clone, Copy)]
pub struct MemoryStats {
    pub reads: u64,
    pub writes: u64,
    pub total_read_latency: u64,
    pub subchannel: SubchannelStats,
    pub rank: RankStats,
}

impl MemoryStats {
    pub fn write_to<W: Write>(&self, out: &mut W) -> io::Result<()> {
        let mean_latency = if self.reads > 0 {
            self.total_read_latency as f64 / self.reads as f64
        } else {
            0.0
        };
        write_stat(out, "DRAM_READS", self.reads)?;
        write_stat(out, "DRAM_WRITES", self.writes)?;
        write_stat(out, "DRAM_READ_LATENCY", format!("{mean_latency:.3}"))?;
        write_stat(out, "DRAM_READ_CMDS", self.rank.read_cmds)?;
        write_stat(out, "DRAM_WRITE_CMDS", self.rank.write_cmds)?;
        write_stat(out, "DRAM_ACTIVATIONS", self.rank.activates)?;
        write_stat(out, "DRAM_PRECHARGES", self.rank.precharges)?;
        write_stat(out, "DRAM_PRE_DEMAND", self.rank.demand_precharges)?;
        write_stat(out, "DRAM_ROW_BUFFER_HITS", self.rank.row_buf_hits)?;
        write_stat(out, "DRAM_ROW_BUFFER_MISSES", self.rank.row_buf_misses)?;
        write_stat(out, "DRAM_REFRESHES", self.rank.refreshes)?;
        write_stat(out, "DRAM_RFM_AB", self.rank.rfm_all_bank)?;
        write_stat(out, "DRAM_RFM_SB", self.rank.rfm_same_bank)?;
        write_stat(out, "DRAM_ALERTS", self.rank.alerts)?;
        write_stat(out, "DRAM_TREFI", self.subchannel.trefi_rounds)?;
        write_stat(out, "DRAM_ALL_WRITE_DRAINS", self.subchannel.write_drains)?;
        write_stat(
            out,
            "DRAM_OPP_WRITE_DRAINS",
            self.subchannel.opportunistic_write_drains,
        )?;
        write_stat(out, "DRAM_WRITE_FORWARDS", self.subchannel.write_forwards)?;
        write_stat(out, "DRAM_COALESCED_READS", self.subchannel.coalesced_reads)?;
        write_stat(out, "DRAM_COALESCED_WRITES", self.subchannel.coalesced_writes)?;
        Ok(())
    }
}
