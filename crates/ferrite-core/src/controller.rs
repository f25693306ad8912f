//! Top-level memory controller.
//!
//! Owns one sub-channel per (channel, sub-channel) pair and the two clocks.
//! The host ticks faster than DRAM; a fractional leap accumulator decides
//! which host ticks also advance the DRAM side. Finished reads drain to the
//! owner through a completion callback supplied at construction.

use tracing::error;

use crate::address::AddressMapper;
use crate::config::DramConfig;
use crate::error::Error;
use crate::rng::SplitMix64;
use crate::stats::MemoryStats;
use crate::subchannel::Subchannel;

/// DRAM cycles of stalled, non-empty queues before the simulator declares a
/// scheduling deadlock and aborts.
const QUIESCENCE_LIMIT: u64 = 1_000_000;

/// Callback invoked once per finished read transaction.
pub type CompletionFn = Box<dyn FnMut(u64)>;

pub struct MemoryController {
    conf: DramConfig,
    mapper: AddressMapper,
    subchannels: Vec<Subchannel>,

    host: u64,
    dram: u64,
    leap: f64,
    rng: SplitMix64,
    callback: CompletionFn,

    reads: u64,
    writes: u64,
    total_read_latency: u64,
    stalled_ticks: u64,
}

impl MemoryController {
    /// Validates `conf` and builds the controller. `callback` receives the
    /// line address of every finished read.
    pub fn new(conf: DramConfig, seed: u64, callback: CompletionFn) -> Result<Self, Error> {
        conf.validate()?;
        let mapper = AddressMapper::new(&conf);
        let subchannels = (0..conf.channels * conf.subchannels)
            .map(|_| Subchannel::new(&conf))
            .collect();
        Ok(Self {
            conf,
            mapper,
            subchannels,
            host: 0,
            dram: 0,
            leap: 0.0,
            rng: SplitMix64::new(seed),
            callback,
            reads: 0,
            writes: 0,
            total_read_latency: 0,
            stalled_ticks: 0,
        })
    }

    pub fn config(&self) -> &DramConfig {
        &self.conf
    }

    pub fn mapper(&self) -> &AddressMapper {
        &self.mapper
    }

    pub fn host_cycle(&self) -> u64 {
        self.host
    }

    pub fn dram_cycle(&self) -> u64 {
        self.dram
    }

    pub fn subchannel(&self, channel: u64, subchannel: u64) -> &Subchannel {
        &self.subchannels[self.subchannel_index_of(channel, subchannel)]
    }

    fn subchannel_index_of(&self, channel: u64, subchannel: u64) -> usize {
        channel as usize * self.conf.subchannels + subchannel as usize
    }

    fn route(&self, lineaddr: u64) -> usize {
        let d = self.mapper.decode(lineaddr);
        self.subchannel_index_of(d.channel, d.subchannel)
    }

    /// Enqueues a request into its sub-channel; false on backpressure.
    pub fn make_request(&mut self, lineaddr: u64, is_read: bool) -> bool {
        let idx = self.route(lineaddr);
        let accepted =
            self.subchannels[idx].make_request(lineaddr, is_read, self.host, self.dram);
        if accepted {
            if is_read {
                self.reads += 1;
            } else {
                self.writes += 1;
            }
        }
        accepted
    }

    /// One host cycle: maybe one DRAM cycle of work, then completion
    /// delivery.
    pub fn tick(&mut self) {
        let tick_mem = self.leap < 1.0;
        if tick_mem {
            let mut executed = false;
            for sc in &mut self.subchannels {
                executed |=
                    sc.tick(self.host, self.dram, &self.conf, &self.mapper, &mut self.rng);
            }
            self.watch_quiescence(executed);
        }

        let callback = &mut self.callback;
        for sc in &mut self.subchannels {
            while let Some(trans) = sc.pop_finished(self.dram) {
                callback(trans.lineaddr);
                self.total_read_latency += self.host - trans.host_cycle_added;
            }
        }

        if tick_mem {
            self.leap += self.conf.clock_scale();
            self.dram += 1;
        } else {
            self.leap -= 1.0;
        }
        self.host += 1;
    }

    /// Deadlock detection: queued work with nothing executing for
    /// `QUIESCENCE_LIMIT` DRAM cycles dumps every bank and aborts.
    fn watch_quiescence(&mut self, executed: bool) {
        if executed || !self.subchannels.iter().any(Subchannel::has_queued_work) {
            self.stalled_ticks = 0;
            return;
        }
        self.stalled_ticks += 1;
        if self.stalled_ticks >= QUIESCENCE_LIMIT {
            self.dump_state();
            panic!(
                "memory system deadlocked: no command executed for {QUIESCENCE_LIMIT} DRAM cycles"
            );
        }
    }

    /// Prints every bank's state through the error log.
    pub fn dump_state(&self) {
        error!(host = self.host, dram = self.dram, "memory state dump");
        for (sci, sc) in self.subchannels.iter().enumerate() {
            error!(
                subchannel = sci,
                read_queue = sc.read_queue_len(),
                write_buffer = sc.write_buffer_len(),
                write_mode = sc.in_write_mode(),
                "subchannel state"
            );
            for (ri, rank) in sc.ranks().enumerate() {
                error!(
                    subchannel = sci,
                    rank = ri,
                    queued = rank.num_cmds(),
                    waiting_ref = rank.is_waiting_for_refresh(),
                    faw = rank.faw_window_len(),
                    "rank state"
                );
                for (bi, bank) in rank.banks().enumerate() {
                    let bg = (bi / self.conf.banks) as u64;
                    let ba = (bi % self.conf.banks) as u64;
                    error!(
                        subchannel = sci,
                        rank = ri,
                        bg,
                        ba,
                        queued = rank.queue_len(bg, ba, &self.conf),
                        open_row = ?bank.open_row(),
                        busy_until = bank.busy_until(),
                        next_act = bank.next_activate_ok(),
                        next_pre = bank.next_precharge_ok(),
                        next_col = bank.next_column_ok(),
                        "bank state"
                    );
                }
            }
        }
    }

    /// Folds every level's counters into one snapshot.
    pub fn stats(&self) -> MemoryStats {
        let mut stats = MemoryStats {
            reads: self.reads,
            writes: self.writes,
            total_read_latency: self.total_read_latency,
            ..MemoryStats::default()
        };
        for sc in &self.subchannels {
            stats.subchannel.accumulate(&sc.stats);
            for rank in sc.ranks() {
                stats.rank.accumulate(&rank.stats);
            }
        }
        stats
    }
}
