//! Last-level cache controller.
//!
//! A set-associative LRU cache fronted by an MSHR: loads that miss park in
//! the MSHR until the memory controller's completion callback delivers the
//! line; requests the memory controller bounces are retried every tick from
//! an explicit list. Dirty victims become memory writes.

use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;

use ferrite_core::controller::MemoryController;
use ferrite_core::stats::write_stat;
use tracing::trace;

use crate::core::Core;
use crate::sim_config::LlcConfig;

/// Outcome of an LLC access, as seen by the core.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccessResult {
    /// MSHR full; the core must retry the whole instruction.
    QueueFull,
    Miss,
    Hit,
}

#[derive(Debug, Clone, Copy)]
struct CacheEntry {
    dirty: bool,
    lru_stamp: u64,
}

#[derive(Debug, Clone, Copy)]
struct MshrEntry {
    coreid: usize,
    robid: usize,
}

pub struct LlcController {
    /// Per-set map from line address to entry state.
    sets: Vec<HashMap<u64, CacheEntry>>,
    assoc: usize,
    latency: u64,
    mshr_size: usize,

    mshr: HashMap<u64, Vec<MshrEntry>>,
    mshr_count: usize,
    /// Requests the memory controller refused; retried each tick.
    bounced: Vec<(u64, bool)>,
    /// Line addresses completed by the memory controller, delivered through
    /// its callback.
    completions: Rc<RefCell<Vec<u64>>>,

    lru_counter: u64,
    pub accesses: u64,
    pub misses: u64,
    pub writebacks: u64,
    pub mshr_full_stalls: u64,
}

impl LlcController {
    /// `completions` is the buffer the memory controller's callback pushes
    /// finished line addresses into.
    pub fn new(conf: &LlcConfig, cores: usize, completions: Rc<RefCell<Vec<u64>>>) -> Self {
        let num_sets =
            (conf.size_kb_per_core * cores * 1024) / (conf.assoc * ferrite_core::config::LINE_SIZE);
        assert!(
            num_sets.is_power_of_two(),
            "LLC set count must be a power of two, got {num_sets}"
        );
        Self {
            sets: vec![HashMap::new(); num_sets],
            assoc: conf.assoc,
            latency: conf.latency,
            mshr_size: conf.mshr_size,
            mshr: HashMap::new(),
            mshr_count: 0,
            bounced: Vec::new(),
            completions,
            lru_counter: 0,
            accesses: 0,
            misses: 0,
            writebacks: 0,
            mshr_full_stalls: 0,
        }
    }

    fn set_index(&self, lineaddr: u64) -> usize {
        (lineaddr as usize) & (self.sets.len() - 1)
    }

    /// Hit latency in host cycles.
    pub fn latency(&self) -> u64 {
        self.latency
    }

    /// Performs one access on behalf of `(coreid, robid)`.
    pub fn access(
        &mut self,
        lineaddr: u64,
        coreid: usize,
        robid: usize,
        is_load: bool,
        mem: &mut MemoryController,
    ) -> AccessResult {
        if is_load && self.mshr_count >= self.mshr_size {
            self.mshr_full_stalls += 1;
            return AccessResult::QueueFull;
        }
        self.accesses += 1;
        self.lru_counter += 1;
        let stamp = self.lru_counter;
        let set = self.set_index(lineaddr);

        if let Some(entry) = self.sets[set].get_mut(&lineaddr) {
            entry.lru_stamp = stamp;
            if !is_load {
                entry.dirty = true;
            }
            return AccessResult::Hit;
        }

        self.misses += 1;
        self.install(set, lineaddr, !is_load, stamp, mem);
        if is_load {
            let fresh = !self.mshr.contains_key(&lineaddr);
            self.mshr
                .entry(lineaddr)
                .or_default()
                .push(MshrEntry { coreid, robid });
            self.mshr_count += 1;
            if fresh && !mem.make_request(lineaddr, true) {
                self.bounced.push((lineaddr, true));
            }
        }
        AccessResult::Miss
    }

    /// Installs `lineaddr`, evicting the LRU way if the set is full.
    fn install(
        &mut self,
        set: usize,
        lineaddr: u64,
        dirty: bool,
        stamp: u64,
        mem: &mut MemoryController,
    ) {
        if self.sets[set].len() >= self.assoc {
            let victim = self.sets[set]
                .iter()
                .min_by_key(|(_, e)| e.lru_stamp)
                .map(|(&addr, e)| (addr, e.dirty))
                .expect("full set has a victim");
            self.sets[set].remove(&victim.0);
            if victim.1 {
                self.writebacks += 1;
                if !mem.make_request(victim.0, false) {
                    self.bounced.push((victim.0, false));
                }
            }
        }
        self.sets[set].insert(
            lineaddr,
            CacheEntry {
                dirty,
                lru_stamp: stamp,
            },
        );
    }

    /// Delivers memory completions to waiting loads and retries bounced
    /// requests.
    pub fn tick(&mut self, cycle: u64, cores: &mut [Core], mem: &mut MemoryController) {
        let finished: Vec<u64> = self.completions.borrow_mut().drain(..).collect();
        for lineaddr in finished {
            self.mark_as_finished(lineaddr, cycle, cores);
        }

        let pending = std::mem::take(&mut self.bounced);
        for (lineaddr, is_read) in pending {
            if !mem.make_request(lineaddr, is_read) {
                self.bounced.push((lineaddr, is_read));
            }
        }
    }

    /// Wakes every load parked on `lineaddr`. Repeated completions for the
    /// same line are harmless: the MSHR entry is gone after the first.
    pub fn mark_as_finished(&mut self, lineaddr: u64, cycle: u64, cores: &mut [Core]) {
        let Some(waiters) = self.mshr.remove(&lineaddr) else {
            return;
        };
        trace!(lineaddr, waiters = waiters.len(), "memory completion");
        self.mshr_count -= waiters.len();
        for w in waiters {
            cores[w.coreid].complete_load(w.robid, cycle + self.latency);
        }
    }

    pub fn write_stats<W: std::io::Write>(&self, out: &mut W) -> std::io::Result<()> {
        let mpka = if self.accesses > 0 {
            self.misses as f64 / self.accesses as f64
        } else {
            0.0
        };
        write_stat(out, "LLC_ACCESSES", self.accesses)?;
        write_stat(out, "LLC_MISSES", self.misses)?;
        write_stat(out, "LLC_MISS_RATIO", format!("{mpka:.4}"))?;
        write_stat(out, "LLC_WRITEBACKS", self.writebacks)?;
        write_stat(out, "LLC_MSHR_STALLS", self.mshr_full_stalls)?;
        Ok(())
    }
}
