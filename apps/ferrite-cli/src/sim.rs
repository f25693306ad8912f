//! The main simulation loop.
//!
//! Tick order each host cycle matches the hardware's consumer-to-producer
//! direction: memory first (it may complete loads), then the LLC (delivers
//! completions, retries bounced requests), then the cores round-robin, the
//! starting core rotating every cycle.

use std::cell::RefCell;
use std::io::Write;
use std::rc::Rc;

use anyhow::Context;
use ferrite_core::controller::MemoryController;
use ferrite_core::stats::write_stat;
use tracing::info;

use crate::args::Args;
use crate::core::Core;
use crate::llc::LlcController;
use crate::os::Os;
use crate::sim_config::SimConfig;
use crate::trace::TraceReader;

const PROGRESS_INTERVAL: u64 = 10_000_000;

pub struct Simulation {
    cores: Vec<Core>,
    llc: LlcController,
    os: Os,
    mem: MemoryController,
    cycle: u64,
    first_core: usize,
    inst_target: u64,
}

impl Simulation {
    pub fn new(args: &Args, conf: &SimConfig) -> anyhow::Result<Self> {
        let completions = Rc::new(RefCell::new(Vec::new()));
        let sink = Rc::clone(&completions);
        let mem = MemoryController::new(
            conf.dram.clone(),
            args.seed,
            Box::new(move |lineaddr| sink.borrow_mut().push(lineaddr)),
        )
        .context("building the memory controller")?;

        let llc = LlcController::new(&conf.llc, args.cores.max(1), completions);
        let os = Os::new(conf.os.dram_size_mb, args.seed ^ 0x05);

        let mut cores = Vec::with_capacity(args.cores.max(1));
        for coreid in 0..args.cores.max(1) {
            let trace = TraceReader::open(&args.trace)
                .with_context(|| format!("opening trace {}", args.trace.display()))?;
            cores.push(
                Core::new(coreid, conf.core.fetch_width, trace)
                    .context("priming the trace reader")?,
            );
        }

        Ok(Self {
            cores,
            llc,
            os,
            mem,
            cycle: 0,
            first_core: 0,
            inst_target: args.inst,
        })
    }

    /// Runs until every core has retired its instruction budget.
    pub fn run(&mut self) -> anyhow::Result<()> {
        info!(
            cores = self.cores.len(),
            inst = self.inst_target,
            "simulation start"
        );
        loop {
            self.mem.tick();
            self.llc.tick(self.cycle, &mut self.cores, &mut self.mem);

            let mut all_done = true;
            let n = self.cores.len();
            for i in 0..n {
                let idx = (self.first_core + i) % n;
                self.cores[idx].tick(self.cycle, &mut self.llc, &mut self.mem, &mut self.os)?;
                all_done &= self.cores[idx].finished_inst_num() >= self.inst_target;
            }
            self.first_core = (self.first_core + 1) % n;
            self.cycle += 1;

            if self.cycle % PROGRESS_INTERVAL == 0 {
                info!(
                    cycle = self.cycle,
                    inst = self.cores[0].finished_inst_num(),
                    dram_cycle = self.mem.dram_cycle(),
                    "progress"
                );
            }
            if all_done {
                break;
            }
        }
        info!(cycle = self.cycle, "simulation end");
        Ok(())
    }

    /// Final report, one `NAME<tab>value` line per counter.
    pub fn write_stats<W: Write>(&self, out: &mut W) -> std::io::Result<()> {
        write_stat(out, "SYS_CYCLES", self.cycle)?;
        for core in &self.cores {
            core.write_stats(out, self.cycle)?;
        }
        self.os.write_stats(out)?;
        self.llc.write_stats(out)?;
        self.mem.stats().write_to(out)?;
        Ok(())
    }
}
