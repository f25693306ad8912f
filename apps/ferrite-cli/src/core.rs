//! Out-of-order core front-end.
//!
//! The core replays a trace through a circular reorder buffer: every
//! instruction occupies a ROB slot, memory instructions additionally go
//! through the LLC. Loads hold their slot until the cache (or memory)
//! completion arrives; retirement is in order, up to `fetch_width` per
//! cycle.

use ferrite_core::controller::MemoryController;
use ferrite_core::stats::write_stat;

use crate::llc::{AccessResult, LlcController};
use crate::os::Os;
use crate::trace::{TraceError, TraceReader, TraceRecord};

pub const ROB_SIZE: usize = 256;
/// Placeholder completion for an outstanding load; replaced by the real
/// completion cycle when the LLC wakes the slot.
const LOAD_PENDING: u64 = 1_000_000_000;

#[derive(Debug, Clone, Copy, Default)]
struct RobEntry {
    inst_num: u64,
    begin_cycle: u64,
    end_cycle: u64,
}

pub struct Core {
    coreid: usize,
    fetch_width: usize,

    rob: Vec<RobEntry>,
    rob_ptr: usize,
    rob_size: usize,

    curr_inst_num: u64,
    finished_inst_num: u64,
    /// Instruction count accumulated over previous trace laps.
    inst_offset: u64,

    trace: TraceReader,
    next_inst: Option<TraceRecord>,

    pub llc_accesses: u64,
    pub llc_misses: u64,
    pub mshr_stalls: u64,
    total_delay: u64,
}

impl Core {
    pub fn new(coreid: usize, fetch_width: usize, mut trace: TraceReader) -> Result<Self, TraceError> {
        let next_inst = trace.next_record()?;
        Ok(Self {
            coreid,
            fetch_width,
            rob: vec![RobEntry::default(); ROB_SIZE],
            rob_ptr: 0,
            rob_size: 0,
            curr_inst_num: 0,
            finished_inst_num: 0,
            inst_offset: 0,
            trace,
            next_inst,
            llc_accesses: 0,
            llc_misses: 0,
            mshr_stalls: 0,
            total_delay: 0,
        })
    }

    pub fn finished_inst_num(&self) -> u64 {
        self.finished_inst_num
    }

    /// Callback target for the LLC: the load in `robid` finished at `cycle`.
    pub fn complete_load(&mut self, robid: usize, cycle: u64) {
        self.rob[robid].end_cycle = cycle;
    }

    pub fn tick(
        &mut self,
        cycle: u64,
        llc: &mut LlcController,
        mem: &mut MemoryController,
        os: &mut Os,
    ) -> Result<(), TraceError> {
        self.retire(cycle);

        for _ in 0..self.fetch_width {
            if self.rob_size >= ROB_SIZE {
                break;
            }
            let robid = (self.rob_ptr + self.rob_size) & (ROB_SIZE - 1);
            self.rob[robid] = RobEntry {
                inst_num: self.curr_inst_num,
                begin_cycle: cycle,
                end_cycle: cycle,
            };

            if let Some(rec) = self.next_inst {
                if self.curr_inst_num >= rec.inst_num + self.inst_offset {
                    let is_load = !rec.is_write;
                    let virtual_line = (rec.vaddr >> 6) | ((self.coreid as u64) << 48);
                    let lineaddr = os.translate(virtual_line);

                    if is_load {
                        self.rob[robid].end_cycle = cycle + LOAD_PENDING;
                    }
                    match llc.access(lineaddr, self.coreid, robid, is_load, mem) {
                        AccessResult::QueueFull => {
                            // Retry the same instruction next cycle; the ROB
                            // slot was never committed.
                            self.mshr_stalls += 1;
                            return Ok(());
                        }
                        AccessResult::Hit => {
                            self.llc_accesses += 1;
                            if is_load {
                                self.rob[robid].end_cycle = cycle + llc.latency();
                            }
                        }
                        AccessResult::Miss => {
                            self.llc_accesses += 1;
                            self.llc_misses += 1;
                        }
                    }
                    self.advance_trace()?;
                }
            }

            self.rob_size += 1;
            self.curr_inst_num += 1;
        }
        Ok(())
    }

    fn retire(&mut self, cycle: u64) {
        for _ in 0..self.fetch_width {
            if self.rob_size == 0 {
                break;
            }
            let entry = self.rob[self.rob_ptr];
            if entry.end_cycle > cycle {
                break;
            }
            self.rob_ptr = (self.rob_ptr + 1) & (ROB_SIZE - 1);
            self.rob_size -= 1;
            self.finished_inst_num = entry.inst_num;
            self.total_delay += entry.end_cycle - entry.begin_cycle;
        }
    }

    /// Reads the next trace record, rewinding and re-basing instruction
    /// numbers at end of file.
    fn advance_trace(&mut self) -> Result<(), TraceError> {
        self.next_inst = self.trace.next_record()?;
        if self.next_inst.is_none() {
            self.trace.rewind()?;
            self.inst_offset = self.curr_inst_num + 1;
            self.next_inst = self.trace.next_record()?;
        }
        Ok(())
    }

    pub fn write_stats<W: std::io::Write>(&self, out: &mut W, cycles: u64) -> std::io::Result<()> {
        let header = format!("CORE_{}", self.coreid);
        let inst = self.finished_inst_num;
        let ipc = if cycles > 0 {
            inst as f64 / cycles as f64
        } else {
            0.0
        };
        let mpki = if inst > 0 {
            1000.0 * self.llc_misses as f64 / inst as f64
        } else {
            0.0
        };
        write_stat(out, &format!("{header}_INST"), inst)?;
        write_stat(out, &format!("{header}_IPC"), format!("{ipc:.4}"))?;
        write_stat(out, &format!("{header}_LLC_MISSES"), self.llc_misses)?;
        write_stat(out, &format!("{header}_LLC_ACCESSES"), self.llc_accesses)?;
        write_stat(out, &format!("{header}_MPKI"), format!("{mpki:.3}"))?;
        Ok(())
    }
}
