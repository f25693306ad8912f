#![allow(dead_code)]

use std::cell::RefCell;
use std::rc::Rc;

use ferrite_core::address::DecodedAddress;
use ferrite_core::config::DramConfig;
use ferrite_core::controller::MemoryController;

/// One delivered read completion.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Completion {
    pub lineaddr: u64,
    /// DRAM cycle the callback fired on.
    pub dram: u64,
    /// Host cycle the callback fired on.
    pub host: u64,
}

/// Drives a controller tick-by-tick and records completions with the clock
/// values they were delivered at.
pub struct Harness {
    pub ctrl: MemoryController,
    inbox: Rc<RefCell<Vec<u64>>>,
    pub completions: Vec<Completion>,
}

impl Harness {
    pub fn new(conf: DramConfig) -> Self {
        let inbox = Rc::new(RefCell::new(Vec::new()));
        let sink = Rc::clone(&inbox);
        let ctrl = MemoryController::new(
            conf,
            0xfe55,
            Box::new(move |lineaddr| sink.borrow_mut().push(lineaddr)),
        )
        .expect("test config must validate");
        Self {
            ctrl,
            inbox,
            completions: Vec::new(),
        }
    }

    /// Builds a line address for the given device coordinates.
    pub fn addr(&self, sc: u64, ra: u64, bg: u64, ba: u64, ro: u64, co: u64) -> u64 {
        self.ctrl.mapper().encode(&DecodedAddress {
            channel: 0,
            subchannel: sc,
            rank: ra,
            bankgroup: bg,
            bank: ba,
            row: ro,
            column: co,
        })
    }

    pub fn read(&mut self, lineaddr: u64) -> bool {
        self.ctrl.make_request(lineaddr, true)
    }

    pub fn write(&mut self, lineaddr: u64) -> bool {
        self.ctrl.make_request(lineaddr, false)
    }

    /// One host cycle; completions delivered during it are stamped with the
    /// clocks as they were when the callback ran.
    pub fn tick(&mut self) {
        let host = self.ctrl.host_cycle();
        let dram = self.ctrl.dram_cycle();
        self.ctrl.tick();
        for lineaddr in self.inbox.borrow_mut().drain(..) {
            self.completions.push(Completion {
                lineaddr,
                dram,
                host,
            });
        }
    }

    /// Ticks until `count` completions arrived; panics after `max_host`
    /// cycles.
    pub fn run_until_completions(&mut self, count: usize, max_host: u64) {
        while self.completions.len() < count {
            assert!(
                self.ctrl.host_cycle() < max_host,
                "only {}/{count} completions after {max_host} host cycles",
                self.completions.len()
            );
            self.tick();
        }
    }

    /// Ticks until the DRAM clock reaches `dram`.
    pub fn run_to_dram_cycle(&mut self, dram: u64) {
        while self.ctrl.dram_cycle() < dram {
            self.tick();
        }
    }

    /// Structural invariants that must hold at any cycle.
    pub fn check_invariants(&self) {
        let conf = self.ctrl.config().clone();
        for ch in 0..conf.channels as u64 {
            for sci in 0..conf.subchannels as u64 {
                let sc = self.ctrl.subchannel(ch, sci);
                for rank in sc.ranks() {
                    assert!(rank.faw_window_len() <= 4, "tFAW window overflow");
                    for bank in rank.banks() {
                        if bank.consecutive_col_accesses() > 0 {
                            assert!(
                                bank.open_row().is_some(),
                                "column streak against a closed row"
                            );
                        }
                    }
                }
            }
        }
    }
}
