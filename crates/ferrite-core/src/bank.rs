//! Per-bank row-buffer state machine, timing fences, and RowHammer
//! counters.
//!
//! A bank validates nothing at execution time beyond its own assertions:
//! the rank's `can_execute` is the gatekeeper, and a command that reaches
//! `execute` in an illegal state is a scheduler bug, which aborts.

mod mirza;
mod moat;

use tracing::trace;

use crate::command::CommandKind;
use crate::config::DramConfig;
use crate::rng::SplitMix64;
use mirza::MirzaState;
use moat::MoatState;

/// Rows refreshed per REFRESH command (one stripe).
pub const REF_STRIPE_ROWS: usize = 8192;
/// Column accesses allowed against one open row before the scheduler must
/// let a precharge through.
pub const MAX_CONSEC_COL_ACCESSES: u8 = 4;

/// One DRAM bank.
#[derive(Debug, Clone)]
pub struct Bank {
    open_row: Option<u64>,
    /// All commands to this bank wait until this DRAM cycle while a
    /// refresh or RFM is in flight.
    busy_until: u64,
    consecutive_col_accesses: u8,

    next_precharge_ok: u64,
    next_activate_ok: u64,
    next_column_ok: u64,

    activations: u64,
    /// Rolling accumulated activations; RFM's pressure gauge.
    raa_ctr: u32,
    /// Per-row activation counts; empty when the overlay is off.
    prac: Vec<u16>,
    /// Start row of the next refresh stripe.
    ref_stripe_start: usize,

    mirza: Option<MirzaState>,
    moat: Option<MoatState>,
}

impl Bank {
    pub fn new(conf: &DramConfig) -> Self {
        let overlay = conf.overlay_active();
        Self {
            open_row: None,
            busy_until: 0,
            consecutive_col_accesses: 0,
            next_precharge_ok: 0,
            next_activate_ok: 0,
            next_column_ok: 0,
            activations: 0,
            raa_ctr: 0,
            prac: if overlay { vec![0; conf.rows] } else { Vec::new() },
            ref_stripe_start: 0,
            mirza: conf
                .mirza
                .enabled
                .then(|| MirzaState::new(conf.rows, &conf.mirza)),
            moat: conf.moat.enabled.then(MoatState::default),
        }
    }

    pub fn open_row(&self) -> Option<u64> {
        self.open_row
    }

    pub fn consecutive_col_accesses(&self) -> u8 {
        self.consecutive_col_accesses
    }

    pub fn raa_ctr(&self) -> u32 {
        self.raa_ctr
    }

    pub fn activations(&self) -> u64 {
        self.activations
    }

    pub fn prac_of(&self, row: u64) -> u16 {
        self.prac.get(row as usize).copied().unwrap_or(0)
    }

    pub fn next_activate_ok(&self) -> u64 {
        self.next_activate_ok
    }

    pub fn next_precharge_ok(&self) -> u64 {
        self.next_precharge_ok
    }

    pub fn next_column_ok(&self) -> u64 {
        self.next_column_ok
    }

    pub fn busy_until(&self) -> u64 {
        self.busy_until
    }

    /// True while a refresh or RFM blocks the bank.
    #[inline]
    pub fn in_refresh(&self, dram: u64) -> bool {
        dram < self.busy_until
    }

    /// Bank-local half of the scheduler's `can_execute` checks.
    #[inline]
    pub fn column_ready(&self, row: u64, dram: u64) -> bool {
        self.open_row == Some(row) && dram >= self.next_column_ok
    }

    #[inline]
    pub fn precharge_ready(&self, dram: u64) -> bool {
        self.open_row.is_some() && dram >= self.next_precharge_ok
    }

    #[inline]
    pub fn activate_ready(&self, dram: u64) -> bool {
        self.open_row.is_none() && dram >= self.next_activate_ok
    }

    /// Executes `kind` against this bank and returns its latency in DRAM
    /// cycles. `row` is the decoded row of the command's line address.
    pub fn execute(
        &mut self,
        kind: CommandKind,
        row: u64,
        dram: u64,
        conf: &DramConfig,
        rng: &mut SplitMix64,
    ) -> u64 {
        let t = &conf.timing;
        let bl2 = conf.burst_length() / 2;
        assert!(!self.in_refresh(dram), "command during refresh lockout");
        match kind {
            CommandKind::Activate => {
                assert!(self.activate_ready(dram), "ACTIVATE on open/fenced bank");
                self.open_row = Some(row);
                self.next_column_ok = dram + t.t_rcd;
                self.next_precharge_ok = dram + t.t_ras;
                self.record_activation(row, conf, rng);
                t.t_rcd
            }
            CommandKind::Read => {
                assert!(self.column_ready(row, dram), "READ on wrong/fenced row");
                self.consecutive_col_accesses += 1;
                t.cl + bl2
            }
            CommandKind::Write => {
                assert!(self.column_ready(row, dram), "WRITE on wrong/fenced row");
                self.consecutive_col_accesses += 1;
                t.cwl + bl2
            }
            CommandKind::Precharge => {
                assert!(self.precharge_ready(dram), "PRECHARGE on closed/fenced bank");
                self.close_row();
                self.next_activate_ok = dram + t.t_rp;
                t.t_rp
            }
            CommandKind::ReadPrecharge => {
                assert!(self.column_ready(row, dram), "RDA on wrong/fenced row");
                let latency = t.cl + bl2 + t.t_rp;
                self.close_row();
                self.next_activate_ok = dram + latency;
                latency
            }
            CommandKind::WritePrecharge => {
                assert!(self.column_ready(row, dram), "WRA on wrong/fenced row");
                let latency = t.cwl + bl2 + t.t_rp;
                self.close_row();
                self.next_activate_ok = dram + latency;
                latency
            }
            CommandKind::Refresh => {
                self.busy_until = dram + t.t_rfc;
                self.close_row();
                self.raa_ctr = self.raa_ctr.saturating_sub(conf.rfm.ref_raa_decrement);
                self.refresh_stripe(conf);
                t.t_rfc
            }
            CommandKind::RfmAllBank => self.refresh_management(dram, t.t_rfm, conf),
            CommandKind::RfmSameBank => self.refresh_management(dram, t.t_rfm_sb, conf),
        }
    }

    /// Applies an RFM to this bank: blocks it, bleeds the RAA counter, and
    /// lets the trackers take their mitigation pick.
    fn refresh_management(&mut self, dram: u64, busy: u64, conf: &DramConfig) -> u64 {
        self.busy_until = dram + busy;
        self.close_row();
        self.raa_ctr = self.raa_ctr.saturating_sub(conf.rfm.rfm_raa_decrement);
        if let Some(mirza) = &mut self.mirza {
            if let Some(row) = mirza.mitigate() {
                trace!(row, "mirza quarantine eviction");
            }
        }
        if let Some(moat) = &mut self.moat {
            moat.mitigate(&mut self.prac);
        }
        busy
    }

    fn close_row(&mut self) {
        self.open_row = None;
        self.consecutive_col_accesses = 0;
    }

    fn record_activation(&mut self, row: u64, conf: &DramConfig, rng: &mut SplitMix64) {
        self.activations += 1;
        self.raa_ctr = self.raa_ctr.saturating_add(1);
        if self.prac.is_empty() {
            return;
        }
        let idx = row as usize;
        self.prac[idx] = self.prac[idx].saturating_add(1);
        if let Some(mirza) = &mut self.mirza {
            mirza.on_activate(row, &conf.mirza, rng);
        }
        if let Some(moat) = &mut self.moat {
            moat.observe(row, self.prac[idx]);
        }
    }

    /// Resets the PrAC stripe covered by this refresh and advances it.
    fn refresh_stripe(&mut self, conf: &DramConfig) {
        if self.prac.is_empty() {
            return;
        }
        let stripe = REF_STRIPE_ROWS.min(conf.rows);
        let start = self.ref_stripe_start;
        let end = start + stripe;
        self.prac[start..end].fill(0);
        if let Some(mirza) = &mut self.mirza {
            mirza.on_refresh(start..end, &conf.mirza);
        }
        if let Some(moat) = &mut self.moat {
            moat.on_refresh(start as u64..end as u64);
        }
        self.ref_stripe_start = end % conf.rows;
    }

    /// Polls the mitigation trackers.
    pub fn check_alert(&self, conf: &DramConfig) -> bool {
        self.mirza
            .as_ref()
            .is_some_and(|m| m.alert(&conf.mirza))
            || self
                .moat
                .as_ref()
                .is_some_and(|m| m.alert(conf.moat.threshold))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{DramConfig, MoatConfig, RfmMode};

    fn conf() -> DramConfig {
        DramConfig::default()
    }

    fn overlay_conf() -> DramConfig {
        let mut c = DramConfig::default();
        c.rfm.mode = RfmMode::AllBank;
        c
    }

    #[test]
    fn activate_sets_fences_and_returns_trcd() {
        let c = conf();
        let mut rng = SplitMix64::default();
        let mut bank = Bank::new(&c);

        let latency = bank.execute(CommandKind::Activate, 12, 100, &c, &mut rng);
        assert_eq!(latency, c.timing.t_rcd);
        assert_eq!(bank.open_row(), Some(12));
        assert_eq!(bank.next_column_ok(), 100 + c.timing.t_rcd);
        assert_eq!(bank.next_precharge_ok(), 100 + c.timing.t_ras);
    }

    #[test]
    fn read_latency_is_cl_plus_half_burst() {
        let c = conf();
        let mut rng = SplitMix64::default();
        let mut bank = Bank::new(&c);
        bank.execute(CommandKind::Activate, 12, 0, &c, &mut rng);

        let latency = bank.execute(CommandKind::Read, 12, c.timing.t_rcd, &c, &mut rng);
        assert_eq!(latency, c.timing.cl + c.burst_length() / 2);
        assert_eq!(bank.consecutive_col_accesses(), 1);
    }

    #[test]
    fn precharge_closes_and_fences_activate() {
        let c = conf();
        let mut rng = SplitMix64::default();
        let mut bank = Bank::new(&c);
        bank.execute(CommandKind::Activate, 12, 0, &c, &mut rng);

        let now = c.timing.t_ras;
        let latency = bank.execute(CommandKind::Precharge, 0, now, &c, &mut rng);
        assert_eq!(latency, c.timing.t_rp);
        assert_eq!(bank.open_row(), None);
        assert_eq!(bank.consecutive_col_accesses(), 0);
        assert_eq!(bank.next_activate_ok(), now + c.timing.t_rp);
    }

    #[test]
    #[should_panic(expected = "ACTIVATE on open/fenced bank")]
    fn double_activate_is_a_bug() {
        let c = conf();
        let mut rng = SplitMix64::default();
        let mut bank = Bank::new(&c);
        bank.execute(CommandKind::Activate, 1, 0, &c, &mut rng);
        bank.execute(CommandKind::Activate, 2, 1000, &c, &mut rng);
    }

    #[test]
    fn refresh_blocks_bank_and_bleeds_raa() {
        let c = overlay_conf();
        let mut rng = SplitMix64::default();
        let mut bank = Bank::new(&c);
        for row in 0..20 {
            bank.execute(CommandKind::Activate, row, row * 200, &c, &mut rng);
            bank.execute(CommandKind::Precharge, 0, row * 200 + c.timing.t_ras, &c, &mut rng);
        }
        assert_eq!(bank.raa_ctr(), 20);

        let now = 20 * 200;
        bank.execute(CommandKind::Refresh, 0, now, &c, &mut rng);
        assert!(bank.in_refresh(now + c.timing.t_rfc - 1));
        assert!(!bank.in_refresh(now + c.timing.t_rfc));
        assert_eq!(bank.raa_ctr(), 20 - c.rfm.ref_raa_decrement.min(20));
    }

    #[test]
    fn refresh_stripe_resets_prac_and_advances() {
        let c = overlay_conf();
        let mut rng = SplitMix64::default();
        let mut bank = Bank::new(&c);
        bank.execute(CommandKind::Activate, 7, 0, &c, &mut rng);
        assert_eq!(bank.prac_of(7), 1);

        // First stripe covers rows 0..8192; row 7's counter is wiped.
        bank.execute(CommandKind::Precharge, 0, c.timing.t_ras, &c, &mut rng);
        bank.execute(CommandKind::Refresh, 0, 500, &c, &mut rng);
        assert_eq!(bank.prac_of(7), 0);
    }

    #[test]
    fn rfm_decrements_raa_saturating() {
        let c = overlay_conf();
        let mut rng = SplitMix64::default();
        let mut bank = Bank::new(&c);
        bank.execute(CommandKind::Activate, 1, 0, &c, &mut rng);
        bank.execute(CommandKind::Precharge, 0, c.timing.t_ras, &c, &mut rng);
        assert_eq!(bank.raa_ctr(), 1);

        bank.execute(CommandKind::RfmAllBank, 0, 200, &c, &mut rng);
        assert_eq!(bank.raa_ctr(), 0);
    }

    #[test]
    fn moat_alert_fires_above_threshold() {
        let mut c = conf();
        c.moat = MoatConfig {
            enabled: true,
            threshold: 3,
        };
        let mut rng = SplitMix64::default();
        let mut bank = Bank::new(&c);
        for i in 0..4u64 {
            bank.execute(CommandKind::Activate, 9, i * 200, &c, &mut rng);
            bank.execute(CommandKind::Precharge, 0, i * 200 + c.timing.t_ras, &c, &mut rng);
        }
        assert!(bank.check_alert(&c));

        // Mitigation resets the victim and charges neighbors.
        bank.execute(CommandKind::RfmAllBank, 0, 5000, &c, &mut rng);
        assert_eq!(bank.prac_of(9), 0);
        assert_eq!(bank.prac_of(8), 1);
        assert_eq!(bank.prac_of(11), 1);
        assert!(!bank.check_alert(&c));
    }
}
