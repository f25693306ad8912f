//! Memory-system configuration: topology, JEDEC timing, and mitigation knobs.
//!
//! Timing constants are expressed in DRAM cycles except `t_ck_ns`, the cycle
//! time itself. The speed-grade presets derive the column/activate spacing
//! families from `t_ck_ns` the way DDR5 datasheets specify them (a floor in
//! cycles combined with a floor in nanoseconds).

use crate::error::Error;

/// Cache-line size in bytes; every request addresses one line.
pub const LINE_SIZE: usize = 64;
/// Device column width in bits.
pub const COLUMN_WIDTH: usize = 32;
/// Beats per column burst: one line is transferred as BURST_LENGTH columns.
pub const BURST_LENGTH: usize = LINE_SIZE / (COLUMN_WIDTH / 8);

/// Row-buffer management policy.
#[cfg_attr(
    feature = "config-serde",
    derive(serde::Serialize, serde::Deserialize),
    serde(rename_all = "UPPERCASE")
)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum PagePolicy {
    /// Leave the row open after a column access.
    #[default]
    Open,
    /// Auto-precharge after every column access.
    Closed,
}

/// Refresh fan-out.
#[cfg_attr(
    feature = "config-serde",
    derive(serde::Serialize, serde::Deserialize),
    serde(rename_all = "UPPERCASE")
)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum RefreshMethod {
    /// All banks of a rank refresh together.
    #[default]
    RefAb,
    /// Same-bank refresh. Recognized but not implemented; rejected by
    /// `DramConfig::validate`.
    RefSb,
}

/// Line-address-to-device mapping.
#[cfg_attr(
    feature = "config-serde",
    derive(serde::Serialize, serde::Deserialize),
    serde(rename_all = "lowercase")
)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MappingKind {
    /// Contiguous bit fields, low to high.
    Linear,
    /// MOP-N: the low N column bits sit below the channel/bank fields so
    /// consecutive lines spread across sub-channels and banks.
    Mop(u32),
}

impl Default for MappingKind {
    fn default() -> Self {
        MappingKind::Mop(2)
    }
}

/// Refresh-management command fan-out.
#[cfg_attr(
    feature = "config-serde",
    derive(serde::Serialize, serde::Deserialize),
    serde(rename_all = "lowercase")
)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum RfmMode {
    #[default]
    Off,
    SameBank,
    AllBank,
}

/// JEDEC timing constants, in DRAM cycles unless noted.
#[cfg_attr(feature = "config-serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "config-serde", serde(default))]
#[derive(Debug, Clone, PartialEq)]
pub struct DramTiming {
    /// Cycle time in nanoseconds.
    pub t_ck_ns: f64,
    pub cl: u64,
    pub cwl: u64,
    pub t_rcd: u64,
    pub t_rp: u64,
    pub t_ras: u64,
    pub t_rfc: u64,
    pub t_refi: u64,
    pub t_rrd_s: u64,
    pub t_rrd_l: u64,
    pub t_faw: u64,
    pub t_ccd_s: u64,
    pub t_ccd_s_wr: u64,
    pub t_ccd_s_rtw: u64,
    pub t_ccd_s_wtr: u64,
    pub t_ccd_l: u64,
    pub t_ccd_l_wr: u64,
    pub t_ccd_l_rtw: u64,
    pub t_ccd_l_wtr: u64,
    /// All-bank RFM busy time.
    pub t_rfm: u64,
    /// Same-bank RFM busy time.
    pub t_rfm_sb: u64,
}

/// DDR5 speed grades with presets.
#[cfg_attr(feature = "config-serde", derive(serde::Serialize, serde::Deserialize))]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum SpeedGrade {
    Ddr5_4400,
    #[default]
    Ddr5_4800,
    Ddr5_5200,
}

/// Cycles needed to cover `ns` nanoseconds, rounded up.
fn ck(t_ck_ns: f64, ns: f64) -> u64 {
    (ns / t_ck_ns).ceil() as u64
}

/// Same, rounded to nearest; tFAW is specified this way.
fn ck_round(t_ck_ns: f64, ns: f64) -> u64 {
    (ns / t_ck_ns).round() as u64
}

impl DramTiming {
    /// Preset for an x4 32GB DDR5 DIMM at the given speed grade.
    ///
    /// CL/tRCD/tRP/tRAS/tRFC/tREFI are taken as base cycle counts; the
    /// derived families (CWL, tCCD, tRRD, tFAW) follow the datasheet
    /// formulas against `t_ck_ns`.
    pub fn for_grade(grade: SpeedGrade) -> Self {
        let (t_ck_ns, faw_floor, faw_ns) = match grade {
            SpeedGrade::Ddr5_4400 => (0.455, 32, 14.545),
            SpeedGrade::Ddr5_4800 => (0.416, 32, 13.333),
            SpeedGrade::Ddr5_5200 => (0.385, 40, 15.384),
        };
        let cl = 40;
        let cwl = cl - 2;
        let bl2 = (BURST_LENGTH / 2) as u64;

        let t_ccd_l_wtr = cwl + bl2 + ck(t_ck_ns, 10.0).max(16);
        let t_ccd_s_wtr = cwl + bl2 + ck(t_ck_ns, 2.5).max(4);

        Self {
            t_ck_ns,
            cl,
            cwl,
            t_rcd: 40,
            t_rp: 40,
            t_ras: 77,
            t_rfc: 984,
            t_refi: 9390,
            t_rrd_s: 8,
            t_rrd_l: ck(t_ck_ns, 5.0).max(8),
            t_faw: ck_round(t_ck_ns, faw_ns).max(faw_floor),
            t_ccd_s: 8,
            t_ccd_s_wr: 8,
            t_ccd_s_rtw: t_ccd_s_wtr,
            t_ccd_s_wtr,
            t_ccd_l: ck(t_ck_ns, 5.0).max(8),
            t_ccd_l_wr: ck(t_ck_ns, 20.0).max(32),
            t_ccd_l_rtw: t_ccd_l_wtr,
            t_ccd_l_wtr,
            t_rfm: 410,
            t_rfm_sb: 140,
        }
    }
}

impl Default for DramTiming {
    fn default() -> Self {
        Self::for_grade(SpeedGrade::default())
    }
}

/// RFM counter thresholds and decrements.
#[cfg_attr(feature = "config-serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "config-serde", serde(default))]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RfmConfig {
    pub mode: RfmMode,
    /// Crossing this RAA count requests an RFM into the sub-channel's
    /// pending queue.
    pub raaimt: u32,
    /// Crossing this RAA count rewrites the next ready command for a closed
    /// bank into an RFM.
    pub raammt: u32,
    pub rfm_raa_decrement: u32,
    pub ref_raa_decrement: u32,
}

impl Default for RfmConfig {
    fn default() -> Self {
        Self {
            mode: RfmMode::Off,
            raaimt: 32,
            raammt: 64,
            rfm_raa_decrement: 32,
            ref_raa_decrement: 16,
        }
    }
}

/// Alert (ABO) gating.
#[cfg_attr(feature = "config-serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "config-serde", serde(default))]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AboConfig {
    pub enabled: bool,
    /// Minimum DRAM cycles between honored alerts.
    pub t_abo_act: u64,
    /// Minimum ACTIVATEs since the last all-bank RFM before an alert is
    /// honored.
    pub delay_acts: u64,
}

impl Default for AboConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            t_abo_act: 180,
            delay_acts: 4,
        }
    }
}

/// MIRZA quarantine-tracker parameters.
#[cfg_attr(feature = "config-serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "config-serde", serde(default))]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MirzaConfig {
    pub enabled: bool,
    /// Number of equal-size row groups per bank.
    pub groups: usize,
    /// Group activation count above which rows become quarantine candidates.
    pub group_threshold: u32,
    /// Quarantine queue capacity.
    pub queue_size: usize,
    /// Quarantine entry activation count that raises an alert.
    pub queue_threshold: u32,
    /// Sampling window: candidates enter quarantine with probability
    /// 1/min_tw.
    pub min_tw: u64,
    /// Drop quarantine entries for a group when its rows are refreshed.
    pub refresh_evict: bool,
}

impl Default for MirzaConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            groups: 128,
            group_threshold: 2048,
            queue_size: 16,
            queue_threshold: 512,
            min_tw: 32,
            refresh_evict: true,
        }
    }
}

/// MOAT max-PrAC tracker parameters.
#[cfg_attr(feature = "config-serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "config-serde", serde(default))]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MoatConfig {
    pub enabled: bool,
    /// PrAC value above which the tracked row raises an alert.
    pub threshold: u16,
}

impl Default for MoatConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            threshold: 4096,
        }
    }
}

/// Full memory-system configuration, fixed at construction.
#[cfg_attr(feature = "config-serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "config-serde", serde(default))]
#[derive(Debug, Clone, PartialEq)]
pub struct DramConfig {
    pub channels: usize,
    pub subchannels: usize,
    pub ranks: usize,
    pub bankgroups: usize,
    /// Banks per bank group.
    pub banks: usize,
    pub rows: usize,
    pub columns: usize,

    pub page_policy: PagePolicy,
    pub refresh_method: RefreshMethod,
    pub mapping: MappingKind,

    /// Host core clock, for the host/DRAM tick leap.
    pub host_clock_ghz: f64,

    pub timing: DramTiming,
    pub rfm: RfmConfig,
    pub abo: AboConfig,
    pub mirza: MirzaConfig,
    pub moat: MoatConfig,
}

impl Default for DramConfig {
    fn default() -> Self {
        Self {
            channels: 1,
            subchannels: 2,
            ranks: 2,
            bankgroups: 8,
            banks: 4,
            rows: 1 << 16,
            columns: 1 << 11,
            page_policy: PagePolicy::default(),
            refresh_method: RefreshMethod::default(),
            mapping: MappingKind::default(),
            host_clock_ghz: 4.0,
            timing: DramTiming::default(),
            rfm: RfmConfig::default(),
            abo: AboConfig::default(),
            mirza: MirzaConfig::default(),
            moat: MoatConfig::default(),
        }
    }
}

fn require_power_of_two(field: &'static str, value: usize) -> Result<(), Error> {
    if value == 0 {
        return Err(Error::ZeroCount { field });
    }
    if !value.is_power_of_two() {
        return Err(Error::NotPowerOfTwo { field, value });
    }
    Ok(())
}

impl DramConfig {
    /// Checks every constraint the engine assumes; call before construction.
    pub fn validate(&self) -> Result<(), Error> {
        require_power_of_two("num_channels", self.channels)?;
        require_power_of_two("num_subchannels", self.subchannels)?;
        require_power_of_two("num_ranks", self.ranks)?;
        require_power_of_two("num_bankgroups", self.bankgroups)?;
        require_power_of_two("num_banks", self.banks)?;
        require_power_of_two("num_rows", self.rows)?;
        require_power_of_two("num_columns", self.columns)?;

        if self.refresh_method == RefreshMethod::RefSb {
            return Err(Error::UnsupportedRefreshMethod(self.refresh_method));
        }
        if let MappingKind::Mop(n) = self.mapping {
            let column_bits = self.columns.trailing_zeros();
            if n >= column_bits {
                return Err(Error::MopWiderThanColumn {
                    mop: n,
                    column_bits,
                });
            }
        }
        if self.mirza.enabled {
            if self.mirza.min_tw == 0 {
                return Err(Error::ZeroSamplingWindow);
            }
            if self.mirza.groups == 0 || self.rows % self.mirza.groups != 0 {
                return Err(Error::MirzaGroupMismatch {
                    groups: self.mirza.groups,
                    rows: self.rows,
                });
            }
        }
        Ok(())
    }

    /// True when any RowHammer machinery needs per-row bookkeeping.
    pub fn overlay_active(&self) -> bool {
        self.rfm.mode != RfmMode::Off || self.mirza.enabled || self.moat.enabled
    }

    /// Host ticks to skip per DRAM tick, as the leap-accumulator increment.
    ///
    /// E.g. a 4 GHz host over DDR5-4800 (2.4 GHz) gives ~0.664: the DRAM
    /// side ticks on roughly 60% of host ticks.
    pub fn clock_scale(&self) -> f64 {
        self.host_clock_ghz * self.timing.t_ck_ns - 1.0
    }

    /// Column beats per line transfer.
    pub fn burst_length(&self) -> u64 {
        BURST_LENGTH as u64
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_validates() {
        DramConfig::default().validate().expect("default is valid");
    }

    #[test]
    fn ddr5_4800_derivations() {
        let t = DramTiming::for_grade(SpeedGrade::Ddr5_4800);
        assert_eq!(t.cwl, 38);
        assert_eq!(t.t_ccd_l, 13);
        assert_eq!(t.t_ccd_s, 8);
        assert_eq!(t.t_ccd_l_wr, 49);
        assert_eq!(t.t_ccd_l_wtr, 38 + 8 + 25);
        assert_eq!(t.t_ccd_l_rtw, t.t_ccd_l_wtr);
        assert_eq!(t.t_ccd_s_wtr, 38 + 8 + 7);
        assert_eq!(t.t_rrd_l, 13);
        assert_eq!(t.t_faw, 32);
    }

    #[test]
    fn ddr5_5200_faw_floor() {
        let t = DramTiming::for_grade(SpeedGrade::Ddr5_5200);
        assert_eq!(t.t_faw, 40);
    }

    #[test]
    fn rejects_non_power_of_two_rows() {
        let conf = DramConfig {
            rows: 1000,
            ..DramConfig::default()
        };
        assert!(matches!(
            conf.validate(),
            Err(Error::NotPowerOfTwo { field: "num_rows", .. })
        ));
    }

    #[test]
    fn rejects_same_bank_refresh() {
        let conf = DramConfig {
            refresh_method: RefreshMethod::RefSb,
            ..DramConfig::default()
        };
        assert!(matches!(
            conf.validate(),
            Err(Error::UnsupportedRefreshMethod(_))
        ));
    }

    #[test]
    fn rejects_wide_mop() {
        let conf = DramConfig {
            mapping: MappingKind::Mop(11),
            ..DramConfig::default()
        };
        assert!(matches!(conf.validate(), Err(Error::MopWiderThanColumn { .. })));
    }

    #[test]
    fn rejects_uneven_mirza_groups() {
        let mut conf = DramConfig::default();
        conf.mirza.enabled = true;
        conf.mirza.groups = 3;
        assert!(matches!(conf.validate(), Err(Error::MirzaGroupMismatch { .. })));
    }
}
