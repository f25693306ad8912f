//! MIRZA per-bank quarantine tracker.
//!
//! Rows are split into equal-size groups with a per-group activation
//! counter. Once a group runs hot, further activations in it are sampled
//! into a small quarantine queue; a quarantined row that keeps getting
//! activated, or a full queue, raises the bank's alert. The mitigation pick
//! on an all-bank RFM is the quarantine entry with the highest activation
//! count.

use std::ops::Range;

use crate::config::MirzaConfig;
use crate::rng::SplitMix64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct QuarantineEntry {
    pub row: u64,
    pub group: usize,
    pub act_ctr: u32,
}

#[derive(Debug, Clone)]
pub(crate) struct MirzaState {
    rows_per_group: usize,
    group_counts: Vec<u32>,
    queue: Vec<QuarantineEntry>,
}

impl MirzaState {
    pub(crate) fn new(rows: usize, conf: &MirzaConfig) -> Self {
        Self {
            rows_per_group: rows / conf.groups,
            group_counts: vec![0; conf.groups],
            queue: Vec::with_capacity(conf.queue_size),
        }
    }

    fn group_of(&self, row: u64) -> usize {
        row as usize / self.rows_per_group
    }

    /// Counts the activation; may sample the row into quarantine.
    pub(crate) fn on_activate(&mut self, row: u64, conf: &MirzaConfig, rng: &mut SplitMix64) {
        let group = self.group_of(row);
        self.group_counts[group] += 1;

        if let Some(entry) = self.queue.iter_mut().find(|e| e.row == row) {
            entry.act_ctr += 1;
            return;
        }
        if self.group_counts[group] > conf.group_threshold
            && self.queue.len() < conf.queue_size
            && rng.one_in(conf.min_tw)
        {
            self.queue.push(QuarantineEntry {
                row,
                group,
                act_ctr: 1,
            });
        }
    }

    /// True when a quarantined row crossed the alert threshold or the queue
    /// has no room left to track new candidates.
    pub(crate) fn alert(&self, conf: &MirzaConfig) -> bool {
        self.queue.len() == conf.queue_size
            || self.queue.iter().any(|e| e.act_ctr >= conf.queue_threshold)
    }

    /// A refresh covered `rows`: groups fully inside it cool down.
    pub(crate) fn on_refresh(&mut self, rows: Range<usize>, conf: &MirzaConfig) {
        let first_group = rows.start / self.rows_per_group;
        let last_group = (rows.end - 1) / self.rows_per_group;
        for group in first_group..=last_group {
            let start = group * self.rows_per_group;
            if start >= rows.start && start + self.rows_per_group <= rows.end {
                self.group_counts[group] = 0;
                if conf.refresh_evict {
                    self.queue.retain(|e| e.group != group);
                }
            }
        }
    }

    /// Mitigation pick for an RFM: evict the hottest quarantine entry.
    pub(crate) fn mitigate(&mut self) -> Option<u64> {
        let victim = self
            .queue
            .iter()
            .enumerate()
            .max_by_key(|(_, e)| e.act_ctr)
            .map(|(i, _)| i)?;
        Some(self.queue.swap_remove(victim).row)
    }

    #[cfg(test)]
    pub(crate) fn queue_len(&self) -> usize {
        self.queue.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn small_conf() -> MirzaConfig {
        MirzaConfig {
            enabled: true,
            groups: 4,
            group_threshold: 2,
            queue_size: 2,
            queue_threshold: 3,
            min_tw: 1, // sample every candidate
            refresh_evict: true,
        }
    }

    #[test]
    fn hot_group_rows_enter_quarantine() {
        let conf = small_conf();
        let mut st = MirzaState::new(64, &conf);
        let mut rng = SplitMix64::new(1);
        // Two activations warm the group, the third is sampled in.
        for _ in 0..3 {
            st.on_activate(5, &conf, &mut rng);
        }
        assert_eq!(st.queue_len(), 1);
        assert!(!st.alert(&conf));
    }

    #[test]
    fn repeated_activation_raises_alert() {
        let conf = small_conf();
        let mut st = MirzaState::new(64, &conf);
        let mut rng = SplitMix64::new(1);
        for _ in 0..6 {
            st.on_activate(5, &conf, &mut rng);
        }
        // act_ctr reached queue_threshold.
        assert!(st.alert(&conf));
    }

    #[test]
    fn full_queue_is_an_alert() {
        let conf = small_conf();
        let mut st = MirzaState::new(64, &conf);
        let mut rng = SplitMix64::new(1);
        for row in [1, 2] {
            for _ in 0..3 {
                st.on_activate(row, &conf, &mut rng);
            }
        }
        assert_eq!(st.queue_len(), 2);
        assert!(st.alert(&conf));
    }

    #[test]
    fn refresh_clears_covered_group() {
        let conf = small_conf();
        let mut st = MirzaState::new(64, &conf);
        let mut rng = SplitMix64::new(1);
        for _ in 0..3 {
            st.on_activate(5, &conf, &mut rng);
        }
        assert_eq!(st.queue_len(), 1);
        // Rows 0..16 cover group 0 entirely.
        st.on_refresh(0..16, &conf);
        assert_eq!(st.queue_len(), 0);
        assert_eq!(st.group_counts[0], 0);
    }

    #[test]
    fn mitigate_evicts_hottest_entry() {
        let conf = small_conf();
        let mut st = MirzaState::new(64, &conf);
        let mut rng = SplitMix64::new(1);
        for _ in 0..3 {
            st.on_activate(1, &conf, &mut rng);
        }
        for _ in 0..5 {
            st.on_activate(20, &conf, &mut rng);
        }
        assert_eq!(st.mitigate(), Some(20));
        assert_eq!(st.queue_len(), 1);
    }
}
