//! MOAT per-bank max-PrAC tracker.
//!
//! Tracks the row with the highest per-row activation count. The alert
//! fires once that maximum clears the configured threshold; the RFM
//! mitigation resets the victim's count and charges its four nearest
//! neighbors for the disturbance they absorbed.

use std::ops::Range;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct TrackedRow {
    row: u64,
    prac: u16,
}

#[derive(Debug, Clone, Copy, Default)]
pub(crate) struct MoatState {
    tracked: Option<TrackedRow>,
}

impl MoatState {
    /// Observes an activation of `row` whose PrAC is now `prac`.
    pub(crate) fn observe(&mut self, row: u64, prac: u16) {
        match self.tracked {
            Some(t) if t.row == row => self.tracked = Some(TrackedRow { row, prac }),
            Some(t) if prac > t.prac => self.tracked = Some(TrackedRow { row, prac }),
            None => self.tracked = Some(TrackedRow { row, prac }),
            _ => {}
        }
    }

    pub(crate) fn alert(&self, threshold: u16) -> bool {
        self.tracked.is_some_and(|t| t.prac > threshold)
    }

    /// A refresh covered `rows`; drop the tracker if its row was reset.
    pub(crate) fn on_refresh(&mut self, rows: Range<u64>) {
        if self.tracked.is_some_and(|t| rows.contains(&t.row)) {
            self.tracked = None;
        }
    }

    /// RFM mitigation: reset the tracked row and charge its neighbors.
    pub(crate) fn mitigate(&mut self, prac: &mut [u16]) {
        let Some(t) = self.tracked.take() else {
            return;
        };
        let row = t.row as usize;
        prac[row] = 0;
        for dist in 1..=2u64 {
            if let Some(below) = t.row.checked_sub(dist) {
                prac[below as usize] = prac[below as usize].saturating_add(1);
            }
            let above = (t.row + dist) as usize;
            if above < prac.len() {
                prac[above] = prac[above].saturating_add(1);
            }
        }
    }

    #[cfg(test)]
    pub(crate) fn tracked_row(&self) -> Option<u64> {
        self.tracked.map(|t| t.row)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tracks_the_hottest_row() {
        let mut st = MoatState::default();
        st.observe(3, 1);
        st.observe(7, 5);
        st.observe(3, 2);
        assert_eq!(st.tracked_row(), Some(7));
    }

    #[test]
    fn alert_requires_crossing_threshold() {
        let mut st = MoatState::default();
        st.observe(7, 5);
        assert!(!st.alert(5));
        st.observe(7, 6);
        assert!(st.alert(5));
    }

    #[test]
    fn mitigation_resets_victim_and_charges_neighbors() {
        let mut prac = vec![0u16; 16];
        prac[8] = 9;
        let mut st = MoatState::default();
        st.observe(8, 9);

        st.mitigate(&mut prac);
        assert_eq!(prac[8], 0);
        assert_eq!(prac[6], 1);
        assert_eq!(prac[7], 1);
        assert_eq!(prac[9], 1);
        assert_eq!(prac[10], 1);
        assert_eq!(st.tracked_row(), None);
    }

    #[test]
    fn mitigation_clamps_at_array_edges() {
        let mut prac = vec![0u16; 4];
        prac[0] = 9;
        let mut st = MoatState::default();
        st.observe(0, 9);

        st.mitigate(&mut prac);
        assert_eq!(prac[0], 0);
        assert_eq!(prac[1], 1);
        assert_eq!(prac[2], 1);
    }

    #[test]
    fn refresh_over_tracked_row_clears_tracker() {
        let mut st = MoatState::default();
        st.observe(8, 9);
        st.on_refresh(0..8);
        assert_eq!(st.tracked_row(), Some(8));
        st.on_refresh(8..16);
        assert_eq!(st.tracked_row(), None);
    }
}
