//! Per-actor running totals and the rolling rate window.

use std::collections::VecDeque;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Tick {
    pub ts: f64,
    pub damage: u64,
    pub heal: u64,
}

/// Running totals for one actor within one session.
///
/// Totals are monotonic for the session's lifetime; ticks exist only to
/// answer rolling-rate queries and are pruned to the window before reads.
#[derive(Debug, Clone, Default)]
pub struct Stats {
    pub damage: u64,
    pub heal: u64,
    ticks: VecDeque<Tick>,
}

impl Stats {
    /// Record a delta. Out-of-order timestamps (backfill) insert at their
    /// sorted position so window pruning stays a front-pop.
    pub fn record(&mut self, ts: f64, damage: u64, heal: u64) {
        self.damage += damage;
        self.heal += heal;
        let tick = Tick { ts, damage, heal };
        match self.ticks.back() {
            Some(last) if last.ts > ts => {
                let pos = self.ticks.partition_point(|t| t.ts <= ts);
                self.ticks.insert(pos, tick);
            }
            _ => self.ticks.push_back(tick),
        }
    }

    pub fn prune(&mut self, cutoff: f64) {
        while let Some(front) = self.ticks.front() {
            if front.ts >= cutoff {
                break;
            }
            self.ticks.pop_front();
        }
    }

    /// Windowed delta sums over `[now - window, now]`.
    pub fn windowed(&self, now: f64, window: f64) -> (u64, u64) {
        let cutoff = now - window;
        self.ticks
            .iter()
            .filter(|tick| tick.ts >= cutoff)
            .fold((0, 0), |(d, h), tick| (d + tick.damage, h + tick.heal))
    }

    pub fn dps(&self, now: f64, window: f64) -> f64 {
        if window <= 0.0 {
            return 0.0;
        }
        self.windowed(now, window).0 as f64 / window
    }

    pub fn hps(&self, now: f64, window: f64) -> f64 {
        if window <= 0.0 {
            return 0.0;
        }
        self.windowed(now, window).1 as f64 / window
    }

    /// Archived sessions keep totals only.
    pub fn compact(&mut self) {
        self.ticks.clear();
        self.ticks.shrink_to_fit();
    }

    #[cfg(test)]
    pub fn tick_timestamps(&self) -> Vec<f64> {
        self.ticks.iter().map(|t| t.ts).collect()
    }
}

/// Ranking key requested by the snapshot consumer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum SortKey {
    Damage,
    Heal,
    #[default]
    Dps,
    Hps,
}

/// Sort `(name, key value, total damage)` rows: requested key descending,
/// then total damage descending, then name ascending.
pub fn rank_indices(rows: &[(String, f64, u64)]) -> Vec<usize> {
    let mut order: Vec<usize> = (0..rows.len()).collect();
    order.sort_by(|&a, &b| {
        let (left, right) = (&rows[a], &rows[b]);
        right
            .1
            .partial_cmp(&left.1)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| right.2.cmp(&left.2))
            .then_with(|| left.0.cmp(&right.0))
    });
    order
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn totals_are_monotonic() {
        let mut stats = Stats::default();
        stats.record(0.0, 100, 0);
        stats.record(1.0, 0, 40);
        stats.record(2.0, 60, 0);
        assert_eq!(stats.damage, 160);
        assert_eq!(stats.heal, 40);
    }

    #[test]
    fn window_sums_match_definition() {
        let mut stats = Stats::default();
        stats.record(0.0, 100, 0);
        stats.record(5.0, 50, 0);
        stats.record(11.0, 25, 0);

        // Window [1, 11]: the tick at 0.0 is outside.
        assert_eq!(stats.windowed(11.0, 10.0), (75, 0));
        assert!((stats.dps(11.0, 10.0) - 7.5).abs() < 1e-9);
    }

    #[test]
    fn prune_drops_only_old_ticks() {
        let mut stats = Stats::default();
        stats.record(0.0, 100, 0);
        stats.record(5.0, 50, 0);
        stats.prune(4.0);
        assert_eq!(stats.tick_timestamps(), vec![5.0]);
        // Totals are unaffected by pruning.
        assert_eq!(stats.damage, 150);
    }

    #[test]
    fn backfill_inserts_in_timestamp_order() {
        let mut stats = Stats::default();
        stats.record(5.0, 10, 0);
        stats.record(1.0, 20, 0);
        stats.record(3.0, 30, 0);
        assert_eq!(stats.tick_timestamps(), vec![1.0, 3.0, 5.0]);
    }

    #[test]
    fn ranking_breaks_ties_on_damage_then_name() {
        let rows = vec![
            ("Carol".to_string(), 10.0, 500),
            ("Alice".to_string(), 10.0, 900),
            ("Bob".to_string(), 10.0, 500),
            ("Dave".to_string(), 12.0, 100),
        ];
        let order = rank_indices(&rows);
        let names: Vec<&str> = order.iter().map(|&i| rows[i].0.as_str()).collect();
        assert_eq!(names, vec!["Dave", "Alice", "Bob", "Carol"]);
    }
}
