//! Fame accumulation across the whole run.

#[derive(Debug, Default)]
pub struct FameTracker {
    total: u64,
    started_at: Option<f64>,
    last_ts: f64,
}

impl FameTracker {
    pub fn add(&mut self, fame: u64, ts: f64) {
        if self.started_at.is_none() {
            self.started_at = Some(ts);
        }
        self.total += fame;
        self.last_ts = self.last_ts.max(ts);
    }

    pub fn total(&self) -> u64 {
        self.total
    }

    /// Rate since the first fame gain, using the later of `now` and the
    /// last observed gain so replay clocks work too.
    pub fn per_hour(&self, now: f64) -> f64 {
        let Some(start) = self.started_at else {
            return 0.0;
        };
        let elapsed = (now.max(self.last_ts) - start).max(1.0);
        self.total as f64 * 3600.0 / elapsed
    }

    pub fn reset(&mut self) {
        self.total = 0;
        self.started_at = None;
        self.last_ts = 0.0;
    }
}
