use super::pick_claimed;
use crate::upstream::backend::BackendRecord;
use rand::Rng;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

/// Load-scored P2C.
///
/// Score is `-(2 * in_flight + remote_load)`; the higher score wins. A backend
/// is eligible when it is past its reset horizon or reports a load below 95%
/// of the configured capacity. Without a configured capacity the load mark is
/// unbounded and every backend counts as eligible.
#[derive(Debug)]
pub struct LoadScoredPolicy {
    load_mark: f64,
    reset_interval: Duration,
}

impl LoadScoredPolicy {
    pub fn new(capacity: i64, reset_interval: Duration) -> Self {
        let load_mark = if capacity > 0 {
            capacity as f64 * 0.95
        } else {
            f64::INFINITY
        };
        Self {
            load_mark,
            reset_interval,
        }
    }

    pub fn load_mark(&self) -> f64 {
        self.load_mark
    }

    #[inline]
    fn score(b: &BackendRecord) -> i64 {
        let load = i64::try_from(b.remote_load()).unwrap_or(i64::MAX);
        let pressure = b.in_flight().saturating_mul(2).saturating_add(load);
        -pressure
    }

    fn eligible(&self, b: &BackendRecord, now: Instant) -> bool {
        let stats = b.snapshot();
        now >= stats.reset_at || (stats.remote_load as f64) < self.load_mark
    }

    pub fn pick<R: Rng + ?Sized>(
        &self,
        backends: &[Arc<BackendRecord>],
        now: Instant,
        rng: &mut R,
    ) -> Option<Arc<BackendRecord>> {
        pick_claimed(
            backends,
            rng,
            |b| self.eligible(b, now),
            |first, second| Self::score(first) > Self::score(second),
            |b| b.try_claim_load(now, self.load_mark, self.reset_interval),
        )
    }
}
