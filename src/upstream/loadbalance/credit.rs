use super::pick_claimed;
use crate::upstream::backend::BackendRecord;
use rand::Rng;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

/// Credit-aware P2C ("MLeastConn").
///
/// Both samples skip backends that have spent their credits and are still
/// inside their reset horizon. A creditless backend past its horizon may be
/// returned once as a probe, after which its horizon moves out again by
/// `reset_interval`.
#[derive(Debug)]
pub struct CreditAwarePolicy {
    reset_interval: Duration,
}

impl CreditAwarePolicy {
    pub fn new(reset_interval: Duration) -> Self {
        Self { reset_interval }
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
            |b| b.has_credit_or_expired(now),
            |first, second| first.in_flight() < second.in_flight(),
            |b| b.try_claim_credit(now, self.reset_interval),
        )
    }
}
