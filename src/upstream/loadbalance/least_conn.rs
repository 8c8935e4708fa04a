use crate::upstream::backend::BackendRecord;
use rand::Rng;
use std::sync::Arc;

/// P2C (Power of Two Random Choices) least-connections.
///
/// Two independent uniform samples (with replacement); the one with fewer
/// in-flight requests wins, the second sample on a tie. O(1) per selection.
#[derive(Debug, Default)]
pub struct LeastConnPolicy;

impl LeastConnPolicy {
    pub fn new() -> Self {
        Self
    }

    pub fn pick<R: Rng + ?Sized>(
        &self,
        backends: &[Arc<BackendRecord>],
        rng: &mut R,
    ) -> Option<Arc<BackendRecord>> {
        let len = backends.len();
        match len {
            0 => None,
            1 => Some(backends[0].clone()),
            _ => {
                let first = &backends[rng.gen_range(0..len)];
                let second = &backends[rng.gen_range(0..len)];
                if first.in_flight() < second.in_flight() {
                    Some(first.clone())
                } else {
                    Some(second.clone())
                }
            }
        }
    }
}
