use crate::upstream::backend::BackendRecord;
use rand::Rng;
use std::sync::Arc;

/// Uniform pick over the active backends.
#[derive(Debug, Default)]
pub struct RandomPolicy;

impl RandomPolicy {
    pub fn new() -> Self {
        Self
    }

    pub fn pick<R: Rng + ?Sized>(
        &self,
        backends: &[Arc<BackendRecord>],
        rng: &mut R,
    ) -> Option<Arc<BackendRecord>> {
        match backends.len() {
            0 => None,
            1 => Some(backends[0].clone()),
            len => Some(backends[rng.gen_range(0..len)].clone()),
        }
    }
}
