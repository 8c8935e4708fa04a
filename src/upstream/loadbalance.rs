pub mod credit;
pub mod least_conn;
pub mod netflix;
pub mod random;

use crate::config::PolicyKind;
use crate::error::SidecarError;
use crate::upstream::backend::{BackendRecord, Claim};
use crate::upstream::registry::BackendRegistry;
use credit::CreditAwarePolicy;
use least_conn::LeastConnPolicy;
use netflix::LoadScoredPolicy;
use rand::Rng;
use random::RandomPolicy;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

/// Resampling budget per active backend before falling back to a scan.
const RESAMPLE_FACTOR: usize = 4;

/// P2C rounds tried when concurrent callers keep winning the claim.
const CLAIM_ROUNDS: usize = 4;

/// Uniformly sample a backend accepted by `eligible`.
///
/// Tries `RESAMPLE_FACTOR * len` random draws, then picks uniformly among
/// whatever is eligible right now. `None` when nothing is.
pub(crate) fn sample_eligible<'a, R, F>(
    backends: &'a [Arc<BackendRecord>],
    rng: &mut R,
    eligible: F,
) -> Option<&'a Arc<BackendRecord>>
where
    R: Rng + ?Sized,
    F: Fn(&BackendRecord) -> bool,
{
    let len = backends.len();
    if len == 0 {
        return None;
    }
    for _ in 0..len * RESAMPLE_FACTOR {
        let candidate = &backends[rng.gen_range(0..len)];
        if eligible(candidate) {
            return Some(candidate);
        }
    }
    let pool: Vec<&Arc<BackendRecord>> = backends.iter().filter(|b| eligible(b)).collect();
    match pool.len() {
        0 => None,
        n => Some(pool[rng.gen_range(0..n)]),
    }
}

/// Power-of-two choice where the winner must also be claimed.
///
/// `eligible` filters the samples, `prefers_first` decides between them and
/// `claim` re-checks eligibility atomically on the chosen record. When the
/// preferred sample loses its claim to a concurrent caller the other sample
/// is tried, then both are drawn again.
pub(crate) fn pick_claimed<R, E, P, C>(
    backends: &[Arc<BackendRecord>],
    rng: &mut R,
    eligible: E,
    prefers_first: P,
    claim: C,
) -> Option<Arc<BackendRecord>>
where
    R: Rng + ?Sized,
    E: Fn(&BackendRecord) -> bool,
    P: Fn(&BackendRecord, &BackendRecord) -> bool,
    C: Fn(&BackendRecord) -> Claim,
{
    for _ in 0..CLAIM_ROUNDS {
        let first = sample_eligible(backends, rng, &eligible)?;
        let second = sample_eligible(backends, rng, &eligible)?;
        let (chosen, other) = if prefers_first(first, second) {
            (first, second)
        } else {
            (second, first)
        };
        for candidate in [chosen, other] {
            match claim(candidate) {
                Claim::Granted => return Some(candidate.clone()),
                Claim::Probe => {
                    tracing::debug!("balancer: probe granted, addr={}", candidate.address());
                    return Some(candidate.clone());
                }
                Claim::Denied => {}
            }
        }
    }
    None
}

pub enum LoadBalancer {
    Random(RandomPolicy),
    LeastConn(LeastConnPolicy),
    MLeastConn(CreditAwarePolicy),
    Netflix(LoadScoredPolicy),
}

impl LoadBalancer {
    /// `capacity` is the operator-fixed capacity used by the load-scored
    /// policy; `0` when unknown.
    pub fn new(kind: PolicyKind, reset_interval: Duration, capacity: i64) -> Self {
        match kind {
            PolicyKind::Random => Self::Random(RandomPolicy::new()),
            PolicyKind::LeastConn => Self::LeastConn(LeastConnPolicy::new()),
            PolicyKind::MLeastConn => Self::MLeastConn(CreditAwarePolicy::new(reset_interval)),
            PolicyKind::Netflix => {
                Self::Netflix(LoadScoredPolicy::new(capacity, reset_interval))
            }
        }
    }

    pub fn kind(&self) -> PolicyKind {
        match self {
            Self::Random(_) => PolicyKind::Random,
            Self::LeastConn(_) => PolicyKind::LeastConn,
            Self::MLeastConn(_) => PolicyKind::MLeastConn,
            Self::Netflix(_) => PolicyKind::Netflix,
        }
    }

    /// Pick a backend from the active set of `service`.
    pub fn select(
        &self,
        registry: &BackendRegistry,
        service: &str,
    ) -> Result<Arc<BackendRecord>, SidecarError> {
        let backends = registry.active_backends(service)?;
        let mut rng = rand::thread_rng();
        self.pick(&backends, Instant::now(), &mut rng)
            .ok_or_else(|| SidecarError::NoBackends {
                service: service.to_string(),
            })
    }

    pub fn pick<R: Rng + ?Sized>(
        &self,
        backends: &[Arc<BackendRecord>],
        now: Instant,
        rng: &mut R,
    ) -> Option<Arc<BackendRecord>> {
        match self {
            Self::Random(p) => p.pick(backends, rng),
            Self::LeastConn(p) => p.pick(backends, rng),
            Self::MLeastConn(p) => p.pick(backends, now, rng),
            Self::Netflix(p) => p.pick(backends, now, rng),
        }
    }
}
