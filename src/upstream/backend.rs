use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// Why a backend was withdrawn from rotation. Decides which recovery agent runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum InactiveReason {
    Load,
    Rtt,
}

impl InactiveReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            InactiveReason::Load => "load",
            InactiveReason::Rtt => "rtt",
        }
    }
}

/// How far a reported overload pushes a backend's reset horizon:
/// `max(0, remote_load - threshold) * unit`.
#[derive(Debug, Clone, Copy)]
pub struct LoadHorizon {
    pub threshold: u64,
    pub unit: Duration,
}

impl LoadHorizon {
    pub fn backoff_for(&self, remote_load: u64) -> Duration {
        let excess = remote_load.saturating_sub(self.threshold);
        self.unit
            .saturating_mul(u32::try_from(excess).unwrap_or(u32::MAX))
    }
}

/// Outcome of trying to route one request to a backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Claim {
    Granted,
    /// Past its reset horizon; this caller holds the single fresh attempt.
    Probe,
    Denied,
}

/// Mutable per-backend signals, guarded by the record's lock.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BackendStats {
    pub credits: u64,
    pub remote_load: u64,
    pub last_rtt_ms: f64,
    pub weighted_avg_rtt_ms: f64,
    pub reset_at: Instant,
    pub latest_probed_rtt_ms: Option<f64>,
}

/// One backend of one service.
///
/// `in_flight` is a bare atomic so P2C comparisons never take a lock; every
/// other field lives behind `stats`. The record also owns the cancellation
/// token of its recovery agent, so at most one agent exists per backend.
#[derive(Debug)]
pub struct BackendRecord {
    address: Arc<str>,
    in_flight: AtomicI64,
    stats: Mutex<BackendStats>,
    recovery: Mutex<Option<(u64, CancellationToken)>>,
    recovery_generation: AtomicU64,
}

impl BackendRecord {
    pub fn new(address: &str) -> Self {
        Self {
            address: Arc::from(address),
            in_flight: AtomicI64::new(0),
            stats: Mutex::new(BackendStats {
                credits: 1,
                remote_load: 0,
                last_rtt_ms: 0.0,
                weighted_avg_rtt_ms: 0.0,
                reset_at: Instant::now(),
                latest_probed_rtt_ms: None,
            }),
            recovery: Mutex::new(None),
            recovery_generation: AtomicU64::new(0),
        }
    }

    #[inline]
    pub fn address(&self) -> &str {
        &self.address
    }

    #[inline]
    pub fn in_flight(&self) -> i64 {
        self.in_flight.load(Ordering::Relaxed)
    }

    pub fn inc_in_flight(&self) {
        self.in_flight.fetch_add(1, Ordering::Relaxed);
    }

    pub fn dec_in_flight(&self) {
        let prev = self.in_flight.fetch_sub(1, Ordering::Relaxed);
        if prev <= 0 {
            tracing::warn!(
                "backend: in-flight counter went negative, addr={}, value={}",
                self.address,
                prev - 1
            );
        }
    }

    fn stats(&self) -> MutexGuard<'_, BackendStats> {
        self.stats.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn snapshot(&self) -> BackendStats {
        *self.stats()
    }

    pub fn credits(&self) -> u64 {
        self.stats().credits
    }

    pub fn remote_load(&self) -> u64 {
        self.stats().remote_load
    }

    pub fn reset_at(&self) -> Instant {
        self.stats().reset_at
    }

    /// Start one request: bumps in-flight and spends a credit. The returned
    /// guard gives the in-flight slot back when dropped, on every exit path.
    pub fn dispatch(self: &Arc<Self>) -> InFlightGuard {
        self.inc_in_flight();
        {
            let mut stats = self.stats();
            stats.credits = stats.credits.saturating_sub(1);
        }
        InFlightGuard {
            backend: self.clone(),
        }
    }

    /// Fold the feedback of one response into the record.
    pub fn apply_feedback(
        &self,
        credits_granted: u64,
        remote_load: u64,
        rtt_ms: f64,
        horizon: &LoadHorizon,
    ) {
        let now = Instant::now();
        let mut stats = self.stats();
        stats.credits = stats.credits.saturating_add(credits_granted);
        stats.remote_load = remote_load;
        stats.last_rtt_ms = rtt_ms;
        stats.weighted_avg_rtt_ms = stats.weighted_avg_rtt_ms * 0.5 + rtt_ms * 0.5;
        stats.reset_at = now + horizon.backoff_for(remote_load);
    }

    /// The backend said "too many requests": drop all credits and keep it
    /// out of credit-aware rotation for another `reset_interval`.
    pub fn backoff(&self, reset_interval: Duration) {
        let mut stats = self.stats();
        stats.credits = 0;
        stats.reset_at = Instant::now() + reset_interval;
    }

    /// `false` while the backend has no credits and its reset horizon is
    /// still in the future.
    pub fn has_credit_or_expired(&self, now: Instant) -> bool {
        let stats = self.stats();
        stats.credits > 0 || now >= stats.reset_at
    }

    /// Check credit eligibility and spend the re-validation attempt in one
    /// step under the stats lock. A creditless backend past its horizon is
    /// handed out as a probe exactly once per `reset_interval`.
    pub fn try_claim_credit(&self, now: Instant, reset_interval: Duration) -> Claim {
        let mut stats = self.stats();
        if stats.credits > 0 {
            return Claim::Granted;
        }
        if now >= stats.reset_at {
            stats.reset_at = now + reset_interval;
            return Claim::Probe;
        }
        Claim::Denied
    }

    /// Like [`try_claim_credit`](Self::try_claim_credit) but keyed on remote
    /// load: a backend at or above `load_mark` only gets the probe.
    pub fn try_claim_load(&self, now: Instant, load_mark: f64, reset_interval: Duration) -> Claim {
        let mut stats = self.stats();
        if (stats.remote_load as f64) < load_mark {
            return Claim::Granted;
        }
        if now >= stats.reset_at {
            stats.reset_at = now + reset_interval;
            return Claim::Probe;
        }
        Claim::Denied
    }

    pub fn record_probed_rtt(&self, rtt_ms: f64) {
        self.stats().latest_probed_rtt_ms = Some(rtt_ms);
    }

    pub fn latest_probed_rtt(&self) -> Option<f64> {
        self.stats().latest_probed_rtt_ms
    }

    // ---- Recovery agent ownership ----

    /// Store the token of a freshly spawned recovery agent, cancelling the
    /// agent it replaces. Returns the agent's generation.
    pub fn install_recovery(&self, token: CancellationToken) -> u64 {
        let generation = self.recovery_generation.fetch_add(1, Ordering::Relaxed) + 1;
        let mut slot = self.recovery.lock().unwrap_or_else(|e| e.into_inner());
        if let Some((_, previous)) = slot.replace((generation, token)) {
            previous.cancel();
        }
        generation
    }

    /// Forget the agent token if `generation` is still the current agent.
    pub fn clear_recovery(&self, generation: u64) {
        let mut slot = self.recovery.lock().unwrap_or_else(|e| e.into_inner());
        if slot.as_ref().is_some_and(|(g, _)| *g == generation) {
            *slot = None;
        }
    }

    pub fn cancel_recovery(&self) {
        let mut slot = self.recovery.lock().unwrap_or_else(|e| e.into_inner());
        if let Some((_, token)) = slot.take() {
            token.cancel();
        }
    }

    pub fn has_recovery_agent(&self) -> bool {
        self.recovery
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .is_some()
    }
}

/// RAII guard: gives the in-flight slot back on drop.
#[derive(Debug)]
pub struct InFlightGuard {
    backend: Arc<BackendRecord>,
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.backend.dec_in_flight();
    }
}
