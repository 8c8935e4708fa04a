use super::backend::{BackendRecord, InactiveReason};
use super::probe::{LivenessProbe, ProbeOutcome};
use super::registry::{BackendRegistry, BackendState};
use crate::config::HealthConfig;
use crate::error::SidecarError;
use std::sync::Arc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Drives the active/inactive state machine of every backend.
///
/// Each demotion spawns one recovery agent that owns a child of the monitor's
/// root token. The token is stored in the backend record, so a backend never
/// has two agents racing to promote it.
pub struct HealthMonitor {
    registry: Arc<BackendRegistry>,
    cfg: HealthConfig,
    prober: Arc<dyn LivenessProbe>,
    root: CancellationToken,
}

impl HealthMonitor {
    pub fn new(
        registry: Arc<BackendRegistry>,
        cfg: HealthConfig,
        prober: Arc<dyn LivenessProbe>,
    ) -> Arc<Self> {
        Arc::new(Self {
            registry,
            cfg,
            prober,
            root: CancellationToken::new(),
        })
    }

    pub fn registry(&self) -> &Arc<BackendRegistry> {
        &self.registry
    }

    pub fn config(&self) -> &HealthConfig {
        &self.cfg
    }

    /// Cancel every recovery agent. Each agent runs its final check first.
    pub fn shutdown(&self) {
        self.root.cancel();
    }

    pub fn is_overloaded(&self, remote_load: u64) -> bool {
        remote_load > self.cfg.load_threshold
    }

    pub fn rtt_exceeded(&self, rtt_ms: f64) -> bool {
        self.cfg.rtt_demotion_enabled() && rtt_ms > self.cfg.rtt_threshold_ms
    }

    /// Withdraw a backend that reported `remote_load` above the threshold and
    /// schedule its promotion once the load back-off has elapsed.
    pub fn demote_for_load(
        self: &Arc<Self>,
        service: &str,
        record: &Arc<BackendRecord>,
        remote_load: u64,
    ) -> bool {
        if !self.is_overloaded(remote_load) {
            return false;
        }
        if !self.demote(service, record, InactiveReason::Load) {
            return false;
        }
        let delay = self.registry.horizon().backoff_for(remote_load);
        let monitor = self.clone();
        let agent_service = service.to_string();
        let agent_record = record.clone();
        self.spawn_agent(service, record, move |token, generation| async move {
            monitor
                .run_load_recovery(&agent_service, &agent_record, delay, token)
                .await;
            agent_record.clear_recovery(generation);
        });
        true
    }

    /// Withdraw a backend whose RTT crossed the threshold and start probing
    /// it until it answers fast enough again.
    pub fn demote_for_rtt(self: &Arc<Self>, service: &str, record: &Arc<BackendRecord>) -> bool {
        if !self.cfg.rtt_demotion_enabled() {
            return false;
        }
        if !self.demote(service, record, InactiveReason::Rtt) {
            return false;
        }
        let monitor = self.clone();
        let agent_service = service.to_string();
        let agent_record = record.clone();
        self.spawn_agent(service, record, move |token, generation| async move {
            monitor
                .run_rtt_recovery(&agent_service, &agent_record, token)
                .await;
            agent_record.clear_recovery(generation);
        });
        true
    }

    /// Entry point of the RTT sampler: record `rtt_ms` on every backend with
    /// this address and demote those above the threshold.
    pub fn report_sample(self: &Arc<Self>, address: &str, rtt_ms: f64) {
        metrics::counter!("sidecar_rtt_samples_total").increment(1);
        for (service, record) in self.registry.all_backends() {
            if record.address() != address {
                continue;
            }
            record.record_probed_rtt(rtt_ms);
            if self.rtt_exceeded(rtt_ms)
                && self.registry.state_of(&service, address) == Some(BackendState::Active)
            {
                self.demote_for_rtt(&service, &record);
            }
        }
    }

    /// RTT of a live request through the dispatcher.
    pub fn observe_rtt(self: &Arc<Self>, service: &str, record: &Arc<BackendRecord>, rtt_ms: f64) {
        if self.rtt_exceeded(rtt_ms) {
            self.demote_for_rtt(service, record);
        }
    }

    fn demote(&self, service: &str, record: &BackendRecord, reason: InactiveReason) -> bool {
        if !self.registry.demote(service, record.address(), reason) {
            return false;
        }
        info!(
            "health: backend demoted, service={}, addr={}, reason={}",
            service,
            record.address(),
            reason.as_str()
        );
        metrics::counter!(
            "sidecar_backend_transitions_total",
            "service" => service.to_string(),
            "reason" => reason.as_str(),
            "to" => "inactive"
        )
        .increment(1);
        true
    }

    fn promote(&self, service: &str, record: &BackendRecord, reason: InactiveReason) -> bool {
        if !self.registry.promote(service, record.address()) {
            return false;
        }
        info!(
            "health: backend promoted, service={}, addr={}, reason={}",
            service,
            record.address(),
            reason.as_str()
        );
        metrics::counter!(
            "sidecar_backend_transitions_total",
            "service" => service.to_string(),
            "reason" => reason.as_str(),
            "to" => "active"
        )
        .increment(1);
        true
    }

    fn spawn_agent<F, Fut>(&self, service: &str, record: &Arc<BackendRecord>, agent: F)
    where
        F: FnOnce(CancellationToken, u64) -> Fut,
        Fut: std::future::Future<Output = ()> + Send + 'static,
    {
        let handle = match tokio::runtime::Handle::try_current() {
            Ok(h) => h,
            Err(e) => {
                // Without an agent the backend stays inactive.
                warn!(
                    "health: recovery agent not started, service={}, addr={}, error={}",
                    service,
                    record.address(),
                    e
                );
                return;
            }
        };
        let token = self.root.child_token();
        let generation = record.install_recovery(token.clone());
        handle.spawn(agent(token, generation));
    }

    async fn run_load_recovery(
        &self,
        service: &str,
        record: &BackendRecord,
        delay: std::time::Duration,
        token: CancellationToken,
    ) {
        tokio::select! {
            _ = tokio::time::sleep(delay) => {}
            _ = token.cancelled() => {
                self.final_load_check(service, record);
                return;
            }
        }

        // In-flight requests may have pushed the horizon further out.
        let reset_at = record.reset_at();
        tokio::select! {
            _ = tokio::time::sleep_until(reset_at) => {}
            _ = token.cancelled() => {
                self.final_load_check(service, record);
                return;
            }
        }

        self.promote(service, record, InactiveReason::Load);
    }

    fn final_load_check(&self, service: &str, record: &BackendRecord) {
        let still_load = self.registry.state_of(service, record.address())
            == Some(BackendState::Inactive(InactiveReason::Load));
        if still_load && Instant::now() >= record.reset_at() {
            self.promote(service, record, InactiveReason::Load);
        } else {
            debug!(
                "health: load recovery cancelled, service={}, addr={}",
                service,
                record.address()
            );
        }
    }

    async fn run_rtt_recovery(&self, service: &str, record: &BackendRecord, token: CancellationToken) {
        let threshold = self.cfg.rtt_threshold_ms;
        loop {
            tokio::select! {
                _ = tokio::time::sleep(self.cfg.probe_interval()) => {}
                _ = token.cancelled() => {
                    self.final_rtt_check(service, record);
                    return;
                }
            }

            match self.probe_round(record.address()).await {
                Ok(Some(rtt_ms)) => {
                    record.record_probed_rtt(rtt_ms);
                    if rtt_ms <= threshold {
                        self.promote(service, record, InactiveReason::Rtt);
                        return;
                    }
                    debug!(
                        "health: probe still slow, service={}, addr={}, rtt_ms={:.3}",
                        service,
                        record.address(),
                        rtt_ms
                    );
                }
                Ok(None) => {
                    debug!(
                        "health: probe unreachable, service={}, addr={}",
                        service,
                        record.address()
                    );
                }
                Err(e) => {
                    warn!(
                        "health: rtt recovery aborted, backend stays inactive, service={}, addr={}, error={}",
                        service,
                        record.address(),
                        e
                    );
                    return;
                }
            }
        }
    }

    fn final_rtt_check(&self, service: &str, record: &BackendRecord) {
        match record.latest_probed_rtt() {
            Some(rtt_ms) if rtt_ms <= self.cfg.rtt_threshold_ms => {
                self.promote(service, record, InactiveReason::Rtt);
            }
            _ => debug!(
                "health: rtt recovery cancelled, service={}, addr={}",
                service,
                record.address()
            ),
        }
    }

    /// Fastest of `probe_count` probes in milliseconds, `None` when none of
    /// them got through.
    async fn probe_round(&self, address: &str) -> Result<Option<f64>, SidecarError> {
        let mut best: Option<f64> = None;
        for _ in 0..self.cfg.probe_count {
            if let ProbeOutcome::Rtt(rtt) = self
                .prober
                .probe(address, self.cfg.probe_timeout())
                .await?
            {
                let ms = rtt.as_secs_f64() * 1000.0;
                best = Some(best.map_or(ms, |b| b.min(ms)));
            }
        }
        Ok(best)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::upstream::backend::LoadHorizon;
    use futures_util::future::BoxFuture;
    use std::collections::VecDeque;
    use std::sync::Mutex;
    use std::time::Duration;

    enum Step {
        Rtt(u64),
        Unreachable,
        Broken,
    }

    /// Replays a fixed sequence of outcomes, then reports unreachable.
    struct ScriptedProbe {
        steps: Mutex<VecDeque<Step>>,
    }

    impl ScriptedProbe {
        fn new(steps: Vec<Step>) -> Arc<Self> {
            Arc::new(Self {
                steps: Mutex::new(steps.into()),
            })
        }
    }

    impl LivenessProbe for ScriptedProbe {
        fn probe<'a>(
            &'a self,
            _address: &'a str,
            _timeout: Duration,
        ) -> BoxFuture<'a, Result<ProbeOutcome, SidecarError>> {
            let step = self.steps.lock().unwrap().pop_front();
            Box::pin(async move {
                match step {
                    Some(Step::Rtt(ms)) => Ok(ProbeOutcome::Rtt(Duration::from_millis(ms))),
                    Some(Step::Broken) => Err(SidecarError::ProbeSetup("broken".into())),
                    Some(Step::Unreachable) | None => Ok(ProbeOutcome::Unreachable),
                }
            })
        }
    }

    fn setup(
        cfg: HealthConfig,
        probe: Arc<dyn LivenessProbe>,
    ) -> (Arc<HealthMonitor>, Arc<BackendRecord>) {
        let registry = Arc::new(BackendRegistry::new(LoadHorizon {
            threshold: cfg.load_threshold,
            unit: cfg.load_unit_delay(),
        }));
        registry.reconcile("svc", &["10.0.0.1".to_string(), "10.0.0.2".to_string()]);
        let record = registry.get("svc", "10.0.0.1").unwrap();
        (HealthMonitor::new(registry, cfg, probe), record)
    }

    fn rtt_cfg() -> HealthConfig {
        HealthConfig {
            rtt_threshold_ms: 10.0,
            probe_count: 1,
            ..HealthConfig::default()
        }
    }

    fn state(monitor: &HealthMonitor) -> Option<BackendState> {
        monitor.registry().state_of("svc", "10.0.0.1")
    }

    #[tokio::test(start_paused = true)]
    async fn test_load_demotion_recovers_after_backoff() {
        let (monitor, record) = setup(HealthConfig::default(), ScriptedProbe::new(vec![]));
        // threshold 2 + 5 -> 5 * 50ms
        monitor.registry().apply_feedback(&record, 0, 7, 1.0);
        assert!(monitor.demote_for_load("svc", &record, 7));
        assert_eq!(
            state(&monitor),
            Some(BackendState::Inactive(InactiveReason::Load))
        );
        assert!(record.has_recovery_agent());

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(
            state(&monitor),
            Some(BackendState::Inactive(InactiveReason::Load))
        );

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(state(&monitor), Some(BackendState::Active));
        assert!(!record.has_recovery_agent());
    }

    #[tokio::test(start_paused = true)]
    async fn test_load_recovery_honors_later_reset_horizon() {
        let (monitor, record) = setup(HealthConfig::default(), ScriptedProbe::new(vec![]));
        monitor.registry().apply_feedback(&record, 0, 3, 1.0);
        assert!(monitor.demote_for_load("svc", &record, 3));
        // A later response pushes the horizon out to 500ms.
        record.backoff(Duration::from_millis(500));

        tokio::time::sleep(Duration::from_millis(400)).await;
        assert_ne!(state(&monitor), Some(BackendState::Active));
        tokio::time::sleep(Duration::from_millis(150)).await;
        assert_eq!(state(&monitor), Some(BackendState::Active));
    }

    #[tokio::test(start_paused = true)]
    async fn test_load_demotion_is_idempotent() {
        let (monitor, record) = setup(HealthConfig::default(), ScriptedProbe::new(vec![]));
        assert!(monitor.demote_for_load("svc", &record, 5));
        assert!(!monitor.demote_for_load("svc", &record, 9));
        assert!(!monitor.demote_for_rtt("svc", &record));
        assert_eq!(
            state(&monitor),
            Some(BackendState::Inactive(InactiveReason::Load))
        );
    }

    #[tokio::test]
    async fn test_load_within_threshold_is_ignored() {
        let (monitor, record) = setup(HealthConfig::default(), ScriptedProbe::new(vec![]));
        assert!(!monitor.demote_for_load("svc", &record, 2));
        assert_eq!(state(&monitor), Some(BackendState::Active));
    }

    #[tokio::test(start_paused = true)]
    async fn test_rtt_recovery_promotes_on_fast_probe() {
        let probe = ScriptedProbe::new(vec![
            Step::Rtt(50),
            Step::Unreachable,
            Step::Rtt(30),
            Step::Rtt(5),
        ]);
        let (monitor, record) = setup(rtt_cfg(), probe);
        monitor.report_sample("10.0.0.1", 40.0);
        assert_eq!(
            state(&monitor),
            Some(BackendState::Inactive(InactiveReason::Rtt))
        );

        // Three slow or failed rounds at 200ms each.
        tokio::time::sleep(Duration::from_millis(700)).await;
        assert_ne!(state(&monitor), Some(BackendState::Active));
        assert_eq!(record.latest_probed_rtt(), Some(30.0));

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(state(&monitor), Some(BackendState::Active));
        assert_eq!(record.latest_probed_rtt(), Some(5.0));
    }

    #[tokio::test(start_paused = true)]
    async fn test_rtt_recovery_gives_up_on_broken_prober() {
        let (monitor, record) = setup(rtt_cfg(), ScriptedProbe::new(vec![Step::Broken]));
        assert!(monitor.demote_for_rtt("svc", &record));

        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(
            state(&monitor),
            Some(BackendState::Inactive(InactiveReason::Rtt))
        );
        assert!(!record.has_recovery_agent());
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_runs_final_rtt_check() {
        let (monitor, record) = setup(rtt_cfg(), ScriptedProbe::new(vec![]));
        assert!(monitor.demote_for_rtt("svc", &record));
        record.record_probed_rtt(3.0);

        monitor.shutdown();
        tokio::time::sleep(Duration::from_millis(1)).await;
        assert_eq!(state(&monitor), Some(BackendState::Active));
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_keeps_slow_backend_inactive() {
        let (monitor, record) = setup(rtt_cfg(), ScriptedProbe::new(vec![]));
        record.record_probed_rtt(80.0);
        assert!(monitor.demote_for_rtt("svc", &record));

        monitor.shutdown();
        tokio::time::sleep(Duration::from_millis(1)).await;
        assert_eq!(
            state(&monitor),
            Some(BackendState::Inactive(InactiveReason::Rtt))
        );
    }

    #[tokio::test]
    async fn test_rtt_demotion_disabled_by_default() {
        let (monitor, record) = setup(HealthConfig::default(), ScriptedProbe::new(vec![]));
        monitor.report_sample("10.0.0.1", 10_000.0);
        monitor.observe_rtt("svc", &record, 10_000.0);
        assert_eq!(state(&monitor), Some(BackendState::Active));
        assert_eq!(record.latest_probed_rtt(), Some(10_000.0));
    }

    #[test]
    fn test_demotion_without_runtime_stays_inactive() {
        let (monitor, record) = setup(HealthConfig::default(), ScriptedProbe::new(vec![]));
        assert!(monitor.demote_for_load("svc", &record, 10));
        assert!(!record.has_recovery_agent());
        assert_eq!(
            state(&monitor),
            Some(BackendState::Inactive(InactiveReason::Load))
        );
    }
}
