use crate::admission::AdmissionController;
use crate::config::SidecarConfig;
use crate::discovery::WatcherClient;
use crate::metrics::Metrics;
use crate::proxy::context::build_http_client;
use crate::proxy::{DispatchSettings, Dispatcher, InboundProxy};
use crate::upstream::{
    BackendRegistry, HealthMonitor, LivenessProbe, LoadBalancer, LoadHorizon, TcpConnectProbe,
};
use anyhow::Result;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// Shared sidecar state, cheaply cloneable.
///
/// Everything is built once here and injected into the listeners and the
/// background loops; nothing is reachable through globals.
#[derive(Clone)]
pub struct SidecarState {
    pub config: Arc<SidecarConfig>,
    /// `None` when no recorder was installed (tests).
    pub metrics: Option<Metrics>,
    pub registry: Arc<BackendRegistry>,
    pub health: Arc<HealthMonitor>,
    pub admission: Arc<AdmissionController>,
    pub inbound: Arc<InboundProxy>,
    pub dispatcher: Arc<Dispatcher>,
    pub watcher: Option<WatcherClient>,
}

impl SidecarState {
    pub fn new(config: SidecarConfig, metrics: Option<Metrics>) -> Result<Self> {
        let prober = Arc::new(TcpConnectProbe::new(config.health.probe_port));
        Self::with_prober(config, metrics, prober)
    }

    /// Like `new`, with a custom liveness prober for recovery agents.
    pub fn with_prober(
        config: SidecarConfig,
        metrics: Option<Metrics>,
        prober: Arc<dyn LivenessProbe>,
    ) -> Result<Self> {
        let registry = Arc::new(BackendRegistry::new(LoadHorizon {
            threshold: config.health.load_threshold,
            unit: config.health.load_unit_delay(),
        }));
        let health = HealthMonitor::new(registry.clone(), config.health.clone(), prober);

        let admission = Arc::new(AdmissionController::new(&config.admission));
        metrics::gauge!("sidecar_admission_capacity").set(admission.capacity() as f64);

        let client = build_http_client(CONNECT_TIMEOUT);
        let inbound = Arc::new(InboundProxy::new(
            &config.app,
            admission.clone(),
            client.clone(),
        )?);

        let watcher = match config.discovery.watcher.as_deref() {
            Some(addr) => {
                let w = WatcherClient::new(addr)?;
                info!("discovery: endpoint watcher configured, url={}", w.base_url());
                Some(w)
            }
            None => {
                info!("discovery: no endpoint watcher, static endpoints only");
                None
            }
        };

        let balancer = LoadBalancer::new(
            config.balancer.policy,
            config.balancer.reset_interval(),
            config.admission.capacity,
        );
        let dispatcher = Arc::new(Dispatcher::new(
            health.clone(),
            balancer,
            client,
            DispatchSettings {
                retries: config.balancer.retries,
                reset_interval: config.balancer.reset_interval(),
                timeout: config.balancer.request_timeout(),
            },
            watcher.clone(),
        ));

        Ok(Self {
            config: Arc::new(config),
            metrics,
            registry,
            health,
            admission,
            inbound,
            dispatcher,
            watcher,
        })
    }

    /// Reconcile the statically configured service, if any.
    pub fn seed_static_endpoints(&self) {
        let discovery = &self.config.discovery;
        let Some(ref service) = discovery.service else {
            return;
        };
        let summary = self.registry.reconcile(service, &discovery.endpoints);
        info!(
            "discovery: static endpoints seeded, service={}, backends={}",
            service, summary.total
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::upstream::BackendState;

    #[test]
    fn test_state_from_defaults() {
        let state = SidecarState::new(SidecarConfig::default(), None).unwrap();
        assert!(state.watcher.is_none());
        assert_eq!(state.registry.service_count(), 0);
        assert_eq!(state.admission.capacity(), 0);
        assert_eq!(state.dispatcher.balancer().kind(), state.config.balancer.policy);
    }

    #[test]
    fn test_seed_static_endpoints() {
        let mut cfg = SidecarConfig::default();
        cfg.discovery.service = Some("cart".to_string());
        cfg.discovery.endpoints = vec!["10.0.0.1".to_string(), "10.0.0.2".to_string()];
        let state = SidecarState::new(cfg, None).unwrap();
        state.seed_static_endpoints();

        assert_eq!(state.registry.backends("cart").len(), 2);
        assert_eq!(
            state.registry.state_of("cart", "10.0.0.2"),
            Some(BackendState::Active)
        );
    }

    #[test]
    fn test_watcher_built_from_config() {
        let mut cfg = SidecarConfig::default();
        cfg.discovery.watcher = Some("epwatcher:62000".to_string());
        let state = SidecarState::new(cfg, None).unwrap();
        assert_eq!(
            state.watcher.as_ref().map(|w| w.base_url()),
            Some("http://epwatcher:62000")
        );
    }
}
