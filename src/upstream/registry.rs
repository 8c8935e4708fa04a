use super::backend::{BackendRecord, InactiveReason, LoadHorizon};
use crate::error::SidecarError;
use arc_swap::ArcSwap;
use dashmap::DashMap;
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};

/// Membership of one backend inside its service. A backend has exactly one
/// entry, so it can never be both active and inactive.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendState {
    Active,
    Inactive(InactiveReason),
}

impl BackendState {
    pub fn as_str(&self) -> &'static str {
        match self {
            BackendState::Active => "active",
            BackendState::Inactive(InactiveReason::Load) => "inactive_load",
            BackendState::Inactive(InactiveReason::Rtt) => "inactive_rtt",
        }
    }
}

#[derive(Debug, Default)]
struct ServiceState {
    /// Discovery order, used for stable snapshots.
    order: Vec<Arc<BackendRecord>>,
    membership: HashMap<Arc<str>, BackendState>,
}

impl ServiceState {
    fn active_list(&self) -> Vec<Arc<BackendRecord>> {
        self.order
            .iter()
            .filter(|b| self.membership.get(b.address()) == Some(&BackendState::Active))
            .cloned()
            .collect()
    }
}

/// One service: structural state behind a lock plus a lock-free copy of the
/// active list, republished after every structural change.
#[derive(Debug)]
struct ServiceEntry {
    state: Mutex<ServiceState>,
    active: ArcSwap<Vec<Arc<BackendRecord>>>,
}

impl ServiceEntry {
    fn new() -> Self {
        Self {
            state: Mutex::new(ServiceState::default()),
            active: ArcSwap::from_pointee(Vec::new()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, ServiceState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn publish(&self, state: &ServiceState) {
        self.active.store(Arc::new(state.active_list()));
    }
}

/// Result of one `reconcile` call.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReconcileSummary {
    pub added: usize,
    pub removed: usize,
    pub total: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct BackendView {
    pub address: String,
    pub state: &'static str,
    pub in_flight: i64,
    pub credits: u64,
    pub remote_load: u64,
    pub last_rtt_ms: f64,
    pub weighted_avg_rtt_ms: f64,
    pub latest_probed_rtt_ms: Option<f64>,
    pub recovering: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct ServiceView {
    pub service: String,
    pub active: usize,
    pub inactive: usize,
    pub backends: Vec<BackendView>,
}

/// Per-service backend collections, shared by the dispatcher, the health
/// monitor and discovery.
///
/// Lock order: a service lock may be taken alone, a record lock may be taken
/// alone, but no record lock is ever held while a service lock is acquired.
pub struct BackendRegistry {
    services: DashMap<String, Arc<ServiceEntry>>,
    horizon: LoadHorizon,
}

impl BackendRegistry {
    pub fn new(horizon: LoadHorizon) -> Self {
        Self {
            services: DashMap::new(),
            horizon,
        }
    }

    pub fn horizon(&self) -> LoadHorizon {
        self.horizon
    }

    fn entry(&self, service: &str) -> Option<Arc<ServiceEntry>> {
        self.services.get(service).map(|e| e.value().clone())
    }

    /// Register `service` with an empty backend list if it is not known yet.
    /// Returns `true` when the service was newly added.
    fn ensure_service(&self, service: &str) -> bool {
        if self.services.contains_key(service) {
            return false;
        }
        let mut inserted = false;
        self.services.entry(service.to_string()).or_insert_with(|| {
            inserted = true;
            Arc::new(ServiceEntry::new())
        });
        inserted
    }

    pub fn contains_service(&self, service: &str) -> bool {
        self.services.contains_key(service)
    }

    pub fn service_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.services.iter().map(|e| e.key().clone()).collect();
        names.sort();
        names
    }

    pub fn service_count(&self) -> usize {
        self.services.len()
    }

    /// Replace the backend list of `service` with `addresses`.
    ///
    /// Records for addresses that remain keep their identity and counters,
    /// new addresses start active with one credit, and records for vanished
    /// addresses are dropped after their recovery agents are cancelled.
    pub fn reconcile(&self, service: &str, addresses: &[String]) -> ReconcileSummary {
        self.ensure_service(service);
        let Some(entry) = self.entry(service) else {
            return ReconcileSummary::default();
        };

        let mut removed = Vec::new();
        let summary = {
            let mut state = entry.lock();
            let mut seen: HashSet<&str> = HashSet::with_capacity(addresses.len());
            let mut existing: HashMap<Arc<str>, Arc<BackendRecord>> = state
                .order
                .drain(..)
                .map(|b| (Arc::from(b.address()), b))
                .collect();

            let mut order = Vec::with_capacity(addresses.len());
            let mut added = 0;
            for addr in addresses {
                let addr = addr.trim();
                if addr.is_empty() || !seen.insert(addr) {
                    continue;
                }
                match existing.remove(addr) {
                    Some(record) => order.push(record),
                    None => {
                        let record = Arc::new(BackendRecord::new(addr));
                        state
                            .membership
                            .insert(Arc::from(addr), BackendState::Active);
                        order.push(record);
                        added += 1;
                    }
                }
            }

            for (addr, record) in existing {
                state.membership.remove(&addr);
                removed.push(record);
            }
            state.order = order;
            entry.publish(&state);

            ReconcileSummary {
                added,
                removed: removed.len(),
                total: state.order.len(),
            }
        };

        for record in &removed {
            record.cancel_recovery();
        }

        if summary.added > 0 || summary.removed > 0 {
            tracing::info!(
                "registry: service reconciled, service={}, added={}, removed={}, total={}",
                service,
                summary.added,
                summary.removed,
                summary.total
            );
        }
        metrics::gauge!("sidecar_discovered_backends", "service" => service.to_string())
            .set(summary.total as f64);
        summary
    }

    /// Consistent snapshot of the active backends of `service`, in discovery
    /// order. Fails when the service is unknown or has no active backend.
    pub fn active_backends(
        &self,
        service: &str,
    ) -> Result<Arc<Vec<Arc<BackendRecord>>>, SidecarError> {
        let no_backends = || SidecarError::NoBackends {
            service: service.to_string(),
        };
        let entry = self.entry(service).ok_or_else(no_backends)?;
        let active = entry.active.load_full();
        if active.is_empty() {
            return Err(no_backends());
        }
        Ok(active)
    }

    /// Every backend of `service`, active or not.
    pub fn backends(&self, service: &str) -> Vec<Arc<BackendRecord>> {
        self.entry(service)
            .map(|e| e.lock().order.clone())
            .unwrap_or_default()
    }

    /// Every `(service, backend)` pair in the registry.
    pub fn all_backends(&self) -> Vec<(String, Arc<BackendRecord>)> {
        let entries: Vec<(String, Arc<ServiceEntry>)> = self
            .services
            .iter()
            .map(|e| (e.key().clone(), e.value().clone()))
            .collect();
        let mut out = Vec::new();
        for (service, entry) in entries {
            let order = entry.lock().order.clone();
            out.extend(order.into_iter().map(|b| (service.clone(), b)));
        }
        out
    }

    pub fn get(&self, service: &str, address: &str) -> Option<Arc<BackendRecord>> {
        let entry = self.entry(service)?;
        let state = entry.lock();
        state.order.iter().find(|b| b.address() == address).cloned()
    }

    pub fn state_of(&self, service: &str, address: &str) -> Option<BackendState> {
        let entry = self.entry(service)?;
        let state = entry.lock();
        state.membership.get(address).copied()
    }

    /// Move a backend to the inactive set. Returns `false` (and changes
    /// nothing) when the backend is unknown or already inactive.
    pub fn demote(&self, service: &str, address: &str, reason: InactiveReason) -> bool {
        let Some(entry) = self.entry(service) else {
            return false;
        };
        let mut state = entry.lock();
        match state.membership.get_mut(address) {
            Some(slot) if *slot == BackendState::Active => {
                *slot = BackendState::Inactive(reason);
                entry.publish(&state);
                true
            }
            _ => false,
        }
    }

    /// Move a backend back to the active set. Returns `false` when the backend
    /// is unknown or already active.
    pub fn promote(&self, service: &str, address: &str) -> bool {
        let Some(entry) = self.entry(service) else {
            return false;
        };
        let mut state = entry.lock();
        match state.membership.get_mut(address) {
            Some(slot) if *slot != BackendState::Active => {
                *slot = BackendState::Active;
                entry.publish(&state);
                true
            }
            _ => false,
        }
    }

    /// Fold response feedback into `record` using the registry's load horizon.
    pub fn apply_feedback(
        &self,
        record: &BackendRecord,
        credits_granted: u64,
        remote_load: u64,
        rtt_ms: f64,
    ) {
        record.apply_feedback(credits_granted, remote_load, rtt_ms, &self.horizon);
    }

    pub fn snapshot(&self) -> Vec<ServiceView> {
        let mut views = Vec::new();
        for name in self.service_names() {
            let Some(entry) = self.entry(&name) else {
                continue;
            };
            let (order, membership) = {
                let state = entry.lock();
                (state.order.clone(), state.membership.clone())
            };

            let backends: Vec<BackendView> = order
                .iter()
                .map(|b| {
                    let stats = b.snapshot();
                    let state = membership
                        .get(b.address())
                        .copied()
                        .unwrap_or(BackendState::Active);
                    BackendView {
                        address: b.address().to_string(),
                        state: state.as_str(),
                        in_flight: b.in_flight(),
                        credits: stats.credits,
                        remote_load: stats.remote_load,
                        last_rtt_ms: stats.last_rtt_ms,
                        weighted_avg_rtt_ms: stats.weighted_avg_rtt_ms,
                        latest_probed_rtt_ms: stats.latest_probed_rtt_ms,
                        recovering: b.has_recovery_agent(),
                    }
                })
                .collect();
            let active = backends.iter().filter(|b| b.state == "active").count();
            views.push(ServiceView {
                service: name,
                active,
                inactive: backends.len() - active,
                backends,
            });
        }
        views
    }
}
