pub mod client;

pub use client::{Endpoints, WatcherClient};

use crate::error::SidecarError;
use crate::upstream::registry::ReconcileSummary;
use crate::upstream::BackendRegistry;
use std::time::Instant;

async fn fetch(watcher: &WatcherClient, service: &str) -> Result<Endpoints, SidecarError> {
    let start = Instant::now();
    let result = watcher.fetch(service).await;
    let outcome = if result.is_ok() { "success" } else { "error" };
    metrics::counter!(
        "sidecar_discovery_poll_total",
        "service" => service.to_string(),
        "result" => outcome,
    )
    .increment(1);

    let endpoints = result?;
    tracing::debug!(
        "discovery: resolved, service={}, addresses={}, duration={:.3}s",
        service,
        endpoints.addresses.len(),
        start.elapsed().as_secs_f64()
    );
    Ok(endpoints)
}

/// One resolve of `service` through the endpoint watcher, reconciled into the
/// registry.
pub async fn sync_service(
    watcher: &WatcherClient,
    registry: &BackendRegistry,
    service: &str,
) -> Result<ReconcileSummary, SidecarError> {
    let endpoints = fetch(watcher, service).await?;
    Ok(registry.reconcile(service, &endpoints.addresses))
}

/// Resolve a service the registry does not know yet. It is registered only
/// when the watcher returns at least one address, so unknown hosts leave
/// nothing behind for the poll loop. `None` means nothing was registered.
pub async fn resolve_new(
    watcher: &WatcherClient,
    registry: &BackendRegistry,
    service: &str,
) -> Result<Option<ReconcileSummary>, SidecarError> {
    let endpoints = fetch(watcher, service).await?;
    if endpoints.addresses.iter().all(|a| a.trim().is_empty()) {
        return Ok(None);
    }
    Ok(Some(registry.reconcile(service, &endpoints.addresses)))
}

/// Single poll round over every service the registry knows about. A failed
/// service keeps its previous backends.
pub async fn poll_all(watcher: &WatcherClient, registry: &BackendRegistry) {
    for service in registry.service_names() {
        if let Err(e) = sync_service(watcher, registry, &service).await {
            tracing::warn!(
                "discovery: poll failed, service={}, error={}",
                service,
                e
            );
        }
    }
}
