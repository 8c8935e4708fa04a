use crate::config::SidecarConfig;
use crate::discovery;
use crate::metrics::Metrics;
use crate::server::{self, SidecarState};
use crate::upstream::{HealthMonitor, LivenessProbe, ProbeOutcome, TcpConnectProbe};
use anyhow::Result;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

/// CLI arguments forwarded from `main()`. Listen addresses given here win over
/// the config file and the environment.
pub struct BootstrapArgs {
    pub config_path: std::path::PathBuf,
    pub inbound_listen: Option<String>,
    pub outbound_listen: Option<String>,
    pub admin_listen: Option<String>,
}

/// Sidecar lifecycle: config → state → seed → loops → serve → shutdown.
pub async fn run(args: BootstrapArgs) -> Result<()> {
    init_tracing();

    let mut config = SidecarConfig::load(&args.config_path)?;
    if let Some(v) = args.inbound_listen {
        config.listen.inbound = v;
    }
    if let Some(v) = args.outbound_listen {
        config.listen.outbound = v;
    }
    if let Some(v) = args.admin_listen {
        config.listen.admin = v;
    }
    config.validate()?;

    // Phase 1: build state.
    let metrics = Metrics::install()?;
    let state = SidecarState::new(config, Some(metrics))?;

    // Phase 2: static endpoints and one synchronous resolve, so backends are
    // ready before traffic.
    state.seed_static_endpoints();
    if let Some(ref watcher) = state.watcher {
        discovery::poll_all(watcher, &state.registry).await;
        tracing::info!(
            "discovery: initial resolve completed, services={}",
            state.registry.service_count()
        );
    }

    // Phase 3: background loops.
    let shutdown = CancellationToken::new();
    start_discovery_loop(&state, &shutdown);
    start_rtt_sampler(&state, &shutdown);

    // Phase 4: listeners.
    let cfg = state.config.clone();
    let inbound = server::bind("inbound", &cfg.listen.inbound).await?;
    let outbound = server::bind("outbound", &cfg.listen.outbound).await?;
    let admin = server::bind("admin", &cfg.listen.admin).await?;

    tracing::info!(
        "server: starting sidecar, policy={}, retries={}, app={}",
        cfg.balancer.policy,
        cfg.balancer.retries,
        cfg.app.url
    );

    let inbound_handle = tokio::spawn(server::run_inbound_server(
        inbound,
        state.clone(),
        shutdown.clone(),
    ));
    let outbound_handle = tokio::spawn(server::run_outbound_server(
        outbound,
        state.clone(),
        shutdown.clone(),
    ));
    let admin_handle = tokio::spawn(server::run_admin_server(
        admin,
        state.clone(),
        shutdown.clone(),
    ));

    // Phase 5: block until signal, then clean up.
    wait_for_shutdown(&shutdown).await;
    state.health.shutdown();

    for (name, handle) in [
        ("inbound", inbound_handle),
        ("outbound", outbound_handle),
        ("admin", admin_handle),
    ] {
        match handle.await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => tracing::error!("server: {} listener failed, error={}", name, e),
            Err(e) => tracing::error!("server: {} task error: {}", name, e),
        }
    }

    tracing::info!("server: shutdown complete");
    Ok(())
}

fn init_tracing() {
    let (non_blocking, guard) = tracing_appender::non_blocking::NonBlockingBuilder::default()
        .buffered_lines_limit(128_000)
        .lossy(true)
        .finish(std::io::stdout());

    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(non_blocking)
                .with_ansi(false)
                .with_target(false)
                .json(),
        )
        .init();

    // The writer thread must outlive every log call.
    std::mem::forget(guard);
}

/// Sleep for `duration`, returning `true` early if shutdown fired.
async fn sleep_or_shutdown(duration: Duration, shutdown: &CancellationToken) -> bool {
    tokio::select! {
        _ = tokio::time::sleep(duration) => false,
        _ = shutdown.cancelled() => true,
    }
}

fn start_discovery_loop(state: &SidecarState, shutdown: &CancellationToken) {
    let Some(watcher) = state.watcher.clone() else {
        tracing::info!("discovery: poll loop skipped, no watcher configured");
        return;
    };
    let registry = state.registry.clone();
    let interval = state.config.discovery.poll_interval();
    let shutdown = shutdown.clone();

    tokio::spawn(async move {
        loop {
            if sleep_or_shutdown(interval, &shutdown).await {
                return;
            }
            discovery::poll_all(&watcher, &registry).await;
        }
    });
}

fn start_rtt_sampler(state: &SidecarState, shutdown: &CancellationToken) {
    let health = state.health.clone();
    let cfg = state.config.health.clone();
    let shutdown = shutdown.clone();
    let prober = TcpConnectProbe::new(cfg.probe_port);

    tokio::spawn(async move {
        loop {
            if sleep_or_shutdown(cfg.rtt_sample_interval(), &shutdown).await {
                return;
            }
            sample_round(&health, &prober, cfg.probe_timeout()).await;
        }
    });
}

/// Probe every distinct backend address once and report what was measured.
/// Unreachable backends are reported at the probe timeout.
pub async fn sample_round(
    health: &Arc<HealthMonitor>,
    prober: &dyn LivenessProbe,
    timeout: Duration,
) {
    let mut seen = HashSet::new();
    let addresses: Vec<String> = health
        .registry()
        .all_backends()
        .into_iter()
        .filter_map(|(_, record)| {
            let addr = record.address().to_string();
            seen.insert(addr.clone()).then_some(addr)
        })
        .collect();

    for address in addresses {
        let rtt = match prober.probe(&address, timeout).await {
            Ok(ProbeOutcome::Rtt(d)) => d,
            Ok(ProbeOutcome::Unreachable) => timeout,
            Err(e) => {
                tracing::debug!("rtt: sample skipped, addr={}, error={}", address, e);
                continue;
            }
        };
        health.report_sample(&address, rtt.as_secs_f64() * 1000.0);
    }
}

async fn wait_for_shutdown(shutdown: &CancellationToken) {
    let ctrl_c = tokio::signal::ctrl_c();

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                tracing::error!("server: failed to install SIGTERM handler, error={}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => tracing::info!("server: received SIGINT, shutting down"),
        _ = terminate => tracing::info!("server: received SIGTERM, shutting down"),
    }

    shutdown.cancel();
}
