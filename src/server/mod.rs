mod admin;
pub mod bootstrap;
mod state;

pub use admin::handle_admin;
pub use state::SidecarState;

use crate::proxy::BoxBody;
use anyhow::Result;
use hyper::body::Incoming;
use hyper::service::service_fn;
use hyper::{Request, Response};
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

const DRAIN_TIMEOUT: Duration = Duration::from_secs(30);

/// Bind `listen`, logging which listener it is.
pub async fn bind(name: &str, listen: &str) -> Result<TcpListener> {
    let addr: SocketAddr = listen.parse()?;
    let listener = TcpListener::bind(addr).await?;
    info!("server: {} listening, addr={}", name, listener.local_addr()?);
    Ok(listener)
}

/// Accept loop shared by every listener.
///
/// When `shutdown` fires the loop stops accepting and waits up to
/// `DRAIN_TIMEOUT` for open connections to finish before returning.
pub async fn serve<F, Fut>(
    name: &'static str,
    listener: TcpListener,
    handler: F,
    shutdown: CancellationToken,
) -> Result<()>
where
    F: Fn(Request<Incoming>, SocketAddr) -> Fut + Clone + Send + Sync + 'static,
    Fut: Future<Output = Result<Response<BoxBody>, hyper::Error>> + Send + 'static,
{
    // metrics gauges are write-only, so keep our own count for draining.
    let active_conns = Arc::new(AtomicI64::new(0));

    loop {
        let accepted = tokio::select! {
            result = listener.accept() => result,
            _ = shutdown.cancelled() => {
                info!("server: {}: stop accepting new connections, draining...", name);
                break;
            }
        };

        let (stream, peer_addr) = match accepted {
            Ok(v) => {
                metrics::counter!(
                    "sidecar_connections_total",
                    "listener" => name,
                    "status" => "accepted",
                )
                .increment(1);
                v
            }
            Err(e) => {
                error!("server: {}: accept failed, error={}", name, e);
                metrics::counter!(
                    "sidecar_connections_total",
                    "listener" => name,
                    "status" => "error",
                )
                .increment(1);
                continue;
            }
        };

        metrics::gauge!("sidecar_connections_active", "listener" => name).increment(1.0);
        active_conns.fetch_add(1, Ordering::Relaxed);

        let handler = handler.clone();
        let active_conns = active_conns.clone();

        tokio::spawn(async move {
            let io = TokioIo::new(stream);
            let svc = service_fn(move |req: Request<Incoming>| handler(req, peer_addr));

            if let Err(e) = auto::Builder::new(TokioExecutor::new())
                .http1()
                .keep_alive(true)
                .http2()
                .keep_alive_interval(Some(Duration::from_secs(20)))
                .serve_connection(io, svc)
                .await
            {
                if !e.to_string().contains("connection closed") {
                    error!(
                        "server: {}: connection error, peer={}, error={}",
                        name, peer_addr, e
                    );
                }
            }

            metrics::gauge!("sidecar_connections_active", "listener" => name).decrement(1.0);
            active_conns.fetch_sub(1, Ordering::Relaxed);
        });
    }

    let active = active_conns.load(Ordering::Relaxed);
    if active > 0 {
        info!(
            "server: {}: waiting for {} active connections to drain",
            name, active
        );
        let drain = async {
            while active_conns.load(Ordering::Relaxed) > 0 {
                tokio::time::sleep(Duration::from_millis(100)).await;
            }
        };
        match tokio::time::timeout(DRAIN_TIMEOUT, drain).await {
            Ok(_) => info!("server: {}: all connections drained", name),
            Err(_) => info!(
                "server: {}: drain timeout ({}s), {} connections still active",
                name,
                DRAIN_TIMEOUT.as_secs(),
                active_conns.load(Ordering::Relaxed)
            ),
        }
    }

    Ok(())
}

/// Traffic addressed to the local app: admission control, then the app.
pub async fn run_inbound_server(
    listener: TcpListener,
    state: SidecarState,
    shutdown: CancellationToken,
) -> Result<()> {
    let inbound = state.inbound.clone();
    serve(
        "inbound",
        listener,
        move |req, peer| {
            let inbound = inbound.clone();
            async move { inbound.handle(req, peer).await }
        },
        shutdown,
    )
    .await
}

/// Calls made by the local app: load-balanced over the addressed service.
pub async fn run_outbound_server(
    listener: TcpListener,
    state: SidecarState,
    shutdown: CancellationToken,
) -> Result<()> {
    let dispatcher = state.dispatcher.clone();
    serve(
        "outbound",
        listener,
        move |req, peer| {
            let dispatcher = dispatcher.clone();
            async move { dispatcher.handle(req, peer).await }
        },
        shutdown,
    )
    .await
}

/// Health, readiness, metrics and backend snapshots.
pub async fn run_admin_server(
    listener: TcpListener,
    state: SidecarState,
    shutdown: CancellationToken,
) -> Result<()> {
    serve(
        "admin",
        listener,
        move |req, _peer| {
            let resp = handle_admin(&req, &state);
            async move { Ok::<_, hyper::Error>(resp) }
        },
        shutdown,
    )
    .await
}
