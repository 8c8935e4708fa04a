//! Loopback fixtures shared by the end-to-end tests.

#![allow(dead_code)]

use bytes::Bytes;
use hermes_sidecar::config::SidecarConfig;
use hermes_sidecar::server::{self, SidecarState};
use http_body_util::Full;
use hyper::body::Incoming;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Request, Response};
use hyper_util::rt::TokioIo;
use std::convert::Infallible;
use std::future::Future;
use std::net::SocketAddr;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

/// Start a plain HTTP/1 server on a loopback port answering with `handler`.
pub async fn spawn_backend<F, Fut>(handler: F) -> SocketAddr
where
    F: Fn(Request<Incoming>) -> Fut + Clone + Send + Sync + 'static,
    Fut: Future<Output = Response<Full<Bytes>>> + Send + 'static,
{
    let listener = TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind backend");
    let addr = listener.local_addr().expect("backend addr");

    tokio::spawn(async move {
        loop {
            let Ok((stream, _)) = listener.accept().await else {
                return;
            };
            let handler = handler.clone();
            tokio::spawn(async move {
                let svc = service_fn(move |req| {
                    let fut = handler(req);
                    async move { Ok::<_, Infallible>(fut.await) }
                });
                let _ = http1::Builder::new()
                    .serve_connection(TokioIo::new(stream), svc)
                    .await;
            });
        }
    });

    addr
}

pub fn response(status: u16, body: &'static str) -> Response<Full<Bytes>> {
    Response::builder()
        .status(status)
        .body(Full::new(Bytes::from_static(body.as_bytes())))
        .expect("valid response")
}

/// Test config: loopback listeners, no watcher.
pub fn config() -> SidecarConfig {
    let mut cfg = SidecarConfig::default();
    cfg.listen.inbound = "127.0.0.1:0".to_string();
    cfg.listen.outbound = "127.0.0.1:0".to_string();
    cfg.listen.admin = "127.0.0.1:0".to_string();
    cfg
}

pub struct Sidecar {
    pub state: SidecarState,
    pub inbound: SocketAddr,
    pub outbound: SocketAddr,
    pub shutdown: CancellationToken,
}

impl Drop for Sidecar {
    fn drop(&mut self) {
        self.shutdown.cancel();
        self.state.health.shutdown();
    }
}

/// Build the sidecar state from `cfg` and serve both proxy directions.
pub async fn start_sidecar(cfg: SidecarConfig) -> Sidecar {
    let state = SidecarState::new(cfg, None).expect("sidecar state");
    state.seed_static_endpoints();
    let shutdown = CancellationToken::new();

    let inbound = server::bind("inbound", &state.config.listen.inbound)
        .await
        .expect("bind inbound");
    let outbound = server::bind("outbound", &state.config.listen.outbound)
        .await
        .expect("bind outbound");
    let inbound_addr = inbound.local_addr().expect("inbound addr");
    let outbound_addr = outbound.local_addr().expect("outbound addr");

    tokio::spawn(server::run_inbound_server(
        inbound,
        state.clone(),
        shutdown.clone(),
    ));
    tokio::spawn(server::run_outbound_server(
        outbound,
        state.clone(),
        shutdown.clone(),
    ));

    Sidecar {
        state,
        inbound: inbound_addr,
        outbound: outbound_addr,
        shutdown,
    }
}

pub fn client() -> reqwest::Client {
    reqwest::Client::builder()
        .no_proxy()
        .build()
        .expect("reqwest client")
}

/// Poll `cond` every 10ms for up to two seconds.
pub async fn eventually<F: Fn() -> bool>(cond: F) -> bool {
    for _ in 0..200 {
        if cond() {
            return true;
        }
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
    }
    cond()
}
