//! Inbound admission and feedback headers against a loopback app.

mod common;

use bytes::Bytes;
use common::{client, config, eventually, response, spawn_backend, start_sidecar};
use http_body_util::Full;
use hyper::Response;
use tokio::sync::watch;

#[tokio::test]
async fn test_eleventh_concurrent_request_rejected() {
    // The app parks every request until released.
    let (release_tx, release_rx) = watch::channel(false);
    let app = spawn_backend(move |_req| {
        let mut rx = release_rx.clone();
        async move {
            let _ = rx.wait_for(|open| *open).await;
            response(200, "done")
        }
    })
    .await;

    let mut cfg = config();
    cfg.app.url = format!("http://{}", app);
    cfg.admission.capacity = 10;
    let sidecar = start_sidecar(cfg).await;
    let url = format!("http://{}/work", sidecar.inbound);

    let http = client();
    let held: Vec<_> = (0..10)
        .map(|_| {
            let http = http.clone();
            let url = url.clone();
            tokio::spawn(async move { http.get(url).send().await })
        })
        .collect();

    let admission = sidecar.state.admission.clone();
    assert!(eventually(|| admission.in_flight() == 10).await);

    let rejected = http.get(&url).send().await.unwrap();
    assert_eq!(rejected.status(), 429);
    assert_eq!(rejected.headers()["chip"], "0");
    assert_eq!(rejected.headers()["server_count"], "10");
    assert_eq!(rejected.text().await.unwrap(), "Retry");

    release_tx.send(true).unwrap();
    for h in held {
        let resp = h.await.unwrap().unwrap();
        assert_eq!(resp.status(), 200);
        assert!(resp.headers().contains_key("chip"));
        assert!(resp.headers().contains_key("server_count"));
        assert_eq!(resp.text().await.unwrap(), "done");
    }
    assert!(eventually(|| admission.in_flight() == 0).await);
}

#[tokio::test]
async fn test_feedback_headers_on_idle_instance() {
    let app = spawn_backend(|_req| async { response(200, "hello") }).await;

    let mut cfg = config();
    cfg.app.url = format!("http://{}", app);
    cfg.admission.capacity = 100;
    let sidecar = start_sidecar(cfg).await;

    let resp = client()
        .get(format!("http://{}/", sidecar.inbound))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);
    // The credit is a coin flip; the load is not.
    assert_eq!(resp.headers()["server_count"], "1");
    let credit = resp.headers()["chip"].to_str().unwrap().to_string();
    assert!(credit == "0" || credit == "1");
    assert_eq!(resp.text().await.unwrap(), "hello");
}

#[tokio::test]
async fn test_forwarded_for_reaches_app() {
    let app = spawn_backend(|req: hyper::Request<hyper::body::Incoming>| {
        let xff = req
            .headers()
            .get("x-forwarded-for")
            .map(|v| v.as_bytes().to_vec())
            .unwrap_or_default();
        async move {
            Response::builder()
                .status(200)
                .body(Full::new(Bytes::from(xff)))
                .expect("valid response")
        }
    })
    .await;

    let mut cfg = config();
    cfg.app.url = format!("http://{}", app);
    let sidecar = start_sidecar(cfg).await;

    let resp = client()
        .get(format!("http://{}/", sidecar.inbound))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.text().await.unwrap(), "127.0.0.1");
}

#[tokio::test]
async fn test_app_down_is_bad_gateway_with_feedback() {
    let dead = {
        let l = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        l.local_addr().unwrap()
    };
    let mut cfg = config();
    cfg.app.url = format!("http://{}", dead);
    cfg.app.timeout_secs = 2;
    let sidecar = start_sidecar(cfg).await;

    let resp = client()
        .get(format!("http://{}/", sidecar.inbound))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 502);
    assert!(resp.headers().contains_key("chip"));
    assert_eq!(resp.headers()["server_count"], "1");

    let admission = sidecar.state.admission.clone();
    assert!(eventually(|| admission.in_flight() == 0).await);
}

#[tokio::test]
async fn test_sidecar_to_sidecar_feedback_loop() {
    // Outbound sidecar -> inbound sidecar -> app, the way two pods talk.
    let app = spawn_backend(|_req| async { response(200, "pong") }).await;

    let mut server_cfg = config();
    server_cfg.app.url = format!("http://{}", app);
    server_cfg.admission.capacity = 50;
    let server_side = start_sidecar(server_cfg).await;

    let mut client_cfg = config();
    client_cfg.discovery.service = Some("pong".to_string());
    client_cfg.discovery.endpoints = vec![server_side.inbound.to_string()];
    let client_side = start_sidecar(client_cfg).await;

    let resp = client()
        .get(format!("http://{}/ping", client_side.outbound))
        .header(reqwest::header::HOST, "pong")
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);
    assert_eq!(resp.text().await.unwrap(), "pong");

    let record = client_side
        .state
        .registry
        .get("pong", &server_side.inbound.to_string())
        .unwrap();
    assert!(eventually(|| record.remote_load() == 1).await);
    assert_eq!(record.in_flight(), 0);
}
