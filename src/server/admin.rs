use super::SidecarState;
use crate::proxy::context::{full_body, BoxBody};
use http::header::CONTENT_TYPE;
use http::{HeaderValue, StatusCode};
use hyper::{Request, Response};

fn respond(status: StatusCode, content_type: &'static str, body: String) -> Response<BoxBody> {
    let mut resp = Response::new(full_body(body));
    *resp.status_mut() = status;
    resp.headers_mut()
        .insert(CONTENT_TYPE, HeaderValue::from_static(content_type));
    resp
}

fn json(status: StatusCode, value: serde_json::Value) -> Response<BoxBody> {
    respond(status, "application/json", value.to_string())
}

pub fn handle_admin<B>(req: &Request<B>, state: &SidecarState) -> Response<BoxBody> {
    match req.uri().path() {
        "/health" | "/healthz" => json(StatusCode::OK, serde_json::json!({ "status": "ok" })),

        "/ready" | "/readyz" => json(
            StatusCode::OK,
            serde_json::json!({
                "status": "ready",
                "services": state.registry.service_count(),
                "policy": state.config.balancer.policy.as_str(),
                "capacity": state.admission.capacity(),
                "inbound_in_flight": state.admission.in_flight(),
            }),
        ),

        "/metrics" => match state.metrics {
            Some(ref m) => respond(
                StatusCode::OK,
                "text/plain; version=0.0.4; charset=utf-8",
                m.render(),
            ),
            None => json(
                StatusCode::SERVICE_UNAVAILABLE,
                serde_json::json!({ "error": "metrics recorder not installed" }),
            ),
        },

        "/backends" => {
            let body = serde_json::to_string_pretty(&state.registry.snapshot()).unwrap_or_default();
            respond(StatusCode::OK, "application/json", body)
        }

        _ => json(StatusCode::NOT_FOUND, serde_json::json!({ "error": "not found" })),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SidecarConfig;
    use http_body_util::BodyExt;

    fn state() -> SidecarState {
        let mut cfg = SidecarConfig::default();
        cfg.discovery.service = Some("cart".to_string());
        cfg.discovery.endpoints = vec!["10.0.0.1".to_string()];
        let state = SidecarState::new(cfg, None).unwrap();
        state.seed_static_endpoints();
        state
    }

    async fn get(state: &SidecarState, path: &str) -> (StatusCode, serde_json::Value) {
        let req = Request::builder().uri(path).body(()).unwrap();
        let resp = handle_admin(&req, state);
        let status = resp.status();
        let bytes = resp.into_body().collect().await.unwrap().to_bytes();
        (status, serde_json::from_slice(&bytes).unwrap())
    }

    #[tokio::test]
    async fn test_healthz() {
        let (status, body) = get(&state(), "/healthz").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "ok");
    }

    #[tokio::test]
    async fn test_readyz_reports_services() {
        let (status, body) = get(&state(), "/readyz").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["services"], 1);
        assert_eq!(body["policy"], "LeastConn");
    }

    #[tokio::test]
    async fn test_backends_snapshot() {
        let (status, body) = get(&state(), "/backends").await;
        assert_eq!(status, StatusCode::OK);
        let services = body.as_array().unwrap();
        assert_eq!(services.len(), 1);
        assert_eq!(services[0]["service"], "cart");
        assert_eq!(services[0]["backends"][0]["address"], "10.0.0.1");
        assert_eq!(services[0]["backends"][0]["state"], "active");
    }

    #[tokio::test]
    async fn test_metrics_without_recorder() {
        let (status, _) = get(&state(), "/metrics").await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    }

    #[tokio::test]
    async fn test_unknown_path() {
        let (status, _) = get(&state(), "/nope").await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }
}
