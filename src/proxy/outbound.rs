use crate::discovery::{self, WatcherClient};
use crate::error::SidecarError;
use crate::proxy::context::{
    build_downstream_response, empty_body, full_body, remove_hop_headers, BoxBody, Direction,
    HttpClient, RequestContext,
};
use crate::proxy::feedback::Feedback;
use crate::upstream::{BackendRecord, BackendRegistry, HealthMonitor, LoadBalancer};
use bytes::Bytes;
use http::header::HOST;
use http::uri::Authority;
use http::StatusCode;
use http_body_util::BodyExt;
use hyper::body::{Body, Incoming};
use hyper::{Request, Response};
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

const DEFAULT_PORT: u16 = 80;

/// Outbound dispatch settings, taken from the balancer section.
#[derive(Debug, Clone, Copy)]
pub struct DispatchSettings {
    /// Total attempts per request, at least one.
    pub retries: u32,
    pub reset_interval: Duration,
    pub timeout: Duration,
}

/// Where an outbound request is going: the logical service and the port the
/// caller addressed it on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Target {
    pub service: String,
    pub port: u16,
}

impl Target {
    /// Read `service[:port]` from the request's absolute URI or its `Host`.
    pub fn from_request<B>(req: &Request<B>) -> Option<Self> {
        let authority = match req.uri().authority() {
            Some(a) => a.clone(),
            None => req
                .headers()
                .get(HOST)
                .and_then(|v| v.to_str().ok())
                .and_then(|h| h.parse::<Authority>().ok())?,
        };
        let service = authority.host().trim_start_matches('[').trim_end_matches(']');
        if service.is_empty() {
            return None;
        }
        Some(Self {
            service: service.to_string(),
            port: authority.port_u16().unwrap_or(DEFAULT_PORT),
        })
    }

    /// Network address of `backend` for this target. Addresses that already
    /// carry a port are used as-is.
    pub fn backend_authority(&self, backend: &str) -> String {
        if let Ok(sa) = backend.parse::<SocketAddr>() {
            return sa.to_string();
        }
        if let Ok(ip) = backend.parse::<IpAddr>() {
            return SocketAddr::new(ip, self.port).to_string();
        }
        format!("{}:{}", backend, self.port)
    }
}

/// Terminal result of the attempt loop.
struct Attempt {
    response: Response<Incoming>,
    record: Arc<BackendRecord>,
    elapsed: Duration,
}

/// Outbound side of the sidecar: picks a backend of the addressed service,
/// retries on overload, and feeds every final response back into the
/// registry and the health monitor.
pub struct Dispatcher {
    health: Arc<HealthMonitor>,
    balancer: LoadBalancer,
    client: HttpClient,
    settings: DispatchSettings,
    resolver: Option<WatcherClient>,
}

impl Dispatcher {
    pub fn new(
        health: Arc<HealthMonitor>,
        balancer: LoadBalancer,
        client: HttpClient,
        settings: DispatchSettings,
        resolver: Option<WatcherClient>,
    ) -> Self {
        Self {
            health,
            balancer,
            client,
            settings,
            resolver,
        }
    }

    pub fn registry(&self) -> &Arc<BackendRegistry> {
        self.health.registry()
    }

    pub fn balancer(&self) -> &LoadBalancer {
        &self.balancer
    }

    pub async fn handle<B>(
        &self,
        req: Request<B>,
        peer_addr: SocketAddr,
    ) -> Result<Response<BoxBody>, hyper::Error>
    where
        B: Body<Data = Bytes, Error = hyper::Error> + Send + Sync + 'static,
    {
        let host = req
            .headers()
            .get(HOST)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("")
            .to_string();
        let mut ctx = RequestContext::new(
            Direction::Outbound,
            req.method().as_str().to_string(),
            host,
            req.uri().path().to_string(),
            peer_addr.ip(),
        );

        let Some(target) = Target::from_request(&req) else {
            debug!("outbound: request without a service host, path={}", ctx.uri_path);
            return Ok(ctx.error_response(StatusCode::BAD_REQUEST, "missing service host"));
        };
        ctx.service.push_str(&target.service);

        self.resolve_if_new(&target.service).await;

        let (mut parts, body) = req.into_parts();
        remove_hop_headers(&mut parts.headers);
        let path_and_query = parts
            .uri
            .path_and_query()
            .map(|pq| pq.as_str().to_owned())
            .unwrap_or_else(|| "/".to_owned());

        // Only a retried request needs a replayable body.
        let (body_bytes, mut streaming_body): (Option<Bytes>, Option<BoxBody>) =
            if self.settings.retries > 1 {
                match body.collect().await {
                    Ok(collected) => (Some(collected.to_bytes()), None),
                    Err(e) => {
                        warn!(
                            "outbound: failed to read request body, service={}, error={}",
                            target.service, e
                        );
                        return Ok(ctx.error_response(StatusCode::BAD_REQUEST, "bad request"));
                    }
                }
            } else {
                (None, Some(body.boxed()))
            };

        let mut last: Option<Attempt> = None;

        for attempt in 0..self.settings.retries {
            let record = match self.balancer.select(self.registry(), &target.service) {
                Ok(r) => r,
                Err(e) => {
                    if last.is_some() {
                        // Keep the overload answer we already have.
                        break;
                    }
                    warn!("outbound: {}, attempt={}", e, attempt);
                    return Ok(ctx.error_response(e.status(), &e.to_string()));
                }
            };

            let backend = target.backend_authority(record.address());
            ctx.backend_addr.clear();
            ctx.backend_addr.push_str(&backend);
            ctx.attempts = attempt + 1;

            let req_body = match body_bytes {
                Some(ref bytes) => full_body(bytes.clone()),
                None => streaming_body.take().unwrap_or_else(empty_body),
            };
            let mut builder = Request::builder()
                .method(parts.method.clone())
                .uri(format!("http://{}{}", backend, path_and_query));
            for (name, value) in &parts.headers {
                builder = builder.header(name, value);
            }
            let upstream_req = match builder.body(req_body) {
                Ok(r) => r,
                Err(e) => {
                    warn!(
                        "outbound: failed to build request, service={}, backend={}, error={}",
                        target.service, backend, e
                    );
                    return Ok(ctx.error_response(StatusCode::BAD_REQUEST, "bad request"));
                }
            };

            let guard = record.dispatch();
            let started = Instant::now();
            let result =
                tokio::time::timeout(self.settings.timeout, self.client.request(upstream_req))
                    .await;
            let elapsed = started.elapsed();
            drop(guard);

            let response = match result {
                Ok(Ok(resp)) => resp,
                Ok(Err(e)) => {
                    let err = SidecarError::Transport(e.to_string());
                    warn!(
                        "outbound: request failed, service={}, backend={}, error={}",
                        target.service, backend, err
                    );
                    return Ok(ctx.error_response(err.status(), "upstream request failed"));
                }
                Err(_) => {
                    let err = SidecarError::Transport(format!(
                        "timed out after {}s",
                        self.settings.timeout.as_secs()
                    ));
                    warn!(
                        "outbound: request failed, service={}, backend={}, error={}",
                        target.service, backend, err
                    );
                    return Ok(ctx.error_response(err.status(), "upstream timeout"));
                }
            };

            let overloaded = response.status() == StatusCode::TOO_MANY_REQUESTS;
            last = Some(Attempt {
                response,
                record: record.clone(),
                elapsed,
            });
            if !overloaded {
                break;
            }

            record.backoff(self.settings.reset_interval);
            metrics::counter!(
                "sidecar_outbound_retries_total",
                "service" => target.service.clone(),
            )
            .increment(1);
            debug!(
                "outbound: backend overloaded, service={}, backend={}, attempt={}",
                target.service,
                backend,
                attempt + 1
            );
        }

        let Some(Attempt {
            response,
            record,
            elapsed,
        }) = last
        else {
            let err = SidecarError::Internal("no attempt was made".to_string());
            return Ok(ctx.error_response(err.status(), &err.to_string()));
        };

        let feedback = Feedback::from_headers(response.headers());
        self.spawn_feedback(&target.service, record, feedback, elapsed);

        let status = response.status();
        if status.is_success() {
            let resp = build_downstream_response(response);
            ctx.finalize(status.as_u16());
            return Ok(resp);
        }
        if status == StatusCode::TOO_MANY_REQUESTS {
            let err = SidecarError::Overload;
            return Ok(ctx.error_response(err.status(), &err.to_string()));
        }
        Ok(ctx.error_response(status, "upstream error"))
    }

    /// The first request for a service nobody has asked about yet resolves it
    /// synchronously; afterwards the discovery loop keeps it fresh. Hosts the
    /// watcher has no addresses for are not registered.
    async fn resolve_if_new(&self, service: &str) {
        if self.registry().contains_service(service) {
            return;
        }
        let Some(ref watcher) = self.resolver else {
            return;
        };
        match discovery::resolve_new(watcher, self.registry(), service).await {
            Ok(Some(summary)) => debug!(
                "outbound: first resolve, service={}, backends={}",
                service, summary.total
            ),
            Ok(None) => debug!("outbound: unknown service, service={}", service),
            Err(e) => warn!(
                "outbound: first resolve failed, service={}, error={}",
                service, e
            ),
        }
    }

    /// Apply feedback off the response path, then let the health monitor
    /// react to the reported load and the measured RTT.
    fn spawn_feedback(
        &self,
        service: &str,
        record: Arc<BackendRecord>,
        feedback: Feedback,
        elapsed: Duration,
    ) {
        let health = self.health.clone();
        let service = service.to_string();
        let rtt_ms = elapsed.as_secs_f64() * 1000.0;
        tokio::spawn(async move {
            health
                .registry()
                .apply_feedback(&record, feedback.credits, feedback.remote_load, rtt_ms);
            health.demote_for_load(&service, &record, feedback.remote_load);
            health.observe_rtt(&service, &record, rtt_ms);
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use http::HeaderValue;

    fn request(uri: &str, host: Option<&str>) -> Request<()> {
        let mut req = Request::builder().uri(uri).body(()).unwrap();
        if let Some(h) = host {
            req.headers_mut().insert(HOST, HeaderValue::from_str(h).unwrap());
        }
        req
    }

    #[test]
    fn test_target_from_host_header() {
        let t = Target::from_request(&request("/items", Some("cart:8080"))).unwrap();
        assert_eq!(
            t,
            Target {
                service: "cart".to_string(),
                port: 8080
            }
        );
    }

    #[test]
    fn test_target_default_port() {
        let t = Target::from_request(&request("/", Some("cart"))).unwrap();
        assert_eq!(t.port, 80);
    }

    #[test]
    fn test_target_prefers_absolute_uri() {
        let t = Target::from_request(&request("http://orders:9000/x", Some("cart:8080"))).unwrap();
        assert_eq!(t.service, "orders");
        assert_eq!(t.port, 9000);
    }

    #[test]
    fn test_target_missing_host() {
        assert!(Target::from_request(&request("/items", None)).is_none());
    }

    #[test]
    fn test_backend_authority() {
        let t = Target {
            service: "cart".to_string(),
            port: 8080,
        };
        assert_eq!(t.backend_authority("10.0.0.7"), "10.0.0.7:8080");
        assert_eq!(t.backend_authority("127.0.0.1:3000"), "127.0.0.1:3000");
        assert_eq!(t.backend_authority("::1"), "[::1]:8080");
        assert_eq!(t.backend_authority("cart-0.cart"), "cart-0.cart:8080");
    }
}
