use bytes::Bytes;
use http::header::{CONNECTION, CONTENT_TYPE, TRANSFER_ENCODING};
use http::{HeaderName, HeaderValue, StatusCode};
use http_body_util::{BodyExt, Full};
use hyper::body::Incoming;
use hyper::Response;
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client;
use hyper_util::rt::TokioExecutor;
use std::net::IpAddr;
use std::time::{Duration, Instant};

pub type BoxBody = http_body_util::combinators::BoxBody<Bytes, hyper::Error>;

/// Plain-HTTP pooled client shared by both proxy directions.
pub type HttpClient = Client<HttpConnector, BoxBody>;

pub fn full_body(data: impl Into<Bytes>) -> BoxBody {
    Full::new(data.into())
        .map_err(|never| match never {})
        .boxed()
}

pub fn empty_body() -> BoxBody {
    Full::new(Bytes::new())
        .map_err(|never| match never {})
        .boxed()
}

pub fn build_http_client(connect_timeout: Duration) -> HttpClient {
    let mut http = HttpConnector::new();
    http.set_nodelay(true);
    http.set_keepalive(Some(Duration::from_secs(60)));
    http.set_connect_timeout(Some(connect_timeout));

    Client::builder(TokioExecutor::new())
        .pool_idle_timeout(Duration::from_secs(90))
        .pool_max_idle_per_host(64)
        .build(http)
}

/// Which side of the sidecar handled the request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Inbound,
    Outbound,
}

impl Direction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Direction::Inbound => "inbound",
            Direction::Outbound => "outbound",
        }
    }
}

pub struct RequestContext {
    pub direction: Direction,
    pub method: String,
    pub host: String,
    pub uri_path: String,
    pub client_ip: IpAddr,
    pub service: String,
    pub backend_addr: String,
    pub attempts: u32,
    pub start: Instant,
}

impl RequestContext {
    pub fn new(
        direction: Direction,
        method: String,
        host: String,
        uri_path: String,
        client_ip: IpAddr,
    ) -> Self {
        Self {
            direction,
            method,
            host,
            uri_path,
            client_ip,
            service: String::new(),
            backend_addr: String::new(),
            attempts: 0,
            start: Instant::now(),
        }
    }

    /// JSON error body; request metrics and the access line are emitted here.
    pub fn error_response(&self, status: StatusCode, msg: &str) -> Response<BoxBody> {
        let body = serde_json::json!({ "error": msg }).to_string();
        let mut resp = Response::new(full_body(body));
        *resp.status_mut() = status;
        resp.headers_mut()
            .insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        self.finalize(status.as_u16());
        resp
    }

    /// Short plain-text response, e.g. the admission retry hint.
    pub fn text_response(&self, status: StatusCode, body: &'static str) -> Response<BoxBody> {
        let mut resp = Response::new(full_body(Bytes::from_static(body.as_bytes())));
        *resp.status_mut() = status;
        resp.headers_mut()
            .insert(CONTENT_TYPE, HeaderValue::from_static("text/plain"));
        self.finalize(status.as_u16());
        resp
    }

    pub fn finalize(&self, status: u16) {
        let mut buf = itoa::Buffer::new();
        let status_str = buf.format(status);

        metrics::counter!(
            "sidecar_http_requests_total",
            "direction" => self.direction.as_str(),
            "status_code" => status_str.to_owned(),
        )
        .increment(1);

        metrics::histogram!(
            "sidecar_http_request_duration_seconds",
            "direction" => self.direction.as_str(),
        )
        .record(self.start.elapsed().as_secs_f64());

        tracing::info!(
            direction = self.direction.as_str(),
            client_ip = %self.client_ip,
            method = %self.method,
            host = %self.host,
            path = %self.uri_path,
            service = %self.service,
            backend = %self.backend_addr,
            attempts = self.attempts,
            status = status,
            latency_ms = %self.start.elapsed().as_millis(),
            "access"
        );
    }
}

pub fn remove_hop_headers(headers: &mut http::HeaderMap) {
    let hop_headers: &[HeaderName] = &[
        CONNECTION,
        HeaderName::from_static("keep-alive"),
        HeaderName::from_static("proxy-authenticate"),
        HeaderName::from_static("proxy-authorization"),
        HeaderName::from_static("proxy-connection"),
        HeaderName::from_static("te"),
        HeaderName::from_static("trailers"),
        TRANSFER_ENCODING,
        HeaderName::from_static("upgrade"),
    ];

    for h in hop_headers {
        headers.remove(h);
    }
}

/// Re-wrap an upstream response for the downstream connection, streaming the
/// body through untouched.
pub fn build_downstream_response(upstream_resp: Response<Incoming>) -> Response<BoxBody> {
    let (mut parts, body) = upstream_resp.into_parts();
    remove_hop_headers(&mut parts.headers);
    Response::from_parts(parts, body.boxed())
}
