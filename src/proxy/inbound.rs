use crate::admission::AdmissionController;
use crate::config::AppConfig;
use crate::proxy::context::{
    build_downstream_response, remove_hop_headers, BoxBody, Direction, HttpClient,
    RequestContext,
};
use crate::proxy::feedback::Feedback;
use anyhow::Context;
use http::header::HOST;
use http::uri::{Authority, Scheme};
use http::{HeaderName, HeaderValue, StatusCode, Uri};
use http_body_util::BodyExt;
use hyper::body::Body;
use hyper::{Request, Response};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tracing::warn;

static XFF: HeaderName = HeaderName::from_static("x-forwarded-for");

/// Front door of the local service instance: admission control, then a
/// straight forward to the app with the feedback headers stamped on the way
/// back.
pub struct InboundProxy {
    admission: Arc<AdmissionController>,
    client: HttpClient,
    app_authority: Authority,
    timeout: Duration,
}

impl InboundProxy {
    pub fn new(
        app: &AppConfig,
        admission: Arc<AdmissionController>,
        client: HttpClient,
    ) -> anyhow::Result<Self> {
        let uri: Uri = app
            .url
            .parse()
            .with_context(|| format!("invalid app url '{}'", app.url))?;
        let app_authority = uri
            .authority()
            .cloned()
            .with_context(|| format!("app url '{}' has no host", app.url))?;
        Ok(Self {
            admission,
            client,
            app_authority,
            timeout: Duration::from_secs(app.timeout_secs),
        })
    }

    pub fn admission(&self) -> &Arc<AdmissionController> {
        &self.admission
    }

    pub async fn handle<B>(
        &self,
        req: Request<B>,
        peer_addr: SocketAddr,
    ) -> Result<Response<BoxBody>, hyper::Error>
    where
        B: Body<Data = bytes::Bytes, Error = hyper::Error> + Send + Sync + 'static,
    {
        let host = req
            .headers()
            .get(HOST)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("")
            .to_string();
        let mut ctx = RequestContext::new(
            Direction::Inbound,
            req.method().as_str().to_string(),
            host,
            req.uri().path().to_string(),
            peer_addr.ip(),
        );
        ctx.backend_addr = self.app_authority.to_string();

        let permit = match self.admission.admit() {
            Ok(p) => p,
            Err(rejected) => {
                warn!(
                    "inbound: request rejected, in_flight={}, capacity={}",
                    rejected.in_flight, rejected.capacity
                );
                let mut resp = ctx.text_response(StatusCode::TOO_MANY_REQUESTS, "Retry");
                Feedback::new(false, rejected.in_flight as u64).stamp(resp.headers_mut());
                return Ok(resp);
            }
        };
        ctx.attempts = 1;
        let feedback = Feedback::new(permit.credit_hint(), permit.in_flight().max(0) as u64);

        let (mut parts, body) = req.into_parts();
        remove_hop_headers(&mut parts.headers);
        append_forwarded_for(&mut parts.headers, peer_addr);

        let path_and_query = parts
            .uri
            .path_and_query()
            .cloned()
            .unwrap_or_else(|| http::uri::PathAndQuery::from_static("/"));
        parts.uri = match Uri::builder()
            .scheme(Scheme::HTTP)
            .authority(self.app_authority.clone())
            .path_and_query(path_and_query)
            .build()
        {
            Ok(uri) => uri,
            Err(e) => {
                warn!("inbound: failed to build app uri, error={}", e);
                let mut resp = ctx.error_response(StatusCode::BAD_REQUEST, "bad request");
                feedback.stamp(resp.headers_mut());
                return Ok(resp);
            }
        };
        let app_req = Request::from_parts(parts, body.boxed());

        let mut resp = match tokio::time::timeout(self.timeout, self.client.request(app_req)).await
        {
            Ok(Ok(app_resp)) => {
                let status = app_resp.status().as_u16();
                let resp = build_downstream_response(app_resp);
                ctx.finalize(status);
                // The admission slot is held until the body is fully sent.
                let (parts, body) = resp.into_parts();
                let body = body
                    .map_frame(move |frame| {
                        let _slot = &permit;
                        frame
                    })
                    .boxed();
                Response::from_parts(parts, body)
            }
            Ok(Err(e)) => {
                warn!(
                    "inbound: app request failed, app={}, error={}",
                    self.app_authority, e
                );
                ctx.error_response(StatusCode::BAD_GATEWAY, "app unavailable")
            }
            Err(_) => {
                warn!(
                    "inbound: app request timed out, app={}, timeout_secs={}",
                    self.app_authority,
                    self.timeout.as_secs()
                );
                ctx.error_response(StatusCode::GATEWAY_TIMEOUT, "app timeout")
            }
        };

        feedback.stamp(resp.headers_mut());
        Ok(resp)
    }
}

/// Append the TCP peer to `X-Forwarded-For`.
fn append_forwarded_for(headers: &mut http::HeaderMap, peer_addr: SocketAddr) {
    let peer_ip = peer_addr.ip().to_string();
    let value = match headers.get(&XFF).and_then(|v| v.to_str().ok()) {
        Some(existing) => format!("{}, {}", existing, peer_ip),
        None => peer_ip,
    };
    if let Ok(v) = HeaderValue::from_str(&value) {
        headers.insert(XFF.clone(), v);
    }
}
