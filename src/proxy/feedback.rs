//! Feedback headers exchanged between sidecars.
//!
//! Every response served by an inbound sidecar carries a credit hint (`CHIP`,
//! `0` or `1`) and the number of requests in flight at that instance
//! (`Server_count`). The outbound side reads them back into the backend
//! registry. Names compare case-insensitively on the wire.

use crate::error::SidecarError;
use http::{HeaderMap, HeaderName, HeaderValue};

pub const CREDIT_HEADER: HeaderName = HeaderName::from_static("chip");
pub const LOAD_HEADER: HeaderName = HeaderName::from_static("server_count");

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Feedback {
    pub credits: u64,
    pub remote_load: u64,
}

impl Feedback {
    pub fn new(grant_credit: bool, remote_load: u64) -> Self {
        Self {
            credits: u64::from(grant_credit),
            remote_load,
        }
    }

    /// Strict parse of both headers.
    pub fn parse(headers: &HeaderMap) -> Result<Self, SidecarError> {
        let credits = match header_str(headers, &CREDIT_HEADER)? {
            "0" => 0,
            "1" => 1,
            other => {
                return Err(SidecarError::FeedbackParse(format!(
                    "{}: expected 0 or 1, got '{}'",
                    CREDIT_HEADER, other
                )))
            }
        };
        let load = header_str(headers, &LOAD_HEADER)?;
        let remote_load = load.trim().parse::<u64>().map_err(|e| {
            SidecarError::FeedbackParse(format!("{}: '{}': {}", LOAD_HEADER, load, e))
        })?;
        Ok(Self {
            credits,
            remote_load,
        })
    }

    /// Parse, falling back to zero credits and zero load on any error.
    pub fn from_headers(headers: &HeaderMap) -> Self {
        match Self::parse(headers) {
            Ok(fb) => fb,
            Err(e) => {
                tracing::debug!("feedback: using fail-safe defaults, error={}", e);
                metrics::counter!("sidecar_feedback_parse_errors_total").increment(1);
                Self::default()
            }
        }
    }

    pub fn stamp(&self, headers: &mut HeaderMap) {
        let credit = if self.credits > 0 { "1" } else { "0" };
        headers.insert(CREDIT_HEADER, HeaderValue::from_static(credit));
        let mut buf = itoa::Buffer::new();
        if let Ok(v) = HeaderValue::from_str(buf.format(self.remote_load)) {
            headers.insert(LOAD_HEADER, v);
        }
    }
}

fn header_str<'a>(headers: &'a HeaderMap, name: &HeaderName) -> Result<&'a str, SidecarError> {
    headers
        .get(name)
        .ok_or_else(|| SidecarError::FeedbackParse(format!("{} missing", name)))?
        .to_str()
        .map_err(|e| SidecarError::FeedbackParse(format!("{}: {}", name, e)))
}
