use http::StatusCode;
use std::fmt;

#[derive(Debug)]
pub enum SidecarError {
    /// The service is unknown or none of its backends is active.
    NoBackends { service: String },
    /// Network failure or timeout talking to a backend. The outcome of the
    /// request is unknown, so it is never retried.
    Transport(String),
    /// Backend answered "too many requests" on every attempt.
    Overload,
    /// Missing or malformed feedback headers. Recovered locally.
    FeedbackParse(String),
    /// The liveness probe could not even be built (bad address, etc.).
    ProbeSetup(String),
    /// Endpoint watcher unreachable or returned garbage.
    Discovery(String),
    Internal(String),
}

impl SidecarError {
    /// HTTP status surfaced to the caller of the proxy.
    pub fn status(&self) -> StatusCode {
        match self {
            SidecarError::NoBackends { .. } => StatusCode::BAD_GATEWAY,
            SidecarError::Transport(_) => StatusCode::BAD_REQUEST,
            SidecarError::Overload => StatusCode::TOO_MANY_REQUESTS,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl fmt::Display for SidecarError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SidecarError::NoBackends { service } => {
                write!(f, "no active backends for service {}", service)
            }
            SidecarError::Transport(msg) => write!(f, "transport error: {}", msg),
            SidecarError::Overload => write!(f, "backend overloaded"),
            SidecarError::FeedbackParse(msg) => write!(f, "feedback parse error: {}", msg),
            SidecarError::ProbeSetup(msg) => write!(f, "probe setup error: {}", msg),
            SidecarError::Discovery(msg) => write!(f, "discovery error: {}", msg),
            SidecarError::Internal(msg) => write!(f, "internal error: {}", msg),
        }
    }
}

impl std::error::Error for SidecarError {}
