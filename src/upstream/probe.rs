use crate::error::SidecarError;
use futures_util::future::BoxFuture;
use std::net::{IpAddr, SocketAddr};
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::time::Instant;

/// Outcome of one liveness probe.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ProbeOutcome {
    Rtt(Duration),
    /// Timed out or refused. Treated as "still above threshold".
    Unreachable,
}

/// Measures round-trip time to a backend.
///
/// `Err` means the probe could not be attempted at all; recovery agents give
/// up on such backends instead of looping on a broken prober.
pub trait LivenessProbe: Send + Sync {
    fn probe<'a>(
        &'a self,
        address: &'a str,
        timeout: Duration,
    ) -> BoxFuture<'a, Result<ProbeOutcome, SidecarError>>;
}

/// Times a TCP handshake to `address:port`.
#[derive(Debug, Clone)]
pub struct TcpConnectProbe {
    port: u16,
}

impl TcpConnectProbe {
    pub fn new(port: u16) -> Self {
        Self { port }
    }

    fn target(&self, address: &str) -> Result<SocketAddr, SidecarError> {
        if let Ok(sa) = address.parse::<SocketAddr>() {
            return Ok(sa);
        }
        address
            .parse::<IpAddr>()
            .map(|ip| SocketAddr::new(ip, self.port))
            .map_err(|e| SidecarError::ProbeSetup(format!("{}: {}", address, e)))
    }
}

impl LivenessProbe for TcpConnectProbe {
    fn probe<'a>(
        &'a self,
        address: &'a str,
        timeout: Duration,
    ) -> BoxFuture<'a, Result<ProbeOutcome, SidecarError>> {
        Box::pin(async move {
            let target = self.target(address)?;
            let start = Instant::now();
            match tokio::time::timeout(timeout, TcpStream::connect(target)).await {
                Ok(Ok(_stream)) => Ok(ProbeOutcome::Rtt(start.elapsed())),
                Ok(Err(e)) => {
                    tracing::debug!("probe: connect failed, addr={}, error={}", target, e);
                    Ok(ProbeOutcome::Unreachable)
                }
                Err(_) => Ok(ProbeOutcome::Unreachable),
            }
        })
    }
}
