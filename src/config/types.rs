use serde::{Deserialize, Deserializer, Serialize};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

/// Deserialize a `T` that implements `Default`, treating JSON `null` the same as
/// a missing field (returns `T::default()`).
fn deserialize_null_default<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: Default + Deserialize<'de>,
{
    Ok(Option::<T>::deserialize(deserializer)?.unwrap_or_default())
}

/// Top-level sidecar configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SidecarConfig {
    #[serde(default)]
    pub listen: ListenConfig,

    /// The local service instance this sidecar fronts on the inbound path.
    #[serde(default)]
    pub app: AppConfig,

    #[serde(default)]
    pub balancer: BalancerConfig,

    #[serde(default)]
    pub admission: AdmissionConfig,

    #[serde(default)]
    pub health: HealthConfig,

    #[serde(default)]
    pub discovery: DiscoveryConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ListenConfig {
    /// Traffic addressed to the local instance enters here.
    #[serde(default = "default_inbound_listen")]
    pub inbound: String,

    /// The local instance sends its outgoing calls here.
    #[serde(default = "default_outbound_listen")]
    pub outbound: String,

    #[serde(default = "default_admin_listen")]
    pub admin: String,
}

impl Default for ListenConfig {
    fn default() -> Self {
        Self {
            inbound: default_inbound_listen(),
            outbound: default_outbound_listen(),
            admin: default_admin_listen(),
        }
    }
}

fn default_inbound_listen() -> String {
    "0.0.0.0:62081".to_string()
}

fn default_outbound_listen() -> String {
    "0.0.0.0:62082".to_string()
}

fn default_admin_listen() -> String {
    "0.0.0.0:62090".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default = "default_app_url")]
    pub url: String,

    #[serde(default = "default_request_timeout")]
    pub timeout_secs: u64,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            url: default_app_url(),
            timeout_secs: default_request_timeout(),
        }
    }
}

fn default_app_url() -> String {
    "http://127.0.0.1:8080".to_string()
}

fn default_request_timeout() -> u64 {
    20
}

/// Backend selection policy for the outbound path.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum PolicyKind {
    Random,
    #[default]
    LeastConn,
    MLeastConn,
    Netflix,
}

impl PolicyKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            PolicyKind::Random => "Random",
            PolicyKind::LeastConn => "LeastConn",
            PolicyKind::MLeastConn => "MLeastConn",
            PolicyKind::Netflix => "Netflix",
        }
    }
}

impl fmt::Display for PolicyKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PolicyKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "Random" | "random" => Ok(PolicyKind::Random),
            "LeastConn" | "least_conn" => Ok(PolicyKind::LeastConn),
            "MLeastConn" | "m_least_conn" => Ok(PolicyKind::MLeastConn),
            "Netflix" | "netflix" => Ok(PolicyKind::Netflix),
            other => Err(format!("unknown load balancing policy: {}", other)),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BalancerConfig {
    #[serde(default)]
    pub policy: PolicyKind,

    /// Total attempts per outbound request (not extra retries).
    #[serde(default = "default_retries")]
    pub retries: u32,

    /// How long a backend that ran out of credits stays out of rotation
    /// before a single probe request is allowed through.
    #[serde(default = "default_reset_interval_ms")]
    pub reset_interval_ms: u64,

    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,
}

impl Default for BalancerConfig {
    fn default() -> Self {
        Self {
            policy: PolicyKind::default(),
            retries: default_retries(),
            reset_interval_ms: default_reset_interval_ms(),
            request_timeout_secs: default_request_timeout(),
        }
    }
}

impl BalancerConfig {
    pub fn reset_interval(&self) -> Duration {
        Duration::from_millis(self.reset_interval_ms)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

fn default_retries() -> u32 {
    1
}

fn default_reset_interval_ms() -> u64 {
    1000
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AdmissionConfig {
    /// Fixed capacity. `0` means "estimate it from observed concurrency".
    #[serde(default)]
    pub capacity: i64,

    /// Length of the capacity measurement window.
    #[serde(default = "default_window_secs")]
    pub window_secs: u64,

    /// Credits are withheld with probability `in_flight / (headroom * capacity)`.
    #[serde(default = "default_credit_headroom")]
    pub credit_headroom: f64,
}

impl Default for AdmissionConfig {
    fn default() -> Self {
        Self {
            capacity: 0,
            window_secs: default_window_secs(),
            credit_headroom: default_credit_headroom(),
        }
    }
}

impl AdmissionConfig {
    pub fn window(&self) -> Duration {
        Duration::from_secs(self.window_secs)
    }
}

fn default_window_secs() -> u64 {
    30
}

fn default_credit_headroom() -> f64 {
    0.8
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthConfig {
    /// Remote load above which a backend is withdrawn from rotation.
    #[serde(default = "default_load_threshold")]
    pub load_threshold: u64,

    /// Back-off per unit of load above the threshold.
    #[serde(default = "default_load_unit_delay_ms")]
    pub load_unit_delay_ms: u64,

    /// RTT above which a backend is withdrawn. `0` disables RTT demotion.
    #[serde(default)]
    pub rtt_threshold_ms: f64,

    #[serde(default = "default_probe_interval_ms")]
    pub probe_interval_ms: u64,

    #[serde(default = "default_probe_timeout_ms")]
    pub probe_timeout_ms: u64,

    /// Probes sent per recovery round; the fastest answer counts.
    #[serde(default = "default_probe_count")]
    pub probe_count: u32,

    /// TCP port the liveness prober connects to.
    #[serde(default = "default_probe_port")]
    pub probe_port: u16,

    #[serde(default = "default_rtt_sample_interval_ms")]
    pub rtt_sample_interval_ms: u64,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            load_threshold: default_load_threshold(),
            load_unit_delay_ms: default_load_unit_delay_ms(),
            rtt_threshold_ms: 0.0,
            probe_interval_ms: default_probe_interval_ms(),
            probe_timeout_ms: default_probe_timeout_ms(),
            probe_count: default_probe_count(),
            probe_port: default_probe_port(),
            rtt_sample_interval_ms: default_rtt_sample_interval_ms(),
        }
    }
}

impl HealthConfig {
    pub fn load_unit_delay(&self) -> Duration {
        Duration::from_millis(self.load_unit_delay_ms)
    }

    pub fn probe_interval(&self) -> Duration {
        Duration::from_millis(self.probe_interval_ms)
    }

    pub fn probe_timeout(&self) -> Duration {
        Duration::from_millis(self.probe_timeout_ms)
    }

    pub fn rtt_sample_interval(&self) -> Duration {
        Duration::from_millis(self.rtt_sample_interval_ms)
    }

    pub fn rtt_demotion_enabled(&self) -> bool {
        self.rtt_threshold_ms > 0.0
    }
}

fn default_load_threshold() -> u64 {
    2
}

fn default_load_unit_delay_ms() -> u64 {
    50
}

fn default_probe_interval_ms() -> u64 {
    200
}

fn default_probe_timeout_ms() -> u64 {
    100
}

fn default_probe_count() -> u32 {
    3
}

fn default_probe_port() -> u16 {
    80
}

fn default_rtt_sample_interval_ms() -> u64 {
    1000
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiscoveryConfig {
    /// Base URL of the endpoint watcher. Polling is disabled when unset.
    #[serde(default)]
    pub watcher: Option<String>,

    #[serde(default = "default_discovery_poll_ms")]
    pub poll_interval_ms: u64,

    /// Static service seeded once at startup.
    #[serde(default)]
    pub service: Option<String>,

    #[serde(default, deserialize_with = "deserialize_null_default")]
    pub endpoints: Vec<String>,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            watcher: None,
            poll_interval_ms: default_discovery_poll_ms(),
            service: None,
            endpoints: Vec::new(),
        }
    }
}

impl DiscoveryConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

fn default_discovery_poll_ms() -> u64 {
    1000
}
