pub mod types;

#[cfg(test)]
mod tests;

pub use types::*;

use anyhow::Result;
use std::net::SocketAddr;
use std::path::Path;

impl SidecarConfig {
    /// Load configuration from a file (if it exists) and apply environment
    /// variable overrides. When the file does not exist, built-in defaults are
    /// used, so a sidecar can be configured purely through its pod environment.
    pub fn load(path: &Path) -> Result<Self> {
        let mut config: SidecarConfig = if path.exists() {
            let content = std::fs::read_to_string(path)?;
            match path.extension().and_then(|e| e.to_str()) {
                Some("toml") => toml::from_str(&content)?,
                Some("json") => serde_json::from_str(&content)?,
                Some(ext) => anyhow::bail!("unsupported config format: .{ext}, use .toml or .json"),
                None => anyhow::bail!("config file has no extension, use .toml or .json"),
            }
        } else {
            tracing::info!("config file not found at {}, using defaults", path.display());
            SidecarConfig::default()
        };

        config.apply_env_overrides(|key| std::env::var(key).ok())?;

        config.validate()?;
        tracing::info!(
            policy = %config.balancer.policy,
            retries = config.balancer.retries,
            capacity = config.admission.capacity,
            load_threshold = config.health.load_threshold,
            "loaded sidecar configuration"
        );
        Ok(config)
    }

    /// Apply overrides from the environment. `lookup` is injected so tests do
    /// not have to mutate the process environment.
    pub fn apply_env_overrides<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        // Listeners
        if let Some(v) = lookup("SIDECAR_INBOUND_LISTEN") {
            self.listen.inbound = v;
        }
        if let Some(v) = lookup("SIDECAR_OUTBOUND_LISTEN") {
            self.listen.outbound = v;
        }
        if let Some(v) = lookup("SIDECAR_ADMIN_LISTEN") {
            self.listen.admin = v;
        }
        if let Some(v) = lookup("SIDECAR_APP_URL") {
            self.app.url = v;
        }

        // Balancer
        if let Some(v) = lookup("SIDECAR_LB_POLICY") {
            self.balancer.policy = v.parse().map_err(anyhow::Error::msg)?;
        }
        if let Some(v) = lookup("SIDECAR_RETRIES") {
            self.balancer.retries = v
                .trim()
                .parse()
                .map_err(|e| anyhow::anyhow!("invalid SIDECAR_RETRIES '{}': {}", v, e))?;
        }
        if let Some(v) = lookup("SIDECAR_RESET_INTERVAL") {
            let d = humantime::parse_duration(v.trim())
                .map_err(|e| anyhow::anyhow!("invalid SIDECAR_RESET_INTERVAL '{}': {}", v, e))?;
            self.balancer.reset_interval_ms = d.as_millis() as u64;
        }

        // Admission
        if let Some(v) = lookup("SIDECAR_CAPACITY") {
            self.admission.capacity = v
                .trim()
                .parse()
                .map_err(|e| anyhow::anyhow!("invalid SIDECAR_CAPACITY '{}': {}", v, e))?;
        }
        if let Some(v) = lookup("SIDECAR_CAPACITY_WINDOW") {
            let d = humantime::parse_duration(v.trim())
                .map_err(|e| anyhow::anyhow!("invalid SIDECAR_CAPACITY_WINDOW '{}': {}", v, e))?;
            if d.as_secs() == 0 || d.subsec_nanos() != 0 {
                anyhow::bail!(
                    "invalid SIDECAR_CAPACITY_WINDOW '{}': must be a whole number of seconds, at least 1s",
                    v
                );
            }
            self.admission.window_secs = d.as_secs();
        }

        // Health
        if let Some(v) = lookup("SIDECAR_LOAD_THRESHOLD") {
            self.health.load_threshold = v
                .trim()
                .parse()
                .map_err(|e| anyhow::anyhow!("invalid SIDECAR_LOAD_THRESHOLD '{}': {}", v, e))?;
        }
        if let Some(v) = lookup("SIDECAR_RTT_THRESHOLD_MS") {
            self.health.rtt_threshold_ms = v
                .trim()
                .parse()
                .map_err(|e| anyhow::anyhow!("invalid SIDECAR_RTT_THRESHOLD_MS '{}': {}", v, e))?;
        }

        // Discovery
        if let Some(v) = lookup("SIDECAR_WATCHER_ADDRESS") {
            self.discovery.watcher = Some(v);
        }
        if let Some(v) = lookup("SIDECAR_SERVICE") {
            self.discovery.service = Some(v);
        }
        if let Some(v) = lookup("SIDECAR_POD_IPS") {
            self.discovery.endpoints = v
                .split(',')
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .collect();
        }

        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        for (name, addr) in [
            ("inbound", &self.listen.inbound),
            ("outbound", &self.listen.outbound),
            ("admin", &self.listen.admin),
        ] {
            if addr.parse::<SocketAddr>().is_err() {
                anyhow::bail!("listen.{} '{}' is not a socket address", name, addr);
            }
        }

        let app_uri: http::Uri = self
            .app
            .url
            .parse()
            .map_err(|e| anyhow::anyhow!("app.url '{}' is not a valid uri: {}", self.app.url, e))?;
        if app_uri.scheme_str() != Some("http") || app_uri.authority().is_none() {
            anyhow::bail!("app.url '{}' must be an http:// url with a host", self.app.url);
        }

        if self.balancer.retries == 0 {
            anyhow::bail!("balancer.retries must be at least 1");
        }
        if self.admission.capacity < 0 {
            anyhow::bail!("admission.capacity must not be negative");
        }
        if self.admission.window_secs == 0 {
            anyhow::bail!("admission.window_secs must be greater than 0");
        }
        let headroom = self.admission.credit_headroom;
        if !(headroom > 0.0 && headroom <= 1.0) {
            anyhow::bail!("admission.credit_headroom must be in (0, 1], got {}", headroom);
        }
        if self.health.rtt_threshold_ms < 0.0 {
            anyhow::bail!("health.rtt_threshold_ms must not be negative");
        }
        if self.health.probe_count == 0 {
            anyhow::bail!("health.probe_count must be at least 1");
        }
        if !self.discovery.endpoints.is_empty() && self.discovery.service.is_none() {
            anyhow::bail!("discovery.endpoints requires discovery.service");
        }
        Ok(())
    }
}
