use crate::error::SidecarError;
use serde::{Deserialize, Deserializer};
use std::time::Duration;

/// Deserialize a `T` that implements `Default`, treating JSON `null` the same
/// as a missing field.
fn deserialize_null_default<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: Default + Deserialize<'de>,
{
    Ok(Option::<T>::deserialize(deserializer)?.unwrap_or_default())
}

/// Endpoint watcher response for one service.
#[derive(Debug, Clone, Default, Deserialize, PartialEq, Eq)]
pub struct Endpoints {
    #[serde(rename = "Svcname", default)]
    pub service: String,
    #[serde(rename = "Ips", default, deserialize_with = "deserialize_null_default")]
    pub addresses: Vec<String>,
}

/// HTTP client of the endpoint watcher (`GET {base}/{service}`).
#[derive(Clone)]
pub struct WatcherClient {
    base_url: String,
    client: reqwest::Client,
}

impl WatcherClient {
    pub fn new(watcher_addr: &str) -> Result<Self, SidecarError> {
        let base_url = if watcher_addr.starts_with("http://") || watcher_addr.starts_with("https://")
        {
            watcher_addr.trim_end_matches('/').to_string()
        } else {
            format!("http://{}", watcher_addr.trim_end_matches('/'))
        };

        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .connect_timeout(Duration::from_secs(5))
            .no_proxy()
            .build()
            .map_err(|e| SidecarError::Discovery(format!("failed to build watcher client: {}", e)))?;

        Ok(Self { base_url, client })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    pub async fn fetch(&self, service: &str) -> Result<Endpoints, SidecarError> {
        let url = format!("{}/{}", self.base_url, service);
        let resp = self
            .client
            .get(&url)
            .header(reqwest::header::CACHE_CONTROL, "no-cache")
            .send()
            .await
            .map_err(|e| SidecarError::Discovery(format!("GET {}: {}", url, e)))?;

        if !resp.status().is_success() {
            return Err(SidecarError::Discovery(format!(
                "GET {}: status={}",
                url,
                resp.status()
            )));
        }

        let mut endpoints: Endpoints = resp
            .json()
            .await
            .map_err(|e| SidecarError::Discovery(format!("GET {}: bad body: {}", url, e)))?;
        if endpoints.service.is_empty() {
            endpoints.service = service.to_string();
        }
        Ok(endpoints)
    }
}
