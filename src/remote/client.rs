//! HTTP client for a remote labflash server

use std::time::Duration;
use url::Url;

use crate::errors::{LabError, Result};
use crate::models::{
    ArtifactsResponse, BuildRequest, HealthResponse, PortsResponse, RelayOutcome,
};
use crate::services::stream_relay::drain_response;

/// Default server when none is given
pub const DEFAULT_SERVER_URL: &str = "http://localhost:8080";

pub struct RemoteClient {
    base: Url,
    client: reqwest::Client,
}

impl RemoteClient {
    pub fn new(server_url: &str) -> Result<Self> {
        let mut base = Url::parse(server_url.trim())
            .map_err(|e| LabError::Validation(format!("Invalid server URL {}: {}", server_url, e)))?;
        if !base.path().ends_with('/') {
            let path = format!("{}/", base.path());
            base.set_path(&path);
        }
        // No overall timeout: streamed builds can run for up to an hour
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .build()?;
        Ok(Self { base, client })
    }

    pub fn base_url(&self) -> &Url {
        &self.base
    }

    fn endpoint(&self, path: &str) -> Result<Url> {
        self.base
            .join(path.trim_start_matches('/'))
            .map_err(|e| LabError::Validation(format!("Invalid endpoint {}: {}", path, e)))
    }

    pub async fn health(&self) -> Result<HealthResponse> {
        let response = self.client.get(self.endpoint("health")?).send().await?;
        Self::json(response).await
    }

    pub async fn ports(&self, detect: bool) -> Result<PortsResponse> {
        let mut url = self.endpoint("api/v1/flash/ports")?;
        if detect {
            url.query_pairs_mut().append_pair("detect", "1");
        }
        let response = self.client.get(url).send().await?;
        Self::json(response).await
    }

    pub async fn artifacts(&self, firmware: Option<&str>) -> Result<ArtifactsResponse> {
        let mut url = self.endpoint("api/v1/flash/artifacts")?;
        if let Some(firmware) = firmware.filter(|f| !f.trim().is_empty()) {
            url.query_pairs_mut().append_pair("firmware", firmware.trim());
        }
        let response = self.client.get(url).send().await?;
        Self::json(response).await
    }

    /// Run a build on the server, handing each log fragment to `on_delta`
    /// as it arrives
    pub async fn build_streamed<F>(&self, request: &BuildRequest, on_delta: F) -> Result<RelayOutcome>
    where
        F: FnMut(&str),
    {
        let url = self.endpoint("api/v1/flash/build/stream")?;
        log::debug!("POST {}", url);
        let response = self.client.post(url).json(request).send().await?;
        Ok(drain_response(response, on_delta).await)
    }

    /// Decode a JSON body, turning non-2xx responses into errors carrying
    /// the server's `{error}` text
    async fn json<T: serde::de::DeserializeOwned>(response: reqwest::Response) -> Result<T> {
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            let message = serde_json::from_str::<serde_json::Value>(&body)
                .ok()
                .and_then(|v| v.get("error").and_then(|e| e.as_str()).map(str::to_string))
                .unwrap_or_else(|| format!("HTTP {}", status));
            return Err(LabError::Http(message));
        }
        Ok(response.json::<T>().await?)
    }
}
