//! Download firmware binaries from published GitHub releases

use serde::Deserialize;
use std::sync::Arc;
use std::time::Duration;

use super::artifact_store::ArtifactStore;
use crate::errors::{LabError, Result};
use crate::models::{Artifact, ArtifactKind, DownloadReleaseRequest};

pub const GITHUB_API: &str = "https://api.github.com";

const USER_AGENT: &str = concat!("labflash/", env!("CARGO_PKG_VERSION"));

#[derive(Debug, Clone, Deserialize)]
pub struct ReleaseInfo {
    #[serde(default)]
    pub tag_name: String,
    #[serde(default)]
    pub assets: Vec<ReleaseAsset>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ReleaseAsset {
    pub name: String,
    #[serde(default)]
    pub browser_download_url: String,
}

/// First `.bin` asset, optionally narrowed by a case-insensitive substring
pub fn pick_asset<'a>(assets: &'a [ReleaseAsset], filter: Option<&str>) -> Option<&'a ReleaseAsset> {
    let filter = filter
        .map(|f| f.trim().to_ascii_lowercase())
        .filter(|f| !f.is_empty());
    assets.iter().find(|asset| {
        let name = asset.name.to_ascii_lowercase();
        name.ends_with(".bin") && filter.as_ref().is_none_or(|f| name.contains(f.as_str()))
    })
}

/// Replace anything but word characters, dot and dash with `_`
pub fn safe_component(raw: &str) -> String {
    raw.chars()
        .map(|c| {
            if c.is_alphanumeric() || matches!(c, '_' | '.' | '-') {
                c
            } else {
                '_'
            }
        })
        .collect()
}

/// Fetches release assets into `artifacts/<device>/<firmware>/ota/`
pub struct ReleaseDownloader {
    client: reqwest::Client,
    api_base: String,
    store: Arc<ArtifactStore>,
}

impl ReleaseDownloader {
    pub fn new(store: Arc<ArtifactStore>) -> Result<Self> {
        Self::with_api_base(store, GITHUB_API)
    }

    /// Point at a different API root (GitHub Enterprise, test servers)
    pub fn with_api_base(store: Arc<ArtifactStore>, api_base: &str) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(120))
            .user_agent(USER_AGENT)
            .build()?;
        Ok(Self {
            client,
            api_base: api_base.trim_end_matches('/').to_string(),
            store,
        })
    }

    pub async fn fetch_release(&self, owner: &str, repo: &str, tag: Option<&str>) -> Result<ReleaseInfo> {
        let url = match tag.map(str::trim).filter(|t| !t.is_empty()) {
            Some(tag) => format!(
                "{}/repos/{}/{}/releases/tags/{}",
                self.api_base,
                owner,
                repo,
                urlencoding::encode(tag)
            ),
            None => format!("{}/repos/{}/{}/releases/latest", self.api_base, owner, repo),
        };
        log::debug!("Fetching release metadata from {}", url);

        let response = self.client.get(&url).send().await?;
        if !response.status().is_success() {
            return Err(LabError::Http(format!(
                "Release lookup for {}/{} failed: HTTP {}",
                owner,
                repo,
                response.status()
            )));
        }
        Ok(response.json::<ReleaseInfo>().await?)
    }

    /// Download the matching asset and register it as a release artifact
    pub async fn download(&self, request: &DownloadReleaseRequest) -> Result<Artifact> {
        let owner = request.owner.trim();
        let repo = request.repo.trim();
        if owner.is_empty() || repo.is_empty() {
            return Err(LabError::Validation("owner and repo are required".to_string()));
        }

        let release = self.fetch_release(owner, repo, request.tag.as_deref()).await?;
        let asset = pick_asset(&release.assets, request.asset_filter.as_deref())
            .ok_or_else(|| LabError::Execution("No matching .bin asset in release".to_string()))?;
        if asset.browser_download_url.is_empty() {
            return Err(LabError::Execution("Asset has no download URL".to_string()));
        }

        let device = non_empty(request.device_id.as_deref()).unwrap_or("ota").replace(' ', "_");
        let firmware = non_empty(request.firmware_id.as_deref()).unwrap_or(repo).replace(' ', "_");
        let ota_dir = self.store.artifacts_dir().join(&device).join(&firmware).join("ota");
        tokio::fs::create_dir_all(&ota_dir).await?;

        let safe_tag = safe_component(release.tag_name.trim());
        let safe_name = safe_component(&asset.name);
        let dest_name = if safe_tag.is_empty() {
            safe_name
        } else {
            format!("{}_{}", safe_tag, safe_name)
        };
        let dest = ota_dir.join(&dest_name);

        log::info!("📥 Downloading {} ({})", asset.name, release.tag_name);
        let response = self.client.get(&asset.browser_download_url).send().await?;
        if !response.status().is_success() {
            return Err(LabError::Http(format!(
                "Download of {} failed: HTTP {}",
                asset.name,
                response.status()
            )));
        }
        let bytes = response.bytes().await?;
        tokio::fs::write(&dest, &bytes).await?;
        log::info!("✅ Saved {} ({} bytes) to {}", asset.name, bytes.len(), dest.display());

        self.store.register(&dest, &dest_name, ArtifactKind::Release)
    }
}

fn non_empty(value: Option<&str>) -> Option<&str> {
    value.map(str::trim).filter(|v| !v.is_empty())
}
