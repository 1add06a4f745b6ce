// src/release/github.rs

//! GitHub releases as a source of service wheels

use super::wheel::{WHEEL_SUFFIX, WheelInstaller};
use super::{Artifact, ReleaseProvider, parse_version, sha256_file};
use crate::error::{Error, Result};
use reqwest::StatusCode;
use reqwest::blocking::{Client, Response};
use semver::Version;
use serde::Deserialize;
use serde::de::DeserializeOwned;
use std::fs::{self, File};
use std::io;
use std::path::Path;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Repository publishing SyrvisCore service releases
pub const DEFAULT_REPO: &str = "kevinteg/SyrvisCore";

const DEFAULT_API_BASE: &str = "https://api.github.com";

/// Default timeout for API requests (30 seconds)
const HTTP_TIMEOUT: Duration = Duration::from_secs(30);

/// Timeout for asset downloads (5 minutes)
const DOWNLOAD_TIMEOUT: Duration = Duration::from_secs(300);

/// Maximum retry attempts for failed requests
const MAX_RETRIES: u32 = 3;

/// Retry delay in milliseconds
const RETRY_DELAY_MS: u64 = 1000;

/// Releases fetched per listing request
const RELEASES_PER_PAGE: u32 = 20;

const ACCEPT_JSON: &str = "application/vnd.github.v3+json";
const ACCEPT_BINARY: &str = "application/octet-stream";

/// A GitHub release
#[derive(Debug, Clone, Deserialize)]
pub struct Release {
    pub tag_name: String,
    #[serde(default)]
    pub draft: bool,
    #[serde(default)]
    pub prerelease: bool,
    #[serde(default)]
    pub assets: Vec<Asset>,
}

/// A downloadable file attached to a release
#[derive(Debug, Clone, Deserialize)]
pub struct Asset {
    pub name: String,
    pub browser_download_url: String,
    #[serde(default)]
    pub size: u64,
}

impl Release {
    /// Service releases are tagged `v<semver>`; manager releases `manager-v<semver>`
    pub fn is_service_release(&self) -> bool {
        !self.tag_name.starts_with("manager-") && !self.draft && !self.prerelease
    }

    pub fn version(&self) -> Result<Version> {
        parse_version(&self.tag_name)
    }

    /// The `syrviscore-<version>-*.whl` service wheel
    pub fn wheel_asset(&self) -> Option<&Asset> {
        self.assets.iter().find(|asset| {
            asset.name.starts_with("syrviscore-")
                && asset.name.ends_with(WHEEL_SUFFIX)
                && !asset.name.contains("manager")
        })
    }

    /// Optional default configuration shipped with the release
    pub fn config_asset(&self) -> Option<&Asset> {
        self.assets.iter().find(|asset| asset.name == "config.yaml")
    }

    /// Optional environment template shipped with the release
    pub fn env_template_asset(&self) -> Option<&Asset> {
        self.assets
            .iter()
            .find(|asset| asset.name == ".env.template" || asset.name == "env.template")
    }
}

/// Pick the newest service release from a listing (GitHub lists newest first)
pub fn select_latest(releases: Vec<Release>) -> Option<Release> {
    releases.into_iter().find(Release::is_service_release)
}

/// HTTP client for a GitHub repository's releases, with retry support
pub struct GitHubReleases {
    client: Client,
    api_base: String,
    repo: String,
    max_retries: u32,
    wheels: WheelInstaller,
}

impl GitHubReleases {
    /// Create a client for `owner/name`
    pub fn new(repo: impl Into<String>) -> Result<Self> {
        let client = Client::builder()
            .timeout(HTTP_TIMEOUT)
            .user_agent(concat!("syrvisctl/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| Error::Network(format!("failed to create HTTP client: {}", e)))?;

        Ok(Self {
            client,
            api_base: DEFAULT_API_BASE.to_string(),
            repo: repo.into(),
            max_retries: MAX_RETRIES,
            wheels: WheelInstaller::default(),
        })
    }

    /// Build version virtualenvs with `installer`
    pub fn with_installer(mut self, installer: WheelInstaller) -> Self {
        self.wheels = installer;
        self
    }

    /// Point at a different API endpoint (GitHub Enterprise, mirrors)
    pub fn with_api_base(mut self, api_base: impl Into<String>) -> Self {
        self.api_base = api_base.into().trim_end_matches('/').to_string();
        self
    }

    fn releases_url(&self) -> String {
        format!("{}/repos/{}/releases", self.api_base, self.repo)
    }

    /// Newest non-draft, non-prerelease service release
    pub fn latest_release(&self) -> Result<Release> {
        let url = format!("{}?per_page={}", self.releases_url(), RELEASES_PER_PAGE);
        let releases: Vec<Release> = self.get_json(&url)?;
        select_latest(releases)
            .ok_or_else(|| Error::ReleaseNotFound(format!("latest release of {}", self.repo)))
    }

    /// Release tagged `v<version>`
    pub fn release(&self, version: &Version) -> Result<Release> {
        let url = format!("{}/tags/v{}", self.releases_url(), version);
        self.get_json(&url).map_err(|e| match e {
            Error::ReleaseNotFound(_) => Error::ReleaseNotFound(format!("v{}", version)),
            other => other,
        })
    }

    fn get_json<T: DeserializeOwned>(&self, url: &str) -> Result<T> {
        debug!("GET {}", url);
        let response = self.send_with_retry(url, ACCEPT_JSON, HTTP_TIMEOUT)?;
        response
            .json()
            .map_err(|e| Error::Unavailable(format!("malformed response from {}: {}", url, e)))
    }

    /// Download `url` to `dest`, writing a temporary file first
    pub fn download_file(&self, url: &str, dest: &Path) -> Result<()> {
        info!("Downloading {} to {}", url, dest.display());

        let mut response = self.send_with_retry(url, ACCEPT_BINARY, DOWNLOAD_TIMEOUT)?;
        let temp_path = dest.with_extension("part");
        let mut file = File::create(&temp_path)?;
        if let Err(e) = io::copy(&mut response, &mut file) {
            let _ = fs::remove_file(&temp_path);
            return Err(Error::Network(format!("failed to read {}: {}", url, e)));
        }
        fs::rename(&temp_path, dest)?;

        debug!("Downloaded {}", dest.display());
        Ok(())
    }

    fn send_with_retry(&self, url: &str, accept: &str, timeout: Duration) -> Result<Response> {
        let mut attempt = 0;
        loop {
            attempt += 1;
            match self
                .client
                .get(url)
                .header("Accept", accept)
                .timeout(timeout)
                .send()
            {
                Ok(response) if response.status().is_success() => return Ok(response),
                Ok(response) if response.status() == StatusCode::NOT_FOUND => {
                    return Err(Error::ReleaseNotFound(url.to_string()));
                }
                Ok(response) => {
                    return Err(Error::Unavailable(format!(
                        "HTTP {} from {}",
                        response.status(),
                        url
                    )));
                }
                Err(e) => {
                    if attempt >= self.max_retries {
                        return Err(Error::Network(format!(
                            "request to {} failed after {} attempts: {}",
                            url, attempt, e
                        )));
                    }
                    warn!("Request attempt {} failed: {}, retrying...", attempt, e);
                    std::thread::sleep(Duration::from_millis(RETRY_DELAY_MS * attempt as u64));
                }
            }
        }
    }
}

impl ReleaseProvider for GitHubReleases {
    fn latest(&self) -> Result<Version> {
        self.latest_release()?.version()
    }

    fn fetch(&self, version: &Version, dest: &Path) -> Result<Artifact> {
        let release = self.release(version)?;
        let asset = release.wheel_asset().ok_or_else(|| {
            Error::ReleaseNotFound(format!("service wheel for v{}", version))
        })?;

        let download_dir = tempfile::tempdir()?;
        let wheel_path = download_dir.path().join(&asset.name);
        self.download_file(&asset.browser_download_url, &wheel_path)?;
        let sha256 = sha256_file(&wheel_path)?;

        self.wheels.install(&wheel_path, dest)?;

        let build_dir = dest.join("build");
        for (extra, file_name) in [
            (release.config_asset(), "config.yaml"),
            (release.env_template_asset(), ".env.template"),
        ] {
            if let Some(extra) = extra {
                fs::create_dir_all(&build_dir)?;
                self.download_file(&extra.browser_download_url, &build_dir.join(file_name))?;
            }
        }

        Ok(Artifact {
            source: asset.browser_download_url.clone(),
            sha256,
        })
    }
}
