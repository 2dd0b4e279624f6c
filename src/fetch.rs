//! Script fetching for dependency bundles and the compiler runtime.
//!
//! Security model:
//! - http(s) URLs only from allowed origins
//! - Redirects only followed if they stay within the same origin
//! - `file://` URLs only inside the configured local script directory,
//!   and only .js/.mjs files
//! - `data:`, `blob:` and every other scheme rejected

use crate::config::SandboxConfig;
use anyhow::{anyhow, Result};
use reqwest::{Client, StatusCode};
use std::path::{Path, PathBuf};
use url::Url;

const MAX_REDIRECTS: usize = 5;

/// Where scripts may be fetched from
#[derive(Debug, Clone, Default)]
pub struct FetchConfig {
    /// Allowed origins (e.g., "https://unpkg.com")
    /// An origin is scheme + host + port
    pub allowed_origins: Vec<String>,
    /// Directory file URLs must resolve into
    pub local_dir: Option<PathBuf>,
}

impl From<&SandboxConfig> for FetchConfig {
    fn from(config: &SandboxConfig) -> Self {
        Self {
            allowed_origins: config.allowed_origins.clone(),
            local_dir: config.local_script_dir.clone(),
        }
    }
}

impl FetchConfig {
    pub fn is_origin_allowed(&self, url: &Url) -> bool {
        let origin = url.origin().ascii_serialization();
        self.allowed_origins.iter().any(|allowed| origin == *allowed)
    }

    fn is_path_allowed(&self, path: &Path) -> bool {
        let Some(dir) = &self.local_dir else {
            return false;
        };
        match (dir.canonicalize(), path.canonicalize()) {
            (Ok(dir), Ok(path)) => path.starts_with(dir),
            _ => false,
        }
    }

    fn is_extension_allowed(path: &Path) -> bool {
        matches!(
            path.extension().and_then(|e| e.to_str()),
            Some("js") | Some("mjs")
        )
    }
}

/// Fetch a script's source text.
pub async fn fetch_script(location: &str, config: &FetchConfig) -> Result<String> {
    let url = Url::parse(location).map_err(|e| anyhow!("Invalid URL '{}': {}", location, e))?;

    match url.scheme() {
        "http" | "https" => fetch_remote(url, config).await,
        "file" => read_local(&url, config),
        other => Err(anyhow!("Scripts cannot be loaded from '{}:' URLs", other)),
    }
}

fn read_local(url: &Url, config: &FetchConfig) -> Result<String> {
    let path = url
        .to_file_path()
        .map_err(|_| anyhow!("Failed to convert URL to path: {}", url))?;

    if !config.is_path_allowed(&path) {
        return Err(anyhow!(
            "Access denied: '{}' is outside the local script directory",
            path.display()
        ));
    }

    if !FetchConfig::is_extension_allowed(&path) {
        return Err(anyhow!("Only .js and .mjs files allowed, got: {}", path.display()));
    }

    std::fs::read_to_string(&path).map_err(|e| anyhow!("Failed to read '{}': {}", path.display(), e))
}

async fn fetch_remote(url: Url, config: &FetchConfig) -> Result<String> {
    if !config.is_origin_allowed(&url) {
        return Err(anyhow!(
            "Fetch blocked: origin '{}' is not in the allowlist. Allowed: {:?}",
            url.origin().ascii_serialization(),
            config.allowed_origins
        ));
    }

    let client = Client::builder()
        // Redirects are followed by hand so each hop is checked
        .redirect(reqwest::redirect::Policy::none())
        .build()
        .map_err(|e| anyhow!("Failed to create HTTP client: {}", e))?;

    let mut current = url;
    for _ in 0..=MAX_REDIRECTS {
        log::debug!("fetching script {}", current);
        let response = client
            .get(current.clone())
            .send()
            .await
            .map_err(|e| anyhow!("Fetch failed: {}", e))?;

        let status = response.status();

        if status.is_redirection() {
            let location = response
                .headers()
                .get("location")
                .ok_or_else(|| anyhow!("Redirect without location from {}", current))?
                .to_str()
                .map_err(|_| anyhow!("Invalid redirect location"))?;
            let next = current
                .join(location)
                .map_err(|e| anyhow!("Invalid redirect URL: {}", e))?;

            if next.origin() != current.origin() {
                return Err(anyhow!(
                    "Fetch blocked: redirect to different origin '{}' (original: '{}')",
                    next.origin().ascii_serialization(),
                    current.origin().ascii_serialization()
                ));
            }
            current = next;
            continue;
        }

        if !status.is_success() {
            return Err(anyhow!("{} responded {}", current, describe_status(status)));
        }

        return response
            .text()
            .await
            .map_err(|e| anyhow!("Failed to read response body: {}", e));
    }

    Err(anyhow!("Too many redirects fetching {}", current))
}

fn describe_status(status: StatusCode) -> String {
    format!(
        "{} {}",
        status.as_u16(),
        status.canonical_reason().unwrap_or("Unknown")
    )
}
