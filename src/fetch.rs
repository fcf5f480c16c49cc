//! Content fetcher.
//!
//! Resolves the latest upstream content version and downloads source files
//! for a version into `raw/<version>/`. Every URL is checked against the
//! origin allow-list and every destination against the staging directory
//! before any I/O happens.
//!
//! The network sits behind the [`Transport`] trait so tests drive the
//! fetcher with an in-memory fake.

use async_trait::async_trait;
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use url::Url;

use crate::config::UpstreamConfig;
use crate::error::FetchError;
use crate::security;

/// One whole-body HTTP GET.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Fetch `url`, failing with [`FetchError::TooLarge`] once the body would
    /// exceed `max_bytes`.
    async fn get(&self, url: &Url, max_bytes: u64) -> Result<Vec<u8>, FetchError>;
}

/// [`Transport`] over `reqwest`.
pub struct HttpTransport {
    client: reqwest::Client,
}

impl HttpTransport {
    pub fn new(user_agent: &str) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .user_agent(user_agent)
            .redirect(reqwest::redirect::Policy::none())
            .build()?;
        Ok(Self { client })
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn get(&self, url: &Url, max_bytes: u64) -> Result<Vec<u8>, FetchError> {
        let network = |e: reqwest::Error| FetchError::Network {
            url: url.to_string(),
            message: e.to_string(),
        };

        let mut response = self
            .client
            .get(url.clone())
            .header("Accept", "application/json, text/plain, */*")
            .send()
            .await
            .map_err(network)?;

        let status = response.status();
        if !status.is_success() {
            return Err(FetchError::Status {
                url: url.to_string(),
                status: status.as_u16(),
            });
        }

        if let Some(len) = response.content_length() {
            if len > max_bytes {
                return Err(FetchError::TooLarge {
                    file_id: url.to_string(),
                    size: len,
                    limit: max_bytes,
                });
            }
        }

        let mut body = Vec::new();
        while let Some(chunk) = response.chunk().await.map_err(network)? {
            body.extend_from_slice(&chunk);
            if body.len() as u64 > max_bytes {
                return Err(FetchError::TooLarge {
                    file_id: url.to_string(),
                    size: body.len() as u64,
                    limit: max_bytes,
                });
            }
        }

        Ok(body)
    }
}

/// A downloaded source file.
#[derive(Debug, Clone)]
pub struct FetchedFile {
    pub file_id: String,
    pub path: PathBuf,
    pub sha256: String,
    pub bytes: u64,
}

pub struct ContentFetcher {
    transport: Arc<dyn Transport>,
    config: UpstreamConfig,
    raw_dir: PathBuf,
}

impl ContentFetcher {
    pub fn new(transport: Arc<dyn Transport>, config: UpstreamConfig, raw_dir: PathBuf) -> Self {
        Self {
            transport,
            config,
            raw_dir,
        }
    }

    pub fn files(&self) -> &[String] {
        &self.config.files
    }

    /// URL of the commit endpoint for the configured branch.
    pub fn latest_version_url(&self) -> String {
        format!(
            "{}/repos/{}/{}/commits/{}",
            self.config.api_base_url.trim_end_matches('/'),
            self.config.owner,
            self.config.repo,
            self.config.branch
        )
    }

    /// Raw URL of `file_id` pinned to `version`.
    pub fn file_url(&self, file_id: &str, version: &str) -> String {
        let path = self.config.path.trim_matches('/');
        let mut url = format!(
            "{}/{}/{}/{}",
            self.config.raw_base_url.trim_end_matches('/'),
            self.config.owner,
            self.config.repo,
            version
        );
        if !path.is_empty() {
            url.push('/');
            url.push_str(path);
        }
        url.push('/');
        url.push_str(file_id);
        url
    }

    /// Resolve the latest content version (commit SHA) of the branch.
    pub async fn latest_version(&self) -> Result<String, FetchError> {
        let raw = self.latest_version_url();
        let url = security::validate_origin(&raw, &self.config.allowed_hosts)?;

        let body = self
            .get_with_timeout(&url, 1024 * 1024, self.config.api_timeout())
            .await?;

        let json: serde_json::Value = serde_json::from_slice(&body)
            .map_err(|e| FetchError::Malformed(format!("commit response: {e}")))?;
        let sha = json
            .get("sha")
            .and_then(|v| v.as_str())
            .ok_or_else(|| FetchError::Malformed("commit response has no 'sha'".into()))?;

        security::validate_commit_sha(sha)
    }

    /// Directory holding the raw files of `version`.
    pub fn version_dir(&self, version: &str) -> Result<PathBuf, FetchError> {
        security::confine_path(&self.raw_dir, Path::new(version))
    }

    /// Download one file of `version` into `raw/<version>/<file_id>`.
    pub async fn fetch(&self, file_id: &str, version: &str) -> Result<FetchedFile, FetchError> {
        let version = security::validate_commit_sha(version)?;
        let file_id = security::sanitize_file_id(file_id, &self.config.allowed_extensions)?;

        let url = security::validate_origin(
            &self.file_url(&file_id, &version),
            &self.config.allowed_hosts,
        )?;
        let dest = security::confine_path(&self.raw_dir, &Path::new(&version).join(&file_id))?;

        let body = self
            .get_with_timeout(&url, self.config.max_file_bytes, self.config.file_timeout())
            .await
            .map_err(|e| match e {
                FetchError::TooLarge { size, limit, .. } => FetchError::TooLarge {
                    file_id: file_id.clone(),
                    size,
                    limit,
                },
                other => other,
            })?;

        let sha256 = hex::encode(Sha256::digest(&body));
        write_atomically(&dest, &body).await?;

        tracing::info!(
            file = %file_id,
            bytes = body.len(),
            sha256 = %sha256,
            "downloaded source file"
        );

        Ok(FetchedFile {
            file_id,
            path: dest,
            sha256,
            bytes: body.len() as u64,
        })
    }

    /// Download every configured file, stopping at the first failure.
    pub async fn fetch_all(&self, version: &str) -> Result<Vec<FetchedFile>, FetchError> {
        let mut out = Vec::with_capacity(self.config.files.len());
        for file_id in &self.config.files {
            out.push(self.fetch(file_id, version).await?);
        }
        Ok(out)
    }

    /// Remove raw snapshots other than `keep`. Best effort.
    pub fn prune(&self, keep: &str) {
        let Ok(entries) = std::fs::read_dir(&self.raw_dir) else {
            return;
        };
        for entry in entries.flatten() {
            if entry.file_name().to_str() == Some(keep) {
                continue;
            }
            if let Err(e) = std::fs::remove_dir_all(entry.path()) {
                tracing::debug!(path = %entry.path().display(), error = %e, "failed to prune raw snapshot");
            }
        }
    }

    async fn get_with_timeout(
        &self,
        url: &Url,
        max_bytes: u64,
        timeout: Duration,
    ) -> Result<Vec<u8>, FetchError> {
        match tokio::time::timeout(timeout, self.transport.get(url, max_bytes)).await {
            Ok(result) => result,
            Err(_) => Err(FetchError::Timeout {
                url: url.to_string(),
                secs: timeout.as_secs(),
            }),
        }
    }
}

async fn write_atomically(dest: &Path, body: &[u8]) -> Result<(), FetchError> {
    let io = |path: &Path| {
        let path = path.to_path_buf();
        move |source| FetchError::Io { path, source }
    };

    if let Some(parent) = dest.parent() {
        tokio::fs::create_dir_all(parent).await.map_err(io(parent))?;
    }

    let tmp = dest.with_extension("part");
    tokio::fs::write(&tmp, body).await.map_err(io(&tmp))?;
    security::set_private_permissions(&tmp).map_err(io(&tmp))?;
    tokio::fs::rename(&tmp, dest).await.map_err(io(dest))?;
    Ok(())
}
