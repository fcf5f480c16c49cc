//! TOML configuration.
//!
//! Every section has serde defaults, so an empty file (or no file at all,
//! see [`Config::default`]) yields a runnable configuration. [`load_config`]
//! parses and validates.

use anyhow::{bail, Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Deserialize, Clone, Default)]
pub struct Config {
    #[serde(default)]
    pub data: DataConfig,
    #[serde(default)]
    pub upstream: UpstreamConfig,
    #[serde(default)]
    pub embedding: EmbeddingConfig,
    #[serde(default)]
    pub sync: SyncConfig,
    #[serde(default)]
    pub retrieval: RetrievalConfig,
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

// ============ [data] ============

#[derive(Debug, Deserialize, Clone)]
pub struct DataConfig {
    #[serde(default = "default_data_root")]
    pub root: PathBuf,
}

impl Default for DataConfig {
    fn default() -> Self {
        Self {
            root: default_data_root(),
        }
    }
}

fn default_data_root() -> PathBuf {
    PathBuf::from("./data")
}

impl DataConfig {
    /// Download staging directory; raw files land under `raw/<version>/`.
    pub fn raw_dir(&self) -> PathBuf {
        self.root.join("raw")
    }

    /// Parent of the generation slots.
    pub fn index_dir(&self) -> PathBuf {
        self.root.join("index")
    }

    pub fn version_file(&self) -> PathBuf {
        self.root.join("local_version.json")
    }
}

// ============ [upstream] ============

#[derive(Debug, Deserialize, Clone)]
pub struct UpstreamConfig {
    #[serde(default = "default_api_base_url")]
    pub api_base_url: String,
    #[serde(default = "default_raw_base_url")]
    pub raw_base_url: String,
    #[serde(default = "default_owner")]
    pub owner: String,
    #[serde(default = "default_repo")]
    pub repo: String,
    #[serde(default = "default_branch")]
    pub branch: String,
    #[serde(default = "default_path")]
    pub path: String,
    #[serde(default = "default_files")]
    pub files: Vec<String>,
    #[serde(default = "default_allowed_hosts")]
    pub allowed_hosts: Vec<String>,
    #[serde(default = "default_allowed_extensions")]
    pub allowed_extensions: Vec<String>,
    #[serde(default = "default_max_file_bytes")]
    pub max_file_bytes: u64,
    #[serde(default = "default_file_timeout_secs")]
    pub file_timeout_secs: u64,
    #[serde(default = "default_api_timeout_secs")]
    pub api_timeout_secs: u64,
    #[serde(default = "default_user_agent")]
    pub user_agent: String,
}

impl Default for UpstreamConfig {
    fn default() -> Self {
        Self {
            api_base_url: default_api_base_url(),
            raw_base_url: default_raw_base_url(),
            owner: default_owner(),
            repo: default_repo(),
            branch: default_branch(),
            path: default_path(),
            files: default_files(),
            allowed_hosts: default_allowed_hosts(),
            allowed_extensions: default_allowed_extensions(),
            max_file_bytes: default_max_file_bytes(),
            file_timeout_secs: default_file_timeout_secs(),
            api_timeout_secs: default_api_timeout_secs(),
            user_agent: default_user_agent(),
        }
    }
}

fn default_api_base_url() -> String {
    "https://api.github.com".to_string()
}
fn default_raw_base_url() -> String {
    "https://raw.githubusercontent.com".to_string()
}
fn default_owner() -> String {
    "edward-playground".to_string()
}
fn default_repo() -> String {
    "aidefense-framework".to_string()
}
fn default_branch() -> String {
    "main".to_string()
}
fn default_path() -> String {
    "tactics".to_string()
}
fn default_files() -> Vec<String> {
    [
        "model.js",
        "harden.js",
        "detect.js",
        "isolate.js",
        "deceive.js",
        "evict.js",
        "restore.js",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect()
}
fn default_allowed_hosts() -> Vec<String> {
    vec![
        "github.com".to_string(),
        "api.github.com".to_string(),
        "raw.githubusercontent.com".to_string(),
    ]
}
fn default_allowed_extensions() -> Vec<String> {
    vec![".js".to_string(), ".json".to_string()]
}
fn default_max_file_bytes() -> u64 {
    10 * 1024 * 1024
}
fn default_file_timeout_secs() -> u64 {
    60
}
fn default_api_timeout_secs() -> u64 {
    30
}
fn default_user_agent() -> String {
    format!("defense-kb/{}", env!("CARGO_PKG_VERSION"))
}

impl UpstreamConfig {
    pub fn file_timeout(&self) -> Duration {
        Duration::from_secs(self.file_timeout_secs)
    }

    pub fn api_timeout(&self) -> Duration {
        Duration::from_secs(self.api_timeout_secs)
    }
}

// ============ [embedding] ============

#[derive(Debug, Deserialize, Clone)]
pub struct EmbeddingConfig {
    #[serde(default = "default_provider")]
    pub provider: String,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub dims: Option<usize>,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default)]
    pub url: Option<String>,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            provider: default_provider(),
            model: None,
            dims: None,
            batch_size: default_batch_size(),
            max_retries: default_max_retries(),
            timeout_secs: default_timeout_secs(),
            url: None,
        }
    }
}

fn default_provider() -> String {
    "local".to_string()
}
fn default_batch_size() -> usize {
    32
}
fn default_max_retries() -> u32 {
    5
}
fn default_timeout_secs() -> u64 {
    30
}

impl EmbeddingConfig {
    pub fn is_enabled(&self) -> bool {
        self.provider != "disabled"
    }
}

// ============ [sync] ============

/// How the active generation is addressed on disk.
#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum SwapMode {
    /// `active/` and `retired/` directories swapped by directory rename.
    #[default]
    Rename,
    /// Immutable `gens/<id>/` directories selected by a `CURRENT` pointer file.
    Pointer,
}

#[derive(Debug, Deserialize, Clone)]
pub struct SyncConfig {
    #[serde(default = "default_interval_secs")]
    pub interval_secs: u64,
    #[serde(default = "default_lock_timeout_secs")]
    pub lock_timeout_secs: u64,
    #[serde(default = "default_sync_timeout_secs")]
    pub sync_timeout_secs: u64,
    #[serde(default = "default_true")]
    pub auto_sync: bool,
    #[serde(default = "default_true")]
    pub sync_on_start: bool,
    #[serde(default)]
    pub swap_mode: SwapMode,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            interval_secs: default_interval_secs(),
            lock_timeout_secs: default_lock_timeout_secs(),
            sync_timeout_secs: default_sync_timeout_secs(),
            auto_sync: true,
            sync_on_start: true,
            swap_mode: SwapMode::default(),
        }
    }
}

fn default_interval_secs() -> u64 {
    3600
}
fn default_lock_timeout_secs() -> u64 {
    1800
}
fn default_sync_timeout_secs() -> u64 {
    1800
}
fn default_true() -> bool {
    true
}

impl SyncConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }

    pub fn lock_timeout(&self) -> Duration {
        Duration::from_secs(self.lock_timeout_secs)
    }

    pub fn sync_timeout(&self) -> Duration {
        Duration::from_secs(self.sync_timeout_secs)
    }
}

// ============ [retrieval] ============

#[derive(Debug, Deserialize, Clone)]
pub struct RetrievalConfig {
    #[serde(default = "default_top_k")]
    pub default_top_k: usize,
    #[serde(default = "default_max_top_k")]
    pub max_top_k: usize,
    #[serde(default = "default_max_query_chars")]
    pub max_query_chars: usize,
    #[serde(default = "default_retry_after_secs")]
    pub retry_after_secs: u64,
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            default_top_k: default_top_k(),
            max_top_k: default_max_top_k(),
            max_query_chars: default_max_query_chars(),
            retry_after_secs: default_retry_after_secs(),
        }
    }
}

fn default_top_k() -> usize {
    5
}
fn default_max_top_k() -> usize {
    20
}
fn default_max_query_chars() -> usize {
    2000
}
fn default_retry_after_secs() -> u64 {
    5
}

// ============ [server] / [logging] ============

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    #[serde(default = "default_bind")]
    pub bind: String,
    /// Requests per minute allowed on each route; 0 disables the limit.
    #[serde(default = "default_rate_limit")]
    pub rate_limit_per_minute: u32,
    /// Stricter limit for `POST /api/v1/sync`; 0 disables it.
    #[serde(default = "default_sync_rate_limit")]
    pub sync_rate_limit_per_minute: u32,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
            rate_limit_per_minute: default_rate_limit(),
            sync_rate_limit_per_minute: default_sync_rate_limit(),
        }
    }
}

fn default_bind() -> String {
    "127.0.0.1:8000".to_string()
}
fn default_rate_limit() -> u32 {
    120
}
fn default_sync_rate_limit() -> u32 {
    5
}

#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Pretty,
    Json,
}

#[derive(Debug, Deserialize, Clone)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
    #[serde(default)]
    pub format: LogFormat,
    /// Optional log file; stderr output is kept either way.
    #[serde(default)]
    pub file: Option<PathBuf>,
    /// JSON-lines file receiving only `audit` events.
    #[serde(default)]
    pub audit_file: Option<PathBuf>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: LogFormat::default(),
            file: None,
            audit_file: None,
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

// ============ loading ============

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let config: Config = toml::from_str(&content).with_context(|| "Failed to parse config file")?;
    validate(&config)?;
    Ok(config)
}

pub fn validate(config: &Config) -> Result<()> {
    let sync = &config.sync;
    if !(60..=86_400).contains(&sync.interval_secs) {
        bail!("sync.interval_secs must be in [60, 86400]");
    }
    if sync.lock_timeout_secs == 0 {
        bail!("sync.lock_timeout_secs must be > 0");
    }
    if sync.sync_timeout_secs == 0 || sync.sync_timeout_secs > sync.lock_timeout_secs {
        bail!("sync.sync_timeout_secs must be > 0 and <= sync.lock_timeout_secs");
    }

    let upstream = &config.upstream;
    if upstream.files.is_empty() {
        bail!("upstream.files must list at least one source file");
    }
    if upstream.max_file_bytes == 0 {
        bail!("upstream.max_file_bytes must be > 0");
    }
    if upstream.allowed_hosts.is_empty() {
        bail!("upstream.allowed_hosts must not be empty");
    }

    let retrieval = &config.retrieval;
    if retrieval.max_top_k == 0 {
        bail!("retrieval.max_top_k must be >= 1");
    }
    if retrieval.default_top_k == 0 || retrieval.default_top_k > retrieval.max_top_k {
        bail!("retrieval.default_top_k must be in [1, retrieval.max_top_k]");
    }
    if retrieval.max_query_chars == 0 {
        bail!("retrieval.max_query_chars must be > 0");
    }

    if config.embedding.batch_size == 0 {
        bail!("embedding.batch_size must be > 0");
    }
    match config.embedding.provider.as_str() {
        "disabled" | "local" => {}
        "openai" | "ollama" => {
            if config.embedding.dims.is_none() || config.embedding.dims == Some(0) {
                bail!(
                    "embedding.dims must be > 0 when provider is '{}'",
                    config.embedding.provider
                );
            }
            if config.embedding.model.is_none() {
                bail!(
                    "embedding.model must be specified when provider is '{}'",
                    config.embedding.provider
                );
            }
        }
        other => bail!(
            "Unknown embedding provider: '{}'. Must be disabled, local, openai, or ollama.",
            other
        ),
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_config(body: &str) -> tempfile::NamedTempFile {
        let mut f = tempfile::NamedTempFile::new().unwrap();
        f.write_all(body.as_bytes()).unwrap();
        f
    }

    #[test]
    fn test_empty_file_uses_defaults() {
        let f = write_config("");
        let cfg = load_config(f.path()).unwrap();
        assert_eq!(cfg.upstream.files.len(), 7);
        assert_eq!(cfg.sync.interval_secs, 3600);
        assert_eq!(cfg.sync.swap_mode, SwapMode::Rename);
        assert_eq!(cfg.retrieval.default_top_k, 5);
        assert_eq!(cfg.data.version_file(), PathBuf::from("./data/local_version.json"));
        assert_eq!(cfg.server.rate_limit_per_minute, 120);
        assert_eq!(cfg.server.sync_rate_limit_per_minute, 5);
        assert!(cfg.logging.audit_file.is_none());
    }

    #[test]
    fn test_example_config_is_valid() {
        let path = Path::new(env!("CARGO_MANIFEST_DIR")).join("config/dkb.example.toml");
        let cfg = load_config(&path).unwrap();
        assert_eq!(cfg.embedding.provider, "local");
        assert_eq!(cfg.server.bind, "127.0.0.1:8000");
    }

    #[test]
    fn test_sections_override_defaults() {
        let f = write_config(
            r#"
            [data]
            root = "/var/lib/dkb"

            [sync]
            interval_secs = 600
            swap_mode = "pointer"

            [server]
            sync_rate_limit_per_minute = 2

            [logging]
            format = "json"
            audit_file = "/var/log/dkb/audit.jsonl"
            "#,
        );
        let cfg = load_config(f.path()).unwrap();
        assert_eq!(cfg.data.index_dir(), PathBuf::from("/var/lib/dkb/index"));
        assert_eq!(cfg.sync.interval_secs, 600);
        assert_eq!(cfg.sync.swap_mode, SwapMode::Pointer);
        assert_eq!(cfg.logging.format, LogFormat::Json);
        assert_eq!(cfg.server.sync_rate_limit_per_minute, 2);
        assert_eq!(cfg.server.rate_limit_per_minute, 120);
        assert_eq!(
            cfg.logging.audit_file.as_deref(),
            Some(Path::new("/var/log/dkb/audit.jsonl"))
        );
    }

    #[test]
    fn test_rejects_out_of_range_interval() {
        let f = write_config("[sync]\ninterval_secs = 5\n");
        let err = load_config(f.path()).unwrap_err();
        assert!(err.to_string().contains("interval_secs"));
    }

    #[test]
    fn test_rejects_sync_timeout_above_lock_timeout() {
        let f = write_config("[sync]\nlock_timeout_secs = 100\nsync_timeout_secs = 200\n");
        assert!(load_config(f.path()).is_err());
    }

    #[test]
    fn test_remote_provider_requires_model_and_dims() {
        let f = write_config("[embedding]\nprovider = \"openai\"\n");
        let err = load_config(f.path()).unwrap_err();
        assert!(err.to_string().contains("embedding.dims"));
    }

    #[test]
    fn test_unknown_provider() {
        let f = write_config("[embedding]\nprovider = \"magic\"\n");
        assert!(load_config(f.path()).is_err());
    }
}
