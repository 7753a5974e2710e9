//! Configuration parsing and validation.
//!
//! Context Harness is configured via a TOML file (default: `config/ctx.toml`).
//! The config defines the hash-store database path, retrieval tuning,
//! embedding provider settings, the shared rate limiter and retry policy,
//! control-plane socket/PID paths, and per-instance connector configurations.
//!
//! # Connectors
//!
//! Connectors are keyed by an arbitrary instance name, so more than one
//! instance of a kind can be configured at once, e.g.:
//!
//! ```toml
//! [connectors.filesystem.docs]
//! root = "/srv/docs"
//!
//! [connectors.filesystem.notes]
//! root = "/home/user/notes"
//! ```

use anyhow::{Context, Result};
use serde::Deserialize;
use std::collections::HashMap;
use std::path::{Path, PathBuf};

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub db: DbConfig,
    #[serde(default)]
    pub retrieval: RetrievalConfig,
    #[serde(default)]
    pub embedding: EmbeddingConfig,
    #[serde(default)]
    pub run: RunConfig,
    #[serde(default)]
    pub control: ControlConfig,
    #[serde(default)]
    pub connectors: ConnectorsConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DbConfig {
    pub path: PathBuf,
}

/// Hybrid search defaults, overridable per request.
#[derive(Debug, Deserialize, Clone)]
pub struct RetrievalConfig {
    #[serde(default = "default_size")]
    pub size: i64,
    #[serde(default = "default_k")]
    pub k: i64,
    #[serde(default = "default_weight")]
    pub bm25_weight: f64,
    #[serde(default = "default_weight")]
    pub vector_weight: f64,
    #[serde(default = "default_fusion_method")]
    pub fusion_method: String,
    #[serde(default = "default_rank_constant")]
    pub rank_constant: f64,
    #[serde(default = "default_timeout_seconds")]
    pub timeout_seconds: u64,
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            size: default_size(),
            k: default_k(),
            bm25_weight: default_weight(),
            vector_weight: default_weight(),
            fusion_method: default_fusion_method(),
            rank_constant: default_rank_constant(),
            timeout_seconds: default_timeout_seconds(),
        }
    }
}

fn default_size() -> i64 {
    10
}
fn default_k() -> i64 {
    50
}
fn default_weight() -> f64 {
    0.5
}
fn default_fusion_method() -> String {
    "rrf".to_string()
}
fn default_rank_constant() -> f64 {
    60.0
}
fn default_timeout_seconds() -> u64 {
    30
}

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
    /// Base URL for the Ollama provider. Defaults to `http://localhost:11434`.
    #[serde(default)]
    pub url: Option<String>,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            provider: "disabled".to_string(),
            model: None,
            dims: None,
            batch_size: 64,
            max_retries: 5,
            timeout_secs: 30,
            url: None,
        }
    }
}

fn default_provider() -> String {
    "disabled".to_string()
}
fn default_batch_size() -> usize {
    64
}
fn default_max_retries() -> u32 {
    5
}
fn default_timeout_secs() -> u64 {
    30
}

/// Shared resources for ingestion runs: rate limiter, retry policy, worker
/// concurrency, index bootstrap parameters, and the follow-mode interval floor.
#[derive(Debug, Deserialize, Clone)]
pub struct RunConfig {
    /// Seconds between follow-mode cycles. Rejected outright below the 5-minute floor.
    #[serde(default = "default_follow_interval_secs")]
    pub follow_interval_secs: u64,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_retry_base_delay_ms")]
    pub retry_base_delay_ms: u64,
    #[serde(default = "default_rate_limit")]
    pub rate_limit: f64,
    #[serde(default = "default_rate_burst")]
    pub rate_burst: u32,
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,
    #[serde(default = "default_vector_index_name")]
    pub vector_index_name: String,
    #[serde(default)]
    pub embedding_dimension: Option<usize>,
    /// Bearer token for private repository sources.
    #[serde(default)]
    pub repo_token: Option<String>,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            follow_interval_secs: default_follow_interval_secs(),
            max_retries: default_max_retries(),
            retry_base_delay_ms: default_retry_base_delay_ms(),
            rate_limit: default_rate_limit(),
            rate_burst: default_rate_burst(),
            concurrency: default_concurrency(),
            vector_index_name: default_vector_index_name(),
            embedding_dimension: None,
            repo_token: None,
        }
    }
}

/// Operational guardrail: lower values are rejected at startup, not clamped.
pub const MIN_FOLLOW_INTERVAL_SECS: u64 = 300;

fn default_follow_interval_secs() -> u64 {
    MIN_FOLLOW_INTERVAL_SECS
}
fn default_retry_base_delay_ms() -> u64 {
    500
}
fn default_rate_limit() -> f64 {
    10.0
}
fn default_rate_burst() -> u32 {
    20
}
fn default_concurrency() -> usize {
    4
}
fn default_vector_index_name() -> String {
    "documents".to_string()
}

/// Control-plane RPC socket/PID file locations.
#[derive(Debug, Deserialize, Clone)]
pub struct ControlConfig {
    #[serde(default)]
    pub socket_path: Option<PathBuf>,
    #[serde(default)]
    pub pid_path: Option<PathBuf>,
}

impl Default for ControlConfig {
    fn default() -> Self {
        Self {
            socket_path: None,
            pid_path: None,
        }
    }
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct ConnectorsConfig {
    #[serde(default)]
    pub filesystem: HashMap<String, FilesystemConnectorConfig>,
    #[serde(default)]
    pub git: HashMap<String, GitConnectorConfig>,
    #[serde(default)]
    pub s3: HashMap<String, S3ConnectorConfig>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct FilesystemConnectorConfig {
    pub root: PathBuf,
    #[serde(default = "default_include_globs")]
    pub include_globs: Vec<String>,
    #[serde(default)]
    pub exclude_globs: Vec<String>,
    #[serde(default)]
    pub follow_symlinks: bool,
}

#[derive(Debug, Deserialize, Clone)]
pub struct GitConnectorConfig {
    /// Git repository URL (`https://` or `git@`) or local path.
    pub url: String,
    /// Subdirectory within the repo to scan. Defaults to root (".").
    #[serde(default = "default_git_root")]
    pub root: String,
    #[serde(default = "default_include_globs")]
    pub include_globs: Vec<String>,
    #[serde(default)]
    pub exclude_globs: Vec<String>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct S3ConnectorConfig {
    pub bucket: String,
    #[serde(default)]
    pub prefix: String,
    #[serde(default = "default_s3_region")]
    pub region: String,
    #[serde(default = "default_include_globs")]
    pub include_globs: Vec<String>,
    #[serde(default)]
    pub exclude_globs: Vec<String>,
    #[serde(default)]
    pub endpoint_url: Option<String>,
}

fn default_git_root() -> String {
    ".".to_string()
}

fn default_s3_region() -> String {
    "us-east-1".to_string()
}

fn default_include_globs() -> Vec<String> {
    vec!["**/*.md".to_string(), "**/*.csv".to_string()]
}

impl EmbeddingConfig {
    pub fn is_enabled(&self) -> bool {
        self.provider != "disabled"
    }
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let config: Config = toml::from_str(&content).with_context(|| "Failed to parse config file")?;

    if config.retrieval.size < 1 {
        anyhow::bail!("retrieval.size must be >= 1");
    }
    if !matches!(
        config.retrieval.fusion_method.as_str(),
        "rrf" | "weighted_sum" | "max_score"
    ) {
        anyhow::bail!(
            "Unknown fusion_method: '{}'. Must be rrf, weighted_sum, or max_score.",
            config.retrieval.fusion_method
        );
    }

    if config.run.follow_interval_secs < MIN_FOLLOW_INTERVAL_SECS {
        anyhow::bail!(
            "run.follow_interval_secs ({}) is below the {}s minimum",
            config.run.follow_interval_secs,
            MIN_FOLLOW_INTERVAL_SECS
        );
    }

    if config.embedding.is_enabled() {
        if config.embedding.dims.is_none() || config.embedding.dims == Some(0) {
            anyhow::bail!(
                "embedding.dims must be > 0 when provider is '{}'",
                config.embedding.provider
            );
        }
        if config.embedding.model.is_none() {
            anyhow::bail!(
                "embedding.model must be specified when provider is '{}'",
                config.embedding.provider
            );
        }
    }

    match config.embedding.provider.as_str() {
        "disabled" | "openai" | "ollama" | "local" => {}
        other => anyhow::bail!(
            "Unknown embedding provider: '{}'. Must be disabled, openai, ollama, or local.",
            other
        ),
    }

    if config.connectors.filesystem.is_empty()
        && config.connectors.git.is_empty()
        && config.connectors.s3.is_empty()
    {
        anyhow::bail!("at least one connector must be configured under [connectors]");
    }

    Ok(config)
}

/// Resolves the control-plane socket path, honoring an explicit override,
/// else `$XDG_RUNTIME_DIR/<app>/<app>.sock`, else `<tmp>/<app>-<uid>/<app>.sock`.
pub fn resolve_socket_path(config: &Config) -> PathBuf {
    if let Some(p) = &config.control.socket_path {
        return p.clone();
    }
    runtime_dir().join("ctx.sock")
}

/// Resolves the PID/lock file path paired with the control socket.
pub fn resolve_pid_path(config: &Config) -> PathBuf {
    if let Some(p) = &config.control.pid_path {
        return p.clone();
    }
    runtime_dir().join("ctx.pid")
}

fn runtime_dir() -> PathBuf {
    if let Ok(dir) = std::env::var("XDG_RUNTIME_DIR") {
        return PathBuf::from(dir).join("ctx");
    }
    let uid = current_uid();
    std::env::temp_dir().join(format!("ctx-{}", uid))
}

#[cfg(unix)]
fn current_uid() -> u32 {
    // SAFETY: getuid takes no arguments and cannot fail.
    unsafe { libc_getuid() }
}

#[cfg(not(unix))]
fn current_uid() -> u32 {
    0
}

#[cfg(unix)]
extern "C" {
    #[link_name = "getuid"]
    fn libc_getuid() -> u32;
}
