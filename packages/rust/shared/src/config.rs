//! Application configuration for pdfpipe.
//!
//! User config lives at `~/.pdfpipe/pdfpipe.toml`.
//! CLI flags override config file values, which override defaults.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{PipelineError, Result};

/// Default configuration file name.
const CONFIG_FILE_NAME: &str = "pdfpipe.toml";

/// Default config directory name under the user's home.
const CONFIG_DIR_NAME: &str = ".pdfpipe";

/// Env var overriding `[database] path`.
pub const DATABASE_ENV: &str = "PDFPIPE_DATABASE";

/// Env var overriding `[blobs] root`.
pub const BLOB_ROOT_ENV: &str = "PDFPIPE_BLOB_ROOT";

// ---------------------------------------------------------------------------
// Config structs (matching pdfpipe.toml schema)
// ---------------------------------------------------------------------------

/// Top-level application config, deserialized from TOML.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub database: DatabaseConfig,

    #[serde(default)]
    pub blobs: BlobConfig,

    #[serde(default)]
    pub conversion: ConversionConfig,

    #[serde(default)]
    pub download: DownloadConfig,

    #[serde(default)]
    pub chunking: ChunkingConfig,

    #[serde(default)]
    pub pipeline: PipelineConfig,
}

/// `[database]` section.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DatabaseConfig {
    /// Path to the libSQL database file. No default: a worker must be told where its state lives.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
}

/// `[blobs]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BlobConfig {
    /// Root directory of the filesystem blob store.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub root: Option<String>,

    /// Lifetime of presigned read URLs.
    #[serde(default = "default_presign_expiry")]
    pub presign_expiry_secs: u64,
}

impl Default for BlobConfig {
    fn default() -> Self {
        Self {
            root: None,
            presign_expiry_secs: default_presign_expiry(),
        }
    }
}

fn default_presign_expiry() -> u64 {
    900
}

/// Which backend turns cleaned HTML into Markdown.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MarkdownBackend {
    /// The remote conversion service.
    #[default]
    Service,
    /// Local conversion with `htmd`.
    Htmd,
}

/// `[conversion]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConversionConfig {
    /// Base URL of the conversion service.
    #[serde(default = "default_conversion_url")]
    pub base_url: String,

    /// Name of the env var holding the service secret (never store the secret itself).
    #[serde(default = "default_api_key_env")]
    pub api_key_env: String,

    /// Per-request timeout.
    #[serde(default = "default_conversion_timeout")]
    pub timeout_secs: u64,

    /// Retries after the first attempt for transient failures.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    /// Initial retry delay; doubles after each attempt.
    #[serde(default = "default_retry_backoff")]
    pub retry_backoff_ms: u64,

    /// Byte cap when downloading a converted file.
    #[serde(default = "default_max_result_bytes")]
    pub max_result_bytes: u64,

    #[serde(default)]
    pub markdown_backend: MarkdownBackend,
}

impl Default for ConversionConfig {
    fn default() -> Self {
        Self {
            base_url: default_conversion_url(),
            api_key_env: default_api_key_env(),
            timeout_secs: default_conversion_timeout(),
            max_retries: default_max_retries(),
            retry_backoff_ms: default_retry_backoff(),
            max_result_bytes: default_max_result_bytes(),
            markdown_backend: MarkdownBackend::default(),
        }
    }
}

fn default_conversion_url() -> String {
    "https://v2.convertapi.com".into()
}
fn default_api_key_env() -> String {
    "CONVERT_API_SECRET".into()
}
fn default_conversion_timeout() -> u64 {
    120
}
fn default_max_retries() -> u32 {
    2
}
fn default_retry_backoff() -> u64 {
    500
}
fn default_max_result_bytes() -> u64 {
    64 * 1024 * 1024
}

/// `[download]` section: bounds for fetching the original PDF.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DownloadConfig {
    #[serde(default = "default_download_timeout")]
    pub timeout_secs: u64,

    #[serde(default = "default_download_max_bytes")]
    pub max_bytes: u64,
}

impl Default for DownloadConfig {
    fn default() -> Self {
        Self {
            timeout_secs: default_download_timeout(),
            max_bytes: default_download_max_bytes(),
        }
    }
}

fn default_download_timeout() -> u64 {
    60
}
fn default_download_max_bytes() -> u64 {
    30 * 1024 * 1024
}

/// `[chunking]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChunkingConfig {
    /// Characters per text chunk.
    #[serde(default = "default_chunk_size")]
    pub chunk_size: usize,

    /// Characters shared by consecutive text chunks.
    #[serde(default = "default_chunk_overlap")]
    pub chunk_overlap: usize,

    /// Bytes per markdown chunk.
    #[serde(default = "default_markdown_chunk_bytes")]
    pub markdown_chunk_bytes: usize,

    /// Markdown up to this many bytes is also stored inline on the document.
    #[serde(default = "default_markdown_inline_limit")]
    pub markdown_inline_limit: usize,

    /// Characters kept as a preview when the markdown is too large to inline.
    #[serde(default = "default_preview_chars")]
    pub preview_chars: usize,
}

impl Default for ChunkingConfig {
    fn default() -> Self {
        Self {
            chunk_size: default_chunk_size(),
            chunk_overlap: default_chunk_overlap(),
            markdown_chunk_bytes: default_markdown_chunk_bytes(),
            markdown_inline_limit: default_markdown_inline_limit(),
            preview_chars: default_preview_chars(),
        }
    }
}

fn default_chunk_size() -> usize {
    1600
}
fn default_chunk_overlap() -> usize {
    200
}
fn default_markdown_chunk_bytes() -> usize {
    200_000
}
fn default_markdown_inline_limit() -> usize {
    200_000
}
fn default_preview_chars() -> usize {
    2_000
}

/// How a `failed` document re-enters the pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RetryPolicy {
    /// Always start over at `processing:pdf_to_html`.
    #[default]
    Restart,
    /// Re-enter at the stage that failed when its inputs are still available.
    Resume,
}

/// Which HTML normalizer strategy to use.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NormalizerKind {
    /// DOM-based block reconstruction.
    #[default]
    Structured,
    /// Regex stripping only.
    Regex,
}

/// `[pipeline]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineConfig {
    /// Maximum router invocations per document per drive.
    #[serde(default = "default_max_iterations")]
    pub max_iterations: usize,

    #[serde(default)]
    pub retry_policy: RetryPolicy,

    #[serde(default)]
    pub normalizer: NormalizerKind,

    /// Documents picked up per batch run.
    #[serde(default = "default_batch_limit")]
    pub batch_limit: u32,

    /// Age after which a `processing:*` claim counts as abandoned.
    #[serde(default = "default_stale_after")]
    pub stale_after_secs: u64,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            max_iterations: default_max_iterations(),
            retry_policy: RetryPolicy::default(),
            normalizer: NormalizerKind::default(),
            batch_limit: default_batch_limit(),
            stale_after_secs: default_stale_after(),
        }
    }
}

fn default_max_iterations() -> usize {
    10
}
fn default_batch_limit() -> u32 {
    10
}
fn default_stale_after() -> u64 {
    1800
}

// ---------------------------------------------------------------------------
// Runtime settings (merged from config + CLI flags)
// ---------------------------------------------------------------------------

/// Runtime pipeline settings, merged from config file + CLI flags.
#[derive(Debug, Clone)]
pub struct PipelineSettings {
    pub chunk_size: usize,
    pub chunk_overlap: usize,
    pub markdown_chunk_bytes: usize,
    pub markdown_inline_limit: usize,
    pub preview_chars: usize,
    pub max_iterations: usize,
    pub retry_policy: RetryPolicy,
    pub presign_expiry: Duration,
    pub download_timeout: Duration,
    pub download_max_bytes: u64,
}

impl Default for PipelineSettings {
    fn default() -> Self {
        Self::from(&AppConfig::default())
    }
}

impl From<&AppConfig> for PipelineSettings {
    fn from(config: &AppConfig) -> Self {
        Self {
            chunk_size: config.chunking.chunk_size,
            chunk_overlap: config.chunking.chunk_overlap,
            markdown_chunk_bytes: config.chunking.markdown_chunk_bytes,
            markdown_inline_limit: config.chunking.markdown_inline_limit,
            preview_chars: config.chunking.preview_chars,
            max_iterations: config.pipeline.max_iterations,
            retry_policy: config.pipeline.retry_policy,
            presign_expiry: Duration::from_secs(config.blobs.presign_expiry_secs),
            download_timeout: Duration::from_secs(config.download.timeout_secs),
            download_max_bytes: config.download.max_bytes,
        }
    }
}

// ---------------------------------------------------------------------------
// Config loading
// ---------------------------------------------------------------------------

/// Get the path to the config directory (`~/.pdfpipe/`).
pub fn config_dir() -> Result<PathBuf> {
    let home = dirs::home_dir()
        .ok_or_else(|| PipelineError::config("could not determine home directory"))?;
    Ok(home.join(CONFIG_DIR_NAME))
}

/// Get the path to the config file (`~/.pdfpipe/pdfpipe.toml`).
pub fn config_file_path() -> Result<PathBuf> {
    Ok(config_dir()?.join(CONFIG_FILE_NAME))
}

/// Load the application config from disk. Returns defaults if the file does not exist.
pub fn load_config() -> Result<AppConfig> {
    let path = config_file_path()?;

    if !path.exists() {
        tracing::debug!(?path, "config file not found, using defaults");
        return Ok(AppConfig::default());
    }

    load_config_from(&path)
}

/// Load the application config from a specific file path.
pub fn load_config_from(path: &Path) -> Result<AppConfig> {
    let content = std::fs::read_to_string(path).map_err(|e| PipelineError::io(path, e))?;

    toml::from_str(&content)
        .map_err(|e| PipelineError::config(format!("failed to parse {}: {e}", path.display())))
}

/// Create the config directory and write a default config file.
/// Returns the path to the created file.
pub fn init_config() -> Result<PathBuf> {
    let dir = config_dir()?;
    std::fs::create_dir_all(&dir).map_err(|e| PipelineError::io(&dir, e))?;

    let path = dir.join(CONFIG_FILE_NAME);
    let config = AppConfig::default();
    let content =
        toml::to_string_pretty(&config).map_err(|e| PipelineError::config(e.to_string()))?;

    std::fs::write(&path, content).map_err(|e| PipelineError::io(&path, e))?;
    tracing::info!(?path, "created default config file");

    Ok(path)
}

/// Resolve the database path: `PDFPIPE_DATABASE`, then `[database] path`.
pub fn resolve_database_path(config: &AppConfig) -> Result<PathBuf> {
    resolve_required_path(DATABASE_ENV, config.database.path.as_deref(), "[database] path")
}

/// Resolve the blob root: `PDFPIPE_BLOB_ROOT`, then `[blobs] root`.
pub fn resolve_blob_root(config: &AppConfig) -> Result<PathBuf> {
    resolve_required_path(BLOB_ROOT_ENV, config.blobs.root.as_deref(), "[blobs] root")
}

fn resolve_required_path(env_var: &str, configured: Option<&str>, key: &str) -> Result<PathBuf> {
    let value = std::env::var(env_var)
        .ok()
        .filter(|v| !v.trim().is_empty())
        .or_else(|| configured.map(str::to_string))
        .ok_or_else(|| {
            PipelineError::config(format!("{key} is not set. Set it in the config file or export {env_var}."))
        })?;
    Ok(expand_home(&value))
}

/// Expand a leading `~/` to the user's home directory.
pub fn expand_home(path: &str) -> PathBuf {
    match (path.strip_prefix("~/"), dirs::home_dir()) {
        (Some(rest), Some(home)) => home.join(rest),
        _ => PathBuf::from(path),
    }
}

/// Read the conversion-service secret from the env var named in the config.
pub fn conversion_secret(config: &AppConfig) -> Result<String> {
    let var_name = &config.conversion.api_key_env;
    match std::env::var(var_name) {
        Ok(val) if !val.is_empty() => Ok(val),
        _ => Err(PipelineError::config(format!(
            "conversion service secret not found. Set the {var_name} environment variable."
        ))),
    }
}
