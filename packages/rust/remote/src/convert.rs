//! Document format conversion.
//!
//! [`ConvertApiClient`] posts the source to a ConvertAPI-compatible service,
//! which stores the result and answers with a file reference. The client then
//! downloads that reference through the bounded [`Downloader`]. Network
//! errors, timeouts, 429 and 5xx responses are retried with exponential
//! backoff; any other non-success status fails immediately.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use reqwest::multipart::{Form, Part};
use serde::Deserialize;
use tracing::{debug, info, instrument, warn};
use url::Url;

use pdfpipe_normalize::markdown::html_to_markdown;
use pdfpipe_shared::{ConversionConfig, PipelineError, Result};

use crate::USER_AGENT;
use crate::download::{DownloadLimits, Downloader};

// ---------------------------------------------------------------------------
// Boundary types
// ---------------------------------------------------------------------------

/// Formats the pipeline converts between.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Format {
    Pdf,
    Html,
    Md,
}

impl Format {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pdf => "pdf",
            Self::Html => "html",
            Self::Md => "md",
        }
    }

    pub fn content_type(self) -> &'static str {
        match self {
            Self::Pdf => "application/pdf",
            Self::Html => "text/html",
            Self::Md => "text/markdown",
        }
    }
}

impl std::fmt::Display for Format {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What to convert: inline bytes, or a URL the service can fetch itself.
#[derive(Debug, Clone)]
pub enum ConversionInput {
    Bytes { data: Vec<u8>, filename: String },
    Url(Url),
}

/// A materialized conversion result.
#[derive(Debug, Clone)]
pub struct ConvertedFile {
    pub data: Vec<u8>,
    pub file_name: Option<String>,
}

/// Converts a document from one format to another.
#[async_trait]
pub trait Converter: Send + Sync {
    /// Short backend name for logs.
    fn name(&self) -> &'static str;

    async fn convert(&self, input: ConversionInput, from: Format, to: Format)
    -> Result<ConvertedFile>;
}

// ---------------------------------------------------------------------------
// ConvertAPI client
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct ConvertResponse {
    #[serde(rename = "Files", alias = "files", default)]
    files: Vec<ResponseFile>,
}

#[derive(Debug, Deserialize)]
struct ResponseFile {
    #[serde(rename = "Url", alias = "url")]
    url: Option<String>,
    #[serde(rename = "FileName", alias = "fileName")]
    file_name: Option<String>,
}

/// HTTP client for a ConvertAPI-compatible conversion service.
pub struct ConvertApiClient {
    client: Client,
    base_url: String,
    secret: String,
    timeout: Duration,
    max_retries: u32,
    retry_backoff: Duration,
    downloader: Downloader,
    result_limits: DownloadLimits,
}

impl ConvertApiClient {
    /// Build a client from configuration and the service secret.
    pub fn new(config: &ConversionConfig, secret: String) -> Result<Self> {
        let timeout = Duration::from_secs(config.timeout_secs);
        let client = Client::builder()
            .user_agent(USER_AGENT)
            .timeout(timeout)
            .build()
            .map_err(|e| PipelineError::Network(format!("failed to build HTTP client: {e}")))?;

        Ok(Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            secret,
            timeout,
            max_retries: config.max_retries,
            retry_backoff: Duration::from_millis(config.retry_backoff_ms),
            downloader: Downloader::new()?,
            result_limits: DownloadLimits {
                timeout,
                max_bytes: config.max_result_bytes,
            },
        })
    }

    fn endpoint(&self, from: Format, to: Format) -> String {
        format!("{}/convert/{from}/to/{to}", self.base_url)
    }

    fn build_form(input: &ConversionInput, from: Format) -> Result<Form> {
        let form = Form::new().text("StoreFile", "true");
        match input {
            ConversionInput::Bytes { data, filename } => {
                let part = Part::bytes(data.clone())
                    .file_name(filename.clone())
                    .mime_str(from.content_type())
                    .map_err(|e| PipelineError::validation(format!("invalid content type: {e}")))?;
                Ok(form.part("File", part))
            }
            ConversionInput::Url(url) => Ok(form.text("File", url.to_string())),
        }
    }

    /// One request + result download.
    async fn attempt(&self, input: &ConversionInput, from: Format, to: Format) -> Result<ConvertedFile> {
        let form = Self::build_form(input, from)?;
        let response = self
            .client
            .post(self.endpoint(from, to))
            .bearer_auth(&self.secret)
            .multipart(form)
            .send()
            .await
            .map_err(|e| self.transport_error(e))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(PipelineError::conversion_service(status.as_u16(), &body));
        }

        let parsed: ConvertResponse = response
            .json()
            .await
            .map_err(|e| PipelineError::parse(format!("invalid conversion response: {e}")))?;

        let file = parsed.files.into_iter().next();
        let (url, file_name) = match file {
            Some(ResponseFile { url: Some(url), file_name }) => (url, file_name),
            _ => return Err(PipelineError::parse("conversion response missing file Url")),
        };

        let url = Url::parse(&url)
            .map_err(|e| PipelineError::parse(format!("invalid result URL {url:?}: {e}")))?;
        let data = self.downloader.download(&url, self.result_limits).await?;

        Ok(ConvertedFile { data, file_name })
    }

    fn transport_error(&self, e: reqwest::Error) -> PipelineError {
        if e.is_timeout() {
            PipelineError::Timeout {
                what: "conversion request".into(),
                seconds: self.timeout.as_secs(),
            }
        } else {
            PipelineError::Network(format!("conversion request failed: {e}"))
        }
    }
}

/// `base * 2^attempt`, saturating instead of overflowing.
fn backoff_delay(base: Duration, attempt: u32) -> Duration {
    base.saturating_mul(2u32.saturating_pow(attempt))
}

#[async_trait]
impl Converter for ConvertApiClient {
    fn name(&self) -> &'static str {
        "convertapi"
    }

    #[instrument(skip(self, input), fields(from = %from, to = %to))]
    async fn convert(&self, input: ConversionInput, from: Format, to: Format) -> Result<ConvertedFile> {
        let mut attempt = 0;
        loop {
            match self.attempt(&input, from, to).await {
                Ok(file) => {
                    info!(bytes = file.data.len(), retries = attempt, "conversion complete");
                    return Ok(file);
                }
                Err(e) if e.is_transient() && attempt < self.max_retries => {
                    let backoff = backoff_delay(self.retry_backoff, attempt);
                    attempt += 1;
                    warn!(
                        error = %e,
                        attempt,
                        max_retries = self.max_retries,
                        backoff_ms = backoff.as_millis() as u64,
                        "conversion failed, retrying"
                    );
                    tokio::time::sleep(backoff).await;
                }
                Err(e) => return Err(e),
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Offline html → md
// ---------------------------------------------------------------------------

/// Local HTML → Markdown conversion with `htmd`, for setups without a service.
#[derive(Debug, Clone, Copy, Default)]
pub struct HtmdConverter;

#[async_trait]
impl Converter for HtmdConverter {
    fn name(&self) -> &'static str {
        "htmd"
    }

    async fn convert(&self, input: ConversionInput, from: Format, to: Format) -> Result<ConvertedFile> {
        if (from, to) != (Format::Html, Format::Md) {
            return Err(PipelineError::validation(format!(
                "htmd converter only supports html to md, not {from} to {to}"
            )));
        }
        let ConversionInput::Bytes { data, filename } = input else {
            return Err(PipelineError::validation("htmd converter needs inline bytes"));
        };

        let html = String::from_utf8_lossy(&data);
        let markdown = html_to_markdown(&html)?;
        debug!(bytes = markdown.len(), "converted html locally");

        let stem = filename.rsplit_once('.').map_or(filename.as_str(), |(s, _)| s);
        Ok(ConvertedFile {
            data: markdown.into_bytes(),
            file_name: Some(format!("{stem}.md")),
        })
    }
}
