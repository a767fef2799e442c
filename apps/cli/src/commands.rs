//! CLI command definitions, routing, and tracing setup.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use color_eyre::eyre::{Result, eyre};
use indicatif::{ProgressBar, ProgressStyle};
use pdfpipe_core::{Collaborators, DriveOutcome, Pipeline, ProgressReporter};
use pdfpipe_extract::PdfExtractParser;
use pdfpipe_normalize::normalizer_for;
use pdfpipe_remote::{ConvertApiClient, Converter, Downloader, FsBlobStore, HtmdConverter};
use pdfpipe_shared::{
    AppConfig, DocumentStatus, MarkdownBackend, PipelineError, PipelineSettings,
    conversion_secret, init_config, load_config, resolve_blob_root, resolve_database_path,
};
use pdfpipe_storage::Storage;
use tracing::{info, warn};

// ---------------------------------------------------------------------------
// CLI structure
// ---------------------------------------------------------------------------

/// pdfpipe: turn uploaded PDFs into markdown and page-addressed text chunks.
#[derive(Parser)]
#[command(
    name = "pdfpipe",
    version,
    about = "Resumable PDF to HTML, markdown and plain-text pipeline worker.",
    long_about = None,
)]
pub(crate) struct Cli {
    /// Log format: text (default) or json.
    #[arg(long, default_value = "text", global = true)]
    pub log_format: LogFormat,

    /// Verbosity level (-v, -vv, -vvv).
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    #[command(subcommand)]
    pub command: Command,
}

/// Log output format.
#[derive(Clone, Debug, clap::ValueEnum)]
pub(crate) enum LogFormat {
    Text,
    Json,
}

/// Top-level CLI subcommands.
#[derive(Subcommand)]
pub(crate) enum Command {
    /// Drive one document, or a batch of claimable documents, to completion.
    Process {
        /// Process only this document.
        #[arg(long, alias = "pdfId")]
        pdf_id: Option<String>,

        /// Documents picked up in batch mode (defaults to `[pipeline] batch_limit`).
        #[arg(long)]
        limit: Option<u32>,

        /// Characters per text chunk.
        #[arg(long, alias = "chunkSize")]
        chunk_size: Option<usize>,

        /// Characters shared by consecutive text chunks.
        #[arg(long, alias = "chunkOverlap")]
        chunk_overlap: Option<usize>,
    },

    /// Store a local PDF and record it as uploaded.
    Submit {
        /// Path to the PDF file.
        file: PathBuf,

        /// Owner recorded on the document.
        #[arg(long, default_value = "default")]
        owner: String,

        /// Print the document as JSON.
        #[arg(long)]
        json: bool,
    },

    /// Show one document's status and outputs.
    Status {
        /// Document ID.
        id: String,

        /// Print the document as JSON.
        #[arg(long)]
        json: bool,
    },

    /// Reset documents stuck mid-stage back to pending.
    Recover {
        /// Claims older than this many seconds count as abandoned
        /// (defaults to `[pipeline] stale_after_secs`).
        #[arg(long)]
        older_than_secs: Option<u64>,
    },

    /// Delete a document, its chunks and its blobs.
    Delete {
        /// Document ID.
        id: String,
    },

    /// Configuration management.
    Config {
        /// Config subcommand.
        #[command(subcommand)]
        action: ConfigAction,
    },
}

/// Config subcommands.
#[derive(Subcommand)]
pub(crate) enum ConfigAction {
    /// Initialize config file with defaults.
    Init,
    /// Show resolved configuration.
    Show,
}

// ---------------------------------------------------------------------------
// Tracing setup
// ---------------------------------------------------------------------------

/// Initialize tracing based on CLI flags.
pub(crate) fn init_tracing(cli: &Cli) {
    use tracing_subscriber::{EnvFilter, fmt};

    let filter = match cli.verbose {
        0 => "pdfpipe=info",
        1 => "pdfpipe=debug",
        _ => "pdfpipe=trace",
    };

    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(filter));

    match cli.log_format {
        LogFormat::Text => {
            fmt()
                .with_env_filter(env_filter)
                .with_target(false)
                .init();
        }
        LogFormat::Json => {
            fmt()
                .json()
                .with_env_filter(env_filter)
                .init();
        }
    }
}

// ---------------------------------------------------------------------------
// Command dispatch
// ---------------------------------------------------------------------------

/// Run the CLI command.
pub(crate) async fn run(cli: Cli) -> Result<()> {
    match cli.command {
        Command::Process {
            pdf_id,
            limit,
            chunk_size,
            chunk_overlap,
        } => {
            let overrides = ChunkOverrides {
                chunk_size,
                chunk_overlap,
            };
            cmd_process(pdf_id.as_deref(), limit, overrides).await
        }
        Command::Submit { file, owner, json } => cmd_submit(&file, &owner, json).await,
        Command::Status { id, json } => cmd_status(&id, json).await,
        Command::Recover { older_than_secs } => cmd_recover(older_than_secs).await,
        Command::Delete { id } => cmd_delete(&id).await,
        Command::Config { action } => match action {
            ConfigAction::Init => cmd_config_init().await,
            ConfigAction::Show => cmd_config_show().await,
        },
    }
}

// ---------------------------------------------------------------------------
// Pipeline assembly
// ---------------------------------------------------------------------------

/// Chunking flags given on the command line.
#[derive(Debug, Clone, Copy, Default)]
struct ChunkOverrides {
    chunk_size: Option<usize>,
    chunk_overlap: Option<usize>,
}

/// Config file values with command-line overrides applied.
fn settings_with(config: &AppConfig, overrides: ChunkOverrides) -> PipelineSettings {
    let mut settings = PipelineSettings::from(config);
    if let Some(size) = overrides.chunk_size {
        settings.chunk_size = size;
    }
    if let Some(overlap) = overrides.chunk_overlap {
        settings.chunk_overlap = overlap;
    }
    settings
}

async fn open_storage(config: &AppConfig) -> Result<Arc<Storage>> {
    let db_path = resolve_database_path(config)?;
    let storage = Storage::open(&db_path).await?;
    Ok(Arc::new(storage))
}

/// Wire the production collaborators from configuration.
async fn build_pipeline(
    config: &AppConfig,
    settings: PipelineSettings,
    progress: Option<Arc<dyn ProgressReporter>>,
) -> Result<Pipeline> {
    let storage = open_storage(config).await?;
    let blobs = Arc::new(FsBlobStore::open(&resolve_blob_root(config)?)?);

    let service = Arc::new(ConvertApiClient::new(
        &config.conversion,
        conversion_secret(config)?,
    )?);
    let markdown_converter: Arc<dyn Converter> = match config.conversion.markdown_backend {
        MarkdownBackend::Service => service.clone(),
        MarkdownBackend::Htmd => Arc::new(HtmdConverter),
    };

    let mut deps = Collaborators::new(
        storage,
        blobs,
        service,
        markdown_converter,
        Arc::new(PdfExtractParser),
        normalizer_for(config.pipeline.normalizer),
        Downloader::new()?,
    );
    if let Some(progress) = progress {
        deps = deps.with_progress(progress);
    }

    Ok(Pipeline::new(deps, settings)?)
}

/// Pipeline for commands that never run a stage (no conversion secret needed).
async fn build_maintenance_pipeline(config: &AppConfig) -> Result<Pipeline> {
    let storage = open_storage(config).await?;
    let blobs = Arc::new(FsBlobStore::open(&resolve_blob_root(config)?)?);
    let htmd: Arc<dyn Converter> = Arc::new(HtmdConverter);

    let deps = Collaborators::new(
        storage,
        blobs,
        htmd.clone(),
        htmd,
        Arc::new(PdfExtractParser),
        normalizer_for(config.pipeline.normalizer),
        Downloader::new()?,
    );
    Ok(Pipeline::new(deps, PipelineSettings::from(config))?)
}

// ---------------------------------------------------------------------------
// Command handlers
// ---------------------------------------------------------------------------

async fn cmd_process(
    pdf_id: Option<&str>,
    limit: Option<u32>,
    overrides: ChunkOverrides,
) -> Result<()> {
    let config = load_config()?;
    let settings = settings_with(&config, overrides);
    let reporter = Arc::new(CliProgress::new());
    let progress: Arc<dyn ProgressReporter> = reporter.clone();
    let pipeline = build_pipeline(&config, settings, Some(progress)).await?;

    match pdf_id {
        Some(id) => {
            info!(document_id = id, "processing single document");
            let result = pipeline.process_one(id).await;
            reporter.finish();
            match result {
                Ok(DriveOutcome::Completed { stages_run }) => {
                    println!("  {id}: completed ({stages_run} stages run)");
                }
                Ok(DriveOutcome::Skipped { stages_run }) => {
                    println!("  {id}: owned by another worker after {stages_run} stages");
                }
                Err(e @ PipelineError::NotFound { .. }) => return Err(e.into()),
                // Recorded on the document; the run itself succeeded.
                Err(e) => println!("  {id}: failed: {e}"),
            }
        }
        None => {
            let limit = limit.unwrap_or(config.pipeline.batch_limit);
            let result = pipeline.run_batch(limit).await;
            reporter.finish();
            let summary = result?;

            println!();
            println!("  Batch finished");
            println!("  Attempted: {}", summary.attempted);
            println!("  Completed: {}", summary.completed);
            println!("  Skipped:   {}", summary.skipped);
            println!("  Failed:    {}", summary.failed.len());
            for (id, error) in &summary.failed {
                println!("    {id}: {error}");
            }
            println!();
        }
    }

    Ok(())
}

async fn cmd_submit(file: &Path, owner: &str, json: bool) -> Result<()> {
    let config = load_config()?;
    let pdf = tokio::fs::read(file)
        .await
        .map_err(|e| eyre!("cannot read '{}': {e}", file.display()))?;
    if !pdf.starts_with(b"%PDF") {
        warn!(file = %file.display(), "file does not start with a PDF header");
    }

    let filename = file
        .file_name()
        .and_then(|n| n.to_str())
        .ok_or_else(|| eyre!("'{}' has no usable file name", file.display()))?;

    let pipeline = build_maintenance_pipeline(&config).await?;
    let doc = pipeline.submit(owner, filename, &pdf).await?;

    if json {
        println!("{}", serde_json::to_string_pretty(&doc)?);
    } else {
        println!("  Submitted {} as {}", doc.filename, doc.id);
    }
    Ok(())
}

async fn cmd_status(id: &str, json: bool) -> Result<()> {
    let config = load_config()?;
    let storage = Storage::open_readonly(&resolve_database_path(&config)?).await?;
    let doc = storage
        .get_document(id)
        .await?
        .ok_or_else(|| PipelineError::not_found(id))?;

    if json {
        println!("{}", serde_json::to_string_pretty(&doc)?);
        return Ok(());
    }

    println!();
    println!("  ID:       {}", doc.id);
    println!("  File:     {}", doc.filename);
    println!("  Owner:    {}", doc.owner_id);
    println!("  Status:   {}", doc.status);
    if let Some(stage) = doc.failed_stage {
        println!("  Failed:   {stage}");
    }
    if let Some(error) = &doc.last_error {
        println!("  Error:    {error}");
    }
    if let Some(pages) = doc.page_count {
        println!("  Pages:    {pages}");
    }
    if let Some(chars) = doc.markdown_char_count {
        let chunks = doc.markdown_chunk_count.unwrap_or(0);
        let inline = if doc.markdown_text.is_some() { "inline" } else { "preview only" };
        println!("  Markdown: {chars} chars, {chunks} chunks ({inline})");
    }
    if let Some(chunks) = doc.text_chunk_count {
        println!("  Text:     {chunks} chunks");
    }
    println!("  Created:  {}", doc.created_at.to_rfc3339());
    println!("  Updated:  {}", doc.updated_at.to_rfc3339());
    if let Some(done) = doc.completed_at {
        println!("  Done:     {}", done.to_rfc3339());
    }
    println!();
    Ok(())
}

async fn cmd_recover(older_than_secs: Option<u64>) -> Result<()> {
    let config = load_config()?;
    let secs = older_than_secs.unwrap_or(config.pipeline.stale_after_secs);
    let pipeline = build_maintenance_pipeline(&config).await?;

    let recovered = pipeline.recover_stale(Duration::from_secs(secs)).await?;
    if recovered.is_empty() {
        println!("  No stale claims older than {secs}s");
    }
    for claim in &recovered {
        println!("  {} reset to {} (was {})", claim.id, DocumentStatus::Pending, claim.stage);
    }

    for (status, count) in pipeline.status_counts().await? {
        info!(%status, count, "documents by status");
    }
    Ok(())
}

async fn cmd_delete(id: &str) -> Result<()> {
    let config = load_config()?;
    let pipeline = build_maintenance_pipeline(&config).await?;
    pipeline.delete(id).await?;
    println!("  Deleted {id}");
    Ok(())
}

async fn cmd_config_init() -> Result<()> {
    let path = init_config()?;
    println!("Config initialized at: {}", path.display());
    Ok(())
}

async fn cmd_config_show() -> Result<()> {
    let config: AppConfig = load_config()?;
    let toml_str = toml::to_string_pretty(&config)?;
    println!("{toml_str}");
    Ok(())
}

// ---------------------------------------------------------------------------
// CLI progress reporter
// ---------------------------------------------------------------------------

/// CLI progress reporter using an indicatif spinner.
struct CliProgress {
    spinner: ProgressBar,
}

impl CliProgress {
    fn new() -> Self {
        let spinner = ProgressBar::new_spinner();
        let style = ProgressStyle::with_template("{spinner:.cyan} {msg}")
            .unwrap_or_else(|_| ProgressStyle::default_spinner())
            .tick_strings(&["⠋", "⠙", "⠹", "⠸", "⠼", "⠴", "⠦", "⠧", "⠇", "⠏"]);
        spinner.set_style(style);
        spinner.enable_steady_tick(Duration::from_millis(80));
        Self { spinner }
    }

    fn finish(&self) {
        self.spinner.finish_and_clear();
    }
}

impl ProgressReporter for CliProgress {
    fn stage_started(&self, document_id: &str, stage: DocumentStatus) {
        self.spinner.set_message(format!("{document_id} {stage}"));
    }

    fn stage_finished(&self, document_id: &str, stage: DocumentStatus, elapsed: Duration) {
        self.spinner.set_message(format!(
            "{document_id} {stage} done in {:.1}s",
            elapsed.as_secs_f64()
        ));
    }

    fn document_finished(&self, document_id: &str, outcome: &DriveOutcome) {
        let line = match outcome {
            DriveOutcome::Completed { .. } => format!("  ✓ {document_id}"),
            DriveOutcome::Skipped { .. } => format!("  - {document_id} (skipped)"),
        };
        self.spinner.println(line);
    }

    fn document_failed(&self, document_id: &str, error: &PipelineError) {
        self.spinner.println(format!("  ✗ {document_id}: {error}"));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn process_accepts_camel_case_aliases() {
        let cli = Cli::try_parse_from([
            "pdfpipe", "process", "--pdfId", "doc-1", "--chunkSize", "800", "--chunkOverlap", "100",
        ])
        .unwrap();
        match cli.command {
            Command::Process {
                pdf_id,
                limit,
                chunk_size,
                chunk_overlap,
            } => {
                assert_eq!(pdf_id.as_deref(), Some("doc-1"));
                assert_eq!(limit, None);
                assert_eq!(chunk_size, Some(800));
                assert_eq!(chunk_overlap, Some(100));
            }
            _ => panic!("expected process"),
        }
    }

    #[test]
    fn global_flags_after_subcommand() {
        let cli = Cli::try_parse_from(["pdfpipe", "recover", "--log-format", "json", "-vv"]).unwrap();
        assert!(matches!(cli.log_format, LogFormat::Json));
        assert_eq!(cli.verbose, 2);
        assert!(matches!(cli.command, Command::Recover { older_than_secs: None }));
    }

    #[test]
    fn overrides_replace_config_values() {
        let config = AppConfig::default();
        let settings = settings_with(
            &config,
            ChunkOverrides {
                chunk_size: Some(20),
                chunk_overlap: None,
            },
        );
        assert_eq!(settings.chunk_size, 20);
        assert_eq!(settings.chunk_overlap, config.chunking.chunk_overlap);
        assert_eq!(settings.max_iterations, config.pipeline.max_iterations);
    }
}
