//! Shared types, error model, and configuration for pdfpipe.
//!
//! This crate is the foundation depended on by all other pdfpipe crates.
//! It provides:
//! - [`PipelineError`]: the unified error type
//! - Domain types ([`Document`], [`DocumentStatus`], [`MarkdownChunk`], [`TextChunk`])
//! - Configuration ([`AppConfig`], [`PipelineSettings`], config loading)

pub mod config;
pub mod error;
pub mod types;

// Re-export public API at crate root for ergonomic imports.
pub use config::{
    AppConfig, BlobConfig, ChunkingConfig, ConversionConfig, DatabaseConfig, DownloadConfig,
    MarkdownBackend, NormalizerKind, PipelineConfig, PipelineSettings, RetryPolicy, config_dir,
    config_file_path, conversion_secret, expand_home, init_config, load_config, load_config_from,
    resolve_blob_root, resolve_database_path,
};
pub use error::{PipelineError, Result};
pub use types::{Document, DocumentId, DocumentStatus, MarkdownChunk, NewDocument, TextChunk};
