//! Adapters for the pipeline's external collaborators.
//!
//! - [`Converter`]: format conversion ([`ConvertApiClient`] over HTTP, [`HtmdConverter`] offline)
//! - [`BlobStore`]: object storage ([`FsBlobStore`], [`MemoryBlobStore`])
//! - [`Downloader`]: time- and size-bounded fetches of `http(s)://` and `file://` URLs

mod blob;
mod convert;
mod download;

pub use blob::{BlobStore, FsBlobStore, MemoryBlobStore};
pub use convert::{
    ConversionInput, ConvertApiClient, ConvertedFile, Converter, Format, HtmdConverter,
};
pub use download::{DownloadLimits, Downloader};

/// User-Agent string for outbound requests.
pub(crate) const USER_AGENT: &str = concat!("pdfpipe/", env!("CARGO_PKG_VERSION"));
