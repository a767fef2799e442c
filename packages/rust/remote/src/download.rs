//! Bounded downloads.
//!
//! Every fetch is capped in time and size. The `Content-Length` header is
//! checked before the body is read, and the streamed body is counted as it
//! arrives, so an unannounced oversized body fails as soon as it crosses the cap.

use std::time::Duration;

use futures::StreamExt;
use reqwest::Client;
use tracing::{debug, instrument};
use url::Url;

use pdfpipe_shared::{PipelineError, PipelineSettings, Result};

use crate::USER_AGENT;

/// Maximum number of redirects to follow.
const MAX_REDIRECTS: usize = 5;

/// Time and size bounds for one download.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DownloadLimits {
    pub timeout: Duration,
    pub max_bytes: u64,
}

impl Default for DownloadLimits {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(60),
            max_bytes: 30 * 1024 * 1024,
        }
    }
}

impl From<&PipelineSettings> for DownloadLimits {
    fn from(settings: &PipelineSettings) -> Self {
        Self {
            timeout: settings.download_timeout,
            max_bytes: settings.download_max_bytes,
        }
    }
}

/// Fetches URLs into memory under [`DownloadLimits`].
#[derive(Debug, Clone)]
pub struct Downloader {
    client: Client,
}

impl Downloader {
    pub fn new() -> Result<Self> {
        let client = Client::builder()
            .user_agent(USER_AGENT)
            .redirect(reqwest::redirect::Policy::limited(MAX_REDIRECTS))
            .build()
            .map_err(|e| PipelineError::Network(format!("failed to build HTTP client: {e}")))?;
        Ok(Self { client })
    }

    /// Download `url` into memory.
    ///
    /// Supports `http`, `https` and `file` URLs. Exceeding `limits.timeout`
    /// yields [`PipelineError::Timeout`]; exceeding `limits.max_bytes` yields
    /// [`PipelineError::PayloadTooLarge`].
    #[instrument(skip(self, limits), fields(url = %url, max_bytes = limits.max_bytes))]
    pub async fn download(&self, url: &Url, limits: DownloadLimits) -> Result<Vec<u8>> {
        let fetch = async {
            match url.scheme() {
                "http" | "https" => self.fetch_http(url, limits.max_bytes).await,
                "file" => read_file_url(url, limits.max_bytes).await,
                other => Err(PipelineError::validation(format!(
                    "unsupported URL scheme for download: {other}"
                ))),
            }
        };

        let bytes = tokio::time::timeout(limits.timeout, fetch)
            .await
            .map_err(|_| PipelineError::Timeout {
                what: format!("download of {url}"),
                seconds: limits.timeout.as_secs(),
            })??;

        debug!(bytes = bytes.len(), "download complete");
        Ok(bytes)
    }

    async fn fetch_http(&self, url: &Url, max_bytes: u64) -> Result<Vec<u8>> {
        let response = self
            .client
            .get(url.as_str())
            .send()
            .await
            .map_err(|e| PipelineError::Network(format!("{url}: {e}")))?;

        let status = response.status();
        if !status.is_success() {
            return Err(PipelineError::Network(format!("{url}: HTTP {status}")));
        }

        // Check content-length if available
        if let Some(len) = response.content_length() {
            if len > max_bytes {
                return Err(PipelineError::PayloadTooLarge {
                    size: len,
                    limit: max_bytes,
                });
            }
        }

        let mut body = Vec::new();
        let mut stream = response.bytes_stream();
        while let Some(chunk) = stream.next().await {
            let chunk =
                chunk.map_err(|e| PipelineError::Network(format!("{url}: body read failed: {e}")))?;
            let size = (body.len() + chunk.len()) as u64;
            if size > max_bytes {
                return Err(PipelineError::PayloadTooLarge {
                    size,
                    limit: max_bytes,
                });
            }
            body.extend_from_slice(&chunk);
        }
        Ok(body)
    }
}

async fn read_file_url(url: &Url, max_bytes: u64) -> Result<Vec<u8>> {
    let path = url
        .to_file_path()
        .map_err(|()| PipelineError::validation(format!("not a local file URL: {url}")))?;

    let meta = tokio::fs::metadata(&path)
        .await
        .map_err(|e| PipelineError::io(&path, e))?;
    if meta.len() > max_bytes {
        return Err(PipelineError::PayloadTooLarge {
            size: meta.len(),
            limit: max_bytes,
        });
    }

    tokio::fs::read(&path)
        .await
        .map_err(|e| PipelineError::io(&path, e))
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn limits(max_bytes: u64) -> DownloadLimits {
        DownloadLimits {
            timeout: Duration::from_secs(5),
            max_bytes,
        }
    }

    /// Serve one chunked response without a Content-Length header.
    async fn chunked_server(body: Vec<u8>) -> Url {
        use tokio::io::{AsyncReadExt, AsyncWriteExt};

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut request = [0u8; 2048];
            let _ = socket.read(&mut request).await;

            let mut response =
                b"HTTP/1.1 200 OK\r\nTransfer-Encoding: chunked\r\nConnection: close\r\n\r\n".to_vec();
            for piece in body.chunks(256) {
                response.extend_from_slice(format!("{:x}\r\n", piece.len()).as_bytes());
                response.extend_from_slice(piece);
                response.extend_from_slice(b"\r\n");
            }
            response.extend_from_slice(b"0\r\n\r\n");
            let _ = socket.write_all(&response).await;
            let _ = socket.shutdown().await;
        });
        Url::parse(&format!("http://{addr}/big.pdf")).unwrap()
    }

    #[tokio::test]
    async fn downloads_http_body() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/doc.pdf"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(b"%PDF-1.7".to_vec()))
            .mount(&server)
            .await;

        let url = Url::parse(&format!("{}/doc.pdf", server.uri())).unwrap();
        let bytes = Downloader::new().unwrap().download(&url, limits(1024)).await.unwrap();
        assert_eq!(bytes, b"%PDF-1.7");
    }

    #[tokio::test]
    async fn rejects_body_over_cap() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(vec![b'x'; 2048]))
            .mount(&server)
            .await;

        let url = Url::parse(&server.uri()).unwrap();
        let err = Downloader::new()
            .unwrap()
            .download(&url, limits(1000))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            PipelineError::PayloadTooLarge { size: 2048, limit: 1000 }
        ));
    }

    #[tokio::test]
    async fn streamed_body_without_length_under_cap() {
        let url = chunked_server(vec![b'y'; 600]).await;
        let bytes = Downloader::new().unwrap().download(&url, limits(1000)).await.unwrap();
        assert_eq!(bytes.len(), 600);
    }

    #[tokio::test]
    async fn streamed_body_without_length_over_cap() {
        let url = chunked_server(vec![b'x'; 4096]).await;
        let err = Downloader::new()
            .unwrap()
            .download(&url, limits(1000))
            .await
            .unwrap_err();
        match err {
            PipelineError::PayloadTooLarge { size, limit } => {
                assert_eq!(limit, 1000);
                assert!(size > 1000, "size={size}");
            }
            other => panic!("expected PayloadTooLarge, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn times_out_slow_server() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_delay(Duration::from_secs(2)))
            .mount(&server)
            .await;

        let url = Url::parse(&server.uri()).unwrap();
        let quick = DownloadLimits {
            timeout: Duration::from_millis(200),
            max_bytes: 1024,
        };
        let err = Downloader::new().unwrap().download(&url, quick).await.unwrap_err();
        assert!(matches!(err, PipelineError::Timeout { .. }));
    }

    #[tokio::test]
    async fn http_error_status_is_network_error() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;

        let url = Url::parse(&server.uri()).unwrap();
        let err = Downloader::new().unwrap().download(&url, limits(1024)).await.unwrap_err();
        assert!(matches!(err, PipelineError::Network(_)));
    }

    #[tokio::test]
    async fn reads_file_urls_with_cap() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("source.pdf");
        std::fs::write(&file, b"0123456789").unwrap();
        let url = Url::from_file_path(&file).unwrap();

        let downloader = Downloader::new().unwrap();
        assert_eq!(downloader.download(&url, limits(10)).await.unwrap(), b"0123456789");

        let err = downloader.download(&url, limits(9)).await.unwrap_err();
        assert!(matches!(err, PipelineError::PayloadTooLarge { size: 10, limit: 9 }));
    }

    #[tokio::test]
    async fn rejects_unknown_scheme() {
        let url = Url::parse("ftp://example.com/file.pdf").unwrap();
        let err = Downloader::new().unwrap().download(&url, limits(10)).await.unwrap_err();
        assert!(matches!(err, PipelineError::Validation { .. }));
    }
}
