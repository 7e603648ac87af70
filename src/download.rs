//! Fetching source images from URLs
//!
//! Downloads are streamed with a hard size cap and must come back with an
//! image content type. All failures surface as `Fetch` errors.

use crate::error::{Result, SegmentationError};
use crate::utils::PathValidator;
use async_trait::async_trait;
use futures_util::stream::TryStreamExt;
use reqwest::{header::CONTENT_TYPE, Client};
use std::time::Duration;
use tokio::io::AsyncReadExt;
use tokio_util::io::StreamReader;

/// Extension used when neither the content type nor the URL names one
const FALLBACK_EXTENSION: &str = "jpg";

/// A downloaded image payload
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchedImage {
    pub bytes: Vec<u8>,
    pub content_type: Option<String>,
    /// Lowercase extension used to persist the input
    pub extension: String,
}

/// Source of remote images
#[async_trait]
pub trait ImageFetcher: Send + Sync {
    /// Fetch the image at `url`
    ///
    /// # Errors
    /// `Fetch` for network failures, HTTP error statuses, non-image content
    /// and oversize bodies
    async fn fetch(&self, url: &str) -> Result<FetchedImage>;
}

/// HTTP(S) fetcher backed by `reqwest`
#[derive(Debug, Clone)]
pub struct HttpImageFetcher {
    client: Client,
    max_bytes: usize,
}

impl HttpImageFetcher {
    /// Create a fetcher with a request timeout and a body size cap
    ///
    /// # Errors
    /// `Fetch` when the HTTP client cannot be built
    pub fn new(timeout: Duration, max_bytes: usize) -> Result<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .user_agent(concat!(env!("CARGO_PKG_NAME"), "/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| SegmentationError::fetch(format!("Failed to create HTTP client: {e}")))?;
        Ok(Self { client, max_bytes })
    }

    #[must_use]
    pub fn max_bytes(&self) -> usize {
        self.max_bytes
    }

    async fn read_capped(&self, response: reqwest::Response) -> Result<Vec<u8>> {
        let limit = self.max_bytes as u64;
        let stream = response
            .bytes_stream()
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e));
        let mut reader = StreamReader::new(stream).take(limit + 1);

        let mut bytes = Vec::new();
        reader
            .read_to_end(&mut bytes)
            .await
            .map_err(|e| SegmentationError::fetch(format!("Failed to read response body: {e}")))?;

        if bytes.len() as u64 > limit {
            return Err(Self::too_large(self.max_bytes));
        }
        Ok(bytes)
    }

    fn too_large(max_bytes: usize) -> SegmentationError {
        SegmentationError::fetch(format!(
            "Image too large (maximum {} MB)",
            max_bytes / (1024 * 1024)
        ))
    }
}

#[async_trait]
impl ImageFetcher for HttpImageFetcher {
    async fn fetch(&self, url: &str) -> Result<FetchedImage> {
        PathValidator::validate_source_url(url)
            .map_err(|e| SegmentationError::fetch(e.to_string()))?;
        tracing::debug!(url, "Fetching image");

        let response = self.client.get(url).send().await.map_err(|e| {
            if e.is_timeout() {
                SegmentationError::fetch(format!("Timed out downloading {url}"))
            } else {
                SegmentationError::fetch(format!("Failed to download {url}: {e}"))
            }
        })?;

        let status = response.status();
        if !status.is_success() {
            return Err(SegmentationError::fetch(format!("HTTP error {status} for {url}")));
        }

        let content_type = response
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|value| value.to_str().ok())
            .map(|value| value.split(';').next().unwrap_or(value).trim().to_ascii_lowercase());
        if let Some(ct) = &content_type {
            if !ct.starts_with("image/") {
                return Err(SegmentationError::fetch(format!(
                    "URL does not point to an image (content type '{ct}')"
                )));
            }
        }

        if response.content_length().is_some_and(|len| len > self.max_bytes as u64) {
            return Err(Self::too_large(self.max_bytes));
        }

        let bytes = self.read_capped(response).await?;
        if bytes.is_empty() {
            return Err(SegmentationError::fetch(format!("Empty response body from {url}")));
        }

        let extension = extension_for(content_type.as_deref(), url);
        tracing::debug!(url, bytes = bytes.len(), %extension, "Image fetched");
        Ok(FetchedImage {
            bytes,
            content_type,
            extension,
        })
    }
}

/// Extension for a download, from the content type or else the URL path
#[must_use]
pub fn extension_for(content_type: Option<&str>, url: &str) -> String {
    let from_content_type = content_type.and_then(|ct| match ct {
        "image/jpeg" | "image/jpg" => Some("jpg"),
        "image/png" => Some("png"),
        "image/tiff" => Some("tif"),
        "image/webp" => Some("webp"),
        _ => None,
    });
    if let Some(ext) = from_content_type {
        return ext.to_string();
    }

    let path = url.split(['?', '#']).next().unwrap_or(url);
    let last_segment = path.rsplit('/').next().unwrap_or(path);
    PathValidator::extension_of(last_segment)
        .filter(|ext| PathValidator::is_supported_image_format(format!("x.{ext}")))
        .unwrap_or_else(|| FALLBACK_EXTENSION.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_extension_for() {
        assert_eq!(extension_for(Some("image/png"), "http://h/a.jpg"), "png");
        assert_eq!(extension_for(Some("image/tiff"), "http://h/a"), "tif");
        assert_eq!(extension_for(None, "http://h/field.JPEG?size=large"), "jpeg");
        assert_eq!(extension_for(Some("image/gif"), "http://h/a.txt"), "jpg");
        assert_eq!(extension_for(None, "http://h/"), "jpg");
    }

    #[tokio::test]
    async fn test_unreachable_host_is_fetch_error() {
        let fetcher = HttpImageFetcher::new(Duration::from_secs(2), 1024).unwrap();
        // Port 9 (discard) is closed on loopback in test environments
        let err = fetcher.fetch("http://127.0.0.1:9/image.png").await.unwrap_err();
        assert!(matches!(err, SegmentationError::Fetch(_)));
        assert!(err.to_string().starts_with("Fetch failed:"));
    }

    #[tokio::test]
    async fn test_non_http_url_is_fetch_error() {
        let fetcher = HttpImageFetcher::new(Duration::from_secs(1), 1024).unwrap();
        let err = fetcher.fetch("ftp://example.com/a.png").await.unwrap_err();
        assert!(matches!(err, SegmentationError::Fetch(_)));
    }

    #[cfg(feature = "server")]
    mod served {
        use super::*;
        use axum::{http::header, routing::get, Router};

        async fn serve(router: Router) -> String {
            let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
            let addr = listener.local_addr().unwrap();
            tokio::spawn(async move {
                axum::serve(listener, router).await.unwrap();
            });
            format!("http://{addr}")
        }

        #[tokio::test]
        async fn test_fetch_status_content_type_and_size() {
            let router = Router::new()
                .route("/ok.png", get(|| async { ([(header::CONTENT_TYPE, "image/png")], vec![7_u8; 16]) }))
                .route("/page", get(|| async { ([(header::CONTENT_TYPE, "text/html")], "<html></html>") }))
                .route("/big", get(|| async { ([(header::CONTENT_TYPE, "image/jpeg")], vec![0_u8; 4096]) }));
            let base = serve(router).await;
            let fetcher = HttpImageFetcher::new(Duration::from_secs(5), 1024).unwrap();

            let fetched = fetcher.fetch(&format!("{base}/ok.png")).await.unwrap();
            assert_eq!(fetched.bytes.len(), 16);
            assert_eq!(fetched.extension, "png");

            let err = fetcher.fetch(&format!("{base}/page")).await.unwrap_err();
            assert!(err.to_string().contains("does not point to an image"));

            let err = fetcher.fetch(&format!("{base}/big")).await.unwrap_err();
            assert!(err.to_string().contains("too large"));

            let err = fetcher.fetch(&format!("{base}/missing")).await.unwrap_err();
            assert!(err.to_string().contains("404"));
        }
    }
}
