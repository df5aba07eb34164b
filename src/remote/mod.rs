//! Remote archive access: existence probes, sidecar index reads and ranged
//! retrieval. `HttpArchive` is the production transport; tests use
//! `memory::MemoryArchive`.

pub mod error;
pub mod http;
#[cfg(test)]
pub mod memory;

pub use error::TransportError;
pub use http::HttpArchive;

use tokio::io::AsyncWrite;

use crate::retry::{self, RetryAction, RetryConfig};

/// A contiguous byte span inside a remote resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ByteRange {
    pub offset: u64,
    pub length: u64,
}

impl ByteRange {
    pub fn new(offset: u64, length: u64) -> Self {
        Self { offset, length }
    }

    /// Exclusive end offset.
    pub fn end(&self) -> u64 {
        self.offset.saturating_add(self.length)
    }

    /// Value for an HTTP `Range` header (inclusive bounds).
    pub fn header_value(&self) -> String {
        format!(
            "bytes={}-{}",
            self.offset,
            self.end().saturating_sub(1).max(self.offset)
        )
    }
}

/// Minimal async view of a remote archive.
#[async_trait::async_trait]
pub trait Archive: Send + Sync {
    /// HEAD-equivalent check. `Ok(false)` is a definitive negative; transient
    /// failures come back as errors so callers can retry them.
    async fn exists(&self, url: &str) -> Result<bool, TransportError>;

    /// Fetch a small text resource (sidecar indexes).
    async fn get_text(&self, url: &str) -> Result<String, TransportError>;

    /// Stream the resource, or one byte range of it, into `sink`. Returns the
    /// number of bytes written.
    async fn copy_to(
        &self,
        url: &str,
        range: Option<ByteRange>,
        sink: &mut (dyn AsyncWrite + Send + Unpin),
    ) -> Result<u64, TransportError>;
}

pub(crate) fn retry_classifier(e: &TransportError) -> RetryAction {
    if e.is_retryable() {
        RetryAction::Retry
    } else {
        RetryAction::Abort
    }
}

/// Existence check retried on transient failure.
pub async fn exists_with_retry(
    archive: &dyn Archive,
    url: &str,
    config: &RetryConfig,
) -> Result<bool, TransportError> {
    retry::retry_with_backoff(config, retry_classifier, || archive.exists(url)).await
}

/// Text fetch retried on transient failure.
pub async fn get_text_with_retry(
    archive: &dyn Archive,
    url: &str,
    config: &RetryConfig,
) -> Result<String, TransportError> {
    retry::retry_with_backoff(config, retry_classifier, || archive.get_text(url)).await
}

/// Sidecar index location: the resource URL with its extension replaced by
/// `.index`.
pub fn index_url_for(url: &str) -> String {
    let name_start = url.rfind('/').map(|i| i + 1).unwrap_or(0);
    match url[name_start..].rfind('.') {
        Some(dot) if dot > 0 => format!("{}.index", &url[..name_start + dot]),
        _ => format!("{}.index", url),
    }
}
