use thiserror::Error;

/// Typed transport errors enabling retry classification.
///
/// `is_retryable()` separates transient failures (server errors, rate limits,
/// dropped connections, truncated bodies) from definitive answers, and
/// `is_not_found()` picks out the "not yet published" case the workflow
/// treats as a clean skip.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("HTTP {status} from {url}")]
    HttpStatus { status: u16, url: String },

    #[error("Request to {url} failed: {source}")]
    Http { source: reqwest::Error, url: String },

    #[error("Short read from {url}: expected {expected} bytes, received {received}")]
    ShortRead {
        url: String,
        expected: u64,
        received: u64,
    },

    #[error("Server ignored the byte range request for {url}")]
    RangeIgnored { url: String },

    #[error("Disk error: {0}")]
    Disk(#[from] std::io::Error),
}

impl TransportError {
    pub fn is_retryable(&self) -> bool {
        match self {
            TransportError::HttpStatus { status, .. } => *status == 429 || *status >= 500,
            TransportError::Http { .. } => true,
            TransportError::ShortRead { .. } => true,
            TransportError::RangeIgnored { .. } => false,
            TransportError::Disk(_) => false,
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            TransportError::HttpStatus {
                status: 404 | 410,
                ..
            }
        )
    }
}
