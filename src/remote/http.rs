use std::time::Duration;

use futures_util::StreamExt;
use reqwest::header::RANGE;
use reqwest::{Client, StatusCode};
use tokio::io::{AsyncWrite, AsyncWriteExt};

use super::{Archive, ByteRange, TransportError};

/// `Archive` over plain HTTP(S). Every request carries the client-wide
/// timeout; dropping the returned future aborts the request.
#[derive(Debug, Clone)]
pub struct HttpArchive {
    client: Client,
}

impl HttpArchive {
    pub fn new(timeout: Duration) -> Result<Self, TransportError> {
        let client = Client::builder()
            .timeout(timeout)
            .connect_timeout(timeout.min(Duration::from_secs(30)))
            .user_agent(concat!("gridsync/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| TransportError::Http {
                source: e,
                url: String::new(),
            })?;
        Ok(Self { client })
    }

    pub fn client(&self) -> &Client {
        &self.client
    }
}

fn http_err(url: &str) -> impl FnOnce(reqwest::Error) -> TransportError + '_ {
    move |source| TransportError::Http {
        source,
        url: url.to_string(),
    }
}

#[async_trait::async_trait]
impl Archive for HttpArchive {
    async fn exists(&self, url: &str) -> Result<bool, TransportError> {
        let response = self.client.head(url).send().await.map_err(http_err(url))?;
        let status = response.status();
        if status.is_success() {
            return Ok(true);
        }
        let err = TransportError::HttpStatus {
            status: status.as_u16(),
            url: url.to_string(),
        };
        if err.is_retryable() {
            Err(err)
        } else {
            tracing::debug!(url, status = status.as_u16(), "resource not available");
            Ok(false)
        }
    }

    async fn get_text(&self, url: &str) -> Result<String, TransportError> {
        let response = self.client.get(url).send().await.map_err(http_err(url))?;
        if !response.status().is_success() {
            return Err(TransportError::HttpStatus {
                status: response.status().as_u16(),
                url: url.to_string(),
            });
        }
        response.text().await.map_err(http_err(url))
    }

    async fn copy_to(
        &self,
        url: &str,
        range: Option<ByteRange>,
        sink: &mut (dyn AsyncWrite + Send + Unpin),
    ) -> Result<u64, TransportError> {
        let mut request = self.client.get(url);
        if let Some(r) = range {
            request = request.header(RANGE, r.header_value());
        }
        let response = request.send().await.map_err(http_err(url))?;
        let status = response.status();
        if !status.is_success() {
            return Err(TransportError::HttpStatus {
                status: status.as_u16(),
                url: url.to_string(),
            });
        }
        if range.is_some() && status != StatusCode::PARTIAL_CONTENT {
            return Err(TransportError::RangeIgnored {
                url: url.to_string(),
            });
        }
        let expected = range.map(|r| r.length).or(response.content_length());

        let mut written: u64 = 0;
        let mut stream = response.bytes_stream();
        while let Some(chunk) = stream.next().await {
            let chunk = chunk.map_err(|e| {
                tracing::warn!(
                    url,
                    bytes_so_far = written,
                    "Body decode error: {}",
                    e
                );
                TransportError::Http {
                    source: e,
                    url: url.to_string(),
                }
            })?;
            sink.write_all(&chunk).await?;
            written += chunk.len() as u64;
        }

        if let Some(expected) = expected {
            if written != expected {
                return Err(TransportError::ShortRead {
                    url: url.to_string(),
                    expected,
                    received: written,
                });
            }
        }
        Ok(written)
    }
}
