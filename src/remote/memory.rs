//! In-memory archive used by tests. Records every call so tests can assert
//! exactly which probes and byte ranges were requested.

use std::collections::HashMap;
use std::sync::Mutex;

use tokio::io::{AsyncWrite, AsyncWriteExt};

use super::{Archive, ByteRange, TransportError};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Call {
    Head(String),
    GetText(String),
    Copy(String, Option<ByteRange>),
}

#[derive(Debug, Default)]
pub struct MemoryArchive {
    files: Mutex<HashMap<String, Vec<u8>>>,
    /// Remaining transient failures to inject per URL.
    flaky: Mutex<HashMap<String, u32>>,
    calls: Mutex<Vec<Call>>,
}

impl MemoryArchive {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn put(&self, url: impl Into<String>, body: impl Into<Vec<u8>>) {
        self.files.lock().unwrap().insert(url.into(), body.into());
    }

    /// Make the next `times` calls against `url` fail with a 503.
    pub fn fail_times(&self, url: impl Into<String>, times: u32) {
        self.flaky.lock().unwrap().insert(url.into(), times);
    }

    pub fn calls(&self) -> Vec<Call> {
        self.calls.lock().unwrap().clone()
    }

    pub fn copy_calls(&self) -> Vec<(String, Option<ByteRange>)> {
        self.calls()
            .into_iter()
            .filter_map(|c| match c {
                Call::Copy(url, range) => Some((url, range)),
                _ => None,
            })
            .collect()
    }

    pub fn head_count(&self) -> usize {
        self.calls()
            .iter()
            .filter(|c| matches!(c, Call::Head(_)))
            .count()
    }

    async fn enter(&self, call: Call, url: &str) -> Result<Option<Vec<u8>>, TransportError> {
        self.calls.lock().unwrap().push(call);
        {
            let mut flaky = self.flaky.lock().unwrap();
            if let Some(remaining) = flaky.get_mut(url) {
                if *remaining > 0 {
                    *remaining -= 1;
                    return Err(TransportError::HttpStatus {
                        status: 503,
                        url: url.to_string(),
                    });
                }
            }
        }
        Ok(self.files.lock().unwrap().get(url).cloned())
    }
}

fn not_found(url: &str) -> TransportError {
    TransportError::HttpStatus {
        status: 404,
        url: url.to_string(),
    }
}

#[async_trait::async_trait]
impl Archive for MemoryArchive {
    async fn exists(&self, url: &str) -> Result<bool, TransportError> {
        Ok(self.enter(Call::Head(url.to_string()), url).await?.is_some())
    }

    async fn get_text(&self, url: &str) -> Result<String, TransportError> {
        let body = self
            .enter(Call::GetText(url.to_string()), url)
            .await?
            .ok_or_else(|| not_found(url))?;
        Ok(String::from_utf8_lossy(&body).into_owned())
    }

    async fn copy_to(
        &self,
        url: &str,
        range: Option<ByteRange>,
        sink: &mut (dyn AsyncWrite + Send + Unpin),
    ) -> Result<u64, TransportError> {
        let body = self
            .enter(Call::Copy(url.to_string(), range), url)
            .await?
            .ok_or_else(|| not_found(url))?;
        let slice = match range {
            Some(r) => {
                let start = (r.offset as usize).min(body.len());
                let end = (r.end() as usize).min(body.len());
                &body[start..end]
            }
            None => &body[..],
        };
        sink.write_all(slice).await?;
        if let Some(r) = range {
            if slice.len() as u64 != r.length {
                return Err(TransportError::ShortRead {
                    url: url.to_string(),
                    expected: r.length,
                    received: slice.len() as u64,
                });
            }
        }
        Ok(slice.len() as u64)
    }
}
