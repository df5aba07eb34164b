use std::path::Path;

use anyhow::Context;
use async_trait::async_trait;
use hmac::{Hmac, Mac};
use reqwest::header::CONTENT_TYPE;
use reqwest::Client;
use sha2::Sha256;

use crate::remote::{self, TransportError};
use crate::retry::{self, RetryConfig};
use crate::workflow::{Notify, NotifyAck, RunContext};

type HmacSha256 = Hmac<Sha256>;

pub const SIGNATURE_HEADER: &str = "X-Gsky-Signature";
const DEFAULT_ARGS: &str = "-x -conf /rulesets/namespace_yyy-mm-ddTH.tif.json";

#[derive(Debug, Clone, Default)]
pub struct WebhookConfig {
    pub url: Option<String>,
    pub secret: Option<String>,
    /// Extra ingest arguments; defaults to the dated-namespace ruleset.
    pub args: Option<String>,
}

impl WebhookConfig {
    fn endpoint(&self) -> Option<(&str, &str)> {
        match (self.url.as_deref(), self.secret.as_deref()) {
            (Some(url), Some(secret)) if !url.is_empty() && !secret.is_empty() => Some((url, secret)),
            _ => None,
        }
    }
}

/// Tells the map server to ingest a newly persisted layer directory.
///
/// The request is a form-encoded POST whose raw body is signed with
/// HMAC-SHA256 under the shared secret; the hex digest travels in
/// `X-Gsky-Signature`.
#[derive(Debug, Clone)]
pub struct WebhookNotifier {
    client: Client,
    config: WebhookConfig,
    retry: RetryConfig,
}

impl WebhookNotifier {
    pub fn new(client: Client, config: WebhookConfig, retry: RetryConfig) -> Self {
        Self {
            client,
            config,
            retry,
        }
    }

    pub fn is_configured(&self) -> bool {
        self.config.endpoint().is_some()
    }

    async fn post(&self, url: &str, body: &str, signature: &str) -> Result<String, TransportError> {
        let response = self
            .client
            .post(url)
            .header(CONTENT_TYPE, "application/x-www-form-urlencoded")
            .header(SIGNATURE_HEADER, signature)
            .body(body.to_string())
            .send()
            .await
            .map_err(|source| TransportError::Http {
                source,
                url: url.to_string(),
            })?;
        let status = response.status();
        if !status.is_success() {
            return Err(TransportError::HttpStatus {
                status: status.as_u16(),
                url: url.to_string(),
            });
        }
        Ok(response.text().await.unwrap_or_default())
    }
}

/// Form body in the field order the ingest endpoint expects.
pub fn form_body(namespace: &str, dir: &Path, datatype: &str, args: &str) -> String {
    url::form_urlencoded::Serializer::new(String::new())
        .append_pair("namespace", &format!("-n {}", namespace))
        .append_pair("path", &format!("-p {}", dir.display()))
        .append_pair("datatype", &format!("-t {}", datatype))
        .append_pair("args", args)
        .finish()
}

/// Hex HMAC-SHA256 of `body` under `secret`.
pub fn sign(secret: &str, body: &[u8]) -> anyhow::Result<String> {
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
        .map_err(|e| anyhow::anyhow!("Invalid webhook secret: {}", e))?;
    mac.update(body);
    Ok(hex::encode(mac.finalize().into_bytes()))
}

#[async_trait]
impl Notify for WebhookNotifier {
    async fn notify(&self, namespace: &str, path: &Path, ctx: &RunContext) -> anyhow::Result<NotifyAck> {
        let Some((url, secret)) = self.config.endpoint() else {
            return Ok(NotifyAck::Unavailable);
        };

        let dir = path.parent().unwrap_or(path);
        let datatype = path.extension().and_then(|e| e.to_str()).unwrap_or("tif");
        let args = self.config.args.as_deref().unwrap_or(DEFAULT_ARGS);
        let body = form_body(namespace, dir, datatype, args);
        let signature = sign(secret, body.as_bytes())?;

        let reply = retry::retry_with_backoff(&self.retry, remote::retry_classifier, || {
            self.post(url, &body, &signature)
        })
        .await
        .with_context(|| format!("Ingest webhook for namespace {} failed", namespace))?;

        tracing::info!(
            dataset = %ctx.dataset_id,
            namespace,
            version = %ctx.version,
            "Ingest command sent"
        );
        tracing::debug!(reply = %reply.trim(), "Ingest webhook reply");
        Ok(NotifyAck::Sent)
    }
}
