//! LIMS specimen identifier lookups
//!
//! One request per matching field, carrying every distinct value of that
//! field. Requests are signed with HMAC-SHA512 and retried with jittered
//! exponential backoff on connection errors, timeouts, 5xx and 429.

use crate::config::LimsConfig;
use crate::{Error, Result};
use async_trait::async_trait;
use chrono::Utc;
use hmac::{Hmac, Mac};
use md5::Md5;
use reqwest::header::{AUTHORIZATION, CONTENT_TYPE};
use reqwest::StatusCode;
use serde::Deserialize;
use serde_json::{Map, Value};
use sha2::{Digest, Sha512};
use std::collections::HashMap;
use std::time::Duration;
use url::Url;
use uuid::Uuid;

pub const FIND_SPECIMEN_IDENTIFIERS_PATH: &str = "/api/v1/sfs-specimens/find-specimen-identifiers";

/// Field of the lookup response holding the LIMS-assigned barcode.
const ASSIGNED_BARCODE: &str = "matrixId";

/// Resolves values of one identifier field to LIMS-assigned barcodes.
#[async_trait]
pub trait IdentifierLookup: Send + Sync {
    /// Returns a map from looked-up value to assigned barcode. Values the LIMS
    /// does not know are simply absent from the map.
    async fn lookup(&self, field: &str, values: &[String]) -> Result<HashMap<String, String>>;
}

#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub jitter_ratio: f64,
}

impl RetryPolicy {
    pub fn from_config(config: &LimsConfig) -> Self {
        Self {
            max_retries: config.max_retries,
            initial_delay: Duration::from_millis(config.initial_delay_ms),
            max_delay: Duration::from_millis(config.max_delay_ms),
            jitter_ratio: config.jitter_ratio,
        }
    }

    /// Un-jittered delay before retry number `retry` (1-based).
    pub fn backoff(&self, retry: u32) -> Duration {
        let factor = 2u32.saturating_pow(retry.saturating_sub(1));
        self.initial_delay
            .saturating_mul(factor)
            .min(self.max_delay)
    }
}

fn is_retryable_status(status: StatusCode) -> bool {
    status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS
}

fn jittered_duration(base: Duration, jitter_ratio: f64) -> Duration {
    if base.is_zero() || jitter_ratio <= 0.0 {
        return base;
    }

    let bytes = *Uuid::new_v4().as_bytes();
    let mut head = [0u8; 8];
    head.copy_from_slice(&bytes[..8]);
    let unit = (u64::from_le_bytes(head) as f64) / (u64::MAX as f64);
    let signed = unit * 2.0 - 1.0;
    let factor = (1.0 + signed * jitter_ratio).max(0.0);
    base.mul_f64(factor)
}

/// `hex(HMAC-SHA512(secret, nonce + verb + path + hex(md5(body))))`
pub fn sign(secret: &str, nonce: &str, verb: &str, path: &str, body: &[u8]) -> Result<String> {
    let body_digest = hex::encode(Md5::digest(body));
    let mut mac = Hmac::<Sha512>::new_from_slice(secret.as_bytes())
        .map_err(|e| Error::Config(format!("invalid LIMS secret: {e}")))?;
    mac.update(nonce.as_bytes());
    mac.update(verb.as_bytes());
    mac.update(path.as_bytes());
    mac.update(body_digest.as_bytes());
    Ok(hex::encode(mac.finalize().into_bytes()))
}

/// One element of the lookup response.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum LookupResult {
    Found { ids: Map<String, Value> },
    Failed { error: Value },
}

fn scalar_string(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

/// Build the value→barcode map for `field` from a lookup response.
pub fn assigned_barcodes(field: &str, results: &[LookupResult]) -> HashMap<String, String> {
    let mut barcodes = HashMap::new();
    for result in results {
        match result {
            LookupResult::Found { ids } => {
                let value = ids.get(field).and_then(scalar_string);
                let barcode = ids.get(ASSIGNED_BARCODE).and_then(scalar_string);
                if let (Some(value), Some(barcode)) = (value, barcode) {
                    barcodes.insert(value, barcode);
                }
            }
            LookupResult::Failed { error } => {
                tracing::debug!(field, %error, "LIMS could not resolve lookup term");
            }
        }
    }
    barcodes
}

pub struct LimsClient {
    client: reqwest::Client,
    endpoint: Url,
    secret: String,
    retry: RetryPolicy,
}

impl LimsClient {
    pub fn new(config: &LimsConfig) -> Result<Self> {
        let base_url = config
            .base_url
            .as_deref()
            .ok_or_else(|| Error::Config("lims.base_url is not set".to_string()))?;
        let secret = config
            .secret
            .clone()
            .ok_or_else(|| Error::Config("lims.secret is not set".to_string()))?;

        let endpoint = Url::parse(base_url)
            .and_then(|base| base.join(FIND_SPECIMEN_IDENTIFIERS_PATH))
            .map_err(|e| Error::Config(format!("lims.base_url is invalid: {e}")))?;

        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_seconds))
            .build()?;

        Ok(Self {
            client,
            endpoint,
            secret,
            retry: RetryPolicy::from_config(config),
        })
    }

    async fn post_signed(&self, body: Vec<u8>) -> Result<Vec<LookupResult>> {
        let path = self.endpoint.path().to_string();
        let mut retries = 0;

        loop {
            let nonce = Utc::now().timestamp_millis().to_string();
            let signature = sign(&self.secret, &nonce, "POST", &path, &body)?;

            let response = self
                .client
                .post(self.endpoint.clone())
                .header(CONTENT_TYPE, "application/json")
                .header(AUTHORIZATION, format!("HMAC {nonce}:{signature}"))
                .body(body.clone())
                .send()
                .await;

            let failure = match response {
                Ok(resp) if resp.status().is_success() => return Ok(resp.json().await?),
                Ok(resp) => {
                    let status = resp.status();
                    let text = resp.text().await.unwrap_or_default();
                    if !is_retryable_status(status) {
                        return Err(Error::Lims(format!(
                            "{} returned {}: {}",
                            path,
                            status,
                            truncate(&text)
                        )));
                    }
                    format!("{} returned {}", path, status)
                }
                Err(e) if e.is_connect() || e.is_timeout() => e.to_string(),
                Err(e) => return Err(Error::Http(e)),
            };

            retries += 1;
            if retries > self.retry.max_retries {
                return Err(Error::Lims(format!(
                    "{} after {} attempts",
                    failure, retries
                )));
            }

            let wait = jittered_duration(self.retry.backoff(retries), self.retry.jitter_ratio);
            tracing::warn!(retry = retries, wait_ms = wait.as_millis() as u64, error = %failure, "LIMS lookup failed, retrying");
            tokio::time::sleep(wait).await;
        }
    }
}

fn truncate(text: &str) -> &str {
    match text.char_indices().nth(200) {
        Some((index, _)) => &text[..index],
        None => text,
    }
}

#[async_trait]
impl IdentifierLookup for LimsClient {
    async fn lookup(&self, field: &str, values: &[String]) -> Result<HashMap<String, String>> {
        if values.is_empty() {
            return Ok(HashMap::new());
        }

        let terms: Vec<Value> = values
            .iter()
            .map(|value| {
                let mut term = Map::new();
                term.insert(field.to_string(), Value::String(value.clone()));
                Value::Object(term)
            })
            .collect();
        let body = serde_json::to_vec(&terms)?;

        tracing::info!(field, terms = values.len(), "Looking up specimen identifiers");
        let results = self.post_signed(body).await?;
        let barcodes = assigned_barcodes(field, &results);
        tracing::info!(field, matched = barcodes.len(), "LIMS lookup complete");
        Ok(barcodes)
    }
}
