//! Content-addressed blob store adapter.
//!
//! Claims tables and one-time distribution lists live on IPFS. Writes are
//! pinned to every configured pin endpoint (plus an optional HTTPS pinning
//! service) and must all agree on the returned reference; reads try the pin
//! endpoints first and fall back to public gateways.

use crate::retry;
use backon::Retryable;
use serde_json::Value;
use std::time::Duration;
use thiserror::Error;
use tracing::warn;
use url::Url;

pub type Result<T> = std::result::Result<T, IpfsError>;

#[derive(Debug, Error)]
pub enum IpfsError {
    #[error("failed to fetch {0} from every endpoint")]
    FetchFailed(String),
    #[error("failed to pin content to any endpoint")]
    PinFailed,
    #[error("pin endpoints returned different references: {0}")]
    DivergentRefs(String),
    #[error("http error: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("invalid content: {0}")]
    Encode(#[from] serde_json::Error),
}

#[derive(Clone, Debug)]
pub struct PinataSettings {
    pub endpoint: Url,
    pub api_key: String,
    pub secret_key: String,
}

#[derive(Clone, Debug)]
pub struct IpfsClient {
    pin_endpoints: Vec<Url>,
    fetch_endpoints: Vec<Url>,
    pinata: Option<PinataSettings>,
    http: reqwest::Client,
}

impl IpfsClient {
    pub fn new(
        pin_endpoints: Vec<Url>,
        fetch_endpoints: Vec<Url>,
        pinata: Option<PinataSettings>,
    ) -> Self {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(60))
            .build()
            .expect("failed to build HTTP client");
        Self {
            pin_endpoints,
            fetch_endpoints,
            pinata,
            http,
        }
    }

    /// Downloads the JSON content behind an `ipfs://` / `/ipfs/` reference.
    pub async fn fetch(&self, reference: &str) -> Result<Value> {
        (|| async { self.fetch_once(reference).await })
            .retry(retry::policy())
            .notify(|err: &IpfsError, dur: Duration| {
                warn!("retrying blob fetch in {dur:?}: {err}");
            })
            .await
    }

    async fn fetch_once(&self, reference: &str) -> Result<Value> {
        let hash = strip_ipfs_prefix(reference);

        for endpoint in &self.pin_endpoints {
            let url = format!("{}api/v0/cat?arg={hash}", ensure_trailing_slash(endpoint));
            match self.read_json(self.http.post(url)).await {
                Ok(content) => return Ok(content),
                Err(err) => warn!("pin endpoint {endpoint} failed to serve {hash}: {err}"),
            }
        }

        for endpoint in &self.fetch_endpoints {
            let url = format!("{}ipfs/{hash}", ensure_trailing_slash(endpoint));
            match self.read_json(self.http.get(url)).await {
                Ok(content) => return Ok(content),
                Err(err) => warn!("gateway {endpoint} failed to serve {hash}: {err}"),
            }
        }

        Err(IpfsError::FetchFailed(hash.to_string()))
    }

    /// Pins `content` to every configured endpoint and returns the single
    /// agreed-upon reference, `/ipfs/`-prefixed.
    pub async fn pin(&self, content: &Value) -> Result<String> {
        (|| async { self.pin_once(content).await })
            .retry(retry::policy())
            .notify(|err: &IpfsError, dur: Duration| {
                warn!("retrying blob pin in {dur:?}: {err}");
            })
            .await
    }

    async fn pin_once(&self, content: &Value) -> Result<String> {
        let body = serde_json::to_vec(content)?;
        let mut references: Vec<String> = Vec::new();

        for endpoint in &self.pin_endpoints {
            match self.pin_to_endpoint(endpoint, body.clone()).await {
                Ok(hash) => references.push(hash),
                Err(err) => warn!("failed to pin content to {endpoint}: {err}"),
            }
        }

        if let Some(pinata) = &self.pinata {
            match self.pin_to_pinata(pinata, content).await {
                Ok(hash) => references.push(hash),
                Err(err) => warn!("failed to pin content to the pinning service: {err}"),
            }
        }

        if references.is_empty() {
            return Err(IpfsError::PinFailed);
        }

        references = references
            .into_iter()
            .map(|hash| format!("/ipfs/{}", strip_ipfs_prefix(&hash)))
            .collect();
        references.sort();
        references.dedup();
        if references.len() != 1 {
            return Err(IpfsError::DivergentRefs(references.join(",")));
        }
        Ok(references.remove(0))
    }

    async fn pin_to_endpoint(&self, endpoint: &Url, body: Vec<u8>) -> Result<String> {
        let part = reqwest::multipart::Part::bytes(body).file_name("claims.json");
        let form = reqwest::multipart::Form::new().part("file", part);
        let added: Value = self
            .read_json(
                self.http
                    .post(format!("{}api/v0/add", ensure_trailing_slash(endpoint)))
                    .multipart(form),
            )
            .await?;
        let hash = added
            .get("Hash")
            .and_then(Value::as_str)
            .ok_or(IpfsError::PinFailed)?
            .to_string();

        self.http
            .post(format!(
                "{}api/v0/pin/add?arg={hash}",
                ensure_trailing_slash(endpoint)
            ))
            .send()
            .await?
            .error_for_status()?;
        Ok(hash)
    }

    async fn pin_to_pinata(&self, pinata: &PinataSettings, content: &Value) -> Result<String> {
        let response: Value = self
            .read_json(
                self.http
                    .post(pinata.endpoint.clone())
                    .header("pinata_api_key", &pinata.api_key)
                    .header("pinata_secret_api_key", &pinata.secret_key)
                    .json(&serde_json::json!({ "pinataContent": content })),
            )
            .await?;
        response
            .get("IpfsHash")
            .and_then(Value::as_str)
            .map(str::to_string)
            .ok_or(IpfsError::PinFailed)
    }

    async fn read_json(&self, request: reqwest::RequestBuilder) -> Result<Value> {
        Ok(request.send().await?.error_for_status()?.json().await?)
    }
}

fn strip_ipfs_prefix(reference: &str) -> &str {
    reference
        .trim_start_matches("ipfs://")
        .trim_start_matches("/ipfs/")
}

fn ensure_trailing_slash(url: &Url) -> String {
    let mut s = url.to_string();
    if !s.ends_with('/') {
        s.push('/');
    }
    s
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strips_reference_prefixes() {
        assert_eq!(strip_ipfs_prefix("ipfs://QmXoypiz"), "QmXoypiz");
        assert_eq!(strip_ipfs_prefix("/ipfs/QmXoypiz"), "QmXoypiz");
        assert_eq!(strip_ipfs_prefix("QmXoypiz"), "QmXoypiz");
    }
}
