//! Vote publication store.
//!
//! Signed votes are published as world-readable JSON objects at
//! `<oracle_address>/<filename>` in an S3 bucket. The oracle writes through
//! the S3 API and blocks until the object is visible; the keeper reads
//! through the public HTTPS endpoint and needs no credentials.

use alloy_primitives::Address;
use backon::Retryable;
use rusoto_core::Region;
use rusoto_s3::{HeadObjectRequest, PutObjectRequest, S3Client, S3};
use serde::Serialize;
use std::{str::FromStr, time::Duration};
use thiserror::Error;
use tracing::warn;

const VISIBILITY_ATTEMPTS: usize = 30;
const VISIBILITY_POLL: Duration = Duration::from_secs(2);

pub type Result<T> = std::result::Result<T, StoreError>;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("invalid S3 region: {0}")]
    Region(String),
    #[error("failed to publish vote at {key}: {message}")]
    Publish { key: String, message: String },
    #[error("vote published at {0} never became visible")]
    NotVisible(String),
    #[error("failed to fetch vote: {0}")]
    Fetch(#[from] reqwest::Error),
    #[error("failed to encode vote: {0}")]
    Encode(#[from] serde_json::Error),
}

#[derive(Clone)]
pub struct VoteStore {
    client: S3Client,
    bucket: String,
    public_url: String,
    http: reqwest::Client,
}

impl VoteStore {
    /// Credentials are resolved from the environment by the S3 client
    /// itself; they never pass through here.
    pub fn new(region: &str, endpoint: Option<String>, bucket: String) -> Result<Self> {
        let public_url = match &endpoint {
            Some(endpoint) => format!("{}/{bucket}", endpoint.trim_end_matches('/')),
            None => format!("https://{bucket}.s3.{region}.amazonaws.com"),
        };
        let region = match endpoint {
            Some(endpoint) => Region::Custom {
                name: region.to_string(),
                endpoint,
            },
            None => Region::from_str(region).map_err(|err| StoreError::Region(err.to_string()))?,
        };
        Ok(Self {
            client: S3Client::new(region),
            bucket,
            public_url,
            http: reqwest::Client::new(),
        })
    }

    /// Uploads `vote` under `<oracle>/<name>` with a public-read ACL and
    /// waits until the object is readable. Re-publishing overwrites.
    pub async fn publish<V: Serialize>(&self, oracle: Address, name: &str, vote: &V) -> Result<()> {
        let key = object_key(oracle, name);
        let body = serde_json::to_vec(vote)?;

        (|| async {
            self.client
                .put_object(PutObjectRequest {
                    bucket: self.bucket.clone(),
                    key: key.clone(),
                    body: Some(body.clone().into()),
                    acl: Some("public-read".to_string()),
                    content_type: Some("application/json".to_string()),
                    ..Default::default()
                })
                .await
                .map_err(|err| StoreError::Publish {
                    key: key.clone(),
                    message: err.to_string(),
                })
        })
        .retry(crate::retry::short_policy())
        .notify(|err: &StoreError, dur: Duration| {
            warn!("retrying vote publication in {dur:?}: {err}");
        })
        .await?;

        self.wait_until_visible(&key).await
    }

    async fn wait_until_visible(&self, key: &str) -> Result<()> {
        for _ in 0..VISIBILITY_ATTEMPTS {
            let head = self
                .client
                .head_object(HeadObjectRequest {
                    bucket: self.bucket.clone(),
                    key: key.to_string(),
                    ..Default::default()
                })
                .await;
            if head.is_ok() {
                return Ok(());
            }
            tokio::time::sleep(VISIBILITY_POLL).await;
        }
        Err(StoreError::NotVisible(key.to_string()))
    }

    /// Reads another oracle's published vote over plain HTTPS. Absent or
    /// malformed objects surface as errors for the caller to skip.
    pub async fn fetch(&self, oracle: Address, name: &str) -> Result<serde_json::Value> {
        let url = format!("{}/{}", self.public_url, object_key(oracle, name));
        Ok(self
            .http
            .get(url)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?)
    }
}

fn object_key(oracle: Address, name: &str) -> String {
    format!("{}/{name}", oracle.to_checksum(None))
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloy_primitives::address;

    #[test]
    fn object_keys_use_checksum_addresses() {
        let oracle = address!("0xfb6916095ca1df60bb79ce92ce3ea74c37c5d359");
        assert_eq!(
            object_key(oracle, "reward-vote.json"),
            "0xfB6916095ca1df60bB79Ce92cE3Ea74c37c5d359/reward-vote.json"
        );
    }
}
