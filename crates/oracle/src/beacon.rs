//! Beacon node REST client (v1 endpoints).

use crate::decode;
use anyhow::{Context, Result};
use async_trait::async_trait;
use backon::Retryable;
use serde_json::Value;
use std::time::Duration;
use stakepool_common::retry;
use tracing::warn;
use url::Url;

/// Clients differ in how they expect the validator id list to be encoded:
/// lighthouse takes one comma-joined `id` parameter, prysm and teku take a
/// repeated `&id=` parameter.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BeaconFlavor {
    Lighthouse,
    Prysm,
}

#[derive(Clone, Debug)]
pub struct FinalityCheckpoints {
    pub finalized_epoch: u64,
}

#[derive(Clone, Debug)]
pub struct Genesis {
    pub genesis_time: u64,
}

#[derive(Clone, Debug)]
pub struct ValidatorInfo {
    pub public_key: String,
    pub status: String,
    pub balance_gwei: u64,
}

impl ValidatorInfo {
    /// Validators that have not yet entered the activation queue proper do
    /// not count toward the aggregate.
    pub fn is_pending(&self) -> bool {
        matches!(self.status.as_str(), "pending_initialized" | "pending_queued")
    }
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait BeaconApi: Send + Sync {
    async fn finality_checkpoints(&self) -> Result<FinalityCheckpoints>;
    async fn genesis(&self) -> Result<Genesis>;
    async fn validators(&self, state_id: &str, public_keys: &[String])
        -> Result<Vec<ValidatorInfo>>;
}

#[derive(Clone, Debug)]
pub struct BeaconClient {
    endpoint: Url,
    flavor: BeaconFlavor,
    http: reqwest::Client,
}

impl BeaconClient {
    pub fn new(endpoint: Url, flavor: BeaconFlavor) -> Self {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(60))
            .build()
            .expect("failed to build HTTP client");
        Self {
            endpoint,
            flavor,
            http,
        }
    }

    async fn get_data(&self, path: &str) -> Result<Value> {
        let url = format!("{}{path}", self.endpoint.as_str().trim_end_matches('/'));
        let reply: Value = (|| async {
            self.http
                .get(&url)
                .send()
                .await?
                .error_for_status()?
                .json::<Value>()
                .await
        })
        .retry(retry::policy())
        .notify(|err: &reqwest::Error, dur: Duration| {
            warn!("retrying beacon request in {dur:?}: {err}");
        })
        .await
        .with_context(|| format!("beacon request failed: {path}"))?;

        reply
            .get("data")
            .cloned()
            .context("beacon reply without a data field")
    }
}

#[async_trait]
impl BeaconApi for BeaconClient {
    async fn finality_checkpoints(&self) -> Result<FinalityCheckpoints> {
        let data = self
            .get_data("/eth/v1/beacon/states/head/finality_checkpoints")
            .await?;
        let finalized = decode::field(&data, "finalized")?;
        Ok(FinalityCheckpoints {
            finalized_epoch: decode::u64_field(finalized, "epoch")?,
        })
    }

    async fn genesis(&self) -> Result<Genesis> {
        let data = self.get_data("/eth/v1/beacon/genesis").await?;
        Ok(Genesis {
            genesis_time: decode::u64_field(&data, "genesis_time")?,
        })
    }

    async fn validators(
        &self,
        state_id: &str,
        public_keys: &[String],
    ) -> Result<Vec<ValidatorInfo>> {
        if public_keys.is_empty() {
            return Ok(Vec::new());
        }
        let ids = match self.flavor {
            BeaconFlavor::Lighthouse => public_keys.join(","),
            BeaconFlavor::Prysm => public_keys.join("&id="),
        };
        let data = self
            .get_data(&format!(
                "/eth/v1/beacon/states/{state_id}/validators?id={ids}"
            ))
            .await?;

        let rows = data
            .as_array()
            .context("beacon validators reply is not a list")?;
        rows.iter()
            .map(|row| {
                let validator = decode::field(row, "validator")?;
                Ok(ValidatorInfo {
                    public_key: decode::str_field(validator, "pubkey")?.to_string(),
                    status: decode::str_field(row, "status")?.to_string(),
                    balance_gwei: decode::u64_field(row, "balance")?,
                })
            })
            .collect()
    }
}
