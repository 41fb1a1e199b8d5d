//! Transaction submission with EIP-1559 fee handling.
//!
//! Regular submissions use the node's priority-fee estimate capped by
//! configuration, with `max_fee = priority + 2 × base_fee`. A "fee too low"
//! rejection (`-32010`) is retried up to five times with the same
//! parameters, one block apart; the final attempt escalates to the 80th
//! percentile of validator tips over the last ten blocks. After sending,
//! the submitter waits for the receipt and then for the configured number
//! of confirmation blocks.

use alloy_contract::{CallBuilder, CallDecoder, Error as ContractError};
use alloy_json_rpc::RpcError;
use alloy_provider::{DynProvider, Provider};
use alloy_rpc_types_eth::BlockNumberOrTag;
use anyhow::{anyhow, Context, Result};
use std::time::Duration;
use tracing::{debug, info, warn};

const ATTEMPTS_WITH_DEFAULT_FEE: usize = 5;
const FEE_TOO_LOW_CODE: i64 = -32010;
const FEE_HISTORY_BLOCKS: u64 = 10;
const FEE_HISTORY_PERCENTILE: f64 = 80.0;
const CONFIRMATION_POLL: Duration = Duration::from_secs(15);

#[derive(Clone, Debug)]
pub struct Submitter {
    provider: DynProvider,
    /// Upper bound on the priority fee taken from the node estimate, wei.
    max_priority_fee_cap: u128,
    /// Floor for the escalated priority fee, wei.
    min_effective_priority_fee: Option<u128>,
    seconds_per_block: u64,
    transaction_timeout: Duration,
    confirmation_blocks: u64,
}

struct FeeParams {
    max_priority_fee_per_gas: u128,
    max_fee_per_gas: u128,
}

impl Submitter {
    pub fn new(
        provider: DynProvider,
        max_priority_fee_cap: u128,
        min_effective_priority_fee: Option<u128>,
        seconds_per_block: u64,
        transaction_timeout: Duration,
        confirmation_blocks: u64,
    ) -> Self {
        Self {
            provider,
            max_priority_fee_cap,
            min_effective_priority_fee,
            seconds_per_block,
            transaction_timeout,
            confirmation_blocks,
        }
    }

    /// Estimates, sends, and confirms `call`. A pre-estimation revert (the
    /// nonce moved, the quorum dissolved) surfaces as an error the caller
    /// treats as an expected condition.
    pub async fn submit<P, C>(&self, call: CallBuilder<P, C>) -> Result<()>
    where
        P: Provider + Clone,
        C: CallDecoder + Clone,
    {
        let mut last_error = None;

        for attempt in 0..ATTEMPTS_WITH_DEFAULT_FEE {
            let fees = self.default_fees().await?;
            match self.try_send(call.clone(), fees).await {
                Ok(()) => return Ok(()),
                Err(err) if is_fee_too_low(&err) => {
                    warn!("transaction fee too low, retrying: {err}");
                    last_error = Some(err);
                    if attempt < ATTEMPTS_WITH_DEFAULT_FEE - 1 {
                        tokio::time::sleep(Duration::from_secs(self.seconds_per_block)).await;
                    }
                }
                Err(err) => return Err(err.into()),
            }
        }

        debug!("escalating to a high-priority fee: {last_error:?}");
        let fees = self.high_priority_fees().await?;
        self.try_send(call, fees).await.map_err(Into::into)
    }

    async fn try_send<P, C>(
        &self,
        call: CallBuilder<P, C>,
        fees: FeeParams,
    ) -> Result<(), ContractError>
    where
        P: Provider + Clone,
        C: CallDecoder + Clone,
    {
        let call = call
            .max_priority_fee_per_gas(fees.max_priority_fee_per_gas)
            .max_fee_per_gas(fees.max_fee_per_gas);
        let estimated_gas = call.estimate_gas().await?;
        // 10% headroom over the estimate
        let call = call.gas(estimated_gas + estimated_gas / 10);

        let pending = call.send().await?;
        let tx_hash = *pending.tx_hash();
        info!("submitted transaction: {tx_hash}");

        let receipt = pending
            .with_timeout(Some(self.transaction_timeout))
            .get_receipt()
            .await
            .map_err(alloy_contract::Error::from)?;

        self.wait_for_confirmations(receipt.block_number.unwrap_or_default())
            .await;
        Ok(())
    }

    async fn wait_for_confirmations(&self, inclusion_block: u64) {
        let confirmation_block = inclusion_block + self.confirmation_blocks;
        loop {
            match self.provider.get_block_number().await {
                Ok(current) if current >= confirmation_block => return,
                Ok(current) => {
                    info!(
                        "waiting for {} confirmation blocks",
                        confirmation_block - current
                    );
                }
                Err(err) => warn!("failed to poll the block number: {err}"),
            }
            tokio::time::sleep(CONFIRMATION_POLL).await;
        }
    }

    async fn default_fees(&self) -> Result<FeeParams> {
        let node_estimate = self
            .provider
            .get_max_priority_fee_per_gas()
            .await
            .context("failed to estimate the priority fee")?;
        let max_priority_fee_per_gas = node_estimate.min(self.max_priority_fee_cap);
        let base_fee = self.latest_base_fee().await?;
        Ok(FeeParams {
            max_priority_fee_per_gas,
            max_fee_per_gas: max_priority_fee_per_gas + 2 * base_fee,
        })
    }

    /// 80th percentile of validator tips over the last ten blocks, clamped
    /// to the configured floor.
    async fn high_priority_fees(&self) -> Result<FeeParams> {
        let history = self
            .provider
            .get_fee_history(
                FEE_HISTORY_BLOCKS,
                BlockNumberOrTag::Pending,
                &[FEE_HISTORY_PERCENTILE],
            )
            .await
            .context("failed to fetch the fee history")?;

        let tips: Vec<u128> = history
            .reward
            .unwrap_or_default()
            .iter()
            .filter_map(|block_rewards| block_rewards.first().copied())
            .collect();
        if tips.is_empty() {
            return Err(anyhow!("fee history returned no rewards"));
        }
        let mut priority = tips.iter().sum::<u128>() / tips.len() as u128;
        if let Some(floor) = self.min_effective_priority_fee {
            priority = priority.max(floor);
        }

        let base_fee = self.latest_base_fee().await?;
        Ok(FeeParams {
            max_priority_fee_per_gas: priority,
            max_fee_per_gas: priority + 2 * base_fee,
        })
    }

    async fn latest_base_fee(&self) -> Result<u128> {
        let block = self
            .provider
            .get_block_by_number(BlockNumberOrTag::Latest)
            .await
            .context("failed to fetch the latest block")?
            .ok_or_else(|| anyhow!("node returned no latest block"))?;
        Ok(u128::from(block.header.base_fee_per_gas.unwrap_or_default()))
    }
}

fn is_fee_too_low(error: &ContractError) -> bool {
    matches!(
        error,
        ContractError::TransportError(RpcError::ErrorResp(payload))
            if payload.code == FEE_TOO_LOW_CODE
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloy_json_rpc::ErrorPayload;

    #[test]
    fn fee_too_low_detection_matches_the_rpc_code() {
        let payload: ErrorPayload = serde_json::from_value(serde_json::json!({
            "code": -32010,
            "message": "Transaction fee is too low",
        }))
        .unwrap();
        assert!(is_fee_too_low(&ContractError::TransportError(
            RpcError::ErrorResp(payload)
        )));

        let other: ErrorPayload = serde_json::from_value(serde_json::json!({
            "code": 3,
            "message": "execution reverted",
        }))
        .unwrap();
        assert!(!is_fee_too_low(&ContractError::TransportError(
            RpcError::ErrorResp(other)
        )));
    }
}
