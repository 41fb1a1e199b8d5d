//! Rewards vote: sums beacon-chain balances of the pool validators at the
//! sync-period boundary epoch and votes `(activated_validators, total_rewards)`.

use crate::{
    beacon::{BeaconApi, ValidatorInfo},
    decode,
    eth1::RewardsVotingParameters,
    publisher::VotePublisher,
    queries,
};
use alloy_primitives::{I256, U256};
use anyhow::Result;
use futures::{stream, StreamExt};
use serde_json::json;
use stakepool_common::{
    graph::GraphClient,
    vote::{self, RewardsVote, REWARD_VOTE_FILENAME},
    wei,
};
use std::{sync::Arc, time::Duration};
use tracing::{debug, info, warn};

const VALIDATORS_BATCH: usize = 100;
const VALIDATORS_CONCURRENCY: usize = 4;
const FINALITY_POLL: Duration = Duration::from_secs(360);

pub struct RewardsController<B> {
    beacon: B,
    pool_graph: GraphClient,
    publisher: Arc<VotePublisher>,
    genesis_timestamp: u64,
    sync_period: u64,
    slots_per_epoch: u64,
    seconds_per_epoch: u64,
    deposit_token_symbol: String,
}

impl<B: BeaconApi> RewardsController<B> {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        beacon: B,
        pool_graph: GraphClient,
        publisher: Arc<VotePublisher>,
        genesis_timestamp: u64,
        sync_period: u64,
        slots_per_epoch: u64,
        seconds_per_epoch: u64,
        deposit_token_symbol: String,
    ) -> Self {
        Self {
            beacon,
            pool_graph,
            publisher,
            genesis_timestamp,
            sync_period,
            slots_per_epoch,
            seconds_per_epoch,
            deposit_token_symbol,
        }
    }

    pub async fn process(
        &self,
        params: &RewardsVotingParameters,
        current_block_number: u64,
        current_timestamp: u64,
    ) -> Result<()> {
        let Some(update_timestamp) = next_update_time(
            params.rewards_updated_at_timestamp,
            self.sync_period,
            current_timestamp,
        ) else {
            debug!("rewards update time not reached yet");
            return Ok(());
        };

        let public_keys = self.registered_public_keys(current_block_number).await?;
        let update_epoch = (update_timestamp - self.genesis_timestamp) / self.seconds_per_epoch;
        info!(
            "voting for new total rewards: timestamp={update_timestamp}, epoch={update_epoch}, validators={}",
            public_keys.len()
        );

        loop {
            let checkpoints = self.beacon.finality_checkpoints().await?;
            if checkpoints.finalized_epoch >= update_epoch {
                break;
            }
            info!("waiting for epoch {update_epoch} to finalize");
            tokio::time::sleep(FINALITY_POLL).await;
        }

        let state_id = (update_epoch * self.slots_per_epoch).to_string();
        let batches: Vec<Vec<String>> = public_keys
            .chunks(VALIDATORS_BATCH)
            .map(<[String]>::to_vec)
            .collect();
        let results: Vec<Result<Vec<ValidatorInfo>>> = stream::iter(batches)
            .map(|batch| {
                let state_id = state_id.clone();
                async move { self.beacon.validators(&state_id, &batch).await }
            })
            .buffer_unordered(VALIDATORS_CONCURRENCY)
            .collect()
            .await;

        let mut validators = Vec::new();
        for result in results {
            validators.extend(result?);
        }
        let (activated_validators, total) = aggregate_validators(&validators);

        let total_rewards = if total < to_signed(params.total_rewards) {
            warn!(
                "total rewards decreased since the previous update: current={}, previous={}",
                format_signed_ether(total, &self.deposit_token_symbol),
                wei::format_ether(params.total_rewards, &self.deposit_token_symbol),
            );
            params.total_rewards
        } else {
            U256::try_from(total).unwrap_or_default()
        };

        info!(
            "submitting rewards vote: nonce={}, total rewards={}, activated validators={activated_validators}",
            params.rewards_nonce,
            wei::format_ether(total_rewards, &self.deposit_token_symbol),
        );

        let encoded =
            vote::encode_rewards_vote(params.rewards_nonce, activated_validators, total_rewards);
        self.publisher
            .publish(REWARD_VOTE_FILENAME, &encoded, |signature| RewardsVote {
                nonce: params.rewards_nonce,
                activated_validators,
                total_rewards: total_rewards.to_string(),
                signature,
            })
            .await?;
        info!("rewards vote has been successfully submitted");

        Ok(())
    }

    async fn registered_public_keys(&self, block_number: u64) -> Result<Vec<String>> {
        let rows = self
            .pool_graph
            .query_paginated(
                queries::REGISTERED_VALIDATORS_QUERY,
                json!({ "block_number": block_number }),
                "validators",
            )
            .await?;
        rows.iter()
            .map(|row| Ok(decode::str_field(row, "id")?.to_string()))
            .collect()
    }
}

/// The sync-period boundary strictly in the past that the vote targets, or
/// `None` when the next boundary is still in the future.
pub fn next_update_time(last_updated_at: u64, sync_period: u64, now: u64) -> Option<u64> {
    let mut next = last_updated_at + sync_period;
    while next + sync_period <= now {
        next += sync_period;
    }
    (next <= now).then_some(next)
}

/// Counts non-pending validators and sums their balance deltas against the
/// 32-ether deposit. Individual deltas can be negative (leaked balances), so
/// the running sum is signed.
pub fn aggregate_validators(validators: &[ValidatorInfo]) -> (u64, I256) {
    let deposit = to_signed(wei::validator_deposit());
    let mut activated = 0u64;
    let mut total = I256::ZERO;
    for validator in validators {
        if validator.is_pending() {
            continue;
        }
        activated += 1;
        total += to_signed(wei::gwei_to_wei(validator.balance_gwei)) - deposit;
    }
    (activated, total)
}

fn to_signed(wei: U256) -> I256 {
    I256::try_from(wei).unwrap_or(I256::MAX)
}

fn format_signed_ether(value: I256, symbol: &str) -> String {
    if value.is_negative() {
        format!(
            "-{}",
            wei::format_ether(U256::try_from(-value).unwrap_or_default(), symbol)
        )
    } else {
        wei::format_ether(U256::try_from(value).unwrap_or_default(), symbol)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn validator(status: &str, balance_gwei: u64) -> ValidatorInfo {
        ValidatorInfo {
            public_key: format!("0x{}", "ab".repeat(48)),
            status: status.to_string(),
            balance_gwei,
        }
    }

    #[test]
    fn update_time_advances_by_whole_periods() {
        // last update at t=1000, period 100, now 1250: boundary is 1200
        assert_eq!(next_update_time(1000, 100, 1250), Some(1200));
        // exactly on the boundary counts
        assert_eq!(next_update_time(1000, 100, 1100), Some(1100));
        // too early
        assert_eq!(next_update_time(1000, 100, 1099), None);
    }

    #[test]
    fn pending_validators_are_excluded() {
        let validators = vec![
            validator("active_ongoing", 32_000_000_001),
            validator("pending_queued", 32_000_000_000),
            validator("pending_initialized", 32_000_000_000),
            validator("exited_unslashed", 32_500_000_000),
        ];
        let (activated, total) = aggregate_validators(&validators);
        assert_eq!(activated, 2);
        assert_eq!(total, to_signed(wei::gwei_to_wei(500_000_001)));
    }

    #[test]
    fn slashed_balances_can_sum_negative() {
        let validators = vec![validator("active_slashed", 31_000_000_000)];
        let (activated, total) = aggregate_validators(&validators);
        assert_eq!(activated, 1);
        assert!(total.is_negative());
    }

    #[test]
    fn monotonic_clamp_never_votes_downward() {
        // the controller clamps to the previous total when the aggregate
        // dropped; model the comparison here
        let previous = U256::from(1_000u64);
        let aggregated = I256::try_from(U256::from(900u64)).unwrap();
        let voted = if aggregated < to_signed(previous) {
            previous
        } else {
            U256::try_from(aggregated).unwrap()
        };
        assert_eq!(voted, previous);
    }
}
