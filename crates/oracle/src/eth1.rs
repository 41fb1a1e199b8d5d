//! Chain anchor and voting-parameter reads (the per-tick snapshot every
//! payload is derived from).

use crate::{decode, queries};
use alloy_primitives::{B256, U256};
use anyhow::{Context, Result};
use serde_json::{json, Value};
use stakepool_common::graph::GraphClient;
use std::time::Duration;
use tracing::info;

const SYNC_POLL: Duration = Duration::from_secs(15);

#[derive(Clone, Copy, Debug)]
pub struct Block {
    pub block_number: u64,
    pub timestamp: u64,
}

#[derive(Clone, Debug)]
pub struct RewardsVotingParameters {
    pub rewards_nonce: u64,
    pub total_rewards: U256,
    pub total_fees: U256,
    pub rewards_updated_at_timestamp: u64,
}

#[derive(Clone, Debug)]
pub struct DistributorVotingParameters {
    pub rewards_nonce: u64,
    pub from_block: u64,
    pub to_block: u64,
    pub last_updated_at_block: u64,
    pub last_merkle_root: Option<B256>,
    pub last_merkle_proofs: Option<String>,
    pub protocol_reward: U256,
    pub distributor_reward: U256,
}

#[derive(Clone, Debug)]
pub struct ValidatorVotingParameters {
    pub validators_nonce: u64,
    pub pool_balance: U256,
}

#[derive(Clone, Debug)]
pub struct VotingParameters {
    pub rewards: RewardsVotingParameters,
    pub distributor: DistributorVotingParameters,
    pub validator: ValidatorVotingParameters,
}

/// Reads against the chain-blocks indexer and the staking-pool indexer.
#[derive(Clone, Debug)]
pub struct Eth1Client {
    chain_graph: GraphClient,
    pool_graph: GraphClient,
    confirmation_blocks: u64,
}

impl Eth1Client {
    pub fn new(chain_graph: GraphClient, pool_graph: GraphClient, confirmation_blocks: u64) -> Self {
        Self {
            chain_graph,
            pool_graph,
            confirmation_blocks,
        }
    }

    pub fn pool_graph(&self) -> &GraphClient {
        &self.pool_graph
    }

    pub fn chain_graph(&self) -> &GraphClient {
        &self.chain_graph
    }

    /// The block exactly `confirmation_blocks` behind the head, with its
    /// timestamp. Authoritative for the whole tick.
    pub async fn finalized_block(&self) -> Result<Block> {
        let reply = self
            .chain_graph
            .find_max_consensus(
                queries::FINALIZED_BLOCK_QUERY,
                json!({ "confirmation_blocks": self.confirmation_blocks }),
                block_id_key,
            )
            .await?;
        decode_block(&reply)
    }

    pub async fn latest_block_number(&self) -> Result<u64> {
        let reply = self
            .chain_graph
            .find_max_consensus(queries::LATEST_BLOCK_QUERY, json!({}), block_id_key)
            .await?;
        Ok(decode_block(&reply)?.block_number)
    }

    /// Blocks until a majority of pool-indexer replicas have indexed
    /// `block_number`.
    pub async fn wait_for_synced_block(&self, block_number: u64) -> Result<()> {
        loop {
            let reply = self
                .pool_graph
                .find_max_consensus(queries::SYNC_BLOCK_QUERY, json!({}), meta_block_key)
                .await?;
            let synced = meta_block_key(&reply).context("reply without _meta block number")?;
            if synced >= block_number {
                return Ok(());
            }
            info!("waiting for indexers to reach block {block_number}, currently at {synced}");
            tokio::time::sleep(SYNC_POLL).await;
        }
    }

    /// One fixed-block snapshot of everything the three controllers vote
    /// on. A missing distributor row decodes to zeroed defaults rather than
    /// an error (cold start).
    pub async fn voting_parameters(&self, block_number: u64) -> Result<VotingParameters> {
        let reply = self
            .pool_graph
            .query(
                queries::VOTING_PARAMETERS_QUERY,
                json!({ "block_number": block_number }),
            )
            .await?;

        let network = decode::first_row(&reply, "networks")?;
        let pool = decode::first_row(&reply, "pools")?;
        let reward_token = decode::first_row(&reply, "rewardEthTokens")?;
        let rewards_nonce = decode::u64_field(network, "oraclesRewardsNonce")?;

        let (last_updated_at_block, rewards_updated_at_block, last_merkle_root, last_merkle_proofs) =
            match decode::rows(&reply, "merkleDistributors")?.first() {
                Some(distributor) => (
                    decode::u64_field(distributor, "updatedAtBlock")?,
                    decode::u64_field(distributor, "rewardsUpdatedAtBlock")?,
                    decode::b256_field(distributor, "merkleRoot").ok(),
                    decode::str_field(distributor, "merkleProofs")
                        .ok()
                        .map(str::to_string),
                ),
                None => (0, 0, None, None),
            };

        let rewards = RewardsVotingParameters {
            rewards_nonce,
            total_rewards: decode::u256_field(reward_token, "totalRewards")?,
            total_fees: decode::u256_field(reward_token, "totalFees")?,
            rewards_updated_at_timestamp: decode::u64_field(reward_token, "updatedAtTimestamp")?,
        };
        let distributor = DistributorVotingParameters {
            rewards_nonce,
            from_block: rewards_updated_at_block,
            to_block: decode::u64_field(reward_token, "updatedAtBlock")?,
            last_updated_at_block,
            last_merkle_root,
            last_merkle_proofs,
            protocol_reward: decode::u256_field(reward_token, "protocolPeriodReward")?,
            distributor_reward: decode::u256_field(reward_token, "distributorPeriodReward")?,
        };
        let validator = ValidatorVotingParameters {
            validators_nonce: decode::u64_field(network, "oraclesValidatorsNonce")?,
            pool_balance: decode::u256_field(pool, "balance")?,
        };

        Ok(VotingParameters {
            rewards,
            distributor,
            validator,
        })
    }
}

fn block_id_key(reply: &Value) -> Option<u64> {
    reply["blocks"][0]["id"].as_str()?.parse().ok()
}

fn meta_block_key(reply: &Value) -> Option<u64> {
    reply["_meta"]["block"]["number"].as_u64().or_else(|| {
        reply["_meta"]["block"]["number"]
            .as_str()?
            .parse()
            .ok()
    })
}

fn decode_block(reply: &Value) -> Result<Block> {
    let row = decode::first_row(reply, "blocks")?;
    Ok(Block {
        block_number: decode::u64_field(row, "id")?,
        timestamp: decode::u64_field(row, "timestamp")?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decodes_block_rows() {
        let reply = json!({ "blocks": [{ "id": "18231555", "timestamp": "1700000123" }] });
        let block = decode_block(&reply).unwrap();
        assert_eq!(block.block_number, 18_231_555);
        assert_eq!(block.timestamp, 1_700_000_123);
    }
}
