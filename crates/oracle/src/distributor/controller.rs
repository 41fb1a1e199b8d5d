//! Distributor vote: plans the tick's distributions, routes them to
//! end-beneficiaries, carries unclaimed balances forward, builds the Merkle
//! tree, pins the claims table, and publishes the signed vote.

use crate::{
    distributor::{
        merkle::calculate_merkle_root,
        planner,
        routing::{IndexedLiquidity, Router, RoutingTables},
        tokens,
        uniswap::UniswapClient,
    },
    eth1::DistributorVotingParameters,
    publisher::VotePublisher,
};
use alloy_primitives::Address;
use anyhow::{Context, Result};
use futures::future::try_join_all;
use stakepool_common::{
    graph::GraphClient,
    ipfs::IpfsClient,
    rewards::{merge, Rewards},
    vote::{self, DistributorVote, DISTRIBUTOR_VOTE_FILENAME},
};
use std::sync::Arc;
use tracing::info;

pub struct DistributorController {
    pool_graph: GraphClient,
    uniswap: UniswapClient,
    liquidity: IndexedLiquidity,
    ipfs: IpfsClient,
    publisher: Arc<VotePublisher>,
    fallback_address: Address,
    reward_token_contract: Address,
    staked_token: Address,
    governance_token: Address,
    operator_address: Address,
    /// Suppresses a duplicate vote for the same window; written only at the
    /// end of a clean tick.
    last_to_block: Option<u64>,
}

impl DistributorController {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        pool_graph: GraphClient,
        uniswap: UniswapClient,
        ipfs: IpfsClient,
        publisher: Arc<VotePublisher>,
        fallback_address: Address,
        reward_token_contract: Address,
        staked_token: Address,
        governance_token: Address,
        operator_address: Address,
    ) -> Self {
        let liquidity = IndexedLiquidity::new(uniswap.clone(), pool_graph.clone());
        Self {
            pool_graph,
            uniswap,
            liquidity,
            ipfs,
            publisher,
            fallback_address,
            reward_token_contract,
            staked_token,
            governance_token,
            operator_address,
            last_to_block: None,
        }
    }

    pub async fn process(&mut self, params: &DistributorVotingParameters) -> Result<()> {
        let from_block = params.from_block;
        let to_block = params.to_block;

        // too early, or this window has already been voted for
        if to_block <= params.last_updated_at_block
            || self.last_to_block == Some(to_block)
            || from_block >= to_block
        {
            return Ok(());
        }

        info!("voting for merkle distributor rewards: from block={from_block}, to block={to_block}");

        let allocations =
            planner::periodic_allocations(&self.pool_graph, from_block, to_block).await?;
        let pools = self.uniswap.pools(to_block).await?;

        let mut distributions = planner::split_allocations(&allocations, from_block, to_block);
        distributions.extend(
            planner::disabled_staker_distributions(
                &self.pool_graph,
                params.distributor_reward,
                from_block,
                to_block,
                self.reward_token_contract,
                self.staked_token,
            )
            .await?,
        );

        // balances from the previous tree that were never claimed carry over
        let unclaimed = match (&params.last_merkle_root, &params.last_merkle_proofs) {
            (Some(root), Some(proofs)) if !root.is_zero() && !proofs.is_empty() => {
                let claimed =
                    planner::claimed_accounts(&self.pool_graph, &format!("{root}")).await?;
                let previous_claims = self
                    .ipfs
                    .fetch(proofs)
                    .await
                    .context("failed to fetch previous claims table")?;
                planner::unclaimed_rewards(&previous_claims, &claimed)?
            }
            _ => Rewards::new(),
        };

        let tables = RoutingTables {
            pools,
            distributor_tokens: tokens::distributor_tokens(&self.pool_graph, from_block).await?,
            redirects: tokens::distributor_redirects(&self.pool_graph, from_block).await?,
            fallback_address: self.fallback_address,
            staked_token: self.staked_token,
            reward_token_contract: self.reward_token_contract,
            governance_token: self.governance_token,
        };

        // route every distribution concurrently and merge the branches
        let routed = try_join_all(distributions.iter().map(|distribution| {
            let router = Router::new(
                &self.liquidity,
                &tables,
                distribution.from_block,
                distribution.to_block,
                distribution.reward_token,
                distribution.uni_v3_token,
            );
            async move {
                router
                    .get_rewards(distribution.contract, distribution.reward)
                    .await
            }
        }))
        .await?;

        let mut final_rewards = Rewards::new();
        for branch in routed {
            merge(&mut final_rewards, branch);
        }
        merge(
            &mut final_rewards,
            planner::one_time_rewards(
                &self.pool_graph,
                &self.ipfs,
                from_block,
                to_block,
                self.fallback_address,
            )
            .await?,
        );
        merge(
            &mut final_rewards,
            planner::protocol_rewards(
                params.protocol_reward,
                self.operator_address,
                self.reward_token_contract,
                self.fallback_address,
            ),
        );
        merge(&mut final_rewards, unclaimed);

        if final_rewards.is_empty() {
            info!("no rewards to distribute");
            return Ok(());
        }

        let (merkle_root, claims) = calculate_merkle_root(&final_rewards)?;
        info!("generated new merkle root: {merkle_root}");

        let claims_link = self
            .ipfs
            .pin(&serde_json::to_value(&claims)?)
            .await
            .context("failed to pin claims table")?;
        info!("claims uploaded to: {claims_link}");

        let encoded =
            vote::encode_distributor_vote(params.rewards_nonce, &claims_link, merkle_root);
        self.publisher
            .publish(DISTRIBUTOR_VOTE_FILENAME, &encoded, |signature| {
                DistributorVote {
                    nonce: params.rewards_nonce,
                    merkle_root: format!("{merkle_root}"),
                    merkle_proofs: claims_link.clone(),
                    signature,
                }
            })
            .await?;
        info!("distributor vote has been successfully submitted");

        self.last_to_block = Some(to_block);
        Ok(())
    }
}
