//! End-to-end distribution pipeline: split a periodic allocation, route the
//! slices through pools to end accounts, and build a verifiable claims
//! table from the merged map.

use alloy_primitives::{address, Address, B256, U256};
use anyhow::{anyhow, Result};
use async_trait::async_trait;
use stakepool_common::rewards::{merge, token_total, Rewards};
use stakepool_oracle::distributor::{
    merkle::{calculate_merkle_root, merkle_element, verify_proof},
    planner::{pro_rata, split_allocations, BLOCKS_INTERVAL},
    routing::{LiquiditySource, Router, RoutingTables},
    types::{Balances, TokenAllocation, TokenAllocations},
};
use std::collections::{BTreeMap, HashMap};

const REWARD_TOKEN: Address = address!("0x1010101010101010101010101010101010101010");
const POOL: Address = address!("0x4040404040404040404040404040404040404040");
const INNER_POOL: Address = address!("0x5050505050505050505050505050505050505050");
const USER_A: Address = address!("0xaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaa");
const USER_B: Address = address!("0xbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbb");
const USER_C: Address = address!("0xcccccccccccccccccccccccccccccccccccccccc");

/// Fixed balance tables standing in for the indexer.
struct FakeLiquidity {
    tick_positions: HashMap<Address, Balances>,
}

impl FakeLiquidity {
    fn lookup(&self, pool: Address) -> Result<Balances> {
        self.tick_positions
            .get(&pool)
            .cloned()
            .ok_or_else(|| anyhow!("no balances for {pool}"))
    }
}

#[async_trait]
impl LiquiditySource for FakeLiquidity {
    async fn single_token_balances(
        &self,
        pool: Address,
        _token: Address,
        _block_number: u64,
    ) -> Result<Balances> {
        self.lookup(pool)
    }

    async fn range_liquidity_points(
        &self,
        pool: Address,
        _tick_lower: i32,
        _tick_upper: i32,
        _block_number: u64,
    ) -> Result<Balances> {
        self.lookup(pool)
    }

    async fn current_tick_liquidity_points(
        &self,
        pool: Address,
        _block_number: u64,
    ) -> Result<Balances> {
        self.lookup(pool)
    }

    async fn token_holder_points(
        &self,
        token: Address,
        _from_block: u64,
        _to_block: u64,
    ) -> Result<Balances> {
        self.lookup(token)
    }
}

fn balances(entries: &[(Address, u64)]) -> Balances {
    let mut result = Balances::default();
    for (account, amount) in entries {
        result.balances.insert(*account, U256::from(*amount));
        result.total_supply += U256::from(*amount);
    }
    result
}

fn test_tables() -> RoutingTables {
    let mut tables = RoutingTables {
        fallback_address: address!("0xf0f0f0f0f0f0f0f0f0f0f0f0f0f0f0f0f0f0f0f0"),
        staked_token: address!("0x2020202020202020202020202020202020202020"),
        reward_token_contract: REWARD_TOKEN,
        governance_token: address!("0x3030303030303030303030303030303030303030"),
        ..Default::default()
    };
    tables.pools.staked_token_pools.insert(POOL);
    tables.pools.staked_token_pools.insert(INNER_POOL);
    tables
}

#[tokio::test]
async fn allocation_routes_to_end_accounts_exactly() {
    // a periodic allocation spanning two full slices plus a remainder
    let span = BLOCKS_INTERVAL * 2 + 10;
    let committed = U256::from(1_000_003u64);
    let mut allocations = TokenAllocations::new();
    allocations.entry(POOL).or_default().push(TokenAllocation {
        from_block: 1_000,
        to_block: 1_000 + span,
        reward_token: REWARD_TOKEN,
        reward: committed,
    });

    let distributions = split_allocations(&allocations, 1_000, 1_000 + span);
    let split_total: U256 = distributions
        .iter()
        .fold(U256::ZERO, |acc, distribution| acc + distribution.reward);
    assert_eq!(split_total, committed, "splitting must conserve the reward");

    // POOL pays A and the inner pool; the inner pool pays B and C
    let source = FakeLiquidity {
        tick_positions: HashMap::from([
            (POOL, balances(&[(USER_A, 50), (INNER_POOL, 50)])),
            (INNER_POOL, balances(&[(USER_B, 25), (USER_C, 75)])),
        ]),
    };
    let tables = test_tables();

    let mut rewards = Rewards::new();
    for distribution in &distributions {
        let router = Router::new(
            &source,
            &tables,
            distribution.from_block,
            distribution.to_block,
            distribution.reward_token,
            distribution.uni_v3_token,
        );
        let branch = router
            .get_rewards(distribution.contract, distribution.reward)
            .await
            .unwrap();
        merge(&mut rewards, branch);
    }

    // routing conserves the full committed amount across all accounts
    assert_eq!(token_total(&rewards, REWARD_TOKEN), committed);
    assert!(rewards.contains_key(&USER_A));
    assert!(rewards.contains_key(&USER_B));
    assert!(rewards.contains_key(&USER_C));
    assert!(!rewards.contains_key(&POOL));
    assert!(!rewards.contains_key(&INNER_POOL));
}

#[tokio::test]
async fn routed_rewards_produce_a_verifiable_claims_table() {
    let source = FakeLiquidity {
        tick_positions: HashMap::from([(POOL, balances(&[(USER_A, 60), (USER_B, 40)]))]),
    };
    let tables = test_tables();
    let router = Router::new(&source, &tables, 100, 200, REWARD_TOKEN, Address::ZERO);

    let mut rewards = router.get_rewards(POOL, U256::from(100_000)).await.unwrap();

    // stakers with disabled rewards join the same map
    let stakers = vec![(USER_B, U256::from(3)), (USER_C, U256::from(7))];
    for (staker, amount) in pro_rata(&stakers, U256::from(10_000)) {
        let branch: Rewards = BTreeMap::from([(staker, BTreeMap::from([(REWARD_TOKEN, amount)]))]);
        merge(&mut rewards, branch);
    }

    let (root, claims) = calculate_merkle_root(&rewards).unwrap();
    assert_eq!(claims.len(), 3);

    for (account, claim) in &claims {
        let account: Address = account.parse().unwrap();
        let tokens: Vec<Address> = claim.tokens.iter().map(|t| t.parse().unwrap()).collect();
        let values: Vec<U256> = claim.values.iter().map(|v| v.parse().unwrap()).collect();
        let proof: Vec<B256> = claim.proof.iter().map(|p| p.parse().unwrap()).collect();
        let leaf = merkle_element(claim.index, &tokens, account, &values);
        assert!(verify_proof(root, leaf, &proof));
    }
}
