//! The reward routing engine.
//!
//! Expands a distribution targeted at a contract into a per-account reward
//! map by recursively fetching holder balances of routable contracts.
//! Redirected addresses are marked visited so a redirect chain cannot loop;
//! any share that would revisit a contract on the current path, or that
//! lands on an unroutable target with no holders, is assigned to the
//! fallback address. Accounts are always walked in ascending address order
//! and the last account absorbs the division residue, so the emitted map
//! sums exactly to the input reward.

use crate::distributor::{
    tokens,
    types::{Balances, UniswapPools},
    uniswap::{UniswapClient, FULL_RANGE_TICK_LOWER, FULL_RANGE_TICK_UPPER},
};
use alloy_primitives::{Address, U256, U512};
use anyhow::{bail, Result};
use async_trait::async_trait;
use futures::future::BoxFuture;
use stakepool_common::{
    graph::GraphClient,
    rewards::{add_value, merge, Rewards},
};
use std::collections::{BTreeSet, HashMap, HashSet};
use tracing::debug;

/// Balance fetching behind the engine, one method per routing strategy.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait LiquiditySource: Send + Sync {
    async fn single_token_balances(
        &self,
        pool: Address,
        token: Address,
        block_number: u64,
    ) -> Result<Balances>;

    async fn range_liquidity_points(
        &self,
        pool: Address,
        tick_lower: i32,
        tick_upper: i32,
        block_number: u64,
    ) -> Result<Balances>;

    async fn current_tick_liquidity_points(
        &self,
        pool: Address,
        block_number: u64,
    ) -> Result<Balances>;

    async fn token_holder_points(
        &self,
        token: Address,
        from_block: u64,
        to_block: u64,
    ) -> Result<Balances>;
}

/// Production source backed by the AMM and pool indexers.
pub struct IndexedLiquidity {
    uniswap: UniswapClient,
    pool_graph: GraphClient,
}

impl IndexedLiquidity {
    pub fn new(uniswap: UniswapClient, pool_graph: GraphClient) -> Self {
        Self { uniswap, pool_graph }
    }
}

#[async_trait]
impl LiquiditySource for IndexedLiquidity {
    async fn single_token_balances(
        &self,
        pool: Address,
        token: Address,
        block_number: u64,
    ) -> Result<Balances> {
        self.uniswap
            .single_token_balances(pool, token, block_number)
            .await
    }

    async fn range_liquidity_points(
        &self,
        pool: Address,
        tick_lower: i32,
        tick_upper: i32,
        block_number: u64,
    ) -> Result<Balances> {
        self.uniswap
            .range_liquidity_points(pool, tick_lower, tick_upper, block_number)
            .await
    }

    async fn current_tick_liquidity_points(
        &self,
        pool: Address,
        block_number: u64,
    ) -> Result<Balances> {
        self.uniswap
            .current_tick_liquidity_points(pool, block_number)
            .await
    }

    async fn token_holder_points(
        &self,
        token: Address,
        from_block: u64,
        to_block: u64,
    ) -> Result<Balances> {
        tokens::token_holder_points(&self.pool_graph, token, from_block, to_block).await
    }
}

/// Routable sets and redirect table shared by every distribution of a tick.
#[derive(Clone, Debug, Default)]
pub struct RoutingTables {
    pub pools: UniswapPools,
    pub distributor_tokens: BTreeSet<Address>,
    pub redirects: HashMap<Address, Address>,
    pub fallback_address: Address,
    pub staked_token: Address,
    pub reward_token_contract: Address,
    pub governance_token: Address,
}

impl RoutingTables {
    fn is_routable(&self, contract: &Address) -> bool {
        self.pools.contains(contract) || self.distributor_tokens.contains(contract)
    }
}

/// One distribution's routing context.
pub struct Router<'a, L> {
    source: &'a L,
    tables: &'a RoutingTables,
    from_block: u64,
    to_block: u64,
    reward_token: Address,
    uni_v3_token: Address,
}

impl<'a, L: LiquiditySource> Router<'a, L> {
    pub fn new(
        source: &'a L,
        tables: &'a RoutingTables,
        from_block: u64,
        to_block: u64,
        reward_token: Address,
        uni_v3_token: Address,
    ) -> Self {
        Self {
            source,
            tables,
            from_block,
            to_block,
            reward_token,
            uni_v3_token,
        }
    }

    /// Expands `reward` targeted at `contract` into per-account rewards.
    pub async fn get_rewards(&self, contract: Address, reward: U256) -> Result<Rewards> {
        if reward.is_zero() {
            return Ok(Rewards::new());
        }

        let mut visited = HashSet::new();
        let mut contract = contract;
        if let Some(target) = self.tables.redirects.get(&contract) {
            visited.insert(contract);
            contract = *target;
        }

        if self.tables.is_routable(&contract) {
            visited.insert(contract);
            return self.expand(contract, reward, visited).await;
        }

        // unknown target, assign everything to the fallback address
        let mut rewards = Rewards::new();
        add_value(
            &mut rewards,
            self.tables.fallback_address,
            self.reward_token,
            reward,
        );
        Ok(rewards)
    }

    fn expand(
        &self,
        contract: Address,
        total: U256,
        visited: HashSet<Address>,
    ) -> BoxFuture<'_, Result<Rewards>> {
        Box::pin(async move {
            let mut visited = visited;
            let mut rewards = Rewards::new();

            let Balances {
                total_supply,
                balances,
            } = self.balances_of(contract).await?;
            if total_supply.is_zero() || balances.is_empty() {
                add_value(
                    &mut rewards,
                    self.tables.fallback_address,
                    self.reward_token,
                    total,
                );
                return Ok(rewards);
            }

            let accounts: Vec<Address> = balances.keys().copied().collect();
            let last_index = accounts.len() - 1;
            let mut distributed = U256::ZERO;
            for (i, account) in accounts.into_iter().enumerate() {
                let share = if i == last_index {
                    total.saturating_sub(distributed)
                } else {
                    proportional(total, balances[&account], total_supply)
                };
                if share.is_zero() {
                    continue;
                }

                let mut account = account;
                if let Some(target) = self.tables.redirects.get(&account) {
                    visited.insert(account);
                    account = *target;
                }

                if account == contract || visited.contains(&account) {
                    // cannot assign without revisiting the path
                    debug!("reward of {contract} loops back through {account}, using fallback");
                    add_value(
                        &mut rewards,
                        self.tables.fallback_address,
                        self.reward_token,
                        share,
                    );
                } else if self.tables.is_routable(&account) {
                    let mut branch_visited = visited.clone();
                    branch_visited.insert(account);
                    let branch = self.expand(account, share, branch_visited).await?;
                    merge(&mut rewards, branch);
                } else {
                    add_value(&mut rewards, account, self.reward_token, share);
                }

                distributed += share;
            }

            Ok(rewards)
        })
    }

    async fn balances_of(&self, contract: Address) -> Result<Balances> {
        let tables = self.tables;
        let pools = &tables.pools;

        if self.uni_v3_token == tables.staked_token
            && pools.staked_token_pools.contains(&contract)
        {
            debug!("fetching staked-token balances: pool={contract}");
            self.source
                .single_token_balances(contract, tables.staked_token, self.to_block)
                .await
        } else if self.uni_v3_token == tables.reward_token_contract
            && pools.reward_token_pools.contains(&contract)
        {
            debug!("fetching reward-token balances: pool={contract}");
            self.source
                .single_token_balances(contract, tables.reward_token_contract, self.to_block)
                .await
        } else if self.uni_v3_token == tables.governance_token
            && pools.governance_token_pools.contains(&contract)
        {
            debug!("fetching governance-token balances: pool={contract}");
            self.source
                .single_token_balances(contract, tables.governance_token, self.to_block)
                .await
        } else if self.uni_v3_token == Address::ZERO
            && pools.governance_token_pools.contains(&contract)
        {
            debug!("fetching full-range liquidity points: pool={contract}");
            self.source
                .range_liquidity_points(
                    contract,
                    FULL_RANGE_TICK_LOWER,
                    FULL_RANGE_TICK_UPPER,
                    self.to_block,
                )
                .await
        } else if pools.contains(&contract) {
            debug!("fetching current-tick liquidity points: pool={contract}");
            self.source
                .current_tick_liquidity_points(contract, self.to_block)
                .await
        } else if tables.distributor_tokens.contains(&contract) {
            debug!("fetching token holder points: token={contract}");
            self.source
                .token_holder_points(contract, self.from_block, self.to_block)
                .await
        } else {
            bail!("cannot fetch balances for unroutable contract {contract}")
        }
    }
}

fn proportional(total: U256, balance: U256, total_supply: U256) -> U256 {
    (U512::from(total) * U512::from(balance) / U512::from(total_supply)).saturating_to()
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloy_primitives::address;
    use stakepool_common::rewards::token_total;

    const REWARD_TOKEN: Address = address!("0x1010101010101010101010101010101010101010");
    const FALLBACK: Address = address!("0xf0f0f0f0f0f0f0f0f0f0f0f0f0f0f0f0f0f0f0f0");
    const POOL: Address = address!("0x4040404040404040404040404040404040404040");
    const POOL_2: Address = address!("0x5050505050505050505050505050505050505050");
    const USER_A: Address = address!("0xaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaa");
    const USER_B: Address = address!("0xbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbb");

    fn tables_with_pools(pools: &[Address]) -> RoutingTables {
        let mut tables = RoutingTables {
            fallback_address: FALLBACK,
            staked_token: address!("0x2020202020202020202020202020202020202020"),
            reward_token_contract: REWARD_TOKEN,
            governance_token: address!("0x3030303030303030303030303030303030303030"),
            ..Default::default()
        };
        for pool in pools {
            tables.pools.staked_token_pools.insert(*pool);
        }
        tables
    }

    fn balances(entries: &[(Address, u64)]) -> Balances {
        let mut result = Balances::default();
        for (account, amount) in entries {
            result.balances.insert(*account, U256::from(*amount));
            result.total_supply += U256::from(*amount);
        }
        result
    }

    #[tokio::test]
    async fn zero_reward_yields_nothing() {
        let source = MockLiquiditySource::new();
        let tables = tables_with_pools(&[POOL]);
        let router = Router::new(&source, &tables, 100, 200, REWARD_TOKEN, Address::ZERO);

        let rewards = router.get_rewards(POOL, U256::ZERO).await.unwrap();
        assert!(rewards.is_empty());
    }

    #[tokio::test]
    async fn unknown_contract_goes_to_fallback() {
        let source = MockLiquiditySource::new();
        let tables = tables_with_pools(&[POOL]);
        let router = Router::new(&source, &tables, 100, 200, REWARD_TOKEN, Address::ZERO);

        let unknown = address!("0x000000000000000000000000000000000000dead");
        let rewards = router.get_rewards(unknown, U256::from(1000)).await.unwrap();
        assert_eq!(rewards[&FALLBACK][&REWARD_TOKEN], U256::from(1000));
        assert_eq!(rewards.len(), 1);
    }

    #[tokio::test]
    async fn pool_expands_to_users_proportionally() {
        let mut source = MockLiquiditySource::new();
        source
            .expect_current_tick_liquidity_points()
            .returning(|_, _| Ok(balances(&[(USER_A, 60), (USER_B, 40)])));
        let tables = tables_with_pools(&[POOL]);
        let router = Router::new(&source, &tables, 100, 200, REWARD_TOKEN, Address::ZERO);

        let rewards = router.get_rewards(POOL, U256::from(100)).await.unwrap();
        assert_eq!(rewards[&USER_A][&REWARD_TOKEN], U256::from(60));
        assert_eq!(rewards[&USER_B][&REWARD_TOKEN], U256::from(40));
    }

    #[tokio::test]
    async fn last_account_absorbs_the_residual() {
        let mut source = MockLiquiditySource::new();
        source
            .expect_current_tick_liquidity_points()
            .returning(|_, _| Ok(balances(&[(USER_A, 60), (USER_B, 40)])));
        let tables = tables_with_pools(&[POOL]);
        let router = Router::new(&source, &tables, 100, 200, REWARD_TOKEN, Address::ZERO);

        let rewards = router.get_rewards(POOL, U256::from(101)).await.unwrap();
        // 101 * 60 / 100 = 60 for the first account, the last gets 101 - 60
        assert_eq!(rewards[&USER_A][&REWARD_TOKEN], U256::from(60));
        assert_eq!(rewards[&USER_B][&REWARD_TOKEN], U256::from(41));
        assert_eq!(token_total(&rewards, REWARD_TOKEN), U256::from(101));
    }

    #[tokio::test]
    async fn cycle_between_pools_goes_to_fallback() {
        let mut source = MockLiquiditySource::new();
        source
            .expect_current_tick_liquidity_points()
            .returning(|pool, _| {
                if pool == POOL {
                    Ok(balances(&[(POOL_2, 100)]))
                } else {
                    Ok(balances(&[(POOL, 100)]))
                }
            });
        let tables = tables_with_pools(&[POOL, POOL_2]);
        let router = Router::new(&source, &tables, 100, 200, REWARD_TOKEN, Address::ZERO);

        let rewards = router.get_rewards(POOL, U256::from(1000)).await.unwrap();
        assert_eq!(rewards[&FALLBACK][&REWARD_TOKEN], U256::from(1000));
        assert_eq!(rewards.len(), 1);
    }

    #[tokio::test]
    async fn empty_pool_falls_back() {
        let mut source = MockLiquiditySource::new();
        source
            .expect_current_tick_liquidity_points()
            .returning(|_, _| Ok(Balances::default()));
        let tables = tables_with_pools(&[POOL]);
        let router = Router::new(&source, &tables, 100, 200, REWARD_TOKEN, Address::ZERO);

        let rewards = router.get_rewards(POOL, U256::from(500)).await.unwrap();
        assert_eq!(rewards[&FALLBACK][&REWARD_TOKEN], U256::from(500));
    }

    #[tokio::test]
    async fn redirected_account_is_credited_at_its_target() {
        let mut source = MockLiquiditySource::new();
        source
            .expect_current_tick_liquidity_points()
            .returning(|_, _| Ok(balances(&[(USER_A, 100)])));
        let mut tables = tables_with_pools(&[POOL]);
        tables.redirects.insert(USER_A, USER_B);
        let router = Router::new(&source, &tables, 100, 200, REWARD_TOKEN, Address::ZERO);

        let rewards = router.get_rewards(POOL, U256::from(77)).await.unwrap();
        assert_eq!(rewards[&USER_B][&REWARD_TOKEN], U256::from(77));
        assert!(!rewards.contains_key(&USER_A));
    }

    #[tokio::test]
    async fn nested_pool_expansion_conserves_totals() {
        let mut source = MockLiquiditySource::new();
        source
            .expect_current_tick_liquidity_points()
            .returning(|pool, _| {
                if pool == POOL {
                    // one third routes deeper into POOL_2
                    Ok(balances(&[(USER_A, 200), (POOL_2, 100)]))
                } else {
                    Ok(balances(&[(USER_B, 100)]))
                }
            });
        let tables = tables_with_pools(&[POOL, POOL_2]);
        let router = Router::new(&source, &tables, 100, 200, REWARD_TOKEN, Address::ZERO);

        let rewards = router.get_rewards(POOL, U256::from(900)).await.unwrap();
        assert_eq!(rewards[&USER_A][&REWARD_TOKEN], U256::from(600));
        assert_eq!(rewards[&USER_B][&REWARD_TOKEN], U256::from(300));
        assert_eq!(token_total(&rewards, REWARD_TOKEN), U256::from(900));
    }
}
