use alloy_primitives::{Address, U256};
use std::collections::{BTreeMap, BTreeSet};

/// A time-bounded commitment to pay `reward` of `reward_token` to one
/// beneficiary contract.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TokenAllocation {
    pub from_block: u64,
    pub to_block: u64,
    pub reward_token: Address,
    pub reward: U256,
}

/// Active allocations keyed by beneficiary contract, in address order.
pub type TokenAllocations = BTreeMap<Address, Vec<TokenAllocation>>;

/// One concrete slice of allocation handed to the routing engine.
///
/// `uni_v3_token` is the zero address for liquidity-share routing, or one of
/// the three named tokens for single-token-balance routing inside a
/// concentrated-liquidity pool.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Distribution {
    pub contract: Address,
    pub from_block: u64,
    pub to_block: u64,
    pub reward_token: Address,
    pub reward: U256,
    pub uni_v3_token: Address,
}

/// Holder balances (or liquidity points) of one routable contract.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Balances {
    pub total_supply: U256,
    pub balances: BTreeMap<Address, U256>,
}

/// AMM pools holding the three named tokens at the anchor block.
#[derive(Clone, Debug, Default)]
pub struct UniswapPools {
    pub staked_token_pools: BTreeSet<Address>,
    pub reward_token_pools: BTreeSet<Address>,
    pub governance_token_pools: BTreeSet<Address>,
}

impl UniswapPools {
    pub fn contains(&self, address: &Address) -> bool {
        self.staked_token_pools.contains(address)
            || self.reward_token_pools.contains(address)
            || self.governance_token_pools.contains(address)
    }
}
