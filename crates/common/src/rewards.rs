//! The canonical reward map: beneficiary address → reward token → amount.
//!
//! `BTreeMap` keys give the ascending-address iteration order that the
//! routing engine and the Merkle builder both rely on. Amounts stay exact
//! `U256` integers in memory and cross the blob boundary as decimal strings.

use alloy_primitives::{Address, U256};
use std::collections::BTreeMap;

pub type Rewards = BTreeMap<Address, BTreeMap<Address, U256>>;

/// Credits `amount` of `reward_token` to `to`, adding onto any existing
/// entry.
pub fn add_value(rewards: &mut Rewards, to: Address, reward_token: Address, amount: U256) {
    let entry = rewards
        .entry(to)
        .or_default()
        .entry(reward_token)
        .or_insert(U256::ZERO);
    *entry += amount;
}

/// Merges `other` into `into`, summing amounts per (account, token).
pub fn merge(into: &mut Rewards, other: Rewards) {
    for (account, tokens) in other {
        for (token, amount) in tokens {
            add_value(into, account, token, amount);
        }
    }
}

/// Total amount of `token` across all accounts.
pub fn token_total(rewards: &Rewards, token: Address) -> U256 {
    rewards
        .values()
        .filter_map(|tokens| tokens.get(&token))
        .fold(U256::ZERO, |acc, amount| acc + *amount)
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloy_primitives::address;

    const TOKEN: Address = address!("0x1111111111111111111111111111111111111111");

    #[test]
    fn add_value_accumulates() {
        let account = address!("0x2222222222222222222222222222222222222222");
        let mut rewards = Rewards::new();
        add_value(&mut rewards, account, TOKEN, U256::from(40));
        add_value(&mut rewards, account, TOKEN, U256::from(2));
        assert_eq!(rewards[&account][&TOKEN], U256::from(42));
    }

    #[test]
    fn merge_preserves_totals() {
        let a = address!("0x2222222222222222222222222222222222222222");
        let b = address!("0x3333333333333333333333333333333333333333");

        let mut left = Rewards::new();
        add_value(&mut left, a, TOKEN, U256::from(10));
        let mut right = Rewards::new();
        add_value(&mut right, a, TOKEN, U256::from(5));
        add_value(&mut right, b, TOKEN, U256::from(7));

        merge(&mut left, right);
        assert_eq!(left[&a][&TOKEN], U256::from(15));
        assert_eq!(left[&b][&TOKEN], U256::from(7));
        assert_eq!(token_total(&left, TOKEN), U256::from(22));
    }

    #[test]
    fn iteration_is_address_ascending() {
        let high = address!("0xffffffffffffffffffffffffffffffffffffffff");
        let low = address!("0x0000000000000000000000000000000000000001");
        let mut rewards = Rewards::new();
        add_value(&mut rewards, high, TOKEN, U256::from(1));
        add_value(&mut rewards, low, TOKEN, U256::from(1));
        let keys: Vec<_> = rewards.keys().copied().collect();
        assert_eq!(keys, vec![low, high]);
    }
}
