//! Distribution planning: turns indexer rows (periodic allocations,
//! disabled stakers, one-time distributions) and the protocol reward into
//! the list of records the routing engine expands.

use crate::{
    decode,
    distributor::types::{Distribution, TokenAllocation, TokenAllocations},
    queries,
};
use alloy_primitives::{Address, U256, U512};
use anyhow::{anyhow, Result};
use serde_json::{json, Value};
use stakepool_common::{
    graph::{GraphClient, PAGE_SIZE},
    ipfs::IpfsClient,
    rewards::{add_value, merge, Rewards},
};
use std::collections::HashSet;
use tracing::warn;

/// Width of one distribution slice in blocks.
/// NB! Changing the interval while allocations are still active invalidates
/// previously computed splits.
pub const BLOCKS_INTERVAL: u64 = 277;

/// Active periodic allocations overlapping the tick window, keyed by
/// beneficiary contract.
pub async fn periodic_allocations(
    pool_graph: &GraphClient,
    from_block: u64,
    to_block: u64,
) -> Result<TokenAllocations> {
    let rows = pool_graph
        .query_paginated(
            queries::PERIODIC_DISTRIBUTIONS_QUERY,
            json!({ "from_block": from_block, "to_block": to_block }),
            "periodicDistributions",
        )
        .await?;

    let mut allocations = TokenAllocations::new();
    for row in &rows {
        let started_at = decode::u64_field(row, "startedAtBlock")?;
        let ended_at = decode::u64_field(row, "endedAtBlock")?;
        if ended_at <= from_block || started_at >= to_block {
            continue;
        }
        allocations
            .entry(decode::address_field(row, "beneficiary")?)
            .or_default()
            .push(TokenAllocation {
                from_block: started_at,
                to_block: ended_at,
                reward_token: decode::address_field(row, "token")?,
                reward: decode::u256_field(row, "amount")?,
            });
    }
    Ok(allocations)
}

/// Chops every active allocation into `BLOCKS_INTERVAL`-wide distributions
/// clipped to the tick window. The final slice of an allocation's lifetime
/// absorbs the division remainder so the emitted rewards sum exactly to the
/// committed amount.
pub fn split_allocations(
    allocations: &TokenAllocations,
    from_block: u64,
    to_block: u64,
) -> Vec<Distribution> {
    let mut distributions = Vec::new();
    for (contract, contract_allocations) in allocations {
        for allocation in contract_allocations {
            let total_blocks = allocation.to_block.saturating_sub(allocation.from_block);
            if total_blocks == 0 {
                continue;
            }
            let total_reward = allocation.reward;
            let reward_per_block = total_reward / U256::from(total_blocks);
            let interval_reward = reward_per_block * U256::from(BLOCKS_INTERVAL);

            let mut start = allocation.from_block.max(from_block);
            let end = allocation.to_block.min(to_block);
            while start != end {
                if start + BLOCKS_INTERVAL > end {
                    let interval = end - start;
                    let mut reward = reward_per_block * U256::from(interval);
                    if end == allocation.to_block {
                        // collect leftovers
                        reward += total_reward - reward_per_block * U256::from(total_blocks);
                    }
                    if !reward.is_zero() {
                        distributions.push(Distribution {
                            contract: *contract,
                            from_block: start,
                            to_block: start + interval,
                            reward_token: allocation.reward_token,
                            reward,
                            uni_v3_token: Address::ZERO,
                        });
                    }
                    break;
                }

                if !interval_reward.is_zero() {
                    distributions.push(Distribution {
                        contract: *contract,
                        from_block: start,
                        to_block: start + BLOCKS_INTERVAL,
                        reward_token: allocation.reward_token,
                        reward: interval_reward,
                        uni_v3_token: Address::ZERO,
                    });
                }
                start += BLOCKS_INTERVAL;
            }
        }
    }
    distributions
}

/// Pro-rata distribution of the period reward across stakers whose rewards
/// are disabled, by staked principal. The last staker in iteration order
/// absorbs the residual so the sum is exact.
pub async fn disabled_staker_distributions(
    pool_graph: &GraphClient,
    distributor_reward: U256,
    from_block: u64,
    to_block: u64,
    reward_token: Address,
    staked_token: Address,
) -> Result<Vec<Distribution>> {
    if distributor_reward.is_zero() {
        return Ok(Vec::new());
    }

    let mut reward_per_token: Option<U256> = None;
    let mut stakers: Vec<Value> = Vec::new();
    let mut last_id = String::new();
    loop {
        let reply = pool_graph
            .query(
                queries::DISABLED_STAKER_ACCOUNTS_QUERY,
                json!({ "block_number": to_block, "last_id": last_id }),
            )
            .await?;
        if reward_per_token.is_none() {
            let row = decode::first_row(&reply, "rewardEthTokens")?;
            reward_per_token = Some(decode::u256_field(row, "rewardPerStakedEthToken")?);
        }
        let chunk = decode::rows(&reply, "stakers")?.clone();
        let short_page = chunk.len() < PAGE_SIZE;
        stakers.extend(chunk);
        if short_page {
            break;
        }
        last_id = decode::str_field(
            stakers.last().ok_or_else(|| anyhow!("empty staker page"))?,
            "id",
        )?
        .to_string();
    }
    let reward_per_token = reward_per_token.unwrap_or_default();

    let mut principals: Vec<(Address, U256)> = Vec::new();
    for staker in &stakers {
        let staker_reward_per_token = decode::u256_field(staker, "rewardPerStakedToken")?;
        let principal = decode::u256_field(staker, "principalBalance")?;
        if staker_reward_per_token >= reward_per_token || principal.is_zero() {
            continue;
        }
        principals.push((decode::address_field(staker, "id")?, principal));
    }

    Ok(pro_rata(&principals, distributor_reward)
        .into_iter()
        .map(|(staker, reward)| Distribution {
            contract: staker,
            from_block,
            to_block,
            reward_token,
            reward,
            uni_v3_token: staked_token,
        })
        .collect())
}

/// Splits `total_reward` proportionally to each entry's weight; the last
/// entry receives the residual.
pub fn pro_rata(entries: &[(Address, U256)], total_reward: U256) -> Vec<(Address, U256)> {
    let total_weight = entries
        .iter()
        .fold(U256::ZERO, |acc, (_, weight)| acc + *weight);
    if total_weight.is_zero() {
        return Vec::new();
    }

    let mut result = Vec::new();
    let mut distributed = U256::ZERO;
    let last_index = entries.len() - 1;
    for (i, (account, weight)) in entries.iter().enumerate() {
        let reward = if i == last_index {
            total_reward.saturating_sub(distributed)
        } else {
            (U512::from(total_reward) * U512::from(*weight) / U512::from(total_weight))
                .saturating_to()
        };
        if reward.is_zero() {
            continue;
        }
        result.push((*account, reward));
        distributed += reward;
    }
    result
}

/// Half of the protocol reward goes to the configured operator address; the
/// remainder is unattributable and goes to the fallback address.
pub fn protocol_rewards(
    protocol_reward: U256,
    operator: Address,
    reward_token: Address,
    fallback: Address,
) -> Rewards {
    let mut rewards = Rewards::new();
    if protocol_reward.is_zero() {
        return rewards;
    }
    if operator == Address::ZERO {
        warn!("no protocol operator address configured");
        add_value(&mut rewards, fallback, reward_token, protocol_reward);
        return rewards;
    }

    let operator_reward = protocol_reward / U256::from(2);
    let leftover = protocol_reward - operator_reward;
    if !operator_reward.is_zero() {
        add_value(&mut rewards, operator, reward_token, operator_reward);
    }
    if !leftover.is_zero() {
        add_value(&mut rewards, fallback, reward_token, leftover);
    }
    rewards
}

/// One-time distributions landed strictly inside the tick window. The
/// beneficiary list comes from the blob store; a list that fails to
/// download or does not sum to the committed amount re-routes the whole
/// amount to the fallback address.
pub async fn one_time_rewards(
    pool_graph: &GraphClient,
    ipfs: &IpfsClient,
    from_block: u64,
    to_block: u64,
    fallback: Address,
) -> Result<Rewards> {
    let rows = pool_graph
        .query_paginated(
            queries::ONE_TIME_DISTRIBUTIONS_QUERY,
            json!({ "from_block": from_block, "to_block": to_block }),
            "oneTimeDistributions",
        )
        .await?;

    let mut final_rewards = Rewards::new();
    for row in &rows {
        let distributed_at = decode::u64_field(row, "distributedAtBlock")?;
        if distributed_at <= from_block || distributed_at > to_block {
            continue;
        }
        let id = decode::str_field(row, "id")?;
        let token = decode::address_field(row, "token")?;
        let total_amount = decode::u256_field(row, "amount")?;
        let rewards_link = decode::str_field(row, "rewardsLink")?;

        let rewards = match allocated_rewards(ipfs, rewards_link, token, total_amount).await {
            Ok(rewards) => rewards,
            Err(err) => {
                warn!("failed to process one-time distribution {id}: {err}");
                let mut fallback_rewards = Rewards::new();
                add_value(&mut fallback_rewards, fallback, token, total_amount);
                fallback_rewards
            }
        };
        merge(&mut final_rewards, rewards);
    }
    Ok(final_rewards)
}

async fn allocated_rewards(
    ipfs: &IpfsClient,
    rewards_link: &str,
    token: Address,
    total_amount: U256,
) -> Result<Rewards> {
    let allocations = ipfs.fetch(rewards_link).await?;
    let allocations = allocations
        .as_object()
        .ok_or_else(|| anyhow!("beneficiary list is not an object"))?;

    let mut rewards = Rewards::new();
    let mut distributed = U256::ZERO;
    for (beneficiary, amount) in allocations {
        let beneficiary: Address = beneficiary
            .parse()
            .map_err(|_| anyhow!("invalid beneficiary address {beneficiary}"))?;
        if beneficiary == Address::ZERO {
            continue;
        }
        let amount = parse_amount(amount)?;
        add_value(&mut rewards, beneficiary, token, amount);
        distributed += amount;
    }

    if distributed != total_amount {
        return Err(anyhow!(
            "allocated {distributed} does not match committed {total_amount}"
        ));
    }
    Ok(rewards)
}

/// Amounts appear as decimal strings in the current layout, as JSON numbers
/// in older blobs, and as an origin → amount object in the legacy layering.
fn parse_amount(value: &Value) -> Result<U256> {
    match value {
        Value::String(raw) => decode::parse_u256(raw),
        Value::Number(n) => n
            .as_u64()
            .map(U256::from)
            .ok_or_else(|| anyhow!("invalid amount {n}")),
        Value::Object(origins) => {
            let mut total = U256::ZERO;
            for origin_amount in origins.values() {
                total += parse_amount(origin_amount)?;
            }
            Ok(total)
        }
        other => Err(anyhow!("invalid amount {other}")),
    }
}

/// Accounts that already claimed against the previous merkle root.
pub async fn claimed_accounts(
    pool_graph: &GraphClient,
    merkle_root: &str,
) -> Result<HashSet<Address>> {
    let rows = pool_graph
        .query_paginated(
            queries::DISTRIBUTOR_CLAIMED_ACCOUNTS_QUERY,
            json!({ "merkle_root": merkle_root }),
            "merkleDistributorClaims",
        )
        .await?;
    rows.iter()
        .map(|row| decode::address_field(row, "account"))
        .collect()
}

/// Balances of the previous claims table that were not claimed, to be
/// carried into the next tree. Accepts both the current claim shape
/// (`tokens` + `values`) and the legacy one (`reward_tokens` + per-origin
/// `values` lists).
pub fn unclaimed_rewards(
    previous_claims: &Value,
    claimed: &HashSet<Address>,
) -> Result<Rewards> {
    let claims = previous_claims
        .as_object()
        .ok_or_else(|| anyhow!("previous claims table is not an object"))?;

    let mut rewards = Rewards::new();
    for (account, claim) in claims {
        let account: Address = account
            .parse()
            .map_err(|_| anyhow!("invalid account address {account}"))?;
        if claimed.contains(&account) {
            continue;
        }

        if claim.get("reward_tokens").is_some() {
            let tokens = decode::rows(claim, "reward_tokens")?;
            let values = decode::rows(claim, "values")?;
            for (i, token) in tokens.iter().enumerate() {
                let token: Address = token
                    .as_str()
                    .and_then(|raw| raw.parse().ok())
                    .ok_or_else(|| anyhow!("invalid reward token in legacy claim"))?;
                let origin_values = values
                    .get(i)
                    .and_then(Value::as_array)
                    .ok_or_else(|| anyhow!("missing values for legacy claim"))?;
                for value in origin_values {
                    add_value(&mut rewards, account, token, parse_amount(value)?);
                }
            }
        } else {
            let tokens = decode::rows(claim, "tokens")?;
            let values = decode::rows(claim, "values")?;
            for (token, value) in tokens.iter().zip(values) {
                let token: Address = token
                    .as_str()
                    .and_then(|raw| raw.parse().ok())
                    .ok_or_else(|| anyhow!("invalid token in claim"))?;
                add_value(&mut rewards, account, token, parse_amount(value)?);
            }
        }
    }
    Ok(rewards)
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloy_primitives::address;

    const TOKEN: Address = address!("0x1010101010101010101010101010101010101010");
    const POOL: Address = address!("0x4040404040404040404040404040404040404040");
    const STAKER_A: Address = address!("0xaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaa");
    const STAKER_B: Address = address!("0xbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbb");

    fn allocation(from: u64, to: u64, reward: u64) -> TokenAllocations {
        let mut allocations = TokenAllocations::new();
        allocations.entry(POOL).or_default().push(TokenAllocation {
            from_block: from,
            to_block: to,
            reward_token: TOKEN,
            reward: U256::from(reward),
        });
        allocations
    }

    #[test]
    fn slices_are_exactly_interval_wide() {
        // allocation spans 3 intervals plus a partial slice
        let span = BLOCKS_INTERVAL * 3 + 100;
        let allocations = allocation(1000, 1000 + span, 1_000_000);
        let distributions = split_allocations(&allocations, 1000, 1000 + span);

        assert_eq!(distributions.len(), 4);
        for distribution in &distributions[..3] {
            assert_eq!(
                distribution.to_block - distribution.from_block,
                BLOCKS_INTERVAL
            );
        }
        assert_eq!(distributions[3].to_block - distributions[3].from_block, 100);
    }

    #[test]
    fn lifetime_total_is_exact() {
        let span = BLOCKS_INTERVAL * 2 + 33;
        let reward = 999_983u64; // indivisible by the span
        let allocations = allocation(5000, 5000 + span, reward);

        // walk the allocation's whole lifetime one window at a time
        let mut emitted = U256::ZERO;
        let mut cursor = 5000;
        while cursor < 5000 + span {
            let window_end = (cursor + BLOCKS_INTERVAL).min(5000 + span);
            for distribution in split_allocations(&allocations, cursor, window_end) {
                emitted += distribution.reward;
            }
            cursor = window_end;
        }
        assert_eq!(emitted, U256::from(reward));
    }

    #[test]
    fn window_clips_the_allocation() {
        let allocations = allocation(1000, 1000 + BLOCKS_INTERVAL * 10, 1_000_000);
        let distributions =
            split_allocations(&allocations, 1000 + BLOCKS_INTERVAL, 1000 + BLOCKS_INTERVAL * 2);
        assert_eq!(distributions.len(), 1);
        assert_eq!(distributions[0].from_block, 1000 + BLOCKS_INTERVAL);
        assert_eq!(distributions[0].to_block, 1000 + BLOCKS_INTERVAL * 2);
    }

    #[test]
    fn pro_rata_gives_residual_to_the_last_entry() {
        let principals = vec![
            (STAKER_A, U256::from(3)),
            (STAKER_B, U256::from(7)),
        ];
        let shares = pro_rata(&principals, U256::from(10));
        assert_eq!(shares, vec![(STAKER_A, U256::from(3)), (STAKER_B, U256::from(7))]);

        let shares = pro_rata(&principals, U256::from(11));
        assert_eq!(shares, vec![(STAKER_A, U256::from(3)), (STAKER_B, U256::from(8))]);
    }

    #[test]
    fn protocol_reward_splits_half_to_operator() {
        let operator = STAKER_A;
        let fallback = STAKER_B;
        let rewards = protocol_rewards(U256::from(11), operator, TOKEN, fallback);
        assert_eq!(rewards[&operator][&TOKEN], U256::from(5));
        assert_eq!(rewards[&fallback][&TOKEN], U256::from(6));

        let rewards = protocol_rewards(U256::from(10), Address::ZERO, TOKEN, fallback);
        assert_eq!(rewards[&fallback][&TOKEN], U256::from(10));
    }

    #[test]
    fn unclaimed_rewards_skip_claimed_accounts() {
        let claims = serde_json::json!({
            "0xaAaAaAaaAaAaAaaAaAAAAAAAAaaaAaAaAaaAaaAa": {
                "index": 0, "tokens": [format!("{TOKEN:#x}")], "values": ["100"], "proof": []
            },
            "0xBbBBBBbbBBBbbbBbbBbbbbBBbBbbbbBbBbbBBbBb": {
                "index": 1, "tokens": [format!("{TOKEN:#x}")], "values": ["50"], "proof": []
            },
        });
        let claimed = HashSet::from([STAKER_A]);
        let rewards = unclaimed_rewards(&claims, &claimed).unwrap();
        assert!(!rewards.contains_key(&STAKER_A));
        assert_eq!(rewards[&STAKER_B][&TOKEN], U256::from(50));
    }

    #[test]
    fn legacy_claim_layout_is_accepted() {
        let claims = serde_json::json!({
            "0xaAaAaAaaAaAaAaaAaAAAAAAAAaaaAaAaAaaAaaAa": {
                "index": 0,
                "reward_tokens": [format!("{TOKEN:#x}")],
                "origins": [["0x1111111111111111111111111111111111111111"]],
                "values": [["25", "17"]],
            },
        });
        let rewards = unclaimed_rewards(&claims, &HashSet::new()).unwrap();
        assert_eq!(rewards[&STAKER_A][&TOKEN], U256::from(42));
    }
}
