//! ERC-20 distributor tokens: the routable token set, the redirect table,
//! and time-weighted holder points.

use crate::{decode, distributor::types::Balances, queries};
use alloy_primitives::{Address, U256};
use anyhow::Result;
use serde_json::json;
use stakepool_common::graph::GraphClient;
use std::collections::{BTreeSet, HashMap};

pub async fn distributor_tokens(
    pool_graph: &GraphClient,
    block_number: u64,
) -> Result<BTreeSet<Address>> {
    let rows = pool_graph
        .query_paginated(
            queries::DISTRIBUTOR_TOKENS_QUERY,
            json!({ "block_number": block_number }),
            "distributorTokens",
        )
        .await?;
    rows.iter()
        .map(|row| decode::address_field(row, "id"))
        .collect()
}

/// Reward redirects registered on the distributor: source address → target.
pub async fn distributor_redirects(
    pool_graph: &GraphClient,
    block_number: u64,
) -> Result<HashMap<Address, Address>> {
    let rows = pool_graph
        .query_paginated(
            queries::DISTRIBUTOR_REDIRECTS_QUERY,
            json!({ "block_number": block_number }),
            "distributorRedirects",
        )
        .await?;
    rows.iter()
        .map(|row| {
            let from = decode::address_field(row, "id")?;
            let token = decode::field(row, "token")?;
            let to = decode::address_field(token, "id")?;
            Ok((from, to))
        })
        .collect()
}

/// Time-weighted holder points of a distributor token over the tick window:
/// `prev_points + balance × (to_block − max(updated_at, from_block))`, with
/// the carried points dropped when the snapshot predates the window.
pub async fn token_holder_points(
    pool_graph: &GraphClient,
    token: Address,
    from_block: u64,
    to_block: u64,
) -> Result<Balances> {
    let rows = pool_graph
        .query_paginated(
            queries::DISTRIBUTOR_TOKEN_HOLDERS_QUERY,
            json!({
                "token_address": format!("{token:#x}"),
                "block_number": to_block,
            }),
            "distributorTokenHolders",
        )
        .await?;

    let mut balances = Balances::default();
    for row in &rows {
        let account = decode::address_field(row, "account")?;
        if account == Address::ZERO {
            continue;
        }
        let principal = decode::u256_field(row, "amount")?;
        let mut prev_points = decode::u256_field(row, "distributorPoints")?;
        let mut updated_at_block = decode::u64_field(row, "updatedAtBlock")?;
        if from_block > updated_at_block {
            updated_at_block = from_block;
            prev_points = U256::ZERO;
        }

        let held_blocks = to_block.saturating_sub(updated_at_block);
        let points = prev_points + principal * U256::from(held_blocks);
        if points.is_zero() {
            continue;
        }
        *balances.balances.entry(account).or_insert(U256::ZERO) += points;
        balances.total_supply += points;
    }
    Ok(balances)
}
