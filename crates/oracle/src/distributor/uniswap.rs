//! Concentrated-liquidity pools: pool discovery, position fetching, and the
//! fixed-point single-token math.
//!
//! The tick math is the reference ladder: signed-integer shift/multiply
//! constants, `MAX_UINT256 / ratio` flip for positive ticks, and a Q32
//! round-up back to Q64.96. Intermediates widen to 512 bits; no floating
//! point anywhere.

use crate::{
    decode,
    distributor::types::{Balances, UniswapPools},
    queries,
};
use alloy_primitives::{Address, U256, U512};
use anyhow::{bail, Result};
use serde_json::{json, Value};
use stakepool_common::graph::GraphClient;

pub const MIN_TICK: i32 = -887_272;
pub const MAX_TICK: i32 = 887_272;

/// Full-range position bounds used for governance-token pools routed by
/// liquidity share.
pub const FULL_RANGE_TICK_LOWER: i32 = -887_220;
pub const FULL_RANGE_TICK_UPPER: i32 = 887_220;

const MUL_CONSTANTS: [u128; 19] = [
    0xFFF9_7272_373D_4132_59A4_6990_580E_213A,
    0xFFF2_E50F_5F65_6932_EF12_357C_F3C7_FDCC,
    0xFFE5_CACA_7E10_E4E6_1C36_24EA_A094_1CD0,
    0xFFCB_9843_D60F_6159_C9DB_5883_5C92_6644,
    0xFF97_3B41_FA98_C081_472E_6896_DFB2_54C0,
    0xFF2E_A164_66C9_6A38_43EC_78B3_26B5_2861,
    0xFE5D_EE04_6A99_A2A8_11C4_61F1_969C_3053,
    0xFCBE_86C7_900A_88AE_DCFF_C83B_479A_A3A4,
    0xF987_A725_3AC4_1317_6F2B_074C_F781_5E54,
    0xF339_2B08_22B7_0005_940C_7A39_8E4B_70F3,
    0xE715_9475_A2C2_9B74_43B2_9C7F_A6E8_89D9,
    0xD097_F3BD_FD20_22B8_845A_D8F7_92AA_5825,
    0xA9F7_4646_2D87_0FDF_8A65_DC1F_90E0_61E5,
    0x70D8_69A1_56D2_A1B8_90BB_3DF6_2BAF_32F7,
    0x31BE_135F_97D0_8FD9_8123_1505_542F_CFA6,
    0x09AA_508B_5B7A_84E1_C677_DE54_F3E9_9BC9,
    0x005D_6AF8_DEDB_8119_6699_C329_225E_E604,
    0x0000_2216_E584_F5FA_1EA9_2604_1BED_FE98,
    0x0000_0000_048A_1703_91F7_DC42_444E_8FA2,
];

const FIRST_MUL_CONSTANT: u128 = 0xFFFC_B933_BD6F_AD37_AA2D_162D_1A59_4001;

fn mul_shift(val: U256, mul_by: u128) -> U256 {
    let wide = U512::from(val) * U512::from(mul_by);
    let shifted: U512 = wide >> 128;
    shifted.saturating_to()
}

/// `sqrt(1.0001)^tick` as a Q64.96 value.
pub fn get_sqrt_ratio_at_tick(tick: i32) -> Result<U256> {
    if !(MIN_TICK..=MAX_TICK).contains(&tick) {
        bail!("tick {tick} out of range");
    }
    let abs_tick = tick.unsigned_abs();

    let mut ratio = if abs_tick & 0x1 != 0 {
        U256::from(FIRST_MUL_CONSTANT)
    } else {
        U256::from(1) << 128
    };
    for (bit, constant) in MUL_CONSTANTS.iter().enumerate() {
        if abs_tick & (0x2 << bit) != 0 {
            ratio = mul_shift(ratio, *constant);
        }
    }

    if tick > 0 {
        ratio = U256::MAX / ratio;
    }

    // back to Q96, rounding up
    let q32 = U256::from(1u64) << 32;
    let rem: U256 = ratio % q32;
    if rem.is_zero() {
        Ok(ratio >> 32)
    } else {
        Ok((ratio >> 32) + U256::from(1))
    }
}

pub fn get_amount0_delta(sqrt_ratio_a: U256, sqrt_ratio_b: U256, liquidity: U256) -> U256 {
    let (a, b) = if sqrt_ratio_a <= sqrt_ratio_b {
        (sqrt_ratio_a, sqrt_ratio_b)
    } else {
        (sqrt_ratio_b, sqrt_ratio_a)
    };
    if a.is_zero() {
        return U256::ZERO;
    }
    let numerator1 = U512::from(liquidity) << 96;
    let numerator2 = U512::from(b - a);
    let result: U512 = numerator1 * numerator2 / U512::from(b) / U512::from(a);
    result.saturating_to()
}

pub fn get_amount1_delta(sqrt_ratio_a: U256, sqrt_ratio_b: U256, liquidity: U256) -> U256 {
    let (a, b) = if sqrt_ratio_a <= sqrt_ratio_b {
        (sqrt_ratio_a, sqrt_ratio_b)
    } else {
        (sqrt_ratio_b, sqrt_ratio_a)
    };
    let result: U512 = (U512::from(liquidity) * U512::from(b - a)) >> 96;
    result.saturating_to()
}

/// Token0 amount of a position given the pool's current tick and price.
pub fn get_amount0(
    tick_current: i32,
    sqrt_ratio_x96: U256,
    tick_lower: i32,
    tick_upper: i32,
    liquidity: U256,
) -> Result<U256> {
    if tick_current < tick_lower {
        Ok(get_amount0_delta(
            get_sqrt_ratio_at_tick(tick_lower)?,
            get_sqrt_ratio_at_tick(tick_upper)?,
            liquidity,
        ))
    } else if tick_current < tick_upper {
        Ok(get_amount0_delta(
            sqrt_ratio_x96,
            get_sqrt_ratio_at_tick(tick_upper)?,
            liquidity,
        ))
    } else {
        Ok(U256::ZERO)
    }
}

/// Token1 amount of a position given the pool's current tick and price.
pub fn get_amount1(
    tick_current: i32,
    sqrt_ratio_x96: U256,
    tick_lower: i32,
    tick_upper: i32,
    liquidity: U256,
) -> Result<U256> {
    if tick_current < tick_lower {
        Ok(U256::ZERO)
    } else if tick_current < tick_upper {
        Ok(get_amount1_delta(
            get_sqrt_ratio_at_tick(tick_lower)?,
            sqrt_ratio_x96,
            liquidity,
        ))
    } else {
        Ok(get_amount1_delta(
            get_sqrt_ratio_at_tick(tick_lower)?,
            get_sqrt_ratio_at_tick(tick_upper)?,
            liquidity,
        ))
    }
}

#[derive(Clone, Debug)]
struct PoolState {
    tick: i32,
    sqrt_price: Option<U256>,
    token0: Address,
    token1: Address,
}

/// Position reads against the AMM indexer.
#[derive(Clone, Debug)]
pub struct UniswapClient {
    graph: GraphClient,
    staked_token: Address,
    reward_token: Address,
    governance_token: Address,
}

impl UniswapClient {
    pub fn new(
        graph: GraphClient,
        staked_token: Address,
        reward_token: Address,
        governance_token: Address,
    ) -> Self {
        Self {
            graph,
            staked_token,
            reward_token,
            governance_token,
        }
    }

    /// All pools at `block_number` holding one of the three named tokens,
    /// classified by which token they hold.
    pub async fn pools(&self, block_number: u64) -> Result<UniswapPools> {
        let rows = self
            .graph
            .query_paginated(
                queries::UNISWAP_V3_POOLS_QUERY,
                json!({ "block_number": block_number }),
                "pools",
            )
            .await?;

        let mut pools = UniswapPools::default();
        for row in &rows {
            let pool = decode::address_field(row, "id")?;
            let token0 = decode::address_field(row, "token0")?;
            let token1 = decode::address_field(row, "token1")?;
            for token in [token0, token1] {
                if token == self.staked_token {
                    pools.staked_token_pools.insert(pool);
                } else if token == self.reward_token {
                    pools.reward_token_pools.insert(pool);
                } else if token == self.governance_token {
                    pools.governance_token_pools.insert(pool);
                }
            }
        }
        Ok(pools)
    }

    async fn pool_state(&self, pool: Address, block_number: u64) -> Result<Option<PoolState>> {
        let reply = self
            .graph
            .query(
                queries::UNISWAP_V3_POOL_QUERY,
                json!({
                    "pool_address": format!("{pool:#x}"),
                    "block_number": block_number,
                }),
            )
            .await?;
        let Some(row) = decode::rows(&reply, "pools")?.first() else {
            return Ok(None);
        };
        let Ok(tick) = decode::i64_field(row, "tick") else {
            return Ok(None);
        };
        let sqrt_price = decode::u256_field(row, "sqrtPrice").ok();
        Ok(Some(PoolState {
            tick: tick as i32,
            sqrt_price,
            token0: decode::address_field(row, "token0")?,
            token1: decode::address_field(row, "token1")?,
        }))
    }

    async fn positions(&self, query: &str, variables: Value) -> Result<Vec<Value>> {
        Ok(self.graph.query_paginated(query, variables, "positions").await?)
    }

    /// Liquidity points of positions straddling the pool's current tick.
    pub async fn current_tick_liquidity_points(
        &self,
        pool: Address,
        block_number: u64,
    ) -> Result<Balances> {
        let Some(state) = self.pool_state(pool, block_number).await? else {
            return Ok(Balances::default());
        };
        let positions = self
            .positions(
                queries::UNISWAP_V3_CURRENT_TICK_POSITIONS_QUERY,
                json!({
                    "pool_address": format!("{pool:#x}"),
                    "tick_current": state.tick,
                    "block_number": block_number,
                }),
            )
            .await?;
        sum_liquidity(&positions)
    }

    /// Liquidity points of positions spanning exactly `[tick_lower, tick_upper]`.
    pub async fn range_liquidity_points(
        &self,
        pool: Address,
        tick_lower: i32,
        tick_upper: i32,
        block_number: u64,
    ) -> Result<Balances> {
        let positions = self
            .positions(
                queries::UNISWAP_V3_RANGE_POSITIONS_QUERY,
                json!({
                    "pool_address": format!("{pool:#x}"),
                    "tick_lower": tick_lower,
                    "tick_upper": tick_upper,
                    "block_number": block_number,
                }),
            )
            .await?;
        sum_liquidity(&positions)
    }

    /// Single-token amounts of every position in the pair, computed from the
    /// pool's current price.
    pub async fn single_token_balances(
        &self,
        pool: Address,
        token: Address,
        block_number: u64,
    ) -> Result<Balances> {
        let Some(state) = self.pool_state(pool, block_number).await? else {
            return Ok(Balances::default());
        };
        let Some(sqrt_price) = state.sqrt_price else {
            return Ok(Balances::default());
        };

        let positions = self
            .positions(
                queries::UNISWAP_V3_POSITIONS_QUERY,
                json!({
                    "pool_address": format!("{pool:#x}"),
                    "block_number": block_number,
                }),
            )
            .await?;

        let mut balances = Balances::default();
        for position in &positions {
            let owner = decode::address_field(position, "owner")?;
            if owner == Address::ZERO {
                continue;
            }
            let liquidity = decode::u256_field(position, "liquidity")?;
            if liquidity.is_zero() {
                continue;
            }
            let (Ok(tick_lower), Ok(tick_upper)) = (
                decode::i64_field(position, "tickLower"),
                decode::i64_field(position, "tickUpper"),
            ) else {
                continue;
            };

            let amount = if state.token0 == token {
                get_amount0(
                    state.tick,
                    sqrt_price,
                    tick_lower as i32,
                    tick_upper as i32,
                    liquidity,
                )?
            } else if state.token1 == token {
                get_amount1(
                    state.tick,
                    sqrt_price,
                    tick_lower as i32,
                    tick_upper as i32,
                    liquidity,
                )?
            } else {
                continue;
            };

            *balances.balances.entry(owner).or_insert(U256::ZERO) += amount;
            balances.total_supply += amount;
        }
        Ok(balances)
    }
}

fn sum_liquidity(positions: &[Value]) -> Result<Balances> {
    let mut balances = Balances::default();
    for position in positions {
        let owner = decode::address_field(position, "owner")?;
        if owner == Address::ZERO {
            continue;
        }
        let liquidity = decode::u256_field(position, "liquidity")?;
        if liquidity.is_zero() {
            continue;
        }
        *balances.balances.entry(owner).or_insert(U256::ZERO) += liquidity;
        balances.total_supply += liquidity;
    }
    Ok(balances)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sqrt_ratio_at_zero_tick_is_q96() {
        assert_eq!(get_sqrt_ratio_at_tick(0).unwrap(), U256::from(1u8) << 96);
    }

    #[test]
    fn sqrt_ratio_reference_values() {
        // reference values from the canonical tick math implementation
        assert_eq!(
            get_sqrt_ratio_at_tick(MIN_TICK).unwrap(),
            U256::from(4_295_128_739u64)
        );
        assert_eq!(
            get_sqrt_ratio_at_tick(MAX_TICK).unwrap(),
            "1461446703485210103287273052203988822378723970342"
                .parse::<U256>()
                .unwrap()
        );
        assert_eq!(
            get_sqrt_ratio_at_tick(1).unwrap(),
            "79232123823359799118286999568".parse::<U256>().unwrap()
        );
        assert_eq!(
            get_sqrt_ratio_at_tick(-1).unwrap(),
            "79224201403219477170569942574".parse::<U256>().unwrap()
        );
    }

    #[test]
    fn out_of_range_tick_is_rejected() {
        assert!(get_sqrt_ratio_at_tick(MIN_TICK - 1).is_err());
        assert!(get_sqrt_ratio_at_tick(MAX_TICK + 1).is_err());
    }

    #[test]
    fn amount_deltas_reorder_their_bounds() {
        let a = get_sqrt_ratio_at_tick(-100).unwrap();
        let b = get_sqrt_ratio_at_tick(100).unwrap();
        let liquidity = U256::from(1_000_000u64);
        assert_eq!(
            get_amount0_delta(a, b, liquidity),
            get_amount0_delta(b, a, liquidity)
        );
        assert_eq!(
            get_amount1_delta(a, b, liquidity),
            get_amount1_delta(b, a, liquidity)
        );
    }

    #[test]
    fn position_sides_follow_the_current_tick() {
        let sqrt_price = get_sqrt_ratio_at_tick(0).unwrap();
        let liquidity = U256::from(1_000_000u64);

        // current tick above the range: all token1
        assert_eq!(
            get_amount0(200, sqrt_price, -100, 100, liquidity).unwrap(),
            U256::ZERO
        );
        assert!(!get_amount1(200, sqrt_price, -100, 100, liquidity)
            .unwrap()
            .is_zero());

        // current tick below the range: all token0
        assert_eq!(
            get_amount1(-200, sqrt_price, -100, 100, liquidity).unwrap(),
            U256::ZERO
        );
        assert!(!get_amount0(-200, sqrt_price, -100, 100, liquidity)
            .unwrap()
            .is_zero());

        // inside the range: both sides
        assert!(!get_amount0(0, sqrt_price, -100, 100, liquidity)
            .unwrap()
            .is_zero());
        assert!(!get_amount1(0, sqrt_price, -100, 100, liquidity)
            .unwrap()
            .is_zero());
    }
}
