//! Wei arithmetic helpers. All amounts are exact `U256` integers.

use alloy_primitives::U256;

const WEI_PER_ETHER: u128 = 1_000_000_000_000_000_000;
const WEI_PER_GWEI: u64 = 1_000_000_000;

pub fn ether() -> U256 {
    U256::from(WEI_PER_ETHER)
}

/// The beacon-chain validator deposit, 32 ether in wei.
pub fn validator_deposit() -> U256 {
    U256::from(32u8) * ether()
}

pub fn gwei_to_wei(gwei: u64) -> U256 {
    U256::from(gwei) * U256::from(WEI_PER_GWEI)
}

/// Renders a wei amount in ether units for logging, trimming trailing
/// zeroes from the fractional part.
pub fn format_ether(value: U256, symbol: &str) -> String {
    let whole = value / ether();
    let frac = value % ether();
    if frac.is_zero() {
        return format!("{whole} {symbol}");
    }
    let frac = format!("{frac:0>18}");
    format!("{whole}.{} {symbol}", frac.trim_end_matches('0'))
}
