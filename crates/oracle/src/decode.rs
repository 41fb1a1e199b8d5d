//! Helpers for pulling typed values out of indexer JSON replies. Subgraphs
//! encode integers as strings and addresses as lowercase hex.

use alloy_primitives::{Address, B256, U256};
use anyhow::{anyhow, Context, Result};
use serde_json::Value;

pub fn field<'a>(value: &'a Value, name: &str) -> Result<&'a Value> {
    value
        .get(name)
        .ok_or_else(|| anyhow!("missing field `{name}` in indexer reply"))
}

pub fn str_field<'a>(value: &'a Value, name: &str) -> Result<&'a str> {
    field(value, name)?
        .as_str()
        .ok_or_else(|| anyhow!("field `{name}` is not a string"))
}

pub fn u64_field(value: &Value, name: &str) -> Result<u64> {
    let raw = field(value, name)?;
    if let Some(n) = raw.as_u64() {
        return Ok(n);
    }
    raw.as_str()
        .and_then(|s| s.parse().ok())
        .with_context(|| format!("field `{name}` is not an integer: {raw}"))
}

pub fn i64_field(value: &Value, name: &str) -> Result<i64> {
    let raw = field(value, name)?;
    if let Some(n) = raw.as_i64() {
        return Ok(n);
    }
    raw.as_str()
        .and_then(|s| s.parse().ok())
        .with_context(|| format!("field `{name}` is not an integer: {raw}"))
}

pub fn u256_field(value: &Value, name: &str) -> Result<U256> {
    let raw = str_field(value, name)?;
    parse_u256(raw).with_context(|| format!("field `{name}` is not an amount: {raw}"))
}

pub fn address_field(value: &Value, name: &str) -> Result<Address> {
    let raw = str_field(value, name)?;
    raw.parse()
        .with_context(|| format!("field `{name}` is not an address: {raw}"))
}

pub fn b256_field(value: &Value, name: &str) -> Result<B256> {
    let raw = str_field(value, name)?;
    raw.parse()
        .with_context(|| format!("field `{name}` is not a 32-byte value: {raw}"))
}

/// Decimal by default, hex with a `0x` prefix.
pub fn parse_u256(raw: &str) -> Result<U256> {
    raw.parse()
        .map_err(|err| anyhow!("invalid integer `{raw}`: {err}"))
}

pub fn rows<'a>(value: &'a Value, name: &str) -> Result<&'a Vec<Value>> {
    field(value, name)?
        .as_array()
        .ok_or_else(|| anyhow!("field `{name}` is not a list"))
}

pub fn first_row<'a>(value: &'a Value, name: &str) -> Result<&'a Value> {
    rows(value, name)?
        .first()
        .ok_or_else(|| anyhow!("empty `{name}` in indexer reply"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn decodes_string_integers() {
        let row = json!({ "amount": "340282366920938463463374607431768211456" });
        assert_eq!(
            u256_field(&row, "amount").unwrap(),
            U256::from(1u8) << 128
        );
    }

    #[test]
    fn missing_fields_are_reported_by_name() {
        let row = json!({});
        let err = u64_field(&row, "updatedAtBlock").unwrap_err();
        assert!(err.to_string().contains("updatedAtBlock"));
    }
}
