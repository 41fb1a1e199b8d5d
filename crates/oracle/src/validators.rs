//! Validator registration vote: selects the next deposit-data entries under
//! the weighted operator rotation and publishes them with the registry
//! deposit root.

use crate::{decode, eth1::ValidatorVotingParameters, publisher::VotePublisher, queries};
use alloy_primitives::{keccak256, Address, B256, U256, U512};
use anyhow::{anyhow, Result};
use serde_json::{json, Value};
use stakepool_common::{
    graph::GraphClient,
    ipfs::IpfsClient,
    vote::{self, DepositData, ValidatorsVote, VALIDATOR_VOTE_FILENAME},
    wei,
};
use std::{
    collections::HashSet,
    sync::Arc,
};
use tracing::{info, warn};

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Operator {
    pub id: Address,
    pub deposit_data_merkle_proofs: Option<String>,
    pub deposit_data_index: u64,
}

pub struct ValidatorsController {
    pool_graph: GraphClient,
    chain_graph: GraphClient,
    ipfs: IpfsClient,
    publisher: Arc<VotePublisher>,
    batch_size: u64,
    weights: (usize, usize, usize),
    /// Wad-scaled exchange rate applied to the pool balance on
    /// governance-chain deployments; `None` means rate 1.
    pool_balance_rate: Option<U256>,
    /// Suppresses re-voting the exact same registration set.
    last_vote: Option<(B256, Vec<DepositData>)>,
}

impl ValidatorsController {
    pub fn new(
        pool_graph: GraphClient,
        chain_graph: GraphClient,
        ipfs: IpfsClient,
        publisher: Arc<VotePublisher>,
        batch_size: u64,
        weights: (usize, usize, usize),
        pool_balance_rate: Option<U256>,
    ) -> Self {
        Self {
            pool_graph,
            chain_graph,
            ipfs,
            publisher,
            batch_size,
            weights,
            pool_balance_rate,
            last_vote: None,
        }
    }

    pub async fn process(
        &mut self,
        params: &ValidatorVotingParameters,
        block_number: u64,
    ) -> Result<()> {
        let mut pool_balance = params.pool_balance;
        if let Some(rate) = self.pool_balance_rate {
            pool_balance = (U512::from(pool_balance) * U512::from(rate)
                / U512::from(wei::ether()))
            .saturating_to();
        }

        let affordable = pool_balance / wei::validator_deposit();
        let validators_count = self.batch_size.min(u64::try_from(affordable).unwrap_or(u64::MAX));
        if validators_count == 0 {
            // not enough balance to register the next validator
            return Ok(());
        }

        let deposit_data = self.select_validators(block_number, validators_count).await?;
        if deposit_data.is_empty() {
            warn!("run out of validator keys");
            return Ok(());
        }

        let validators_deposit_root = self.validators_deposit_root(block_number).await?;
        if self.last_vote == Some((validators_deposit_root, deposit_data.clone())) {
            // already voted for these registrations
            return Ok(());
        }

        for entry in &deposit_data {
            info!(
                "voting for the next validator: operator={}, public key={}",
                entry.operator, entry.public_key
            );
        }

        let encoded = vote::encode_validators_vote(
            params.validators_nonce,
            &deposit_data,
            validators_deposit_root,
        )?;
        let vote_deposit_data = deposit_data.clone();
        self.publisher
            .publish(VALIDATOR_VOTE_FILENAME, &encoded, |signature| ValidatorsVote {
                nonce: params.validators_nonce,
                validators_deposit_root: format!("{validators_deposit_root}"),
                deposit_data: vote_deposit_data,
                signature,
            })
            .await?;
        info!("submitted validators registration vote");

        self.last_vote = Some((validators_deposit_root, deposit_data));
        Ok(())
    }

    async fn select_validators(
        &self,
        block_number: u64,
        validators_count: u64,
    ) -> Result<Vec<DepositData>> {
        let operators = self.operators(block_number).await?;
        let weighted = weighted_operators(&operators, self.weights);
        let mut last_operators = self.last_operators(block_number, weighted.len()).await?;

        let mut deposit_data: Vec<DepositData> = Vec::new();
        let mut used_pubkeys: HashSet<String> = HashSet::new();
        let mut discarded: HashSet<Address> = HashSet::new();

        while (deposit_data.len() as u64) < validators_count && discarded.len() < operators.len() {
            let Some(operator) = select_operator(&weighted, &last_operators, &discarded) else {
                break;
            };
            match self
                .process_operator(&operator, &used_pubkeys, block_number)
                .await?
            {
                Some(entry) => {
                    used_pubkeys.insert(entry.public_key.clone());
                    last_operators.push(operator.id);
                    deposit_data.push(entry);
                }
                None => {
                    discarded.insert(operator.id);
                }
            }
        }

        Ok(deposit_data)
    }

    /// Walks the operator's deposit-data list from its on-chain cursor until
    /// a key that is unused this tick and still unregistered on-chain.
    async fn process_operator(
        &self,
        operator: &Operator,
        used_pubkeys: &HashSet<String>,
        block_number: u64,
    ) -> Result<Option<DepositData>> {
        let Some(merkle_proofs) = &operator.deposit_data_merkle_proofs else {
            return Ok(None);
        };

        let deposit_datum = self.ipfs.fetch(merkle_proofs).await?;
        let entries = deposit_datum
            .as_array()
            .ok_or_else(|| anyhow!("operator deposit data is not a list"))?;
        if entries.is_empty() {
            return Ok(None);
        }

        let max_index = entries.len() as u64 - 1;
        let mut index = operator.deposit_data_index;
        if index > max_index {
            return Ok(None);
        }

        loop {
            let entry = &entries[index as usize];
            let public_key = decode::str_field(entry, "public_key")?.to_string();
            let can_register = !used_pubkeys.contains(&public_key)
                && self.can_register_validator(block_number, &public_key).await?;
            if can_register {
                return Ok(Some(decode_deposit_data(operator.id, entry)?));
            }
            // a key registered under a previous merkle root can still be
            // listed at the cursor, skip forward
            if index >= max_index {
                return Ok(None);
            }
            index += 1;
        }
    }

    async fn operators(&self, block_number: u64) -> Result<Vec<Operator>> {
        let reply = self
            .pool_graph
            .query(queries::OPERATORS_QUERY, json!({ "block_number": block_number }))
            .await?;
        decode::rows(&reply, "operators")?
            .iter()
            .map(|row| {
                Ok(Operator {
                    id: decode::address_field(row, "id")?,
                    deposit_data_merkle_proofs: decode::str_field(row, "depositDataMerkleProofs")
                        .ok()
                        .filter(|proofs| !proofs.is_empty())
                        .map(str::to_string),
                    deposit_data_index: decode::u64_field(row, "depositDataIndex")?,
                })
            })
            .collect()
    }

    /// Operator ids of the most recently registered validators, newest
    /// first: the rotation tail.
    async fn last_operators(&self, block_number: u64, count: usize) -> Result<Vec<Address>> {
        let reply = self
            .pool_graph
            .query(
                queries::LAST_VALIDATORS_QUERY,
                json!({ "block_number": block_number, "count": count }),
            )
            .await?;
        decode::rows(&reply, "validators")?
            .iter()
            .map(|row| decode::address_field(decode::field(row, "operator")?, "id"))
            .collect()
    }

    async fn can_register_validator(&self, block_number: u64, public_key: &str) -> Result<bool> {
        let reply = self
            .chain_graph
            .query(
                queries::VALIDATOR_REGISTRATIONS_QUERY,
                json!({ "block_number": block_number, "public_key": public_key }),
            )
            .await?;
        Ok(decode::rows(&reply, "validatorRegistrations")?.is_empty())
    }

    /// Deposit root committed by the registry at `block_number`, derived
    /// from the latest registration index.
    async fn validators_deposit_root(&self, block_number: u64) -> Result<B256> {
        let reply = self
            .chain_graph
            .query(
                queries::VALIDATOR_REGISTRATIONS_LATEST_INDEX_QUERY,
                json!({ "block_number": block_number }),
            )
            .await?;
        let latest_index = decode::rows(&reply, "validatorRegistrations")?
            .first()
            .map(|row| Ok::<_, anyhow::Error>(decode::str_field(row, "index")?.to_string()))
            .transpose()?;
        registry_deposit_root(latest_index.as_deref())
    }
}

/// `keccak256(little_endian_u64(registered_count))` where the count is the
/// latest index plus one, or one on an empty registry. The index itself is
/// stored as the hex of its little-endian encoding.
pub fn registry_deposit_root(latest_index: Option<&str>) -> Result<B256> {
    let count: u64 = match latest_index {
        None => 1,
        Some(raw) => {
            let bytes = hex::decode(raw.trim_start_matches("0x"))
                .map_err(|_| anyhow!("invalid registration index {raw}"))?;
            if bytes.len() > 8 {
                return Err(anyhow!("registration index too wide: {raw}"));
            }
            let mut buf = [0u8; 8];
            buf[..bytes.len()].copy_from_slice(&bytes);
            u64::from_le_bytes(buf) + 1
        }
    };
    Ok(keccak256(count.to_le_bytes()))
}

fn decode_deposit_data(operator: Address, entry: &Value) -> Result<DepositData> {
    let proof = entry
        .get("proof")
        .and_then(Value::as_array)
        .map(|rows| {
            rows.iter()
                .filter_map(Value::as_str)
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default();
    Ok(DepositData {
        operator: operator.to_checksum(None),
        public_key: decode::str_field(entry, "public_key")?.to_string(),
        withdrawal_credentials: decode::str_field(entry, "withdrawal_credentials")?.to_string(),
        deposit_data_root: decode::str_field(entry, "deposit_data_root")?.to_string(),
        signature: decode::str_field(entry, "signature")?.to_string(),
        proof,
    })
}

/// The rotation bag: the first operator weighted `w1`, the second `w2`, the
/// tail repeated `w3` times.
pub fn weighted_operators(operators: &[Operator], weights: (usize, usize, usize)) -> Vec<Operator> {
    let (w1, w2, w3) = weights;
    match operators {
        [] | [_] => operators.to_vec(),
        [first, second] => {
            let mut bag = vec![first.clone(); w1];
            bag.extend(vec![second.clone(); w2]);
            bag
        }
        [first, second, rest @ ..] => {
            let mut bag = vec![first.clone(); w1];
            bag.extend(vec![second.clone(); w2]);
            for _ in 0..w3 {
                bag.extend_from_slice(rest);
            }
            bag
        }
    }
}

/// Removes one bag occurrence per recently-used operator id, then picks the
/// first remaining candidate that has not been discarded this tick.
pub fn select_operator(
    weighted: &[Operator],
    last_operator_ids: &[Address],
    discarded: &HashSet<Address>,
) -> Option<Operator> {
    let mut remaining: Vec<&Operator> = weighted.iter().collect();
    for id in last_operator_ids {
        if let Some(position) = remaining.iter().position(|op| op.id == *id) {
            remaining.remove(position);
        }
    }
    remaining
        .into_iter()
        .chain(weighted.iter())
        .find(|op| !discarded.contains(&op.id))
        .cloned()
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloy_primitives::address;

    fn operator(id: Address) -> Operator {
        Operator {
            id,
            deposit_data_merkle_proofs: Some("/ipfs/QmDepositData".to_string()),
            deposit_data_index: 0,
        }
    }

    const OP_A: Address = address!("0xaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaa");
    const OP_B: Address = address!("0xbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbb");
    const OP_C: Address = address!("0xcccccccccccccccccccccccccccccccccccccccc");

    #[test]
    fn bag_weights_default_to_three_two_one() {
        let operators = vec![operator(OP_A), operator(OP_B), operator(OP_C)];
        let bag = weighted_operators(&operators, (3, 2, 1));
        let ids: Vec<Address> = bag.iter().map(|op| op.id).collect();
        assert_eq!(ids, vec![OP_A, OP_A, OP_A, OP_B, OP_B, OP_C]);
    }

    #[test]
    fn two_operators_skip_the_tail_weight() {
        let operators = vec![operator(OP_A), operator(OP_B)];
        let bag = weighted_operators(&operators, (3, 2, 1));
        assert_eq!(bag.len(), 5);
    }

    #[test]
    fn recently_used_operators_rotate_to_the_back() {
        let operators = vec![operator(OP_A), operator(OP_B), operator(OP_C)];
        let bag = weighted_operators(&operators, (3, 2, 1));

        // A was used three times recently, so B is next
        let picked = select_operator(&bag, &[OP_A, OP_A, OP_A], &HashSet::new()).unwrap();
        assert_eq!(picked.id, OP_B);

        // everything was just used: fall back to bag order
        let all_used = vec![OP_A, OP_A, OP_A, OP_B, OP_B, OP_C];
        let picked = select_operator(&bag, &all_used, &HashSet::new()).unwrap();
        assert_eq!(picked.id, OP_A);
    }

    #[test]
    fn discarded_operators_are_skipped() {
        let operators = vec![operator(OP_A), operator(OP_B), operator(OP_C)];
        let bag = weighted_operators(&operators, (3, 2, 1));
        let discarded = HashSet::from([OP_A, OP_B]);
        let picked = select_operator(&bag, &[], &discarded).unwrap();
        assert_eq!(picked.id, OP_C);

        let discarded = HashSet::from([OP_A, OP_B, OP_C]);
        assert!(select_operator(&bag, &[], &discarded).is_none());
    }

    #[test]
    fn deposit_root_of_an_empty_registry() {
        let root = registry_deposit_root(None).unwrap();
        assert_eq!(root, keccak256(1u64.to_le_bytes()));
    }

    #[test]
    fn deposit_root_increments_the_latest_index() {
        // index 5, little-endian hex
        let raw = format!("0x{}", hex::encode(5u64.to_le_bytes()));
        let root = registry_deposit_root(Some(&raw)).unwrap();
        assert_eq!(root, keccak256(6u64.to_le_bytes()));
    }
}
