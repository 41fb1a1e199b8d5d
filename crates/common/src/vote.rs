//! Vote payloads, their canonical ABI encodings, and the EIP-191 signature
//! scheme shared by the oracle (signing) and the keeper (verification).
//!
//! The candidate id of a vote is `keccak256(abi_encode(payload))`; the
//! signature is a personal-sign over that id with the oracle's secp256k1
//! key. The contract recomputes the same id on-chain, so the encodings here
//! must match the contract ABI exactly.

use alloy_primitives::{keccak256, Address, Bytes, Signature, B256, U256};
use alloy_signer::SignerSync;
use alloy_signer_local::PrivateKeySigner;
use alloy_sol_types::SolValue;
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use thiserror::Error;

pub const REWARD_VOTE_FILENAME: &str = "reward-vote.json";
pub const DISTRIBUTOR_VOTE_FILENAME: &str = "distributor-vote.json";
pub const VALIDATOR_VOTE_FILENAME: &str = "validator-vote.json";
pub const TEST_VOTE_FILENAME: &str = "test-vote.json";

pub type Result<T> = std::result::Result<T, VoteError>;

#[derive(Debug, Error)]
pub enum VoteError {
    #[error("invalid {field} in vote payload: {value}")]
    InvalidField { field: &'static str, value: String },
    #[error("failed to sign vote: {0}")]
    Signer(#[from] alloy_signer::Error),
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RewardsVote {
    pub nonce: u64,
    pub activated_validators: u64,
    /// Decimal-encoded wei amount.
    pub total_rewards: String,
    pub signature: String,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DistributorVote {
    pub nonce: u64,
    /// 0x-prefixed 32-byte hex.
    pub merkle_root: String,
    /// Blob store reference of the claims table.
    pub merkle_proofs: String,
    pub signature: String,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidatorsVote {
    pub nonce: u64,
    pub validators_deposit_root: String,
    pub deposit_data: Vec<DepositData>,
    pub signature: String,
}

/// One next-validator registration entry, hex-encoded as published.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DepositData {
    pub operator: String,
    pub public_key: String,
    pub withdrawal_credentials: String,
    pub deposit_data_root: String,
    pub signature: String,
    pub proof: Vec<String>,
}

impl DepositData {
    /// The `(address,bytes32,bytes32,bytes,bytes)` tuple the contract
    /// expects: operator, withdrawal credentials, deposit data root, public
    /// key, BLS signature.
    pub fn abi_tuple(&self) -> Result<(Address, B256, B256, Bytes, Bytes)> {
        Ok((
            parse_field::<Address>("operator", &self.operator)?,
            parse_field::<B256>("withdrawal_credentials", &self.withdrawal_credentials)?,
            parse_field::<B256>("deposit_data_root", &self.deposit_data_root)?,
            parse_field::<Bytes>("public_key", &self.public_key)?,
            parse_field::<Bytes>("signature", &self.signature)?,
        ))
    }
}

fn parse_field<T: FromStr>(field: &'static str, value: &str) -> Result<T> {
    value.parse().map_err(|_| VoteError::InvalidField {
        field,
        value: value.to_string(),
    })
}

pub fn encode_rewards_vote(nonce: u64, activated_validators: u64, total_rewards: U256) -> Vec<u8> {
    (
        U256::from(nonce),
        U256::from(activated_validators),
        total_rewards,
    )
        .abi_encode()
}

pub fn encode_distributor_vote(nonce: u64, merkle_proofs: &str, merkle_root: B256) -> Vec<u8> {
    (U256::from(nonce), merkle_proofs.to_string(), merkle_root).abi_encode()
}

pub fn encode_validators_vote(
    nonce: u64,
    deposit_data: &[DepositData],
    validators_deposit_root: B256,
) -> Result<Vec<u8>> {
    let entries = deposit_data
        .iter()
        .map(DepositData::abi_tuple)
        .collect::<Result<Vec<_>>>()?;
    Ok((U256::from(nonce), entries, validators_deposit_root).abi_encode())
}

/// Signs the canonical encoding of a vote and returns the 0x-prefixed
/// signature hex. The candidate id is the keccak of the encoding; the
/// signature is an EIP-191 personal-sign over the id.
pub fn sign_vote(signer: &PrivateKeySigner, encoded: &[u8]) -> Result<String> {
    let candidate_id = keccak256(encoded);
    let signature = signer.sign_message_sync(candidate_id.as_slice())?;
    Ok(format!("0x{}", hex::encode(signature.as_bytes())))
}

/// Checks that `signature` recovers to `account` over the canonical
/// encoding. Any malformed input fails verification rather than erroring.
pub fn verify_vote_signature(encoded: &[u8], account: Address, signature: &str) -> bool {
    let Ok(raw) = hex::decode(signature.trim_start_matches("0x")) else {
        return false;
    };
    let Ok(signature) = Signature::try_from(raw.as_slice()) else {
        return false;
    };
    let candidate_id = keccak256(encoded);
    signature
        .recover_address_from_msg(candidate_id.as_slice())
        .is_ok_and(|signer| signer == account)
}
