//! Sorted-pair Keccak Merkle tree over the canonical reward map.
//!
//! Leaves are keccak hashes of the ABI encoding
//! `(uint256 index, address[] tokens, address account, uint256[] values)`
//! with accounts and tokens both in ascending address order, so the root is
//! a function of the reward map alone. Internal nodes hash the
//! byte-wise-sorted concatenation of their children; an odd trailing node is
//! promoted unchanged into the next layer.

use alloy_primitives::{keccak256, Address, B256, U256};
use alloy_sol_types::SolValue;
use anyhow::{anyhow, bail, Result};
use serde::{Deserialize, Serialize};
use stakepool_common::rewards::Rewards;
use std::collections::{BTreeMap, HashMap};

/// One published claim, hex/decimal-encoded as it crosses the blob
/// boundary.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Claim {
    pub index: u64,
    pub tokens: Vec<String>,
    pub values: Vec<String>,
    pub proof: Vec<String>,
}

/// Claims table keyed by checksummed account address.
pub type Claims = BTreeMap<String, Claim>;

pub struct MerkleTree {
    positions: HashMap<B256, usize>,
    layers: Vec<Vec<B256>>,
}

impl MerkleTree {
    pub fn new(elements: Vec<B256>) -> Result<Self> {
        if elements.is_empty() {
            bail!("cannot build a merkle tree without leaves");
        }
        let mut elements = elements;
        elements.sort();
        elements.dedup();

        let positions = elements
            .iter()
            .enumerate()
            .map(|(index, element)| (*element, index))
            .collect();

        let mut layers = vec![elements];
        while layers.last().expect("at least one layer").len() > 1 {
            let next = next_layer(layers.last().expect("at least one layer"));
            layers.push(next);
        }

        Ok(Self { positions, layers })
    }

    pub fn root(&self) -> B256 {
        self.layers.last().expect("at least one layer")[0]
    }

    /// Sibling hashes from the leaf layer up to, but not including, the
    /// root. A promoted odd node has no sibling at that layer and the proof
    /// skips it.
    pub fn proof(&self, element: B256) -> Result<Vec<B256>> {
        let mut index = *self
            .positions
            .get(&element)
            .ok_or_else(|| anyhow!("element is not in the merkle tree"))?;

        let mut proof = Vec::new();
        for layer in &self.layers {
            if let Some(pair) = pair_element(index, layer) {
                proof.push(pair);
            }
            index /= 2;
        }
        Ok(proof)
    }
}

fn next_layer(elements: &[B256]) -> Vec<B256> {
    elements
        .chunks(2)
        .map(|pair| match pair {
            [left, right] => combine(*left, *right),
            [odd] => *odd,
            _ => unreachable!("chunks of two"),
        })
        .collect()
}

fn combine(first: B256, second: B256) -> B256 {
    let (low, high) = if first <= second {
        (first, second)
    } else {
        (second, first)
    };
    let mut preimage = [0u8; 64];
    preimage[..32].copy_from_slice(low.as_slice());
    preimage[32..].copy_from_slice(high.as_slice());
    keccak256(preimage)
}

fn pair_element(index: usize, layer: &[B256]) -> Option<B256> {
    let pair_index = if index % 2 == 0 { index + 1 } else { index - 1 };
    layer.get(pair_index).copied()
}

/// Recomputes the root from a leaf and its proof.
pub fn verify_proof(root: B256, leaf: B256, proof: &[B256]) -> bool {
    proof.iter().fold(leaf, |node, sibling| combine(node, *sibling)) == root
}

/// Leaf hash for the i-th account of the canonicalized reward map.
pub fn merkle_element(index: u64, tokens: &[Address], account: Address, values: &[U256]) -> B256 {
    let encoded = (
        U256::from(index),
        tokens.to_vec(),
        account,
        values.to_vec(),
    )
        .abi_encode();
    keccak256(encoded)
}

/// Canonicalizes `rewards` and builds the tree, returning the root and the
/// claims table with per-account proofs.
pub fn calculate_merkle_root(rewards: &Rewards) -> Result<(B256, Claims)> {
    let mut claims = Claims::new();
    let mut elements = Vec::with_capacity(rewards.len());
    let mut accounts = Vec::with_capacity(rewards.len());

    // BTreeMap iteration gives ascending account and token order
    for (index, (account, account_rewards)) in rewards.iter().enumerate() {
        let tokens: Vec<Address> = account_rewards.keys().copied().collect();
        let values: Vec<U256> = account_rewards.values().copied().collect();
        let element = merkle_element(index as u64, &tokens, *account, &values);

        claims.insert(
            account.to_checksum(None),
            Claim {
                index: index as u64,
                tokens: tokens.iter().map(|t| t.to_checksum(None)).collect(),
                values: values.iter().map(U256::to_string).collect(),
                proof: Vec::new(),
            },
        );
        elements.push(element);
        accounts.push(*account);
    }

    let tree = MerkleTree::new(elements.clone())?;
    for (account, element) in accounts.iter().zip(&elements) {
        let proof = tree
            .proof(*element)?
            .iter()
            .map(|hash| format!("{hash}"))
            .collect();
        claims
            .get_mut(&account.to_checksum(None))
            .expect("claim inserted above")
            .proof = proof;
    }

    Ok((tree.root(), claims))
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloy_primitives::address;
    use stakepool_common::rewards::add_value;

    const TOKEN_A: Address = address!("0x1111111111111111111111111111111111111111");
    const TOKEN_B: Address = address!("0x2222222222222222222222222222222222222222");

    fn sample_rewards() -> Rewards {
        let mut rewards = Rewards::new();
        add_value(
            &mut rewards,
            address!("0xaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaa"),
            TOKEN_A,
            U256::from(100),
        );
        add_value(
            &mut rewards,
            address!("0xbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbb"),
            TOKEN_A,
            U256::from(40),
        );
        add_value(
            &mut rewards,
            address!("0xbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbb"),
            TOKEN_B,
            U256::from(7),
        );
        add_value(
            &mut rewards,
            address!("0xcccccccccccccccccccccccccccccccccccccccc"),
            TOKEN_B,
            U256::from(3),
        );
        rewards
    }

    #[test]
    fn empty_tree_is_an_error() {
        assert!(MerkleTree::new(Vec::new()).is_err());
    }

    #[test]
    fn single_leaf_root_is_the_leaf() {
        let leaf = merkle_element(0, &[TOKEN_A], Address::ZERO, &[U256::from(1)]);
        let tree = MerkleTree::new(vec![leaf]).unwrap();
        assert_eq!(tree.root(), leaf);
        assert!(tree.proof(leaf).unwrap().is_empty());
        assert!(verify_proof(tree.root(), leaf, &[]));
    }

    #[test]
    fn every_claim_proof_verifies() {
        let rewards = sample_rewards();
        let (root, claims) = calculate_merkle_root(&rewards).unwrap();

        for (account, claim) in &claims {
            let tokens: Vec<Address> = claim.tokens.iter().map(|t| t.parse().unwrap()).collect();
            let values: Vec<U256> = claim.values.iter().map(|v| v.parse().unwrap()).collect();
            let leaf = merkle_element(claim.index, &tokens, account.parse().unwrap(), &values);
            let proof: Vec<B256> = claim.proof.iter().map(|p| p.parse().unwrap()).collect();
            assert!(verify_proof(root, leaf, &proof), "claim for {account}");
        }
    }

    #[test]
    fn tampered_leaf_fails_verification() {
        let rewards = sample_rewards();
        let (root, claims) = calculate_merkle_root(&rewards).unwrap();

        let (account, claim) = claims.iter().next().unwrap();
        let tokens: Vec<Address> = claim.tokens.iter().map(|t| t.parse().unwrap()).collect();
        let mut values: Vec<U256> = claim.values.iter().map(|v| v.parse().unwrap()).collect();
        values[0] += U256::from(1);
        let leaf = merkle_element(claim.index, &tokens, account.parse().unwrap(), &values);
        let proof: Vec<B256> = claim.proof.iter().map(|p| p.parse().unwrap()).collect();
        assert!(!verify_proof(root, leaf, &proof));
    }

    #[test]
    fn root_is_input_order_invariant() {
        // maps canonicalize internally, so rebuilding from a differently
        // assembled map yields the same root
        let rewards = sample_rewards();
        let (root, _) = calculate_merkle_root(&rewards).unwrap();

        let mut reversed = Rewards::new();
        for (account, tokens) in rewards.iter().rev() {
            for (token, amount) in tokens.iter().rev() {
                add_value(&mut reversed, *account, *token, *amount);
            }
        }
        let (reversed_root, _) = calculate_merkle_root(&reversed).unwrap();
        assert_eq!(root, reversed_root);
    }

    #[test]
    fn odd_leaf_is_promoted() {
        let leaves: Vec<B256> = (0u64..5)
            .map(|i| merkle_element(i, &[TOKEN_A], Address::ZERO, &[U256::from(i)]))
            .collect();
        let tree = MerkleTree::new(leaves.clone()).unwrap();
        for leaf in leaves {
            let proof = tree.proof(leaf).unwrap();
            assert!(verify_proof(tree.root(), leaf, &proof));
        }
    }
}
