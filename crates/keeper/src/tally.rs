//! BFT vote tallying: modal payload selection under the strict two-thirds
//! rule.

use crate::votes::Signed;
use alloy_primitives::{Address, Bytes};
use std::collections::HashMap;
use std::hash::Hash;

/// The contract accepts a submission iff strictly more than two thirds of
/// the oracle set signed it.
pub fn can_submit(signatures_count: usize, total_oracles: usize) -> bool {
    signatures_count * 3 > total_oracles * 2
}

/// Outcome of a tally: a reference vote carrying the winning payload and a
/// quorum-sized signature set for it.
pub struct Quorum<'a, V> {
    pub vote: &'a V,
    pub signatures: Vec<Bytes>,
}

/// Tallies votes by their payload identity tuple and, if the modal payload
/// clears the quorum, collects the smallest signature prefix that does.
pub fn tally<'a, V, K>(
    votes: &'a [(Address, V)],
    total_oracles: usize,
    identity: impl Fn(&V) -> K,
) -> Option<Quorum<'a, V>>
where
    V: Signed,
    K: Eq + Hash,
{
    let mut counts: HashMap<K, usize> = HashMap::new();
    for (_, vote) in votes {
        *counts.entry(identity(vote)).or_default() += 1;
    }
    let (winner, count) = counts.into_iter().max_by_key(|(_, count)| *count)?;
    if !can_submit(count, total_oracles) {
        return None;
    }

    let mut reference = None;
    let mut signatures = Vec::new();
    for (_, vote) in votes {
        if can_submit(signatures.len(), total_oracles) {
            break;
        }
        if identity(vote) == winner {
            reference.get_or_insert(vote);
            if let Some(signature) = decode_signature(vote.signature()) {
                signatures.push(signature);
            }
        }
    }

    reference.map(|vote| Quorum { vote, signatures })
}

fn decode_signature(signature: &str) -> Option<Bytes> {
    let raw = hex::decode(signature.trim_start_matches("0x")).ok()?;
    Some(Bytes::from(raw))
}

#[cfg(test)]
mod tests {
    use super::*;
    use stakepool_common::vote::RewardsVote;

    fn vote(total: &str, n: usize) -> Vec<(Address, RewardsVote)> {
        (0..n)
            .map(|i| {
                let mut bytes = [0u8; 20];
                bytes[19] = i as u8 + 1;
                (
                    Address::from(bytes),
                    RewardsVote {
                        nonce: 1,
                        activated_validators: 10,
                        total_rewards: total.to_string(),
                        signature: format!("0x{}", "11".repeat(65)),
                    },
                )
            })
            .collect()
    }

    #[test]
    fn quorum_is_strict_two_thirds() {
        // 3q > 2n across the boundary
        assert!(!can_submit(0, 0));
        assert!(can_submit(1, 1));
        assert!(!can_submit(2, 3));
        assert!(can_submit(3, 4));
        assert!(!can_submit(4, 6));
        assert!(can_submit(5, 7));
        assert!(!can_submit(6, 9));
        assert!(can_submit(7, 10));
    }

    #[test]
    fn five_of_seven_submits_with_a_minimal_set() {
        let mut votes = vote("1000", 5);
        votes.extend(vote("2000", 2));

        let quorum = tally(&votes, 7, |v| {
            (v.total_rewards.clone(), v.activated_validators)
        })
        .unwrap();
        assert_eq!(quorum.vote.total_rewards, "1000");
        // 5 * 3 = 15 > 14 = 7 * 2, and 4 would not clear it
        assert_eq!(quorum.signatures.len(), 5);
    }

    #[test]
    fn four_of_seven_does_not_submit() {
        let mut votes = vote("1000", 4);
        votes.extend(vote("2000", 3));
        assert!(tally(&votes, 7, |v| (
            v.total_rewards.clone(),
            v.activated_validators
        ))
        .is_none());
    }

    #[test]
    fn split_votes_do_not_submit() {
        let mut votes = vote("1000", 2);
        votes.extend(vote("2000", 2));
        votes.extend(vote("3000", 2));
        assert!(tally(&votes, 6, |v| v.total_rewards.clone()).is_none());
    }
}
