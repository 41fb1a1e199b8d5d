//! Fetching and validating the oracles' published votes.
//!
//! A vote is kept only when its nonce equals the current nonce of its
//! category and its signature recovers to the oracle address it was
//! published under. Everything else is dropped, absent objects silently and
//! bad signatures with a warning.

use alloy_primitives::Address;
use futures::future::join_all;
use stakepool_common::{
    store::VoteStore,
    vote::{
        self, DistributorVote, RewardsVote, ValidatorsVote, DISTRIBUTOR_VOTE_FILENAME,
        REWARD_VOTE_FILENAME, VALIDATOR_VOTE_FILENAME,
    },
};
use tracing::{debug, warn};

/// Signature accessor shared by the three vote flavors so the tally can
/// collect quorum signatures generically.
pub trait Signed {
    fn signature(&self) -> &str;
}

impl Signed for RewardsVote {
    fn signature(&self) -> &str {
        &self.signature
    }
}

impl Signed for DistributorVote {
    fn signature(&self) -> &str {
        &self.signature
    }
}

impl Signed for ValidatorsVote {
    fn signature(&self) -> &str {
        &self.signature
    }
}

#[derive(Debug, Default)]
pub struct OracleVotes {
    pub rewards: Vec<(Address, RewardsVote)>,
    pub distributor: Vec<(Address, DistributorVote)>,
    pub validators: Vec<(Address, ValidatorsVote)>,
}

pub fn check_rewards_vote(vote: &RewardsVote, oracle: Address, nonce: u64) -> bool {
    if vote.nonce != nonce {
        return false;
    }
    let Ok(total_rewards) = vote.total_rewards.parse() else {
        return false;
    };
    let encoded = vote::encode_rewards_vote(vote.nonce, vote.activated_validators, total_rewards);
    vote::verify_vote_signature(&encoded, oracle, &vote.signature)
}

pub fn check_distributor_vote(vote: &DistributorVote, oracle: Address, nonce: u64) -> bool {
    if vote.nonce != nonce {
        return false;
    }
    let Ok(merkle_root) = vote.merkle_root.parse() else {
        return false;
    };
    let encoded = vote::encode_distributor_vote(vote.nonce, &vote.merkle_proofs, merkle_root);
    vote::verify_vote_signature(&encoded, oracle, &vote.signature)
}

pub fn check_validators_vote(vote: &ValidatorsVote, oracle: Address, nonce: u64) -> bool {
    if vote.nonce != nonce {
        return false;
    }
    let Ok(validators_deposit_root) = vote.validators_deposit_root.parse() else {
        return false;
    };
    let Ok(encoded) =
        vote::encode_validators_vote(vote.nonce, &vote.deposit_data, validators_deposit_root)
    else {
        return false;
    };
    vote::verify_vote_signature(&encoded, oracle, &vote.signature)
}

/// Pulls the three vote objects of every oracle and keeps the valid ones.
pub async fn fetch_votes(
    store: &VoteStore,
    oracles: &[Address],
    rewards_nonce: u64,
    validators_nonce: u64,
) -> OracleVotes {
    let mut votes = OracleVotes::default();

    let fetched = join_all(oracles.iter().map(|oracle| async move {
        let (rewards, distributor, validators) = tokio::join!(
            store.fetch(*oracle, REWARD_VOTE_FILENAME),
            store.fetch(*oracle, DISTRIBUTOR_VOTE_FILENAME),
            store.fetch(*oracle, VALIDATOR_VOTE_FILENAME),
        );
        (*oracle, rewards, distributor, validators)
    }))
    .await;

    for (oracle, rewards, distributor, validators) in fetched {
        match rewards.map(serde_json::from_value::<RewardsVote>) {
            Ok(Ok(vote)) if check_rewards_vote(&vote, oracle, rewards_nonce) => {
                votes.rewards.push((oracle, vote));
            }
            Ok(Ok(_)) | Ok(Err(_)) => warn!("oracle {oracle} has published an invalid rewards vote"),
            Err(err) => debug!("no rewards vote from {oracle}: {err}"),
        }
        match distributor.map(serde_json::from_value::<DistributorVote>) {
            Ok(Ok(vote)) if check_distributor_vote(&vote, oracle, rewards_nonce) => {
                votes.distributor.push((oracle, vote));
            }
            Ok(Ok(_)) | Ok(Err(_)) => {
                warn!("oracle {oracle} has published an invalid distributor vote");
            }
            Err(err) => debug!("no distributor vote from {oracle}: {err}"),
        }
        match validators.map(serde_json::from_value::<ValidatorsVote>) {
            Ok(Ok(vote)) if check_validators_vote(&vote, oracle, validators_nonce) => {
                votes.validators.push((oracle, vote));
            }
            Ok(Ok(_)) | Ok(Err(_)) => {
                warn!("oracle {oracle} has published an invalid validators vote");
            }
            Err(err) => debug!("no validators vote from {oracle}: {err}"),
        }
    }

    votes
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloy_primitives::{b256, U256};
    use alloy_signer_local::PrivateKeySigner;

    fn signed_rewards_vote(signer: &PrivateKeySigner, nonce: u64) -> RewardsVote {
        let total = U256::from(5_000_000_000u64);
        let encoded = vote::encode_rewards_vote(nonce, 42, total);
        RewardsVote {
            nonce,
            activated_validators: 42,
            total_rewards: total.to_string(),
            signature: vote::sign_vote(signer, &encoded).unwrap(),
        }
    }

    #[test]
    fn valid_vote_is_accepted() {
        let signer = PrivateKeySigner::random();
        let vote = signed_rewards_vote(&signer, 7);
        assert!(check_rewards_vote(&vote, signer.address(), 7));
    }

    #[test]
    fn stale_nonce_is_discarded() {
        let signer = PrivateKeySigner::random();
        let vote = signed_rewards_vote(&signer, 6);
        assert!(!check_rewards_vote(&vote, signer.address(), 7));
    }

    #[test]
    fn wrong_oracle_is_discarded() {
        let signer = PrivateKeySigner::random();
        let other = PrivateKeySigner::random();
        let vote = signed_rewards_vote(&signer, 7);
        assert!(!check_rewards_vote(&vote, other.address(), 7));
    }

    #[test]
    fn distributor_vote_round_trips() {
        let signer = PrivateKeySigner::random();
        let root = b256!("0x3333333333333333333333333333333333333333333333333333333333333333");
        let proofs = "/ipfs/QmClaims".to_string();
        let encoded = vote::encode_distributor_vote(9, &proofs, root);
        let vote = DistributorVote {
            nonce: 9,
            merkle_root: format!("{root}"),
            merkle_proofs: proofs,
            signature: vote::sign_vote(&signer, &encoded).unwrap(),
        };
        assert!(check_distributor_vote(&vote, signer.address(), 9));
        assert!(!check_distributor_vote(&vote, signer.address(), 10));
    }
}
