//! Vote aggregation against a simulated oracle set: votes signed with real
//! keys, verified, tallied, and reduced to a quorum signature set.

use alloy_primitives::{b256, Address, U256};
use alloy_signer_local::PrivateKeySigner;
use stakepool_common::vote::{self, DistributorVote, RewardsVote};
use stakepool_keeper::{
    tally::{can_submit, tally},
    votes::{check_distributor_vote, check_rewards_vote},
};

fn signed_rewards_vote(signer: &PrivateKeySigner, nonce: u64, total: u64) -> RewardsVote {
    let encoded = vote::encode_rewards_vote(nonce, 128, U256::from(total));
    RewardsVote {
        nonce,
        activated_validators: 128,
        total_rewards: U256::from(total).to_string(),
        signature: vote::sign_vote(signer, &encoded).unwrap(),
    }
}

#[test]
fn seven_oracle_round_reaches_quorum() {
    let nonce = 42;
    let signers: Vec<PrivateKeySigner> = (0..7).map(|_| PrivateKeySigner::random()).collect();

    // five oracles agree on the payload, two dissent
    let votes: Vec<(Address, RewardsVote)> = signers
        .iter()
        .enumerate()
        .map(|(i, signer)| {
            let total = if i < 5 { 1_000_000 } else { 999_999 };
            (signer.address(), signed_rewards_vote(signer, nonce, total))
        })
        .collect();

    // every vote must verify against its own oracle before tallying
    for (oracle, vote) in &votes {
        assert!(check_rewards_vote(vote, *oracle, nonce));
    }

    let quorum = tally(&votes, 7, |vote| {
        (vote.total_rewards.clone(), vote.activated_validators)
    })
    .expect("five of seven clears the two-thirds rule");

    assert_eq!(quorum.vote.total_rewards, "1000000");
    assert!(can_submit(quorum.signatures.len(), 7));
    // the dissenting signatures never make it into the set
    assert_eq!(quorum.signatures.len(), 5);
}

#[test]
fn stale_and_forged_votes_never_reach_the_tally() {
    let nonce = 42;
    let honest = PrivateKeySigner::random();
    let forger = PrivateKeySigner::random();

    let stale = signed_rewards_vote(&honest, nonce - 1, 1_000_000);
    assert!(!check_rewards_vote(&stale, honest.address(), nonce));

    // a vote signed by one key but published under another oracle's prefix
    let forged = signed_rewards_vote(&forger, nonce, 1_000_000);
    assert!(!check_rewards_vote(&forged, honest.address(), nonce));
}

#[test]
fn distributor_round_splits_without_quorum() {
    let nonce = 7;
    let signers: Vec<PrivateKeySigner> = (0..6).map(|_| PrivateKeySigner::random()).collect();
    let roots = [
        b256!("0x1111111111111111111111111111111111111111111111111111111111111111"),
        b256!("0x2222222222222222222222222222222222222222222222222222222222222222"),
    ];

    // a clean three-three split: nothing may be submitted
    let votes: Vec<(Address, DistributorVote)> = signers
        .iter()
        .enumerate()
        .map(|(i, signer)| {
            let root = roots[i % 2];
            let proofs = format!("/ipfs/QmClaims{}", i % 2);
            let encoded = vote::encode_distributor_vote(nonce, &proofs, root);
            let vote = DistributorVote {
                nonce,
                merkle_root: format!("{root}"),
                merkle_proofs: proofs,
                signature: vote::sign_vote(signer, &encoded).unwrap(),
            };
            assert!(check_distributor_vote(&vote, signer.address(), nonce));
            (signer.address(), vote)
        })
        .collect();

    assert!(tally(&votes, 6, |vote| (
        vote.merkle_root.clone(),
        vote.merkle_proofs.clone()
    ))
    .is_none());
}
