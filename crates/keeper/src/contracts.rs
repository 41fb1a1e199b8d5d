//! On-chain reads: the oracles contract interface and the batched
//! multicall that snapshots its state each tick.

use alloy_primitives::{keccak256, Address, B256, U256};
use alloy_provider::{DynProvider, Provider};
use alloy_sol_types::sol;
use anyhow::{Context, Result};

sol! {
    #[sol(rpc)]
    contract Oracles {
        function paused() external view returns (bool);
        function currentRewardsNonce() external view returns (uint256);
        function currentValidatorsNonce() external view returns (uint256);
        function getRoleMemberCount(bytes32 role) external view returns (uint256);
        function getRoleMember(bytes32 role, uint256 index) external view returns (address);
        function isOracle(address account) external view returns (bool);
        function submitRewards(uint256 totalRewards, uint256 activatedValidators, bytes[] signatures) external;
        function submitMerkleRoot(bytes32 merkleRoot, string merkleProofs, bytes[] signatures) external;
        function registerValidators(DepositData[] depositData, bytes32 validatorsDepositRoot, bytes[] signatures) external;
    }

    #[derive(Debug)]
    struct DepositData {
        address operator;
        bytes32 withdrawalCredentials;
        bytes32 depositDataRoot;
        bytes publicKey;
        bytes signature;
    }
}

pub fn oracle_role() -> B256 {
    keccak256(b"ORACLE_ROLE")
}

/// Contract state the keeper needs to decide whether to submit.
#[derive(Clone, Debug)]
pub struct KeeperParams {
    pub paused: bool,
    pub rewards_nonce: u64,
    pub validators_nonce: u64,
    pub oracles: Vec<Address>,
}

/// Snapshots pause state, both nonces, and the oracle set in two batched
/// multicalls.
pub async fn keeper_params(provider: &DynProvider, oracles_address: Address) -> Result<KeeperParams> {
    let contract = Oracles::new(oracles_address, provider.clone());
    let role = oracle_role();

    let (paused, rewards_nonce, validators_nonce, member_count) = provider
        .multicall()
        .add(contract.paused())
        .add(contract.currentRewardsNonce())
        .add(contract.currentValidatorsNonce())
        .add(contract.getRoleMemberCount(role))
        .aggregate()
        .await
        .context("failed to read oracles contract state")?;

    let member_count = member_count.to::<u64>();
    let mut oracles = Vec::with_capacity(member_count as usize);
    if member_count > 0 {
        let mut members = provider.multicall().dynamic::<Oracles::getRoleMemberCall>();
        for index in 0..member_count {
            members = members.add_dynamic(contract.getRoleMember(role, U256::from(index)));
        }
        oracles = members
            .aggregate()
            .await
            .context("failed to read the oracle set")?;
    }

    Ok(KeeperParams {
        paused,
        rewards_nonce: rewards_nonce.to::<u64>(),
        validators_nonce: validators_nonce.to::<u64>(),
        oracles,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn oracle_role_matches_the_contract_constant() {
        // keccak256("ORACLE_ROLE"), as hardcoded in the contract
        assert_eq!(
            format!("{}", oracle_role()),
            "0x68e79a7bf1e0bc45d0a330c573bc367f9cf464fd326078812f301165fbda4ef1"
        );
    }
}
