use alloy_network::EthereumWallet;
use alloy_primitives::{Address, U256};
use alloy_provider::{DynProvider, Provider, ProviderBuilder};
use anyhow::{Context, Result};
use clap::Parser;
use stakepool_common::{
    health,
    store::VoteStore,
    vote::DepositData,
};
use stakepool_keeper::{
    contracts::{self, keeper_params, KeeperParams, Oracles},
    settings::{AppArgs, Settings},
    submitter::Submitter,
    tally::tally,
    votes::{fetch_votes, OracleVotes},
};
use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};
use tokio::signal::unix::{signal, SignalKind};
use tracing::{debug, error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[tokio::main]
async fn main() -> Result<()> {
    let args = AppArgs::parse();
    let settings = Settings::new(args.config)?;

    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&settings.log)))
        .with(tracing_subscriber::fmt::layer().with_target(false))
        .init();

    let signer = settings.signer();
    let keeper_address = signer.address();
    let provider: DynProvider = ProviderBuilder::new()
        .wallet(EthereumWallet::from(signer))
        .connect_http(settings.rpc_endpoint())
        .erased();

    let oracles_address = settings.oracles_contract();
    let contract = Oracles::new(oracles_address, provider.clone());
    let is_oracle = contract
        .isOracle(keeper_address)
        .call()
        .await
        .context("failed to reach the oracles contract")?;
    info!(
        network = %settings.network,
        keeper = %keeper_address,
        oracles = %oracles_address,
        is_oracle,
        "keeper starting"
    );

    let store = VoteStore::new(
        &settings.aws_region,
        settings.s3_endpoint.clone(),
        settings.aws_bucket.clone(),
    )?;
    let submitter = Submitter::new(
        provider.clone(),
        settings.max_priority_fee_cap(),
        settings.min_effective_priority_fee(),
        settings.seconds_per_block,
        settings.transaction_timeout(),
        settings.confirmation_blocks,
    );

    let healthy = settings
        .health_addr()
        .map(|addr| health::spawn("keeper", addr))
        .unwrap_or_else(|| Arc::new(AtomicBool::new(false)));

    let mut sigterm = signal(SignalKind::terminate())?;
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            _ = sigterm.recv() => break,
            result = run_tick(&provider, oracles_address, &store, &submitter) => {
                match result {
                    Ok(assemblable) => healthy.store(assemblable, Ordering::Relaxed),
                    Err(err) => {
                        healthy.store(false, Ordering::Relaxed);
                        error!("tick failed: {err:#}");
                    }
                }
            }
        }

        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            _ = sigterm.recv() => break,
            _ = tokio::time::sleep(settings.process_interval()) => {}
        }
    }

    info!("keeper stopped");
    Ok(())
}

/// One keeper tick. Returns whether the daemon is currently able to act:
/// a quorum vote is assemblable, or the contract is paused.
async fn run_tick(
    provider: &DynProvider,
    oracles_address: Address,
    store: &VoteStore,
    submitter: &Submitter,
) -> Result<bool> {
    let params = keeper_params(provider, oracles_address).await?;
    if params.paused {
        debug!("oracles contract is paused");
        return Ok(true);
    }

    let votes = fetch_votes(
        store,
        &params.oracles,
        params.rewards_nonce,
        params.validators_nonce,
    )
    .await;

    let assemblable = submit_votes(provider, oracles_address, submitter, &params, &votes).await?;
    Ok(assemblable)
}

/// Tallies each category and submits whatever clears the quorum. A
/// rejection during gas estimation means another keeper beat us to it or
/// the round moved on; it is dropped silently until the next tick.
async fn submit_votes(
    provider: &DynProvider,
    oracles_address: Address,
    submitter: &Submitter,
    params: &KeeperParams,
    votes: &OracleVotes,
) -> Result<bool> {
    let total_oracles = params.oracles.len();
    let contract = Oracles::new(oracles_address, provider.clone());
    let mut assemblable = false;

    if let Some(quorum) = tally(&votes.rewards, total_oracles, |vote| {
        (vote.total_rewards.clone(), vote.activated_validators)
    }) {
        assemblable = true;
        let total_rewards: U256 = quorum
            .vote
            .total_rewards
            .parse()
            .context("verified vote carries an invalid amount")?;
        info!(
            "submitting rewards update: total rewards={}, activated validators={}",
            quorum.vote.total_rewards, quorum.vote.activated_validators
        );
        let call = contract.submitRewards(
            total_rewards,
            U256::from(quorum.vote.activated_validators),
            quorum.signatures.clone(),
        );
        match submitter.submit(call).await {
            Ok(()) => info!("total rewards have been successfully updated"),
            Err(err) => debug!("rewards submission dropped: {err:#}"),
        }
    }

    if let Some(quorum) = tally(&votes.distributor, total_oracles, |vote| {
        (vote.merkle_root.clone(), vote.merkle_proofs.clone())
    }) {
        assemblable = true;
        info!(
            "submitting distributor update: merkle root={}, merkle proofs={}",
            quorum.vote.merkle_root, quorum.vote.merkle_proofs
        );
        let merkle_root = quorum
            .vote
            .merkle_root
            .parse()
            .context("verified vote carries an invalid merkle root")?;
        let call = contract.submitMerkleRoot(
            merkle_root,
            quorum.vote.merkle_proofs.clone(),
            quorum.signatures.clone(),
        );
        match submitter.submit(call).await {
            Ok(()) => info!("merkle distributor has been successfully updated"),
            Err(err) => debug!("distributor submission dropped: {err:#}"),
        }
    }

    if let Some(quorum) = tally(&votes.validators, total_oracles, |vote| {
        (
            vote.validators_deposit_root.clone(),
            vote.deposit_data.clone(),
        )
    }) {
        assemblable = true;
        let deposit_data = quorum
            .vote
            .deposit_data
            .iter()
            .map(to_contract_deposit_data)
            .collect::<Result<Vec<_>>>()?;
        let validators_deposit_root = quorum
            .vote
            .validators_deposit_root
            .parse()
            .context("verified vote carries an invalid deposit root")?;
        info!(
            "submitting validators registration for {} validators",
            deposit_data.len()
        );
        let call = contract.registerValidators(
            deposit_data,
            validators_deposit_root,
            quorum.signatures.clone(),
        );
        match submitter.submit(call).await {
            Ok(()) => info!("validators have been successfully registered"),
            Err(err) => debug!("validators submission dropped: {err:#}"),
        }
    }

    Ok(assemblable)
}

fn to_contract_deposit_data(entry: &DepositData) -> Result<contracts::DepositData> {
    let (operator, withdrawal_credentials, deposit_data_root, public_key, signature) = entry
        .abi_tuple()
        .context("verified vote carries invalid deposit data")?;
    Ok(contracts::DepositData {
        operator,
        withdrawalCredentials: withdrawal_credentials,
        depositDataRoot: deposit_data_root,
        publicKey: public_key,
        signature,
    })
}
