use alloy_primitives::Address;
use anyhow::{Context, Result};
use clap::Parser;
use serde_json::json;
use stakepool_common::{
    graph::GraphClient,
    health,
    ipfs::IpfsClient,
    store::VoteStore,
    vote::TEST_VOTE_FILENAME,
};
use stakepool_oracle::{
    beacon::{BeaconApi, BeaconClient},
    distributor::{controller::DistributorController, uniswap::UniswapClient},
    eth1::Eth1Client,
    publisher::VotePublisher,
    rewards::RewardsController,
    settings::{AppArgs, Settings},
    validators::ValidatorsController,
};
use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};
use tokio::signal::unix::{signal, SignalKind};
use tracing::{error, info};
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
    let oracle_address = signer.address();
    info!(network = %settings.network, oracle = %oracle_address, "oracle starting");

    let pool_graph = GraphClient::new(settings.pool_subgraph_urls());
    let chain_graph = GraphClient::new(settings.chain_subgraph_urls());
    let amm_graph = GraphClient::new(settings.amm_subgraph_urls());
    let beacon = BeaconClient::new(settings.beacon_endpoint(), settings.beacon_flavor());
    let ipfs = IpfsClient::new(
        settings.ipfs_pin_endpoints(),
        settings.ipfs_fetch_endpoints(),
        settings.pinata(),
    );
    let store = VoteStore::new(
        &settings.aws_region,
        settings.s3_endpoint.clone(),
        settings.aws_bucket.clone(),
    )?;
    let publisher = Arc::new(VotePublisher::new(signer, store));
    let eth1 = Eth1Client::new(
        chain_graph.clone(),
        pool_graph.clone(),
        settings.confirmation_blocks,
    );

    init_checks(&publisher, &eth1, &beacon, oracle_address).await?;

    let genesis = beacon.genesis().await.context("failed to fetch genesis")?;
    let rewards_controller = RewardsController::new(
        beacon,
        pool_graph.clone(),
        publisher.clone(),
        genesis.genesis_time,
        settings.sync_period,
        settings.slots_per_epoch,
        settings.seconds_per_epoch(),
        settings.deposit_token_symbol.clone(),
    );
    let uniswap = UniswapClient::new(
        amm_graph,
        settings.staked_token_contract(),
        settings.reward_token_contract(),
        settings.governance_token_contract(),
    );
    let mut distributor_controller = DistributorController::new(
        pool_graph.clone(),
        uniswap,
        ipfs.clone(),
        publisher.clone(),
        settings.distributor_fallback_address(),
        settings.reward_token_contract(),
        settings.staked_token_contract(),
        settings.governance_token_contract(),
        settings.protocol_operator_address(),
    );
    let mut validators_controller = ValidatorsController::new(
        pool_graph.clone(),
        chain_graph.clone(),
        ipfs,
        publisher.clone(),
        settings.validators_batch_size,
        (
            settings.operator_weight_first,
            settings.operator_weight_second,
            settings.operator_weight_others,
        ),
        settings.pool_balance_rate(),
    );

    let healthy = settings
        .health_addr()
        .map(|addr| health::spawn("oracle", addr))
        .unwrap_or_else(|| Arc::new(AtomicBool::new(false)));

    let mut sigterm = signal(SignalKind::terminate())?;
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            _ = sigterm.recv() => break,
            result = run_tick(&eth1, &rewards_controller, &mut distributor_controller, &mut validators_controller) => {
                match result {
                    Ok(()) => healthy.store(true, Ordering::Relaxed),
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

    info!("oracle stopped");
    Ok(())
}

/// Fails fast on broken wiring before the first tick: the vote store, the
/// indexers, and the beacon node must all be reachable.
async fn init_checks(
    publisher: &VotePublisher,
    eth1: &Eth1Client,
    beacon: &BeaconClient,
    oracle_address: Address,
) -> Result<()> {
    info!("submitting test vote for account {oracle_address}");
    publisher
        .publish(TEST_VOTE_FILENAME, b"test data", |signature| {
            json!({ "name": "test vote", "signature": signature })
        })
        .await
        .context("failed to publish the startup test vote")?;

    info!("checking connection to graph nodes");
    eth1.finalized_block()
        .await
        .context("failed to query the chain indexer")?;

    info!("checking connection to the beacon node");
    beacon
        .finality_checkpoints()
        .await
        .context("failed to query the beacon node")?;

    Ok(())
}

async fn run_tick<B: BeaconApi>(
    eth1: &Eth1Client,
    rewards: &RewardsController<B>,
    distributor: &mut DistributorController,
    validators: &mut ValidatorsController,
) -> Result<()> {
    let finalized_block = eth1.finalized_block().await?;
    let latest_block_number = eth1.latest_block_number().await?;
    eth1.wait_for_synced_block(latest_block_number).await?;

    let params = eth1.voting_parameters(finalized_block.block_number).await?;

    let (rewards_result, distributor_result, validators_result) = tokio::join!(
        rewards.process(
            &params.rewards,
            finalized_block.block_number,
            finalized_block.timestamp,
        ),
        distributor.process(&params.distributor),
        validators.process(&params.validator, latest_block_number),
    );
    rewards_result?;
    distributor_result?;
    validators_result?;

    Ok(())
}
