use alloy_primitives::{Address, U256};
use alloy_signer_local::PrivateKeySigner;
use clap::Parser;
use config::{Config, Environment, File};
use serde::{Deserialize, Serialize};
use std::{net::SocketAddr, path::PathBuf, time::Duration};
use url::Url;

use crate::beacon::BeaconFlavor;
use stakepool_common::ipfs::PinataSettings;

#[derive(Debug, Parser)]
#[command(
    term_width = 0,
    name = "Stakepool Oracle",
    version = option_env!("BUILD_VERSION").unwrap_or(env!("CARGO_PKG_VERSION"))
)]
pub struct AppArgs {
    /// Path to the config file
    #[arg(short = 'c', long)]
    pub config: Option<PathBuf>,
}

#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct Settings {
    /// Log filter
    #[serde(default = "default_log")]
    pub log: String,

    /// Network identifier, informational only
    #[serde(default = "default_network")]
    pub network: String,

    /// Hex-encoded secp256k1 private key of this oracle
    oracle_private_key: String,

    /// Seconds between ticks
    #[serde(default = "default_process_interval")]
    process_interval: u64,

    /// Confirmation depth for the finalized block
    #[serde(default = "default_confirmation_blocks")]
    pub confirmation_blocks: u64,

    /// Seconds between successive rewards updates
    #[serde(default = "default_sync_period")]
    pub sync_period: u64,

    #[serde(default = "default_slots_per_epoch")]
    pub slots_per_epoch: u64,
    #[serde(default = "default_seconds_per_slot")]
    pub seconds_per_slot: u64,

    #[serde(default = "default_deposit_token_symbol")]
    pub deposit_token_symbol: String,

    /// Optional wad-scaled exchange rate applied to the pool balance before
    /// the validator deposit division (governance-chain deployments)
    pool_balance_rate_wad: Option<String>,

    /// Comma-separated indexer replica URLs
    pool_subgraph_urls: String,
    chain_subgraph_urls: String,
    amm_subgraph_urls: String,

    /// Beacon node REST endpoint and client flavor
    beacon_endpoint: String,
    #[serde(default = "default_beacon_flavor")]
    beacon_flavor: String,

    /// Comma-separated blob store endpoints
    ipfs_pin_endpoints: String,
    ipfs_fetch_endpoints: String,
    ipfs_pinata_endpoint: Option<String>,
    ipfs_pinata_api_key: Option<String>,
    ipfs_pinata_secret_key: Option<String>,

    /// Vote publication bucket
    pub aws_bucket: String,
    pub aws_region: String,
    pub s3_endpoint: Option<String>,

    /// The three named token contracts
    reward_token_contract: String,
    staked_token_contract: String,
    governance_token_contract: String,

    /// Treasury address receiving unattributable rewards
    distributor_fallback_address: String,
    /// Operator address receiving half of the protocol reward
    protocol_operator_address: String,

    #[serde(default = "default_validators_batch_size")]
    pub validators_batch_size: u64,
    #[serde(default = "default_operator_weight_first")]
    pub operator_weight_first: usize,
    #[serde(default = "default_operator_weight_second")]
    pub operator_weight_second: usize,
    #[serde(default = "default_operator_weight_others")]
    pub operator_weight_others: usize,

    /// Liveness endpoint; unset disables it
    health_addr: Option<String>,
}

impl Settings {
    pub fn new(path: Option<PathBuf>) -> Result<Self, config::ConfigError> {
        let mut builder = Config::builder();
        if let Some(file) = path {
            builder =
                builder.add_source(File::with_name(&file.to_string_lossy()).required(false));
        }
        builder
            .add_source(
                Environment::with_prefix("ORACLE")
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()
            .and_then(|config| config.try_deserialize())
    }

    pub fn signer(&self) -> PrivateKeySigner {
        self.oracle_private_key
            .trim_start_matches("0x")
            .parse()
            .expect("invalid oracle private key")
    }

    pub fn process_interval(&self) -> Duration {
        Duration::from_secs(self.process_interval)
    }

    pub fn seconds_per_epoch(&self) -> u64 {
        self.slots_per_epoch * self.seconds_per_slot
    }

    pub fn pool_balance_rate(&self) -> Option<U256> {
        self.pool_balance_rate_wad
            .as_ref()
            .map(|rate| rate.parse().expect("invalid pool balance exchange rate"))
    }

    pub fn pool_subgraph_urls(&self) -> Vec<Url> {
        parse_urls(&self.pool_subgraph_urls, "pool_subgraph_urls")
    }

    pub fn chain_subgraph_urls(&self) -> Vec<Url> {
        parse_urls(&self.chain_subgraph_urls, "chain_subgraph_urls")
    }

    pub fn amm_subgraph_urls(&self) -> Vec<Url> {
        parse_urls(&self.amm_subgraph_urls, "amm_subgraph_urls")
    }

    pub fn beacon_endpoint(&self) -> Url {
        self.beacon_endpoint
            .parse()
            .expect("invalid beacon endpoint")
    }

    pub fn beacon_flavor(&self) -> BeaconFlavor {
        match self.beacon_flavor.as_str() {
            "lighthouse" => BeaconFlavor::Lighthouse,
            "prysm" | "teku" => BeaconFlavor::Prysm,
            other => panic!("unknown beacon client flavor: {other}"),
        }
    }

    pub fn ipfs_pin_endpoints(&self) -> Vec<Url> {
        parse_urls(&self.ipfs_pin_endpoints, "ipfs_pin_endpoints")
    }

    pub fn ipfs_fetch_endpoints(&self) -> Vec<Url> {
        parse_urls(&self.ipfs_fetch_endpoints, "ipfs_fetch_endpoints")
    }

    pub fn pinata(&self) -> Option<PinataSettings> {
        match (
            &self.ipfs_pinata_endpoint,
            &self.ipfs_pinata_api_key,
            &self.ipfs_pinata_secret_key,
        ) {
            (Some(endpoint), Some(api_key), Some(secret_key)) => Some(PinataSettings {
                endpoint: endpoint.parse().expect("invalid pinning service endpoint"),
                api_key: api_key.clone(),
                secret_key: secret_key.clone(),
            }),
            _ => None,
        }
    }

    pub fn reward_token_contract(&self) -> Address {
        parse_address(&self.reward_token_contract, "reward_token_contract")
    }

    pub fn staked_token_contract(&self) -> Address {
        parse_address(&self.staked_token_contract, "staked_token_contract")
    }

    pub fn governance_token_contract(&self) -> Address {
        parse_address(&self.governance_token_contract, "governance_token_contract")
    }

    pub fn distributor_fallback_address(&self) -> Address {
        parse_address(
            &self.distributor_fallback_address,
            "distributor_fallback_address",
        )
    }

    pub fn protocol_operator_address(&self) -> Address {
        parse_address(&self.protocol_operator_address, "protocol_operator_address")
    }

    pub fn health_addr(&self) -> Option<SocketAddr> {
        self.health_addr
            .as_ref()
            .map(|addr| addr.parse().expect("invalid health endpoint address"))
    }
}

fn parse_urls(raw: &str, name: &str) -> Vec<Url> {
    let urls: Vec<Url> = raw
        .split(',')
        .map(str::trim)
        .filter(|part| !part.is_empty())
        .map(|part| {
            part.parse()
                .unwrap_or_else(|_| panic!("invalid url in {name}: {part}"))
        })
        .collect();
    assert!(!urls.is_empty(), "{name} must not be empty");
    urls
}

fn parse_address(raw: &str, name: &str) -> Address {
    raw.parse()
        .unwrap_or_else(|_| panic!("invalid address in {name}: {raw}"))
}

fn default_log() -> String {
    "stakepool_oracle=info,stakepool_common=info".to_string()
}

fn default_network() -> String {
    "mainnet".to_string()
}

fn default_process_interval() -> u64 {
    180
}

fn default_confirmation_blocks() -> u64 {
    15
}

fn default_sync_period() -> u64 {
    86_400
}

fn default_slots_per_epoch() -> u64 {
    32
}

fn default_seconds_per_slot() -> u64 {
    12
}

fn default_deposit_token_symbol() -> String {
    "ETH".to_string()
}

fn default_beacon_flavor() -> String {
    "lighthouse".to_string()
}

fn default_validators_batch_size() -> u64 {
    10
}

fn default_operator_weight_first() -> usize {
    3
}

fn default_operator_weight_second() -> usize {
    2
}

fn default_operator_weight_others() -> usize {
    1
}
