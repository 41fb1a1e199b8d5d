use alloy_primitives::Address;
use alloy_signer_local::PrivateKeySigner;
use clap::Parser;
use config::{Config, Environment, File};
use serde::{Deserialize, Serialize};
use std::{net::SocketAddr, path::PathBuf, time::Duration};
use url::Url;

#[derive(Debug, Parser)]
#[command(
    term_width = 0,
    name = "Stakepool Keeper",
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

    /// Execution-layer JSON-RPC endpoint
    rpc_endpoint: String,

    /// Address of the oracles contract
    oracles_contract: String,

    /// Hex-encoded secp256k1 private key paying for submissions
    keeper_private_key: String,

    /// Seconds between ticks
    #[serde(default = "default_process_interval")]
    process_interval: u64,

    /// Confirmation depth for submitted transactions
    #[serde(default = "default_confirmation_blocks")]
    pub confirmation_blocks: u64,

    #[serde(default = "default_seconds_per_block")]
    pub seconds_per_block: u64,

    /// Seconds to wait for a transaction receipt
    #[serde(default = "default_transaction_timeout")]
    transaction_timeout: u64,

    /// Cap on the node's priority fee estimate, wei
    #[serde(default = "default_max_priority_fee_cap")]
    max_priority_fee_cap: String,

    /// Floor for the escalated priority fee, wei
    min_effective_priority_fee: Option<String>,

    /// Vote publication bucket (read side)
    pub aws_bucket: String,
    pub aws_region: String,
    pub s3_endpoint: Option<String>,

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
                Environment::with_prefix("KEEPER")
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()
            .and_then(|config| config.try_deserialize())
    }

    pub fn rpc_endpoint(&self) -> Url {
        self.rpc_endpoint.parse().expect("invalid rpc endpoint")
    }

    pub fn oracles_contract(&self) -> Address {
        self.oracles_contract
            .parse()
            .expect("invalid oracles contract address")
    }

    pub fn signer(&self) -> PrivateKeySigner {
        self.keeper_private_key
            .trim_start_matches("0x")
            .parse()
            .expect("invalid keeper private key")
    }

    pub fn process_interval(&self) -> Duration {
        Duration::from_secs(self.process_interval)
    }

    pub fn transaction_timeout(&self) -> Duration {
        Duration::from_secs(self.transaction_timeout)
    }

    pub fn max_priority_fee_cap(&self) -> u128 {
        self.max_priority_fee_cap
            .parse()
            .expect("invalid max priority fee cap")
    }

    pub fn min_effective_priority_fee(&self) -> Option<u128> {
        self.min_effective_priority_fee
            .as_ref()
            .map(|fee| fee.parse().expect("invalid minimum effective priority fee"))
    }

    pub fn health_addr(&self) -> Option<SocketAddr> {
        self.health_addr
            .as_ref()
            .map(|addr| addr.parse().expect("invalid health endpoint address"))
    }
}

fn default_log() -> String {
    "stakepool_keeper=info,stakepool_common=info".to_string()
}

fn default_network() -> String {
    "mainnet".to_string()
}

fn default_process_interval() -> u64 {
    30
}

fn default_confirmation_blocks() -> u64 {
    15
}

fn default_seconds_per_block() -> u64 {
    12
}

fn default_transaction_timeout() -> u64 {
    900
}

fn default_max_priority_fee_cap() -> String {
    // 100 gwei
    "100000000000".to_string()
}
