// Copyright (c) Starcoin, Inc.
// SPDX-License-Identifier: Apache-2.0

use std::collections::BTreeMap;
use std::str::FromStr;
use std::time::Duration;

use anyhow::anyhow;
use ethers::types::{Address as EthAddress, U256};
use ethgate_config::Config;
use ethgate_pg_db::DbArgs;
use serde::{Deserialize, Serialize};
use serde_with::serde_as;
use tracing::info;
use url::Url;

use crate::confirmation::ConfirmationConfig;
use crate::types::NetworkMode;

/// Environment variable that takes precedence over `private-key-secret`.
pub const PRIVATE_KEY_SECRET_ENV: &str = "PRIVATE_KEY_SECRET";

#[serde_as]
#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case")]
pub struct ChainConfig {
    // Rpc url of the Ethereum node serving this mode.
    pub rpc_url: String,
    // Chain id the node must report, checked on connect.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expected_chain_id: Option<u64>,
    // Fixed gas price in wei, used instead of the node's suggestion (dev chains).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gas_price_override: Option<u64>,
    #[serde(default = "default_incoming_confirmations")]
    pub incoming_confirmations: u64,
    #[serde(default = "default_outgoing_confirmations")]
    pub outgoing_confirmations: u64,
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    #[serde(default = "default_mined_timeout_secs")]
    pub mined_timeout_secs: u64,
}

#[serde_as]
#[derive(Debug, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case")]
pub struct GatewayNodeConfig {
    // The port that the HTTP server listens on.
    pub server_listen_port: u16,
    pub database_url: String,
    #[serde(flatten)]
    pub db: DbArgs,
    pub chains: BTreeMap<NetworkMode, ChainConfig>,
    // Platform cut of every payment, in percent.
    #[serde(default = "default_earnings_percent")]
    pub earnings_percent: u64,
    // Sweep once the remainder is worth this many transfer fees.
    #[serde(default = "default_fee_factor")]
    pub fee_factor: u64,
    pub treasury_wallet: String,
    #[serde(default = "default_payment_timeout_secs")]
    pub payment_timeout_secs: u64,
    // Encrypts account keys at rest. Prefer the environment variable.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub private_key_secret: String,
    pub price_service_url: String,
    pub webhook_url: String,
}

impl Config for GatewayNodeConfig {}

fn default_incoming_confirmations() -> u64 {
    ConfirmationConfig::mainnet().incoming_confirmations
}

fn default_outgoing_confirmations() -> u64 {
    ConfirmationConfig::mainnet().outgoing_confirmations
}

fn default_poll_interval_ms() -> u64 {
    2_000
}

fn default_mined_timeout_secs() -> u64 {
    120
}

fn default_earnings_percent() -> u64 {
    1
}

fn default_fee_factor() -> u64 {
    100
}

fn default_payment_timeout_secs() -> u64 {
    15 * 60
}

/// Resolved per-chain settings.
#[derive(Clone, Debug, PartialEq)]
pub struct ChainSettings {
    pub rpc_url: Url,
    pub expected_chain_id: Option<u64>,
    pub gas_price_override: Option<U256>,
    pub confirmations: ConfirmationConfig,
    pub poll_interval: Duration,
    pub mined_timeout: Duration,
}

/// Validated settings shared by the engine components.
#[derive(Clone, Debug, PartialEq)]
pub struct EngineSettings {
    pub earnings_percent: u64,
    pub fee_factor: u64,
    pub treasury_wallet: EthAddress,
    pub payment_timeout: Duration,
    pub chains: BTreeMap<NetworkMode, ChainSettings>,
}

impl GatewayNodeConfig {
    pub fn validate(&self) -> anyhow::Result<EngineSettings> {
        info!("Starting config validation");
        if self.earnings_percent >= 100 {
            return Err(anyhow!(
                "earnings-percent must be below 100, got {}",
                self.earnings_percent
            ));
        }
        if self.fee_factor == 0 {
            return Err(anyhow!("fee-factor must be at least 1"));
        }
        if self.chains.is_empty() {
            return Err(anyhow!("at least one chain must be configured"));
        }
        if self.private_key_secret().is_empty() {
            return Err(anyhow!(
                "private-key-secret is empty and {} is not set",
                PRIVATE_KEY_SECRET_ENV
            ));
        }
        let treasury_wallet = EthAddress::from_str(&self.treasury_wallet)
            .map_err(|e| anyhow!("Invalid treasury-wallet {}: {}", self.treasury_wallet, e))?;
        for (name, url) in [
            ("database-url", &self.database_url),
            ("price-service-url", &self.price_service_url),
            ("webhook-url", &self.webhook_url),
        ] {
            Url::parse(url).map_err(|e| anyhow!("Invalid {} {}: {}", name, url, e))?;
        }

        let mut chains = BTreeMap::new();
        for (mode, chain) in &self.chains {
            let rpc_url = Url::parse(&chain.rpc_url)
                .map_err(|e| anyhow!("[{}] Invalid rpc-url {}: {}", mode, chain.rpc_url, e))?;
            if chain.incoming_confirmations == 0 || chain.outgoing_confirmations == 0 {
                return Err(anyhow!("[{}] confirmations must be at least 1", mode));
            }
            chains.insert(
                *mode,
                ChainSettings {
                    rpc_url,
                    expected_chain_id: chain.expected_chain_id,
                    gas_price_override: chain.gas_price_override.map(U256::from),
                    confirmations: ConfirmationConfig::default()
                        .with_incoming_confirmations(chain.incoming_confirmations)
                        .with_outgoing_confirmations(chain.outgoing_confirmations),
                    poll_interval: Duration::from_millis(chain.poll_interval_ms),
                    mined_timeout: Duration::from_secs(chain.mined_timeout_secs),
                },
            );
        }

        info!("Config validation complete");
        Ok(EngineSettings {
            earnings_percent: self.earnings_percent,
            fee_factor: self.fee_factor,
            treasury_wallet,
            payment_timeout: Duration::from_secs(self.payment_timeout_secs),
            chains,
        })
    }

    /// The account key secret, taken from the environment when set there.
    pub fn private_key_secret(&self) -> String {
        secret_with_override(
            &self.private_key_secret,
            std::env::var(PRIVATE_KEY_SECRET_ENV).ok(),
        )
    }
}

fn secret_with_override(configured: &str, env_value: Option<String>) -> String {
    env_value
        .filter(|s| !s.is_empty())
        .unwrap_or_else(|| configured.to_string())
}
