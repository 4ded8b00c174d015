// Copyright (c) Starcoin, Inc.
// SPDX-License-Identifier: Apache-2.0

use std::sync::Arc;

use ethers::types::{Address as EthAddress, H256};
use tracing::{debug, info};

use crate::amount::{network_fee, sweep_threshold};
use crate::error::GatewayResult;
use crate::forwarder::Forwarder;
use crate::metrics::GatewayMetrics;
use crate::storage::AccountRepository;
use crate::types::{Account, NetworkMode};

/// Flushes platform earnings that piled up on an account to the treasury
/// once they are worth `fee_factor` transfer fees.
pub struct EarningsAggregator {
    mode: NetworkMode,
    forwarder: Arc<Forwarder>,
    accounts: Arc<dyn AccountRepository>,
    metrics: Arc<GatewayMetrics>,
    treasury_wallet: EthAddress,
    fee_factor: u64,
}

impl EarningsAggregator {
    pub fn new(
        mode: NetworkMode,
        forwarder: Arc<Forwarder>,
        accounts: Arc<dyn AccountRepository>,
        metrics: Arc<GatewayMetrics>,
        treasury_wallet: EthAddress,
        fee_factor: u64,
    ) -> Self {
        Self {
            mode,
            forwarder,
            accounts,
            metrics,
            treasury_wallet,
            fee_factor,
        }
    }

    /// Sweeps `remainder - fee` to the treasury if the remainder reached the
    /// threshold. Returns the sweep transaction hash, `None` if nothing was
    /// due. The updated account is persisted.
    pub async fn sweep_earnings(&self, account: &mut Account) -> GatewayResult<Option<H256>> {
        let gas_price = self.forwarder.gas_price().await?;
        let threshold = sweep_threshold(gas_price, self.fee_factor);
        if account.remainder < threshold {
            debug!(
                "[{}] Account {:?} remainder {} below sweep threshold {}",
                self.mode, account.address, account.remainder, threshold
            );
            return Ok(None);
        }

        let value = account.remainder.saturating_sub(network_fee(gas_price));
        let fees = self.forwarder.transfer_fees(gas_price).await?;
        let swept = account.remainder;
        let transfer = self
            .forwarder
            .send_from_account(account, self.treasury_wallet, value, fees, None)
            .await?;
        self.accounts.update_account(account).await?;
        self.metrics
            .sweeps_submitted
            .with_label_values(&[&self.mode.to_string()])
            .inc();
        info!(
            "[{}] Swept {} of {} wei from {:?} to treasury {:?} in tx {:?}",
            self.mode, value, swept, account.address, self.treasury_wallet, transfer.hash
        );
        Ok(Some(transfer.hash))
    }
}
