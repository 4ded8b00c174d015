// Copyright (c) Starcoin, Inc.
// SPDX-License-Identifier: Apache-2.0

//! Outbound transfers from payment accounts: merchant forwards, same-nonce
//! replacements and (through [`crate::earnings`]) treasury sweeps.
//!
//! After every submission the account's nonce moves past the submitted one
//! and its `remainder` is re-derived, so the persisted account always tells
//! how much of the address balance belongs to the platform.

use std::sync::Arc;
use std::time::Duration;

use ethers::types::{Address as EthAddress, H256, U256};
use tracing::{info, warn};

use crate::amount::{forward_amounts, network_fee, ForwardAmounts};
use crate::crypto::{sign_transfer, KeyCipher, TransferFees};
use crate::error::{GatewayError, GatewayResult};
use crate::eth_client::ChainClient;
use crate::metrics::GatewayMetrics;
use crate::storage::AccountRepository;
use crate::types::{Account, NetworkMode, Payment, TxReceipt};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SentTransfer {
    pub hash: H256,
    pub nonce: u64,
    pub value: U256,
    /// `None` when the transaction was not mined within the timeout.
    pub receipt: Option<TxReceipt>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ForwardOutcome {
    pub amounts: ForwardAmounts,
    pub transfer: SentTransfer,
}

pub struct Forwarder {
    mode: NetworkMode,
    chain_id: u64,
    client: Arc<dyn ChainClient>,
    accounts: Arc<dyn AccountRepository>,
    cipher: Arc<KeyCipher>,
    metrics: Arc<GatewayMetrics>,
    gas_price_override: Option<U256>,
    mined_timeout: Duration,
}

impl Forwarder {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        mode: NetworkMode,
        chain_id: u64,
        client: Arc<dyn ChainClient>,
        accounts: Arc<dyn AccountRepository>,
        cipher: Arc<KeyCipher>,
        metrics: Arc<GatewayMetrics>,
        gas_price_override: Option<U256>,
        mined_timeout: Duration,
    ) -> Self {
        Self {
            mode,
            chain_id,
            client,
            accounts,
            cipher,
            metrics,
            gas_price_override,
            mined_timeout,
        }
    }

    pub async fn gas_price(&self) -> GatewayResult<U256> {
        match self.gas_price_override {
            Some(price) => Ok(price),
            None => self.client.suggest_gas_price().await,
        }
    }

    pub async fn transfer_fees(&self, gas_price: U256) -> GatewayResult<TransferFees> {
        let tip_cap = self.client.suggest_gas_tip_cap().await?;
        Ok(TransferFees::new(gas_price, tip_cap))
    }

    /// Sends the merchant's share of `payment` and records the forwarding
    /// references on it. The caller persists the payment.
    pub async fn forward(
        &self,
        payment: &mut Payment,
        earnings_percent: u64,
    ) -> GatewayResult<ForwardOutcome> {
        let gas_price = self.gas_price().await?;
        // Nothing is signed unless the merchant gets a positive amount.
        let amounts = forward_amounts(payment.pay_amount(), gas_price, earnings_percent)?;
        let fees = self.transfer_fees(gas_price).await?;
        let merchant = payment.merchant_wallet;
        let transfer = self
            .send_from_account(&mut payment.account, merchant, amounts.net_amount, fees, None)
            .await
            .inspect_err(|_| {
                self.metrics
                    .forward_failures
                    .with_label_values(&[&self.mode.to_string()])
                    .inc()
            })?;

        payment.forwarding_tx_hash = Some(transfer.hash);
        payment.forwarding_nonce = Some(transfer.nonce);
        payment.forwarding_amount = Some(amounts.net_amount);
        payment.forwarding_block_nr = transfer.receipt.map(|r| r.block_number);
        self.metrics
            .forwards_submitted
            .with_label_values(&[&self.mode.to_string()])
            .inc();
        info!(
            "[{}] Payment {} forwarded {} wei to {:?} (fee {}, earnings {}) in tx {:?}",
            self.mode,
            payment.id,
            amounts.net_amount,
            merchant,
            amounts.network_fee,
            amounts.platform_earnings,
            transfer.hash
        );
        Ok(ForwardOutcome { amounts, transfer })
    }

    /// Re-sends a vanished forward with its original nonce and value and
    /// bumped fees, so at most one of the two can ever be mined. A
    /// `NonceTooLow` error means the original was mined after all.
    pub async fn replace_forward(&self, payment: &mut Payment) -> GatewayResult<SentTransfer> {
        let (Some(nonce), Some(value)) = (payment.forwarding_nonce, payment.forwarding_amount)
        else {
            return Err(GatewayError::InternalError(format!(
                "payment {} has no forward to replace",
                payment.id
            )));
        };
        let gas_price = self.gas_price().await?;
        let fees = self.transfer_fees(gas_price).await?.bumped();
        let merchant = payment.merchant_wallet;
        let transfer = self
            .send_from_account(&mut payment.account, merchant, value, fees, Some(nonce))
            .await?;
        warn!(
            "[{}] Payment {} replaced forwarding tx {:?} with {:?} (nonce {})",
            self.mode, payment.id, payment.forwarding_tx_hash, transfer.hash, nonce
        );
        payment.forwarding_tx_hash = Some(transfer.hash);
        payment.forwarding_block_nr = transfer.receipt.map(|r| r.block_number);
        self.metrics
            .forwards_submitted
            .with_label_values(&[&self.mode.to_string()])
            .inc();
        Ok(transfer)
    }

    /// Signs and submits a transfer from `account`, then waits for it to be
    /// mined and refreshes `nonce` and `remainder`.
    ///
    /// With `replace_nonce` unset the account's own nonce is used and a
    /// single nonce-too-low rejection is answered by refreshing the pending
    /// nonce from the chain and retrying once.
    pub(crate) async fn send_from_account(
        &self,
        account: &mut Account,
        to: EthAddress,
        value: U256,
        fees: TransferFees,
        replace_nonce: Option<u64>,
    ) -> GatewayResult<SentTransfer> {
        let wallet = self
            .cipher
            .open_wallet(&account.encrypted_private_key, account.address, self.chain_id)?;
        let balance_before = self.client.balance_at(account.address).await?;

        let mut nonce = replace_nonce.unwrap_or(account.nonce);
        let mut refreshed = replace_nonce.is_some();
        let signed = loop {
            let signed = sign_transfer(&wallet, to, value, nonce, fees)?;
            match self.client.send_raw_transaction(&signed).await {
                Ok(()) => break signed,
                Err(GatewayError::NonceTooLow(msg)) if !refreshed => {
                    refreshed = true;
                    let pending = self.client.pending_nonce_at(account.address).await?;
                    warn!(
                        "[{}] Nonce {} of {:?} is stale ({}), retrying with {}",
                        self.mode, nonce, account.address, msg, pending
                    );
                    self.metrics
                        .nonce_refreshes
                        .with_label_values(&[&self.mode.to_string()])
                        .inc();
                    account.nonce = pending;
                    self.accounts.update_account(account).await?;
                    nonce = pending;
                }
                Err(e) => return Err(e),
            }
        };
        account.nonce = account.nonce.max(signed.nonce + 1);

        let receipt = match self.client.wait_for_mined(signed.hash, self.mined_timeout).await {
            Ok(receipt) => receipt,
            Err(e) => {
                warn!(
                    "[{}] Could not follow tx {:?}: {}",
                    self.mode, signed.hash, e
                );
                None
            }
        };
        // What stays on the address once the transfer and its worst-case fee are gone.
        let expected_left = balance_before
            .saturating_sub(value)
            .saturating_sub(network_fee(fees.max_fee_per_gas));
        account.remainder = match receipt {
            Some(r) if r.success => match self.client.balance_at(account.address).await {
                Ok(balance) => balance,
                Err(e) => {
                    warn!(
                        "[{}] Balance refresh of {:?} failed, estimating remainder: {}",
                        self.mode, account.address, e
                    );
                    expected_left
                }
            },
            // A reverted transfer moved no value.
            Some(_) => account.remainder,
            None => expected_left,
        };

        Ok(SentTransfer {
            hash: signed.hash,
            nonce: signed.nonce,
            value,
            receipt,
        })
    }
}
