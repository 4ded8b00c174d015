// Copyright (c) Starcoin, Inc.
// SPDX-License-Identifier: Apache-2.0

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use ethers::types::{Address as EthAddress, H256, U256};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::ChainContext;
use crate::account_pool::AccountPool;
use crate::amount::{check_amount_not_too_low, eth_to_wei_ceil, network_fee};
use crate::config::EngineSettings;
use crate::confirmation::{IncomingVerdict, OutgoingVerdict};
use crate::crypto::TransferFees;
use crate::error::{GatewayError, GatewayResult};
use crate::metrics::GatewayMetrics;
use crate::notifier::{PaymentNotifier, PaymentUpdate};
use crate::price::PriceOracle;
use crate::storage::{AccountRepository, PaymentRepository};
use crate::types::{BlockRef, ChainBlock, NetworkMode, Payment, PaymentStatus};

/// Reloads tolerated while one block's deposit races other evaluations.
const MAX_DEPOSIT_ATTEMPTS: usize = 8;

pub struct PaymentEngine {
    settings: EngineSettings,
    chains: HashMap<NetworkMode, Arc<ChainContext>>,
    payments: Arc<dyn PaymentRepository>,
    accounts: Arc<dyn AccountRepository>,
    pool: AccountPool,
    price_oracle: Arc<dyn PriceOracle>,
    notifier: Arc<dyn PaymentNotifier>,
    metrics: Arc<GatewayMetrics>,
}

impl PaymentEngine {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        settings: EngineSettings,
        chains: Vec<ChainContext>,
        payments: Arc<dyn PaymentRepository>,
        accounts: Arc<dyn AccountRepository>,
        pool: AccountPool,
        price_oracle: Arc<dyn PriceOracle>,
        notifier: Arc<dyn PaymentNotifier>,
        metrics: Arc<GatewayMetrics>,
    ) -> Self {
        let chains = chains
            .into_iter()
            .map(|ctx| (ctx.mode, Arc::new(ctx)))
            .collect();
        Self {
            settings,
            chains,
            payments,
            accounts,
            pool,
            price_oracle,
            notifier,
            metrics,
        }
    }

    pub fn payment_timeout(&self) -> Duration {
        self.settings.payment_timeout
    }

    pub fn modes(&self) -> Vec<NetworkMode> {
        let mut modes: Vec<_> = self.chains.keys().copied().collect();
        modes.sort();
        modes
    }

    fn chain(&self, mode: NetworkMode) -> GatewayResult<Arc<ChainContext>> {
        self.chains
            .get(&mode)
            .cloned()
            .ok_or_else(|| GatewayError::ConfigError(format!("no chain configured for {}", mode)))
    }

    /// Quotes `price_amount` of `price_currency` in wei, claims an account and
    /// persists a `Waiting` payment for it.
    pub async fn create_payment(
        &self,
        mode: NetworkMode,
        price_amount: f64,
        price_currency: &str,
        merchant_wallet: EthAddress,
    ) -> GatewayResult<Payment> {
        let ctx = self.chain(mode)?;
        if merchant_wallet.is_zero() {
            return Err(GatewayError::InvalidAddress(
                "merchant wallet is the zero address".to_string(),
            ));
        }
        if !price_amount.is_finite() || price_amount <= 0.0 {
            return Err(GatewayError::AmountTooLow(format!(
                "price amount {} is not positive",
                price_amount
            )));
        }

        let native = self
            .price_oracle
            .to_native(price_amount, price_currency)
            .await?;
        let pay_amount = eth_to_wei_ceil(native)?;
        let gas_price = ctx.forwarder.gas_price().await?;
        check_amount_not_too_low(pay_amount, gas_price)?;

        let mut account = self.pool.allocate(mode).await?;
        let payment = Payment::new(
            mode,
            merchant_wallet,
            price_amount,
            price_currency,
            account.clone(),
            pay_amount,
        );
        if let Err(e) = self.payments.create_payment(&payment).await {
            error!("[{}] Failed to store new payment: {}", mode, e);
            if let Err(release_err) = self.pool.release(&mut account).await {
                error!(
                    "[{}] Failed to release account {:?}: {}",
                    mode, account.address, release_err
                );
            }
            return Err(e);
        }

        self.metrics
            .payments_created
            .with_label_values(&[&mode.to_string()])
            .inc();
        info!(
            "[{}] Created payment {} for {} {} = {} wei to {:?}, deposit address {:?}",
            mode,
            payment.id,
            price_amount,
            price_currency,
            pay_amount,
            merchant_wallet,
            payment.account.address
        );
        Ok(payment)
    }

    /// Dispatches one task per payment of `mode` that `block` may move on.
    /// Returns the task handles; callers are free to detach them.
    pub async fn on_new_block(
        self: &Arc<Self>,
        mode: NetworkMode,
        block: &ChainBlock,
    ) -> GatewayResult<Vec<JoinHandle<()>>> {
        let ctx = self.chain(mode)?;
        self.metrics
            .last_processed_block
            .with_label_values(&[&mode.to_string()])
            .set(block.number as i64);
        let head = block.block_ref();

        let open = self.payments.get_open_payments(mode).await?;
        let confirming = self.payments.get_confirming_payments(mode).await?;
        let finishing = self.payments.get_finishing_payments(mode).await?;
        debug!(
            "[{}] Block {}: {} open, {} confirming, {} finishing payments",
            mode,
            block.number,
            open.len(),
            confirming.len(),
            finishing.len()
        );

        let mut handles = Vec::with_capacity(open.len() + confirming.len() + finishing.len());
        for payment in open {
            let received = block.received_by(payment.account.address);
            let engine = self.clone();
            let ctx = ctx.clone();
            handles.push(self.spawn_evaluation(mode, payment.id, async move {
                match received {
                    Some(value) => engine.apply_deposit(&ctx, payment, value, head).await,
                    None => engine.check_expiry(&ctx, payment, head).await,
                }
            }));
        }
        self.spawn_confirmations(&ctx, confirming, finishing, head, &mut handles);
        Ok(handles)
    }

    /// Start-up pass over a mode: re-reads every open payment against the
    /// live balance, since blocks missed while down are not replayed, and
    /// runs one round of confirmation checks.
    pub async fn recover(self: &Arc<Self>, mode: NetworkMode) -> GatewayResult<()> {
        let ctx = self.chain(mode)?;
        let released = self.payments.reset_forward_claims(mode).await?;
        if released > 0 {
            warn!("[{}] Released {} stale forward claims", mode, released);
        }

        let number = ctx.client.latest_block_number().await?;
        let head = ctx
            .client
            .block_by_number(number)
            .await?
            .ok_or_else(|| GatewayError::BlockNotFound(format!("head block {}", number)))?
            .block_ref();

        let open = self.payments.get_open_payments(mode).await?;
        info!(
            "[{}] Recovering {} open payments at block {}",
            mode,
            open.len(),
            head.number
        );
        for payment in open {
            let id = payment.id;
            let result = async {
                let balance = ctx.client.balance_at(payment.account.address).await?;
                let available = balance.saturating_sub(payment.account.remainder);
                self.evaluate_deposit(&ctx, payment, available, head)
                    .await
                    .map(|_| ())
            }
            .await;
            if let Err(e) = result {
                self.metrics.errors.with_label_values(&[e.error_type()]).inc();
                warn!("[{}] Recovery of payment {} failed: {}", mode, id, e);
            }
        }

        let confirming = self.payments.get_confirming_payments(mode).await?;
        let finishing = self.payments.get_finishing_payments(mode).await?;
        let mut handles = Vec::new();
        self.spawn_confirmations(&ctx, confirming, finishing, head, &mut handles);
        futures::future::join_all(handles).await;
        info!("[{}] Recovery complete", mode);
        Ok(())
    }

    fn spawn_confirmations(
        self: &Arc<Self>,
        ctx: &Arc<ChainContext>,
        confirming: Vec<Payment>,
        finishing: Vec<Payment>,
        head: BlockRef,
        handles: &mut Vec<JoinHandle<()>>,
    ) {
        for payment in confirming {
            let engine = self.clone();
            let ctx = ctx.clone();
            handles.push(self.spawn_evaluation(ctx.mode, payment.id, async move {
                match payment.status() {
                    PaymentStatus::Paid => engine.check_incoming(&ctx, payment, head).await,
                    PaymentStatus::Confirmed => engine.forward_confirmed(&ctx, payment).await,
                    _ => Ok(()),
                }
            }));
        }
        for payment in finishing {
            let engine = self.clone();
            let ctx = ctx.clone();
            handles.push(self.spawn_evaluation(ctx.mode, payment.id, async move {
                engine.check_outgoing(&ctx, payment, head).await
            }));
        }
    }

    fn spawn_evaluation<F>(
        &self,
        mode: NetworkMode,
        payment_id: Uuid,
        evaluation: F,
    ) -> JoinHandle<()>
    where
        F: Future<Output = GatewayResult<()>> + Send + 'static,
    {
        let metrics = self.metrics.clone();
        tokio::spawn(async move {
            if let Err(e) = evaluation.await {
                metrics.errors.with_label_values(&[e.error_type()]).inc();
                if e.is_transient() {
                    warn!("[{}] Payment {} retried next block: {}", mode, payment_id, e);
                } else {
                    error!("[{}] Payment {} evaluation failed: {}", mode, payment_id, e);
                }
            }
        })
    }

    /// Adds `value`, paid to the account in `block`, to an open payment.
    /// Evaluations of consecutive blocks may overlap; when another one wrote
    /// first, the payment is reloaded and the value applied on top of it.
    async fn apply_deposit(
        &self,
        ctx: &ChainContext,
        mut payment: Payment,
        value: U256,
        block: BlockRef,
    ) -> GatewayResult<()> {
        for _ in 0..MAX_DEPOSIT_ATTEMPTS {
            let observed = payment.amount_received().saturating_add(value);
            if self
                .evaluate_deposit(ctx, payment.clone(), observed, block)
                .await?
            {
                return Ok(());
            }
            payment = match self.payments.get_payment(payment.id).await? {
                Some(fresh) if fresh.status().is_open() => fresh,
                _ => return Ok(()),
            };
            debug!(
                "[{}] Re-applying {} wei from block {} to payment {}",
                ctx.mode, value, block.number, payment.id
            );
        }
        Err(GatewayError::StorageError(format!(
            "payment {} kept changing while applying block {}",
            payment.id, block.number
        )))
    }

    /// Applies a newly observed received amount to an open payment. Returns
    /// `false` if a concurrent evaluation moved the payment on first.
    async fn evaluate_deposit(
        &self,
        ctx: &ChainContext,
        mut payment: Payment,
        observed: U256,
        block: BlockRef,
    ) -> GatewayResult<bool> {
        if !payment.status().is_open() {
            return Ok(true);
        }
        if observed >= payment.pay_amount() {
            payment.last_receiving_block_nr = Some(block.number);
            payment.last_receiving_block_hash = Some(block.hash);
            self.transition(&mut payment, PaymentStatus::Paid, observed)
                .await
        } else if observed > payment.amount_received() {
            self.transition(&mut payment, PaymentStatus::PartiallyPaid, observed)
                .await
        } else {
            self.check_expiry(ctx, payment, block).await?;
            Ok(true)
        }
    }

    /// Expires an open payment past its deadline, unless the live balance
    /// shows it was paid after all.
    async fn check_expiry(
        &self,
        ctx: &ChainContext,
        mut payment: Payment,
        head: BlockRef,
    ) -> GatewayResult<()> {
        if !payment.is_expired(self.settings.payment_timeout, Utc::now()) {
            return Ok(());
        }
        let balance = ctx.client.balance_at(payment.account.address).await?;
        let available = balance.saturating_sub(payment.account.remainder);
        if available >= payment.pay_amount() {
            info!(
                "[{}] Payment {} reached its deadline fully paid ({} wei)",
                ctx.mode, payment.id, available
            );
            payment.last_receiving_block_nr = Some(head.number);
            payment.last_receiving_block_hash = Some(head.hash);
            self.transition(&mut payment, PaymentStatus::Paid, available)
                .await?;
            return Ok(());
        }
        // Whatever arrived stays on the account as platform funds.
        payment.account.remainder = balance;
        let received = payment.amount_received().max(available);
        self.transition(&mut payment, PaymentStatus::Expired, received)
            .await?;
        Ok(())
    }

    async fn check_incoming(
        &self,
        ctx: &ChainContext,
        mut payment: Payment,
        head: BlockRef,
    ) -> GatewayResult<()> {
        let anchor = match (
            payment.last_receiving_block_nr,
            payment.last_receiving_block_hash,
        ) {
            (Some(number), Some(hash)) => Some(BlockRef { number, hash }),
            _ => None,
        };
        let verdict = match anchor {
            Some(anchor) => ctx.tracker.check_incoming(anchor, head.number).await?,
            None => IncomingVerdict::Reorged,
        };
        match verdict {
            IncomingVerdict::Pending { .. } => Ok(()),
            IncomingVerdict::Confirmed => {
                let received = payment.amount_received();
                if self
                    .transition(&mut payment, PaymentStatus::Confirmed, received)
                    .await?
                {
                    self.forward_confirmed(ctx, payment).await?;
                }
                Ok(())
            }
            IncomingVerdict::Reorged => {
                self.metrics
                    .reorgs_detected
                    .with_label_values(&[&ctx.mode.to_string(), "incoming"])
                    .inc();
                let balance = ctx.client.balance_at(payment.account.address).await?;
                let available = balance.saturating_sub(payment.account.remainder);
                if available >= payment.pay_amount() {
                    warn!(
                        "[{}] Deposit block of payment {} is gone, funds still present, re-anchoring at {}",
                        ctx.mode, payment.id, head.number
                    );
                    payment.last_receiving_block_nr = Some(head.number);
                    payment.last_receiving_block_hash = Some(head.hash);
                    self.payments.update_chain_refs(&payment).await
                } else {
                    warn!(
                        "[{}] Deposit of payment {} was reorged away, {} of {} wei left",
                        ctx.mode,
                        payment.id,
                        available,
                        payment.pay_amount()
                    );
                    payment.account.remainder = balance;
                    self.transition(&mut payment, PaymentStatus::Failed, available)
                        .await?;
                    Ok(())
                }
            }
        }
    }

    /// Sends the merchant's share of a `Confirmed` payment, at most once.
    async fn forward_confirmed(&self, ctx: &ChainContext, payment: Payment) -> GatewayResult<()> {
        if payment.status() != PaymentStatus::Confirmed {
            return Ok(());
        }
        if !self
            .payments
            .try_begin_forward(payment.id, PaymentStatus::Confirmed)
            .await?
        {
            debug!(
                "[{}] Payment {} is being forwarded elsewhere",
                ctx.mode, payment.id
            );
            return Ok(());
        }
        // Re-read under the claim: an earlier attempt may have sent already.
        let mut payment = match self.payments.get_payment(payment.id).await? {
            Some(fresh) if fresh.status() == PaymentStatus::Confirmed => fresh,
            _ => return self.payments.end_forward(payment.id).await,
        };
        let submitted_before = payment.forwarding_tx_hash;
        let result = match submitted_before {
            Some(hash) => {
                info!(
                    "[{}] Payment {} already sent forwarding tx {:?}, recording it",
                    ctx.mode, payment.id, hash
                );
                let received = payment.amount_received();
                self.transition(&mut payment, PaymentStatus::Forwarded, received)
                    .await
                    .map(|_| ())
            }
            None => self.forward_claimed(ctx, &mut payment).await,
        };
        self.finish_claim(&payment, submitted_before, result).await
    }

    async fn forward_claimed(&self, ctx: &ChainContext, payment: &mut Payment) -> GatewayResult<()> {
        let balance = ctx.client.balance_at(payment.account.address).await?;
        let available = balance.saturating_sub(payment.account.remainder);
        if available < payment.pay_amount() {
            warn!(
                "[{}] Payment {} deposit no longer covered, {} of {} wei on {:?}",
                ctx.mode,
                payment.id,
                available,
                payment.pay_amount(),
                payment.account.address
            );
            payment.account.remainder = balance;
            self.transition(payment, PaymentStatus::Failed, available)
                .await?;
            return Ok(());
        }

        if let Err(e) = ctx
            .forwarder
            .forward(payment, self.settings.earnings_percent)
            .await
        {
            if matches!(e, GatewayError::InsufficientForwardAmount(_)) {
                error!(
                    "[{}] Payment {} cannot be forwarded at a profit, needs manual intervention: {}",
                    ctx.mode, payment.id, e
                );
            }
            return Err(e);
        }

        let received = payment.amount_received();
        if !self
            .transition(payment, PaymentStatus::Forwarded, received)
            .await?
        {
            return Err(GatewayError::InternalError(format!(
                "payment {} left Confirmed while its forward was in flight",
                payment.id
            )));
        }

        if let Err(e) = ctx.earnings.sweep_earnings(&mut payment.account).await {
            warn!(
                "[{}] Earnings sweep from {:?} failed: {}",
                ctx.mode, payment.account.address, e
            );
        }
        Ok(())
    }

    /// Releases the forward claim once the outcome of an attempt is on disk.
    /// A transaction that went out but could not be recorded keeps the claim
    /// so that no second forward is signed for the payment.
    async fn finish_claim(
        &self,
        payment: &Payment,
        submitted_before: Option<H256>,
        result: GatewayResult<()>,
    ) -> GatewayResult<()> {
        if result.is_err() && payment.forwarding_tx_hash != submitted_before {
            if let Err(e) = self.payments.update_chain_refs(payment).await {
                error!(
                    "[{}] Payment {} sent tx {:?} that could not be recorded, holding forward claim: {}",
                    payment.mode, payment.id, payment.forwarding_tx_hash, e
                );
                return result;
            }
        }
        self.payments.end_forward(payment.id).await?;
        result
    }

    async fn check_outgoing(
        &self,
        ctx: &ChainContext,
        mut payment: Payment,
        head: BlockRef,
    ) -> GatewayResult<()> {
        if !self
            .payments
            .try_begin_forward(payment.id, PaymentStatus::Forwarded)
            .await?
        {
            return Ok(());
        }
        let submitted_before = payment.forwarding_tx_hash;
        let result = self.check_outgoing_claimed(ctx, &mut payment, head).await;
        self.finish_claim(&payment, submitted_before, result).await
    }

    async fn check_outgoing_claimed(
        &self,
        ctx: &ChainContext,
        payment: &mut Payment,
        head: BlockRef,
    ) -> GatewayResult<()> {
        let verdict = ctx
            .tracker
            .check_outgoing(payment.forwarding_tx_hash, head.number)
            .await?;
        match verdict {
            OutgoingVerdict::Confirmed { block_number } => {
                if block_number.is_some() {
                    payment.forwarding_block_nr = block_number;
                }
                let received = payment.amount_received();
                self.transition(payment, PaymentStatus::Finished, received)
                    .await?;
                Ok(())
            }
            OutgoingVerdict::Pending { block_number, .. } => {
                if payment.forwarding_block_nr != Some(block_number) {
                    payment.forwarding_block_nr = Some(block_number);
                    self.payments.update_chain_refs(payment).await?;
                }
                Ok(())
            }
            OutgoingVerdict::Reverted { block_number } => {
                self.metrics
                    .forward_failures
                    .with_label_values(&[&ctx.mode.to_string()])
                    .inc();
                warn!(
                    "[{}] Forward of payment {} reverted in block {}",
                    ctx.mode, payment.id, block_number
                );
                self.resend_forward(ctx, payment, false).await
            }
            OutgoingVerdict::Vanished => {
                if let Some(nonce) = payment.forwarding_nonce {
                    let pending = ctx.client.pending_nonce_at(payment.account.address).await?;
                    if pending > nonce {
                        debug!(
                            "[{}] Forward of payment {} not mined yet (nonce {}, pending {})",
                            ctx.mode, payment.id, nonce, pending
                        );
                        return Ok(());
                    }
                }
                self.metrics
                    .reorgs_detected
                    .with_label_values(&[&ctx.mode.to_string(), "outgoing"])
                    .inc();
                self.resend_forward(ctx, payment, true).await
            }
        }
    }

    /// Sends the forward again if the funds are still there, fails the
    /// payment otherwise. With `replace` the original nonce is reused.
    async fn resend_forward(
        &self,
        ctx: &ChainContext,
        payment: &mut Payment,
        replace: bool,
    ) -> GatewayResult<()> {
        let balance = ctx.client.balance_at(payment.account.address).await?;
        let available = balance.saturating_sub(payment.account.remainder);
        let needed = payment
            .forwarding_amount
            .unwrap_or_else(|| payment.pay_amount());
        let gas_price = ctx.forwarder.gas_price().await?;
        let mut fees = TransferFees::new(gas_price, U256::zero());
        if replace {
            fees = fees.bumped();
        }
        // The fee may be paid out of the remainder, the value may not.
        let cost = needed.saturating_add(network_fee(fees.max_fee_per_gas));
        if available < needed || balance < cost {
            warn!(
                "[{}] Payment {} cannot resend its forward, {} of {} wei left (balance {}, cost {})",
                ctx.mode, payment.id, available, needed, balance, cost
            );
            payment.account.remainder = balance;
            self.transition(payment, PaymentStatus::Failed, available)
                .await?;
            return Ok(());
        }

        if replace && payment.forwarding_nonce.is_some() {
            match ctx.forwarder.replace_forward(payment).await {
                Ok(_) => {}
                Err(GatewayError::NonceTooLow(msg)) => {
                    info!(
                        "[{}] Original forward of payment {} was mined after all: {}",
                        ctx.mode, payment.id, msg
                    );
                    return Ok(());
                }
                Err(e) => return Err(e),
            }
        } else {
            ctx.forwarder
                .forward(payment, self.settings.earnings_percent)
                .await?;
        }
        self.payments.update_chain_refs(payment).await?;
        self.accounts.update_account(&payment.account).await
    }

    /// Appends `next` to the payment's history and persists it, provided no
    /// other task moved the payment on first. Terminal states free the
    /// account. Returns whether the transition was persisted.
    async fn transition(
        &self,
        payment: &mut Payment,
        next: PaymentStatus,
        amount_received: U256,
    ) -> GatewayResult<bool> {
        let current = payment.status();
        if !current.can_transition_to(next) {
            return Err(GatewayError::InvalidStateTransition(format!(
                "payment {} cannot move from {} to {}",
                payment.id, current, next
            )));
        }
        let previous_state_id = payment.state.id;
        let previous = payment.advance(next, amount_received);
        if next.is_terminal() {
            payment.account.used = false;
        }
        if !self
            .payments
            .update_payment_state(payment, previous_state_id)
            .await?
        {
            info!(
                "[{}] Payment {} already left {}, dropping move to {}",
                payment.mode, payment.id, previous, next
            );
            return Ok(false);
        }

        self.metrics
            .payment_transitions
            .with_label_values(&[&payment.mode.to_string(), &next.to_string()])
            .inc();
        info!(
            "[{}] Payment {} {} -> {} (received {} of {} wei on {:?})",
            payment.mode,
            payment.id,
            previous,
            next,
            amount_received,
            payment.pay_amount(),
            payment.account.address
        );

        let update = PaymentUpdate::from(&*payment);
        if let Err(e) = self.notifier.notify(&update).await {
            self.metrics.webhook_failures.inc();
            warn!(
                "[{}] Webhook for payment {} ({}) failed: {}",
                payment.mode, payment.id, next, e
            );
        }
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::{init_test_logging, TestGateway};
    use std::str::FromStr;

    #[tokio::test]
    async fn test_create_payment_quotes_and_claims_account() {
        init_test_logging();
        let gw = TestGateway::start().await;
        let payment = gw.create_payment(1.0).await;

        assert_eq!(payment.status(), PaymentStatus::Waiting);
        assert_eq!(payment.pay_amount(), U256::from(100_000_000_000_000u64));
        assert_eq!(payment.amount_received(), U256::zero());
        assert!(payment.account.used);
        assert_eq!(payment.merchant_wallet, TestGateway::merchant());

        let stored = gw.payment(payment.id).await;
        assert_eq!(stored.account.id, payment.account.id);
        assert_eq!(gw.statuses(payment.id).await, vec![PaymentStatus::Waiting]);
    }

    #[tokio::test]
    async fn test_create_payment_rejects_unforwardable_amounts() {
        let gw = TestGateway::start().await;
        // 0.00004 ETH is below the 2 * 21000 * 1 gwei floor
        let err = gw
            .engine
            .create_payment(NetworkMode::Test, 0.4, "EUR", TestGateway::merchant())
            .await
            .unwrap_err();
        assert!(matches!(err, GatewayError::AmountTooLow(_)));
        assert_eq!(gw.store.account_count(), 0);

        let err = gw
            .engine
            .create_payment(NetworkMode::Test, 1.0, "EUR", EthAddress::zero())
            .await
            .unwrap_err();
        assert!(matches!(err, GatewayError::InvalidAddress(_)));

        let err = gw
            .engine
            .create_payment(NetworkMode::Main, 1.0, "EUR", TestGateway::merchant())
            .await
            .unwrap_err();
        assert!(matches!(err, GatewayError::ConfigError(_)));
    }

    #[tokio::test]
    async fn test_partial_deposits_accumulate_until_paid() {
        let gw = TestGateway::start().await;
        let payment = gw.create_payment(1.0).await;
        let address = payment.account.address;

        gw.deposit(address, U256::from(40_000_000_000_000u64)).await;
        let p = gw.payment(payment.id).await;
        assert_eq!(p.status(), PaymentStatus::PartiallyPaid);
        assert_eq!(p.amount_received(), U256::from(40_000_000_000_000u64));

        // exactly the missing amount: the boundary counts as paid
        let block = gw.deposit(address, U256::from(60_000_000_000_000u64)).await;
        let p = gw.payment(payment.id).await;
        assert_eq!(p.status(), PaymentStatus::Paid);
        assert_eq!(p.amount_received(), p.pay_amount());
        assert_eq!(p.last_receiving_block_nr, Some(block.number));
        assert_eq!(p.last_receiving_block_hash, Some(block.hash));

        let history = gw.store.states(payment.id);
        assert!(history.iter().all(|s| s.pay_amount == p.pay_amount()));
        assert_eq!(
            gw.statuses(payment.id).await,
            vec![
                PaymentStatus::Waiting,
                PaymentStatus::PartiallyPaid,
                PaymentStatus::Paid
            ]
        );
        let updates = gw.notifier.updates();
        assert_eq!(updates.len(), 2);
        assert_eq!(updates[1].state, PaymentStatus::Paid);
    }

    #[tokio::test]
    async fn test_deadline_recheck_catches_late_payment() {
        let gw = TestGateway::start().await;
        let payment = gw.create_payment(1.0).await;
        gw.store
            .backdate_payment(payment.id, Duration::from_secs(16 * 60));
        // paid in a block the engine never saw
        gw.client
            .set_balance(payment.account.address, payment.pay_amount());

        gw.advance(1).await;
        let p = gw.payment(payment.id).await;
        assert_eq!(p.status(), PaymentStatus::Paid);
        assert!(p.last_receiving_block_nr.is_some());
    }

    #[tokio::test]
    async fn test_expiry_ignores_previous_remainder() {
        let gw = TestGateway::start().await;
        let payment = gw.create_payment(1.0).await;
        let mut account = payment.account.clone();
        // platform funds of an earlier payment sit on the address
        account.remainder = U256::from(500_000_000_000_000u64);
        gw.store.put_account(account.clone());
        gw.client.set_balance(account.address, account.remainder);
        gw.store
            .backdate_payment(payment.id, Duration::from_secs(16 * 60));

        gw.advance(1).await;
        let p = gw.payment(payment.id).await;
        assert_eq!(p.status(), PaymentStatus::Expired);
        assert_eq!(p.amount_received(), U256::zero());
        assert!(!p.account.used);
        assert_eq!(p.account.remainder, account.remainder);
    }

    #[tokio::test]
    async fn test_stale_transition_is_dropped() {
        let gw = TestGateway::start().await;
        let payment = gw.create_payment(1.0).await;
        let ctx = gw.engine.chain(NetworkMode::Test).unwrap();
        let head = gw.client.mine_empty_blocks(1);

        // two evaluations of the same snapshot race: only one lands
        gw.engine
            .evaluate_deposit(&ctx, payment.clone(), payment.pay_amount(), head)
            .await
            .unwrap();
        gw.engine
            .evaluate_deposit(&ctx, payment.clone(), U256::one(), head)
            .await
            .unwrap();
        assert_eq!(
            gw.statuses(payment.id).await,
            vec![PaymentStatus::Waiting, PaymentStatus::Paid]
        );
        assert_eq!(gw.notifier.updates().len(), 1);
    }

    #[tokio::test]
    async fn test_write_on_replaced_state_with_same_status_is_rejected() {
        let gw = TestGateway::start().await;
        let payment = gw.create_payment(1.0).await;
        gw.deposit(payment.account.address, U256::from(10u64)).await;
        let snapshot = gw.payment(payment.id).await;
        gw.deposit(payment.account.address, U256::from(10u64)).await;
        assert_eq!(
            gw.payment(payment.id).await.amount_received(),
            U256::from(20u64)
        );

        // still PartiallyPaid, but no longer the row the snapshot was read from
        let mut stale = snapshot.clone();
        stale.advance(PaymentStatus::PartiallyPaid, U256::from(15u64));
        assert!(!gw
            .store
            .update_payment_state(&stale, snapshot.state.id)
            .await
            .unwrap());
        assert_eq!(
            gw.payment(payment.id).await.amount_received(),
            U256::from(20u64)
        );
    }

    #[tokio::test]
    async fn test_overlapping_blocks_keep_every_deposit() {
        let gw = TestGateway::start().await;
        let payment = gw.create_payment(1.0).await;
        let address = payment.account.address;
        gw.deposit(address, U256::from(40_000_000_000_000u64)).await;

        // both blocks are dispatched before either evaluation lands
        let a = gw
            .client
            .mine_block(vec![(address, U256::from(30_000_000_000_000u64))]);
        let b = gw
            .client
            .mine_block(vec![(address, U256::from(20_000_000_000_000u64))]);
        let mut handles = gw.engine.on_new_block(NetworkMode::Test, &a).await.unwrap();
        handles.extend(gw.engine.on_new_block(NetworkMode::Test, &b).await.unwrap());
        for handle in handles {
            handle.await.unwrap();
        }

        let p = gw.payment(payment.id).await;
        assert_eq!(p.status(), PaymentStatus::PartiallyPaid);
        assert_eq!(p.amount_received(), U256::from(90_000_000_000_000u64));
        assert_eq!(gw.client.balance(address), p.amount_received());
        let received: Vec<_> = gw
            .store
            .states(payment.id)
            .iter()
            .map(|s| s.amount_received)
            .collect();
        assert!(received.windows(2).all(|w| w[0] <= w[1]), "{:?}", received);
    }

    #[tokio::test]
    async fn test_overlapping_blocks_complete_payment() {
        let gw = TestGateway::start().await;
        let payment = gw.create_payment(1.0).await;
        let address = payment.account.address;
        gw.deposit(address, U256::from(40_000_000_000_000u64)).await;

        let a = gw
            .client
            .mine_block(vec![(address, U256::from(30_000_000_000_000u64))]);
        let b = gw
            .client
            .mine_block(vec![(address, U256::from(30_000_000_000_000u64))]);
        let mut handles = gw.engine.on_new_block(NetworkMode::Test, &a).await.unwrap();
        handles.extend(gw.engine.on_new_block(NetworkMode::Test, &b).await.unwrap());
        for handle in handles {
            handle.await.unwrap();
        }

        let p = gw.payment(payment.id).await;
        assert_eq!(p.status(), PaymentStatus::Paid);
        assert_eq!(p.amount_received(), p.pay_amount());
        assert_eq!(
            gw.statuses(payment.id).await,
            vec![
                PaymentStatus::Waiting,
                PaymentStatus::PartiallyPaid,
                PaymentStatus::PartiallyPaid,
                PaymentStatus::Paid
            ]
        );
    }

    #[tokio::test]
    async fn test_invalid_transition_is_rejected() {
        let gw = TestGateway::start().await;
        let mut payment = gw.create_payment(1.0).await;
        let err = gw
            .engine
            .transition(&mut payment, PaymentStatus::Forwarded, U256::zero())
            .await
            .unwrap_err();
        assert!(matches!(err, GatewayError::InvalidStateTransition(_)));
        assert_eq!(gw.statuses(payment.id).await, vec![PaymentStatus::Waiting]);
    }

    #[tokio::test]
    async fn test_forward_claim_prevents_second_forward() {
        let gw = TestGateway::start().await;
        let payment = gw.create_payment(1.0).await;
        gw.deposit(payment.account.address, payment.pay_amount()).await;
        let ctx = gw.engine.chain(NetworkMode::Test).unwrap();

        let mut confirmed = gw.payment(payment.id).await;
        let received = confirmed.amount_received();
        assert!(gw
            .engine
            .transition(&mut confirmed, PaymentStatus::Confirmed, received)
            .await
            .unwrap());

        // someone else holds the claim
        assert!(gw
            .store
            .try_begin_forward(payment.id, PaymentStatus::Confirmed)
            .await
            .unwrap());
        gw.engine
            .forward_confirmed(&ctx, confirmed.clone())
            .await
            .unwrap();
        assert!(gw.client.sent_transactions().is_empty());

        gw.store.end_forward(payment.id).await.unwrap();
        gw.engine
            .forward_confirmed(&ctx, confirmed.clone())
            .await
            .unwrap();
        // the stale snapshot is still Confirmed, the store is not
        gw.engine.forward_confirmed(&ctx, confirmed).await.unwrap();
        assert_eq!(gw.client.sent_transactions().len(), 1);
        assert_eq!(
            gw.payment(payment.id).await.status(),
            PaymentStatus::Forwarded
        );
    }

    #[tokio::test]
    async fn test_recorded_forward_is_not_sent_again() {
        let gw = TestGateway::start().await;
        let payment = gw.create_payment(1.0).await;
        gw.deposit(payment.account.address, payment.pay_amount()).await;
        let ctx = gw.engine.chain(NetworkMode::Test).unwrap();

        let mut confirmed = gw.payment(payment.id).await;
        let received = confirmed.amount_received();
        gw.engine
            .transition(&mut confirmed, PaymentStatus::Confirmed, received)
            .await
            .unwrap();
        // a previous process sent the forward but died before moving on
        let hash = H256::from_str(
            "0x00000000000000000000000000000000000000000000000000000000000000aa",
        )
        .unwrap();
        confirmed.forwarding_tx_hash = Some(hash);
        confirmed.forwarding_nonce = Some(0);
        gw.store.update_chain_refs(&confirmed).await.unwrap();

        gw.engine.forward_confirmed(&ctx, confirmed).await.unwrap();
        assert!(gw.client.sent_transactions().is_empty());
        let p = gw.payment(payment.id).await;
        assert_eq!(p.status(), PaymentStatus::Forwarded);
        assert_eq!(p.forwarding_tx_hash, Some(hash));
        assert!(!gw.store.is_forward_claimed(payment.id));
    }

    #[tokio::test]
    async fn test_unforwardable_payment_stays_confirmed() {
        // with a 60% cut the merchant share no longer covers the fee
        let gw = TestGateway::start_with(|s| s.earnings_percent = 60).await;
        let payment = gw.create_payment(0.5).await;
        gw.deposit(payment.account.address, payment.pay_amount()).await;
        gw.advance(12).await;

        let p = gw.payment(payment.id).await;
        assert_eq!(p.status(), PaymentStatus::Confirmed);
        assert!(gw.client.sent_transactions().is_empty());
        assert!(!gw.store.is_forward_claimed(payment.id));
    }

    #[tokio::test]
    async fn test_reorged_deposit_with_funds_is_reanchored() {
        let gw = TestGateway::start().await;
        let payment = gw.create_payment(1.0).await;
        let deposit = gw.deposit(payment.account.address, payment.pay_amount()).await;
        gw.client.reorg_block(deposit.number);

        gw.advance(12).await;
        let p = gw.payment(payment.id).await;
        assert_eq!(p.status(), PaymentStatus::Paid);
        assert_ne!(p.last_receiving_block_hash, Some(deposit.hash));
        assert_eq!(p.last_receiving_block_nr, Some(deposit.number + 12));
        assert_eq!(
            gw.metrics
                .reorgs_detected
                .with_label_values(&["test", "incoming"])
                .get(),
            1
        );
    }

    #[tokio::test]
    async fn test_reorged_deposit_without_funds_fails() {
        let gw = TestGateway::start().await;
        let payment = gw.create_payment(1.0).await;
        let address = payment.account.address;
        let deposit = gw.deposit(address, payment.pay_amount()).await;
        // the sibling block never paid the address
        gw.client.reorg_block(deposit.number);
        gw.client.set_balance(address, U256::zero());

        gw.advance(12).await;
        let p = gw.payment(payment.id).await;
        assert_eq!(p.status(), PaymentStatus::Failed);
        assert_eq!(p.amount_received(), U256::zero());
        assert!(!p.account.used);
        assert_eq!(p.account.remainder, U256::zero());
        assert!(gw.client.sent_transactions().is_empty());
        assert_eq!(
            gw.metrics
                .reorgs_detected
                .with_label_values(&["test", "incoming"])
                .get(),
            1
        );
        assert_eq!(
            gw.notifier.updates().last().map(|u| u.state),
            Some(PaymentStatus::Failed)
        );

        // the freed account serves the next payment
        let next = gw.create_payment(1.0).await;
        assert_eq!(next.account.id, payment.account.id);
    }

    #[tokio::test]
    async fn test_webhook_failure_does_not_block_transitions() {
        let gw = TestGateway::start().await;
        gw.notifier.set_failing(true);
        let payment = gw.create_payment(1.0).await;
        gw.deposit(payment.account.address, payment.pay_amount()).await;

        assert_eq!(gw.payment(payment.id).await.status(), PaymentStatus::Paid);
        assert_eq!(gw.metrics.webhook_failures.get(), 1);
    }

    #[tokio::test]
    async fn test_recover_reads_live_balances() {
        let gw = TestGateway::start().await;
        let partial = gw.create_payment(1.0).await;
        let paid = gw.create_payment(1.0).await;
        // deposits that arrived while the node was down
        gw.client
            .set_balance(partial.account.address, U256::from(1_000u64));
        gw.client
            .set_balance(paid.account.address, paid.pay_amount());
        gw.client.mine_empty_blocks(3);
        assert!(gw
            .store
            .try_begin_forward(paid.id, PaymentStatus::Waiting)
            .await
            .unwrap());

        gw.engine.recover(NetworkMode::Test).await.unwrap();
        assert_eq!(
            gw.payment(partial.id).await.status(),
            PaymentStatus::PartiallyPaid
        );
        assert_eq!(gw.payment(paid.id).await.status(), PaymentStatus::Paid);
        assert!(!gw.store.is_forward_claimed(paid.id));
    }
}
