// Copyright (c) Starcoin, Inc.
// SPDX-License-Identifier: Apache-2.0

//! Repository contracts the payment engine persists through.
//!
//! Every call is atomic per row. The engine relies on two conditional writes
//! to stay correct when evaluations of the same payment overlap:
//! [`PaymentRepository::update_payment_state`] only applies on top of the
//! exact state row the caller read, and [`PaymentRepository::try_begin_forward`]
//! hands out at most one forward claim per payment.

use async_trait::async_trait;
use uuid::Uuid;

use crate::error::GatewayResult;
use crate::types::{Account, NetworkMode, Payment, PaymentState, PaymentStatus};

pub mod pg;

pub use pg::PgStore;

#[async_trait]
pub trait PaymentRepository: Send + Sync {
    /// Inserts a new payment with its initial state. The account must exist.
    async fn create_payment(&self, payment: &Payment) -> GatewayResult<()>;

    /// Appends `payment.state` to the history and persists the payment's
    /// chain references and embedded account, all in one transaction and only
    /// if the stored current state row is still `expected_state_id`. Returns
    /// `false`, with nothing written, when another task wrote a state first,
    /// even one with the same status.
    async fn update_payment_state(
        &self,
        payment: &Payment,
        expected_state_id: Uuid,
    ) -> GatewayResult<bool>;

    /// Persists anchor and forwarding references without a state change.
    async fn update_chain_refs(&self, payment: &Payment) -> GatewayResult<()>;

    async fn get_payment(&self, id: Uuid) -> GatewayResult<Option<Payment>>;

    /// Full state history, oldest first.
    async fn get_payment_states(&self, id: Uuid) -> GatewayResult<Vec<PaymentState>>;

    /// Payments still waiting for their deposit: `Waiting`, `PartiallyPaid`.
    async fn get_open_payments(&self, mode: NetworkMode) -> GatewayResult<Vec<Payment>>;

    /// Payments between deposit and forward: `Paid`, `Confirmed`.
    async fn get_confirming_payments(&self, mode: NetworkMode) -> GatewayResult<Vec<Payment>>;

    /// Payments whose forward awaits confirmation: `Forwarded`.
    async fn get_finishing_payments(&self, mode: NetworkMode) -> GatewayResult<Vec<Payment>>;

    /// Claims the right to submit a forwarding transaction for `id`. Succeeds
    /// only if the payment is in `expected` and nobody else holds the claim.
    async fn try_begin_forward(&self, id: Uuid, expected: PaymentStatus) -> GatewayResult<bool>;

    async fn end_forward(&self, id: Uuid) -> GatewayResult<()>;

    /// Drops claims left behind by a previous process. Returns how many.
    async fn reset_forward_claims(&self, mode: NetworkMode) -> GatewayResult<u64>;
}

#[async_trait]
pub trait AccountRepository: Send + Sync {
    /// Atomically claims one free account of `mode`, marking it used.
    async fn allocate_free_account(&self, mode: NetworkMode) -> GatewayResult<Option<Account>>;

    async fn create_account(&self, account: &Account) -> GatewayResult<()>;

    /// Persists nonce, used flag and remainder.
    async fn update_account(&self, account: &Account) -> GatewayResult<()>;
}

pub(crate) fn open_states() -> [PaymentStatus; 2] {
    [PaymentStatus::Waiting, PaymentStatus::PartiallyPaid]
}

pub(crate) fn confirming_states() -> [PaymentStatus; 2] {
    [PaymentStatus::Paid, PaymentStatus::Confirmed]
}
