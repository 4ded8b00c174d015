// Copyright (c) Starcoin, Inc.
// SPDX-License-Identifier: Apache-2.0

use std::str::FromStr;

use async_trait::async_trait;
use chrono::Utc;
use diesel::prelude::*;
use diesel::result::Error as DieselError;
use diesel::sql_types::Text;
use diesel_async::scoped_futures::ScopedFutureExt;
use diesel_async::{AsyncConnection, AsyncPgConnection, RunQueryDsl};
use ethers::types::{Address as EthAddress, H256, U256};
use ethgate_pg_db::Db;
use ethgate_schema::models::{
    AccountRow, AccountUpdate, PaymentChainRefs, PaymentRow, PaymentStateRow,
};
use ethgate_schema::schema::{accounts, payment_states, payments};
use tracing::{debug, error};
use uuid::Uuid;

use super::{confirming_states, open_states, AccountRepository, PaymentRepository};
use crate::error::{GatewayError, GatewayResult};
use crate::types::{Account, NetworkMode, Payment, PaymentState, PaymentStatus};

const ALLOCATE_FREE_ACCOUNT: &str = "\
UPDATE accounts SET used = TRUE, updated_at = now() \
WHERE id = (\
    SELECT id FROM accounts WHERE used = FALSE AND mode = $1 \
    ORDER BY created_at LIMIT 1 FOR UPDATE SKIP LOCKED\
) \
RETURNING id, address, encrypted_private_key, nonce, used, remainder, mode, created_at, updated_at";

/// Postgres implementation of both repositories.
#[derive(Clone)]
pub struct PgStore {
    db: Db,
}

impl PgStore {
    pub fn new(db: Db) -> Self {
        Self { db }
    }

    async fn load_payments(
        &self,
        mode: NetworkMode,
        states: &[PaymentStatus],
    ) -> GatewayResult<Vec<Payment>> {
        let mut conn = self.db.connect().await.map_err(storage_err)?;
        let states: Vec<String> = states.iter().map(|s| s.to_string()).collect();
        let rows = payments::table
            .inner_join(accounts::table)
            .inner_join(payment_states::table)
            .filter(payments::mode.eq(mode.to_string()))
            .filter(payments::current_state.eq_any(states))
            .order(payments::created_at.asc())
            .select((
                PaymentRow::as_select(),
                AccountRow::as_select(),
                PaymentStateRow::as_select(),
            ))
            .load::<(PaymentRow, AccountRow, PaymentStateRow)>(&mut conn)
            .await
            .map_err(storage_err)?;
        rows.into_iter()
            .map(|(payment, account, state)| payment_from_rows(payment, account, state))
            .collect()
    }
}

#[async_trait]
impl PaymentRepository for PgStore {
    async fn create_payment(&self, payment: &Payment) -> GatewayResult<()> {
        let state_row = state_to_row(payment.id, &payment.state);
        let payment_row = payment_to_row(payment);
        let mut conn = self.db.connect().await.map_err(storage_err)?;
        let pg: &mut AsyncPgConnection = &mut conn;
        pg.transaction::<_, DieselError, _>(|conn| {
            async move {
                diesel::insert_into(payment_states::table)
                    .values(&state_row)
                    .execute(conn)
                    .await?;
                diesel::insert_into(payments::table)
                    .values(&payment_row)
                    .execute(conn)
                    .await?;
                Ok(())
            }
            .scope_boxed()
        })
        .await
        .map_err(storage_err)
    }

    async fn update_payment_state(
        &self,
        payment: &Payment,
        expected_state_id: Uuid,
    ) -> GatewayResult<bool> {
        let state_row = state_to_row(payment.id, &payment.state);
        let chain_refs = chain_refs(payment);
        let account_update = account_update(&payment.account);
        let account_id = payment.account.id;
        let payment_id = payment.id;

        let mut conn = self.db.connect().await.map_err(storage_err)?;
        let pg: &mut AsyncPgConnection = &mut conn;
        let result = pg
            .transaction::<_, DieselError, _>(|conn| {
                async move {
                    diesel::insert_into(payment_states::table)
                        .values(&state_row)
                        .execute(conn)
                        .await?;
                    let updated = diesel::update(
                        payments::table
                            .filter(payments::id.eq(payment_id))
                            .filter(payments::current_state_id.eq(expected_state_id)),
                    )
                    .set((
                        payments::current_state.eq(&state_row.state),
                        payments::current_state_id.eq(state_row.id),
                        &chain_refs,
                    ))
                    .execute(conn)
                    .await?;
                    if updated == 0 {
                        return Err(DieselError::RollbackTransaction);
                    }
                    diesel::update(accounts::table.filter(accounts::id.eq(account_id)))
                        .set(&account_update)
                        .execute(conn)
                        .await?;
                    Ok(())
                }
                .scope_boxed()
            })
            .await;

        match result {
            Ok(()) => Ok(true),
            Err(DieselError::RollbackTransaction) => {
                debug!(
                    "Payment {} moved past state {} before the update landed",
                    payment.id, expected_state_id
                );
                Ok(false)
            }
            Err(e) => {
                error!("Failed to persist state of payment {}: {}", payment.id, e);
                Err(storage_err(e))
            }
        }
    }

    async fn update_chain_refs(&self, payment: &Payment) -> GatewayResult<()> {
        let mut conn = self.db.connect().await.map_err(storage_err)?;
        diesel::update(payments::table.filter(payments::id.eq(payment.id)))
            .set(&chain_refs(payment))
            .execute(&mut conn)
            .await
            .map_err(storage_err)?;
        Ok(())
    }

    async fn get_payment(&self, id: Uuid) -> GatewayResult<Option<Payment>> {
        let mut conn = self.db.connect().await.map_err(storage_err)?;
        let row = payments::table
            .inner_join(accounts::table)
            .inner_join(payment_states::table)
            .filter(payments::id.eq(id))
            .select((
                PaymentRow::as_select(),
                AccountRow::as_select(),
                PaymentStateRow::as_select(),
            ))
            .first::<(PaymentRow, AccountRow, PaymentStateRow)>(&mut conn)
            .await
            .optional()
            .map_err(storage_err)?;
        row.map(|(payment, account, state)| payment_from_rows(payment, account, state))
            .transpose()
    }

    async fn get_payment_states(&self, id: Uuid) -> GatewayResult<Vec<PaymentState>> {
        let mut conn = self.db.connect().await.map_err(storage_err)?;
        let rows = payment_states::table
            .filter(payment_states::payment_id.eq(id))
            .order(payment_states::created_at.asc())
            .select(PaymentStateRow::as_select())
            .load::<PaymentStateRow>(&mut conn)
            .await
            .map_err(storage_err)?;
        rows.into_iter().map(state_from_row).collect()
    }

    async fn get_open_payments(&self, mode: NetworkMode) -> GatewayResult<Vec<Payment>> {
        self.load_payments(mode, &open_states()).await
    }

    async fn get_confirming_payments(&self, mode: NetworkMode) -> GatewayResult<Vec<Payment>> {
        self.load_payments(mode, &confirming_states()).await
    }

    async fn get_finishing_payments(&self, mode: NetworkMode) -> GatewayResult<Vec<Payment>> {
        self.load_payments(mode, &[PaymentStatus::Forwarded]).await
    }

    async fn try_begin_forward(&self, id: Uuid, expected: PaymentStatus) -> GatewayResult<bool> {
        let mut conn = self.db.connect().await.map_err(storage_err)?;
        let claimed = diesel::update(
            payments::table
                .filter(payments::id.eq(id))
                .filter(payments::current_state.eq(expected.to_string()))
                .filter(payments::forward_claimed.eq(false)),
        )
        .set((
            payments::forward_claimed.eq(true),
            payments::updated_at.eq(Utc::now()),
        ))
        .execute(&mut conn)
        .await
        .map_err(storage_err)?;
        Ok(claimed == 1)
    }

    async fn end_forward(&self, id: Uuid) -> GatewayResult<()> {
        let mut conn = self.db.connect().await.map_err(storage_err)?;
        diesel::update(payments::table.filter(payments::id.eq(id)))
            .set(payments::forward_claimed.eq(false))
            .execute(&mut conn)
            .await
            .map_err(storage_err)?;
        Ok(())
    }

    async fn reset_forward_claims(&self, mode: NetworkMode) -> GatewayResult<u64> {
        let mut conn = self.db.connect().await.map_err(storage_err)?;
        let released = diesel::update(
            payments::table
                .filter(payments::mode.eq(mode.to_string()))
                .filter(payments::forward_claimed.eq(true)),
        )
        .set(payments::forward_claimed.eq(false))
        .execute(&mut conn)
        .await
        .map_err(storage_err)?;
        Ok(released as u64)
    }
}

#[async_trait]
impl AccountRepository for PgStore {
    async fn allocate_free_account(&self, mode: NetworkMode) -> GatewayResult<Option<Account>> {
        let mut conn = self.db.connect().await.map_err(storage_err)?;
        let row = diesel::sql_query(ALLOCATE_FREE_ACCOUNT)
            .bind::<Text, _>(mode.to_string())
            .get_result::<AccountRow>(&mut conn)
            .await
            .optional()
            .map_err(storage_err)?;
        row.map(account_from_row).transpose()
    }

    async fn create_account(&self, account: &Account) -> GatewayResult<()> {
        let mut conn = self.db.connect().await.map_err(storage_err)?;
        diesel::insert_into(accounts::table)
            .values(&account_to_row(account))
            .execute(&mut conn)
            .await
            .map_err(storage_err)?;
        Ok(())
    }

    async fn update_account(&self, account: &Account) -> GatewayResult<()> {
        let mut conn = self.db.connect().await.map_err(storage_err)?;
        diesel::update(accounts::table.filter(accounts::id.eq(account.id)))
            .set(&account_update(account))
            .execute(&mut conn)
            .await
            .map_err(storage_err)?;
        Ok(())
    }
}

fn storage_err(e: impl std::fmt::Display) -> GatewayError {
    GatewayError::StorageError(e.to_string())
}

fn corrupt(column: &str, value: &str) -> GatewayError {
    GatewayError::StorageError(format!("malformed {} value {:?}", column, value))
}

fn parse_u256(column: &str, value: &str) -> GatewayResult<U256> {
    U256::from_dec_str(value).map_err(|_| corrupt(column, value))
}

fn parse_address(column: &str, value: &str) -> GatewayResult<EthAddress> {
    EthAddress::from_str(value).map_err(|_| corrupt(column, value))
}

fn parse_hash(column: &str, value: &str) -> GatewayResult<H256> {
    H256::from_str(value).map_err(|_| corrupt(column, value))
}

fn parse_u64(column: &str, value: i64) -> GatewayResult<u64> {
    u64::try_from(value).map_err(|_| corrupt(column, &value.to_string()))
}

// u64 block numbers and nonces stay far below i64::MAX on any real chain.
fn to_i64(value: u64) -> i64 {
    i64::try_from(value).unwrap_or(i64::MAX)
}

fn account_to_row(account: &Account) -> AccountRow {
    AccountRow {
        id: account.id,
        address: format!("{:?}", account.address),
        encrypted_private_key: account.encrypted_private_key.clone(),
        nonce: to_i64(account.nonce),
        used: account.used,
        remainder: account.remainder.to_string(),
        mode: account.mode.to_string(),
        created_at: account.created_at,
        updated_at: Utc::now(),
    }
}

fn account_update(account: &Account) -> AccountUpdate {
    AccountUpdate {
        nonce: to_i64(account.nonce),
        used: account.used,
        remainder: account.remainder.to_string(),
        updated_at: Utc::now(),
    }
}

fn account_from_row(row: AccountRow) -> GatewayResult<Account> {
    Ok(Account {
        id: row.id,
        address: parse_address("accounts.address", &row.address)?,
        encrypted_private_key: row.encrypted_private_key,
        nonce: parse_u64("accounts.nonce", row.nonce)?,
        used: row.used,
        remainder: parse_u256("accounts.remainder", &row.remainder)?,
        mode: NetworkMode::from_str(&row.mode).map_err(|_| corrupt("accounts.mode", &row.mode))?,
        created_at: row.created_at,
    })
}

fn state_to_row(payment_id: Uuid, state: &PaymentState) -> PaymentStateRow {
    PaymentStateRow {
        id: state.id,
        payment_id,
        state: state.status.to_string(),
        pay_amount: state.pay_amount.to_string(),
        amount_received: state.amount_received.to_string(),
        created_at: state.created_at,
    }
}

fn state_from_row(row: PaymentStateRow) -> GatewayResult<PaymentState> {
    Ok(PaymentState {
        id: row.id,
        status: PaymentStatus::from_str(&row.state)
            .map_err(|_| corrupt("payment_states.state", &row.state))?,
        pay_amount: parse_u256("payment_states.pay_amount", &row.pay_amount)?,
        amount_received: parse_u256("payment_states.amount_received", &row.amount_received)?,
        created_at: row.created_at,
    })
}

fn chain_refs(payment: &Payment) -> PaymentChainRefs {
    PaymentChainRefs {
        last_receiving_block_nr: payment.last_receiving_block_nr.map(to_i64),
        last_receiving_block_hash: payment.last_receiving_block_hash.map(|h| format!("{:?}", h)),
        forwarding_tx_hash: payment.forwarding_tx_hash.map(|h| format!("{:?}", h)),
        forwarding_block_nr: payment.forwarding_block_nr.map(to_i64),
        forwarding_nonce: payment.forwarding_nonce.map(to_i64),
        forwarding_amount: payment.forwarding_amount.map(|a| a.to_string()),
        updated_at: Utc::now(),
    }
}

fn payment_to_row(payment: &Payment) -> PaymentRow {
    let refs = chain_refs(payment);
    PaymentRow {
        id: payment.id,
        mode: payment.mode.to_string(),
        account_id: payment.account.id,
        merchant_wallet: format!("{:?}", payment.merchant_wallet),
        price_amount: payment.price_amount,
        price_currency: payment.price_currency.clone(),
        current_state: payment.state.status.to_string(),
        current_state_id: payment.state.id,
        last_receiving_block_nr: refs.last_receiving_block_nr,
        last_receiving_block_hash: refs.last_receiving_block_hash,
        forwarding_tx_hash: refs.forwarding_tx_hash,
        forwarding_block_nr: refs.forwarding_block_nr,
        forwarding_nonce: refs.forwarding_nonce,
        forwarding_amount: refs.forwarding_amount,
        forward_claimed: false,
        created_at: payment.created_at,
        updated_at: refs.updated_at,
    }
}

fn payment_from_rows(
    row: PaymentRow,
    account: AccountRow,
    state: PaymentStateRow,
) -> GatewayResult<Payment> {
    Ok(Payment {
        id: row.id,
        mode: NetworkMode::from_str(&row.mode).map_err(|_| corrupt("payments.mode", &row.mode))?,
        merchant_wallet: parse_address("payments.merchant_wallet", &row.merchant_wallet)?,
        price_amount: row.price_amount,
        price_currency: row.price_currency,
        account: account_from_row(account)?,
        state: state_from_row(state)?,
        last_receiving_block_nr: row
            .last_receiving_block_nr
            .map(|n| parse_u64("payments.last_receiving_block_nr", n))
            .transpose()?,
        last_receiving_block_hash: row
            .last_receiving_block_hash
            .as_deref()
            .map(|h| parse_hash("payments.last_receiving_block_hash", h))
            .transpose()?,
        forwarding_tx_hash: row
            .forwarding_tx_hash
            .as_deref()
            .map(|h| parse_hash("payments.forwarding_tx_hash", h))
            .transpose()?,
        forwarding_block_nr: row
            .forwarding_block_nr
            .map(|n| parse_u64("payments.forwarding_block_nr", n))
            .transpose()?,
        forwarding_nonce: row
            .forwarding_nonce
            .map(|n| parse_u64("payments.forwarding_nonce", n))
            .transpose()?,
        forwarding_amount: row
            .forwarding_amount
            .as_deref()
            .map(|a| parse_u256("payments.forwarding_amount", a))
            .transpose()?,
        created_at: row.created_at,
    })
}
