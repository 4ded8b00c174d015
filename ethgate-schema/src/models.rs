// Copyright (c) Starcoin, Inc.
// SPDX-License-Identifier: Apache-2.0

//! Row types for the gateway tables. Wei amounts are stored as decimal text
//! and block hashes / addresses as 0x-prefixed hex.

use chrono::{DateTime, Utc};
use diesel::prelude::*;
use uuid::Uuid;

use crate::schema::{accounts, payment_states, payments};

#[derive(Queryable, QueryableByName, Selectable, Insertable, Debug, Clone, PartialEq)]
#[diesel(table_name = accounts, check_for_backend(diesel::pg::Pg))]
pub struct AccountRow {
    pub id: Uuid,
    pub address: String,
    pub encrypted_private_key: String,
    pub nonce: i64,
    pub used: bool,
    pub remainder: String,
    pub mode: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

// Columns the engine mutates on an account after creation.
#[derive(AsChangeset, Debug, Clone)]
#[diesel(table_name = accounts)]
pub struct AccountUpdate {
    pub nonce: i64,
    pub used: bool,
    pub remainder: String,
    pub updated_at: DateTime<Utc>,
}

#[derive(Queryable, Selectable, Insertable, Debug, Clone, PartialEq)]
#[diesel(table_name = payment_states, check_for_backend(diesel::pg::Pg))]
pub struct PaymentStateRow {
    pub id: Uuid,
    pub payment_id: Uuid,
    pub state: String,
    pub pay_amount: String,
    pub amount_received: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Queryable, Selectable, Insertable, Debug, Clone, PartialEq)]
#[diesel(table_name = payments, check_for_backend(diesel::pg::Pg))]
pub struct PaymentRow {
    pub id: Uuid,
    pub mode: String,
    pub account_id: Uuid,
    pub merchant_wallet: String,
    pub price_amount: f64,
    pub price_currency: String,
    pub current_state: String,
    pub current_state_id: Uuid,
    pub last_receiving_block_nr: Option<i64>,
    pub last_receiving_block_hash: Option<String>,
    pub forwarding_tx_hash: Option<String>,
    pub forwarding_block_nr: Option<i64>,
    pub forwarding_nonce: Option<i64>,
    pub forwarding_amount: Option<String>,
    pub forward_claimed: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

// Chain references written alongside (or independently of) a state change.
// `None` fields are written as NULL.
#[derive(AsChangeset, Debug, Clone)]
#[diesel(table_name = payments, treat_none_as_null = true)]
pub struct PaymentChainRefs {
    pub last_receiving_block_nr: Option<i64>,
    pub last_receiving_block_hash: Option<String>,
    pub forwarding_tx_hash: Option<String>,
    pub forwarding_block_nr: Option<i64>,
    pub forwarding_nonce: Option<i64>,
    pub forwarding_amount: Option<String>,
    pub updated_at: DateTime<Utc>,
}
