// Copyright (c) Starcoin, Inc.
// SPDX-License-Identifier: Apache-2.0

use chrono::{DateTime, Duration, Utc};
use ethers::types::{Address as EthAddress, Bytes, H256, U256};
use serde::{Deserialize, Serialize};
use strum_macros::{Display, EnumString};
use uuid::Uuid;

/// Network a payment, account and chain client belong to.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, Display, EnumString,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum NetworkMode {
    Main,
    Test,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display, EnumString)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum PaymentStatus {
    Waiting,
    PartiallyPaid,
    Paid,
    Confirmed,
    Forwarded,
    Finished,
    Expired,
    Failed,
}

impl PaymentStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            PaymentStatus::Finished | PaymentStatus::Expired | PaymentStatus::Failed
        )
    }

    /// Still waiting for the deposit to arrive.
    pub fn is_open(&self) -> bool {
        matches!(self, PaymentStatus::Waiting | PaymentStatus::PartiallyPaid)
    }

    /// Whether the state machine allows moving from `self` to `next`.
    pub fn can_transition_to(&self, next: PaymentStatus) -> bool {
        use PaymentStatus::*;
        matches!(
            (*self, next),
            (Waiting, PartiallyPaid)
                | (PartiallyPaid, PartiallyPaid)
                | (PartiallyPaid, Waiting)
                | (Waiting | PartiallyPaid, Paid)
                | (Waiting | PartiallyPaid, Expired)
                | (Paid, Confirmed)
                | (Confirmed, Forwarded)
                | (Forwarded, Finished)
                | (Paid | Confirmed | Forwarded, Failed)
        )
    }
}

/// An ephemeral signing identity owned by at most one in-flight payment.
#[derive(Debug, Clone, PartialEq)]
pub struct Account {
    pub id: Uuid,
    pub address: EthAddress,
    pub encrypted_private_key: String,
    /// Next unused transaction nonce for `address`.
    pub nonce: u64,
    pub used: bool,
    /// Wei left on the address after the last forward: unswept earnings.
    pub remainder: U256,
    pub mode: NetworkMode,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct PaymentState {
    pub id: Uuid,
    pub status: PaymentStatus,
    pub pay_amount: U256,
    pub amount_received: U256,
    pub created_at: DateTime<Utc>,
}

impl PaymentState {
    pub fn new(status: PaymentStatus, pay_amount: U256, amount_received: U256) -> Self {
        Self {
            id: Uuid::new_v4(),
            status,
            pay_amount,
            amount_received,
            created_at: Utc::now(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Payment {
    pub id: Uuid,
    pub mode: NetworkMode,
    pub merchant_wallet: EthAddress,
    pub price_amount: f64,
    pub price_currency: String,
    pub account: Account,
    pub state: PaymentState,
    pub last_receiving_block_nr: Option<u64>,
    pub last_receiving_block_hash: Option<H256>,
    pub forwarding_tx_hash: Option<H256>,
    pub forwarding_block_nr: Option<u64>,
    pub forwarding_nonce: Option<u64>,
    /// Value carried by the forwarding transaction, reused for replacements.
    pub forwarding_amount: Option<U256>,
    pub created_at: DateTime<Utc>,
}

impl Payment {
    pub fn new(
        mode: NetworkMode,
        merchant_wallet: EthAddress,
        price_amount: f64,
        price_currency: impl Into<String>,
        account: Account,
        pay_amount: U256,
    ) -> Self {
        let state = PaymentState::new(PaymentStatus::Waiting, pay_amount, U256::zero());
        Self {
            id: Uuid::new_v4(),
            mode,
            merchant_wallet,
            price_amount,
            price_currency: price_currency.into(),
            account,
            created_at: state.created_at,
            state,
            last_receiving_block_nr: None,
            last_receiving_block_hash: None,
            forwarding_tx_hash: None,
            forwarding_block_nr: None,
            forwarding_nonce: None,
            forwarding_amount: None,
        }
    }

    pub fn status(&self) -> PaymentStatus {
        self.state.status
    }

    pub fn pay_amount(&self) -> U256 {
        self.state.pay_amount
    }

    pub fn amount_received(&self) -> U256 {
        self.state.amount_received
    }

    pub fn expires_at(&self, timeout: std::time::Duration) -> DateTime<Utc> {
        let timeout = Duration::from_std(timeout).unwrap_or_else(|_| Duration::zero());
        self.created_at + timeout
    }

    pub fn is_expired(&self, timeout: std::time::Duration, now: DateTime<Utc>) -> bool {
        self.state.status.is_open() && now > self.expires_at(timeout)
    }

    /// Appends a new state carrying the creation-time `pay_amount` forward and
    /// returns the status it replaced, which the caller persists against.
    pub fn advance(&mut self, status: PaymentStatus, amount_received: U256) -> PaymentStatus {
        let previous = self.state.status;
        self.state = PaymentState::new(status, self.state.pay_amount, amount_received);
        previous
    }
}

/// A plain value transfer found in a block.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChainTransfer {
    pub hash: H256,
    pub to: EthAddress,
    pub value: U256,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChainBlock {
    pub number: u64,
    pub hash: H256,
    pub transfers: Vec<ChainTransfer>,
}

impl ChainBlock {
    pub fn block_ref(&self) -> BlockRef {
        BlockRef {
            number: self.number,
            hash: self.hash,
        }
    }

    /// Sum of all values sent to `address` in this block, `None` if untouched.
    pub fn received_by(&self, address: EthAddress) -> Option<U256> {
        self.transfers
            .iter()
            .filter(|t| t.to == address)
            .fold(None, |acc: Option<U256>, t| {
                Some(acc.unwrap_or_default().saturating_add(t.value))
            })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockRef {
    pub number: u64,
    pub hash: H256,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TxReceipt {
    pub block_number: u64,
    pub success: bool,
}

/// A locally signed transfer ready for `eth_sendRawTransaction`.
#[derive(Debug, Clone, PartialEq)]
pub struct SignedTransfer {
    pub raw: Bytes,
    pub hash: H256,
    pub from: EthAddress,
    pub to: EthAddress,
    pub value: U256,
    pub nonce: u64,
    pub gas_price: U256,
}
