// Copyright (c) Starcoin, Inc.
// SPDX-License-Identifier: Apache-2.0

//! Confirmation checker trait and verdicts

use async_trait::async_trait;
use ethers::types::H256;
use thiserror::Error;

use super::config::ConfirmationConfig;
use crate::error::GatewayError;
use crate::types::BlockRef;

pub type ConfirmationResult<T> = Result<T, ConfirmationError>;

#[derive(Debug, Error)]
pub enum ConfirmationError {
    #[error("RPC error: {0}")]
    Rpc(String),

    #[error("Block not found: {0}")]
    BlockNotFound(u64),

    #[error("Transaction not found: {0}")]
    TxNotFound(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl From<GatewayError> for ConfirmationError {
    fn from(e: GatewayError) -> Self {
        match e {
            GatewayError::BlockNotFound(msg) => ConfirmationError::Rpc(msg),
            GatewayError::TxNotFound(msg) => ConfirmationError::TxNotFound(msg),
            GatewayError::TransientProviderError(msg) | GatewayError::ProviderError(msg) => {
                ConfirmationError::Rpc(msg)
            }
            other => ConfirmationError::Internal(other.to_string()),
        }
    }
}

impl From<ConfirmationError> for GatewayError {
    fn from(e: ConfirmationError) -> Self {
        match e {
            ConfirmationError::Rpc(msg) => GatewayError::TransientProviderError(msg),
            ConfirmationError::BlockNotFound(number) => {
                GatewayError::BlockNotFound(format!("block {}", number))
            }
            ConfirmationError::TxNotFound(msg) => GatewayError::TxNotFound(msg),
            ConfirmationError::Internal(msg) => GatewayError::InternalError(msg),
        }
    }
}

/// Outcome of checking the block a deposit was first seen in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IncomingVerdict {
    /// Not deep enough yet.
    Pending { confirmations: u64, required: u64 },
    /// Deep enough and still part of the canonical chain.
    Confirmed,
    /// The anchor block is gone or was replaced at its height.
    Reorged,
}

/// Outcome of checking a forwarding transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutgoingVerdict {
    /// Successful and deep enough. `block_number` is `None` when no
    /// transaction was ever sent.
    Confirmed { block_number: Option<u64> },
    /// Mined successfully but not deep enough yet.
    Pending { block_number: u64, confirmations: u64 },
    /// Mined with a failure status.
    Reverted { block_number: u64 },
    /// No receipt: the transaction was never mined or was reorged away.
    Vanished,
}

#[async_trait]
pub trait ConfirmationChecker: Send + Sync {
    /// Checks the deposit anchored at `anchor` against the head `current_block`.
    async fn check_incoming(
        &self,
        anchor: BlockRef,
        current_block: u64,
    ) -> ConfirmationResult<IncomingVerdict>;

    /// Checks the forwarding transaction `tx_hash` against the head `current_block`.
    async fn check_outgoing(
        &self,
        tx_hash: Option<H256>,
        current_block: u64,
    ) -> ConfirmationResult<OutgoingVerdict>;

    fn config(&self) -> &ConfirmationConfig;

    /// Chain identifier for logging/metrics
    fn chain_name(&self) -> &str;
}
