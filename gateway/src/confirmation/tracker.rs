// Copyright (c) Starcoin, Inc.
// SPDX-License-Identifier: Apache-2.0

//! Block depth confirmation tracker over a [`ChainClient`]

use async_trait::async_trait;
use ethers::types::H256;
use std::sync::Arc;
use tracing::{debug, warn};

use super::checker::{ConfirmationChecker, ConfirmationResult, IncomingVerdict, OutgoingVerdict};
use super::config::ConfirmationConfig;
use crate::eth_client::ChainClient;
use crate::types::BlockRef;

pub struct DepthConfirmationTracker {
    client: Arc<dyn ChainClient>,
    config: ConfirmationConfig,
    chain_name: String,
}

impl std::fmt::Debug for DepthConfirmationTracker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DepthConfirmationTracker")
            .field("config", &self.config)
            .field("chain_name", &self.chain_name)
            .finish()
    }
}

impl DepthConfirmationTracker {
    pub fn new(
        client: Arc<dyn ChainClient>,
        chain_name: impl Into<String>,
        config: ConfirmationConfig,
    ) -> Self {
        Self {
            client,
            config,
            chain_name: chain_name.into(),
        }
    }
}

#[async_trait]
impl ConfirmationChecker for DepthConfirmationTracker {
    async fn check_incoming(
        &self,
        anchor: BlockRef,
        current_block: u64,
    ) -> ConfirmationResult<IncomingVerdict> {
        let confirmations = current_block.saturating_sub(anchor.number);
        let required = self.config.incoming_confirmations;
        if confirmations < required {
            debug!(
                "[{}] Deposit block {} has {}/{} confirmations",
                self.chain_name, anchor.number, confirmations, required
            );
            return Ok(IncomingVerdict::Pending {
                confirmations,
                required,
            });
        }

        // Deep enough: make sure the anchor is still canonical before trusting it.
        match self.client.block_by_hash(anchor.hash).await? {
            Some(block) if block.number == anchor.number => Ok(IncomingVerdict::Confirmed),
            Some(block) => {
                warn!(
                    "[{}] Deposit block {:?} moved from height {} to {}",
                    self.chain_name, anchor.hash, anchor.number, block.number
                );
                Ok(IncomingVerdict::Reorged)
            }
            None => {
                warn!(
                    "[{}] Deposit block {} ({:?}) is no longer retrievable",
                    self.chain_name, anchor.number, anchor.hash
                );
                Ok(IncomingVerdict::Reorged)
            }
        }
    }

    async fn check_outgoing(
        &self,
        tx_hash: Option<H256>,
        current_block: u64,
    ) -> ConfirmationResult<OutgoingVerdict> {
        let Some(tx_hash) = tx_hash else {
            return Ok(OutgoingVerdict::Confirmed { block_number: None });
        };
        let Some(receipt) = self.client.transaction_receipt(tx_hash).await? else {
            warn!(
                "[{}] No receipt for forwarding tx {:?} at head {}",
                self.chain_name, tx_hash, current_block
            );
            return Ok(OutgoingVerdict::Vanished);
        };
        if !receipt.success {
            warn!(
                "[{}] Forwarding tx {:?} reverted in block {}",
                self.chain_name, tx_hash, receipt.block_number
            );
            return Ok(OutgoingVerdict::Reverted {
                block_number: receipt.block_number,
            });
        }
        let confirmations = current_block.saturating_sub(receipt.block_number);
        if confirmations >= self.config.outgoing_confirmations {
            Ok(OutgoingVerdict::Confirmed {
                block_number: Some(receipt.block_number),
            })
        } else {
            debug!(
                "[{}] Forwarding tx {:?} has {}/{} confirmations",
                self.chain_name, tx_hash, confirmations, self.config.outgoing_confirmations
            );
            Ok(OutgoingVerdict::Pending {
                block_number: receipt.block_number,
                confirmations,
            })
        }
    }

    fn config(&self) -> &ConfirmationConfig {
        &self.config
    }

    fn chain_name(&self) -> &str {
        &self.chain_name
    }
}
