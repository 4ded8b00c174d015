// Copyright (c) Starcoin, Inc.
// SPDX-License-Identifier: Apache-2.0

use std::sync::Arc;

use chrono::Utc;
use ethers::types::U256;
use tracing::{info, warn};
use uuid::Uuid;

use crate::crypto::KeyCipher;
use crate::error::GatewayResult;
use crate::metrics::GatewayMetrics;
use crate::storage::AccountRepository;
use crate::types::{Account, NetworkMode};

/// Free accounts with an unreadable key skipped before a new one is generated.
const MAX_QUARANTINED_PER_ALLOCATION: usize = 3;

/// Hands out signing accounts, one in-flight payment per account.
pub struct AccountPool {
    accounts: Arc<dyn AccountRepository>,
    cipher: Arc<KeyCipher>,
    metrics: Arc<GatewayMetrics>,
}

impl AccountPool {
    pub fn new(
        accounts: Arc<dyn AccountRepository>,
        cipher: Arc<KeyCipher>,
        metrics: Arc<GatewayMetrics>,
    ) -> Self {
        Self {
            accounts,
            cipher,
            metrics,
        }
    }

    /// Claims a free account of `mode`, or creates one if none is usable.
    /// The returned account is already persisted with `used = true`.
    pub async fn allocate(&self, mode: NetworkMode) -> GatewayResult<Account> {
        for _ in 0..MAX_QUARANTINED_PER_ALLOCATION {
            let Some(account) = self.accounts.allocate_free_account(mode).await? else {
                break;
            };
            // A key that no longer opens stays claimed so it is never handed out again.
            match self.cipher.decrypt(&account.encrypted_private_key) {
                Ok(_) => {
                    info!(
                        "[{}] Reusing account {:?} (nonce {}, remainder {})",
                        mode, account.address, account.nonce, account.remainder
                    );
                    return Ok(account);
                }
                Err(e) => {
                    warn!(
                        "[{}] Quarantining account {:?}, key does not open: {}",
                        mode, account.address, e
                    );
                    self.metrics
                        .errors
                        .with_label_values(&[e.error_type()])
                        .inc();
                }
            }
        }
        self.create(mode).await
    }

    async fn create(&self, mode: NetworkMode) -> GatewayResult<Account> {
        let (address, encrypted_private_key) = self.cipher.generate_account_key()?;
        let account = Account {
            id: Uuid::new_v4(),
            address,
            encrypted_private_key,
            nonce: 0,
            used: true,
            remainder: U256::zero(),
            mode,
            created_at: Utc::now(),
        };
        self.accounts.create_account(&account).await?;
        self.metrics
            .accounts_created
            .with_label_values(&[&mode.to_string()])
            .inc();
        info!("[{}] Created account {:?}", mode, address);
        Ok(account)
    }

    /// Returns an account that never got attached to a payment.
    pub async fn release(&self, account: &mut Account) -> GatewayResult<()> {
        account.used = false;
        self.accounts.update_account(account).await
    }
}
