// Copyright (c) Starcoin, Inc.
// SPDX-License-Identifier: Apache-2.0

//! The payment lifecycle engine.
//!
//! [`PaymentEngine`] owns every state transition. It is driven from two
//! entry points only: [`PaymentEngine::create_payment`] from the HTTP layer
//! and [`PaymentEngine::on_new_block`] from the chain listener. Each payment
//! evaluation runs as its own task and the tasks share nothing but the
//! persisted payment and account rows.

use std::sync::Arc;

use crate::config::{ChainSettings, EngineSettings};
use crate::confirmation::{ConfirmationChecker, DepthConfirmationTracker};
use crate::crypto::KeyCipher;
use crate::earnings::EarningsAggregator;
use crate::eth_client::ChainClient;
use crate::forwarder::Forwarder;
use crate::metrics::GatewayMetrics;
use crate::storage::AccountRepository;
use crate::types::NetworkMode;

mod engine;

pub use engine::PaymentEngine;

/// Everything the engine needs to act on one network.
pub struct ChainContext {
    pub mode: NetworkMode,
    pub client: Arc<dyn ChainClient>,
    pub tracker: Arc<dyn ConfirmationChecker>,
    pub forwarder: Arc<Forwarder>,
    pub earnings: EarningsAggregator,
}

impl ChainContext {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        mode: NetworkMode,
        chain_id: u64,
        client: Arc<dyn ChainClient>,
        chain: &ChainSettings,
        settings: &EngineSettings,
        accounts: Arc<dyn AccountRepository>,
        cipher: Arc<KeyCipher>,
        metrics: Arc<GatewayMetrics>,
    ) -> Self {
        let tracker = Arc::new(DepthConfirmationTracker::new(
            client.clone(),
            format!("eth-{}", mode),
            chain.confirmations,
        ));
        let forwarder = Arc::new(Forwarder::new(
            mode,
            chain_id,
            client.clone(),
            accounts.clone(),
            cipher,
            metrics.clone(),
            chain.gas_price_override,
            chain.mined_timeout,
        ));
        let earnings = EarningsAggregator::new(
            mode,
            forwarder.clone(),
            accounts,
            metrics,
            settings.treasury_wallet,
            settings.fee_factor,
        );
        Self {
            mode,
            client,
            tracker,
            forwarder,
            earnings,
        }
    }
}
