// Copyright (c) Starcoin, Inc.
// SPDX-License-Identifier: Apache-2.0

use std::time::Duration;

use async_trait::async_trait;
use ethers::types::{H256, U256};
use serde::Serialize;
use serde_with::{serde_as, DisplayFromStr};
use url::Url;
use uuid::Uuid;

use crate::amount::wei_to_eth;
use crate::error::{GatewayError, GatewayResult};
use crate::price::NATIVE_SYMBOL;
use crate::types::{Payment, PaymentStatus};

/// What the merchant backend learns about a transition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PaymentUpdate {
    pub payment_id: Uuid,
    pub state: PaymentStatus,
    pub pay_amount: U256,
    pub amount_received: U256,
    pub forwarding_tx_hash: Option<H256>,
}

impl From<&Payment> for PaymentUpdate {
    fn from(payment: &Payment) -> Self {
        Self {
            payment_id: payment.id,
            state: payment.status(),
            pay_amount: payment.pay_amount(),
            amount_received: payment.amount_received(),
            forwarding_tx_hash: payment.forwarding_tx_hash,
        }
    }
}

#[async_trait]
pub trait PaymentNotifier: Send + Sync {
    async fn notify(&self, update: &PaymentUpdate) -> GatewayResult<()>;
}

#[serde_as]
#[derive(Debug, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
struct WebhookPayload {
    payment_id: Uuid,
    /// `None` when the float cannot carry the exact wei amount.
    pay_amount: Option<f64>,
    #[serde_as(as = "DisplayFromStr")]
    pay_amount_wei: U256,
    pay_currency: &'static str,
    actual_pay_amount: Option<f64>,
    #[serde_as(as = "DisplayFromStr")]
    actual_pay_amount_wei: U256,
    payment_state: PaymentStatus,
    forwarding_tx_hash: Option<H256>,
}

impl From<&PaymentUpdate> for WebhookPayload {
    fn from(update: &PaymentUpdate) -> Self {
        Self {
            payment_id: update.payment_id,
            pay_amount: wei_to_eth(update.pay_amount).ok(),
            pay_amount_wei: update.pay_amount,
            pay_currency: NATIVE_SYMBOL,
            actual_pay_amount: wei_to_eth(update.amount_received).ok(),
            actual_pay_amount_wei: update.amount_received,
            payment_state: update.state,
            forwarding_tx_hash: update.forwarding_tx_hash,
        }
    }
}

/// Pushes state updates to the merchant backend.
#[derive(Clone, Debug)]
pub struct WebhookNotifier {
    http_client: reqwest::Client,
    endpoint: Url,
}

impl WebhookNotifier {
    pub fn new(base_url: Url) -> GatewayResult<Self> {
        let endpoint = base_url
            .join("payment/update")
            .map_err(|e| GatewayError::ConfigError(format!("webhook url: {}", e)))?;
        let http_client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(2))
            .timeout(Duration::from_secs(10))
            .build()
            .map_err(|e| GatewayError::ConfigError(format!("webhook client: {}", e)))?;
        Ok(Self {
            http_client,
            endpoint,
        })
    }
}

#[async_trait]
impl PaymentNotifier for WebhookNotifier {
    async fn notify(&self, update: &PaymentUpdate) -> GatewayResult<()> {
        let payload = WebhookPayload::from(update);
        let response = self
            .http_client
            .put(self.endpoint.clone())
            .json(&payload)
            .send()
            .await
            .map_err(|e| GatewayError::NotificationError(e.to_string()))?;
        if !response.status().is_success() {
            return Err(GatewayError::NotificationError(format!(
                "webhook answered {} for payment {}",
                response.status(),
                update.payment_id
            )));
        }
        Ok(())
    }
}
