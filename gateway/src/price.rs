// Copyright (c) Starcoin, Inc.
// SPDX-License-Identifier: Apache-2.0

use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use url::Url;

use crate::error::{GatewayError, GatewayResult};
use crate::types::NetworkMode;

/// Symbol of the native currency every quote is converted into.
pub const NATIVE_SYMBOL: &str = "ETH";

#[async_trait]
pub trait PriceOracle: Send + Sync {
    /// Converts `amount` of fiat `currency` into the native currency.
    async fn to_native(&self, amount: f64, currency: &str) -> GatewayResult<f64>;
}

#[derive(Debug, Deserialize)]
struct PriceConversionResponse {
    price: f64,
}

/// Client of the price conversion service.
#[derive(Clone, Debug)]
pub struct HttpPriceOracle {
    http_client: reqwest::Client,
    base_url: Url,
}

impl HttpPriceOracle {
    pub fn new(base_url: Url) -> GatewayResult<Self> {
        let http_client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(2))
            .timeout(Duration::from_secs(10))
            .build()
            .map_err(|e| GatewayError::ConfigError(format!("price client: {}", e)))?;
        Ok(Self {
            http_client,
            base_url,
        })
    }

    fn conversion_url(&self, amount: f64, currency: &str) -> GatewayResult<Url> {
        let mut url = self
            .base_url
            .join("price-conversion")
            .map_err(|e| GatewayError::ConfigError(format!("price service url: {}", e)))?;
        url.query_pairs_mut()
            .append_pair("amount", &amount.to_string())
            .append_pair("src_currency", currency)
            .append_pair("dst_currency", NATIVE_SYMBOL)
            // test networks are quoted at main net prices
            .append_pair("mode", &NetworkMode::Main.to_string());
        Ok(url)
    }
}

#[async_trait]
impl PriceOracle for HttpPriceOracle {
    async fn to_native(&self, amount: f64, currency: &str) -> GatewayResult<f64> {
        let url = self.conversion_url(amount, currency)?;
        let response = self
            .http_client
            .get(url)
            .send()
            .await
            .map_err(|e| GatewayError::PriceConversionError(e.to_string()))?;
        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(GatewayError::PriceConversionError(format!(
                "HTTP error: {} - {}",
                status, body
            )));
        }
        let conversion: PriceConversionResponse = response
            .json()
            .await
            .map_err(|e| GatewayError::PriceConversionError(e.to_string()))?;
        if !conversion.price.is_finite() || conversion.price <= 0.0 {
            return Err(GatewayError::PriceConversionError(format!(
                "{} {} converted to non-positive {} {}",
                amount, currency, conversion.price, NATIVE_SYMBOL
            )));
        }
        tracing::debug!(
            "{} {} = {} {}",
            amount,
            currency,
            conversion.price,
            NATIVE_SYMBOL
        );
        Ok(conversion.price)
    }
}
