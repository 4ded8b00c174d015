// Copyright (c) Starcoin, Inc.
// SPDX-License-Identifier: Apache-2.0

use crate::metrics::GatewayMetrics;
use ethers::providers::{Http, HttpClientError, JsonRpcClient, Provider};
use serde::{de::DeserializeOwned, Serialize};
use std::fmt::Debug;
use std::sync::Arc;
use std::time::Duration;
use url::{ParseError, Url};

/// Retries granted to a request the provider rejected for rate limiting.
const MAX_RATE_LIMIT_RETRIES: u32 = 3;

#[derive(Debug, Clone)]
pub struct MeteredEthHttpProvider {
    inner: Http,
    metrics: Arc<GatewayMetrics>,
}

fn is_rate_limited(error: &HttpClientError) -> bool {
    // Hosted nodes answer with non-standard bodies such as
    // {"code":-32005,"message":"Too Many Requests"}.
    let error_str = format!("{:?}", error).to_lowercase();
    error_str.contains("rate limit")
        || error_str.contains("429")
        || error_str.contains("too many requests")
        || error_str.contains("-32005")
}

#[cfg_attr(target_arch = "wasm32", async_trait(?Send))]
#[cfg_attr(not(target_arch = "wasm32"), async_trait::async_trait)]
impl JsonRpcClient for MeteredEthHttpProvider {
    type Error = HttpClientError;

    async fn request<T: Serialize + Send + Sync + Debug, R: DeserializeOwned + Send>(
        &self,
        method: &str,
        params: T,
    ) -> Result<R, HttpClientError> {
        self.metrics.rpc_queries.with_label_values(&[method]).inc();
        let _guard = self
            .metrics
            .rpc_queries_latency
            .with_label_values(&[method])
            .start_timer();

        let mut result = self.inner.request(method, &params).await;
        let mut retry_count = 0;
        while retry_count < MAX_RATE_LIMIT_RETRIES {
            match &result {
                Err(e) if is_rate_limited(e) => {}
                _ => break,
            }
            // 1s, 2s, 4s
            let backoff_duration = Duration::from_secs(1 << retry_count);
            tracing::warn!(
                "Rate limited on {}, retrying after {:?} (attempt {}/{})",
                method,
                backoff_duration,
                retry_count + 1,
                MAX_RATE_LIMIT_RETRIES
            );
            tokio::time::sleep(backoff_duration).await;
            result = self.inner.request(method, &params).await;
            retry_count += 1;
        }
        result
    }
}

impl MeteredEthHttpProvider {
    pub fn new(url: impl Into<Url>, metrics: Arc<GatewayMetrics>) -> Self {
        Self {
            inner: Http::new(url),
            metrics,
        }
    }
}

pub fn new_metered_eth_provider(
    url: &str,
    metrics: Arc<GatewayMetrics>,
) -> Result<Provider<MeteredEthHttpProvider>, ParseError> {
    let http_provider = MeteredEthHttpProvider::new(Url::parse(url)?, metrics);
    Ok(Provider::new(http_provider))
}
