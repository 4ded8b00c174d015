// Copyright (c) Starcoin, Inc.
// SPDX-License-Identifier: Apache-2.0

#![allow(clippy::too_many_arguments)]

pub mod account_pool;
pub mod amount;
pub mod config;
pub mod confirmation;
pub mod crypto;
pub mod earnings;
pub mod error;
pub mod eth_client;
pub mod forwarder;
pub mod listener;
pub mod metered_eth_provider;
pub mod metrics;
pub mod node;
pub mod notifier;
pub mod payment;
pub mod price;
pub mod server;
pub mod storage;
pub mod ttl_cache;
pub mod types;

#[cfg(test)]
pub mod test_utils;

#[cfg(test)]
mod e2e_tests;

#[macro_export]
macro_rules! retry_with_max_elapsed_time {
    ($func:expr, $max_elapsed_time:expr) => {{
        // Delays of 0.4, 0.8, 1.6 ... seconds with jitter, capped at 120s between attempts.
        let backoff = backoff::ExponentialBackoff {
            initial_interval: Duration::from_millis(400),
            randomization_factor: 0.1,
            multiplier: 2.0,
            max_interval: Duration::from_secs(120),
            max_elapsed_time: Some($max_elapsed_time),
            ..Default::default()
        };
        backoff::future::retry(backoff, || {
            let fut = async {
                let result = $func.await;
                match result {
                    Ok(_) => {
                        return Ok(result);
                    }
                    Err(e) => {
                        // Every error counts as transient until max_elapsed_time runs out.
                        tracing::debug!("Retrying due to error: {:?}", e);
                        return Err(backoff::Error::transient(e));
                    }
                }
            };
            std::boxed::Box::pin(fut)
        })
        .await
    }};
}
