// Copyright (c) Starcoin, Inc.
// SPDX-License-Identifier: Apache-2.0

use prometheus::{
    register_histogram_vec_with_registry, register_int_counter_vec_with_registry,
    register_int_counter_with_registry, register_int_gauge_vec_with_registry, HistogramVec,
    IntCounter, IntCounterVec, IntGaugeVec, Registry,
};

const RPC_LATENCY_SEC_BUCKETS: &[f64] = &[
    0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0,
];

#[derive(Clone, Debug)]
pub struct GatewayMetrics {
    pub(crate) payments_created: IntCounterVec,
    pub(crate) payment_transitions: IntCounterVec,

    pub(crate) forwards_submitted: IntCounterVec,
    pub(crate) forward_failures: IntCounterVec,
    pub(crate) sweeps_submitted: IntCounterVec,
    pub(crate) nonce_refreshes: IntCounterVec,
    pub(crate) reorgs_detected: IntCounterVec,
    pub(crate) accounts_created: IntCounterVec,

    pub(crate) webhook_failures: IntCounter,
    pub(crate) errors: IntCounterVec,

    pub(crate) last_processed_block: IntGaugeVec,

    pub(crate) rpc_queries: IntCounterVec,
    pub(crate) rpc_queries_latency: HistogramVec,

    pub(crate) requests_received: IntCounterVec,
    pub(crate) requests_ok: IntCounterVec,
    pub(crate) err_requests: IntCounterVec,
    pub(crate) requests_inflight: IntGaugeVec,
}

impl GatewayMetrics {
    pub fn new(registry: &Registry) -> Self {
        Self {
            payments_created: register_int_counter_vec_with_registry!(
                "gateway_payments_created",
                "Total number of payments created",
                &["mode"],
                registry,
            )
            .unwrap(),
            payment_transitions: register_int_counter_vec_with_registry!(
                "gateway_payment_transitions",
                "Total number of persisted payment state transitions by target state",
                &["mode", "state"],
                registry,
            )
            .unwrap(),
            forwards_submitted: register_int_counter_vec_with_registry!(
                "gateway_forwards_submitted",
                "Total number of forwarding transactions submitted",
                &["mode"],
                registry,
            )
            .unwrap(),
            forward_failures: register_int_counter_vec_with_registry!(
                "gateway_forward_failures",
                "Total number of failed forwarding attempts",
                &["mode"],
                registry,
            )
            .unwrap(),
            sweeps_submitted: register_int_counter_vec_with_registry!(
                "gateway_sweeps_submitted",
                "Total number of earnings sweeps submitted to the treasury",
                &["mode"],
                registry,
            )
            .unwrap(),
            nonce_refreshes: register_int_counter_vec_with_registry!(
                "gateway_nonce_refreshes",
                "Total number of nonce refreshes after a nonce-too-low rejection",
                &["mode"],
                registry,
            )
            .unwrap(),
            reorgs_detected: register_int_counter_vec_with_registry!(
                "gateway_reorgs_detected",
                "Total number of vanished deposit blocks or forwarding receipts",
                &["mode", "direction"],
                registry,
            )
            .unwrap(),
            accounts_created: register_int_counter_vec_with_registry!(
                "gateway_accounts_created",
                "Total number of signing accounts generated",
                &["mode"],
                registry,
            )
            .unwrap(),
            webhook_failures: register_int_counter_with_registry!(
                "gateway_webhook_failures",
                "Total number of failed merchant webhook deliveries",
                registry,
            )
            .unwrap(),
            errors: register_int_counter_vec_with_registry!(
                "gateway_errors",
                "Total number of errors by error type",
                &["error_type"],
                registry,
            )
            .unwrap(),
            last_processed_block: register_int_gauge_vec_with_registry!(
                "gateway_last_processed_block",
                "Latest block handed to the payment engine",
                &["mode"],
                registry,
            )
            .unwrap(),
            rpc_queries: register_int_counter_vec_with_registry!(
                "gateway_eth_rpc_queries",
                "Total number of queries issued to eth provider, by request type",
                &["type"],
                registry,
            )
            .unwrap(),
            rpc_queries_latency: register_histogram_vec_with_registry!(
                "gateway_eth_rpc_queries_latency",
                "Latency of queries issued to eth provider, by request type",
                &["type"],
                RPC_LATENCY_SEC_BUCKETS.to_vec(),
                registry,
            )
            .unwrap(),
            requests_received: register_int_counter_vec_with_registry!(
                "gateway_requests_received",
                "Total number of HTTP requests received, by route",
                &["type"],
                registry,
            )
            .unwrap(),
            requests_ok: register_int_counter_vec_with_registry!(
                "gateway_requests_ok",
                "Total number of HTTP requests handled successfully, by route",
                &["type"],
                registry,
            )
            .unwrap(),
            err_requests: register_int_counter_vec_with_registry!(
                "gateway_err_requests",
                "Total number of HTTP requests that failed, by route",
                &["type"],
                registry,
            )
            .unwrap(),
            requests_inflight: register_int_gauge_vec_with_registry!(
                "gateway_requests_inflight",
                "Number of HTTP requests in flight, by route",
                &["type"],
                registry,
            )
            .unwrap(),
        }
    }

    pub fn new_for_testing() -> Self {
        let registry = Registry::new();
        Self::new(&registry)
    }
}
