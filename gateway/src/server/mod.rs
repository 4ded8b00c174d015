// Copyright (c) Starcoin, Inc.
// SPDX-License-Identifier: Apache-2.0

use std::net::SocketAddr;
use std::str::FromStr;
use std::sync::Arc;

use axum::{
    extract::State,
    http::{header, StatusCode},
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use chrono::{DateTime, Utc};
use ethers::types::{Address as EthAddress, U256};
use prometheus::{Encoder, Registry, TextEncoder};
use serde::{Deserialize, Serialize};
use serde_with::{serde_as, DisplayFromStr};
use tokio_util::sync::CancellationToken;
use tracing::{info, instrument};
use uuid::Uuid;

use crate::error::GatewayError;
use crate::metrics::GatewayMetrics;
use crate::payment::PaymentEngine;
use crate::types::NetworkMode;
use crate::with_metrics;

pub const HEALTH_PATH: &str = "/health";
pub const METRICS_PATH: &str = "/metrics";
pub const PAYMENTS_PATH: &str = "/api/payments";

type ServerState = (Arc<PaymentEngine>, Arc<GatewayMetrics>, Registry);

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreatePaymentRequest {
    pub mode: NetworkMode,
    pub price_amount: f64,
    pub price_currency: String,
    pub wallet: String,
}

#[serde_as]
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CreatePaymentResponse {
    pub id: Uuid,
    pub address: EthAddress,
    // Wei, as a decimal string.
    #[serde_as(as = "DisplayFromStr")]
    pub pay_amount: U256,
    pub mode: NetworkMode,
    pub expires_at: DateTime<Utc>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorBody {
    pub error: String,
    pub message: String,
}

pub fn run_server(
    socket_address: &SocketAddr,
    engine: Arc<PaymentEngine>,
    metrics: Arc<GatewayMetrics>,
    registry: Registry,
    cancel: CancellationToken,
) -> tokio::task::JoinHandle<()> {
    let socket_address = *socket_address;
    tokio::spawn(async move {
        let listener = match tokio::net::TcpListener::bind(socket_address).await {
            Ok(listener) => listener,
            Err(e) => {
                tracing::error!("Failed to bind HTTP server to {}: {}", socket_address, e);
                return;
            }
        };
        info!("HTTP server listening on {}", socket_address);
        if let Err(e) = axum::serve(
            listener,
            make_router(engine, metrics, registry).into_make_service(),
        )
        .with_graceful_shutdown(cancel.cancelled_owned())
        .await
        {
            tracing::error!("HTTP server stopped: {}", e);
        }
    })
}

pub(crate) fn make_router(
    engine: Arc<PaymentEngine>,
    metrics: Arc<GatewayMetrics>,
    registry: Registry,
) -> Router {
    Router::new()
        .route("/", get(health_check))
        .route(HEALTH_PATH, get(health_check))
        .route(METRICS_PATH, get(export_metrics))
        .route(PAYMENTS_PATH, post(create_payment))
        .with_state((engine, metrics, registry))
}

impl IntoResponse for GatewayError {
    fn into_response(self) -> axum::response::Response {
        let status = match &self {
            GatewayError::InvalidAddress(_)
            | GatewayError::AmountTooLow(_)
            | GatewayError::ConfigError(_) => StatusCode::BAD_REQUEST,
            GatewayError::PriceConversionError(_) => StatusCode::BAD_GATEWAY,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        let body = ErrorBody {
            error: self.error_type().to_string(),
            message: self.to_string(),
        };
        (status, Json(body)).into_response()
    }
}

async fn health_check() -> StatusCode {
    StatusCode::OK
}

async fn export_metrics(State((_, _, registry)): State<ServerState>) -> impl IntoResponse {
    let encoder = TextEncoder::new();
    let mut buffer = Vec::new();
    if let Err(e) = encoder.encode(&registry.gather(), &mut buffer) {
        return (
            StatusCode::INTERNAL_SERVER_ERROR,
            [(header::CONTENT_TYPE, "text/plain".to_string())],
            format!("Failed to encode metrics: {}", e).into_bytes(),
        );
    }
    (
        StatusCode::OK,
        [(header::CONTENT_TYPE, encoder.format_type().to_string())],
        buffer,
    )
}

#[instrument(level = "error", skip_all)]
async fn create_payment(
    State((engine, metrics, _)): State<ServerState>,
    Json(request): Json<CreatePaymentRequest>,
) -> Result<(StatusCode, Json<CreatePaymentResponse>), GatewayError> {
    let future = async {
        let wallet = EthAddress::from_str(&request.wallet).map_err(|e| {
            GatewayError::InvalidAddress(format!("{}: {}", request.wallet, e))
        })?;
        let payment = engine
            .create_payment(
                request.mode,
                request.price_amount,
                &request.price_currency,
                wallet,
            )
            .await?;
        Ok((
            StatusCode::CREATED,
            Json(CreatePaymentResponse {
                id: payment.id,
                address: payment.account.address,
                pay_amount: payment.pay_amount(),
                mode: payment.mode,
                expires_at: payment.expires_at(engine.payment_timeout()),
            }),
        ))
    };
    with_metrics!(metrics, "create_payment", future).await
}

#[macro_export]
macro_rules! with_metrics {
    ($metrics:expr, $type_:expr, $func:expr) => {
        async move {
            info!("Received {} request", $type_);
            $metrics
                .requests_received
                .with_label_values(&[$type_])
                .inc();
            $metrics
                .requests_inflight
                .with_label_values(&[$type_])
                .inc();

            let result = $func.await;

            match &result {
                Ok(_) => {
                    info!("{} request succeeded", $type_);
                    $metrics.requests_ok.with_label_values(&[$type_]).inc();
                }
                Err(e) => {
                    info!("{} request failed: {:?}", $type_, e);
                    $metrics.err_requests.with_label_values(&[$type_]).inc();
                }
            }

            $metrics
                .requests_inflight
                .with_label_values(&[$type_])
                .dec();
            result
        }
    };
}
