// Copyright (c) Starcoin, Inc.
// SPDX-License-Identifier: Apache-2.0

use ethers::providers::ProviderError;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GatewayError {
    // Transient Ethereum provider error, retried on the next tick
    TransientProviderError(String),
    // Ethereum provider error that retrying will not fix
    ProviderError(String),
    // Block is no longer retrievable (pruned or reorged away)
    BlockNotFound(String),
    // The referenced transaction does not exist
    TxNotFound(String),
    // The referenced transaction was mined but failed
    TxFailed(String),
    // Submission rejected because the account nonce is stale
    NonceTooLow(String),
    // Requested amount cannot cover the forwarding fees
    AmountTooLow(String),
    // Net forward amount after fee and earnings is not positive
    InsufficientForwardAmount(String),
    // Payment is not in a state that allows the requested transition
    InvalidStateTransition(String),
    // Storage Error
    StorageError(String),
    // Key generation, encryption or signing failure
    CryptoError(String),
    // Converting a wei amount to a float would lose precision
    LossyConversion(String),
    // Malformed Ethereum address
    InvalidAddress(String),
    // Price service could not convert the fiat amount
    PriceConversionError(String),
    // Webhook delivery failure
    NotificationError(String),
    // Invalid or missing configuration
    ConfigError(String),
    // Internal gateway error
    InternalError(String),
    // Uncategorized error
    Generic(String),
}

impl GatewayError {
    /// Returns a short string identifying the error type for metrics labels
    pub fn error_type(&self) -> &'static str {
        match self {
            GatewayError::TransientProviderError(_) => "transient_provider_error",
            GatewayError::ProviderError(_) => "provider_error",
            GatewayError::BlockNotFound(_) => "block_not_found",
            GatewayError::TxNotFound(_) => "tx_not_found",
            GatewayError::TxFailed(_) => "tx_failed",
            GatewayError::NonceTooLow(_) => "nonce_too_low",
            GatewayError::AmountTooLow(_) => "amount_too_low",
            GatewayError::InsufficientForwardAmount(_) => "insufficient_forward_amount",
            GatewayError::InvalidStateTransition(_) => "invalid_state_transition",
            GatewayError::StorageError(_) => "storage_error",
            GatewayError::CryptoError(_) => "crypto_error",
            GatewayError::LossyConversion(_) => "lossy_conversion",
            GatewayError::InvalidAddress(_) => "invalid_address",
            GatewayError::PriceConversionError(_) => "price_conversion_error",
            GatewayError::NotificationError(_) => "notification_error",
            GatewayError::ConfigError(_) => "config_error",
            GatewayError::InternalError(_) => "internal_error",
            GatewayError::Generic(_) => "generic",
        }
    }

    /// RPC failures that leave no state behind and are simply retried next block.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            GatewayError::TransientProviderError(_)
                | GatewayError::BlockNotFound(_)
                | GatewayError::TxNotFound(_)
        )
    }
}

impl std::fmt::Display for GatewayError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}", self)
    }
}

impl std::error::Error for GatewayError {}

impl From<ProviderError> for GatewayError {
    fn from(e: ProviderError) -> Self {
        let message = e.to_string();
        if message.to_lowercase().contains("nonce too low") {
            GatewayError::NonceTooLow(message)
        } else {
            GatewayError::TransientProviderError(message)
        }
    }
}

pub type GatewayResult<T> = Result<T, GatewayError>;
