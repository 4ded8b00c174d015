// Copyright (c) Starcoin, Inc.
// SPDX-License-Identifier: Apache-2.0

//! Wei arithmetic for quoting, forwarding and sweeping.
//!
//! Every amount that moves money is a `U256` in wei. Floats only appear at the
//! two edges: the price service quote coming in and the webhook payload going
//! out, and both conversions are checked here.

use crate::error::{GatewayError, GatewayResult};
use ethers::types::U256;
use ethers::utils::format_ether;

/// Gas used by a plain value transfer.
pub const TRANSFER_GAS_LIMIT: u64 = 21_000;

const WEI_PER_ETH: f64 = 1e18;

/// Cost of one transfer at `gas_price`.
pub fn network_fee(gas_price: U256) -> U256 {
    gas_price.saturating_mul(U256::from(TRANSFER_GAS_LIMIT))
}

/// Platform cut, truncated towards zero.
pub fn platform_earnings(pay_amount: U256, earnings_percent: u64) -> U256 {
    pay_amount.saturating_mul(U256::from(earnings_percent)) / U256::from(100u64)
}

/// Remainder an account must hold before its earnings are swept.
pub fn sweep_threshold(gas_price: U256, fee_factor: u64) -> U256 {
    network_fee(gas_price).saturating_mul(U256::from(fee_factor))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ForwardAmounts {
    pub network_fee: U256,
    pub platform_earnings: U256,
    /// What the merchant receives.
    pub net_amount: U256,
}

/// Splits `pay_amount` into fee, earnings and the merchant's share. Fails when
/// nothing positive would be left for the merchant.
pub fn forward_amounts(
    pay_amount: U256,
    gas_price: U256,
    earnings_percent: u64,
) -> GatewayResult<ForwardAmounts> {
    let network_fee = network_fee(gas_price);
    let platform_earnings = platform_earnings(pay_amount, earnings_percent);
    let deductions = network_fee.saturating_add(platform_earnings);
    if pay_amount <= deductions {
        return Err(GatewayError::InsufficientForwardAmount(format!(
            "pay amount {} does not cover fee {} and earnings {}",
            pay_amount, network_fee, platform_earnings
        )));
    }
    Ok(ForwardAmounts {
        network_fee,
        platform_earnings,
        net_amount: pay_amount - deductions,
    })
}

/// Creation-time guard: a payment must be worth more than two transfers.
pub fn check_amount_not_too_low(pay_amount: U256, gas_price: U256) -> GatewayResult<()> {
    let minimum = network_fee(gas_price).saturating_mul(U256::from(2u64));
    if pay_amount <= minimum {
        return Err(GatewayError::AmountTooLow(format!(
            "requested amount {} wei is too low, fees are {} wei",
            pay_amount, minimum
        )));
    }
    Ok(())
}

/// Converts an ETH quote to wei. The product is taken at double precision and
/// any fractional wei rounds up so a quote never under-charges.
pub fn eth_to_wei_ceil(eth: f64) -> GatewayResult<U256> {
    if !eth.is_finite() || eth < 0.0 {
        return Err(GatewayError::PriceConversionError(format!(
            "invalid ETH amount {}",
            eth
        )));
    }
    let wei = (eth * WEI_PER_ETH).ceil();
    if !wei.is_finite() {
        return Err(GatewayError::PriceConversionError(format!(
            "ETH amount {} out of range",
            eth
        )));
    }
    // `{:.0}` prints the exact integer value of an integral f64.
    U256::from_dec_str(&format!("{:.0}", wei))
        .map_err(|e| GatewayError::PriceConversionError(format!("{} ETH: {}", eth, e)))
}

/// Converts wei to ETH for display. Refuses amounts the float cannot carry
/// back to the identical wei value.
pub fn wei_to_eth(wei: U256) -> GatewayResult<f64> {
    let eth: f64 = format_ether(wei)
        .parse()
        .map_err(|e| GatewayError::LossyConversion(format!("{} wei: {}", wei, e)))?;
    match eth_to_wei_ceil(eth) {
        Ok(back) if back == wei => Ok(eth),
        _ => Err(GatewayError::LossyConversion(format!(
            "{} wei is not representable as an exact ETH float ({})",
            wei, eth
        ))),
    }
}
