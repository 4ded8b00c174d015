// Copyright (c) Starcoin, Inc.
// SPDX-License-Identifier: Apache-2.0

//! Configuration types for confirmation checking

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct ConfirmationConfig {
    /// Descendants the deposit block needs before funds are forwarded.
    #[serde(default = "default_incoming_confirmations")]
    pub incoming_confirmations: u64,

    /// Descendants the forwarding receipt block needs before the payment finishes.
    #[serde(default = "default_outgoing_confirmations")]
    pub outgoing_confirmations: u64,
}

fn default_incoming_confirmations() -> u64 {
    12
}

fn default_outgoing_confirmations() -> u64 {
    3
}

impl Default for ConfirmationConfig {
    fn default() -> Self {
        Self::mainnet()
    }
}

impl ConfirmationConfig {
    pub fn mainnet() -> Self {
        Self {
            incoming_confirmations: default_incoming_confirmations(),
            outgoing_confirmations: default_outgoing_confirmations(),
        }
    }

    /// Faster settings for public test networks
    pub fn testnet() -> Self {
        Self {
            incoming_confirmations: 6,
            outgoing_confirmations: 2,
        }
    }

    /// Instant-mining dev chains
    pub fn local() -> Self {
        Self {
            incoming_confirmations: 1,
            outgoing_confirmations: 1,
        }
    }

    /// Builder: set incoming confirmations
    pub fn with_incoming_confirmations(mut self, blocks: u64) -> Self {
        self.incoming_confirmations = blocks;
        self
    }

    /// Builder: set outgoing confirmations
    pub fn with_outgoing_confirmations(mut self, blocks: u64) -> Self {
        self.outgoing_confirmations = blocks;
        self
    }
}
