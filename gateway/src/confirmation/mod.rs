// Copyright (c) Starcoin, Inc.
// SPDX-License-Identifier: Apache-2.0

//! Depth based confirmation of deposits and forwarding transactions
//!
//! Both directions are decided by counting blocks on top of a stored anchor
//! instead of replaying events, so the RPC cost of a check does not grow with
//! the number of transfers an address received.
//!
//! - **Incoming**: a `Paid` deposit is final once the anchor block has
//!   `incoming_confirmations` descendants and is still retrievable by hash.
//! - **Outgoing**: a forward is final once its receipt reports success and
//!   the receipt block has `outgoing_confirmations` descendants.
//!
//! ```ignore
//! let tracker = DepthConfirmationTracker::new(client, "main", ConfirmationConfig::mainnet());
//! match tracker.check_incoming(anchor, head).await? {
//!     IncomingVerdict::Confirmed => { /* forward */ }
//!     IncomingVerdict::Reorged => { /* re-check live balance */ }
//!     IncomingVerdict::Pending { .. } => {}
//! }
//! ```

mod checker;
mod config;
mod tracker;

pub use checker::{
    ConfirmationChecker, ConfirmationError, ConfirmationResult, IncomingVerdict, OutgoingVerdict,
};
pub use config::ConfirmationConfig;
pub use tracker::DepthConfirmationTracker;
