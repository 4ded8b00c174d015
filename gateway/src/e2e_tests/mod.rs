// Copyright (c) Starcoin, Inc.
// SPDX-License-Identifier: Apache-2.0

//! Whole-lifecycle payment flows over the in-memory chain and store.
