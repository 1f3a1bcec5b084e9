// Copyright (c) Mysten Labs, Inc.
// SPDX-License-Identifier: Apache-2.0

//! Core types shared between the Meridian cluster and its clients.

pub mod keys;
pub mod messages;
pub mod range;
pub mod ts;

/// Identifier of a storage node.
pub type StoreId = u64;
/// Identifier of a region.
pub type RegionId = u64;
/// Identifier of a cluster.
pub type ClusterId = u64;
/// A hybrid-logical-clock timestamp; see [`ts`] for its layout.
pub type Timestamp = u64;

pub use range::{BackedUpRange, Range, RangeTree};
