// Copyright (c) Mysten Labs, Inc.
// SPDX-License-Identifier: Apache-2.0

//! Hybrid-logical timestamps issued by the placement service.
//!
//! A [`Timestamp`](crate::Timestamp) packs a physical wall-clock component in
//! milliseconds into the high bits and an 18-bit logical counter into the low
//! bits. Timestamps are totally ordered and monotonic across the cluster.

use crate::Timestamp;

const PHYSICAL_SHIFT_BITS: u32 = 18;
const LOGICAL_MASK: u64 = (1 << PHYSICAL_SHIFT_BITS) - 1;

/// Composes a timestamp from its physical (milliseconds) and logical parts.
pub fn compose(physical_ms: u64, logical: u64) -> Timestamp {
    (physical_ms << PHYSICAL_SHIFT_BITS) | (logical & LOGICAL_MASK)
}

/// Extracts the physical component in milliseconds.
pub fn physical(ts: Timestamp) -> u64 {
    ts >> PHYSICAL_SHIFT_BITS
}

/// Extracts the logical counter.
pub fn logical(ts: Timestamp) -> u64 {
    ts & LOGICAL_MASK
}
