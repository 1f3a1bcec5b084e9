// Copyright (c) Mysten Labs, Inc.
// SPDX-License-Identifier: Apache-2.0

//! Backup coordinator for the Meridian distributed key-value store.
//!
//! The coordinator instructs every storage node to snapshot its share of a
//! key interval at a fixed transactional timestamp and collects the produced
//! file metadata into a manifest on external storage. Backup of one range
//! runs in two phases:
//!
//! 1. **Push-down** ([`push`]): the same request is fanned out to every
//!    store in parallel and the streamed per-sub-range completions are
//!    drained into a coverage tree.
//! 2. **Fine-grained** ([`fine_grained`]): the gaps left in the tree are
//!    re-fetched from the current leader of each missing region, with lock
//!    resolution and backoff, until the tree is complete.
//!
//! Connections to storage nodes are owned by a [`conn::ConnectionManager`];
//! the cluster directory, timestamp oracle, and safepoint registry sit behind
//! [`placement::PlacementClient`].

pub mod backoff;
pub mod client;
pub mod config;
pub mod conn;
pub mod error;
mod fine_grained;
mod node;
pub mod placement;
mod push;
mod response;
pub mod storage;
pub mod test_utils;

pub use client::{Client, ProgressCallback, ProgressUnit};
pub use config::BackupConfig;
pub use error::{BackupError, ErrorKind, Result};
