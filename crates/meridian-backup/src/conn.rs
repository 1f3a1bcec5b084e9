// Copyright (c) Mysten Labs, Inc.
// SPDX-License-Identifier: Apache-2.0

//! Connections to storage nodes.
//!
//! The coordinator never dials stores itself: a [`ConnectionManager`] owns a
//! cache of per-store channels and can replace one whose underlying transport
//! has gone bad. Both sides of the seam speak `tonic` status codes, so stream
//! teardowns keep their gRPC classification all the way up to the retry loop.

use std::sync::Arc;

use async_trait::async_trait;
use futures::stream::BoxStream;
use tonic::Status;

use meridian_core::{
    messages::{BackupRequest, BackupResponse},
    StoreId,
};

use crate::{
    error::Result,
    placement::{LockResolver, PlacementClient},
};

/// The server-streamed response sequence of one `Backup` call.
pub type BackupStream = BoxStream<'static, std::result::Result<BackupResponse, Status>>;

/// The per-store backup RPC stub.
#[async_trait]
pub trait BackupClient: Send + Sync {
    /// Opens the server-streaming backup call. The stream ends (returns
    /// `None`) once the store has reported every sub-range it completed; it
    /// may be torn down with an error status at any point before that.
    async fn backup(&self, request: BackupRequest) -> std::result::Result<BackupStream, Status>;
}

/// Owner of the cached RPC channels and cluster-level collaborators.
#[async_trait]
pub trait ConnectionManager: Send + Sync {
    /// Returns the cached backup client for `store_id`, dialing on first use.
    ///
    /// Unreachable stores surface as
    /// [`ErrorKind::FailedToConnect`](crate::ErrorKind::FailedToConnect).
    async fn backup_client(&self, store_id: StoreId) -> Result<Arc<dyn BackupClient>>;

    /// Drops the cached channel for `store_id` and dials a fresh one.
    async fn reset_backup_client(&self, store_id: StoreId) -> Result<Arc<dyn BackupClient>>;

    /// The placement service of the cluster.
    fn placement(&self) -> Arc<dyn PlacementClient>;

    /// The shared lock resolver.
    fn lock_resolver(&self) -> Arc<dyn LockResolver>;
}
