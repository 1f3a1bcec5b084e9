// Copyright (c) Mysten Labs, Inc.
// SPDX-License-Identifier: Apache-2.0

//! Errors surfaced by the backup coordinator.

use meridian_core::{ClusterId, StoreId};

use crate::backoff::BudgetExceeded;

/// Result type of the backup coordinator.
pub type Result<T, E = BackupError> = std::result::Result<T, E>;

/// Error raised while coordinating a backup.
#[derive(Debug, thiserror::Error)]
#[error(transparent)]
pub struct BackupError {
    #[from]
    kind: ErrorKind,
}

impl BackupError {
    /// Returns the kind of this error.
    pub fn kind(&self) -> &ErrorKind {
        &self.kind
    }

    /// True iff this error means a store's RPC endpoint could not be reached.
    pub fn is_failed_to_connect(&self) -> bool {
        matches!(self.kind, ErrorKind::FailedToConnect { .. })
    }

    pub(crate) fn invalid_argument(message: impl Into<String>) -> Self {
        ErrorKind::InvalidArgument(message.into()).into()
    }

    pub(crate) fn kv_unknown(store_id: StoreId, message: impl Into<String>) -> Self {
        ErrorKind::KvUnknown {
            store_id,
            message: message.into(),
        }
        .into()
    }

    pub(crate) fn other(error: anyhow::Error) -> Self {
        ErrorKind::Other(error).into()
    }
}

/// The failure classes observable to callers.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum ErrorKind {
    /// The caller asked for something the cluster cannot provide.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// Leader lookup exhausted its attempts without finding one.
    #[error("no region leader found for the requested key")]
    NoLeader,

    /// A store answered for a different cluster than the request targets.
    #[error(
        "cluster ID mismatch on store {store_id}: requested {request}, store reports {current}"
    )]
    ClusterIdMismatch {
        store_id: StoreId,
        request: ClusterId,
        current: ClusterId,
    },

    /// A store reported an error the coordinator cannot recover from.
    #[error("unrecoverable error from store {store_id}: {message}")]
    KvUnknown { store_id: StoreId, message: String },

    /// A store's RPC endpoint could not be reached or kept alive.
    #[error("failed to connect to store {store_id}")]
    FailedToConnect {
        store_id: StoreId,
        #[source]
        source: anyhow::Error,
    },

    /// The fine-grained phase slept past its cumulative budget.
    #[error("fine-grained backoff budget exhausted")]
    BackoffExhausted(#[source] BudgetExceeded),

    /// The external object store failed.
    #[error("external storage error")]
    Storage(#[source] anyhow::Error),

    /// The manifest writer failed.
    #[error("failed to append to the backup manifest")]
    Manifest(#[source] anyhow::Error),

    /// The placement service failed or answered inconsistently.
    #[error("placement service error: {0}")]
    Placement(String),

    #[error(transparent)]
    Other(anyhow::Error),
}
