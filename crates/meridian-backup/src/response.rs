// Copyright (c) Mysten Labs, Inc.
// SPDX-License-Identifier: Apache-2.0

//! Classification of streamed backup responses.

use meridian_core::{
    messages::{BackupResponse, KvError, RegionError, ResponseError},
    StoreId, Timestamp,
};

use crate::{
    error::{BackupError, ErrorKind, Result},
    placement::LockResolver,
};

/// Backoff applied after a recoverable region error.
const REGION_ERROR_BACKOFF_MS: u64 = 1_000;
/// Backoff applied after a transient object-store failure on the store side.
const STORAGE_ERROR_BACKOFF_MS: u64 = 3_000;

/// Message fragments identifying transient object-store failures. The stores
/// report these as unstructured text, so classification is by substring.
const RETRYABLE_STORAGE_ERRORS: &[&str] = &[
    "server closed",
    "connection refused",
    "connection reset by peer",
    "channel closed",
    "error trying to connect",
    "connection closed before message completed",
    "broken pipe",
    "timeout awaiting response",
    "retryable storage error",
];

pub(crate) fn message_is_retryable_storage_error(message: &str) -> bool {
    let message = message.to_lowercase();
    RETRYABLE_STORAGE_ERRORS
        .iter()
        .any(|fragment| message.contains(fragment))
}

/// Region errors the cluster recovers from on its own; everything else
/// reported under [`ResponseError::Region`] is unrecoverable.
fn region_error_is_recoverable(error: &RegionError) -> bool {
    matches!(
        error,
        RegionError::EpochNotMatch
            | RegionError::NotLeader
            | RegionError::RegionNotFound
            | RegionError::ServerIsBusy
            | RegionError::StaleCommand
            | RegionError::StoreNotMatch
            | RegionError::ReadIndexNotReady
            | RegionError::ProposalInMergingMode
    )
}

/// Decides what to do with one streamed response.
///
/// Returns the response to keep (if any) and a backoff hint in milliseconds.
/// Successful responses are kept as-is; recoverable failures are dropped with
/// a backoff so a later fine-grained iteration re-fetches the sub-range;
/// anything else fails the job. Locks are resolved through `lock_resolver`
/// before the response is dropped.
pub(crate) async fn on_backup_response(
    store_id: StoreId,
    backup_ts: Timestamp,
    lock_resolver: &dyn LockResolver,
    resp: BackupResponse,
) -> Result<(Option<BackupResponse>, u64)> {
    let mut resp = resp;
    let Some(error) = resp.error.take() else {
        return Ok((Some(resp), 0));
    };
    match error {
        ResponseError::Kv(KvError::Locked(lock)) => {
            tracing::warn!(store_id, key = %meridian_core::keys::KeyDisplay(&lock.key), "backup blocked by a key lock");
            let ms_before_expired = lock_resolver.resolve_locks(backup_ts, vec![lock]).await?;
            Ok((None, ms_before_expired))
        }
        ResponseError::Kv(KvError::Other(message)) => {
            tracing::error!(store_id, message, "unexpected kv error");
            Err(BackupError::kv_unknown(store_id, message))
        }
        ResponseError::Region(region_error) if region_error_is_recoverable(&region_error) => {
            tracing::warn!(store_id, ?region_error, "backup hit a region error");
            Ok((None, REGION_ERROR_BACKOFF_MS))
        }
        ResponseError::Region(region_error) => {
            tracing::error!(store_id, ?region_error, "unexpected region error");
            Err(BackupError::kv_unknown(
                store_id,
                format!("{region_error:?}"),
            ))
        }
        ResponseError::ClusterIdMismatch { request, current } => {
            tracing::error!(store_id, request, current, "cluster ID mismatch");
            Err(ErrorKind::ClusterIdMismatch {
                store_id,
                request,
                current,
            }
            .into())
        }
        ResponseError::Message(message) if message_is_retryable_storage_error(&message) => {
            tracing::warn!(store_id, message, "backup hit a transient storage error");
            Ok((None, STORAGE_ERROR_BACKOFF_MS))
        }
        ResponseError::Message(message) => {
            tracing::error!(store_id, message, "unknown backup error");
            Err(BackupError::kv_unknown(store_id, message))
        }
    }
}
