// Copyright (c) Mysten Labs, Inc.
// SPDX-License-Identifier: Apache-2.0

//! The streaming backup call against a single storage node.

use std::sync::Arc;

use async_trait::async_trait;
use futures::StreamExt;
use tonic::{Code, Status};

use meridian_core::{
    keys::KeyDisplay,
    messages::{BackupRequest, BackupResponse},
    StoreId,
};

use crate::{
    config::BackupConfig,
    conn::{BackupClient, ConnectionManager},
    error::{ErrorKind, Result},
};

/// Message gRPC attaches to a `Cancelled` status when the channel itself is
/// being torn down, as opposed to a caller-initiated cancellation.
const GRPC_CONNECTION_CLOSING: &str = "the client connection is closing";

/// Consumes the responses streamed by one store.
#[async_trait]
pub(crate) trait ResponseHandler: Send {
    /// Handles one response. An error here is fatal for the whole call.
    async fn on_response(&mut self, resp: BackupResponse) -> Result<()>;
}

/// True iff the stream should be retried on a fresh channel.
pub(crate) fn is_retryable(status: &Status) -> bool {
    match status.code() {
        Code::Unavailable => true,
        Code::Cancelled => status.message().contains(GRPC_CONNECTION_CLOSING),
        _ => false,
    }
}

/// Drives one store's backup stream to completion.
///
/// Opens the streaming call up to `config.stream_retry_attempts` times,
/// resetting the cached channel and pausing `config.stream_reset_backoff`
/// after every retryable teardown. Reaching the end of a stream finishes the
/// whole call successfully. Exhausting every attempt without reaching the end
/// also returns `Ok(())`: the caller's gap scan re-queues whatever the stream
/// did not deliver.
pub(crate) async fn send_backup(
    mgr: &Arc<dyn ConnectionManager>,
    store_id: StoreId,
    mut client: Arc<dyn BackupClient>,
    request: BackupRequest,
    handler: &mut dyn ResponseHandler,
    config: &BackupConfig,
) -> Result<()> {
    'attempts: for attempt in 0..config.stream_retry_attempts {
        tracing::debug!(store_id, attempt, "opening backup stream");
        let mut stream = match client.backup(request.clone()).await {
            Ok(stream) => stream,
            Err(status) if is_retryable(&status) => {
                tokio::time::sleep(config.stream_reset_backoff).await;
                client = reset(mgr, store_id, &status).await?;
                continue 'attempts;
            }
            Err(status) => {
                tracing::error!(store_id, attempt, %status, "failed to open backup stream");
                return Err(ErrorKind::FailedToConnect {
                    store_id,
                    source: status.into(),
                }
                .into());
            }
        };
        loop {
            match stream.next().await {
                None => {
                    tracing::debug!(store_id, attempt, "backup stream finished");
                    break 'attempts;
                }
                Some(Ok(resp)) => {
                    tracing::debug!(
                        store_id,
                        start_key = %KeyDisplay(&resp.start_key),
                        end_key = %KeyDisplay(&resp.end_key),
                        "sub-range backed up"
                    );
                    handler.on_response(resp).await?;
                }
                Some(Err(status)) if is_retryable(&status) => {
                    tokio::time::sleep(config.stream_reset_backoff).await;
                    client = reset(mgr, store_id, &status).await?;
                    continue 'attempts;
                }
                Some(Err(status)) => {
                    tracing::error!(store_id, attempt, %status, "backup stream failed");
                    return Err(ErrorKind::FailedToConnect {
                        store_id,
                        source: status.into(),
                    }
                    .into());
                }
            }
        }
    }
    Ok(())
}

async fn reset(
    mgr: &Arc<dyn ConnectionManager>,
    store_id: StoreId,
    cause: &Status,
) -> Result<Arc<dyn BackupClient>> {
    tracing::warn!(store_id, %cause, "resetting backup connection");
    mgr.reset_backup_client(store_id).await
}
