// Copyright (c) Mysten Labs, Inc.
// SPDX-License-Identifier: Apache-2.0

//! Coarse push-down phase: the same request, fanned out to every store.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::{sync::mpsc, task::JoinSet};

use meridian_core::{
    keys::KeyDisplay,
    messages::{BackupRequest, BackupResponse},
    RangeTree, StoreId,
};

use crate::{
    client::{ProgressCallback, ProgressUnit},
    config::BackupConfig,
    conn::ConnectionManager,
    error::{BackupError, Result},
    node::{send_backup, ResponseHandler},
    placement::Store,
    response::on_backup_response,
};

/// Forwards every streamed response, untouched, to the collector.
struct PushHandler {
    store_id: StoreId,
    tx: mpsc::Sender<(StoreId, BackupResponse)>,
}

#[async_trait]
impl ResponseHandler for PushHandler {
    async fn on_response(&mut self, resp: BackupResponse) -> Result<()> {
        self.tx
            .send((self.store_id, resp))
            .await
            .map_err(|_| BackupError::other(anyhow::anyhow!("push-down collector went away")))
    }
}

/// Sends `request` to every store in parallel and drains all response streams
/// into a fresh coverage tree.
///
/// The collector is the only writer of the tree. Responses carrying a
/// recoverable error are classified and dropped (locks are resolved on the
/// spot); the gaps they leave behind are the fine-grained phase's job. Any
/// fatal classification or store-task failure aborts the whole phase.
pub(crate) async fn push_backup(
    mgr: &Arc<dyn ConnectionManager>,
    request: BackupRequest,
    stores: Vec<Store>,
    config: &BackupConfig,
    progress: &ProgressCallback<'_>,
) -> Result<RangeTree> {
    let mut tree = RangeTree::new();
    let backup_ts = request.end_version;
    let resolver = mgr.lock_resolver();
    let (tx, mut rx) = mpsc::channel(stores.len().max(1));
    let mut tasks = JoinSet::new();
    for store in &stores {
        let store_id = store.id;
        let client = mgr.backup_client(store_id).await?;
        let mgr = Arc::clone(mgr);
        let request = request.clone();
        let config = config.clone();
        let mut handler = PushHandler {
            store_id,
            tx: tx.clone(),
        };
        tasks.spawn(async move {
            send_backup(&mgr, store_id, client, request, &mut handler, &config).await
        });
    }
    drop(tx);

    loop {
        tokio::select! {
            received = rx.recv() => match received {
                Some((store_id, resp)) => {
                    let (kept, _backoff) =
                        on_backup_response(store_id, backup_ts, resolver.as_ref(), resp).await?;
                    if let Some(resp) = kept {
                        tracing::debug!(
                            store_id,
                            start_key = %KeyDisplay(&resp.start_key),
                            end_key = %KeyDisplay(&resp.end_key),
                            "push-down sub-range stored"
                        );
                        tree.put(resp.start_key, resp.end_key, resp.files);
                        progress(ProgressUnit::Region);
                    }
                }
                None => break,
            },
            Some(joined) = tasks.join_next(), if !tasks.is_empty() => {
                joined.map_err(|join_error| {
                    BackupError::other(anyhow::anyhow!("push-down task failed: {join_error}"))
                })??;
            }
        }
    }
    while let Some(joined) = tasks.join_next().await {
        joined.map_err(|join_error| {
            BackupError::other(anyhow::anyhow!("push-down task failed: {join_error}"))
        })??;
    }
    Ok(tree)
}
