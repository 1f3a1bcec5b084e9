// Copyright (c) Mysten Labs, Inc.
// SPDX-License-Identifier: Apache-2.0

//! Fine-grained phase: re-fetch the gaps the push-down left behind.

use std::{
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    time::Duration,
};

use async_trait::async_trait;
use futures::{stream::FuturesUnordered, StreamExt};
use tokio::sync::{mpsc, Mutex};

use meridian_core::{
    keys::KeyDisplay,
    messages::{ApiVersion, BackupRequest, BackupResponse},
    Range, RangeTree, StoreId, Timestamp,
};

use crate::{
    backoff::SleepBudget,
    client::{Client, ProgressCallback, ProgressUnit},
    error::{BackupError, ErrorKind, Result},
    node::{send_backup, ResponseHandler},
    placement::LockResolver,
    response::on_backup_response,
};

/// Backoff when the leader's store cannot be reached: one election timeout.
const STORE_DOWN_BACKOFF_MS: u64 = 20_000;
/// Backoff when a stream delivered nothing at all: the store heartbeat
/// interval, which is also the average leader-election latency.
const NO_PROGRESS_BACKOFF_MS: u64 = 10_000;

/// Classifies responses for one gap and forwards the kept ones.
struct FineGrainedHandler {
    store_id: StoreId,
    backup_ts: Timestamp,
    resolver: Arc<dyn LockResolver>,
    tx: mpsc::Sender<BackupResponse>,
    backoff_ms: u64,
    has_progress: bool,
}

#[async_trait]
impl ResponseHandler for FineGrainedHandler {
    async fn on_response(&mut self, resp: BackupResponse) -> Result<()> {
        let (kept, backoff_ms) =
            on_backup_response(self.store_id, self.backup_ts, self.resolver.as_ref(), resp).await?;
        self.backoff_ms = self.backoff_ms.max(backoff_ms);
        if let Some(resp) = kept {
            self.tx
                .send(resp)
                .await
                .map_err(|_| BackupError::other(anyhow::anyhow!("fine-grained collector went away")))?;
        }
        // Even a dropped response counts as progress: the store answered, so
        // the per-call backoff must win over the no-progress default.
        self.has_progress = true;
        Ok(())
    }
}

impl Client {
    /// Loops until the coverage tree has no gap left inside
    /// `[start_key, end_key)`.
    ///
    /// Every iteration scans for gaps, hands them to a fixed pool of workers,
    /// and serially folds the kept responses into the tree. The iteration's
    /// backoff is the maximum hinted by any gap, charged against one
    /// phase-wide [`SleepBudget`].
    pub(crate) async fn fine_grained_backup(
        &self,
        request: &BackupRequest,
        start_key: &[u8],
        end_key: &[u8],
        tree: &mut RangeTree,
        progress: &ProgressCallback<'_>,
    ) -> Result<()> {
        let mut budget = SleepBudget::new(self.config.fine_grained_max_backoff);
        loop {
            let incomplete = tree.incomplete(start_key, end_key);
            if incomplete.is_empty() {
                return Ok(());
            }
            tracing::info!(incomplete = incomplete.len(), "starting fine-grained round");

            let workers = self.config.fine_grained_workers.max(1);
            let (retry_tx, retry_rx) = mpsc::channel::<Range>(workers);
            let retry_rx = Arc::new(Mutex::new(retry_rx));
            let (resp_tx, mut resp_rx) = mpsc::channel::<BackupResponse>(workers);
            let max_backoff_ms = Arc::new(AtomicU64::new(0));

            let dispatch = async move {
                for range in incomplete {
                    if retry_tx.send(range).await.is_err() {
                        break;
                    }
                }
                Ok::<(), BackupError>(())
            };

            let mut worker_pool: FuturesUnordered<_> = (0..workers)
                .map(|_| {
                    self.fine_grained_worker(
                        request,
                        Arc::clone(&retry_rx),
                        resp_tx.clone(),
                        Arc::clone(&max_backoff_ms),
                    )
                })
                .collect();
            drop(resp_tx);
            let drain_workers = async {
                while let Some(result) = worker_pool.next().await {
                    result?;
                }
                Ok(())
            };

            let collect = async {
                while let Some(resp) = resp_rx.recv().await {
                    if resp.error.is_some() {
                        // The classifier never forwards error responses here.
                        return Err(BackupError::other(anyhow::anyhow!(
                            "unexpected backup error in a fine-grained response: {:?}",
                            resp.error,
                        )));
                    }
                    tracing::debug!(
                        start_key = %KeyDisplay(&resp.start_key),
                        end_key = %KeyDisplay(&resp.end_key),
                        "fine-grained sub-range stored"
                    );
                    tree.put(resp.start_key, resp.end_key, resp.files);
                    progress(ProgressUnit::Region);
                }
                Ok(())
            };

            tokio::try_join!(dispatch, drain_workers, collect)?;

            let backoff_ms = max_backoff_ms.load(Ordering::SeqCst);
            if backoff_ms > 0 {
                tracing::info!(backoff_ms, "fine-grained round backing off");
                budget
                    .sleep(Duration::from_millis(backoff_ms))
                    .await
                    .map_err(|exceeded| BackupError::from(ErrorKind::BackoffExhausted(exceeded)))?;
            }
        }
    }

    async fn fine_grained_worker(
        &self,
        request: &BackupRequest,
        retry_rx: Arc<Mutex<mpsc::Receiver<Range>>>,
        resp_tx: mpsc::Sender<BackupResponse>,
        max_backoff_ms: Arc<AtomicU64>,
    ) -> Result<()> {
        loop {
            let range = { retry_rx.lock().await.recv().await };
            let Some(range) = range else {
                return Ok(());
            };
            let backoff_ms = self
                .handle_fine_grained(request, &range, resp_tx.clone())
                .await?;
            if backoff_ms > 0 {
                max_backoff_ms.fetch_max(backoff_ms, Ordering::SeqCst);
            }
        }
    }

    /// Retries one gap against the current leader of its first region.
    ///
    /// Returns the backoff the caller should honor before the next round;
    /// zero means the gap is expected to be closed.
    async fn handle_fine_grained(
        &self,
        template: &BackupRequest,
        range: &Range,
        resp_tx: mpsc::Sender<BackupResponse>,
    ) -> Result<u64> {
        // Stores keep keys encoded except in the raw keyspace of pre-V2
        // clusters.
        let need_encode = !template.is_raw_kv || self.api_version == ApiVersion::V2;
        let leader = self.find_region_leader(&range.start_key, need_encode).await?;
        let store_id = leader.store_id;

        let mut request = template.clone();
        request.start_key = range.start_key.clone();
        request.end_key = range.end_key.clone();

        let client = match self.mgr.backup_client(store_id).await {
            Ok(client) => client,
            Err(error) if error.is_failed_to_connect() => {
                tracing::warn!(store_id, %error, "failed to connect to store, skipping");
                return Ok(STORE_DOWN_BACKOFF_MS);
            }
            Err(error) => {
                tracing::error!(store_id, %error, "failed to acquire backup client");
                return Err(error);
            }
        };

        let mut handler = FineGrainedHandler {
            store_id,
            backup_ts: template.end_version,
            resolver: self.mgr.lock_resolver(),
            tx: resp_tx,
            backoff_ms: 0,
            has_progress: false,
        };
        match send_backup(&self.mgr, store_id, client, request, &mut handler, &self.config).await {
            Ok(()) => {}
            Err(error) if error.is_failed_to_connect() => {
                tracing::warn!(store_id, %error, "failed to connect to store, skipping");
                return Ok(STORE_DOWN_BACKOFF_MS);
            }
            Err(error) => {
                tracing::error!(store_id, %range, %error, "failed to send fine-grained backup");
                return Err(error);
            }
        }

        if !handler.has_progress {
            return Ok(NO_PROGRESS_BACKOFF_MS);
        }
        Ok(handler.backoff_ms)
    }
}
