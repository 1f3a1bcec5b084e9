// Copyright (c) Mysten Labs, Inc.
// SPDX-License-Identifier: Apache-2.0

//! The backup coordinator.

use std::{collections::HashMap, sync::Arc, time::Duration};

use futures::StreamExt;
use tokio::time::Instant;

use meridian_core::{
    keys::{self, KeyDisplay},
    messages::{ApiVersion, BackupRequest, StorageBackend},
    ts, ClusterId, Range, RangeTree, Timestamp,
};

use crate::{
    backoff,
    config::BackupConfig,
    conn::ConnectionManager,
    error::{BackupError, ErrorKind, Result},
    placement::{backup_capable_stores, check_gc_safe_point, make_safe_point_id, Peer},
    push::push_backup,
    storage::{
        check_backup_storage_is_locked, ExternalStorage, ManifestEntryKind, ManifestWriter,
        LOCK_FILE, LOCK_FILE_CONTENTS, META_FILE,
    },
};

/// Fallback TTL for the backup service safepoint.
pub const DEFAULT_GC_TTL: Duration = Duration::from_secs(5 * 60);

/// Units reported through the progress callback.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProgressUnit {
    /// One input range finished completely.
    Range,
    /// One sub-range was stored.
    Region,
}

/// Progress sink injected by the caller; invoked from the phase collectors.
pub type ProgressCallback<'a> = dyn Fn(ProgressUnit) + Send + Sync + 'a;

/// Coordinates a backup across every storage node of one cluster.
///
/// The client is stateless between [`backup_ranges`](Client::backup_ranges)
/// calls apart from the opened destination storage and the GC TTL.
pub struct Client {
    pub(crate) mgr: Arc<dyn ConnectionManager>,
    pub(crate) config: BackupConfig,
    pub(crate) cluster_id: ClusterId,
    pub(crate) api_version: ApiVersion,
    storage: Option<Arc<dyn ExternalStorage>>,
    backend: Option<StorageBackend>,
    gc_ttl: Duration,
}

impl Client {
    /// Creates a backup client bound to one cluster.
    pub async fn new(mgr: Arc<dyn ConnectionManager>, config: BackupConfig) -> Result<Self> {
        let placement = mgr.placement();
        let cluster_id = placement.cluster_id();
        let api_version = placement.api_version().await?;
        tracing::info!(cluster_id, ?api_version, "new backup client");
        Ok(Self {
            mgr,
            config,
            cluster_id,
            api_version,
            storage: None,
            backend: None,
            gc_ttl: DEFAULT_GC_TTL,
        })
    }

    /// The id of the cluster being backed up.
    pub fn cluster_id(&self) -> ClusterId {
        self.cluster_id
    }

    /// The key-value API version the cluster runs.
    pub fn api_version(&self) -> ApiVersion {
        self.api_version
    }

    /// Sets the TTL of the backup service safepoint; zero restores the
    /// default.
    pub fn set_gc_ttl(&mut self, ttl: Duration) {
        self.gc_ttl = if ttl.is_zero() { DEFAULT_GC_TTL } else { ttl };
    }

    pub fn gc_ttl(&self) -> Duration {
        self.gc_ttl
    }

    /// The opened destination storage, if any.
    pub fn storage(&self) -> Option<&Arc<dyn ExternalStorage>> {
        self.storage.as_ref()
    }

    /// Adopts an opened destination storage after checking it is safe to
    /// write into: a destination already holding a manifest, or a `LOCK`
    /// sentinel together with SST files, is refused.
    pub async fn set_storage(
        &mut self,
        backend: StorageBackend,
        storage: Arc<dyn ExternalStorage>,
    ) -> Result<()> {
        let meta_exists = storage
            .file_exists(META_FILE)
            .await
            .map_err(ErrorKind::Storage)?;
        if meta_exists {
            return Err(BackupError::invalid_argument(format!(
                "backup meta file exists in {}/{META_FILE}, there may be some backup files in \
                 the path already, please specify a correct backup directory",
                storage.uri(),
            )));
        }
        check_backup_storage_is_locked(storage.as_ref()).await?;
        self.backend = Some(backend);
        self.storage = Some(storage);
        Ok(())
    }

    /// Writes the `LOCK` sentinel into the destination.
    pub async fn set_lock_file(&self) -> Result<()> {
        self.require_storage()?
            .write_file(LOCK_FILE, LOCK_FILE_CONTENTS.as_bytes())
            .await
            .map_err(|error| ErrorKind::Storage(error).into())
    }

    /// Selects the backup timestamp.
    ///
    /// A non-zero `override_ts` is used as-is. Otherwise the current
    /// timestamp is fetched from the placement service (with retries) and,
    /// for a positive `timeago_ms`, rewound by that many milliseconds of
    /// physical time. The result is always validated against the GC
    /// safepoint.
    pub async fn backup_ts(&self, timeago_ms: i64, override_ts: Timestamp) -> Result<Timestamp> {
        let placement = self.mgr.placement();
        let backup_ts = if override_ts > 0 {
            override_ts
        } else {
            let (physical, logical) = backoff::retry(
                self.config.placement_retry.backoff_strategy(0),
                || placement.get_ts(),
            )
            .await?;
            let now = ts::compose(physical, logical);
            match timeago_ms {
                timeago if timeago < 0 => {
                    return Err(BackupError::invalid_argument(
                        "negative timeago is not allowed",
                    ));
                }
                0 => now,
                timeago => {
                    tracing::info!(timeago_ms = timeago, "rewinding backup timestamp");
                    let physical = ts::physical(now).checked_sub(timeago as u64).ok_or_else(|| {
                        BackupError::invalid_argument(
                            "backup ts overflow, please choose a smaller timeago",
                        )
                    })?;
                    ts::compose(physical, logical)
                }
            }
        };
        check_gc_safe_point(placement.as_ref(), backup_ts).await?;
        tracing::info!(backup_ts, "selected backup timestamp");
        Ok(backup_ts)
    }

    /// Registers a service safepoint `safe_interval_ms` in the past so GC
    /// cannot overtake an incremental backup chain. Only meaningful on V2
    /// clusters; a no-op elsewhere.
    pub async fn update_gc_safe_point(&self, safe_interval_ms: i64) -> Result<Timestamp> {
        if self.api_version != ApiVersion::V2 {
            return Ok(0);
        }
        let backup_ts = self.backup_ts(safe_interval_ms, 0).await?;
        let id = make_safe_point_id();
        self.mgr
            .placement()
            .update_service_safe_point(&id, self.gc_ttl, backup_ts)
            .await?;
        tracing::info!(backup_ts, id, "registered backup service safepoint");
        Ok(backup_ts)
    }

    /// Backs up every input range, at most `concurrency` ranges in flight.
    ///
    /// The first failure aborts the remaining ranges and is returned.
    #[tracing::instrument(skip_all, fields(ranges = ranges.len()))]
    pub async fn backup_ranges(
        &self,
        ranges: Vec<Range>,
        request: BackupRequest,
        concurrency: usize,
        manifest: &dyn ManifestWriter,
        progress: &ProgressCallback<'_>,
    ) -> Result<()> {
        if ranges.is_empty() {
            return Ok(());
        }
        let started = Instant::now();
        let mut backups = futures::stream::iter(ranges.into_iter().map(|range| {
            let request = request.clone();
            async move {
                self.backup_range(&range, request, manifest, progress)
                    .await
                    .map_err(|error| {
                        tracing::error!(%range, %error, "backup range failed");
                        error
                    })
            }
        }))
        .buffer_unordered(concurrency.max(1));
        while let Some(result) = backups.next().await {
            result?;
        }
        tracing::info!(elapsed = ?started.elapsed(), "backup ranges finished");
        Ok(())
    }

    /// Backs up one key range: push-down, fine-grained gap fill, then
    /// manifest emission in ascending key order.
    #[tracing::instrument(skip_all, fields(
        start_key = %KeyDisplay(&range.start_key),
        end_key = %KeyDisplay(&range.end_key),
    ))]
    pub async fn backup_range(
        &self,
        range: &Range,
        mut request: BackupRequest,
        manifest: &dyn ManifestWriter,
        progress: &ProgressCallback<'_>,
    ) -> Result<()> {
        let started = Instant::now();
        tracing::info!(
            rate_limit = request.rate_limit,
            concurrency = request.concurrency,
            "backup started"
        );
        let placement = self.mgr.placement();
        let stores = backup_capable_stores(placement.as_ref(), &self.config.placement_retry).await?;

        request.cluster_id = self.cluster_id;
        request.start_key = range.start_key.clone();
        request.end_key = range.end_key.clone();
        request.storage_backend = Some(self.require_backend()?.clone());

        let mut tree = push_backup(&self.mgr, request.clone(), stores, &self.config, progress).await?;
        tracing::info!(small_ranges = tree.len(), "finished backup push-down");

        self.fine_grained_backup(&request, &range.start_key, &range.end_key, &mut tree, progress)
            .await?;

        progress(ProgressUnit::Range);

        let mut total_kvs = 0u64;
        let mut total_bytes = 0u64;
        for entry in tree.iter() {
            for file in &entry.files {
                total_kvs += file.total_kvs;
                total_bytes += file.total_bytes;
            }
            manifest
                .send(entry.files.clone(), ManifestEntryKind::DataFile)
                .await
                .map_err(ErrorKind::Manifest)?;
        }
        check_dup_files(&tree);
        tracing::info!(
            total_kvs,
            total_bytes,
            elapsed = ?started.elapsed(),
            "backup range finished"
        );
        Ok(())
    }

    /// Finds the leader peer of the region containing `key`.
    ///
    /// Looks up the placement service with a linearly growing pause between
    /// attempts; the region map is refreshed server-side, so persistent
    /// failure means the cluster genuinely has no leader for the key.
    pub(crate) async fn find_region_leader(&self, key: &[u8], need_encode: bool) -> Result<Peer> {
        let encoded;
        let key: &[u8] = if need_encode {
            encoded = keys::encode_bytes(key);
            &encoded
        } else {
            key
        };
        let placement = self.mgr.placement();
        for attempt in 0..self.config.leader_lookup_attempts {
            match placement.get_region(key).await {
                Ok(Some(region)) => {
                    if let Some(leader) = region.leader {
                        tracing::debug!(
                            key = %KeyDisplay(key),
                            store_id = leader.store_id,
                            "found region leader"
                        );
                        return Ok(leader);
                    }
                    tracing::warn!(key = %KeyDisplay(key), region_id = region.id, "region has no leader");
                }
                Ok(None) => tracing::warn!(key = %KeyDisplay(key), "no region found"),
                Err(error) => tracing::error!(key = %KeyDisplay(key), %error, "leader lookup failed"),
            }
            tokio::time::sleep(Duration::from_millis(100) * attempt as u32).await;
        }
        tracing::error!(key = %KeyDisplay(key), "cannot find region leader");
        Err(ErrorKind::NoLeader.into())
    }

    fn require_storage(&self) -> Result<&Arc<dyn ExternalStorage>> {
        self.storage
            .as_ref()
            .ok_or_else(|| BackupError::invalid_argument("backup destination is not set"))
    }

    fn require_backend(&self) -> Result<&StorageBackend> {
        self.backend
            .as_ref()
            .ok_or_else(|| BackupError::invalid_argument("backup destination is not set"))
    }
}

/// Warns about SST files that appear under more than one sub-range. Harmless
/// for restore, but worth surfacing.
fn check_dup_files(tree: &RangeTree) {
    let mut seen: HashMap<&str, u32> = HashMap::new();
    for entry in tree.iter() {
        for file in &entry.files {
            *seen.entry(file.name.as_str()).or_insert(0) += 1;
        }
    }
    for (name, count) in seen {
        if count > 1 {
            tracing::warn!(name, count, "duplicate file name in backup output");
        }
    }
}
