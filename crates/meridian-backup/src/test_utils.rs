// Copyright (c) Mysten Labs, Inc.
// SPDX-License-Identifier: Apache-2.0

//! Test doubles for the coordinator's collaborator seams.

use std::{
    collections::{BTreeMap, HashMap, HashSet, VecDeque},
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc, Mutex,
    },
    time::Duration,
};

use async_trait::async_trait;
use futures::StreamExt;
use tonic::Status;

use meridian_core::{
    keys,
    messages::{ApiVersion, BackupFile, BackupRequest, BackupResponse, LockInfo},
    ClusterId, RegionId, StoreId, Timestamp,
};

use crate::{
    client::ProgressUnit,
    conn::{BackupClient, BackupStream, ConnectionManager},
    error::{ErrorKind, Result},
    placement::{LockResolver, Peer, PlacementClient, RegionInfo, Store, StoreLabel},
    storage::{ExternalStorage, ManifestEntryKind, ManifestWriter},
};

/// A successful streamed response covering `[start, end)`.
pub fn ok_response(start: &[u8], end: &[u8], files: Vec<BackupFile>) -> BackupResponse {
    BackupResponse {
        error: None,
        start_key: start.to_vec(),
        end_key: end.to_vec(),
        files,
    }
}

/// An SST file descriptor with plausible counters.
pub fn named_file(name: &str, start: &[u8], end: &[u8]) -> BackupFile {
    BackupFile {
        name: name.to_string(),
        sha256: vec![0xab; 32],
        start_key: start.to_vec(),
        end_key: end.to_vec(),
        start_version: 0,
        end_version: 100,
        total_kvs: 10,
        total_bytes: 1 << 20,
        size: 1 << 19,
    }
}

/// A response blocked by a transactional lock on `key`.
pub fn locked_response(key: &[u8], lock_ttl: u64) -> BackupResponse {
    BackupResponse {
        error: Some(meridian_core::messages::ResponseError::Kv(
            meridian_core::messages::KvError::Locked(LockInfo {
                key: key.to_vec(),
                primary_lock: key.to_vec(),
                lock_version: 99,
                lock_ttl,
            }),
        )),
        ..Default::default()
    }
}

/// Placement service with a fixed world view and call counters.
pub struct StaticPlacement {
    cluster_id: ClusterId,
    api_version: ApiVersion,
    physical_ms: u64,
    logical: u64,
    gc_safe_point: Timestamp,
    stores: Vec<Store>,
    regions: Vec<RegionInfo>,
    pub ts_calls: AtomicUsize,
    pub region_calls: AtomicUsize,
    pub store_list_calls: AtomicUsize,
    pub safe_point_updates: Mutex<Vec<(String, Duration, Timestamp)>>,
}

#[async_trait]
impl PlacementClient for StaticPlacement {
    fn cluster_id(&self) -> ClusterId {
        self.cluster_id
    }

    async fn api_version(&self) -> Result<ApiVersion> {
        Ok(self.api_version)
    }

    async fn get_ts(&self) -> Result<(u64, u64)> {
        self.ts_calls.fetch_add(1, Ordering::SeqCst);
        Ok((self.physical_ms, self.logical))
    }

    async fn get_region(&self, key: &[u8]) -> Result<Option<RegionInfo>> {
        self.region_calls.fetch_add(1, Ordering::SeqCst);
        Ok(self
            .regions
            .iter()
            .find(|region| {
                (region.start_key.is_empty() || key >= region.start_key.as_slice())
                    && (region.end_key.is_empty() || key < region.end_key.as_slice())
            })
            .cloned())
    }

    async fn get_all_stores(&self) -> Result<Vec<Store>> {
        self.store_list_calls.fetch_add(1, Ordering::SeqCst);
        Ok(self.stores.clone())
    }

    async fn update_service_safe_point(
        &self,
        id: &str,
        ttl: Duration,
        ts: Timestamp,
    ) -> Result<Timestamp> {
        self.safe_point_updates
            .lock()
            .expect("test mutex")
            .push((id.to_string(), ttl, ts));
        Ok(self.gc_safe_point)
    }
}

/// Lock resolver answering a fixed `ms_before_expired`.
pub struct StaticLockResolver {
    ms_before_expired: u64,
    calls: AtomicUsize,
    pub resolved: Mutex<Vec<(Timestamp, Vec<LockInfo>)>>,
}

impl StaticLockResolver {
    pub fn new(ms_before_expired: u64) -> Self {
        Self {
            ms_before_expired,
            calls: AtomicUsize::new(0),
            resolved: Mutex::new(Vec::new()),
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl LockResolver for StaticLockResolver {
    async fn resolve_locks(&self, backup_ts: Timestamp, locks: Vec<LockInfo>) -> Result<u64> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.resolved
            .lock()
            .expect("test mutex")
            .push((backup_ts, locks));
        Ok(self.ms_before_expired)
    }
}

/// One scripted reply to an attempt at opening a backup stream.
pub enum ScriptedAttempt {
    /// The call fails to open.
    Fail(Status),
    /// The call streams these items and then ends cleanly.
    Stream(Vec<std::result::Result<BackupResponse, Status>>),
}

/// Backup RPC stub replaying a queue of scripted attempts.
///
/// Once the queue is empty every further call streams nothing (immediate
/// end-of-stream), which is what an idle store does.
pub struct ScriptedBackupClient {
    attempts: Mutex<VecDeque<ScriptedAttempt>>,
    pub calls: AtomicUsize,
    pub requests: Mutex<Vec<BackupRequest>>,
}

impl ScriptedBackupClient {
    fn new() -> Self {
        Self {
            attempts: Mutex::new(VecDeque::new()),
            calls: AtomicUsize::new(0),
            requests: Mutex::new(Vec::new()),
        }
    }
}

#[async_trait]
impl BackupClient for ScriptedBackupClient {
    async fn backup(&self, request: BackupRequest) -> std::result::Result<BackupStream, Status> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.requests.lock().expect("test mutex").push(request);
        let attempt = self.attempts.lock().expect("test mutex").pop_front();
        match attempt {
            None => Ok(futures::stream::iter(Vec::new()).boxed()),
            Some(ScriptedAttempt::Fail(status)) => Err(status),
            Some(ScriptedAttempt::Stream(items)) => Ok(futures::stream::iter(items).boxed()),
        }
    }
}

/// Connection manager over scripted per-store clients.
pub struct TestConnectionManager {
    placement: Arc<StaticPlacement>,
    resolver: Arc<StaticLockResolver>,
    clients: Mutex<HashMap<StoreId, Arc<ScriptedBackupClient>>>,
    resets: Mutex<HashMap<StoreId, usize>>,
    unreachable: HashSet<StoreId>,
    /// Remaining successful acquisitions per store; absent means unlimited.
    acquire_limits: Mutex<HashMap<StoreId, usize>>,
}

impl TestConnectionManager {
    fn scripted_client(&self, store_id: StoreId) -> Arc<ScriptedBackupClient> {
        Arc::clone(
            self.clients
                .lock()
                .expect("test mutex")
                .entry(store_id)
                .or_insert_with(|| Arc::new(ScriptedBackupClient::new())),
        )
    }
}

#[async_trait]
impl ConnectionManager for TestConnectionManager {
    async fn backup_client(&self, store_id: StoreId) -> Result<Arc<dyn BackupClient>> {
        let exhausted = {
            let mut limits = self.acquire_limits.lock().expect("test mutex");
            match limits.get_mut(&store_id) {
                Some(0) => true,
                Some(remaining) => {
                    *remaining -= 1;
                    false
                }
                None => false,
            }
        };
        if exhausted || self.unreachable.contains(&store_id) {
            return Err(ErrorKind::FailedToConnect {
                store_id,
                source: anyhow::anyhow!("store is unreachable"),
            }
            .into());
        }
        Ok(self.scripted_client(store_id))
    }

    async fn reset_backup_client(&self, store_id: StoreId) -> Result<Arc<dyn BackupClient>> {
        *self
            .resets
            .lock()
            .expect("test mutex")
            .entry(store_id)
            .or_insert(0) += 1;
        self.backup_client(store_id).await
    }

    fn placement(&self) -> Arc<dyn PlacementClient> {
        Arc::clone(&self.placement) as Arc<dyn PlacementClient>
    }

    fn lock_resolver(&self) -> Arc<dyn LockResolver> {
        Arc::clone(&self.resolver) as Arc<dyn LockResolver>
    }
}

/// Builder of a [`TestCluster`].
pub struct TestClusterBuilder {
    cluster_id: ClusterId,
    api_version: ApiVersion,
    physical_ms: u64,
    logical: u64,
    gc_safe_point: Timestamp,
    lock_expiry_ms: u64,
    stores: Vec<Store>,
    regions: Vec<RegionInfo>,
    unreachable: HashSet<StoreId>,
    acquire_limits: HashMap<StoreId, usize>,
}

impl TestClusterBuilder {
    pub fn cluster_id(mut self, cluster_id: ClusterId) -> Self {
        self.cluster_id = cluster_id;
        self
    }

    pub fn api_version(mut self, api_version: ApiVersion) -> Self {
        self.api_version = api_version;
        self
    }

    /// Sets the `(physical_ms, logical)` pair the timestamp oracle reports.
    pub fn now(mut self, physical_ms: u64, logical: u64) -> Self {
        self.physical_ms = physical_ms;
        self.logical = logical;
        self
    }

    pub fn gc_safe_point(mut self, safe_point: Timestamp) -> Self {
        self.gc_safe_point = safe_point;
        self
    }

    /// Sets the `ms_before_expired` the lock resolver reports.
    pub fn lock_expiry(mut self, ms: u64) -> Self {
        self.lock_expiry_ms = ms;
        self
    }

    pub fn store(mut self, id: StoreId, labels: Vec<StoreLabel>) -> Self {
        self.stores.push(Store {
            id,
            address: format!("store-{id}:20160"),
            labels,
        });
        self
    }

    /// Registers a region over the *raw* interval `[start, end)` led by
    /// `leader_store`; boundaries are stored memcomparable-encoded, the way
    /// the placement service reports them.
    pub fn region(mut self, id: RegionId, start: &[u8], end: &[u8], leader_store: StoreId) -> Self {
        self.regions.push(RegionInfo {
            id,
            start_key: keys::encode_bytes(start),
            end_key: if end.is_empty() {
                Vec::new()
            } else {
                keys::encode_bytes(end)
            },
            leader: Some(Peer {
                id: id * 10 + 1,
                store_id: leader_store,
            }),
        });
        self
    }

    /// Registers a region whose leader is currently unknown.
    pub fn leaderless_region(mut self, id: RegionId, start: &[u8], end: &[u8]) -> Self {
        self.regions.push(RegionInfo {
            id,
            start_key: keys::encode_bytes(start),
            end_key: if end.is_empty() {
                Vec::new()
            } else {
                keys::encode_bytes(end)
            },
            leader: None,
        });
        self
    }

    pub fn unreachable_store(mut self, id: StoreId) -> Self {
        self.unreachable.insert(id);
        self
    }

    /// Lets `id` hand out a client `times` times, then fail to connect; the
    /// way a store looks when it dies mid-backup.
    pub fn store_reachable_times(mut self, id: StoreId, times: usize) -> Self {
        self.acquire_limits.insert(id, times);
        self
    }

    pub fn build(self) -> TestCluster {
        let placement = Arc::new(StaticPlacement {
            cluster_id: self.cluster_id,
            api_version: self.api_version,
            physical_ms: self.physical_ms,
            logical: self.logical,
            gc_safe_point: self.gc_safe_point,
            stores: self.stores,
            regions: self.regions,
            ts_calls: AtomicUsize::new(0),
            region_calls: AtomicUsize::new(0),
            store_list_calls: AtomicUsize::new(0),
            safe_point_updates: Mutex::new(Vec::new()),
        });
        let resolver = Arc::new(StaticLockResolver::new(self.lock_expiry_ms));
        let manager = Arc::new(TestConnectionManager {
            placement: Arc::clone(&placement),
            resolver: Arc::clone(&resolver),
            clients: Mutex::new(HashMap::new()),
            resets: Mutex::new(HashMap::new()),
            unreachable: self.unreachable,
            acquire_limits: Mutex::new(self.acquire_limits),
        });
        TestCluster {
            placement,
            resolver,
            manager,
        }
    }
}

/// A scripted cluster: placement view, lock resolver, and per-store backup
/// stubs behind one connection manager.
pub struct TestCluster {
    placement: Arc<StaticPlacement>,
    resolver: Arc<StaticLockResolver>,
    manager: Arc<TestConnectionManager>,
}

impl TestCluster {
    pub fn builder() -> TestClusterBuilder {
        TestClusterBuilder {
            cluster_id: 1,
            api_version: ApiVersion::V1,
            physical_ms: 1_700_000_000_000,
            logical: 5,
            gc_safe_point: 0,
            lock_expiry_ms: 0,
            stores: Vec::new(),
            regions: Vec::new(),
            unreachable: HashSet::new(),
            acquire_limits: HashMap::new(),
        }
    }

    pub fn manager(&self) -> Arc<dyn ConnectionManager> {
        Arc::clone(&self.manager) as Arc<dyn ConnectionManager>
    }

    pub fn placement(&self) -> &StaticPlacement {
        &self.placement
    }

    pub fn resolver(&self) -> &StaticLockResolver {
        &self.resolver
    }

    /// Appends a scripted attempt to `store_id`'s backup stub.
    pub fn push_attempt(&self, store_id: StoreId, attempt: ScriptedAttempt) {
        self.manager
            .scripted_client(store_id)
            .attempts
            .lock()
            .expect("test mutex")
            .push_back(attempt);
    }

    /// Number of `Backup` calls `store_id` has received.
    pub fn backup_calls(&self, store_id: StoreId) -> usize {
        self.manager
            .scripted_client(store_id)
            .calls
            .load(Ordering::SeqCst)
    }

    /// Number of times `store_id`'s channel was reset.
    pub fn resets(&self, store_id: StoreId) -> usize {
        self.manager
            .resets
            .lock()
            .expect("test mutex")
            .get(&store_id)
            .copied()
            .unwrap_or(0)
    }
}

/// Counts progress callback invocations.
#[derive(Debug, Default)]
pub struct ProgressCounter {
    ranges: AtomicUsize,
    regions: AtomicUsize,
}

impl ProgressCounter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&self, unit: ProgressUnit) {
        match unit {
            ProgressUnit::Range => self.ranges.fetch_add(1, Ordering::SeqCst),
            ProgressUnit::Region => self.regions.fetch_add(1, Ordering::SeqCst),
        };
    }

    pub fn ranges(&self) -> usize {
        self.ranges.load(Ordering::SeqCst)
    }

    pub fn regions(&self) -> usize {
        self.regions.load(Ordering::SeqCst)
    }
}

/// In-memory [`ExternalStorage`].
pub struct MemStorage {
    files: Mutex<BTreeMap<String, Vec<u8>>>,
    uri: String,
}

impl MemStorage {
    pub fn new() -> Self {
        Self {
            files: Mutex::new(BTreeMap::new()),
            uri: "mem://backup".to_string(),
        }
    }

    pub fn insert(&self, path: &str, contents: &[u8]) {
        self.files
            .lock()
            .expect("test mutex")
            .insert(path.to_string(), contents.to_vec());
    }

    pub fn contains(&self, path: &str) -> bool {
        self.files.lock().expect("test mutex").contains_key(path)
    }
}

impl Default for MemStorage {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ExternalStorage for MemStorage {
    async fn write_file(&self, path: &str, contents: &[u8]) -> anyhow::Result<()> {
        self.insert(path, contents);
        Ok(())
    }

    async fn file_exists(&self, path: &str) -> anyhow::Result<bool> {
        Ok(self.contains(path))
    }

    async fn walk_dir(
        &self,
        prefix: &str,
        visit: &mut (dyn for<'a> FnMut(&'a str, u64) -> bool + Send),
    ) -> anyhow::Result<()> {
        let files = self.files.lock().expect("test mutex").clone();
        for (path, contents) in files {
            if path.starts_with(prefix) {
                let keep_going = visit(&path, contents.len() as u64);
                if !keep_going {
                    break;
                }
            }
        }
        Ok(())
    }

    fn uri(&self) -> String {
        self.uri.clone()
    }
}

/// Manifest writer collecting everything it is sent, in order.
#[derive(Debug, Default)]
pub struct VecManifest {
    entries: Mutex<Vec<BackupFile>>,
}

impl VecManifest {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn files(&self) -> Vec<BackupFile> {
        self.entries.lock().expect("test mutex").clone()
    }
}

#[async_trait]
impl ManifestWriter for VecManifest {
    async fn send(&self, files: Vec<BackupFile>, _kind: ManifestEntryKind) -> anyhow::Result<()> {
        self.entries.lock().expect("test mutex").extend(files);
        Ok(())
    }
}
