// Copyright (c) Mysten Labs, Inc.
// SPDX-License-Identifier: Apache-2.0

//! The placement service: cluster directory, timestamp oracle, and safepoint
//! registry, plus the transactional lock resolver it exposes.

use std::time::Duration;

use async_trait::async_trait;
use rand::Rng;
use serde::{Deserialize, Serialize};

use meridian_core::{
    messages::{ApiVersion, LockInfo},
    ClusterId, RegionId, StoreId, Timestamp,
};

use crate::{
    backoff::{self, ExponentialBackoffConfig},
    error::{BackupError, Result},
};

/// TTL of the throwaway safepoint registered to read the cluster minimum.
const SAFE_POINT_PROBE_TTL: Duration = Duration::from_secs(60);

/// A replica of a region.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Peer {
    pub id: u64,
    pub store_id: StoreId,
}

/// A region and its current leader, as reported by the placement service.
///
/// Region boundaries are expressed in the cluster's memcomparable encoding.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegionInfo {
    pub id: RegionId,
    pub start_key: Vec<u8>,
    pub end_key: Vec<u8>,
    pub leader: Option<Peer>,
}

/// A label attached to a store by the operator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoreLabel {
    pub key: String,
    pub value: String,
}

/// A storage node registered with the placement service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Store {
    pub id: StoreId,
    pub address: String,
    #[serde(default)]
    pub labels: Vec<StoreLabel>,
}

impl Store {
    /// Analytics replicas serve read-only columnar copies and cannot run
    /// backups.
    pub fn is_analytics(&self) -> bool {
        self.labels
            .iter()
            .any(|label| label.key == "engine" && label.value == "analytics")
    }
}

/// Client of the placement service.
#[async_trait]
pub trait PlacementClient: Send + Sync {
    /// The id of the cluster this client is connected to.
    fn cluster_id(&self) -> ClusterId;

    /// The key-value API version the cluster runs.
    async fn api_version(&self) -> Result<ApiVersion>;

    /// Returns the current `(physical_ms, logical)` pair of the timestamp
    /// oracle.
    async fn get_ts(&self) -> Result<(u64, u64)>;

    /// Looks up the region containing `key` (memcomparable-encoded).
    async fn get_region(&self, key: &[u8]) -> Result<Option<RegionInfo>>;

    /// Lists every registered store.
    async fn get_all_stores(&self) -> Result<Vec<Store>>;

    /// Registers or refreshes a service safepoint and returns the
    /// cluster-wide minimum safepoint.
    async fn update_service_safe_point(
        &self,
        id: &str,
        ttl: Duration,
        ts: Timestamp,
    ) -> Result<Timestamp>;
}

/// Resolver for transactional locks encountered while reading a snapshot.
#[async_trait]
pub trait LockResolver: Send + Sync {
    /// Attempts to resolve `locks` observed below `backup_ts`. Returns the
    /// number of milliseconds until the earliest surviving lock expires, or
    /// zero when every lock was resolved.
    async fn resolve_locks(&self, backup_ts: Timestamp, locks: Vec<LockInfo>) -> Result<u64>;
}

/// Fetches the store list with retries and drops replicas that cannot serve
/// backups.
pub async fn backup_capable_stores(
    placement: &dyn PlacementClient,
    retry: &ExponentialBackoffConfig,
) -> Result<Vec<Store>> {
    let stores = backoff::retry(retry.backoff_strategy(0), || placement.get_all_stores()).await?;
    Ok(stores.into_iter().filter(|store| !store.is_analytics()).collect())
}

/// Generates a unique service-safepoint id.
pub fn make_safe_point_id() -> String {
    format!("backup-{:016x}", rand::thread_rng().gen::<u64>())
}

/// Fails when `ts` has already been garbage-collected.
///
/// Registering a short-lived probe safepoint is the only way to read the
/// cluster minimum; the probe expires on its own.
pub async fn check_gc_safe_point(placement: &dyn PlacementClient, ts: Timestamp) -> Result<()> {
    let probe_id = make_safe_point_id();
    let minimum = placement
        .update_service_safe_point(&probe_id, SAFE_POINT_PROBE_TTL, ts)
        .await?;
    if ts < minimum {
        return Err(BackupError::invalid_argument(format!(
            "backup ts {ts} is below the GC safepoint {minimum}; the requested snapshot has been garbage-collected"
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store(id: StoreId, labels: &[(&str, &str)]) -> Store {
        Store {
            id,
            address: format!("store-{id}:20160"),
            labels: labels
                .iter()
                .map(|(key, value)| StoreLabel {
                    key: key.to_string(),
                    value: value.to_string(),
                })
                .collect(),
        }
    }

    #[test]
    fn analytics_stores_are_detected_by_label() {
        assert!(store(1, &[("engine", "analytics")]).is_analytics());
        assert!(!store(2, &[("engine", "kv")]).is_analytics());
        assert!(!store(3, &[]).is_analytics());
        assert!(!store(4, &[("zone", "analytics")]).is_analytics());
    }

    #[test]
    fn safe_point_ids_are_unique() {
        assert_ne!(make_safe_point_id(), make_safe_point_id());
    }
}
