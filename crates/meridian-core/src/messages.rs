// Copyright (c) Mysten Labs, Inc.
// SPDX-License-Identifier: Apache-2.0

//! Wire types of the per-store `Backup` RPC.

use serde::{Deserialize, Serialize};

use crate::{ClusterId, Timestamp};

/// Version of the cluster key-value API.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum ApiVersion {
    /// Transactional keyspace only.
    #[default]
    V1,
    /// Adds the raw keyspace and service safepoints.
    V2,
}

/// Compression applied by the storage node when writing SST files.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum CompressionType {
    #[default]
    Unknown,
    Lz4,
    Snappy,
    Zstd,
}

/// Encryption applied by the storage node when writing SST files.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum EncryptionMethod {
    #[default]
    Plaintext,
    Aes128Ctr,
    Aes192Ctr,
    Aes256Ctr,
}

/// Pass-through cipher parameters for the storage node.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CipherInfo {
    pub method: EncryptionMethod,
    pub key: Vec<u8>,
}

/// Destination of the backup artifacts, as understood by the storage nodes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum StorageBackend {
    /// A path on a filesystem shared with every storage node.
    Local { path: String },
    /// An S3-compatible object store.
    S3 {
        bucket: String,
        prefix: String,
        endpoint: Option<String>,
    },
    /// Discards everything; used for throughput probing.
    Noop,
}

/// Immutable per-range backup descriptor sent to every storage node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackupRequest {
    pub cluster_id: ClusterId,
    pub start_key: Vec<u8>,
    pub end_key: Vec<u8>,
    /// Versions below this one were captured by a previous backup.
    pub start_version: Timestamp,
    /// The snapshot timestamp of this backup.
    pub end_version: Timestamp,
    pub storage_backend: Option<StorageBackend>,
    /// Per-store write rate limit in bytes per second; 0 disables it.
    pub rate_limit: u64,
    /// Per-store worker threads.
    pub concurrency: u32,
    pub is_raw_kv: bool,
    pub dst_api_version: ApiVersion,
    pub compression_type: CompressionType,
    pub compression_level: i32,
    pub cipher_info: CipherInfo,
}

impl Default for BackupRequest {
    fn default() -> Self {
        Self {
            cluster_id: 0,
            start_key: Vec::new(),
            end_key: Vec::new(),
            start_version: 0,
            end_version: 0,
            storage_backend: None,
            rate_limit: 0,
            concurrency: 4,
            is_raw_kv: false,
            dst_api_version: ApiVersion::default(),
            compression_type: CompressionType::default(),
            compression_level: 0,
            cipher_info: CipherInfo::default(),
        }
    }
}

/// Metadata of one SST file produced by a storage node.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackupFile {
    pub name: String,
    pub sha256: Vec<u8>,
    pub start_key: Vec<u8>,
    pub end_key: Vec<u8>,
    pub start_version: Timestamp,
    pub end_version: Timestamp,
    pub total_kvs: u64,
    pub total_bytes: u64,
    pub size: u64,
}

/// A transactional lock blocking the snapshot read of a key.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockInfo {
    pub key: Vec<u8>,
    pub primary_lock: Vec<u8>,
    pub lock_version: Timestamp,
    pub lock_ttl: u64,
}

/// Key-value layer errors reported inside a [`BackupResponse`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum KvError {
    /// Another transaction holds a lock inside the requested range.
    Locked(LockInfo),
    Other(String),
}

/// Region-routing errors reported inside a [`BackupResponse`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum RegionError {
    EpochNotMatch,
    NotLeader,
    RegionNotFound,
    ServerIsBusy,
    StaleCommand,
    StoreNotMatch,
    ReadIndexNotReady,
    ProposalInMergingMode,
    Other(String),
}

/// Error variant carried by a [`BackupResponse`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ResponseError {
    Kv(KvError),
    Region(RegionError),
    /// The store belongs to a different cluster than the request targets.
    ClusterIdMismatch {
        request: ClusterId,
        current: ClusterId,
    },
    /// Unstructured failure, typically from the store's object-store writer.
    Message(String),
}

/// One element of the server-streamed backup reply.
///
/// A response either reports a completed sub-range with its files or carries
/// an [`ResponseError`]; it never does both.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackupResponse {
    pub error: Option<ResponseError>,
    pub start_key: Vec<u8>,
    pub end_key: Vec<u8>,
    pub files: Vec<BackupFile>,
}
