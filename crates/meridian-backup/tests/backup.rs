// Copyright (c) Mysten Labs, Inc.
// SPDX-License-Identifier: Apache-2.0

//! End-to-end scenarios for the backup coordinator against a scripted
//! cluster.

use std::{sync::atomic::Ordering, sync::Arc, time::Duration};

use tonic::Status;

use meridian_backup::{
    storage::{ExternalStorage, LOCK_FILE, META_FILE},
    test_utils::{
        locked_response, named_file, ok_response, MemStorage, ProgressCounter, ScriptedAttempt,
        TestCluster, VecManifest,
    },
    BackupConfig, Client, ErrorKind,
};
use meridian_core::{
    messages::{ApiVersion, BackupRequest, ResponseError, StorageBackend},
    ts, Range,
};

fn request() -> BackupRequest {
    BackupRequest {
        start_version: 0,
        end_version: 100,
        ..Default::default()
    }
}

async fn new_client(cluster: &TestCluster) -> Client {
    new_client_with(cluster, BackupConfig::default()).await
}

async fn new_client_with(cluster: &TestCluster, config: BackupConfig) -> Client {
    let mut client = Client::new(cluster.manager(), config).await.unwrap();
    client
        .set_storage(StorageBackend::Noop, Arc::new(MemStorage::new()))
        .await
        .unwrap();
    client
}

fn manifest_names(manifest: &VecManifest) -> Vec<String> {
    manifest.files().into_iter().map(|file| file.name).collect()
}

#[tokio::test(start_paused = true)]
async fn happy_path_two_stores() {
    let cluster = TestCluster::builder()
        .store(1, vec![])
        .store(2, vec![])
        .build();
    cluster.push_attempt(
        1,
        ScriptedAttempt::Stream(vec![Ok(ok_response(
            b"a",
            b"m",
            vec![named_file("1_1.sst", b"a", b"m")],
        ))]),
    );
    cluster.push_attempt(
        2,
        ScriptedAttempt::Stream(vec![Ok(ok_response(
            b"m",
            b"z",
            vec![named_file("2_1.sst", b"m", b"z")],
        ))]),
    );
    let client = new_client(&cluster).await;
    let manifest = VecManifest::new();
    let counter = ProgressCounter::new();

    client
        .backup_range(
            &Range::new(b"a".to_vec(), b"z".to_vec()),
            request(),
            &manifest,
            &|unit| counter.record(unit),
        )
        .await
        .unwrap();

    assert_eq!(manifest_names(&manifest), vec!["1_1.sst", "2_1.sst"]);
    assert_eq!(counter.regions(), 2);
    assert_eq!(counter.ranges(), 1);
    // Push-down covered everything: the fine-grained phase never looked up a
    // region.
    assert_eq!(cluster.placement().region_calls.load(Ordering::SeqCst), 0);
}

#[tokio::test(start_paused = true)]
async fn manifest_is_emitted_in_ascending_key_order() {
    let cluster = TestCluster::builder().store(1, vec![]).build();
    cluster.push_attempt(
        1,
        ScriptedAttempt::Stream(vec![
            Ok(ok_response(b"m", b"z", vec![named_file("high.sst", b"m", b"z")])),
            Ok(ok_response(b"a", b"m", vec![named_file("low.sst", b"a", b"m")])),
        ]),
    );
    let client = new_client(&cluster).await;
    let manifest = VecManifest::new();

    client
        .backup_range(
            &Range::new(b"a".to_vec(), b"z".to_vec()),
            request(),
            &manifest,
            &|_| {},
        )
        .await
        .unwrap();

    assert_eq!(manifest_names(&manifest), vec!["low.sst", "high.sst"]);
}

#[tokio::test(start_paused = true)]
async fn fine_grained_fills_the_gap_left_by_push_down() {
    let cluster = TestCluster::builder()
        .store(1, vec![])
        .store(2, vec![])
        .region(1, b"m", b"z", 2)
        .build();
    cluster.push_attempt(
        1,
        ScriptedAttempt::Stream(vec![Ok(ok_response(
            b"a",
            b"m",
            vec![named_file("1_1.sst", b"a", b"m")],
        ))]),
    );
    // Store 2 contributes nothing during push-down.
    cluster.push_attempt(2, ScriptedAttempt::Stream(vec![]));
    cluster.push_attempt(
        2,
        ScriptedAttempt::Stream(vec![Ok(ok_response(
            b"m",
            b"z",
            vec![named_file("2_1.sst", b"m", b"z")],
        ))]),
    );
    let client = new_client(&cluster).await;
    let manifest = VecManifest::new();
    let counter = ProgressCounter::new();

    client
        .backup_range(
            &Range::new(b"a".to_vec(), b"z".to_vec()),
            request(),
            &manifest,
            &|unit| counter.record(unit),
        )
        .await
        .unwrap();

    assert_eq!(manifest_names(&manifest), vec!["1_1.sst", "2_1.sst"]);
    assert_eq!(counter.regions(), 2);
    assert_eq!(counter.ranges(), 1);
    assert_eq!(cluster.backup_calls(2), 2);
}

#[tokio::test(start_paused = true)]
async fn resolved_lock_backs_off_and_retries() {
    let cluster = TestCluster::builder()
        .store(1, vec![])
        .region(1, b"a", b"z", 1)
        .lock_expiry(500)
        .build();
    // Nothing from push-down; the fine-grained attempt hits a lock, then
    // succeeds.
    cluster.push_attempt(1, ScriptedAttempt::Stream(vec![]));
    cluster.push_attempt(
        1,
        ScriptedAttempt::Stream(vec![Ok(locked_response(b"k", 500))]),
    );
    cluster.push_attempt(
        1,
        ScriptedAttempt::Stream(vec![Ok(ok_response(
            b"a",
            b"z",
            vec![named_file("1_1.sst", b"a", b"z")],
        ))]),
    );
    let client = new_client(&cluster).await;
    let manifest = VecManifest::new();
    let counter = ProgressCounter::new();
    let started = tokio::time::Instant::now();

    client
        .backup_range(
            &Range::new(b"a".to_vec(), b"z".to_vec()),
            request(),
            &manifest,
            &|unit| counter.record(unit),
        )
        .await
        .unwrap();

    assert_eq!(cluster.resolver().calls(), 1);
    // The round slept exactly the lock's remaining lifetime.
    assert_eq!(started.elapsed(), Duration::from_millis(500));
    assert_eq!(manifest_names(&manifest), vec!["1_1.sst"]);
    assert_eq!(counter.regions(), 1);
}

#[tokio::test(start_paused = true)]
async fn torn_down_stream_is_retried_on_a_fresh_channel() {
    let cluster = TestCluster::builder().store(1, vec![]).build();
    cluster.push_attempt(1, ScriptedAttempt::Fail(Status::unavailable("tcp reset")));
    cluster.push_attempt(
        1,
        ScriptedAttempt::Stream(vec![
            Ok(ok_response(b"a", b"m", vec![named_file("1_1.sst", b"a", b"m")])),
            Ok(ok_response(b"m", b"z", vec![named_file("1_2.sst", b"m", b"z")])),
        ]),
    );
    let client = new_client(&cluster).await;
    let manifest = VecManifest::new();
    let started = tokio::time::Instant::now();

    client
        .backup_range(
            &Range::new(b"a".to_vec(), b"z".to_vec()),
            request(),
            &manifest,
            &|_| {},
        )
        .await
        .unwrap();

    assert_eq!(cluster.backup_calls(1), 2);
    assert_eq!(cluster.resets(1), 1);
    assert_eq!(started.elapsed(), Duration::from_secs(3));
    assert_eq!(manifest_names(&manifest), vec!["1_1.sst", "1_2.sst"]);
}

#[tokio::test(start_paused = true)]
async fn cluster_id_mismatch_aborts_immediately() {
    let cluster = TestCluster::builder().store(1, vec![]).build();
    cluster.push_attempt(
        1,
        ScriptedAttempt::Stream(vec![Ok(meridian_core::messages::BackupResponse {
            error: Some(ResponseError::ClusterIdMismatch {
                request: 1,
                current: 99,
            }),
            ..Default::default()
        })]),
    );
    let client = new_client(&cluster).await;
    let manifest = VecManifest::new();

    let err = client
        .backup_range(
            &Range::new(b"a".to_vec(), b"z".to_vec()),
            request(),
            &manifest,
            &|_| {},
        )
        .await
        .unwrap_err();

    assert!(matches!(
        err.kind(),
        ErrorKind::ClusterIdMismatch {
            store_id: 1,
            request: 1,
            current: 99,
        }
    ));
    assert!(manifest.files().is_empty());
}

#[tokio::test(start_paused = true)]
async fn negative_timeago_is_rejected_after_one_oracle_call() {
    let cluster = TestCluster::builder().build();
    let client = new_client(&cluster).await;

    let err = client.backup_ts(-1_000, 0).await.unwrap_err();

    assert!(matches!(err.kind(), ErrorKind::InvalidArgument(_)));
    assert_eq!(cluster.placement().ts_calls.load(Ordering::SeqCst), 1);
    // The invalid timestamp was never validated against the GC safepoint.
    assert!(cluster
        .placement()
        .safe_point_updates
        .lock()
        .unwrap()
        .is_empty());
}

#[tokio::test(start_paused = true)]
async fn timeago_rewinds_only_the_physical_component() {
    let cluster = TestCluster::builder().now(1_700_000_000_000, 5).build();
    let client = new_client(&cluster).await;

    let backup_ts = client.backup_ts(5_000, 0).await.unwrap();

    assert_eq!(ts::physical(backup_ts), 1_700_000_000_000 - 5_000);
    assert_eq!(ts::logical(backup_ts), 5);
    assert_eq!(cluster.placement().ts_calls.load(Ordering::SeqCst), 1);
}

#[tokio::test(start_paused = true)]
async fn absurd_timeago_overflows() {
    let cluster = TestCluster::builder().now(1_000, 0).build();
    let client = new_client(&cluster).await;

    let err = client.backup_ts(2_000, 0).await.unwrap_err();

    assert!(matches!(err.kind(), ErrorKind::InvalidArgument(_)));
}

#[tokio::test(start_paused = true)]
async fn override_ts_skips_the_oracle() {
    let cluster = TestCluster::builder().build();
    let client = new_client(&cluster).await;

    let backup_ts = client.backup_ts(0, 42).await.unwrap();

    assert_eq!(backup_ts, 42);
    assert_eq!(cluster.placement().ts_calls.load(Ordering::SeqCst), 0);
}

#[tokio::test(start_paused = true)]
async fn garbage_collected_ts_is_refused() {
    let cluster = TestCluster::builder().gc_safe_point(1_000_000).build();
    let client = new_client(&cluster).await;

    let err = client.backup_ts(0, 42).await.unwrap_err();

    assert!(matches!(err.kind(), ErrorKind::InvalidArgument(_)));
}

#[tokio::test(start_paused = true)]
async fn gc_safepoint_is_only_registered_on_v2_clusters() {
    let v1 = TestCluster::builder().build();
    let client = new_client(&v1).await;
    assert_eq!(client.update_gc_safe_point(0).await.unwrap(), 0);
    assert!(v1.placement().safe_point_updates.lock().unwrap().is_empty());

    let v2 = TestCluster::builder().api_version(ApiVersion::V2).build();
    let client = new_client(&v2).await;
    let backup_ts = client.update_gc_safe_point(0).await.unwrap();
    assert_eq!(ts::physical(backup_ts), 1_700_000_000_000);
    let updates = v2.placement().safe_point_updates.lock().unwrap().clone();
    // One probe from the safepoint validation, then the real registration.
    assert_eq!(updates.len(), 2);
    let (id, ttl, registered_ts) = updates.last().unwrap().clone();
    assert!(id.starts_with("backup-"));
    assert_eq!(ttl, Duration::from_secs(5 * 60));
    assert_eq!(registered_ts, backup_ts);
}

#[tokio::test(start_paused = true)]
async fn empty_range_list_is_a_no_op() {
    let cluster = TestCluster::builder().store(1, vec![]).build();
    let client = new_client(&cluster).await;
    let manifest = VecManifest::new();

    client
        .backup_ranges(Vec::new(), request(), 4, &manifest, &|_| {})
        .await
        .unwrap();

    assert!(manifest.files().is_empty());
    assert_eq!(cluster.placement().store_list_calls.load(Ordering::SeqCst), 0);
    assert_eq!(cluster.backup_calls(1), 0);
}

#[tokio::test(start_paused = true)]
async fn unbounded_end_key_flows_through_the_pipeline() {
    let cluster = TestCluster::builder().store(1, vec![]).build();
    cluster.push_attempt(
        1,
        ScriptedAttempt::Stream(vec![Ok(ok_response(
            b"a",
            b"",
            vec![named_file("tail.sst", b"a", b"")],
        ))]),
    );
    let client = new_client(&cluster).await;
    let manifest = VecManifest::new();

    client
        .backup_range(
            &Range::new(b"a".to_vec(), Vec::new()),
            request(),
            &manifest,
            &|_| {},
        )
        .await
        .unwrap();

    assert_eq!(manifest_names(&manifest), vec!["tail.sst"]);
}

#[tokio::test(start_paused = true)]
async fn silent_stores_exhaust_the_backoff_budget_instead_of_spinning() {
    let cluster = TestCluster::builder()
        .store(1, vec![])
        .region(1, b"a", b"z", 1)
        .build();
    // Every stream returns an immediate end-of-stream: each fine-grained
    // round makes no progress and backs off 10 s against a 25 s budget.
    let config = BackupConfig {
        fine_grained_max_backoff: Duration::from_secs(25),
        ..Default::default()
    };
    let client = new_client_with(&cluster, config).await;
    let manifest = VecManifest::new();
    let started = tokio::time::Instant::now();

    let err = client
        .backup_range(
            &Range::new(b"a".to_vec(), b"z".to_vec()),
            request(),
            &manifest,
            &|_| {},
        )
        .await
        .unwrap_err();

    assert!(matches!(err.kind(), ErrorKind::BackoffExhausted(_)));
    assert_eq!(started.elapsed(), Duration::from_secs(20));
    assert!(manifest.files().is_empty());
}

#[tokio::test(start_paused = true)]
async fn missing_leader_surfaces_after_exhausted_lookups() {
    let cluster = TestCluster::builder().store(1, vec![]).build();
    let client = new_client(&cluster).await;
    let manifest = VecManifest::new();

    let err = client
        .backup_range(
            &Range::new(b"a".to_vec(), b"z".to_vec()),
            request(),
            &manifest,
            &|_| {},
        )
        .await
        .unwrap_err();

    assert!(matches!(err.kind(), ErrorKind::NoLeader));
    assert_eq!(cluster.placement().region_calls.load(Ordering::SeqCst), 5);
}

#[tokio::test(start_paused = true)]
async fn leaderless_region_also_exhausts_lookups() {
    let cluster = TestCluster::builder()
        .store(1, vec![])
        .leaderless_region(1, b"a", b"z")
        .build();
    let client = new_client(&cluster).await;
    let manifest = VecManifest::new();

    let err = client
        .backup_range(
            &Range::new(b"a".to_vec(), b"z".to_vec()),
            request(),
            &manifest,
            &|_| {},
        )
        .await
        .unwrap_err();

    assert!(matches!(err.kind(), ErrorKind::NoLeader));
}

#[tokio::test(start_paused = true)]
async fn unreachable_leader_store_backs_off_one_election_timeout() {
    let cluster = TestCluster::builder()
        .store(1, vec![])
        .store(2, vec![])
        .region(1, b"m", b"z", 2)
        .store_reachable_times(2, 1)
        .build();
    cluster.push_attempt(
        1,
        ScriptedAttempt::Stream(vec![Ok(ok_response(
            b"a",
            b"m",
            vec![named_file("1_1.sst", b"a", b"m")],
        ))]),
    );
    // 20 s (election timeout) per round against a 30 s budget: the second
    // round exhausts it.
    let config = BackupConfig {
        fine_grained_max_backoff: Duration::from_secs(30),
        ..Default::default()
    };
    let client = new_client_with(&cluster, config).await;
    let manifest = VecManifest::new();
    let started = tokio::time::Instant::now();

    let err = client
        .backup_range(
            &Range::new(b"a".to_vec(), b"z".to_vec()),
            request(),
            &manifest,
            &|_| {},
        )
        .await
        .unwrap_err();

    assert!(matches!(err.kind(), ErrorKind::BackoffExhausted(_)));
    assert_eq!(started.elapsed(), Duration::from_secs(20));
}

#[tokio::test]
async fn storage_preflight_refuses_an_existing_manifest() {
    let cluster = TestCluster::builder().build();
    let mut client = Client::new(cluster.manager(), BackupConfig::default())
        .await
        .unwrap();
    let storage = Arc::new(MemStorage::new());
    storage.insert(META_FILE, b"old manifest");

    let err = client
        .set_storage(StorageBackend::Noop, storage)
        .await
        .unwrap_err();
    assert!(matches!(err.kind(), ErrorKind::InvalidArgument(_)));
}

#[tokio::test]
async fn storage_preflight_refuses_a_locked_destination_with_data() {
    let cluster = TestCluster::builder().build();
    let mut client = Client::new(cluster.manager(), BackupConfig::default())
        .await
        .unwrap();
    let storage = Arc::new(MemStorage::new());
    storage.insert(LOCK_FILE, b"lock");
    storage.insert("7/000042.sst", b"data");

    let err = client
        .set_storage(StorageBackend::Noop, storage)
        .await
        .unwrap_err();
    assert!(matches!(err.kind(), ErrorKind::InvalidArgument(_)));
}

#[tokio::test]
async fn stale_lock_without_data_is_tolerated_and_relocked() {
    let cluster = TestCluster::builder().build();
    let mut client = Client::new(cluster.manager(), BackupConfig::default())
        .await
        .unwrap();
    let storage = Arc::new(MemStorage::new());
    storage.insert(LOCK_FILE, b"stale lock");

    client
        .set_storage(
            StorageBackend::Noop,
            Arc::clone(&storage) as Arc<dyn ExternalStorage>,
        )
        .await
        .unwrap();
    client.set_lock_file().await.unwrap();
    assert!(storage.contains(LOCK_FILE));
}

#[tokio::test]
async fn zero_gc_ttl_falls_back_to_the_default() {
    let cluster = TestCluster::builder().build();
    let mut client = new_client(&cluster).await;
    client.set_gc_ttl(Duration::from_secs(60));
    assert_eq!(client.gc_ttl(), Duration::from_secs(60));
    client.set_gc_ttl(Duration::ZERO);
    assert_eq!(client.gc_ttl(), Duration::from_secs(5 * 60));
}

#[tokio::test(start_paused = true)]
async fn backup_ranges_runs_every_range() {
    let cluster = TestCluster::builder().store(1, vec![]).build();
    // One push-down stream per input range.
    cluster.push_attempt(
        1,
        ScriptedAttempt::Stream(vec![Ok(ok_response(
            b"a",
            b"c",
            vec![named_file("r1.sst", b"a", b"c")],
        ))]),
    );
    cluster.push_attempt(
        1,
        ScriptedAttempt::Stream(vec![Ok(ok_response(
            b"c",
            b"e",
            vec![named_file("r2.sst", b"c", b"e")],
        ))]),
    );
    let client = new_client(&cluster).await;
    let manifest = VecManifest::new();
    let counter = ProgressCounter::new();

    client
        .backup_ranges(
            vec![
                Range::new(b"a".to_vec(), b"c".to_vec()),
                Range::new(b"c".to_vec(), b"e".to_vec()),
            ],
            request(),
            1,
            &manifest,
            &|unit| counter.record(unit),
        )
        .await
        .unwrap();

    assert_eq!(counter.ranges(), 2);
    assert_eq!(counter.regions(), 2);
    assert_eq!(manifest.files().len(), 2);
}
