// Copyright (c) Mysten Labs, Inc.
// SPDX-License-Identifier: Apache-2.0

//! Coordinator configuration.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_with::{serde_as, DurationMilliSeconds, DurationSeconds};

use crate::backoff::ExponentialBackoffConfig;

/// Tuning knobs of the backup coordinator.
///
/// The defaults reproduce the behavior the storage nodes are operated
/// against: four fine-grained workers, five attempts per backup stream, an
/// 80-second cumulative fine-grained backoff budget, and a 3-second pause
/// before reopening a torn-down stream.
#[serde_as]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BackupConfig {
    /// Worker tasks per fine-grained iteration.
    pub fine_grained_workers: usize,
    /// Cumulative sleep budget of one fine-grained phase.
    #[serde_as(as = "DurationMilliSeconds")]
    #[serde(rename = "fine_grained_max_backoff_millis")]
    pub fine_grained_max_backoff: Duration,
    /// Attempts to drive one store's backup stream to completion.
    pub stream_retry_attempts: usize,
    /// Pause before reopening a backup stream after a retryable failure.
    #[serde_as(as = "DurationMilliSeconds")]
    #[serde(rename = "stream_reset_backoff_millis")]
    pub stream_reset_backoff: Duration,
    /// Attempts of the region-leader lookup.
    pub leader_lookup_attempts: usize,
    /// TTL of the service safepoint registered for a backup.
    #[serde_as(as = "DurationSeconds")]
    #[serde(rename = "gc_ttl_secs")]
    pub gc_ttl: Duration,
    /// Retry strategy for placement-service requests.
    pub placement_retry: ExponentialBackoffConfig,
}

impl Default for BackupConfig {
    fn default() -> Self {
        Self {
            fine_grained_workers: 4,
            fine_grained_max_backoff: Duration::from_millis(80_000),
            stream_retry_attempts: 5,
            stream_reset_backoff: Duration::from_secs(3),
            leader_lookup_attempts: 5,
            gc_ttl: Duration::from_secs(5 * 60),
            placement_retry: ExponentialBackoffConfig::default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_the_operated_values() {
        let config = BackupConfig::default();
        assert_eq!(config.fine_grained_workers, 4);
        assert_eq!(config.fine_grained_max_backoff, Duration::from_secs(80));
        assert_eq!(config.stream_retry_attempts, 5);
        assert_eq!(config.stream_reset_backoff, Duration::from_secs(3));
    }
}
