// Copyright (c) Mysten Labs, Inc.
// SPDX-License-Identifier: Apache-2.0

//! Retry strategies and the fine-grained sleep budget.

use std::{future::Future, time::Duration};

use rand::{rngs::StdRng, Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use serde_with::{serde_as, DurationMilliSeconds};

/// Configuration for an [`ExponentialBackoff`] strategy.
#[serde_as]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExponentialBackoffConfig {
    /// The first delay between attempts.
    #[serde_as(as = "DurationMilliSeconds")]
    #[serde(rename = "min_backoff_millis")]
    pub min_backoff: Duration,
    /// Upper bound on any single delay.
    #[serde_as(as = "DurationMilliSeconds")]
    #[serde(rename = "max_backoff_millis")]
    pub max_backoff: Duration,
    /// Total number of retries; `None` retries without bound.
    pub max_retries: Option<u32>,
}

impl ExponentialBackoffConfig {
    pub fn new(min_backoff: Duration, max_backoff: Duration, max_retries: Option<u32>) -> Self {
        Self {
            min_backoff,
            max_backoff,
            max_retries,
        }
    }

    /// Creates the strategy described by this config, seeded for jitter.
    pub fn backoff_strategy(&self, seed: u64) -> ExponentialBackoff {
        ExponentialBackoff::new_with_seed(
            self.min_backoff,
            self.max_backoff,
            self.max_retries,
            seed,
        )
    }
}

impl Default for ExponentialBackoffConfig {
    fn default() -> Self {
        Self {
            min_backoff: Duration::from_millis(500),
            max_backoff: Duration::from_secs(5),
            max_retries: Some(5),
        }
    }
}

/// Iterator of exponentially growing, jittered delays.
#[derive(Debug)]
pub struct ExponentialBackoff<R = StdRng> {
    min_backoff: Duration,
    max_backoff: Duration,
    max_retries: Option<u32>,
    attempts: u32,
    rng: R,
}

impl ExponentialBackoff<StdRng> {
    /// Creates a strategy whose jitter sequence is determined by `seed`.
    pub fn new_with_seed(
        min_backoff: Duration,
        max_backoff: Duration,
        max_retries: Option<u32>,
        seed: u64,
    ) -> Self {
        Self {
            min_backoff,
            max_backoff,
            max_retries,
            attempts: 0,
            rng: StdRng::seed_from_u64(seed),
        }
    }
}

impl<R: Rng> Iterator for ExponentialBackoff<R> {
    type Item = Duration;

    fn next(&mut self) -> Option<Duration> {
        if let Some(max_retries) = self.max_retries {
            if self.attempts >= max_retries {
                return None;
            }
        }
        let factor = 1u32 << self.attempts.min(16);
        let full = self
            .min_backoff
            .checked_mul(factor)
            .unwrap_or(self.max_backoff)
            .min(self.max_backoff);
        self.attempts += 1;
        let full_ms = full.as_millis() as u64;
        let jittered = self.rng.gen_range(full_ms / 2..=full_ms.max(1));
        Some(Duration::from_millis(jittered))
    }
}

/// Retries `f` until it succeeds or `strategy` is exhausted, sleeping between
/// attempts. The final error is returned unchanged.
pub async fn retry<R, F, Fut, T, E>(mut strategy: ExponentialBackoff<R>, mut f: F) -> Result<T, E>
where
    R: Rng,
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: std::fmt::Display,
{
    loop {
        match f().await {
            Ok(value) => return Ok(value),
            Err(error) => match strategy.next() {
                Some(delay) => {
                    tracing::debug!(%error, ?delay, "operation failed, retrying after backoff");
                    tokio::time::sleep(delay).await;
                }
                None => return Err(error),
            },
        }
    }
}

/// Error returned once a [`SleepBudget`] runs dry.
#[derive(Debug, thiserror::Error)]
#[error("cumulative backoff of {limit:?} exhausted; a further {requested:?} sleep was requested")]
pub struct BudgetExceeded {
    pub requested: Duration,
    pub limit: Duration,
}

/// Cumulative sleep budget shared by every iteration of one phase.
#[derive(Debug)]
pub struct SleepBudget {
    limit: Duration,
    slept: Duration,
}

impl SleepBudget {
    pub fn new(limit: Duration) -> Self {
        Self {
            limit,
            slept: Duration::ZERO,
        }
    }

    /// Total time slept through this budget so far.
    pub fn slept(&self) -> Duration {
        self.slept
    }

    /// Sleeps for `delay`, charging it against the budget. Fails without
    /// sleeping once the cumulative total would exceed the limit.
    pub async fn sleep(&mut self, delay: Duration) -> Result<(), BudgetExceeded> {
        if self.slept + delay > self.limit {
            return Err(BudgetExceeded {
                requested: delay,
                limit: self.limit,
            });
        }
        self.slept += delay;
        tokio::time::sleep(delay).await;
        Ok(())
    }
}
