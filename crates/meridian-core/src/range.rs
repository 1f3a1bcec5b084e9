// Copyright (c) Mysten Labs, Inc.
// SPDX-License-Identifier: Apache-2.0

//! Key ranges and the coverage tree used to track backup completion.

use std::{collections::BTreeMap, fmt};

use serde::{Deserialize, Serialize};

use crate::{keys::KeyDisplay, messages::BackupFile};

/// A half-open key interval `[start_key, end_key)`.
///
/// An empty `end_key` means "unbounded above". An empty `start_key` is simply
/// the smallest key.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Range {
    pub start_key: Vec<u8>,
    pub end_key: Vec<u8>,
}

impl Range {
    pub fn new(start_key: Vec<u8>, end_key: Vec<u8>) -> Self {
        Self { start_key, end_key }
    }
}

impl fmt::Display for Range {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}, ", KeyDisplay(&self.start_key))?;
        if self.end_key.is_empty() {
            write!(f, "+inf)")
        } else {
            write!(f, "{})", KeyDisplay(&self.end_key))
        }
    }
}

/// A sub-range that has been backed up, together with the files holding it.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BackedUpRange {
    pub start_key: Vec<u8>,
    pub end_key: Vec<u8>,
    pub files: Vec<BackupFile>,
}

/// Coverage tree over a key interval.
///
/// Stores disjoint backed-up sub-ranges ordered by start key. A later
/// [`put`](RangeTree::put) wins for every key it covers; older entries are
/// truncated to whatever falls outside it. Coverage therefore never shrinks,
/// and a sequence of puts that together span an interval leaves it complete.
#[derive(Debug, Default)]
pub struct RangeTree {
    ranges: BTreeMap<Vec<u8>, BackedUpRange>,
}

fn overlaps(a_start: &[u8], a_end: &[u8], b_start: &[u8], b_end: &[u8]) -> bool {
    (a_end.is_empty() || b_start < a_end) && (b_end.is_empty() || a_start < b_end)
}

impl RangeTree {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records `[start_key, end_key)` as backed up into `files`.
    pub fn put(&mut self, start_key: Vec<u8>, end_key: Vec<u8>, files: Vec<BackupFile>) {
        let overlapped: Vec<Vec<u8>> = self
            .ranges
            .values()
            .filter(|entry| overlaps(&entry.start_key, &entry.end_key, &start_key, &end_key))
            .map(|entry| entry.start_key.clone())
            .collect();
        for key in overlapped {
            let Some(old) = self.ranges.remove(&key) else {
                continue;
            };
            // Keep the parts of the older range that the new put does not cover.
            if old.start_key < start_key {
                self.ranges.insert(
                    old.start_key.clone(),
                    BackedUpRange {
                        start_key: old.start_key,
                        end_key: start_key.clone(),
                        files: old.files.clone(),
                    },
                );
            }
            if !end_key.is_empty() && (old.end_key.is_empty() || old.end_key > end_key) {
                self.ranges.insert(
                    end_key.clone(),
                    BackedUpRange {
                        start_key: end_key.clone(),
                        end_key: old.end_key,
                        files: old.files,
                    },
                );
            }
        }
        self.ranges.insert(
            start_key.clone(),
            BackedUpRange {
                start_key,
                end_key,
                files,
            },
        );
    }

    /// Returns the gaps inside `[start_key, end_key)` not covered by any put.
    pub fn incomplete(&self, start_key: &[u8], end_key: &[u8]) -> Vec<Range> {
        let mut gaps = Vec::new();
        let mut cursor = start_key.to_vec();
        for entry in self.ranges.values() {
            // Entirely below the scan cursor.
            if !entry.end_key.is_empty() && entry.end_key.as_slice() <= cursor.as_slice() {
                continue;
            }
            // Entirely above the queried interval.
            if !end_key.is_empty() && entry.start_key.as_slice() >= end_key {
                break;
            }
            if entry.start_key.as_slice() > cursor.as_slice() {
                gaps.push(Range::new(cursor.clone(), entry.start_key.clone()));
            }
            if entry.end_key.is_empty() {
                return gaps;
            }
            cursor = entry.end_key.clone();
        }
        if end_key.is_empty() || cursor.as_slice() < end_key {
            gaps.push(Range::new(cursor, end_key.to_vec()));
        }
        gaps
    }

    /// Visits the stored sub-ranges in ascending start-key order.
    pub fn iter(&self) -> impl Iterator<Item = &BackedUpRange> {
        self.ranges.values()
    }

    pub fn len(&self) -> usize {
        self.ranges.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ranges.is_empty()
    }
}
