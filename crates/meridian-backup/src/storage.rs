// Copyright (c) Mysten Labs, Inc.
// SPDX-License-Identifier: Apache-2.0

//! External object storage and the backup manifest sink.

use async_trait::async_trait;

use meridian_core::messages::BackupFile;

use crate::error::{BackupError, ErrorKind, Result};

/// Path of the backup manifest inside the destination prefix.
pub const META_FILE: &str = "backupmeta";
/// Sentinel marking a backup in progress.
pub const LOCK_FILE: &str = "LOCK";

pub(crate) const LOCK_FILE_CONTENTS: &str =
    "DO NOT DELETE\nThis file exists to remind other backup jobs won't use this path";

/// Byte-addressable object store holding the backup artifacts.
///
/// The concrete drivers (local filesystem, S3, ...) live outside this crate;
/// the coordinator only needs these four operations.
#[async_trait]
pub trait ExternalStorage: Send + Sync {
    /// Writes `contents` at `path`, replacing any existing object.
    async fn write_file(&self, path: &str, contents: &[u8]) -> anyhow::Result<()>;

    /// True iff an object exists at `path`.
    async fn file_exists(&self, path: &str) -> anyhow::Result<bool>;

    /// Visits every object under `prefix` with its size. Returning `false`
    /// from `visit` stops the walk early.
    async fn walk_dir(
        &self,
        prefix: &str,
        visit: &mut (dyn for<'a> FnMut(&'a str, u64) -> bool + Send),
    ) -> anyhow::Result<()>;

    /// Human-readable location of this storage, for error messages.
    fn uri(&self) -> String;
}

/// What a batch of manifest entries describes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ManifestEntryKind {
    /// SST files produced by storage nodes.
    DataFile,
    /// Auxiliary metadata emitted by the coordinator itself.
    MetaFile,
}

/// Append-only sink producing the backup manifest.
#[async_trait]
pub trait ManifestWriter: Send + Sync {
    async fn send(&self, files: Vec<BackupFile>, kind: ManifestEntryKind) -> anyhow::Result<()>;
}

/// Refuses a destination another backup job has already written into.
///
/// A `LOCK` sentinel alone is tolerated (a previous job may have died before
/// producing anything); a sentinel plus at least one `.sst` file is not.
pub async fn check_backup_storage_is_locked(storage: &dyn ExternalStorage) -> Result<()> {
    let locked = storage
        .file_exists(LOCK_FILE)
        .await
        .map_err(ErrorKind::Storage)?;
    if !locked {
        return Ok(());
    }
    let mut sst_found = false;
    storage
        .walk_dir("", &mut |path, _size| {
            if path.ends_with(".sst") {
                sst_found = true;
                return false;
            }
            true
        })
        .await
        .map_err(ErrorKind::Storage)?;
    if sst_found {
        return Err(BackupError::invalid_argument(format!(
            "backup lock file and sst files exist in {}, there are some backup files in the path \
             already, please specify a correct backup directory",
            storage.uri(),
        )));
    }
    Ok(())
}
