// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Filesystem primitives for resource storage.
//!
//! Layout under the documents root:
//!
//! ```text
//! {root}/{archive_name}            downloaded archive (transient)
//! {root}/{version_key}/            expanded model files
//! {root}/{version_key}/ready.{rev} readiness marker
//! ```

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use super::types::ResourceVersion;

/// Query and mutate primitives scoped to a resource's storage location.
pub trait ResourceStore: Send + Sync {
    /// Directory holding the expanded files of `version`.
    fn resource_dir(&self, version: &ResourceVersion) -> PathBuf;

    /// Where the archive for `version` is downloaded to.
    fn archive_path(&self, version: &ResourceVersion) -> PathBuf;

    fn exists(&self, path: &Path) -> bool;

    /// Remove a file or directory tree. A missing path is not an error.
    fn remove(&self, path: &Path) -> io::Result<()>;

    /// Create an empty marker file, creating parent directories as needed.
    fn create_marker(&self, path: &Path) -> io::Result<()>;

    /// Path of the readiness marker for the current revision.
    fn marker_path(&self, version: &ResourceVersion) -> PathBuf {
        self.resource_dir(version).join(version.marker_name())
    }

    /// True only if the marker for the *current* revision exists.
    fn is_ready(&self, version: &ResourceVersion) -> bool {
        self.exists(&self.marker_path(version))
    }
}

/// [`ResourceStore`] backed by the local filesystem.
#[derive(Debug, Clone)]
pub struct FsResourceStore {
    root: PathBuf,
}

impl FsResourceStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }
}

impl ResourceStore for FsResourceStore {
    fn resource_dir(&self, version: &ResourceVersion) -> PathBuf {
        self.root.join(&version.key)
    }

    fn archive_path(&self, version: &ResourceVersion) -> PathBuf {
        self.root.join(version.archive_name())
    }

    fn exists(&self, path: &Path) -> bool {
        path.exists()
    }

    fn remove(&self, path: &Path) -> io::Result<()> {
        let result = match fs::symlink_metadata(path) {
            Ok(meta) if meta.is_dir() => fs::remove_dir_all(path),
            Ok(_) => fs::remove_file(path),
            Err(e) => Err(e),
        };
        match result {
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            other => other,
        }
    }

    fn create_marker(&self, path: &Path) -> io::Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::File::create(path).map(|_| ())
    }
}
