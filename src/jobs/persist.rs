// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Durable storage of the job store.
//!
//! [`JsonFileGateway`] writes the snapshot as pretty JSON using a temp file +
//! fsync + atomic rename, holding an exclusive lock on a sibling `.lock` file
//! for the duration so a second process cannot interleave writes.

use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{bail, Context, Result};
use chrono::Utc;
use fs2::FileExt;

use super::store::PersistedSnapshot;
use crate::error::MalformedSnapshot;
use crate::locks::resilient_lock;

/// Default timeout for acquiring file locks (5 seconds)
const LOCK_TIMEOUT: Duration = Duration::from_secs(5);

/// Retry interval when waiting for lock acquisition
const LOCK_RETRY_INTERVAL: Duration = Duration::from_millis(50);

/// Atomic save/load of the job store.
pub trait PersistenceGateway: Send + Sync {
    /// Load the last snapshot. `Ok(None)` when nothing was saved yet.
    ///
    /// A document that exists but cannot be parsed is reported as a
    /// [`MalformedSnapshot`] error; any other error means the state could
    /// not be read at all.
    fn load(&self) -> Result<Option<PersistedSnapshot>>;

    fn save(&self, snapshot: &PersistedSnapshot) -> Result<()>;
}

/// Snapshot stored as a JSON file.
#[derive(Debug, Clone)]
pub struct JsonFileGateway {
    path: PathBuf,
    lock_timeout: Duration,
}

impl JsonFileGateway {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            lock_timeout: LOCK_TIMEOUT,
        }
    }

    pub fn with_lock_timeout(mut self, timeout: Duration) -> Self {
        self.lock_timeout = timeout;
        self
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn lock_path(&self) -> PathBuf {
        self.path.with_extension("lock")
    }

    fn open_lock_file(path: &Path) -> Result<File> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create directory for lock file: {:?}", parent))?;
        }
        OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)
            .with_context(|| format!("Failed to open lock file: {:?}", path))
    }

    /// Retry `try_lock` until it succeeds or `timeout` expires.
    fn lock_with_timeout(
        file: &File,
        timeout: Duration,
        try_lock: fn(&File) -> std::io::Result<()>,
    ) -> Result<()> {
        let start = Instant::now();
        loop {
            match try_lock(file) {
                Ok(()) => return Ok(()),
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                    if start.elapsed() >= timeout {
                        bail!(
                            "Timed out waiting for lock on job state after {:?}. \
                             Another instance may be writing to the state file.",
                            timeout
                        );
                    }
                    thread::sleep(LOCK_RETRY_INTERVAL);
                }
                Err(e) => return Err(e).context("Failed to acquire lock on job state"),
            }
        }
    }
}

impl PersistenceGateway for JsonFileGateway {
    fn load(&self) -> Result<Option<PersistedSnapshot>> {
        if !self.path.exists() {
            return Ok(None);
        }

        let lock_file = Self::open_lock_file(&self.lock_path())?;
        Self::lock_with_timeout(&lock_file, self.lock_timeout, |f| FileExt::try_lock_shared(f))?;

        let content = fs::read_to_string(&self.path)
            .with_context(|| format!("Failed to read job state: {:?}", self.path))?;
        let snapshot: PersistedSnapshot = serde_json::from_str(&content).map_err(|e| {
            anyhow::Error::new(MalformedSnapshot {
                path: self.path.clone(),
                message: e.to_string(),
            })
        })?;
        Ok(Some(snapshot))
    }

    fn save(&self, snapshot: &PersistedSnapshot) -> Result<()> {
        let lock_file = Self::open_lock_file(&self.lock_path())?;
        Self::lock_with_timeout(&lock_file, self.lock_timeout, |f| FileExt::try_lock_exclusive(f))?;

        let mut document = snapshot.clone();
        document.last_saved = Some(Utc::now());
        let content = serde_json::to_string_pretty(&document)
            .with_context(|| "Failed to serialize job state to JSON")?;

        let temp_path = self.path.with_extension("tmp");
        {
            let mut temp_file = OpenOptions::new()
                .write(true)
                .create(true)
                .truncate(true)
                .open(&temp_path)
                .with_context(|| format!("Failed to create temp file: {:?}", temp_path))?;
            temp_file
                .write_all(content.as_bytes())
                .with_context(|| "Failed to write to temp file")?;
            temp_file
                .sync_all()
                .with_context(|| "Failed to sync temp file to disk")?;
        }

        fs::rename(&temp_path, &self.path).with_context(|| {
            format!("Failed to rename temp file to job state: {:?} -> {:?}", temp_path, self.path)
        })?;
        Ok(())
    }
}

/// Gateway that keeps the snapshot in memory. Used for tests and dry runs.
#[derive(Debug, Default)]
pub struct MemoryGateway {
    snapshot: Mutex<Option<PersistedSnapshot>>,
    saves: Mutex<usize>,
}

impl MemoryGateway {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_snapshot(snapshot: PersistedSnapshot) -> Self {
        Self {
            snapshot: Mutex::new(Some(snapshot)),
            saves: Mutex::new(0),
        }
    }

    /// Last saved snapshot.
    pub fn snapshot(&self) -> Option<PersistedSnapshot> {
        resilient_lock(&self.snapshot).clone()
    }

    /// Number of completed saves.
    pub fn save_count(&self) -> usize {
        *resilient_lock(&self.saves)
    }
}

impl PersistenceGateway for MemoryGateway {
    fn load(&self) -> Result<Option<PersistedSnapshot>> {
        Ok(self.snapshot())
    }

    fn save(&self, snapshot: &PersistedSnapshot) -> Result<()> {
        *resilient_lock(&self.snapshot) = Some(snapshot.clone());
        *resilient_lock(&self.saves) += 1;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jobs::entry::{Entry, EntryParams};
    use tempfile::TempDir;

    #[test]
    fn test_load_missing_file() {
        let temp_dir = TempDir::new().expect("Failed to create temp dir");
        let gateway = JsonFileGateway::new(temp_dir.path().join("jobs.json"));
        assert!(gateway.load().expect("load").is_none());
    }

    #[test]
    fn test_save_then_load() {
        let temp_dir = TempDir::new().expect("Failed to create temp dir");
        let gateway = JsonFileGateway::new(temp_dir.path().join("state").join("jobs.json"));

        let entry = Entry::new(EntryParams::new("a harbor at dawn"));
        let snapshot = PersistedSnapshot {
            version: 1,
            last_saved: None,
            queue: vec![entry.id()],
            entries: vec![entry],
        };
        gateway.save(&snapshot).expect("save");

        let loaded = gateway.load().expect("load").expect("snapshot present");
        assert_eq!(loaded.entries, snapshot.entries);
        assert_eq!(loaded.queue, snapshot.queue);
        assert!(loaded.last_saved.is_some());
        assert!(!temp_dir.path().join("state").join("jobs.tmp").exists());
    }

    #[test]
    fn test_malformed_file_is_an_error() {
        let temp_dir = TempDir::new().expect("Failed to create temp dir");
        let path = temp_dir.path().join("jobs.json");
        fs::write(&path, "{ not json").expect("write");

        let gateway = JsonFileGateway::new(&path);
        let err = gateway.load().expect_err("malformed file");
        assert!(err.downcast_ref::<MalformedSnapshot>().is_some());
    }

    #[test]
    fn test_load_times_out_while_locked() {
        let temp_dir = TempDir::new().expect("Failed to create temp dir");
        let path = temp_dir.path().join("jobs.json");
        fs::write(&path, "{ not json").expect("write");
        let gateway = JsonFileGateway::new(&path).with_lock_timeout(Duration::from_millis(100));

        let held = JsonFileGateway::open_lock_file(&gateway.lock_path()).expect("lock file");
        FileExt::lock_exclusive(&held).expect("hold lock");

        let err = gateway.load().expect_err("load should time out");
        assert!(err.downcast_ref::<MalformedSnapshot>().is_none());
        assert!(err.to_string().contains("Timed out"));

        FileExt::unlock(&held).expect("unlock");
    }

    #[test]
    fn test_save_times_out_while_locked() {
        let temp_dir = TempDir::new().expect("Failed to create temp dir");
        let gateway = JsonFileGateway::new(temp_dir.path().join("jobs.json"))
            .with_lock_timeout(Duration::from_millis(100));

        let held = JsonFileGateway::open_lock_file(&gateway.lock_path()).expect("lock file");
        FileExt::lock_exclusive(&held).expect("hold lock");

        let err = gateway
            .save(&PersistedSnapshot::default())
            .expect_err("save should time out");
        assert!(err.to_string().contains("Timed out"));

        FileExt::unlock(&held).expect("unlock");
        assert!(gateway.save(&PersistedSnapshot::default()).is_ok());
    }
}
