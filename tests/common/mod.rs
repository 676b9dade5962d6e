// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Mock collaborators shared by the integration tests.

#![allow(dead_code)]

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{watch, Notify};
use tokio::time::timeout;

use genstudio::resource::transport::ProgressFn;
use genstudio::{
    AssetTransport, ComputeEngine, EngineFactory, ExpansionError, JobFailure, JobOutput,
    JobRequest, ResourcePhase, ResourceVersion, StepControl, StepProgress, TransportError,
};

pub const TEST_TIMEOUT_SECS: u64 = 10;

// =============================================================================
// TRANSPORT
// =============================================================================

/// Transport that writes a fake archive and expands it into one file.
#[derive(Default)]
pub struct MockTransport {
    /// Downloads that fail before succeeding.
    pub fail_downloads: AtomicUsize,
    /// Expansions that fail, after leaving a partial file behind.
    pub fail_expands: AtomicUsize,
    pub downloads: AtomicUsize,
    /// Whether the archive file already existed when each download started.
    pub archive_preexisting: Mutex<Vec<bool>>,
    /// Downloads whose URL contains this text wait for `release`.
    pub hold: Mutex<Option<String>>,
    pub release: Notify,
}

impl MockTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn failing(times: usize) -> Self {
        let transport = Self::default();
        transport.fail_downloads.store(times, Ordering::SeqCst);
        transport
    }

    pub fn failing_expansion(times: usize) -> Self {
        let transport = Self::default();
        transport.fail_expands.store(times, Ordering::SeqCst);
        transport
    }

    pub fn holding(pattern: &str) -> Self {
        let transport = Self::default();
        *transport.hold.lock().unwrap() = Some(pattern.to_string());
        transport
    }

    pub fn download_count(&self) -> usize {
        self.downloads.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl AssetTransport for MockTransport {
    async fn download(
        &self,
        url: &str,
        dest: &Path,
        progress: ProgressFn<'_>,
    ) -> Result<(), TransportError> {
        self.downloads.fetch_add(1, Ordering::SeqCst);
        self.archive_preexisting.lock().unwrap().push(dest.exists());

        if let Some(parent) = dest.parent() {
            std::fs::create_dir_all(parent).unwrap();
        }
        std::fs::write(dest, b"part").unwrap();
        progress(4, Some(8));

        let held = self
            .hold
            .lock()
            .unwrap()
            .as_deref()
            .is_some_and(|pattern| url.contains(pattern));
        if held {
            self.release.notified().await;
        }

        let remaining = self.fail_downloads.load(Ordering::SeqCst);
        if remaining > 0 {
            self.fail_downloads.store(remaining - 1, Ordering::SeqCst);
            return Err(TransportError::Status {
                status: 503,
                url: url.to_string(),
            });
        }

        std::fs::write(dest, b"full").unwrap();
        progress(8, Some(8));
        Ok(())
    }

    async fn expand(&self, archive: &Path, into: &Path) -> Result<(), ExpansionError> {
        assert!(archive.exists(), "archive must exist before expansion");
        std::fs::create_dir_all(into).unwrap();

        let remaining = self.fail_expands.load(Ordering::SeqCst);
        if remaining > 0 {
            self.fail_expands.store(remaining - 1, Ordering::SeqCst);
            std::fs::write(into.join("partial.bin"), b"wei").unwrap();
            return Err(ExpansionError::Corrupt {
                archive: archive.to_path_buf(),
                message: "unexpected end of archive".to_string(),
            });
        }

        std::fs::write(into.join("weights.bin"), b"weights").unwrap();
        Ok(())
    }
}

// =============================================================================
// ENGINE
// =============================================================================

/// Engine whose outcome is chosen by the prompt:
/// `reject*` is a safety rejection, `fail*` an inference error, anything else
/// succeeds with the prompt bytes as output.
pub struct ScriptedEngine {
    pub step_delay: Duration,
    pub runs: Mutex<Vec<String>>,
    pub aborted: Mutex<Vec<String>>,
    running: AtomicUsize,
    pub max_running: AtomicUsize,
    pub warm_ups: AtomicUsize,
    /// Warm-ups that fail before one succeeds.
    pub fail_warm_ups: AtomicUsize,
}

impl ScriptedEngine {
    pub fn new(step_delay: Duration) -> Self {
        Self {
            step_delay,
            runs: Mutex::new(Vec::new()),
            aborted: Mutex::new(Vec::new()),
            running: AtomicUsize::new(0),
            max_running: AtomicUsize::new(0),
            warm_ups: AtomicUsize::new(0),
            fail_warm_ups: AtomicUsize::new(0),
        }
    }

    pub fn runs(&self) -> Vec<String> {
        self.runs.lock().unwrap().clone()
    }

    pub fn aborted(&self) -> Vec<String> {
        self.aborted.lock().unwrap().clone()
    }
}

impl ComputeEngine for ScriptedEngine {
    fn warm_up(&self) -> anyhow::Result<()> {
        self.warm_ups.fetch_add(1, Ordering::SeqCst);
        let remaining = self.fail_warm_ups.load(Ordering::SeqCst);
        if remaining > 0 {
            self.fail_warm_ups.store(remaining - 1, Ordering::SeqCst);
            anyhow::bail!("warm-up kernel crashed");
        }
        Ok(())
    }

    fn run(
        &self,
        request: &JobRequest,
        on_step: &mut dyn FnMut(StepProgress) -> StepControl,
    ) -> Result<JobOutput, JobFailure> {
        self.runs.lock().unwrap().push(request.prompt.clone());
        let now = self.running.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_running.fetch_max(now, Ordering::SeqCst);

        let mut outcome = Ok(());
        for step in 1..=request.steps {
            std::thread::sleep(self.step_delay);
            let progress = StepProgress {
                step,
                total: request.steps,
            };
            if on_step(progress) == StepControl::Abort {
                self.aborted.lock().unwrap().push(request.prompt.clone());
                outcome = Err(JobFailure::Aborted);
                break;
            }
        }
        self.running.fetch_sub(1, Ordering::SeqCst);
        outcome?;

        if request.prompt.starts_with("reject") {
            Err(JobFailure::Rejected("nsfw".to_string()))
        } else if request.prompt.starts_with("fail") {
            Err(JobFailure::Failed("out of memory".to_string()))
        } else {
            Ok(JobOutput {
                bytes: request.prompt.as_bytes().to_vec(),
            })
        }
    }
}

/// Factory handing out one shared [`ScriptedEngine`].
pub struct MockFactory {
    pub engine: Arc<ScriptedEngine>,
    pub builds: AtomicUsize,
    /// Builds that fail before one succeeds.
    pub fail_builds: AtomicUsize,
}

impl MockFactory {
    pub fn new(engine: Arc<ScriptedEngine>) -> Self {
        Self {
            engine,
            builds: AtomicUsize::new(0),
            fail_builds: AtomicUsize::new(0),
        }
    }

    pub fn failing(engine: Arc<ScriptedEngine>, times: usize) -> Self {
        let factory = Self::new(engine);
        factory.fail_builds.store(times, Ordering::SeqCst);
        factory
    }

    pub fn build_count(&self) -> usize {
        self.builds.load(Ordering::SeqCst)
    }
}

impl EngineFactory for MockFactory {
    fn build(
        &self,
        resource_dir: &Path,
        _version: &ResourceVersion,
    ) -> anyhow::Result<Arc<dyn ComputeEngine>> {
        self.builds.fetch_add(1, Ordering::SeqCst);
        let remaining = self.fail_builds.load(Ordering::SeqCst);
        if remaining > 0 {
            self.fail_builds.store(remaining - 1, Ordering::SeqCst);
            anyhow::bail!("device busy");
        }
        anyhow::ensure!(resource_dir.is_dir(), "resource dir missing");
        let engine: Arc<dyn ComputeEngine> = self.engine.clone();
        Ok(engine)
    }
}

// =============================================================================
// HELPERS
// =============================================================================

pub fn test_version(revision: u32) -> ResourceVersion {
    ResourceVersion::new("sd-test", revision, 512)
}

/// Lay down an expanded resource with a marker for `version`.
pub fn install_resource(root: &Path, version: &ResourceVersion) -> PathBuf {
    let dir = root.join(&version.key);
    std::fs::create_dir_all(&dir).unwrap();
    std::fs::write(dir.join("weights.bin"), b"weights").unwrap();
    std::fs::write(dir.join(version.marker_name()), b"").unwrap();
    dir
}

/// Wait until the phase satisfies `pred`, failing the test after a timeout.
pub async fn wait_phase(
    rx: &mut watch::Receiver<ResourcePhase>,
    pred: impl FnMut(&ResourcePhase) -> bool,
) -> ResourcePhase {
    timeout(Duration::from_secs(TEST_TIMEOUT_SECS), rx.wait_for(pred))
        .await
        .expect("timed out waiting for phase")
        .expect("phase channel closed")
        .clone()
}

/// Poll `check` until it holds, failing the test after a timeout.
pub async fn eventually(mut check: impl FnMut() -> bool) {
    let waited = timeout(Duration::from_secs(TEST_TIMEOUT_SECS), async {
        while !check() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await;
    assert!(waited.is_ok(), "condition not reached in time");
}
