// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Resource lifecycle manager.
//!
//! Drives one model version from nothing to a warmed-up engine:
//!
//! ```text
//! Booting ──marker present──────────────────────────────┐
//!    │                                                  ▼
//!    └─▶ Downloading ─▶ Expanding ─▶ Initializing ─▶ Ready
//!            │              │              │
//!            ▼              ▼              ▼
//!      DownloadError  DownloadError  InitializingError ── retry ─▶ Booting
//! ```
//!
//! Every transition goes through [`Inner::set_phase`]. Each boot attempt runs
//! as its own task tagged with a generation number; version switches, retries
//! and shutdown bump the generation, so a stale task can never publish a
//! phase after it has been superseded.

use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::store::ResourceStore;
use super::transport::{verify_sha256, AssetTransport};
use super::types::{PhaseEvent, ResourcePhase, ResourceVersion};
use crate::engine::{EngineFactory, EngineHandle};
use crate::error::{EngineInitError, ExpansionError, LifecycleError};
use crate::locks::resilient_lock;

/// Minimum change in download fraction that produces a new phase event.
const PROGRESS_STEP: f64 = 0.005;

/// Capacity of the phase event broadcast channel.
const EVENT_CAPACITY: usize = 256;

/// Tunables for acquisition and initialization.
#[derive(Debug, Clone)]
pub struct ResourceConfig {
    /// Base URL archives are fetched from (`{base_url}/{archive_name}`).
    pub base_url: String,
    /// Engine construction attempts before giving up.
    pub init_attempts: u32,
    /// Delay between engine construction attempts.
    pub init_retry_delay: Duration,
}

impl ResourceConfig {
    pub const DEFAULT_INIT_ATTEMPTS: u32 = 3;
    pub const DEFAULT_INIT_RETRY_DELAY: Duration = Duration::from_secs(1);

    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            init_attempts: Self::DEFAULT_INIT_ATTEMPTS,
            init_retry_delay: Self::DEFAULT_INIT_RETRY_DELAY,
        }
    }

    fn archive_url(&self, version: &ResourceVersion) -> String {
        format!(
            "{}/{}",
            self.base_url.trim_end_matches('/'),
            version.archive_name()
        )
    }
}

struct Control {
    version: ResourceVersion,
    generation: u64,
    seq: u64,
    boot: Option<JoinHandle<()>>,
    last_progress: f64,
}

struct Inner {
    store: Arc<dyn ResourceStore>,
    transport: Arc<dyn AssetTransport>,
    factory: Arc<dyn EngineFactory>,
    config: ResourceConfig,
    control: Mutex<Control>,
    phase_tx: watch::Sender<ResourcePhase>,
    events_tx: broadcast::Sender<PhaseEvent>,
}

/// Owner of the compute resource for one process.
///
/// Cheap to clone; all clones share the same state machine. Methods that
/// start work (`startup`, `request_retry`, `select_version`) must be called
/// from within a Tokio runtime.
#[derive(Clone)]
pub struct ResourceManager {
    inner: Arc<Inner>,
}

impl ResourceManager {
    pub fn new(
        version: ResourceVersion,
        store: Arc<dyn ResourceStore>,
        transport: Arc<dyn AssetTransport>,
        factory: Arc<dyn EngineFactory>,
        config: ResourceConfig,
    ) -> Self {
        let (phase_tx, _) = watch::channel(ResourcePhase::Booting);
        let (events_tx, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            inner: Arc::new(Inner {
                store,
                transport,
                factory,
                config,
                control: Mutex::new(Control {
                    version,
                    generation: 0,
                    seq: 0,
                    boot: None,
                    last_progress: 0.0,
                }),
                phase_tx,
                events_tx,
            }),
        }
    }

    /// Begin acquisition. No-op unless the manager is still in `Booting`
    /// with no boot task running.
    pub fn startup(&self) {
        let mut control = resilient_lock(&self.inner.control);
        if !matches!(*self.inner.phase_tx.borrow(), ResourcePhase::Booting) {
            debug!("startup ignored: already past booting");
            return;
        }
        if control.boot.as_ref().is_some_and(|task| !task.is_finished()) {
            debug!("startup ignored: boot already running");
            return;
        }
        self.spawn_boot(&mut control);
    }

    /// Re-enter `Booting` from an error phase and try again from scratch.
    pub fn request_retry(&self) -> Result<(), LifecycleError> {
        let mut control = resilient_lock(&self.inner.control);
        let phase = self.inner.phase_tx.borrow().clone();
        if matches!(phase, ResourcePhase::ShutDown) {
            return Err(LifecycleError::ShutDown);
        }
        if !phase.is_error() {
            return Err(LifecycleError::NotRetryable(phase.label().to_string()));
        }

        info!(version = %control.version.key, "retrying resource acquisition");
        control.generation += 1;
        self.inner.publish(&mut control, ResourcePhase::Booting);
        self.spawn_boot(&mut control);
        Ok(())
    }

    /// Switch to a different model version.
    ///
    /// An in-flight download for another archive is cancelled and its
    /// progress discarded; the state machine restarts at `Booting` for the
    /// new version. A download already fetching the same archive is kept.
    pub fn select_version(&self, version: ResourceVersion) -> Result<(), LifecycleError> {
        let mut control = resilient_lock(&self.inner.control);
        let phase = self.inner.phase_tx.borrow().clone();
        if matches!(phase, ResourcePhase::ShutDown) {
            return Err(LifecycleError::ShutDown);
        }
        if control.version == version {
            return Ok(());
        }

        let downloading = matches!(phase, ResourcePhase::Downloading { .. })
            && control.boot.as_ref().is_some_and(|task| !task.is_finished());
        if downloading && control.version.archive_name() == version.archive_name() {
            info!(
                archive = %version.archive_name(),
                "keeping in-flight download for newly selected version"
            );
            control.version = version;
            return Ok(());
        }

        if let Some(task) = control.boot.take() {
            task.abort();
        }
        if downloading {
            let stale = self.inner.store.archive_path(&control.version);
            if let Err(e) = self.inner.store.remove(&stale) {
                warn!(path = %stale.display(), "could not discard partial archive: {}", e);
            }
        }

        info!(from = %control.version.key, to = %version.key, "switching resource version");
        control.generation += 1;
        control.version = version;
        self.inner.publish(&mut control, ResourcePhase::Booting);
        self.spawn_boot(&mut control);
        Ok(())
    }

    /// Stop everything and release the engine. Terminal.
    pub fn shutdown(&self) {
        let mut control = resilient_lock(&self.inner.control);
        if matches!(*self.inner.phase_tx.borrow(), ResourcePhase::ShutDown) {
            return;
        }
        if let Some(task) = control.boot.take() {
            task.abort();
        }
        control.generation += 1;
        self.inner.publish(&mut control, ResourcePhase::ShutDown);
    }

    /// Current phase.
    pub fn phase(&self) -> ResourcePhase {
        self.inner.phase_tx.borrow().clone()
    }

    /// Currently selected version.
    pub fn version(&self) -> ResourceVersion {
        self.inner.current_version()
    }

    /// Watch the current phase.
    pub fn subscribe(&self) -> watch::Receiver<ResourcePhase> {
        self.inner.phase_tx.subscribe()
    }

    /// Ordered stream of every phase change.
    pub fn events(&self) -> broadcast::Receiver<PhaseEvent> {
        self.inner.events_tx.subscribe()
    }

    /// Directory holding the expanded files of the current version.
    pub fn resource_dir(&self) -> PathBuf {
        self.inner.store.resource_dir(&self.version())
    }

    /// Wait until the manager reaches `Ready`, an error phase or `ShutDown`.
    pub async fn wait_settled(&self) -> ResourcePhase {
        let mut rx = self.subscribe();
        let settled = rx
            .wait_for(|phase| {
                phase.is_ready() || phase.is_error() || matches!(phase, ResourcePhase::ShutDown)
            })
            .await;
        match settled {
            Ok(phase) => phase.clone(),
            Err(_) => self.phase(),
        }
    }

    fn spawn_boot(&self, control: &mut Control) {
        let generation = control.generation;
        let inner = Arc::clone(&self.inner);
        control.last_progress = 0.0;
        control.boot = Some(tokio::spawn(async move {
            inner.boot(generation).await;
        }));
    }
}

impl Inner {
    fn current_version(&self) -> ResourceVersion {
        resilient_lock(&self.control).version.clone()
    }

    /// The single authority for phase transitions.
    ///
    /// Returns false when `generation` is stale or the manager has shut down,
    /// in which case nothing is published.
    fn set_phase(&self, generation: u64, phase: ResourcePhase) -> bool {
        let mut control = resilient_lock(&self.control);
        if control.generation != generation {
            debug!(
                generation,
                current = control.generation,
                phase = phase.label(),
                "dropping phase from superseded boot"
            );
            return false;
        }
        if matches!(*self.phase_tx.borrow(), ResourcePhase::ShutDown) {
            return false;
        }
        self.publish(&mut control, phase);
        true
    }

    fn publish(&self, control: &mut Control, phase: ResourcePhase) {
        control.seq += 1;
        match &phase {
            ResourcePhase::Downloading { progress } => {
                control.last_progress = *progress;
                debug!(version = %control.version.key, progress, "download progress");
            }
            ResourcePhase::DownloadError { cause } | ResourcePhase::InitializingError { cause } => {
                warn!(version = %control.version.key, phase = phase.label(), "{}", cause);
            }
            other => info!(version = %control.version.key, phase = other.label(), "resource phase"),
        }

        // The previous phase (and any engine handle it carried) is dropped
        // before observers hear about the new one.
        let previous = self.phase_tx.send_replace(phase.clone());
        drop(previous);

        let _ = self.events_tx.send(PhaseEvent {
            seq: control.seq,
            version_key: control.version.key.clone(),
            phase,
        });
    }

    fn report_download(&self, generation: u64, written: u64, expected: Option<u64>) {
        let Some(total) = expected.filter(|t| *t > 0) else {
            return;
        };
        let fraction = (written as f64 / total as f64).clamp(0.0, 1.0);
        let last = resilient_lock(&self.control).last_progress;
        if fraction - last >= PROGRESS_STEP || (fraction >= 1.0 && last < 1.0) {
            self.set_phase(generation, ResourcePhase::Downloading { progress: fraction });
        }
    }

    async fn boot(self: Arc<Self>, generation: u64) {
        let version = self.current_version();

        if self.store.is_ready(&version) {
            info!(version = %version.key, "readiness marker present, skipping download");
            self.initialize(generation).await;
            return;
        }

        let archive = self.store.archive_path(&version);
        let stale_dir = self.store.resource_dir(&version);
        for stale in [&archive, &stale_dir] {
            if let Err(e) = self.store.remove(stale) {
                warn!(path = %stale.display(), "could not clear stale resource files: {}", e);
            }
        }

        if !self.set_phase(generation, ResourcePhase::Downloading { progress: 0.0 }) {
            return;
        }

        let url = self.config.archive_url(&version);
        info!(%url, "downloading resource archive");
        let progress = |written: u64, expected: Option<u64>| {
            self.report_download(generation, written, expected);
        };
        if let Err(e) = self.transport.download(&url, &archive, &progress).await {
            self.set_phase(generation, ResourcePhase::DownloadError { cause: e.to_string() });
            return;
        }

        if let Some(expected) = &version.sha256 {
            if let Err(e) = verify_sha256(&archive, expected).await {
                if let Err(rm) = self.store.remove(&archive) {
                    warn!(path = %archive.display(), "could not remove bad archive: {}", rm);
                }
                self.set_phase(generation, ResourcePhase::DownloadError { cause: e.to_string() });
                return;
            }
        }

        // The selection may have moved to another version sharing this archive.
        let version = self.current_version();
        if !self.set_phase(generation, ResourcePhase::Expanding) {
            return;
        }
        if let Err(e) = self.expand(&version).await {
            self.set_phase(generation, ResourcePhase::DownloadError { cause: e.to_string() });
            return;
        }

        self.initialize(generation).await;
    }

    async fn expand(&self, version: &ResourceVersion) -> Result<(), ExpansionError> {
        let archive = self.store.archive_path(version);
        let dir = self.store.resource_dir(version);

        self.store
            .remove(&dir)
            .map_err(|e| ExpansionError::filesystem(&dir, e))?;
        self.transport.expand(&archive, &dir).await?;
        self.store
            .remove(&archive)
            .map_err(|e| ExpansionError::filesystem(&archive, e))?;

        let marker = self.store.marker_path(version);
        self.store
            .create_marker(&marker)
            .map_err(|e| ExpansionError::filesystem(&marker, e))?;
        Ok(())
    }

    async fn initialize(&self, generation: u64) {
        if !self.set_phase(generation, ResourcePhase::Initializing) {
            return;
        }

        let version = self.current_version();
        let dir = self.store.resource_dir(&version);
        let attempts = self.config.init_attempts.max(1);

        let mut engine = None;
        let mut last_error = String::new();
        for attempt in 1..=attempts {
            let factory = Arc::clone(&self.factory);
            let (dir, version) = (dir.clone(), version.clone());
            match tokio::task::spawn_blocking(move || factory.build(&dir, &version)).await {
                Ok(Ok(built)) => {
                    engine = Some(built);
                    break;
                }
                Ok(Err(e)) => last_error = format!("{:#}", e),
                Err(e) => last_error = format!("engine construction panicked: {}", e),
            }
            warn!(attempt, attempts, "engine construction failed: {}", last_error);
            if attempt < attempts {
                tokio::time::sleep(self.config.init_retry_delay).await;
            }
        }

        let Some(engine) = engine else {
            let err = EngineInitError {
                attempts,
                message: last_error,
            };
            self.set_phase(generation, ResourcePhase::InitializingError { cause: err.to_string() });
            return;
        };

        let handle = EngineHandle::new(engine);
        let warm = handle.clone();
        let warmed = match tokio::task::spawn_blocking(move || warm.warm_up()).await {
            Ok(result) => result.map_err(|e| format!("{:#}", e)),
            Err(e) => Err(format!("warm-up panicked: {}", e)),
        };
        if let Err(message) = warmed {
            let err = EngineInitError { attempts, message };
            self.set_phase(generation, ResourcePhase::InitializingError { cause: err.to_string() });
            return;
        }

        self.set_phase(generation, ResourcePhase::Ready { engine: handle });
    }
}
