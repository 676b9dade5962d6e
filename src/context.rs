// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Process-wide context tying the resource manager to the job queue.
//!
//! Construct one [`Studio`] per process and pass it to whatever drives the
//! process (the CLI, a UI layer or a test harness).

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::config::Config;
use crate::engine::{CommandEngineFactory, EngineFactory};
use crate::jobs::{JobQueue, JsonFileGateway, PersistenceGateway};
use crate::resource::{
    AssetTransport, FsResourceStore, HttpTransport, ResourceConfig, ResourceManager,
    ResourceStore, ResourceVersion,
};

/// Collaborators a [`Studio`] is assembled from.
pub struct StudioParts {
    pub version: ResourceVersion,
    pub resource_config: ResourceConfig,
    pub store: Arc<dyn ResourceStore>,
    pub transport: Arc<dyn AssetTransport>,
    pub factory: Arc<dyn EngineFactory>,
    pub gateway: Arc<dyn PersistenceGateway>,
    pub output_dir: PathBuf,
}

impl StudioParts {
    /// Production collaborators described by the user config.
    pub fn from_config(config: &Config, home: &std::path::Path) -> Result<Self> {
        let version = config.resource_version()?;
        let output_dir = config.output_dir(home);
        std::fs::create_dir_all(&output_dir)
            .with_context(|| format!("Failed to create {}", output_dir.display()))?;

        Ok(Self {
            version,
            resource_config: config.resource_config(),
            store: Arc::new(FsResourceStore::new(config.documents_root(home))),
            transport: Arc::new(HttpTransport::new()),
            factory: Arc::new(CommandEngineFactory::new(
                config.engine_program(),
                config.engine_args.clone(),
            )),
            gateway: Arc::new(JsonFileGateway::new(config.state_file(home))),
            output_dir,
        })
    }
}

/// The resource manager and job queue of one process.
pub struct Studio {
    resources: ResourceManager,
    queue: JobQueue,
    dispatcher: Option<JoinHandle<()>>,
}

impl Studio {
    /// Load the queue without starting acquisition or dispatch.
    pub fn new(parts: StudioParts) -> Result<Self> {
        let resources = ResourceManager::new(
            parts.version,
            parts.store,
            parts.transport,
            parts.factory,
            parts.resource_config,
        );
        let queue = JobQueue::open(parts.gateway, parts.output_dir)?;
        Ok(Self {
            resources,
            queue,
            dispatcher: None,
        })
    }

    /// Build and immediately start: acquisition begins and the dispatcher
    /// waits for the resource. Must be called inside a Tokio runtime.
    pub fn start(parts: StudioParts) -> Result<Self> {
        let mut studio = Self::new(parts)?;
        studio.start_acquisition();
        studio.start_dispatch();
        Ok(studio)
    }

    pub fn start_acquisition(&self) {
        self.resources.startup();
    }

    /// Spawn the dispatcher if it is not already running.
    pub fn start_dispatch(&mut self) {
        if self.dispatcher.as_ref().is_some_and(|h| !h.is_finished()) {
            return;
        }
        self.dispatcher = Some(self.queue.start_dispatch(self.resources.subscribe()));
    }

    pub fn resources(&self) -> &ResourceManager {
        &self.resources
    }

    pub fn queue(&self) -> &JobQueue {
        &self.queue
    }

    /// Orderly shutdown: stop dispatch (an in-flight job stays queued), wait
    /// for the dispatcher, then release the engine.
    pub async fn shutdown(mut self) {
        info!("shutting down");
        self.queue.stop();
        if let Some(handle) = self.dispatcher.take() {
            if let Err(e) = handle.await {
                warn!("dispatcher task ended abnormally: {}", e);
            }
        }
        self.resources.shutdown();
    }
}
