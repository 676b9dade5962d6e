// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Compute engine boundary.
//!
//! The image synthesis itself lives outside this crate. An [`EngineFactory`]
//! turns a ready resource directory into a [`ComputeEngine`]; the engine runs
//! one job at a time and reports every inference step through a callback that
//! answers [`StepControl::Continue`] or [`StepControl::Abort`]. The callback
//! is a blocking round-trip: the engine must not start the next step before it
//! has the answer.

pub mod command;

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use uuid::Uuid;

use crate::error::JobFailure;
use crate::locks::resilient_lock;
use crate::resource::ResourceVersion;

pub use command::{CommandEngine, CommandEngineFactory};

/// Everything the engine needs to render one entry.
#[derive(Debug, Clone, PartialEq)]
pub struct JobRequest {
    pub id: Uuid,
    pub prompt: String,
    pub negative_prompt: String,
    pub seed: u32,
    pub steps: u32,
    pub guidance: f32,
    pub source_image: Option<PathBuf>,
    pub strength: f32,
}

/// Progress of the job currently inside the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StepProgress {
    /// Steps completed so far.
    pub step: u32,
    /// Total number of steps for this job.
    pub total: u32,
}

/// Answer to a per-step progress callback.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepControl {
    Continue,
    Abort,
}

/// Encoded artifact produced by a finished job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobOutput {
    pub bytes: Vec<u8>,
}

/// An initialized inference engine bound to one resource directory.
pub trait ComputeEngine: Send + Sync {
    /// One-time warm-up, called before the engine is published as ready.
    fn warm_up(&self) -> anyhow::Result<()>;

    /// Run a job to completion.
    ///
    /// `on_step` is called after every inference step. When it returns
    /// [`StepControl::Abort`] the engine stops and returns
    /// [`JobFailure::Aborted`].
    fn run(
        &self,
        request: &JobRequest,
        on_step: &mut dyn FnMut(StepProgress) -> StepControl,
    ) -> Result<JobOutput, JobFailure>;
}

/// Constructs engines from a ready resource directory.
pub trait EngineFactory: Send + Sync {
    fn build(
        &self,
        resource_dir: &Path,
        version: &ResourceVersion,
    ) -> anyhow::Result<Arc<dyn ComputeEngine>>;
}

/// The live engine carried by the `Ready` phase.
///
/// Cloning the handle shares the engine. Runs are serialized through an
/// internal gate so that at most one job is ever inside the engine.
#[derive(Clone)]
pub struct EngineHandle {
    engine: Arc<dyn ComputeEngine>,
    gate: Arc<Mutex<()>>,
}

impl EngineHandle {
    pub fn new(engine: Arc<dyn ComputeEngine>) -> Self {
        Self {
            engine,
            gate: Arc::new(Mutex::new(())),
        }
    }

    pub fn warm_up(&self) -> anyhow::Result<()> {
        let _gate = resilient_lock(&self.gate);
        self.engine.warm_up()
    }

    pub fn run(
        &self,
        request: &JobRequest,
        on_step: &mut dyn FnMut(StepProgress) -> StepControl,
    ) -> Result<JobOutput, JobFailure> {
        let _gate = resilient_lock(&self.gate);
        self.engine.run(request, on_step)
    }

    /// True when both handles wrap the same engine instance.
    pub fn same_engine(&self, other: &EngineHandle) -> bool {
        Arc::ptr_eq(&self.engine, &other.engine)
    }
}

impl fmt::Debug for EngineHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "EngineHandle({:p})", Arc::as_ptr(&self.engine))
    }
}

impl PartialEq for EngineHandle {
    fn eq(&self, other: &Self) -> bool {
        self.same_engine(other)
    }
}
