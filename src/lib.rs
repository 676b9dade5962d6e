// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! genstudio - Local image generation core
//!
//! Fetch the model once, then render a durable queue of jobs against it.
//!
//! **Download** -> **Verify** -> **Expand** -> **Initialize** -> **Warm up** -> **Render**
//!
//! # Core Modules
//!
//! - [`resource`] - Model acquisition state machine and its collaborators
//! - [`jobs`] - Entries, the persisted job store and the dispatching queue
//! - [`engine`] - Compute engine boundary and the external-program engine
//! - [`context`] - The per-process [`Studio`] tying both together
//! - [`config`] - User configuration
//! - [`error`] - Error taxonomy and user-facing error formatting

pub mod config;
pub mod context;
pub mod engine;
pub mod error;
pub mod jobs;
pub mod locks;
pub mod resource;

pub use context::{Studio, StudioParts};

pub use engine::{
    ComputeEngine, EngineFactory, EngineHandle, JobOutput, JobRequest, StepControl, StepProgress,
};

pub use error::{
    EngineInitError, ErrorBuilder, ExpansionError, JobFailure, LifecycleError, MalformedSnapshot,
    QueueError, TransportError,
};

pub use jobs::{
    ActiveJob, Entry, EntryParams, EntryState, JobQueue, JobStore, JsonFileGateway,
    MemoryGateway, PersistedSnapshot, PersistenceGateway, QueueEvent, QueueToken,
};

pub use resource::{
    AssetTransport, FsResourceStore, HttpTransport, PhaseEvent, ResourceConfig, ResourceManager,
    ResourcePhase, ResourceStore, ResourceVersion,
};
