// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Durable job queue.
//!
//! - [`entry`]: entries, parameters and the state tags they persist as
//! - [`store`]: ordered entries plus the pending queue, and the snapshot
//! - [`persist`]: atomic save/load of the snapshot
//! - [`queue`]: the engine that dispatches one job at a time

pub mod entry;
pub mod persist;
pub mod queue;
pub mod store;

pub use entry::{Entry, EntryParams, EntryState};
pub use persist::{JsonFileGateway, MemoryGateway, PersistenceGateway};
pub use queue::{ActiveJob, JobQueue, QueueEvent, QueueToken};
pub use store::{JobStore, PersistedSnapshot};
