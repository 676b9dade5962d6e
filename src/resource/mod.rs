// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Model resource acquisition for genstudio
//!
//! This module takes a model version from "not on disk" to "engine warmed up
//! and ready to render":
//! - Download of the archive with byte-level progress
//! - Optional SHA-256 verification
//! - Expansion into the storage directory and a revision-tagged marker
//! - Engine construction with a bounded retry budget, then warm-up
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────┐     ┌─────────────────┐
//! │ ResourceManager │────▶│ Boot task       │
//! │ (phase owner)   │     │ (tokio)         │
//! └────────┬────────┘     └────────┬────────┘
//!          │                       │
//!          ▼                       ▼
//! ┌─────────────────┐     ┌─────────────────┐
//! │ ResourceStore   │     │ AssetTransport  │
//! │ (filesystem)    │     │ (http + unzip)  │
//! └─────────────────┘     └─────────────────┘
//! ```
//!
//! Observers read the current [`ResourcePhase`] through a watch channel or
//! follow every transition through [`PhaseEvent`]s.

pub mod manager;
pub mod store;
pub mod transport;
pub mod types;

pub use manager::{ResourceConfig, ResourceManager};
pub use store::{FsResourceStore, ResourceStore};
pub use transport::{AssetTransport, HttpTransport};
pub use types::{PhaseEvent, ResourcePhase, ResourceVersion};
