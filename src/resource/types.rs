// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Resource versions and lifecycle phases.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::engine::EngineHandle;

/// A selectable model variant.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceVersion {
    /// Stable key, also the storage directory name.
    pub key: String,
    /// Human readable name.
    pub display_name: String,
    /// On-disk revision. Bumping it invalidates existing readiness markers.
    pub revision: u32,
    /// Native output image size in pixels (square).
    pub image_size: u32,
    /// Optional platform variant appended to the archive name.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub variant: Option<String>,
    /// Expected SHA-256 of the archive, lowercase hex.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sha256: Option<String>,
}

impl ResourceVersion {
    pub fn new(key: impl Into<String>, revision: u32, image_size: u32) -> Self {
        let key = key.into();
        Self {
            display_name: key.clone(),
            key,
            revision,
            image_size,
            variant: None,
            sha256: None,
        }
    }

    pub fn with_display_name(mut self, name: impl Into<String>) -> Self {
        self.display_name = name.into();
        self
    }

    pub fn with_variant(mut self, variant: impl Into<String>) -> Self {
        self.variant = Some(variant.into());
        self
    }

    pub fn with_sha256(mut self, digest: impl Into<String>) -> Self {
        self.sha256 = Some(digest.into().to_ascii_lowercase());
        self
    }

    /// Archive file name: `{key}.{revision}.zip`, or `{key}-{variant}.{revision}.zip`.
    pub fn archive_name(&self) -> String {
        match &self.variant {
            Some(variant) => format!("{}-{}.{}.zip", self.key, variant, self.revision),
            None => format!("{}.{}.zip", self.key, self.revision),
        }
    }

    /// Readiness marker file name: `ready.{revision}`.
    pub fn marker_name(&self) -> String {
        format!("ready.{}", self.revision)
    }

    /// Built-in model catalog.
    pub fn catalog() -> Vec<ResourceVersion> {
        vec![
            ResourceVersion::new("sd-1-5", 3, 512).with_display_name("Stable Diffusion 1.5"),
            ResourceVersion::new("sd-2-1-base", 3, 512)
                .with_display_name("Stable Diffusion 2.1 Base"),
            ResourceVersion::new("sd-2-1", 3, 768).with_display_name("Stable Diffusion 2.1"),
        ]
    }

    /// Look up a catalog entry by key.
    pub fn find(key: &str) -> Option<ResourceVersion> {
        Self::catalog().into_iter().find(|v| v.key == key)
    }
}

/// Current phase of the resource lifecycle.
#[derive(Debug, Clone, PartialEq)]
pub enum ResourcePhase {
    Booting,
    Downloading { progress: f64 },
    DownloadError { cause: String },
    Expanding,
    Initializing,
    InitializingError { cause: String },
    Ready { engine: EngineHandle },
    ShutDown,
}

impl ResourcePhase {
    pub fn is_ready(&self) -> bool {
        matches!(self, ResourcePhase::Ready { .. })
    }

    /// Error phases offer a retry.
    pub fn is_error(&self) -> bool {
        matches!(
            self,
            ResourcePhase::DownloadError { .. } | ResourcePhase::InitializingError { .. }
        )
    }

    /// The live engine, if ready.
    pub fn engine(&self) -> Option<EngineHandle> {
        match self {
            ResourcePhase::Ready { engine } => Some(engine.clone()),
            _ => None,
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            ResourcePhase::Booting => "booting",
            ResourcePhase::Downloading { .. } => "downloading",
            ResourcePhase::DownloadError { .. } => "download-error",
            ResourcePhase::Expanding => "expanding",
            ResourcePhase::Initializing => "initializing",
            ResourcePhase::InitializingError { .. } => "initializing-error",
            ResourcePhase::Ready { .. } => "ready",
            ResourcePhase::ShutDown => "shut-down",
        }
    }
}

impl fmt::Display for ResourcePhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ResourcePhase::Downloading { progress } => {
                write!(f, "downloading ({:.1}%)", progress * 100.0)
            }
            ResourcePhase::DownloadError { cause } => write!(f, "download error: {}", cause),
            ResourcePhase::InitializingError { cause } => {
                write!(f, "initialization error: {}", cause)
            }
            other => f.write_str(other.label()),
        }
    }
}

/// One entry of the totally ordered phase history.
#[derive(Debug, Clone)]
pub struct PhaseEvent {
    /// Monotonic sequence number, process wide.
    pub seq: u64,
    /// Version the phase belongs to.
    pub version_key: String,
    pub phase: ResourcePhase,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_archive_and_marker_names() {
        let version = ResourceVersion::new("sd-2-1", 4, 768);
        assert_eq!(version.archive_name(), "sd-2-1.4.zip");
        assert_eq!(version.marker_name(), "ready.4");

        let split = version.with_variant("split-einsum");
        assert_eq!(split.archive_name(), "sd-2-1-split-einsum.4.zip");
    }

    #[test]
    fn test_catalog_lookup() {
        let found = ResourceVersion::find("sd-2-1-base");
        assert!(found.is_some());
        assert_eq!(found.map(|v| v.image_size), Some(512));
        assert!(ResourceVersion::find("nope").is_none());
    }

    #[test]
    fn test_phase_flags() {
        assert!(ResourcePhase::DownloadError { cause: "x".into() }.is_error());
        assert!(!ResourcePhase::Expanding.is_error());
        assert!(ResourcePhase::Booting.engine().is_none());
        assert_eq!(
            ResourcePhase::Downloading { progress: 0.25 }.to_string(),
            "downloading (25.0%)"
        );
    }
}
