// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Error taxonomy for genstudio, plus user-facing error formatting.
//!
//! Resource-level failures ([`TransportError`], [`ExpansionError`],
//! [`EngineInitError`]) never escape as `Err` from the lifecycle manager; they
//! become `DownloadError` / `InitializingError` phases with a retry
//! affordance. Job-level failures ([`JobFailure`]) are scoped to a single
//! entry and end up as its `Error`, `Blocked` or `Cancelled` state.

use std::fmt;
use std::path::PathBuf;

use thiserror::Error;
use uuid::Uuid;

/// Network or transport failure while fetching a resource archive.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum TransportError {
    /// The request could not be sent or the body stream broke off.
    #[error("network error: {0}")]
    Network(String),
    /// The server answered with a non-success status.
    #[error("download failed: HTTP {status} for {url}")]
    Status { status: u16, url: String },
    /// The archive could not be written to disk.
    #[error("could not write archive {path}: {message}")]
    Io { path: PathBuf, message: String },
    /// The downloaded archive does not match the expected digest.
    #[error("checksum mismatch for {archive}: expected {expected}, got {actual}")]
    ChecksumMismatch {
        archive: String,
        expected: String,
        actual: String,
    },
}

/// Archive corrupt or filesystem failure while expanding a resource.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum ExpansionError {
    /// The archive tool rejected the archive.
    #[error("could not expand {archive}: {message}")]
    Corrupt { archive: PathBuf, message: String },
    /// A filesystem step around expansion failed.
    #[error("filesystem error at {path}: {message}")]
    Filesystem { path: PathBuf, message: String },
}

impl ExpansionError {
    pub(crate) fn filesystem(path: impl Into<PathBuf>, err: impl fmt::Display) -> Self {
        Self::Filesystem {
            path: path.into(),
            message: err.to_string(),
        }
    }
}

/// Native engine construction failed.
#[derive(Debug, Clone, Error, PartialEq)]
#[error("engine initialization failed after {attempts} attempt(s): {message}")]
pub struct EngineInitError {
    /// Number of construction attempts made.
    pub attempts: u32,
    /// Last failure message.
    pub message: String,
}

/// Why a single job did not produce an artifact.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum JobFailure {
    /// Inference failed.
    #[error("job failed: {0}")]
    Failed(String),
    /// A safety gate rejected the output.
    #[error("output rejected by safety check: {0}")]
    Rejected(String),
    /// The engine stopped because a progress callback answered abort.
    #[error("job aborted")]
    Aborted,
}

/// Invalid request against the resource lifecycle.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum LifecycleError {
    /// Retry was requested outside an error phase.
    #[error("retry is only valid from an error phase (current phase: {0})")]
    NotRetryable(String),
    /// The manager has been shut down.
    #[error("resource manager is shut down")]
    ShutDown,
}

/// Invalid request against the job queue.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum QueueError {
    /// No entry with this id exists.
    #[error("no entry with id {0}")]
    UnknownEntry(Uuid),
    /// The entry is a prototype and cannot be queued itself.
    #[error("entry {0} is a prototype and cannot be queued")]
    NotQueueable(Uuid),
    /// The entry is rendering and cannot be edited.
    #[error("entry {0} is rendering and cannot be edited")]
    Busy(Uuid),
    /// The operation needs a finished entry.
    #[error("entry {0} has not finished rendering")]
    NotFinished(Uuid),
    /// The entry has already rendered; its seed and parameters are fixed.
    #[error("entry {0} has already rendered and cannot be edited")]
    Rendered(Uuid),
    /// A short id matched more than one entry.
    #[error("id prefix '{0}' matches more than one entry")]
    AmbiguousId(String),
    /// A short id matched no entry.
    #[error("no entry id starts with '{0}'")]
    UnknownPrefix(String),
}

/// A persisted job state document that exists but cannot be parsed.
#[derive(Debug, Clone, Error, PartialEq)]
#[error("job state {} is malformed: {message}", path.display())]
pub struct MalformedSnapshot {
    pub path: PathBuf,
    pub message: String,
}

/// Builder for constructing formatted, actionable error messages.
///
/// # Example
///
/// ```
/// use genstudio::error::ErrorBuilder;
///
/// let message = ErrorBuilder::new("Model download failed")
///     .cause("No network connection")
///     .fix("Retry: genstudio fetch")
///     .build();
/// assert!(message.contains("Model download failed"));
/// ```
#[derive(Debug, Clone)]
pub struct ErrorBuilder {
    title: String,
    causes: Vec<String>,
    fixes: Vec<String>,
}

impl ErrorBuilder {
    /// Create a new error builder with the given title.
    pub fn new(title: impl Into<String>) -> Self {
        Self {
            title: title.into(),
            causes: Vec::new(),
            fixes: Vec::new(),
        }
    }

    /// Add a possible cause.
    pub fn cause(mut self, cause: impl Into<String>) -> Self {
        self.causes.push(cause.into());
        self
    }

    /// Add a suggested fix.
    pub fn fix(mut self, fix: impl Into<String>) -> Self {
        self.fixes.push(fix.into());
        self
    }

    /// Build the formatted error message.
    pub fn build(&self) -> String {
        let mut output = format!("[✗] {}\n", self.title);

        if !self.causes.is_empty() {
            output.push_str("\nPossible causes:\n");
            for cause in &self.causes {
                output.push_str(&format!("  - {}\n", cause));
            }
        }

        if !self.fixes.is_empty() {
            output.push_str("\nTry these fixes:\n");
            for (i, fix) in self.fixes.iter().enumerate() {
                output.push_str(&format!("  {}. {}\n", i + 1, fix));
            }
        }

        output
    }
}

impl fmt::Display for ErrorBuilder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.build())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_builder_sections() {
        let message = ErrorBuilder::new("Engine failed to start")
            .cause("Model files incomplete")
            .fix("Delete the model directory")
            .fix("Run genstudio fetch")
            .build();

        assert!(message.starts_with("[✗] Engine failed to start"));
        assert!(message.contains("  - Model files incomplete"));
        assert!(message.contains("  1. Delete the model directory"));
        assert!(message.contains("  2. Run genstudio fetch"));
    }

    #[test]
    fn test_error_builder_without_causes() {
        let message = ErrorBuilder::new("Nothing to do").build();
        assert!(!message.contains("Possible causes:"));
        assert!(!message.contains("Try these fixes:"));
    }

    #[test]
    fn test_transport_error_display() {
        let err = TransportError::Status {
            status: 404,
            url: "https://example.invalid/a.zip".into(),
        };
        assert_eq!(
            err.to_string(),
            "download failed: HTTP 404 for https://example.invalid/a.zip"
        );
    }

    #[test]
    fn test_engine_init_error_display() {
        let err = EngineInitError {
            attempts: 3,
            message: "out of memory".into(),
        };
        assert!(err.to_string().contains("3 attempt(s)"));
    }
}
