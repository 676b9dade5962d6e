// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Archive transport: download with byte progress, then expand.
//!
//! Cancellation is cooperative through future drop: the lifecycle manager
//! aborts the boot task, which drops the in-flight download at its next await.

use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::StreamExt;
use sha2::{Digest, Sha256};
use tokio::io::AsyncWriteExt;

use crate::error::{ExpansionError, TransportError};

/// Byte-level download progress: `(bytes_written, bytes_expected)`.
pub type ProgressFn<'a> = &'a (dyn Fn(u64, Option<u64>) + Send + Sync);

/// Downloads and expands resource archives.
#[async_trait]
pub trait AssetTransport: Send + Sync {
    /// Download `url` into `dest`, reporting progress as bytes arrive.
    async fn download(
        &self,
        url: &str,
        dest: &Path,
        progress: ProgressFn<'_>,
    ) -> Result<(), TransportError>;

    /// Expand `archive` into the directory `into`.
    async fn expand(&self, archive: &Path, into: &Path) -> Result<(), ExpansionError>;
}

/// Default connect timeout. Transfers themselves are not time-limited.
const CONNECT_TIMEOUT_SECS: u64 = 30;

/// HTTP download via reqwest, expansion via the system `unzip` tool.
#[derive(Debug, Clone)]
pub struct HttpTransport {
    client: reqwest::Client,
    unzip_program: String,
}

impl HttpTransport {
    pub fn new() -> Self {
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(CONNECT_TIMEOUT_SECS))
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());
        Self {
            client,
            unzip_program: "unzip".to_string(),
        }
    }

    /// Use a different archive tool (must accept `-q -o <archive> -d <dir>`).
    pub fn with_unzip_program(mut self, program: impl Into<String>) -> Self {
        self.unzip_program = program.into();
        self
    }
}

impl Default for HttpTransport {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl AssetTransport for HttpTransport {
    async fn download(
        &self,
        url: &str,
        dest: &Path,
        progress: ProgressFn<'_>,
    ) -> Result<(), TransportError> {
        let io_err = |e: std::io::Error| TransportError::Io {
            path: dest.to_path_buf(),
            message: e.to_string(),
        };

        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| TransportError::Network(e.to_string()))?;

        if !response.status().is_success() {
            return Err(TransportError::Status {
                status: response.status().as_u16(),
                url: url.to_string(),
            });
        }

        let expected = response.content_length();
        if let Some(parent) = dest.parent() {
            tokio::fs::create_dir_all(parent).await.map_err(io_err)?;
        }
        let mut file = tokio::fs::File::create(dest).await.map_err(io_err)?;

        let mut written = 0u64;
        progress(written, expected);

        let mut stream = response.bytes_stream();
        while let Some(chunk) = stream.next().await {
            let chunk = chunk.map_err(|e| TransportError::Network(e.to_string()))?;
            file.write_all(&chunk).await.map_err(io_err)?;
            written += chunk.len() as u64;
            progress(written, expected);
        }

        file.flush().await.map_err(io_err)?;
        file.sync_all().await.map_err(io_err)?;
        Ok(())
    }

    async fn expand(&self, archive: &Path, into: &Path) -> Result<(), ExpansionError> {
        tokio::fs::create_dir_all(into)
            .await
            .map_err(|e| ExpansionError::filesystem(into, e))?;

        let output = tokio::process::Command::new(&self.unzip_program)
            .arg("-q")
            .arg("-o")
            .arg(archive)
            .arg("-d")
            .arg(into)
            .output()
            .await
            .map_err(|e| ExpansionError::Corrupt {
                archive: archive.to_path_buf(),
                message: format!("could not run {}: {}", self.unzip_program, e),
            })?;

        if !output.status.success() {
            return Err(ExpansionError::Corrupt {
                archive: archive.to_path_buf(),
                message: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }
        Ok(())
    }
}

/// Verify `archive` against an expected lowercase-hex SHA-256 digest.
pub async fn verify_sha256(archive: &Path, expected: &str) -> Result<(), TransportError> {
    let path = archive.to_path_buf();
    let digest = tokio::task::spawn_blocking(move || -> std::io::Result<String> {
        let mut file = std::fs::File::open(&path)?;
        let mut hasher = Sha256::new();
        std::io::copy(&mut file, &mut hasher)?;
        Ok(hex::encode(hasher.finalize()))
    })
    .await
    .map_err(|e| TransportError::Io {
        path: archive.to_path_buf(),
        message: format!("hashing task failed: {}", e),
    })?
    .map_err(|e| TransportError::Io {
        path: archive.to_path_buf(),
        message: e.to_string(),
    })?;

    if !digest.eq_ignore_ascii_case(expected) {
        return Err(TransportError::ChecksumMismatch {
            archive: archive.display().to_string(),
            expected: expected.to_string(),
            actual: digest,
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_verify_sha256() {
        let temp_dir = TempDir::new().expect("Failed to create temp dir");
        let archive = temp_dir.path().join("a.zip");
        std::fs::write(&archive, b"abc").expect("write");

        // sha256("abc")
        let good = "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad";
        assert!(verify_sha256(&archive, good).await.is_ok());

        let bad = verify_sha256(&archive, "00").await;
        assert!(matches!(bad, Err(TransportError::ChecksumMismatch { .. })));
    }

    #[tokio::test]
    async fn test_expand_with_missing_tool() {
        let temp_dir = TempDir::new().expect("Failed to create temp dir");
        let transport = HttpTransport::new().with_unzip_program("genstudio-no-such-unzip");
        let result = transport
            .expand(&temp_dir.path().join("a.zip"), &temp_dir.path().join("out"))
            .await;
        assert!(matches!(result, Err(ExpansionError::Corrupt { .. })));
    }
}
