// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! User configuration stored at `~/.genstudio/config.json`.
//!
//! Every field is optional on disk; missing values fall back to defaults
//! rooted in the genstudio home directory. `GENSTUDIO_HOME` overrides that
//! directory, which is how tests and portable installs point elsewhere.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::resource::{ResourceConfig, ResourceVersion};

/// Environment variable that replaces `~/.genstudio`.
pub const HOME_ENV: &str = "GENSTUDIO_HOME";

/// Model used when the config names none.
pub const DEFAULT_MODEL: &str = "sd-2-1-base";

/// Where archives are fetched from when the config names no base URL.
pub const DEFAULT_BASE_URL: &str = "https://models.genstudio.app/archives";

/// Generator program used when the config names none.
pub const DEFAULT_ENGINE_PROGRAM: &str = "genstudio-engine";

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Config {
    /// Resource version key from the catalog.
    pub model: Option<String>,
    pub base_url: Option<String>,
    /// Root holding one directory per resource version.
    pub documents_root: Option<PathBuf>,
    /// Directory rendered images are written to.
    pub output_dir: Option<PathBuf>,
    /// Persisted job queue document.
    pub state_file: Option<PathBuf>,
    pub engine_program: Option<String>,
    #[serde(default)]
    pub engine_args: Vec<String>,
    /// Engine construction attempts (default: 3)
    #[serde(default = "default_init_attempts")]
    pub init_attempts: u32,
    /// Delay between construction attempts in milliseconds (default: 1000)
    #[serde(default = "default_init_retry_delay_ms")]
    pub init_retry_delay_ms: u64,
}

fn default_init_attempts() -> u32 {
    ResourceConfig::DEFAULT_INIT_ATTEMPTS
}

fn default_init_retry_delay_ms() -> u64 {
    ResourceConfig::DEFAULT_INIT_RETRY_DELAY.as_millis() as u64
}

impl Config {
    /// Defaults with the construction budget filled in, as a fresh file would
    /// deserialize.
    pub fn new() -> Self {
        Self {
            init_attempts: default_init_attempts(),
            init_retry_delay_ms: default_init_retry_delay_ms(),
            ..Self::default()
        }
    }

    pub fn model_key(&self) -> &str {
        self.model.as_deref().unwrap_or(DEFAULT_MODEL)
    }

    /// The selected catalog entry.
    pub fn resource_version(&self) -> Result<ResourceVersion> {
        let key = self.model_key();
        ResourceVersion::find(key).with_context(|| {
            let known: Vec<String> = ResourceVersion::catalog().into_iter().map(|v| v.key).collect();
            format!("Unknown model '{}'. Available: {}", key, known.join(", "))
        })
    }

    pub fn resource_config(&self) -> ResourceConfig {
        let mut config =
            ResourceConfig::new(self.base_url.as_deref().unwrap_or(DEFAULT_BASE_URL));
        config.init_attempts = self.init_attempts.max(1);
        config.init_retry_delay = Duration::from_millis(self.init_retry_delay_ms);
        config
    }

    pub fn documents_root(&self, home: &Path) -> PathBuf {
        self.documents_root
            .clone()
            .unwrap_or_else(|| home.join("models"))
    }

    pub fn output_dir(&self, home: &Path) -> PathBuf {
        self.output_dir
            .clone()
            .unwrap_or_else(|| home.join("output"))
    }

    pub fn state_file(&self, home: &Path) -> PathBuf {
        self.state_file
            .clone()
            .unwrap_or_else(|| home.join("jobs.json"))
    }

    pub fn engine_program(&self) -> &str {
        self.engine_program
            .as_deref()
            .unwrap_or(DEFAULT_ENGINE_PROGRAM)
    }
}

/// The genstudio home directory, created if missing.
pub fn get_config_dir() -> Result<PathBuf> {
    let config_dir = match std::env::var_os(HOME_ENV) {
        Some(dir) if !dir.is_empty() => PathBuf::from(dir),
        _ => dirs::home_dir()
            .context("Could not find home directory")?
            .join(".genstudio"),
    };
    if !config_dir.exists() {
        fs::create_dir_all(&config_dir)
            .with_context(|| format!("Failed to create {}", config_dir.display()))?;
    }
    Ok(config_dir)
}

pub fn load_config() -> Result<Config> {
    load_config_from(&get_config_dir()?.join("config.json"))
}

pub fn save_config(config: &Config) -> Result<()> {
    save_config_to(config, &get_config_dir()?.join("config.json"))
}

/// Read a config file; a missing file yields defaults.
pub fn load_config_from(path: &Path) -> Result<Config> {
    if !path.exists() {
        return Ok(Config::new());
    }
    let content = fs::read_to_string(path)
        .with_context(|| format!("Failed to read {}", path.display()))?;
    serde_json::from_str(&content).with_context(|| format!("Invalid config: {}", path.display()))
}

pub fn save_config_to(config: &Config, path: &Path) -> Result<()> {
    let content = serde_json::to_string_pretty(config)?;
    fs::write(path, content).with_context(|| format!("Failed to write {}", path.display()))?;
    Ok(())
}
