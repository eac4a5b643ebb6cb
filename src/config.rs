//! Engine configuration - worker pool size, custom-code sandbox settings
//!
//! Resolution order:
//! 1. explicit path (CLI `--config`)
//! 2. `$PROMPTLAB_CONFIG`
//! 3. `<config dir>/promptlab/engine.yml` if it exists
//! 4. built-in defaults
//!
//! `PROMPTLAB_MAX_WORKERS` and `PROMPTLAB_CUSTOM_TIMEOUT_SECS` override
//! whatever was loaded.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const CONFIG_ENV: &str = "PROMPTLAB_CONFIG";
pub const MAX_WORKERS_ENV: &str = "PROMPTLAB_MAX_WORKERS";
pub const CUSTOM_TIMEOUT_ENV: &str = "PROMPTLAB_CUSTOM_TIMEOUT_SECS";

const DEFAULT_CUSTOM_TIMEOUT_SECS: u64 = 30;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Upper bound on tasks running at once
    pub max_workers: usize,
    /// Default timeout for custom aggregation code
    pub custom_timeout_secs: u64,
    /// Interpreter for python aggregation code
    pub python_command: String,
    /// Interpreter for javascript aggregation code
    pub node_command: String,
    /// Stop submitting batches after a required task fails
    pub fail_fast: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_workers: default_workers(),
            custom_timeout_secs: DEFAULT_CUSTOM_TIMEOUT_SECS,
            python_command: "python3".to_string(),
            node_command: "node".to_string(),
            fail_fast: false,
        }
    }
}

fn default_workers() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(4)
}

impl EngineConfig {
    /// Load from a YAML or JSON file (chosen by extension, YAML otherwise)
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config {}", path.display()))?;

        let config: EngineConfig = match path.extension().and_then(|e| e.to_str()) {
            Some("json") => serde_json::from_str(&content)
                .with_context(|| format!("Invalid JSON config {}", path.display()))?,
            _ => serde_yaml::from_str(&content)
                .with_context(|| format!("Invalid YAML config {}", path.display()))?,
        };

        Ok(config)
    }

    /// Resolve, load, apply environment overrides and validate
    pub fn load(explicit: Option<&Path>) -> Result<Self> {
        let path = explicit
            .map(Path::to_path_buf)
            .or_else(|| std::env::var_os(CONFIG_ENV).map(PathBuf::from))
            .or_else(|| Self::default_path().filter(|p| p.exists()));

        let mut config = match path {
            Some(path) => {
                log::info!("Loading engine config from {}", path.display());
                Self::from_file(&path)?
            }
            None => Self::default(),
        };

        config.apply_env(|key| std::env::var(key).ok())?;
        config.validate()?;
        Ok(config)
    }

    /// `<config dir>/promptlab/engine.yml`
    pub fn default_path() -> Option<PathBuf> {
        dirs::config_dir().map(|dir| dir.join("promptlab").join("engine.yml"))
    }

    /// Apply overrides from a variable lookup (the process environment in
    /// production, a map in tests)
    pub fn apply_env<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(value) = lookup(MAX_WORKERS_ENV) {
            self.max_workers = value
                .trim()
                .parse()
                .with_context(|| format!("{} must be a positive integer, got {:?}", MAX_WORKERS_ENV, value))?;
        }
        if let Some(value) = lookup(CUSTOM_TIMEOUT_ENV) {
            self.custom_timeout_secs = value
                .trim()
                .parse()
                .with_context(|| format!("{} must be a positive integer, got {:?}", CUSTOM_TIMEOUT_ENV, value))?;
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        if self.max_workers == 0 {
            anyhow::bail!("max_workers must be at least 1");
        }
        if self.custom_timeout_secs == 0 {
            anyhow::bail!("custom_timeout_secs must be at least 1");
        }
        if self.python_command.trim().is_empty() || self.node_command.trim().is_empty() {
            anyhow::bail!("interpreter commands must not be empty");
        }
        Ok(())
    }

    pub fn custom_timeout(&self) -> Duration {
        Duration::from_secs(self.custom_timeout_secs)
    }
}
