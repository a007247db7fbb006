// This module handles config.toml.
// The file is re-read every time a snapshot is taken, so edits take effect on the next request.
// If the file stops parsing, we keep serving the last good copy and complain in the log.

use std::{path::{Path, PathBuf}, sync::Arc, time::Duration};

use anyhow::{Context, Result};
use log::warn;
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AppConfig {
    pub backend: BackendConfig,
    pub llm: LlmConfig,
    pub paths: PathsConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BackendConfig {
    /// e.g. http://127.0.0.1:8188
    pub base_url: String,
    /// e.g. ws://127.0.0.1:8188
    pub ws_url: String,
    #[serde(default = "default_timeout")]
    pub timeout_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LlmConfig {
    pub url: String,
    pub model: String,
}

/// Relative paths are resolved against `base_dir`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PathsConfig {
    pub base_dir: PathBuf,
    /// The ComfyUI models directory, holding checkpoints/ and loras/.
    pub models_dir: PathBuf,
    pub characters: PathBuf,
    pub images: PathBuf,
    pub latest: PathBuf,
    pub temp_workflows: PathBuf,
    pub seed_file: PathBuf,
    pub database: PathBuf,
}

fn default_timeout() -> u64 {
    300
}

impl BackendConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

impl PathsConfig {
    pub fn resolve(&self, path: &Path) -> PathBuf {
        if path.is_absolute() {
            path.to_owned()
        } else {
            self.base_dir.join(path)
        }
    }

    pub fn characters(&self) -> PathBuf {
        self.resolve(&self.characters)
    }

    pub fn images(&self) -> PathBuf {
        self.resolve(&self.images)
    }

    pub fn latest(&self) -> PathBuf {
        self.resolve(&self.latest)
    }

    pub fn temp_workflows(&self) -> PathBuf {
        self.resolve(&self.temp_workflows)
    }

    pub fn seed_file(&self) -> PathBuf {
        self.resolve(&self.seed_file)
    }

    pub fn database(&self) -> PathBuf {
        self.resolve(&self.database)
    }

    pub fn models_dir(&self) -> PathBuf {
        self.resolve(&self.models_dir)
    }
}

pub fn read_config(path: &Path) -> Result<AppConfig> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("Error reading {}", path.display()))?;
    toml::from_str(&text).with_context(|| format!("Error parsing {}", path.display()))
}

struct ConfigState {
    path: PathBuf,
    current: AppConfig,
}

#[derive(Clone)]
pub struct ConfigModule(Arc<RwLock<ConfigState>>);

impl ConfigModule {
    pub fn new(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let current = read_config(&path)?;
        Ok(Self(Arc::new(RwLock::new(ConfigState { path, current }))))
    }

    #[cfg(test)]
    /// A config that never touches the disk. Used by tests.
    pub fn fixed(config: AppConfig) -> Self {
        Self(Arc::new(RwLock::new(ConfigState {
            path: PathBuf::new(),
            current: config,
        })))
    }

    /// Returns the current config, re-reading the file first.
    pub async fn snapshot(&self) -> AppConfig {
        let mut state = self.0.write().await;
        if !state.path.as_os_str().is_empty() {
            match read_config(&state.path) {
                Ok(new_config) => state.current = new_config,
                Err(e) => warn!("Keeping previous config: {:#}", e),
            }
        }
        state.current.clone()
    }
}

#[cfg(test)]
pub fn testconfig() -> AppConfig {
    toml::from_str(include_str!("../testdata/config.toml")).unwrap()
}
