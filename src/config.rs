//! Orchestrator configuration
//!
//! Loaded from TOML, with a handful of environment overrides for deployment:
//!
//! ```toml
//! retry_limit = 3
//! task_timeout_ms = 30000
//!
//! [store]
//! backend = "sled"
//! path = "/var/lib/weft"
//!
//! [backoff]
//! initial_ms = 25
//! max_ms = 1000
//! ```

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::backoff::BackoffConfig;
use crate::error::WeftError;

/// Which backend holds orchestration state.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(tag = "backend", rename_all = "lowercase")]
pub enum StoreConfig {
    #[default]
    Memory,
    Sled { path: PathBuf },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OrchestratorConfig {
    pub store: StoreConfig,
    /// Retries per task after the first failure.
    pub retry_limit: u32,
    pub task_timeout_ms: u64,
    /// How long dispatch waits for an idle agent with the right capability.
    pub agent_wait_timeout_ms: u64,
    pub backoff: BackoffConfig,
    /// Buffered change notifications per subscriber before the oldest are dropped.
    pub change_capacity: usize,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            store: StoreConfig::Memory,
            retry_limit: 3,
            task_timeout_ms: 30_000,
            agent_wait_timeout_ms: 30_000,
            backoff: BackoffConfig::default(),
            change_capacity: 1024,
        }
    }
}

impl OrchestratorConfig {
    pub fn from_toml_str(s: &str) -> Result<Self, WeftError> {
        toml::from_str(s).map_err(|e| WeftError::ConfigError(e.to_string()))
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, WeftError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .map_err(|e| WeftError::ConfigError(format!("{}: {e}", path.display())))?;
        Self::from_toml_str(&text)
    }

    /// Apply `WEFT_STORE_BACKEND`, `WEFT_STORE_PATH`, `WEFT_RETRY_LIMIT` and
    /// `WEFT_TASK_TIMEOUT_MS`.
    pub fn with_env_overrides(self) -> Result<Self, WeftError> {
        self.with_overrides(|name| std::env::var(name).ok())
    }

    fn with_overrides<F>(mut self, var: F) -> Result<Self, WeftError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let path = var("WEFT_STORE_PATH").map(PathBuf::from);
        match var("WEFT_STORE_BACKEND").as_deref() {
            Some("memory") => self.store = StoreConfig::Memory,
            Some("sled") => {
                let path = match (path, &self.store) {
                    (Some(p), _) => p,
                    (None, StoreConfig::Sled { path }) => path.clone(),
                    (None, StoreConfig::Memory) => {
                        return Err(WeftError::ConfigError(
                            "WEFT_STORE_BACKEND=sled requires WEFT_STORE_PATH".into(),
                        ))
                    }
                };
                self.store = StoreConfig::Sled { path };
            }
            Some(other) => {
                return Err(WeftError::ConfigError(format!("unknown store backend '{other}'")));
            }
            None => {
                if let (Some(p), StoreConfig::Sled { path }) = (path, &mut self.store) {
                    *path = p;
                }
            }
        }

        if let Some(v) = var("WEFT_RETRY_LIMIT") {
            self.retry_limit = parse_env("WEFT_RETRY_LIMIT", &v)?;
        }
        if let Some(v) = var("WEFT_TASK_TIMEOUT_MS") {
            self.task_timeout_ms = parse_env("WEFT_TASK_TIMEOUT_MS", &v)?;
        }
        Ok(self)
    }

    pub fn task_timeout(&self) -> Duration {
        Duration::from_millis(self.task_timeout_ms)
    }

    pub fn agent_wait_timeout(&self) -> Duration {
        Duration::from_millis(self.agent_wait_timeout_ms)
    }
}

fn parse_env<T: std::str::FromStr>(name: &str, value: &str) -> Result<T, WeftError> {
    value
        .trim()
        .parse()
        .map_err(|_| WeftError::ConfigError(format!("{name}: invalid value '{value}'")))
}
