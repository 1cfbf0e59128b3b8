//! Engine configuration
//!
//! Tunables for the execution driver, loaded from `engine.yaml`:
//!
//! ```yaml
//! max_retries: 3
//! backoff_ms: 1000
//! reset_retries_on_manual_retry: true
//!
//! compensation:
//!   on_cancel: true
//!   on_failure: false
//!
//! webhook:
//!   timeout_ms: 5000
//!   headers:
//!     X-Source: stepflow
//!
//! store:
//!   type: file
//!   dir: .stepflow/runs
//! ```

use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::loader::LoadError;

/// Where runs are persisted
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum StoreConfig {
    #[default]
    Memory,
    File {
        #[serde(default = "default_store_dir")]
        dir: PathBuf,
    },
}

fn default_store_dir() -> PathBuf {
    PathBuf::from(".stepflow/runs")
}

/// Which terminal transitions trigger handler rollbacks
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct CompensationConfig {
    #[serde(default)]
    pub on_cancel: bool,
    #[serde(default)]
    pub on_failure: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WebhookConfig {
    #[serde(default = "default_webhook_timeout")]
    pub timeout_ms: u64,

    /// Extra headers sent with every notification
    #[serde(default)]
    pub headers: HashMap<String, String>,
}

fn default_webhook_timeout() -> u64 {
    5000
}

impl Default for WebhookConfig {
    fn default() -> Self {
        Self {
            timeout_ms: default_webhook_timeout(),
            headers: HashMap::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Automatic attempts per step before it is marked failed
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    /// Linear backoff unit: the n-th retry waits `backoff_ms * n`
    #[serde(default = "default_backoff_ms")]
    pub backoff_ms: u64,

    /// Whether `retry_step` gives the step a fresh retry budget
    ///
    /// When false the step keeps its exhausted counter: the next failure
    /// fails it again without backoff, and `retries` stays at `max_retries`.
    #[serde(default = "default_true")]
    pub reset_retries_on_manual_retry: bool,

    #[serde(default)]
    pub compensation: CompensationConfig,

    #[serde(default)]
    pub webhook: WebhookConfig,

    #[serde(default)]
    pub store: StoreConfig,
}

fn default_max_retries() -> u32 {
    3
}

fn default_backoff_ms() -> u64 {
    1000
}

fn default_true() -> bool {
    true
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            backoff_ms: default_backoff_ms(),
            reset_retries_on_manual_retry: true,
            compensation: CompensationConfig::default(),
            webhook: WebhookConfig::default(),
            store: StoreConfig::default(),
        }
    }
}

impl EngineConfig {
    /// Delay before the given retry attempt (1-based)
    pub fn backoff_for(&self, retries: u32) -> Duration {
        Duration::from_millis(self.backoff_ms.saturating_mul(u64::from(retries)))
    }

    pub fn load(path: impl AsRef<std::path::Path>) -> Result<Self, LoadError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)?;
        let config: EngineConfig = serde_yaml::from_str(&content).map_err(|e| LoadError::Yaml {
            file: path.display().to_string(),
            error: e,
        })?;
        Ok(config)
    }
}
