//! Runtime configuration for the offline store and sync engine.
//!
//! Resolution order: built-in defaults, then `{data_dir}/sync-config.json`
//! when present, then `SMALL_POS_*` environment variables.

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::info;

use crate::error::ConfigError;

pub const CONFIG_FILE: &str = "sync-config.json";
const ENV_PREFIX: &str = "SMALL_POS_";

const DEFAULT_BATCH_SIZE: usize = 200;
const DEFAULT_ITEM_DELAY_MS: u64 = 100;
const DEFAULT_RECONNECT_DEBOUNCE_MS: u64 = 2_000;
const DEFAULT_RETRY_INTERVAL_SECS: u64 = 30;
const DEFAULT_HEALTH_CHECK_INTERVAL_SECS: u64 = 15;
const DEFAULT_RETRY_BASE_DELAY_MS: u64 = 5_000;
const DEFAULT_RETRY_MAX_DELAY_MS: u64 = 300_000;
const DEFAULT_STALE_AFTER_SECS: u64 = 15 * 60;
const DEFAULT_EVENT_CAPACITY: usize = 256;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    pub data_dir: PathBuf,
    pub remote_url: Option<String>,
    pub api_key: Option<String>,
    /// Upper bound on queue items loaded per drain.
    pub batch_size: usize,
    /// Pause between queue items during a drain.
    pub item_delay_ms: u64,
    pub reconnect_debounce_ms: u64,
    /// Tick for retrying backed-off items while online.
    pub retry_interval_secs: u64,
    /// Health check period; 0 disables the polling task.
    pub health_check_interval_secs: u64,
    pub retry_base_delay_ms: u64,
    pub retry_max_delay_ms: u64,
    /// Age after which cached reference data should be pulled again.
    pub stale_after_secs: u64,
    pub event_capacity: usize,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            remote_url: None,
            api_key: None,
            batch_size: DEFAULT_BATCH_SIZE,
            item_delay_ms: DEFAULT_ITEM_DELAY_MS,
            reconnect_debounce_ms: DEFAULT_RECONNECT_DEBOUNCE_MS,
            retry_interval_secs: DEFAULT_RETRY_INTERVAL_SECS,
            health_check_interval_secs: DEFAULT_HEALTH_CHECK_INTERVAL_SECS,
            retry_base_delay_ms: DEFAULT_RETRY_BASE_DELAY_MS,
            retry_max_delay_ms: DEFAULT_RETRY_MAX_DELAY_MS,
            stale_after_secs: DEFAULT_STALE_AFTER_SECS,
            event_capacity: DEFAULT_EVENT_CAPACITY,
        }
    }
}

/// Platform data directory, mirroring the log directory layout.
pub fn default_data_dir() -> PathBuf {
    let base = std::env::var("LOCALAPPDATA")
        .or_else(|_| std::env::var("XDG_DATA_HOME"))
        .map(PathBuf::from)
        .unwrap_or_else(|_| {
            PathBuf::from(std::env::var("HOME").unwrap_or_else(|_| ".".into()))
                .join(".local")
                .join("share")
        });
    base.join("com.thesmall.pos")
}

impl SyncConfig {
    /// Load defaults, the optional JSON file in `data_dir`, then env overrides.
    pub fn load(data_dir: &Path) -> Result<Self, ConfigError> {
        let path = data_dir.join(CONFIG_FILE);
        let mut config = if path.exists() {
            Self::from_file(&path)?
        } else {
            Self::default()
        };
        config.data_dir = data_dir.to_path_buf();
        config.apply_env(|key| std::env::var(key).ok())?;
        config.validate()?;
        info!(
            data_dir = %config.data_dir.display(),
            remote_configured = config.remote_url.is_some(),
            "Sync config loaded"
        );
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let raw = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.display().to_string(),
            source,
        })?;
        serde_json::from_str(&raw).map_err(|source| ConfigError::Parse {
            path: path.display().to_string(),
            source,
        })
    }

    /// Apply `SMALL_POS_*` overrides read through `lookup`.
    pub fn apply_env<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let var = |name: &str| lookup(&format!("{ENV_PREFIX}{name}"));

        if let Some(url) = var("REMOTE_URL") {
            self.remote_url = Some(url);
        }
        if let Some(key) = var("API_KEY") {
            self.api_key = Some(key);
        }
        if let Some(dir) = var("DATA_DIR") {
            self.data_dir = PathBuf::from(dir);
        }
        override_num(&mut self.batch_size, "BATCH_SIZE", var("BATCH_SIZE"))?;
        override_num(&mut self.item_delay_ms, "ITEM_DELAY_MS", var("ITEM_DELAY_MS"))?;
        override_num(
            &mut self.reconnect_debounce_ms,
            "RECONNECT_DEBOUNCE_MS",
            var("RECONNECT_DEBOUNCE_MS"),
        )?;
        override_num(
            &mut self.retry_interval_secs,
            "RETRY_INTERVAL_SECS",
            var("RETRY_INTERVAL_SECS"),
        )?;
        override_num(
            &mut self.health_check_interval_secs,
            "HEALTH_CHECK_INTERVAL_SECS",
            var("HEALTH_CHECK_INTERVAL_SECS"),
        )?;
        override_num(
            &mut self.retry_base_delay_ms,
            "RETRY_BASE_DELAY_MS",
            var("RETRY_BASE_DELAY_MS"),
        )?;
        override_num(
            &mut self.retry_max_delay_ms,
            "RETRY_MAX_DELAY_MS",
            var("RETRY_MAX_DELAY_MS"),
        )?;
        override_num(
            &mut self.stale_after_secs,
            "STALE_AFTER_SECS",
            var("STALE_AFTER_SECS"),
        )?;
        Ok(())
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.batch_size == 0 {
            return Err(ConfigError::Invalid("batch_size must be at least 1".into()));
        }
        if self.retry_max_delay_ms < self.retry_base_delay_ms {
            return Err(ConfigError::Invalid(
                "retry_max_delay_ms must be >= retry_base_delay_ms".into(),
            ));
        }
        if self.event_capacity == 0 {
            return Err(ConfigError::Invalid("event_capacity must be at least 1".into()));
        }
        Ok(())
    }

    pub fn item_delay(&self) -> Duration {
        Duration::from_millis(self.item_delay_ms)
    }

    pub fn reconnect_debounce(&self) -> Duration {
        Duration::from_millis(self.reconnect_debounce_ms)
    }

    pub fn retry_interval(&self) -> Duration {
        Duration::from_secs(self.retry_interval_secs.max(1))
    }

    pub fn health_check_interval(&self) -> Option<Duration> {
        (self.health_check_interval_secs > 0).then(|| Duration::from_secs(self.health_check_interval_secs))
    }

    pub fn stale_after(&self) -> Duration {
        Duration::from_secs(self.stale_after_secs)
    }

    /// Exponential backoff for the given attempt count (1-based), capped.
    pub fn retry_delay(&self, attempts: i64) -> Duration {
        let exponent = attempts.saturating_sub(1).clamp(0, 20) as u32;
        let delay = self
            .retry_base_delay_ms
            .saturating_mul(1u64 << exponent)
            .min(self.retry_max_delay_ms);
        Duration::from_millis(delay)
    }
}

fn override_num<T: std::str::FromStr>(
    slot: &mut T,
    key: &str,
    raw: Option<String>,
) -> Result<(), ConfigError> {
    if let Some(raw) = raw {
        *slot = raw
            .trim()
            .parse()
            .map_err(|_| ConfigError::InvalidEnv {
                key: format!("{ENV_PREFIX}{key}"),
                value: raw.clone(),
            })?;
    }
    Ok(())
}
