use std::fs;
use std::path::PathBuf;
use std::time::Duration;

use camino::Utf8PathBuf;
use directories::BaseDirs;
use serde::{Deserialize, Serialize};

use crate::error::AssemblerError;
use crate::retry::{DEFAULT_BACKOFF, DEFAULT_MAX_ATTEMPTS, RetryPolicy};

pub const DEFAULT_CONFIG_FILE: &str = "chunk-assembler.json";
pub const DEFAULT_IDLE_TIMEOUT_SECS: u64 = 24 * 60 * 60;
pub const DEFAULT_TOMBSTONE_TTL_SECS: u64 = 10 * 60;
pub const DEFAULT_SWEEP_INTERVAL_SECS: u64 = 5 * 60;
const METADATA_LOG_FILE: &str = "uploads.jsonl";

#[derive(Debug, Default, Deserialize, Serialize)]
pub struct Config {
    #[serde(default)]
    pub temp_root: Option<String>,
    #[serde(default)]
    pub upload_root: Option<String>,
    #[serde(default)]
    pub metadata_log: Option<String>,
    #[serde(default)]
    pub idle_timeout_secs: Option<u64>,
    #[serde(default)]
    pub tombstone_ttl_secs: Option<u64>,
    #[serde(default)]
    pub sweep_interval_secs: Option<u64>,
    #[serde(default)]
    pub retry: Option<RetryConfig>,
}

#[derive(Debug, Default, Deserialize, Serialize)]
pub struct RetryConfig {
    #[serde(default)]
    pub max_attempts: Option<u32>,
    #[serde(default)]
    pub backoff_ms: Option<u64>,
}

#[derive(Debug, Clone)]
pub struct ResolvedConfig {
    pub temp_root: Utf8PathBuf,
    pub upload_root: Utf8PathBuf,
    pub metadata_log: Utf8PathBuf,
    pub idle_timeout: Duration,
    pub tombstone_ttl: Duration,
    pub sweep_interval: Duration,
    pub retry: RetryPolicy,
}

impl ResolvedConfig {
    /// Everything below one directory; handy for tests and local runs.
    pub fn under(root: Utf8PathBuf) -> Self {
        Self {
            temp_root: root.join("temp"),
            upload_root: root.join("uploads"),
            metadata_log: root.join(METADATA_LOG_FILE),
            idle_timeout: Duration::from_secs(DEFAULT_IDLE_TIMEOUT_SECS),
            tombstone_ttl: Duration::from_secs(DEFAULT_TOMBSTONE_TTL_SECS),
            sweep_interval: Duration::from_secs(DEFAULT_SWEEP_INTERVAL_SECS),
            retry: RetryPolicy::default(),
        }
    }
}

pub struct ConfigLoader;

impl ConfigLoader {
    pub fn resolve(path: Option<&str>) -> Result<ResolvedConfig, AssemblerError> {
        let config_path = match path {
            Some(path) => PathBuf::from(path),
            None => PathBuf::from(DEFAULT_CONFIG_FILE),
        };

        if path.is_none() && !config_path.exists() {
            return Self::resolve_config(Config::default());
        }

        let content = fs::read_to_string(&config_path)
            .map_err(|_| AssemblerError::ConfigRead(config_path.clone()))?;
        let config: Config = serde_json::from_str(&content)
            .map_err(|err| AssemblerError::ConfigParse(err.to_string()))?;

        Self::resolve_config(config)
    }

    pub fn resolve_config(config: Config) -> Result<ResolvedConfig, AssemblerError> {
        let temp_root = match config.temp_root {
            Some(path) => Utf8PathBuf::from(path),
            None => default_data_root()?.join("temp"),
        };
        let upload_root = match config.upload_root {
            Some(path) => Utf8PathBuf::from(path),
            None => default_data_root()?.join("uploads"),
        };
        let metadata_log = match config.metadata_log {
            Some(path) => Utf8PathBuf::from(path),
            None => match upload_root.parent() {
                Some(parent) => parent.join(METADATA_LOG_FILE),
                None => default_data_root()?.join(METADATA_LOG_FILE),
            },
        };
        if temp_root == upload_root {
            return Err(AssemblerError::ConfigParse(
                "temp_root and upload_root must differ".to_string(),
            ));
        }
        // Artifacts and fragment namespaces are named by clients.
        if metadata_log.starts_with(&upload_root) || metadata_log.starts_with(&temp_root) {
            return Err(AssemblerError::ConfigParse(format!(
                "metadata_log {metadata_log} must live outside temp_root and upload_root"
            )));
        }

        let retry = config.retry.unwrap_or_default();
        let retry = RetryPolicy::new(
            retry.max_attempts.unwrap_or(DEFAULT_MAX_ATTEMPTS),
            retry
                .backoff_ms
                .map(Duration::from_millis)
                .unwrap_or(DEFAULT_BACKOFF),
        );

        Ok(ResolvedConfig {
            temp_root,
            upload_root,
            metadata_log,
            idle_timeout: Duration::from_secs(
                config.idle_timeout_secs.unwrap_or(DEFAULT_IDLE_TIMEOUT_SECS),
            ),
            tombstone_ttl: Duration::from_secs(
                config
                    .tombstone_ttl_secs
                    .unwrap_or(DEFAULT_TOMBSTONE_TTL_SECS),
            ),
            sweep_interval: Duration::from_secs(
                config
                    .sweep_interval_secs
                    .unwrap_or(DEFAULT_SWEEP_INTERVAL_SECS),
            ),
            retry,
        })
    }
}

fn default_data_root() -> Result<Utf8PathBuf, AssemblerError> {
    BaseDirs::new()
        .and_then(|dirs| {
            Utf8PathBuf::from_path_buf(dirs.data_local_dir().join("chunk-assembler")).ok()
        })
        .ok_or_else(|| AssemblerError::Filesystem("unable to resolve data directory".to_string()))
}
