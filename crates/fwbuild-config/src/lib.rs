//! Coordinator configuration: ports, state directories, pool sizes, and
//! retry tunables, with environment-variable overrides.

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const ENV_DEV_MODE: &str = "FWBUILD_DEV";
pub const ENV_PORT_OVERRIDE: &str = "FWBUILD_PORT";
pub const ENV_CACHE_DIR_OVERRIDE: &str = "FWBUILD_CACHE_DIR";

pub const DEFAULT_PROD_PORT: u16 = 8765;
pub const DEFAULT_DEV_PORT: u16 = 8865;

const DEFAULT_DOWNLOAD_WORKERS: usize = 4;
const DEFAULT_UNPACK_WORKERS: usize = 2;
const DEFAULT_INSTALL_WORKERS: usize = 2;
const DEFAULT_DOWNLOAD_RETRIES: u32 = 3;
const DEFAULT_DOWNLOAD_BACKOFF_BASE_MS: u64 = 1_000;
const DEFAULT_UNPACK_RETRIES: u32 = 3;
const DEFAULT_UNPACK_RETRY_DELAY_MS: u64 = 2_000;
const DEFAULT_IDLE_TIMEOUT_SECS: u64 = 600;
const DEFAULT_DEV_IDLE_TIMEOUT_SECS: u64 = 5;
const DEFAULT_CANCEL_CACHE_TTL_MS: u64 = 100;
const DEFAULT_COMPILE_TIMEOUT_SECS: u64 = 60;
const DEFAULT_UPLOAD_TOTAL_TIMEOUT_SECS: u64 = 300;
const DEFAULT_UPLOAD_INACTIVITY_TIMEOUT_SECS: u64 = 30;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("configuration error: {0}")]
    Message(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PipelineTuning {
    #[serde(default = "default_download_workers")]
    pub download_workers: usize,
    #[serde(default = "default_unpack_workers")]
    pub unpack_workers: usize,
    #[serde(default = "default_install_workers")]
    pub install_workers: usize,
    #[serde(default = "default_download_retries")]
    pub download_retries: u32,
    #[serde(default = "default_download_backoff_base_ms")]
    pub download_backoff_base_ms: u64,
    #[serde(default = "default_unpack_retries")]
    pub unpack_retries: u32,
    #[serde(default = "default_unpack_retry_delay_ms")]
    pub unpack_retry_delay_ms: u64,
}

impl Default for PipelineTuning {
    fn default() -> Self {
        Self {
            download_workers: DEFAULT_DOWNLOAD_WORKERS,
            unpack_workers: DEFAULT_UNPACK_WORKERS,
            install_workers: DEFAULT_INSTALL_WORKERS,
            download_retries: DEFAULT_DOWNLOAD_RETRIES,
            download_backoff_base_ms: DEFAULT_DOWNLOAD_BACKOFF_BASE_MS,
            unpack_retries: DEFAULT_UNPACK_RETRIES,
            unpack_retry_delay_ms: DEFAULT_UNPACK_RETRY_DELAY_MS,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CoordinatorConfig {
    pub dev_mode: bool,
    pub port: u16,
    pub state_dir: PathBuf,
    pub cache_dir: PathBuf,
    #[serde(default)]
    pub pipeline: PipelineTuning,
    #[serde(default = "default_idle_timeout_secs")]
    pub idle_timeout_secs: u64,
    #[serde(default = "default_cancel_cache_ttl_ms")]
    pub cancel_cache_ttl_ms: u64,
    #[serde(default = "default_compile_timeout_secs")]
    pub compile_timeout_secs: u64,
    #[serde(default = "default_upload_total_timeout_secs")]
    pub upload_total_timeout_secs: u64,
    #[serde(default = "default_upload_inactivity_timeout_secs")]
    pub upload_inactivity_timeout_secs: u64,
}

impl CoordinatorConfig {
    /// Resolve configuration from the process environment. Production and
    /// development modes use distinct ports and distinct state directories.
    pub fn from_env() -> Result<Self, ConfigError> {
        let dev_mode = std::env::var(ENV_DEV_MODE)
            .map(|value| matches!(value.as_str(), "1" | "true" | "yes"))
            .unwrap_or(false);

        let port = match std::env::var(ENV_PORT_OVERRIDE) {
            Ok(raw) => raw
                .parse::<u16>()
                .map_err(|_| ConfigError::Message(format!("invalid {ENV_PORT_OVERRIDE}: {raw}")))?,
            Err(_) => {
                if dev_mode {
                    DEFAULT_DEV_PORT
                } else {
                    DEFAULT_PROD_PORT
                }
            }
        };

        let home = dirs::home_dir()
            .ok_or_else(|| ConfigError::Message("cannot determine home directory".to_owned()))?;
        let state_dir = if dev_mode {
            home.join(".fwbuild").join("daemon-dev")
        } else {
            home.join(".fwbuild").join("daemon")
        };

        let cache_dir = match std::env::var(ENV_CACHE_DIR_OVERRIDE) {
            Ok(path) if !path.is_empty() => PathBuf::from(path),
            _ => home.join(".fwbuild").join("packages"),
        };

        let idle_timeout_secs = if dev_mode {
            DEFAULT_DEV_IDLE_TIMEOUT_SECS
        } else {
            DEFAULT_IDLE_TIMEOUT_SECS
        };

        Ok(Self {
            dev_mode,
            port,
            state_dir,
            cache_dir,
            pipeline: PipelineTuning::default(),
            idle_timeout_secs,
            cancel_cache_ttl_ms: DEFAULT_CANCEL_CACHE_TTL_MS,
            compile_timeout_secs: DEFAULT_COMPILE_TIMEOUT_SECS,
            upload_total_timeout_secs: DEFAULT_UPLOAD_TOTAL_TIMEOUT_SECS,
            upload_inactivity_timeout_secs: DEFAULT_UPLOAD_INACTIVITY_TIMEOUT_SECS,
        })
    }

    /// Configuration rooted in a throwaway directory, for tests. The idle
    /// window stays long so a daemon under test never evicts itself.
    pub fn for_testing(root: &std::path::Path, port: u16) -> Self {
        Self {
            dev_mode: true,
            port,
            state_dir: root.join("daemon"),
            cache_dir: root.join("packages"),
            pipeline: PipelineTuning::default(),
            idle_timeout_secs: DEFAULT_IDLE_TIMEOUT_SECS,
            cancel_cache_ttl_ms: DEFAULT_CANCEL_CACHE_TTL_MS,
            compile_timeout_secs: DEFAULT_COMPILE_TIMEOUT_SECS,
            upload_total_timeout_secs: DEFAULT_UPLOAD_TOTAL_TIMEOUT_SECS,
            upload_inactivity_timeout_secs: DEFAULT_UPLOAD_INACTIVITY_TIMEOUT_SECS,
        }
    }

    pub fn port_file(&self) -> PathBuf {
        self.state_dir.join("daemon.port")
    }

    pub fn singleton_lock_file(&self) -> PathBuf {
        self.state_dir.join("daemon.spawn-lock")
    }

    pub fn spawn_log_file(&self) -> PathBuf {
        self.state_dir.join("spawn.log")
    }

    pub fn cancel_signal_file(&self, request_id: &str) -> PathBuf {
        self.state_dir.join(format!("cancel-{request_id}.signal"))
    }

    pub fn daemon_log_file(&self) -> PathBuf {
        self.state_dir.join("daemon.log")
    }

    pub fn request_log_file(&self, request_id: &str) -> PathBuf {
        self.state_dir.join("logs").join(format!("{request_id}.log"))
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs)
    }

    pub fn cancel_cache_ttl(&self) -> Duration {
        Duration::from_millis(self.cancel_cache_ttl_ms)
    }

    pub fn base_url(&self) -> String {
        format!("http://127.0.0.1:{}", self.port)
    }
}

fn default_download_workers() -> usize {
    DEFAULT_DOWNLOAD_WORKERS
}

fn default_unpack_workers() -> usize {
    DEFAULT_UNPACK_WORKERS
}

fn default_install_workers() -> usize {
    DEFAULT_INSTALL_WORKERS
}

fn default_download_retries() -> u32 {
    DEFAULT_DOWNLOAD_RETRIES
}

fn default_download_backoff_base_ms() -> u64 {
    DEFAULT_DOWNLOAD_BACKOFF_BASE_MS
}

fn default_unpack_retries() -> u32 {
    DEFAULT_UNPACK_RETRIES
}

fn default_unpack_retry_delay_ms() -> u64 {
    DEFAULT_UNPACK_RETRY_DELAY_MS
}

fn default_idle_timeout_secs() -> u64 {
    DEFAULT_IDLE_TIMEOUT_SECS
}

fn default_cancel_cache_ttl_ms() -> u64 {
    DEFAULT_CANCEL_CACHE_TTL_MS
}

fn default_compile_timeout_secs() -> u64 {
    DEFAULT_COMPILE_TIMEOUT_SECS
}

fn default_upload_total_timeout_secs() -> u64 {
    DEFAULT_UPLOAD_TOTAL_TIMEOUT_SECS
}

fn default_upload_inactivity_timeout_secs() -> u64 {
    DEFAULT_UPLOAD_INACTIVITY_TIMEOUT_SECS
}
