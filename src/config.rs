use std::env;
use std::fs;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};

use crate::logging::LogRotationPolicy;
use crate::notify::RetryPolicy;

pub const DEFAULT_API_ADDR: &str = "127.0.0.1:5000";
pub const DEFAULT_NOTIFY_URL: &str = "http://localhost:5005";

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub base_dir: PathBuf,
    pub daemon_addr: String,
    pub api_addr: String,
    pub manifest_path: PathBuf,
    pub status_path: PathBuf,
    pub log_dir: PathBuf,
    pub log_rotation: LogRotationPolicy,
    /// `None` disables HTTP exit notifications; exits are only logged.
    pub notify_url: Option<String>,
    pub notify_retry: RetryPolicy,
    /// `host:port` reached to decide whether the device is online.
    pub probe_addr: Option<String>,
    pub stop_timeout: Duration,
}

impl AppConfig {
    pub fn load() -> Result<Self> {
        let base_dir = env_string("FLEETOP_HOME")
            .map(PathBuf::from)
            .unwrap_or_else(|| {
                dirs::data_local_dir()
                    .unwrap_or_else(env::temp_dir)
                    .join("fleetop")
            });
        let daemon_addr = env_string("FLEETOP_DAEMON_ADDR")
            .unwrap_or_else(|| format!("127.0.0.1:{}", daemon_port()));
        let api_addr =
            env_string("FLEETOP_API_ADDR").unwrap_or_else(|| DEFAULT_API_ADDR.to_string());
        let manifest_path = env_string("FLEETOP_MANIFEST")
            .map(PathBuf::from)
            .unwrap_or_else(|| base_dir.join("operator.toml"));
        // An explicitly empty notify url turns HTTP notifications off.
        let notify_url = match env::var("FLEETOP_NOTIFY_URL") {
            Ok(value) if value.trim().is_empty() => None,
            Ok(value) => Some(value.trim().to_string()),
            Err(_) => Some(DEFAULT_NOTIFY_URL.to_string()),
        };
        let log_rotation = LogRotationPolicy {
            max_size_bytes: env_u64("FLEETOP_LOG_MAX_SIZE_MB", 20)
                .max(1)
                .saturating_mul(1024 * 1024),
            max_files: env_u64("FLEETOP_LOG_MAX_FILES", 5).max(1) as u32,
            max_age_days: env_u64("FLEETOP_LOG_MAX_DAYS", 14).max(1),
        };
        let notify_retry = RetryPolicy {
            attempts: env_u64("FLEETOP_NOTIFY_ATTEMPTS", 3).max(1) as u32,
            backoff: Duration::from_secs(env_u64("FLEETOP_NOTIFY_BACKOFF_SECS", 3)),
        };

        let config = Self {
            status_path: base_dir.join("status.json"),
            log_dir: base_dir.join("logs"),
            base_dir,
            daemon_addr,
            api_addr,
            manifest_path,
            log_rotation,
            notify_url,
            notify_retry,
            probe_addr: env_string("FLEETOP_PROBE_ADDR"),
            stop_timeout: Duration::from_secs(env_u64("FLEETOP_STOP_TIMEOUT_SECS", 10).max(1)),
        };
        config.ensure_layout()?;
        Ok(config)
    }

    pub fn ensure_layout(&self) -> Result<()> {
        fs::create_dir_all(&self.base_dir)
            .with_context(|| format!("failed to create {}", self.base_dir.display()))?;
        fs::create_dir_all(&self.log_dir)
            .with_context(|| format!("failed to create {}", self.log_dir.display()))?;
        Ok(())
    }
}

fn daemon_port() -> u16 {
    let identity = current_identity();
    let mut hash = 2166136261_u32;
    for byte in identity.as_bytes() {
        hash ^= *byte as u32;
        hash = hash.wrapping_mul(16777619);
    }

    // High, non-privileged range.
    40000 + (hash % 20000) as u16
}

fn current_identity() -> String {
    #[cfg(unix)]
    {
        format!("uid-{}", nix::unistd::Uid::effective().as_raw())
    }

    #[cfg(not(unix))]
    {
        env::var("USERNAME").unwrap_or_else(|_| "fleetop".to_string())
    }
}

fn env_string(key: &str) -> Option<String> {
    env::var(key)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

fn env_u64(key: &str, default: u64) -> u64 {
    env::var(key)
        .ok()
        .and_then(|value| value.trim().parse::<u64>().ok())
        .unwrap_or(default)
}
