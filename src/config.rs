//! TOML configuration for bwtester.
//!
//! Every section has compiled-in defaults, so an empty or partial file is
//! valid.  Command-line flags override whatever is loaded here.

use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::client::{RetryPolicy, MAX_TRIES, RETRY_PAUSE};
use crate::params::DEFAULT_DIRECTION_SPEC;
use crate::server::{CLEANUP_INTERVAL, RESULT_RETENTION};
use crate::sync::MAX_RTT;

/// Environment variable naming a config file.
pub const CONFIG_ENV: &str = "BWTESTER_CONFIG";

/// System-wide config location.
pub const SYSTEM_CONFIG_PATH: &str = "/etc/bwtester/bwtester.toml";

// ---------------------------------------------------------------------------
// Top-level config
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BwtesterConfig {
    #[serde(default)]
    pub client: ClientConfig,
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl BwtesterConfig {
    /// Load configuration from a TOML file at `path`.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file: {}", path.display()))?;
        let config: Self = toml::from_str(&content)
            .with_context(|| format!("failed to parse config file: {}", path.display()))?;
        info!(path = %path.display(), "loaded bwtester configuration");
        Ok(config)
    }

    /// Try to load configuration from, in order:
    /// 1. The path in `BWTESTER_CONFIG`.
    /// 2. `/etc/bwtester/bwtester.toml`.
    /// 3. Compiled-in defaults.
    pub fn load_or_default() -> Self {
        if let Ok(env_path) = std::env::var(CONFIG_ENV) {
            let path = Path::new(&env_path);
            match Self::load(path) {
                Ok(cfg) => return cfg,
                Err(e) => {
                    warn!(
                        path = %path.display(),
                        error = %e,
                        "BWTESTER_CONFIG set but file could not be loaded, trying fallback"
                    );
                }
            }
        }

        let system_path = Path::new(SYSTEM_CONFIG_PATH);
        if system_path.exists() {
            match Self::load(system_path) {
                Ok(cfg) => return cfg,
                Err(e) => {
                    warn!(
                        path = %system_path.display(),
                        error = %e,
                        "system config file exists but could not be loaded, using defaults"
                    );
                }
            }
        }

        debug!("no config file found, using defaults");
        Self::default()
    }

    /// An explicit path must load; otherwise fall back to [`load_or_default`](Self::load_or_default).
    pub fn resolve(explicit: Option<&Path>) -> Result<Self> {
        match explicit {
            Some(path) => Self::load(path),
            None => Ok(Self::load_or_default()),
        }
    }
}

// ---------------------------------------------------------------------------
// Sections
// ---------------------------------------------------------------------------

/// `[client]`
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Local control address, e.g. `127.0.0.1:40001`.
    pub local_address: Option<String>,
    /// Responder control address.
    pub server_address: Option<String>,
    /// Client->server direction as `duration,packet_size,num_packets`.
    pub client_to_server: String,
    /// Server->client direction.
    pub server_to_client: String,
    pub max_tries: u32,
    pub reply_timeout_ms: u64,
    pub retry_pause_ms: u64,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            local_address: None,
            server_address: None,
            client_to_server: DEFAULT_DIRECTION_SPEC.to_string(),
            server_to_client: DEFAULT_DIRECTION_SPEC.to_string(),
            max_tries: MAX_TRIES,
            reply_timeout_ms: MAX_RTT.as_millis() as u64,
            retry_pause_ms: RETRY_PAUSE.as_millis() as u64,
        }
    }
}

impl ClientConfig {
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_tries: self.max_tries.max(1),
            reply_timeout: Duration::from_millis(self.reply_timeout_ms),
            retry_pause: Duration::from_millis(self.retry_pause_ms),
        }
    }
}

/// `[server]`
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub listen_address: String,
    /// Seconds a finished result stays queryable.
    pub result_retention_secs: u64,
    pub cleanup_interval_secs: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_address: "0.0.0.0:40002".to_string(),
            result_retention_secs: RESULT_RETENTION.as_secs(),
            cleanup_interval_secs: CLEANUP_INTERVAL.as_secs(),
        }
    }
}

/// `[logging]`
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Minimum tracing level (`trace`, `debug`, `info`, `warn`, `error`).
    pub level: String,
    /// Emit log lines as JSON.
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
