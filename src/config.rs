//! Client configuration.
//!
//! Defaults match the production dashboard. Values can be loaded from a JSON
//! file and overridden with `ROUTEROS_*` environment variables.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};

use crate::endpoint::{EndpointConfig, Environment};

/// Timeouts, heartbeat and reconnection policy for [`crate::RouterOsClient`].
///
/// All durations are in milliseconds so the file format stays flat.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Bound on a single socket open.
    pub connect_timeout_ms: u64,
    /// Heartbeat tick period. A connection with no confirmed liveness for
    /// twice this long is declared dead.
    pub heartbeat_interval_ms: u64,
    /// Budget for one heartbeat probe.
    pub heartbeat_timeout_ms: u64,
    /// First automatic reconnect delay; doubles per attempt.
    pub reconnect_base_delay_ms: u64,
    /// Cap on the automatic reconnect delay.
    pub reconnect_max_delay_ms: u64,
    /// Automatic reconnects before giving up.
    pub max_reconnect_attempts: u32,
    /// Default `send` timeout.
    pub request_timeout_ms: u64,
    /// Default `send` retry count.
    pub request_retries: u32,
    pub endpoint: EndpointConfig,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            connect_timeout_ms: 10_000,
            heartbeat_interval_ms: 30_000,
            heartbeat_timeout_ms: 5_000,
            reconnect_base_delay_ms: 1_000,
            reconnect_max_delay_ms: 30_000,
            max_reconnect_attempts: 5,
            request_timeout_ms: 30_000,
            request_retries: 1,
            endpoint: EndpointConfig::default(),
        }
    }
}

impl ClientConfig {
    /// Load a JSON config file. Missing fields take their defaults.
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        let config: Self = serde_json::from_str(&raw)
            .with_context(|| format!("Invalid config file {}", path.display()))?;
        config.validate()?;
        Ok(config)
    }

    /// Load `path` if given, else the default path if it exists, else the
    /// defaults; then apply environment overrides.
    pub fn resolve(path: Option<&Path>) -> Result<Self> {
        let base = match path {
            Some(path) => Self::load(path)?,
            None => {
                let default_path = default_config_path();
                if default_path.exists() {
                    Self::load(&default_path)?
                } else {
                    Self::default()
                }
            }
        };
        let config = base.with_env_overrides()?;
        config.validate()?;
        Ok(config)
    }

    /// Defaults with `ROUTEROS_*` environment overrides applied.
    pub fn from_env() -> Result<Self> {
        let config = Self::default().with_env_overrides()?;
        config.validate()?;
        Ok(config)
    }

    /// Apply `ROUTEROS_*` environment variables on top of `self`.
    pub fn with_env_overrides(self) -> Result<Self> {
        self.with_overrides(|key| std::env::var(key).ok())
    }

    fn with_overrides<F>(mut self, lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        fn parse<T: std::str::FromStr>(key: &str, value: &str) -> Result<T>
        where
            T::Err: std::error::Error + Send + Sync + 'static,
        {
            value
                .trim()
                .parse()
                .with_context(|| format!("Invalid value for {}: {}", key, value))
        }

        let numeric: [(&str, &mut u64); 6] = [
            ("ROUTEROS_CONNECT_TIMEOUT_MS", &mut self.connect_timeout_ms),
            ("ROUTEROS_HEARTBEAT_INTERVAL_MS", &mut self.heartbeat_interval_ms),
            ("ROUTEROS_HEARTBEAT_TIMEOUT_MS", &mut self.heartbeat_timeout_ms),
            ("ROUTEROS_RECONNECT_BASE_DELAY_MS", &mut self.reconnect_base_delay_ms),
            ("ROUTEROS_RECONNECT_MAX_DELAY_MS", &mut self.reconnect_max_delay_ms),
            ("ROUTEROS_REQUEST_TIMEOUT_MS", &mut self.request_timeout_ms),
        ];
        for (key, field) in numeric {
            if let Some(value) = lookup(key) {
                *field = parse(key, &value)?;
            }
        }

        if let Some(value) = lookup("ROUTEROS_MAX_RECONNECT_ATTEMPTS") {
            self.max_reconnect_attempts = parse("ROUTEROS_MAX_RECONNECT_ATTEMPTS", &value)?;
        }
        if let Some(value) = lookup("ROUTEROS_REQUEST_RETRIES") {
            self.request_retries = parse("ROUTEROS_REQUEST_RETRIES", &value)?;
        }
        if let Some(value) = lookup("ROUTEROS_ENVIRONMENT") {
            self.endpoint.environment = match value.trim().to_ascii_lowercase().as_str() {
                "production" | "prod" => Environment::Production,
                "development" | "dev" => Environment::Development,
                other => bail!("Invalid value for ROUTEROS_ENVIRONMENT: {}", other),
            };
        }
        if let Some(value) = lookup("ROUTEROS_SECURE") {
            self.endpoint.secure = matches!(value.trim(), "1" | "true" | "yes");
        }
        if let Some(value) = lookup("ROUTEROS_BASE_URL") {
            self.endpoint.base_url = Some(value.trim().to_string()).filter(|v| !v.is_empty());
        }

        Ok(self)
    }

    /// Reject settings that would stall or spin the client.
    pub fn validate(&self) -> Result<()> {
        let positive = [
            ("connect_timeout_ms", self.connect_timeout_ms),
            ("heartbeat_interval_ms", self.heartbeat_interval_ms),
            ("heartbeat_timeout_ms", self.heartbeat_timeout_ms),
            ("reconnect_base_delay_ms", self.reconnect_base_delay_ms),
            ("request_timeout_ms", self.request_timeout_ms),
        ];
        for (name, value) in positive {
            if value == 0 {
                bail!("{} must be greater than zero", name);
            }
        }
        if self.reconnect_max_delay_ms < self.reconnect_base_delay_ms {
            bail!(
                "reconnect_max_delay_ms ({}) is smaller than reconnect_base_delay_ms ({})",
                self.reconnect_max_delay_ms,
                self.reconnect_base_delay_ms
            );
        }
        Ok(())
    }

    pub fn connect_timeout(&self) -> Duration {
        millis(self.connect_timeout_ms)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        millis(self.heartbeat_interval_ms)
    }

    pub fn heartbeat_timeout(&self) -> Duration {
        millis(self.heartbeat_timeout_ms)
    }

    pub fn request_timeout(&self) -> Duration {
        millis(self.request_timeout_ms)
    }

    /// Delay before automatic reconnect attempt `attempt` (1-based):
    /// `base * 2^(attempt-1)`, capped at the configured maximum.
    pub fn reconnect_delay(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1);
        let multiplier = 1u64.checked_shl(exponent).unwrap_or(u64::MAX);
        let delay = self.reconnect_base_delay_ms.saturating_mul(multiplier);
        millis(delay.min(self.reconnect_max_delay_ms.max(self.reconnect_base_delay_ms)))
    }
}

// Zero-length timers would spin; clamp to 1ms.
fn millis(ms: u64) -> Duration {
    Duration::from_millis(ms.max(1))
}

/// Resolve the default config file path.
///
/// Resolution order:
/// 1. `$ROUTEROS_LINK_CONFIG`
/// 2. `<config_dir>/routeros-link/config.json` (XDG on Linux, Library on macOS)
/// 3. `/tmp/routeros-link/config.json`
pub fn default_config_path() -> PathBuf {
    if let Ok(path) = std::env::var("ROUTEROS_LINK_CONFIG") {
        return PathBuf::from(path);
    }

    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("/tmp"))
        .join("routeros-link")
        .join("config.json")
}
