//! Client configuration.
//!
//! Resolution order (later wins):
//!
//! 1. Built-in defaults (`127.0.0.1:8888`, 3s connect, 5s calls, reconnect
//!    every 5s up to 5 times)
//! 2. JSON file at `$STORELINK_CONFIG`, else `<config dir>/storelink/client.json`
//!    if it exists
//! 3. `STORELINK_*` environment variables
//!
//! [`ClientConfig`] is the on-disk form; [`ClientConfig::client_options`]
//! resolves it into the [`ClientOptions`] the transport runs with.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::transport::{ClientOptions, Endpoint, ReconnectPolicy};

/// Environment variable naming an explicit config file.
pub const CONFIG_PATH_ENV: &str = "STORELINK_CONFIG";

/// Raw configuration as read from JSON. Every field has a default.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    pub host: String,
    pub port: u16,
    /// Unix socket path. Takes precedence over `host`/`port` when set.
    pub socket_path: Option<PathBuf>,
    pub connect_timeout_ms: u64,
    pub call_timeout_ms: u64,
    pub disconnect_grace_ms: u64,
    pub reconnect: ReconnectConfig,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReconnectConfig {
    pub interval_ms: u64,
    pub max_attempts: u32,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 8888,
            socket_path: None,
            connect_timeout_ms: 3000,
            call_timeout_ms: 5000,
            disconnect_grace_ms: 2000,
            reconnect: ReconnectConfig::default(),
        }
    }
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            interval_ms: 5000,
            max_attempts: 5,
        }
    }
}

/// Resolve the default config file location.
///
/// `~/.config/storelink/client.json` on Linux,
/// `~/Library/Application Support/storelink/client.json` on macOS.
pub fn default_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|dir| dir.join("storelink").join("client.json"))
}

impl ClientConfig {
    /// Load defaults, then the config file if present, then the environment.
    ///
    /// # Errors
    ///
    /// Returns an error if a config file exists but cannot be parsed, or if
    /// an environment variable holds an unparsable number.
    pub fn load() -> Result<Self> {
        let explicit = std::env::var_os(CONFIG_PATH_ENV).map(PathBuf::from);

        let mut config = match explicit.or_else(default_config_path) {
            Some(path) if path.exists() => Self::from_file(&path)?,
            _ => Self::default(),
        };

        config.apply_env(|key| std::env::var(key).ok())?;
        Ok(config)
    }

    /// Read a JSON config file. Missing fields take their defaults.
    pub fn from_file(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        let config = serde_json::from_str(&text)
            .with_context(|| format!("Invalid config file {}", path.display()))?;
        tracing::info!("Loaded client config from {}", path.display());
        Ok(config)
    }

    /// Apply `STORELINK_*` overrides using `lookup` to read variables.
    pub fn apply_env(&mut self, lookup: impl Fn(&str) -> Option<String>) -> Result<()> {
        if let Some(host) = lookup("STORELINK_HOST") {
            self.host = host;
        }
        if let Some(path) = lookup("STORELINK_SOCKET") {
            self.socket_path = Some(PathBuf::from(path));
        }
        override_num(&lookup, "STORELINK_PORT", &mut self.port)?;
        override_num(&lookup, "STORELINK_CONNECT_TIMEOUT_MS", &mut self.connect_timeout_ms)?;
        override_num(&lookup, "STORELINK_CALL_TIMEOUT_MS", &mut self.call_timeout_ms)?;
        override_num(
            &lookup,
            "STORELINK_RECONNECT_INTERVAL_MS",
            &mut self.reconnect.interval_ms,
        )?;
        override_num(
            &lookup,
            "STORELINK_RECONNECT_MAX_ATTEMPTS",
            &mut self.reconnect.max_attempts,
        )?;
        Ok(())
    }

    pub fn endpoint(&self) -> Endpoint {
        match &self.socket_path {
            #[cfg(unix)]
            Some(path) => Endpoint::Unix(path.clone()),
            _ => Endpoint::tcp(self.host.clone(), self.port),
        }
    }

    /// Resolve into the settings the transport runs with.
    pub fn client_options(&self) -> ClientOptions {
        ClientOptions {
            endpoint: self.endpoint(),
            connect_timeout: Duration::from_millis(self.connect_timeout_ms),
            call_timeout: Duration::from_millis(self.call_timeout_ms),
            disconnect_grace: Duration::from_millis(self.disconnect_grace_ms),
            reconnect: ReconnectPolicy {
                interval: Duration::from_millis(self.reconnect.interval_ms),
                max_attempts: self.reconnect.max_attempts,
            },
        }
    }
}

fn override_num<T>(lookup: &impl Fn(&str) -> Option<String>, key: &str, slot: &mut T) -> Result<()>
where
    T: std::str::FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    if let Some(raw) = lookup(key) {
        *slot = raw
            .trim()
            .parse()
            .with_context(|| format!("Invalid value for {}: {}", key, raw))?;
    }
    Ok(())
}
