//! # Configuration Management
//!
//! Loads the bridge configuration from multiple sources:
//! - Built-in defaults (the `Default` impl below)
//! - An optional TOML file (`config.toml`)
//! - Environment variables with the `APP_` prefix
//!
//! ## Configuration Priority (highest to lowest):
//! 1. `HOST` / `PORT` (deployment platforms set these)
//! 2. Environment variables (`APP_SERVER__PORT`, `APP_BRIDGE__CALLBACK_URL`, ...)
//! 3. Configuration file (config.toml)
//! 4. Default values
//!
//! Nested keys use a double underscore so that field names containing a single
//! underscore (`callback_url`) survive the mapping.

use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::env;
use std::time::Duration;

/// Main application configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub bridge: BridgeConfig,
}

/// Where the HTTP/WebSocket listener binds.
///
/// - `host = "127.0.0.1"`: local connections only (development)
/// - `host = "0.0.0.0"`: all interfaces (production)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

/// Routing and delivery settings for the bridge core.
///
/// ## Fields:
/// - `shared_secret`: when set, both WebSocket paths require `?secret=<value>`
/// - `backend_ws_url`: persistent backend socket (`ws://` or `wss://`)
/// - `callback_url`: HTTP fallback used while the persistent socket is down
/// - `callback_timeout_ms`: upper bound for one callback request
/// - `reconnect_delay_ms`: fixed pause before the supervisor redials
/// - `session_idle_timeout_secs`: sessions without traffic for this long are swept
/// - `sweep_interval_secs`: how often the idle sweep runs
/// - `heartbeat_interval_secs` / `client_timeout_secs`: WebSocket ping cadence
///   and the silence after which a connection is dropped
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BridgeConfig {
    #[serde(default)]
    pub shared_secret: Option<String>,
    #[serde(default)]
    pub backend_ws_url: Option<String>,
    #[serde(default)]
    pub callback_url: Option<String>,
    pub callback_timeout_ms: u64,
    pub reconnect_delay_ms: u64,
    pub session_idle_timeout_secs: u64,
    pub sweep_interval_secs: u64,
    pub heartbeat_interval_secs: u64,
    pub client_timeout_secs: u64,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            server: ServerConfig {
                host: "127.0.0.1".to_string(),
                port: 8080,
            },
            bridge: BridgeConfig::default(),
        }
    }
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            shared_secret: None,
            backend_ws_url: None,
            callback_url: None,
            callback_timeout_ms: 5_000,
            reconnect_delay_ms: 3_000,
            session_idle_timeout_secs: 300,
            sweep_interval_secs: 30,
            heartbeat_interval_secs: 30,
            client_timeout_secs: 60,
        }
    }
}

impl AppConfig {
    /// Load configuration from defaults, `config.toml` and the environment.
    ///
    /// ## Environment Variable Examples:
    /// - `APP_SERVER__HOST=0.0.0.0`
    /// - `APP_BRIDGE__BACKEND_WS_URL=wss://automation.example.com/stream`
    /// - `APP_BRIDGE__CALLBACK_URL=https://automation.example.com/hook`
    /// - `PORT=3000`
    pub fn load() -> Result<Self> {
        let mut settings = config::Config::builder()
            .add_source(config::Config::try_from(&AppConfig::default())?)
            .add_source(config::File::with_name("config").required(false))
            .add_source(
                config::Environment::with_prefix("APP")
                    .prefix_separator("_")
                    .separator("__"),
            );

        if let Ok(host) = env::var("HOST") {
            settings = settings.set_override("server.host", host)?;
        }

        if let Ok(port) = env::var("PORT") {
            settings = settings.set_override("server.port", port)?;
        }

        let config = settings.build()?.try_deserialize()?;
        Ok(config)
    }

    /// Validate that the configuration values make sense.
    ///
    /// Catching these at startup turns a silent routing failure (for example a
    /// callback URL with a `ws://` scheme) into a clear error message.
    pub fn validate(&self) -> Result<()> {
        if self.server.port == 0 {
            return Err(anyhow::anyhow!("Server port cannot be 0"));
        }

        let bridge = &self.bridge;

        if let Some(secret) = &bridge.shared_secret {
            if secret.is_empty() {
                return Err(anyhow::anyhow!("Shared secret cannot be empty when set"));
            }
        }

        if let Some(url) = &bridge.backend_ws_url {
            if !(url.starts_with("ws://") || url.starts_with("wss://")) {
                return Err(anyhow::anyhow!(
                    "Backend socket URL must use ws:// or wss://, got '{}'",
                    url
                ));
            }
        }

        if let Some(url) = &bridge.callback_url {
            if !(url.starts_with("http://") || url.starts_with("https://")) {
                return Err(anyhow::anyhow!(
                    "Callback URL must use http:// or https://, got '{}'",
                    url
                ));
            }
        }

        if bridge.callback_timeout_ms == 0 {
            return Err(anyhow::anyhow!("Callback timeout must be greater than 0"));
        }

        if bridge.reconnect_delay_ms == 0 {
            return Err(anyhow::anyhow!("Reconnect delay must be greater than 0"));
        }

        if bridge.session_idle_timeout_secs == 0 || bridge.sweep_interval_secs == 0 {
            return Err(anyhow::anyhow!("Session sweep settings must be greater than 0"));
        }

        if bridge.heartbeat_interval_secs == 0
            || bridge.client_timeout_secs <= bridge.heartbeat_interval_secs
        {
            return Err(anyhow::anyhow!(
                "Client timeout must be greater than the heartbeat interval"
            ));
        }

        Ok(())
    }
}

impl BridgeConfig {
    pub fn callback_timeout(&self) -> Duration {
        Duration::from_millis(self.callback_timeout_ms)
    }

    pub fn reconnect_delay(&self) -> Duration {
        Duration::from_millis(self.reconnect_delay_ms)
    }

    pub fn session_idle_timeout(&self) -> Duration {
        Duration::from_secs(self.session_idle_timeout_secs)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval_secs)
    }

    pub fn client_timeout(&self) -> Duration {
        Duration::from_secs(self.client_timeout_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = AppConfig::default();
        assert_eq!(config.server.host, "127.0.0.1");
        assert_eq!(config.server.port, 8080);
        assert!(config.bridge.backend_ws_url.is_none());
        assert_eq!(config.bridge.callback_timeout(), Duration::from_secs(5));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_validation() {
        let mut config = AppConfig::default();
        config.server.port = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_url_scheme_validation() {
        let mut config = AppConfig::default();
        config.bridge.backend_ws_url = Some("http://backend/stream".to_string());
        assert!(config.validate().is_err());

        config.bridge.backend_ws_url = Some("wss://backend/stream".to_string());
        config.bridge.callback_url = Some("ws://backend/hook".to_string());
        assert!(config.validate().is_err());

        config.bridge.callback_url = Some("https://backend/hook".to_string());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_empty_secret_rejected() {
        let mut config = AppConfig::default();
        config.bridge.shared_secret = Some(String::new());
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_heartbeat_must_be_shorter_than_timeout() {
        let mut config = AppConfig::default();
        config.bridge.client_timeout_secs = config.bridge.heartbeat_interval_secs;
        assert!(config.validate().is_err());
    }
}
