use secrecy::{ExposeSecret, Secret};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::env;
use std::time::Duration;

pub const DEFAULT_REST_BASE: &str = "https://api.delta.exchange";
pub const DEFAULT_WS_URL: &str = "wss://socket.delta.exchange";

/// Connection settings shared by the REST client and the WebSocket session.
///
/// Credentials are wrapped in [`Secret`] and never appear in `Debug` or
/// serialized output.
#[derive(Debug, Clone)]
pub struct DeltaConfig {
    pub api_key: Secret<String>,
    pub api_secret: Secret<String>,
    pub base_url: String,
    pub ws_url: String,
    /// Fixed REST request timeout.
    pub timeout_seconds: u64,
    /// Interval between outbound `ping` messages while the socket is open.
    pub heartbeat_interval: Duration,
    /// Fixed delay before each reconnect attempt.
    pub reconnect_delay: Duration,
    /// Reconnect attempts before the session parks itself in `Failed`.
    pub max_reconnect_attempts: u32,
}

// Custom Serialize implementation - never expose secrets in serialization
impl Serialize for DeltaConfig {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        use serde::ser::SerializeStruct;
        let mut state = serializer.serialize_struct("DeltaConfig", 4)?;
        state.serialize_field("api_key", "[REDACTED]")?;
        state.serialize_field("api_secret", "[REDACTED]")?;
        state.serialize_field("base_url", &self.base_url)?;
        state.serialize_field("ws_url", &self.ws_url)?;
        state.end()
    }
}

impl<'de> Deserialize<'de> for DeltaConfig {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        #[derive(Deserialize)]
        struct DeltaConfigHelper {
            api_key: String,
            api_secret: String,
            base_url: Option<String>,
            ws_url: Option<String>,
        }

        let helper = DeltaConfigHelper::deserialize(deserializer)?;
        let mut config = Self::new(helper.api_key, helper.api_secret);
        if let Some(base_url) = helper.base_url {
            config.base_url = base_url;
        }
        if let Some(ws_url) = helper.ws_url {
            config.ws_url = ws_url;
        }
        Ok(config)
    }
}

impl DeltaConfig {
    /// Create a new configuration with API credentials and default endpoints.
    #[must_use]
    pub fn new(api_key: String, api_secret: String) -> Self {
        Self {
            api_key: Secret::new(api_key),
            api_secret: Secret::new(api_secret),
            base_url: DEFAULT_REST_BASE.to_string(),
            ws_url: DEFAULT_WS_URL.to_string(),
            timeout_seconds: 10,
            heartbeat_interval: Duration::from_secs(30),
            reconnect_delay: Duration::from_secs(5),
            max_reconnect_attempts: 5,
        }
    }

    /// Create configuration from environment variables.
    ///
    /// Expected environment variables:
    /// - `DELTA_API_KEY`
    /// - `DELTA_API_SECRET`
    /// - `DELTA_REST_BASE` (optional)
    /// - `DELTA_WS_URL` (optional)
    pub fn from_env() -> Result<Self, ConfigError> {
        let api_key = env::var("DELTA_API_KEY")
            .map_err(|_| ConfigError::MissingEnvironmentVariable("DELTA_API_KEY".to_string()))?;
        let api_secret = env::var("DELTA_API_SECRET")
            .map_err(|_| ConfigError::MissingEnvironmentVariable("DELTA_API_SECRET".to_string()))?;

        let mut config = Self::new(api_key, api_secret);
        if let Ok(base_url) = env::var("DELTA_REST_BASE") {
            config.base_url = base_url;
        }
        if let Ok(ws_url) = env::var("DELTA_WS_URL") {
            config.ws_url = ws_url;
        }
        Ok(config)
    }

    /// Create configuration from a .env file and environment variables.
    ///
    /// Loads `.env` from the working directory if present, then reads the
    /// standard environment variable names.
    ///
    /// **Security Warning**: Never commit .env files to version control!
    #[cfg(feature = "env-file")]
    pub fn from_env_file() -> Result<Self, ConfigError> {
        Self::from_env_file_with_path(".env")
    }

    /// Create configuration from a specific .env file path.
    #[cfg(feature = "env-file")]
    pub fn from_env_file_with_path(env_file_path: &str) -> Result<Self, ConfigError> {
        match dotenv::from_path(env_file_path) {
            Ok(_) => {}
            Err(dotenv::Error::Io(io_err)) if io_err.kind() == std::io::ErrorKind::NotFound => {
                // .env file doesn't exist, that's okay - continue with system env vars
            }
            Err(e) => {
                return Err(ConfigError::InvalidConfiguration(format!(
                    "Failed to load .env file '{}': {}",
                    env_file_path, e
                )));
            }
        }

        Self::from_env()
    }

    /// Create configuration for public endpoints only (market data).
    #[must_use]
    pub fn read_only() -> Self {
        Self::new(String::new(), String::new())
    }

    /// Check if this configuration has credentials for authenticated operations.
    #[must_use]
    pub fn has_credentials(&self) -> bool {
        !self.api_key.expose_secret().is_empty() && !self.api_secret.expose_secret().is_empty()
    }

    /// Set a custom REST base URL.
    #[must_use]
    pub fn base_url(mut self, base_url: String) -> Self {
        self.base_url = base_url;
        self
    }

    /// Set a custom WebSocket URL.
    #[must_use]
    pub fn ws_url(mut self, ws_url: String) -> Self {
        self.ws_url = ws_url;
        self
    }

    #[must_use]
    pub const fn with_timeout(mut self, timeout_seconds: u64) -> Self {
        self.timeout_seconds = timeout_seconds;
        self
    }

    #[must_use]
    pub const fn with_heartbeat_interval(mut self, interval: Duration) -> Self {
        self.heartbeat_interval = interval;
        self
    }

    #[must_use]
    pub const fn with_reconnect_delay(mut self, delay: Duration) -> Self {
        self.reconnect_delay = delay;
        self
    }

    #[must_use]
    pub const fn with_max_reconnect_attempts(mut self, attempts: u32) -> Self {
        self.max_reconnect_attempts = attempts;
        self
    }

    /// Get API key (use carefully - exposes secret)
    pub fn api_key(&self) -> &str {
        self.api_key.expose_secret()
    }

    /// Get API secret (use carefully - exposes secret)
    pub fn api_secret(&self) -> &str {
        self.api_secret.expose_secret()
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing environment variable: {0}")]
    MissingEnvironmentVariable(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfiguration(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = DeltaConfig::new("key".to_string(), "secret".to_string());
        assert_eq!(config.base_url, DEFAULT_REST_BASE);
        assert_eq!(config.ws_url, DEFAULT_WS_URL);
        assert_eq!(config.timeout_seconds, 10);
        assert_eq!(config.max_reconnect_attempts, 5);
        assert!(config.has_credentials());
    }

    #[test]
    fn test_read_only_has_no_credentials() {
        assert!(!DeltaConfig::read_only().has_credentials());
    }

    #[test]
    fn test_serialization_redacts_secrets() {
        let config = DeltaConfig::new("real_key".to_string(), "real_secret".to_string());
        let json = serde_json::to_string(&config).unwrap();
        assert!(!json.contains("real_key"));
        assert!(!json.contains("real_secret"));
        assert!(json.contains("[REDACTED]"));
    }

    #[test]
    fn test_debug_redacts_secrets() {
        let config = DeltaConfig::new("real_key".to_string(), "real_secret".to_string());
        let debug = format!("{:?}", config);
        assert!(!debug.contains("real_key"));
        assert!(!debug.contains("real_secret"));
    }
}
