//! Configuration management

use std::{fmt, path::Path, path::PathBuf, time::Duration};

use figment::{
    Figment,
    providers::{Env, Format, Yaml},
};
use serde::{Deserialize, Serialize};

use crate::{Error, Result};

/// Environment variable prefix (`RUNE_GATEWAY_REST_PORT=3010`)
pub const ENV_PREFIX: &str = "RUNE_GATEWAY_";

/// Default Content-Security-Policy attached to every response
pub const DEFAULT_CSP: &str = "default-src 'self'; font-src 'self'; img-src 'self' data:; frame-src 'self'; style-src 'self' 'unsafe-inline'; script-src 'self' 'unsafe-inline';";

/// Listener protocol
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    /// Plain HTTP
    Http,
    /// HTTP over TLS with a self-managed certificate authority
    #[default]
    Https,
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Http => f.write_str("http"),
            Self::Https => f.write_str("https"),
        }
    }
}

impl std::str::FromStr for Protocol {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "http" => Ok(Self::Http),
            "https" => Ok(Self::Https),
            other => Err(Error::Config(format!(
                "`rest-protocol` must be http or https, got '{other}'"
            ))),
        }
    }
}

/// Gateway configuration, loaded once at startup and immutable afterwards
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct GatewayConfig {
    /// Port to listen on. Absence disables the gateway.
    pub rest_port: Option<u16>,
    /// Host to bind to
    pub rest_host: String,
    /// `http` or `https`
    pub rest_protocol: Protocol,
    /// Directory holding the generated certificate set
    pub rest_certs: PathBuf,
    /// Allowed CORS origins (regular expressions, `*` for any)
    pub rest_cors_origins: Vec<String>,
    /// Content-Security-Policy header value
    pub rest_csp: String,
    /// Path of the backend daemon's JSON-RPC socket
    pub rpc_socket: PathBuf,
    /// Idle period of the notification drain loop
    #[serde(with = "humantime_serde")]
    pub drain_interval: Duration,
    /// Capacity of the notification queue
    pub queue_capacity: usize,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            rest_port: None,
            rest_host: "127.0.0.1".to_string(),
            rest_protocol: Protocol::Https,
            rest_certs: PathBuf::from("certs"),
            rest_cors_origins: vec!["*".to_string()],
            rest_csp: DEFAULT_CSP.to_string(),
            rpc_socket: PathBuf::from("lightning-rpc"),
            drain_interval: Duration::from_secs(1),
            queue_capacity: 1024,
        }
    }
}

impl GatewayConfig {
    /// Load configuration from an optional YAML file and the environment
    ///
    /// # Errors
    ///
    /// Returns an error if the config file does not exist or cannot be parsed.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut figment = Figment::new();

        if let Some(p) = path {
            if !p.exists() {
                return Err(Error::Config(format!(
                    "Config file not found: {}",
                    p.display()
                )));
            }
            figment = figment.merge(Yaml::file(p));
        }

        // RUNE_GATEWAY_REST_PORT -> rest-port
        figment = figment.merge(
            Env::prefixed(ENV_PREFIX).map(|key| key.as_str().replace('_', "-").into()),
        );

        figment
            .extract()
            .map_err(|e| Error::Config(e.to_string()))
    }

    /// Check that the gateway can start and return the configured port.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] when `rest-port` is absent or a value is
    /// unusable. The caller is expected to stay inert rather than fail.
    pub fn validate(&self) -> Result<u16> {
        let port = self
            .rest_port
            .ok_or_else(|| Error::Config("`rest-port` option is not configured".to_string()))?;

        if self.rest_host.trim().is_empty() {
            return Err(Error::Config("`rest-host` must not be empty".to_string()));
        }
        if self.rest_cors_origins.is_empty() {
            return Err(Error::Config(
                "`rest-cors-origins` must contain at least one pattern".to_string(),
            ));
        }
        if self.queue_capacity == 0 {
            return Err(Error::Config("`queue-capacity` must be positive".to_string()));
        }

        Ok(port)
    }

    /// URL the gateway is reachable at, as announced in the startup banner
    #[must_use]
    pub fn base_url(&self) -> String {
        let port = self.rest_port.unwrap_or_default();
        format!("{}://{}:{}", self.rest_protocol, self.rest_host, port)
    }
}

/// Custom humantime serde module for Duration
pub mod humantime_serde {
    use std::time::Duration;

    use serde::{self, Deserialize, Deserializer, Serializer};

    /// Serialize Duration to human-readable string (e.g., "30s", "250ms")
    ///
    /// # Errors
    ///
    /// Returns a serialization error if the serializer fails.
    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        if duration.subsec_millis() == 0 {
            serializer.serialize_str(&format!("{}s", duration.as_secs()))
        } else {
            serializer.serialize_str(&format!("{}ms", duration.as_millis()))
        }
    }

    /// Deserialize human-readable duration string (e.g., "30s", "5m", "100ms")
    ///
    /// # Errors
    ///
    /// Returns a deserialization error if the string cannot be parsed as a duration.
    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;

        if let Some(ms) = s.strip_suffix("ms") {
            ms.parse::<u64>()
                .map(Duration::from_millis)
                .map_err(serde::de::Error::custom)
        } else if let Some(secs) = s.strip_suffix('s') {
            secs.parse::<u64>()
                .map(Duration::from_secs)
                .map_err(serde::de::Error::custom)
        } else if let Some(mins) = s.strip_suffix('m') {
            mins.parse::<u64>()
                .map(|m| Duration::from_secs(m * 60))
                .map_err(serde::de::Error::custom)
        } else {
            // Assume seconds
            s.parse::<u64>()
                .map(Duration::from_secs)
                .map_err(serde::de::Error::custom)
        }
    }
}
