//! Configuration parsing and management

use serde::de::IgnoredAny;
use serde::{Deserialize, Deserializer, Serialize};
use std::path::Path;

use crate::error::{Error, Result};

/// Environment variable holding the bypass password.
pub const BYPASS_PASSWORD_ENV: &str = "BYPASS_PASSWORD";

/// Default config file location used by the CLI.
pub const DEFAULT_CONFIG_FILE: &str = "/etc/pc-proxy/config.json";

pub const DEFAULT_TLS_CIPHERS: &str = "TLS_ECDHE_ECDSA_WITH_AES_128_GCM_SHA256:TLS_ECDHE_ECDSA_WITH_AES_256_GCM_SHA384:TLS_ECDHE_RSA_WITH_AES_128_GCM_SHA256:TLS_ECDHE_RSA_WITH_AES_256_GCM_SHA384";

/// Main configuration structure
#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
pub struct Config {
    /// Ordered access rules, first match wins
    #[serde(default)]
    pub rules: Vec<RuleConfig>,

    /// HTTPS listener settings
    #[serde(default)]
    pub tls: TlsConfig,

    /// Listen addresses (only read at startup)
    #[serde(default)]
    pub listen: ListenConfig,

    /// Logging settings
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// A single rule as written in the config file.
///
/// Every field is optional; missing or invalid values are repaired with defaults
/// when the rule set is compiled (see [`crate::filter::Rule::from_config`]).
/// A field holding a value of the wrong type reads as missing.
#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
pub struct RuleConfig {
    /// "allow" or "block"
    #[serde(default, deserialize_with = "lenient")]
    pub access: Option<String>,

    /// "host", "path" or "url"
    #[serde(default, rename = "type", deserialize_with = "lenient")]
    pub rule_type: Option<String>,

    /// Regular expression matched against the field selected by `type`
    #[serde(default, deserialize_with = "lenient")]
    pub pattern: Option<String>,

    /// Allow a blocked request through after the bypass password is supplied
    #[serde(
        default,
        deserialize_with = "lenient",
        rename = "passwordBypass",
        alias = "password_bypass",
        skip_serializing_if = "Option::is_none"
    )]
    pub password_bypass: Option<bool>,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum Lenient<T> {
    Valid(T),
    Invalid(IgnoredAny),
}

fn lenient<'de, D, T>(deserializer: D) -> std::result::Result<Option<T>, D::Error>
where
    D: Deserializer<'de>,
    T: Deserialize<'de>,
{
    match Lenient::<T>::deserialize(deserializer)? {
        Lenient::Valid(value) => Ok(Some(value)),
        Lenient::Invalid(_) => {
            tracing::warn!(
                expected = std::any::type_name::<T>(),
                "Ignoring rule field with a value of the wrong type"
            );
            Ok(None)
        }
    }
}

/// TLS configuration for the HTTPS listener
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct TlsConfig {
    #[serde(default)]
    pub enabled: bool,

    /// Path to PEM certificate chain
    #[serde(default)]
    pub cert: Option<String>,

    /// Path to PEM private key
    #[serde(default)]
    pub key: Option<String>,

    /// Colon-separated cipher suite names
    #[serde(default = "default_ciphers")]
    pub ciphers: String,
}

impl Default for TlsConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            cert: None,
            key: None,
            ciphers: default_ciphers(),
        }
    }
}

fn default_ciphers() -> String {
    DEFAULT_TLS_CIPHERS.to_string()
}

/// Listener addresses
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct ListenConfig {
    #[serde(default = "default_listen_host")]
    pub host: String,

    #[serde(default = "default_port")]
    pub port: u16,

    #[serde(default = "default_tls_port", rename = "tlsPort", alias = "tls_port")]
    pub tls_port: u16,
}

impl Default for ListenConfig {
    fn default() -> Self {
        Self {
            host: default_listen_host(),
            port: default_port(),
            tls_port: default_tls_port(),
        }
    }
}

impl ListenConfig {
    /// `host:port` for the plain HTTP listener
    pub fn http_address(&self) -> String {
        join_host_port(&self.host, self.port)
    }

    /// `host:tlsPort` for the HTTPS listener
    pub fn https_address(&self) -> String {
        join_host_port(&self.host, self.tls_port)
    }
}

fn join_host_port(host: &str, port: u16) -> String {
    if host.contains(':') && !host.starts_with('[') {
        format!("[{}]:{}", host, port)
    } else {
        format!("{}:{}", host, port)
    }
}

fn default_listen_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    80
}

fn default_tls_port() -> u16 {
    443
}

/// Log output format
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LogEncoding {
    #[default]
    Console,
    Json,
}

/// Logging configuration
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct LoggingConfig {
    /// Log level or filter directive (error, warn, info, debug, trace)
    #[serde(default = "default_log_level")]
    pub level: String,

    #[serde(default)]
    pub encoding: LogEncoding,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            encoding: LogEncoding::Console,
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Config {
    /// Load configuration from a `.json` or `.toml` file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| {
            Error::config(format!(
                "Failed to read config file '{}': {}",
                path.display(),
                e
            ))
        })?;

        match path.extension().and_then(|e| e.to_str()) {
            Some("json") => Self::from_json(&content),
            Some("toml") => Self::from_toml(&content),
            other => Err(Error::config(format!(
                "unsupported configuration file type ({}); must be one of: '.json' or '.toml'",
                other.map(|e| format!(".{}", e)).unwrap_or_default()
            ))),
        }
    }

    /// Parse configuration from a JSON string
    pub fn from_json(content: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(content)
            .map_err(|e| Error::config(format!("Invalid JSON: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Parse configuration from a TOML string
    pub fn from_toml(content: &str) -> Result<Self> {
        let config: Self =
            toml::from_str(content).map_err(|e| Error::config(format!("Invalid TOML: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        if self.tls.enabled {
            if self.tls.cert.as_deref().unwrap_or("").is_empty() {
                return Err(Error::config("tls.enabled requires `tls.cert`"));
            }
            if self.tls.key.as_deref().unwrap_or("").is_empty() {
                return Err(Error::config("tls.enabled requires `tls.key`"));
            }
        }
        Ok(())
    }

    /// Create a configuration listening on the given host and port with no TLS
    pub fn minimal(host: &str, port: u16) -> Self {
        Self {
            listen: ListenConfig {
                host: host.to_string(),
                port,
                tls_port: default_tls_port(),
            },
            ..Self::default()
        }
    }
}
