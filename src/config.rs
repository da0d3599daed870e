//! Server configuration from environment variables

use crate::cluster::{TlsPolicy, DEFAULT_PROBE_TIMEOUT};
use std::time::Duration;
use thiserror::Error;

/// Default listen port for the HTTP API
pub const DEFAULT_PORT: u16 = 8081;

pub const ENV_PORT: &str = "KDI_K8S_API_PORT";
pub const ENV_INSECURE_SKIP_TLS_VERIFY: &str = "KDI_INSECURE_SKIP_TLS_VERIFY";
pub const ENV_PROBE_TIMEOUT_SECS: &str = "KDI_CLUSTER_PROBE_TIMEOUT_SECS";
pub const ENV_BLUE_GREEN_VERIFY: &str = "KDI_BLUE_GREEN_VERIFY";
pub const ENV_CREDENTIAL_BROKER_URL: &str = "KDI_CREDENTIAL_BROKER_URL";

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("{name} must be a port number, got {value:?}")]
    InvalidPort { name: &'static str, value: String },

    #[error("{name} must be true/false/1/0, got {value:?}")]
    InvalidBool { name: &'static str, value: String },

    #[error("{name} must be a positive number of seconds, got {value:?}")]
    InvalidDuration { name: &'static str, value: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerConfig {
    pub port: u16,
    pub tls_policy: TlsPolicy,
    pub probe_timeout: Duration,
    /// Wait for green to become available before switching traffic
    pub blue_green_verify: bool,
    /// Send managed clusters to this broker instead of EKS
    pub credential_broker_url: Option<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: DEFAULT_PORT,
            tls_policy: TlsPolicy::Verify,
            probe_timeout: DEFAULT_PROBE_TIMEOUT,
            blue_green_verify: false,
            credential_broker_url: None,
        }
    }
}

impl ServerConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Build from any variable source; unset and empty values take defaults
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |name: &str| lookup(name).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());
        let defaults = Self::default();

        let port = match get(ENV_PORT) {
            Some(value) => value.parse::<u16>().map_err(|_| ConfigError::InvalidPort {
                name: ENV_PORT,
                value,
            })?,
            None => defaults.port,
        };

        let skip_tls_verify = match get(ENV_INSECURE_SKIP_TLS_VERIFY) {
            Some(value) => parse_bool(ENV_INSECURE_SKIP_TLS_VERIFY, value)?,
            None => false,
        };
        let tls_policy = if skip_tls_verify {
            TlsPolicy::InsecureSkipVerify
        } else {
            TlsPolicy::Verify
        };

        let probe_timeout = match get(ENV_PROBE_TIMEOUT_SECS) {
            Some(value) => match value.parse::<u64>() {
                Ok(secs) if secs > 0 => Duration::from_secs(secs),
                _ => {
                    return Err(ConfigError::InvalidDuration {
                        name: ENV_PROBE_TIMEOUT_SECS,
                        value,
                    })
                }
            },
            None => defaults.probe_timeout,
        };

        let blue_green_verify = match get(ENV_BLUE_GREEN_VERIFY) {
            Some(value) => parse_bool(ENV_BLUE_GREEN_VERIFY, value)?,
            None => defaults.blue_green_verify,
        };

        Ok(Self {
            port,
            tls_policy,
            probe_timeout,
            blue_green_verify,
            credential_broker_url: get(ENV_CREDENTIAL_BROKER_URL),
        })
    }
}

fn parse_bool(name: &'static str, value: String) -> Result<bool, ConfigError> {
    match value.to_ascii_lowercase().as_str() {
        "true" | "1" => Ok(true),
        "false" | "0" => Ok(false),
        _ => Err(ConfigError::InvalidBool { name, value }),
    }
}
