//! Runtime configuration read from the environment

use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;
use tracing::{info, warn};
use url::Url;

use crate::handlers::k8s::RetryPolicy;

pub const DEFAULT_LISTEN_PORT: u16 = 8080;
pub const DEFAULT_HEALTH_PORT: u16 = 8081;
pub const DEFAULT_TLS_CERT_PATH: &str = "/etc/dbaas/certs/tls.crt";
pub const DEFAULT_TLS_KEY_PATH: &str = "/etc/dbaas/certs/tls.key";
pub const DEFAULT_VERSION_SERVICE_URL: &str = "https://check.percona.com";
pub const DEFAULT_SYSTEM_NAMESPACE: &str = "everest-system";
pub const DEFAULT_RBAC_CONFIGMAP: &str = "everest-rbac";
pub const DEFAULT_USER_HEADER: &str = "x-remote-user";
pub const DEFAULT_RETRY_INTERVAL_SECS: u64 = 5;
pub const DEFAULT_RETRY_MAX_ATTEMPTS: u32 = 5;
pub const DEFAULT_POLICY_RELOAD_SECS: u64 = 30;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("invalid value '{value}' for {var}: {reason}")]
    Invalid {
        var: &'static str,
        value: String,
        reason: String,
    },
}

#[derive(Clone, Debug)]
pub struct Config {
    pub listen_port: u16,
    pub health_port: u16,
    pub tls_cert_path: PathBuf,
    pub tls_key_path: PathBuf,
    pub version_service_url: Url,
    /// Namespace holding the RBAC policy ConfigMap
    pub system_namespace: String,
    pub rbac_configmap: String,
    /// How often the RBAC ConfigMap is read again
    pub policy_reload_interval: Duration,
    /// Header the authenticating proxy puts the user name in
    pub user_header: String,
    pub retry_interval: Duration,
    pub retry_max_attempts: u32,
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|var| std::env::var(var).ok())
    }

    /// Build the configuration from an arbitrary variable source.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let string = |var: &'static str, default: &str| {
            lookup(var).filter(|v| !v.is_empty()).unwrap_or_else(|| {
                info!(var, default, "Not set, using default");
                default.to_string()
            })
        };
        let parsed = |var: &'static str, default: &str| -> Result<_, ConfigError> {
            let value = string(var, default);
            value.parse::<u64>().map_err(|e| ConfigError::Invalid {
                var,
                value,
                reason: e.to_string(),
            })
        };
        let port = |var: &'static str, default: u16| -> Result<u16, ConfigError> {
            let value = parsed(var, &default.to_string())?;
            u16::try_from(value).map_err(|e| ConfigError::Invalid {
                var,
                value: value.to_string(),
                reason: e.to_string(),
            })
        };

        let raw_url = string("VERSION_SERVICE_URL", DEFAULT_VERSION_SERVICE_URL);
        let version_service_url = Url::parse(&raw_url).map_err(|e| ConfigError::Invalid {
            var: "VERSION_SERVICE_URL",
            value: raw_url.clone(),
            reason: e.to_string(),
        })?;

        let retry_max_attempts = parsed(
            "RETRY_MAX_ATTEMPTS",
            &DEFAULT_RETRY_MAX_ATTEMPTS.to_string(),
        )?;
        let retry_max_attempts =
            u32::try_from(retry_max_attempts).map_err(|e| ConfigError::Invalid {
                var: "RETRY_MAX_ATTEMPTS",
                value: retry_max_attempts.to_string(),
                reason: e.to_string(),
            })?;

        let policy_reload_secs = parsed(
            "POLICY_RELOAD_SECS",
            &DEFAULT_POLICY_RELOAD_SECS.to_string(),
        )?;
        if policy_reload_secs == 0 {
            return Err(ConfigError::Invalid {
                var: "POLICY_RELOAD_SECS",
                value: policy_reload_secs.to_string(),
                reason: "must be at least one second".to_string(),
            });
        }

        let user_header = string("USER_HEADER", DEFAULT_USER_HEADER).to_ascii_lowercase();
        if axum::http::HeaderName::from_bytes(user_header.as_bytes()).is_err() {
            return Err(ConfigError::Invalid {
                var: "USER_HEADER",
                value: user_header,
                reason: "not a valid header name".to_string(),
            });
        }

        let config = Self {
            listen_port: port("LISTEN_PORT", DEFAULT_LISTEN_PORT)?,
            health_port: port("HEALTH_PORT", DEFAULT_HEALTH_PORT)?,
            tls_cert_path: string("TLS_CERT_PATH", DEFAULT_TLS_CERT_PATH).into(),
            tls_key_path: string("TLS_KEY_PATH", DEFAULT_TLS_KEY_PATH).into(),
            version_service_url,
            system_namespace: string("SYSTEM_NAMESPACE", DEFAULT_SYSTEM_NAMESPACE),
            rbac_configmap: string("RBAC_CONFIGMAP", DEFAULT_RBAC_CONFIGMAP),
            policy_reload_interval: Duration::from_secs(policy_reload_secs),
            user_header,
            retry_interval: Duration::from_secs(parsed(
                "RETRY_INTERVAL_SECS",
                &DEFAULT_RETRY_INTERVAL_SECS.to_string(),
            )?),
            retry_max_attempts,
        };
        if config.listen_port == config.health_port {
            warn!(port = config.listen_port, "API and health servers share a port");
        }
        Ok(config)
    }

    /// Whether both TLS files are present.
    pub fn tls_enabled(&self) -> bool {
        self.tls_cert_path.exists() && self.tls_key_path.exists()
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::constant(self.retry_interval, self.retry_max_attempts)
    }
}
