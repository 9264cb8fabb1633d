//! Configuration manager for authgate.

use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use axum::extract::FromRef;
use serde::{Deserialize, Serialize};
use url::Url;

use crate::AppState;

const DEFAULT_CONFIG_PATH: &str = "config.yaml";
const VERSION: &str = env!("CARGO_PKG_VERSION");
const SECRET_ENV: &str = "AUTHGATE_SECRET";

/// Insecure fallback used when no signing secret is configured.
/// Only tolerated outside production.
const DEV_FALLBACK_SECRET: &str = "authgate-dev-secret-do-not-deploy";

#[derive(Debug, Default, Clone, PartialEq, Serialize, Deserialize)]
pub struct Configuration {
    /// Instance name.
    pub name: String,
    /// Domain name of current instance.
    pub url: String,
    /// Whether this deployment is production.
    /// Controls the fatal missing-secret check and the `Secure` cookie flag.
    #[serde(default)]
    pub production: bool,
    #[serde(default)]
    version: String,
    #[serde(skip)]
    path: PathBuf,
    /// Session proof and abuse-control tunables.
    #[serde(default, skip_serializing)]
    pub mfa: Mfa,
    /// Related to PostgreSQL configuration.
    ///
    /// When absent, factors and one-time codes live in process memory.
    #[serde(skip_serializing)]
    pub postgres: Option<Postgres>,
    /// Related to out-of-band code delivery.
    #[serde(skip_serializing)]
    pub mail: Option<Mail>,
    /// Related to the local TOTP provider.
    #[serde(skip_serializing)]
    pub totp: Option<Totp>,
}

/// PostgreSQL configuration.
#[derive(Debug, Default, PartialEq, Clone, Serialize, Deserialize)]
pub struct Postgres {
    /// Hostname:(?port) for PostgreSQL instance.
    pub address: String,
    /// Database name.
    pub database: Option<String>,
    /// Username credential to connect.
    pub username: Option<String>,
    /// Password credential to connect.
    pub password: Option<String>,
    /// Maximum pool connections.
    pub pool_size: Option<u32>,
}

/// Session proof and rate-limit configuration.
#[derive(Debug, PartialEq, Clone, Serialize, Deserialize)]
pub struct Mfa {
    /// HMAC signing secret for session proofs.
    /// Falls back to the `AUTHGATE_SECRET` environment variable.
    pub secret: Option<String>,
    /// Cookie name holding the signed session proof.
    pub cookie_name: String,
    /// Allowed code sends per principal per window.
    pub send_limit: u32,
    /// Allowed verification attempts per principal per window.
    pub verify_limit: u32,
    /// Rate-limit window, in seconds.
    pub window_secs: u64,
}

impl Default for Mfa {
    fn default() -> Self {
        Self {
            secret: None,
            cookie_name: "authgate_email_mfa".into(),
            send_limit: 3,
            verify_limit: 5,
            window_secs: 300,
        }
    }
}

/// RabbitMQ mail-queue configuration.
#[derive(Debug, Default, Clone, PartialEq, Serialize, Deserialize)]
pub struct Mail {
    /// Hostname:(?port) for RabbitMQ instance.
    pub address: String,
    /// RabbitMQ default vhost.
    pub vhost: Option<String>,
    /// RabbitMQ username to access queue.
    pub username: String,
    /// RabbitMQ password to access queue.
    pub password: String,
    /// Max channel connections.
    pub pool: Option<u16>,
    /// Queue name to send mailing events.
    pub queue: String,
}

/// TOTP configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Totp {
    /// Number of digits for the code.
    pub digits: u32,
    /// Window for code usage, in seconds.
    pub period: u64,
}

impl Default for Totp {
    fn default() -> Self {
        Self {
            digits: 6,
            period: 30,
        }
    }
}

impl FromRef<AppState> for Arc<Configuration> {
    fn from_ref(state: &AppState) -> Arc<Configuration> {
        Arc::clone(&state.config)
    }
}

impl Configuration {
    pub fn path(mut self, path: PathBuf) -> Self {
        self.path = path;
        self
    }

    /// Normalizes a URL string by ensuring it starts with a valid scheme
    /// (`http` or `https`).
    fn normalize_url(&self, url: &str) -> Result<String, url::ParseError> {
        let url_with_scheme =
            if url.starts_with("http://") || url.starts_with("https://") {
                url.to_string()
            } else {
                format!("https://{url}")
            };

        let parsed_url = Url::parse(&url_with_scheme)?;
        Ok(parsed_url.to_string())
    }

    /// Reads the `config.yaml` file from the specified path or the default
    /// location.
    pub fn read(self) -> Result<Arc<Self>, url::ParseError> {
        let file_path = if self.path.is_file() {
            &self.path
        } else {
            &Path::new(DEFAULT_CONFIG_PATH).to_path_buf()
        };

        match File::open(file_path) {
            Ok(file) => {
                let mut config: Configuration =
                    match serde_yaml::from_reader(file) {
                        Ok(config) => config,
                        Err(err) => {
                            return Ok(Arc::new(self.error(err)));
                        },
                    };

                // set app version.
                config.version = VERSION.to_owned();

                // normalize URL.
                config.url = self.normalize_url(&config.url)?;

                Ok(Arc::new(config))
            },
            Err(err) => Ok(Arc::new(self.error(err))),
        }
    }

    /// Resolve the proof-signing secret.
    ///
    /// A missing secret is fatal in production; outside production a fixed
    /// development secret is used and loudly reported.
    pub fn signing_secret(&self) -> crate::error::Result<String> {
        if let Some(secret) = self.mfa.secret.clone().filter(|s| !s.is_empty())
        {
            return Ok(secret);
        }

        match std::env::var(SECRET_ENV) {
            Ok(secret) if !secret.is_empty() => return Ok(secret),
            _ => {},
        }

        if self.production {
            return Err(crate::error::ServerError::Configuration(format!(
                "missing `mfa.secret` entry and `{SECRET_ENV}` environnement variable"
            )));
        }

        tracing::warn!(
            "no signing secret configured, using an INSECURE development fallback"
        );
        Ok(DEV_FALLBACK_SECRET.to_owned())
    }

    /// Return a default configuration as fallback.
    fn error(&self, err: impl std::error::Error) -> Self {
        tracing::error!(error = %err, "`config.yaml` file not found");
        Self {
            version: VERSION.to_owned(),
            ..Default::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_secret_fallback_outside_production() {
        let config = Configuration::default();
        assert_eq!(config.signing_secret().unwrap(), DEV_FALLBACK_SECRET);
    }

    #[test]
    fn test_missing_secret_is_fatal_in_production() {
        let config = Configuration {
            production: true,
            ..Default::default()
        };
        assert!(config.signing_secret().is_err());
    }

    #[test]
    fn test_explicit_secret_wins() {
        let config = Configuration {
            production: true,
            mfa: Mfa {
                secret: Some("topsecret".into()),
                ..Default::default()
            },
            ..Default::default()
        };
        assert_eq!(config.signing_secret().unwrap(), "topsecret");
    }
}
