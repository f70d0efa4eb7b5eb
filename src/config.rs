use secrecy::SecretString;
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;

use crate::error::{GateError, Result};

/// Main configuration for the querygate service.
#[derive(Clone)]
pub struct Config {
    pub server: ServerConfig,
    pub logging: LoggingConfig,
    /// Postgres connection string. When absent the service runs on the
    /// in-memory store (development only).
    pub database_url: Option<String>,
    pub identity: IdentityConfig,
    pub billing: BillingConfig,
    pub completion: CompletionConfig,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
    #[serde(default = "default_json")]
    pub json: bool,
}

/// Identity service collaborator.
#[derive(Clone)]
pub struct IdentityConfig {
    pub base_url: String,
}

/// Billing processor credentials and price catalog.
///
/// Secrets are held as [`SecretString`] so they never appear in debug
/// output or logs.
#[derive(Clone)]
pub struct BillingConfig {
    pub secret_key: SecretString,
    pub webhook_secret: SecretString,
    pub prices: PlanPrices,
}

/// Processor price ids for the purchasable tiers.
#[derive(Debug, Clone, Default)]
pub struct PlanPrices {
    pub basic: Option<String>,
    pub professional: Option<String>,
    pub academy: Option<String>,
}

/// Completion provider settings.
#[derive(Clone)]
pub struct CompletionConfig {
    pub api_url: String,
    pub api_key: SecretString,
    pub model: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json: default_json(),
        }
    }
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    8000
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_json() -> bool {
    false
}

impl ServerConfig {
    pub fn addr(&self) -> std::result::Result<SocketAddr, std::net::AddrParseError> {
        format!("{}:{}", self.host, self.port).parse()
    }
}

fn env_var(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.is_empty())
}

fn require_env(name: &str) -> Result<String> {
    env_var(name).ok_or_else(|| GateError::validation(format!("{} must be set", name)))
}

impl Config {
    /// Load configuration from environment variables.
    ///
    /// Server and logging settings use the `QUERYGATE_` prefix; external
    /// collaborator settings use their conventional names
    /// (`DATABASE_URL`, `IDENTITY_URL`, `BILLING_SECRET_KEY`,
    /// `BILLING_WEBHOOK_SECRET`, `COMPLETION_API_URL`,
    /// `COMPLETION_API_KEY`).
    ///
    /// # Errors
    ///
    /// Returns an error if a required variable is missing or a value
    /// fails validation.
    pub fn from_env() -> Result<Self> {
        let mut server = ServerConfig::default();
        if let Some(host) = env_var("QUERYGATE_HOST") {
            server.host = host;
        }
        // QUERYGATE_PORT first, PORT as a PaaS fallback
        if let Some(port) = env_var("QUERYGATE_PORT").or_else(|| env_var("PORT")) {
            server.port = port
                .parse()
                .map_err(|_| GateError::validation(format!("invalid port: {}", port)))?;
        }

        let mut logging = LoggingConfig::default();
        if let Some(level) = env_var("QUERYGATE_LOG_LEVEL") {
            logging.level = level;
        }
        if let Some(json) = env_var("QUERYGATE_LOG_JSON") {
            logging.json = json.parse().unwrap_or(false);
        }

        let config = Self {
            server,
            logging,
            database_url: env_var("DATABASE_URL"),
            identity: IdentityConfig {
                base_url: require_env("IDENTITY_URL")?,
            },
            billing: BillingConfig {
                secret_key: require_env("BILLING_SECRET_KEY")?.into(),
                webhook_secret: require_env("BILLING_WEBHOOK_SECRET")?.into(),
                prices: PlanPrices {
                    basic: env_var("BILLING_PRICE_BASIC"),
                    professional: env_var("BILLING_PRICE_PROFESSIONAL"),
                    academy: env_var("BILLING_PRICE_ACADEMY"),
                },
            },
            completion: CompletionConfig {
                api_url: require_env("COMPLETION_API_URL")?,
                api_key: require_env("COMPLETION_API_KEY")?.into(),
                model: env_var("COMPLETION_MODEL")
                    .unwrap_or_else(|| "gpt-4o-mini".to_string()),
            },
        };

        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        self.server.addr().map_err(|e| {
            GateError::validation(format!(
                "Invalid server address {}:{} - {}",
                self.server.host, self.server.port, e
            ))
        })?;

        let valid_log_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_log_levels.contains(&self.logging.level.to_lowercase().as_str()) {
            return Err(GateError::validation(format!(
                "Invalid log level: {}. Must be one of: {}",
                self.logging.level,
                valid_log_levels.join(", ")
            )));
        }

        if self.server.port == 0 {
            return Err(GateError::validation("Server port must be greater than 0"));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn server_config_addr() {
        let server = ServerConfig {
            host: "127.0.0.1".to_string(),
            port: 9000,
        };
        assert_eq!(server.addr().unwrap().to_string(), "127.0.0.1:9000");
    }

    #[test]
    fn invalid_log_level_rejected() {
        let config = Config {
            server: ServerConfig::default(),
            logging: LoggingConfig {
                level: "verbose".to_string(),
                json: false,
            },
            database_url: None,
            identity: IdentityConfig {
                base_url: "http://localhost:9999".to_string(),
            },
            billing: BillingConfig {
                secret_key: "sk_test".into(),
                webhook_secret: "whsec_test".into(),
                prices: PlanPrices::default(),
            },
            completion: CompletionConfig {
                api_url: "http://localhost:9998".to_string(),
                api_key: "key".into(),
                model: "test-model".to_string(),
            },
        };
        assert!(config.validate().is_err());
    }
}
