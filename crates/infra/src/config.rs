//! Service configuration.
//!
//! Loaded in layers:
//! 1. Default values in code
//! 2. `config/{environment}.toml` (optional)
//! 3. Environment variables prefixed `LOOMERP__` (e.g. `LOOMERP__SERVER__PORT=9090`)
//!
//! A `.env` file is read first when present.

use std::time::Duration;

use config::{ConfigError, Environment, File};
use serde::Deserialize;

#[derive(Debug, Deserialize, Clone)]
pub struct Settings {
    /// Current environment (development, production)
    pub environment: String,
    pub server: ServerSettings,
    pub database: DatabaseSettings,
    pub outbox: OutboxSettings,
    pub notification: NotificationSettings,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerSettings {
    pub host: String,
    pub port: u16,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DatabaseSettings {
    /// PostgreSQL connection URL. Without one the service runs on the in-memory store.
    pub url: Option<String>,
    pub max_connections: u32,
}

#[derive(Debug, Deserialize, Clone)]
pub struct OutboxSettings {
    pub batch_size: u32,
    pub max_attempts: u32,
    pub poll_interval_ms: u64,
    /// How long a claimed message may stay in flight before it is claimed again.
    pub lease_ms: u64,
}

#[derive(Debug, Deserialize, Clone)]
pub struct NotificationSettings {
    /// Webhook for notification calls. Without one they are only logged.
    pub endpoint: Option<String>,
    pub timeout_ms: u64,
}

impl OutboxSettings {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn lease(&self) -> Duration {
        Duration::from_millis(self.lease_ms)
    }
}

impl NotificationSettings {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

impl Settings {
    /// Load configuration from `.env`, files and environment variables.
    pub fn load() -> Result<Self, ConfigError> {
        dotenvy::dotenv().ok();
        let environment =
            std::env::var("LOOMERP_ENVIRONMENT").unwrap_or_else(|_| "development".into());
        Self::build(&environment, Environment::with_prefix("LOOMERP").separator("__").try_parsing(true))
    }

    fn build(environment: &str, env: Environment) -> Result<Self, ConfigError> {
        let config = config::Config::builder()
            .set_default("environment", environment)?
            .set_default("server.host", "0.0.0.0")?
            .set_default("server.port", 8080)?
            .set_default("database.max_connections", 10)?
            .set_default("outbox.batch_size", 50)?
            .set_default("outbox.max_attempts", 8)?
            .set_default("outbox.poll_interval_ms", 1000)?
            .set_default("outbox.lease_ms", 60_000)?
            .set_default("notification.timeout_ms", 5000)?
            .add_source(File::with_name(&format!("config/{environment}")).required(false))
            .add_source(env)
            .build()?;

        config.try_deserialize()
    }
}
