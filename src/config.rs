//! Configuration module
//!
//! Loads configuration from environment variables.

use std::env;
use std::str::FromStr;
use std::time::Duration;

use uuid::Uuid;

use crate::jobs::RelayConfig;

/// Application configuration
#[derive(Debug, Clone)]
pub struct Config {
    /// Database connection URL
    pub database_url: String,

    /// Maximum database connections in pool
    pub database_max_connections: u32,

    /// Environment (development, production)
    pub environment: String,

    /// Message bus connection URL
    pub redis_url: String,

    /// Subject prefix for outbound events
    pub event_domain: String,

    /// Subject prefix for dead-lettered events
    pub event_dlq_stream: String,

    pub outbox_poll_interval: Duration,
    pub outbox_batch_size: usize,
    pub outbox_max_attempts: i32,
    pub outbox_claim_ttl: Duration,

    /// Lease owner name of this relay instance
    pub relay_id: String,

    /// Consumer name within the bus consumer groups
    pub consumer_name: String,
}

impl Config {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self, ConfigError> {
        let database_url = env::var("DATABASE_URL")
            .map_err(|_| ConfigError::MissingEnv("DATABASE_URL"))?;

        let database_max_connections = parse_or("DATABASE_MAX_CONNECTIONS", 10)?;

        let environment = env::var("ENVIRONMENT").unwrap_or_else(|_| "development".to_string());

        let redis_url =
            env::var("REDIS_URL").unwrap_or_else(|_| "redis://127.0.0.1:6379".to_string());

        let event_domain = env::var("EVENT_DOMAIN").unwrap_or_else(|_| "treasury".to_string());
        let event_dlq_stream =
            env::var("EVENT_DLQ_STREAM").unwrap_or_else(|_| "treasury-dlq".to_string());

        let outbox_poll_interval =
            Duration::from_millis(parse_or("OUTBOX_POLL_INTERVAL_MS", 1000)?);
        let outbox_batch_size = parse_or("OUTBOX_BATCH_SIZE", 100)?;
        let outbox_max_attempts = parse_or("OUTBOX_MAX_ATTEMPTS", 5)?;
        let outbox_claim_ttl = Duration::from_secs(parse_or("OUTBOX_CLAIM_TTL_SECS", 30)?);

        if outbox_batch_size == 0 {
            return Err(ConfigError::InvalidValue("OUTBOX_BATCH_SIZE"));
        }
        if outbox_max_attempts < 1 {
            return Err(ConfigError::InvalidValue("OUTBOX_MAX_ATTEMPTS"));
        }

        let relay_id = env::var("RELAY_ID").unwrap_or_else(|_| format!("relay-{}", Uuid::new_v4()));
        let consumer_name =
            env::var("CONSUMER_NAME").unwrap_or_else(|_| "treasury-worker".to_string());

        Ok(Self {
            database_url,
            database_max_connections,
            environment,
            redis_url,
            event_domain,
            event_dlq_stream,
            outbox_poll_interval,
            outbox_batch_size,
            outbox_max_attempts,
            outbox_claim_ttl,
            relay_id,
            consumer_name,
        })
    }

    /// Check if running in production
    pub fn is_production(&self) -> bool {
        self.environment == "production"
    }

    /// Relay settings derived from this configuration
    pub fn relay_config(&self) -> Result<RelayConfig, ConfigError> {
        let claim_ttl = chrono::Duration::from_std(self.outbox_claim_ttl)
            .map_err(|_| ConfigError::InvalidValue("OUTBOX_CLAIM_TTL_SECS"))?;

        Ok(RelayConfig {
            poll_interval: self.outbox_poll_interval,
            batch_size: self.outbox_batch_size,
            max_attempts: self.outbox_max_attempts,
            claim_ttl,
            topic_prefix: self.event_domain.clone(),
            dead_letter_prefix: self.event_dlq_stream.clone(),
            relay_id: self.relay_id.clone(),
        })
    }
}

/// Read `key`, falling back to `default` when unset
fn parse_or<T: FromStr>(key: &'static str, default: T) -> Result<T, ConfigError> {
    match env::var(key) {
        Ok(raw) => raw.trim().parse().map_err(|_| ConfigError::InvalidValue(key)),
        Err(_) => Ok(default),
    }
}

/// Configuration error types
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing environment variable: {0}")]
    MissingEnv(&'static str),

    #[error("Invalid value for environment variable: {0}")]
    InvalidValue(&'static str),
}
