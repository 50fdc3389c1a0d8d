use serde::Deserialize;
use std::env;

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub server: ServerConfig,
    pub database: DatabaseConfig,
    pub redis: RedisConfig,
    pub kafka: KafkaConfig,
    pub holds: HoldConfig,
    pub locks: LockConfig,
    pub reconciler: ReconcilerConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    pub port: u16,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DatabaseConfig {
    pub url: String,
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
}

fn default_max_connections() -> u32 { 5 }

#[derive(Debug, Deserialize, Clone)]
pub struct RedisConfig {
    pub url: String,
}

#[derive(Debug, Deserialize, Clone)]
pub struct KafkaConfig {
    pub brokers: String,
}

/// Seat hold lifetimes
#[derive(Debug, Deserialize, Clone)]
pub struct HoldConfig {
    pub default_ttl_seconds: u64,
    /// Ceiling a hold may be extended to, measured from when it was taken.
    pub extended_ttl_seconds: u64,
}

#[derive(Debug, Deserialize, Clone)]
pub struct LockConfig {
    pub max_wait_ms: u64,
    pub lease_ms: u64,
    #[serde(default = "default_retry_interval")]
    pub retry_interval_ms: u64,
}

fn default_retry_interval() -> u64 { 25 }

#[derive(Debug, Deserialize, Clone)]
pub struct ReconcilerConfig {
    pub interval_seconds: u64,
    #[serde(default = "default_batch_size")]
    pub batch_size: i64,
}

fn default_batch_size() -> i64 { 500 }

impl Config {
    pub fn load() -> Result<Self, config::ConfigError> {
        let run_mode = env::var("RUN_MODE").unwrap_or_else(|_| "development".into());

        let s = config::Config::builder()
            // Start off by merging in the "default" configuration file
            .add_source(config::File::with_name("config/default"))
            // Add in the current environment file
            // Note that this file is _optional_
            .add_source(config::File::with_name(&format!("config/{}", run_mode)).required(false))
            // Add in a local configuration file
            // This file shouldn't be checked in to git
            .add_source(config::File::with_name("config/local").required(false))
            // Eg.. `RIDEPOOL_HOLDS__DEFAULT_TTL_SECONDS=300`
            .add_source(config::Environment::with_prefix("RIDEPOOL").separator("__"))
            .build()?;

        let config: Config = s.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), config::ConfigError> {
        if self.holds.default_ttl_seconds == 0 {
            return Err(config::ConfigError::Message(
                "holds.default_ttl_seconds must be positive".to_string(),
            ));
        }
        if self.holds.extended_ttl_seconds < self.holds.default_ttl_seconds {
            return Err(config::ConfigError::Message(format!(
                "holds.extended_ttl_seconds ({}) must not be shorter than holds.default_ttl_seconds ({})",
                self.holds.extended_ttl_seconds, self.holds.default_ttl_seconds
            )));
        }
        if self.locks.lease_ms == 0 || self.locks.retry_interval_ms == 0 {
            return Err(config::ConfigError::Message(
                "locks.lease_ms and locks.retry_interval_ms must be positive".to_string(),
            ));
        }
        if self.reconciler.interval_seconds == 0 || self.reconciler.batch_size <= 0 {
            return Err(config::ConfigError::Message(
                "reconciler.interval_seconds and reconciler.batch_size must be positive".to_string(),
            ));
        }
        Ok(())
    }
}
