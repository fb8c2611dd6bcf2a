use dotenvy::dotenv;
use std::env;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Clone)]
pub struct Config {
    pub mqtt_host: String,
    pub mqtt_port: u16,
    pub mqtt_username: String,
    pub mqtt_password: String,
    pub mqtt_ssl_enabled: bool,
    pub mqtt_keep_alive_secs: u64,
    pub mqtt_max_retries: i32,
    pub mqtt_retry_interval_ms: u64,

    pub log_topic: String,
    pub status_topic: String,

    pub command_timeout_ms: u64,
    pub long_command_timeout_ms: u64,
    pub refresh_interval_ms: u64,
    pub discovery_interval_ms: u64,

    pub notification_db_path: String,
    pub rest_port: u16,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Environment variable {0} is missing or invalid.")]
    MissingOrInvalid(String),
    #[error("Parsing error: {0}")]
    ParsingError(String),
}

impl Config {
    /// Validate timeout values and other critical configurations.
    fn validate_timeouts(&self) -> Result<(), ConfigError> {
        const MIN_TIMEOUT: u64 = 100;
        const MAX_TIMEOUT: u64 = 1_000_000;
        const MIN_REFRESH: u64 = 500;

        for (name, value) in [
            ("MQTT_RETRY_INTERVAL_MS", self.mqtt_retry_interval_ms),
            ("COMMAND_TIMEOUT_MS", self.command_timeout_ms),
            ("LONG_COMMAND_TIMEOUT_MS", self.long_command_timeout_ms),
        ] {
            if !(MIN_TIMEOUT..=MAX_TIMEOUT).contains(&value) {
                return Err(ConfigError::ParsingError(format!(
                    "{} must be between {} and {} ms",
                    name, MIN_TIMEOUT, MAX_TIMEOUT
                )));
            }
        }

        for (name, value) in [
            ("REFRESH_INTERVAL_MS", self.refresh_interval_ms),
            ("DISCOVERY_INTERVAL_MS", self.discovery_interval_ms),
        ] {
            if value < MIN_REFRESH {
                return Err(ConfigError::ParsingError(format!(
                    "{} must be at least {} ms",
                    name, MIN_REFRESH
                )));
            }
        }

        Ok(())
    }

    pub fn from_env() -> Result<Self, ConfigError> {
        dotenv().ok(); // Load environment variables from .env file
        Self::from_source(|key| env::var(key).ok())
    }

    /// Builds the configuration from an arbitrary key lookup.
    pub fn from_source<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let prepend_root_topic = |root: &str, topic: &str| {
            if !root.is_empty() {
                format!("{}/{}", root.trim_end_matches('/'), topic.trim_start_matches('/'))
            } else {
                topic.trim_start_matches('/').to_string()
            }
        };

        let required = |key: &str| {
            lookup(key)
                .filter(|v| !v.trim().is_empty())
                .ok_or_else(|| ConfigError::MissingOrInvalid(key.to_string()))
        };

        let mqtt_root_topic = lookup("MQTT_ROOT_TOPIC").unwrap_or_else(|| "gateway_console".to_string());

        let config = Self {
            // MQTT Configuration
            mqtt_host: required("MQTT_HOST")?,
            mqtt_port: required("MQTT_PORT")?
                .parse::<u16>()
                .map_err(|_| ConfigError::ParsingError("MQTT_PORT must be a valid number".to_string()))?,
            mqtt_username: lookup("MQTT_USERNAME").unwrap_or_default(),
            mqtt_password: lookup("MQTT_PASSWORD").unwrap_or_default(),
            mqtt_ssl_enabled: parse_bool(lookup("MQTT_SSL_ENABLED"), "MQTT_SSL_ENABLED")?,
            mqtt_keep_alive_secs: parse_or(lookup("MQTT_KEEP_ALIVE_SECS"), 30, "MQTT_KEEP_ALIVE_SECS")?,
            mqtt_max_retries: parse_or(lookup("MQTT_MAX_RETRIES"), -1, "MQTT_MAX_RETRIES")?,
            mqtt_retry_interval_ms: parse_or(lookup("MQTT_RETRY_INTERVAL_MS"), 5000, "MQTT_RETRY_INTERVAL_MS")?,

            // Console topics
            log_topic: prepend_root_topic(&mqtt_root_topic, "/logs"),
            status_topic: prepend_root_topic(&mqtt_root_topic, "/status"),

            // Command round trips
            command_timeout_ms: parse_or(lookup("COMMAND_TIMEOUT_MS"), 5000, "COMMAND_TIMEOUT_MS")?,
            long_command_timeout_ms: parse_or(lookup("LONG_COMMAND_TIMEOUT_MS"), 30_000, "LONG_COMMAND_TIMEOUT_MS")?,
            refresh_interval_ms: parse_or(lookup("REFRESH_INTERVAL_MS"), 3000, "REFRESH_INTERVAL_MS")?,
            discovery_interval_ms: parse_or(lookup("DISCOVERY_INTERVAL_MS"), 10_000, "DISCOVERY_INTERVAL_MS")?,

            notification_db_path: lookup("NOTIFICATION_DB_PATH")
                .unwrap_or_else(|| "console_notifications.db".to_string()),
            rest_port: parse_or(lookup("REST_PORT"), 8000, "REST_PORT")?,
        };

        // Validate timeouts after constructing the configuration
        config.validate_timeouts()?;

        Ok(config)
    }

    pub fn command_timeout(&self) -> Duration {
        Duration::from_millis(self.command_timeout_ms)
    }

    pub fn long_command_timeout(&self) -> Duration {
        Duration::from_millis(self.long_command_timeout_ms)
    }

    pub fn refresh_interval(&self) -> Duration {
        Duration::from_millis(self.refresh_interval_ms)
    }

    pub fn discovery_interval(&self) -> Duration {
        Duration::from_millis(self.discovery_interval_ms)
    }
}

fn parse_or<T: std::str::FromStr>(raw: Option<String>, default: T, key: &str) -> Result<T, ConfigError> {
    match raw {
        Some(value) => value
            .trim()
            .parse::<T>()
            .map_err(|_| ConfigError::ParsingError(format!("{} must be a valid number", key))),
        None => Ok(default),
    }
}

fn parse_bool(raw: Option<String>, key: &str) -> Result<bool, ConfigError> {
    match raw.as_deref().map(|v| v.trim().to_ascii_lowercase()) {
        None => Ok(false),
        Some(v) if v.is_empty() || v == "false" || v == "0" => Ok(false),
        Some(v) if v == "true" || v == "1" => Ok(true),
        Some(_) => Err(ConfigError::ParsingError(format!("{} must be true or false", key))),
    }
}
