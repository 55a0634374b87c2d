//! Configuration module for the tide ingest service.
//!
//! This module provides environment-based configuration: where the InfluxDB
//! instance lives and how to authenticate against it, which organization and
//! bucket hold the tide points, and how the write channel, query path and
//! HTTP listener behave.

use std::env;
use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

/// Default InfluxDB URL
const DEFAULT_INFLUX_URL: &str = "https://us-west-2-1.aws.cloud2.influxdata.com";

/// Default InfluxDB authorization token
const DEFAULT_TOKEN: &str = "my-token";

/// Default organization within InfluxDB
const DEFAULT_ORG: &str = "my-org";

/// Default bucket holding the tide points
const DEFAULT_BUCKET: &str = "ocean_tides";

/// Default port for the query API
const DEFAULT_HTTP_PORT: u16 = 3000;

/// Default directory holding the per-location dataset files
const DEFAULT_DATA_DIR: &str = "data";

/// Default number of points per write request
const DEFAULT_BATCH_SIZE: usize = 1000;

/// Default flush interval in seconds
const DEFAULT_FLUSH_INTERVAL_SECS: u64 = 1;

/// Maximum allowed batch size
const MAX_BATCH_SIZE: usize = 10_000;

/// Minimum flush interval
const MIN_FLUSH_INTERVAL_SECS: u64 = 1;

/// Maximum flush interval
const MAX_FLUSH_INTERVAL_SECS: u64 = 300;

/// Configuration for the tide ingest service.
///
/// All settings can be configured via environment variables:
/// - `INFLUX_URL`: InfluxDB base URL
/// - `INFLUX_TOKEN`: InfluxDB authorization token (default: my-token)
/// - `INFLUX_ORG`: organization name (default: my-org)
/// - `INFLUX_BUCKET`: bucket name (default: ocean_tides)
/// - `TIDE_HTTP_PORT`: query API port (default: 3000)
/// - `TIDE_DATA_DIR`: dataset directory (default: data)
/// - `TIDE_BATCH_SIZE`: points per write request (default: 1000)
/// - `TIDE_FLUSH_INTERVAL_SECS`: seconds between write flushes (default: 1)
/// - `TIDE_REQUEST_TIMEOUT_SECS`: HTTP request timeout (default: 30)
/// - `TIDE_QUERY_TIMEOUT_SECS`: deadline for a whole query (default: 30)
/// - `TIDE_MAX_RETRIES`: write retry attempts (default: 3)
#[derive(Debug, Clone)]
pub struct Config {
    /// Base URL of the InfluxDB instance, without trailing slash
    pub influx_url: String,

    /// Token sent as `Authorization: Token <token>`
    pub token: String,

    /// Organization name resolved during provisioning
    pub org: String,

    /// Bucket the points are written to and queried from
    pub bucket: String,

    /// Port the query API listens on
    pub http_port: u16,

    /// Directory containing the `tides-<location>.json` files
    pub data_dir: PathBuf,

    /// Number of points to accumulate before sending a write request
    pub batch_size: usize,

    /// Duration to wait before flushing buffered points, even if batch size not reached
    pub flush_interval: Duration,

    /// HTTP request timeout duration
    pub request_timeout: Duration,

    /// Upper bound on the lifetime of a single query stream
    pub query_timeout: Duration,

    /// Maximum number of retry attempts for failed writes
    pub max_retries: u32,
}

/// Error type for configuration loading failures
#[derive(Debug, Error)]
#[error("Configuration error{}: {message}", .env_var.as_ref().map(|v| format!(" for {}", v)).unwrap_or_default())]
pub struct ConfigError {
    pub message: String,
    pub env_var: Option<String>,
}

impl ConfigError {
    fn for_var(env_var: &str, message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            env_var: Some(env_var.to_string()),
        }
    }
}

impl Config {
    /// Load configuration from environment variables.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError` if:
    /// - `INFLUX_ORG` or `INFLUX_BUCKET` is set but empty
    /// - `TIDE_HTTP_PORT` is not a valid port
    /// - `TIDE_BATCH_SIZE` is not a valid number or exceeds limits
    /// - `TIDE_FLUSH_INTERVAL_SECS` is not a valid number or exceeds limits
    ///
    /// # Examples
    ///
    /// ```no_run
    /// use tide_ingest::config::Config;
    ///
    /// let config = Config::from_env().expect("Failed to load config");
    /// println!("InfluxDB: {}", config.influx_url);
    /// ```
    pub fn from_env() -> Result<Self, ConfigError> {
        let influx_url = env::var("INFLUX_URL")
            .unwrap_or_else(|_| DEFAULT_INFLUX_URL.to_string())
            .trim_end_matches('/')
            .to_string();

        let token = env::var("INFLUX_TOKEN").unwrap_or_else(|_| DEFAULT_TOKEN.to_string());
        let org = Self::parse_name("INFLUX_ORG", DEFAULT_ORG)?;
        let bucket = Self::parse_name("INFLUX_BUCKET", DEFAULT_BUCKET)?;
        let http_port = Self::parse_http_port()?;

        let data_dir = env::var("TIDE_DATA_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from(DEFAULT_DATA_DIR));

        let batch_size = Self::parse_batch_size()?;
        let flush_interval = Duration::from_secs(Self::parse_flush_interval()?);

        let request_timeout_secs: u64 = env::var("TIDE_REQUEST_TIMEOUT_SECS")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(30);

        let query_timeout_secs: u64 = env::var("TIDE_QUERY_TIMEOUT_SECS")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(30);

        let max_retries: u32 = env::var("TIDE_MAX_RETRIES")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(3);

        Ok(Self {
            influx_url,
            token,
            org,
            bucket,
            http_port,
            data_dir,
            batch_size,
            flush_interval,
            request_timeout: Duration::from_secs(request_timeout_secs),
            query_timeout: Duration::from_secs(query_timeout_secs),
            max_retries,
        })
    }

    /// Read a name-like variable that may be unset but must not be blank.
    fn parse_name(env_var: &str, default: &str) -> Result<String, ConfigError> {
        match env::var(env_var) {
            Ok(value) => {
                let value = value.trim();
                if value.is_empty() {
                    return Err(ConfigError::for_var(env_var, "value must not be empty"));
                }
                Ok(value.to_string())
            }
            Err(_) => Ok(default.to_string()),
        }
    }

    fn parse_http_port() -> Result<u16, ConfigError> {
        let env_var = "TIDE_HTTP_PORT";

        match env::var(env_var) {
            Ok(value) => value.parse().map_err(|_| {
                ConfigError::for_var(env_var, format!("'{}' is not a valid port", value))
            }),
            Err(_) => Ok(DEFAULT_HTTP_PORT),
        }
    }

    /// Parse batch size from environment variable with validation.
    fn parse_batch_size() -> Result<usize, ConfigError> {
        let env_var = "TIDE_BATCH_SIZE";

        match env::var(env_var) {
            Ok(value) => {
                let batch_size: usize = value.parse().map_err(|_| {
                    ConfigError::for_var(env_var, format!("'{}' is not a valid number", value))
                })?;

                if batch_size == 0 {
                    return Err(ConfigError::for_var(
                        env_var,
                        "batch size must be greater than 0",
                    ));
                }

                if batch_size > MAX_BATCH_SIZE {
                    return Err(ConfigError::for_var(
                        env_var,
                        format!(
                            "batch size {} exceeds maximum allowed ({})",
                            batch_size, MAX_BATCH_SIZE
                        ),
                    ));
                }

                Ok(batch_size)
            }
            Err(_) => Ok(DEFAULT_BATCH_SIZE),
        }
    }

    /// Parse flush interval from environment variable with validation.
    fn parse_flush_interval() -> Result<u64, ConfigError> {
        let env_var = "TIDE_FLUSH_INTERVAL_SECS";

        match env::var(env_var) {
            Ok(value) => {
                let interval: u64 = value.parse().map_err(|_| {
                    ConfigError::for_var(env_var, format!("'{}' is not a valid number", value))
                })?;

                if interval < MIN_FLUSH_INTERVAL_SECS {
                    return Err(ConfigError::for_var(
                        env_var,
                        format!(
                            "flush interval {} is below minimum ({}s)",
                            interval, MIN_FLUSH_INTERVAL_SECS
                        ),
                    ));
                }

                if interval > MAX_FLUSH_INTERVAL_SECS {
                    return Err(ConfigError::for_var(
                        env_var,
                        format!(
                            "flush interval {} exceeds maximum ({}s)",
                            interval, MAX_FLUSH_INTERVAL_SECS
                        ),
                    ));
                }

                Ok(interval)
            }
            Err(_) => Ok(DEFAULT_FLUSH_INTERVAL_SECS),
        }
    }
}

impl Default for Config {
    /// Create a default configuration using default values.
    ///
    /// This is useful for testing or when environment variables are not set.
    fn default() -> Self {
        Self {
            influx_url: DEFAULT_INFLUX_URL.to_string(),
            token: DEFAULT_TOKEN.to_string(),
            org: DEFAULT_ORG.to_string(),
            bucket: DEFAULT_BUCKET.to_string(),
            http_port: DEFAULT_HTTP_PORT,
            data_dir: PathBuf::from(DEFAULT_DATA_DIR),
            batch_size: DEFAULT_BATCH_SIZE,
            flush_interval: Duration::from_secs(DEFAULT_FLUSH_INTERVAL_SECS),
            request_timeout: Duration::from_secs(30),
            query_timeout: Duration::from_secs(30),
            max_retries: 3,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::env;
    use std::sync::Mutex;

    // Tests below mutate process-wide environment variables
    static ENV_LOCK: Mutex<()> = Mutex::new(());

    // Helper to temporarily set environment variables for testing
    struct EnvGuard {
        key: String,
        original: Option<String>,
    }

    impl EnvGuard {
        fn set(key: &str, value: &str) -> Self {
            let original = env::var(key).ok();
            env::set_var(key, value);
            Self {
                key: key.to_string(),
                original,
            }
        }

        fn remove(key: &str) -> Self {
            let original = env::var(key).ok();
            env::remove_var(key);
            Self {
                key: key.to_string(),
                original,
            }
        }
    }

    impl Drop for EnvGuard {
        fn drop(&mut self) {
            match &self.original {
                Some(val) => env::set_var(&self.key, val),
                None => env::remove_var(&self.key),
            }
        }
    }

    fn lock_env() -> std::sync::MutexGuard<'static, ()> {
        ENV_LOCK.lock().unwrap_or_else(|e| e.into_inner())
    }

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.influx_url, "https://us-west-2-1.aws.cloud2.influxdata.com");
        assert_eq!(config.org, "my-org");
        assert_eq!(config.bucket, "ocean_tides");
        assert_eq!(config.http_port, 3000);
        assert_eq!(config.batch_size, 1000);
        assert_eq!(config.flush_interval, Duration::from_secs(1));
        assert_eq!(config.max_retries, 3);
    }

    #[test]
    fn test_config_from_env_with_defaults() {
        let _lock = lock_env();
        let _guard1 = EnvGuard::remove("INFLUX_URL");
        let _guard2 = EnvGuard::remove("INFLUX_BUCKET");
        let _guard3 = EnvGuard::remove("TIDE_BATCH_SIZE");
        let _guard4 = EnvGuard::remove("TIDE_FLUSH_INTERVAL_SECS");
        let _guard5 = EnvGuard::remove("TIDE_HTTP_PORT");
        let _guard6 = EnvGuard::remove("INFLUX_ORG");

        let config = Config::from_env().expect("Should load with defaults");
        assert_eq!(config.influx_url, "https://us-west-2-1.aws.cloud2.influxdata.com");
        assert_eq!(config.bucket, "ocean_tides");
        assert_eq!(config.http_port, 3000);
        assert_eq!(config.batch_size, 1000);
    }

    #[test]
    fn test_config_from_env_custom_values() {
        let _lock = lock_env();
        let _guard1 = EnvGuard::set("INFLUX_URL", "http://localhost:8086/");
        let _guard2 = EnvGuard::set("INFLUX_ORG", "coast");
        let _guard3 = EnvGuard::set("INFLUX_BUCKET", "tides_test");
        let _guard4 = EnvGuard::set("TIDE_BATCH_SIZE", "200");
        let _guard5 = EnvGuard::set("TIDE_FLUSH_INTERVAL_SECS", "10");
        let _guard6 = EnvGuard::set("TIDE_HTTP_PORT", "8080");

        let config = Config::from_env().expect("Should load custom values");
        assert_eq!(config.influx_url, "http://localhost:8086"); // Trailing slash removed
        assert_eq!(config.org, "coast");
        assert_eq!(config.bucket, "tides_test");
        assert_eq!(config.batch_size, 200);
        assert_eq!(config.flush_interval, Duration::from_secs(10));
        assert_eq!(config.http_port, 8080);
    }

    #[test]
    fn test_empty_bucket_rejected() {
        let _lock = lock_env();
        let _guard = EnvGuard::set("INFLUX_BUCKET", "  ");

        let err = Config::from_env().unwrap_err();
        assert_eq!(err.env_var.as_deref(), Some("INFLUX_BUCKET"));
        assert!(err.message.contains("must not be empty"));
    }

    #[test]
    fn test_invalid_port() {
        let _lock = lock_env();
        let _guard = EnvGuard::set("TIDE_HTTP_PORT", "70000");

        let err = Config::from_env().unwrap_err();
        assert!(err.message.contains("not a valid port"));
    }

    #[test]
    fn test_invalid_batch_size() {
        let _lock = lock_env();
        let _guard = EnvGuard::set("TIDE_BATCH_SIZE", "not_a_number");

        let err = Config::from_env().unwrap_err();
        assert!(err.message.contains("not a valid number"));
    }

    #[test]
    fn test_zero_batch_size() {
        let _lock = lock_env();
        let _guard = EnvGuard::set("TIDE_BATCH_SIZE", "0");

        let err = Config::from_env().unwrap_err();
        assert!(err.message.contains("greater than 0"));
    }

    #[test]
    fn test_batch_size_exceeds_max() {
        let _lock = lock_env();
        let _guard = EnvGuard::set("TIDE_BATCH_SIZE", "99999");

        let err = Config::from_env().unwrap_err();
        assert!(err.message.contains("exceeds maximum"));
    }

    #[test]
    fn test_flush_interval_below_min() {
        let _lock = lock_env();
        let _guard1 = EnvGuard::remove("TIDE_BATCH_SIZE");
        let _guard2 = EnvGuard::set("TIDE_FLUSH_INTERVAL_SECS", "0");

        let err = Config::from_env().unwrap_err();
        assert!(err.message.contains("below minimum"));
    }

    #[test]
    fn test_flush_interval_exceeds_max() {
        let _lock = lock_env();
        let _guard1 = EnvGuard::remove("TIDE_BATCH_SIZE");
        let _guard2 = EnvGuard::set("TIDE_FLUSH_INTERVAL_SECS", "999");

        let err = Config::from_env().unwrap_err();
        assert!(err.message.contains("exceeds maximum"));
    }

    #[test]
    fn test_config_error_display() {
        let error = ConfigError {
            message: "test error".to_string(),
            env_var: Some("TEST_VAR".to_string()),
        };
        assert_eq!(
            format!("{}", error),
            "Configuration error for TEST_VAR: test error"
        );

        let error_no_var = ConfigError {
            message: "general error".to_string(),
            env_var: None,
        };
        assert_eq!(
            format!("{}", error_no_var),
            "Configuration error: general error"
        );
    }
}
