use serde::Deserialize;
use std::convert::TryFrom;
use std::time::Duration;

use crate::body::BodyLimits;

/// Configuration for the HTTP server.
///
/// Loaded from an optional `config` file and from environment variables with
/// the `FERRITE_` prefix (after a `.env` file, if present, has been applied).
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    /// Server host address. Defaults to "127.0.0.1".
    #[serde(default = "default_host")]
    pub host: String,
    /// Server port number. Defaults to 3000.
    #[serde(default = "default_port")]
    pub port: u16,
    /// Number of reactor threads. Defaults to the CPU count.
    #[serde(default = "default_io_workers")]
    pub io_workers: usize,
    /// Maximum number of worker threads. Defaults to CPU count * 15.
    #[serde(default = "default_max_workers")]
    pub max_workers: usize,
    /// Keep-alive duration in seconds for idle worker threads.
    #[serde(default = "default_keep_alive_secs")]
    pub worker_keep_alive_secs: u64,
    /// Limit for raw and urlencoded bodies in bytes; negative is unlimited.
    #[serde(default = "default_max_request_size")]
    pub max_request_size: i64,
    /// Limit for multipart bodies in bytes; negative is unlimited.
    #[serde(default = "default_max_multipart_request_size")]
    pub max_multipart_request_size: i64,
    /// Buffer size used by chunked response writers.
    #[serde(default = "default_chunk_capacity")]
    pub chunk_capacity: usize,
    #[serde(default = "default_true")]
    pub http1_keep_alive: bool,
    #[serde(default)]
    pub http1_half_close: bool,
    /// Maximum buffer size for request heads. Defaults to 512kb.
    #[serde(default = "default_max_buf_size")]
    pub http1_max_buf_size: usize,
    #[serde(default)]
    pub http1_title_case_headers: bool,
}

impl TryFrom<config::Config> for ServerConfig {
    type Error = config::ConfigError;

    fn try_from(config: config::Config) -> Result<Self, Self::Error> {
        config.try_deserialize()
    }
}

impl ServerConfig {
    /// Loads the configuration.
    ///
    /// 1. Load environment variables from a .env file if present
    /// 2. Load a "config" file (if it exists)
    /// 3. Override with environment variables prefixed with "FERRITE_"
    ///
    /// # Errors
    /// Returns a ConfigError if configuration loading or parsing fails.
    pub fn new() -> Result<Self, config::ConfigError> {
        dotenv::dotenv().ok();

        let builder = config::Config::builder()
            .add_source(config::File::with_name("config").required(false))
            .add_source(config::Environment::with_prefix("FERRITE"));

        builder.build()?.try_into()
    }

    pub fn worker_keep_alive(&self) -> Duration {
        Duration::from_secs(self.worker_keep_alive_secs)
    }

    /// `host:port`
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn body_limits(&self) -> BodyLimits {
        BodyLimits {
            max_request_size: limit(self.max_request_size),
            max_multipart_request_size: limit(self.max_multipart_request_size),
        }
    }
}

fn limit(value: i64) -> Option<u64> {
    u64::try_from(value).ok()
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    3000
}

fn default_io_workers() -> usize {
    num_cpus::get()
}

fn default_max_workers() -> usize {
    num_cpus::get() * 15
}

fn default_keep_alive_secs() -> u64 {
    6
}

fn default_max_request_size() -> i64 {
    10 * 1024 * 1024
}

fn default_max_multipart_request_size() -> i64 {
    50 * 1024 * 1024
}

fn default_chunk_capacity() -> usize {
    1024
}

fn default_true() -> bool {
    true
}

fn default_max_buf_size() -> usize {
    524_288
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            io_workers: default_io_workers(),
            max_workers: default_max_workers(),
            worker_keep_alive_secs: default_keep_alive_secs(),
            max_request_size: default_max_request_size(),
            max_multipart_request_size: default_max_multipart_request_size(),
            chunk_capacity: default_chunk_capacity(),
            http1_keep_alive: true,
            http1_half_close: false,
            http1_max_buf_size: default_max_buf_size(),
            http1_title_case_headers: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::env;

    /// Tests that the default configuration values are set correctly.
    #[test]
    fn test_default_config() {
        let config = ServerConfig::default();
        assert_eq!(config.max_workers, num_cpus::get() * 15);
        assert_eq!(config.io_workers, num_cpus::get());
        assert_eq!(config.address(), "127.0.0.1:3000");
        assert_eq!(config.chunk_capacity, 1024);
        assert_eq!(
            config.body_limits(),
            BodyLimits {
                max_request_size: Some(10 * 1024 * 1024),
                max_multipart_request_size: Some(50 * 1024 * 1024),
            }
        );
    }

    /// Negative sizes disable a limit.
    #[test]
    fn test_unlimited_sizes() {
        let config = ServerConfig {
            max_request_size: -1,
            max_multipart_request_size: 0,
            ..ServerConfig::default()
        };
        let limits = config.body_limits();
        assert_eq!(limits.max_request_size, None);
        assert_eq!(limits.max_multipart_request_size, Some(0));
    }

    /// Tests configuration loading from "FERRITE_" environment variables.
    #[test]
    fn test_config_from_env() {
        env::set_var("FERRITE_PORT", "9000");
        env::set_var("FERRITE_HOST", "0.0.0.0");
        env::set_var("FERRITE_MAX_WORKERS", "4");
        env::set_var("FERRITE_MAX_REQUEST_SIZE", "-1");

        let config = ServerConfig::new().unwrap();
        assert_eq!(config.port, 9000);
        assert_eq!(config.host, "0.0.0.0");
        assert_eq!(config.max_workers, 4);
        assert_eq!(config.body_limits().max_request_size, None);

        env::remove_var("FERRITE_PORT");
        env::remove_var("FERRITE_HOST");
        env::remove_var("FERRITE_MAX_WORKERS");
        env::remove_var("FERRITE_MAX_REQUEST_SIZE");
    }
}
