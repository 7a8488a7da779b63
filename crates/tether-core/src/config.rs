// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Configuration loading from environment variables.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

/// Tunables applied to every agent instance.
#[derive(Debug, Clone)]
pub struct InstanceConfig {
    /// A running job flag older than this is force-reset on wake.
    pub schedule_stale_after: Duration,
    /// Buffered stream chunks are flushed once this many are pending.
    pub stream_flush_batch: usize,
    /// Hard cap on buffered stream chunks.
    pub stream_max_buffer: usize,
    /// Active streams older than this are deleted instead of offered for resume.
    pub stream_stale_after: Duration,
    /// Minimum time between finished-stream cleanup sweeps.
    pub stream_cleanup_interval: Duration,
    /// Finished streams older than this are deleted by the sweep.
    pub stream_retention: Duration,
    /// Newest state history entries kept; older ones are trimmed on write.
    pub state_history_limit: usize,
    /// Keep connection attachments after disconnect so a reconnect with the
    /// same connection id gets its attribute bag back.
    pub preserve_connection_state: bool,
}

impl Default for InstanceConfig {
    fn default() -> Self {
        Self {
            schedule_stale_after: Duration::from_secs(30),
            stream_flush_batch: 10,
            stream_max_buffer: 100,
            stream_stale_after: Duration::from_secs(5 * 60),
            stream_cleanup_interval: Duration::from_secs(10 * 60),
            stream_retention: Duration::from_secs(24 * 3600),
            state_history_limit: 1000,
            preserve_connection_state: true,
        }
    }
}

impl InstanceConfig {
    /// Load instance tunables from environment variables, falling back to defaults.
    ///
    /// Environment variables:
    /// - `TETHER_SCHEDULE_STALE_SECS` (default: 30)
    /// - `TETHER_STREAM_FLUSH_BATCH` (default: 10)
    /// - `TETHER_STREAM_MAX_BUFFER` (default: 100)
    /// - `TETHER_STREAM_STALE_SECS` (default: 300)
    /// - `TETHER_STREAM_CLEANUP_INTERVAL_SECS` (default: 600)
    /// - `TETHER_STREAM_RETENTION_SECS` (default: 86400)
    /// - `TETHER_STATE_HISTORY_LIMIT` (default: 1000)
    /// - `TETHER_PRESERVE_CONNECTION_STATE` (default: true)
    pub fn from_env() -> Result<Self, ConfigError> {
        let defaults = Self::default();

        let stream_flush_batch = parse_var(
            "TETHER_STREAM_FLUSH_BATCH",
            defaults.stream_flush_batch,
            "must be a positive integer",
        )?;
        let stream_max_buffer = parse_var(
            "TETHER_STREAM_MAX_BUFFER",
            defaults.stream_max_buffer,
            "must be a positive integer",
        )?;
        if stream_flush_batch == 0 {
            return Err(ConfigError::Invalid(
                "TETHER_STREAM_FLUSH_BATCH",
                "must be a positive integer",
            ));
        }
        let state_history_limit = parse_var(
            "TETHER_STATE_HISTORY_LIMIT",
            defaults.state_history_limit,
            "must be a positive integer",
        )?;
        if state_history_limit == 0 {
            return Err(ConfigError::Invalid(
                "TETHER_STATE_HISTORY_LIMIT",
                "must be a positive integer",
            ));
        }
        if stream_max_buffer < stream_flush_batch {
            return Err(ConfigError::Invalid(
                "TETHER_STREAM_MAX_BUFFER",
                "must not be smaller than TETHER_STREAM_FLUSH_BATCH",
            ));
        }

        Ok(Self {
            schedule_stale_after: Duration::from_secs(parse_var(
                "TETHER_SCHEDULE_STALE_SECS",
                defaults.schedule_stale_after.as_secs(),
                "must be a number of seconds",
            )?),
            stream_flush_batch,
            stream_max_buffer,
            stream_stale_after: Duration::from_secs(parse_var(
                "TETHER_STREAM_STALE_SECS",
                defaults.stream_stale_after.as_secs(),
                "must be a number of seconds",
            )?),
            stream_cleanup_interval: Duration::from_secs(parse_var(
                "TETHER_STREAM_CLEANUP_INTERVAL_SECS",
                defaults.stream_cleanup_interval.as_secs(),
                "must be a number of seconds",
            )?),
            stream_retention: Duration::from_secs(parse_var(
                "TETHER_STREAM_RETENTION_SECS",
                defaults.stream_retention.as_secs(),
                "must be a number of seconds",
            )?),
            state_history_limit,
            preserve_connection_state: std::env::var("TETHER_PRESERVE_CONNECTION_STATE")
                .map(|v| v == "true" || v == "1")
                .unwrap_or(defaults.preserve_connection_state),
        })
    }
}

/// Tether server configuration
#[derive(Debug, Clone)]
pub struct Config {
    /// Directory holding one SQLite database per instance
    pub data_dir: PathBuf,
    /// HTTP/WebSocket server address
    pub http_addr: SocketAddr,
    /// Instances without connections or pending alarms are evicted after this long
    pub idle_timeout: Duration,
    /// Per-instance tunables
    pub instance: InstanceConfig,
}

impl Config {
    /// Load configuration from environment variables.
    ///
    /// Optional (with defaults):
    /// - `TETHER_DATA_DIR`: instance database directory (default: .data)
    /// - `TETHER_HTTP_PORT`: HTTP server port (default: 8787)
    /// - `TETHER_IDLE_TIMEOUT_SECS`: idle eviction timeout (default: 300)
    ///
    /// Instance tunables are read by [`InstanceConfig::from_env`].
    pub fn from_env() -> Result<Self, ConfigError> {
        let data_dir = std::env::var("TETHER_DATA_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from(".data"));

        let http_port: u16 = std::env::var("TETHER_HTTP_PORT")
            .unwrap_or_else(|_| "8787".to_string())
            .parse()
            .map_err(|_| ConfigError::Invalid("TETHER_HTTP_PORT", "must be a valid port number"))?;

        let idle_timeout_secs: u64 = parse_var(
            "TETHER_IDLE_TIMEOUT_SECS",
            300,
            "must be a number of seconds",
        )?;

        Ok(Self {
            data_dir,
            http_addr: SocketAddr::from(([0, 0, 0, 0], http_port)),
            idle_timeout: Duration::from_secs(idle_timeout_secs),
            instance: InstanceConfig::from_env()?,
        })
    }
}

fn parse_var<T: std::str::FromStr>(
    name: &'static str,
    default: T,
    reason: &'static str,
) -> Result<T, ConfigError> {
    match std::env::var(name) {
        Ok(value) => value.parse().map_err(|_| ConfigError::Invalid(name, reason)),
        Err(_) => Ok(default),
    }
}

/// Configuration errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// A required environment variable is missing.
    #[error("missing required environment variable: {0}")]
    Missing(&'static str),

    /// An environment variable has an invalid value.
    #[error("invalid value for {0}: {1}")]
    Invalid(&'static str, &'static str),
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::env;
    use std::sync::Mutex;

    // Mutex to serialize tests that modify environment variables
    static ENV_MUTEX: Mutex<()> = Mutex::new(());

    /// Helper to set env vars for a test and restore them after
    struct EnvGuard {
        vars: Vec<(String, Option<String>)>,
    }

    impl EnvGuard {
        fn new() -> Self {
            Self { vars: Vec::new() }
        }

        fn set(&mut self, key: &str, value: &str) {
            let old = env::var(key).ok();
            self.vars.push((key.to_string(), old));
            // SAFETY: Tests are serialized via ENV_MUTEX, so no concurrent access
            unsafe { env::set_var(key, value) };
        }

        fn remove(&mut self, key: &str) {
            let old = env::var(key).ok();
            self.vars.push((key.to_string(), old));
            // SAFETY: Tests are serialized via ENV_MUTEX, so no concurrent access
            unsafe { env::remove_var(key) };
        }

        fn clear_all(&mut self) {
            for key in [
                "TETHER_DATA_DIR",
                "TETHER_HTTP_PORT",
                "TETHER_IDLE_TIMEOUT_SECS",
                "TETHER_SCHEDULE_STALE_SECS",
                "TETHER_STREAM_FLUSH_BATCH",
                "TETHER_STREAM_MAX_BUFFER",
                "TETHER_STREAM_STALE_SECS",
                "TETHER_STREAM_CLEANUP_INTERVAL_SECS",
                "TETHER_STREAM_RETENTION_SECS",
                "TETHER_STATE_HISTORY_LIMIT",
                "TETHER_PRESERVE_CONNECTION_STATE",
            ] {
                self.remove(key);
            }
        }
    }

    impl Drop for EnvGuard {
        fn drop(&mut self) {
            for (key, value) in self.vars.drain(..).rev() {
                // SAFETY: Tests are serialized via ENV_MUTEX, so no concurrent access
                unsafe {
                    match value {
                        Some(v) => env::set_var(&key, v),
                        None => env::remove_var(&key),
                    }
                }
            }
        }
    }

    #[test]
    fn test_config_from_env_with_defaults() {
        let _lock = ENV_MUTEX.lock().unwrap();
        let mut guard = EnvGuard::new();
        guard.clear_all();

        let config = Config::from_env().unwrap();

        assert_eq!(config.data_dir, PathBuf::from(".data"));
        assert_eq!(config.http_addr.port(), 8787);
        assert_eq!(config.idle_timeout, Duration::from_secs(300));
        assert_eq!(config.instance.schedule_stale_after, Duration::from_secs(30));
        assert_eq!(config.instance.stream_flush_batch, 10);
        assert_eq!(config.instance.stream_max_buffer, 100);
        assert_eq!(config.instance.stream_stale_after, Duration::from_secs(300));
        assert_eq!(
            config.instance.stream_cleanup_interval,
            Duration::from_secs(600)
        );
        assert_eq!(config.instance.stream_retention, Duration::from_secs(86400));
        assert_eq!(config.instance.state_history_limit, 1000);
        assert!(config.instance.preserve_connection_state);
    }

    #[test]
    fn test_config_from_env_custom() {
        let _lock = ENV_MUTEX.lock().unwrap();
        let mut guard = EnvGuard::new();
        guard.clear_all();

        guard.set("TETHER_DATA_DIR", "/var/lib/tether");
        guard.set("TETHER_HTTP_PORT", "9000");
        guard.set("TETHER_SCHEDULE_STALE_SECS", "5");
        guard.set("TETHER_STATE_HISTORY_LIMIT", "50");
        guard.set("TETHER_PRESERVE_CONNECTION_STATE", "false");

        let config = Config::from_env().unwrap();
        assert_eq!(config.instance.state_history_limit, 50);

        assert_eq!(config.data_dir, PathBuf::from("/var/lib/tether"));
        assert_eq!(config.http_addr.port(), 9000);
        assert_eq!(config.instance.schedule_stale_after, Duration::from_secs(5));
        assert!(!config.instance.preserve_connection_state);
    }

    #[test]
    fn test_config_invalid_http_port() {
        let _lock = ENV_MUTEX.lock().unwrap();
        let mut guard = EnvGuard::new();
        guard.clear_all();

        guard.set("TETHER_HTTP_PORT", "99999");

        let err = Config::from_env().unwrap_err();
        assert!(matches!(err, ConfigError::Invalid("TETHER_HTTP_PORT", _)));
    }

    #[test]
    fn test_instance_config_rejects_buffer_smaller_than_batch() {
        let _lock = ENV_MUTEX.lock().unwrap();
        let mut guard = EnvGuard::new();
        guard.clear_all();

        guard.set("TETHER_STREAM_FLUSH_BATCH", "50");
        guard.set("TETHER_STREAM_MAX_BUFFER", "20");

        let err = InstanceConfig::from_env().unwrap_err();
        assert!(matches!(
            err,
            ConfigError::Invalid("TETHER_STREAM_MAX_BUFFER", _)
        ));
    }

    #[test]
    fn test_instance_config_rejects_garbage() {
        let _lock = ENV_MUTEX.lock().unwrap();
        let mut guard = EnvGuard::new();
        guard.clear_all();

        guard.set("TETHER_STREAM_STALE_SECS", "soon");

        let err = InstanceConfig::from_env().unwrap_err();
        assert!(err.to_string().contains("TETHER_STREAM_STALE_SECS"));
    }

    #[test]
    fn test_config_error_display() {
        let missing = ConfigError::Missing("MY_VAR");
        assert_eq!(
            missing.to_string(),
            "missing required environment variable: MY_VAR"
        );

        let invalid = ConfigError::Invalid("MY_VAR", "must be a number");
        assert_eq!(
            invalid.to_string(),
            "invalid value for MY_VAR: must be a number"
        );
    }
}
