//! Configuration for the WAL writer and the replication relay.
//!
//! Configuration is loaded externally (file, env, CLI) and is immutable
//! after startup. Validation happens in constructors so that a bad value
//! can never reach the WAL thread.

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Default WAL segment size limit: 256 MiB.
pub const DEFAULT_WAL_MAX_SIZE: u64 = 256 * 1024 * 1024;

/// Default replication timeout in seconds. If no row has been sent to a
/// follower for this long, the relay emits a heartbeat.
pub const DEFAULT_REPLICATION_TIMEOUT: f64 = 1.0;

/// The disconnect timeout is this multiple of the replication timeout.
/// A follower that has not acked for that long is considered gone.
pub const DISCONNECT_TIMEOUT_FACTOR: f64 = 4.0;

/// Configuration errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("wal_max_size must be positive, got {0}")]
    InvalidMaxSize(u64),
    #[error("replication_timeout must be positive, got {0}")]
    InvalidTimeout(f64),
    #[error("wal_dir must not be empty")]
    EmptyWalDir,
}

/// Durability mode of the WAL.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WalMode {
    /// No write-ahead logging. LSNs are assigned synchronously and no
    /// durability is provided. Used by tests and throwaway instances.
    None,
    /// Write rows to disk and flush userspace buffers on every batch.
    Write,
    /// Like `Write`, but the segment file is opened with O_SYNC semantics
    /// so every flush reaches the platter before the batch completes.
    Fsync,
}

impl WalMode {
    /// String form used in configuration files and logs.
    pub fn as_str(&self) -> &'static str {
        match self {
            WalMode::None => "none",
            WalMode::Write => "write",
            WalMode::Fsync => "fsync",
        }
    }
}

impl Default for WalMode {
    fn default() -> Self {
        WalMode::Write
    }
}

/// WAL writer configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WalConfig {
    /// Durability mode.
    #[serde(default)]
    pub mode: WalMode,
    /// Directory holding the segment files. Singleton per process.
    pub dir: PathBuf,
    /// Rotate the current segment once it grows past this many bytes.
    #[serde(default = "default_wal_max_size")]
    pub max_size: u64,
}

fn default_wal_max_size() -> u64 {
    DEFAULT_WAL_MAX_SIZE
}

impl WalConfig {
    /// Create a validated configuration.
    pub fn new(mode: WalMode, dir: impl Into<PathBuf>, max_size: u64) -> Result<Self, ConfigError> {
        let dir = dir.into();
        if dir.as_os_str().is_empty() {
            return Err(ConfigError::EmptyWalDir);
        }
        if max_size == 0 {
            return Err(ConfigError::InvalidMaxSize(max_size));
        }
        Ok(Self { mode, dir, max_size })
    }

    /// Configuration with defaults for everything but the directory.
    pub fn with_dir(dir: impl Into<PathBuf>) -> Result<Self, ConfigError> {
        Self::new(WalMode::default(), dir, DEFAULT_WAL_MAX_SIZE)
    }
}

/// Replication relay configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReplicationConfig {
    /// Heartbeat interval in seconds.
    #[serde(default = "default_replication_timeout")]
    pub timeout: f64,
}

fn default_replication_timeout() -> f64 {
    DEFAULT_REPLICATION_TIMEOUT
}

impl ReplicationConfig {
    /// Create a validated configuration.
    pub fn new(timeout: f64) -> Result<Self, ConfigError> {
        if !timeout.is_finite() || timeout <= 0.0 {
            return Err(ConfigError::InvalidTimeout(timeout));
        }
        Ok(Self { timeout })
    }

    /// Heartbeat interval as a `Duration`.
    pub fn timeout(&self) -> Duration {
        Duration::from_secs_f64(self.timeout)
    }

    /// How long the ack reader waits for a frame before declaring the
    /// follower disconnected.
    pub fn disconnect_timeout(&self) -> Duration {
        Duration::from_secs_f64(self.timeout * DISCONNECT_TIMEOUT_FACTOR)
    }
}

impl Default for ReplicationConfig {
    fn default() -> Self {
        Self { timeout: DEFAULT_REPLICATION_TIMEOUT }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wal_mode_strings() {
        assert_eq!(WalMode::None.as_str(), "none");
        assert_eq!(WalMode::Write.as_str(), "write");
        assert_eq!(WalMode::Fsync.as_str(), "fsync");
    }

    #[test]
    fn test_wal_config_defaults() {
        let config = WalConfig::with_dir("/tmp/wal").unwrap();
        assert_eq!(config.mode, WalMode::Write);
        assert_eq!(config.max_size, DEFAULT_WAL_MAX_SIZE);
    }

    #[test]
    fn test_wal_config_rejects_zero_max_size() {
        assert!(WalConfig::new(WalMode::Write, "/tmp/wal", 0).is_err());
    }

    #[test]
    fn test_wal_config_rejects_empty_dir() {
        assert!(WalConfig::new(WalMode::Write, "", 1024).is_err());
    }

    #[test]
    fn test_replication_config_rejects_bad_timeout() {
        assert!(ReplicationConfig::new(0.0).is_err());
        assert!(ReplicationConfig::new(-1.0).is_err());
        assert!(ReplicationConfig::new(f64::NAN).is_err());
    }

    #[test]
    fn test_disconnect_timeout_is_multiple() {
        let config = ReplicationConfig::new(0.5).unwrap();
        assert_eq!(config.disconnect_timeout(), Duration::from_secs_f64(2.0));
    }

    #[test]
    fn test_wal_mode_deserializes_lowercase() {
        let mode: WalMode = serde_json::from_str("\"fsync\"").unwrap();
        assert_eq!(mode, WalMode::Fsync);
    }

    #[test]
    fn test_wal_config_deserializes_with_defaults() {
        let config: WalConfig = serde_json::from_str(r#"{"dir": "/var/lib/rill/wal"}"#).unwrap();
        assert_eq!(config.mode, WalMode::Write);
        assert_eq!(config.max_size, DEFAULT_WAL_MAX_SIZE);
    }
}
