//! # Cache Configuration
//!
//! Purpose: Settings for the persistent connection cache and the sessions it
//! creates. Durations are read as milliseconds when deserialized.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use csm_common::CoreErrorInfo;

/// What to do when the cache is full and nothing can be reclaimed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AdmissionPolicy {
    /// Log a warning and create the connection anyway.
    #[default]
    Soft,
    /// Reject the new connection with `quota_limited`.
    Strict,
}

/// Lifecycle limits for one connection session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionSettings {
    /// Longest wait for the cluster handle to close during `stop`.
    #[serde(with = "millis")]
    pub close_timeout: Duration,
    /// Longest wait for the I/O thread to exit after the loop was stopped.
    #[serde(with = "millis")]
    pub join_grace: Duration,
}

impl Default for SessionSettings {
    fn default() -> Self {
        SessionSettings {
            close_timeout: Duration::from_secs(10),
            join_grace: Duration::from_secs(5),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Live connection limit, `None` for unlimited. Zero is a valid limit:
    /// every miss must reclaim first, then falls back to `admission`.
    pub max_connections: Option<usize>,
    /// Idle time before an entry becomes evictable; zero disables idling,
    /// so entries expire as soon as they are handed out.
    #[serde(with = "millis")]
    pub idle_timeout: Duration,
    pub admission: AdmissionPolicy,
    pub session: SessionSettings,
}

impl Default for CacheConfig {
    fn default() -> Self {
        CacheConfig {
            max_connections: None,
            idle_timeout: Duration::ZERO,
            admission: AdmissionPolicy::Soft,
            session: SessionSettings::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("{0} must be greater than zero")]
    ZeroDuration(&'static str),
}

impl From<ConfigError> for CoreErrorInfo {
    #[track_caller]
    fn from(err: ConfigError) -> Self {
        CoreErrorInfo::invalid_argument(err.to_string())
    }
}

impl CacheConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.session.close_timeout.is_zero() {
            return Err(ConfigError::ZeroDuration("close_timeout"));
        }
        if self.session.join_grace.is_zero() {
            return Err(ConfigError::ZeroDuration("join_grace"));
        }
        Ok(())
    }
}

mod millis {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(u64::try_from(value.as_millis()).unwrap_or(u64::MAX))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}
