//! # Host Settings
//!
//! Purpose: Parse the ini-style `csm.*` settings the embedding host is
//! configured with and turn them into a `CacheConfig`.

use std::time::Duration;

use tracing::warn;

use csm_common::{CoreErrorInfo, CoreResult};
use csm_session::{AdmissionPolicy, CacheConfig};

pub const MAX_PERSISTENT: &str = "csm.max_persistent";
pub const PERSISTENT_TIMEOUT: &str = "csm.persistent_timeout";
pub const ADMISSION: &str = "csm.admission";
pub const LOG_LEVEL: &str = "csm.log_level";

const LOG_LEVELS: [&str; 6] = ["trace", "debug", "info", "warn", "error", "off"];

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostSettings {
    /// `None` for unlimited (`-1`).
    pub max_persistent: Option<usize>,
    /// `None` when idling is disabled (`-1` or `0`).
    pub persistent_timeout: Option<Duration>,
    pub admission: AdmissionPolicy,
    pub log_level: String,
}

impl Default for HostSettings {
    fn default() -> Self {
        HostSettings {
            max_persistent: None,
            persistent_timeout: None,
            admission: AdmissionPolicy::Soft,
            log_level: "warn".to_string(),
        }
    }
}

impl HostSettings {
    /// Parses `key = value` pairs; unknown keys are ignored with a warning.
    pub fn from_pairs<'a, I>(pairs: I) -> CoreResult<Self>
    where
        I: IntoIterator<Item = (&'a str, &'a str)>,
    {
        let mut settings = HostSettings::default();
        for (key, value) in pairs {
            let value = value.trim();
            match key.trim() {
                MAX_PERSISTENT => {
                    settings.max_persistent = match parse_signed(key, value)? {
                        -1 => None,
                        n if n >= 0 => Some(n as usize),
                        _ => return Err(invalid(key, value)),
                    }
                }
                PERSISTENT_TIMEOUT => {
                    settings.persistent_timeout = match parse_signed(key, value)? {
                        -1 | 0 => None,
                        n if n > 0 => Some(Duration::from_secs(n as u64)),
                        _ => return Err(invalid(key, value)),
                    }
                }
                ADMISSION => {
                    settings.admission = match value {
                        "soft" => AdmissionPolicy::Soft,
                        "strict" => AdmissionPolicy::Strict,
                        _ => return Err(invalid(key, value)),
                    }
                }
                LOG_LEVEL => {
                    let level = value.to_ascii_lowercase();
                    if !LOG_LEVELS.contains(&level.as_str()) {
                        return Err(invalid(key, value));
                    }
                    settings.log_level = level;
                }
                other => warn!(key = other, "ignoring unknown setting"),
            }
        }
        Ok(settings)
    }

    /// Parses an ini fragment (`key = value` lines, `;` and `#` comments).
    pub fn parse(text: &str) -> CoreResult<Self> {
        let pairs = text
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty() && !line.starts_with(';') && !line.starts_with('#'))
            .filter_map(|line| line.split_once('='));
        Self::from_pairs(pairs)
    }

    pub fn cache_config(&self) -> CacheConfig {
        CacheConfig {
            max_connections: self.max_persistent,
            idle_timeout: self.persistent_timeout.unwrap_or(Duration::ZERO),
            admission: self.admission,
            ..CacheConfig::default()
        }
    }
}

fn parse_signed(key: &str, value: &str) -> CoreResult<i64> {
    value.parse().map_err(|_| invalid(key, value))
}

#[track_caller]
fn invalid(key: &str, value: &str) -> CoreErrorInfo {
    CoreErrorInfo::invalid_argument(format!("invalid value for {}: {}", key.trim(), value))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_unlimited_and_disabled() {
        let settings = HostSettings::parse("").unwrap();
        assert_eq!(settings, HostSettings::default());
        let config = settings.cache_config();
        assert_eq!(config.max_connections, None);
        assert_eq!(config.idle_timeout, Duration::ZERO);
    }

    #[test]
    fn parses_ini_fragment() {
        let settings = HostSettings::parse(
            "; connection cache\n\
             csm.max_persistent = 4\n\
             csm.persistent_timeout = 30\n\
             csm.admission = strict\n\
             csm.log_level = DEBUG\n\
             csm.unknown = 1\n",
        )
        .unwrap();
        assert_eq!(settings.max_persistent, Some(4));
        assert_eq!(settings.persistent_timeout, Some(Duration::from_secs(30)));
        assert_eq!(settings.admission, AdmissionPolicy::Strict);
        assert_eq!(settings.log_level, "debug");
    }

    #[test]
    fn rejects_malformed_values() {
        let err = HostSettings::from_pairs([(MAX_PERSISTENT, "many")]).unwrap_err();
        assert_eq!(err.message, "invalid value for csm.max_persistent: many");
        assert!(HostSettings::from_pairs([(PERSISTENT_TIMEOUT, "-5")]).is_err());
        assert!(HostSettings::from_pairs([(LOG_LEVEL, "loud")]).is_err());
    }
}
