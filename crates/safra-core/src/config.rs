//! Runtime configuration.
//!
//! Every setting is optional. Values come from `SAFRA_*` environment variables
//! (see [`AcquisitionConfig::from_env`]) or from any serde source.
//!
//! | Variable | Meaning | Default |
//! |----------|---------|---------|
//! | `SAFRA_RATE_LIMIT_DEFAULT` | Minimum seconds between requests to one source | `1.0` |
//! | `SAFRA_RATE_LIMIT_<SOURCE>` | Per-source override | built-in table |
//! | `SAFRA_RETRY_MAX_ATTEMPTS` | Attempts per source, first one included | `3` |
//! | `SAFRA_RETRY_BASE_DELAY` | Seconds before the first retry | `1.0` |
//! | `SAFRA_RETRY_MAX_DELAY` | Backoff ceiling in seconds | `30.0` |
//! | `SAFRA_RETRY_EXPONENTIAL_BASE` | Backoff growth factor | `2.0` |
//! | `SAFRA_TIMEOUT_CONNECT` / `_READ` / `_WRITE` / `_POOL` | HTTP timeouts in seconds | `10 / 30 / 10 / 5` |
//! | `SAFRA_CACHE_TTL_<SOURCE>` | Cache TTL override in seconds | policy table |
//! | `SAFRA_CACHE_STALE_MAX_<SOURCE>` | Staleness ceiling override in seconds | policy table |
//! | `SAFRA_OFFLINE` | Never touch the network | `false` |
//! | `SAFRA_STRICT` | Treat anomalies as fatal | `false` |

use std::collections::BTreeMap;
use std::env;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{ConfigError, ValidationError};

const PREFIX: &str = "SAFRA_";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AcquisitionConfig {
    pub rate_limit: RateLimitSettings,
    pub retry: RetrySettings,
    pub timeouts: TimeoutSettings,
    /// Cache overrides keyed by lowercase source name.
    pub cache: BTreeMap<String, CacheOverride>,
    pub offline: bool,
    pub strict: bool,
}

impl Default for AcquisitionConfig {
    fn default() -> Self {
        Self {
            rate_limit: RateLimitSettings::default(),
            retry: RetrySettings::default(),
            timeouts: TimeoutSettings::default(),
            cache: BTreeMap::new(),
            offline: false,
            strict: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RateLimitSettings {
    pub default_interval_secs: f64,
    pub per_source_secs: BTreeMap<String, f64>,
}

impl Default for RateLimitSettings {
    fn default() -> Self {
        let per_source_secs = [
            ("cepea", 2.0),
            ("conab", 3.0),
            ("ibge", 1.0),
            ("noticias_agricolas", 2.0),
            ("inmet", 0.5),
        ]
        .into_iter()
        .map(|(source, secs)| (source.to_owned(), secs))
        .collect();

        Self {
            default_interval_secs: 1.0,
            per_source_secs,
        }
    }
}

impl RateLimitSettings {
    pub fn default_interval(&self) -> Duration {
        secs(self.default_interval_secs)
    }

    pub fn intervals(&self) -> impl Iterator<Item = (&str, Duration)> + '_ {
        self.per_source_secs
            .iter()
            .map(|(source, value)| (source.as_str(), secs(*value)))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetrySettings {
    pub max_attempts: u32,
    pub base_delay_secs: f64,
    pub max_delay_secs: f64,
    pub exponential_base: f64,
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay_secs: 1.0,
            max_delay_secs: 30.0,
            exponential_base: 2.0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TimeoutSettings {
    pub connect_secs: f64,
    pub read_secs: f64,
    pub write_secs: f64,
    pub pool_secs: f64,
}

impl Default for TimeoutSettings {
    fn default() -> Self {
        Self {
            connect_secs: 10.0,
            read_secs: 30.0,
            write_secs: 10.0,
            pool_secs: 5.0,
        }
    }
}

impl TimeoutSettings {
    pub fn connect(&self) -> Duration {
        secs(self.connect_secs)
    }

    pub fn read(&self) -> Duration {
        secs(self.read_secs)
    }

    pub fn write(&self) -> Duration {
        secs(self.write_secs)
    }

    pub fn pool(&self) -> Duration {
        secs(self.pool_secs)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheOverride {
    pub ttl_seconds: Option<u64>,
    pub stale_max_seconds: Option<u64>,
}

impl AcquisitionConfig {
    /// Build from the process environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_vars(env::vars())
    }

    /// Build from an explicit set of `(name, value)` pairs. Unrelated names are ignored.
    pub fn from_vars<I, K, V>(vars: I) -> Result<Self, ConfigError>
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<str>,
        V: AsRef<str>,
    {
        let mut config = Self::default();

        for (name, value) in vars {
            let name = name.as_ref();
            let value = value.as_ref().trim();
            let Some(setting) = name.strip_prefix(PREFIX) else {
                continue;
            };

            match setting {
                "RATE_LIMIT_DEFAULT" => {
                    config.rate_limit.default_interval_secs = parse_secs(name, value)?;
                }
                "RETRY_MAX_ATTEMPTS" => {
                    config.retry.max_attempts = parse_number(name, value)?;
                }
                "RETRY_BASE_DELAY" => config.retry.base_delay_secs = parse_secs(name, value)?,
                "RETRY_MAX_DELAY" => config.retry.max_delay_secs = parse_secs(name, value)?,
                "RETRY_EXPONENTIAL_BASE" => {
                    config.retry.exponential_base = parse_secs(name, value)?;
                }
                "TIMEOUT_CONNECT" => config.timeouts.connect_secs = parse_secs(name, value)?,
                "TIMEOUT_READ" => config.timeouts.read_secs = parse_secs(name, value)?,
                "TIMEOUT_WRITE" => config.timeouts.write_secs = parse_secs(name, value)?,
                "TIMEOUT_POOL" => config.timeouts.pool_secs = parse_secs(name, value)?,
                "OFFLINE" => config.offline = parse_flag(name, value)?,
                "STRICT" => config.strict = parse_flag(name, value)?,
                other => {
                    if let Some(source) = other.strip_prefix("RATE_LIMIT_") {
                        config
                            .rate_limit
                            .per_source_secs
                            .insert(source.to_ascii_lowercase(), parse_secs(name, value)?);
                    } else if let Some(source) = other.strip_prefix("CACHE_STALE_MAX_") {
                        config
                            .cache
                            .entry(source.to_ascii_lowercase())
                            .or_default()
                            .stale_max_seconds = Some(parse_number(name, value)?);
                    } else if let Some(source) = other.strip_prefix("CACHE_TTL_") {
                        config
                            .cache
                            .entry(source.to_ascii_lowercase())
                            .or_default()
                            .ttl_seconds = Some(parse_number(name, value)?);
                    }
                }
            }
        }

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.retry.max_attempts == 0 {
            return Err(ValidationError::ZeroAttempts);
        }
        for override_ in self.cache.values() {
            if let (Some(ttl), Some(stale_max)) = (override_.ttl_seconds, override_.stale_max_seconds)
            {
                if stale_max < ttl {
                    return Err(ValidationError::StaleWindowShorterThanTtl { ttl, stale_max });
                }
            }
        }
        Ok(())
    }
}

fn secs(value: f64) -> Duration {
    Duration::try_from_secs_f64(value).unwrap_or(Duration::ZERO)
}

fn parse_secs(var: &str, value: &str) -> Result<f64, ConfigError> {
    let parsed: f64 = value.parse().map_err(|_| invalid(var, value, "expected a number"))?;
    if !parsed.is_finite() || parsed < 0.0 {
        return Err(invalid(var, value, "expected a non-negative finite number"));
    }
    Ok(parsed)
}

fn parse_number<T: std::str::FromStr>(var: &str, value: &str) -> Result<T, ConfigError> {
    value
        .parse()
        .map_err(|_| invalid(var, value, "expected a non-negative integer"))
}

fn parse_flag(var: &str, value: &str) -> Result<bool, ConfigError> {
    match value.to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" | "" => Ok(false),
        _ => Err(invalid(var, value, "expected a boolean")),
    }
}

fn invalid(var: &str, value: &str, reason: &'static str) -> ConfigError {
    ConfigError::Invalid {
        var: var.to_owned(),
        value: value.to_owned(),
        reason,
    }
}
