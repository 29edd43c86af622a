//! Cache freshness policies.
//!
//! A [`CachePolicy`] says how long a cached payload is fresh (`ttl_seconds`),
//! how long it may still be served when every source is down
//! (`stale_max_seconds`), and whether freshness follows a publish schedule
//! instead of a rolling TTL (`smart_expiry`).
//!
//! Smart-expiry sources publish once a day; an entry is fresh until the next
//! publish cutoff, [`SMART_CUTOFF_TIME`] at [`SMART_CUTOFF_OFFSET`].
//!
//! | Key | TTL | Stale max | Smart |
//! |-----|-----|-----------|-------|
//! | `cepea` | 24h | 7d | yes |
//! | `conab` | 7d | 30d | no |
//! | `conab_safras` | 30d | 90d | no |
//! | `ibge` | 30d | 90d | no |
//! | `noticias_agricolas` | 4h | 7d | no |
//! | `inmet` | 1h | 24h | no |
//! | `bcb` | 24h | 30d | no |
//! | default | 1h | 24h | no |
//!
//! Every function here takes `now` explicitly, usually from
//! [`ExecutionContext::now`](crate::ExecutionContext::now).

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use time::macros::{offset, time};
use time::{Duration, OffsetDateTime, Time, UtcOffset};

use crate::config::CacheOverride;
use crate::error::ValidationError;

pub const SMART_CUTOFF_TIME: Time = time!(18:00);
pub const SMART_CUTOFF_OFFSET: UtcOffset = offset!(-3);

const HOUR: u64 = 3_600;
const DAY: u64 = 24 * HOUR;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CachePolicy {
    pub ttl_seconds: u64,
    pub stale_max_seconds: u64,
    pub smart_expiry: bool,
    pub description: String,
}

impl CachePolicy {
    pub fn new(
        ttl_seconds: u64,
        stale_max_seconds: u64,
        smart_expiry: bool,
        description: impl Into<String>,
    ) -> Result<Self, ValidationError> {
        let policy = Self {
            ttl_seconds,
            stale_max_seconds,
            smart_expiry,
            description: description.into(),
        };
        policy.validate()?;
        Ok(policy)
    }

    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.stale_max_seconds < self.ttl_seconds {
            return Err(ValidationError::StaleWindowShorterThanTtl {
                ttl: self.ttl_seconds,
                stale_max: self.stale_max_seconds,
            });
        }
        Ok(())
    }

    fn ttl(&self) -> Duration {
        seconds(self.ttl_seconds)
    }

    fn stale_max(&self) -> Duration {
        seconds(self.stale_max_seconds)
    }
}

/// Why [`should_refresh`] decided the way it did.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RefreshReason {
    Force,
    Expired,
    Fresh,
}

impl RefreshReason {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Force => "force",
            Self::Expired => "expired",
            Self::Fresh => "fresh",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RefreshDecision {
    pub refresh: bool,
    pub reason: RefreshReason,
}

pub fn is_expired(created_at: OffsetDateTime, policy: &CachePolicy, now: OffsetDateTime) -> bool {
    if policy.smart_expiry {
        created_at < last_cutoff(now)
    } else {
        now > created_at.saturating_add(policy.ttl())
    }
}

pub fn is_stale_acceptable(
    created_at: OffsetDateTime,
    policy: &CachePolicy,
    now: OffsetDateTime,
) -> bool {
    now <= created_at.saturating_add(policy.stale_max())
}

/// Expiry instant for an entry written at `now`.
pub fn calculate_expiry(policy: &CachePolicy, now: OffsetDateTime) -> OffsetDateTime {
    if policy.smart_expiry {
        next_cutoff(now)
    } else {
        now.saturating_add(policy.ttl())
    }
}

pub fn should_refresh(
    created_at: OffsetDateTime,
    policy: &CachePolicy,
    force: bool,
    now: OffsetDateTime,
) -> RefreshDecision {
    let (refresh, reason) = if force {
        (true, RefreshReason::Force)
    } else if is_expired(created_at, policy, now) || !is_stale_acceptable(created_at, policy, now) {
        (true, RefreshReason::Expired)
    } else {
        (false, RefreshReason::Fresh)
    };
    RefreshDecision { refresh, reason }
}

/// Seconds from `now` until [`calculate_expiry`], the TTL handed to the cache store.
pub fn ttl_from_now(policy: &CachePolicy, now: OffsetDateTime) -> u64 {
    let remaining = calculate_expiry(policy, now) - now;
    u64::try_from(remaining.whole_seconds()).unwrap_or(0)
}

fn cutoff_on_day(now: OffsetDateTime) -> OffsetDateTime {
    now.to_offset(SMART_CUTOFF_OFFSET)
        .replace_time(SMART_CUTOFF_TIME)
}

/// Most recent cutoff at or before `now`.
fn last_cutoff(now: OffsetDateTime) -> OffsetDateTime {
    let today = cutoff_on_day(now);
    let cutoff = if now >= today {
        today
    } else {
        today - Duration::DAY
    };
    cutoff.to_offset(UtcOffset::UTC)
}

/// First cutoff strictly after `now`.
fn next_cutoff(now: OffsetDateTime) -> OffsetDateTime {
    let today = cutoff_on_day(now);
    let cutoff = if now < today {
        today
    } else {
        today + Duration::DAY
    };
    cutoff.to_offset(UtcOffset::UTC)
}

fn seconds(value: u64) -> Duration {
    Duration::seconds(i64::try_from(value).unwrap_or(i64::MAX))
}

/// Policy lookup table.
///
/// Lookup tries `{source}_{endpoint}`, then `{source}`, then the default
/// policy, so unknown sources always get the conservative default.
#[derive(Debug, Clone)]
pub struct PolicyRegistry {
    policies: HashMap<String, CachePolicy>,
    default: CachePolicy,
}

impl Default for PolicyRegistry {
    fn default() -> Self {
        Self::builtin()
    }
}

impl PolicyRegistry {
    /// Only the default policy.
    pub fn empty() -> Self {
        Self {
            policies: HashMap::new(),
            default: unchecked(HOUR, DAY, false, "Default policy"),
        }
    }

    pub fn builtin() -> Self {
        let mut registry = Self::empty();
        let table = [
            ("cepea", unchecked(DAY, 7 * DAY, true, "CEPEA daily indicators, published around 18:00")),
            ("conab", unchecked(7 * DAY, 30 * DAY, false, "CONAB weekly prices")),
            ("conab_safras", unchecked(30 * DAY, 90 * DAY, false, "CONAB monthly crop survey")),
            ("ibge", unchecked(30 * DAY, 90 * DAY, false, "IBGE monthly statistics")),
            ("noticias_agricolas", unchecked(4 * HOUR, 7 * DAY, false, "Noticias Agricolas quotes")),
            ("inmet", unchecked(HOUR, DAY, false, "INMET hourly weather")),
            ("bcb", unchecked(DAY, 30 * DAY, false, "BCB daily rates")),
        ];
        for (key, policy) in table {
            registry.policies.insert(key.to_owned(), policy);
        }
        registry
    }

    pub fn insert(&mut self, key: impl Into<String>, policy: CachePolicy) -> Result<(), ValidationError> {
        policy.validate()?;
        self.policies.insert(key.into(), policy);
        Ok(())
    }

    pub fn set_default(&mut self, policy: CachePolicy) -> Result<(), ValidationError> {
        policy.validate()?;
        self.default = policy;
        Ok(())
    }

    pub fn get(&self, source: &str, endpoint: Option<&str>) -> &CachePolicy {
        endpoint
            .and_then(|endpoint| self.policies.get(&format!("{source}_{endpoint}")))
            .or_else(|| self.policies.get(source))
            .unwrap_or(&self.default)
    }

    pub fn default_policy(&self) -> &CachePolicy {
        &self.default
    }

    /// Overlay per-source TTL and staleness overrides.
    ///
    /// An override for a source without its own policy starts from the default.
    pub fn apply_overrides<'a, I>(&mut self, overrides: I) -> Result<(), ValidationError>
    where
        I: IntoIterator<Item = (&'a String, &'a CacheOverride)>,
    {
        for (source, override_) in overrides {
            let mut policy = self.get(source, None).clone();
            if let Some(ttl) = override_.ttl_seconds {
                policy.ttl_seconds = ttl;
            }
            if let Some(stale_max) = override_.stale_max_seconds {
                policy.stale_max_seconds = stale_max;
            }
            self.insert(source.clone(), policy)?;
        }
        Ok(())
    }
}

fn unchecked(ttl_seconds: u64, stale_max_seconds: u64, smart_expiry: bool, description: &str) -> CachePolicy {
    CachePolicy {
        ttl_seconds,
        stale_max_seconds,
        smart_expiry,
        description: description.to_owned(),
    }
}
