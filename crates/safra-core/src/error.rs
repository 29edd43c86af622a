use std::fmt::{Display, Formatter};
use std::time::Duration;

use safra_warehouse::WarehouseError;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use time::Date;

/// Coarse failure classes the orchestrator records per attempted source.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    Network,
    Parse,
    Contract,
    Unexpected,
}

impl FailureKind {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Network => "network",
            Self::Parse => "parse",
            Self::Contract => "contract",
            Self::Unexpected => "unexpected",
        }
    }
}

impl Display for FailureKind {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error returned by a [`SourceFetch`](crate::SourceFetch) implementation.
///
/// Collaborators pick the variant; the orchestrator only pattern-matches on it.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FetchError {
    /// Transport failure or non-success HTTP status.
    #[error("network error{}: {message}", status_suffix(.status))]
    Network {
        message: String,
        status: Option<u16>,
        retryable: bool,
    },

    #[error("request timed out after {after:?}")]
    Timeout { after: Duration },

    /// The upstream answered with a recognised blocking page.
    #[error("blocked by {provider} (HTTP {status})")]
    HardBlock { status: u16, provider: String },

    /// Payload was fetched but could not be interpreted.
    #[error("parse error: {0}")]
    Parse(String),

    /// Payload was parsed but failed its schema contract.
    #[error("contract violation: {0}")]
    Contract(String),

    #[error("unexpected error: {0}")]
    Unexpected(String),

    /// The source's circuit breaker is open; no request was sent.
    #[error("circuit open for '{source_name}', request skipped")]
    CircuitOpen { source_name: String },

    #[error("offline mode, network access disabled")]
    Offline,
}

impl FetchError {
    /// Retryable transport failure.
    pub fn network(message: impl Into<String>) -> Self {
        Self::Network {
            message: message.into(),
            status: None,
            retryable: true,
        }
    }

    /// Non-success HTTP status, retryable when the status is in the transient set.
    pub fn status(status: u16, message: impl Into<String>) -> Self {
        Self::Network {
            message: message.into(),
            status: Some(status),
            retryable: crate::retry::should_retry_status(status),
        }
    }

    pub fn parse(message: impl Into<String>) -> Self {
        Self::Parse(message.into())
    }

    pub fn contract(message: impl Into<String>) -> Self {
        Self::Contract(message.into())
    }

    pub fn unexpected(message: impl Into<String>) -> Self {
        Self::Unexpected(message.into())
    }

    pub fn hard_block(status: u16, provider: impl Into<String>) -> Self {
        Self::HardBlock {
            status,
            provider: provider.into(),
        }
    }

    pub const fn kind(&self) -> FailureKind {
        match self {
            Self::Network { .. }
            | Self::Timeout { .. }
            | Self::HardBlock { .. }
            | Self::CircuitOpen { .. }
            | Self::Offline => FailureKind::Network,
            Self::Parse(_) => FailureKind::Parse,
            Self::Contract(_) => FailureKind::Contract,
            Self::Unexpected(_) => FailureKind::Unexpected,
        }
    }

    /// Whether the retry executor may attempt the same source again.
    pub const fn is_retryable(&self) -> bool {
        match self {
            Self::Network { retryable, .. } => *retryable,
            Self::Timeout { .. } => true,
            _ => false,
        }
    }

    pub const fn is_hard_block(&self) -> bool {
        matches!(self, Self::HardBlock { .. })
    }
}

fn status_suffix(status: &Option<u16>) -> String {
    status.map(|code| format!(" (HTTP {code})")).unwrap_or_default()
}

/// One failed source in an attempt log.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceFailure {
    pub source_name: String,
    pub kind: FailureKind,
    pub message: String,
}

impl SourceFailure {
    pub fn new(source_name: impl Into<String>, error: &FetchError) -> Self {
        Self {
            source_name: source_name.into(),
            kind: error.kind(),
            message: error.to_string(),
        }
    }
}

impl Display for SourceFailure {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} [{}]: {}", self.source_name, self.kind, self.message)
    }
}

/// Terminal failures of an acquisition request.
#[derive(Debug, Error)]
pub enum AcquisitionError {
    /// Every candidate source failed or none was enabled.
    #[error("{}", describe_unavailable(.request_key, .failures))]
    SourceUnavailable {
        request_key: String,
        failures: Vec<SourceFailure>,
    },

    #[error("offline mode and no cached payload for '{key}'")]
    OfflineMiss { key: String },

    #[error("no snapshot of '{key}' recorded for {date}")]
    SnapshotMiss { key: String, date: Date },

    #[error("no sources registered for dataset '{dataset}'")]
    UnknownDataset { dataset: String },

    #[error(transparent)]
    Cache(#[from] WarehouseError),
}

impl AcquisitionError {
    /// Per-source failures, empty for errors that never reached a source.
    pub fn failures(&self) -> &[SourceFailure] {
        match self {
            Self::SourceUnavailable { failures, .. } => failures,
            _ => &[],
        }
    }
}

fn describe_unavailable(request_key: &str, failures: &[SourceFailure]) -> String {
    if failures.is_empty() {
        return format!("no enabled source available for '{request_key}'");
    }

    let detail = failures
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ");
    format!(
        "all {} source(s) failed for '{request_key}': {detail}",
        failures.len()
    )
}

/// Invariant violations in user-supplied policies and registrations.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ValidationError {
    #[error("stale_max_seconds ({stale_max}) must be >= ttl_seconds ({ttl})")]
    StaleWindowShorterThanTtl { ttl: u64, stale_max: u64 },
    #[error("source name cannot be empty")]
    EmptySourceName,
    #[error("source '{name}' is already registered for dataset '{dataset}'")]
    DuplicateSource { dataset: String, name: String },
    #[error("max_attempts must be at least 1")]
    ZeroAttempts,
    #[error("fan-out limit must be at least 1")]
    ZeroConcurrency,
    #[error("monitor period must be greater than zero")]
    ZeroPeriod,
}

/// Malformed configuration values.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("invalid value for {var}: '{value}' ({reason})")]
    Invalid {
        var: String,
        value: String,
        reason: &'static str,
    },

    #[error(transparent)]
    Validation(#[from] ValidationError),
}

/// Top-level error type for core operations.
#[derive(Debug, Error)]
pub enum CoreError {
    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Acquisition(#[from] AcquisitionError),

    #[error(transparent)]
    Drift(#[from] crate::monitor::DriftError),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}
