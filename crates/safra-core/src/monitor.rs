//! Periodic layout drift monitoring.
//!
//! A [`DriftMonitor`] captures a fresh [`Fingerprint`] per configured source
//! and scores it against that source's baseline. Drift is reported, not
//! raised; strict monitors (or strict contexts) escalate failed reports into
//! [`DriftError::Drift`].

use std::future::Future;
use std::path::PathBuf;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use crate::context::ExecutionContext;
use crate::error::{FetchError, ValidationError};
use crate::fingerprint::{
    validate_against_baseline, BaselineError, BaselineStore, DriftLevel, DriftReport, Fingerprint,
};

pub type CaptureFuture<'a> = Pin<Box<dyn Future<Output = Result<Fingerprint, FetchError>> + Send + 'a>>;

/// Produces a current fingerprint for one source.
pub trait FingerprintCapture: Send + Sync {
    fn source(&self) -> &str;

    fn capture<'a>(&'a self, ctx: &'a ExecutionContext) -> CaptureFuture<'a>;
}

#[derive(Debug, Error)]
pub enum DriftError {
    #[error("layout drift for '{source_name}': similarity {similarity:.2} ({level})")]
    Drift {
        source_name: String,
        similarity: f64,
        level: DriftLevel,
    },

    #[error("failed to capture fingerprint for '{source_name}'")]
    Capture {
        source_name: String,
        #[source]
        error: FetchError,
    },

    #[error(transparent)]
    Baseline(#[from] BaselineError),
}

pub struct DriftMonitor {
    baselines: BaselineStore,
    captures: Vec<Arc<dyn FingerprintCapture>>,
    strict: bool,
}

impl DriftMonitor {
    pub fn new(baselines: BaselineStore) -> Self {
        Self {
            baselines,
            captures: Vec::new(),
            strict: false,
        }
    }

    pub fn with_capture(mut self, capture: Arc<dyn FingerprintCapture>) -> Self {
        self.captures.push(capture);
        self
    }

    /// Turn failed reports into errors regardless of the context's strict flag.
    pub fn with_strict(mut self, strict: bool) -> Self {
        self.strict = strict;
        self
    }

    pub fn baselines(&self) -> &BaselineStore {
        &self.baselines
    }

    pub async fn check(
        &self,
        capture: &dyn FingerprintCapture,
        ctx: &ExecutionContext,
    ) -> Result<DriftReport, DriftError> {
        let current = capture
            .capture(ctx)
            .await
            .map_err(|error| DriftError::Capture {
                source_name: capture.source().to_owned(),
                error,
            })?;
        let report = validate_against_baseline(&current, &self.baselines)?;
        let similarity = report.similarity.unwrap_or(1.0);

        match report.level {
            DriftLevel::Unknown => info!(source = %report.source, "no baseline recorded"),
            DriftLevel::High => debug!(source = %report.source, similarity, "layout stable"),
            DriftLevel::Medium => warn!(source = %report.source, similarity, "minor layout drift"),
            DriftLevel::Low | DriftLevel::Critical => error!(
                source = %report.source,
                similarity,
                level = %report.level,
                "layout drift, parsers may be reading the wrong cells"
            ),
        }

        if !report.passed && (self.strict || ctx.is_strict()) {
            return Err(DriftError::Drift {
                source_name: report.source,
                similarity,
                level: report.level,
            });
        }
        Ok(report)
    }

    /// One pass over every configured source, in registration order.
    pub async fn run_once(&self, ctx: &ExecutionContext) -> Vec<Result<DriftReport, DriftError>> {
        let mut results = Vec::with_capacity(self.captures.len());
        for capture in &self.captures {
            results.push(self.check(capture.as_ref(), ctx).await);
        }
        results
    }

    /// Run `passes` passes, one per `period`. The first pass starts immediately.
    ///
    /// A zero `period` is rejected before any pass runs.
    pub async fn run_every(
        &self,
        period: Duration,
        passes: usize,
        ctx: &ExecutionContext,
    ) -> Result<Vec<Vec<Result<DriftReport, DriftError>>>, ValidationError> {
        if period.is_zero() {
            return Err(ValidationError::ZeroPeriod);
        }

        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let mut history = Vec::with_capacity(passes);
        for pass in 0..passes {
            ticker.tick().await;
            debug!(pass, sources = self.captures.len(), "drift monitor pass");
            history.push(self.run_once(ctx).await);
        }
        Ok(history)
    }

    /// Capture the source now and store the result as its baseline.
    pub async fn promote_baseline(
        &self,
        capture: &dyn FingerprintCapture,
        ctx: &ExecutionContext,
    ) -> Result<PathBuf, DriftError> {
        let fingerprint = capture
            .capture(ctx)
            .await
            .map_err(|error| DriftError::Capture {
                source_name: capture.source().to_owned(),
                error,
            })?;
        let path = self.baselines.save(&fingerprint)?;
        info!(source = %fingerprint.source, path = %path.display(), "baseline saved");
        Ok(path)
    }
}
