//! The public evaluation façade.

use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::time::Instant;
use tracing::{debug, warn};

use super::algorithm::Algorithm;
use super::evaluator::{LimitEvaluator, Mode};
use super::limit::LimitSpec;
use crate::config::TurnstileConfig;
use crate::error::{Result, TurnstileError};
use crate::store::{FailureMode, Store, StoreError};

/// The verdict for one request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Decision {
    /// Whether every limit admitted the request
    pub allowed: bool,
    /// How long to wait before retrying; zero when allowed
    pub retry_after: Duration,
    /// One status per requested limit, in request order
    pub per_limit: Vec<LimitStatus>,
    /// Whether the shared store was unreachable and the failure mode decided
    pub degraded: bool,
}

impl Decision {
    /// Build the decision dictated by `mode` when the store is unreachable.
    ///
    /// Fail-open admits without recording anything. Fail-closed denies and
    /// suggests retrying after the shortest window.
    pub fn from_failure_mode(mode: FailureMode, specs: &[LimitSpec], now: Duration) -> Self {
        let allowed = mode == FailureMode::Open;

        let per_limit = specs
            .iter()
            .map(|spec| LimitStatus {
                count: spec.count,
                window: spec.window,
                allowed,
                remaining: if allowed { spec.count } else { 0 },
                reset_at: if allowed { now } else { now + spec.window },
            })
            .collect();

        let retry_after = if allowed {
            Duration::ZERO
        } else {
            specs
                .iter()
                .map(|spec| spec.window)
                .min()
                .unwrap_or(Duration::ZERO)
        };

        Self {
            allowed,
            retry_after,
            per_limit,
            degraded: true,
        }
    }

    /// The status of the limit that denied the request with the longest wait.
    pub fn binding_limit(&self) -> Option<&LimitStatus> {
        self.per_limit
            .iter()
            .filter(|status| !status.allowed)
            .max_by_key(|status| status.reset_at)
    }
}

/// Metadata for one limit of a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LimitStatus {
    /// The limit's count
    pub count: u64,
    /// The limit's window
    pub window: Duration,
    /// Whether this limit alone would admit the request
    pub allowed: bool,
    /// Quota left in the limit
    pub remaining: u64,
    /// When the limit resets, as an offset from the Unix epoch
    pub reset_at: Duration,
}

impl LimitStatus {
    /// The limit this status describes.
    pub fn spec(&self) -> LimitSpec {
        LimitSpec {
            count: self.count,
            window: self.window,
        }
    }

    /// `reset_at` as a UTC timestamp.
    pub fn reset_at_utc(&self) -> Option<DateTime<Utc>> {
        DateTime::from_timestamp(self.reset_at.as_secs() as i64, self.reset_at.subsec_nanos())
    }
}

/// Enforces quotas for rate keys.
///
/// An engine pairs one algorithm with one store. It keeps no state of its
/// own between calls, so it is cheap to clone and several engines may share
/// a store.
#[derive(Debug, Clone)]
pub struct Engine {
    algorithm: Algorithm,
    store: Store,
}

impl Engine {
    /// Create an engine evaluating with `algorithm` against `store`.
    pub fn new(algorithm: Algorithm, store: Store) -> Self {
        Self { algorithm, store }
    }

    /// Build an engine and its store from system configuration.
    pub fn from_config(config: &TurnstileConfig) -> Result<Self> {
        config.validate()?;
        let store = Store::from_settings(&config.store)?;
        Ok(Self::new(config.engine.algorithm, store))
    }

    /// The algorithm in use.
    pub fn algorithm(&self) -> Algorithm {
        self.algorithm
    }

    /// The backing store.
    pub fn store(&self) -> &Store {
        &self.store
    }

    /// Evaluate a request of `cost` against every limit in `specs` and
    /// record it if all of them admit it.
    ///
    /// Only invalid input produces an error; store failures resolve to a
    /// [`Decision`] according to the configured failure mode.
    pub async fn evaluate(&self, key: &str, cost: u64, specs: &[LimitSpec]) -> Result<Decision> {
        self.run(key, cost, specs, Mode::Commit, None).await
    }

    /// Like [`evaluate`](Self::evaluate), but the store call gives up once
    /// `budget` has elapsed, even if the configured timeouts are longer.
    /// A budget too large to represent as a deadline imposes none.
    pub async fn evaluate_within(
        &self,
        key: &str,
        cost: u64,
        specs: &[LimitSpec],
        budget: Duration,
    ) -> Result<Decision> {
        let deadline = Instant::now().checked_add(budget);
        self.run(key, cost, specs, Mode::Commit, deadline).await
    }

    /// Report the decision a request would get, without recording it.
    pub async fn peek(&self, key: &str, cost: u64, specs: &[LimitSpec]) -> Result<Decision> {
        self.run(key, cost, specs, Mode::Peek, None).await
    }

    /// Stop background work owned by the store.
    pub fn shutdown(&self) {
        self.store.shutdown();
    }

    async fn run(
        &self,
        key: &str,
        cost: u64,
        specs: &[LimitSpec],
        mode: Mode,
        deadline: Option<Instant>,
    ) -> Result<Decision> {
        validate(key, cost, specs)?;

        let now = self.store.clock().now();
        let evaluator = LimitEvaluator::new(self.algorithm, &self.store);

        match evaluator
            .evaluate(key, cost, specs, now, mode, deadline)
            .await
        {
            Ok(decision) => {
                if !decision.allowed {
                    debug!(
                        key = %key,
                        cost,
                        algorithm = %self.algorithm,
                        retry_after_ms = decision.retry_after.as_millis() as u64,
                        "Rate limit exceeded"
                    );
                }
                Ok(decision)
            }
            Err(error) => Ok(self.degraded(key, error, specs, now)),
        }
    }

    fn degraded(&self, key: &str, error: StoreError, specs: &[LimitSpec], now: Duration) -> Decision {
        let (failure_mode, degraded_total) = match &self.store {
            Store::Shared(shared) => (shared.failure_mode(), shared.record_degraded()),
            // The local store cannot fail; keep traffic flowing if it ever does.
            Store::Local(_) => (FailureMode::Open, 0),
        };

        warn!(
            key = %key,
            error = %error,
            failure_mode = ?failure_mode,
            degraded_total,
            "Store unavailable, applying failure mode"
        );

        Decision::from_failure_mode(failure_mode, specs, now)
    }
}

fn validate(key: &str, cost: u64, specs: &[LimitSpec]) -> Result<()> {
    if key.is_empty() {
        return Err(TurnstileError::configuration("rate key must not be empty"));
    }
    if cost == 0 {
        return Err(TurnstileError::configuration("cost must be at least 1"));
    }
    if specs.is_empty() {
        return Err(TurnstileError::configuration(
            "at least one limit is required",
        ));
    }
    specs.iter().try_for_each(LimitSpec::validate)
}
