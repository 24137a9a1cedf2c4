//! Two-phase evaluation of every limit attached to a request.
//!
//! The check pass runs the algorithm against a snapshot of each limit's
//! state. Only when every limit passes does the commit pass write the
//! resulting states, all from that same snapshot. A denied request leaves
//! every counter untouched.

use std::time::Duration;

use tokio::time::Instant;
use tracing::trace;

use super::algorithm::{Algorithm, Step, StoredState};
use super::engine::{Decision, LimitStatus};
use super::limit::{LimitSpec, SubKey};
use crate::store::{ScriptLimit, Store, StoreError, Transaction};

/// Per-limit result of an evaluation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct LimitOutcome {
    pub allowed: bool,
    pub remaining: u64,
    pub reset_at: Duration,
    pub retry_after: Duration,
}

impl From<&Step> for LimitOutcome {
    fn from(step: &Step) -> Self {
        Self {
            allowed: step.allowed,
            remaining: step.remaining,
            reset_at: step.reset_at,
            retry_after: step.retry_after,
        }
    }
}

/// Whether a passing request is recorded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Mode {
    /// Check every limit and commit if all pass
    Commit,
    /// Check every limit, commit nothing
    Peek,
}

/// The distinct sub-keys touched by a request.
///
/// Keys are sorted so local transactions always lock in the same order.
/// Identical specs collapse onto one key and are charged once.
struct Plan {
    keys: Vec<SubKey>,
    specs: Vec<LimitSpec>,
    /// For each input spec, the index of its key in `keys`
    positions: Vec<usize>,
}

impl Plan {
    fn new(algorithm: Algorithm, key: &str, specs: &[LimitSpec]) -> Self {
        let all: Vec<SubKey> = specs
            .iter()
            .map(|spec| SubKey::new(algorithm, spec, key))
            .collect();

        let mut distinct: Vec<(SubKey, LimitSpec)> =
            all.iter().cloned().zip(specs.iter().copied()).collect();
        distinct.sort_by(|a, b| a.0.cmp(&b.0));
        distinct.dedup_by(|a, b| a.0 == b.0);

        let positions = all
            .iter()
            .map(|sub_key| {
                match distinct.binary_search_by(|(candidate, _)| candidate.cmp(sub_key)) {
                    Ok(index) | Err(index) => index,
                }
            })
            .collect();

        let (keys, specs): (Vec<SubKey>, Vec<LimitSpec>) = distinct.into_iter().unzip();
        Self {
            keys,
            specs,
            positions,
        }
    }

    fn check(
        &self,
        algorithm: Algorithm,
        states: &[Option<StoredState>],
        cost: u64,
        now: Duration,
    ) -> Vec<Step> {
        self.specs
            .iter()
            .zip(states)
            .map(|(spec, state)| algorithm.step(state.as_ref(), spec, cost, now))
            .collect()
    }
}

/// Evaluates the limits of one request against a store.
pub(crate) struct LimitEvaluator<'a> {
    algorithm: Algorithm,
    store: &'a Store,
}

impl<'a> LimitEvaluator<'a> {
    pub(crate) fn new(algorithm: Algorithm, store: &'a Store) -> Self {
        Self { algorithm, store }
    }

    /// Evaluate `specs` for `key` at `now`.
    ///
    /// Errors only come from the shared store and are left to the caller's
    /// failure policy.
    pub(crate) async fn evaluate(
        &self,
        key: &str,
        cost: u64,
        specs: &[LimitSpec],
        now: Duration,
        mode: Mode,
        deadline: Option<Instant>,
    ) -> Result<Decision, StoreError> {
        let plan = Plan::new(self.algorithm, key, specs);

        trace!(
            key = %key,
            cost,
            limits = specs.len(),
            sub_keys = plan.keys.len(),
            mode = ?mode,
            "Evaluating limits"
        );

        let outcomes = match self.store {
            Store::Local(local) => {
                let steps = match mode {
                    Mode::Peek => {
                        let states = local.snapshot(&plan.keys, now);
                        plan.check(self.algorithm, &states, cost, now)
                    }
                    Mode::Commit => local.transact(&plan.keys, now, |states| {
                        let steps = plan.check(self.algorithm, states, cost, now);
                        let commits = if steps.iter().all(|step| step.allowed) {
                            steps
                                .iter()
                                .map(|step| (step.next, step.expires_at))
                                .collect()
                        } else {
                            Vec::new()
                        };
                        Transaction {
                            output: steps,
                            commits,
                        }
                    }),
                };
                steps.iter().map(LimitOutcome::from).collect()
            }
            Store::Shared(shared) => {
                let limits: Vec<ScriptLimit<'_>> = plan
                    .keys
                    .iter()
                    .zip(&plan.specs)
                    .map(|(key, spec)| ScriptLimit { key, spec })
                    .collect();
                shared
                    .run(
                        self.algorithm,
                        &limits,
                        cost,
                        now,
                        mode == Mode::Commit,
                        deadline,
                    )
                    .await?
            }
        };

        Ok(assemble(specs, &plan.positions, &outcomes))
    }
}

/// Map per-key outcomes back onto the caller's specs, in order.
fn assemble(specs: &[LimitSpec], positions: &[usize], outcomes: &[LimitOutcome]) -> Decision {
    let per_limit: Vec<LimitStatus> = specs
        .iter()
        .zip(positions)
        .map(|(spec, &index)| {
            let outcome = &outcomes[index];
            LimitStatus {
                count: spec.count,
                window: spec.window,
                allowed: outcome.allowed,
                remaining: outcome.remaining,
                reset_at: outcome.reset_at,
            }
        })
        .collect();

    let allowed = outcomes.iter().all(|outcome| outcome.allowed);
    let retry_after = outcomes
        .iter()
        .filter(|outcome| !outcome.allowed)
        .map(|outcome| outcome.retry_after)
        .max()
        .unwrap_or(Duration::ZERO);

    Decision {
        allowed,
        retry_after,
        per_limit,
        degraded: false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_plan_dedups_and_sorts() {
        let specs: Vec<LimitSpec> = ["10/s", "500/h", "10/s"]
            .iter()
            .map(|s| s.parse().unwrap())
            .collect();

        let plan = Plan::new(Algorithm::Windowed, "user", &specs);

        assert_eq!(plan.keys.len(), 2);
        assert!(plan.keys.windows(2).all(|w| w[0] < w[1]));
        assert_eq!(plan.positions[0], plan.positions[2]);
        assert_ne!(plan.positions[0], plan.positions[1]);
        assert_eq!(plan.specs[plan.positions[1]], specs[1]);
    }

    #[test]
    fn test_assemble_takes_longest_retry() {
        let specs: Vec<LimitSpec> = ["1/s", "1/m", "5/h"]
            .iter()
            .map(|s| s.parse().unwrap())
            .collect();
        let outcomes = [
            LimitOutcome {
                allowed: false,
                remaining: 0,
                reset_at: Duration::from_secs(1),
                retry_after: Duration::from_millis(300),
            },
            LimitOutcome {
                allowed: false,
                remaining: 0,
                reset_at: Duration::from_secs(60),
                retry_after: Duration::from_secs(42),
            },
            LimitOutcome {
                allowed: true,
                remaining: 4,
                reset_at: Duration::from_secs(3600),
                retry_after: Duration::ZERO,
            },
        ];

        let decision = assemble(&specs, &[0, 1, 2], &outcomes);

        assert!(!decision.allowed);
        assert_eq!(decision.retry_after, Duration::from_secs(42));
        assert_eq!(decision.per_limit.len(), 3);
        assert_eq!(decision.per_limit[2].remaining, 4);
        assert!(decision.per_limit[2].allowed);
    }

    #[test]
    fn test_assemble_allowed_has_no_retry() {
        let specs = [LimitSpec::per_second(3).unwrap()];
        let outcomes = [LimitOutcome {
            allowed: true,
            remaining: 2,
            reset_at: Duration::from_secs(1),
            retry_after: Duration::ZERO,
        }];

        let decision = assemble(&specs, &[0], &outcomes);
        assert!(decision.allowed);
        assert_eq!(decision.retry_after, Duration::ZERO);
    }
}
