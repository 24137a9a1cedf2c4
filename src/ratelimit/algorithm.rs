//! Limiting algorithms.
//!
//! Both algorithms are pure step functions: given the stored state for one
//! sub-key, a limit, a cost and the current time they report whether the
//! request fits and which state to commit if it does. Stores decide when and
//! how that state is written.

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::limit::LimitSpec;
use crate::error::TurnstileError;

const NANOS_PER_SEC: u128 = 1_000_000_000;

/// Decision strategy applied to every limit of a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Algorithm {
    /// Generic Cell Rate Algorithm: smooth, burst of `count` after idling
    #[default]
    Continuous,
    /// Fixed window counter resetting on window boundaries
    Windowed,
}

impl Algorithm {
    /// Short tag used in storage keys.
    pub fn tag(&self) -> &'static str {
        match self {
            Algorithm::Continuous => "gcra",
            Algorithm::Windowed => "fixed",
        }
    }

    /// Run one step of the algorithm against `state`.
    ///
    /// State written by a different algorithm reads as absent.
    pub fn step(
        &self,
        state: Option<&StoredState>,
        spec: &LimitSpec,
        cost: u64,
        now: Duration,
    ) -> Step {
        match self {
            Algorithm::Continuous => {
                let tat = match state {
                    Some(StoredState::Continuous { tat }) => Some(*tat),
                    _ => None,
                };
                continuous_step(tat, spec, cost, now)
            }
            Algorithm::Windowed => {
                let window = match state {
                    Some(StoredState::Windowed {
                        window_start,
                        count,
                    }) => Some((*window_start, *count)),
                    _ => None,
                };
                windowed_step(window, spec, cost, now)
            }
        }
    }
}

impl fmt::Display for Algorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Algorithm::Continuous => f.write_str("continuous"),
            Algorithm::Windowed => f.write_str("windowed"),
        }
    }
}

impl FromStr for Algorithm {
    type Err = TurnstileError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "continuous" | "gcra" => Ok(Algorithm::Continuous),
            "windowed" | "fixed" | "fixed-window" => Ok(Algorithm::Windowed),
            other => Err(TurnstileError::configuration(format!(
                "unknown algorithm '{}'",
                other
            ))),
        }
    }
}

/// Per-sub-key state persisted by a store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoredState {
    /// Fixed window counter
    Windowed {
        /// Start of the window the count belongs to
        window_start: Duration,
        /// Cost consumed in that window
        count: u64,
    },
    /// GCRA theoretical arrival time
    Continuous {
        /// Theoretical arrival time
        tat: Duration,
    },
}

/// Outcome of one algorithm step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Step {
    /// Whether the cost fits within the limit
    pub allowed: bool,
    /// State to write if the request is committed
    pub next: StoredState,
    /// Remaining quota: after the commit when allowed, as it stands when denied
    pub remaining: u64,
    /// When the limit is next fully (continuous) or freshly (windowed) available
    pub reset_at: Duration,
    /// How long until the cost could fit; zero when allowed
    pub retry_after: Duration,
    /// When committed state becomes indistinguishable from absent state
    pub expires_at: Duration,
}

fn continuous_step(tat: Option<Duration>, spec: &LimitSpec, cost: u64, now: Duration) -> Step {
    let now_ns = now.as_nanos();
    let window_ns = spec.window.as_nanos();
    let count = spec.count as u128;

    // emission interval = window / count; the burst tolerance is count
    // intervals, which is exactly one window.
    let increment = (cost as u128).saturating_mul(window_ns) / count;
    let tolerance = window_ns;

    let tat_ns = tat.map(|t| t.as_nanos()).unwrap_or(now_ns).max(now_ns);
    let new_tat = tat_ns.saturating_add(increment);
    let allowed = new_tat <= now_ns + tolerance;

    let effective_tat = if allowed { new_tat } else { tat_ns };
    let used = effective_tat - now_ns;
    let remaining = (tolerance.saturating_sub(used) * count / window_ns) as u64;

    let retry_after = if allowed {
        0
    } else {
        new_tat - tolerance - now_ns
    };

    Step {
        allowed,
        next: StoredState::Continuous {
            tat: from_nanos(new_tat),
        },
        remaining,
        reset_at: from_nanos(effective_tat),
        retry_after: from_nanos(retry_after),
        expires_at: from_nanos(new_tat),
    }
}

fn windowed_step(
    state: Option<(Duration, u64)>,
    spec: &LimitSpec,
    cost: u64,
    now: Duration,
) -> Step {
    let now_ns = now.as_nanos();
    let window_ns = spec.window.as_nanos();
    let current_start = now_ns / window_ns * window_ns;

    let used = match state {
        Some((start, count)) if start.as_nanos() == current_start => count,
        _ => 0,
    };

    let new_count = used.saturating_add(cost);
    let allowed = new_count <= spec.count;
    let reset_at = current_start + window_ns;

    let remaining = if allowed {
        spec.count - new_count
    } else {
        spec.count.saturating_sub(used)
    };

    Step {
        allowed,
        next: StoredState::Windowed {
            window_start: from_nanos(current_start),
            count: new_count,
        },
        remaining,
        reset_at: from_nanos(reset_at),
        retry_after: if allowed {
            Duration::ZERO
        } else {
            from_nanos(reset_at - now_ns)
        },
        expires_at: from_nanos(reset_at),
    }
}

fn from_nanos(nanos: u128) -> Duration {
    Duration::new(
        (nanos / NANOS_PER_SEC) as u64,
        (nanos % NANOS_PER_SEC) as u32,
    )
}
