//! Rate limiting logic and state management.

mod algorithm;
mod engine;
mod evaluator;
mod limit;

pub use algorithm::{Algorithm, Step, StoredState};
pub use engine::{Decision, Engine, LimitStatus};
pub use limit::{LimitSpec, SubKey, MAX_COUNT, MAX_WINDOW};

pub(crate) use evaluator::LimitOutcome;
