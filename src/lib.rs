//! Turnstile - Multi-Window Quota Enforcement
//!
//! This crate decides whether a request identified by a rate key may proceed
//! under one or more quotas, each a count per time window. State lives either
//! in a bounded in-process store or in Redis, so several gateway instances
//! can share one view of every quota.

pub mod clock;
pub mod config;
pub mod error;
pub mod ratelimit;
pub mod store;

pub use clock::{Clock, ManualClock, SystemClock};
pub use config::TurnstileConfig;
pub use error::{Result, TurnstileError};
pub use ratelimit::{Algorithm, Decision, Engine, LimitSpec, LimitStatus};
pub use store::{FailureMode, LocalStore, SharedStore, Store};
