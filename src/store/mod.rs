//! Storage backends for limiter state.
//!
//! A [`Store`] is either process-local or shared over the network. The set
//! is closed: the evaluator matches on it exhaustively rather than going
//! through a trait object.

mod local;
mod shared;

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::clock::{Clock, SystemClock};
use crate::config::{LocalStoreConfig, SharedStoreConfig, StoreBackend, StoreSettings};
use crate::error::Result;

pub use local::LocalStore;
pub use shared::SharedStore;

pub(crate) use local::Transaction;
pub(crate) use shared::ScriptLimit;

/// Errors raised by a store backend.
///
/// These never reach callers of the engine; they are resolved by the
/// configured [`FailureMode`].
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Store unavailable: {0}")]
    Unavailable(String),
    #[error("Store operation timed out after {0:?}")]
    Timeout(Duration),
    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),
    #[error("Malformed store reply: {0}")]
    MalformedReply(String),
}

/// What to do with a request when the shared store cannot be reached.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FailureMode {
    /// Allow the request without recording it
    #[default]
    Open,
    /// Deny the request
    Closed,
}

/// A handle to limiter state. Cheap to clone; clones share the backend.
#[derive(Debug, Clone)]
pub enum Store {
    /// Process-local, bounded map
    Local(Arc<LocalStore>),
    /// Networked store with server-side atomic updates
    Shared(Arc<SharedStore>),
}

impl Store {
    /// Create a local store and start its expiry sweep.
    pub fn local(config: LocalStoreConfig) -> Result<Self> {
        Self::local_with_clock(config, Arc::new(SystemClock))
    }

    /// Create a local store driven by `clock`.
    pub fn local_with_clock(config: LocalStoreConfig, clock: Arc<dyn Clock>) -> Result<Self> {
        Ok(Store::Local(LocalStore::start(config, clock)?))
    }

    /// Create a shared store. No connection is made until first use.
    pub fn shared(config: SharedStoreConfig) -> Result<Self> {
        Self::shared_with_clock(config, Arc::new(SystemClock))
    }

    /// Create a shared store driven by `clock`.
    pub fn shared_with_clock(config: SharedStoreConfig, clock: Arc<dyn Clock>) -> Result<Self> {
        Ok(Store::Shared(Arc::new(SharedStore::new(config, clock)?)))
    }

    /// Build the backend selected by `settings`.
    pub fn from_settings(settings: &StoreSettings) -> Result<Self> {
        match settings.backend {
            StoreBackend::Local => Self::local(settings.local.clone()),
            StoreBackend::Shared => Self::shared(settings.shared.clone()),
        }
    }

    /// The time source used for every evaluation against this store.
    pub fn clock(&self) -> &Arc<dyn Clock> {
        match self {
            Store::Local(store) => store.clock(),
            Store::Shared(store) => store.clock(),
        }
    }

    /// Stop any background work owned by the store.
    pub fn shutdown(&self) {
        match self {
            Store::Local(store) => store.stop_sweeper(),
            Store::Shared(_) => {}
        }
    }
}

impl From<Arc<LocalStore>> for Store {
    fn from(store: Arc<LocalStore>) -> Self {
        Store::Local(store)
    }
}

impl From<Arc<SharedStore>> for Store {
    fn from(store: Arc<SharedStore>) -> Self {
        Store::Shared(store)
    }
}
