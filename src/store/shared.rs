//! Redis-backed limiter state shared between gateway instances.
//!
//! Every evaluation is a single Lua script invocation. Redis runs scripts
//! atomically, so the check and the commit for all limits of a request
//! happen as one step and concurrent instances can never double-spend a
//! quota.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use redis::aio::MultiplexedConnection;
use redis::{Client, ConnectionAddr, ConnectionInfo, RedisConnectionInfo, Script};
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, info};

use super::{FailureMode, StoreError};
use crate::clock::Clock;
use crate::config::SharedStoreConfig;
use crate::error::{Result, TurnstileError};
use crate::ratelimit::{Algorithm, LimitOutcome, LimitSpec, SubKey};

/// One limit handed to the evaluation script.
pub(crate) struct ScriptLimit<'a> {
    pub key: &'a SubKey,
    pub spec: &'a LimitSpec,
}

/// Shared store adapter.
///
/// The connection is opened lazily and dropped after a transport failure
/// so the next evaluation reconnects. Each evaluation makes exactly one
/// bounded attempt; failures are reported to the caller, which applies the
/// configured [`FailureMode`].
pub struct SharedStore {
    client: Client,
    connection: Mutex<Option<MultiplexedConnection>>,
    script: Script,
    config: SharedStoreConfig,
    clock: Arc<dyn Clock>,
    /// Evaluations resolved by the failure mode
    degraded: AtomicU64,
}

impl std::fmt::Debug for SharedStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SharedStore")
            .field("host", &self.config.host)
            .field("port", &self.config.port)
            .field("db", &self.config.db)
            .field("key_prefix", &self.config.key_prefix)
            .field("failure_mode", &self.config.failure_mode)
            .finish()
    }
}

impl SharedStore {
    /// Create a shared store. No connection is made until first use.
    pub fn new(config: SharedStoreConfig, clock: Arc<dyn Clock>) -> Result<Self> {
        config.validate()?;

        let info = ConnectionInfo {
            addr: ConnectionAddr::Tcp(config.host.clone(), config.port),
            redis: RedisConnectionInfo {
                db: config.db,
                username: config.username.clone(),
                password: config.password.clone(),
                ..Default::default()
            },
        };

        let client = Client::open(info).map_err(|e| {
            TurnstileError::configuration(format!("invalid shared store address: {}", e))
        })?;

        Ok(Self {
            client,
            connection: Mutex::new(None),
            script: Script::new(include_str!("evaluate.lua")),
            config,
            clock,
            degraded: AtomicU64::new(0),
        })
    }

    /// The store's configuration.
    pub fn config(&self) -> &SharedStoreConfig {
        &self.config
    }

    /// The store's time source.
    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    /// Policy applied when the backend cannot be reached.
    pub fn failure_mode(&self) -> FailureMode {
        self.config.failure_mode
    }

    /// Number of evaluations resolved by the failure mode so far.
    pub fn degraded_count(&self) -> u64 {
        self.degraded.load(Ordering::Relaxed)
    }

    pub(crate) fn record_degraded(&self) -> u64 {
        self.degraded.fetch_add(1, Ordering::Relaxed) + 1
    }

    /// The Redis key holding state for `key`.
    pub fn storage_key(&self, key: &SubKey) -> String {
        format!("{}{}", self.config.key_prefix, key)
    }

    /// Run the evaluation script for `limits`.
    ///
    /// With `commit` set, state is written only if every limit passes.
    /// The whole call is bounded by the configured timeouts and by
    /// `deadline` when one is given.
    pub(crate) async fn run(
        &self,
        algorithm: Algorithm,
        limits: &[ScriptLimit<'_>],
        cost: u64,
        now: Duration,
        commit: bool,
        deadline: Option<Instant>,
    ) -> std::result::Result<Vec<LimitOutcome>, StoreError> {
        let mut conn = self.connection(deadline).await?;

        let mut invocation = self.script.prepare_invoke();
        for limit in limits {
            invocation.key(self.storage_key(limit.key));
        }
        for arg in script_args(algorithm, limits, cost, now, commit) {
            invocation.arg(arg);
        }

        let limit = if commit {
            self.config.write_timeout()
        } else {
            self.config.read_timeout()
        };
        let budget = Budget::new(limit, deadline);

        let reply: Vec<i64> =
            match tokio::time::timeout(budget.time, invocation.invoke_async(&mut conn)).await {
                Ok(Ok(reply)) => reply,
                Ok(Err(e)) => {
                    if e.is_io_error() || e.is_connection_dropped() {
                        self.reset_connection();
                    }
                    return Err(e.into());
                }
                Err(_) => {
                    // A caller's short deadline says nothing about the
                    // connection; only a configured timeout does.
                    if !budget.caller_bound {
                        self.reset_connection();
                    }
                    return Err(StoreError::Timeout(budget.time));
                }
            };

        parse_reply(&reply, limits.len())
    }

    async fn connection(
        &self,
        deadline: Option<Instant>,
    ) -> std::result::Result<MultiplexedConnection, StoreError> {
        let budget = Budget::new(self.config.connection_timeout(), deadline).time;
        if budget.is_zero() {
            return Err(StoreError::Timeout(budget));
        }

        let connect = async {
            let mut cached = self.connection.lock().await;
            if let Some(conn) = cached.as_ref() {
                return Ok(conn.clone());
            }

            let conn = self.client.get_multiplexed_async_connection().await?;
            info!(
                host = %self.config.host,
                port = self.config.port,
                db = self.config.db,
                "Connected to shared store"
            );
            *cached = Some(conn.clone());
            Ok::<_, StoreError>(conn)
        };

        tokio::time::timeout(budget, connect)
            .await
            .map_err(|_| StoreError::Timeout(budget))?
    }

    /// Forget the cached connection so the next evaluation reconnects.
    fn reset_connection(&self) {
        // A connect in progress holds the lock; it will replace the
        // connection anyway.
        if let Ok(mut cached) = self.connection.try_lock() {
            if cached.take().is_some() {
                debug!("Dropped shared store connection");
            }
        }
    }
}

/// Time allowed for one store call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Budget {
    time: Duration,
    /// Whether the caller's deadline, not the configured timeout, set `time`
    caller_bound: bool,
}

impl Budget {
    fn new(limit: Duration, deadline: Option<Instant>) -> Self {
        match deadline {
            Some(deadline) => {
                let left = deadline.saturating_duration_since(Instant::now());
                Self {
                    time: limit.min(left),
                    caller_bound: left < limit,
                }
            }
            None => Self {
                time: limit,
                caller_bound: false,
            },
        }
    }
}

/// Script arguments in the order `evaluate.lua` reads them: the commit
/// flag, the algorithm tag, now and cost in `ARGV[1..=4]`, then count and
/// window for limit `i` (1-based) in `ARGV[3 + 2i]` and `ARGV[4 + 2i]`.
/// Times are in microseconds.
fn script_args(
    algorithm: Algorithm,
    limits: &[ScriptLimit<'_>],
    cost: u64,
    now: Duration,
    commit: bool,
) -> Vec<String> {
    let mut args = vec![
        if commit { "1" } else { "0" }.to_string(),
        algorithm.tag().to_string(),
        now.as_micros().to_string(),
        cost.to_string(),
    ];
    for limit in limits {
        args.push(limit.spec.count.to_string());
        args.push(limit.spec.window_us().to_string());
    }
    args
}

fn parse_reply(
    reply: &[i64],
    limits: usize,
) -> std::result::Result<Vec<LimitOutcome>, StoreError> {
    if reply.len() != 1 + 4 * limits {
        return Err(StoreError::MalformedReply(format!(
            "expected {} values, got {}",
            1 + 4 * limits,
            reply.len()
        )));
    }

    Ok(reply[1..]
        .chunks_exact(4)
        .map(|step| LimitOutcome {
            allowed: step[0] == 1,
            remaining: step[1].max(0) as u64,
            reset_at: Duration::from_micros(step[2].max(0) as u64),
            retry_after: Duration::from_micros(step[3].max(0) as u64),
        })
        .collect())
}
