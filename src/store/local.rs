//! Process-local limiter state.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use parking_lot::{Mutex, MutexGuard};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, trace, warn};

use crate::clock::Clock;
use crate::config::LocalStoreConfig;
use crate::error::{Result, TurnstileError};
use crate::ratelimit::{StoredState, SubKey};

/// Idle entries compared when choosing an eviction victim.
const EVICTION_SAMPLE: usize = 32;

/// Result of a transaction closure: its output plus the state to write.
///
/// `commits` is either empty (nothing written) or holds one entry per key,
/// in the order the keys were passed to [`LocalStore::transact`].
pub(crate) struct Transaction<R> {
    pub output: R,
    pub commits: Vec<(StoredState, Duration)>,
}

/// State for one sub-key.
struct Cell {
    state: Option<StoredState>,
    expires_at: Duration,
}

impl Cell {
    /// The stored state, or `None` once it has expired.
    fn live_state(&self, now: Duration) -> Option<StoredState> {
        if self.expires_at > now {
            self.state
        } else {
            None
        }
    }
}

struct Slot {
    /// Last access, in nanoseconds since the epoch
    last_access: AtomicU64,
    /// Number of evaluations currently using the slot. Pinned slots are
    /// never evicted or swept.
    pins: AtomicUsize,
    cell: Mutex<Cell>,
}

impl Slot {
    fn new(now: Duration) -> Self {
        Self {
            last_access: AtomicU64::new(now.as_nanos() as u64),
            pins: AtomicUsize::new(1),
            cell: Mutex::new(Cell {
                state: None,
                expires_at: now,
            }),
        }
    }

    fn is_pinned(&self) -> bool {
        self.pins.load(Ordering::Acquire) > 0
    }
}

/// A slot held by an in-flight evaluation.
struct Pinned(Arc<Slot>);

impl Pinned {
    fn new(slot: &Arc<Slot>) -> Self {
        slot.pins.fetch_add(1, Ordering::AcqRel);
        Self(slot.clone())
    }

    fn lock(&self) -> MutexGuard<'_, Cell> {
        self.0.cell.lock()
    }

    fn touch(&self, now: Duration) {
        self.0
            .last_access
            .store(now.as_nanos() as u64, Ordering::Relaxed);
    }
}

impl Drop for Pinned {
    fn drop(&mut self) {
        self.0.pins.fetch_sub(1, Ordering::AcqRel);
    }
}

/// A bounded, concurrency-safe map of limiter state.
///
/// Lookups of existing keys only contend on their own shard and slot. New
/// keys reserve capacity through an atomic counter so the `max_entries`
/// bound holds without a global lock; at capacity an idle entry is evicted,
/// chosen as the least recently used of a small sample. An optional
/// background sweep drops entries whose state has expired.
pub struct LocalStore {
    entries: DashMap<SubKey, Arc<Slot>>,
    /// Resident entries plus reservations for entries being inserted
    reserved: AtomicUsize,
    max_entries: usize,
    cleanup_interval: Duration,
    clock: Arc<dyn Clock>,
    sweeper: Mutex<Option<JoinHandle<()>>>,
}

impl std::fmt::Debug for LocalStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalStore")
            .field("entries", &self.entries.len())
            .field("max_entries", &self.max_entries)
            .field("cleanup_interval", &self.cleanup_interval)
            .finish()
    }
}

impl LocalStore {
    /// Create a store without starting the expiry sweep.
    pub fn new(config: LocalStoreConfig, clock: Arc<dyn Clock>) -> Result<Self> {
        if config.max_entries == 0 {
            return Err(TurnstileError::configuration(
                "local store max_entries must be at least 1",
            ));
        }

        Ok(Self {
            entries: DashMap::new(),
            reserved: AtomicUsize::new(0),
            max_entries: config.max_entries,
            cleanup_interval: config.cleanup_interval(),
            clock,
            sweeper: Mutex::new(None),
        })
    }

    /// Create a store and start its expiry sweep.
    ///
    /// The sweep needs a Tokio runtime; without one, or with a zero
    /// `cleanup_interval`, expired entries are only reclaimed by eviction
    /// or explicit calls to [`sweep_expired`](Self::sweep_expired).
    pub fn start(config: LocalStoreConfig, clock: Arc<dyn Clock>) -> Result<Arc<Self>> {
        let store = Arc::new(Self::new(config, clock)?);
        store.start_sweeper();
        Ok(store)
    }

    fn start_sweeper(self: &Arc<Self>) {
        if self.cleanup_interval.is_zero() {
            debug!("Local store expiry sweep disabled");
            return;
        }

        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            warn!("No Tokio runtime available, local store expiry sweep not started");
            return;
        };

        let weak: Weak<Self> = Arc::downgrade(self);
        let period = self.cleanup_interval;

        let task = runtime.spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // The first tick completes immediately.
            ticker.tick().await;

            loop {
                ticker.tick().await;
                let Some(store) = weak.upgrade() else {
                    break;
                };
                let removed = store.sweep_expired();
                if removed > 0 {
                    debug!(removed, remaining = store.len(), "Swept expired entries");
                }
            }
        });

        info!(interval = ?period, "Started local store expiry sweep");
        *self.sweeper.lock() = Some(task);
    }

    /// Stop the background sweep. Idempotent.
    pub fn stop_sweeper(&self) {
        if let Some(task) = self.sweeper.lock().take() {
            task.abort();
            info!("Stopped local store expiry sweep");
        }
    }

    /// The store's time source.
    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    /// Number of resident entries.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the store holds no entries.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Whether `key` is resident.
    pub fn contains(&self, key: &SubKey) -> bool {
        self.entries.contains_key(key)
    }

    /// Drop every entry that is not in use.
    pub fn clear(&self) {
        self.entries.retain(|_, slot| {
            let keep = slot.is_pinned();
            if !keep {
                self.reserved.fetch_sub(1, Ordering::AcqRel);
            }
            keep
        });
    }

    /// Remove entries whose state has expired. Returns how many were removed.
    pub fn sweep_expired(&self) -> usize {
        let now = self.clock.now();

        let candidates: Vec<SubKey> = self
            .entries
            .iter()
            .filter(|entry| !entry.is_pinned())
            .map(|entry| entry.key().clone())
            .collect();

        candidates
            .into_iter()
            .filter(|key| {
                self.remove_idle(key, |slot| {
                    slot.cell
                        .try_lock()
                        .map_or(false, |cell| cell.expires_at <= now)
                })
            })
            .count()
    }

    /// Read the live state of `keys` without creating entries.
    pub(crate) fn snapshot(&self, keys: &[SubKey], now: Duration) -> Vec<Option<StoredState>> {
        let pinned: Vec<Option<Pinned>> = keys.iter().map(|key| self.lookup(key)).collect();

        pinned
            .iter()
            .map(|slot| slot.as_ref().and_then(|slot| slot.lock().live_state(now)))
            .collect()
    }

    /// Run `f` over the current state of `keys` and write back its commits.
    ///
    /// `keys` must be sorted and free of duplicates. All of their slots stay
    /// locked from the read until the write, so concurrent transactions on
    /// overlapping keys are serialized and a multi-key commit is all or
    /// nothing.
    ///
    /// Keys that are not resident are only admitted once `f` has asked to
    /// commit, so a transaction that writes nothing never evicts anything.
    /// `f` may therefore run twice and must be free of side effects.
    pub(crate) fn transact<R, F>(&self, keys: &[SubKey], now: Duration, f: F) -> R
    where
        F: Fn(&[Option<StoredState>]) -> Transaction<R>,
    {
        let resident: Vec<Option<Pinned>> = keys.iter().map(|key| self.lookup(key)).collect();

        if resident.iter().any(Option::is_none) {
            let cells: Vec<Option<MutexGuard<'_, Cell>>> = resident
                .iter()
                .map(|slot| slot.as_ref().map(Pinned::lock))
                .collect();
            let states: Vec<Option<StoredState>> = cells
                .iter()
                .map(|cell| cell.as_ref().and_then(|cell| cell.live_state(now)))
                .collect();

            let Transaction { output, commits } = f(&states);
            if commits.is_empty() {
                resident.iter().flatten().for_each(|slot| slot.touch(now));
                return output;
            }
        }

        let admitted: Vec<(Pinned, bool)> = keys.iter().map(|key| self.pin(key, now)).collect();
        drop(resident);

        let mut cells: Vec<MutexGuard<'_, Cell>> =
            admitted.iter().map(|(slot, _)| slot.lock()).collect();

        for (slot, _) in &admitted {
            slot.touch(now);
        }

        let states: Vec<Option<StoredState>> =
            cells.iter().map(|cell| cell.live_state(now)).collect();

        let Transaction { output, commits } = f(&states);
        let committed = !commits.is_empty();

        for (cell, (state, expires_at)) in cells.iter_mut().zip(commits) {
            cell.state = Some(state);
            cell.expires_at = expires_at;
        }
        drop(cells);

        if !committed {
            // Another request changed the state between the check and the
            // admission. Give back the slots created for nothing.
            let created: Vec<&SubKey> = keys
                .iter()
                .zip(&admitted)
                .filter(|(_, (_, created))| *created)
                .map(|(key, _)| key)
                .collect();
            drop(admitted);
            for key in created {
                self.remove_idle(key, |slot| {
                    slot.cell.try_lock().map_or(false, |cell| cell.state.is_none())
                });
            }
        }

        trace!(keys = keys.len(), committed, "Local transaction complete");
        output
    }

    /// Pin the slot for `key` if it is resident.
    fn lookup(&self, key: &SubKey) -> Option<Pinned> {
        self.entries.get(key).map(|slot| Pinned::new(&slot))
    }

    /// Pin the slot for `key`, creating it if needed. The flag is true when
    /// the slot was created by this call.
    fn pin(&self, key: &SubKey, now: Duration) -> (Pinned, bool) {
        if let Some(slot) = self.lookup(key) {
            return (slot, false);
        }

        self.reserve();

        match self.entries.entry(key.clone()) {
            Entry::Occupied(entry) => {
                self.reserved.fetch_sub(1, Ordering::AcqRel);
                (Pinned::new(entry.get()), false)
            }
            Entry::Vacant(entry) => {
                // Created already pinned so it cannot be evicted before use.
                let slot = Arc::new(Slot::new(now));
                entry.insert(slot.clone());
                (Pinned(slot), true)
            }
        }
    }

    /// Claim room for one new entry, evicting if the store is full.
    fn reserve(&self) {
        let mut reserved = self.reserved.load(Ordering::Acquire);
        loop {
            if reserved < self.max_entries {
                match self.reserved.compare_exchange_weak(
                    reserved,
                    reserved + 1,
                    Ordering::AcqRel,
                    Ordering::Acquire,
                ) {
                    Ok(_) => return,
                    Err(actual) => {
                        reserved = actual;
                        continue;
                    }
                }
            }

            if !self.evict_one() {
                if self.entries.len() < reserved {
                    // Other inserts hold reservations but have not landed yet.
                    std::thread::yield_now();
                    reserved = self.reserved.load(Ordering::Acquire);
                    continue;
                }

                // Everything resident is in use by in-flight evaluations.
                debug!(
                    entries = self.entries.len(),
                    max_entries = self.max_entries,
                    "Local store over capacity, no idle entry to evict"
                );
                self.reserved.fetch_add(1, Ordering::AcqRel);
                return;
            }
            reserved = self.reserved.load(Ordering::Acquire);
        }
    }

    /// Evict the least recently used of a sample of idle entries. Returns
    /// false if nothing is evictable.
    fn evict_one(&self) -> bool {
        loop {
            let victim = self
                .entries
                .iter()
                .filter(|entry| !entry.is_pinned())
                .take(EVICTION_SAMPLE)
                .min_by_key(|entry| entry.last_access.load(Ordering::Relaxed))
                .map(|entry| entry.key().clone());

            let Some(victim) = victim else {
                return false;
            };

            if self.remove_idle(&victim, |_| true) {
                debug!(key = %victim, "Evicted idle entry");
                return true;
            }
        }
    }

    /// Remove `key` if it is unpinned and `condition` holds for its slot.
    fn remove_idle(&self, key: &SubKey, condition: impl FnOnce(&Slot) -> bool) -> bool {
        let removed = self
            .entries
            .remove_if(key, |_, slot| !slot.is_pinned() && condition(&**slot))
            .is_some();
        if removed {
            self.reserved.fetch_sub(1, Ordering::AcqRel);
        }
        removed
    }
}

impl Drop for LocalStore {
    fn drop(&mut self) {
        if let Some(task) = self.sweeper.get_mut().take() {
            task.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::ratelimit::{Algorithm, LimitSpec};

    const T0: Duration = Duration::from_secs(1_700_000_000);

    fn config(max_entries: usize, cleanup_interval_secs: u64) -> LocalStoreConfig {
        LocalStoreConfig {
            max_entries,
            cleanup_interval_secs,
        }
    }

    fn key(name: &str) -> SubKey {
        SubKey::new(Algorithm::Windowed, &LimitSpec::per_second(10).unwrap(), name)
    }

    fn write(store: &LocalStore, key: &SubKey, now: Duration, ttl: Duration) {
        store.transact(std::slice::from_ref(key), now, |_| Transaction {
            output: (),
            commits: vec![(
                StoredState::Windowed {
                    window_start: now,
                    count: 1,
                },
                now + ttl,
            )],
        });
    }

    #[test]
    fn test_rejects_zero_capacity() {
        let clock = Arc::new(ManualClock::new(T0));
        assert!(LocalStore::new(config(0, 0), clock).is_err());
    }

    #[test]
    fn test_transact_reads_back_commit() {
        let clock = ManualClock::new(T0);
        let store = LocalStore::new(config(10, 0), Arc::new(clock.clone())).unwrap();
        let k = key("a");

        write(&store, &k, T0, Duration::from_secs(1));

        let states = store.snapshot(std::slice::from_ref(&k), T0);
        assert_eq!(
            states,
            vec![Some(StoredState::Windowed {
                window_start: T0,
                count: 1
            })]
        );

        clock.advance(Duration::from_secs(1));
        assert_eq!(store.snapshot(std::slice::from_ref(&k), clock.now()), vec![None]);
    }

    #[test]
    fn test_snapshot_does_not_create_entries() {
        let store = LocalStore::new(config(10, 0), Arc::new(ManualClock::new(T0))).unwrap();
        assert_eq!(store.snapshot(&[key("ghost")], T0), vec![None]);
        assert!(store.is_empty());
    }

    #[test]
    fn test_capacity_evicts_oldest_idle() {
        let clock = ManualClock::new(T0);
        let store = LocalStore::new(config(2, 0), Arc::new(clock.clone())).unwrap();
        let ttl = Duration::from_secs(60);

        write(&store, &key("first"), clock.now(), ttl);
        clock.advance(Duration::from_millis(10));
        write(&store, &key("second"), clock.now(), ttl);
        clock.advance(Duration::from_millis(10));

        // Touching "first" makes "second" the idle one.
        write(&store, &key("first"), clock.now(), ttl);
        clock.advance(Duration::from_millis(10));

        write(&store, &key("third"), clock.now(), ttl);

        assert_eq!(store.len(), 2);
        assert!(store.contains(&key("first")));
        assert!(!store.contains(&key("second")));
        assert!(store.contains(&key("third")));
    }

    #[test]
    fn test_capacity_never_exceeded_sequentially() {
        let clock = ManualClock::new(T0);
        let store = LocalStore::new(config(3, 0), Arc::new(clock.clone())).unwrap();

        for i in 0..50 {
            write(&store, &key(&format!("k{}", i)), clock.now(), Duration::from_secs(60));
            clock.advance(Duration::from_millis(1));
            assert!(store.len() <= 3);
        }
    }

    #[test]
    fn test_pinned_entries_survive_eviction_and_sweep() {
        let clock = ManualClock::new(T0);
        let store = LocalStore::new(config(1, 0), Arc::new(clock.clone())).unwrap();
        let k = key("busy");

        write(&store, &k, T0, Duration::from_millis(1));
        clock.advance(Duration::from_secs(1));

        let pinned = store.lookup(&k).unwrap();
        assert_eq!(store.sweep_expired(), 0);
        assert!(!store.evict_one());
        assert!(store.contains(&k));

        drop(pinned);
        assert_eq!(store.sweep_expired(), 1);
        assert!(store.is_empty());
    }

    #[test]
    fn test_sweep_removes_only_expired() {
        let clock = ManualClock::new(T0);
        let store = LocalStore::new(config(10, 0), Arc::new(clock.clone())).unwrap();

        write(&store, &key("short"), T0, Duration::from_secs(1));
        write(&store, &key("long"), T0, Duration::from_secs(60));

        clock.advance(Duration::from_secs(2));
        assert_eq!(store.sweep_expired(), 1);
        assert!(!store.contains(&key("short")));
        assert!(store.contains(&key("long")));
    }

    #[tokio::test(start_paused = true)]
    async fn test_background_sweep_reclaims_expired() {
        let clock = ManualClock::new(T0);
        let store = LocalStore::start(config(10, 1), Arc::new(clock.clone())).unwrap();

        write(&store, &key("a"), T0, Duration::from_millis(500));
        assert_eq!(store.len(), 1);

        clock.advance(Duration::from_secs(1));
        tokio::time::sleep(Duration::from_millis(1100)).await;

        assert!(store.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_stopped_sweep_leaves_entries() {
        let clock = ManualClock::new(T0);
        let store = LocalStore::start(config(10, 1), Arc::new(clock.clone())).unwrap();

        write(&store, &key("a"), T0, Duration::from_millis(500));
        store.stop_sweeper();
        store.stop_sweeper();

        clock.advance(Duration::from_secs(1));
        tokio::time::sleep(Duration::from_secs(3)).await;

        assert_eq!(store.len(), 1);
    }

    #[test]
    fn test_start_without_runtime_skips_sweep() {
        let store = LocalStore::start(config(10, 1), Arc::new(ManualClock::new(T0))).unwrap();
        assert!(store.sweeper.lock().is_none());
    }

    #[test]
    fn test_uncommitted_transaction_admits_nothing() {
        let clock = ManualClock::new(T0);
        let store = LocalStore::new(config(1, 0), Arc::new(clock.clone())).unwrap();

        write(&store, &key("a"), T0, Duration::from_secs(60));
        clock.advance(Duration::from_millis(10));

        let output = store.transact(&[key("b")], clock.now(), |states| {
            assert_eq!(states, &[None]);
            Transaction {
                output: "denied",
                commits: Vec::new(),
            }
        });

        assert_eq!(output, "denied");
        assert_eq!(store.len(), 1);
        assert!(store.contains(&key("a")));
        assert!(!store.contains(&key("b")));
    }

    #[test]
    fn test_abandoned_admission_is_given_back() {
        let clock = ManualClock::new(T0);
        let store = LocalStore::new(config(4, 0), Arc::new(clock.clone())).unwrap();
        let calls = AtomicUsize::new(0);

        // Wants to commit when checked, then changes its mind once admitted.
        store.transact(&[key("a"), key("b")], T0, |_| {
            let commits = if calls.fetch_add(1, Ordering::SeqCst) == 0 {
                vec![
                    (
                        StoredState::Windowed {
                            window_start: T0,
                            count: 1,
                        },
                        T0 + Duration::from_secs(1),
                    );
                    2
                ]
            } else {
                Vec::new()
            };
            Transaction { output: (), commits }
        });

        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert!(store.is_empty());
        assert_eq!(store.reserved.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_concurrent_admission_respects_capacity() {
        let clock = ManualClock::new(T0);
        let store = Arc::new(LocalStore::new(config(8, 0), Arc::new(clock)).unwrap());

        let handles: Vec<_> = (0..8)
            .map(|t| {
                let store = store.clone();
                std::thread::spawn(move || {
                    for i in 0..200 {
                        write(&store, &key(&format!("t{}-{}", t, i)), T0, Duration::from_secs(60));
                        assert!(store.len() <= 8);
                    }
                })
            })
            .collect();

        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(store.len(), 8);
        assert_eq!(store.reserved.load(Ordering::SeqCst), 8);
    }

    #[test]
    fn test_clear_releases_capacity() {
        let store = LocalStore::new(config(2, 0), Arc::new(ManualClock::new(T0))).unwrap();
        write(&store, &key("a"), T0, Duration::from_secs(60));
        write(&store, &key("b"), T0, Duration::from_secs(60));

        store.clear();
        assert!(store.is_empty());
        assert_eq!(store.reserved.load(Ordering::SeqCst), 0);

        write(&store, &key("c"), T0, Duration::from_secs(60));
        assert_eq!(store.len(), 1);
    }
}
