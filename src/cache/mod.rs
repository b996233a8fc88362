//! In-memory result cache with single-flight computation.
//!
//! [`ResultCache`] maps a key to an immutable byte payload. Entries expire
//! after a fixed TTL and the number of live entries is bounded by a capacity;
//! when an insert would exceed it, the least-recently-used entry is evicted.
//!
//! Concurrent misses on the same key collapse into one computation. The first
//! caller becomes the leader and runs the computation without holding the
//! cache lock; every caller that arrives while the key is in flight subscribes
//! to a [`watch`] channel and receives the leader's outcome, success or
//! failure.
//!
//! ```text
//! get_or_compute(key)
//!     ├── live entry      → payload (recency bumped)
//!     ├── key in flight   → wait ≤ wait_timeout for the leader's outcome
//!     └── miss            → leader: compute → store → broadcast
//! ```

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use bytes::Bytes;
use parking_lot::{RwLock, RwLockWriteGuard};
use serde::Deserialize;
use thiserror::Error;
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{debug, trace, warn};

/// Number of bounded attempts made to acquire the exclusive lock before a
/// structural mutation gives up with [`CacheError::LockUnavailable`].
const LOCK_ATTEMPTS: u32 = 3;

/// Errors produced by [`ResultCache`].
///
/// The type is `Clone` because the outcome of one computation is delivered to
/// every caller waiting on it.
#[derive(Debug, Clone, Error)]
pub enum CacheError {
    #[error("computing `{key}` failed: {source}")]
    ComputeFailed {
        key: String,
        #[source]
        source: Arc<dyn std::error::Error + Send + Sync>,
    },

    #[error("gave up on `{key}` after waiting {waited:?} for its computation")]
    Timeout { key: String, waited: Duration },

    #[error("computation of `{key}` was abandoned before it completed")]
    Abandoned { key: String },

    #[error("cache lock unavailable after {waited:?}")]
    LockUnavailable { waited: Duration },

    #[error("cache is full ({capacity} entries) and no entry can be evicted")]
    CacheFull { capacity: usize },
}

/// Tuning knobs for a [`ResultCache`].
///
/// Durations deserialize from human readable strings such as `"10m"` or
/// `"500ms"`.
#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq)]
#[serde(default)]
pub struct CacheConfig {
    /// Maximum number of live entries.
    pub capacity: usize,

    /// Age after which an entry is no longer served.
    #[serde(with = "humantime_serde")]
    pub ttl: Duration,

    /// How long a caller waits for another caller's in-flight computation.
    #[serde(with = "humantime_serde")]
    pub wait_timeout: Duration,

    /// Bounded wait for the exclusive lock, per attempt.
    #[serde(with = "humantime_serde")]
    pub lock_timeout: Duration,

    /// Period of the proactive sweep that drops expired entries.
    #[serde(with = "humantime_serde")]
    pub sweep_interval: Duration,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            capacity: 1024,
            ttl: Duration::from_secs(10 * 60),
            wait_timeout: Duration::from_secs(30),
            lock_timeout: Duration::from_secs(1),
            sweep_interval: Duration::from_secs(60),
        }
    }
}

impl CacheConfig {
    /// Checks that the configuration describes a usable cache.
    ///
    /// # Errors
    ///
    /// Returns a description of the first offending field.
    pub fn validate(&self) -> Result<(), &'static str> {
        if self.capacity == 0 {
            return Err("cache.capacity must be at least 1");
        }
        if self.ttl.is_zero() {
            return Err("cache.ttl must be greater than zero");
        }
        if self.wait_timeout.is_zero() {
            return Err("cache.wait_timeout must be greater than zero");
        }
        if self.lock_timeout.is_zero() {
            return Err("cache.lock_timeout must be greater than zero");
        }
        if self.sweep_interval.is_zero() {
            return Err("cache.sweep_interval must be greater than zero");
        }
        Ok(())
    }
}

type Outcome = Result<Bytes, CacheError>;

/// A cached payload. Never edited in place; replacement is wholesale.
struct CacheEntry {
    key: String,
    payload: Bytes,
    created_at: Instant,
    // LRU bookkeeping: tick of the most recent hit.
    last_access: AtomicU64,
}

impl CacheEntry {
    fn new(key: String, payload: Bytes, created_at: Instant, tick: u64) -> Self {
        Self {
            key,
            payload,
            created_at,
            last_access: AtomicU64::new(tick),
        }
    }

    fn is_live(&self, now: Instant, ttl: Duration) -> bool {
        now.duration_since(self.created_at) < ttl
    }
}

#[derive(Default)]
struct CacheState {
    entries: HashMap<String, CacheEntry>,
    in_flight: HashMap<String, watch::Receiver<Option<Outcome>>>,
}

/// What a caller of [`ResultCache::get_or_compute`] has to do next.
enum Claim {
    Hit(Bytes),
    Wait(watch::Receiver<Option<Outcome>>),
    Compute(watch::Sender<Option<Outcome>>),
}

/// A thread-safe, capacity-bounded, TTL-expiring cache of computed payloads.
///
/// All state sits behind a single [`RwLock`]. Hits take the shared lock and
/// bump an atomic recency stamp, so readers never block each other. Inserts,
/// evictions and removals take the exclusive lock with a bounded wait. The
/// lock is never held across an `.await`.
///
/// # Examples
///
/// ```
/// use bytes::Bytes;
/// use sheetcache::cache::{CacheConfig, ResultCache};
///
/// # #[tokio::main(flavor = "current_thread")]
/// # async fn main() -> Result<(), Box<dyn std::error::Error>> {
/// let cache = ResultCache::new(CacheConfig::default());
///
/// let payload = cache
///     .get_or_compute("report.csv", || async {
///         Ok::<_, std::io::Error>(Bytes::from_static(b"converted"))
///     })
///     .await?;
///
/// assert_eq!(payload, "converted");
/// assert!(cache.contains("report.csv"));
/// # Ok(())
/// # }
/// ```
pub struct ResultCache {
    config: CacheConfig,
    state: RwLock<CacheState>,
    clock: AtomicU64,
}

impl fmt::Debug for ResultCache {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let (entries, in_flight) = self
            .state
            .try_read()
            .map(|state| (state.entries.len(), state.in_flight.len()))
            .unwrap_or_default();
        f.debug_struct("ResultCache")
            .field("config", &self.config)
            .field("entries", &entries)
            .field("in_flight", &in_flight)
            .finish()
    }
}

impl ResultCache {
    /// Creates an empty cache.
    pub fn new(config: CacheConfig) -> Self {
        Self {
            config,
            state: RwLock::new(CacheState::default()),
            clock: AtomicU64::new(0),
        }
    }

    /// Returns the configuration this cache was built with.
    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    /// Returns the payload for `key`, computing it with `compute` on a miss.
    ///
    /// - A live entry is returned immediately and `compute` is not called.
    /// - If another caller is already computing `key`, this call waits for
    ///   that computation (at most [`CacheConfig::wait_timeout`]) and returns
    ///   its outcome.
    /// - Otherwise this caller runs `compute`. On success the payload is
    ///   stored, evicting the least-recently-used entry if the cache is full.
    ///   On failure nothing is stored. Either way every waiter receives the
    ///   same outcome.
    ///
    /// A payload that was computed but could not be stored (lock contention,
    /// nothing evictable) is still returned; the failure is only logged.
    ///
    /// # Errors
    ///
    /// - [`CacheError::ComputeFailed`] — `compute` returned an error.
    /// - [`CacheError::Timeout`] — the in-flight computation did not finish
    ///   within the wait bound. The computation itself keeps running.
    /// - [`CacheError::Abandoned`] — the computing caller was cancelled.
    /// - [`CacheError::LockUnavailable`] — a miss could not be registered.
    pub async fn get_or_compute<F, Fut, E>(&self, key: &str, compute: F) -> Result<Bytes, CacheError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<Bytes, E>>,
        E: std::error::Error + Send + Sync + 'static,
    {
        let sender = match self.claim(key)? {
            Claim::Hit(payload) => return Ok(payload),
            Claim::Wait(receiver) => return self.wait_for(key, receiver).await,
            Claim::Compute(sender) => sender,
        };

        let flight = InFlight {
            cache: self,
            key,
            sender: Some(sender),
        };

        debug!(key, "computing cache entry");
        let outcome = compute().await.map_err(|error| CacheError::ComputeFailed {
            key: key.to_owned(),
            source: Arc::new(error),
        });

        flight.complete(outcome)
    }

    /// Returns the payload for `key` if a live entry exists.
    ///
    /// Checking liveness and reading the payload happen under one lock
    /// acquisition. A stale entry found here is evicted and `None` is
    /// returned. A hit counts as an access for LRU purposes.
    pub fn get(&self, key: &str) -> Option<Bytes> {
        self.lookup(key, true)
    }

    /// Returns `true` if a live entry exists for `key`.
    ///
    /// Like [`get`](Self::get) this evicts a stale entry, but it does not
    /// count as an access.
    pub fn contains(&self, key: &str) -> bool {
        self.lookup(key, false).is_some()
    }

    /// Stores `payload` under `key`, replacing any previous entry.
    ///
    /// # Errors
    ///
    /// - [`CacheError::LockUnavailable`] — the exclusive lock could not be
    ///   acquired within the bounded wait.
    /// - [`CacheError::CacheFull`] — the cache is at capacity and every entry
    ///   belongs to a key that is currently being computed.
    pub fn insert(&self, key: impl Into<String>, payload: Bytes) -> Result<(), CacheError> {
        let mut state = self.write_state()?;
        self.store(&mut state, key.into(), payload)
    }

    /// Removes the entry for `key`, returning whether one was present.
    ///
    /// An in-flight computation for `key` is not cancelled; it stores its
    /// result when it finishes.
    ///
    /// # Errors
    ///
    /// Returns [`CacheError::LockUnavailable`] if the exclusive lock could not
    /// be acquired.
    pub fn remove(&self, key: &str) -> Result<bool, CacheError> {
        let removed = self.write_state()?.entries.remove(key).is_some();
        if removed {
            debug!(key, "removed cache entry");
        }
        Ok(removed)
    }

    /// Drops every expired entry and returns how many were removed.
    ///
    /// # Errors
    ///
    /// Returns [`CacheError::LockUnavailable`] if the exclusive lock could not
    /// be acquired.
    pub fn purge_expired(&self) -> Result<usize, CacheError> {
        let now = Instant::now();
        let ttl = self.config.ttl;
        let mut state = self.write_state()?;
        let before = state.entries.len();
        state.entries.retain(|_, entry| entry.is_live(now, ttl));
        Ok(before - state.entries.len())
    }

    /// Returns the number of stored entries, including expired ones that have
    /// not been evicted yet.
    pub fn len(&self) -> usize {
        self.state.read().entries.len()
    }

    /// Returns `true` if no entries are stored.
    pub fn is_empty(&self) -> bool {
        self.state.read().entries.is_empty()
    }

    /// Returns the number of keys currently being computed.
    pub fn in_flight(&self) -> usize {
        self.state.read().in_flight.len()
    }

    fn tick(&self) -> u64 {
        self.clock.fetch_add(1, Ordering::Relaxed) + 1
    }

    fn touch(&self, entry: &CacheEntry) -> Bytes {
        entry.last_access.store(self.tick(), Ordering::Relaxed);
        entry.payload.clone()
    }

    fn write_state(&self) -> Result<RwLockWriteGuard<'_, CacheState>, CacheError> {
        for attempt in 1..=LOCK_ATTEMPTS {
            if let Some(guard) = self.state.try_write_for(self.config.lock_timeout) {
                return Ok(guard);
            }
            debug!(attempt, "cache write lock contended");
        }
        Err(CacheError::LockUnavailable {
            waited: self.config.lock_timeout * LOCK_ATTEMPTS,
        })
    }

    fn lookup(&self, key: &str, touch: bool) -> Option<Bytes> {
        let now = Instant::now();
        let ttl = self.config.ttl;

        {
            let state = self.state.read();
            let entry = state.entries.get(key)?;
            if entry.is_live(now, ttl) {
                return Some(if touch {
                    self.touch(entry)
                } else {
                    entry.payload.clone()
                });
            }
        }

        // The entry may have been replaced since the read lock was released,
        // so staleness is checked again before removing it.
        match self.write_state() {
            Ok(mut state) => {
                if state
                    .entries
                    .get(key)
                    .is_some_and(|entry| !entry.is_live(now, ttl))
                {
                    state.entries.remove(key);
                    debug!(key, "evicted expired entry");
                }
            }
            Err(error) => debug!(key, %error, "deferred eviction of expired entry"),
        }
        None
    }

    fn claim(&self, key: &str) -> Result<Claim, CacheError> {
        let now = Instant::now();
        let ttl = self.config.ttl;

        {
            let state = self.state.read();
            if let Some(entry) = state.entries.get(key).filter(|e| e.is_live(now, ttl)) {
                trace!(key, "cache hit");
                return Ok(Claim::Hit(self.touch(entry)));
            }
            if let Some(receiver) = state.in_flight.get(key) {
                return Ok(Claim::Wait(receiver.clone()));
            }
        }

        let mut state = self.write_state()?;

        if let Some(entry) = state.entries.get(key) {
            if entry.is_live(now, ttl) {
                trace!(key, "cache hit");
                return Ok(Claim::Hit(self.touch(entry)));
            }
        }
        if state.entries.remove(key).is_some() {
            debug!(key, "evicted expired entry");
        }

        if let Some(receiver) = state.in_flight.get(key) {
            return Ok(Claim::Wait(receiver.clone()));
        }

        let (sender, receiver) = watch::channel(None);
        state.in_flight.insert(key.to_owned(), receiver);
        Ok(Claim::Compute(sender))
    }

    async fn wait_for(&self, key: &str, mut receiver: watch::Receiver<Option<Outcome>>) -> Outcome {
        trace!(key, "joining in-flight computation");
        let waited =
            tokio::time::timeout(self.config.wait_timeout, receiver.wait_for(Option::is_some))
                .await;

        match waited {
            Ok(Ok(outcome)) => (*outcome).clone().unwrap_or_else(|| {
                Err(CacheError::Abandoned {
                    key: key.to_owned(),
                })
            }),
            Ok(Err(_closed)) => Err(CacheError::Abandoned {
                key: key.to_owned(),
            }),
            Err(_elapsed) => {
                debug!(key, "timed out waiting for in-flight computation");
                Err(CacheError::Timeout {
                    key: key.to_owned(),
                    waited: self.config.wait_timeout,
                })
            }
        }
    }

    fn store(&self, state: &mut CacheState, key: String, payload: Bytes) -> Result<(), CacheError> {
        let now = Instant::now();
        let ttl = self.config.ttl;
        let capacity = self.config.capacity;

        state.entries.remove(&key);

        if state.entries.len() >= capacity {
            state.entries.retain(|_, entry| entry.is_live(now, ttl));
        }

        while state.entries.len() >= capacity {
            let in_flight = &state.in_flight;
            let victim = state
                .entries
                .iter()
                .filter(|(key, _)| !in_flight.contains_key(*key))
                .min_by_key(|(_, entry)| entry.last_access.load(Ordering::Relaxed))
                .map(|(key, _)| key.clone());

            let Some(victim) = victim else {
                return Err(CacheError::CacheFull { capacity });
            };
            if let Some(evicted) = state.entries.remove(&victim) {
                debug!(key = %evicted.key, "evicted least recently used entry");
            }
        }

        let tick = self.tick();
        state
            .entries
            .insert(key.clone(), CacheEntry::new(key, payload, now, tick));
        Ok(())
    }
}

/// The leader's claim on an in-flight key.
///
/// Completing it stores the outcome and wakes every waiter. Dropping it
/// without completing (the leader's future was cancelled) clears the marker
/// and tells waiters the computation was abandoned.
struct InFlight<'a> {
    cache: &'a ResultCache,
    key: &'a str,
    sender: Option<watch::Sender<Option<Outcome>>>,
}

impl InFlight<'_> {
    fn complete(mut self, outcome: Outcome) -> Outcome {
        {
            // The marker has to be cleared, so this waits for the lock
            // unconditionally. No critical section spans an await.
            let mut state = self.cache.state.write();
            state.in_flight.remove(self.key);

            if let Ok(payload) = &outcome {
                if let Err(error) = self.cache.store(&mut state, self.key.to_owned(), payload.clone())
                {
                    warn!(key = self.key, %error, "computed payload was not cached");
                }
            }
        }

        if let Err(error) = &outcome {
            debug!(key = self.key, %error, "computation failed");
        }

        if let Some(sender) = self.sender.take() {
            sender.send_replace(Some(outcome.clone()));
        }
        outcome
    }
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        let Some(sender) = self.sender.take() else {
            return;
        };
        self.cache.state.write().in_flight.remove(self.key);
        warn!(key = self.key, "computation abandoned before completion");
        sender.send_replace(Some(Err(CacheError::Abandoned {
            key: self.key.to_owned(),
        })));
    }
}
