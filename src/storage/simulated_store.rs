//! Simulated Object Store with Fault Injection
//!
//! DST wrappers that fail or delay writes deterministically via buggify.
//! Reads pass straight through, so invariant checks see the real contents.

use crate::buggify::faults::{bulk_store as faults, state_store as state_faults};
use crate::clock::Timestamp;
use crate::io::Rng;
use crate::storage::{ActorState, ObjectMeta, ObjectStore, StateStore};
use parking_lot::Mutex;
use std::future::Future;
use std::io::{Error as IoError, ErrorKind, Result as IoResult};
use std::pin::Pin;
use std::sync::Arc;

/// Configuration for simulated fault injection
#[derive(Debug, Clone)]
pub struct SimulatedStoreConfig {
    /// Probability of PUT failure
    pub put_fail_prob: f64,
    /// Probability of PUT timing out
    pub timeout_prob: f64,
    /// Simulated latency range in microseconds (min, max)
    pub latency_range_us: (u64, u64),
}

impl Default for SimulatedStoreConfig {
    fn default() -> Self {
        SimulatedStoreConfig {
            put_fail_prob: 0.01,
            timeout_prob: 0.005,
            latency_range_us: (0, 0),
        }
    }
}

impl SimulatedStoreConfig {
    /// High chaos configuration for stress testing
    pub fn high_chaos() -> Self {
        SimulatedStoreConfig {
            put_fail_prob: 0.2,
            timeout_prob: 0.05,
            latency_range_us: (0, 500),
        }
    }

    /// No faults - for baseline testing
    pub fn no_faults() -> Self {
        SimulatedStoreConfig {
            put_fail_prob: 0.0,
            timeout_prob: 0.0,
            latency_range_us: (0, 0),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SimulatedStoreStats {
    pub put_attempts: u64,
    pub put_failures: u64,
    pub timeouts: u64,
}

struct SimulatedStoreInner<R: Rng> {
    rng: R,
    stats: SimulatedStoreStats,
}

/// Wraps another store and injects faults on writes
pub struct SimulatedObjectStore<S: ObjectStore, R: Rng> {
    inner_store: Arc<S>,
    config: SimulatedStoreConfig,
    state: Arc<Mutex<SimulatedStoreInner<R>>>,
}

impl<S: ObjectStore, R: Rng> SimulatedObjectStore<S, R> {
    pub fn new(inner_store: S, rng: R, config: SimulatedStoreConfig) -> Self {
        SimulatedObjectStore {
            inner_store: Arc::new(inner_store),
            config,
            state: Arc::new(Mutex::new(SimulatedStoreInner {
                rng,
                stats: SimulatedStoreStats::default(),
            })),
        }
    }

    pub fn stats(&self) -> SimulatedStoreStats {
        self.state.lock().stats.clone()
    }

    pub fn inner(&self) -> &S {
        &self.inner_store
    }

    /// Decide the fate of one put; the lock is released before any await
    fn roll_put(&self) -> Result<u64, IoError> {
        let mut s = self.state.lock();
        s.stats.put_attempts += 1;

        if crate::buggify!(&mut s.rng, faults::TIMEOUT, self.config.timeout_prob) {
            s.stats.timeouts += 1;
            return Err(IoError::new(ErrorKind::TimedOut, "simulated timeout"));
        }
        if crate::buggify!(&mut s.rng, faults::PUT_FAIL, self.config.put_fail_prob) {
            s.stats.put_failures += 1;
            return Err(IoError::new(ErrorKind::Other, "simulated put failure"));
        }

        let (min, max) = self.config.latency_range_us;
        Ok(if max > min { s.rng.gen_range(min, max) } else { min })
    }
}

impl<S: ObjectStore, R: Rng> Clone for SimulatedObjectStore<S, R> {
    fn clone(&self) -> Self {
        SimulatedObjectStore {
            inner_store: self.inner_store.clone(),
            config: self.config.clone(),
            state: self.state.clone(),
        }
    }
}

impl<S: ObjectStore, R: Rng> ObjectStore for SimulatedObjectStore<S, R> {
    fn put<'a>(
        &'a self,
        key: &'a str,
        data: &'a [u8],
        content_type: &'a str,
    ) -> Pin<Box<dyn Future<Output = IoResult<()>> + Send + 'a>> {
        Box::pin(async move {
            let latency_us = self.roll_put()?;
            if latency_us > 0 {
                tokio::time::sleep(std::time::Duration::from_micros(latency_us)).await;
            }
            self.inner_store.put(key, data, content_type).await
        })
    }

    fn get<'a>(
        &'a self,
        key: &'a str,
    ) -> Pin<Box<dyn Future<Output = IoResult<Vec<u8>>> + Send + 'a>> {
        self.inner_store.get(key)
    }

    fn head<'a>(
        &'a self,
        key: &'a str,
    ) -> Pin<Box<dyn Future<Output = IoResult<ObjectMeta>> + Send + 'a>> {
        self.inner_store.head(key)
    }

    fn list<'a>(
        &'a self,
        prefix: &'a str,
    ) -> Pin<Box<dyn Future<Output = IoResult<Vec<ObjectMeta>>> + Send + 'a>> {
        self.inner_store.list(prefix)
    }
}

/// Wraps a [`StateStore`] and fails `save` with the given probability
///
/// Alarm writes are left alone: the scheduler owns them and a lost alarm
/// would only mask actor-level faults.
pub struct SimulatedStateStore<S: StateStore, R: Rng> {
    inner_store: Arc<S>,
    save_fail_prob: f64,
    state: Arc<Mutex<SimulatedStoreInner<R>>>,
}

impl<S: StateStore, R: Rng> SimulatedStateStore<S, R> {
    pub fn new(inner_store: S, rng: R, save_fail_prob: f64) -> Self {
        SimulatedStateStore {
            inner_store: Arc::new(inner_store),
            save_fail_prob,
            state: Arc::new(Mutex::new(SimulatedStoreInner {
                rng,
                stats: SimulatedStoreStats::default(),
            })),
        }
    }

    pub fn inner(&self) -> &S {
        &self.inner_store
    }

    /// `put_*` counters here track `save` calls
    pub fn stats(&self) -> SimulatedStoreStats {
        self.state.lock().stats.clone()
    }
}

impl<S: StateStore, R: Rng> Clone for SimulatedStateStore<S, R> {
    fn clone(&self) -> Self {
        SimulatedStateStore {
            inner_store: self.inner_store.clone(),
            save_fail_prob: self.save_fail_prob,
            state: self.state.clone(),
        }
    }
}

impl<S: StateStore, R: Rng> StateStore for SimulatedStateStore<S, R> {
    fn load<'a>(
        &'a self,
        key: &'a str,
    ) -> Pin<Box<dyn Future<Output = IoResult<Option<ActorState>>> + Send + 'a>> {
        self.inner_store.load(key)
    }

    fn save<'a>(
        &'a self,
        key: &'a str,
        state: &'a ActorState,
    ) -> Pin<Box<dyn Future<Output = IoResult<()>> + Send + 'a>> {
        Box::pin(async move {
            {
                let mut s = self.state.lock();
                s.stats.put_attempts += 1;
                if crate::buggify!(&mut s.rng, state_faults::SAVE_FAIL, self.save_fail_prob) {
                    s.stats.put_failures += 1;
                    return Err(IoError::new(ErrorKind::Other, "simulated state save failure"));
                }
            }
            self.inner_store.save(key, state).await
        })
    }

    fn save_alarm<'a>(
        &'a self,
        key: &'a str,
        at: Option<Timestamp>,
    ) -> Pin<Box<dyn Future<Output = IoResult<()>> + Send + 'a>> {
        self.inner_store.save_alarm(key, at)
    }

    fn list_alarms<'a>(
        &'a self,
    ) -> Pin<Box<dyn Future<Output = IoResult<Vec<(String, Timestamp)>>> + Send + 'a>> {
        self.inner_store.list_alarms()
    }
}
