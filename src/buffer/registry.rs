//! Buffer Registry
//!
//! Sharded table of live actors keyed by domain. An actor is materialized on
//! first reference and runs as its own task, draining a mailbox one message
//! at a time:
//!
//! ```text
//! request(key) ──hash──► shard[i] ──► ActorHandle ──mpsc──► BufferActor task
//! fired alarm  ─────────────────────────┘
//! ```
//!
//! Evicting an actor drops its in-memory buffer, as a process restart
//! would. A re-materialized actor waits for its predecessor's task to exit
//! before loading state, so a key never has two running actors.

use crate::buffer::actor::{BufferActor, BufferDeps};
use crate::buffer::error::BufferError;
use crate::buffer::policy::FlushPolicy;
use crate::buffer::rpc::{RpcRequest, RpcResponse};
use crate::clock::Clock;
use crate::io::RngSource;
use parking_lot::Mutex;
use std::collections::hash_map::DefaultHasher;
use std::collections::HashMap;
use std::hash::{Hash, Hasher};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error};

const NUM_SHARDS: usize = 16;

enum ActorMessage {
    Request {
        request: RpcRequest,
        response_tx: oneshot::Sender<RpcResponse>,
    },
    Alarm,
    Stop,
}

impl<C: Clock> BufferActor<C> {
    async fn run(mut self, mut rx: mpsc::UnboundedReceiver<ActorMessage>) {
        while let Some(msg) = rx.recv().await {
            match msg {
                ActorMessage::Request {
                    request,
                    response_tx,
                } => {
                    let response = self.handle_request(request).await;
                    let _ = response_tx.send(response);
                }
                ActorMessage::Alarm => {
                    self.alarm().await;
                }
                ActorMessage::Stop => {
                    debug!(key = %self.key(), dropped = self.buffered().len(), "Buffer actor evicted");
                    break;
                }
            }
        }
    }
}

#[derive(Clone)]
pub struct ActorHandle {
    key: String,
    tx: mpsc::UnboundedSender<ActorMessage>,
}

impl ActorHandle {
    pub fn key(&self) -> &str {
        &self.key
    }

    pub async fn request(&self, request: RpcRequest) -> Result<RpcResponse, BufferError> {
        let (response_tx, response_rx) = oneshot::channel();
        if self
            .tx
            .send(ActorMessage::Request {
                request,
                response_tx,
            })
            .is_err()
        {
            return Err(BufferError::ActorUnavailable(self.key.clone()));
        }
        response_rx
            .await
            .map_err(|_| BufferError::ActorUnavailable(self.key.clone()))
    }

    fn alarm(&self) -> bool {
        self.tx.send(ActorMessage::Alarm).is_ok()
    }
}

struct ActorEntry {
    handle: ActorHandle,
    /// Resolves when the actor task exits
    exited: oneshot::Receiver<()>,
}

#[derive(Default)]
struct Shard {
    live: HashMap<String, ActorEntry>,
    /// Exit signals of evicted actors, awaited by their successor
    retired: HashMap<String, oneshot::Receiver<()>>,
}

struct RegistryInner<C: Clock> {
    shards: [Mutex<Shard>; NUM_SHARDS],
    deps: BufferDeps,
    policy: FlushPolicy,
    clock: C,
    rng_source: RngSource,
}

#[derive(Clone)]
pub struct BufferRegistry<C: Clock> {
    inner: Arc<RegistryInner<C>>,
}

#[inline]
fn shard_for(key: &str) -> usize {
    let mut hasher = DefaultHasher::new();
    key.hash(&mut hasher);
    (hasher.finish() as usize) % NUM_SHARDS
}

impl<C: Clock> BufferRegistry<C> {
    pub fn new(deps: BufferDeps, policy: FlushPolicy, clock: C, rng_source: RngSource) -> Self {
        BufferRegistry {
            inner: Arc::new(RegistryInner {
                shards: std::array::from_fn(|_| Mutex::new(Shard::default())),
                deps,
                policy,
                clock,
                rng_source,
            }),
        }
    }

    pub fn policy(&self) -> &FlushPolicy {
        &self.inner.policy
    }

    /// Handle for `key`, materializing the actor if needed
    pub fn handle(&self, key: &str) -> ActorHandle {
        let mut shard = self.inner.shards[shard_for(key)].lock();

        if let Some(entry) = shard.live.get(key) {
            if !entry.handle.tx.is_closed() {
                return entry.handle.clone();
            }
        }

        // Dead (failed to load) or never seen: chain after whatever ran before
        let predecessor = match shard.live.remove(key) {
            Some(dead) => Some(dead.exited),
            None => shard.retired.remove(key),
        };
        let entry = self.spawn_actor(key, predecessor);
        let handle = entry.handle.clone();
        shard.live.insert(key.to_string(), entry);
        handle
    }

    fn spawn_actor(&self, key: &str, predecessor: Option<oneshot::Receiver<()>>) -> ActorEntry {
        let (tx, rx) = mpsc::unbounded_channel();
        let (exit_tx, exited) = oneshot::channel::<()>();

        let actor_key = key.to_string();
        let deps = self.inner.deps.clone();
        let policy = self.inner.policy.clone();
        let clock = self.inner.clock.clone();
        let rng = self.inner.rng_source.for_key(key);

        tokio::spawn(async move {
            let _exit = exit_tx;
            if let Some(previous) = predecessor {
                let _ = previous.await;
            }
            match BufferActor::load(actor_key.clone(), deps, policy, clock, rng).await {
                Ok(actor) => actor.run(rx).await,
                Err(e) => error!(key = %actor_key, error = %e, "Failed to materialize buffer actor"),
            }
        });

        ActorEntry {
            handle: ActorHandle {
                key: key.to_string(),
                tx,
            },
            exited,
        }
    }

    pub async fn request(&self, key: &str, request: RpcRequest) -> Result<RpcResponse, BufferError> {
        self.handle(key).request(request).await
    }

    pub async fn append(&self, key: &str, domain: &str, line: impl Into<String>) -> Result<RpcResponse, BufferError> {
        self.request(key, RpcRequest::log(domain, line)).await
    }

    pub async fn flush(&self, key: &str) -> Result<RpcResponse, BufferError> {
        self.request(key, RpcRequest::flush()).await
    }

    pub async fn debug(&self, key: &str) -> Result<String, BufferError> {
        Ok(self.request(key, RpcRequest::debug()).await?.body)
    }

    /// Deliver a durable-timer callback
    pub fn alarm(&self, key: &str) {
        if !self.handle(key).alarm() {
            error!(key = %key, "Dropped flush alarm, actor unavailable");
        }
    }

    /// Drop the live actor for `key` with its buffered lines. Returns false
    /// if no actor was live.
    pub fn evict(&self, key: &str) -> bool {
        let mut shard = self.inner.shards[shard_for(key)].lock();
        let Some(entry) = shard.live.remove(key) else {
            return false;
        };
        let _ = entry.handle.tx.send(ActorMessage::Stop);
        shard.retired.insert(key.to_string(), entry.exited);
        true
    }

    pub fn live_keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self
            .inner
            .shards
            .iter()
            .flat_map(|shard| shard.lock().live.keys().cloned().collect::<Vec<_>>())
            .collect();
        keys.sort();
        keys
    }

    pub fn live_count(&self) -> usize {
        self.inner.shards.iter().map(|s| s.lock().live.len()).sum()
    }

    /// Manually flush every live actor; returns how many acknowledged
    pub async fn flush_all(&self) -> usize {
        let handles: Vec<ActorHandle> = self
            .inner
            .shards
            .iter()
            .flat_map(|shard| {
                shard
                    .lock()
                    .live
                    .values()
                    .map(|e| e.handle.clone())
                    .collect::<Vec<_>>()
            })
            .collect();

        let futures = handles.iter().map(|h| h.request(RpcRequest::flush()));
        futures::future::join_all(futures)
            .await
            .into_iter()
            .filter(|r| matches!(r, Ok(resp) if resp.is_success()))
            .count()
    }

    /// Forward fired alarm keys to their actors until the timer goes away
    pub fn spawn_alarm_pump(&self, mut fired_rx: mpsc::UnboundedReceiver<String>) -> tokio::task::JoinHandle<()> {
        let registry = self.clone();
        tokio::spawn(async move {
            while let Some(key) = fired_rx.recv().await {
                registry.alarm(&key);
            }
            debug!("Alarm pump stopped");
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::timer::ManualTimer;
    use crate::clock::SimulatedClock;
    use crate::storage::{InMemoryObjectStore, InMemoryStateStore, ObjectStore};
    use std::time::Duration;

    fn registry(bulk: &InMemoryObjectStore, threshold: usize) -> BufferRegistry<SimulatedClock> {
        let deps = BufferDeps {
            bulk: Arc::new(bulk.clone()),
            state: Arc::new(InMemoryStateStore::new()),
            timer: Arc::new(ManualTimer::new()),
        };
        BufferRegistry::new(
            deps,
            FlushPolicy::new(threshold, Duration::from_secs(300)),
            SimulatedClock::new(1_000),
            RngSource::Seeded(7),
        )
    }

    #[test]
    fn test_shard_for_is_stable() {
        assert_eq!(shard_for("a.com"), shard_for("a.com"));
        assert!(shard_for("b.com") < NUM_SHARDS);
    }

    #[tokio::test]
    async fn test_actors_are_isolated_per_key() {
        let bulk = InMemoryObjectStore::new();
        let registry = registry(&bulk, 100);

        registry.append("a.com", "a.com", "a1").await.unwrap();
        registry.append("b.com", "b.com", "b1").await.unwrap();
        registry.append("a.com", "a.com", "a2").await.unwrap();

        assert_eq!(registry.debug("a.com").await.unwrap(), "a1\na2");
        assert_eq!(registry.debug("b.com").await.unwrap(), "b1");
        assert_eq!(registry.live_keys(), vec!["a.com", "b.com"]);
    }

    #[tokio::test]
    async fn test_concurrent_appends_are_serialized() {
        let bulk = InMemoryObjectStore::new();
        let registry = registry(&bulk, 10);

        let tasks: Vec<_> = (0..50)
            .map(|i| {
                let registry = registry.clone();
                tokio::spawn(async move {
                    registry.append("a.com", "a.com", format!("line-{}", i)).await.unwrap()
                })
            })
            .collect();
        for task in tasks {
            assert!(task.await.unwrap().is_success());
        }

        assert_eq!(bulk.len(), 5, "50 lines at threshold 10");
        let mut total = 0;
        for key in bulk.keys() {
            let body = String::from_utf8(bulk.get(&key).await.unwrap()).unwrap();
            assert_eq!(body.lines().count(), 10);
            total += 10;
        }
        assert_eq!(total, 50);
        assert_eq!(registry.debug("a.com").await.unwrap(), "");
    }

    #[tokio::test]
    async fn test_evict_drops_buffer_keeps_state() {
        let bulk = InMemoryObjectStore::new();
        let registry = registry(&bulk, 100);

        registry.append("a.com", "a.com", "lost").await.unwrap();
        assert!(registry.evict("a.com"));
        assert!(!registry.evict("a.com"));
        assert_eq!(registry.live_count(), 0);

        assert_eq!(registry.debug("a.com").await.unwrap(), "");
        registry.append("a.com", "ignored.com", "kept").await.unwrap();
        registry.flush("a.com").await.unwrap();

        let keys = bulk.keys();
        assert_eq!(keys.len(), 1);
        assert!(keys[0].starts_with("logs/a.com/"), "domain survives eviction");
        assert_eq!(bulk.get(&keys[0]).await.unwrap(), b"kept");
    }

    #[tokio::test]
    async fn test_flush_all() {
        let bulk = InMemoryObjectStore::new();
        let registry = registry(&bulk, 100);

        registry.append("a.com", "a.com", "1").await.unwrap();
        registry.append("b.com", "b.com", "2").await.unwrap();
        registry.debug("c.com").await.unwrap();

        assert_eq!(registry.flush_all().await, 3);
        assert_eq!(bulk.len(), 2, "empty buffers write nothing");
    }

    #[tokio::test]
    async fn test_alarm_pump_flushes() {
        let bulk = InMemoryObjectStore::new();
        let registry = registry(&bulk, 100);
        let (fired_tx, fired_rx) = mpsc::unbounded_channel();
        let pump = registry.spawn_alarm_pump(fired_rx);

        registry.append("a.com", "a.com", "line").await.unwrap();
        fired_tx.send("a.com".to_string()).unwrap();
        drop(fired_tx);
        pump.await.unwrap();

        // The alarm is queued ahead of this request in the mailbox
        assert_eq!(registry.debug("a.com").await.unwrap(), "");
        assert_eq!(bulk.len(), 1);
    }
}
