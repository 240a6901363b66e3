//! Buffer Actor
//!
//! One actor per domain key. It owns the in-memory line buffer and the
//! persisted [`ActorState`], and is the only writer of either. All
//! operations take `&mut self`; the registry serializes calls through the
//! actor's mailbox so there is never more than one in flight.
//!
//! ## Flush
//!
//! Both triggers (threshold / staleness on append, the durable timer, and a
//! manual request) go through [`BufferActor::flush`]:
//!
//! ```text
//! lines ──join("\n")──► logs/{domain}/{iso8601}-{suffix}.log ──► ObjectStore
//!   │
//!   └── cleared before the write (ClearThenWrite) or after it (WriteThenClear)
//! ```
//!
//! Afterwards the timer is rescheduled for `now + interval`.

use crate::buffer::error::BufferError;
use crate::buffer::policy::{FlushOrdering, FlushPolicy};
use crate::buffer::timer::DurableTimer;
use crate::clock::{Clock, Timestamp};
use crate::io::Rng;
use crate::storage::{ActorState, ObjectStore, StateStore, CONTENT_TYPE_TEXT_PLAIN};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// Domain recorded when a log request carries none
pub const DEFAULT_DOMAIN: &str = "unknown";

const SUFFIX_LEN: usize = 5;
const SUFFIX_ALPHABET: &[u8] = b"abcdefghijklmnopqrstuvwxyz0123456789";

/// Collaborators shared by every actor
#[derive(Clone)]
pub struct BufferDeps {
    pub bulk: Arc<dyn ObjectStore>,
    pub state: Arc<dyn StateStore>,
    pub timer: Arc<dyn DurableTimer>,
}

/// Result of one flush attempt
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FlushOutcome {
    /// Nothing buffered; no write, no reschedule
    Empty,
    Written { key: String, lines: usize },
    /// Write failed after the buffer was cleared
    Lost { key: String, lines: usize, error: String },
    /// Every write attempt failed; the lines are still buffered
    Retained { key: String, lines: usize, error: String },
}

impl FlushOutcome {
    pub fn is_written(&self) -> bool {
        matches!(self, FlushOutcome::Written { .. })
    }
}

pub struct BufferActor<C: Clock> {
    key: String,
    lines: Vec<String>,
    state: ActorState,
    policy: FlushPolicy,
    deps: BufferDeps,
    clock: C,
    rng: Box<dyn Rng>,
}

impl<C: Clock> BufferActor<C> {
    /// Materialize the actor for `key`, resuming its persisted fields.
    /// The line buffer always starts empty.
    pub async fn load(
        key: impl Into<String>,
        deps: BufferDeps,
        policy: FlushPolicy,
        clock: C,
        rng: Box<dyn Rng>,
    ) -> Result<Self, BufferError> {
        let key = key.into();
        let state = deps
            .state
            .load(&key)
            .await
            .map_err(BufferError::State)?
            .unwrap_or_default();
        debug!(key = %key, ?state, "Materialized buffer actor");

        Ok(BufferActor {
            lines: Vec::with_capacity(policy.threshold.min(1024)),
            key,
            state,
            policy,
            deps,
            clock,
            rng,
        })
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn state(&self) -> &ActorState {
        &self.state
    }

    pub fn buffered(&self) -> &[String] {
        &self.lines
    }

    /// Buffer one line, flushing and arming the timer as the policy requires.
    /// Returns the outcome of the flush the append triggered, if any.
    ///
    /// An error means the line was not buffered. Failures after the line is
    /// in the buffer are logged, not returned.
    pub async fn append(&mut self, domain: &str, line: String) -> Result<Option<FlushOutcome>, BufferError> {
        let now = self.clock.now();

        if self.state.domain.is_none() {
            let mut next = self.state.clone();
            next.domain = Some(domain.to_string());
            self.deps
                .state
                .save(&self.key, &next)
                .await
                .map_err(BufferError::State)?;
            self.state = next;
        }

        self.lines.push(line);

        let mut flushed = None;
        if self
            .policy
            .should_flush(self.lines.len(), self.state.last_flush_at(), now)
        {
            flushed = Some(self.flush().await);
            self.state.last_flush_at = Some(now.as_millis());
            self.persist_state().await;
        }

        if FlushPolicy::needs_schedule(self.state.next_scheduled_flush(), now) {
            if let Err(e) = self.schedule(self.policy.next_deadline(now)).await {
                error!(key = %self.key, error = %e, "Failed to arm flush timer");
            }
        }

        Ok(flushed)
    }

    /// Write the buffered lines as one batch
    pub async fn flush(&mut self) -> FlushOutcome {
        if self.lines.is_empty() {
            return FlushOutcome::Empty;
        }

        let domain = self.state.domain.as_deref().unwrap_or(DEFAULT_DOMAIN);
        let key = batch_key(domain, self.clock.now(), self.rng.as_mut());
        let outcome = match self.policy.ordering {
            FlushOrdering::ClearThenWrite => self.clear_then_write(key).await,
            FlushOrdering::WriteThenClear { max_retries, backoff } => {
                self.write_then_clear(key, max_retries, backoff).await
            }
        };

        let next = self.policy.next_deadline(self.clock.now());
        if let Err(e) = self.schedule(next).await {
            error!(key = %self.key, error = %e, "Failed to reschedule flush timer");
        }

        outcome
    }

    /// Durable timer callback
    pub async fn alarm(&mut self) -> FlushOutcome {
        debug!(key = %self.key, buffered = self.lines.len(), "Flush alarm fired");
        self.flush().await
    }

    /// Current buffer, newline-joined
    pub fn debug(&self) -> String {
        self.lines.join("\n")
    }

    async fn clear_then_write(&mut self, key: String) -> FlushOutcome {
        let batch = std::mem::take(&mut self.lines);
        let lines = batch.len();
        let body = batch.join("\n");

        match self
            .deps
            .bulk
            .put(&key, body.as_bytes(), CONTENT_TYPE_TEXT_PLAIN)
            .await
        {
            Ok(()) => {
                info!(key = %key, lines, "Flushed batch");
                FlushOutcome::Written { key, lines }
            }
            Err(e) => {
                error!(key = %key, lines, error = %e, "Batch write failed, batch dropped");
                FlushOutcome::Lost {
                    key,
                    lines,
                    error: e.to_string(),
                }
            }
        }
    }

    async fn write_then_clear(&mut self, key: String, max_retries: u32, backoff: Duration) -> FlushOutcome {
        let lines = self.lines.len();
        let body = self.lines.join("\n");
        let mut delay = backoff;
        let mut attempt = 0u32;

        loop {
            match self
                .deps
                .bulk
                .put(&key, body.as_bytes(), CONTENT_TYPE_TEXT_PLAIN)
                .await
            {
                Ok(()) => {
                    self.lines.clear();
                    info!(key = %key, lines, attempt, "Flushed batch");
                    return FlushOutcome::Written { key, lines };
                }
                Err(e) if attempt < max_retries => {
                    warn!(key = %key, attempt, error = %e, "Batch write failed, retrying");
                    tokio::time::sleep(delay).await;
                    delay = delay.saturating_mul(2);
                    attempt += 1;
                }
                Err(e) => {
                    error!(key = %key, lines, error = %e, "Batch write failed, keeping lines buffered");
                    return FlushOutcome::Retained {
                        key,
                        lines,
                        error: e.to_string(),
                    };
                }
            }
        }
    }

    /// Arm the timer, then record the schedule
    async fn schedule(&mut self, at: Timestamp) -> Result<(), BufferError> {
        self.deps
            .timer
            .set_alarm(&self.key, at)
            .await
            .map_err(BufferError::Timer)?;
        self.state.next_scheduled_flush = Some(at.as_millis());
        self.deps
            .state
            .save(&self.key, &self.state)
            .await
            .map_err(BufferError::State)
    }

    async fn persist_state(&mut self) {
        if let Err(e) = self.deps.state.save(&self.key, &self.state).await {
            error!(key = %self.key, error = %e, "Failed to persist actor state");
        }
    }
}

/// `logs/{domain}/{ISO-8601 ms}-{5 chars of [a-z0-9]}.log`
pub fn batch_key(domain: &str, now: Timestamp, rng: &mut dyn Rng) -> String {
    format!("logs/{}/{}-{}.log", domain, now.to_iso8601(), random_suffix(rng))
}

fn random_suffix(rng: &mut dyn Rng) -> String {
    (0..SUFFIX_LEN)
        .map(|_| {
            let idx = rng.gen_range(0, SUFFIX_ALPHABET.len() as u64) as usize;
            SUFFIX_ALPHABET[idx] as char
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::timer::ManualTimer;
    use crate::clock::SimulatedClock;
    use crate::io::SimulatedRng;
    use crate::storage::{
        InMemoryObjectStore, InMemoryStateStore, SimulatedObjectStore, SimulatedStoreConfig,
    };

    const START: u64 = 1_709_296_496_789;

    struct Fixture {
        bulk: InMemoryObjectStore,
        state: InMemoryStateStore,
        timer: ManualTimer,
        clock: SimulatedClock,
    }

    impl Fixture {
        fn new() -> Self {
            Fixture {
                bulk: InMemoryObjectStore::new(),
                state: InMemoryStateStore::new(),
                timer: ManualTimer::new(),
                clock: SimulatedClock::new(START),
            }
        }

        fn deps(&self) -> BufferDeps {
            BufferDeps {
                bulk: Arc::new(self.bulk.clone()),
                state: Arc::new(self.state.clone()),
                timer: Arc::new(self.timer.clone()),
            }
        }

        async fn actor(&self, policy: FlushPolicy) -> BufferActor<SimulatedClock> {
            BufferActor::load(
                "example.com",
                self.deps(),
                policy,
                self.clock.clone(),
                Box::new(SimulatedRng::new(42)),
            )
            .await
            .unwrap()
        }

        async fn objects(&self) -> Vec<(String, String)> {
            let mut out = Vec::new();
            for key in self.bulk.keys() {
                let data = self.bulk.get(&key).await.unwrap();
                out.push((key, String::from_utf8(data).unwrap()));
            }
            out
        }
    }

    fn minutes(n: u64) -> Duration {
        Duration::from_secs(n * 60)
    }

    #[tokio::test]
    async fn test_below_threshold_buffers_without_writing() {
        let fx = Fixture::new();
        let mut actor = fx.actor(FlushPolicy::new(3, minutes(5))).await;

        actor.append("example.com", "a".into()).await.unwrap();
        actor.append("example.com", "b".into()).await.unwrap();

        assert_eq!(actor.buffered().len(), 2);
        assert_eq!(actor.debug(), "a\nb");
        assert!(fx.bulk.is_empty());
    }

    #[tokio::test]
    async fn test_threshold_writes_one_ordered_batch() {
        let fx = Fixture::new();
        let mut actor = fx.actor(FlushPolicy::default()).await;

        for i in 0..99 {
            actor.append("example.com", format!("line-{}", i)).await.unwrap();
        }
        assert!(fx.bulk.is_empty());

        actor.append("example.com", "line-99".into()).await.unwrap();

        let objects = fx.objects().await;
        assert_eq!(objects.len(), 1);
        let (key, body) = &objects[0];
        assert!(key.starts_with("logs/example.com/2024-03-01T12:34:56.789Z-"));
        assert!(key.ends_with(".log"));
        let expected: Vec<String> = (0..100).map(|i| format!("line-{}", i)).collect();
        assert_eq!(body, &expected.join("\n"));
        assert!(actor.buffered().is_empty());
        assert_eq!(actor.state().last_flush_at, Some(START));
    }

    #[tokio::test]
    async fn test_stale_last_flush_triggers_on_append() {
        let fx = Fixture::new();
        let mut actor = fx.actor(FlushPolicy::new(2, minutes(5))).await;

        actor.append("example.com", "a".into()).await.unwrap();
        actor.append("example.com", "b".into()).await.unwrap();
        assert_eq!(fx.bulk.len(), 1);

        fx.clock.advance(minutes(5) + Duration::from_millis(1));
        actor.append("example.com", "c".into()).await.unwrap();

        assert_eq!(fx.bulk.len(), 2, "staleness flushes a single line");
        assert_eq!(
            actor.state().last_flush_at,
            Some(START + 5 * 60_000 + 1)
        );
    }

    #[tokio::test]
    async fn test_empty_flush_is_noop() {
        let fx = Fixture::new();
        let mut actor = fx.actor(FlushPolicy::default()).await;

        assert_eq!(actor.flush().await, FlushOutcome::Empty);
        assert!(fx.bulk.is_empty());
        assert_eq!(fx.timer.set_count(), 0, "no reschedule on empty flush");
        assert_eq!(actor.state().last_flush_at, None);
    }

    #[tokio::test]
    async fn test_first_append_arms_timer_once() {
        let fx = Fixture::new();
        let mut actor = fx.actor(FlushPolicy::new(100, minutes(5))).await;

        actor.append("example.com", "a".into()).await.unwrap();
        let due = Timestamp::from_millis(START + 300_000);
        assert_eq!(fx.timer.pending("example.com"), Some(due));
        assert_eq!(fx.state.snapshot("example.com").unwrap().next_scheduled_flush, Some(due.as_millis()));

        fx.clock.advance(minutes(1));
        actor.append("example.com", "b".into()).await.unwrap();
        assert_eq!(fx.timer.set_count(), 1, "schedule still in the future");

        fx.clock.set(due.as_millis() + 1);
        actor.append("example.com", "c".into()).await.unwrap();
        assert_eq!(fx.timer.set_count(), 2);
        assert_eq!(
            fx.timer.pending("example.com"),
            Some(Timestamp::from_millis(due.as_millis() + 1 + 300_000))
        );
        assert_eq!(fx.timer.pending_count(), 1);
    }

    #[tokio::test]
    async fn test_alarm_flushes_and_reschedules() {
        let fx = Fixture::new();
        let mut actor = fx.actor(FlushPolicy::new(100, minutes(5))).await;
        actor.append("example.com", "a".into()).await.unwrap();

        fx.clock.advance(minutes(5));
        let outcome = actor.alarm().await;

        assert!(outcome.is_written());
        assert_eq!(actor.state().last_flush_at, None, "timer flushes leave lastFlushAt alone");
        let next = Timestamp::from_millis(START + 600_000);
        assert_eq!(fx.timer.pending("example.com"), Some(next));
        assert_eq!(actor.state().next_scheduled_flush(), Some(next));
    }

    #[tokio::test]
    async fn test_domain_persisted_once() {
        let fx = Fixture::new();
        let mut actor = fx.actor(FlushPolicy::new(1, minutes(5))).await;

        actor.append("example.com", "a".into()).await.unwrap();
        actor.append("other.com", "b".into()).await.unwrap();

        assert_eq!(actor.state().domain.as_deref(), Some("example.com"));
        for (key, _) in fx.objects().await {
            assert!(key.starts_with("logs/example.com/"));
        }
    }

    #[tokio::test]
    async fn test_failed_write_loses_batch() {
        let fx = Fixture::new();
        let failing = SimulatedObjectStore::new(
            fx.bulk.clone(),
            SimulatedRng::new(1),
            SimulatedStoreConfig {
                put_fail_prob: 1.0,
                ..SimulatedStoreConfig::no_faults()
            },
        );
        let deps = BufferDeps {
            bulk: Arc::new(failing),
            ..fx.deps()
        };
        let mut actor = BufferActor::load(
            "example.com",
            deps,
            FlushPolicy::new(2, minutes(5)),
            fx.clock.clone(),
            Box::new(SimulatedRng::new(2)),
        )
        .await
        .unwrap();

        actor.append("example.com", "a".into()).await.unwrap();
        actor.append("example.com", "b".into()).await.unwrap();

        assert!(actor.buffered().is_empty(), "buffer cleared before the write");
        assert!(fx.bulk.is_empty());
        assert!(fx.timer.pending("example.com").is_some(), "timer still rescheduled");
    }

    #[tokio::test(start_paused = true)]
    async fn test_write_then_clear_keeps_lines_on_failure() {
        let fx = Fixture::new();
        let failing = SimulatedObjectStore::new(
            fx.bulk.clone(),
            SimulatedRng::new(1),
            SimulatedStoreConfig {
                put_fail_prob: 1.0,
                ..SimulatedStoreConfig::no_faults()
            },
        );
        let deps = BufferDeps {
            bulk: Arc::new(failing.clone()),
            ..fx.deps()
        };
        let policy = FlushPolicy::new(2, minutes(5)).with_ordering(FlushOrdering::WriteThenClear {
            max_retries: 2,
            backoff: Duration::from_millis(10),
        });
        let mut actor = BufferActor::load("example.com", deps, policy, fx.clock.clone(), Box::new(SimulatedRng::new(2)))
            .await
            .unwrap();

        actor.append("example.com", "a".into()).await.unwrap();
        actor.append("example.com", "b".into()).await.unwrap();

        assert_eq!(actor.buffered(), &["a".to_string(), "b".to_string()]);
        assert_eq!(failing.stats().put_attempts, 3);
    }

    #[tokio::test]
    async fn test_reload_resumes_state_not_lines() {
        let fx = Fixture::new();
        {
            let mut actor = fx.actor(FlushPolicy::new(100, minutes(5))).await;
            actor.append("example.com", "a".into()).await.unwrap();
        }

        let actor = fx.actor(FlushPolicy::new(100, minutes(5))).await;
        assert!(actor.buffered().is_empty());
        assert_eq!(actor.state().domain.as_deref(), Some("example.com"));
        assert_eq!(actor.state().next_scheduled_flush, Some(START + 300_000));
    }

    #[test]
    fn test_batch_key_shape() {
        let mut rng = SimulatedRng::new(9);
        let key = batch_key("a.com", Timestamp::from_millis(START), &mut rng);

        let suffix = key
            .strip_prefix("logs/a.com/2024-03-01T12:34:56.789Z-")
            .and_then(|rest| rest.strip_suffix(".log"))
            .unwrap();
        assert_eq!(suffix.len(), 5);
        assert!(suffix.bytes().all(|b| b.is_ascii_lowercase() || b.is_ascii_digit()));
    }
}
