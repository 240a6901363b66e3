//! Durable Timer
//!
//! One pending alarm per actor key. Setting an alarm replaces the previous
//! one; a fired alarm is removed before its key is delivered, so each
//! schedule fires exactly once.
//!
//! ```text
//! BufferActor ──set_alarm──► AlarmScheduler ──persist──► StateStore
//!                                 │
//!                         sleep_until(earliest)
//!                                 │
//!                                 ▼
//!                        fired key ──► BufferRegistry ──► actor.alarm()
//! ```
//!
//! Alarms are persisted, so a restarted process re-arms them on startup and
//! past-due alarms fire at once.

use crate::clock::{Clock, Timestamp};
use crate::storage::StateStore;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::future::Future;
use std::io::{Error as IoError, ErrorKind, Result as IoResult};
use std::pin::Pin;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, info};

/// Per-key scheduled callback that survives actor eviction
pub trait DurableTimer: Send + Sync + 'static {
    /// Schedule (or reschedule) the alarm for `key`
    fn set_alarm<'a>(
        &'a self,
        key: &'a str,
        at: Timestamp,
    ) -> Pin<Box<dyn Future<Output = IoResult<()>> + Send + 'a>>;
}

// ============================================================================
// AlarmScheduler - production timer
// ============================================================================

enum TimerMessage {
    Set {
        key: String,
        at: Timestamp,
        ack_tx: oneshot::Sender<IoResult<()>>,
    },
    Pending {
        response_tx: oneshot::Sender<Vec<(String, Timestamp)>>,
    },
    Shutdown {
        response_tx: oneshot::Sender<()>,
    },
}

/// Actor that owns every pending alarm and sleeps until the earliest one
pub struct AlarmScheduler<C: Clock> {
    alarms: HashMap<String, Timestamp>,
    state: Arc<dyn StateStore>,
    clock: C,
    rx: mpsc::UnboundedReceiver<TimerMessage>,
    fired_tx: mpsc::UnboundedSender<String>,
}

impl<C: Clock> AlarmScheduler<C> {
    async fn run(mut self) {
        self.restore().await;

        loop {
            let next = self.earliest();
            let deadline = match next {
                Some(at) => tokio::time::Instant::now() + at.saturating_sub(self.clock.now()),
                None => tokio::time::Instant::now(),
            };

            tokio::select! {
                msg = self.rx.recv() => {
                    let Some(msg) = msg else { break };
                    if self.handle_message(msg).await {
                        break;
                    }
                }
                _ = tokio::time::sleep_until(deadline), if next.is_some() => {
                    if let Some(at) = next {
                        self.fire_through(at).await;
                    }
                }
            }
        }
    }

    /// Returns true on shutdown
    async fn handle_message(&mut self, msg: TimerMessage) -> bool {
        match msg {
            TimerMessage::Set { key, at, ack_tx } => {
                let result = self.state.save_alarm(&key, Some(at)).await;
                if result.is_ok() {
                    debug!(key = %key, at = %at, "Alarm set");
                    self.alarms.insert(key, at);
                }
                let _ = ack_tx.send(result);
                false
            }
            TimerMessage::Pending { response_tx } => {
                let mut pending: Vec<_> = self.alarms.iter().map(|(k, at)| (k.clone(), *at)).collect();
                pending.sort();
                let _ = response_tx.send(pending);
                false
            }
            TimerMessage::Shutdown { response_tx } => {
                info!(pending = self.alarms.len(), "Alarm scheduler shutting down");
                let _ = response_tx.send(());
                true
            }
        }
    }

    async fn restore(&mut self) {
        match self.state.list_alarms().await {
            Ok(alarms) => {
                let now = self.clock.now();
                let overdue = alarms.iter().filter(|(_, at)| *at <= now).count();
                info!(restored = alarms.len(), overdue, "Restored durable alarms");
                self.alarms.extend(alarms);
            }
            Err(e) => error!(error = %e, "Failed to restore durable alarms"),
        }
    }

    fn earliest(&self) -> Option<Timestamp> {
        self.alarms.values().min().copied()
    }

    /// Fire every alarm due at or before `at`, in time order
    async fn fire_through(&mut self, at: Timestamp) {
        let mut due: Vec<(Timestamp, String)> = self
            .alarms
            .iter()
            .filter(|(_, t)| **t <= at)
            .map(|(k, t)| (*t, k.clone()))
            .collect();
        due.sort();

        for (_, key) in due {
            self.alarms.remove(&key);
            if let Err(e) = self.state.save_alarm(&key, None).await {
                error!(key = %key, error = %e, "Failed to clear fired alarm");
            }
            if self.fired_tx.send(key).is_err() {
                debug!("Alarm receiver dropped");
            }
        }
    }
}

/// Handle to the [`AlarmScheduler`]; this is the production [`DurableTimer`]
#[derive(Clone)]
pub struct AlarmSchedulerHandle {
    tx: mpsc::UnboundedSender<TimerMessage>,
}

impl AlarmSchedulerHandle {
    /// Snapshot of pending alarms, sorted by key
    pub async fn pending(&self) -> Vec<(String, Timestamp)> {
        let (response_tx, response_rx) = oneshot::channel();
        if self.tx.send(TimerMessage::Pending { response_tx }).is_err() {
            return Vec::new();
        }
        response_rx.await.unwrap_or_default()
    }

    pub async fn shutdown(&self) {
        let (response_tx, response_rx) = oneshot::channel();
        if self.tx.send(TimerMessage::Shutdown { response_tx }).is_ok() {
            let _ = response_rx.await;
        }
    }
}

impl DurableTimer for AlarmSchedulerHandle {
    fn set_alarm<'a>(
        &'a self,
        key: &'a str,
        at: Timestamp,
    ) -> Pin<Box<dyn Future<Output = IoResult<()>> + Send + 'a>> {
        Box::pin(async move {
            let (ack_tx, ack_rx) = oneshot::channel();
            let msg = TimerMessage::Set {
                key: key.to_string(),
                at,
                ack_tx,
            };
            if self.tx.send(msg).is_err() {
                return Err(IoError::new(ErrorKind::BrokenPipe, "alarm scheduler unavailable"));
            }
            ack_rx.await.unwrap_or_else(|_| {
                Err(IoError::new(ErrorKind::BrokenPipe, "alarm scheduler dropped ack channel"))
            })
        })
    }
}

/// Spawn the scheduler. Persisted alarms are restored before any message is
/// processed; fired keys arrive on the returned receiver.
pub fn spawn_alarm_scheduler<C: Clock>(
    state: Arc<dyn StateStore>,
    clock: C,
) -> (
    AlarmSchedulerHandle,
    mpsc::UnboundedReceiver<String>,
    tokio::task::JoinHandle<()>,
) {
    let (tx, rx) = mpsc::unbounded_channel();
    let (fired_tx, fired_rx) = mpsc::unbounded_channel();

    let scheduler = AlarmScheduler {
        alarms: HashMap::new(),
        state,
        clock,
        rx,
        fired_tx,
    };
    let task = tokio::spawn(scheduler.run());

    (AlarmSchedulerHandle { tx }, fired_rx, task)
}

// ============================================================================
// ManualTimer - for tests and DST
// ============================================================================

#[derive(Debug, Default)]
struct ManualTimerInner {
    alarms: HashMap<String, Timestamp>,
    sets: u64,
}

/// Timer that only records alarms; the caller decides when they fire
#[derive(Debug, Clone, Default)]
pub struct ManualTimer {
    inner: Arc<Mutex<ManualTimerInner>>,
}

impl ManualTimer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn pending(&self, key: &str) -> Option<Timestamp> {
        self.inner.lock().alarms.get(key).copied()
    }

    pub fn pending_count(&self) -> usize {
        self.inner.lock().alarms.len()
    }

    /// Total `set_alarm` calls
    pub fn set_count(&self) -> u64 {
        self.inner.lock().sets
    }

    /// Remove and return every key due at `now`, sorted
    pub fn take_due(&self, now: Timestamp) -> Vec<String> {
        let mut inner = self.inner.lock();
        let mut due: Vec<String> = inner
            .alarms
            .iter()
            .filter(|(_, at)| **at <= now)
            .map(|(k, _)| k.clone())
            .collect();
        due.sort();
        for key in &due {
            inner.alarms.remove(key);
        }
        due
    }
}

impl DurableTimer for ManualTimer {
    fn set_alarm<'a>(
        &'a self,
        key: &'a str,
        at: Timestamp,
    ) -> Pin<Box<dyn Future<Output = IoResult<()>> + Send + 'a>> {
        Box::pin(async move {
            let mut inner = self.inner.lock();
            inner.sets += 1;
            inner.alarms.insert(key.to_string(), at);
            Ok(())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::SimulatedClock;
    use crate::storage::InMemoryStateStore;
    use std::time::Duration;

    const START: u64 = 1_700_000_000_000;

    #[tokio::test(start_paused = true)]
    async fn test_alarm_fires_after_delay() {
        let clock = SimulatedClock::new(START);
        let state = InMemoryStateStore::new();
        let (timer, mut fired, _task) = spawn_alarm_scheduler(Arc::new(state.clone()), clock.clone());

        let started = tokio::time::Instant::now();
        timer
            .set_alarm("a.com", clock.now() + Duration::from_secs(300))
            .await
            .unwrap();
        assert_eq!(state.alarm("a.com"), Some(Timestamp::from_millis(START + 300_000)));

        assert_eq!(fired.recv().await.as_deref(), Some("a.com"));
        assert!(started.elapsed() >= Duration::from_secs(300));
        assert_eq!(state.alarm("a.com"), None, "fired alarm is cleared");
        assert!(timer.pending().await.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_reschedule_replaces_pending_alarm() {
        let clock = SimulatedClock::new(START);
        let (timer, mut fired, _task) =
            spawn_alarm_scheduler(Arc::new(InMemoryStateStore::new()), clock.clone());

        timer.set_alarm("a.com", Timestamp::from_millis(START + 1_000)).await.unwrap();
        timer.set_alarm("a.com", Timestamp::from_millis(START + 5_000)).await.unwrap();
        assert_eq!(timer.pending().await.len(), 1);

        let started = tokio::time::Instant::now();
        assert_eq!(fired.recv().await.as_deref(), Some("a.com"));
        assert!(started.elapsed() >= Duration::from_secs(5));

        // Exactly once per schedule
        tokio::time::sleep(Duration::from_secs(60)).await;
        assert!(fired.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_alarms_fire_in_time_order() {
        let clock = SimulatedClock::new(START);
        let (timer, mut fired, _task) =
            spawn_alarm_scheduler(Arc::new(InMemoryStateStore::new()), clock.clone());

        timer.set_alarm("late.com", Timestamp::from_millis(START + 2_000)).await.unwrap();
        timer.set_alarm("early.com", Timestamp::from_millis(START + 1_000)).await.unwrap();

        assert_eq!(fired.recv().await.as_deref(), Some("early.com"));
        assert_eq!(fired.recv().await.as_deref(), Some("late.com"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_restore_fires_overdue_alarms() {
        let clock = SimulatedClock::new(START);
        let state = InMemoryStateStore::new();
        state
            .save_alarm("overdue.com", Some(Timestamp::from_millis(START - 10)))
            .await
            .unwrap();
        state
            .save_alarm("future.com", Some(Timestamp::from_millis(START + 60_000)))
            .await
            .unwrap();

        let (timer, mut fired, _task) = spawn_alarm_scheduler(Arc::new(state.clone()), clock);

        let started = tokio::time::Instant::now();
        assert_eq!(fired.recv().await.as_deref(), Some("overdue.com"));
        assert!(started.elapsed() < Duration::from_millis(1));
        assert_eq!(
            timer.pending().await,
            vec![("future.com".to_string(), Timestamp::from_millis(START + 60_000))]
        );
    }

    #[tokio::test]
    async fn test_manual_timer_take_due() {
        let timer = ManualTimer::new();
        timer.set_alarm("b.com", Timestamp::from_millis(20)).await.unwrap();
        timer.set_alarm("a.com", Timestamp::from_millis(10)).await.unwrap();
        timer.set_alarm("a.com", Timestamp::from_millis(15)).await.unwrap();

        assert_eq!(timer.pending_count(), 2);
        assert_eq!(timer.set_count(), 3);
        assert!(timer.take_due(Timestamp::from_millis(14)).is_empty());
        assert_eq!(timer.take_due(Timestamp::from_millis(20)), vec!["a.com", "b.com"]);
        assert_eq!(timer.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_set_alarm_after_shutdown_fails() {
        let (timer, _fired, task) =
            spawn_alarm_scheduler(Arc::new(InMemoryStateStore::new()), SimulatedClock::new(START));
        timer.shutdown().await;
        task.await.unwrap();

        let err = timer.set_alarm("a.com", Timestamp::from_millis(START)).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::BrokenPipe);
    }
}
