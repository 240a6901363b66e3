//! Log hand-off
//!
//! Each proxied request produces one line, handed to the actor for its
//! domain key in a background task. The response never waits for it, but
//! shutdown does: every hand-off is tracked and [`LogDispatcher::drain`]
//! waits for the in-flight ones.

use crate::buffer::BufferRegistry;
use crate::clock::Clock;
use tokio_util::task::TaskTracker;
use tracing::error;

/// Actor key for a request hostname: a leading `www.` is dropped
pub fn log_key(hostname: &str) -> &str {
    hostname.strip_prefix("www.").unwrap_or(hostname)
}

#[derive(Clone)]
pub struct LogDispatcher<C: Clock> {
    registry: BufferRegistry<C>,
    tracker: TaskTracker,
}

impl<C: Clock> LogDispatcher<C> {
    pub fn new(registry: BufferRegistry<C>) -> Self {
        LogDispatcher {
            registry,
            tracker: TaskTracker::new(),
        }
    }

    pub fn registry(&self) -> &BufferRegistry<C> {
        &self.registry
    }

    /// Fire-and-forget delivery of `line` for `hostname`
    pub fn dispatch(&self, hostname: &str, line: String) {
        let key = log_key(hostname).to_string();
        let registry = self.registry.clone();
        self.tracker.spawn(async move {
            deliver(&registry, &key, line).await;
        });
    }

    /// Hand-offs not yet finished
    pub fn in_flight(&self) -> usize {
        self.tracker.len()
    }

    /// Stop accepting hand-offs and wait for the in-flight ones
    pub async fn drain(&self) {
        self.tracker.close();
        self.tracker.wait().await;
    }
}

/// Returns whether the actor acknowledged the line. Failures are logged
/// with the line so it can be recovered from the process log.
pub async fn deliver<C: Clock>(registry: &BufferRegistry<C>, key: &str, line: String) -> bool {
    match registry.append(key, key, line.clone()).await {
        Ok(resp) if resp.is_success() => true,
        Ok(resp) => {
            error!(key = %key, status = %resp.status, body = %resp.body, failed_line = %line.trim_end(), "Log hand-off rejected");
            false
        }
        Err(e) => {
            error!(key = %key, error = %e, failed_line = %line.trim_end(), "Log hand-off failed");
            false
        }
    }
}
