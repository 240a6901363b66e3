//! Flush Policy
//!
//! The dual trigger: a batch is written when it reaches `threshold` lines,
//! or on the first append after `interval` has passed since the previous
//! trigger-driven flush. The durable timer covers domains that go quiet.

use crate::clock::Timestamp;
use serde::{Deserialize, Serialize};
use std::time::Duration;

pub const DEFAULT_THRESHOLD: usize = 100;
pub const DEFAULT_INTERVAL: Duration = Duration::from_secs(5 * 60);

/// What happens to buffered lines relative to the bulk-store write
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum FlushOrdering {
    /// Clear the buffer, then write. A failed write loses the batch.
    #[default]
    ClearThenWrite,
    /// Write with retries, clear only once the write lands. Lines stay
    /// buffered when every attempt fails.
    WriteThenClear {
        max_retries: u32,
        #[serde(rename = "backoff_ms", with = "crate::config::duration_millis")]
        backoff: Duration,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FlushPolicy {
    pub threshold: usize,
    pub interval: Duration,
    pub ordering: FlushOrdering,
}

impl Default for FlushPolicy {
    fn default() -> Self {
        FlushPolicy {
            threshold: DEFAULT_THRESHOLD,
            interval: DEFAULT_INTERVAL,
            ordering: FlushOrdering::ClearThenWrite,
        }
    }
}

impl FlushPolicy {
    pub fn new(threshold: usize, interval: Duration) -> Self {
        FlushPolicy {
            threshold,
            interval,
            ..Default::default()
        }
    }

    pub fn with_ordering(mut self, ordering: FlushOrdering) -> Self {
        self.ordering = ordering;
        self
    }

    /// Size OR staleness
    pub fn should_flush(&self, buffered: usize, last_flush_at: Option<Timestamp>, now: Timestamp) -> bool {
        if buffered >= self.threshold {
            return true;
        }
        match last_flush_at {
            Some(last) => now.saturating_sub(last) > self.interval,
            None => false,
        }
    }

    /// The timer needs arming when nothing is scheduled or the schedule has passed
    pub fn needs_schedule(next_scheduled_flush: Option<Timestamp>, now: Timestamp) -> bool {
        match next_scheduled_flush {
            Some(next) => now > next,
            None => true,
        }
    }

    pub fn next_deadline(&self, now: Timestamp) -> Timestamp {
        now + self.interval
    }
}
