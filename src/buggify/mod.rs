//! BUGGIFY - Deterministic Fault Injection
//!
//! Every storage decision point in simulation can become a fault site. Given
//! the same RNG seed, faults fire at exactly the same places, so a failing
//! DST seed replays bit-for-bit.
//!
//! ```ignore
//! if buggify!(&mut rng, faults::bulk_store::PUT_FAIL, config.put_fail_prob) {
//!     return Err(IoError::new(ErrorKind::Other, "simulated put failure"));
//! }
//! ```

use std::cell::RefCell;
use std::collections::HashMap;

/// Named fault sites
pub mod faults {
    pub mod bulk_store {
        pub const PUT_FAIL: &str = "bulk_store.put_fail";
        pub const TIMEOUT: &str = "bulk_store.timeout";
    }

    pub mod state_store {
        pub const SAVE_FAIL: &str = "state_store.save_fail";
    }
}

/// Statistics tracking for fault injection
#[derive(Debug, Clone, Default)]
pub struct BuggifyStats {
    pub checks: HashMap<String, u64>,
    pub triggers: HashMap<String, u64>,
}

impl BuggifyStats {
    pub fn record_check(&mut self, fault_id: &str) {
        *self.checks.entry(fault_id.to_string()).or_insert(0) += 1;
    }

    pub fn record_trigger(&mut self, fault_id: &str) {
        *self.triggers.entry(fault_id.to_string()).or_insert(0) += 1;
    }

    pub fn trigger_rate(&self, fault_id: &str) -> f64 {
        let checks = self.checks.get(fault_id).copied().unwrap_or(0);
        let triggers = self.triggers.get(fault_id).copied().unwrap_or(0);
        if checks == 0 {
            0.0
        } else {
            triggers as f64 / checks as f64
        }
    }
}

thread_local! {
    static BUGGIFY_CONTEXT: RefCell<BuggifyContext> = RefCell::new(BuggifyContext::default());
}

#[derive(Debug, Default)]
struct BuggifyContext {
    stats: BuggifyStats,
    /// When true, all buggify calls return false
    suppressed: bool,
}

/// Get current buggify stats for the thread
pub fn get_stats() -> BuggifyStats {
    BUGGIFY_CONTEXT.with(|ctx| ctx.borrow().stats.clone())
}

/// Reset stats for the current thread
pub fn reset_stats() {
    BUGGIFY_CONTEXT.with(|ctx| {
        ctx.borrow_mut().stats = BuggifyStats::default();
    });
}

/// Suppress buggify until dropped
pub struct BuggifySuppressor;

impl BuggifySuppressor {
    pub fn new() -> Self {
        BUGGIFY_CONTEXT.with(|ctx| {
            ctx.borrow_mut().suppressed = true;
        });
        BuggifySuppressor
    }
}

impl Default for BuggifySuppressor {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for BuggifySuppressor {
    fn drop(&mut self) {
        BUGGIFY_CONTEXT.with(|ctx| {
            ctx.borrow_mut().suppressed = false;
        });
    }
}

/// Core check - called by the `buggify!` macro
#[inline]
pub fn should_buggify_with_prob<R: crate::io::Rng + ?Sized>(
    rng: &mut R,
    fault_id: &str,
    probability: f64,
) -> bool {
    BUGGIFY_CONTEXT.with(|ctx| {
        let mut ctx = ctx.borrow_mut();

        ctx.stats.record_check(fault_id);

        if ctx.suppressed || probability <= 0.0 {
            return false;
        }

        let random_value = rng.gen_range(0, 1_000_000) as f64 / 1_000_000.0;
        let triggered = random_value < probability.clamp(0.0, 1.0);

        if triggered {
            ctx.stats.record_trigger(fault_id);
        }

        triggered
    })
}

/// BUGGIFY macro - the main interface for fault injection
#[macro_export]
macro_rules! buggify {
    ($rng:expr, $fault_id:expr, $prob:expr) => {
        $crate::buggify::should_buggify_with_prob($rng, $fault_id, $prob)
    };
}
