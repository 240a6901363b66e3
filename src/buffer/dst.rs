//! Deterministic Simulation Testing for the Buffer Engine
//!
//! Drives actors directly (no tasks) with a simulated clock, a manual
//! timer and fault-injecting stores, tracking a shadow ledger of every
//! accepted line:
//!
//! ```text
//! for seed in 0..N {
//!     let mut harness = BufferDSTHarness::new(BufferDSTConfig::chaos(seed)).await;
//!     harness.run(500).await;
//!     harness.check_invariants().await;
//! }
//! ```
//!
//! Invariants:
//! - every accepted line is written, lost with a failed batch, dropped by
//!   eviction, or still buffered, and exactly one of those
//! - no line appears in two objects; lines within an object keep append order
//! - under clear-then-write the buffer never reaches the threshold after an append
//! - a pending alarm always matches the actor's `nextScheduledFlush`
//! - with faults suppressed, every flush writes

use crate::buffer::actor::{BufferActor, BufferDeps, FlushOutcome};
use crate::buffer::error::BufferError;
use crate::buffer::policy::{FlushOrdering, FlushPolicy};
use crate::buffer::timer::ManualTimer;
use crate::buggify::BuggifySuppressor;
use crate::clock::{Clock, SimulatedClock};
use crate::io::{Rng, RngSource, SimulatedRng};
use crate::storage::{
    InMemoryObjectStore, InMemoryStateStore, ObjectStore, SimulatedObjectStore,
    SimulatedStateStore, SimulatedStoreConfig, SimulatedStoreStats, CONTENT_TYPE_TEXT_PLAIN,
};
use std::collections::hash_map::Entry;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

const DST_START_MS: u64 = 1_700_000_000_000;

#[derive(Debug, Clone)]
pub struct BufferDSTConfig {
    pub seed: u64,
    pub store_config: SimulatedStoreConfig,
    pub state_save_fail_prob: f64,
    pub policy: FlushPolicy,
    /// Number of distinct domains in the workload
    pub domains: usize,
    pub advance_probability: f64,
    pub flush_probability: f64,
    pub evict_probability: f64,
    /// Upper bound for a single clock advance
    pub max_advance_ms: u64,
}

impl Default for BufferDSTConfig {
    fn default() -> Self {
        BufferDSTConfig {
            seed: 0,
            store_config: SimulatedStoreConfig::default(),
            state_save_fail_prob: 0.0,
            policy: FlushPolicy::new(8, Duration::from_secs(60)),
            domains: 4,
            advance_probability: 0.15,
            flush_probability: 0.05,
            evict_probability: 0.02,
            max_advance_ms: 30_000,
        }
    }
}

impl BufferDSTConfig {
    pub fn new(seed: u64) -> Self {
        BufferDSTConfig {
            seed,
            ..Default::default()
        }
    }

    /// No faults, no evictions
    pub fn calm(seed: u64) -> Self {
        BufferDSTConfig {
            seed,
            store_config: SimulatedStoreConfig::no_faults(),
            evict_probability: 0.0,
            ..Default::default()
        }
    }

    pub fn moderate(seed: u64) -> Self {
        BufferDSTConfig {
            seed,
            ..Default::default()
        }
    }

    pub fn chaos(seed: u64) -> Self {
        BufferDSTConfig {
            seed,
            store_config: SimulatedStoreConfig::high_chaos(),
            state_save_fail_prob: 0.02,
            evict_probability: 0.05,
            ..Default::default()
        }
    }

    /// Chaos with the retrying write-then-clear ordering
    pub fn chaos_write_then_clear(seed: u64) -> Self {
        let mut config = Self::chaos(seed);
        config.policy = config.policy.with_ordering(FlushOrdering::WriteThenClear {
            max_retries: 2,
            backoff: Duration::from_millis(5),
        });
        config
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BufferOperation {
    Append { domain: String },
    AdvanceTime { ms: u64 },
    ManualFlush { domain: String },
    Evict { domain: String },
}

pub struct BufferWorkload {
    rng: SimulatedRng,
    config: BufferDSTConfig,
}

impl BufferWorkload {
    pub fn new(config: BufferDSTConfig) -> Self {
        BufferWorkload {
            rng: SimulatedRng::new(config.seed),
            config,
        }
    }

    fn pick_domain(&mut self) -> String {
        format!("d{}.example.com", self.rng.gen_range(0, self.config.domains.max(1) as u64))
    }

    pub fn next_operation(&mut self) -> BufferOperation {
        let roll = self.rng.next_u64() as f64 / u64::MAX as f64;
        let c = &self.config;
        let advance = c.advance_probability;
        let flush = advance + c.flush_probability;
        let evict = flush + c.evict_probability;
        let max_advance_ms = c.max_advance_ms.max(1);

        if roll < advance {
            BufferOperation::AdvanceTime {
                ms: self.rng.gen_range(1, max_advance_ms + 1),
            }
        } else if roll < flush {
            BufferOperation::ManualFlush {
                domain: self.pick_domain(),
            }
        } else if roll < evict {
            BufferOperation::Evict {
                domain: self.pick_domain(),
            }
        } else {
            BufferOperation::Append {
                domain: self.pick_domain(),
            }
        }
    }
}

#[derive(Debug, Clone)]
pub struct BufferDSTResult {
    pub seed: u64,
    pub total_operations: u64,
    pub appends_accepted: u64,
    pub appends_rejected: u64,
    pub batches_written: u64,
    pub batches_lost: u64,
    pub batches_retained: u64,
    pub alarms_fired: u64,
    pub evictions: u64,
    pub store_stats: SimulatedStoreStats,
    pub invariant_violations: Vec<String>,
}

impl BufferDSTResult {
    pub fn new(seed: u64) -> Self {
        BufferDSTResult {
            seed,
            total_operations: 0,
            appends_accepted: 0,
            appends_rejected: 0,
            batches_written: 0,
            batches_lost: 0,
            batches_retained: 0,
            alarms_fired: 0,
            evictions: 0,
            store_stats: SimulatedStoreStats::default(),
            invariant_violations: Vec::new(),
        }
    }

    pub fn is_success(&self) -> bool {
        self.invariant_violations.is_empty()
    }

    pub fn summary(&self) -> String {
        format!(
            "Seed {}: {} ops ({} appends, {} rejected), {} written, {} lost, {} retained, {} alarms, {} evictions, {} violations",
            self.seed,
            self.total_operations,
            self.appends_accepted,
            self.appends_rejected,
            self.batches_written,
            self.batches_lost,
            self.batches_retained,
            self.alarms_fired,
            self.evictions,
            self.invariant_violations.len()
        )
    }
}

/// Shadow ledger for one domain
#[derive(Debug, Default)]
struct DomainLedger {
    next_seq: u64,
    accepted: Vec<String>,
    written: usize,
    lost: usize,
    evicted: usize,
}

type DSTBulk = SimulatedObjectStore<InMemoryObjectStore, SimulatedRng>;
type DSTState = SimulatedStateStore<InMemoryStateStore, SimulatedRng>;

pub struct BufferDSTHarness {
    config: BufferDSTConfig,
    clock: SimulatedClock,
    timer: ManualTimer,
    bulk: DSTBulk,
    inner_bulk: InMemoryObjectStore,
    deps: BufferDeps,
    rng_source: RngSource,
    actors: HashMap<String, BufferActor<SimulatedClock>>,
    ledgers: BTreeMap<String, DomainLedger>,
    workload: BufferWorkload,
    result: BufferDSTResult,
}

impl BufferDSTHarness {
    pub async fn new(config: BufferDSTConfig) -> Self {
        let clock = SimulatedClock::new(DST_START_MS);
        let timer = ManualTimer::new();
        let inner_bulk = InMemoryObjectStore::new();
        let bulk = SimulatedObjectStore::new(
            inner_bulk.clone(),
            SimulatedRng::new(config.seed.wrapping_add(1)),
            config.store_config.clone(),
        );
        let state: DSTState = SimulatedStateStore::new(
            InMemoryStateStore::new(),
            SimulatedRng::new(config.seed.wrapping_add(2)),
            config.state_save_fail_prob,
        );

        let deps = BufferDeps {
            bulk: Arc::new(bulk.clone()),
            state: Arc::new(state),
            timer: Arc::new(timer.clone()),
        };

        BufferDSTHarness {
            rng_source: RngSource::Seeded(config.seed.wrapping_add(3)),
            workload: BufferWorkload::new(config.clone()),
            result: BufferDSTResult::new(config.seed),
            config,
            clock,
            timer,
            bulk,
            inner_bulk,
            deps,
            actors: HashMap::new(),
            ledgers: BTreeMap::new(),
        }
    }

    pub async fn run(&mut self, operations: usize) {
        for _ in 0..operations {
            let op = self.workload.next_operation();
            self.execute(op).await;
            self.check_timer_agreement();
        }
    }

    async fn execute(&mut self, op: BufferOperation) {
        self.result.total_operations += 1;
        match op {
            BufferOperation::Append { domain } => self.execute_append(&domain).await,
            BufferOperation::AdvanceTime { ms } => self.execute_advance(ms).await,
            BufferOperation::ManualFlush { domain } => {
                let outcome = match self.materialize(&domain).await {
                    Ok(actor) => actor.flush().await,
                    Err(_) => return,
                };
                self.record_flush(&domain, &outcome);
            }
            BufferOperation::Evict { domain } => {
                if let Some(actor) = self.actors.remove(&domain) {
                    self.ledger(&domain).evicted += actor.buffered().len();
                    self.result.evictions += 1;
                }
            }
        }
    }

    async fn materialize(&mut self, key: &str) -> Result<&mut BufferActor<SimulatedClock>, BufferError> {
        match self.actors.entry(key.to_string()) {
            Entry::Occupied(entry) => Ok(entry.into_mut()),
            Entry::Vacant(entry) => {
                let actor = BufferActor::load(
                    key,
                    self.deps.clone(),
                    self.config.policy.clone(),
                    self.clock.clone(),
                    self.rng_source.for_key(key),
                )
                .await?;
                Ok(entry.insert(actor))
            }
        }
    }

    fn ledger(&mut self, domain: &str) -> &mut DomainLedger {
        self.ledgers.entry(domain.to_string()).or_default()
    }

    async fn execute_append(&mut self, domain: &str) {
        let ledger = self.ledger(domain);
        let line = format!("{}#{:08}", domain, ledger.next_seq);
        ledger.next_seq += 1;

        let threshold = self.config.policy.threshold;
        let clear_first = self.config.policy.ordering == FlushOrdering::ClearThenWrite;

        let appended = match self.materialize(domain).await {
            Ok(actor) => actor
                .append(domain, line.clone())
                .await
                .map(|outcome| (outcome, actor.buffered().len())),
            Err(e) => Err(e),
        };

        match appended {
            Ok((outcome, buffered)) => {
                self.result.appends_accepted += 1;
                self.ledger(domain).accepted.push(line);
                if let Some(outcome) = outcome {
                    self.record_flush(domain, &outcome);
                }
                if clear_first && buffered >= threshold {
                    self.result.invariant_violations.push(format!(
                        "{}: buffer holds {} lines after append (threshold {})",
                        domain, buffered, threshold
                    ));
                }
            }
            Err(_) => self.result.appends_rejected += 1,
        }
    }

    async fn execute_advance(&mut self, ms: u64) {
        self.clock.advance_ms(ms);
        for key in self.timer.take_due(self.clock.now()) {
            self.result.alarms_fired += 1;
            let outcome = match self.materialize(&key).await {
                Ok(actor) => actor.alarm().await,
                Err(_) => continue,
            };
            self.record_flush(&key, &outcome);
        }
    }

    fn record_flush(&mut self, domain: &str, outcome: &FlushOutcome) {
        match outcome {
            FlushOutcome::Empty => {}
            FlushOutcome::Written { lines, .. } => {
                self.result.batches_written += 1;
                self.ledger(domain).written += lines;
            }
            FlushOutcome::Lost { lines, .. } => {
                self.result.batches_lost += 1;
                self.ledger(domain).lost += lines;
            }
            FlushOutcome::Retained { .. } => self.result.batches_retained += 1,
        }
    }

    /// A pending alarm must match what the live actor believes is scheduled
    fn check_timer_agreement(&mut self) {
        if self.config.state_save_fail_prob > 0.0 {
            // A failed save can leave a reloaded actor with a stale schedule
            return;
        }
        for (key, actor) in &self.actors {
            if let Some(at) = self.timer.pending(key) {
                if actor.state().next_scheduled_flush() != Some(at) {
                    self.result.invariant_violations.push(format!(
                        "{}: pending alarm {} but nextScheduledFlush {:?}",
                        key,
                        at,
                        actor.state().next_scheduled_flush
                    ));
                }
            }
        }
    }

    pub async fn check_invariants(&mut self) {
        self.drain_with_faults_suppressed().await;
        self.check_objects().await;
        self.check_conservation();
        self.result.store_stats = self.bulk.stats();
    }

    async fn drain_with_faults_suppressed(&mut self) {
        let _suppress = BuggifySuppressor::new();
        let mut keys: Vec<String> = self.actors.keys().cloned().collect();
        keys.sort();

        for key in keys {
            let Some(actor) = self.actors.get_mut(&key) else {
                continue;
            };
            let outcome = actor.flush().await;
            if !matches!(outcome, FlushOutcome::Empty | FlushOutcome::Written { .. }) {
                self.result
                    .invariant_violations
                    .push(format!("{}: drain flush did not write: {:?}", key, outcome));
            }
            self.record_flush(&key, &outcome);
        }
    }

    async fn check_objects(&mut self) {
        let accepted: HashSet<&str> = self
            .ledgers
            .values()
            .flat_map(|l| l.accepted.iter().map(String::as_str))
            .collect();
        let mut seen: HashSet<String> = HashSet::new();
        let mut per_domain: HashMap<String, usize> = HashMap::new();
        let mut violations = Vec::new();

        for key in self.inner_bulk.keys() {
            let Some(domain) = key
                .strip_prefix("logs/")
                .and_then(|rest| rest.split_once('/'))
                .map(|(d, _)| d.to_string())
            else {
                violations.push(format!("{}: unexpected object key", key));
                continue;
            };

            match self.inner_bulk.head(&key).await {
                Ok(meta) if meta.content_type.as_deref() == Some(CONTENT_TYPE_TEXT_PLAIN) => {}
                other => violations.push(format!("{}: bad metadata {:?}", key, other)),
            }

            let body = match self.inner_bulk.get(&key).await {
                Ok(bytes) => String::from_utf8_lossy(&bytes).into_owned(),
                Err(e) => {
                    violations.push(format!("{}: unreadable: {}", key, e));
                    continue;
                }
            };

            let mut last_seq: Option<u64> = None;
            for line in body.split('\n') {
                let Some((line_domain, seq)) = line.rsplit_once('#') else {
                    violations.push(format!("{}: malformed line {:?}", key, line));
                    continue;
                };
                if line_domain != domain {
                    violations.push(format!("{}: line {:?} from another domain", key, line));
                }
                if !accepted.contains(line) {
                    violations.push(format!("{}: line {:?} was never accepted", key, line));
                }
                if !seen.insert(line.to_string()) {
                    violations.push(format!("{}: line {:?} written twice", key, line));
                }
                let seq: u64 = seq.parse().unwrap_or(0);
                if last_seq.is_some_and(|last| seq <= last) {
                    violations.push(format!("{}: line {:?} out of order", key, line));
                }
                last_seq = Some(seq);
                *per_domain.entry(domain.clone()).or_default() += 1;
            }
        }

        for (domain, ledger) in &self.ledgers {
            let stored = per_domain.get(domain).copied().unwrap_or(0);
            if stored != ledger.written {
                violations.push(format!(
                    "{}: {} lines in store but {} reported written",
                    domain, stored, ledger.written
                ));
            }
        }

        self.result.invariant_violations.extend(violations);
    }

    fn check_conservation(&mut self) {
        let mut violations = Vec::new();
        for (domain, ledger) in &self.ledgers {
            let buffered = self.actors.get(domain).map_or(0, |a| a.buffered().len());
            let accounted = ledger.written + ledger.lost + ledger.evicted + buffered;
            if accounted != ledger.accepted.len() {
                violations.push(format!(
                    "{}: {} accepted but {} accounted (written {}, lost {}, evicted {}, buffered {})",
                    domain,
                    ledger.accepted.len(),
                    accounted,
                    ledger.written,
                    ledger.lost,
                    ledger.evicted,
                    buffered
                ));
            }
        }
        self.result.invariant_violations.extend(violations);
    }

    pub fn result(&self) -> &BufferDSTResult {
        &self.result
    }

    pub fn into_result(self) -> BufferDSTResult {
        self.result
    }
}

pub async fn run_dst_batch(
    base_seed: u64,
    count: usize,
    ops_per_run: usize,
    config_fn: impl Fn(u64) -> BufferDSTConfig,
) -> Vec<BufferDSTResult> {
    let mut results = Vec::with_capacity(count);

    for i in 0..count {
        let seed = base_seed + i as u64;
        let mut harness = BufferDSTHarness::new(config_fn(seed)).await;
        harness.run(ops_per_run).await;
        harness.check_invariants().await;
        results.push(harness.into_result());
    }

    results
}

pub fn summarize_batch(results: &[BufferDSTResult]) -> String {
    let total = results.len();
    let passed = results.iter().filter(|r| r.is_success()).count();
    let failed_seeds: Vec<u64> = results
        .iter()
        .filter(|r| !r.is_success())
        .map(|r| r.seed)
        .collect();

    let total_ops: u64 = results.iter().map(|r| r.total_operations).sum();
    let written: u64 = results.iter().map(|r| r.batches_written).sum();
    let lost: u64 = results.iter().map(|r| r.batches_lost).sum();

    let mut summary = format!(
        "Batch: {}/{} passed, {} total ops, {} batches written, {} lost",
        passed, total, total_ops, written, lost
    );
    if !failed_seeds.is_empty() {
        summary.push_str(&format!("\nFailed seeds: {:?}", failed_seeds));
    }
    summary
}
