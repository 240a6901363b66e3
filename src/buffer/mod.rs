//! Per-domain log buffering
//!
//! Each log key owns a [`BufferActor`] that accumulates lines and writes
//! them to the bulk store as one batch when the line threshold is reached,
//! the last flush is stale, or the durable timer fires.
//!
//! ## Module Structure
//!
//! - `actor`: buffer, persisted state, flush orderings
//! - `policy`: threshold / interval triggers
//! - `timer`: durable alarm scheduler and the manual timer used in tests
//! - `rpc`: HTTP-shaped request surface of one actor
//! - `registry`: key → running actor, lazy materialization and eviction
//! - `dst`: deterministic simulation harness

pub mod actor;
pub mod dst;
pub mod error;
pub mod policy;
pub mod registry;
pub mod rpc;
pub mod timer;

pub use actor::{batch_key, BufferActor, BufferDeps, FlushOutcome, DEFAULT_DOMAIN};
pub use dst::{
    run_dst_batch, summarize_batch, BufferDSTConfig, BufferDSTHarness, BufferDSTResult,
    BufferOperation, BufferWorkload,
};
pub use error::BufferError;
pub use policy::{FlushOrdering, FlushPolicy, DEFAULT_INTERVAL, DEFAULT_THRESHOLD};
pub use registry::{ActorHandle, BufferRegistry};
pub use rpc::{RpcRequest, RpcResponse, FLUSHED_MANUALLY, LOG_BUFFERED, USAGE_HINT};
pub use timer::{spawn_alarm_scheduler, AlarmSchedulerHandle, DurableTimer, ManualTimer};
