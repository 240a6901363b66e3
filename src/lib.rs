//! Edge access-logging proxy
//!
//! Requests are forwarded to an origin; each produces one access log line
//! that is buffered per domain and written to a bulk object store in
//! batches, by line count or on a durable timer.
//!
//! - [`proxy`]: HTTP front end, log line formatting, dispatch
//! - [`buffer`]: per-domain actors, flush policy, durable timer, DST harness
//! - [`storage`]: bulk object store and actor state store backends
//! - [`clock`], [`io`], [`buggify`]: deterministic time, randomness and faults

pub mod buffer;
pub mod buggify;
pub mod clock;
pub mod config;
pub mod io;
pub mod observability;
pub mod proxy;
pub mod storage;

pub use buffer::{BufferActor, BufferRegistry, FlushOrdering, FlushOutcome, FlushPolicy};
pub use clock::{Clock, SimulatedClock, SystemClock, Timestamp};
pub use config::{Config, ConfigError};
pub use proxy::{AccessLogLine, LogDispatcher, ProxyError};
pub use storage::{ObjectStore, StateStore};
