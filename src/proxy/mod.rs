//! Edge proxy
//!
//! Forwards requests to the origin and hands one access log line per
//! request to the buffer for its domain.
//!
//! ```text
//! client ──► server ──► origin ──► response
//!              │
//!              └── AccessLogLine ──► dispatcher ──► BufferRegistry
//! ```

pub mod bot;
pub mod cache;
pub mod dispatcher;
pub mod error;
pub mod log_line;
pub mod origin;
pub mod server;

pub use bot::{is_bot, KNOWN_BOTS};
pub use cache::{cache_everything, is_static_asset, CachePolicy, CACHE_HEADER};
pub use dispatcher::{log_key, LogDispatcher};
pub use error::ProxyError;
pub use log_line::{clf_timestamp, sanitize, AccessLogLine};
pub use origin::{OriginClient, OriginRequest, OriginResponse};
pub use server::{router, serve, shutdown_signal, AppState, MISSING_DOMAIN};
