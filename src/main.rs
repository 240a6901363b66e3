//! Edge Log Proxy
//!
//! Forwards HTTP traffic to an origin and archives one access log line per
//! request, batched per domain into the bulk object store.
//!
//! ## Environment Variables
//!
//! | Variable | Default | Description |
//! |----------|---------|-------------|
//! | EDGE_LOG_CONFIG | - | TOML config file |
//! | EDGE_LOG_LISTEN | 0.0.0.0:8080 | Listen address |
//! | EDGE_LOG_ORIGIN | http://127.0.0.1:8081 | Origin base URL |
//! | EDGE_LOG_FLUSH_THRESHOLD | 100 | Lines per batch |
//! | EDGE_LOG_FLUSH_INTERVAL_MS | 300000 | Maximum time between flushes |
//! | EDGE_LOG_STORE | localfs | memory, localfs, or s3 |
//! | EDGE_LOG_DATA_PATH | ./data | LocalFs root |
//! | RUST_LOG | info | Log filter |

#[cfg(not(target_env = "msvc"))]
use tikv_jemallocator::Jemalloc;

#[cfg(not(target_env = "msvc"))]
#[global_allocator]
static GLOBAL: Jemalloc = Jemalloc;

use edge_log_proxy::buffer::{spawn_alarm_scheduler, BufferDeps, BufferRegistry};
use edge_log_proxy::clock::SystemClock;
use edge_log_proxy::config::Config;
use edge_log_proxy::io::RngSource;
use edge_log_proxy::observability::init_tracing;
use edge_log_proxy::proxy::{serve, shutdown_signal, AppState, LogDispatcher, OriginClient};
use edge_log_proxy::storage::{open_bulk_store, open_state_store};
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::{error, info};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let config = match Config::load() {
        Ok(config) => config,
        Err(e) => {
            eprintln!("edge-log-proxy: {}", e);
            std::process::exit(2);
        }
    };
    init_tracing(&config.logging)?;

    info!(
        listen = %config.server.listen_addr,
        origin = %config.origin.url,
        threshold = config.flush.threshold,
        interval_ms = config.flush.interval.as_millis() as u64,
        bulk = ?config.storage.bulk,
        state = ?config.storage.state,
        "Starting edge log proxy"
    );

    let bulk = open_bulk_store(&config.storage)?;
    let state = open_state_store(&config.storage);
    let clock = SystemClock::new();

    // Persisted alarms are re-armed here; due ones fire once the pump runs
    let (timer, fired_rx, scheduler_task) = spawn_alarm_scheduler(state.clone(), clock.clone());

    let registry = BufferRegistry::new(
        BufferDeps {
            bulk,
            state,
            timer: Arc::new(timer.clone()),
        },
        config.to_policy(),
        clock.clone(),
        RngSource::Entropy,
    );
    let pump_task = registry.spawn_alarm_pump(fired_rx);

    let dispatcher = LogDispatcher::new(registry.clone());
    let app_state = AppState {
        dispatcher: dispatcher.clone(),
        origin: OriginClient::new(&config.origin)?,
        clock,
        max_body_bytes: config.server.max_body_bytes,
    };

    let listener = TcpListener::bind(config.server.listen_addr).await?;
    if let Err(e) = serve(listener, app_state, shutdown_signal()).await {
        error!(error = %e, "Server error");
    }

    info!(in_flight = dispatcher.in_flight(), "Draining log hand-offs");
    dispatcher.drain().await;

    if config.flush.flush_on_shutdown {
        let flushed = registry.flush_all().await;
        info!(actors = flushed, "Flushed live buffers");
    }

    timer.shutdown().await;
    let _ = scheduler_task.await;
    pump_task.abort();

    info!("Shutdown complete");
    Ok(())
}
