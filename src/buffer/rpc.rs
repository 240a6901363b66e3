//! Actor request surface
//!
//! Each actor answers HTTP-shaped requests:
//!
//! | Request              | Effect         | Response               |
//! |----------------------|----------------|------------------------|
//! | `POST /log?domain=D` | append(body)   | `Log buffered`         |
//! | `POST /flush`        | flush()        | `Flushed manually`     |
//! | `GET /debug`         | debug()        | buffer, `text/plain`   |
//! | anything else        | none           | usage hint             |

use crate::buffer::actor::{BufferActor, DEFAULT_DOMAIN};
use crate::clock::Clock;
use crate::storage::CONTENT_TYPE_TEXT_PLAIN;
use axum::http::{Method, StatusCode};
use tracing::warn;

pub const LOG_BUFFERED: &str = "Log buffered";
pub const FLUSHED_MANUALLY: &str = "Flushed manually";
pub const USAGE_HINT: &str = "Use POST /log to buffer logs or POST /flush to flush manually.";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RpcRequest {
    pub method: Method,
    /// Path plus optional query, e.g. `/log?domain=a.com`
    pub target: String,
    pub body: String,
}

impl RpcRequest {
    pub fn new(method: Method, target: impl Into<String>, body: impl Into<String>) -> Self {
        RpcRequest {
            method,
            target: target.into(),
            body: body.into(),
        }
    }

    pub fn log(domain: &str, line: impl Into<String>) -> Self {
        let encoded: String = url::form_urlencoded::byte_serialize(domain.as_bytes()).collect();
        Self::new(Method::POST, format!("/log?domain={}", encoded), line)
    }

    pub fn flush() -> Self {
        Self::new(Method::POST, "/flush", "")
    }

    pub fn debug() -> Self {
        Self::new(Method::GET, "/debug", "")
    }

    pub fn path(&self) -> &str {
        self.target.split_once('?').map_or(self.target.as_str(), |(path, _)| path)
    }

    /// First value of a query parameter, percent-decoded
    pub fn query_param(&self, name: &str) -> Option<String> {
        let (_, query) = self.target.split_once('?')?;
        url::form_urlencoded::parse(query.as_bytes())
            .find(|(k, _)| k == name)
            .map(|(_, v)| v.into_owned())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RpcResponse {
    pub status: StatusCode,
    pub content_type: &'static str,
    pub body: String,
}

impl RpcResponse {
    pub fn text(body: impl Into<String>) -> Self {
        RpcResponse {
            status: StatusCode::OK,
            content_type: CONTENT_TYPE_TEXT_PLAIN,
            body: body.into(),
        }
    }

    pub fn error(status: StatusCode, body: impl Into<String>) -> Self {
        RpcResponse {
            status,
            ..Self::text(body)
        }
    }

    pub fn is_success(&self) -> bool {
        self.status.is_success()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Route {
    Log,
    Flush,
    Debug,
    Unknown,
}

fn route(method: &Method, path: &str) -> Route {
    match (method, path) {
        (&Method::POST, "/log") => Route::Log,
        (&Method::POST, "/flush") => Route::Flush,
        (&Method::GET, "/debug") => Route::Debug,
        _ => Route::Unknown,
    }
}

impl<C: Clock> BufferActor<C> {
    pub async fn handle_request(&mut self, request: RpcRequest) -> RpcResponse {
        match route(&request.method, request.path()) {
            Route::Log => {
                let domain = request
                    .query_param("domain")
                    .filter(|d| !d.is_empty())
                    .unwrap_or_else(|| DEFAULT_DOMAIN.to_string());
                match self.append(&domain, request.body).await {
                    Ok(_) => RpcResponse::text(LOG_BUFFERED),
                    Err(e) => {
                        warn!(key = %self.key(), error = %e, "Log line rejected");
                        RpcResponse::error(StatusCode::INTERNAL_SERVER_ERROR, e.to_string())
                    }
                }
            }
            Route::Flush => {
                self.flush().await;
                RpcResponse::text(FLUSHED_MANUALLY)
            }
            Route::Debug => RpcResponse::text(self.debug()),
            Route::Unknown => RpcResponse::text(USAGE_HINT),
        }
    }
}
