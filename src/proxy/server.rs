//! HTTP front end
//!
//! One fallback handler serves everything:
//!
//! - `POST /flush?domain=D` flushes the buffer for `D`
//! - any other request is forwarded to the origin, answered with the
//!   origin's response, and logged in the background

use crate::buffer::rpc::RpcResponse;
use crate::clock::Clock;
use crate::proxy::cache::{CachePolicy, CACHE_HEADER};
use crate::proxy::dispatcher::LogDispatcher;
use crate::proxy::error::ProxyError;
use crate::proxy::log_line::AccessLogLine;
use crate::proxy::origin::{OriginClient, OriginRequest};
use axum::body::Body;
use axum::extract::{Request, State};
use axum::http::uri::Authority;
use axum::http::{header, HeaderMap, HeaderValue, Method, Uri};
use axum::response::{IntoResponse, Response};
use axum::Router;
use std::future::Future;
use tokio::net::TcpListener;
use tokio::signal;
use tracing::{debug, error, info};

pub const MISSING_DOMAIN: &str = "Missing ?domain=xxx";

/// Hostname used when a request carries no usable `Host`
const UNKNOWN_HOST: &str = "unknown";

#[derive(Clone)]
pub struct AppState<C: Clock> {
    pub dispatcher: LogDispatcher<C>,
    pub origin: OriginClient,
    pub clock: C,
    pub max_body_bytes: usize,
}

impl IntoResponse for RpcResponse {
    fn into_response(self) -> Response {
        (
            self.status,
            [(header::CONTENT_TYPE, self.content_type)],
            self.body,
        )
            .into_response()
    }
}

pub fn router<C: Clock>(state: AppState<C>) -> Router {
    Router::new().fallback(handle::<C>).with_state(state)
}

/// Serve until `shutdown` resolves, then let in-flight requests finish
pub async fn serve<C, F>(listener: TcpListener, state: AppState<C>, shutdown: F) -> std::io::Result<()>
where
    C: Clock,
    F: Future<Output = ()> + Send + 'static,
{
    if let Ok(addr) = listener.local_addr() {
        info!("Starting edge log proxy on {}", addr);
    }
    axum::serve(listener, router(state))
        .with_graceful_shutdown(shutdown)
        .await?;
    info!("Server shut down gracefully");
    Ok(())
}

async fn handle<C: Clock>(State(state): State<AppState<C>>, request: Request) -> Response {
    let result = if request.method() == Method::POST && request.uri().path() == "/flush" {
        match flush_domain(request.uri()) {
            Ok(domain) => manual_flush(&state, &domain).await,
            Err(e) => Err(e),
        }
    } else {
        proxy(&state, request).await
    };

    result.unwrap_or_else(|e| {
        debug!(error = %e, "Request failed");
        e.into_response()
    })
}

/// Non-empty `domain` query parameter of a manual flush
fn flush_domain(uri: &Uri) -> Result<String, ProxyError> {
    uri.query()
        .and_then(|q| {
            url::form_urlencoded::parse(q.as_bytes())
                .find(|(k, _)| k == "domain")
                .map(|(_, v)| v.into_owned())
        })
        .filter(|d| !d.is_empty())
        .ok_or_else(|| ProxyError::BadRequest(MISSING_DOMAIN.to_string()))
}

async fn manual_flush<C: Clock>(state: &AppState<C>, domain: &str) -> Result<Response, ProxyError> {
    let response = state.dispatcher.registry().flush(domain).await?;
    Ok(response.into_response())
}

async fn proxy<C: Clock>(state: &AppState<C>, request: Request) -> Result<Response, ProxyError> {
    let at = state.clock.now();
    let (parts, body) = request.into_parts();

    let hostname = request_hostname(&parts.headers, &parts.uri);
    let path_and_query = parts
        .uri
        .path_and_query()
        .map_or_else(|| parts.uri.path().to_string(), |pq| pq.as_str().to_string());
    let user_agent = header_string(&parts.headers, header::USER_AGENT);
    let cache = CachePolicy::for_request(user_agent.as_deref(), parts.uri.path());

    let body = axum::body::to_bytes(body, state.max_body_bytes)
        .await
        .map_err(|_| ProxyError::BodyTooLarge)?;

    let origin = state
        .origin
        .fetch(OriginRequest {
            method: parts.method.clone(),
            path_and_query: path_and_query.clone(),
            host: header_string(&parts.headers, header::HOST),
            headers: parts.headers.clone(),
            body,
            cache,
        })
        .await
        .inspect_err(|e| error!(host = %hostname, path = %path_and_query, error = %e, "Origin fetch failed"))?;

    let line = AccessLogLine {
        ip: header_string(&parts.headers, "cf-connecting-ip"),
        domain: hostname.clone(),
        at,
        method: parts.method.to_string(),
        path: path_and_query,
        protocol: Some(format!("{:?}", parts.version)),
        status: origin.status.as_u16(),
        size: origin.size,
        referer: header_string(&parts.headers, header::REFERER),
        user_agent,
        tls_version: None,
        duration: origin.elapsed,
    };
    state.dispatcher.dispatch(&hostname, line.to_string());

    let mut response = Response::new(Body::from(origin.body));
    *response.status_mut() = origin.status;
    *response.headers_mut() = origin.headers;
    response
        .headers_mut()
        .insert(CACHE_HEADER, HeaderValue::from_static(cache.header_value()));
    Ok(response)
}

fn header_string<K: header::AsHeaderName>(headers: &HeaderMap, name: K) -> Option<String> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
        .filter(|v| !v.is_empty())
}

/// Lowercase host without port, from `Host` or an absolute request URI
///
/// The result is both the logged domain and the buffer key, so anything that
/// is not a plain hostname or IP literal becomes `unknown`.
pub fn request_hostname(headers: &HeaderMap, uri: &Uri) -> String {
    headers
        .get(header::HOST)
        .and_then(|v| v.to_str().ok())
        .or_else(|| uri.host())
        .and_then(parse_hostname)
        .unwrap_or_else(|| UNKNOWN_HOST.to_string())
}

fn parse_hostname(raw: &str) -> Option<String> {
    let authority: Authority = raw.parse().ok()?;
    // `Host` never carries userinfo
    if authority.as_str().contains('@') {
        return None;
    }
    match url::Host::parse(authority.host()).ok()? {
        url::Host::Domain(domain) => is_dns_name(&domain).then_some(domain),
        url::Host::Ipv4(ip) => Some(ip.to_string()),
        url::Host::Ipv6(ip) => Some(format!("[{}]", ip)),
    }
}

/// Dot-separated non-empty labels of `[a-z0-9_-]`, one trailing dot allowed
fn is_dns_name(name: &str) -> bool {
    let name = name.strip_suffix('.').unwrap_or(name);
    !name.is_empty()
        && name.split('.').all(|label| {
            !label.is_empty()
                && label
                    .bytes()
                    .all(|b| b.is_ascii_lowercase() || b.is_ascii_digit() || b == b'-' || b == b'_')
        })
}

/// Resolves on SIGINT or SIGTERM
pub async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Received SIGINT, starting graceful shutdown"),
        _ = terminate => info!("Received SIGTERM, starting graceful shutdown"),
    }
}
