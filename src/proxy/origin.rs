//! Origin forwarding
//!
//! Requests are replayed against the configured origin base URL with the
//! same method, path, query, headers and body. Redirects are passed back to
//! the client rather than followed. The fetch is timed from send until the
//! response head arrives; the body is then buffered so its size can be
//! logged.

use crate::config::OriginConfig;
use crate::proxy::cache::CachePolicy;
use crate::proxy::error::ProxyError;
use axum::http::{header, HeaderMap, HeaderName, HeaderValue, Method, StatusCode};
use bytes::Bytes;
use std::time::{Duration, Instant};
use tracing::warn;

/// Never forwarded in either direction
const HOP_BY_HOP: &[&str] = &[
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "proxy-connection",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

pub fn is_hop_by_hop(name: &HeaderName) -> bool {
    HOP_BY_HOP.contains(&name.as_str())
}

/// Copy of `headers` without hop-by-hop headers or those the
/// `Connection` header names
pub fn forwardable_headers(headers: &HeaderMap) -> HeaderMap {
    let named: Vec<String> = headers
        .get_all(header::CONNECTION)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .map(|v| v.trim().to_ascii_lowercase())
        .collect();

    let mut out = HeaderMap::with_capacity(headers.len());
    for (name, value) in headers {
        if is_hop_by_hop(name)
            || name == header::CONTENT_LENGTH
            || named.iter().any(|n| n == name.as_str())
        {
            continue;
        }
        out.append(name.clone(), value.clone());
    }
    out
}

#[derive(Debug, Clone)]
pub struct OriginRequest {
    pub method: Method,
    /// e.g. `/cart?id=3`
    pub path_and_query: String,
    pub host: Option<String>,
    pub headers: HeaderMap,
    pub body: Bytes,
    pub cache: CachePolicy,
}

#[derive(Debug)]
pub struct OriginResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Bytes,
    /// `None` when the body could not be read
    pub size: Option<u64>,
    pub elapsed: Duration,
}

#[derive(Debug, Clone)]
pub struct OriginClient {
    client: reqwest::Client,
    base: String,
}

impl OriginClient {
    pub fn new(config: &OriginConfig) -> Result<Self, ProxyError> {
        // Validates the base before any request is built on it
        url::Url::parse(&config.url)?;
        let client = reqwest::Client::builder()
            .timeout(config.timeout)
            .redirect(reqwest::redirect::Policy::none())
            .build()?;
        Ok(OriginClient {
            client,
            base: config.url.trim_end_matches('/').to_string(),
        })
    }

    pub fn url_for(&self, path_and_query: &str) -> Result<url::Url, ProxyError> {
        Ok(url::Url::parse(&format!("{}{}", self.base, path_and_query))?)
    }

    pub async fn fetch(&self, request: OriginRequest) -> Result<OriginResponse, ProxyError> {
        let url = self.url_for(&request.path_and_query)?;

        let mut headers = forwardable_headers(&request.headers);
        headers.remove(header::HOST);
        if let Some(host) = request.host.as_deref().and_then(|h| HeaderValue::from_str(h).ok()) {
            headers.insert(HeaderName::from_static("x-forwarded-host"), host);
        }
        if request.cache == CachePolicy::Bypass {
            headers.insert(header::CACHE_CONTROL, HeaderValue::from_static("no-cache"));
        }

        let started = Instant::now();
        let response = self
            .client
            .request(request.method, url)
            .headers(headers)
            .body(request.body)
            .send()
            .await?;
        let elapsed = started.elapsed();

        let status = response.status();
        let headers = forwardable_headers(response.headers());
        let (body, size) = match response.bytes().await {
            Ok(body) => {
                let size = body.len() as u64;
                (body, Some(size))
            }
            Err(e) => {
                // The failed read consumed the stream: the client gets the
                // origin's status and headers with an empty body, and the
                // log line records `-` as the size.
                warn!(status = %status, error = %e, "Failed to read origin body");
                (Bytes::new(), None)
            }
        };

        Ok(OriginResponse {
            status,
            headers,
            body,
            size,
            elapsed,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn client(base: &str) -> OriginClient {
        OriginClient::new(&OriginConfig {
            url: base.into(),
            timeout: Duration::from_secs(5),
        })
        .unwrap()
    }

    #[test]
    fn test_url_for_joins_base_and_path() {
        let c = client("http://origin.internal:8081/");
        assert_eq!(
            c.url_for("/cart?id=3").unwrap().as_str(),
            "http://origin.internal:8081/cart?id=3"
        );
        assert_eq!(c.url_for("/").unwrap().as_str(), "http://origin.internal:8081/");
    }

    #[test]
    fn test_invalid_base_rejected() {
        let err = OriginClient::new(&OriginConfig {
            url: "not a url".into(),
            timeout: Duration::from_secs(1),
        })
        .unwrap_err();
        assert_eq!(err.status(), StatusCode::BAD_GATEWAY);
    }

    #[test]
    fn test_hop_by_hop_stripped() {
        let mut headers = HeaderMap::new();
        headers.insert(header::CONNECTION, HeaderValue::from_static("keep-alive, x-private"));
        headers.insert(header::TRANSFER_ENCODING, HeaderValue::from_static("chunked"));
        headers.insert(header::CONTENT_LENGTH, HeaderValue::from_static("12"));
        headers.insert("x-private", HeaderValue::from_static("secret"));
        headers.insert(header::USER_AGENT, HeaderValue::from_static("curl/8"));
        headers.append(header::ACCEPT, HeaderValue::from_static("text/html"));
        headers.append(header::ACCEPT, HeaderValue::from_static("*/*"));

        let out = forwardable_headers(&headers);
        assert_eq!(out.len(), 3);
        assert_eq!(out.get(header::USER_AGENT).unwrap(), "curl/8");
        assert_eq!(out.get_all(header::ACCEPT).iter().count(), 2);
        assert!(out.get("x-private").is_none());
    }
}
