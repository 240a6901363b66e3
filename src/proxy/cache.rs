//! Upstream cache policy
//!
//! Crawlers only get cached responses for static assets; everyone else
//! is served from cache whenever possible.

use crate::proxy::bot::is_bot;

pub const CACHE_HEADER: &str = "x-edge-cache";

const STATIC_EXTENSIONS: &[&str] = &[
    "png", "jpg", "jpeg", "gif", "webp", "svg", "ico", "css", "js", "woff", "woff2",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CachePolicy {
    Everything,
    Bypass,
}

impl CachePolicy {
    pub fn for_request(user_agent: Option<&str>, path: &str) -> Self {
        if cache_everything(is_bot(user_agent), is_static_asset(path)) {
            CachePolicy::Everything
        } else {
            CachePolicy::Bypass
        }
    }

    pub fn header_value(&self) -> &'static str {
        match self {
            CachePolicy::Everything => "everything",
            CachePolicy::Bypass => "bypass",
        }
    }
}

/// `path` is the URL path without the query string
pub fn is_static_asset(path: &str) -> bool {
    path.rsplit_once('.').is_some_and(|(_, ext)| {
        STATIC_EXTENSIONS
            .iter()
            .any(|known| ext.eq_ignore_ascii_case(known))
    })
}

pub fn cache_everything(bot: bool, static_asset: bool) -> bool {
    !bot || static_asset
}
