//! Crawler detection by user agent

/// Lowercase substrings identifying crawlers and AI agents
pub const KNOWN_BOTS: &[&str] = &[
    // General
    "bot",
    "crawler",
    "spider",
    "slurp",
    "crawling",
    "scan",
    "search",
    "preview",
    // Search engines
    "googlebot",
    "bingbot",
    "baiduspider",
    "yandex",
    "sogou",
    "exabot",
    "ia_archiver",
    // Social
    "facebot",
    "facebookexternalhit",
    "twitterbot",
    "linkedinbot",
    "whatsapp",
    "telegrambot",
    "pinterest",
    // SEO
    "semrushbot",
    "ahrefsbot",
    "rogerbot",
    // AI / LLM
    "gptbot",
    "chatgpt",
    "openai",
    "perplexity",
    "perplexity-user",
    "ccbot",
    "duckassistbot",
    "claudebot",
    "claude-user",
    "claude-searchbot",
    "meta-externalagent",
    "meta-externalfetcher",
    "google-cloudvertexbot",
    "mistral",
    "mistralai-user",
    "oai-searchbot",
    "petalbot",
    "bytespider",
    "tiktokspider",
    "prorata",
    "timpibot",
    // Misc
    "discordbot",
    "applebot",
    "amazonbot",
];

/// Case-insensitive substring match against [`KNOWN_BOTS`].
/// A missing or blank user agent is not a bot.
pub fn is_bot(user_agent: Option<&str>) -> bool {
    let Some(ua) = user_agent else {
        return false;
    };
    let ua = ua.trim().to_ascii_lowercase();
    if ua.is_empty() {
        return false;
    }
    KNOWN_BOTS.iter().any(|pattern| ua.contains(pattern))
}
