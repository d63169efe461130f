/// Fixed signature list for the bot heuristic: a case-insensitive
/// substring match against the request's `User-Agent`, covering known
/// crawler/headless-browser/HTTP-client signatures. Deliberately simple
/// and stateless — no behavioral scoring (burst rate, path sweep) — since
/// this flag gates rollup deltas directly and needs to stay a pure
/// function of one event's UA.
pub const BOT_SIGNATURES: &[&str] = &[
    "bot",
    "spider",
    "crawler",
    "googlebot",
    "bingbot",
    "duckduckbot",
    "yandexbot",
    "baiduspider",
    "ahrefsbot",
    "semrushbot",
    "mj12bot",
    "facebookexternalhit",
    "slackbot",
    "discordbot",
    "telegrambot",
    "headlesschrome",
    "phantomjs",
    "puppeteer",
    "playwright",
    "selenium",
    "python-requests",
    "python-urllib",
    "curl/",
    "wget/",
    "go-http-client",
    "libwww-perl",
    "httpclient",
    "okhttp",
    "axios/",
    "node-fetch",
    "postmanruntime",
];

/// Returns `true` if `user_agent` case-insensitively contains any known bot
/// signature. An absent/empty UA is never classified as a bot.
pub fn is_bot_user_agent(user_agent: &str) -> bool {
    if user_agent.is_empty() {
        return false;
    }
    let lowered = user_agent.to_ascii_lowercase();
    BOT_SIGNATURES.iter().any(|sig| lowered.contains(sig))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_ua_is_never_a_bot() {
        assert!(!is_bot_user_agent(""));
    }

    #[test]
    fn known_crawler_is_a_bot() {
        assert!(is_bot_user_agent("Mozilla/5.0 (compatible; Googlebot/2.1)"));
    }

    #[test]
    fn curl_is_a_bot() {
        assert!(is_bot_user_agent("curl/8.4.0"));
    }

    #[test]
    fn ordinary_browser_is_not_a_bot() {
        assert!(!is_bot_user_agent(
            "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) AppleWebKit/605.1.15"
        ));
    }
}
