//! Platform detection and the per-platform request profile (user agents,
//! headers, login pages) the orchestrator builds its strategies from.

use std::fmt;
use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::error::FetchError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PlatformId {
    Instagram,
    YouTube,
    TikTok,
    Facebook,
    Twitter,
    Unknown,
}

/// Ordered domain table. Ambiguous URLs resolve to the earliest platform.
const DOMAIN_TABLE: &[(PlatformId, &[&str])] = &[
    (PlatformId::Instagram, &["instagram.com", "instagr.am"]),
    (PlatformId::YouTube, &["youtube.com", "youtu.be"]),
    (PlatformId::TikTok, &["tiktok.com"]),
    (PlatformId::Facebook, &["facebook.com", "fb.watch", "fb.com"]),
    (PlatformId::Twitter, &["twitter.com", "://x.com", ".x.com", "//t.co/"]),
];

const DESKTOP_CHROME_UA: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 \
     (KHTML, like Gecko) Chrome/124.0.0.0 Safari/537.36";
const DESKTOP_SAFARI_UA: &str = "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) \
     AppleWebKit/605.1.15 (KHTML, like Gecko) Version/17.4 Safari/605.1.15";
const INSTAGRAM_APP_UA: &str = "Instagram 309.1.0.41.113 Android (33/13; 420dpi; 1080x2340; \
     samsung; SM-G991B; o1s; exynos2100; en_US; 541635890)";
const IPHONE_SAFARI_UA: &str = "Mozilla/5.0 (iPhone; CPU iPhone OS 17_4 like Mac OS X) \
     AppleWebKit/605.1.15 (KHTML, like Gecko) Version/17.4 Mobile/15E148 Safari/604.1";
const FACEBOOK_CRAWLER_UA: &str =
    "facebookexternalhit/1.1 (+http://www.facebook.com/externalhit_uatext.php)";

/// Public web app id Instagram's own frontend sends with API calls.
pub const INSTAGRAM_APP_ID: &str = "936619743392459";

static SCHEME_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)^https?://\S+$").expect("valid scheme regex"));

impl PlatformId {
    pub const KNOWN: [PlatformId; 5] = [
        Self::Instagram,
        Self::YouTube,
        Self::TikTok,
        Self::Facebook,
        Self::Twitter,
    ];

    /// Lowercase identifier used for file names and JSON.
    pub fn slug(self) -> &'static str {
        match self {
            Self::Instagram => "instagram",
            Self::YouTube => "youtube",
            Self::TikTok => "tiktok",
            Self::Facebook => "facebook",
            Self::Twitter => "twitter",
            Self::Unknown => "unknown",
        }
    }

    pub fn display_name(self) -> &'static str {
        match self {
            Self::Instagram => "Instagram",
            Self::YouTube => "YouTube",
            Self::TikTok => "TikTok",
            Self::Facebook => "Facebook",
            Self::Twitter => "Twitter",
            Self::Unknown => "Unknown",
        }
    }

    /// Parses a user-supplied platform name (`"x"` is accepted for Twitter).
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "instagram" | "ig" => Some(Self::Instagram),
            "youtube" | "yt" => Some(Self::YouTube),
            "tiktok" => Some(Self::TikTok),
            "facebook" | "fb" => Some(Self::Facebook),
            "twitter" | "x" => Some(Self::Twitter),
            _ => None,
        }
    }

    pub fn primary_user_agent(self) -> &'static str {
        match self {
            Self::YouTube | Self::Unknown => DESKTOP_CHROME_UA,
            Self::Instagram | Self::TikTok | Self::Facebook | Self::Twitter => DESKTOP_SAFARI_UA,
        }
    }

    /// User agent for the alternate strategy. Platforms without one skip it.
    pub fn secondary_user_agent(self) -> Option<&'static str> {
        match self {
            Self::Instagram => Some(INSTAGRAM_APP_UA),
            Self::TikTok => Some(IPHONE_SAFARI_UA),
            Self::Facebook => Some(FACEBOOK_CRAWLER_UA),
            Self::YouTube | Self::Twitter | Self::Unknown => None,
        }
    }

    /// Instagram throttles anonymous scraping hard; only it gets backoff
    /// delays between rate-limited retries.
    pub fn rate_limits_aggressively(self) -> bool {
        matches!(self, Self::Instagram)
    }

    pub fn home_url(self) -> &'static str {
        match self {
            Self::Instagram => "https://www.instagram.com/",
            Self::YouTube => "https://www.youtube.com/",
            Self::TikTok => "https://www.tiktok.com/",
            Self::Facebook => "https://www.facebook.com/",
            Self::Twitter => "https://x.com/",
            Self::Unknown => "",
        }
    }

    /// Page the authentication-only extractor run visits to mint cookies.
    pub fn login_url(self) -> &'static str {
        match self {
            Self::Instagram => "https://www.instagram.com/accounts/login/",
            Self::YouTube => "https://www.youtube.com/feed/subscriptions",
            Self::TikTok => "https://www.tiktok.com/login",
            Self::Facebook => "https://www.facebook.com/login",
            Self::Twitter => "https://x.com/i/flow/login",
            Self::Unknown => "",
        }
    }

    pub fn cookie_domain(self) -> &'static str {
        match self {
            Self::Instagram => ".instagram.com",
            Self::YouTube => ".youtube.com",
            Self::TikTok => ".tiktok.com",
            Self::Facebook => ".facebook.com",
            Self::Twitter => ".x.com",
            Self::Unknown => "",
        }
    }

    /// Headers sent with the primary strategy.
    pub fn standard_headers(self) -> Vec<(String, String)> {
        let mut headers = vec![
            (
                "Accept".to_string(),
                "text/html,application/xhtml+xml,application/xml;q=0.9,*/*;q=0.8".to_string(),
            ),
            ("Accept-Language".to_string(), "en-US,en;q=0.9".to_string()),
        ];
        if self != Self::Unknown {
            headers.push(("Referer".to_string(), self.home_url().to_string()));
        }
        headers
    }

    /// Superset of the standard headers used by the alternate strategy.
    pub fn broad_headers(self) -> Vec<(String, String)> {
        let mut headers = self.standard_headers();
        headers.extend([
            ("Sec-Fetch-Dest".to_string(), "document".to_string()),
            ("Sec-Fetch-Mode".to_string(), "navigate".to_string()),
            ("Sec-Fetch-Site".to_string(), "none".to_string()),
            ("Cache-Control".to_string(), "no-cache".to_string()),
        ]);
        if self != Self::Unknown {
            let origin = self.home_url().trim_end_matches('/').to_string();
            headers.push(("Origin".to_string(), origin));
        }
        if self == Self::Instagram {
            headers.push(("X-IG-App-ID".to_string(), INSTAGRAM_APP_ID.to_string()));
        }
        headers
    }
}

impl fmt::Display for PlatformId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.display_name())
    }
}

/// Maps any string to a platform by case-insensitive domain substring match.
pub fn classify(url: &str) -> PlatformId {
    let lowered = url.to_lowercase();
    DOMAIN_TABLE
        .iter()
        .find(|(_, domains)| domains.iter().any(|domain| lowered.contains(domain)))
        .map(|(platform, _)| *platform)
        .unwrap_or(PlatformId::Unknown)
}

pub fn is_supported(url: &str) -> bool {
    validate_url(url).is_ok()
}

/// Rejects malformed URLs before classification, then unknown platforms.
pub fn validate_url(url: &str) -> Result<PlatformId, FetchError> {
    let trimmed = url.trim();
    if trimmed.is_empty() {
        return Err(FetchError::InvalidUrl("URL is required".to_string()));
    }
    if !SCHEME_RE.is_match(trimmed) {
        return Err(FetchError::InvalidUrl(format!(
            "Invalid URL '{trimmed}': expected an http:// or https:// link"
        )));
    }
    match classify(trimmed) {
        PlatformId::Unknown => Err(FetchError::UnsupportedPlatform(trimmed.to_string())),
        platform => Ok(platform),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classify_matches_known_domains_regardless_of_path() {
        assert_eq!(
            classify("https://www.tiktok.com/@x/video/123"),
            PlatformId::TikTok
        );
        assert_eq!(
            classify("https://www.instagram.com/reel/C1a2b3/?igsh=youtube.com"),
            PlatformId::Instagram
        );
        assert_eq!(classify("https://youtu.be/dQw4w9WgXcQ"), PlatformId::YouTube);
        assert_eq!(classify("https://fb.watch/abc"), PlatformId::Facebook);
        assert_eq!(
            classify("https://x.com/user/status/1"),
            PlatformId::Twitter
        );
        assert_eq!(classify("https://t.co/AbCd"), PlatformId::Twitter);
        assert_eq!(classify("https://example.com/video"), PlatformId::Unknown);
    }

    #[test]
    fn short_twitter_domains_do_not_match_inside_other_hosts() {
        assert_eq!(classify("https://www.reddit.com/r/videos"), PlatformId::Unknown);
        assert_eq!(classify("https://netflix.com/title/1"), PlatformId::Unknown);
    }

    #[test]
    fn classify_is_case_insensitive() {
        assert_eq!(
            classify("HTTPS://WWW.YOUTUBE.COM/watch?v=abc"),
            PlatformId::YouTube
        );
    }

    #[test]
    fn classify_prefers_earliest_declared_platform() {
        // Contains both an Instagram and a YouTube domain.
        assert_eq!(
            classify("https://youtube.com/redirect?q=instagram.com/p/x"),
            PlatformId::Instagram
        );
    }

    #[test]
    fn validate_url_rejects_missing_scheme_before_classifying() {
        let err = validate_url("www.instagram.com/p/abc").unwrap_err();
        assert_eq!(err.kind(), "INVALID_URL");
        let err = validate_url("   ").unwrap_err();
        assert_eq!(err.kind(), "INVALID_URL");
    }

    #[test]
    fn validate_url_rejects_unknown_platforms() {
        let err = validate_url("https://vimeo.com/123").unwrap_err();
        assert_eq!(err.kind(), "UNSUPPORTED_PLATFORM");
        assert!(is_supported("http://instagram.com/p/abc"));
        assert!(!is_supported("ftp://instagram.com/p/abc"));
    }

    #[test]
    fn parse_accepts_aliases() {
        assert_eq!(PlatformId::parse("X"), Some(PlatformId::Twitter));
        assert_eq!(PlatformId::parse(" Instagram "), Some(PlatformId::Instagram));
        assert_eq!(PlatformId::parse("myspace"), None);
    }

    #[test]
    fn broad_headers_extend_standard_headers() {
        let standard = PlatformId::Instagram.standard_headers();
        let broad = PlatformId::Instagram.broad_headers();
        assert!(standard.iter().all(|header| broad.contains(header)));
        assert!(broad.iter().any(|(name, _)| name == "X-IG-App-ID"));
    }

    #[test]
    fn only_instagram_rate_limits_aggressively() {
        let prone: Vec<_> = PlatformId::KNOWN
            .into_iter()
            .filter(|platform| platform.rate_limits_aggressively())
            .collect();
        assert_eq!(prone, vec![PlatformId::Instagram]);
    }
}
