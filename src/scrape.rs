//! Instagram page-scrape fallback.
//!
//! When yt-dlp gives up, the media URL is often still reachable from the
//! page itself. Lookups run in order and stop at the first video URL:
//! page HTML patterns, JSON blocks embedded in the page, the embed pages,
//! the oEmbed endpoint and finally the GraphQL media API. The URL is then
//! fetched as a byte stream, or remuxed with ffmpeg when it points at a
//! streaming manifest or the byte download fails.

use std::fs::File;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::LazyLock;
use std::time::Duration;

use async_trait::async_trait;
use regex::Regex;
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::extractor::{RunError, run_with_deadline};
use crate::failure::{AttemptFailure, FailureKind};
use crate::platform::INSTAGRAM_APP_ID;

const GRAPHQL_ENDPOINT: &str = "https://www.instagram.com/api/graphql";
const OEMBED_ENDPOINT: &str = "https://www.instagram.com/api/v1/oembed/";
/// Persisted query id of the web app's post page. Instagram rotates it every
/// few weeks.
const GRAPHQL_DOC_ID: &str = "8845758582119845";
const LSD_TOKEN: &str = "AVqbxe3J_YA";
const MAX_MEDIA_BYTES: u64 = 2 * 1024 * 1024 * 1024;

/// What the fallback needs to know about one attempt.
#[derive(Debug, Clone)]
pub struct ScrapeRequest {
    pub url: String,
    pub user_agent: String,
    pub headers: Vec<(String, String)>,
    pub cookie_header: Option<String>,
    /// Where to put the downloaded file. `None` resolves the media URL only.
    pub work_dir: Option<PathBuf>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ScrapedMedia {
    pub media_url: String,
    pub title: Option<String>,
    pub owner: Option<String>,
    pub caption: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScrapeResult {
    pub media: ScrapedMedia,
    pub file: Option<PathBuf>,
}

#[async_trait]
pub trait FallbackSource: Send + Sync {
    async fn fetch(&self, request: ScrapeRequest) -> Result<ScrapeResult, AttemptFailure>;
}

pub struct InstagramScraper {
    agent: ureq::Agent,
    ffmpeg: Option<PathBuf>,
    remux_timeout: Duration,
}

impl InstagramScraper {
    pub fn new(http_timeout: Duration, ffmpeg: Option<PathBuf>, remux_timeout: Duration) -> Self {
        let agent = ureq::AgentBuilder::new()
            .timeout(http_timeout)
            .redirects(5)
            .build();
        Self {
            agent,
            ffmpeg,
            remux_timeout,
        }
    }

    async fn remux(&self, media_url: &str, target: &Path) -> Result<(), AttemptFailure> {
        let Some(ffmpeg) = &self.ffmpeg else {
            return Err(AttemptFailure::new(
                FailureKind::Other,
                "ffmpeg is not available to remux the stream",
            ));
        };
        let args = vec![
            "-y".to_string(),
            "-loglevel".to_string(),
            "error".to_string(),
            "-i".to_string(),
            media_url.to_string(),
            "-c".to_string(),
            "copy".to_string(),
            target.to_string_lossy().into_owned(),
        ];
        match run_with_deadline(ffmpeg, &args, self.remux_timeout).await {
            Ok(output) if output.success && target.is_file() => Ok(()),
            Ok(output) => Err(AttemptFailure::new(
                FailureKind::Other,
                &format!("ffmpeg remux failed: {}", output.stderr.trim()),
            )),
            Err(RunError::TimedOut(_)) => Err(AttemptFailure::new(
                FailureKind::Timeout,
                "ffmpeg remux timed out",
            )),
            Err(err) => Err(AttemptFailure::new(FailureKind::Other, &err.to_string())),
        }
    }
}

#[async_trait]
impl FallbackSource for InstagramScraper {
    async fn fetch(&self, request: ScrapeRequest) -> Result<ScrapeResult, AttemptFailure> {
        let agent = self.agent.clone();
        let lookup = request.clone();
        let media = tokio::task::spawn_blocking(move || locate_media(&agent, &lookup))
            .await
            .map_err(|err| AttemptFailure::new(FailureKind::Other, &err.to_string()))??;
        info!(url = %request.url, media_url = %media.media_url, "page scrape found media");

        let Some(work_dir) = request.work_dir else {
            return Ok(ScrapeResult { media, file: None });
        };
        let name = shortcode(&request.url).unwrap_or_else(|| "instagram_video".to_string());
        let target = work_dir.join(format!("{name}.mp4"));

        if !is_manifest(&media.media_url) {
            let agent = self.agent.clone();
            let media_url = media.media_url.clone();
            let dest = target.clone();
            let cookie = request.cookie_header.clone();
            let user_agent = request.user_agent.clone();
            let fetched = tokio::task::spawn_blocking(move || {
                download_bytes(&agent, &media_url, &user_agent, cookie.as_deref(), &dest)
            })
            .await;
            match fetched {
                Ok(Ok(bytes)) => {
                    debug!(bytes, path = %target.display(), "media byte download finished");
                    return Ok(ScrapeResult {
                        media,
                        file: Some(target),
                    });
                }
                Ok(Err(failure)) => {
                    warn!(detail = %failure.detail, "byte download failed, trying remux")
                }
                Err(err) => warn!(error = %err, "byte download task failed, trying remux"),
            }
        }

        self.remux(&media.media_url, &target).await?;
        Ok(ScrapeResult {
            media,
            file: Some(target),
        })
    }
}

fn locate_media(agent: &ureq::Agent, request: &ScrapeRequest) -> Result<ScrapedMedia, AttemptFailure> {
    let mut meta = ScrapedMedia::default();
    let mut last_failure = None;

    let mut pages = vec![request.url.clone()];
    let code = shortcode(&request.url);
    if let Some(code) = &code {
        pages.extend(embed_urls(code));
    }

    for page in &pages {
        match fetch_text(agent, page, request) {
            Ok(html) => {
                meta.merge(page_meta(&html));
                if let Some(found) = video_url_in_html(&html).or_else(|| video_url_in_json_blocks(&html)) {
                    return Ok(meta.with_url(found));
                }
                debug!(page, "no video URL in page");
            }
            Err(failure) if failure.kind == FailureKind::RateLimited => return Err(failure),
            Err(failure) => {
                debug!(page, detail = %failure.detail, "page fetch failed");
                last_failure = Some(failure);
            }
        }
    }

    match fetch_oembed(agent, request) {
        Ok(body) => {
            meta.merge(oembed_meta(&body));
            if let Some(found) = search_video_url(&body) {
                return Ok(meta.with_url(found));
            }
        }
        Err(failure) if failure.kind == FailureKind::RateLimited => return Err(failure),
        Err(failure) => last_failure = Some(failure),
    }

    if let Some(code) = &code {
        match fetch_graphql(agent, code, request) {
            Ok(body) => {
                if let Some(media) = graphql_media(&body) {
                    meta.merge(media.clone());
                    return Ok(meta.with_url(media.media_url));
                }
            }
            Err(failure) if failure.kind == FailureKind::RateLimited => return Err(failure),
            Err(failure) => last_failure = Some(failure),
        }
    }

    Err(last_failure.unwrap_or_else(|| {
        AttemptFailure::new(
            FailureKind::Other,
            "no video URL found in page, embed, oEmbed or GraphQL responses",
        )
    }))
}

impl ScrapedMedia {
    /// Fills fields still missing from `other`.
    fn merge(&mut self, other: ScrapedMedia) {
        if self.title.is_none() {
            self.title = other.title;
        }
        if self.owner.is_none() {
            self.owner = other.owner;
        }
        if self.caption.is_none() {
            self.caption = other.caption;
        }
    }

    fn with_url(mut self, media_url: String) -> Self {
        self.media_url = media_url;
        self
    }
}

fn apply_headers(mut req: ureq::Request, request: &ScrapeRequest) -> ureq::Request {
    req = req.set("User-Agent", &request.user_agent);
    for (name, value) in &request.headers {
        req = req.set(name, value);
    }
    if let Some(cookie) = &request.cookie_header {
        req = req.set("Cookie", cookie);
    }
    req
}

fn fetch_text(agent: &ureq::Agent, url: &str, request: &ScrapeRequest) -> Result<String, AttemptFailure> {
    let response = apply_headers(agent.get(url), request)
        .call()
        .map_err(http_failure)?;
    response
        .into_string()
        .map_err(|err| AttemptFailure::new(FailureKind::Other, &err.to_string()))
}

fn fetch_oembed(agent: &ureq::Agent, request: &ScrapeRequest) -> Result<Value, AttemptFailure> {
    let response = apply_headers(agent.get(OEMBED_ENDPOINT), request)
        .query("url", &request.url)
        .call()
        .map_err(http_failure)?;
    response
        .into_json()
        .map_err(|err| AttemptFailure::new(FailureKind::Other, &err.to_string()))
}

fn fetch_graphql(
    agent: &ureq::Agent,
    code: &str,
    request: &ScrapeRequest,
) -> Result<Value, AttemptFailure> {
    let variables = serde_json::json!({ "shortcode": code }).to_string();
    let mut req = agent
        .post(GRAPHQL_ENDPOINT)
        .set("User-Agent", &request.user_agent)
        .set("X-IG-App-ID", INSTAGRAM_APP_ID)
        .set("X-FB-LSD", LSD_TOKEN)
        .set("X-Requested-With", "XMLHttpRequest")
        .set("Referer", "https://www.instagram.com/")
        .set("Origin", "https://www.instagram.com");
    if let Some(cookie) = &request.cookie_header {
        req = req.set("Cookie", cookie);
        if let Some(token) = csrf_token(cookie) {
            req = req.set("X-CSRFToken", token);
        }
    }
    let response = req
        .send_form(&[
            ("doc_id", GRAPHQL_DOC_ID),
            ("variables", variables.as_str()),
            ("lsd", LSD_TOKEN),
        ])
        .map_err(http_failure)?;
    response
        .into_json()
        .map_err(|err| AttemptFailure::new(FailureKind::Other, &err.to_string()))
}

fn download_bytes(
    agent: &ureq::Agent,
    media_url: &str,
    user_agent: &str,
    cookie: Option<&str>,
    dest: &Path,
) -> Result<u64, AttemptFailure> {
    let mut req = agent
        .get(media_url)
        .set("User-Agent", user_agent)
        .set("Referer", "https://www.instagram.com/");
    if let Some(cookie) = cookie {
        req = req.set("Cookie", cookie);
    }
    let response = req.call().map_err(http_failure)?;
    let io_failure = |err: io::Error| AttemptFailure::new(FailureKind::Other, &err.to_string());
    let mut file = File::create(dest).map_err(io_failure)?;
    let copied = copy_capped(response.into_reader(), &mut file, MAX_MEDIA_BYTES);
    if copied.is_err() {
        let _ = std::fs::remove_file(dest);
    }
    copied
}

/// Copies at most `cap` bytes. A body longer than `cap` or an empty body is a
/// failure rather than a truncated file.
fn copy_capped(
    reader: impl io::Read,
    writer: &mut impl io::Write,
    cap: u64,
) -> Result<u64, AttemptFailure> {
    let mut limited = io::Read::take(reader, cap.saturating_add(1));
    let written = io::copy(&mut limited, writer)
        .map_err(|err| AttemptFailure::new(FailureKind::Other, &err.to_string()))?;
    if written > cap {
        return Err(AttemptFailure::new(
            FailureKind::Other,
            &format!("media response exceeds {cap} bytes"),
        ));
    }
    if written == 0 {
        return Err(AttemptFailure::new(FailureKind::Other, "media response was empty"));
    }
    Ok(written)
}

fn http_failure(err: ureq::Error) -> AttemptFailure {
    match err {
        ureq::Error::Status(429, _) => {
            AttemptFailure::new(FailureKind::RateLimited, "HTTP Error 429: Too Many Requests")
        }
        ureq::Error::Status(code, _) => {
            AttemptFailure::new(FailureKind::Other, &format!("HTTP Error {code}"))
        }
        ureq::Error::Transport(transport) => {
            let text = transport.to_string();
            let kind = if text.to_lowercase().contains("timed out") {
                FailureKind::Timeout
            } else {
                FailureKind::Other
            };
            AttemptFailure::new(kind, &text)
        }
    }
}

static SHORTCODE_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"/(?:p|reel|reels|tv)/([A-Za-z0-9_-]+)").expect("valid shortcode regex")
});

static HTML_PATTERNS: LazyLock<Vec<Regex>> = LazyLock::new(|| {
    [
        r#""video_url"\s*:\s*"([^"]+)""#,
        r#"<meta[^>]+property="og:video(?::secure_url)?"[^>]+content="([^"]+)""#,
        r#""contentUrl"\s*:\s*"([^"]+)""#,
        r#""playback_url"\s*:\s*"([^"]+)""#,
        r#"<video[^>]+src="([^"]+)""#,
    ]
    .iter()
    .map(|pattern| Regex::new(pattern).expect("valid media pattern"))
    .collect()
});

static JSON_SCRIPT_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"(?s)<script[^>]*type="application/(?:ld\+)?json"[^>]*>(.*?)</script>"#)
        .expect("valid script regex")
});

static OG_TITLE_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"<meta[^>]+property="og:title"[^>]+content="([^"]*)""#).expect("valid og regex")
});

static OG_DESCRIPTION_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"<meta[^>]+property="og:description"[^>]+content="([^"]*)""#)
        .expect("valid og regex")
});

const VIDEO_KEYS: &[&str] = &["video_url", "contentUrl", "playback_url"];

pub fn shortcode(url: &str) -> Option<String> {
    SHORTCODE_RE
        .captures(url)
        .map(|captures| captures[1].to_string())
}

pub fn embed_urls(code: &str) -> Vec<String> {
    vec![
        format!("https://www.instagram.com/p/{code}/embed/captioned/"),
        format!("https://www.instagram.com/p/{code}/embed/"),
    ]
}

pub fn is_manifest(media_url: &str) -> bool {
    let path = media_url.split('?').next().unwrap_or(media_url).to_lowercase();
    path.ends_with(".m3u8") || path.ends_with(".mpd")
}

/// Undoes the JSON and HTML escaping media URLs carry inside page source.
pub fn unescape_media_url(raw: &str) -> String {
    let unescaped = serde_json::from_str::<String>(&format!("\"{raw}\""))
        .unwrap_or_else(|_| raw.replace("\\/", "/"));
    unescaped.replace("&amp;", "&")
}

/// First video URL matched by the ordered pattern list.
pub fn video_url_in_html(html: &str) -> Option<String> {
    HTML_PATTERNS.iter().find_map(|pattern| {
        pattern
            .captures_iter(html)
            .map(|captures| unescape_media_url(&captures[1]))
            .find(|candidate| candidate.starts_with("http"))
    })
}

/// Searches every JSON script block in the page.
pub fn video_url_in_json_blocks(html: &str) -> Option<String> {
    JSON_SCRIPT_RE.captures_iter(html).find_map(|captures| {
        let block: Value = serde_json::from_str(captures[1].trim()).ok()?;
        search_video_url(&block)
    })
}

/// Depth-first search for a video URL anywhere inside a JSON document.
pub fn search_video_url(value: &Value) -> Option<String> {
    match value {
        Value::Object(map) => {
            for key in VIDEO_KEYS {
                if let Some(Value::String(url)) = map.get(*key)
                    && url.starts_with("http")
                {
                    return Some(url.clone());
                }
            }
            if let Some(Value::Array(versions)) = map.get("video_versions")
                && let Some(url) = versions
                    .iter()
                    .find_map(|version| version.get("url").and_then(Value::as_str))
            {
                return Some(url.to_string());
            }
            map.values().find_map(search_video_url)
        }
        Value::Array(items) => items.iter().find_map(search_video_url),
        _ => None,
    }
}

pub fn page_meta(html: &str) -> ScrapedMedia {
    let grab = |re: &Regex| {
        re.captures(html)
            .map(|captures| unescape_media_url(&captures[1]))
            .filter(|text| !text.is_empty())
    };
    ScrapedMedia {
        title: grab(&OG_TITLE_RE),
        caption: grab(&OG_DESCRIPTION_RE),
        ..ScrapedMedia::default()
    }
}

fn oembed_meta(body: &Value) -> ScrapedMedia {
    let text = |key: &str| body.get(key).and_then(Value::as_str).map(str::to_string);
    ScrapedMedia {
        title: text("title"),
        owner: text("author_name"),
        ..ScrapedMedia::default()
    }
}

/// Video URL and post details out of a GraphQL post response.
pub fn graphql_media(body: &Value) -> Option<ScrapedMedia> {
    let media = body
        .pointer("/data/xdt_shortcode_media")
        .or_else(|| body.pointer("/data/shortcode_media"))?;
    let media_url = media
        .get("video_url")
        .and_then(Value::as_str)
        .map(str::to_string)
        .or_else(|| {
            media
                .pointer("/edge_sidecar_to_children/edges")
                .and_then(Value::as_array)?
                .iter()
                .find_map(|edge| edge.pointer("/node/video_url").and_then(Value::as_str))
                .map(str::to_string)
        })?;
    let caption = media
        .pointer("/edge_media_to_caption/edges/0/node/text")
        .and_then(Value::as_str)
        .map(str::to_string);
    let owner = media
        .pointer("/owner/username")
        .and_then(Value::as_str)
        .map(str::to_string);
    Some(ScrapedMedia {
        media_url,
        title: caption.as_ref().map(|text| text.lines().next().unwrap_or("").to_string()),
        owner,
        caption,
    })
}

fn csrf_token(cookie_header: &str) -> Option<&str> {
    cookie_header
        .split("; ")
        .find_map(|pair| pair.strip_prefix("csrftoken="))
        .filter(|token| !token.is_empty())
}
