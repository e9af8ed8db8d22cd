//! The strategy ladder.
//!
//! One run walks an ordered list of strategies. Each strategy is retried
//! with exponential backoff while the extractor reports rate limiting, an
//! authentication failure aborts the whole run, and any other failure moves
//! on to the next strategy. Only the final outcome is surfaced as a
//! [`FetchError`]; every attempt is recorded in the returned trace.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tempfile::TempDir;
use tracing::{debug, info, warn};
use walkdir::WalkDir;

use crate::config::OrchestratorTuning;
use crate::credentials::CredentialStore;
use crate::error::FetchError;
use crate::extractor::{Extractor, RunError, ToolOutput};
use crate::failure::{AttemptFailure, FailureKind, classify_failure, truncate_detail};
use crate::platform::PlatformId;
use crate::scrape::{FallbackSource, ScrapeRequest, ScrapedMedia};

pub const WORK_DIR_PREFIX: &str = "clipfetch-";
const MEDIA_EXTENSIONS: &[&str] = &["mp4", "mov", "webm", "mkv"];
const MIN_RETRY_HINT: Duration = Duration::from_secs(30);
const REQUEST_SLEEP_SECS: &str = "2";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExtractionMode {
    Info,
    Download,
    /// Direct media URL without downloading, on platforms that rate limit
    /// aggressively. Elsewhere it behaves like `Download`.
    Fast,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExtractionRequest {
    pub url: String,
    pub platform: PlatformId,
    pub mode: ExtractionMode,
}

impl ExtractionRequest {
    pub fn new(url: impl Into<String>, platform: PlatformId, mode: ExtractionMode) -> Self {
        Self {
            url: url.into(),
            platform,
            mode,
        }
    }

    pub fn effective_mode(&self) -> ExtractionMode {
        match self.mode {
            ExtractionMode::Fast if !self.platform.rate_limits_aggressively() => {
                ExtractionMode::Download
            }
            mode => mode,
        }
    }

    fn needs_work_dir(&self) -> bool {
        self.effective_mode() == ExtractionMode::Download
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StrategyKind {
    Primary,
    Alternate,
    PageScrape,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Strategy {
    pub kind: StrategyKind,
    pub user_agent: &'static str,
    pub headers: Vec<(String, String)>,
}

impl Strategy {
    fn force_generic_extractor(&self) -> bool {
        self.kind == StrategyKind::Alternate
    }
}

/// Ordered strategies for `platform`. The alternate strategy needs a
/// secondary user agent, the page scrape needs a fallback source and only
/// applies to Instagram.
pub fn build_ladder(platform: PlatformId, has_fallback: bool) -> Vec<Strategy> {
    let mut ladder = vec![Strategy {
        kind: StrategyKind::Primary,
        user_agent: platform.primary_user_agent(),
        headers: platform.standard_headers(),
    }];
    if let Some(user_agent) = platform.secondary_user_agent() {
        ladder.push(Strategy {
            kind: StrategyKind::Alternate,
            user_agent,
            headers: platform.broad_headers(),
        });
    }
    if has_fallback && platform == PlatformId::Instagram {
        ladder.push(Strategy {
            kind: StrategyKind::PageScrape,
            user_agent: platform.primary_user_agent(),
            headers: platform.broad_headers(),
        });
    }
    ladder
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthArgs {
    Cookies(PathBuf),
    Password { username: String, password: String },
    Anonymous,
}

/// Cookie jar first, stored credentials second.
pub fn select_auth(credentials: &CredentialStore, platform: PlatformId) -> AuthArgs {
    if let Some(path) = credentials.usable_cookie_path(platform) {
        return AuthArgs::Cookies(path);
    }
    match credentials.get_credential(platform) {
        Some(credential) => AuthArgs::Password {
            username: credential.username,
            password: credential.password,
        },
        None => AuthArgs::Anonymous,
    }
}

/// Arguments for one extractor invocation. `output_dir` is set for
/// downloading attempts only.
pub fn build_invocation(
    request: &ExtractionRequest,
    strategy: &Strategy,
    auth: &AuthArgs,
    output_dir: Option<&Path>,
    tuning: &OrchestratorTuning,
) -> Vec<String> {
    let mut args: Vec<String> = vec![
        "--dump-json".into(),
        "--no-playlist".into(),
        "--no-warnings".into(),
        "--user-agent".into(),
        strategy.user_agent.into(),
    ];
    for (name, value) in &strategy.headers {
        args.push("--add-header".into());
        args.push(format!("{name}:{value}"));
    }
    args.extend([
        "--retries".to_string(),
        tuning.tool_retries.to_string(),
        "--socket-timeout".to_string(),
        tuning.socket_timeout_secs.to_string(),
    ]);
    if request.platform.rate_limits_aggressively() {
        args.push("--sleep-requests".to_string());
        args.push(REQUEST_SLEEP_SECS.to_string());
    }
    if strategy.force_generic_extractor() {
        args.push("--force-generic-extractor".into());
    }
    match auth {
        AuthArgs::Cookies(path) => {
            args.push("--cookies".into());
            args.push(path.to_string_lossy().into_owned());
        }
        AuthArgs::Password { username, password } => {
            args.extend([
                "--username".to_string(),
                username.clone(),
                "--password".to_string(),
                password.clone(),
            ]);
        }
        AuthArgs::Anonymous => {}
    }
    match output_dir {
        Some(dir) => {
            args.push("--no-simulate".into());
            args.push("-o".into());
            args.push(dir.join("%(title)s.%(ext)s").to_string_lossy().into_owned());
        }
        None => args.push("--skip-download".into()),
    }
    args.push(request.url.clone());
    args
}

/// Delay before attempt `retry` (0-based) of one strategy.
pub fn backoff_delay(base: Duration, retry: u32, platform: PlatformId) -> Duration {
    if retry == 0 || !platform.rate_limits_aggressively() {
        return Duration::ZERO;
    }
    base.saturating_mul(1u32 << (retry - 1).min(16))
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DownloadedVideo {
    pub filename: String,
    pub size_bytes: u64,
    pub size_mb: f64,
    pub local_path: String,
    pub title: String,
    pub owner: String,
    pub caption: String,
    pub platform: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DirectMedia {
    pub media_url: String,
    pub title: String,
    pub owner: String,
    pub caption: String,
    pub duration: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub thumbnail: Option<String>,
    pub platform: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VideoInfo {
    pub title: String,
    pub uploader: String,
    pub duration: f64,
    pub view_count: u64,
    pub like_count: u64,
    pub upload_date: String,
    pub description: String,
    pub platform: String,
}

/// The `video_info` payload. Variants are distinguished by their required
/// fields when read back from the cache.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum VideoDetails {
    Downloaded(DownloadedVideo),
    Direct(DirectMedia),
    Info(VideoInfo),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExtractionResult {
    pub video_info: VideoDetails,
    pub local_file_path: Option<PathBuf>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AttemptOutcome {
    Succeeded,
    Failed(FailureKind),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AttemptRecord {
    pub strategy: StrategyKind,
    pub retry: u32,
    pub delay_before: Duration,
    pub outcome: AttemptOutcome,
}

#[derive(Debug)]
pub struct ExtractionOutcome {
    pub result: Result<ExtractionResult, FetchError>,
    pub attempts: Vec<AttemptRecord>,
}

pub struct Orchestrator {
    extractor: Arc<dyn Extractor>,
    fallback: Option<Arc<dyn FallbackSource>>,
    credentials: Arc<CredentialStore>,
    download_root: PathBuf,
    tuning: OrchestratorTuning,
}

impl Orchestrator {
    pub fn new(
        extractor: Arc<dyn Extractor>,
        fallback: Option<Arc<dyn FallbackSource>>,
        credentials: Arc<CredentialStore>,
        download_root: impl Into<PathBuf>,
        tuning: OrchestratorTuning,
    ) -> Self {
        Self {
            extractor,
            fallback,
            credentials,
            download_root: download_root.into(),
            tuning,
        }
    }

    pub fn credentials(&self) -> &Arc<CredentialStore> {
        &self.credentials
    }

    pub fn download_root(&self) -> &Path {
        &self.download_root
    }

    pub fn extractor(&self) -> &Arc<dyn Extractor> {
        &self.extractor
    }

    pub async fn run(&self, request: &ExtractionRequest) -> ExtractionOutcome {
        let ladder = build_ladder(request.platform, self.fallback.is_some());
        let base = self
            .tuning
            .backoff_base(request.mode == ExtractionMode::Fast);
        let max_attempts = self.tuning.attempts_per_strategy();
        let mut attempts = Vec::new();
        let mut failures: Vec<AttemptFailure> = Vec::new();

        for strategy in &ladder {
            let mut retry = 0;
            loop {
                let delay = backoff_delay(base, retry, request.platform);
                if !delay.is_zero() {
                    debug!(?delay, retry, strategy = ?strategy.kind, "backing off");
                    tokio::time::sleep(delay).await;
                }
                let attempt = self.attempt(request, strategy).await;
                let outcome = match &attempt {
                    Ok(_) => AttemptOutcome::Succeeded,
                    Err(failure) => AttemptOutcome::Failed(failure.kind),
                };
                attempts.push(AttemptRecord {
                    strategy: strategy.kind,
                    retry,
                    delay_before: delay,
                    outcome,
                });
                let failure = match attempt {
                    Ok(result) => {
                        info!(url = %request.url, strategy = ?strategy.kind, attempts = attempts.len(), "extraction succeeded");
                        return ExtractionOutcome {
                            result: Ok(result),
                            attempts,
                        };
                    }
                    Err(failure) => failure,
                };
                warn!(
                    url = %request.url,
                    strategy = ?strategy.kind,
                    retry,
                    kind = ?failure.kind,
                    detail = %failure.detail,
                    "extraction attempt failed"
                );
                match failure.kind {
                    FailureKind::RateLimited => {
                        retry += 1;
                        if retry >= max_attempts {
                            let hint = backoff_delay(base, retry, request.platform)
                                .max(MIN_RETRY_HINT);
                            return ExtractionOutcome {
                                result: Err(FetchError::RateLimited {
                                    platform: request.platform,
                                    retry_after_secs: hint.as_secs(),
                                }),
                                attempts,
                            };
                        }
                    }
                    FailureKind::AuthRequired => {
                        return ExtractionOutcome {
                            result: Err(FetchError::AuthRequired {
                                platform: request.platform,
                                has_cookies: self.credentials.has_cookies(request.platform),
                            }),
                            attempts,
                        };
                    }
                    FailureKind::Timeout | FailureKind::ToolMissing | FailureKind::Other => {
                        failures.push(failure);
                        break;
                    }
                }
            }
        }

        ExtractionOutcome {
            result: Err(exhausted_error(&failures, &self.tuning)),
            attempts,
        }
    }

    async fn attempt(
        &self,
        request: &ExtractionRequest,
        strategy: &Strategy,
    ) -> Result<ExtractionResult, AttemptFailure> {
        let work_dir = if request.needs_work_dir() {
            Some(self.create_work_dir()?)
        } else {
            None
        };
        let result = match strategy.kind {
            StrategyKind::PageScrape => self.scrape(request, strategy, work_dir.as_ref()).await,
            StrategyKind::Primary | StrategyKind::Alternate => {
                self.invoke(request, strategy, work_dir.as_ref()).await
            }
        }?;
        if let Some(dir) = work_dir {
            let kept = dir.keep();
            debug!(dir = %kept.display(), "keeping download directory");
        }
        Ok(result)
    }

    fn create_work_dir(&self) -> Result<TempDir, AttemptFailure> {
        fs::create_dir_all(&self.download_root)
            .and_then(|()| {
                tempfile::Builder::new()
                    .prefix(WORK_DIR_PREFIX)
                    .tempdir_in(&self.download_root)
            })
            .map_err(|err| {
                AttemptFailure::new(
                    FailureKind::Other,
                    &format!("creating work directory: {err}"),
                )
            })
    }

    async fn invoke(
        &self,
        request: &ExtractionRequest,
        strategy: &Strategy,
        work_dir: Option<&TempDir>,
    ) -> Result<ExtractionResult, AttemptFailure> {
        let auth = select_auth(&self.credentials, request.platform);
        let args = build_invocation(
            request,
            strategy,
            &auth,
            work_dir.map(TempDir::path),
            &self.tuning,
        );
        let output = self
            .extractor
            .run(&args, self.tuning.attempt_timeout())
            .await
            .map_err(run_failure)?;
        if !output.success {
            return Err(output_failure(&output));
        }
        let metadata = parse_dump(&output.stdout).ok_or_else(|| {
            AttemptFailure::new(
                FailureKind::Other,
                "extractor succeeded but printed no JSON metadata",
            )
        })?;
        let platform = request.platform.display_name();

        match (request.effective_mode(), work_dir) {
            (ExtractionMode::Download, Some(dir)) => {
                let file = find_media_file(dir.path()).ok_or_else(|| {
                    AttemptFailure::new(
                        FailureKind::Other,
                        "extractor finished without producing a media file",
                    )
                })?;
                let meta = MediaMeta::from_metadata(&metadata);
                downloaded_result(&file, meta, platform)
            }
            (ExtractionMode::Fast, _) => {
                let media_url = direct_media_url(&metadata).ok_or_else(|| {
                    AttemptFailure::new(FailureKind::Other, "metadata has no direct media URL")
                })?;
                let meta = MediaMeta::from_metadata(&metadata);
                Ok(ExtractionResult {
                    video_info: VideoDetails::Direct(DirectMedia {
                        media_url,
                        title: meta.title,
                        owner: meta.owner,
                        caption: meta.caption,
                        duration: number(&metadata, "duration"),
                        thumbnail: text(&metadata, "thumbnail"),
                        platform: platform.to_string(),
                    }),
                    local_file_path: None,
                })
            }
            _ => Ok(ExtractionResult {
                video_info: VideoDetails::Info(video_info(&metadata, platform)),
                local_file_path: None,
            }),
        }
    }

    async fn scrape(
        &self,
        request: &ExtractionRequest,
        strategy: &Strategy,
        work_dir: Option<&TempDir>,
    ) -> Result<ExtractionResult, AttemptFailure> {
        let Some(fallback) = &self.fallback else {
            return Err(AttemptFailure::new(
                FailureKind::Other,
                "no page scrape fallback configured",
            ));
        };
        let scraped = fallback
            .fetch(ScrapeRequest {
                url: request.url.clone(),
                user_agent: strategy.user_agent.to_string(),
                headers: strategy.headers.clone(),
                cookie_header: self.credentials.cookie_header(request.platform),
                work_dir: work_dir.map(|dir| dir.path().to_path_buf()),
            })
            .await?;
        let platform = request.platform.display_name();
        let meta = MediaMeta::from_scraped(&scraped.media);

        match (request.effective_mode(), scraped.file) {
            (ExtractionMode::Download, Some(file)) => downloaded_result(&file, meta, platform),
            (ExtractionMode::Download, None) => Err(AttemptFailure::new(
                FailureKind::Other,
                "page scrape returned no file",
            )),
            (ExtractionMode::Fast, _) => Ok(ExtractionResult {
                video_info: VideoDetails::Direct(DirectMedia {
                    media_url: scraped.media.media_url,
                    title: meta.title,
                    owner: meta.owner,
                    caption: meta.caption,
                    duration: 0.0,
                    thumbnail: None,
                    platform: platform.to_string(),
                }),
                local_file_path: None,
            }),
            (ExtractionMode::Info, _) => Ok(ExtractionResult {
                video_info: VideoDetails::Info(VideoInfo {
                    title: meta.title,
                    uploader: meta.owner,
                    duration: 0.0,
                    view_count: 0,
                    like_count: 0,
                    upload_date: String::new(),
                    description: meta.caption,
                    platform: platform.to_string(),
                }),
                local_file_path: None,
            }),
        }
    }

    /// Runs the extractor in authentication-only mode so it writes a cookie
    /// jar for `platform` from the stored credentials.
    pub async fn login(&self, platform: PlatformId) -> Result<PathBuf, FetchError> {
        let credential = self
            .credentials
            .get_credential(platform)
            .ok_or(FetchError::MissingCredentials(platform))?;
        let cookie_path = self.credentials.cookie_path(platform).ok_or_else(|| {
            FetchError::Io(io::Error::other("credential storage has no local files"))
        })?;
        if let Some(parent) = cookie_path.parent() {
            fs::create_dir_all(parent)?;
        }
        let args = vec![
            "--cookies".to_string(),
            cookie_path.to_string_lossy().into_owned(),
            "--username".to_string(),
            credential.username.clone(),
            "--password".to_string(),
            credential.password.clone(),
            "--user-agent".to_string(),
            platform.primary_user_agent().to_string(),
            "--skip-download".to_string(),
            "--no-warnings".to_string(),
            platform.login_url().to_string(),
        ];
        let output = self
            .extractor
            .run(&args, self.tuning.attempt_timeout())
            .await
            .map_err(|err| match err {
                RunError::NotFound(_) => FetchError::ToolNotFound,
                RunError::TimedOut(limit) => FetchError::Timeout(limit.as_secs()),
                RunError::Io(err) => FetchError::Io(err),
            })?;

        // The jar may predate this run and yt-dlp rewrites it on failure too.
        if output.success && self.credentials.has_cookies(platform) {
            info!(%platform, path = %cookie_path.display(), "login produced cookie jar");
            return Ok(cookie_path);
        }
        let failure = if output.success {
            AttemptFailure::new(FailureKind::Other, "extractor exited cleanly but wrote no cookie jar")
        } else {
            warn!(%platform, stderr = %output.stderr.trim(), "login run failed");
            output_failure(&output)
        };
        Err(match failure.kind {
            FailureKind::RateLimited => FetchError::RateLimited {
                platform,
                retry_after_secs: MIN_RETRY_HINT.as_secs(),
            },
            FailureKind::AuthRequired => FetchError::AuthRequired {
                platform,
                has_cookies: false,
            },
            _ => FetchError::ExtractionFailed(format!(
                "login did not produce cookies: {}",
                failure.detail
            )),
        })
    }
}

fn exhausted_error(failures: &[AttemptFailure], tuning: &OrchestratorTuning) -> FetchError {
    if !failures.is_empty() && failures.iter().all(|f| f.kind == FailureKind::ToolMissing) {
        return FetchError::ToolNotFound;
    }
    if !failures.is_empty() && failures.iter().all(|f| f.kind == FailureKind::Timeout) {
        return FetchError::Timeout(tuning.attempt_timeout_secs);
    }
    let detail = failures
        .last()
        .map(|failure| failure.detail.clone())
        .unwrap_or_else(|| "no extraction strategy applies".to_string());
    FetchError::ExtractionFailed(truncate_detail(&detail, crate::failure::MAX_DETAIL_CHARS))
}

fn run_failure(err: RunError) -> AttemptFailure {
    match err {
        RunError::NotFound(path) => AttemptFailure::new(
            FailureKind::ToolMissing,
            &format!("{} was not found", path.display()),
        ),
        RunError::TimedOut(limit) => AttemptFailure::new(
            FailureKind::Timeout,
            &format!("extractor timed out after {}s", limit.as_secs()),
        ),
        RunError::Io(err) => AttemptFailure::new(FailureKind::Other, &err.to_string()),
    }
}

fn output_failure(output: &ToolOutput) -> AttemptFailure {
    let stderr = output.stderr.trim();
    if stderr.is_empty() {
        AttemptFailure::new(
            FailureKind::Other,
            &format!("extractor exited with code {:?}", output.code),
        )
    } else {
        AttemptFailure::new(classify_failure(stderr), stderr)
    }
}

/// Last line of stdout holding a JSON object.
fn parse_dump(stdout: &str) -> Option<Value> {
    stdout
        .lines()
        .rev()
        .filter(|line| line.trim_start().starts_with('{'))
        .find_map(|line| serde_json::from_str::<Value>(line).ok())
        .filter(Value::is_object)
}

fn find_media_file(dir: &Path) -> Option<PathBuf> {
    let mut files: Vec<PathBuf> = fs::read_dir(dir)
        .ok()?
        .filter_map(|entry| entry.ok().map(|entry| entry.path()))
        .filter(|path| {
            path.is_file()
                && path
                    .extension()
                    .and_then(|ext| ext.to_str())
                    .is_some_and(|ext| MEDIA_EXTENSIONS.contains(&ext.to_ascii_lowercase().as_str()))
        })
        .collect();
    files.sort();
    files.into_iter().next()
}

fn direct_media_url(metadata: &Value) -> Option<String> {
    text(metadata, "url").or_else(|| {
        metadata
            .get("requested_formats")
            .and_then(Value::as_array)?
            .iter()
            .find_map(|format| format.get("url").and_then(Value::as_str))
            .map(str::to_string)
    })
}

fn text(metadata: &Value, key: &str) -> Option<String> {
    metadata
        .get(key)
        .and_then(Value::as_str)
        .filter(|value| !value.is_empty())
        .map(str::to_string)
}

fn number(metadata: &Value, key: &str) -> f64 {
    metadata.get(key).and_then(Value::as_f64).unwrap_or(0.0)
}

fn video_info(metadata: &Value, platform: &str) -> VideoInfo {
    VideoInfo {
        title: text(metadata, "title").unwrap_or_else(|| "Unknown".to_string()),
        uploader: text(metadata, "uploader").unwrap_or_else(|| "Unknown".to_string()),
        duration: number(metadata, "duration"),
        view_count: metadata.get("view_count").and_then(Value::as_u64).unwrap_or(0),
        like_count: metadata.get("like_count").and_then(Value::as_u64).unwrap_or(0),
        upload_date: text(metadata, "upload_date").unwrap_or_default(),
        description: text(metadata, "description").unwrap_or_default(),
        platform: platform.to_string(),
    }
}

struct MediaMeta {
    title: String,
    owner: String,
    caption: String,
}

impl MediaMeta {
    fn from_metadata(metadata: &Value) -> Self {
        Self {
            title: text(metadata, "title").unwrap_or_default(),
            owner: text(metadata, "uploader")
                .or_else(|| text(metadata, "channel"))
                .or_else(|| text(metadata, "uploader_id"))
                .unwrap_or_default(),
            caption: text(metadata, "description").unwrap_or_default(),
        }
    }

    fn from_scraped(media: &ScrapedMedia) -> Self {
        Self {
            title: media.title.clone().unwrap_or_default(),
            owner: media.owner.clone().unwrap_or_default(),
            caption: media.caption.clone().unwrap_or_default(),
        }
    }
}

fn downloaded_result(
    file: &Path,
    meta: MediaMeta,
    platform: &str,
) -> Result<ExtractionResult, AttemptFailure> {
    let size_bytes = fs::metadata(file)
        .map_err(|err| AttemptFailure::new(FailureKind::Other, &err.to_string()))?
        .len();
    let filename = file
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_default();
    Ok(ExtractionResult {
        video_info: VideoDetails::Downloaded(DownloadedVideo {
            filename,
            size_bytes,
            size_mb: size_in_mb(size_bytes),
            local_path: file.to_string_lossy().into_owned(),
            title: meta.title,
            owner: meta.owner,
            caption: meta.caption,
            platform: platform.to_string(),
        }),
        local_file_path: Some(file.to_path_buf()),
    })
}

/// Megabytes rounded to two decimals.
pub fn size_in_mb(bytes: u64) -> f64 {
    (bytes as f64 / (1024.0 * 1024.0) * 100.0).round() / 100.0
}

/// Removes work directories under `root` older than `max_age`. Returns how
/// many were removed.
pub fn sweep_stale_downloads(root: &Path, max_age: Duration) -> usize {
    let now = SystemTime::now();
    let mut removed = 0;
    for entry in WalkDir::new(root)
        .min_depth(1)
        .max_depth(1)
        .into_iter()
        .filter_map(Result::ok)
    {
        let is_work_dir = entry.file_type().is_dir()
            && entry
                .file_name()
                .to_string_lossy()
                .starts_with(WORK_DIR_PREFIX);
        if !is_work_dir {
            continue;
        }
        let Some(age) = entry
            .metadata()
            .ok()
            .and_then(|meta| meta.modified().ok())
            .and_then(|modified| now.duration_since(modified).ok())
        else {
            continue;
        };
        if age < max_age {
            continue;
        }
        match fs::remove_dir_all(entry.path()) {
            Ok(()) => removed += 1,
            Err(err) => warn!(path = %entry.path().display(), error = %err, "failed to remove stale download"),
        }
    }
    if removed > 0 {
        info!(removed, root = %root.display(), "swept stale downloads");
    }
    removed
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::scrape::ScrapeResult;
    use crate::storage::{FsStorage, MemoryStorage};
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use std::collections::VecDeque;
    use tempfile::tempdir;

    const INFO_JSON: &str = r#"{"title":"Clip","uploader":"creator","duration":12.5,"view_count":7,"like_count":3,"upload_date":"20240101","description":"caption text","url":"https://cdn.example/direct.mp4"}"#;

    #[derive(Clone, Copy)]
    pub(crate) enum Scripted {
        Ok(&'static str),
        Fail(&'static str),
        Missing,
        Timeout,
    }

    /// Extractor double that replays scripted results and records every
    /// argument list. When out of script it repeats the last entry.
    pub(crate) struct FakeExtractor {
        script: Mutex<VecDeque<Scripted>>,
        pub(crate) calls: Mutex<Vec<Vec<String>>>,
    }

    impl FakeExtractor {
        pub(crate) fn new(script: Vec<Scripted>) -> Arc<Self> {
            Arc::new(Self {
                script: Mutex::new(script.into()),
                calls: Mutex::new(Vec::new()),
            })
        }

        pub(crate) fn call_count(&self) -> usize {
            self.calls.lock().len()
        }
    }

    #[async_trait]
    impl Extractor for FakeExtractor {
        fn program(&self) -> &Path {
            Path::new("yt-dlp")
        }

        async fn run(&self, args: &[String], deadline: Duration) -> Result<ToolOutput, RunError> {
            self.calls.lock().push(args.to_vec());
            let step = {
                let mut script = self.script.lock();
                if script.len() > 1 {
                    script.pop_front()
                } else {
                    script.front().copied()
                }
            };
            match step {
                Some(Scripted::Ok(stdout)) => {
                    if let Some(pos) = args.iter().position(|arg| arg == "-o")
                        && let Some(dir) = Path::new(&args[pos + 1]).parent()
                    {
                        fs::write(dir.join("Clip.mp4"), vec![0u8; 2048]).unwrap();
                    }
                    if let Some(pos) = args.iter().position(|arg| arg == "--cookies") {
                        fs::write(
                            &args[pos + 1],
                            "# Netscape HTTP Cookie File\n.instagram.com\tTRUE\t/\tTRUE\t0\tsessionid\tfresh\n",
                        )
                        .unwrap();
                    }
                    Ok(ToolOutput {
                        success: true,
                        code: Some(0),
                        stdout: format!("{stdout}\n"),
                        stderr: String::new(),
                    })
                }
                Some(Scripted::Fail(stderr)) => Ok(ToolOutput {
                    success: false,
                    code: Some(1),
                    stdout: String::new(),
                    stderr: stderr.to_string(),
                }),
                Some(Scripted::Missing) | None => Err(RunError::NotFound(PathBuf::from("yt-dlp"))),
                Some(Scripted::Timeout) => Err(RunError::TimedOut(deadline)),
            }
        }
    }

    struct FakeFallback {
        media_url: &'static str,
    }

    #[async_trait]
    impl FallbackSource for FakeFallback {
        async fn fetch(&self, request: ScrapeRequest) -> Result<ScrapeResult, AttemptFailure> {
            let file = match &request.work_dir {
                Some(dir) => {
                    let path = dir.join("scraped.mp4");
                    fs::write(&path, b"scraped").unwrap();
                    Some(path)
                }
                None => None,
            };
            Ok(ScrapeResult {
                media: ScrapedMedia {
                    media_url: self.media_url.to_string(),
                    owner: Some("scraped_owner".to_string()),
                    ..ScrapedMedia::default()
                },
                file,
            })
        }
    }

    /// Fallback double that replays scripted outcomes, repeating the last one.
    struct ScriptedFallback {
        script: Mutex<VecDeque<Result<(), AttemptFailure>>>,
        calls: Mutex<usize>,
    }

    impl ScriptedFallback {
        fn new(script: Vec<Result<(), AttemptFailure>>) -> Arc<Self> {
            Arc::new(Self {
                script: Mutex::new(script.into()),
                calls: Mutex::new(0),
            })
        }
    }

    #[async_trait]
    impl FallbackSource for ScriptedFallback {
        async fn fetch(&self, request: ScrapeRequest) -> Result<ScrapeResult, AttemptFailure> {
            *self.calls.lock() += 1;
            let step = {
                let mut script = self.script.lock();
                if script.len() > 1 {
                    script.pop_front()
                } else {
                    script.front().cloned()
                }
            };
            match step {
                Some(Ok(())) => {
                    FakeFallback { media_url: "https://cdn.example/scraped.mp4" }
                        .fetch(request)
                        .await
                }
                Some(Err(failure)) => Err(failure),
                None => Err(AttemptFailure::new(FailureKind::Other, "empty script")),
            }
        }
    }

    pub(crate) fn memory_credentials() -> Arc<CredentialStore> {
        Arc::new(CredentialStore::new(Arc::new(MemoryStorage::new())))
    }

    fn orchestrator(
        extractor: Arc<FakeExtractor>,
        credentials: Arc<CredentialStore>,
        download_root: &Path,
    ) -> Orchestrator {
        Orchestrator::new(
            extractor,
            None,
            credentials,
            download_root,
            OrchestratorTuning::default(),
        )
    }

    fn work_dirs(root: &Path) -> Vec<PathBuf> {
        fs::read_dir(root)
            .map(|entries| entries.filter_map(|e| e.ok().map(|e| e.path())).collect())
            .unwrap_or_default()
    }

    #[test]
    fn ladder_depends_on_platform() {
        let kinds = |platform, fallback| {
            build_ladder(platform, fallback)
                .into_iter()
                .map(|strategy| strategy.kind)
                .collect::<Vec<_>>()
        };
        assert_eq!(
            kinds(PlatformId::Instagram, true),
            vec![StrategyKind::Primary, StrategyKind::Alternate, StrategyKind::PageScrape]
        );
        assert_eq!(
            kinds(PlatformId::Instagram, false),
            vec![StrategyKind::Primary, StrategyKind::Alternate]
        );
        assert_eq!(kinds(PlatformId::YouTube, true), vec![StrategyKind::Primary]);
        assert_eq!(
            kinds(PlatformId::TikTok, true),
            vec![StrategyKind::Primary, StrategyKind::Alternate]
        );
    }

    #[test]
    fn invocation_flags_follow_mode_and_strategy() {
        let tuning = OrchestratorTuning::default();
        let ladder = build_ladder(PlatformId::Instagram, false);
        let info = ExtractionRequest::new("https://instagram.com/p/x", PlatformId::Instagram, ExtractionMode::Info);
        let args = build_invocation(&info, &ladder[0], &AuthArgs::Anonymous, None, &tuning);
        assert!(args.contains(&"--skip-download".to_string()));
        assert!(args.contains(&"--sleep-requests".to_string()));
        assert!(!args.contains(&"-o".to_string()));
        assert!(!args.contains(&"--force-generic-extractor".to_string()));
        assert_eq!(args.last().unwrap(), "https://instagram.com/p/x");

        let dir = Path::new("/tmp/clipfetch-x");
        let download = ExtractionRequest { mode: ExtractionMode::Download, ..info };
        let args = build_invocation(&download, &ladder[1], &AuthArgs::Anonymous, Some(dir), &tuning);
        assert!(args.contains(&"--no-simulate".to_string()));
        assert!(args.contains(&"--force-generic-extractor".to_string()));
        assert!(args.contains(&"/tmp/clipfetch-x/%(title)s.%(ext)s".to_string()));
        assert!(args.contains(&format!("X-IG-App-ID:{}", crate::platform::INSTAGRAM_APP_ID)));

        let youtube = ExtractionRequest::new("https://youtu.be/a", PlatformId::YouTube, ExtractionMode::Info);
        let yt_ladder = build_ladder(PlatformId::YouTube, false);
        let args = build_invocation(&youtube, &yt_ladder[0], &AuthArgs::Anonymous, None, &tuning);
        assert!(!args.contains(&"--sleep-requests".to_string()));
    }

    #[test]
    fn backoff_only_on_rate_limit_prone_platform() {
        let base = Duration::from_secs(1);
        let delays: Vec<_> = (0..5)
            .map(|retry| backoff_delay(base, retry, PlatformId::Instagram))
            .collect();
        assert_eq!(delays[0], Duration::ZERO);
        assert_eq!(delays[1], Duration::from_secs(1));
        assert_eq!(delays[3], Duration::from_secs(4));
        assert!(delays.windows(2).all(|pair| pair[0] <= pair[1]));
        assert_eq!(backoff_delay(base, 3, PlatformId::YouTube), Duration::ZERO);
    }

    #[tokio::test(start_paused = true)]
    async fn rate_limits_back_off_then_give_up() {
        let dir = tempdir().unwrap();
        let extractor = FakeExtractor::new(vec![Scripted::Fail("ERROR: HTTP Error 429: Too Many Requests")]);
        let orchestrator = orchestrator(extractor.clone(), memory_credentials(), dir.path());
        let request = ExtractionRequest::new("https://www.instagram.com/reel/abc/", PlatformId::Instagram, ExtractionMode::Info);

        let started = tokio::time::Instant::now();
        let outcome = orchestrator.run(&request).await;
        let elapsed = started.elapsed();

        let err = outcome.result.unwrap_err();
        assert_eq!(err.kind(), "RATE_LIMITED");
        let FetchError::RateLimited { retry_after_secs, .. } = err else { unreachable!() };
        assert!(retry_after_secs >= 30);

        assert_eq!(outcome.attempts.len(), 3);
        assert_eq!(extractor.call_count(), 3);
        let delays: Vec<_> = outcome.attempts.iter().map(|a| a.delay_before).collect();
        assert_eq!(delays, vec![Duration::ZERO, Duration::from_secs(1), Duration::from_secs(2)]);
        assert!(elapsed >= Duration::from_secs(3));
        assert!(outcome.attempts.iter().all(|a| a.strategy == StrategyKind::Primary));
    }

    #[tokio::test(start_paused = true)]
    async fn fast_mode_uses_shorter_backoff() {
        let dir = tempdir().unwrap();
        let extractor = FakeExtractor::new(vec![Scripted::Fail("Too Many Requests")]);
        let orchestrator = orchestrator(extractor, memory_credentials(), dir.path());
        let request = ExtractionRequest::new("https://www.instagram.com/reel/abc/", PlatformId::Instagram, ExtractionMode::Fast);
        let outcome = orchestrator.run(&request).await;
        let delays: Vec<_> = outcome.attempts.iter().map(|a| a.delay_before).collect();
        assert_eq!(delays, vec![Duration::ZERO, Duration::from_millis(500), Duration::from_secs(1)]);
    }

    #[tokio::test(start_paused = true)]
    async fn rate_limits_elsewhere_retry_without_delay() {
        let dir = tempdir().unwrap();
        let extractor = FakeExtractor::new(vec![Scripted::Fail("HTTP Error 429")]);
        let orchestrator = orchestrator(extractor, memory_credentials(), dir.path());
        let request = ExtractionRequest::new("https://youtu.be/abc", PlatformId::YouTube, ExtractionMode::Info);
        let started = tokio::time::Instant::now();
        let outcome = orchestrator.run(&request).await;
        assert_eq!(started.elapsed(), Duration::ZERO);
        assert_eq!(outcome.attempts.len(), 3);
        assert!(outcome.attempts.iter().all(|a| a.delay_before.is_zero()));
    }

    #[tokio::test]
    async fn rate_limit_recovers_on_retry() {
        let dir = tempdir().unwrap();
        let extractor = FakeExtractor::new(vec![Scripted::Fail("HTTP Error 429"), Scripted::Ok(INFO_JSON)]);
        let orchestrator = orchestrator(extractor, memory_credentials(), dir.path());
        let request = ExtractionRequest::new("https://www.tiktok.com/@a/video/1", PlatformId::TikTok, ExtractionMode::Info);
        let outcome = orchestrator.run(&request).await;
        let result = outcome.result.unwrap();
        let VideoDetails::Info(info) = result.video_info else { panic!("expected info") };
        assert_eq!(info.title, "Clip");
        assert_eq!(info.platform, "TikTok");
        assert_eq!(outcome.attempts[1].retry, 1);
        assert_eq!(outcome.attempts[1].outcome, AttemptOutcome::Succeeded);
    }

    #[tokio::test]
    async fn hard_failures_exhaust_ladder_once_per_strategy() {
        let dir = tempdir().unwrap();
        let extractor = FakeExtractor::new(vec![
            Scripted::Fail("ERROR: Unsupported URL"),
            Scripted::Fail("ERROR: final failure text"),
        ]);
        let orchestrator = orchestrator(extractor.clone(), memory_credentials(), dir.path());
        let request = ExtractionRequest::new("https://www.tiktok.com/@a/video/1", PlatformId::TikTok, ExtractionMode::Download);
        let outcome = orchestrator.run(&request).await;
        let err = outcome.result.unwrap_err();
        assert_eq!(err.kind(), "EXTRACTION_FAILED");
        assert!(err.to_string().contains("final failure text"));
        assert_eq!(outcome.attempts.len(), build_ladder(PlatformId::TikTok, false).len());
        assert_eq!(extractor.call_count(), 2);
        assert!(work_dirs(dir.path()).is_empty());
    }

    #[tokio::test]
    async fn auth_failure_aborts_ladder() {
        let dir = tempdir().unwrap();
        let extractor = FakeExtractor::new(vec![Scripted::Fail("ERROR: Sign in to confirm you're not a bot")]);
        let orchestrator = orchestrator(extractor.clone(), memory_credentials(), dir.path());
        let request = ExtractionRequest::new("https://www.instagram.com/p/abc/", PlatformId::Instagram, ExtractionMode::Info);
        let outcome = orchestrator.run(&request).await;
        let err = outcome.result.unwrap_err();
        assert!(matches!(err, FetchError::AuthRequired { has_cookies: false, .. }));
        assert_eq!(extractor.call_count(), 1);
    }

    #[tokio::test]
    async fn missing_tool_everywhere_is_tool_not_found() {
        let dir = tempdir().unwrap();
        let extractor = FakeExtractor::new(vec![Scripted::Missing]);
        let orchestrator = orchestrator(extractor, memory_credentials(), dir.path());
        let request = ExtractionRequest::new("https://fb.watch/abc", PlatformId::Facebook, ExtractionMode::Info);
        let err = orchestrator.run(&request).await.result.unwrap_err();
        assert_eq!(err.kind(), "TOOL_NOT_FOUND");
    }

    #[tokio::test]
    async fn timeouts_everywhere_is_timeout() {
        let dir = tempdir().unwrap();
        let extractor = FakeExtractor::new(vec![Scripted::Timeout]);
        let orchestrator = orchestrator(extractor, memory_credentials(), dir.path());
        let request = ExtractionRequest::new("https://x.com/a/status/1", PlatformId::Twitter, ExtractionMode::Info);
        let err = orchestrator.run(&request).await.result.unwrap_err();
        assert_eq!(err.kind(), "TIMEOUT");
        assert_eq!(err.status_code(), axum::http::StatusCode::GATEWAY_TIMEOUT);
    }

    #[tokio::test]
    async fn cookies_take_precedence_over_credentials() {
        let dir = tempdir().unwrap();
        let credentials = Arc::new(CredentialStore::new(Arc::new(FsStorage::new(dir.path().join("cookies")))));
        credentials.set_credential(PlatformId::YouTube, "user", "secret").unwrap();
        credentials
            .upload_cookie_file(PlatformId::YouTube, b"# Netscape HTTP Cookie File\n")
            .unwrap();
        let extractor = FakeExtractor::new(vec![Scripted::Ok(INFO_JSON)]);
        let orchestrator = orchestrator(extractor.clone(), credentials, &dir.path().join("downloads"));
        let request = ExtractionRequest::new("https://youtu.be/abc", PlatformId::YouTube, ExtractionMode::Info);
        orchestrator.run(&request).await.result.unwrap();

        let calls = extractor.calls.lock();
        let args = &calls[0];
        let cookie_pos = args.iter().position(|arg| arg == "--cookies").unwrap();
        assert!(args[cookie_pos + 1].ends_with("youtube_cookies.txt"));
        assert!(!args.contains(&"--username".to_string()));
        assert!(!args.contains(&"--password".to_string()));
    }

    #[tokio::test]
    async fn credentials_used_without_cookie_jar() {
        let dir = tempdir().unwrap();
        let credentials = memory_credentials();
        credentials.set_credential(PlatformId::YouTube, "user", "secret").unwrap();
        let extractor = FakeExtractor::new(vec![Scripted::Ok(INFO_JSON)]);
        let orchestrator = orchestrator(extractor.clone(), credentials, dir.path());
        let request = ExtractionRequest::new("https://youtu.be/abc", PlatformId::YouTube, ExtractionMode::Info);
        orchestrator.run(&request).await.result.unwrap();
        let args = extractor.calls.lock()[0].clone();
        assert!(args.windows(2).any(|pair| pair[0] == "--username" && pair[1] == "user"));
        assert!(!args.contains(&"--cookies".to_string()));
    }

    #[tokio::test]
    async fn download_keeps_successful_work_dir_only() {
        let dir = tempdir().unwrap();
        let extractor = FakeExtractor::new(vec![Scripted::Fail("ERROR: boom"), Scripted::Ok(INFO_JSON)]);
        let orchestrator = orchestrator(extractor, memory_credentials(), dir.path());
        let request = ExtractionRequest::new("https://www.tiktok.com/@a/video/1", PlatformId::TikTok, ExtractionMode::Download);
        let result = orchestrator.run(&request).await.result.unwrap();

        let VideoDetails::Downloaded(video) = &result.video_info else { panic!("expected download") };
        assert_eq!(video.filename, "Clip.mp4");
        assert_eq!(video.size_bytes, 2048);
        assert_eq!(video.size_mb, 0.0);
        assert_eq!(video.owner, "creator");
        assert_eq!(video.caption, "caption text");
        let local = result.local_file_path.unwrap();
        assert!(local.is_file());

        let dirs = work_dirs(dir.path());
        assert_eq!(dirs.len(), 1);
        assert!(local.starts_with(&dirs[0]));
        assert!(dirs[0].file_name().unwrap().to_string_lossy().starts_with(WORK_DIR_PREFIX));
    }

    #[tokio::test]
    async fn fast_mode_returns_direct_url_on_instagram() {
        let dir = tempdir().unwrap();
        let extractor = FakeExtractor::new(vec![Scripted::Ok(INFO_JSON)]);
        let orchestrator = orchestrator(extractor.clone(), memory_credentials(), dir.path());
        let request = ExtractionRequest::new("https://www.instagram.com/reel/abc/", PlatformId::Instagram, ExtractionMode::Fast);
        let result = orchestrator.run(&request).await.result.unwrap();
        let VideoDetails::Direct(direct) = result.video_info else { panic!("expected direct media") };
        assert_eq!(direct.media_url, "https://cdn.example/direct.mp4");
        assert_eq!(direct.duration, 12.5);
        assert!(result.local_file_path.is_none());
        assert!(work_dirs(dir.path()).is_empty());
        assert!(extractor.calls.lock()[0].contains(&"--skip-download".to_string()));
    }

    #[test]
    fn fast_mode_downloads_on_other_platforms() {
        let request = ExtractionRequest::new("https://youtu.be/a", PlatformId::YouTube, ExtractionMode::Fast);
        assert_eq!(request.effective_mode(), ExtractionMode::Download);
    }

    #[tokio::test]
    async fn page_scrape_runs_after_tool_strategies_fail() {
        let dir = tempdir().unwrap();
        let extractor = FakeExtractor::new(vec![Scripted::Fail("ERROR: unable to extract shared data")]);
        let orchestrator = Orchestrator::new(
            extractor.clone(),
            Some(Arc::new(FakeFallback { media_url: "https://cdn.example/scraped.mp4" })),
            memory_credentials(),
            dir.path(),
            OrchestratorTuning::default(),
        );
        let request = ExtractionRequest::new("https://www.instagram.com/reel/abc/", PlatformId::Instagram, ExtractionMode::Download);
        let outcome = orchestrator.run(&request).await;
        let result = outcome.result.unwrap();
        let VideoDetails::Downloaded(video) = result.video_info else { panic!("expected download") };
        assert_eq!(video.filename, "scraped.mp4");
        assert_eq!(video.owner, "scraped_owner");
        assert_eq!(outcome.attempts.len(), 3);
        assert_eq!(outcome.attempts[2].strategy, StrategyKind::PageScrape);
        assert_eq!(extractor.call_count(), 2);
        assert_eq!(work_dirs(dir.path()).len(), 1);
    }

    #[tokio::test]
    async fn login_requires_credentials() {
        let dir = tempdir().unwrap();
        let extractor = FakeExtractor::new(vec![Scripted::Ok("{}")]);
        let credentials = Arc::new(CredentialStore::new(Arc::new(FsStorage::new(dir.path()))));
        let orchestrator = orchestrator(extractor, credentials, dir.path());
        let err = orchestrator.login(PlatformId::Instagram).await.unwrap_err();
        assert_eq!(err.kind(), "MISSING_CREDENTIALS");
    }

    #[tokio::test]
    async fn login_fails_when_no_jar_is_written() {
        let dir = tempdir().unwrap();
        let extractor = FakeExtractor::new(vec![Scripted::Fail("ERROR: login required")]);
        let credentials = Arc::new(CredentialStore::new(Arc::new(FsStorage::new(dir.path()))));
        credentials.set_credential(PlatformId::Instagram, "me", "pw").unwrap();
        let orchestrator = orchestrator(extractor.clone(), credentials, dir.path());
        let err = orchestrator.login(PlatformId::Instagram).await.unwrap_err();
        assert_eq!(err.kind(), "AUTH_REQUIRED");
        let args = extractor.calls.lock()[0].clone();
        assert!(args.contains(&"--skip-download".to_string()));
        assert_eq!(args.last().unwrap(), PlatformId::Instagram.login_url());
    }

    #[tokio::test]
    async fn failed_login_with_existing_jar_is_an_error() {
        let dir = tempdir().unwrap();
        let credentials = Arc::new(CredentialStore::new(Arc::new(FsStorage::new(dir.path()))));
        credentials.set_credential(PlatformId::Instagram, "me", "wrong").unwrap();
        credentials
            .upload_cookie_file(PlatformId::Instagram, b"# Netscape HTTP Cookie File\n")
            .unwrap();
        assert!(credentials.has_cookies(PlatformId::Instagram));
        let extractor = FakeExtractor::new(vec![Scripted::Fail(
            "ERROR: [Instagram] login failed: The password you entered is incorrect",
        )]);
        let orchestrator = orchestrator(extractor, credentials, dir.path());

        let err = orchestrator.login(PlatformId::Instagram).await.unwrap_err();
        assert_eq!(err.kind(), "EXTRACTION_FAILED");
        assert!(err.to_string().contains("password you entered is incorrect"));
    }

    #[tokio::test]
    async fn login_writes_cookie_jar() {
        let dir = tempdir().unwrap();
        let credentials = Arc::new(CredentialStore::new(Arc::new(FsStorage::new(dir.path().join("cookies")))));
        credentials.set_credential(PlatformId::Instagram, "me", "pw").unwrap();
        let extractor = FakeExtractor::new(vec![Scripted::Ok("")]);
        let orchestrator = orchestrator(extractor.clone(), credentials.clone(), dir.path());

        let jar = orchestrator.login(PlatformId::Instagram).await.unwrap();
        assert!(jar.is_file());
        assert_eq!(jar, dir.path().join("cookies").join("instagram_cookies.txt"));
        assert!(credentials.has_cookies(PlatformId::Instagram));
        assert!(credentials.read_cookies(PlatformId::Instagram).unwrap().contains("sessionid"));
        let args = extractor.calls.lock()[0].clone();
        assert!(args.windows(2).any(|pair| pair[0] == "--username" && pair[1] == "me"));
    }

    #[tokio::test]
    async fn auth_failure_reports_existing_cookies() {
        let dir = tempdir().unwrap();
        let credentials = Arc::new(CredentialStore::new(Arc::new(FsStorage::new(dir.path().join("cookies")))));
        credentials
            .upload_cookie_file(PlatformId::YouTube, b"# Netscape HTTP Cookie File\n")
            .unwrap();
        let extractor = FakeExtractor::new(vec![Scripted::Fail("ERROR: Sign in to confirm you're not a bot")]);
        let orchestrator = orchestrator(extractor.clone(), credentials, &dir.path().join("downloads"));
        let request = ExtractionRequest::new("https://youtu.be/abc", PlatformId::YouTube, ExtractionMode::Info);

        let err = orchestrator.run(&request).await.result.unwrap_err();
        assert!(matches!(
            err,
            FetchError::AuthRequired { platform: PlatformId::YouTube, has_cookies: true }
        ));
        assert_eq!(extractor.call_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn rate_limited_page_scrape_backs_off_and_retries() {
        let dir = tempdir().unwrap();
        let extractor = FakeExtractor::new(vec![Scripted::Fail("ERROR: unable to extract shared data")]);
        let fallback = ScriptedFallback::new(vec![
            Err(AttemptFailure::new(FailureKind::RateLimited, "page returned 429")),
            Ok(()),
        ]);
        let orchestrator = Orchestrator::new(
            extractor.clone(),
            Some(fallback.clone() as Arc<dyn FallbackSource>),
            memory_credentials(),
            dir.path(),
            OrchestratorTuning::default(),
        );
        let request = ExtractionRequest::new("https://www.instagram.com/reel/abc/", PlatformId::Instagram, ExtractionMode::Info);

        let outcome = orchestrator.run(&request).await;
        assert!(outcome.result.is_ok());
        let steps: Vec<_> = outcome
            .attempts
            .iter()
            .map(|a| (a.strategy, a.retry, a.delay_before))
            .collect();
        assert_eq!(
            steps,
            vec![
                (StrategyKind::Primary, 0, Duration::ZERO),
                (StrategyKind::Alternate, 0, Duration::ZERO),
                (StrategyKind::PageScrape, 0, Duration::ZERO),
                (StrategyKind::PageScrape, 1, Duration::from_secs(1)),
            ]
        );
        assert_eq!(
            outcome.attempts[2].outcome,
            AttemptOutcome::Failed(FailureKind::RateLimited)
        );
        assert_eq!(*fallback.calls.lock(), 2);
        assert_eq!(extractor.call_count(), 2);
    }

    #[tokio::test]
    async fn failing_page_scrape_exhausts_ladder() {
        let dir = tempdir().unwrap();
        let extractor = FakeExtractor::new(vec![Scripted::Fail("ERROR: unable to extract shared data")]);
        let fallback = ScriptedFallback::new(vec![Err(AttemptFailure::new(
            FailureKind::Other,
            "no video in embedded page data",
        ))]);
        let orchestrator = Orchestrator::new(
            extractor.clone(),
            Some(fallback.clone() as Arc<dyn FallbackSource>),
            memory_credentials(),
            dir.path(),
            OrchestratorTuning::default(),
        );
        let request = ExtractionRequest::new("https://www.instagram.com/reel/abc/", PlatformId::Instagram, ExtractionMode::Download);

        let outcome = orchestrator.run(&request).await;
        let err = outcome.result.unwrap_err();
        assert_eq!(err.kind(), "EXTRACTION_FAILED");
        assert!(err.to_string().contains("no video in embedded page data"));
        assert_eq!(outcome.attempts.len(), 3);
        assert_eq!(outcome.attempts[2].strategy, StrategyKind::PageScrape);
        assert_eq!(*fallback.calls.lock(), 1);
        assert!(work_dirs(dir.path()).is_empty());
    }

    #[test]
    fn size_is_rounded_to_two_decimals() {
        assert_eq!(size_in_mb(1024 * 1024), 1.0);
        assert_eq!(size_in_mb(1_572_864), 1.5);
        assert_eq!(size_in_mb(1_234_567), 1.18);
    }

    #[test]
    fn parse_dump_takes_last_json_line() {
        let stdout = "[download] 100%\n{\"title\":\"a\"}\n{\"title\":\"b\"}\n";
        assert_eq!(parse_dump(stdout).unwrap()["title"], "b");
        assert!(parse_dump("no json here").is_none());
    }

    #[test]
    fn sweep_removes_only_old_work_dirs() {
        let dir = tempdir().unwrap();
        fs::create_dir_all(dir.path().join("clipfetch-old")).unwrap();
        fs::create_dir_all(dir.path().join("keep-me")).unwrap();
        assert_eq!(sweep_stale_downloads(dir.path(), Duration::from_secs(3600)), 0);
        assert_eq!(sweep_stale_downloads(dir.path(), Duration::ZERO), 1);
        assert!(!dir.path().join("clipfetch-old").exists());
        assert!(dir.path().join("keep-me").exists());
        assert_eq!(sweep_stale_downloads(&dir.path().join("missing"), Duration::ZERO), 0);
    }
}
