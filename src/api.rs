//! HTTP surface. Handlers stay thin: parse the request, call into
//! [`VideoService`] or the credential store, map failures onto [`ApiError`].

use std::path::{Path, PathBuf};
use std::sync::Arc;

use axum::{
    Json, Router,
    body::Body,
    extract::{Multipart, Query, State, rejection::JsonRejection},
    http::{HeaderMap, HeaderValue, StatusCode, header},
    response::{IntoResponse, Redirect, Response},
    routing::{get, post},
};
use mime_guess::MimeGuess;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};
use tokio::fs::File;
use tokio_util::io::ReaderStream;
use tracing::{info, warn};

use crate::cache::ResponseCache;
use crate::config::RuntimeConfig;
use crate::credentials::{AuthStatus, CookieUpload, CredentialStore};
use crate::error::FetchError;
use crate::extractor::YtDlp;
use crate::orchestrator::{ExtractionResult, Orchestrator, VideoDetails};
use crate::platform::PlatformId;
use crate::scrape::InstagramScraper;
use crate::security::resolve_served_file;
use crate::service::VideoService;
use crate::storage::FsStorage;
use crate::tool::{self, FFMPEG, ToolInfo, YTDLP};

#[derive(Clone)]
pub struct AppState {
    service: Arc<VideoService>,
}

impl AppState {
    pub fn new(service: Arc<VideoService>) -> Self {
        Self { service }
    }

    /// Wires the filesystem-backed stores, the extractor and the Instagram
    /// fallback from a resolved configuration.
    pub fn from_config(config: &RuntimeConfig) -> Self {
        let credentials = Arc::new(CredentialStore::new(Arc::new(FsStorage::new(
            config.cookie_dir(),
        ))));
        let cache = Arc::new(ResponseCache::new(
            Arc::new(FsStorage::new(config.cache_dir())),
            config.cache_expiry,
            config.cache_enabled,
        ));
        let ytdlp = tool::resolve_or_default(YTDLP, config.ytdlp_path.as_deref());
        let ffmpeg = tool::locate_program(FFMPEG, config.ffmpeg_path.as_deref());
        if ffmpeg.is_none() {
            info!("ffmpeg not found, manifest-only Instagram media cannot be remuxed");
        }
        let scraper = InstagramScraper::new(
            config.tuning.scrape_timeout(),
            ffmpeg,
            config.tuning.attempt_timeout(),
        );
        let orchestrator = Orchestrator::new(
            Arc::new(YtDlp::new(ytdlp)),
            Some(Arc::new(scraper)),
            credentials,
            config.download_dir(),
            config.tuning.clone(),
        );
        Self::new(Arc::new(VideoService::new(Arc::new(orchestrator), cache)))
    }

    pub fn service(&self) -> &Arc<VideoService> {
        &self.service
    }

    fn credentials(&self) -> &Arc<CredentialStore> {
        self.service.orchestrator().credentials()
    }

    fn download_root(&self) -> &Path {
        self.service.orchestrator().download_root()
    }

    fn ytdlp_path(&self) -> PathBuf {
        self.service.orchestrator().extractor().program().to_path_buf()
    }
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/api/get-info", post(get_info))
        .route("/api/download", post(download))
        .route("/api/fast-download", post(fast_download))
        .route("/api/instant-download", get(instant_download))
        .route("/api/upload-cookies", post(upload_cookies))
        .route("/api/set-credentials", post(set_credentials))
        .route("/api/login", post(login))
        .route("/api/clear-cache", post(clear_cache))
        .route("/api/test-ytdlp", get(test_ytdlp))
        .route("/api/status", get(status))
        .route("/download", get(download_file))
        .fallback(|| async { ApiError::not_found("endpoint not found") })
        .with_state(state)
}

/// JSON error body: `{error, kind?, solution?, has_cookies?, retry_after?}`.
#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    message: String,
    kind: Option<&'static str>,
    solution: Option<String>,
    has_cookies: Option<bool>,
    retry_after: Option<u64>,
}

impl ApiError {
    fn new(status: StatusCode, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
            kind: None,
            solution: None,
            has_cookies: None,
            retry_after: None,
        }
    }

    fn bad_request(message: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, message)
    }

    fn not_found(message: impl Into<String>) -> Self {
        let mut err = Self::new(StatusCode::NOT_FOUND, message);
        err.kind = Some("NOT_FOUND");
        err
    }

    fn internal(message: impl Into<String>) -> Self {
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, message)
    }

    pub fn status(&self) -> StatusCode {
        self.status
    }
}

impl From<FetchError> for ApiError {
    fn from(err: FetchError) -> Self {
        let mut api = Self::new(err.status_code(), err.to_string());
        api.kind = Some(err.kind());
        api.solution = err.solution();
        match err {
            FetchError::AuthRequired { has_cookies, .. } => api.has_cookies = Some(has_cookies),
            FetchError::RateLimited {
                retry_after_secs, ..
            } => api.retry_after = Some(retry_after_secs),
            _ => {}
        }
        api
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let mut body = Map::new();
        body.insert("error".into(), Value::String(self.message));
        if let Some(kind) = self.kind {
            body.insert("kind".into(), Value::String(kind.to_string()));
        }
        if let Some(solution) = self.solution {
            body.insert("solution".into(), Value::String(solution));
        }
        if let Some(has_cookies) = self.has_cookies {
            body.insert("has_cookies".into(), Value::Bool(has_cookies));
        }
        let mut headers = HeaderMap::new();
        if let Some(retry_after) = self.retry_after {
            body.insert("retry_after".into(), json!(retry_after));
            headers.insert(header::RETRY_AFTER, HeaderValue::from(retry_after));
        }
        (self.status, headers, Json(Value::Object(body))).into_response()
    }
}

pub type ApiResult<T> = Result<T, ApiError>;

#[derive(Debug, Default, Deserialize)]
pub struct UrlPayload {
    #[serde(default)]
    url: String,
}

#[derive(Debug, Serialize)]
pub struct VideoResponse {
    success: bool,
    video_info: VideoDetails,
}

impl From<ExtractionResult> for VideoResponse {
    fn from(result: ExtractionResult) -> Self {
        Self {
            success: true,
            video_info: result.video_info,
        }
    }
}

fn required_url(payload: Result<Json<UrlPayload>, JsonRejection>) -> ApiResult<String> {
    let Json(payload) = payload.map_err(|err| ApiError::bad_request(err.body_text()))?;
    let url = payload.url.trim();
    if url.is_empty() {
        return Err(ApiError::bad_request("URL is required"));
    }
    Ok(url.to_string())
}

async fn get_info(
    State(state): State<AppState>,
    payload: Result<Json<UrlPayload>, JsonRejection>,
) -> ApiResult<Json<VideoResponse>> {
    let url = required_url(payload)?;
    let result = state.service.get_info(&url).await?;
    Ok(Json(result.into()))
}

async fn download(
    State(state): State<AppState>,
    payload: Result<Json<UrlPayload>, JsonRejection>,
) -> ApiResult<Json<VideoResponse>> {
    let url = required_url(payload)?;
    let result = state.service.download(&url).await?;
    Ok(Json(result.into()))
}

async fn fast_download(
    State(state): State<AppState>,
    payload: Result<Json<UrlPayload>, JsonRejection>,
) -> ApiResult<Json<VideoResponse>> {
    let url = required_url(payload)?;
    let result = state.service.fast_download(&url).await?;
    Ok(Json(result.into()))
}

/// Downloads and redirects straight to the file, or to the media URL when
/// only a direct link was resolved.
async fn instant_download(
    State(state): State<AppState>,
    Query(query): Query<UrlPayload>,
) -> ApiResult<Redirect> {
    let url = query.url.trim();
    if url.is_empty() {
        return Err(ApiError::bad_request("URL is required"));
    }
    let result = state.service.download(url).await?;
    if let Some(path) = &result.local_file_path {
        let encoded = urlencoding::encode(&path.to_string_lossy()).into_owned();
        return Ok(Redirect::to(&format!("/download?path={encoded}")));
    }
    match result.video_info {
        VideoDetails::Direct(media) => Ok(Redirect::to(&media.media_url)),
        _ => Err(ApiError::internal("download produced no file")),
    }
}

#[derive(Debug, Deserialize)]
struct FileQuery {
    path: Option<String>,
}

async fn download_file(
    State(state): State<AppState>,
    Query(query): Query<FileQuery>,
) -> ApiResult<Response> {
    let requested = query.path.unwrap_or_default();
    let path = resolve_served_file(state.download_root(), &requested)
        .ok_or_else(|| ApiError::not_found("file not found"))?;
    stream_attachment(path).await
}

async fn stream_attachment(path: PathBuf) -> ApiResult<Response> {
    let file = File::open(&path)
        .await
        .map_err(|_| ApiError::not_found("file not found"))?;
    let size = file
        .metadata()
        .await
        .map_err(|_| ApiError::not_found("file not found"))?
        .len();

    let mut response = Body::from_stream(ReaderStream::new(file)).into_response();
    let headers = response.headers_mut();
    headers.insert(header::CONTENT_LENGTH, HeaderValue::from(size));
    if let Some(mime) = MimeGuess::from_path(&path).first()
        && let Ok(value) = HeaderValue::from_str(mime.as_ref())
    {
        headers.insert(header::CONTENT_TYPE, value);
    }
    if let Some(name) = path.file_name() {
        let name = name.to_string_lossy().replace(['"', '\\'], "_");
        if let Ok(value) = HeaderValue::from_str(&format!("attachment; filename=\"{name}\"")) {
            headers.insert(header::CONTENT_DISPOSITION, value);
        }
    }
    Ok(response)
}

fn parse_platform(value: &str) -> ApiResult<PlatformId> {
    if value.trim().is_empty() {
        return Err(ApiError::bad_request("platform is required"));
    }
    PlatformId::parse(value).ok_or_else(|| {
        ApiError::bad_request(format!("unknown platform '{}'", value.trim()))
    })
}

#[derive(Debug, Serialize)]
struct CookieUploadResponse {
    success: bool,
    platform: PlatformId,
    outcome: CookieUpload,
}

async fn upload_cookies(
    State(state): State<AppState>,
    mut multipart: Multipart,
) -> ApiResult<Json<CookieUploadResponse>> {
    let mut platform = None;
    let mut contents = None;
    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|err| ApiError::bad_request(err.body_text()))?
    {
        let name = field.name().unwrap_or_default().to_string();
        match name.as_str() {
            "platform" => {
                let text = field
                    .text()
                    .await
                    .map_err(|err| ApiError::bad_request(err.body_text()))?;
                platform = Some(text);
            }
            "file" => {
                let bytes = field
                    .bytes()
                    .await
                    .map_err(|err| ApiError::bad_request(err.body_text()))?;
                contents = Some(bytes);
            }
            _ => {}
        }
    }

    let platform = parse_platform(platform.as_deref().unwrap_or_default())?;
    let contents = contents.ok_or_else(|| ApiError::bad_request("cookie file is required"))?;
    let outcome = state
        .credentials()
        .upload_cookie_file(platform, &contents)?;
    Ok(Json(CookieUploadResponse {
        success: true,
        platform,
        outcome,
    }))
}

#[derive(Debug, Deserialize)]
struct CredentialPayload {
    #[serde(default)]
    platform: String,
    #[serde(default)]
    username: String,
    #[serde(default)]
    password: String,
}

async fn set_credentials(
    State(state): State<AppState>,
    payload: Result<Json<CredentialPayload>, JsonRejection>,
) -> ApiResult<Json<Value>> {
    let Json(payload) = payload.map_err(|err| ApiError::bad_request(err.body_text()))?;
    let platform = parse_platform(&payload.platform)?;
    if payload.username.trim().is_empty() || payload.password.is_empty() {
        return Err(ApiError::bad_request("username and password are required"));
    }
    let credential = state
        .credentials()
        .set_credential(platform, &payload.username, &payload.password)?;
    Ok(Json(json!({
        "success": true,
        "platform": platform,
        "saved_at": credential.saved_at,
    })))
}

#[derive(Debug, Deserialize)]
struct LoginPayload {
    #[serde(default)]
    platform: String,
}

async fn login(
    State(state): State<AppState>,
    payload: Result<Json<LoginPayload>, JsonRejection>,
) -> ApiResult<Json<Value>> {
    let Json(payload) = payload.map_err(|err| ApiError::bad_request(err.body_text()))?;
    let platform = parse_platform(&payload.platform)?;
    state.service.orchestrator().login(platform).await?;
    Ok(Json(json!({ "success": true, "platform": platform })))
}

async fn clear_cache(State(state): State<AppState>) -> ApiResult<Json<Value>> {
    let removed = state.service.clear_cache()?;
    Ok(Json(json!({ "success": true, "removed": removed })))
}

async fn test_ytdlp(State(state): State<AppState>) -> ApiResult<Json<Value>> {
    match tool::probe(&state.ytdlp_path()).await {
        Ok(ToolInfo { path, version }) => Ok(Json(json!({
            "success": true,
            "yt_dlp_version": version,
            "yt_dlp_path": path,
        }))),
        Err(FetchError::ToolNotFound) => {
            let mut err = ApiError::from(FetchError::ToolNotFound);
            err.status = StatusCode::NOT_FOUND;
            Err(err)
        }
        Err(err) => {
            warn!(error = %err, "yt-dlp probe failed");
            Err(err.into())
        }
    }
}

#[derive(Debug, Serialize)]
struct ToolStatus {
    available: bool,
    path: PathBuf,
    #[serde(skip_serializing_if = "Option::is_none")]
    version: Option<String>,
}

#[derive(Debug, Serialize)]
struct CacheStatus {
    enabled: bool,
    expiry_secs: u64,
}

#[derive(Debug, Serialize)]
struct StatusResponse {
    platforms: Map<String, Value>,
    yt_dlp: ToolStatus,
    cache: CacheStatus,
}

async fn status(State(state): State<AppState>) -> Json<StatusResponse> {
    let mut platforms = Map::new();
    for platform in PlatformId::KNOWN {
        let AuthStatus {
            has_cookies,
            has_credentials,
        } = state.credentials().status(platform);
        platforms.insert(
            platform.slug().to_string(),
            json!({ "has_cookies": has_cookies, "has_credentials": has_credentials }),
        );
    }

    let path = state.ytdlp_path();
    let version = tool::probe(&path).await.ok().map(|info| info.version);
    let cache = state.service.cache();
    Json(StatusResponse {
        platforms,
        yt_dlp: ToolStatus {
            available: version.is_some(),
            path,
            version,
        },
        cache: CacheStatus {
            enabled: cache.is_enabled(),
            expiry_secs: cache.expiry().as_secs(),
        },
    })
}
