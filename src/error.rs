//! Error taxonomy surfaced to callers of the service.

use axum::http::StatusCode;

use crate::platform::PlatformId;

/// Terminal failures of a request. Failures the orchestrator can recover from
/// (a single strategy failing, a retryable rate limit) never reach this type.
#[derive(Debug, thiserror::Error)]
pub enum FetchError {
    #[error("{0}")]
    InvalidUrl(String),
    #[error("unsupported platform for URL {0}")]
    UnsupportedPlatform(String),
    #[error("yt-dlp is not found. Please install it first.")]
    ToolNotFound,
    #[error("{platform} is rate limiting requests")]
    RateLimited {
        platform: PlatformId,
        retry_after_secs: u64,
    },
    #[error("{platform} requires authentication to access this content")]
    AuthRequired {
        platform: PlatformId,
        has_cookies: bool,
    },
    #[error("no credentials stored for {0}")]
    MissingCredentials(PlatformId),
    #[error("extractor timed out after {0}s")]
    Timeout(u64),
    #[error("extraction failed: {0}")]
    ExtractionFailed(String),
    #[error("storage error: {0}")]
    Io(#[from] std::io::Error),
}

impl FetchError {
    /// Machine-checkable kind, stable across releases.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::InvalidUrl(_) => "INVALID_URL",
            Self::UnsupportedPlatform(_) => "UNSUPPORTED_PLATFORM",
            Self::ToolNotFound => "TOOL_NOT_FOUND",
            Self::RateLimited { .. } => "RATE_LIMITED",
            Self::AuthRequired { .. } => "AUTH_REQUIRED",
            Self::MissingCredentials(_) => "MISSING_CREDENTIALS",
            Self::Timeout(_) => "TIMEOUT",
            Self::ExtractionFailed(_) => "EXTRACTION_FAILED",
            Self::Io(_) => "IO_ERROR",
        }
    }

    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::InvalidUrl(_) | Self::UnsupportedPlatform(_) | Self::MissingCredentials(_) => {
                StatusCode::BAD_REQUEST
            }
            Self::AuthRequired { .. } => StatusCode::FORBIDDEN,
            Self::RateLimited { .. } => StatusCode::TOO_MANY_REQUESTS,
            Self::Timeout(_) => StatusCode::GATEWAY_TIMEOUT,
            Self::ToolNotFound | Self::ExtractionFailed(_) | Self::Io(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }

    /// Human-readable hint steering the user toward a fix.
    pub fn solution(&self) -> Option<String> {
        match self {
            Self::InvalidUrl(_) => Some("Send a full http(s):// link to the video.".to_string()),
            Self::UnsupportedPlatform(_) => Some(
                "Supported platforms: Instagram, YouTube, TikTok, Facebook, Twitter/X.".to_string(),
            ),
            Self::ToolNotFound => Some("Install yt-dlp using 'pip install yt-dlp'.".to_string()),
            Self::RateLimited {
                platform,
                retry_after_secs,
            } => Some(format!(
                "{platform} is throttling requests. Wait about {retry_after_secs}s and try again, \
                 or upload {platform} cookies to use a logged-in session."
            )),
            Self::AuthRequired {
                platform,
                has_cookies,
            } => Some(if *has_cookies {
                format!(
                    "The stored {platform} cookies were rejected. Export fresh cookies from a \
                     logged-in browser and upload them again."
                )
            } else {
                format!(
                    "Upload a {platform} cookies.txt file or set {platform} credentials, then retry."
                )
            }),
            Self::MissingCredentials(platform) => Some(format!(
                "Set {platform} credentials via /api/set-credentials first."
            )),
            Self::Timeout(_) => Some("The video took too long to resolve. Try again later.".to_string()),
            Self::ExtractionFailed(_) | Self::Io(_) => None,
        }
    }
}
