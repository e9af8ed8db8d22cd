//! Maps extractor stderr to a failure kind the orchestrator acts on.

use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    RateLimited,
    AuthRequired,
    Timeout,
    ToolMissing,
    Other,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AttemptFailure {
    pub kind: FailureKind,
    /// Truncated error text, for logs and the terminal error message.
    pub detail: String,
}

impl AttemptFailure {
    pub fn new(kind: FailureKind, detail: &str) -> Self {
        Self {
            kind,
            detail: truncate_detail(detail, MAX_DETAIL_CHARS),
        }
    }
}

pub const MAX_DETAIL_CHARS: usize = 500;

// Checked in order; rate-limit phrases win over auth phrases when both occur.
const PHRASE_TABLE: &[(&str, FailureKind)] = &[
    ("too many requests", FailureKind::RateLimited),
    ("http error 429", FailureKind::RateLimited),
    ("status 429", FailureKind::RateLimited),
    ("error 429", FailureKind::RateLimited),
    (" 429 ", FailureKind::RateLimited),
    ("rate-limit", FailureKind::RateLimited),
    ("rate limit", FailureKind::RateLimited),
    ("sign in to confirm", FailureKind::AuthRequired),
    ("login required", FailureKind::AuthRequired),
    ("login_required", FailureKind::AuthRequired),
    ("requested content is not available", FailureKind::AuthRequired),
    ("not available", FailureKind::AuthRequired),
    ("private", FailureKind::AuthRequired),
    ("use --cookies", FailureKind::AuthRequired),
    ("read timed out", FailureKind::Timeout),
];

/// Pure classification of the extractor's error output.
pub fn classify_failure(stderr: &str) -> FailureKind {
    let lowered = stderr.to_lowercase();
    PHRASE_TABLE
        .iter()
        .find(|(phrase, _)| lowered.contains(phrase))
        .map(|(_, kind)| *kind)
        .unwrap_or(FailureKind::Other)
}

pub fn truncate_detail(text: &str, max_chars: usize) -> String {
    match text.char_indices().nth(max_chars) {
        Some((cut, _)) => text[..cut].to_string(),
        None => text.to_string(),
    }
}
