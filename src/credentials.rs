//! Per-platform cookie jars and username/password pairs.
//!
//! Reads are lenient: a missing or corrupt credential file is simply "no
//! credential". Writes always overwrite.

use std::path::PathBuf;
use std::sync::Arc;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::error::FetchError;
use crate::platform::PlatformId;
use crate::storage::Storage;

pub const NETSCAPE_MARKER: &str = "# Netscape HTTP Cookie File";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Credential {
    pub platform: PlatformId,
    pub username: String,
    pub password: String,
    /// Change marker regenerated on every write.
    pub saved_at: String,
}

/// What happened to an uploaded cookie file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CookieUpload {
    StoredVerbatim,
    MarkerAdded,
    Placeholder,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct AuthStatus {
    pub has_cookies: bool,
    pub has_credentials: bool,
}

pub struct CredentialStore {
    storage: Arc<dyn Storage>,
}

impl CredentialStore {
    pub fn new(storage: Arc<dyn Storage>) -> Self {
        Self { storage }
    }

    pub fn cookie_key(platform: PlatformId) -> String {
        format!("{}_cookies.txt", platform.slug())
    }

    pub fn credential_key(platform: PlatformId) -> String {
        format!("{}_credentials.json", platform.slug())
    }

    /// Deterministic cookie jar location. Existence is not implied.
    pub fn cookie_path(&self, platform: PlatformId) -> Option<PathBuf> {
        self.storage.local_path(&Self::cookie_key(platform))
    }

    pub fn has_cookies(&self, platform: PlatformId) -> bool {
        self.storage.exists(&Self::cookie_key(platform))
    }

    /// Cookie jar path, only when the jar exists and can be handed to the
    /// extractor.
    pub fn usable_cookie_path(&self, platform: PlatformId) -> Option<PathBuf> {
        if self.has_cookies(platform) {
            self.cookie_path(platform)
        } else {
            None
        }
    }

    pub fn get_credential(&self, platform: PlatformId) -> Option<Credential> {
        let raw = match self.storage.get(&Self::credential_key(platform)) {
            Ok(Some(raw)) => raw,
            Ok(None) => return None,
            Err(err) => {
                warn!(%platform, error = %err, "reading credentials failed");
                return None;
            }
        };
        match serde_json::from_slice::<Credential>(&raw) {
            Ok(credential) => Some(credential),
            Err(err) => {
                debug!(%platform, error = %err, "ignoring unparsable credential file");
                None
            }
        }
    }

    pub fn set_credential(
        &self,
        platform: PlatformId,
        username: &str,
        password: &str,
    ) -> Result<Credential, FetchError> {
        let credential = Credential {
            platform,
            username: username.trim().to_string(),
            password: password.to_string(),
            saved_at: Utc::now().to_rfc3339(),
        };
        let payload = serde_json::to_vec_pretty(&credential)
            .map_err(|err| FetchError::Io(std::io::Error::other(err)))?;
        self.storage
            .set(&Self::credential_key(platform), &payload)?;
        info!(%platform, "stored credentials");
        Ok(credential)
    }

    pub fn upload_cookie_file(
        &self,
        platform: PlatformId,
        raw: &[u8],
    ) -> Result<CookieUpload, FetchError> {
        let (contents, outcome) = normalize_cookie_upload(platform, raw);
        self.storage.set(&Self::cookie_key(platform), &contents)?;
        info!(%platform, ?outcome, bytes = contents.len(), "stored cookie file");
        Ok(outcome)
    }

    pub fn read_cookies(&self, platform: PlatformId) -> Option<String> {
        let raw = self.storage.get(&Self::cookie_key(platform)).ok()??;
        Some(String::from_utf8_lossy(&raw).into_owned())
    }

    /// `Cookie:` header value assembled from the stored jar, for direct HTTP
    /// requests that bypass the extractor.
    pub fn cookie_header(&self, platform: PlatformId) -> Option<String> {
        let jar = self.read_cookies(platform)?;
        let pairs: Vec<String> = cookie_lines(&jar)
            .map(|fields| format!("{}={}", fields[5], fields[6]))
            .collect();
        if pairs.is_empty() {
            None
        } else {
            Some(pairs.join("; "))
        }
    }

    pub fn status(&self, platform: PlatformId) -> AuthStatus {
        AuthStatus {
            has_cookies: self.has_cookies(platform),
            has_credentials: self.get_credential(platform).is_some(),
        }
    }
}

/// Yields the seven tab-separated fields of every cookie line.
fn cookie_lines(contents: &str) -> impl Iterator<Item = Vec<&str>> {
    contents.lines().filter_map(|line| {
        let line = line.trim_end_matches('\r');
        let line = line.strip_prefix("#HttpOnly_").unwrap_or(line);
        if line.trim().is_empty() || line.starts_with('#') {
            return None;
        }
        let fields: Vec<&str> = line.split('\t').collect();
        (fields.len() == 7).then_some(fields)
    })
}

/// Applies the upload policy: files already carrying the Netscape marker are
/// kept verbatim; cookie lines without the marker get it prepended; anything
/// without a single cookie line is replaced by a placeholder jar.
pub fn normalize_cookie_upload(platform: PlatformId, raw: &[u8]) -> (Vec<u8>, CookieUpload) {
    let text = String::from_utf8_lossy(raw);
    let trimmed = text.trim_start_matches('\u{feff}').trim_start();
    if trimmed.starts_with(NETSCAPE_MARKER) {
        return (raw.to_vec(), CookieUpload::StoredVerbatim);
    }
    if cookie_lines(trimmed).next().is_some() {
        let contents = format!("{NETSCAPE_MARKER}\n{trimmed}");
        return (contents.into_bytes(), CookieUpload::MarkerAdded);
    }
    warn!(%platform, "uploaded cookie file has no cookie lines, writing placeholder");
    (placeholder_jar(platform).into_bytes(), CookieUpload::Placeholder)
}

fn placeholder_jar(platform: PlatformId) -> String {
    format!(
        "{NETSCAPE_MARKER}\n# This file was generated by clipfetch.\n\n\
         {domain}\tTRUE\t/\tTRUE\t2147483647\tclipfetch_placeholder\t1\n",
        domain = platform.cookie_domain()
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::{FsStorage, MemoryStorage};
    use tempfile::tempdir;

    const JAR_LINE: &str = ".instagram.com\tTRUE\t/\tTRUE\t1999999999\tsessionid\tabc123";

    fn fs_store() -> (tempfile::TempDir, CredentialStore) {
        let dir = tempdir().unwrap();
        let store = CredentialStore::new(Arc::new(FsStorage::new(dir.path())));
        (dir, store)
    }

    #[test]
    fn cookie_path_uses_platform_file_name() {
        let (dir, store) = fs_store();
        assert_eq!(
            store.cookie_path(PlatformId::TikTok).unwrap(),
            dir.path().join("tiktok_cookies.txt")
        );
        assert!(!store.has_cookies(PlatformId::TikTok));
        assert!(store.usable_cookie_path(PlatformId::TikTok).is_none());
    }

    #[test]
    fn set_credential_overwrites_and_refreshes_marker() {
        let (_dir, store) = fs_store();
        store
            .set_credential(PlatformId::Instagram, "first", "pw1")
            .unwrap();
        let second = store
            .set_credential(PlatformId::Instagram, " second ", "pw2")
            .unwrap();
        let loaded = store.get_credential(PlatformId::Instagram).unwrap();
        assert_eq!(loaded, second);
        assert_eq!(loaded.username, "second");
        assert!(!loaded.saved_at.is_empty());
    }

    #[test]
    fn corrupt_credentials_read_as_absent() {
        let storage = Arc::new(MemoryStorage::new());
        storage
            .set("youtube_credentials.json", b"{not json")
            .unwrap();
        let store = CredentialStore::new(storage);
        assert!(store.get_credential(PlatformId::YouTube).is_none());
        assert!(!store.status(PlatformId::YouTube).has_credentials);
    }

    #[test]
    fn netscape_upload_is_kept_verbatim() {
        let (_dir, store) = fs_store();
        let upload = format!("{NETSCAPE_MARKER}\n{JAR_LINE}\n");
        let outcome = store
            .upload_cookie_file(PlatformId::Instagram, upload.as_bytes())
            .unwrap();
        assert_eq!(outcome, CookieUpload::StoredVerbatim);
        assert_eq!(store.read_cookies(PlatformId::Instagram).unwrap(), upload);
        assert!(store.has_cookies(PlatformId::Instagram));
    }

    #[test]
    fn cookie_lines_without_marker_keep_their_content() {
        let (bytes, outcome) = normalize_cookie_upload(PlatformId::Instagram, JAR_LINE.as_bytes());
        assert_eq!(outcome, CookieUpload::MarkerAdded);
        let text = String::from_utf8(bytes).unwrap();
        assert!(text.starts_with(NETSCAPE_MARKER));
        assert!(text.contains("sessionid\tabc123"));
    }

    #[test]
    fn garbage_upload_becomes_placeholder() {
        let (bytes, outcome) = normalize_cookie_upload(PlatformId::TikTok, b"hello world");
        assert_eq!(outcome, CookieUpload::Placeholder);
        let text = String::from_utf8(bytes).unwrap();
        assert!(text.starts_with(NETSCAPE_MARKER));
        assert!(text.contains(".tiktok.com\tTRUE"));
    }

    #[test]
    fn cookie_header_joins_jar_entries() {
        let (_dir, store) = fs_store();
        let jar = format!(
            "{NETSCAPE_MARKER}\n{JAR_LINE}\n#HttpOnly_.instagram.com\tTRUE\t/\tTRUE\t0\tcsrftoken\tzz\n"
        );
        store
            .upload_cookie_file(PlatformId::Instagram, jar.as_bytes())
            .unwrap();
        assert_eq!(
            store.cookie_header(PlatformId::Instagram).unwrap(),
            "sessionid=abc123; csrftoken=zz"
        );
        assert!(store.cookie_header(PlatformId::YouTube).is_none());
    }
}
