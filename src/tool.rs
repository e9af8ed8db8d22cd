//! Locating external binaries and reporting their versions.

use std::env;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Serialize;

use crate::error::FetchError;
use crate::extractor::{RunError, run_with_deadline};

pub const YTDLP: &str = "yt-dlp";
pub const FFMPEG: &str = "ffmpeg";

const COMMON_DIRS: &[&str] = &["/opt/homebrew/bin", "/usr/local/bin", "/usr/bin", "/bin"];
const VERSION_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct ToolInfo {
    pub path: PathBuf,
    pub version: String,
}

/// Finds `name`: the configured path first (a bare name is searched like any
/// other), then `PATH`, then common install locations and `~/.local/bin`.
pub fn locate_program(name: &str, configured: Option<&Path>) -> Option<PathBuf> {
    let wanted = match configured {
        Some(path) if path.components().count() > 1 || path.is_absolute() => {
            return path.is_file().then(|| path.to_path_buf());
        }
        Some(path) => path.as_os_str().to_string_lossy().into_owned(),
        None => name.to_string(),
    };

    let mut dirs: Vec<PathBuf> = env::var_os("PATH")
        .map(|paths| env::split_paths(&paths).collect())
        .unwrap_or_default();
    dirs.extend(COMMON_DIRS.iter().map(PathBuf::from));
    if let Some(home) = env::var_os("HOME") {
        dirs.push(Path::new(&home).join(".local/bin"));
    }

    dirs.into_iter()
        .map(|dir| dir.join(&wanted))
        .find(|candidate| candidate.is_file())
}

/// Path to hand to the process spawner. Falls back to the bare name so a
/// missing tool surfaces as a spawn failure.
pub fn resolve_or_default(name: &str, configured: Option<&Path>) -> PathBuf {
    locate_program(name, configured)
        .or_else(|| configured.map(Path::to_path_buf))
        .unwrap_or_else(|| PathBuf::from(name))
}

/// Runs `<path> --version`.
pub async fn probe(path: &Path) -> Result<ToolInfo, FetchError> {
    let output = run_with_deadline(path, &["--version".to_string()], VERSION_TIMEOUT)
        .await
        .map_err(|err| match err {
            RunError::NotFound(_) => FetchError::ToolNotFound,
            RunError::TimedOut(limit) => FetchError::Timeout(limit.as_secs()),
            RunError::Io(err) => FetchError::Io(err),
        })?;
    if !output.success {
        return Err(FetchError::ExtractionFailed(format!(
            "{} --version exited with {:?}: {}",
            path.display(),
            output.code,
            output.stderr.trim()
        )));
    }
    let version = output.stdout.lines().next().unwrap_or("").trim().to_string();
    Ok(ToolInfo {
        path: path.to_path_buf(),
        version,
    })
}
