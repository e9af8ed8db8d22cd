use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Serialize};
use std::{
    collections::HashMap,
    env, fs,
    path::{Path, PathBuf},
    time::Duration,
};

pub const DEFAULT_ENV_PATH: &str = ".env";
pub const DEFAULT_CLIPFETCH_PORT: u16 = 5000;
pub const DEFAULT_CLIPFETCH_HOST: &str = "127.0.0.1";
pub const DEFAULT_CACHE_EXPIRY_SECS: u64 = 3600;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Text,
    Json,
}

#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    pub data_root: PathBuf,
    pub host: String,
    pub port: u16,
    pub ytdlp_path: Option<PathBuf>,
    pub ffmpeg_path: Option<PathBuf>,
    pub cache_enabled: bool,
    pub cache_expiry: Duration,
    pub log_format: LogFormat,
    pub tuning: OrchestratorTuning,
}

impl RuntimeConfig {
    pub fn cookie_dir(&self) -> PathBuf {
        self.data_root.join("cookies")
    }

    pub fn cache_dir(&self) -> PathBuf {
        self.data_root.join("cache")
    }

    pub fn download_dir(&self) -> PathBuf {
        self.data_root.join("downloads")
    }
}

/// Orchestrator knobs read from the optional TOML file's `[orchestrator]`
/// table. Missing keys keep their defaults.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct OrchestratorTuning {
    pub attempt_timeout_secs: u64,
    pub max_retries: u32,
    pub backoff_base_ms: u64,
    pub fast_backoff_base_ms: u64,
    pub scrape_timeout_secs: u64,
    pub download_retention_secs: u64,
    /// Passed to yt-dlp as `--socket-timeout`.
    pub socket_timeout_secs: u64,
    /// Passed to yt-dlp as `--retries`.
    pub tool_retries: u32,
}

impl Default for OrchestratorTuning {
    fn default() -> Self {
        Self {
            attempt_timeout_secs: 120,
            max_retries: 3,
            backoff_base_ms: 1000,
            fast_backoff_base_ms: 500,
            scrape_timeout_secs: 30,
            download_retention_secs: 6 * 60 * 60,
            socket_timeout_secs: 30,
            tool_retries: 3,
        }
    }
}

impl OrchestratorTuning {
    pub fn attempt_timeout(&self) -> Duration {
        Duration::from_secs(self.attempt_timeout_secs)
    }

    pub fn backoff_base(&self, fast: bool) -> Duration {
        Duration::from_millis(if fast {
            self.fast_backoff_base_ms
        } else {
            self.backoff_base_ms
        })
    }

    pub fn scrape_timeout(&self) -> Duration {
        Duration::from_secs(self.scrape_timeout_secs)
    }

    pub fn download_retention(&self) -> Duration {
        Duration::from_secs(self.download_retention_secs)
    }

    /// Attempts allowed per strategy; never zero.
    pub fn attempts_per_strategy(&self) -> u32 {
        self.max_retries.max(1)
    }
}

#[derive(Debug, Default, Deserialize)]
struct TuningFile {
    #[serde(default)]
    orchestrator: OrchestratorTuning,
}

pub fn load_tuning(path: &Path) -> Result<OrchestratorTuning> {
    let raw = fs::read_to_string(path).with_context(|| format!("Reading {}", path.display()))?;
    let parsed: TuningFile =
        toml::from_str(&raw).with_context(|| format!("Parsing {}", path.display()))?;
    Ok(parsed.orchestrator)
}

#[derive(Debug, Clone, Default)]
pub struct RuntimeOverrides {
    pub data_root: Option<PathBuf>,
    pub host: Option<String>,
    pub port: Option<u16>,
    pub ytdlp_path: Option<PathBuf>,
    pub config_path: Option<PathBuf>,
    pub env_path: Option<PathBuf>,
}

pub fn resolve_runtime_config(overrides: RuntimeOverrides) -> Result<RuntimeConfig> {
    let env_path = overrides
        .env_path
        .as_deref()
        .unwrap_or_else(|| Path::new(DEFAULT_ENV_PATH));
    let file_vars = read_env_file(env_path)?;
    build_runtime_config_with_overrides(&file_vars, env_var_string, overrides)
}

#[cfg(test)]
fn build_runtime_config(
    file_vars: &HashMap<String, String>,
    env_lookup: impl Fn(&str) -> Option<String>,
) -> Result<RuntimeConfig> {
    build_runtime_config_with_overrides(file_vars, env_lookup, RuntimeOverrides::default())
}

fn build_runtime_config_with_overrides(
    file_vars: &HashMap<String, String>,
    env_lookup: impl Fn(&str) -> Option<String>,
    overrides: RuntimeOverrides,
) -> Result<RuntimeConfig> {
    let data_root = overrides
        .data_root
        .map(|path| path.to_string_lossy().into_owned())
        .or_else(|| lookup_value("DATA_ROOT", file_vars, &env_lookup))
        .ok_or_else(|| anyhow!("DATA_ROOT not set"))?;
    let port = overrides
        .port
        .or_else(|| {
            lookup_value("CLIPFETCH_PORT", file_vars, &env_lookup)
                .and_then(|value| value.parse::<u16>().ok())
        })
        .unwrap_or(DEFAULT_CLIPFETCH_PORT);
    let host = overrides
        .host
        .and_then(|value| {
            let trimmed = value.trim().to_string();
            if trimmed.is_empty() {
                None
            } else {
                Some(trimmed)
            }
        })
        .or_else(|| lookup_value("CLIPFETCH_HOST", file_vars, &env_lookup))
        .filter(|value| !value.trim().is_empty())
        .unwrap_or_else(|| DEFAULT_CLIPFETCH_HOST.to_string());
    let ytdlp_path = overrides
        .ytdlp_path
        .or_else(|| lookup_value("YTDLP_PATH", file_vars, &env_lookup).map(PathBuf::from));
    let ffmpeg_path = lookup_value("FFMPEG_PATH", file_vars, &env_lookup).map(PathBuf::from);
    let cache_enabled = lookup_value("CACHE_ENABLED", file_vars, &env_lookup)
        .map(|value| parse_flag(&value))
        .unwrap_or(true);
    let cache_expiry = lookup_value("CACHE_EXPIRY_SECS", file_vars, &env_lookup)
        .and_then(|value| value.parse::<u64>().ok())
        .map(Duration::from_secs)
        .unwrap_or(Duration::from_secs(DEFAULT_CACHE_EXPIRY_SECS));
    let log_format = match lookup_value("LOG_FORMAT", file_vars, &env_lookup).as_deref() {
        Some(value) if value.eq_ignore_ascii_case("json") => LogFormat::Json,
        _ => LogFormat::Text,
    };
    let tuning = match overrides
        .config_path
        .or_else(|| lookup_value("CLIPFETCH_CONFIG", file_vars, &env_lookup).map(PathBuf::from))
    {
        Some(path) => load_tuning(&path)?,
        None => OrchestratorTuning::default(),
    };
    Ok(RuntimeConfig {
        data_root: PathBuf::from(data_root),
        host,
        port,
        ytdlp_path,
        ffmpeg_path,
        cache_enabled,
        cache_expiry,
        log_format,
        tuning,
    })
}

fn parse_flag(value: &str) -> bool {
    !matches!(
        value.trim().to_ascii_lowercase().as_str(),
        "0" | "false" | "no" | "off"
    )
}

fn env_var_string(key: &str) -> Option<String> {
    env::var(key).ok().and_then(|value| {
        let trimmed = value.trim();
        if trimmed.is_empty() {
            None
        } else {
            Some(trimmed.to_string())
        }
    })
}

fn lookup_value(
    key: &str,
    file_vars: &HashMap<String, String>,
    env_lookup: &impl Fn(&str) -> Option<String>,
) -> Option<String> {
    env_lookup(key).or_else(|| file_vars.get(key).cloned())
}

pub fn read_env_file(path: &Path) -> Result<HashMap<String, String>> {
    let mut vars = HashMap::new();
    if !path.exists() {
        return Ok(vars);
    }
    let content =
        fs::read_to_string(path).with_context(|| format!("Reading {}", path.display()))?;
    for line in content.lines() {
        let trimmed = line.trim();
        if trimmed.is_empty() || trimmed.starts_with('#') {
            continue;
        }
        let line = trimmed.strip_prefix("export ").unwrap_or(trimmed);
        let Some((key, value_raw)) = line.split_once('=') else {
            continue;
        };
        let key = key.trim();
        if key.is_empty() {
            continue;
        }
        let value = value_raw.trim();
        let value = value
            .strip_prefix('"')
            .and_then(|value| value.strip_suffix('"'))
            .or_else(|| {
                value
                    .strip_prefix('\'')
                    .and_then(|value| value.strip_suffix('\''))
            })
            .unwrap_or(value);
        vars.insert(key.to_string(), value.to_string());
    }
    Ok(vars)
}
