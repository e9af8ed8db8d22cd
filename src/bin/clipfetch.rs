#![forbid(unsafe_code)]

//! `clipfetch` binary: the HTTP server plus one-shot commands that reuse the
//! same service wiring.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use clap::{Parser, Subcommand};
use clipfetch::api::{self, AppState};
use clipfetch::config::{LogFormat, RuntimeConfig, RuntimeOverrides, resolve_runtime_config};
use clipfetch::error::FetchError;
use clipfetch::orchestrator::sweep_stale_downloads;
use clipfetch::platform::PlatformId;
use clipfetch::security::ensure_not_root;
use clipfetch::tool;
use serde::Serialize;
use tokio::signal;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

const SWEEP_INTERVAL: Duration = Duration::from_secs(600);

#[derive(Debug, Parser)]
#[command(name = "clipfetch", version, about = "Social media video resolver")]
struct Cli {
    /// Directory holding cookies, cache entries and downloads.
    #[arg(long, global = true)]
    data_root: Option<PathBuf>,
    /// `.env` file consulted after the process environment.
    #[arg(long, global = true)]
    env_file: Option<PathBuf>,
    /// TOML file with an `[orchestrator]` tuning table.
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    #[arg(long, global = true)]
    ytdlp_path: Option<PathBuf>,
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Run the HTTP API.
    Serve {
        #[arg(long)]
        host: Option<String>,
        #[arg(long)]
        port: Option<u16>,
    },
    /// Print metadata for a video URL.
    Info { url: String },
    /// Download a video into the data root.
    Download {
        url: String,
        /// Resolve a direct media URL instead of downloading when possible.
        #[arg(long)]
        fast: bool,
    },
    ClearCache,
    /// Report the yt-dlp binary in use and its version.
    CheckTool,
    SetCredentials {
        platform: String,
        username: String,
        password: String,
    },
    /// Turn stored credentials into a cookie jar.
    Login { platform: String },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let (host, port) = match &cli.command {
        Command::Serve { host, port } => (host.clone(), *port),
        _ => (None, None),
    };
    let config = resolve_runtime_config(RuntimeOverrides {
        data_root: cli.data_root,
        host,
        port,
        ytdlp_path: cli.ytdlp_path,
        config_path: cli.config,
        env_path: cli.env_file,
    })?;
    init_tracing(config.log_format);

    let state = AppState::from_config(&config);
    match cli.command {
        Command::Serve { .. } => serve(config, state).await,
        Command::Info { url } => print_json(&state.service().get_info(&url).await.map_err(report)?),
        Command::Download { url, fast } => {
            let service = state.service();
            let result = if fast {
                service.fast_download(&url).await
            } else {
                service.download(&url).await
            };
            print_json(&result.map_err(report)?)
        }
        Command::ClearCache => {
            let removed = state.service().clear_cache().map_err(report)?;
            println!("removed {removed} cached entries");
            Ok(())
        }
        Command::CheckTool => {
            let path = tool::resolve_or_default(tool::YTDLP, config.ytdlp_path.as_deref());
            print_json(&tool::probe(&path).await.map_err(report)?)
        }
        Command::SetCredentials {
            platform,
            username,
            password,
        } => {
            let platform = parse_platform(&platform)?;
            let credentials = state.service().orchestrator().credentials();
            credentials
                .set_credential(platform, &username, &password)
                .map_err(report)?;
            println!("stored {platform} credentials");
            Ok(())
        }
        Command::Login { platform } => {
            let platform = parse_platform(&platform)?;
            let jar = state
                .service()
                .orchestrator()
                .login(platform)
                .await
                .map_err(report)?;
            println!("{platform} cookie jar written to {}", jar.display());
            Ok(())
        }
    }
}

fn init_tracing(format: LogFormat) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("clipfetch=info"));
    match format {
        LogFormat::Json => tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .init(),
        LogFormat::Text => tracing_subscriber::fmt().with_env_filter(filter).init(),
    }
}

async fn serve(config: RuntimeConfig, state: AppState) -> Result<()> {
    ensure_not_root("clipfetch")?;

    let download_root = config.download_dir();
    std::fs::create_dir_all(&download_root)
        .with_context(|| format!("creating {}", download_root.display()))?;
    let retention = config.tuning.download_retention();
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(SWEEP_INTERVAL);
        loop {
            ticker.tick().await;
            let root = download_root.clone();
            match tokio::task::spawn_blocking(move || sweep_stale_downloads(&root, retention)).await
            {
                Ok(0) => {}
                Ok(removed) => info!(removed, "swept stale download directories"),
                Err(err) => warn!(error = %err, "download sweep task failed"),
            }
        }
    });

    let app = api::router(state);
    let listener = tokio::net::TcpListener::bind((config.host.as_str(), config.port))
        .await
        .with_context(|| format!("binding to {}:{}", config.host, config.port))?;
    info!(host = %config.host, port = config.port, "clipfetch listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("running API server")?;
    Ok(())
}

async fn shutdown_signal() {
    if let Err(err) = signal::ctrl_c().await {
        error!(error = %err, "failed to install Ctrl+C handler");
    }
}

fn parse_platform(value: &str) -> Result<PlatformId> {
    PlatformId::parse(value).ok_or_else(|| anyhow!("unknown platform '{value}'"))
}

fn report(err: FetchError) -> anyhow::Error {
    match err.solution() {
        Some(solution) => anyhow!("{} [{}]\n{}", err, err.kind(), solution),
        None => anyhow!("{} [{}]", err, err.kind()),
    }
}

fn print_json(value: &impl Serialize) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}
