//! Running external tools (yt-dlp, ffmpeg) under a deadline.

use std::io::{self, ErrorKind};
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::AsyncReadExt;
use tokio::process::Command;
use tokio::time::timeout;
use tracing::{debug, warn};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToolOutput {
    pub success: bool,
    pub code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

#[derive(Debug, thiserror::Error)]
pub enum RunError {
    #[error("{0} was not found")]
    NotFound(PathBuf),
    #[error("timed out after {}s", .0.as_secs())]
    TimedOut(Duration),
    #[error("failed to run tool: {0}")]
    Io(#[from] io::Error),
}

/// Something that can run the extraction tool with a set of arguments.
#[async_trait]
pub trait Extractor: Send + Sync {
    fn program(&self) -> &Path;

    async fn run(&self, args: &[String], deadline: Duration) -> Result<ToolOutput, RunError>;
}

/// The real yt-dlp binary.
pub struct YtDlp {
    program: PathBuf,
}

impl YtDlp {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
        }
    }
}

#[async_trait]
impl Extractor for YtDlp {
    fn program(&self) -> &Path {
        &self.program
    }

    async fn run(&self, args: &[String], deadline: Duration) -> Result<ToolOutput, RunError> {
        run_with_deadline(&self.program, args, deadline).await
    }
}

/// Spawns `program`, collects both pipes and kills the child if it outlives
/// `deadline`.
pub async fn run_with_deadline(
    program: &Path,
    args: &[String],
    deadline: Duration,
) -> Result<ToolOutput, RunError> {
    debug!(program = %program.display(), ?args, "spawning tool");
    let mut child = Command::new(program)
        .args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()
        .map_err(|err| match err.kind() {
            ErrorKind::NotFound | ErrorKind::PermissionDenied => {
                RunError::NotFound(program.to_path_buf())
            }
            _ => RunError::Io(err),
        })?;

    let mut stdout_pipe = child
        .stdout
        .take()
        .ok_or_else(|| io::Error::other("stdout was not captured"))?;
    let mut stderr_pipe = child
        .stderr
        .take()
        .ok_or_else(|| io::Error::other("stderr was not captured"))?;

    let stdout_task = tokio::spawn(async move {
        let mut buf = Vec::new();
        stdout_pipe.read_to_end(&mut buf).await.map(|_| buf)
    });
    let stderr_task = tokio::spawn(async move {
        let mut buf = Vec::new();
        stderr_pipe.read_to_end(&mut buf).await.map(|_| buf)
    });

    match timeout(deadline, child.wait()).await {
        Ok(status) => {
            let status = status?;
            let stdout = stdout_task.await.map_err(io::Error::other)??;
            let stderr = stderr_task.await.map_err(io::Error::other)??;
            Ok(ToolOutput {
                success: status.success(),
                code: status.code(),
                stdout: String::from_utf8_lossy(&stdout).into_owned(),
                stderr: String::from_utf8_lossy(&stderr).into_owned(),
            })
        }
        Err(_) => {
            if let Err(err) = child.kill().await {
                warn!(program = %program.display(), error = %err, "failed to kill timed out tool");
            }
            stdout_task.abort();
            stderr_task.abort();
            Err(RunError::TimedOut(deadline))
        }
    }
}
