//! Subprocess launcher for the git CGI backend.
//!
//! `BackendProcess` is the scoped resource that owns the child and its three pipes for
//! one invocation. Dropping it at any point (success, error, cancellation, or the HTTP
//! layer dropping the response body) kills the child and aborts the helper tasks, so no
//! backend outlives the request that started it.

use std::process::{ExitStatus, Stdio};

use tokio::io::AsyncReadExt;
use tokio::process::{Child, ChildStderr, ChildStdin, ChildStdout, Command};
use tokio::task::JoinHandle;

use super::types::GitRequestParameters;
use crate::config::GatewayConfig;
use crate::errors::GatewayError;

#[cfg(windows)]
const CREATE_NO_WINDOW: u32 = 0x0800_0000;

/// Live backend process plus its redirected streams.
pub struct BackendProcess {
    child: Child,
    stdin: Option<ChildStdin>,
    stdout: Option<ChildStdout>,
    stderr_task: Option<JoinHandle<()>>,
    request_task: Option<JoinHandle<Result<u64, GatewayError>>>,
}

impl BackendProcess {
    /// Start the backend synchronously, before any byte is written or read.
    ///
    /// The CGI environment is merged into the inherited environment rather than
    /// replacing it, so `PATH` and friends still reach the backend.
    pub fn spawn(
        config: &GatewayConfig,
        params: &GitRequestParameters,
    ) -> Result<Self, GatewayError> {
        let mut cmd = Command::new(&config.git_binary);
        cmd.args(&config.backend_args)
            .current_dir(params.repository_path.as_path())
            .envs(params.environment().iter())
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        #[cfg(windows)]
        cmd.creation_flags(CREATE_NO_WINDOW);

        let mut child = cmd.spawn().map_err(|source| {
            tracing::error!("Failed to spawn {}: {}", config.git_binary, source);
            GatewayError::Spawn {
                program: config.git_binary.clone(),
                source,
            }
        })?;
        tracing::debug!(pid = child.id(), "backend started");

        let stderr_task = child
            .stderr
            .take()
            .map(|stderr| tokio::spawn(drain_stderr(stderr, config.stderr_log_limit)));

        Ok(Self {
            stdin: child.stdin.take(),
            stdout: child.stdout.take(),
            child,
            stderr_task,
            request_task: None,
        })
    }

    pub fn take_stdin(&mut self) -> Result<ChildStdin, GatewayError> {
        self.stdin
            .take()
            .ok_or_else(|| GatewayError::Internal("backend stdin already taken".into()))
    }

    pub fn take_stdout(&mut self) -> Result<ChildStdout, GatewayError> {
        self.stdout
            .take()
            .ok_or_else(|| GatewayError::Internal("backend stdout already taken".into()))
    }

    /// Hand the running request pump to the process so it shares its lifetime.
    pub fn attach_request_pump(&mut self, task: JoinHandle<Result<u64, GatewayError>>) {
        self.request_task = Some(task);
    }

    /// Wait for an attached request pump; `Ok(None)` when none was attached.
    pub async fn join_request_pump(&mut self) -> Result<Option<u64>, GatewayError> {
        let Some(task) = self.request_task.take() else {
            return Ok(None);
        };
        match task.await {
            Ok(result) => result.map(Some),
            Err(e) if e.is_cancelled() => Err(GatewayError::Cancelled),
            Err(e) => Err(GatewayError::Internal(format!("request pump panicked: {e}"))),
        }
    }

    /// Reap the backend after stdout has closed and flush its stderr to the log.
    pub async fn finish(&mut self) -> Result<ExitStatus, GatewayError> {
        self.stdin.take();
        self.stdout.take();
        let status = self.child.wait().await?;
        if let Some(task) = self.stderr_task.take() {
            let _ = task.await;
        }
        if status.success() {
            tracing::debug!(%status, "backend exited");
        } else {
            tracing::warn!(%status, "backend exited with failure");
        }
        Ok(status)
    }

    /// Ask the OS to terminate the backend without waiting for it.
    pub fn kill(&mut self) {
        if let Err(e) = self.child.start_kill() {
            tracing::debug!("backend already gone: {}", e);
        }
    }

    pub fn id(&self) -> Option<u32> {
        self.child.id()
    }
}

impl Drop for BackendProcess {
    fn drop(&mut self) {
        if let Some(task) = self.request_task.take() {
            task.abort();
        }
        if let Some(task) = self.stderr_task.take() {
            task.abort();
        }
        // `kill_on_drop` takes care of a child that is still running.
    }
}

/// Read stderr to the end so the backend never stalls on a full pipe, keeping the first
/// `limit` bytes for the log.
async fn drain_stderr(mut stderr: ChildStderr, limit: usize) {
    let mut captured = Vec::new();
    let mut chunk = [0u8; 1024];
    loop {
        match stderr.read(&mut chunk).await {
            Ok(0) => break,
            Ok(n) => {
                let room = limit.saturating_sub(captured.len());
                captured.extend_from_slice(&chunk[..n.min(room)]);
            }
            Err(e) => {
                tracing::debug!("stopped reading backend stderr: {}", e);
                break;
            }
        }
    }
    for line in String::from_utf8_lossy(&captured)
        .lines()
        .filter(|line| !line.trim().is_empty())
    {
        tracing::warn!("backend stderr: {}", line);
    }
}
