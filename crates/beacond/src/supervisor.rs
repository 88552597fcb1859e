//! Child process supervision for a fan-out parent

use crate::config::ChildArgs;
use std::path::PathBuf;
use std::process::{ExitStatus, Stdio};
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Command;
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Delay before a child is (re)started
pub const RESTART_DELAY: Duration = Duration::from_secs(3);

/// Delay between the first start of consecutive children
pub const START_STAGGER: Duration = Duration::from_secs(5);

/// Supervisor errors
#[derive(Debug, Error)]
pub enum SupervisorError {
    #[error("Cannot locate own executable: {0}")]
    Executable(std::io::Error),
    #[error("Process error: {0}")]
    Io(#[from] std::io::Error),
}

/// Keeps child processes running until shutdown
#[derive(Clone, Debug)]
pub struct Supervisor {
    program: PathBuf,
    restart_delay: Duration,
}

impl Supervisor {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            restart_delay: RESTART_DELAY,
        }
    }

    /// Supervise copies of the running binary
    pub fn current_exe() -> Result<Self, SupervisorError> {
        let program = std::env::current_exe().map_err(SupervisorError::Executable)?;
        Ok(Self::new(program))
    }

    pub fn with_restart_delay(mut self, delay: Duration) -> Self {
        self.restart_delay = delay;
        self
    }

    /// Start one supervision task per child, `stagger` apart
    pub fn spawn_children(
        &self,
        children: Vec<ChildArgs>,
        stagger: Duration,
        shutdown: CancellationToken,
    ) -> Vec<JoinHandle<()>> {
        children
            .into_iter()
            .enumerate()
            .map(|(index, args)| {
                let supervisor = self.clone();
                let shutdown = shutdown.clone();
                let name = format!("beacon-child-{}", args.child_id);
                tokio::spawn(async move {
                    tokio::select! {
                        _ = sleep(stagger * index as u32) => {}
                        _ = shutdown.cancelled() => return,
                    }
                    supervisor.supervise(&name, args.to_args(), shutdown).await;
                })
            })
            .collect()
    }

    /// Run `args` in a loop, restarting after every exit
    pub async fn supervise(&self, name: &str, args: Vec<String>, shutdown: CancellationToken) {
        loop {
            tokio::select! {
                _ = sleep(self.restart_delay) => {}
                _ = shutdown.cancelled() => break,
            }

            debug!(child = %name, "Starting process");
            match self.run_once(name, &args, &shutdown).await {
                Ok(Some(status)) if status.success() => info!(child = %name, "Process exited"),
                Ok(Some(status)) => warn!(child = %name, %status, "Process failed"),
                Ok(None) => break,
                Err(e) => error!(child = %name, "Failed to run process: {}", e),
            }
        }
        debug!(child = %name, "Supervision stopped");
    }

    /// Run the process once; `None` when it was killed for shutdown
    async fn run_once(
        &self,
        name: &str,
        args: &[String],
        shutdown: &CancellationToken,
    ) -> Result<Option<ExitStatus>, SupervisorError> {
        let mut child = Command::new(&self.program)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()?;
        let pid = child.id().unwrap_or_default();
        info!(child = %name, pid, "Process started");

        let mut pipes = Vec::new();
        if let Some(stdout) = child.stdout.take() {
            pipes.push(tokio::spawn(forward_lines(name.to_string(), pid, stdout)));
        }
        if let Some(stderr) = child.stderr.take() {
            pipes.push(tokio::spawn(forward_lines(name.to_string(), pid, stderr)));
        }

        let status = tokio::select! {
            status = child.wait() => Some(status?),
            _ = shutdown.cancelled() => {
                info!(child = %name, pid, "Stopping process");
                child.kill().await?;
                None
            }
        };

        for pipe in pipes {
            let _ = pipe.await;
        }
        Ok(status)
    }
}

/// Copy a child's output lines into our log
async fn forward_lines<R>(name: String, pid: u32, reader: R)
where
    R: AsyncRead + Unpin + Send + 'static,
{
    let mut lines = BufReader::new(reader).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        debug!(child = %name, pid, "{}", line);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn shell(script: &str) -> Vec<String> {
        vec!["-c".to_string(), script.to_string()]
    }

    #[tokio::test]
    async fn test_restarts_after_exit() {
        let dir = tempdir().unwrap();
        let marker = dir.path().join("starts");
        let script = format!("echo started >> {}", marker.display());

        let supervisor = Supervisor::new("/bin/sh").with_restart_delay(Duration::from_millis(10));
        let shutdown = CancellationToken::new();
        let task = {
            let shutdown = shutdown.clone();
            tokio::spawn(async move { supervisor.supervise("restart", shell(&script), shutdown).await })
        };

        tokio::time::timeout(Duration::from_secs(10), async {
            loop {
                let starts = std::fs::read_to_string(&marker).unwrap_or_default();
                if starts.lines().count() >= 3 {
                    break;
                }
                sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();

        shutdown.cancel();
        task.await.unwrap();
    }

    #[tokio::test]
    async fn test_shutdown_kills_running_child() {
        let supervisor = Supervisor::new("/bin/sh").with_restart_delay(Duration::from_millis(1));
        let shutdown = CancellationToken::new();
        let task = {
            let shutdown = shutdown.clone();
            tokio::spawn(async move {
                supervisor
                    .supervise("sleeper", shell("echo up; exec sleep 60"), shutdown)
                    .await
            })
        };

        sleep(Duration::from_millis(200)).await;
        shutdown.cancel();
        tokio::time::timeout(Duration::from_secs(5), task)
            .await
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn test_missing_program_keeps_retrying() {
        let supervisor =
            Supervisor::new("/nonexistent/beacond").with_restart_delay(Duration::from_millis(5));
        let shutdown = CancellationToken::new();
        let task = {
            let shutdown = shutdown.clone();
            tokio::spawn(async move { supervisor.supervise("missing", Vec::new(), shutdown).await })
        };

        sleep(Duration::from_millis(50)).await;
        assert!(!task.is_finished());
        shutdown.cancel();
        task.await.unwrap();
    }
}
