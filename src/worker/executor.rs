use std::future::Future;
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tokio::process::Command;

use crate::task::Task;

/// Why a task produced no output.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ComputeError {
    /// The task itself failed; the worker stays assignable.
    #[error("Task failed: {0}")]
    Failed(String),

    /// The worker can no longer run tasks and leaves the pool.
    #[error("Worker unhealthy: {0}")]
    Unhealthy(String),
}

/// Executes task payloads. The coordinator never looks inside them.
#[async_trait]
pub trait Compute: Send + Sync {
    async fn compute(&self, task: &Task) -> Result<Vec<u8>, ComputeError>;
}

/// Runs each payload as a shell command and returns its stdout.
#[derive(Debug, Clone, Default)]
pub struct ShellCompute {
    timeout: Option<Duration>,
}

impl ShellCompute {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    fn process_output(task_id: &str, result: std::io::Result<std::process::Output>) -> Result<Vec<u8>, ComputeError> {
        match result {
            Ok(output) => {
                let exit_code = output.status.code();
                if output.status.success() {
                    tracing::info!(task_id, exit_code = ?exit_code, "Task completed");
                    Ok(output.stdout)
                } else {
                    let stderr = String::from_utf8_lossy(&output.stderr).trim_end().to_string();
                    tracing::info!(task_id, exit_code = ?exit_code, "Task failed");
                    Err(ComputeError::Failed(if stderr.is_empty() {
                        format!("Exit code: {:?}", exit_code)
                    } else {
                        stderr
                    }))
                }
            }
            // The shell itself could not be started; no later task will fare better.
            Err(e) => {
                tracing::error!(task_id, error = %e, "Could not spawn shell");
                Err(ComputeError::Unhealthy(e.to_string()))
            }
        }
    }
}

#[async_trait]
impl Compute for ShellCompute {
    async fn compute(&self, task: &Task) -> Result<Vec<u8>, ComputeError> {
        let command = String::from_utf8_lossy(&task.payload).into_owned();
        tracing::info!(task_id = %task.id, command = %command, "Executing task");

        let mut shell = Command::new("sh");
        shell
            .arg("-c")
            .arg(&command)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        let output = shell.output();

        let result = match self.timeout {
            Some(limit) => match tokio::time::timeout(limit, output).await {
                Ok(result) => result,
                Err(_) => {
                    tracing::warn!(task_id = %task.id, timeout_ms = limit.as_millis() as u64, "Task timed out");
                    return Err(ComputeError::Failed(format!(
                        "Timed out after {}ms",
                        limit.as_millis()
                    )));
                }
            },
            None => output.await,
        };
        Self::process_output(&task.id, result)
    }
}

/// Adapts an async closure into a [`Compute`].
pub struct FnCompute<F> {
    f: F,
}

impl<F> FnCompute<F> {
    pub fn new(f: F) -> Self {
        Self { f }
    }
}

#[async_trait]
impl<F, Fut> Compute for FnCompute<F>
where
    F: Fn(Task) -> Fut + Send + Sync,
    Fut: Future<Output = Result<Vec<u8>, ComputeError>> + Send + 'static,
{
    async fn compute(&self, task: &Task) -> Result<Vec<u8>, ComputeError> {
        (self.f)(task.clone()).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn nonzero_exit_without_stderr_reports_code() {
        let output = std::process::Command::new("sh")
            .arg("-c")
            .arg("exit 3")
            .output();
        let err = ShellCompute::process_output("t1", output).unwrap_err();
        assert_eq!(err, ComputeError::Failed("Exit code: Some(3)".to_string()));
    }

    #[test]
    fn spawn_failure_is_unhealthy() {
        let err = ShellCompute::process_output(
            "t1",
            Err(std::io::Error::new(std::io::ErrorKind::NotFound, "sh missing")),
        )
        .unwrap_err();
        assert!(matches!(err, ComputeError::Unhealthy(_)));
    }

    #[tokio::test]
    async fn closure_compute_sees_the_task() {
        let compute = FnCompute::new(|task: Task| async move {
            let mut out = task.id.into_bytes();
            out.extend_from_slice(&task.payload);
            Ok::<_, ComputeError>(out)
        });
        let out = compute
            .compute(&Task::pending("t1", b":x".to_vec()))
            .await
            .unwrap();
        assert_eq!(out, b"t1:x");
    }
}
