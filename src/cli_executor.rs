//! Short-lived command execution.
//!
//! `CliExecutor` runs a [`CliTask`] to completion through the platform shell,
//! enforcing a timeout with graceful-then-forced termination, capturing a
//! bounded amount of output, and retrying transient failures with
//! exponential backoff.

use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::io::{AsyncRead, AsyncReadExt};
use tracing::{debug, info, warn};

use crate::config::{CliExecutorConfig, SafetyConfig};
use crate::errors::{Result, TaskError};
use crate::output::{OutputCapture, StreamKind};
use crate::spawn::{exit_signal, shell_command, terminate, wait_for_exit};
use crate::task::CliTask;
use crate::validate::TaskValidator;

/// Outcome of a CLI task attempt.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ExecutionResult {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: Option<i32>,
    pub signal: Option<String>,
    pub timed_out: bool,
    pub started_at: DateTime<Utc>,
    pub completed_at: DateTime<Utc>,
    pub duration_ms: u64,
    /// Retries performed before this attempt (0 on first-try success).
    pub retry_count: u32,
}

/// Runs CLI tasks with timeout, output bounds and retries.
#[derive(Debug, Clone)]
pub struct CliExecutor {
    config: CliExecutorConfig,
    validator: TaskValidator,
}

impl CliExecutor {
    pub fn new(config: CliExecutorConfig, safety: SafetyConfig) -> Self {
        Self {
            config,
            validator: TaskValidator::new(safety),
        }
    }

    pub fn config(&self) -> &CliExecutorConfig {
        &self.config
    }

    /// Validates and runs `task`, retrying retryable failures.
    ///
    /// The error of the final attempt is returned when every attempt fails.
    pub async fn execute(&self, task: &CliTask) -> Result<ExecutionResult> {
        self.validator.validate_cli(task)?;

        let attempts = self.config.retry_attempts.max(1);
        let mut attempt = 0u32;
        loop {
            match self.run_attempt(task).await {
                Ok(mut result) => {
                    result.retry_count = attempt;
                    info!(
                        task = %task.task.id,
                        exit_code = ?result.exit_code,
                        duration_ms = result.duration_ms,
                        retries = attempt,
                        "command finished"
                    );
                    return Ok(result);
                }
                Err(mut err) => {
                    if let Some(result) = err.result_mut() {
                        result.retry_count = attempt;
                    }
                    if attempt + 1 >= attempts || !err.is_retryable() {
                        warn!(task = %task.task.id, attempt = attempt + 1, error = %err, "command failed");
                        return Err(err);
                    }
                    let delay = backoff_delay(self.config.retry_base_delay_ms, attempt);
                    warn!(
                        task = %task.task.id,
                        attempt = attempt + 1,
                        max_attempts = attempts,
                        delay_ms = delay.as_millis() as u64,
                        error = %err,
                        "command failed, retrying"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
            }
        }
    }

    async fn run_attempt(&self, task: &CliTask) -> Result<ExecutionResult> {
        let task_id = task.task.id.clone();
        let timeout_ms = task.effective_timeout_ms(self.config.default_timeout_ms);
        let grace = Duration::from_millis(self.config.kill_grace_ms);
        let started_at = Utc::now();
        let clock = Instant::now();

        debug!(task = %task_id, cmd = %task.task.command_line(), timeout_ms, "spawning command");
        let mut child = shell_command(&task.task, &self.config.environment)
            .spawn()
            .map_err(|source| TaskError::Execution {
                task_id: task_id.clone(),
                source,
            })?;

        let capture = Arc::new(Mutex::new(OutputCapture::new(self.config.max_output_bytes)));
        let mut readers = Vec::new();
        if let Some(stdout) = child.stdout.take() {
            readers.push(tokio::spawn(drain(stdout, StreamKind::Stdout, capture.clone())));
        }
        if let Some(stderr) = child.stderr.take() {
            readers.push(tokio::spawn(drain(stderr, StreamKind::Stderr, capture.clone())));
        }

        let waited = wait_for_exit(&mut child, Duration::from_millis(timeout_ms)).await;
        let (status, timed_out) = match waited {
            Ok(Some(status)) => (status, false),
            Ok(None) => {
                warn!(task = %task_id, timeout_ms, "command timed out, terminating");
                let status = terminate(&mut child, self.config.kill_signal, grace)
                    .await
                    .map_err(|source| TaskError::Execution {
                        task_id: task_id.clone(),
                        source,
                    })?;
                (status, true)
            }
            Err(source) => return Err(TaskError::Execution { task_id, source }),
        };

        // Grandchildren may keep the pipes open; don't wait on them forever.
        for reader in readers {
            if tokio::time::timeout(grace, reader).await.is_err() {
                debug!(task = %task_id, "output reader still open after exit");
            }
        }

        let (stdout, stderr) = {
            let capture = capture.lock().unwrap_or_else(PoisonError::into_inner);
            (capture.stdout(), capture.stderr())
        };
        let result = ExecutionResult {
            stdout,
            stderr,
            exit_code: status.code(),
            signal: exit_signal(&status),
            timed_out,
            started_at,
            completed_at: Utc::now(),
            duration_ms: clock.elapsed().as_millis() as u64,
            retry_count: 0,
        };

        if timed_out {
            return Err(TaskError::Timeout {
                task_id,
                timeout_ms,
                result: Box::new(result),
            });
        }
        if !status.success() && !task.ignores_exit_code() {
            return Err(TaskError::Process {
                task_id,
                code: result.exit_code,
                signal: result.signal.clone(),
                stderr: result.stderr.clone(),
                result: Box::new(result),
            });
        }
        Ok(result)
    }
}

/// `base * 2^attempt`, saturating.
fn backoff_delay(base_ms: u64, attempt: u32) -> Duration {
    let factor = 1u64 << attempt.min(20);
    Duration::from_millis(base_ms.saturating_mul(factor))
}

async fn drain<R>(mut reader: R, stream: StreamKind, capture: Arc<Mutex<OutputCapture>>)
where
    R: AsyncRead + Unpin,
{
    let mut buf = [0u8; 8192];
    loop {
        match reader.read(&mut buf).await {
            Ok(0) | Err(_) => break,
            Ok(n) => capture
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .append(stream, &buf[..n]),
        }
    }
}
