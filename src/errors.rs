//! Error taxonomy for task execution.
//!
//! Validation failures are fatal and never retried. Timeouts are always
//! retryable. Process failures are retryable only for exit codes produced by
//! transient termination. Spawn failures are retried only when their message
//! looks like a transient resource or network problem.

use thiserror::Error;

use crate::cli_executor::ExecutionResult;

/// Exit codes conventionally produced by `timeout(1)`, SIGKILL and SIGTERM.
const RETRYABLE_EXIT_CODES: &[i32] = &[124, 137, 143];

/// Message fragments that mark an error as transient regardless of its kind.
const TRANSIENT_MESSAGES: &[&str] = &[
    "econnrefused",
    "connection refused",
    "etimedout",
    "timed out",
    "enotfound",
    "name or service not known",
    "enomem",
    "cannot allocate memory",
    "out of memory",
];

#[derive(Error, Debug)]
pub enum TaskError {
    #[error("task {task_id} failed validation: {}", .violations.join("; "))]
    Validation {
        task_id: String,
        violations: Vec<String>,
    },

    #[error("task {task_id} timed out after {timeout_ms}ms")]
    Timeout {
        task_id: String,
        timeout_ms: u64,
        result: Box<ExecutionResult>,
    },

    #[error("task {task_id} exited with {}", describe_exit(*.code, .signal.as_deref()))]
    Process {
        task_id: String,
        code: Option<i32>,
        signal: Option<String>,
        stderr: String,
        result: Box<ExecutionResult>,
    },

    #[error("failed to execute task {task_id}: {source}")]
    Execution {
        task_id: String,
        #[source]
        source: std::io::Error,
    },

    #[error("service not found: {0}")]
    ServiceNotFound(String),

    #[error("task {0} already has a running service")]
    AlreadyRunning(String),
}

pub type Result<T> = std::result::Result<T, TaskError>;

impl TaskError {
    /// Whether the CLI executor may retry after this error.
    pub fn is_retryable(&self) -> bool {
        match self {
            TaskError::Validation { .. } => false,
            TaskError::Timeout { .. } => true,
            TaskError::Process { code, stderr, .. } => {
                code.map(|c| RETRYABLE_EXIT_CODES.contains(&c))
                    .unwrap_or(false)
                    || is_transient_message(stderr)
            }
            _ => is_transient_message(&self.to_string()),
        }
    }

    /// The partial result captured before the failure, if the process ran.
    pub fn result(&self) -> Option<&ExecutionResult> {
        match self {
            TaskError::Timeout { result, .. } | TaskError::Process { result, .. } => Some(result),
            _ => None,
        }
    }

    pub(crate) fn result_mut(&mut self) -> Option<&mut ExecutionResult> {
        match self {
            TaskError::Timeout { result, .. } | TaskError::Process { result, .. } => Some(result),
            _ => None,
        }
    }
}

fn is_transient_message(message: &str) -> bool {
    let lower = message.to_lowercase();
    TRANSIENT_MESSAGES.iter().any(|needle| lower.contains(needle))
}

fn describe_exit(code: Option<i32>, signal: Option<&str>) -> String {
    match (code, signal) {
        (Some(code), _) => format!("code {}", code),
        (None, Some(signal)) => format!("signal {}", signal),
        (None, None) => "unknown status".to_string(),
    }
}
