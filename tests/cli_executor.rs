#![cfg(unix)]

mod common;

use std::time::{Duration, Instant};

use taskrack::output::TRUNCATION_MARKER;
use taskrack::{CliExecutor, CliExecutorConfig, SafetyConfig, TaskBuilder, TaskError};

fn executor(config: CliExecutorConfig) -> CliExecutor {
    common::init_tracing();
    CliExecutor::new(config, SafetyConfig::default())
}

fn fast() -> CliExecutorConfig {
    CliExecutorConfig {
        retry_attempts: 3,
        retry_base_delay_ms: 10,
        kill_grace_ms: 200,
        ..CliExecutorConfig::default()
    }
}

#[tokio::test]
async fn captures_both_streams() {
    let task = TaskBuilder::new("greet", "echo hello; echo oops >&2").cli();
    let result = executor(fast()).execute(&task).await.unwrap();
    assert_eq!(result.stdout, "hello\n");
    assert_eq!(result.stderr, "oops\n");
    assert_eq!(result.exit_code, Some(0));
    assert!(!result.timed_out);
    assert_eq!(result.retry_count, 0);
    assert!(result.completed_at >= result.started_at);
}

#[tokio::test]
async fn args_and_environment_reach_the_command() {
    let task = TaskBuilder::new("env", "printf '%s-%s' \"$GREETING\"")
        .arg("world")
        .env("GREETING", "hi")
        .cli();
    let result = executor(fast()).execute(&task).await.unwrap();
    assert_eq!(result.stdout, "hi-world");
}

#[tokio::test]
async fn non_zero_exit_is_a_process_error() {
    let task = TaskBuilder::new("fail", "echo broken >&2; exit 3").cli();
    let err = executor(fast()).execute(&task).await.unwrap_err();
    match err {
        TaskError::Process {
            code,
            stderr,
            result,
            ..
        } => {
            assert_eq!(code, Some(3));
            assert_eq!(stderr, "broken\n");
            assert_eq!(result.retry_count, 0);
        }
        other => panic!("unexpected error {:?}", other),
    }
}

#[tokio::test]
async fn retryable_exit_codes_are_retried_until_exhausted() {
    let task = TaskBuilder::new("killed", "exit 137").cli();
    let started = Instant::now();
    let err = executor(fast()).execute(&task).await.unwrap_err();
    assert!(err.is_retryable());
    assert_eq!(err.result().unwrap().retry_count, 2);
    // 10ms + 20ms of backoff
    assert!(started.elapsed() >= Duration::from_millis(30));
}

#[tokio::test]
async fn timeout_kills_the_process() {
    let config = CliExecutorConfig {
        retry_attempts: 1,
        ..fast()
    };
    let task = TaskBuilder::new("slow", "sleep 10").timeout_ms(200).cli();
    let started = Instant::now();
    let err = executor(config).execute(&task).await.unwrap_err();
    assert!(started.elapsed() < Duration::from_secs(3));
    match err {
        TaskError::Timeout {
            timeout_ms, result, ..
        } => {
            assert_eq!(timeout_ms, 200);
            assert!(result.timed_out);
        }
        other => panic!("unexpected error {:?}", other),
    }
}

#[tokio::test]
async fn timeout_from_task_environment() {
    let config = CliExecutorConfig {
        retry_attempts: 1,
        ..fast()
    };
    let task = TaskBuilder::new("slow", "sleep 10").env("TIMEOUT", "150").cli();
    let err = executor(config).execute(&task).await.unwrap_err();
    assert!(matches!(err, TaskError::Timeout { timeout_ms: 150, .. }));
}

#[tokio::test]
async fn ignore_exit_code_via_environment() {
    let task = TaskBuilder::new("lint", "exit 7")
        .env("IGNORE_EXIT_CODE", "true")
        .cli();
    let result = executor(fast()).execute(&task).await.unwrap();
    assert_eq!(result.exit_code, Some(7));
}

#[tokio::test]
async fn output_is_truncated_once() {
    let config = CliExecutorConfig {
        max_output_bytes: 16,
        ..fast()
    };
    let task = TaskBuilder::new("noisy", "for i in $(seq 1 50); do echo 0123456789; done").cli();
    let result = executor(config).execute(&task).await.unwrap();
    assert!(result.stdout.ends_with(TRUNCATION_MARKER));
    assert_eq!(result.stdout.len(), 16 + TRUNCATION_MARKER.len());
    assert_eq!(result.stdout.matches("[output truncated]").count(), 1);
}

#[tokio::test]
async fn dangerous_commands_are_rejected_before_spawn() {
    let task = TaskBuilder::new("wipe", "rm -rf /").cli();
    let err = executor(fast()).execute(&task).await.unwrap_err();
    match err {
        TaskError::Validation { violations, .. } => assert!(!violations.is_empty()),
        other => panic!("unexpected error {:?}", other),
    }
}

#[tokio::test]
async fn working_directory_is_respected() {
    let dir = tempfile::tempdir().unwrap();
    let task = TaskBuilder::new("pwd", "pwd")
        .working_directory(dir.path().to_string_lossy())
        .cli();
    let result = executor(fast()).execute(&task).await.unwrap();
    let printed = std::fs::canonicalize(result.stdout.trim()).unwrap();
    assert_eq!(printed, std::fs::canonicalize(dir.path()).unwrap());
}
