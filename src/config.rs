//! Configuration management for taskrack.
//!
//! This module defines the executor settings and the structure of the
//! `taskrack.toml` task file, and provides functionality to load and parse it.

use std::collections::HashMap;
use std::path::Path;

use anyhow::{Context, Result};
use serde::Deserialize;

use crate::spawn::ProcessSignal;
use crate::task::{CliTask, ServiceTask};

/// Top-level structure of `taskrack.toml`.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct TaskFile {
    /// Executor settings.
    #[serde(default)]
    pub executor: ExecutorConfig,
    /// CLI tasks run to completion, in order, before services start.
    #[serde(default, rename = "command")]
    pub commands: Vec<CliTask>,
    /// Long-running services.
    #[serde(default, rename = "service")]
    pub services: Vec<ServiceTask>,
}

/// Settings for both executors and the command-safety check.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct ExecutorConfig {
    pub cli: CliExecutorConfig,
    pub service: ServiceExecutorConfig,
    pub safety: SafetyConfig,
}

/// Settings for the CLI executor.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CliExecutorConfig {
    /// Timeout applied when a task sets none.
    pub default_timeout_ms: u64,
    /// Total attempts per `execute` call, including the first.
    pub retry_attempts: u32,
    /// Base of the exponential retry backoff.
    pub retry_base_delay_ms: u64,
    /// Signal sent when a task times out.
    pub kill_signal: ProcessSignal,
    /// Time allowed after `kill_signal` before SIGKILL.
    pub kill_grace_ms: u64,
    /// Combined stdout+stderr capture budget in bytes.
    pub max_output_bytes: usize,
    /// Environment merged under every task's own environment.
    pub environment: HashMap<String, String>,
}

impl Default for CliExecutorConfig {
    fn default() -> Self {
        Self {
            default_timeout_ms: 300_000,
            retry_attempts: 3,
            retry_base_delay_ms: 1_000,
            kill_signal: ProcessSignal::SigTerm,
            kill_grace_ms: 5_000,
            max_output_bytes: 1024 * 1024,
            environment: HashMap::new(),
        }
    }
}

/// Settings for the service executor.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServiceExecutorConfig {
    /// Log lines retained per service.
    pub max_log_size: usize,
    /// Stop signal when neither the call nor the task names one.
    pub shutdown_signal: ProcessSignal,
    /// Stop timeout when neither the call nor the task names one.
    pub shutdown_timeout_ms: u64,
    /// Time allowed for a forced kill to be observed after a stop timeout.
    pub force_kill_grace_ms: u64,
    /// Boot timeout when the readiness block sets none.
    pub boot_timeout_ms: u64,
    /// Restart delay when the restart policy sets none.
    pub restart_delay_ms: u64,
    /// Restart attempts when the restart policy sets none.
    pub max_retries: u32,
    /// Events buffered per subscriber before slow subscribers lag.
    pub event_capacity: usize,
    /// Environment merged under every task's own environment.
    pub environment: HashMap<String, String>,
    pub port_release: PortReleaseConfig,
}

impl Default for ServiceExecutorConfig {
    fn default() -> Self {
        Self {
            max_log_size: 1_000,
            shutdown_signal: ProcessSignal::SigTerm,
            shutdown_timeout_ms: 10_000,
            force_kill_grace_ms: 5_000,
            boot_timeout_ms: 30_000,
            restart_delay_ms: 1_000,
            max_retries: 3,
            event_capacity: 1_024,
            environment: HashMap::new(),
            port_release: PortReleaseConfig::default(),
        }
    }
}

/// Timing of post-exit port release verification.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PortReleaseConfig {
    /// Delay before the first probe.
    pub grace_ms: u64,
    /// Delay between probes.
    pub interval_ms: u64,
    /// Overall deadline measured from the first probe.
    pub timeout_ms: u64,
    /// Maximum probe rounds.
    pub max_retries: u32,
}

impl Default for PortReleaseConfig {
    fn default() -> Self {
        Self {
            grace_ms: 500,
            interval_ms: 100,
            timeout_ms: 5_000,
            max_retries: 50,
        }
    }
}

/// The dangerous-command denylist.
///
/// This guards against obvious mistakes; it is not a security boundary.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SafetyConfig {
    pub enabled: bool,
    /// Extra substrings rejected on top of the built-in list.
    pub extra_denied: Vec<String>,
}

impl Default for SafetyConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            extra_denied: Vec::new(),
        }
    }
}

/// Loads and parses the task file from a file path.
pub fn load_config(path: &Path) -> Result<TaskFile> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read config file {}", path.display()))?;
    let config: TaskFile = toml::from_str(&raw)
        .with_context(|| format!("failed to parse config file {}", path.display()))?;
    Ok(config)
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::*;

    #[test]
    fn parses_optional_fields() {
        let raw = r#"
[executor.cli]
default_timeout_ms = 1000
retry_attempts = 5
kill_signal = "SIGINT"

[executor.service]
max_log_size = 200
shutdown_timeout_ms = 750

[executor.service.port_release]
interval_ms = 20

[executor.safety]
extra_denied = ["drop database"]

[[command]]
id = "install"
command = "npm"
args = ["ci"]
timeout_ms = 60000

[[service]]
id = "api"
command = "cargo run"

[service.restart_policy]
enabled = true
"#;
        let config: TaskFile = toml::from_str(raw).unwrap();
        assert_eq!(config.executor.cli.default_timeout_ms, 1000);
        assert_eq!(config.executor.cli.retry_attempts, 5);
        assert_eq!(config.executor.cli.kill_signal, ProcessSignal::SigInt);
        assert_eq!(config.executor.cli.kill_grace_ms, 5_000);
        assert_eq!(config.executor.service.max_log_size, 200);
        assert_eq!(config.executor.service.shutdown_timeout_ms, 750);
        assert_eq!(config.executor.service.port_release.interval_ms, 20);
        assert_eq!(config.executor.service.port_release.grace_ms, 500);
        assert!(config.executor.safety.enabled);
        assert_eq!(config.executor.safety.extra_denied, vec!["drop database"]);
        assert_eq!(config.commands.len(), 1);
        assert_eq!(config.commands[0].timeout_ms, Some(60000));
        assert_eq!(config.services.len(), 1);
        assert!(config.services[0].restart_policy.as_ref().unwrap().enabled);
    }

    #[test]
    fn empty_file_uses_defaults() {
        let config: TaskFile = toml::from_str("").unwrap();
        assert!(config.commands.is_empty());
        assert_eq!(config.executor.cli.retry_attempts, 3);
        assert_eq!(config.executor.service.boot_timeout_ms, 30_000);
    }

    #[test]
    fn load_config_reports_path_on_error() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[[service]]\nid = 3").unwrap();
        let err = load_config(file.path()).unwrap_err();
        assert!(err.to_string().contains("failed to parse config file"));
    }
}
