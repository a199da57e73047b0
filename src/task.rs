//! Task definitions handed to the executors.
//!
//! A [`Task`] describes a command to run. [`CliTask`] wraps it for finite
//! commands run to completion and [`ServiceTask`] for long-running processes
//! that are supervised until stopped. Tasks are plain data: executors never
//! mutate them, and results are returned rather than stored here.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::output::StreamKind;
use crate::spawn::ProcessSignal;

/// Environment key overriding the CLI timeout (milliseconds).
pub const ENV_TIMEOUT: &str = "TIMEOUT";
/// Environment key that makes a non-zero exit code count as success.
pub const ENV_IGNORE_EXIT_CODE: &str = "IGNORE_EXIT_CODE";
/// Environment key that bypasses the dangerous-command denylist.
pub const ENV_ALLOW_DANGEROUS: &str = "ALLOW_DANGEROUS";

fn new_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

/// Fields shared by every task kind.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    /// Unique identifier. Generated when omitted.
    #[serde(default = "new_id")]
    pub id: String,
    /// Human readable title.
    #[serde(default)]
    pub title: String,
    /// Free-text instructions describing what the task is for.
    #[serde(default)]
    pub instructions: String,
    /// Command to execute. Interpreted by the platform shell.
    pub command: String,
    /// Arguments appended to the command.
    #[serde(default)]
    pub args: Vec<String>,
    /// Working directory, relative paths resolve against the current dir.
    #[serde(default)]
    pub working_directory: Option<String>,
    /// Environment overrides merged over the inherited environment.
    #[serde(default)]
    pub environment: HashMap<String, String>,
}

impl Task {
    /// The command line handed to the shell: command followed by its args.
    pub fn command_line(&self) -> String {
        if self.args.is_empty() {
            return self.command.clone();
        }
        format!("{} {}", self.command, self.args.join(" "))
    }

    /// Returns `true` when the environment sets `key` to `true` or `1`.
    pub fn env_flag(&self, key: &str) -> bool {
        self.environment
            .get(key)
            .map(|v| matches!(v.trim().to_ascii_lowercase().as_str(), "true" | "1"))
            .unwrap_or(false)
    }
}

/// A finite command executed to completion.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CliTask {
    #[serde(flatten)]
    pub task: Task,
    /// Per-task timeout override in milliseconds.
    #[serde(default)]
    pub timeout_ms: Option<u64>,
    /// Treat non-zero exit codes as success.
    #[serde(default)]
    pub ignore_exit_code: bool,
    /// Skip the dangerous-command check.
    #[serde(default)]
    pub allow_dangerous: bool,
}

impl CliTask {
    /// Effective timeout: explicit field, then `TIMEOUT` env, then `default_ms`.
    pub fn effective_timeout_ms(&self, default_ms: u64) -> u64 {
        self.timeout_ms
            .or_else(|| {
                self.task
                    .environment
                    .get(ENV_TIMEOUT)
                    .and_then(|v| v.trim().parse().ok())
            })
            .unwrap_or(default_ms)
    }

    pub fn ignores_exit_code(&self) -> bool {
        self.ignore_exit_code || self.task.env_flag(ENV_IGNORE_EXIT_CODE)
    }

    pub fn allows_dangerous(&self) -> bool {
        self.allow_dangerous || self.task.env_flag(ENV_ALLOW_DANGEROUS)
    }
}

/// A long-running process supervised by the service executor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServiceTask {
    #[serde(flatten)]
    pub task: Task,
    /// How the service is asked to stop.
    #[serde(default)]
    pub graceful_shutdown: GracefulShutdown,
    /// Recovery from unexpected exits.
    #[serde(default)]
    pub restart_policy: Option<RestartPolicy>,
    /// Output patterns that must appear before the service counts as ready.
    #[serde(default)]
    pub readiness: Option<ReadinessConfig>,
}

impl ServiceTask {
    pub fn allows_dangerous(&self) -> bool {
        self.task.env_flag(ENV_ALLOW_DANGEROUS)
    }
}

/// Signal and timeout used when stopping a service.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GracefulShutdown {
    /// Signal sent first. Falls back to the executor default.
    #[serde(default)]
    pub signal: Option<ProcessSignal>,
    /// Time to wait for exit before forcing. Falls back to the executor default.
    #[serde(default)]
    pub timeout_ms: Option<u64>,
}

/// Restart behaviour after an unexpected non-zero exit.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RestartPolicy {
    pub enabled: bool,
    /// Maximum restart attempts. Falls back to the executor default.
    #[serde(default)]
    pub max_retries: Option<u32>,
    /// Base delay between attempts, scaled by the attempt number.
    #[serde(default, alias = "delay")]
    pub delay_ms: Option<u64>,
}

/// Readiness detection settings for the boot phase.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ReadinessConfig {
    pub patterns: Vec<ReadinessPattern>,
    /// Boot timeout. Falls back to the executor default.
    #[serde(default)]
    pub timeout_ms: Option<u64>,
}

/// Which output stream a readiness pattern listens to.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StreamSelector {
    Stdout,
    Stderr,
    #[default]
    Any,
}

impl StreamSelector {
    pub fn accepts(self, stream: StreamKind) -> bool {
        match self {
            StreamSelector::Any => true,
            StreamSelector::Stdout => stream == StreamKind::Stdout,
            StreamSelector::Stderr => stream == StreamKind::Stderr,
        }
    }
}

/// A regular expression matched against live service output.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReadinessPattern {
    pub pattern: String,
    /// Regex flags (`i`, `m`, `s`, `x`, `U`).
    #[serde(default)]
    pub flags: String,
    #[serde(default)]
    pub stream: StreamSelector,
    /// Name used in readiness evidence. Defaults to the pattern's index.
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub endpoints: Vec<EndpointCaptureGroup>,
}

impl ReadinessPattern {
    pub fn new(pattern: impl Into<String>) -> Self {
        Self {
            pattern: pattern.into(),
            flags: String::new(),
            stream: StreamSelector::Any,
            name: None,
            endpoints: Vec::new(),
        }
    }

    pub fn named(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn on(mut self, stream: StreamSelector) -> Self {
        self.stream = stream;
        self
    }

    pub fn flags(mut self, flags: impl Into<String>) -> Self {
        self.flags = flags.into();
        self
    }

    pub fn endpoint(mut self, endpoint: EndpointCaptureGroup) -> Self {
        self.endpoints.push(endpoint);
        self
    }
}

/// Derives an endpoint URL from one capture group of a readiness match.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EndpointCaptureGroup {
    pub endpoint_name: String,
    /// Host prefix joined with the captured port. Empty means the capture is
    /// already a full URL.
    #[serde(default)]
    pub endpoint_default_host_url: String,
    pub capture_group_index: usize,
    /// Verify the captured port is released after the service exits.
    #[serde(default)]
    pub monitor_port_release_upon_termination: bool,
}

impl EndpointCaptureGroup {
    pub fn new(
        name: impl Into<String>,
        default_host_url: impl Into<String>,
        capture_group_index: usize,
    ) -> Self {
        Self {
            endpoint_name: name.into(),
            endpoint_default_host_url: default_host_url.into(),
            capture_group_index,
            monitor_port_release_upon_termination: false,
        }
    }

    pub fn monitor_port_release(mut self) -> Self {
        self.monitor_port_release_upon_termination = true;
        self
    }
}

/// Builds fully-defaulted tasks.
#[derive(Debug, Clone)]
pub struct TaskBuilder {
    task: Task,
    graceful_shutdown: GracefulShutdown,
    restart_policy: Option<RestartPolicy>,
    readiness: Option<ReadinessConfig>,
    timeout_ms: Option<u64>,
}

impl TaskBuilder {
    pub fn new(title: impl Into<String>, command: impl Into<String>) -> Self {
        Self {
            task: Task {
                id: new_id(),
                title: title.into(),
                instructions: String::new(),
                command: command.into(),
                args: Vec::new(),
                working_directory: None,
                environment: HashMap::new(),
            },
            graceful_shutdown: GracefulShutdown::default(),
            restart_policy: None,
            readiness: None,
            timeout_ms: None,
        }
    }

    pub fn id(mut self, id: impl Into<String>) -> Self {
        self.task.id = id.into();
        self
    }

    pub fn instructions(mut self, instructions: impl Into<String>) -> Self {
        self.task.instructions = instructions.into();
        self
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.task.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.task.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn working_directory(mut self, dir: impl Into<String>) -> Self {
        self.task.working_directory = Some(dir.into());
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.task.environment.insert(key.into(), value.into());
        self
    }

    pub fn timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.timeout_ms = Some(timeout_ms);
        self
    }

    pub fn graceful_shutdown(mut self, signal: ProcessSignal, timeout_ms: u64) -> Self {
        self.graceful_shutdown = GracefulShutdown {
            signal: Some(signal),
            timeout_ms: Some(timeout_ms),
        };
        self
    }

    pub fn restart_policy(mut self, max_retries: u32, delay_ms: u64) -> Self {
        self.restart_policy = Some(RestartPolicy {
            enabled: true,
            max_retries: Some(max_retries),
            delay_ms: Some(delay_ms),
        });
        self
    }

    pub fn readiness(mut self, patterns: Vec<ReadinessPattern>, timeout_ms: u64) -> Self {
        self.readiness = Some(ReadinessConfig {
            patterns,
            timeout_ms: Some(timeout_ms),
        });
        self
    }

    pub fn build(self) -> Task {
        self.task
    }

    pub fn cli(self) -> CliTask {
        CliTask {
            task: self.task,
            timeout_ms: self.timeout_ms,
            ignore_exit_code: false,
            allow_dangerous: false,
        }
    }

    pub fn service(self) -> ServiceTask {
        ServiceTask {
            task: self.task,
            graceful_shutdown: self.graceful_shutdown,
            restart_policy: self.restart_policy,
            readiness: self.readiness,
        }
    }
}
