//! Structural validation of tasks before anything is spawned.
//!
//! Every violation found is collected so the caller sees the full list in a
//! single [`TaskError::Validation`]. The dangerous-command check is a
//! conservative denylist meant to catch obvious mistakes such as a recursive
//! delete of `/`. It is not a sandbox and must not be relied on as one.

use crate::config::SafetyConfig;
use crate::errors::{Result, TaskError};
use crate::readiness::compile_pattern;
use crate::task::{CliTask, ServiceTask, Task};

/// Command fragments rejected unless the task opts out.
const DENIED_FRAGMENTS: &[&str] = &[
    "rm -rf /",
    "rm -rf /*",
    "rm -rf ~",
    "rm -fr /",
    "rm --no-preserve-root",
    ":(){ :|:& };:",
    "mkfs",
    "dd if=/dev/zero of=/dev/",
    "dd if=/dev/random of=/dev/",
    "dd if=/dev/urandom of=/dev/",
    "> /dev/sda",
    "of=/dev/sda",
    "format c:",
    "del /f /s /q c:\\",
    "rd /s /q c:\\",
    "chmod -r 777 /",
];

/// Validates tasks against structural rules and the command denylist.
#[derive(Debug, Clone, Default)]
pub struct TaskValidator {
    safety: SafetyConfig,
}

impl TaskValidator {
    pub fn new(safety: SafetyConfig) -> Self {
        Self { safety }
    }

    pub fn validate_cli(&self, task: &CliTask) -> Result<()> {
        let mut violations = Vec::new();
        check_common(&task.task, &mut violations);
        if task.timeout_ms == Some(0) {
            violations.push("timeout_ms must be greater than zero".to_string());
        }
        if !task.allows_dangerous() {
            self.check_command_safety(&task.task, &mut violations);
        }
        finish(&task.task, violations)
    }

    pub fn validate_service(&self, task: &ServiceTask) -> Result<()> {
        let mut violations = Vec::new();
        check_common(&task.task, &mut violations);
        if !task.allows_dangerous() {
            self.check_command_safety(&task.task, &mut violations);
        }
        if task.graceful_shutdown.timeout_ms == Some(0) {
            violations.push("graceful_shutdown.timeout_ms must be greater than zero".to_string());
        }
        if let Some(readiness) = &task.readiness {
            if readiness.timeout_ms == Some(0) {
                violations.push("readiness.timeout_ms must be greater than zero".to_string());
            }
            for (index, pattern) in readiness.patterns.iter().enumerate() {
                let label = pattern
                    .name
                    .clone()
                    .unwrap_or_else(|| index.to_string());
                let regex = match compile_pattern(pattern) {
                    Ok(regex) => regex,
                    Err(err) => {
                        violations.push(format!("readiness pattern {}: {}", label, err));
                        continue;
                    }
                };
                for endpoint in &pattern.endpoints {
                    if endpoint.endpoint_name.trim().is_empty() {
                        violations.push(format!(
                            "readiness pattern {}: endpoint name is empty",
                            label
                        ));
                    }
                    if endpoint.capture_group_index >= regex.captures_len() {
                        violations.push(format!(
                            "readiness pattern {}: endpoint {} uses capture group {} but the pattern has {}",
                            label,
                            endpoint.endpoint_name,
                            endpoint.capture_group_index,
                            regex.captures_len() - 1
                        ));
                    }
                }
            }
        }
        finish(&task.task, violations)
    }

    fn check_command_safety(&self, task: &Task, violations: &mut Vec<String>) {
        if !self.safety.enabled {
            return;
        }
        let line = task.command_line().to_lowercase();
        let denied = DENIED_FRAGMENTS
            .iter()
            .map(|s| s.to_string())
            .chain(self.safety.extra_denied.iter().map(|s| s.to_lowercase()));
        for fragment in denied {
            if matches_fragment(&line, &fragment) {
                violations.push(format!(
                    "command contains dangerous fragment '{}' (set ALLOW_DANGEROUS=true to override)",
                    fragment
                ));
            }
        }
    }
}

// `rm -rf /` must not flag `rm -rf /tmp/build`, so a fragment ending in `/`
// only counts when followed by whitespace, `*` or the end of the line.
fn matches_fragment(line: &str, fragment: &str) -> bool {
    if !fragment.ends_with('/') {
        return line.contains(fragment);
    }
    line.match_indices(fragment).any(|(idx, _)| {
        line[idx + fragment.len()..]
            .chars()
            .next()
            .map(|c| c.is_whitespace() || c == '*' || c == ';' || c == '&' || c == '|')
            .unwrap_or(true)
    })
}

fn check_common(task: &Task, violations: &mut Vec<String>) {
    if task.command.trim().is_empty() {
        violations.push("command must be a non-empty string".to_string());
    }
    if task.command.contains('\0') || task.args.iter().any(|a| a.contains('\0')) {
        violations.push("command and args must not contain NUL bytes".to_string());
    }
    if let Some(dir) = &task.working_directory {
        if dir.trim().is_empty() {
            violations.push("working_directory must not be empty when set".to_string());
        }
    }
    for key in task.environment.keys() {
        if key.is_empty() || key.contains('=') || key.contains('\0') {
            violations.push(format!("invalid environment variable name '{}'", key));
        }
    }
}

fn finish(task: &Task, violations: Vec<String>) -> Result<()> {
    if violations.is_empty() {
        return Ok(());
    }
    Err(TaskError::Validation {
        task_id: task.id.clone(),
        violations,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::{EndpointCaptureGroup, ReadinessPattern, TaskBuilder, ENV_ALLOW_DANGEROUS};

    fn violations(err: TaskError) -> Vec<String> {
        match err {
            TaskError::Validation { violations, .. } => violations,
            other => panic!("expected validation error, got {other}"),
        }
    }

    #[test]
    fn collects_every_violation() {
        let task = TaskBuilder::new("bad", "  ")
            .id("bad")
            .working_directory("")
            .env("A=B", "x")
            .cli();
        let err = TaskValidator::default().validate_cli(&task).unwrap_err();
        match &err {
            TaskError::Validation { task_id, .. } => assert_eq!(task_id, "bad"),
            other => panic!("unexpected {other}"),
        }
        assert_eq!(violations(err).len(), 3);
    }

    #[test]
    fn rejects_dangerous_commands_unless_allowed() {
        let validator = TaskValidator::default();
        let task = TaskBuilder::new("wipe", "rm").args(["-rf", "/"]).cli();
        assert!(validator.validate_cli(&task).is_err());

        let task = TaskBuilder::new("wipe", "sudo mkfs.ext4 /dev/sdb1").cli();
        assert!(validator.validate_cli(&task).is_err());

        let task = TaskBuilder::new("wipe", "rm")
            .args(["-rf", "/"])
            .env(ENV_ALLOW_DANGEROUS, "true")
            .cli();
        assert!(validator.validate_cli(&task).is_ok());
    }

    #[test]
    fn scoped_deletes_are_allowed() {
        let task = TaskBuilder::new("clean", "rm -rf /tmp/build && rm -rf ./dist").cli();
        assert!(TaskValidator::default().validate_cli(&task).is_ok());
    }

    #[test]
    fn extra_denied_fragments_and_disabled_check() {
        let safety = SafetyConfig {
            enabled: true,
            extra_denied: vec!["DROP DATABASE".into()],
        };
        let task = TaskBuilder::new("db", "psql -c 'drop database prod'").cli();
        assert!(TaskValidator::new(safety).validate_cli(&task).is_err());

        let disabled = SafetyConfig {
            enabled: false,
            extra_denied: Vec::new(),
        };
        let task = TaskBuilder::new("wipe", "rm -rf /").cli();
        assert!(TaskValidator::new(disabled).validate_cli(&task).is_ok());
    }

    #[test]
    fn service_readiness_is_checked() {
        let task = TaskBuilder::new("web", "serve")
            .readiness(
                vec![
                    ReadinessPattern::new("port (\\d+)")
                        .named("port")
                        .endpoint(EndpointCaptureGroup::new("http", "http://localhost", 2)),
                    ReadinessPattern::new("(unclosed").named("broken"),
                    ReadinessPattern::new("ok").flags("q"),
                ],
                0,
            )
            .service();
        let found = violations(TaskValidator::default().validate_service(&task).unwrap_err());
        assert_eq!(found.len(), 4, "{found:?}");
        assert!(found.iter().any(|v| v.contains("capture group 2")));
    }

    #[test]
    fn valid_service_passes() {
        let task = TaskBuilder::new("web", "serve")
            .restart_policy(2, 100)
            .readiness(
                vec![ReadinessPattern::new("port (\\d+)")
                    .endpoint(EndpointCaptureGroup::new("http", "http://localhost", 1))],
                5_000,
            )
            .service();
        assert!(TaskValidator::default().validate_service(&task).is_ok());
    }
}
