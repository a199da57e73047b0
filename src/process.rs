//! Data structures for tracking service state.
//!
//! This module defines the caller-visible handle of a supervised service
//! (`ServiceHandle`), its lifecycle status (`ServiceStatus`), and the
//! options and reports exchanged with the service executor.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::spawn::ProcessSignal;

/// Lifecycle status of a supervised service.
///
/// `Booting -> Running -> Stopping -> Stopped`, with `Failed` reachable from
/// any state. `Booting` is skipped when the task has no readiness block.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ServiceStatus {
    /// Spawned, waiting for readiness patterns.
    Booting,
    /// Ready, or boot timed out (fail-open).
    Running,
    /// A stop was requested and the process has not exited yet.
    Stopping,
    /// The process exited.
    Stopped,
    /// Spawn failed or the process reported an error.
    Failed,
}

impl ServiceStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, ServiceStatus::Stopped | ServiceStatus::Failed)
    }

    /// Whether the process was live (booting or running).
    pub fn is_live(self) -> bool {
        matches!(self, ServiceStatus::Booting | ServiceStatus::Running)
    }
}

/// Caller-visible state of one supervised service.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceHandle {
    /// Handle identifier, unique per start.
    pub id: String,
    /// Identifier of the task this service runs.
    pub task_id: String,
    pub created_at: DateTime<Utc>,
    pub pid: Option<u32>,
    /// Set on the transition to `Running` after a boot phase.
    pub booted_at: Option<DateTime<Utc>>,
    pub status: ServiceStatus,
    /// Pattern name to captured groups.
    pub readiness_matches: HashMap<String, Vec<String>>,
    /// Endpoint name to resolved URL.
    pub endpoints: HashMap<String, String>,
}

impl ServiceHandle {
    pub(crate) fn new(task_id: &str, status: ServiceStatus) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            task_id: task_id.to_string(),
            created_at: Utc::now(),
            pid: None,
            booted_at: None,
            status,
            readiness_matches: HashMap::new(),
            endpoints: HashMap::new(),
        }
    }
}

/// Snapshot returned by `ServiceExecutor::status`.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceStatusReport {
    pub handle: ServiceHandle,
    pub uptime_ms: u64,
    pub restart_count: u32,
}

/// Options for stopping a service.
#[derive(Debug, Clone, Copy, Default)]
pub struct StopOptions {
    /// Send SIGKILL immediately instead of the graceful signal.
    pub force: bool,
    /// Overrides the task and executor shutdown timeout.
    pub timeout_ms: Option<u64>,
    /// Overrides the task and executor shutdown signal.
    pub signal: Option<ProcessSignal>,
}

impl StopOptions {
    pub fn force() -> Self {
        Self {
            force: true,
            ..Self::default()
        }
    }
}
