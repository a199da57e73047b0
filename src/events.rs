//! Events published by the service executor.
//!
//! Every variant serializes with an `event` tag carrying the stable
//! kebab-case name subscribers match on (`service-started`, `readiness-match`,
//! ...). Payload fields are fixed per variant and serialize in camelCase;
//! millisecond fields drop their unit suffix (`bootDuration`, `timeout`,
//! `duration`).

use std::collections::HashMap;

use serde::Serialize;

use crate::output::StreamKind;
use crate::process::ServiceHandle;
use crate::task::{ReadinessConfig, ServiceTask};

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", rename_all = "kebab-case", rename_all_fields = "camelCase")]
pub enum ServiceEvent {
    /// The process was spawned.
    ServiceStarted {
        handle: ServiceHandle,
        task: Box<ServiceTask>,
    },
    /// The service entered its boot phase.
    ServiceBooting {
        handle: ServiceHandle,
        readiness_config: ReadinessConfig,
    },
    /// One readiness pattern matched.
    ReadinessMatch {
        handle: ServiceHandle,
        pattern: String,
        matches: Vec<String>,
    },
    /// Every readiness pattern matched.
    ServiceReady {
        handle: ServiceHandle,
        #[serde(rename = "bootDuration")]
        boot_duration_ms: u64,
        readiness_matches: HashMap<String, Vec<String>>,
    },
    /// The boot phase timed out; the service is treated as running anyway.
    BootTimeout {
        handle: ServiceHandle,
        #[serde(rename = "timeout")]
        timeout_ms: u64,
    },
    /// A line of output from the process.
    ServiceOutput {
        service_id: String,
        #[serde(rename = "type")]
        stream: StreamKind,
        data: String,
    },
    ServiceStopping { handle: ServiceHandle },
    ServiceStopped { handle: ServiceHandle },
    /// The process exited without a stop request.
    ServiceExited {
        handle: ServiceHandle,
        code: Option<i32>,
        signal: Option<String>,
    },
    /// The running process reported an error.
    ServiceError { handle: ServiceHandle, error: String },
    /// Spawning failed.
    ServiceFailed {
        handle: ServiceHandle,
        task: Box<ServiceTask>,
        error: String,
    },
    ServiceRestarting {
        handle: ServiceHandle,
        attempt: u32,
        max_retries: u32,
        reason: String,
    },
    ServiceRestartFailed { handle: ServiceHandle, error: String },
    ServiceRestartLimit { handle: ServiceHandle, restart_count: u32 },
    CheckingPortRelease { handle: ServiceHandle, ports: Vec<u16> },
    PortReleased { handle: ServiceHandle, port: u16 },
    PortsReleased {
        handle: ServiceHandle,
        ports: Vec<u16>,
        #[serde(rename = "duration")]
        duration_ms: u64,
    },
    PortReleaseTimeout {
        handle: ServiceHandle,
        unavailable_ports: Vec<u16>,
    },
}

impl ServiceEvent {
    /// The event's wire name.
    pub fn name(&self) -> &'static str {
        match self {
            ServiceEvent::ServiceStarted { .. } => "service-started",
            ServiceEvent::ServiceBooting { .. } => "service-booting",
            ServiceEvent::ReadinessMatch { .. } => "readiness-match",
            ServiceEvent::ServiceReady { .. } => "service-ready",
            ServiceEvent::BootTimeout { .. } => "boot-timeout",
            ServiceEvent::ServiceOutput { .. } => "service-output",
            ServiceEvent::ServiceStopping { .. } => "service-stopping",
            ServiceEvent::ServiceStopped { .. } => "service-stopped",
            ServiceEvent::ServiceExited { .. } => "service-exited",
            ServiceEvent::ServiceError { .. } => "service-error",
            ServiceEvent::ServiceFailed { .. } => "service-failed",
            ServiceEvent::ServiceRestarting { .. } => "service-restarting",
            ServiceEvent::ServiceRestartFailed { .. } => "service-restart-failed",
            ServiceEvent::ServiceRestartLimit { .. } => "service-restart-limit",
            ServiceEvent::CheckingPortRelease { .. } => "checking-port-release",
            ServiceEvent::PortReleased { .. } => "port-released",
            ServiceEvent::PortsReleased { .. } => "ports-released",
            ServiceEvent::PortReleaseTimeout { .. } => "port-release-timeout",
        }
    }

    /// Handle id of the service the event concerns.
    pub fn service_id(&self) -> &str {
        match self {
            ServiceEvent::ServiceOutput { service_id, .. } => service_id,
            ServiceEvent::ServiceStarted { handle, .. }
            | ServiceEvent::ServiceBooting { handle, .. }
            | ServiceEvent::ReadinessMatch { handle, .. }
            | ServiceEvent::ServiceReady { handle, .. }
            | ServiceEvent::BootTimeout { handle, .. }
            | ServiceEvent::ServiceStopping { handle }
            | ServiceEvent::ServiceStopped { handle }
            | ServiceEvent::ServiceExited { handle, .. }
            | ServiceEvent::ServiceError { handle, .. }
            | ServiceEvent::ServiceFailed { handle, .. }
            | ServiceEvent::ServiceRestarting { handle, .. }
            | ServiceEvent::ServiceRestartFailed { handle, .. }
            | ServiceEvent::ServiceRestartLimit { handle, .. }
            | ServiceEvent::CheckingPortRelease { handle, .. }
            | ServiceEvent::PortReleased { handle, .. }
            | ServiceEvent::PortsReleased { handle, .. }
            | ServiceEvent::PortReleaseTimeout { handle, .. } => &handle.id,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::process::ServiceStatus;

    fn keys(event: &ServiceEvent) -> Vec<String> {
        let value = serde_json::to_value(event).unwrap();
        let mut keys: Vec<String> = value.as_object().unwrap().keys().cloned().collect();
        keys.sort();
        keys
    }

    #[test]
    fn serialized_tag_matches_name() {
        let handle = ServiceHandle::new("web", ServiceStatus::Running);
        let events = vec![
            (
                ServiceEvent::BootTimeout {
                    handle: handle.clone(),
                    timeout_ms: 10,
                },
                vec!["event", "handle", "timeout"],
            ),
            (
                ServiceEvent::ServiceReady {
                    handle: handle.clone(),
                    boot_duration_ms: 5,
                    readiness_matches: HashMap::new(),
                },
                vec!["bootDuration", "event", "handle", "readinessMatches"],
            ),
            (
                ServiceEvent::ServiceRestarting {
                    handle: handle.clone(),
                    attempt: 1,
                    max_retries: 3,
                    reason: "code 1".into(),
                },
                vec!["attempt", "event", "handle", "maxRetries", "reason"],
            ),
            (
                ServiceEvent::ServiceRestartLimit {
                    handle: handle.clone(),
                    restart_count: 2,
                },
                vec!["event", "handle", "restartCount"],
            ),
            (
                ServiceEvent::PortsReleased {
                    handle: handle.clone(),
                    ports: vec![8080],
                    duration_ms: 12,
                },
                vec!["duration", "event", "handle", "ports"],
            ),
            (
                ServiceEvent::PortReleaseTimeout {
                    handle: handle.clone(),
                    unavailable_ports: vec![8080],
                },
                vec!["event", "handle", "unavailablePorts"],
            ),
            (
                ServiceEvent::ServiceOutput {
                    service_id: handle.id.clone(),
                    stream: StreamKind::Stderr,
                    data: "x".into(),
                },
                vec!["data", "event", "serviceId", "type"],
            ),
        ];
        for (event, expected) in events {
            let value = serde_json::to_value(&event).unwrap();
            assert_eq!(value["event"], event.name());
            assert_eq!(event.service_id(), handle.id);
            assert_eq!(keys(&event), expected);
        }
    }

    #[test]
    fn booting_carries_readiness_config() {
        let event = ServiceEvent::ServiceBooting {
            handle: ServiceHandle::new("web", ServiceStatus::Booting),
            readiness_config: ReadinessConfig::default(),
        };
        assert_eq!(keys(&event), vec!["event", "handle", "readinessConfig"]);
        let value = serde_json::to_value(&event).unwrap();
        assert!(value["handle"].get("taskId").is_some());
        assert!(value["handle"].get("readinessMatches").is_some());
    }

    #[test]
    fn output_stream_serializes_as_type() {
        let event = ServiceEvent::ServiceOutput {
            service_id: "s".into(),
            stream: StreamKind::Stdout,
            data: "hello".into(),
        };
        let value = serde_json::to_value(&event).unwrap();
        assert_eq!(value["type"], "stdout");
        assert_eq!(value["data"], "hello");
    }
}
