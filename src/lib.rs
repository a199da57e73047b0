//! taskrack: run one-shot commands and supervise long-running services.
//!
//! [`CliExecutor`] runs commands to completion with timeouts, bounded output
//! capture and retries. [`ServiceExecutor`] supervises services through a
//! boot phase gated on readiness patterns, graceful shutdown, port release
//! checks and crash restarts, publishing every transition as a
//! [`ServiceEvent`].

pub mod cli_executor;
pub mod config;
pub mod errors;
pub mod events;
pub mod logging;
pub mod output;
pub mod ports;
pub mod process;
pub mod readiness;
pub mod service;
pub mod spawn;
pub mod task;
pub mod validate;

pub use cli_executor::{CliExecutor, ExecutionResult};
pub use config::{
    load_config, CliExecutorConfig, ExecutorConfig, PortReleaseConfig, SafetyConfig,
    ServiceExecutorConfig, TaskFile,
};
pub use errors::{Result, TaskError};
pub use events::ServiceEvent;
pub use output::StreamKind;
pub use ports::{PortProber, PortState, SystemPortProber};
pub use process::{ServiceHandle, ServiceStatus, ServiceStatusReport, StopOptions};
pub use service::ServiceExecutor;
pub use spawn::ProcessSignal;
pub use task::{
    CliTask, EndpointCaptureGroup, GracefulShutdown, ReadinessConfig, ReadinessPattern,
    RestartPolicy, ServiceTask, StreamSelector, Task, TaskBuilder,
};
pub use validate::TaskValidator;
