//! Long-running service supervision.
//!
//! `ServiceExecutor` spawns [`ServiceTask`]s, tracks each through the
//! `booting -> running -> stopping -> stopped` state machine, matches
//! readiness patterns against live output, verifies monitored ports are
//! released after exit, and restarts crashed services per their policy.
//!
//! The live map is guarded by a short-lived lock; every service's mutable
//! state sits behind its own lock so services never wait on each other.
//! Lock order is always map then service, and no lock is held across an
//! `.await`. Events are published on a broadcast channel while the service
//! lock is held, so per-service event order matches state transition order.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use chrono::Utc;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::Child;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, error, info, warn};

use crate::config::{SafetyConfig, ServiceExecutorConfig};
use crate::errors::{Result, TaskError};
use crate::events::ServiceEvent;
use crate::output::{LogBuffer, LogLine, StreamKind};
use crate::ports::{
    verify_port_release, PortProber, PortReleaseOutcome, PortReleaseProgress, SystemPortProber,
};
use crate::process::{ServiceHandle, ServiceStatus, ServiceStatusReport, StopOptions};
use crate::readiness::ReadinessTracker;
use crate::spawn::{exit_signal, send_os_signal, shell_command, ProcessSignal};
use crate::task::ServiceTask;
use crate::validate::TaskValidator;

/// How long the exit watcher waits for output readers to flush after exit.
const OUTPUT_DRAIN_GRACE: Duration = Duration::from_millis(500);
/// How long an unterminated line waits for its newline before it is logged.
const PARTIAL_LINE_FLUSH: Duration = Duration::from_millis(200);
/// Unterminated output longer than this is logged as a line of its own.
const MAX_PARTIAL_LINE: usize = 64 * 1024;
/// Number of exited services whose logs stay retrievable.
const RETIRED_LOG_LIMIT: usize = 32;

/// Supervises long-running services. Cheap to clone.
#[derive(Clone)]
pub struct ServiceExecutor {
    inner: Arc<Inner>,
}

struct Inner {
    config: ServiceExecutorConfig,
    validator: TaskValidator,
    prober: Arc<dyn PortProber>,
    events: broadcast::Sender<ServiceEvent>,
    services: Mutex<HashMap<String, Arc<Mutex<RunningService>>>>,
    pending_restarts: Mutex<HashMap<String, JoinHandle<()>>>,
    retired_logs: Mutex<VecDeque<(String, LogBuffer)>>,
}

struct RunningService {
    handle: ServiceHandle,
    task: ServiceTask,
    started: Instant,
    logs: LogBuffer,
    restart_count: u32,
    readiness: ReadinessTracker,
    boot_timer: Option<JoinHandle<()>>,
    watched_ports: Vec<u16>,
    kill_tx: mpsc::UnboundedSender<()>,
    exit_rx: watch::Receiver<Option<ExitInfo>>,
}

impl RunningService {
    fn log(&mut self, text: impl Into<String>) {
        self.logs.push(LogLine::system(text));
    }
}

#[derive(Debug, Clone)]
struct ExitInfo {
    code: Option<i32>,
    signal: Option<String>,
}

impl ExitInfo {
    fn describe(&self) -> String {
        match (&self.code, &self.signal) {
            (Some(code), _) => format!("code {}", code),
            (None, Some(signal)) => format!("signal {}", signal),
            (None, None) => "unknown status".to_string(),
        }
    }
}

fn line_text(bytes: &[u8]) -> String {
    String::from_utf8_lossy(bytes)
        .trim_end_matches(['\n', '\r'])
        .to_string()
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl Inner {
    fn emit(&self, event: ServiceEvent) {
        // No subscribers is fine.
        let _ = self.events.send(event);
    }

    fn entry(&self, id: &str) -> Option<Arc<Mutex<RunningService>>> {
        lock(&self.services).get(id).cloned()
    }

    fn remove(&self, id: &str) {
        let Some(entry) = lock(&self.services).remove(id) else {
            return;
        };
        let logs = lock(&entry).logs.clone();
        let mut retired = lock(&self.retired_logs);
        retired.push_back((id.to_string(), logs));
        while retired.len() > RETIRED_LOG_LIMIT {
            retired.pop_front();
        }
    }
}

impl ServiceExecutor {
    pub fn new(config: ServiceExecutorConfig, safety: SafetyConfig) -> Self {
        Self::with_prober(config, safety, Arc::new(SystemPortProber))
    }

    /// Creates an executor that checks port release with `prober`.
    pub fn with_prober(
        config: ServiceExecutorConfig,
        safety: SafetyConfig,
        prober: Arc<dyn PortProber>,
    ) -> Self {
        let (events, _) = broadcast::channel(config.event_capacity.max(1));
        Self {
            inner: Arc::new(Inner {
                config,
                validator: TaskValidator::new(safety),
                prober,
                events,
                services: Mutex::new(HashMap::new()),
                pending_restarts: Mutex::new(HashMap::new()),
                retired_logs: Mutex::new(VecDeque::new()),
            }),
        }
    }

    pub fn config(&self) -> &ServiceExecutorConfig {
        &self.inner.config
    }

    /// Subscribes to lifecycle and output events.
    ///
    /// Subscribers that fall more than `event_capacity` events behind miss
    /// the oldest ones.
    pub fn subscribe(&self) -> broadcast::Receiver<ServiceEvent> {
        self.inner.events.subscribe()
    }

    /// Validates and spawns `task`.
    ///
    /// The returned handle is `Booting` when the task has readiness patterns
    /// and `Running` otherwise.
    pub async fn start(&self, task: ServiceTask) -> Result<ServiceHandle> {
        self.start_with_count(task, 0)
    }

    fn start_with_count(&self, task: ServiceTask, restart_count: u32) -> Result<ServiceHandle> {
        let inner = &self.inner;
        inner.validator.validate_service(&task)?;
        let readiness = match &task.readiness {
            Some(config) if !config.patterns.is_empty() => Some(
                ReadinessTracker::compile(config).map_err(|err| TaskError::Validation {
                    task_id: task.task.id.clone(),
                    violations: vec![err],
                })?,
            ),
            _ => None,
        };

        let mut services = lock(&inner.services);
        let duplicate = services.values().any(|entry| {
            let service = lock(entry);
            service.handle.task_id == task.task.id && !service.handle.status.is_terminal()
        });
        if duplicate {
            return Err(TaskError::AlreadyRunning(task.task.id.clone()));
        }

        let status = if readiness.is_some() {
            ServiceStatus::Booting
        } else {
            ServiceStatus::Running
        };
        let mut handle = ServiceHandle::new(&task.task.id, status);
        let mut child = match shell_command(&task.task, &inner.config.environment).spawn() {
            Ok(child) => child,
            Err(source) => {
                handle.status = ServiceStatus::Failed;
                error!(task = %task.task.id, error = %source, "failed to spawn service");
                inner.emit(ServiceEvent::ServiceFailed {
                    handle,
                    task: Box::new(task.clone()),
                    error: source.to_string(),
                });
                return Err(TaskError::Execution {
                    task_id: task.task.id,
                    source,
                });
            }
        };
        handle.pid = child.id();
        let id = handle.id.clone();
        info!(
            service = %id,
            task = %task.task.id,
            pid = ?handle.pid,
            cmd = %task.task.command_line(),
            status = ?status,
            "service spawned"
        );

        let (kill_tx, kill_rx) = mpsc::unbounded_channel();
        let (exit_tx, exit_rx) = watch::channel(None);
        let mut service = RunningService {
            handle: handle.clone(),
            task: task.clone(),
            started: Instant::now(),
            logs: LogBuffer::new(inner.config.max_log_size),
            restart_count,
            readiness: readiness.unwrap_or_default(),
            boot_timer: None,
            watched_ports: Vec::new(),
            kill_tx,
            exit_rx,
        };
        service.log(format!(
            "started pid {} ({})",
            handle.pid.map(|p| p.to_string()).unwrap_or_else(|| "?".into()),
            task.task.command_line()
        ));
        if restart_count > 0 {
            service.log(format!("restart attempt {}", restart_count));
        }

        if let (ServiceStatus::Booting, Some(config)) = (status, &task.readiness) {
            let timeout_ms = config.timeout_ms.unwrap_or(inner.config.boot_timeout_ms);
            service.boot_timer = Some(self.spawn_boot_timer(id.clone(), timeout_ms));
            service.log(format!(
                "booting, waiting for {} readiness pattern(s) up to {}ms",
                service.readiness.len(),
                timeout_ms
            ));
            inner.emit(ServiceEvent::ServiceBooting {
                handle: handle.clone(),
                readiness_config: config.clone(),
            });
        }
        inner.emit(ServiceEvent::ServiceStarted {
            handle: handle.clone(),
            task: Box::new(task),
        });
        services.insert(id.clone(), Arc::new(Mutex::new(service)));
        drop(services);

        let mut readers = Vec::new();
        if let Some(stdout) = child.stdout.take() {
            readers.push(self.spawn_reader(id.clone(), StreamKind::Stdout, stdout));
        }
        if let Some(stderr) = child.stderr.take() {
            readers.push(self.spawn_reader(id.clone(), StreamKind::Stderr, stderr));
        }
        self.spawn_exit_watcher(id, child, kill_rx, exit_tx, readers);

        Ok(handle)
    }

    /// Stops a service, escalating to SIGKILL when it outlives the timeout.
    ///
    /// Stopping a service whose crash restart is still pending cancels that
    /// restart instead.
    pub async fn stop(&self, id: &str, options: StopOptions) -> Result<()> {
        let inner = &self.inner;
        let cancelled = lock(&inner.pending_restarts).remove(id);
        if let Some(timer) = &cancelled {
            timer.abort();
            info!(service = %id, "cancelled pending restart");
        }
        let Some(entry) = inner.entry(id) else {
            return match cancelled {
                Some(_) => Ok(()),
                None => Err(TaskError::ServiceNotFound(id.to_string())),
            };
        };

        let plan = {
            let mut service = lock(&entry);
            if service.handle.status.is_terminal() {
                return Ok(());
            }
            if service.handle.status == ServiceStatus::Stopping {
                // Another stop owns the transition; only wait for its outcome.
                let timeout_ms = service
                    .task
                    .graceful_shutdown
                    .timeout_ms
                    .unwrap_or(inner.config.shutdown_timeout_ms)
                    .max(options.timeout_ms.unwrap_or(0))
                    .saturating_add(inner.config.force_kill_grace_ms);
                Err((service.exit_rx.clone(), Duration::from_millis(timeout_ms)))
            } else {
                if let Some(timer) = service.boot_timer.take() {
                    timer.abort();
                }
                let signal = if options.force {
                    ProcessSignal::SigKill
                } else {
                    options
                        .signal
                        .or(service.task.graceful_shutdown.signal)
                        .unwrap_or(inner.config.shutdown_signal)
                };
                let timeout_ms = options
                    .timeout_ms
                    .or(service.task.graceful_shutdown.timeout_ms)
                    .unwrap_or(inner.config.shutdown_timeout_ms);
                service.handle.status = ServiceStatus::Stopping;
                service.log(format!("stopping with {} (timeout {}ms)", signal, timeout_ms));
                inner.emit(ServiceEvent::ServiceStopping {
                    handle: service.handle.clone(),
                });
                Ok((
                    service.handle.pid,
                    signal,
                    Duration::from_millis(timeout_ms),
                    service.exit_rx.clone(),
                    service.kill_tx.clone(),
                ))
            }
        };
        let (pid, signal, timeout, mut exit_rx, kill_tx) = match plan {
            Ok(plan) => plan,
            Err((mut exit_rx, timeout)) => {
                debug!(service = %id, "stop already in progress, waiting for exit");
                wait_exit(&mut exit_rx, timeout).await;
                return Ok(());
            }
        };

        info!(service = %id, pid = ?pid, signal = %signal, "stopping service");
        if let Some(pid) = pid {
            send_os_signal(pid, signal);
        }
        if signal == ProcessSignal::SigKill {
            let _ = kill_tx.send(());
        }

        let mut exit = wait_exit(&mut exit_rx, timeout).await;
        if exit.is_none() && signal != ProcessSignal::SigKill {
            warn!(
                service = %id,
                timeout_ms = timeout.as_millis() as u64,
                "service did not exit in time, killing"
            );
            lock(&entry).log("did not exit in time, sending SIGKILL");
            if let Some(pid) = pid {
                send_os_signal(pid, ProcessSignal::SigKill);
            }
            let _ = kill_tx.send(());
            let grace = Duration::from_millis(inner.config.force_kill_grace_ms);
            exit = wait_exit(&mut exit_rx, grace).await;
        }

        let (handle, ports) = {
            let mut service = lock(&entry);
            match &exit {
                Some(info) => service.log(format!("stopped ({})", info.describe())),
                None => {
                    warn!(service = %id, pid = ?pid, "service may still be running after SIGKILL");
                    service.log("stopped, but exit was not observed")
                }
            }
            service.handle.status = ServiceStatus::Stopped;
            inner.emit(ServiceEvent::ServiceStopped {
                handle: service.handle.clone(),
            });
            (
                service.handle.clone(),
                std::mem::take(&mut service.watched_ports),
            )
        };
        inner.remove(id);
        if !ports.is_empty() {
            self.spawn_port_check(handle, ports);
        }
        Ok(())
    }

    /// Stops the service, waits the restart delay and starts the same task.
    pub async fn restart(&self, id: &str) -> Result<ServiceHandle> {
        let task = self
            .inner
            .entry(id)
            .map(|entry| lock(&entry).task.clone())
            .ok_or_else(|| TaskError::ServiceNotFound(id.to_string()))?;
        self.stop(id, StopOptions::default()).await?;
        let delay_ms = task
            .restart_policy
            .as_ref()
            .and_then(|policy| policy.delay_ms)
            .unwrap_or(self.inner.config.restart_delay_ms);
        tokio::time::sleep(Duration::from_millis(delay_ms)).await;
        self.start(task).await
    }

    /// Stops every live service and cancels pending restarts.
    pub async fn stop_all(&self, options: StopOptions) {
        let pending: Vec<_> = lock(&self.inner.pending_restarts).drain().collect();
        for (_, timer) in pending {
            timer.abort();
        }
        let ids: Vec<String> = lock(&self.inner.services).keys().cloned().collect();
        let mut stops = JoinSet::new();
        for id in ids {
            let executor = self.clone();
            stops.spawn(async move {
                if let Err(err) = executor.stop(&id, options).await {
                    debug!(service = %id, error = %err, "stop during stop_all failed");
                }
            });
        }
        while stops.join_next().await.is_some() {}
    }

    pub fn status(&self, id: &str) -> Option<ServiceStatusReport> {
        let entry = self.inner.entry(id)?;
        let service = lock(&entry);
        Some(ServiceStatusReport {
            handle: service.handle.clone(),
            uptime_ms: service.started.elapsed().as_millis() as u64,
            restart_count: service.restart_count,
        })
    }

    /// The most recent `limit` log lines (all when `None`).
    ///
    /// Logs of recently exited services stay available after removal.
    pub fn logs(&self, id: &str, limit: Option<usize>) -> Vec<String> {
        if let Some(entry) = self.inner.entry(id) {
            return lock(&entry).logs.tail(limit);
        }
        lock(&self.inner.retired_logs)
            .iter()
            .rev()
            .find(|(retired, _)| retired == id)
            .map(|(_, logs)| logs.tail(limit))
            .unwrap_or_default()
    }

    /// Snapshot of every live service handle.
    pub fn services(&self) -> Vec<ServiceHandle> {
        let entries: Vec<_> = lock(&self.inner.services).values().cloned().collect();
        entries
            .iter()
            .map(|entry| lock(entry).handle.clone())
            .collect()
    }

    /// True when nothing is running and no crash restart is pending.
    pub fn is_idle(&self) -> bool {
        lock(&self.inner.services).is_empty() && lock(&self.inner.pending_restarts).is_empty()
    }

    fn spawn_reader<R>(&self, id: String, stream: StreamKind, mut reader: R) -> JoinHandle<()>
    where
        R: AsyncRead + Unpin + Send + 'static,
    {
        let executor = self.clone();
        tokio::spawn(async move {
            let mut chunk = [0u8; 8192];
            let mut pending: Vec<u8> = Vec::new();
            loop {
                let read = if pending.is_empty() {
                    reader.read(&mut chunk).await
                } else {
                    match tokio::time::timeout(PARTIAL_LINE_FLUSH, reader.read(&mut chunk)).await {
                        Ok(read) => read,
                        Err(_) => {
                            executor.on_output(&id, stream, &line_text(&pending));
                            pending.clear();
                            continue;
                        }
                    }
                };
                let n = match read {
                    Ok(0) | Err(_) => break,
                    Ok(n) => n,
                };
                pending.extend_from_slice(&chunk[..n]);
                while let Some(end) = pending.iter().position(|b| *b == b'\n') {
                    let line: Vec<u8> = pending.drain(..=end).collect();
                    executor.on_output(&id, stream, &line_text(&line));
                }
                if pending.len() >= MAX_PARTIAL_LINE {
                    executor.on_output(&id, stream, &line_text(&pending));
                    pending.clear();
                } else if !pending.is_empty() {
                    executor.on_partial_output(&id, stream, &line_text(&pending));
                }
            }
            if !pending.is_empty() {
                executor.on_output(&id, stream, &line_text(&pending));
            }
        })
    }

    fn spawn_exit_watcher(
        &self,
        id: String,
        mut child: Child,
        mut kill_rx: mpsc::UnboundedReceiver<()>,
        exit_tx: watch::Sender<Option<ExitInfo>>,
        readers: Vec<JoinHandle<()>>,
    ) {
        let executor = self.clone();
        tokio::spawn(async move {
            let status = loop {
                tokio::select! {
                    status = child.wait() => break status,
                    Some(()) = kill_rx.recv() => {
                        let _ = child.start_kill();
                    }
                }
            };
            for reader in readers {
                let _ = tokio::time::timeout(OUTPUT_DRAIN_GRACE, reader).await;
            }
            match status {
                Ok(status) => {
                    let info = ExitInfo {
                        code: status.code(),
                        signal: exit_signal(&status),
                    };
                    let _ = exit_tx.send(Some(info.clone()));
                    executor.on_exit(&id, info);
                }
                Err(err) => {
                    let _ = exit_tx.send(Some(ExitInfo {
                        code: None,
                        signal: None,
                    }));
                    executor.on_process_error(&id, err);
                }
            }
        });
    }

    fn spawn_boot_timer(&self, id: String, timeout_ms: u64) -> JoinHandle<()> {
        let executor = self.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(timeout_ms)).await;
            executor.on_boot_timeout(&id, timeout_ms);
        })
    }

    fn on_output(&self, id: &str, stream: StreamKind, line: &str) {
        let inner = &self.inner;
        let Some(entry) = inner.entry(id) else {
            return;
        };
        let mut service = lock(&entry);
        service.logs.push(LogLine::output(stream, line));
        inner.emit(ServiceEvent::ServiceOutput {
            service_id: id.to_string(),
            stream,
            data: line.to_string(),
        });
        self.match_readiness(id, &mut service, stream, line);
    }

    /// Matches readiness against a line that has not been terminated yet.
    /// The text is logged and emitted once the line completes or is flushed.
    fn on_partial_output(&self, id: &str, stream: StreamKind, text: &str) {
        let Some(entry) = self.inner.entry(id) else {
            return;
        };
        let mut service = lock(&entry);
        self.match_readiness(id, &mut service, stream, text);
    }

    fn match_readiness(
        &self,
        id: &str,
        service: &mut RunningService,
        stream: StreamKind,
        line: &str,
    ) {
        let inner = &self.inner;
        if service.handle.status != ServiceStatus::Booting {
            return;
        }

        let hits = service.readiness.feed(stream, line);
        if hits.is_empty() {
            return;
        }
        for hit in hits {
            for (name, url) in hit.endpoints {
                service.log(format!("endpoint {} = {}", name, url));
                service.handle.endpoints.insert(name, url);
            }
            for port in hit.ports {
                if !service.watched_ports.contains(&port) {
                    service.watched_ports.push(port);
                }
            }
            service
                .handle
                .readiness_matches
                .insert(hit.name.clone(), hit.groups.clone());
            service.log(format!("readiness pattern '{}' matched {:?}", hit.name, hit.groups));
            debug!(service = %id, pattern = %hit.name, groups = ?hit.groups, "readiness match");
            inner.emit(ServiceEvent::ReadinessMatch {
                handle: service.handle.clone(),
                pattern: hit.name,
                matches: hit.groups,
            });
        }
        if !service.readiness.all_matched() {
            return;
        }

        if let Some(timer) = service.boot_timer.take() {
            timer.abort();
        }
        let now = Utc::now();
        let boot_duration_ms = (now - service.handle.created_at).num_milliseconds().max(0) as u64;
        service.handle.status = ServiceStatus::Running;
        service.handle.booted_at = Some(now);
        service.log(format!("ready after {}ms", boot_duration_ms));
        info!(service = %id, boot_duration_ms, "service ready");
        inner.emit(ServiceEvent::ServiceReady {
            handle: service.handle.clone(),
            boot_duration_ms,
            readiness_matches: service.handle.readiness_matches.clone(),
        });
    }

    fn on_boot_timeout(&self, id: &str, timeout_ms: u64) {
        let inner = &self.inner;
        let Some(entry) = inner.entry(id) else {
            return;
        };
        let mut service = lock(&entry);
        if service.handle.status != ServiceStatus::Booting {
            return;
        }
        service.boot_timer = None;
        let pending: Vec<_> = service
            .readiness
            .matchers()
            .iter()
            .filter(|m| !m.matched)
            .map(|m| m.name.clone())
            .collect();
        warn!(
            service = %id,
            timeout_ms,
            pending = ?pending,
            "boot timed out, treating service as running"
        );
        inner.emit(ServiceEvent::BootTimeout {
            handle: service.handle.clone(),
            timeout_ms,
        });
        service.log(format!(
            "boot timed out after {}ms with pattern(s) {:?} unmatched, treating as running",
            timeout_ms, pending
        ));
        service.handle.status = ServiceStatus::Running;
    }

    fn on_exit(&self, id: &str, info: ExitInfo) {
        let inner = &self.inner;
        let Some(entry) = inner.entry(id) else {
            return;
        };
        let (handle, task, restart_count, ports) = {
            let mut service = lock(&entry);
            // A stop in progress finishes the bookkeeping itself.
            if !service.handle.status.is_live() {
                return;
            }
            if let Some(timer) = service.boot_timer.take() {
                timer.abort();
            }
            service.handle.status = ServiceStatus::Stopped;
            service.log(format!("process exited ({})", info.describe()));
            info!(service = %id, code = ?info.code, signal = ?info.signal, "service exited");
            inner.emit(ServiceEvent::ServiceExited {
                handle: service.handle.clone(),
                code: info.code,
                signal: info.signal.clone(),
            });
            (
                service.handle.clone(),
                service.task.clone(),
                service.restart_count,
                std::mem::take(&mut service.watched_ports),
            )
        };
        if !ports.is_empty() {
            self.spawn_port_check(handle.clone(), ports);
        }
        // Scheduled before removal so the service is never briefly unknown.
        if info.code != Some(0) {
            self.schedule_restart(handle, task, restart_count, info.describe());
        }
        inner.remove(id);
    }

    fn on_process_error(&self, id: &str, err: std::io::Error) {
        let inner = &self.inner;
        let Some(entry) = inner.entry(id) else {
            return;
        };
        {
            let mut service = lock(&entry);
            if let Some(timer) = service.boot_timer.take() {
                timer.abort();
            }
            service.handle.status = ServiceStatus::Failed;
            service.log(format!("process error: {}", err));
            error!(service = %id, error = %err, "service process error");
            inner.emit(ServiceEvent::ServiceError {
                handle: service.handle.clone(),
                error: err.to_string(),
            });
        }
        inner.remove(id);
    }

    fn schedule_restart(
        &self,
        handle: ServiceHandle,
        task: ServiceTask,
        restart_count: u32,
        reason: String,
    ) {
        let inner = &self.inner;
        let Some(policy) = task.restart_policy.clone().filter(|p| p.enabled) else {
            return;
        };
        let max_retries = policy.max_retries.unwrap_or(inner.config.max_retries);
        if restart_count >= max_retries {
            warn!(service = %handle.id, restart_count, "restart limit reached");
            inner.emit(ServiceEvent::ServiceRestartLimit {
                handle,
                restart_count,
            });
            return;
        }

        let attempt = restart_count + 1;
        let delay = Duration::from_millis(
            policy
                .delay_ms
                .unwrap_or(inner.config.restart_delay_ms)
                .saturating_mul(u64::from(attempt)),
        );
        info!(
            service = %handle.id,
            attempt,
            max_retries,
            delay_ms = delay.as_millis() as u64,
            %reason,
            "restarting service"
        );

        // The lock is held until the timer is registered, so the timer can't
        // look itself up too early.
        {
            let mut pending = lock(&inner.pending_restarts);
            let executor = self.clone();
            let old_id = handle.id.clone();
            let failed_handle = handle.clone();
            let timer = tokio::spawn(async move {
                tokio::time::sleep(delay).await;
                if lock(&executor.inner.pending_restarts).remove(&old_id).is_none() {
                    return;
                }
                if let Err(err) = executor.start_with_count(task, attempt) {
                    error!(service = %old_id, error = %err, "restart failed");
                    executor.inner.emit(ServiceEvent::ServiceRestartFailed {
                        handle: failed_handle,
                        error: err.to_string(),
                    });
                }
            });
            pending.insert(handle.id.clone(), timer);
        }
        inner.emit(ServiceEvent::ServiceRestarting {
            handle,
            attempt,
            max_retries,
            reason,
        });
    }

    fn spawn_port_check(&self, handle: ServiceHandle, ports: Vec<u16>) {
        let executor = self.clone();
        tokio::spawn(async move {
            let inner = &executor.inner;
            info!(service = %handle.id, ports = ?ports, "checking port release");
            let outcome = verify_port_release(
                inner.prober.as_ref(),
                &inner.config.port_release,
                ports,
                |progress| match progress {
                    PortReleaseProgress::Checking(ports) => {
                        inner.emit(ServiceEvent::CheckingPortRelease {
                            handle: handle.clone(),
                            ports,
                        })
                    }
                    PortReleaseProgress::Released(port) => {
                        inner.emit(ServiceEvent::PortReleased {
                            handle: handle.clone(),
                            port,
                        })
                    }
                    PortReleaseProgress::ProbeFailed { .. } => {}
                },
            )
            .await;
            match outcome {
                PortReleaseOutcome::AllReleased { ports, duration } => {
                    info!(service = %handle.id, ports = ?ports, "ports released");
                    inner.emit(ServiceEvent::PortsReleased {
                        handle,
                        ports,
                        duration_ms: duration.as_millis() as u64,
                    });
                }
                PortReleaseOutcome::TimedOut { remaining } => {
                    warn!(service = %handle.id, ports = ?remaining, "ports still in use after exit");
                    inner.emit(ServiceEvent::PortReleaseTimeout {
                        handle,
                        unavailable_ports: remaining,
                    });
                }
            }
        });
    }
}

async fn wait_exit(
    exit_rx: &mut watch::Receiver<Option<ExitInfo>>,
    timeout: Duration,
) -> Option<ExitInfo> {
    match tokio::time::timeout(timeout, exit_rx.wait_for(|exit| exit.is_some())).await {
        Ok(Ok(exit)) => exit.clone(),
        _ => None,
    }
}
