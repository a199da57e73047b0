//! Post-exit port release verification.
//!
//! Socket teardown can lag behind process exit, so after a service that
//! claimed ports goes away the executor polls until those ports stop
//! listening. Probing sits behind [`PortProber`] so the platform tooling can
//! be swapped (and faked in tests). When the tooling itself is unavailable
//! the port is assumed free and a warning is logged; verification never
//! blocks on missing tools.

use std::future::Future;
use std::pin::Pin;
use std::time::{Duration, Instant};

use tokio::process::Command;
use tracing::{debug, warn};

use crate::config::PortReleaseConfig;

/// Result of probing one port.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PortState {
    /// Something is listening on the port.
    InUse,
    /// Nothing is listening.
    Free,
    /// The probe could not run.
    Unknown(String),
}

/// Checks whether a TCP port has a listener.
pub trait PortProber: Send + Sync {
    fn probe(&self, port: u16) -> Pin<Box<dyn Future<Output = PortState> + Send + '_>>;
}

/// Prober backed by `lsof`, falling back to `netstat`.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemPortProber;

impl PortProber for SystemPortProber {
    fn probe(&self, port: u16) -> Pin<Box<dyn Future<Output = PortState> + Send + '_>> {
        Box::pin(async move {
            #[cfg(unix)]
            {
                match probe_lsof(port).await {
                    Ok(state) => return state,
                    Err(err) => debug!(port, error = %err, "lsof probe failed, trying netstat"),
                }
            }
            match probe_netstat(port).await {
                Ok(state) => state,
                Err(err) => PortState::Unknown(err.to_string()),
            }
        })
    }
}

#[cfg(unix)]
async fn probe_lsof(port: u16) -> std::io::Result<PortState> {
    let output = Command::new("lsof")
        .arg("-nP")
        .arg(format!("-iTCP:{}", port))
        .arg("-sTCP:LISTEN")
        .arg("-t")
        .kill_on_drop(true)
        .output()
        .await?;
    let listed = !String::from_utf8_lossy(&output.stdout).trim().is_empty();
    if listed {
        return Ok(PortState::InUse);
    }
    // lsof exits 1 when nothing matched.
    if output.status.success() || output.status.code() == Some(1) {
        return Ok(PortState::Free);
    }
    Err(std::io::Error::other(format!(
        "lsof exited with {}",
        output.status
    )))
}

async fn probe_netstat(port: u16) -> std::io::Result<PortState> {
    let flags = if cfg!(windows) { "-ano" } else { "-an" };
    let output = Command::new("netstat")
        .arg(flags)
        .kill_on_drop(true)
        .output()
        .await?;
    if !output.status.success() {
        return Err(std::io::Error::other(format!(
            "netstat exited with {}",
            output.status
        )));
    }
    let text = String::from_utf8_lossy(&output.stdout);
    if text.lines().any(|line| netstat_line_listens_on(line, port)) {
        Ok(PortState::InUse)
    } else {
        Ok(PortState::Free)
    }
}

/// Whether a `netstat -an` line shows a listener on `port`.
///
/// Handles both `addr:port` (Linux, Windows) and `addr.port` (BSD, macOS).
pub fn netstat_line_listens_on(line: &str, port: u16) -> bool {
    if !line.to_ascii_uppercase().contains("LISTEN") {
        return false;
    }
    let colon = format!(":{}", port);
    let dot = format!(".{}", port);
    line.split_whitespace()
        .any(|token| token.ends_with(&colon) || token.ends_with(&dot))
}

/// Progress reported while verifying.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PortReleaseProgress {
    Checking(Vec<u16>),
    Released(u16),
    ProbeFailed { port: u16, reason: String },
}

/// Final outcome of a verification run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PortReleaseOutcome {
    AllReleased { ports: Vec<u16>, duration: Duration },
    TimedOut { remaining: Vec<u16> },
}

/// Polls `ports` until all are free, the deadline passes, or the probe
/// round limit is reached.
pub async fn verify_port_release<F>(
    prober: &dyn PortProber,
    config: &PortReleaseConfig,
    ports: Vec<u16>,
    mut on_progress: F,
) -> PortReleaseOutcome
where
    F: FnMut(PortReleaseProgress),
{
    let started = Instant::now();
    tokio::time::sleep(Duration::from_millis(config.grace_ms)).await;
    on_progress(PortReleaseProgress::Checking(ports.clone()));

    let deadline = Instant::now() + Duration::from_millis(config.timeout_ms);
    let interval = Duration::from_millis(config.interval_ms);
    let mut remaining = ports.clone();
    let mut rounds = 0u32;
    loop {
        let mut still_open = Vec::with_capacity(remaining.len());
        for port in remaining {
            match prober.probe(port).await {
                PortState::Free => on_progress(PortReleaseProgress::Released(port)),
                PortState::InUse => still_open.push(port),
                PortState::Unknown(reason) => {
                    warn!(port, %reason, "port probe unavailable, assuming port is free");
                    on_progress(PortReleaseProgress::ProbeFailed { port, reason });
                    on_progress(PortReleaseProgress::Released(port));
                }
            }
        }
        remaining = still_open;
        if remaining.is_empty() {
            return PortReleaseOutcome::AllReleased {
                ports,
                duration: started.elapsed(),
            };
        }
        rounds += 1;
        if rounds >= config.max_retries.max(1) || Instant::now() + interval > deadline {
            return PortReleaseOutcome::TimedOut { remaining };
        }
        tokio::time::sleep(interval).await;
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::sync::Mutex;

    use super::*;

    /// Reports each port busy for a fixed number of probes.
    struct CountdownProber {
        busy: Mutex<HashMap<u16, u32>>,
    }

    impl PortProber for CountdownProber {
        fn probe(&self, port: u16) -> Pin<Box<dyn Future<Output = PortState> + Send + '_>> {
            Box::pin(async move {
                let mut busy = self.busy.lock().unwrap();
                match busy.get_mut(&port) {
                    Some(0) | None => PortState::Free,
                    Some(n) => {
                        *n -= 1;
                        PortState::InUse
                    }
                }
            })
        }
    }

    struct BrokenProber;

    impl PortProber for BrokenProber {
        fn probe(&self, _port: u16) -> Pin<Box<dyn Future<Output = PortState> + Send + '_>> {
            Box::pin(async { PortState::Unknown("no tools".into()) })
        }
    }

    fn fast_config() -> PortReleaseConfig {
        PortReleaseConfig {
            grace_ms: 0,
            interval_ms: 5,
            timeout_ms: 200,
            max_retries: 50,
        }
    }

    #[test]
    fn parses_netstat_lines() {
        assert!(netstat_line_listens_on(
            "tcp        0      0 0.0.0.0:8080            0.0.0.0:*               LISTEN",
            8080
        ));
        assert!(netstat_line_listens_on(
            "tcp4       0      0  *.3000                 *.*                    LISTEN",
            3000
        ));
        assert!(netstat_line_listens_on(
            "  TCP    0.0.0.0:5000           0.0.0.0:0              LISTENING       4",
            5000
        ));
        assert!(!netstat_line_listens_on(
            "tcp        0      0 127.0.0.1:8080          127.0.0.1:5555          ESTABLISHED",
            8080
        ));
        assert!(!netstat_line_listens_on(
            "tcp        0      0 0.0.0.0:18080           0.0.0.0:*               LISTEN",
            8080
        ));
    }

    #[tokio::test]
    async fn waits_until_ports_are_released() {
        let prober = CountdownProber {
            busy: Mutex::new(HashMap::from([(8080, 2), (9090, 0)])),
        };
        let mut progress = Vec::new();
        let outcome =
            verify_port_release(&prober, &fast_config(), vec![8080, 9090], |p| progress.push(p))
                .await;
        match outcome {
            PortReleaseOutcome::AllReleased { ports, .. } => assert_eq!(ports, vec![8080, 9090]),
            other => panic!("unexpected outcome {:?}", other),
        }
        assert_eq!(progress[0], PortReleaseProgress::Checking(vec![8080, 9090]));
        assert_eq!(progress[1], PortReleaseProgress::Released(9090));
        assert_eq!(progress.last(), Some(&PortReleaseProgress::Released(8080)));
    }

    #[tokio::test]
    async fn reports_ports_still_open_after_deadline() {
        let prober = CountdownProber {
            busy: Mutex::new(HashMap::from([(8080, u32::MAX)])),
        };
        let config = PortReleaseConfig {
            timeout_ms: 30,
            ..fast_config()
        };
        let outcome = verify_port_release(&prober, &config, vec![8080], |_| {}).await;
        assert_eq!(
            outcome,
            PortReleaseOutcome::TimedOut {
                remaining: vec![8080]
            }
        );
    }

    #[tokio::test]
    async fn missing_tools_assume_free() {
        let mut failures = 0;
        let outcome = verify_port_release(&BrokenProber, &fast_config(), vec![1234], |p| {
            if matches!(p, PortReleaseProgress::ProbeFailed { .. }) {
                failures += 1;
            }
        })
        .await;
        assert!(matches!(outcome, PortReleaseOutcome::AllReleased { .. }));
        assert_eq!(failures, 1);
    }
}
