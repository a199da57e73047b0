#![allow(dead_code)]

use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex, Once};
use std::time::Duration;

use tokio::sync::broadcast::{self, error::RecvError};
use tracing_subscriber::{fmt, EnvFilter};

use taskrack::{
    PortProber, PortReleaseConfig, PortState, SafetyConfig, ServiceEvent, ServiceExecutor,
    ServiceExecutorConfig,
};

static INIT: Once = Once::new();

/// Initialise tracing for tests.
///
/// Enable levels with e.g. `RUST_LOG=debug cargo test`.
pub fn init_tracing() {
    INIT.call_once(|| {
        let filter =
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
        let _ = fmt()
            .with_env_filter(filter)
            .with_test_writer()
            .with_target(true)
            .try_init();
    });
}

/// Executor settings with short timeouts so tests finish quickly.
pub fn fast_config() -> ServiceExecutorConfig {
    ServiceExecutorConfig {
        shutdown_timeout_ms: 2_000,
        force_kill_grace_ms: 1_000,
        boot_timeout_ms: 2_000,
        restart_delay_ms: 10,
        port_release: PortReleaseConfig {
            grace_ms: 0,
            interval_ms: 10,
            timeout_ms: 300,
            max_retries: 50,
        },
        ..ServiceExecutorConfig::default()
    }
}

/// Prober answering with a fixed state and remembering what it was asked.
pub struct FakeProber {
    state: PortState,
    pub probed: Mutex<Vec<u16>>,
}

impl FakeProber {
    pub fn free() -> Arc<Self> {
        Arc::new(Self {
            state: PortState::Free,
            probed: Mutex::new(Vec::new()),
        })
    }

    pub fn busy() -> Arc<Self> {
        Arc::new(Self {
            state: PortState::InUse,
            probed: Mutex::new(Vec::new()),
        })
    }
}

impl PortProber for FakeProber {
    fn probe(&self, port: u16) -> Pin<Box<dyn Future<Output = PortState> + Send + '_>> {
        Box::pin(async move {
            self.probed.lock().unwrap().push(port);
            self.state.clone()
        })
    }
}

pub fn executor() -> ServiceExecutor {
    executor_with(fast_config(), FakeProber::free())
}

pub fn executor_with(config: ServiceExecutorConfig, prober: Arc<FakeProber>) -> ServiceExecutor {
    init_tracing();
    ServiceExecutor::with_prober(config, SafetyConfig::default(), prober)
}

/// Receives events until one named `name` arrives, returning everything seen
/// including that event. Panics after `timeout`.
pub async fn collect_until(
    rx: &mut broadcast::Receiver<ServiceEvent>,
    name: &str,
    timeout: Duration,
) -> Vec<ServiceEvent> {
    let mut seen = Vec::new();
    let outcome = tokio::time::timeout(timeout, async {
        loop {
            match rx.recv().await {
                Ok(event) => {
                    let done = event.name() == name;
                    seen.push(event);
                    if done {
                        return;
                    }
                }
                Err(RecvError::Lagged(_)) => continue,
                Err(RecvError::Closed) => panic!("event channel closed"),
            }
        }
    })
    .await;
    if outcome.is_err() {
        let names: Vec<_> = seen.iter().map(ServiceEvent::name).collect();
        panic!("no '{}' event within {:?}; saw {:?}", name, timeout, names);
    }
    seen
}

/// Receives events for `window` and returns them all.
pub async fn collect_for(
    rx: &mut broadcast::Receiver<ServiceEvent>,
    window: Duration,
) -> Vec<ServiceEvent> {
    let mut seen = Vec::new();
    let _ = tokio::time::timeout(window, async {
        loop {
            match rx.recv().await {
                Ok(event) => seen.push(event),
                Err(RecvError::Lagged(_)) => continue,
                Err(RecvError::Closed) => return,
            }
        }
    })
    .await;
    seen
}

pub fn count(events: &[ServiceEvent], name: &str) -> usize {
    events.iter().filter(|e| e.name() == name).count()
}
