//! taskrack command-line entry point.
//!
//! `up` runs the commands of a task file and then supervises its services
//! until Ctrl-C or SIGTERM, `exec` runs a single command, and `check`
//! validates a task file without spawning anything.

use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::builder::styling::{AnsiColor, Effects, Style};
use clap::builder::Styles;
use clap::{Parser, Subcommand};
use tokio::sync::{broadcast, mpsc};
use tracing::{info, warn};

use taskrack::logging::{init_logging, LogLevel};
use taskrack::{
    load_config, CliExecutor, ExecutionResult, ProcessSignal, ServiceEvent, ServiceExecutor,
    StopOptions, TaskBuilder, TaskError, TaskFile, TaskValidator,
};

const DEFAULT_CONFIG: &str = "taskrack.toml";

#[derive(Debug, Parser)]
#[command(
    name = "taskrack",
    version,
    about = "Run commands and supervise services with readiness checks",
    styles = help_styles()
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
    /// Path to the task file.
    #[arg(long, global = true, default_value = DEFAULT_CONFIG)]
    config: PathBuf,
    /// Print events as JSON lines.
    #[arg(long, global = true)]
    json: bool,
    /// Log level (overrides TASKRACK_LOG).
    #[arg(long, global = true, value_enum)]
    log_level: Option<LogLevel>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run the task file: commands first, then services until interrupted.
    Up,
    /// Run a single command: taskrack exec -- <cmd> [args...]
    Exec {
        /// Timeout in milliseconds.
        #[arg(long)]
        timeout_ms: Option<u64>,
        /// Treat a non-zero exit as success.
        #[arg(long)]
        ignore_exit_code: bool,
        /// Skip the dangerous-command check.
        #[arg(long)]
        allow_dangerous: bool,
        #[arg(trailing_var_arg = true, required = true)]
        command: Vec<String>,
    },
    /// Validate the task file.
    Check,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.log_level)?;

    match &cli.command {
        Commands::Up => run_up(&cli).await,
        Commands::Exec {
            timeout_ms,
            ignore_exit_code,
            allow_dangerous,
            command,
        } => {
            let config = load_optional_config(&cli)?;
            let mut task = TaskBuilder::new("exec", shell_words::join(command)).cli();
            task.timeout_ms = *timeout_ms;
            task.ignore_exit_code = *ignore_exit_code;
            task.allow_dangerous = *allow_dangerous;
            let executor = CliExecutor::new(config.executor.cli, config.executor.safety);
            let code = match executor.execute(&task).await {
                Ok(result) => {
                    print_result(&result, cli.json)?;
                    0
                }
                Err(err) => {
                    if let Some(result) = err.result() {
                        print_result(result, cli.json)?;
                    }
                    eprintln!("taskrack: {}", err);
                    exit_code_for(&err)
                }
            };
            std::process::exit(code);
        }
        Commands::Check => run_check(&cli),
    }
}

async fn run_up(cli: &Cli) -> Result<()> {
    let config = load_config(&cli.config)?;
    if config.commands.is_empty() && config.services.is_empty() {
        bail!("{} defines no commands or services", cli.config.display());
    }

    let commands = CliExecutor::new(config.executor.cli.clone(), config.executor.safety.clone());
    for task in &config.commands {
        info!(task = %task.task.id, title = %task.task.title, "running command");
        let result = commands
            .execute(task)
            .await
            .with_context(|| format!("command '{}' failed", task.task.title))?;
        print_result(&result, cli.json)?;
    }
    if config.services.is_empty() {
        return Ok(());
    }

    let services = ServiceExecutor::new(config.executor.service, config.executor.safety);
    let mut events = services.subscribe();
    for task in config.services {
        let title = task.task.title.clone();
        if let Err(err) = services.start(task).await {
            services.stop_all(StopOptions::default()).await;
            return Err(err).with_context(|| format!("failed to start service '{}'", title));
        }
    }

    let (shutdown_tx, mut shutdown_rx) = mpsc::channel(4);
    spawn_signal_listener(shutdown_tx);
    let mut printer = EventPrinter::new(cli.json);
    let mut idle_check = tokio::time::interval(Duration::from_millis(250));

    loop {
        tokio::select! {
            received = events.recv() => match received {
                Ok(event) => printer.print(&event)?,
                Err(broadcast::error::RecvError::Lagged(missed)) => {
                    warn!(missed, "event printer fell behind");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            },
            Some(signal) = shutdown_rx.recv() => {
                info!(signal = %signal, "shutting down services");
                services.stop_all(shutdown_options(signal)).await;
                break;
            }
            _ = idle_check.tick() => {
                if services.is_idle() {
                    info!("all services have exited");
                    break;
                }
            }
        }
    }
    // Flush whatever the shutdown produced.
    while let Ok(event) = events.try_recv() {
        printer.print(&event)?;
    }
    Ok(())
}

fn run_check(cli: &Cli) -> Result<()> {
    let config = load_config(&cli.config)?;
    let validator = TaskValidator::new(config.executor.safety.clone());
    let mut failures = 0;
    for task in &config.commands {
        report_check(&task.task.title, validator.validate_cli(task), &mut failures);
    }
    for task in &config.services {
        report_check(&task.task.title, validator.validate_service(task), &mut failures);
    }
    if failures > 0 {
        bail!("{} task(s) failed validation", failures);
    }
    println!(
        "{}: {} command(s), {} service(s) ok",
        cli.config.display(),
        config.commands.len(),
        config.services.len()
    );
    Ok(())
}

fn report_check(title: &str, outcome: taskrack::Result<()>, failures: &mut usize) {
    match outcome {
        Ok(()) => println!("ok      {}", title),
        Err(TaskError::Validation { violations, .. }) => {
            *failures += 1;
            println!("invalid {}", title);
            for violation in violations {
                println!("        - {}", violation);
            }
        }
        Err(err) => {
            *failures += 1;
            println!("invalid {}: {}", title, err);
        }
    }
}

/// `exec` works without a task file; one is only read when present.
fn load_optional_config(cli: &Cli) -> Result<TaskFile> {
    if cli.config.exists() {
        load_config(&cli.config)
    } else if cli.config.as_os_str() != DEFAULT_CONFIG {
        bail!("config file {} does not exist", cli.config.display())
    } else {
        Ok(TaskFile::default())
    }
}

fn print_result(result: &ExecutionResult, json: bool) -> Result<()> {
    if json {
        println!("{}", serde_json::to_string(result)?);
        return Ok(());
    }
    print!("{}", result.stdout);
    eprint!("{}", result.stderr);
    Ok(())
}

fn exit_code_for(err: &TaskError) -> i32 {
    match err {
        TaskError::Timeout { .. } => 124,
        TaskError::Process { code: Some(code), .. } if *code != 0 => *code,
        _ => 1,
    }
}

/// Renders service events for the terminal.
struct EventPrinter {
    json: bool,
    titles: HashMap<String, String>,
}

impl EventPrinter {
    fn new(json: bool) -> Self {
        Self {
            json,
            titles: HashMap::new(),
        }
    }

    fn print(&mut self, event: &ServiceEvent) -> Result<()> {
        if self.json {
            println!("{}", serde_json::to_string(event)?);
            return Ok(());
        }
        if let ServiceEvent::ServiceStarted { handle, task } = event {
            self.titles.insert(handle.id.clone(), task.task.title.clone());
        }
        let title = self
            .titles
            .get(event.service_id())
            .map(String::as_str)
            .unwrap_or("service");
        match event {
            ServiceEvent::ServiceOutput { data, .. } => println!("{} | {}", title, data),
            ServiceEvent::ServiceReady {
                boot_duration_ms,
                handle,
                ..
            } => {
                let endpoints = handle
                    .endpoints
                    .iter()
                    .map(|(name, url)| format!("{}={}", name, url))
                    .collect::<Vec<_>>()
                    .join(" ");
                println!("{} > ready in {}ms {}", title, boot_duration_ms, endpoints);
            }
            ServiceEvent::ServiceExited { code, signal, .. } => {
                println!("{} > exited (code {:?}, signal {:?})", title, code, signal)
            }
            ServiceEvent::ServiceRestarting {
                attempt,
                max_retries,
                reason,
                ..
            } => println!(
                "{} > restarting {}/{} after {}",
                title, attempt, max_retries, reason
            ),
            other => println!("{} > {}", title, other.name()),
        }
        Ok(())
    }
}

/// Services receive the same signal taskrack was interrupted with.
fn shutdown_options(signal: ProcessSignal) -> StopOptions {
    StopOptions {
        signal: Some(signal),
        ..StopOptions::default()
    }
}

fn spawn_signal_listener(tx: mpsc::Sender<ProcessSignal>) {
    tokio::spawn(async move {
        #[cfg(unix)]
        {
            use tokio::signal::unix::{signal, SignalKind};
            let mut sigterm = match signal(SignalKind::terminate()) {
                Ok(signal) => signal,
                Err(_) => return,
            };
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {
                    let _ = tx.send(ProcessSignal::SigInt).await;
                }
                _ = sigterm.recv() => {
                    let _ = tx.send(ProcessSignal::SigTerm).await;
                }
            }
        }
        #[cfg(not(unix))]
        {
            let _ = tokio::signal::ctrl_c().await;
            let _ = tx.send(ProcessSignal::SigInt).await;
        }
    });
}

fn help_styles() -> Styles {
    Styles::styled()
        .header(
            Style::new()
                .fg_color(Some(AnsiColor::Cyan.into()))
                .effects(Effects::BOLD),
        )
        .usage(
            Style::new()
                .fg_color(Some(AnsiColor::Green.into()))
                .effects(Effects::BOLD),
        )
        .literal(Style::new().fg_color(Some(AnsiColor::Yellow.into())))
        .placeholder(Style::new().fg_color(Some(AnsiColor::Magenta.into())))
}
