//! Process spawning and termination helpers shared by both executors.
//!
//! Commands run through the platform shell so operators in the command line
//! behave as typed. On unix each child leads its own process group, which lets
//! signals reach the whole subtree spawned by the shell.

use std::collections::HashMap;
use std::fmt;
use std::path::PathBuf;
use std::process::{ExitStatus, Stdio};
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::process::{Child, Command};
use tracing::{debug, warn};

use crate::task::Task;

/// Signals the executors know how to deliver.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ProcessSignal {
    SigInt,
    SigTerm,
    SigHup,
    SigQuit,
    SigKill,
}

impl ProcessSignal {
    pub fn as_str(self) -> &'static str {
        match self {
            ProcessSignal::SigInt => "SIGINT",
            ProcessSignal::SigTerm => "SIGTERM",
            ProcessSignal::SigHup => "SIGHUP",
            ProcessSignal::SigQuit => "SIGQUIT",
            ProcessSignal::SigKill => "SIGKILL",
        }
    }

    #[cfg(unix)]
    fn raw(self) -> i32 {
        match self {
            ProcessSignal::SigInt => libc::SIGINT,
            ProcessSignal::SigTerm => libc::SIGTERM,
            ProcessSignal::SigHup => libc::SIGHUP,
            ProcessSignal::SigQuit => libc::SIGQUIT,
            ProcessSignal::SigKill => libc::SIGKILL,
        }
    }

    #[cfg(unix)]
    fn from_raw(raw: i32) -> Option<Self> {
        [
            ProcessSignal::SigInt,
            ProcessSignal::SigTerm,
            ProcessSignal::SigHup,
            ProcessSignal::SigQuit,
            ProcessSignal::SigKill,
        ]
        .into_iter()
        .find(|signal| signal.raw() == raw)
    }
}

impl fmt::Display for ProcessSignal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ProcessSignal {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let upper = value.trim().to_ascii_uppercase();
        let name = upper.strip_prefix("SIG").unwrap_or(&upper);
        match name {
            "INT" => Ok(ProcessSignal::SigInt),
            "TERM" => Ok(ProcessSignal::SigTerm),
            "HUP" => Ok(ProcessSignal::SigHup),
            "QUIT" => Ok(ProcessSignal::SigQuit),
            "KILL" => Ok(ProcessSignal::SigKill),
            _ => Err(format!("unsupported signal: {}", value)),
        }
    }
}

/// Resolves a task working directory against the current directory.
pub fn resolve_working_directory(dir: Option<&str>) -> Option<PathBuf> {
    let dir = PathBuf::from(dir?);
    if dir.is_absolute() {
        return Some(dir);
    }
    match std::env::current_dir() {
        Ok(cwd) => Some(cwd.join(dir)),
        Err(_) => Some(dir),
    }
}

/// Builds a shell command for `task` with `base_env` merged under the task's
/// own environment. Stdout and stderr are piped, stdin is closed.
pub fn shell_command(task: &Task, base_env: &HashMap<String, String>) -> Command {
    let line = task.command_line();
    let mut command = if cfg!(windows) {
        let mut c = Command::new("cmd");
        c.arg("/C").arg(&line);
        c
    } else {
        let mut c = Command::new("sh");
        c.arg("-c").arg(&line);
        c
    };
    if !base_env.is_empty() {
        command.envs(base_env);
    }
    if !task.environment.is_empty() {
        command.envs(&task.environment);
    }
    if let Some(dir) = resolve_working_directory(task.working_directory.as_deref()) {
        command.current_dir(dir);
    }
    command
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());
    command.kill_on_drop(true);

    #[cfg(windows)]
    {
        const CREATE_NEW_PROCESS_GROUP: u32 = 0x00000200;
        command.creation_flags(CREATE_NEW_PROCESS_GROUP);
    }

    #[cfg(unix)]
    unsafe {
        command.pre_exec(|| {
            let _ = libc::setpgid(0, 0);
            Ok(())
        });
    }

    command
}

/// Delivers `signal` to the process group led by `pid` and to `pid` itself.
#[cfg(unix)]
pub fn send_os_signal(pid: u32, signal: ProcessSignal) {
    debug!(pid, signal = %signal, "sending signal");
    unsafe {
        let sig = signal.raw();
        let pid = pid as i32;
        let _ = libc::kill(-pid, sig);
        let _ = libc::kill(pid, sig);
    }
}

#[cfg(not(unix))]
pub fn send_os_signal(pid: u32, signal: ProcessSignal) {
    debug!(pid, signal = %signal, "sending signal");
    if signal != ProcessSignal::SigKill {
        send_ctrl_break(pid);
    }
}

#[cfg(all(not(unix), windows))]
fn send_ctrl_break(pid: u32) {
    use windows_sys::Win32::System::Console::GenerateConsoleCtrlEvent;
    use windows_sys::Win32::System::Console::CTRL_BREAK_EVENT;
    // Windows has no SIGTERM/SIGINT; CTRL_BREAK is the closest console signal we can emit.
    unsafe {
        let _ = GenerateConsoleCtrlEvent(CTRL_BREAK_EVENT, pid);
    }
}

#[cfg(all(not(unix), not(windows)))]
fn send_ctrl_break(_pid: u32) {}

/// Name of the signal that terminated the process, if any.
#[cfg(unix)]
pub fn exit_signal(status: &ExitStatus) -> Option<String> {
    use std::os::unix::process::ExitStatusExt;
    status.signal().map(|raw| {
        ProcessSignal::from_raw(raw)
            .map(|s| s.as_str().to_string())
            .unwrap_or_else(|| format!("SIG{}", raw))
    })
}

#[cfg(not(unix))]
pub fn exit_signal(_status: &ExitStatus) -> Option<String> {
    None
}

pub async fn wait_for_exit(
    child: &mut Child,
    timeout: Duration,
) -> std::io::Result<Option<ExitStatus>> {
    if timeout.is_zero() {
        return child.try_wait();
    }
    match tokio::time::timeout(timeout, child.wait()).await {
        Ok(Ok(status)) => Ok(Some(status)),
        Ok(Err(err)) => Err(err),
        Err(_) => Ok(None),
    }
}

/// Sends `signal`, waits up to `grace` for the child to exit, then kills the
/// whole group and reaps the child.
pub async fn terminate(
    child: &mut Child,
    signal: ProcessSignal,
    grace: Duration,
) -> std::io::Result<ExitStatus> {
    let Some(pid) = child.id() else {
        // Already reaped.
        return child.wait().await;
    };
    send_os_signal(pid, signal);
    if let Some(status) = wait_for_exit(child, grace).await? {
        return Ok(status);
    }
    warn!(pid, grace_ms = grace.as_millis() as u64, "process ignored {}, killing", signal);
    send_os_signal(pid, ProcessSignal::SigKill);
    let _ = child.start_kill();
    child.wait().await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_signal_names() {
        assert_eq!("SIGTERM".parse::<ProcessSignal>(), Ok(ProcessSignal::SigTerm));
        assert_eq!("int".parse::<ProcessSignal>(), Ok(ProcessSignal::SigInt));
        assert_eq!(" sigkill ".parse::<ProcessSignal>(), Ok(ProcessSignal::SigKill));
        assert!("SIGWINCH".parse::<ProcessSignal>().is_err());
    }

    #[test]
    fn signal_serializes_as_uppercase_name() {
        let json = serde_json::to_string(&ProcessSignal::SigHup).unwrap();
        assert_eq!(json, "\"SIGHUP\"");
    }

    #[test]
    fn relative_working_directory_resolves_against_cwd() {
        let resolved = resolve_working_directory(Some("sub")).unwrap();
        assert!(resolved.is_absolute());
        assert!(resolved.ends_with("sub"));
        assert_eq!(resolve_working_directory(None), None);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn terminate_escalates_to_kill() {
        let task = crate::task::TaskBuilder::new("stubborn", "trap '' TERM; sleep 5").build();
        let mut child = shell_command(&task, &HashMap::new()).spawn().unwrap();
        // Give the shell time to install the trap.
        tokio::time::sleep(Duration::from_millis(100)).await;
        let status = terminate(&mut child, ProcessSignal::SigTerm, Duration::from_millis(200))
            .await
            .unwrap();
        assert_eq!(exit_signal(&status).as_deref(), Some("SIGKILL"));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn merges_base_and_task_environment() {
        use tokio::io::AsyncReadExt;

        let task = crate::task::TaskBuilder::new("env", "echo $A-$B")
            .env("B", "task")
            .build();
        let mut base = HashMap::new();
        base.insert("A".to_string(), "base".to_string());
        base.insert("B".to_string(), "base".to_string());
        let mut child = shell_command(&task, &base).spawn().unwrap();
        let mut out = String::new();
        child.stdout.take().unwrap().read_to_string(&mut out).await.unwrap();
        child.wait().await.unwrap();
        assert_eq!(out.trim(), "base-task");
    }
}
