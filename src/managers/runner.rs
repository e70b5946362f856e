// src/managers/runner.rs

//! External command execution for package manager adapters
//!
//! Every native tool invocation goes through here. The runner forces
//! `LANG=C` so parsers see untranslated output, nullifies stdin to prevent
//! hangs, drains stdout/stderr on reader threads (simulation output can
//! exceed the pipe buffer), and polls the run's deadline while the child is
//! blocked. When the deadline fires mid-command the child gets SIGTERM,
//! then SIGKILL after a fixed grace.

use crate::window::RunControl;
use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use std::io::Read;
use std::process::{Child, Command, Stdio};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, warn};
use wait_timeout::ChildExt;

/// Cap on any single package manager invocation
const DEFAULT_COMMAND_TIMEOUT: Duration = Duration::from_secs(30 * 60);

/// SIGTERM to SIGKILL gap
const KILL_GRACE: Duration = Duration::from_secs(15);

/// Poll interval while the child runs
const POLL_INTERVAL: Duration = Duration::from_millis(250);

/// Captured result of one external command.
#[derive(Debug, Clone)]
pub struct CommandOutput {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
    /// True when the child was killed by deadline or timeout
    pub terminated: bool,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.exit_code == 0 && !self.terminated
    }

    /// stdout and stderr concatenated, for substring diagnostics
    pub fn combined(&self) -> String {
        let mut combined = self.stdout.clone();
        if !self.stderr.is_empty() {
            combined.push('\n');
            combined.push_str(&self.stderr);
        }
        combined
    }
}

/// Shared command runner, one per process.
pub struct CommandRunner {
    control: Arc<RunControl>,
    command_timeout: Duration,
}

impl CommandRunner {
    pub fn new(control: Arc<RunControl>) -> Self {
        Self { control, command_timeout: DEFAULT_COMMAND_TIMEOUT }
    }

    #[cfg(test)]
    pub fn with_timeout(control: Arc<RunControl>, command_timeout: Duration) -> Self {
        Self { control, command_timeout }
    }

    pub fn control(&self) -> Arc<RunControl> {
        Arc::clone(&self.control)
    }

    /// Run a command to completion, with extra environment variables.
    pub fn run_with_env(
        &self,
        program: &str,
        args: &[&str],
        env: &[(&str, &str)],
    ) -> std::io::Result<CommandOutput> {
        debug!("Running: {} {}", program, args.join(" "));

        let mut cmd = Command::new(program);
        cmd.args(args)
            .env("LANG", "C")
            .env("LC_ALL", "C")
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        for (key, value) in env {
            cmd.env(key, value);
        }

        let mut child = cmd.spawn()?;

        // Drain pipes on their own threads so a chatty child cannot fill
        // the pipe buffer and deadlock against our poll loop.
        let stdout_handle = spawn_drain(child.stdout.take());
        let stderr_handle = spawn_drain(child.stderr.take());

        let started = Instant::now();
        let (exit_code, terminated) = self.supervise(&mut child, started)?;

        let stdout = stdout_handle.join().unwrap_or_default();
        let stderr = stderr_handle.join().unwrap_or_default();

        if terminated {
            warn!(
                "Command terminated after {:?}: {} {}",
                started.elapsed(),
                program,
                args.join(" ")
            );
        }

        Ok(CommandOutput { exit_code, stdout, stderr, terminated })
    }

    pub fn run(&self, program: &str, args: &[&str]) -> std::io::Result<CommandOutput> {
        self.run_with_env(program, args, &[])
    }

    /// Poll the child until exit, deadline, or timeout.
    fn supervise(&self, child: &mut Child, started: Instant) -> std::io::Result<(i32, bool)> {
        loop {
            if let Some(status) = child.wait_timeout(POLL_INTERVAL)? {
                return Ok((status.code().unwrap_or(-1), false));
            }

            let overdue = started.elapsed() > self.command_timeout;
            if overdue || self.control.deadline_exceeded() {
                self.terminate(child)?;
                return Ok((-1, true));
            }
        }
    }

    /// SIGTERM, wait out the grace, then SIGKILL.
    fn terminate(&self, child: &mut Child) -> std::io::Result<()> {
        let pid = Pid::from_raw(child.id() as i32);
        debug!("Sending SIGTERM to child {}", pid);
        let _ = kill(pid, Signal::SIGTERM);

        if child.wait_timeout(KILL_GRACE)?.is_none() {
            warn!("Child {} survived SIGTERM grace; sending SIGKILL", pid);
            let _ = kill(pid, Signal::SIGKILL);
            let _ = child.wait();
        }
        Ok(())
    }
}

fn spawn_drain<R: Read + Send + 'static>(
    source: Option<R>,
) -> std::thread::JoinHandle<String> {
    std::thread::spawn(move || {
        let mut buffer = Vec::new();
        if let Some(mut reader) = source {
            let _ = reader.read_to_end(&mut buffer);
        }
        String::from_utf8_lossy(&buffer).into_owned()
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn runner() -> CommandRunner {
        CommandRunner::new(Arc::new(RunControl::new()))
    }

    #[test]
    fn test_run_captures_stdout() {
        let out = runner().run("sh", &["-c", "echo hello"]).unwrap();
        assert!(out.success());
        assert_eq!(out.stdout.trim(), "hello");
    }

    #[test]
    fn test_run_captures_exit_code() {
        let out = runner().run("sh", &["-c", "echo oops >&2; exit 3"]).unwrap();
        assert!(!out.success());
        assert_eq!(out.exit_code, 3);
        assert_eq!(out.stderr.trim(), "oops");
    }

    #[test]
    fn test_lang_is_forced_to_c() {
        let out = runner().run("sh", &["-c", "echo $LANG"]).unwrap();
        assert_eq!(out.stdout.trim(), "C");
    }

    #[test]
    fn test_command_timeout_terminates_child() {
        let control = Arc::new(RunControl::new());
        let runner = CommandRunner::with_timeout(control, Duration::from_millis(300));
        let out = runner.run("sh", &["-c", "sleep 30"]).unwrap();
        assert!(out.terminated);
        assert_eq!(out.exit_code, -1);
    }

    #[test]
    fn test_expired_deadline_terminates_child() {
        let control = Arc::new(RunControl::new());
        control.set_deadline(Instant::now());
        let runner = CommandRunner::new(control);
        let out = runner.run("sh", &["-c", "sleep 30"]).unwrap();
        assert!(out.terminated);
    }

    #[test]
    fn test_large_output_does_not_deadlock() {
        // Exceeds the 64 KiB pipe buffer
        let out = runner()
            .run("sh", &["-c", "yes 0123456789abcdef | head -n 20000"])
            .unwrap();
        assert!(out.success());
        assert!(out.stdout.len() > 64 * 1024);
    }
}
