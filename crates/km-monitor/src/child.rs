//! Handle for the spawned MCP server process.
//!
//! Exclusively owned by the orchestrator; only it may signal or wait.

use std::process::Stdio;
use std::time::Duration;
use tokio::process::{Child, ChildStderr, ChildStdin, ChildStdout, Command};

use crate::MonitorError;

#[derive(Debug)]
pub struct ChildProcess {
    child: Child,
    command: String,
}

impl ChildProcess {
    pub fn spawn(
        command: &str,
        args: &[String],
        env: &[(String, String)],
    ) -> Result<Self, MonitorError> {
        let mut cmd = Command::new(command);
        cmd.args(args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        for (key, value) in env {
            cmd.env(key, value);
        }

        let child = cmd
            .spawn()
            .map_err(|e| MonitorError::Spawn(format!("{command}: {e}")))?;

        tracing::debug!(target: "km::monitor", command, pid = child.id(), "child spawned");
        Ok(Self {
            child,
            command: command.to_string(),
        })
    }

    pub fn id(&self) -> Option<u32> {
        self.child.id()
    }

    pub fn take_stdin(&mut self) -> Option<ChildStdin> {
        self.child.stdin.take()
    }

    pub fn take_stdout(&mut self) -> Option<ChildStdout> {
        self.child.stdout.take()
    }

    pub fn take_stderr(&mut self) -> Option<ChildStderr> {
        self.child.stderr.take()
    }

    /// Wait for the child to exit on its own.
    pub async fn wait(&mut self) -> std::io::Result<std::process::ExitStatus> {
        self.child.wait().await
    }

    /// Ask the child to terminate. SIGTERM on unix; elsewhere this degrades
    /// to a kill.
    pub fn terminate(&mut self) {
        #[cfg(unix)]
        {
            if let Some(pid) = self.child.id() {
                let pid = nix::unistd::Pid::from_raw(pid as i32);
                if let Err(error) = nix::sys::signal::kill(pid, nix::sys::signal::Signal::SIGTERM) {
                    tracing::debug!(target: "km::monitor", %error, "SIGTERM delivery failed");
                }
                return;
            }
        }
        let _ = self.child.start_kill();
    }

    /// Terminate, wait out the grace window, then kill. Returns the exit
    /// code when one was observed.
    pub async fn shutdown_with_grace(&mut self, grace: Duration) -> Option<i32> {
        // Already exited?
        if let Ok(Some(status)) = self.child.try_wait() {
            return status.code();
        }

        self.terminate();
        match tokio::time::timeout(grace, self.child.wait()).await {
            Ok(Ok(status)) => status.code(),
            Ok(Err(error)) => {
                tracing::debug!(target: "km::monitor", %error, "wait after terminate failed");
                None
            }
            Err(_) => {
                tracing::warn!(
                    target: "km::monitor",
                    command = %self.command,
                    "child ignored terminate, killing"
                );
                let _ = self.child.kill().await;
                self.child.try_wait().ok().flatten().and_then(|s| s.code())
            }
        }
    }
}
