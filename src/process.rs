//! Supervision of a client-run backend command
//!
//! The CLI can launch the backend it is about to proxy. The child gets its
//! own process group so an interrupt at the CLI can take down the whole
//! backend tree, and stdout/stderr stay attached to the terminal.

use crate::error::{Error, Result};
use std::process::Stdio;
use std::time::Duration;
use tokio::process::{Child, Command};
use tracing::{debug, warn};

const STOP_GRACE_PERIOD: Duration = Duration::from_secs(5);

/// A child command running in its own process group
pub struct Supervised {
    child: Child,
    pid: i32,
}

/// Start the given command as a supervised child.
pub fn run_command(args: &[String]) -> Result<Supervised> {
    let (program, rest) = args.split_first().ok_or_else(|| {
        Error::ChildProcess(std::io::Error::new(
            std::io::ErrorKind::InvalidInput,
            "empty command",
        ))
    })?;

    let mut cmd = Command::new(program);
    cmd.args(rest);
    cmd.stdin(Stdio::null());
    cmd.stdout(Stdio::inherit());
    cmd.stderr(Stdio::inherit());
    #[cfg(unix)]
    cmd.process_group(0);

    println!("[*] running command: {}", args.join(" "));
    let child = cmd.spawn().map_err(Error::ChildProcess)?;
    let pid = child.id().map(|id| id as i32).unwrap_or(0);
    Ok(Supervised { child, pid })
}

impl Supervised {
    pub fn pid(&self) -> i32 {
        self.pid
    }

    /// Whether the process group leader is still running.
    pub fn is_alive(&self) -> bool {
        if self.pid == 0 {
            return false;
        }
        #[cfg(unix)]
        {
            unsafe { libc::kill(self.pid, 0) == 0 }
        }
        #[cfg(not(unix))]
        {
            true
        }
    }

    /// Terminate the whole process group and wait for the leader to exit.
    /// Checks liveness first so an already-exited child is not reported as
    /// a stop failure.
    pub async fn stop(&mut self) {
        if !self.is_alive() {
            debug!(pid = self.pid, "command already exited");
            let _ = self.child.try_wait();
            return;
        }

        println!("[*] stopping process {}", self.pid);
        #[cfg(unix)]
        unsafe {
            libc::killpg(self.pid, libc::SIGTERM);
        }
        #[cfg(not(unix))]
        {
            let _ = self.child.start_kill();
        }

        match tokio::time::timeout(STOP_GRACE_PERIOD, self.child.wait()).await {
            Ok(Ok(status)) => debug!(pid = self.pid, ?status, "command exited"),
            Ok(Err(e)) => warn!(pid = self.pid, error = %e, "error waiting for command to exit"),
            Err(_) => {
                warn!(pid = self.pid, "grace period exceeded, killing process group");
                #[cfg(unix)]
                unsafe {
                    libc::killpg(self.pid, libc::SIGKILL);
                }
                #[cfg(not(unix))]
                {
                    let _ = self.child.start_kill();
                }
                let _ = self.child.wait().await;
            }
        }
    }

    /// Wait for the command to exit on its own.
    pub async fn wait(&mut self) -> std::io::Result<std::process::ExitStatus> {
        self.child.wait().await
    }
}
