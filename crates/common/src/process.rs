//! Child process supervision
//!
//! Every external helper (capture producers, input injectors, serial
//! grabbers) is owned through a [`ProcessHandle`]. Dropping the handle
//! terminates and reaps the child, so no exit path leaks a process.

use crate::{Error, Result};
use nix::errno::Errno;
use nix::sys::signal::{kill, killpg, Signal};
use nix::unistd::Pid;
use std::os::unix::process::CommandExt;
use std::process::{Child, ChildStdin, ChildStdout, Command, ExitStatus};
use std::time::Duration;
use tracing::{debug, warn};

/// Polls granted to a child after SIGTERM before it is killed
const GRACEFUL_POLLS: u32 = 20;
const GRACEFUL_POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Handle to a supervised child process
#[derive(Debug)]
pub struct ProcessHandle {
    child: Child,
    label: String,
    group_leader: bool,
    reaped: Option<ExitStatus>,
    /// The process group was seen empty after the leader was reaped
    group_gone: bool,
}

impl ProcessHandle {
    /// Spawn `cmd`; `label` names the process in logs and errors
    pub fn spawn(label: impl Into<String>, mut cmd: Command) -> Result<Self> {
        let label = label.into();
        debug!("Spawning {}: {:?}", label, cmd);
        let child = cmd
            .spawn()
            .map_err(|e| Error::execution(label.clone(), format!("failed to spawn: {}", e)))?;
        debug!("{} started with PID {}", label, child.id());
        Ok(Self {
            child,
            label,
            group_leader: false,
            reaped: None,
            group_gone: false,
        })
    }

    /// Spawn `cmd` as the leader of a new process group
    pub fn spawn_group_leader(label: impl Into<String>, mut cmd: Command) -> Result<Self> {
        cmd.process_group(0);
        let mut handle = Self::spawn(label, cmd)?;
        handle.group_leader = true;
        Ok(handle)
    }

    pub fn pid(&self) -> u32 {
        self.child.id()
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn take_stdout(&mut self) -> Option<ChildStdout> {
        self.child.stdout.take()
    }

    pub fn take_stdin(&mut self) -> Option<ChildStdin> {
        self.child.stdin.take()
    }

    /// Non-blocking exit check
    pub fn try_wait(&mut self) -> Result<Option<ExitStatus>> {
        if self.reaped.is_some() {
            return Ok(self.reaped);
        }
        let status = self.child.try_wait()?;
        self.reaped = status;
        Ok(status)
    }

    pub fn is_running(&mut self) -> bool {
        matches!(self.try_wait(), Ok(None))
    }

    /// Block until the child exits
    pub fn wait(&mut self) -> Result<ExitStatus> {
        if let Some(status) = self.reaped {
            return Ok(status);
        }
        let status = self.child.wait()?;
        self.reaped = Some(status);
        Ok(status)
    }

    /// Deliver `signal` to the child's whole process group.
    ///
    /// Returns `Ok(false)` when the group no longer exists. Once the leader
    /// has been reaped its PID only stays reserved while other members of
    /// the group live, so an emptied group is remembered and never signalled
    /// again.
    pub fn signal_group(&mut self, signal: Signal) -> Result<bool> {
        if self.group_gone {
            return Ok(false);
        }
        let pgid = Pid::from_raw(self.child.id() as i32);
        if self.reaped.is_some() && !self.group_alive(pgid)? {
            return Ok(false);
        }
        match killpg(pgid, signal) {
            Ok(()) => Ok(true),
            Err(Errno::ESRCH) => {
                self.group_gone = self.reaped.is_some();
                Ok(false)
            }
            Err(e) => Err(Error::Sys(e)),
        }
    }

    fn group_alive(&mut self, pgid: Pid) -> Result<bool> {
        match killpg(pgid, None) {
            Ok(()) => Ok(true),
            Err(Errno::ESRCH) => {
                debug!("{} process group {} is empty", self.label, pgid);
                self.group_gone = true;
                Ok(false)
            }
            Err(e) => Err(Error::Sys(e)),
        }
    }

    /// SIGTERM the child (or its group), wait briefly, then SIGKILL and reap
    pub fn terminate(&mut self) -> Result<ExitStatus> {
        if let Some(status) = self.try_wait()? {
            return Ok(status);
        }

        let pid = Pid::from_raw(self.child.id() as i32);
        let delivered = if self.group_leader {
            self.signal_group(Signal::SIGTERM)?
        } else {
            match kill(pid, Signal::SIGTERM) {
                Ok(()) => true,
                Err(Errno::ESRCH) => false,
                Err(e) => return Err(Error::Sys(e)),
            }
        };

        if delivered {
            for _ in 0..GRACEFUL_POLLS {
                if let Some(status) = self.try_wait()? {
                    debug!("{} (PID {}) exited: {}", self.label, pid, status);
                    return Ok(status);
                }
                std::thread::sleep(GRACEFUL_POLL_INTERVAL);
            }
            warn!("{} (PID {}) ignored SIGTERM, killing", self.label, pid);
        }

        // Already-exited children make kill() fail with InvalidInput; wait() still reaps them.
        let _ = self.child.kill();
        self.wait()
    }
}

impl Drop for ProcessHandle {
    fn drop(&mut self) {
        if self.reaped.is_none() {
            if let Err(e) = self.terminate() {
                warn!("Failed to reap {}: {}", self.label, e);
            }
        }
    }
}
