//! Serial console capture
//!
//! The grabber runs as its own process group leader with stdout and stderr
//! redirected into the session's serial log, so stopping it also stops any
//! helpers it forked (ssh, ipmitool, ...).

use dutlink_common::{ProcessHandle, ResolvedCommand, Result};
use nix::sys::signal::Signal;
use std::fs::OpenOptions;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use tracing::{debug, info};

/// A running serial grabber
#[derive(Debug)]
pub struct SerialCapture {
    process: ProcessHandle,
    log_path: PathBuf,
}

impl SerialCapture {
    /// Start `cmd` appending its output to `log_path`
    pub fn start(cmd: &ResolvedCommand, log_path: &Path) -> Result<Self> {
        let log = OpenOptions::new()
            .create(true)
            .append(true)
            .open(log_path)?;

        let mut command = cmd.to_command();
        command
            .stdin(Stdio::null())
            .stdout(log.try_clone()?)
            .stderr(log);

        let process = ProcessHandle::spawn_group_leader("serial", command)?;
        info!(
            "Serial capture started (PID {}) -> {}",
            process.pid(),
            log_path.display()
        );
        Ok(Self {
            process,
            log_path: log_path.to_path_buf(),
        })
    }

    pub fn pid(&self) -> u32 {
        self.process.pid()
    }

    pub fn log_path(&self) -> &Path {
        &self.log_path
    }

    pub fn is_running(&mut self) -> bool {
        self.process.is_running()
    }

    /// Terminate the whole process group and reap the leader.
    ///
    /// A group that is already gone counts as stopped.
    pub fn stop(mut self) -> Result<()> {
        if self.process.signal_group(Signal::SIGTERM)? {
            debug!("Sent SIGTERM to serial group {}", self.process.pid());
        } else {
            debug!("Serial group {} already gone", self.process.pid());
        }
        let status = self.process.wait()?;
        info!("Serial capture stopped: {}", status);
        Ok(())
    }
}
