//! External command runner
//!
//! Power, flash, eject and shutdown-probe actions are delegated to site
//! specific executables living in one configured directory.

use crate::config::{CommandSpec, CommandsConfig};
use crate::{Error, Result};
use std::path::{Path, PathBuf};
use std::process::Command;
use tracing::debug;

/// Logical command names
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HwCommand {
    PowerOn,
    PowerOff,
    Flash,
    Serial,
    IsShutdown,
    Eject,
    Input,
}

impl HwCommand {
    /// Configuration key of the command
    pub fn key(&self) -> &'static str {
        match self {
            HwCommand::PowerOn => "power_on",
            HwCommand::PowerOff => "power_off",
            HwCommand::Flash => "flash",
            HwCommand::Serial => "serial",
            HwCommand::IsShutdown => "is_shutdown",
            HwCommand::Eject => "eject",
            HwCommand::Input => "input",
        }
    }

    fn spec<'a>(&self, config: &'a CommandsConfig) -> Option<&'a CommandSpec> {
        match self {
            HwCommand::PowerOn => config.power_on.as_ref(),
            HwCommand::PowerOff => config.power_off.as_ref(),
            HwCommand::Flash => config.flash.as_ref(),
            HwCommand::Serial => config.serial.as_ref(),
            HwCommand::IsShutdown => config.is_shutdown.as_ref(),
            HwCommand::Eject => config.eject.as_ref(),
            HwCommand::Input => config.input.as_ref(),
        }
    }
}

impl std::fmt::Display for HwCommand {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.key())
    }
}

/// A command resolved to an executable path and argv
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedCommand {
    pub program: PathBuf,
    pub args: Vec<String>,
}

impl ResolvedCommand {
    pub fn new(program: impl Into<PathBuf>, args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            args,
        }
    }

    /// Build a [`Command`] ready to spawn
    pub fn to_command(&self) -> Command {
        let mut cmd = Command::new(&self.program);
        cmd.args(&self.args);
        cmd
    }

    /// Shell-like rendering for logs and error messages
    pub fn display(&self) -> String {
        std::iter::once(self.program.display().to_string())
            .chain(self.args.iter().cloned())
            .collect::<Vec<_>>()
            .join(" ")
    }
}

/// Captured result of a finished command
#[derive(Debug, Clone)]
pub struct CommandOutput {
    pub code: i32,
    pub stdout: String,
    pub stderr: String,
}

/// Resolves and runs configured commands
#[derive(Debug, Clone)]
pub struct CommandRunner {
    config: CommandsConfig,
}

impl CommandRunner {
    pub fn new(config: CommandsConfig) -> Self {
        Self { config }
    }

    pub fn is_configured(&self, cmd: HwCommand) -> bool {
        cmd.spec(&self.config).is_some()
    }

    /// Resolve `cmd` against the command directory without running it
    pub fn resolve(&self, cmd: HwCommand) -> Result<ResolvedCommand> {
        let spec = cmd.spec(&self.config).ok_or_else(|| {
            Error::Configuration(format!("command '{}' is not configured", cmd))
        })?;
        let dir = self
            .config
            .dir
            .as_deref()
            .ok_or_else(|| Error::Configuration("commands.dir is not set".to_string()))?;
        if !dir.is_dir() {
            return Err(Error::Configuration(format!(
                "commands.dir '{}' is not a directory",
                dir.display()
            )));
        }

        // Only the file name is honoured so commands cannot escape the directory.
        let name = Path::new(&spec.name).file_name().ok_or_else(|| {
            Error::Configuration(format!("command '{}' has an invalid name '{}'", cmd, spec.name))
        })?;

        let args = spec
            .args
            .as_deref()
            .map(|a| a.split_whitespace().map(str::to_string).collect())
            .unwrap_or_default();

        Ok(ResolvedCommand::new(dir.join(name), args))
    }

    /// Run `cmd` with `extra_args` appended and return its exit code.
    ///
    /// A non-zero exit is a normal outcome here.
    pub fn run(&self, cmd: HwCommand, extra_args: &[String]) -> Result<CommandOutput> {
        let mut resolved = self.resolve(cmd)?;
        resolved.args.extend(extra_args.iter().cloned());
        let rendered = resolved.display();

        debug!("Running {}: {}", cmd, rendered);
        let output = resolved
            .to_command()
            .output()
            .map_err(|e| Error::execution(rendered.clone(), e))?;

        let stdout = String::from_utf8_lossy(&output.stdout).trim_end().to_string();
        let stderr = String::from_utf8_lossy(&output.stderr).trim_end().to_string();
        debug!("{} returned {}\nstdout: {}\nstderr: {}", cmd, output.status, stdout, stderr);

        let code = output
            .status
            .code()
            .ok_or_else(|| Error::execution(rendered, format!("terminated by {}", output.status)))?;

        Ok(CommandOutput {
            code,
            stdout,
            stderr,
        })
    }

    /// Run `cmd`, failing unless it exits successfully; returns stdout
    pub fn run_checked(&self, cmd: HwCommand, extra_args: &[String]) -> Result<String> {
        let output = self.run(cmd, extra_args)?;
        if output.code != 0 {
            return Err(Error::execution(
                cmd.key(),
                format!(
                    "exit code {}, stdout: {}, stderr: {}",
                    output.code, output.stdout, output.stderr
                ),
            ));
        }
        Ok(output.stdout)
    }
}
