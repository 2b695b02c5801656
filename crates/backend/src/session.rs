//! Backend lifecycle controller
//!
//! A [`BackendSession`] drives one device-under-test through
//! Stopped -> Starting -> Running -> Stopping -> Stopped. Starting flashes
//! (when configured), power-cycles, attaches a console and starts serial
//! capture. Stopping powers off and releases everything, best effort.

use crate::hdd::hdd_args;
use crate::serial::SerialCapture;
use dutlink_common::{BackendConfig, CommandRunner, Error, HwCommand, Result};
use dutlink_console::{
    ConnectArgs, Console, ConsoleArgs, ConsoleRegistry, VncArgs, VIDEO_STREAM, VNC,
};
use serde::Serialize;
use std::fs::File;
use std::path::PathBuf;
use std::str::FromStr;
use tracing::{debug, error, info, info_span, warn};
use uuid::Uuid;

/// Lifecycle state of a session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Stopped,
    Starting,
    Running,
    Stopping,
}

impl std::fmt::Display for SessionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SessionState::Stopped => write!(f, "stopped"),
            SessionState::Starting => write!(f, "starting"),
            SessionState::Running => write!(f, "running"),
            SessionState::Stopping => write!(f, "stopping"),
        }
    }
}

/// Result of the shutdown-detection probe
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ShutdownState {
    /// No probe configured
    Unknown,
    ShutDown,
    Up,
}

impl ShutdownState {
    /// `None` when unknown, otherwise whether the device is shut down
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            ShutdownState::Unknown => None,
            ShutdownState::ShutDown => Some(true),
            ShutdownState::Up => Some(false),
        }
    }
}

/// Power actions accepted by [`BackendSession::power`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PowerAction {
    On,
    Off,
    /// Power off, pause, power on
    Reset,
}

impl FromStr for PowerAction {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "on" => Ok(PowerAction::On),
            "off" => Ok(PowerAction::Off),
            "reset" => Ok(PowerAction::Reset),
            other => Err(Error::Configuration(format!(
                "unknown power action '{}' (expected on, off or reset)",
                other
            ))),
        }
    }
}

/// Failures collected while stopping
#[derive(Debug, Default, Serialize)]
pub struct StopReport {
    pub errors: Vec<String>,
}

impl StopReport {
    pub fn is_clean(&self) -> bool {
        self.errors.is_empty()
    }

    fn record(&mut self, step: &str, result: Result<()>) {
        if let Err(e) = result {
            warn!("Stop step '{}' failed: {}", step, e);
            self.errors.push(format!("{}: {}", step, e));
        }
    }
}

/// Serialisable snapshot of a session
#[derive(Debug, Clone, Serialize)]
pub struct SessionStatus {
    pub id: Uuid,
    pub state: SessionState,
    pub console: Option<String>,
    pub serial_pid: Option<u32>,
    pub serial_log: PathBuf,
}

/// One device-under-test and everything attached to it
pub struct BackendSession {
    id: Uuid,
    config: BackendConfig,
    runner: CommandRunner,
    registry: ConsoleRegistry,
    state: SessionState,
    console: Option<Box<dyn Console>>,
    serial: Option<SerialCapture>,
}

impl std::fmt::Debug for BackendSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BackendSession")
            .field("id", &self.id)
            .field("state", &self.state)
            .field("console", &self.console.as_ref().map(|c| c.kind()))
            .field("serial", &self.serial)
            .finish()
    }
}

impl BackendSession {
    pub fn new(config: BackendConfig) -> Self {
        Self::with_registry(config, ConsoleRegistry::with_defaults())
    }

    /// Session using a custom console registry
    pub fn with_registry(config: BackendConfig, registry: ConsoleRegistry) -> Self {
        let runner = CommandRunner::new(config.commands.clone());
        Self {
            id: Uuid::new_v4(),
            config,
            runner,
            registry,
            state: SessionState::Stopped,
            console: None,
            serial: None,
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn config(&self) -> &BackendConfig {
        &self.config
    }

    /// The attached console, if any
    pub fn console_mut(&mut self) -> Option<&mut dyn Console> {
        self.console
            .as_deref_mut()
            .map(|console| console as &mut dyn Console)
    }

    pub fn status(&self) -> SessionStatus {
        SessionStatus {
            id: self.id,
            state: self.state,
            console: self.console.as_ref().map(|c| c.kind().to_string()),
            serial_pid: self.serial.as_ref().map(SerialCapture::pid),
            serial_log: self.config.serial.log_path.clone(),
        }
    }

    /// Which console to attach, checked before anything is touched
    fn console_plan(&self) -> Result<Option<(&'static str, ConsoleArgs)>> {
        let plan = if self.config.video.url.is_some() {
            let input_cmd = if self.runner.is_configured(HwCommand::Input) {
                Some(self.runner.resolve(HwCommand::Input)?)
            } else {
                None
            };
            let connect = ConnectArgs::from_config(&self.config.video, input_cmd)?;
            Some((
                VIDEO_STREAM,
                ConsoleArgs::VideoStream {
                    config: self.config.video.clone(),
                    connect,
                },
            ))
        } else if let Some(host) = &self.config.vnc.host {
            Some((
                VNC,
                ConsoleArgs::Vnc(VncArgs {
                    host: host.clone(),
                    port: self.config.vnc.port,
                    password: self.config.vnc.password.clone(),
                }),
            ))
        } else {
            None
        };

        if let Some((kind, _)) = &plan {
            if !self.registry.contains(kind) {
                return Err(Error::UnknownConsole(kind.to_string()));
            }
        }
        Ok(plan)
    }

    /// Bring the device up. The session only reaches Running if every step succeeds.
    pub fn start(&mut self) -> Result<()> {
        let span = info_span!("session", id = %self.id);
        let _enter = span.enter();

        if self.state != SessionState::Stopped {
            return Err(Error::InvalidStateTransition {
                from: self.state.to_string(),
                to: SessionState::Starting.to_string(),
            });
        }

        self.state = SessionState::Starting;
        info!("Starting backend session");
        match self.bring_up() {
            Ok(()) => {
                self.state = SessionState::Running;
                info!("Backend session running");
                Ok(())
            }
            Err(e) => {
                error!("Backend start failed: {}", e);
                let report = self.detach();
                if !report.is_clean() {
                    warn!("Cleanup after failed start: {:?}", report.errors);
                }
                self.state = SessionState::Stopped;
                Err(e)
            }
        }
    }

    fn bring_up(&mut self) -> Result<()> {
        // Resolve everything up front so a configuration error has no side effects.
        let console_plan = self.console_plan()?;
        let serial_cmd = if self.config.wants_serial() {
            Some(self.runner.resolve(HwCommand::Serial)?)
        } else {
            None
        };
        self.runner.resolve(HwCommand::PowerOff)?;
        self.runner.resolve(HwCommand::PowerOn)?;

        let log_path = &self.config.serial.log_path;
        File::create(log_path)?;
        debug!("Truncated {}", log_path.display());

        if self.runner.is_configured(HwCommand::Flash) {
            // never flash a powered device
            self.power_off()?;
            let args = hdd_args(&self.config.disks);
            info!("Flashing {} disk image(s)", args.len() / 2);
            self.runner.run_checked(HwCommand::Flash, &args)?;
        }

        self.restart()?;

        if let Some((kind, args)) = console_plan {
            info!("Attaching {} console", kind);
            self.console = Some(self.registry.create(kind, args)?);
        }

        if let Some(cmd) = serial_cmd {
            self.serial = Some(SerialCapture::start(&cmd, &self.config.serial.log_path)?);
        }
        Ok(())
    }

    /// Release serial capture and the console, collecting failures
    fn detach(&mut self) -> StopReport {
        let mut report = StopReport::default();
        if let Some(serial) = self.serial.take() {
            report.record("serial", serial.stop());
        }
        if let Some(mut console) = self.console.take() {
            report.record("console", console.disable());
        }
        report
    }

    /// Power off and release everything.
    ///
    /// Every step is attempted; failures are collected in the report rather
    /// than aborting. Stopping a stopped session does nothing.
    pub fn stop(&mut self) -> StopReport {
        let span = info_span!("session", id = %self.id);
        let _enter = span.enter();

        if self.state == SessionState::Stopped {
            debug!("Session already stopped");
            return StopReport::default();
        }

        self.state = SessionState::Stopping;
        info!("Stopping backend session");

        let mut report = StopReport::default();
        report.record("power_off", self.power_off());
        report.errors.extend(self.detach().errors);

        self.state = SessionState::Stopped;
        if report.is_clean() {
            info!("Backend session stopped");
        } else {
            warn!("Backend session stopped with {} error(s)", report.errors.len());
        }
        report
    }

    fn power_on(&self) -> Result<()> {
        info!("Powering on");
        self.runner.run_checked(HwCommand::PowerOn, &[]).map(|_| ())
    }

    fn power_off(&self) -> Result<()> {
        info!("Powering off");
        self.runner.run_checked(HwCommand::PowerOff, &[]).map(|_| ())
    }

    fn restart(&self) -> Result<()> {
        self.power_off()?;
        let delay = self.config.power_cycle_delay();
        if !delay.is_zero() {
            debug!("Waiting {:?} before power on", delay);
            std::thread::sleep(delay);
        }
        self.power_on()
    }

    pub fn power(&self, action: PowerAction) -> Result<()> {
        match action {
            PowerAction::On => self.power_on(),
            PowerAction::Off => self.power_off(),
            PowerAction::Reset => self.restart(),
        }
    }

    /// Eject removable media from the device
    pub fn eject_media(&self) -> Result<()> {
        info!("Ejecting media");
        self.runner.run_checked(HwCommand::Eject, &[]).map(|_| ())
    }

    /// Probe whether the device has shut down; exit code 0 means it has
    pub fn is_shutdown(&self) -> Result<ShutdownState> {
        if !self.runner.is_configured(HwCommand::IsShutdown) {
            return Ok(ShutdownState::Unknown);
        }
        let output = self.runner.run(HwCommand::IsShutdown, &[])?;
        Ok(if output.code == 0 {
            ShutdownState::ShutDown
        } else {
            ShutdownState::Up
        })
    }
}

impl Drop for BackendSession {
    fn drop(&mut self) {
        let report = self.detach();
        if !report.is_clean() {
            warn!("Releasing session {} failed: {:?}", self.id, report.errors);
        }
    }
}
