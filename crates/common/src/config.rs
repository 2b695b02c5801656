//! Backend configuration
//!
//! Everything is optional; absent sections fall back to the defaults below.
//! Components receive the section they need at construction time.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Top-level backend configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct BackendConfig {
    /// External command configuration
    pub commands: CommandsConfig,

    /// Video-stream console configuration
    pub video: VideoConfig,

    /// VNC console endpoint
    pub vnc: VncConfig,

    /// Serial capture configuration
    pub serial: SerialConfig,

    /// Hard disk images handed to the flash command
    pub disks: DisksConfig,

    /// Pause between power-off and power-on when restarting
    pub power_cycle_delay_ms: Option<u64>,
}

/// A configured command: executable name plus a fixed argument string
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandSpec {
    /// Executable name, resolved against [`CommandsConfig::dir`]
    pub name: String,

    /// Whitespace separated arguments always passed first
    #[serde(default)]
    pub args: Option<String>,
}

impl CommandSpec {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            args: None,
        }
    }

    pub fn with_args(mut self, args: impl Into<String>) -> Self {
        self.args = Some(args.into());
        self
    }
}

/// Commands driving the device-under-test
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct CommandsConfig {
    /// Directory holding every command executable
    pub dir: Option<PathBuf>,

    pub power_on: Option<CommandSpec>,
    pub power_off: Option<CommandSpec>,
    pub flash: Option<CommandSpec>,
    /// Console/SOL grabber whose output becomes the serial log
    pub serial: Option<CommandSpec>,
    pub is_shutdown: Option<CommandSpec>,
    pub eject: Option<CommandSpec>,
    /// Input-injection helper speaking the line protocol
    pub input: Option<CommandSpec>,
}

/// Video-stream console configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct VideoConfig {
    /// Stream source: `ustreamer:///dev/videoN`, a device path or any ffmpeg URL
    pub url: Option<String>,

    /// EDID payload written to raw capture devices before streaming
    pub edid: Option<String>,

    /// Command prefix (e.g. `ssh host`) prepended to capture and device-control commands
    pub cmd_prefix: Option<String>,

    /// HTTP endpoint of a keyboard emulator; overrides the input pipe for keys and text
    pub keyboard_url: Option<String>,

    /// Transcoder binary
    pub ffmpeg_binary: String,

    /// Raw-frame producer binary
    pub ustreamer_binary: String,

    /// Device-control tool binary
    pub v4l2_ctl_binary: String,

    /// Directory where the producer creates its shared-memory sink
    pub shm_dir: PathBuf,

    /// Poll attempts while waiting for the shared-memory sink to appear
    pub shm_wait_attempts: u32,

    /// Interval between those attempts
    pub shm_poll_interval_ms: u64,

    /// Minimum time between two DV timing queries
    pub timings_check_interval_secs: f64,

    /// Frame-less period after which the pipe path is considered stalled
    pub stall_threshold_secs: f64,

    /// Default frame rate for the transcoder pipe
    pub pipe_fps: u32,

    /// Default frame rate for the shared-memory producer
    pub shm_fps: u32,

    /// Default pixel format requested from the shared-memory producer
    pub shm_format: String,
}

impl Default for VideoConfig {
    fn default() -> Self {
        Self {
            url: None,
            edid: None,
            cmd_prefix: None,
            keyboard_url: None,
            ffmpeg_binary: "ffmpeg".to_string(),
            ustreamer_binary: "ustreamer".to_string(),
            v4l2_ctl_binary: "v4l2-ctl".to_string(),
            shm_dir: PathBuf::from("/dev/shm"),
            shm_wait_attempts: 50,
            shm_poll_interval_ms: 100,
            timings_check_interval_secs: 3.0,
            stall_threshold_secs: 4.0,
            pipe_fps: 4,
            shm_fps: 5,
            shm_format: "UYVY".to_string(),
        }
    }
}

impl VideoConfig {
    pub fn shm_poll_interval(&self) -> Duration {
        Duration::from_millis(self.shm_poll_interval_ms)
    }

    pub fn timings_check_interval(&self) -> Duration {
        Duration::from_secs_f64(self.timings_check_interval_secs.max(0.0))
    }

    pub fn stall_threshold(&self) -> Duration {
        Duration::from_secs_f64(self.stall_threshold_secs.max(0.0))
    }

    /// Split the command prefix into argv words
    pub fn cmd_prefix_words(&self) -> Vec<String> {
        self.cmd_prefix
            .as_deref()
            .map(|p| p.split_whitespace().map(str::to_string).collect())
            .unwrap_or_default()
    }
}

/// VNC endpoint configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct VncConfig {
    pub host: Option<String>,
    pub port: u16,
    pub password: Option<String>,
}

impl Default for VncConfig {
    fn default() -> Self {
        Self {
            host: None,
            port: 5900,
            password: None,
        }
    }
}

/// Serial capture configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SerialConfig {
    /// File receiving the grabbed console output
    pub log_path: PathBuf,

    /// Never start serial capture, even when an endpoint exists
    pub disabled: bool,
}

impl Default for SerialConfig {
    fn default() -> Self {
        Self {
            log_path: PathBuf::from("serial0.txt"),
            disabled: false,
        }
    }
}

/// One hard disk slot
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DiskSpec {
    /// Image to flash into this slot
    pub path: Option<PathBuf>,

    /// Size override in GiB
    pub size_gb: Option<u64>,
}

/// Hard disk configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DisksConfig {
    /// Number of disk slots considered
    pub count: usize,

    /// Size used when a slot has no override
    pub default_size_gb: u64,

    /// Per-slot settings, index 0 is the first disk
    pub images: Vec<DiskSpec>,
}

impl Default for DisksConfig {
    fn default() -> Self {
        Self {
            count: 1,
            default_size_gb: 10,
            images: Vec::new(),
        }
    }
}

impl BackendConfig {
    /// Load configuration from file
    pub fn load(path: &Path) -> crate::Result<Self> {
        if path.exists() {
            let content = std::fs::read_to_string(path)?;
            toml::from_str(&content)
                .map_err(|e| crate::Error::Configuration(format!("{}: {}", path.display(), e)))
        } else {
            Ok(Self::default())
        }
    }

    /// Save configuration to file
    pub fn save(&self, path: &Path) -> crate::Result<()> {
        let content = toml::to_string_pretty(self)
            .map_err(|e| crate::Error::Configuration(e.to_string()))?;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Delay between power-off and power-on during a restart
    pub fn power_cycle_delay(&self) -> Duration {
        Duration::from_millis(self.power_cycle_delay_ms.unwrap_or(3000))
    }

    /// Whether a serial endpoint exists and capture was not disabled
    pub fn wants_serial(&self) -> bool {
        !self.serial.disabled && (self.commands.serial.is_some() || self.vnc.host.is_some())
    }
}
