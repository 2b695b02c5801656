//! DV timing negotiation with directly attached capture devices

use dutlink_common::{Error, Result};
use std::process::{Command, Stdio};
use std::time::Instant;
use tracing::{debug, trace};

/// Concise timing values reported while the input has no signal
const NO_SIGNAL_PREFIX: &str = "0x0";
const DV_TIMINGS_LABEL: &str = "DV timings:";

/// Timing state of the attached device
#[derive(Debug, Clone, Default)]
pub struct DvTimingsState {
    /// The device answers timing queries at all
    pub supported: bool,
    /// Current timing string, empty when there is no signal
    pub current: String,
    pub last_checked: Option<Instant>,
}

impl DvTimingsState {
    pub fn has_signal(&self) -> bool {
        !self.current.is_empty()
    }

    /// Whether `interval` has passed since the last query
    pub fn is_due(&self, interval: std::time::Duration) -> bool {
        self.supported
            && self
                .last_checked
                .map_or(true, |checked| checked.elapsed() >= interval)
    }
}

/// Extract the timing value from device-control output.
///
/// Accepts both the verbose `DV timings: <value>` form and the bare concise
/// value. "No signal" values collapse to the empty string.
pub fn parse_dv_timings(output: &str) -> String {
    let value = output
        .lines()
        .find_map(|line| line.trim().strip_prefix(DV_TIMINGS_LABEL))
        .unwrap_or(output)
        .trim();

    if value.starts_with(NO_SIGNAL_PREFIX) {
        String::new()
    } else {
        value.to_string()
    }
}

/// Runs the device-control tool against one device
#[derive(Debug, Clone)]
pub struct DvTimingsProbe {
    binary: String,
    prefix: Vec<String>,
    device: String,
}

impl DvTimingsProbe {
    pub fn new(binary: impl Into<String>, prefix: Vec<String>, device: impl Into<String>) -> Self {
        Self {
            binary: binary.into(),
            prefix,
            device: device.into(),
        }
    }

    pub fn device(&self) -> &str {
        &self.device
    }

    fn command(&self, args: &[&str]) -> Command {
        let mut argv: Vec<String> = self.prefix.clone();
        argv.push(self.binary.clone());
        argv.extend(["--device".to_string(), self.device.clone(), "--concise".to_string()]);
        argv.extend(args.iter().map(|a| a.to_string()));

        let mut cmd = Command::new(&argv[0]);
        cmd.args(&argv[1..])
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        cmd
    }

    fn render(&self, args: &[&str]) -> String {
        let mut words = self.prefix.clone();
        words.push(self.binary.clone());
        words.extend(["--device".to_string(), self.device.clone()]);
        words.extend(args.iter().map(|a| a.to_string()));
        words.join(" ")
    }

    /// Run the tool; `None` when it is missing or exits non-zero
    fn run(&self, args: &[&str]) -> Option<String> {
        debug!("Running {}", self.render(args));
        let output = match self.command(args).output() {
            Ok(output) => output,
            Err(e) => {
                debug!("{} unavailable: {}", self.binary, e);
                return None;
            }
        };
        let stdout = String::from_utf8_lossy(&output.stdout).trim_end().to_string();
        trace!("{} returned {}: {}", self.binary, output.status, stdout);
        output.status.success().then_some(stdout)
    }

    /// Load an EDID into the device. Failure is fatal to the connect attempt.
    pub fn set_edid(&self, edid: &str) -> Result<()> {
        let arg = format!("--set-edid={}", edid);
        let mut cmd = self.command(&[&arg]);
        cmd.stdout(Stdio::null());
        let output = cmd
            .output()
            .map_err(|e| Error::execution(self.render(&[&arg]), e))?;
        if !output.status.success() {
            return Err(Error::execution(
                self.render(&[&arg]),
                format!(
                    "{}: {}",
                    output.status,
                    String::from_utf8_lossy(&output.stderr).trim()
                ),
            ));
        }
        Ok(())
    }

    /// Query the current DV timings.
    ///
    /// `None` means timing detection is unsupported. `Some("")` means the
    /// device is not receiving a signal. When a signal is present the
    /// detected timings are also applied to the device.
    pub fn query(&self) -> Option<String> {
        let output = self.run(&["--query-dv-timings"])?;
        let timings = parse_dv_timings(&output);
        if !timings.is_empty() && self.run(&["--set-dv-bt-timings", "query"]).is_none() {
            debug!("{}: applying detected timings failed", self.device);
        }
        Some(timings)
    }
}
