//! Capture producer processes
//!
//! Exactly one producer feeds a console at a time. Each variant owns the
//! handles its decoder needs; [`CaptureProcess::stop`] tears both down.

use crate::memsink::ShmRing;
use crate::ppm::PpmPipeDecoder;
use crate::source::{CaptureKind, StreamSource};
use dutlink_common::{Error, Frame, ProcessHandle, Result, VideoConfig};
use std::process::{ChildStdout, Command, Stdio};
use tracing::{debug, info, warn};

/// Pipe capacity requested for the transcoder: one 1080p RGB frame plus header
#[cfg(target_os = "linux")]
const PIPE_CAPACITY: i32 = 1920 * 1080 * 3 + crate::ppm::HEADER_WINDOW as i32;

/// A running capture producer
pub enum CaptureProcess {
    /// Transcoder writing PPM frames to its stdout
    FfmpegPipe {
        process: ProcessHandle,
        decoder: PpmPipeDecoder<ChildStdout>,
    },
    /// Raw-frame producer publishing into a memsink
    UstreamerShm {
        process: ProcessHandle,
        ring: ShmRing,
    },
}

impl std::fmt::Debug for CaptureProcess {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CaptureProcess::FfmpegPipe { process, .. } => f
                .debug_struct("FfmpegPipe")
                .field("pid", &process.pid())
                .finish(),
            CaptureProcess::UstreamerShm { process, ring } => f
                .debug_struct("UstreamerShm")
                .field("pid", &process.pid())
                .field("sink", &ring.path())
                .field("last_frame_id", &ring.last_frame_id())
                .finish(),
        }
    }
}

fn prefixed_command(prefix: &[String], binary: &str, args: Vec<String>) -> (Command, String) {
    let mut argv: Vec<String> = prefix.to_vec();
    argv.push(binary.to_string());
    argv.extend(args);
    let rendered = argv.join(" ");

    let mut cmd = Command::new(&argv[0]);
    cmd.args(&argv[1..]);
    (cmd, rendered)
}

/// Transcoder arguments emitting PPM frames at `fps` on stdout
pub fn ffmpeg_args(source: &StreamSource, fps: u32) -> Vec<String> {
    [
        "-loglevel",
        "fatal",
        "-i",
        source.target.as_str(),
        "-vcodec",
        "ppm",
        "-f",
        "rawvideo",
        "-r",
    ]
    .iter()
    .map(|s| s.to_string())
    .chain([fps.to_string(), "-".to_string()])
    .collect()
}

/// Producer arguments publishing raw frames into the memsink for `source`
pub fn ustreamer_args(source: &StreamSource, config: &VideoConfig) -> Vec<String> {
    let format = source.format.as_deref().unwrap_or(&config.shm_format);
    let fps = source.fps.unwrap_or(config.shm_fps);
    let mut args: Vec<String> = vec![
        "--device".into(),
        source.target.clone(),
        "--format".into(),
        format.to_string(),
        "--desired-fps".into(),
        fps.to_string(),
        "--raw-sink".into(),
        source.sink_name(),
        "--raw-sink-rm".into(),
        "--dv-timings".into(),
    ];
    if source.swap_rgb {
        args.push("--format-swap-rgb".into());
    }
    args
}

#[cfg(target_os = "linux")]
fn grow_pipe(stdout: &ChildStdout) {
    use nix::fcntl::{fcntl, FcntlArg};
    use std::os::fd::AsRawFd;

    if let Err(e) = fcntl(stdout.as_raw_fd(), FcntlArg::F_SETPIPE_SZ(PIPE_CAPACITY)) {
        debug!("Could not grow capture pipe to {} bytes: {}", PIPE_CAPACITY, e);
    }
}

#[cfg(not(target_os = "linux"))]
fn grow_pipe(_stdout: &ChildStdout) {}

impl CaptureProcess {
    /// Start the producer selected by `source`
    pub fn start(source: &StreamSource, config: &VideoConfig) -> Result<Self> {
        match source.kind {
            CaptureKind::Ffmpeg => Self::start_pipe(source, config),
            CaptureKind::Ustreamer => Self::start_shm(source, config),
        }
    }

    fn start_pipe(source: &StreamSource, config: &VideoConfig) -> Result<Self> {
        let fps = source.fps.unwrap_or(config.pipe_fps);
        let (mut cmd, rendered) = prefixed_command(
            &config.cmd_prefix_words(),
            &config.ffmpeg_binary,
            ffmpeg_args(source, fps),
        );
        cmd.stdin(Stdio::null()).stdout(Stdio::piped());

        info!("Starting video stream: {}", rendered);
        let mut process = ProcessHandle::spawn(rendered.clone(), cmd)?;
        let stdout = process
            .take_stdout()
            .ok_or_else(|| Error::execution(rendered, "stdout not captured"))?;
        grow_pipe(&stdout);

        let decoder = PpmPipeDecoder::new(stdout, source.target.clone())?;
        Ok(CaptureProcess::FfmpegPipe { process, decoder })
    }

    fn start_shm(source: &StreamSource, config: &VideoConfig) -> Result<Self> {
        let (mut cmd, rendered) = prefixed_command(
            &config.cmd_prefix_words(),
            &config.ustreamer_binary,
            ustreamer_args(source, config),
        );
        cmd.stdin(Stdio::null()).stdout(Stdio::null());

        info!("Starting video stream: {}", rendered);
        let mut process = ProcessHandle::spawn(rendered.clone(), cmd)?;

        let sink = config.shm_dir.join(source.sink_name());
        for attempt in 0..config.shm_wait_attempts {
            if sink.exists() {
                debug!("{} appeared after {} polls", sink.display(), attempt);
                let ring = ShmRing::open(&sink)?;
                return Ok(CaptureProcess::UstreamerShm { process, ring });
            }
            if let Some(status) = process.try_wait()? {
                return Err(Error::execution(
                    rendered,
                    format!("exited before creating {}: {}", sink.display(), status),
                ));
            }
            std::thread::sleep(config.shm_poll_interval());
        }

        if let Err(e) = process.terminate() {
            warn!("Failed to stop {}: {}", rendered, e);
        }
        Err(Error::Timeout {
            what: sink.display().to_string(),
            attempts: config.shm_wait_attempts,
        })
    }

    pub fn pid(&self) -> u32 {
        match self {
            CaptureProcess::FfmpegPipe { process, .. } => process.pid(),
            CaptureProcess::UstreamerShm { process, .. } => process.pid(),
        }
    }

    pub fn is_pipe(&self) -> bool {
        matches!(self, CaptureProcess::FfmpegPipe { .. })
    }

    /// Latest frame the producer delivered since the previous call.
    ///
    /// The pipe is drained because several frames can queue up in it; the
    /// memsink only ever holds the newest frame.
    pub fn receive(&mut self) -> Result<Option<Frame>> {
        match self {
            CaptureProcess::FfmpegPipe { decoder, .. } => {
                let mut latest = None;
                while let Some(frame) = decoder.receive_frame()? {
                    latest = Some(frame);
                }
                Ok(latest)
            }
            CaptureProcess::UstreamerShm { ring, .. } => ring.poll(),
        }
    }

    /// Stop the producer and release its pipe or mapping
    pub fn stop(self) -> Result<()> {
        match self {
            CaptureProcess::FfmpegPipe {
                mut process,
                decoder,
            } => {
                let status = process.terminate()?;
                drop(decoder);
                debug!("Transcoder {} stopped: {}", process.pid(), status);
            }
            CaptureProcess::UstreamerShm { mut process, ring } => {
                let status = process.terminate()?;
                drop(ring);
                debug!("Producer {} stopped: {}", process.pid(), status);
            }
        }
        Ok(())
    }
}
