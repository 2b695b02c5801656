//! Video-stream console
//!
//! Attaches to a capture producer (transcoder pipe or memsink producer),
//! keeps the latest decoded frame, watches DV timings of directly attached
//! devices and reconnects on signal changes or a stalled pipe. Input goes
//! to an emulator process, or to an HTTP keyboard emulator for keys and
//! text when one is configured.

use crate::capture::CaptureProcess;
use crate::console::{Console, VIDEO_STREAM};
use crate::input::{InputChannel, MouseButtons};
use crate::keyboard::KeyboardEmulator;
use crate::source::StreamSource;
use crate::timings::{DvTimingsProbe, DvTimingsState};
use dutlink_common::{Error, Frame, ResolvedCommand, Result, VideoConfig};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, warn};

/// Screen size assumed by `mouse_hide` before the first frame
const FALLBACK_SCREEN: (u32, u32) = (1024, 768);

/// Parameters of one connect request
#[derive(Debug, Clone, Default)]
pub struct ConnectArgs {
    pub url: String,
    /// EDID loaded into a raw capture device before streaming
    pub edid: Option<String>,
    /// Overrides the configured command prefix
    pub cmd_prefix: Option<String>,
    /// Input emulator to spawn
    pub input_cmd: Option<ResolvedCommand>,
}

impl ConnectArgs {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            ..Default::default()
        }
    }

    /// Connect arguments taken from the video configuration
    pub fn from_config(config: &VideoConfig, input_cmd: Option<ResolvedCommand>) -> Result<Self> {
        let url = config
            .url
            .clone()
            .ok_or_else(|| Error::Configuration("video.url is not set".to_string()))?;
        Ok(Self {
            url,
            edid: config.edid.clone(),
            cmd_prefix: None,
            input_cmd,
        })
    }
}

/// Console backed by an external video stream
#[derive(Debug)]
pub struct VideoStreamConsole {
    config: VideoConfig,
    source: Option<StreamSource>,
    probe: Option<DvTimingsProbe>,
    capture: Option<CaptureProcess>,
    input: Option<InputChannel>,
    keyboard: Option<KeyboardEmulator>,
    timings: DvTimingsState,
    frame: Option<Arc<Frame>>,
    last_update: Instant,
    reconnects: u32,
    /// A reconnect failed to bring the producer back
    restart_pending: bool,
}

impl VideoStreamConsole {
    pub fn new(config: VideoConfig) -> Self {
        Self {
            config,
            source: None,
            probe: None,
            capture: None,
            input: None,
            keyboard: None,
            timings: DvTimingsState::default(),
            frame: None,
            last_update: Instant::now(),
            reconnects: 0,
            restart_pending: false,
        }
    }

    /// Attach to `args.url`.
    ///
    /// Loads the EDID, negotiates DV timings, starts the capture producer,
    /// and spawns the input emulator, in that order. Any previous
    /// connection is torn down first.
    pub fn connect_remote(&mut self, args: ConnectArgs) -> Result<()> {
        self.disable()?;

        let source = StreamSource::parse(&args.url)?;
        if let Some(prefix) = args.cmd_prefix {
            self.config.cmd_prefix = Some(prefix);
        }

        self.probe = source.device_path().map(|device| {
            DvTimingsProbe::new(
                self.config.v4l2_ctl_binary.clone(),
                self.config.cmd_prefix_words(),
                device,
            )
        });

        if let (Some(probe), Some(edid)) = (&self.probe, &args.edid) {
            info!("Loading EDID into {}", probe.device());
            probe.set_edid(edid)?;
        }

        self.source = Some(source);
        self.start_capture(false)?;

        if let Some(cmd) = &args.input_cmd {
            self.input = Some(InputChannel::spawn(cmd)?);
        }
        if let Some(url) = &self.config.keyboard_url {
            self.keyboard = Some(KeyboardEmulator::new(url.clone())?);
        }
        Ok(())
    }

    /// Query the device for the timings a new producer will run with.
    ///
    /// Whether the device supports timing queries is decided on connect; a
    /// query failing during a reconnect only means no signal.
    fn negotiate_timings(&self, reconnecting: bool) -> DvTimingsState {
        let result = self.probe.as_ref().and_then(DvTimingsProbe::query);
        let state = DvTimingsState {
            supported: if reconnecting {
                self.timings.supported
            } else {
                result.is_some()
            },
            current: result.unwrap_or_default(),
            last_checked: Some(Instant::now()),
        };

        if let Some(probe) = &self.probe {
            match (state.supported, state.has_signal()) {
                (false, _) => debug!("{}: DV timings not supported", probe.device()),
                (true, false) => warn!("{}: no signal", probe.device()),
                (true, true) => info!("{}: DV timings {}", probe.device(), state.current),
            }
        }
        state
    }

    /// Start the producer; timing state is only updated once it runs
    fn start_capture(&mut self, reconnecting: bool) -> Result<()> {
        let source = self
            .source
            .as_ref()
            .ok_or_else(|| Error::Console("video stream is not connected".to_string()))?;
        let timings = self.negotiate_timings(reconnecting);
        self.capture = Some(CaptureProcess::start(source, &self.config)?);
        self.timings = timings;
        self.last_update = Instant::now();
        Ok(())
    }

    fn stop_capture(&mut self) -> Result<()> {
        match self.capture.take() {
            Some(capture) => capture.stop(),
            None => Ok(()),
        }
    }

    /// Stop and restart the capture producer, renegotiating timings
    ///
    /// When the producer cannot be restarted the error is returned and the
    /// restart is retried by the next [`Self::request_screen_update`] once the
    /// stall threshold has passed.
    pub fn reconnect(&mut self) -> Result<()> {
        self.stop_capture()?;
        if let Err(e) = self.start_capture(true) {
            self.restart_pending = true;
            return Err(e);
        }
        self.restart_pending = false;
        self.reconnects += 1;
        info!(
            "Video stream reconnected ({} reconnects so far)",
            self.reconnects
        );
        Ok(())
    }

    fn check_timings(&mut self) -> Result<()> {
        if !self.timings.is_due(self.config.timings_check_interval()) {
            return Ok(());
        }
        let Some(probe) = &self.probe else {
            return Ok(());
        };

        let timings = probe.query().unwrap_or_default();
        self.timings.last_checked = Some(Instant::now());
        if timings == self.timings.current {
            return Ok(());
        }

        if timings.is_empty() {
            warn!("{}: lost signal, stopping capture", probe.device());
            self.restart_pending = false;
            self.stop_capture()?;
            self.timings.current.clear();
            Ok(())
        } else {
            info!(
                "{}: DV timings changed '{}' -> '{}'",
                probe.device(),
                self.timings.current,
                timings
            );
            self.reconnect()
        }
    }

    /// Poll the producer once.
    ///
    /// Returns `true` when a new frame replaced the current one.
    pub fn update_framebuffer(&mut self) -> Result<bool> {
        self.check_timings()?;

        let Some(capture) = self.capture.as_mut() else {
            return Ok(false);
        };
        match capture.receive()? {
            Some(frame) => {
                self.frame = Some(Arc::new(frame));
                self.last_update = Instant::now();
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Like [`Self::update_framebuffer`], but reconnects a pipe producer that
    /// has been silent for longer than the stall threshold
    pub fn request_screen_update(&mut self) -> Result<bool> {
        if self.update_framebuffer()? {
            return Ok(true);
        }

        let watched =
            self.restart_pending || self.capture.as_ref().is_some_and(CaptureProcess::is_pipe);
        let stalled = watched && self.last_update.elapsed() > self.config.stall_threshold();
        if stalled {
            warn!(
                "No frame for {:.1}s, restarting the video stream",
                self.last_update.elapsed().as_secs_f64()
            );
            self.reconnect()?;
        }
        Ok(false)
    }

    /// Stop the capture producer and the input emulator. Idempotent.
    pub fn disable(&mut self) -> Result<()> {
        let capture = self.stop_capture();
        let input = match self.input.take() {
            Some(channel) => channel.close(),
            None => Ok(()),
        };
        self.keyboard = None;
        self.restart_pending = false;
        capture.and(input)
    }

    pub fn current_frame(&self) -> Option<Arc<Frame>> {
        self.frame.clone()
    }

    pub fn screen_size(&self) -> Option<(u32, u32)> {
        self.frame.as_ref().map(|f| (f.width(), f.height()))
    }

    pub fn timings(&self) -> &DvTimingsState {
        &self.timings
    }

    pub fn reconnect_count(&self) -> u32 {
        self.reconnects
    }

    pub fn is_connected(&self) -> bool {
        self.capture.is_some()
    }

    pub fn capture_pid(&self) -> Option<u32> {
        self.capture.as_ref().map(CaptureProcess::pid)
    }

    pub fn source(&self) -> Option<&StreamSource> {
        self.source.as_ref()
    }

    fn input_mut(&mut self) -> Result<&mut InputChannel> {
        self.input
            .as_mut()
            .ok_or_else(|| Error::Console("no input channel connected".to_string()))
    }

    pub fn send_key(&mut self, key: &str) -> Result<()> {
        match &self.keyboard {
            Some(keyboard) => keyboard.send_key(key),
            None => self.input_mut()?.send_key(key),
        }
    }

    pub fn type_string(&mut self, text: &str) -> Result<()> {
        match &self.keyboard {
            Some(keyboard) => keyboard.type_string(text),
            None => self.input_mut()?.type_string(text),
        }
    }

    pub fn mouse_move(&mut self, x: i32, y: i32) -> Result<()> {
        self.input_mut()?.mouse_move(x, y)
    }

    pub fn mouse_button(&mut self, buttons: MouseButtons) -> Result<()> {
        self.input_mut()?.mouse_button(buttons)
    }

    /// Park the pointer in the bottom-right corner of the screen
    pub fn mouse_hide(&mut self) -> Result<()> {
        let (width, height) = self.screen_size().unwrap_or(FALLBACK_SCREEN);
        self.mouse_move(width as i32 - 1, height as i32 - 1)
    }

    pub fn mouse_position(&self) -> Option<(i32, i32)> {
        self.input.as_ref().map(InputChannel::mouse_position)
    }
}

impl Drop for VideoStreamConsole {
    fn drop(&mut self) {
        if let Err(e) = self.disable() {
            warn!("Failed to disable video stream console: {}", e);
        }
    }
}

impl Console for VideoStreamConsole {
    fn kind(&self) -> &'static str {
        VIDEO_STREAM
    }

    fn update_framebuffer(&mut self) -> Result<bool> {
        VideoStreamConsole::update_framebuffer(self)
    }

    fn request_screen_update(&mut self) -> Result<bool> {
        VideoStreamConsole::request_screen_update(self)
    }

    fn current_frame(&self) -> Option<Arc<Frame>> {
        VideoStreamConsole::current_frame(self)
    }

    fn send_key(&mut self, key: &str) -> Result<()> {
        VideoStreamConsole::send_key(self, key)
    }

    fn type_string(&mut self, text: &str) -> Result<()> {
        VideoStreamConsole::type_string(self, text)
    }

    fn mouse_move(&mut self, x: i32, y: i32) -> Result<()> {
        VideoStreamConsole::mouse_move(self, x, y)
    }

    fn mouse_button(&mut self, buttons: MouseButtons) -> Result<()> {
        VideoStreamConsole::mouse_button(self, buttons)
    }

    fn disable(&mut self) -> Result<()> {
        VideoStreamConsole::disable(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memsink::tests::{rgb_meta, sink};
    use std::os::unix::fs::PermissionsExt;
    use std::path::{Path, PathBuf};
    use std::time::Duration;
    use tempfile::TempDir;

    const ONE_FRAME: &str = "printf 'P6\\n2 2\\n255\\n'; head -c 12 /dev/zero";

    fn script(dir: &Path, name: &str, body: &str) -> String {
        let path = dir.join(name);
        std::fs::write(&path, format!("#!/bin/sh\n{}\n", body)).unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
        path.display().to_string()
    }

    /// Transcoder that records each start in `spawns`, then runs `body`
    fn fake_ffmpeg(dir: &Path, body: &str) -> String {
        let log = dir.join("spawns");
        script(dir, "ffmpeg", &format!("echo start >> {}\n{}", log.display(), body))
    }

    /// Device-control tool reporting whatever `timings` holds
    fn fake_v4l2(dir: &Path) -> (String, PathBuf) {
        let timings = dir.join("timings");
        let tool = script(
            dir,
            "v4l2-ctl",
            &format!(
                "case \"$*\" in *query-dv-timings*) cat {} ;; *set-edid*) exit 1 ;; esac",
                timings.display()
            ),
        );
        (tool, timings)
    }

    fn spawns(dir: &Path) -> usize {
        std::fs::read_to_string(dir.join("spawns"))
            .map(|s| s.lines().count())
            .unwrap_or(0)
    }

    fn wait_for_spawns(dir: &Path, expected: usize) {
        for _ in 0..100 {
            if spawns(dir) >= expected {
                break;
            }
            std::thread::sleep(Duration::from_millis(20));
        }
        assert_eq!(spawns(dir), expected);
    }

    fn wait_for_frame(console: &mut VideoStreamConsole) {
        for _ in 0..100 {
            if console.update_framebuffer().unwrap() {
                return;
            }
            std::thread::sleep(Duration::from_millis(20));
        }
        panic!("no frame received");
    }

    #[test]
    fn test_network_stream_has_no_timings() {
        let tmp = TempDir::new().unwrap();
        let (v4l2, timings) = fake_v4l2(tmp.path());
        std::fs::write(&timings, "1920x1080p60").unwrap();
        let config = VideoConfig {
            ffmpeg_binary: fake_ffmpeg(tmp.path(), "exec sleep 30"),
            v4l2_ctl_binary: v4l2,
            ..Default::default()
        };
        let mut console = VideoStreamConsole::new(config);
        console
            .connect_remote(ConnectArgs::new("http://cam/stream"))
            .unwrap();
        assert!(console.is_connected());
        assert!(!console.timings().supported);
        console.disable().unwrap();
        assert!(!console.is_connected());
        console.disable().unwrap();
    }

    #[test]
    fn test_frames_replace_current_frame() {
        let tmp = TempDir::new().unwrap();
        let config = VideoConfig {
            ffmpeg_binary: fake_ffmpeg(
                tmp.path(),
                &format!("while true; do {}; sleep 0.05; done", ONE_FRAME),
            ),
            ..Default::default()
        };
        let mut console = VideoStreamConsole::new(config);
        assert!(console.current_frame().is_none());
        console
            .connect_remote(ConnectArgs::new("http://cam/stream"))
            .unwrap();

        wait_for_frame(&mut console);
        let first = console.current_frame().unwrap();
        assert_eq!(console.screen_size(), Some((2, 2)));

        wait_for_frame(&mut console);
        let second = console.current_frame().unwrap();
        assert!(!Arc::ptr_eq(&first, &second));
    }

    #[test]
    fn test_stalled_pipe_reconnects_once() {
        let tmp = TempDir::new().unwrap();
        let config = VideoConfig {
            ffmpeg_binary: fake_ffmpeg(tmp.path(), &format!("{}\nexec sleep 30", ONE_FRAME)),
            stall_threshold_secs: 0.2,
            ..Default::default()
        };
        let mut console = VideoStreamConsole::new(config);
        console
            .connect_remote(ConnectArgs::new("http://cam/stream"))
            .unwrap();
        wait_for_frame(&mut console);
        let first_pid = console.capture_pid();

        std::thread::sleep(Duration::from_millis(300));
        assert!(!console.request_screen_update().unwrap());
        assert_eq!(console.reconnect_count(), 1);
        assert_ne!(console.capture_pid(), first_pid);
        wait_for_spawns(tmp.path(), 2);

        wait_for_frame(&mut console);
        assert_eq!(console.reconnect_count(), 1);
    }

    #[test]
    fn test_shm_stream_is_exempt_from_stall_reconnect() {
        let tmp = TempDir::new().unwrap();
        let fixture = tmp.path().join("fixture.raw");
        std::fs::write(&fixture, sink(4, 1, rgb_meta(1, 1), &[1, 2, 3])).unwrap();
        let sink_path = tmp.path().join("raw-sink_dev_video0.raw");
        let config = VideoConfig {
            ustreamer_binary: script(
                tmp.path(),
                "ustreamer",
                &format!(
                    "cp {} {}\nexec sleep 30",
                    fixture.display(),
                    sink_path.display()
                ),
            ),
            v4l2_ctl_binary: "/nonexistent/v4l2-ctl".to_string(),
            shm_dir: tmp.path().to_path_buf(),
            shm_poll_interval_ms: 20,
            stall_threshold_secs: 0.0,
            ..Default::default()
        };
        let mut console = VideoStreamConsole::new(config);
        console
            .connect_remote(ConnectArgs::new("ustreamer:///dev/video0"))
            .unwrap();
        assert!(!console.timings().supported);

        wait_for_frame(&mut console);
        std::thread::sleep(Duration::from_millis(20));
        for _ in 0..3 {
            assert!(!console.request_screen_update().unwrap());
        }
        assert_eq!(console.reconnect_count(), 0);
    }

    #[test]
    fn test_timing_changes_drive_reconnects() {
        let tmp = TempDir::new().unwrap();
        let (v4l2, timings) = fake_v4l2(tmp.path());
        std::fs::write(&timings, "1920x1080p60").unwrap();
        let config = VideoConfig {
            ffmpeg_binary: fake_ffmpeg(tmp.path(), "exec sleep 30"),
            v4l2_ctl_binary: v4l2,
            timings_check_interval_secs: 0.0,
            ..Default::default()
        };
        let mut console = VideoStreamConsole::new(config);
        console
            .connect_remote(ConnectArgs::new("/dev/video0"))
            .unwrap();
        assert!(console.timings().supported);
        assert_eq!(console.timings().current, "1920x1080p60");
        wait_for_spawns(tmp.path(), 1);

        // unchanged timings keep the stream
        console.update_framebuffer().unwrap();
        assert_eq!(console.reconnect_count(), 0);

        std::fs::write(&timings, "1280x720p60").unwrap();
        console.update_framebuffer().unwrap();
        assert_eq!(console.reconnect_count(), 1);
        assert_eq!(console.timings().current, "1280x720p60");
        wait_for_spawns(tmp.path(), 2);

        // signal loss stops capture exactly once
        std::fs::write(&timings, "0x0p0").unwrap();
        console.update_framebuffer().unwrap();
        assert!(!console.is_connected());
        assert!(console.timings().current.is_empty());
        console.update_framebuffer().unwrap();
        assert!(!console.is_connected());
        assert_eq!(console.reconnect_count(), 1);
        assert_eq!(spawns(tmp.path()), 2);

        std::fs::write(&timings, "1920x1080p60").unwrap();
        console.update_framebuffer().unwrap();
        assert!(console.is_connected());
        assert_eq!(console.reconnect_count(), 2);
        wait_for_spawns(tmp.path(), 3);
    }

    #[test]
    fn test_failed_restart_keeps_timings_until_retry() {
        let tmp = TempDir::new().unwrap();
        let (v4l2, timings) = fake_v4l2(tmp.path());
        std::fs::write(&timings, "1920x1080p60").unwrap();
        let ffmpeg = fake_ffmpeg(tmp.path(), "exec sleep 30");
        let config = VideoConfig {
            ffmpeg_binary: ffmpeg.clone(),
            v4l2_ctl_binary: v4l2,
            timings_check_interval_secs: 0.0,
            ..Default::default()
        };
        let mut console = VideoStreamConsole::new(config);
        console
            .connect_remote(ConnectArgs::new("/dev/video0"))
            .unwrap();
        wait_for_spawns(tmp.path(), 1);

        console.config.ffmpeg_binary = tmp.path().join("missing").display().to_string();
        std::fs::write(&timings, "1280x720p60").unwrap();
        assert!(console.update_framebuffer().is_err());
        assert!(!console.is_connected());
        assert_eq!(console.timings().current, "1920x1080p60");
        assert_eq!(console.reconnect_count(), 0);

        console.config.ffmpeg_binary = ffmpeg;
        console.update_framebuffer().unwrap();
        assert!(console.is_connected());
        assert_eq!(console.timings().current, "1280x720p60");
        assert_eq!(console.reconnect_count(), 1);
        wait_for_spawns(tmp.path(), 2);
    }

    #[test]
    fn test_failed_query_on_reconnect_keeps_timing_checks() {
        let tmp = TempDir::new().unwrap();
        let (v4l2, timings) = fake_v4l2(tmp.path());
        std::fs::write(&timings, "1920x1080p60").unwrap();
        let config = VideoConfig {
            ffmpeg_binary: fake_ffmpeg(tmp.path(), "exec sleep 30"),
            v4l2_ctl_binary: v4l2,
            timings_check_interval_secs: 0.0,
            ..Default::default()
        };
        let mut console = VideoStreamConsole::new(config);
        console
            .connect_remote(ConnectArgs::new("/dev/video0"))
            .unwrap();

        std::fs::remove_file(&timings).unwrap();
        console.reconnect().unwrap();
        assert!(console.timings().supported);
        assert!(!console.timings().has_signal());

        std::fs::write(&timings, "1920x1080p60").unwrap();
        console.update_framebuffer().unwrap();
        assert_eq!(console.reconnect_count(), 2);
        assert_eq!(console.timings().current, "1920x1080p60");
        wait_for_spawns(tmp.path(), 3);
    }

    #[test]
    fn test_failed_stall_restart_is_retried() {
        let tmp = TempDir::new().unwrap();
        let ffmpeg = fake_ffmpeg(tmp.path(), &format!("{}\nexec sleep 30", ONE_FRAME));
        let config = VideoConfig {
            ffmpeg_binary: ffmpeg.clone(),
            stall_threshold_secs: 0.2,
            ..Default::default()
        };
        let mut console = VideoStreamConsole::new(config);
        console
            .connect_remote(ConnectArgs::new("http://cam/stream"))
            .unwrap();
        wait_for_frame(&mut console);

        std::thread::sleep(Duration::from_millis(300));
        console.config.ffmpeg_binary = tmp.path().join("missing").display().to_string();
        assert!(console.request_screen_update().is_err());
        assert!(!console.is_connected());

        console.config.ffmpeg_binary = ffmpeg;
        assert!(!console.request_screen_update().unwrap());
        assert!(console.is_connected());
        assert_eq!(console.reconnect_count(), 1);
        wait_for_spawns(tmp.path(), 2);
    }

    #[test]
    fn test_edid_failure_aborts_connect() {
        let tmp = TempDir::new().unwrap();
        let (v4l2, _) = fake_v4l2(tmp.path());
        let config = VideoConfig {
            ffmpeg_binary: fake_ffmpeg(tmp.path(), "exec sleep 30"),
            v4l2_ctl_binary: v4l2,
            ..Default::default()
        };
        let mut console = VideoStreamConsole::new(config);
        let args = ConnectArgs {
            edid: Some("type=hdmi".to_string()),
            ..ConnectArgs::new("/dev/video0")
        };
        let err = console.connect_remote(args).unwrap_err();
        assert!(matches!(err, Error::Execution { .. }));
        assert!(!console.is_connected());
        std::thread::sleep(Duration::from_millis(50));
        assert_eq!(spawns(tmp.path()), 0);
    }

    #[test]
    fn test_input_through_console() {
        let tmp = TempDir::new().unwrap();
        let input = script(
            tmp.path(),
            "input.sh",
            "while read -r line; do echo ok; done",
        );
        let config = VideoConfig {
            ffmpeg_binary: fake_ffmpeg(tmp.path(), "exec sleep 30"),
            ..Default::default()
        };
        let mut console = VideoStreamConsole::new(config);
        assert!(matches!(console.send_key("ret"), Err(Error::Console(_))));

        let args = ConnectArgs {
            input_cmd: Some(ResolvedCommand::new(input, vec![])),
            ..ConnectArgs::new("http://cam/stream")
        };
        console.connect_remote(args).unwrap();
        assert_eq!(console.mouse_position(), Some((-1, -1)));

        console.send_key("ret").unwrap();
        console.mouse_hide().unwrap();
        assert_eq!(console.mouse_position(), Some((1023, 767)));

        console.disable().unwrap();
        assert_eq!(console.mouse_position(), None);
    }

    #[test]
    fn test_missing_url_in_config() {
        let err = ConnectArgs::from_config(&VideoConfig::default(), None).unwrap_err();
        assert!(err.is_configuration());
    }
}
