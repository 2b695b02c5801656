//! Console abstraction and factory
//!
//! A console produces frames and accepts input. Backends look consoles up
//! by type name in a [`ConsoleRegistry`] so alternative implementations
//! (VNC, test doubles) plug in without the backend knowing them.

use crate::input::MouseButtons;
use crate::video_stream::{ConnectArgs, VideoStreamConsole};
use dutlink_common::{Error, Frame, Result, VideoConfig};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::debug;

/// Type name of [`VideoStreamConsole`]
pub const VIDEO_STREAM: &str = "video-stream";
/// Type name of the VNC console
pub const VNC: &str = "vnc-base";

/// Frame source plus input sink driven by the test runner
pub trait Console: Send {
    /// Registered type name
    fn kind(&self) -> &'static str;

    /// Poll for a new frame; `true` when the current frame changed
    fn update_framebuffer(&mut self) -> Result<bool>;

    /// Poll for a new frame, allowing the console to recover a stalled source
    fn request_screen_update(&mut self) -> Result<bool> {
        self.update_framebuffer()
    }

    /// Last decoded frame
    fn current_frame(&self) -> Option<Arc<Frame>>;

    fn send_key(&mut self, key: &str) -> Result<()>;

    fn type_string(&mut self, text: &str) -> Result<()>;

    fn mouse_move(&mut self, x: i32, y: i32) -> Result<()>;

    fn mouse_button(&mut self, buttons: MouseButtons) -> Result<()>;

    /// Detach and release every process the console owns
    fn disable(&mut self) -> Result<()>;
}

/// VNC endpoint handed to a VNC console constructor
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VncArgs {
    pub host: String,
    pub port: u16,
    pub password: Option<String>,
}

/// Construction arguments, one variant per console family
#[derive(Debug, Clone)]
pub enum ConsoleArgs {
    VideoStream {
        config: VideoConfig,
        connect: ConnectArgs,
    },
    Vnc(VncArgs),
}

/// Builds and connects a console
pub type ConsoleConstructor = Box<dyn Fn(ConsoleArgs) -> Result<Box<dyn Console>> + Send + Sync>;

/// Console constructors keyed by type name
pub struct ConsoleRegistry {
    constructors: HashMap<String, ConsoleConstructor>,
}

impl std::fmt::Debug for ConsoleRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut kinds: Vec<_> = self.constructors.keys().collect();
        kinds.sort();
        f.debug_struct("ConsoleRegistry").field("kinds", &kinds).finish()
    }
}

fn video_stream(args: ConsoleArgs) -> Result<Box<dyn Console>> {
    match args {
        ConsoleArgs::VideoStream { config, connect } => {
            let mut console = VideoStreamConsole::new(config);
            console.connect_remote(connect)?;
            Ok(Box::new(console))
        }
        ConsoleArgs::Vnc(_) => Err(Error::Configuration(format!(
            "{} console needs video stream arguments",
            VIDEO_STREAM
        ))),
    }
}

impl ConsoleRegistry {
    /// Empty registry
    pub fn new() -> Self {
        Self {
            constructors: HashMap::new(),
        }
    }

    /// Registry knowing the built-in consoles
    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        registry.register(VIDEO_STREAM, video_stream);
        registry
    }

    /// Register (or replace) the constructor for `kind`
    pub fn register<F>(&mut self, kind: &str, constructor: F)
    where
        F: Fn(ConsoleArgs) -> Result<Box<dyn Console>> + Send + Sync + 'static,
    {
        debug!("Registering console type '{}'", kind);
        self.constructors
            .insert(kind.to_string(), Box::new(constructor));
    }

    pub fn contains(&self, kind: &str) -> bool {
        self.constructors.contains_key(kind)
    }

    /// Build and connect a console of type `kind`
    pub fn create(&self, kind: &str, args: ConsoleArgs) -> Result<Box<dyn Console>> {
        let constructor = self
            .constructors
            .get(kind)
            .ok_or_else(|| Error::UnknownConsole(kind.to_string()))?;
        constructor(args)
    }
}

impl Default for ConsoleRegistry {
    fn default() -> Self {
        Self::with_defaults()
    }
}
