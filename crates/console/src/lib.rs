//! dutlink Console Library
//!
//! Screen capture and input injection for devices under test: stream source
//! parsing, the PPM pipe and memsink frame decoders, DV timing negotiation,
//! and the video-stream console built from them.

pub mod capture;
pub mod console;
pub mod input;
pub mod keyboard;
pub mod memsink;
pub mod pixels;
pub mod ppm;
pub mod source;
pub mod timings;
pub mod video_stream;

pub use capture::CaptureProcess;
pub use console::{Console, ConsoleArgs, ConsoleRegistry, VncArgs, VIDEO_STREAM, VNC};
pub use input::{InputChannel, MouseButtons};
pub use keyboard::KeyboardEmulator;
pub use memsink::{MemsinkLayout, ShmRing};
pub use ppm::{parse_ppm_header, PpmHeader, PpmPipeDecoder};
pub use source::{CaptureKind, StreamSource};
pub use timings::{DvTimingsProbe, DvTimingsState};
pub use video_stream::{ConnectArgs, VideoStreamConsole};
