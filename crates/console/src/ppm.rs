//! PPM frames read from a transcoder pipe
//!
//! Each frame is `P6\n<width> <height>\n<maxval>\n` followed by raw RGB
//! samples. The header window is read non-blocking so an idle pipe costs
//! nothing; the remainder of a frame is then read blocking.

use dutlink_common::{Error, Frame, PixelFormat, Result};
use image::ImageFormat;
use nix::fcntl::{fcntl, FcntlArg, OFlag};
use once_cell::sync::Lazy;
use regex::bytes::Regex;
use std::io::{ErrorKind, Read};
use std::os::fd::{AsRawFd, RawFd};
use tracing::{debug, trace};

/// Bytes read to recognise a frame header
pub const HEADER_WINDOW: usize = 20;

/// Largest width or height accepted from a frame header
pub const MAX_DIMENSION: u32 = 16384;

static HEADER_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^P6\n(\d+) (\d+)\n(\d+)\n").expect("static PPM header pattern"));

/// Parsed PPM header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PpmHeader {
    pub width: u32,
    pub height: u32,
    pub maxval: u32,
    /// Length of the ASCII header in bytes
    pub header_len: usize,
}

impl PpmHeader {
    /// 1 for 8-bit samples, 2 for 16-bit samples
    pub fn bytes_per_sample(&self) -> usize {
        if self.maxval < 256 {
            1
        } else {
            2
        }
    }

    /// Header plus payload length, `None` if it does not fit in memory
    pub fn frame_len(&self) -> Option<usize> {
        (self.width as usize)
            .checked_mul(self.height as usize)?
            .checked_mul(3 * self.bytes_per_sample())?
            .checked_add(self.header_len)
    }
}

/// Parse the header at the start of `buf`
pub fn parse_ppm_header(buf: &[u8]) -> Result<PpmHeader> {
    let caps = HEADER_RE.captures(buf).ok_or_else(|| {
        Error::Protocol(format!(
            "unexpected PPM header: {:?}",
            String::from_utf8_lossy(buf)
        ))
    })?;

    let number = |idx: usize| -> Result<u32> {
        std::str::from_utf8(&caps[idx])
            .ok()
            .and_then(|s| s.parse().ok())
            .ok_or_else(|| Error::Protocol("PPM header value out of range".to_string()))
    };

    let header = PpmHeader {
        width: number(1)?,
        height: number(2)?,
        maxval: number(3)?,
        header_len: caps[0].len(),
    };
    let dimensions = 1..=MAX_DIMENSION;
    if !dimensions.contains(&header.width) || !dimensions.contains(&header.height) {
        return Err(Error::Protocol(format!(
            "PPM frame size {}x{} outside 1..={}",
            header.width, header.height, MAX_DIMENSION
        )));
    }
    Ok(header)
}

pub(crate) fn set_nonblocking(fd: RawFd, nonblocking: bool) -> Result<()> {
    let flags = OFlag::from_bits_truncate(fcntl(fd, FcntlArg::F_GETFL)?);
    let flags = if nonblocking {
        flags | OFlag::O_NONBLOCK
    } else {
        flags & !OFlag::O_NONBLOCK
    };
    fcntl(fd, FcntlArg::F_SETFL(flags))?;
    Ok(())
}

/// Reads as much of `buf` as the stream delivers before EOF
fn read_full<R: Read>(reader: &mut R, buf: &mut [u8]) -> Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == ErrorKind::Interrupted => continue,
            Err(e) => return Err(e.into()),
        }
    }
    Ok(filled)
}

/// Frame decoder over a transcoder's stdout
pub struct PpmPipeDecoder<R> {
    reader: R,
    source: String,
}

impl<R: Read + AsRawFd> PpmPipeDecoder<R> {
    /// Wrap `reader`, switching it to non-blocking mode
    pub fn new(reader: R, source: impl Into<String>) -> Result<Self> {
        set_nonblocking(reader.as_raw_fd(), true)?;
        Ok(Self {
            reader,
            source: source.into(),
        })
    }

    /// Read the next frame if one is waiting.
    ///
    /// `Ok(None)` covers an idle pipe, EOF and a frame cut short mid-payload.
    /// A header that does not parse is a protocol error.
    pub fn receive_frame(&mut self) -> Result<Option<Frame>> {
        let mut buf = vec![0u8; HEADER_WINDOW];
        let read = match self.reader.read(&mut buf) {
            Ok(0) => {
                trace!("{}: pipe closed", self.source);
                return Ok(None);
            }
            Ok(n) => n,
            Err(e) if matches!(e.kind(), ErrorKind::WouldBlock | ErrorKind::Interrupted) => {
                return Ok(None)
            }
            Err(e) => return Err(e.into()),
        };
        buf.truncate(read);

        let header = parse_ppm_header(&buf).map_err(|e| match e {
            Error::Protocol(msg) => Error::Protocol(format!("{}: {}", self.source, msg)),
            other => other,
        })?;
        let frame_len = header.frame_len().ok_or_else(|| {
            Error::Protocol(format!(
                "{}: {}x{} frame is too large",
                self.source, header.width, header.height
            ))
        })?;
        if frame_len < read {
            return Err(Error::Protocol(format!(
                "{}: {}x{} frame is shorter than the header window",
                self.source, header.width, header.height
            )));
        }

        let remaining = frame_len - read;
        buf.resize(frame_len, 0);

        set_nonblocking(self.reader.as_raw_fd(), false)?;
        let result = read_full(&mut self.reader, &mut buf[read..]);
        set_nonblocking(self.reader.as_raw_fd(), true)?;
        let got = result?;

        if got != remaining {
            debug!(
                "{}: short frame read ({} of {} bytes), dropping frame",
                self.source, got, remaining
            );
            return Ok(None);
        }

        Frame::decode(PixelFormat::PpmRaw, ImageFormat::Pnm, &buf).map(Some)
    }

    pub fn get_ref(&self) -> &R {
        &self.reader
    }
}
