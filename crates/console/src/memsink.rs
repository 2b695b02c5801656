//! Memsink shared-memory ring reader
//!
//! The raw-frame producer publishes the latest frame in a shared-memory
//! file. Readers take an exclusive `flock`, map the file, and write their
//! CLOCK_MONOTONIC timestamp back into the header; a producer that stops
//! seeing fresh timestamps assumes no clients and stops emitting frames.
//!
//! Header layout (little endian):
//!
//! | field            | v4  | v7  |
//! |------------------|-----|-----|
//! | magic (u64)      | 0   | 0   |
//! | version (u32)    | 8   | 8   |
//! | id (u64)         | 16  | 16  |
//! | used (u64)       | 24  | 24  |
//! | last client ts   | 112 | 32  |
//! | width/height/fourcc/stride | 32 | 52 |
//! | payload          | 129 | 128 |

use crate::pixels::{self, BGR3, RGB3};
use dutlink_common::{Error, Frame, PixelFormat, Result};
use image::ImageFormat;
use nix::fcntl::{Flock, FlockArg};
use nix::sys::mman::{mmap, munmap, MapFlags, ProtFlags};
use nix::time::{clock_gettime, ClockId};
use std::ffi::c_void;
use std::fs::{File, OpenOptions};
use std::num::NonZeroUsize;
use std::path::{Path, PathBuf};
use std::ptr::NonNull;
use tracing::{debug, trace};

pub const MEMSINK_MAGIC: u64 = 0xCAFE_BABE_CAFE_BABE;

const MAGIC_OFFSET: usize = 0;
const VERSION_OFFSET: usize = 8;
const ID_OFFSET: usize = 16;
const USED_OFFSET: usize = 24;
/// Bytes needed before the version can be read
const PREAMBLE_LEN: usize = 32;
const CLIENT_TS_LEN: usize = 16;

/// Field offsets of one memsink header version
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemsinkLayout {
    pub version: u32,
    pub client_ts: usize,
    pub meta: usize,
    pub payload: usize,
}

const LAYOUTS: &[MemsinkLayout] = &[
    MemsinkLayout {
        version: 4,
        client_ts: 112,
        meta: 32,
        payload: 129,
    },
    MemsinkLayout {
        version: 7,
        client_ts: 32,
        meta: 52,
        payload: 128,
    },
];

impl MemsinkLayout {
    pub fn for_version(version: u32) -> Result<&'static MemsinkLayout> {
        LAYOUTS
            .iter()
            .find(|l| l.version == version)
            .ok_or_else(|| Error::Protocol(format!("unsupported memsink version {}", version)))
    }
}

/// Frame description from the header's metadata block
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameMeta {
    pub width: u32,
    pub height: u32,
    pub fourcc: [u8; 4],
    pub stride: u32,
}

fn read_u32(buf: &[u8], offset: usize) -> u32 {
    let mut bytes = [0u8; 4];
    bytes.copy_from_slice(&buf[offset..offset + 4]);
    u32::from_le_bytes(bytes)
}

fn read_u64(buf: &[u8], offset: usize) -> u64 {
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&buf[offset..offset + 8]);
    u64::from_le_bytes(bytes)
}

impl FrameMeta {
    fn read(buf: &[u8], layout: &MemsinkLayout) -> Self {
        let base = layout.meta;
        let mut fourcc = [0u8; 4];
        fourcc.copy_from_slice(&buf[base + 8..base + 12]);
        Self {
            width: read_u32(buf, base),
            height: read_u32(buf, base + 4),
            fourcc,
            stride: read_u32(buf, base + 12),
        }
    }
}

/// Encode seconds as the producer's native `long double`, padded to 16 bytes
#[cfg(any(target_arch = "x86", target_arch = "x86_64"))]
pub fn encode_long_double(value: f64) -> [u8; 16] {
    // x87 80-bit extended precision: 64-bit mantissa with explicit integer bit
    let mut out = [0u8; 16];
    if value == 0.0 || !value.is_finite() {
        return out;
    }
    let bits = value.to_bits();
    let sign = ((bits >> 63) as u16) << 15;
    let exponent = ((bits >> 52) & 0x7ff) as i32;
    let fraction = bits & ((1u64 << 52) - 1);
    if exponent == 0 {
        // subnormal doubles are far below any timestamp
        return out;
    }
    let exponent = (exponent - 1023 + 16383) as u16;
    let mantissa = (1u64 << 63) | (fraction << 11);
    out[..8].copy_from_slice(&mantissa.to_le_bytes());
    out[8..10].copy_from_slice(&(sign | exponent).to_le_bytes());
    out
}

/// Encode seconds as the producer's native `long double` (IEEE binary128)
#[cfg(not(any(target_arch = "x86", target_arch = "x86_64")))]
pub fn encode_long_double(value: f64) -> [u8; 16] {
    if value == 0.0 || !value.is_finite() {
        return [0u8; 16];
    }
    let bits = value.to_bits();
    let sign = (bits >> 63) as u128;
    let exponent = ((bits >> 52) & 0x7ff) as i64;
    if exponent == 0 {
        return [0u8; 16];
    }
    let fraction = (bits & ((1u64 << 52) - 1)) as u128;
    let exponent = (exponent - 1023 + 16383) as u128;
    ((sign << 127) | (exponent << 112) | (fraction << 60)).to_le_bytes()
}

fn monotonic_seconds() -> Result<f64> {
    let now = clock_gettime(ClockId::CLOCK_MONOTONIC)?;
    Ok(now.tv_sec() as f64 + now.tv_nsec() as f64 / 1e9)
}

/// Shared mapping of the whole sink, unmapped on drop
struct Mapping {
    ptr: NonNull<c_void>,
    len: NonZeroUsize,
}

impl Mapping {
    fn new(file: &File, len: NonZeroUsize) -> Result<Self> {
        // SAFETY: the file stays open for the lifetime of the mapping and is
        // only mutated under the exclusive flock we hold.
        let ptr = unsafe {
            mmap(
                None,
                len,
                ProtFlags::PROT_READ | ProtFlags::PROT_WRITE,
                MapFlags::MAP_SHARED,
                file,
                0,
            )?
        };
        Ok(Self { ptr, len })
    }

    fn as_mut_slice(&mut self) -> &mut [u8] {
        // SAFETY: ptr/len describe a live mapping owned by self.
        unsafe { std::slice::from_raw_parts_mut(self.ptr.as_ptr() as *mut u8, self.len.get()) }
    }
}

impl Drop for Mapping {
    fn drop(&mut self) {
        // SAFETY: unmapping the region created in Mapping::new exactly once.
        if let Err(e) = unsafe { munmap(self.ptr, self.len.get()) } {
            debug!("munmap failed: {}", e);
        }
    }
}

/// Reader side of a memsink ring
#[derive(Debug)]
pub struct ShmRing {
    file: File,
    path: PathBuf,
    last_frame_id: u64,
}

impl ShmRing {
    pub fn open(path: &Path) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(path)
            .map_err(|e| Error::Console(format!("cannot open memsink {}: {}", path.display(), e)))?;
        Ok(Self {
            file,
            path: path.to_path_buf(),
            last_frame_id: 0,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn last_frame_id(&self) -> u64 {
        self.last_frame_id
    }

    /// Poll the ring once.
    ///
    /// Returns `Ok(None)` while the producer has not published anything,
    /// when the frame id is unchanged, or when the frame is empty.
    pub fn poll(&mut self) -> Result<Option<Frame>> {
        let file = self.file.try_clone()?;
        let lock = Flock::lock(file, FlockArg::LockExclusive).map_err(|(_, e)| Error::Sys(e))?;

        let len = lock.metadata()?.len() as usize;
        let Some(map_len) = NonZeroUsize::new(len).filter(|l| l.get() >= PREAMBLE_LEN) else {
            trace!("{}: sink not initialised yet", self.path.display());
            return Ok(None);
        };

        // Dropped before `lock`, so the region is unmapped before the flock is released.
        let mut mapping = Mapping::new(&lock, map_len)?;
        self.read_frame(mapping.as_mut_slice(), monotonic_seconds()?)
    }

    fn read_frame(&mut self, region: &mut [u8], now: f64) -> Result<Option<Frame>> {
        let magic = read_u64(region, MAGIC_OFFSET);
        if magic == 0 {
            return Ok(None);
        }
        if magic != MEMSINK_MAGIC {
            return Err(Error::Protocol(format!(
                "{}: bad memsink magic {:#018x}",
                self.path.display(),
                magic
            )));
        }

        let version = read_u32(region, VERSION_OFFSET);
        let layout = MemsinkLayout::for_version(version)?;
        if region.len() < layout.payload {
            return Err(Error::Protocol(format!(
                "{}: memsink shorter than its v{} header",
                self.path.display(),
                version
            )));
        }

        region[layout.client_ts..layout.client_ts + CLIENT_TS_LEN]
            .copy_from_slice(&encode_long_double(now));

        let id = read_u64(region, ID_OFFSET);
        if id == self.last_frame_id {
            return Ok(None);
        }
        self.last_frame_id = id;

        let used = read_u64(region, USED_OFFSET) as usize;
        if used == 0 {
            return Ok(None);
        }

        let end = layout.payload.checked_add(used).filter(|end| *end <= region.len());
        let Some(end) = end else {
            return Err(Error::Protocol(format!(
                "{}: frame of {} bytes overruns the sink",
                self.path.display(),
                used
            )));
        };
        let payload = &region[layout.payload..end];
        let meta = FrameMeta::read(region, layout);
        trace!(
            "memsink frame {}: {}x{} {} stride {}",
            id,
            meta.width,
            meta.height,
            String::from_utf8_lossy(&meta.fourcc),
            meta.stride
        );

        decode_payload(&meta, payload).map(Some)
    }
}

/// Decode one memsink payload according to its fourcc
pub fn decode_payload(meta: &FrameMeta, payload: &[u8]) -> Result<Frame> {
    let format = PixelFormat::from_fourcc(&meta.fourcc).ok_or_else(|| {
        Error::Protocol(format!(
            "unsupported memsink format '{}'",
            String::from_utf8_lossy(&meta.fourcc)
        ))
    })?;

    let image = match format {
        PixelFormat::Jpeg => return Frame::decode(format, ImageFormat::Jpeg, payload),
        PixelFormat::Rgb3 => {
            pixels::decode_raw_rgb(payload, meta.width, meta.height, meta.stride, &RGB3)?
        }
        PixelFormat::Bgr3 => {
            pixels::decode_raw_rgb(payload, meta.width, meta.height, meta.stride, &BGR3)?
        }
        PixelFormat::Uyvy => pixels::decode_uyvy(payload, meta.width, meta.height, meta.stride)?,
        PixelFormat::PpmRaw => {
            return Err(Error::Protocol("PPM is not a memsink format".to_string()))
        }
    };
    Ok(Frame::new(format, image))
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use tempfile::TempDir;
    use test_case::test_case;

    /// Build a sink image with one frame
    pub(crate) fn sink(version: u32, id: u64, meta: FrameMeta, payload: &[u8]) -> Vec<u8> {
        let layout = MemsinkLayout::for_version(version).unwrap();
        let mut buf = vec![0u8; layout.payload + payload.len().max(64)];
        buf[MAGIC_OFFSET..8].copy_from_slice(&MEMSINK_MAGIC.to_le_bytes());
        buf[VERSION_OFFSET..12].copy_from_slice(&version.to_le_bytes());
        buf[ID_OFFSET..24].copy_from_slice(&id.to_le_bytes());
        buf[USED_OFFSET..32].copy_from_slice(&(payload.len() as u64).to_le_bytes());
        let m = layout.meta;
        buf[m..m + 4].copy_from_slice(&meta.width.to_le_bytes());
        buf[m + 4..m + 8].copy_from_slice(&meta.height.to_le_bytes());
        buf[m + 8..m + 12].copy_from_slice(&meta.fourcc);
        buf[m + 12..m + 16].copy_from_slice(&meta.stride.to_le_bytes());
        buf[layout.payload..layout.payload + payload.len()].copy_from_slice(payload);
        buf
    }

    pub(crate) fn rgb_meta(width: u32, height: u32) -> FrameMeta {
        FrameMeta {
            width,
            height,
            fourcc: *b"RGB3",
            stride: width * 3,
        }
    }

    fn ring_with(tmp: &TempDir, contents: &[u8]) -> ShmRing {
        let path = tmp.path().join("raw-sink_dev_video0.raw");
        std::fs::write(&path, contents).unwrap();
        ShmRing::open(&path).unwrap()
    }

    fn set_id(path: &Path, id: u64) {
        let mut buf = std::fs::read(path).unwrap();
        buf[ID_OFFSET..24].copy_from_slice(&id.to_le_bytes());
        std::fs::write(path, buf).unwrap();
    }

    #[test_case(4 ; "v4")]
    #[test_case(7 ; "v7")]
    fn test_metadata_offsets(version: u32) {
        let meta = FrameMeta {
            width: 640,
            height: 480,
            fourcc: *b"UYVY",
            stride: 1280,
        };
        let buf = sink(version, 1, meta, &[0u8; 16]);
        let layout = MemsinkLayout::for_version(version).unwrap();
        assert_eq!(FrameMeta::read(&buf, layout), meta);
    }

    #[test]
    fn test_unknown_version_is_fatal() {
        let tmp = TempDir::new().unwrap();
        let mut buf = sink(7, 1, rgb_meta(1, 1), &[1, 2, 3]);
        buf[VERSION_OFFSET..12].copy_from_slice(&5u32.to_le_bytes());
        let mut ring = ring_with(&tmp, &buf);
        let err = ring.poll().unwrap_err();
        assert!(err.to_string().contains("unsupported memsink version 5"));
    }

    #[test]
    fn test_bad_magic_is_fatal() {
        let tmp = TempDir::new().unwrap();
        let mut buf = sink(7, 1, rgb_meta(1, 1), &[1, 2, 3]);
        buf[MAGIC_OFFSET..8].copy_from_slice(&0xdead_beefu64.to_le_bytes());
        let mut ring = ring_with(&tmp, &buf);
        assert!(matches!(ring.poll(), Err(Error::Protocol(_))));
    }

    #[test]
    fn test_unpublished_sink_yields_nothing() {
        let tmp = TempDir::new().unwrap();
        let mut empty = ring_with(&tmp, &[]);
        assert!(empty.poll().unwrap().is_none());

        let tmp = TempDir::new().unwrap();
        let mut zeroed = ring_with(&tmp, &[0u8; 256]);
        assert!(zeroed.poll().unwrap().is_none());
    }

    #[test_case(4 ; "v4")]
    #[test_case(7 ; "v7")]
    fn test_unchanged_id_yields_one_frame(version: u32) {
        let tmp = TempDir::new().unwrap();
        let payload = [255u8, 0, 0, 0, 255, 0];
        let mut ring = ring_with(&tmp, &sink(version, 1, rgb_meta(2, 1), &payload));

        let frame = ring.poll().unwrap().unwrap();
        assert_eq!((frame.width(), frame.height()), (2, 1));
        assert_eq!(frame.format(), PixelFormat::Rgb3);
        assert_eq!(frame.image().get_pixel(1, 0).0, [0, 255, 0]);

        assert!(ring.poll().unwrap().is_none());
        assert!(ring.poll().unwrap().is_none());

        set_id(ring.path(), 2);
        assert!(ring.poll().unwrap().is_some());
        assert!(ring.poll().unwrap().is_none());
        assert_eq!(ring.last_frame_id(), 2);
    }

    #[test]
    fn test_empty_frame_is_not_an_error() {
        let tmp = TempDir::new().unwrap();
        let mut ring = ring_with(&tmp, &sink(7, 3, rgb_meta(2, 1), &[]));
        assert!(ring.poll().unwrap().is_none());
    }

    #[test_case(4 ; "v4")]
    #[test_case(7 ; "v7")]
    fn test_client_timestamp_written_back(version: u32) {
        let tmp = TempDir::new().unwrap();
        let mut ring = ring_with(&tmp, &sink(version, 1, rgb_meta(1, 1), &[1, 2, 3]));
        ring.poll().unwrap();

        let layout = MemsinkLayout::for_version(version).unwrap();
        let buf = std::fs::read(ring.path()).unwrap();
        let ts = &buf[layout.client_ts..layout.client_ts + CLIENT_TS_LEN];
        assert!(ts.iter().any(|b| *b != 0));
        // metadata must be untouched by the write-back
        assert_eq!(FrameMeta::read(&buf, layout), rgb_meta(1, 1));
    }

    #[test]
    fn test_unsupported_fourcc() {
        let meta = FrameMeta {
            width: 1,
            height: 1,
            fourcc: *b"NV12",
            stride: 1,
        };
        let err = decode_payload(&meta, &[0u8; 4]).unwrap_err();
        assert!(err.to_string().contains("NV12"));
    }

    #[test]
    fn test_bgr3_payload() {
        let meta = FrameMeta {
            fourcc: *b"BGR3",
            ..rgb_meta(1, 1)
        };
        let frame = decode_payload(&meta, &[10, 20, 30]).unwrap();
        assert_eq!(frame.image().get_pixel(0, 0).0, [30, 20, 10]);
    }

    #[test_case(*b"RGB3" ; "rgb3")]
    #[test_case(*b"BGR3" ; "bgr3")]
    #[test_case(*b"UYVY" ; "uyvy")]
    fn test_corrupt_dimensions_are_protocol_errors(fourcc: [u8; 4]) {
        let meta = FrameMeta {
            width: u32::MAX,
            height: u32::MAX,
            fourcc,
            stride: 0,
        };
        let err = decode_payload(&meta, &[1, 2, 3]).unwrap_err();
        assert!(matches!(err, Error::Protocol(_)));

        let tmp = TempDir::new().unwrap();
        let mut ring = ring_with(&tmp, &sink(7, 1, meta, &[1, 2, 3]));
        assert!(matches!(ring.poll(), Err(Error::Protocol(_))));
    }

    #[test]
    fn test_jpeg_payload_uses_image_decoder() {
        let mut jpeg = std::io::Cursor::new(Vec::new());
        image::RgbImage::from_pixel(8, 8, image::Rgb([200, 200, 200]))
            .write_to(&mut jpeg, ImageFormat::Jpeg)
            .unwrap();
        let meta = FrameMeta {
            width: 8,
            height: 8,
            fourcc: *b"JPEG",
            stride: 0,
        };
        let frame = decode_payload(&meta, jpeg.get_ref()).unwrap();
        assert_eq!((frame.width(), frame.height()), (8, 8));
        assert_eq!(frame.format(), PixelFormat::Jpeg);
    }

    #[cfg(any(target_arch = "x86", target_arch = "x86_64"))]
    #[test]
    fn test_long_double_x87() {
        let one = encode_long_double(1.0);
        assert_eq!(&one[..8], &[0, 0, 0, 0, 0, 0, 0, 0x80]);
        assert_eq!(&one[8..10], &[0xff, 0x3f]);
        assert!(one[10..].iter().all(|b| *b == 0));

        let three = encode_long_double(3.0);
        assert_eq!(&three[..8], &[0, 0, 0, 0, 0, 0, 0, 0xc0]);
        assert_eq!(&three[8..10], &[0x00, 0x40]);
    }

    #[cfg(not(any(target_arch = "x86", target_arch = "x86_64")))]
    #[test]
    fn test_long_double_binary128() {
        let one = encode_long_double(1.0);
        assert_eq!(u128::from_le_bytes(one), 0x3fffu128 << 112);
    }
}
