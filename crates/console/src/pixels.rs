//! Raw pixel layouts produced by capture devices

use dutlink_common::{Error, Result};
use image::RgbImage;

/// Position of one colour channel inside a little-endian pixel word
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChannelMask {
    pub shift: u32,
    pub mask: u32,
}

impl ChannelMask {
    const fn byte(index: u32) -> Self {
        Self {
            shift: index * 8,
            mask: 0xff,
        }
    }

    fn extract(&self, word: u32) -> u8 {
        ((word >> self.shift) & self.mask) as u8
    }
}

/// Packed RGB layout described by per-channel masks
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RawRgbLayout {
    pub bytes_per_pixel: usize,
    pub red: ChannelMask,
    pub green: ChannelMask,
    pub blue: ChannelMask,
}

/// `RGB3`: bytes R, G, B
pub const RGB3: RawRgbLayout = RawRgbLayout {
    bytes_per_pixel: 3,
    red: ChannelMask::byte(0),
    green: ChannelMask::byte(1),
    blue: ChannelMask::byte(2),
};

/// `BGR3`: bytes B, G, R
pub const BGR3: RawRgbLayout = RawRgbLayout {
    bytes_per_pixel: 3,
    red: ChannelMask::byte(2),
    green: ChannelMask::byte(1),
    blue: ChannelMask::byte(0),
};

fn oversized(width: u32, height: u32) -> Error {
    Error::Protocol(format!("raw frame size {}x{} overflows", width, height))
}

/// Stride actually used for rows of `row_len` bytes; short strides mean packed rows
fn effective_stride(row_len: usize, stride: u32) -> usize {
    row_len.max(stride as usize)
}

/// Ensures `data` holds `height` rows of `row_len` bytes spaced `stride` apart.
///
/// Every pixel of the decoded image is backed by payload bytes once this
/// passes, which bounds the allocation by the payload size.
fn check_len(data: &[u8], width: u32, height: u32, stride: usize, row_len: usize) -> Result<()> {
    if width == 0 || height == 0 {
        return Err(Error::Protocol(format!(
            "raw frame size {}x{} is empty",
            width, height
        )));
    }
    let needed = stride
        .checked_mul(height as usize - 1)
        .and_then(|n| n.checked_add(row_len))
        .ok_or_else(|| oversized(width, height))?;
    if data.len() < needed {
        return Err(Error::Protocol(format!(
            "raw frame holds {} bytes, {} needed",
            data.len(),
            needed
        )));
    }
    Ok(())
}

/// Decode packed RGB rows; a `stride` of 0 means tightly packed
pub fn decode_raw_rgb(
    data: &[u8],
    width: u32,
    height: u32,
    stride: u32,
    layout: &RawRgbLayout,
) -> Result<RgbImage> {
    let bpp = layout.bytes_per_pixel;
    let row_len = (width as usize)
        .checked_mul(bpp)
        .ok_or_else(|| oversized(width, height))?;
    let stride = effective_stride(row_len, stride);
    check_len(data, width, height, stride, row_len)?;

    let mut image = RgbImage::new(width, height);
    for (y, row) in image.rows_mut().enumerate() {
        let line = &data[y * stride..];
        for (x, pixel) in row.enumerate() {
            let word = line[x * bpp..(x + 1) * bpp]
                .iter()
                .rev()
                .fold(0u32, |acc, b| (acc << 8) | *b as u32);
            pixel.0 = [
                layout.red.extract(word),
                layout.green.extract(word),
                layout.blue.extract(word),
            ];
        }
    }
    Ok(image)
}

fn clamp(v: i32) -> u8 {
    v.clamp(0, 255) as u8
}

/// BT.601 limited-range YCbCr to RGB
pub fn yuv_to_rgb(y: u8, u: u8, v: u8) -> [u8; 3] {
    let c = y as i32 - 16;
    let d = u as i32 - 128;
    let e = v as i32 - 128;
    [
        clamp((298 * c + 409 * e + 128) >> 8),
        clamp((298 * c - 100 * d - 208 * e + 128) >> 8),
        clamp((298 * c + 516 * d + 128) >> 8),
    ]
}

/// Decode `UYVY` (U0 Y0 V0 Y1 per pixel pair)
pub fn decode_uyvy(data: &[u8], width: u32, height: u32, stride: u32) -> Result<RgbImage> {
    let row_len = (width as usize)
        .div_ceil(2)
        .checked_mul(4)
        .ok_or_else(|| oversized(width, height))?;
    let stride = effective_stride(row_len, stride);
    check_len(data, width, height, stride, row_len)?;

    let mut image = RgbImage::new(width, height);
    for (y, row) in image.rows_mut().enumerate() {
        let line = &data[y * stride..];
        for (x, pixel) in row.enumerate() {
            let pair = &line[(x / 2) * 4..(x / 2) * 4 + 4];
            let luma = if x % 2 == 0 { pair[1] } else { pair[3] };
            pixel.0 = yuv_to_rgb(luma, pair[0], pair[2]);
        }
    }
    Ok(image)
}
