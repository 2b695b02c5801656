//! Canonical frame buffer shared by every capture path

use chrono::{DateTime, Utc};
use image::{ImageFormat, RgbImage};
use serde::{Deserialize, Serialize};
use std::io::Cursor;

/// Source encoding a frame was decoded from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PixelFormat {
    Rgb3,
    Bgr3,
    Uyvy,
    Jpeg,
    PpmRaw,
}

impl PixelFormat {
    /// Map a V4L2 style fourcc tag to a format
    pub fn from_fourcc(tag: &[u8; 4]) -> Option<Self> {
        match tag {
            b"RGB3" => Some(Self::Rgb3),
            b"BGR3" => Some(Self::Bgr3),
            b"UYVY" => Some(Self::Uyvy),
            b"JPEG" => Some(Self::Jpeg),
            _ => None,
        }
    }
}

impl std::fmt::Display for PixelFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PixelFormat::Rgb3 => write!(f, "RGB3"),
            PixelFormat::Bgr3 => write!(f, "BGR3"),
            PixelFormat::Uyvy => write!(f, "UYVY"),
            PixelFormat::Jpeg => write!(f, "JPEG"),
            PixelFormat::PpmRaw => write!(f, "PPM"),
        }
    }
}

/// One decoded screen image. Immutable once built.
#[derive(Debug, Clone)]
pub struct Frame {
    format: PixelFormat,
    image: RgbImage,
    captured_at: DateTime<Utc>,
}

impl Frame {
    pub fn new(format: PixelFormat, image: RgbImage) -> Self {
        Self {
            format,
            image,
            captured_at: Utc::now(),
        }
    }

    /// Decode an encoded image (PPM, JPEG, ...) through the general image decoder
    pub fn decode(format: PixelFormat, encoding: ImageFormat, data: &[u8]) -> crate::Result<Self> {
        let image = image::load_from_memory_with_format(data, encoding)?.to_rgb8();
        Ok(Self::new(format, image))
    }

    pub fn width(&self) -> u32 {
        self.image.width()
    }

    pub fn height(&self) -> u32 {
        self.image.height()
    }

    pub fn format(&self) -> PixelFormat {
        self.format
    }

    /// RGB8 pixel buffer
    pub fn image(&self) -> &RgbImage {
        &self.image
    }

    pub fn captured_at(&self) -> DateTime<Utc> {
        self.captured_at
    }

    /// Encode as PNG
    pub fn to_png(&self) -> crate::Result<Vec<u8>> {
        let mut out = Cursor::new(Vec::new());
        self.image.write_to(&mut out, ImageFormat::Png)?;
        Ok(out.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fourcc_mapping() {
        assert_eq!(PixelFormat::from_fourcc(b"UYVY"), Some(PixelFormat::Uyvy));
        assert_eq!(PixelFormat::from_fourcc(b"BGR3"), Some(PixelFormat::Bgr3));
        assert_eq!(PixelFormat::from_fourcc(b"YUYV"), None);
    }

    #[test]
    fn test_decode_ppm() {
        let mut data = b"P6\n2 1\n255\n".to_vec();
        data.extend_from_slice(&[255, 0, 0, 0, 0, 255]);
        let frame = Frame::decode(PixelFormat::PpmRaw, ImageFormat::Pnm, &data).unwrap();
        assert_eq!((frame.width(), frame.height()), (2, 1));
        assert_eq!(frame.image().get_pixel(0, 0).0, [255, 0, 0]);
        assert_eq!(frame.image().get_pixel(1, 0).0, [0, 0, 255]);
    }

    #[test]
    fn test_png_encoding_has_signature() {
        let frame = Frame::new(PixelFormat::Rgb3, RgbImage::new(4, 4));
        let png = frame.to_png().unwrap();
        assert_eq!(&png[..8], b"\x89PNG\r\n\x1a\n");
    }
}
