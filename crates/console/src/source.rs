//! Stream source URLs
//!
//! `ustreamer:///dev/videoN` selects the shared-memory producer; anything
//! else is handed to the transcoder. `fps=` and `format=` query parameters
//! are ours and never reach the producer.

use dutlink_common::{Error, Result};

const USTREAMER_SCHEME: &str = "ustreamer://";
const SWAP_SUFFIX: &str = "swap";

/// Formats the shared-memory decoder understands
const SHM_FORMATS: &[&str] = &["UYVY", "RGB3", "BGR3", "JPEG"];

/// Which producer feeds the console
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CaptureKind {
    /// Transcoder emitting PPM frames on a pipe
    Ffmpeg,
    /// Raw-frame producer writing a memsink ring
    Ustreamer,
}

/// A parsed stream source
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamSource {
    pub kind: CaptureKind,
    /// URL or device path handed to the producer
    pub target: String,
    pub fps: Option<u32>,
    pub format: Option<String>,
    /// Ask the producer to swap red and blue
    pub swap_rgb: bool,
}

impl StreamSource {
    pub fn parse(url: &str) -> Result<Self> {
        let (kind, rest) = match url.strip_prefix(USTREAMER_SCHEME) {
            Some(rest) => (CaptureKind::Ustreamer, rest),
            None => (CaptureKind::Ffmpeg, url),
        };

        let (base, query) = match rest.split_once('?') {
            Some((base, query)) => (base, Some(query)),
            None => (rest, None),
        };

        let mut fps = None;
        let mut format = None;
        let mut kept = Vec::new();
        for param in query.into_iter().flat_map(|q| q.split('&')) {
            if let Some(value) = param.strip_prefix("fps=") {
                let value = value.parse::<u32>().map_err(|_| {
                    Error::Configuration(format!("invalid fps '{}' in {}", value, url))
                })?;
                fps = Some(value);
            } else if let Some(value) = param.strip_prefix("format=") {
                format = Some(value.to_string());
            } else if !param.is_empty() {
                kept.push(param);
            }
        }

        let target = if kept.is_empty() {
            base.to_string()
        } else {
            format!("{}?{}", base, kept.join("&"))
        };

        let mut source = Self {
            kind,
            target,
            fps,
            format: None,
            swap_rgb: false,
        };

        if let Some(format) = format {
            if kind == CaptureKind::Ffmpeg {
                return Err(Error::Configuration(format!(
                    "format= is not supported for transcoded streams: {}",
                    url
                )));
            }
            let (name, swap) = match format.strip_suffix(SWAP_SUFFIX) {
                Some(name) => (name.trim_end_matches(['-', '_']), true),
                None => (format.as_str(), false),
            };
            let name = name.to_ascii_uppercase();
            if !SHM_FORMATS.contains(&name.as_str()) {
                return Err(Error::Configuration(format!(
                    "unsupported pixel format '{}' in {}",
                    name, url
                )));
            }
            source.format = Some(name);
            source.swap_rgb = swap;
        }

        if kind == CaptureKind::Ustreamer && source.target.is_empty() {
            return Err(Error::Configuration(format!("no device in {}", url)));
        }

        Ok(source)
    }

    /// Device path when the source is a directly attached capture device
    pub fn device_path(&self) -> Option<&str> {
        self.target
            .starts_with("/dev/")
            .then_some(self.target.as_str())
    }

    /// File name of the memsink the producer creates for this device
    pub fn sink_name(&self) -> String {
        format!("raw-sink{}.raw", self.target).replace('/', "_")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_case::test_case;

    #[test]
    fn test_plain_network_stream() {
        let source = StreamSource::parse("rtsp://10.0.0.3:554/live").unwrap();
        assert_eq!(source.kind, CaptureKind::Ffmpeg);
        assert_eq!(source.target, "rtsp://10.0.0.3:554/live");
        assert_eq!(source.fps, None);
        assert_eq!(source.device_path(), None);
    }

    #[test_case("http://cam/stream?fps=10", "http://cam/stream" ; "only fps")]
    #[test_case("http://cam/stream?fps=10&res=hd", "http://cam/stream?res=hd" ; "fps first")]
    #[test_case("http://cam/stream?res=hd&fps=10", "http://cam/stream?res=hd" ; "fps last")]
    fn test_fps_is_stripped(url: &str, target: &str) {
        let source = StreamSource::parse(url).unwrap();
        assert_eq!(source.target, target);
        assert_eq!(source.fps, Some(10));
    }

    #[test]
    fn test_format_rejected_for_transcoder() {
        let err = StreamSource::parse("/dev/video0?format=UYVY").unwrap_err();
        assert!(err.is_configuration());
    }

    #[test]
    fn test_ustreamer_device() {
        let source = StreamSource::parse("ustreamer:///dev/video2?fps=8&format=RGB3").unwrap();
        assert_eq!(source.kind, CaptureKind::Ustreamer);
        assert_eq!(source.target, "/dev/video2");
        assert_eq!(source.device_path(), Some("/dev/video2"));
        assert_eq!(source.fps, Some(8));
        assert_eq!(source.format.as_deref(), Some("RGB3"));
        assert!(!source.swap_rgb);
        assert_eq!(source.sink_name(), "raw-sink_dev_video2.raw");
    }

    #[test_case("RGB3swap", "RGB3" ; "bare suffix")]
    #[test_case("BGR3-swap", "BGR3" ; "dash suffix")]
    #[test_case("rgb3_swap", "RGB3" ; "lowercase")]
    fn test_swap_suffix(format: &str, expected: &str) {
        let url = format!("ustreamer:///dev/video0?format={}", format);
        let source = StreamSource::parse(&url).unwrap();
        assert_eq!(source.format.as_deref(), Some(expected));
        assert!(source.swap_rgb);
    }

    #[test]
    fn test_unknown_shm_format() {
        let err = StreamSource::parse("ustreamer:///dev/video0?format=NV12").unwrap_err();
        assert!(err.is_configuration());
    }

    #[test]
    fn test_bad_fps() {
        assert!(StreamSource::parse("/dev/video0?fps=fast").is_err());
    }
}
