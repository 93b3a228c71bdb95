//! Pixel format definitions and format negotiation helpers

use serde::{Deserialize, Serialize};
use std::fmt;
use v4l::format::fourcc;

/// Supported pixel formats
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum PixelFormat {
    /// MJPEG compressed format
    Mjpeg,
    /// YUYV 4:2:2 packed format
    Yuyv,
    /// UYVY 4:2:2 packed format
    Uyvy,
    /// NV12 semi-planar format (Y plane + interleaved UV)
    Nv12,
    /// YUV420 planar format (I420)
    Yuv420,
}

impl PixelFormat {
    /// Convert to V4L2 FourCC
    pub fn to_fourcc(&self) -> fourcc::FourCC {
        fourcc::FourCC::new(self.fourcc_bytes())
    }

    /// Raw FourCC code bytes
    pub fn fourcc_bytes(&self) -> &'static [u8; 4] {
        match self {
            PixelFormat::Mjpeg => b"MJPG",
            PixelFormat::Yuyv => b"YUYV",
            PixelFormat::Uyvy => b"UYVY",
            PixelFormat::Nv12 => b"NV12",
            PixelFormat::Yuv420 => b"YU12",
        }
    }

    /// Try to convert from V4L2 FourCC
    pub fn from_fourcc(fourcc: fourcc::FourCC) -> Option<Self> {
        Self::from_fourcc_bytes(&fourcc.repr)
    }

    pub fn from_fourcc_bytes(repr: &[u8; 4]) -> Option<Self> {
        match repr {
            b"MJPG" | b"JPEG" => Some(PixelFormat::Mjpeg),
            b"YUYV" => Some(PixelFormat::Yuyv),
            b"UYVY" => Some(PixelFormat::Uyvy),
            b"NV12" => Some(PixelFormat::Nv12),
            b"YU12" | b"I420" => Some(PixelFormat::Yuv420),
            _ => None,
        }
    }

    /// Check if format is compressed
    pub fn is_compressed(&self) -> bool {
        matches!(self, PixelFormat::Mjpeg)
    }

    /// Bytes per pixel of the first plane for uncompressed formats
    pub fn bytes_per_pixel(&self) -> Option<usize> {
        match self {
            PixelFormat::Mjpeg => None,
            PixelFormat::Yuyv | PixelFormat::Uyvy => Some(2),
            PixelFormat::Nv12 | PixelFormat::Yuv420 => Some(1),
        }
    }

    /// Chroma shared between horizontal pixel pairs
    pub fn is_chroma_subsampled(&self) -> bool {
        !self.is_compressed()
    }

    /// Calculate expected frame size for a given resolution
    /// Returns None for compressed formats (variable size)
    pub fn frame_size(&self, resolution: Resolution) -> Option<usize> {
        let pixels = (resolution.width * resolution.height) as usize;
        match self {
            PixelFormat::Mjpeg => None,
            PixelFormat::Yuyv | PixelFormat::Uyvy => Some(pixels * 2),
            PixelFormat::Nv12 | PixelFormat::Yuv420 => Some(pixels * 3 / 2),
        }
    }

    /// Capture formats the pipeline negotiates for, in order of preference
    pub fn preferred_capture() -> &'static [PixelFormat] {
        &[PixelFormat::Nv12, PixelFormat::Yuyv]
    }
}

impl fmt::Display for PixelFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            PixelFormat::Mjpeg => "MJPEG",
            PixelFormat::Yuyv => "YUYV",
            PixelFormat::Uyvy => "UYVY",
            PixelFormat::Nv12 => "NV12",
            PixelFormat::Yuv420 => "YUV420",
        };
        write!(f, "{}", name)
    }
}

impl std::str::FromStr for PixelFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_uppercase().as_str() {
            "MJPEG" | "MJPG" => Ok(PixelFormat::Mjpeg),
            "YUYV" => Ok(PixelFormat::Yuyv),
            "UYVY" => Ok(PixelFormat::Uyvy),
            "NV12" => Ok(PixelFormat::Nv12),
            "YUV420" | "I420" => Ok(PixelFormat::Yuv420),
            _ => Err(format!("Unknown pixel format: {}", s)),
        }
    }
}

/// Resolution (width x height)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Resolution {
    pub width: u32,
    pub height: u32,
}

impl Resolution {
    pub fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }

    /// Check if resolution is valid
    pub fn is_valid(&self) -> bool {
        self.width >= 160 && self.width <= 15360 && self.height >= 120 && self.height <= 8640
    }

    /// Both dimensions divisible by two, as 4:2:0 and 4:2:2 layouts need
    pub fn is_even(&self) -> bool {
        self.width % 2 == 0 && self.height % 2 == 0
    }

    /// Get total pixels
    pub fn pixels(&self) -> u64 {
        self.width as u64 * self.height as u64
    }

    pub fn is_landscape(&self) -> bool {
        self.width >= self.height
    }

    pub const VGA: Resolution = Resolution {
        width: 640,
        height: 480,
    };
    pub const HD1080: Resolution = Resolution {
        width: 1920,
        height: 1080,
    };
    pub const UHD4K: Resolution = Resolution {
        width: 3840,
        height: 2160,
    };
}

impl fmt::Display for Resolution {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}x{}", self.width, self.height)
    }
}

impl From<(u32, u32)> for Resolution {
    fn from((width, height): (u32, u32)) -> Self {
        Self { width, height }
    }
}

impl std::str::FromStr for Resolution {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (w, h) = s
            .split_once(['x', 'X'])
            .ok_or_else(|| format!("Invalid resolution: {}", s))?;
        let width = w.trim().parse().map_err(|_| format!("Invalid width: {}", w))?;
        let height = h.trim().parse().map_err(|_| format!("Invalid height: {}", h))?;
        Ok(Resolution::new(width, height))
    }
}

/// Effective capture format as reported by the device after negotiation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Format {
    pub resolution: Resolution,
    pub pixel_format: PixelFormat,
    /// Bytes per line of the first plane
    pub stride: u32,
    /// Size of one image in bytes
    pub size_image: u32,
}

impl Format {
    /// Build a tightly packed format
    pub fn packed(resolution: Resolution, pixel_format: PixelFormat) -> Self {
        let stride = resolution.width * pixel_format.bytes_per_pixel().unwrap_or(1) as u32;
        let size_image = pixel_format
            .frame_size(resolution)
            .unwrap_or(resolution.pixels() as usize) as u32;
        Self {
            resolution,
            pixel_format,
            stride,
            size_image,
        }
    }

    pub fn width(&self) -> u32 {
        self.resolution.width
    }

    pub fn height(&self) -> u32 {
        self.resolution.height
    }
}

impl fmt::Display for Format {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {} (stride {})", self.pixel_format, self.resolution, self.stride)
    }
}

/// Pick the first device-enumerated format that is in the preference list
pub fn select_pixel_format(
    enumerated: &[PixelFormat],
    preferred: &[PixelFormat],
) -> Option<PixelFormat> {
    enumerated.iter().find(|f| preferred.contains(f)).copied()
}

/// Pick the landscape size whose width is closest to `target_width`.
///
/// Ties keep the earliest enumerated size. Portrait sizes are ignored.
pub fn select_resolution(sizes: &[Resolution], target_width: u32) -> Option<Resolution> {
    let mut best: Option<(u32, Resolution)> = None;
    for size in sizes.iter().filter(|s| s.is_landscape()) {
        let distance = size.width.abs_diff(target_width);
        match best {
            Some((d, _)) if distance >= d => {}
            _ => best = Some((distance, *size)),
        }
    }
    best.map(|(_, size)| size)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fourcc_roundtrip_names() {
        assert_eq!(PixelFormat::from_fourcc_bytes(b"NV12"), Some(PixelFormat::Nv12));
        assert_eq!(PixelFormat::from_fourcc_bytes(b"I420"), Some(PixelFormat::Yuv420));
        assert_eq!(PixelFormat::from_fourcc_bytes(b"H264"), None);
        assert_eq!(PixelFormat::Yuyv.to_fourcc().repr, *b"YUYV");
    }

    #[test]
    fn test_frame_size() {
        let res = Resolution::new(1920, 1080);
        assert_eq!(PixelFormat::Nv12.frame_size(res), Some(1920 * 1080 * 3 / 2));
        assert_eq!(PixelFormat::Yuyv.frame_size(res), Some(1920 * 1080 * 2));
        assert_eq!(PixelFormat::Mjpeg.frame_size(res), None);
    }

    #[test]
    fn test_select_pixel_format_follows_device_order() {
        let preferred = PixelFormat::preferred_capture();
        let enumerated = [PixelFormat::Mjpeg, PixelFormat::Yuyv, PixelFormat::Nv12];
        assert_eq!(select_pixel_format(&enumerated, preferred), Some(PixelFormat::Yuyv));
        assert_eq!(select_pixel_format(&[PixelFormat::Mjpeg], preferred), None);
    }

    #[test]
    fn test_select_resolution_closest_landscape() {
        let sizes = [
            Resolution::new(1080, 1920),
            Resolution::new(1280, 720),
            Resolution::new(1920, 1080),
            Resolution::new(3840, 2160),
        ];
        assert_eq!(select_resolution(&sizes, 1800), Some(Resolution::new(1920, 1080)));
        assert_eq!(select_resolution(&sizes, 1100), Some(Resolution::new(1280, 720)));
        assert_eq!(select_resolution(&[Resolution::new(720, 1280)], 720), None);
    }

    #[test]
    fn test_select_resolution_tie_keeps_first() {
        let sizes = [Resolution::new(1000, 600), Resolution::new(1200, 700)];
        assert_eq!(select_resolution(&sizes, 1100), Some(Resolution::new(1000, 600)));
    }

    #[test]
    fn test_resolution_parse() {
        assert_eq!("1280x720".parse::<Resolution>(), Ok(Resolution::new(1280, 720)));
        assert!("1280".parse::<Resolution>().is_err());
    }

    #[test]
    fn test_packed_format() {
        let f = Format::packed(Resolution::VGA, PixelFormat::Yuyv);
        assert_eq!(f.stride, 1280);
        assert_eq!(f.size_image, 640 * 480 * 2);
    }
}
