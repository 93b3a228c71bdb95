//! Pixel format conversion and scaling
//!
//! Preview and managed-codec units convert each captured frame into a buffer
//! they own. [`PixelConverter`] is that collaborator; [`SoftwareConverter`]
//! is a portable implementation with nearest-neighbour scaling.

use crate::error::{CaptureError, Result};
use crate::video::format::{Format, PixelFormat};

/// Synchronous frame converter
pub trait PixelConverter: Send + Sync {
    /// Convert `src` laid out as `src_format` into `dst` laid out as `dst_format`,
    /// scaling when the resolutions differ
    fn convert(&self, src: &[u8], src_format: &Format, dst: &mut [u8], dst_format: &Format)
        -> Result<()>;
}

/// Bytes needed to hold one image of `format` with its stride.
/// Subsampled layouts with an odd width or height are rejected.
pub fn required_len(format: &Format) -> Result<usize> {
    if format.pixel_format.is_chroma_subsampled() && !format.resolution.is_even() {
        return Err(CaptureError::Conversion(format!(
            "{} needs even dimensions, got {}",
            format.pixel_format, format.resolution
        )));
    }
    let stride = format.stride as usize;
    let height = format.height() as usize;
    match format.pixel_format {
        PixelFormat::Yuyv | PixelFormat::Uyvy => Ok(stride * height),
        PixelFormat::Nv12 | PixelFormat::Yuv420 => Ok(stride * height + stride * height.div_ceil(2)),
        PixelFormat::Mjpeg => Err(CaptureError::Conversion(
            "compressed formats cannot be converted".to_string(),
        )),
    }
}

/// Reads Y/U/V samples out of a raw frame
struct Sampler<'a> {
    data: &'a [u8],
    format: &'a Format,
}

impl<'a> Sampler<'a> {
    fn luma(&self, x: usize, y: usize) -> u8 {
        let stride = self.format.stride as usize;
        match self.format.pixel_format {
            PixelFormat::Yuyv => self.data[y * stride + x * 2],
            PixelFormat::Uyvy => self.data[y * stride + x * 2 + 1],
            _ => self.data[y * stride + x],
        }
    }

    fn chroma(&self, x: usize, y: usize) -> (u8, u8) {
        let stride = self.format.stride as usize;
        let height = self.format.height() as usize;
        match self.format.pixel_format {
            PixelFormat::Yuyv => {
                let base = y * stride + (x / 2) * 4;
                (self.data[base + 1], self.data[base + 3])
            }
            PixelFormat::Uyvy => {
                let base = y * stride + (x / 2) * 4;
                (self.data[base], self.data[base + 2])
            }
            PixelFormat::Nv12 => {
                let base = stride * height + (y / 2) * stride + (x / 2) * 2;
                (self.data[base], self.data[base + 1])
            }
            _ => {
                let half = stride / 2;
                let u_base = stride * height;
                let v_base = u_base + half * height.div_ceil(2);
                let offset = (y / 2) * half + x / 2;
                (self.data[u_base + offset], self.data[v_base + offset])
            }
        }
    }
}

/// Portable converter between the uncompressed capture formats
#[derive(Debug, Default, Clone, Copy)]
pub struct SoftwareConverter;

impl SoftwareConverter {
    pub fn new() -> Self {
        Self
    }
}

impl PixelConverter for SoftwareConverter {
    fn convert(
        &self,
        src: &[u8],
        src_format: &Format,
        dst: &mut [u8],
        dst_format: &Format,
    ) -> Result<()> {
        let src_len = required_len(src_format)?;
        let dst_len = required_len(dst_format)?;
        if src.len() < src_len {
            return Err(CaptureError::Conversion(format!(
                "source holds {} bytes, {} needs {}",
                src.len(),
                src_format,
                src_len
            )));
        }
        if dst.len() < dst_len {
            return Err(CaptureError::Conversion(format!(
                "destination holds {} bytes, {} needs {}",
                dst.len(),
                dst_format,
                dst_len
            )));
        }

        if src_format == dst_format {
            dst[..src_len].copy_from_slice(&src[..src_len]);
            return Ok(());
        }

        let sampler = Sampler {
            data: src,
            format: src_format,
        };
        let (sw, sh) = (src_format.width() as usize, src_format.height() as usize);
        let (dw, dh) = (dst_format.width() as usize, dst_format.height() as usize);
        let stride = dst_format.stride as usize;
        let map_x = |x: usize| x * sw / dw;
        let map_y = |y: usize| y * sh / dh;

        match dst_format.pixel_format {
            PixelFormat::Yuyv | PixelFormat::Uyvy => {
                let uyvy = dst_format.pixel_format == PixelFormat::Uyvy;
                for y in 0..dh {
                    let sy = map_y(y);
                    let row = &mut dst[y * stride..];
                    for x in (0..dw).step_by(2) {
                        let (u, v) = sampler.chroma(map_x(x), sy);
                        let y0 = sampler.luma(map_x(x), sy);
                        let y1 = sampler.luma(map_x((x + 1).min(dw - 1)), sy);
                        let px = &mut row[x * 2..x * 2 + 4];
                        if uyvy {
                            px.copy_from_slice(&[u, y0, v, y1]);
                        } else {
                            px.copy_from_slice(&[y0, u, y1, v]);
                        }
                    }
                }
            }
            PixelFormat::Nv12 | PixelFormat::Yuv420 => {
                for y in 0..dh {
                    let sy = map_y(y);
                    for x in 0..dw {
                        dst[y * stride + x] = sampler.luma(map_x(x), sy);
                    }
                }
                let chroma_base = stride * dh;
                let half = stride / 2;
                let v_base = chroma_base + half * dh.div_ceil(2);
                for cy in 0..dh.div_ceil(2) {
                    let sy = map_y(cy * 2);
                    for cx in 0..dw.div_ceil(2) {
                        let (u, v) = sampler.chroma(map_x(cx * 2), sy);
                        if dst_format.pixel_format == PixelFormat::Nv12 {
                            let base = chroma_base + cy * stride + cx * 2;
                            dst[base] = u;
                            dst[base + 1] = v;
                        } else {
                            dst[chroma_base + cy * half + cx] = u;
                            dst[v_base + cy * half + cx] = v;
                        }
                    }
                }
            }
            PixelFormat::Mjpeg => unreachable!("rejected by required_len"),
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::video::format::Resolution;

    fn yuyv_frame(res: Resolution, luma: u8, u: u8, v: u8) -> Vec<u8> {
        let mut data = Vec::with_capacity(res.pixels() as usize * 2);
        for _ in 0..res.pixels() / 2 {
            data.extend_from_slice(&[luma, u, luma, v]);
        }
        data
    }

    #[test]
    fn test_yuyv_to_nv12_same_size() {
        let res = Resolution::new(8, 4);
        let src_format = Format::packed(res, PixelFormat::Yuyv);
        let dst_format = Format::packed(res, PixelFormat::Nv12);
        let src = yuyv_frame(res, 77, 10, 200);
        let mut dst = vec![0u8; required_len(&dst_format).unwrap()];

        SoftwareConverter::new()
            .convert(&src, &src_format, &mut dst, &dst_format)
            .unwrap();

        assert!(dst[..32].iter().all(|&b| b == 77));
        assert_eq!(&dst[32..34], &[10, 200]);
        assert_eq!(dst.len(), 48);
    }

    #[test]
    fn test_nv12_downscale_to_i420() {
        let src_format = Format::packed(Resolution::new(8, 8), PixelFormat::Nv12);
        let dst_format = Format::packed(Resolution::new(4, 4), PixelFormat::Yuv420);
        let mut src = vec![0u8; required_len(&src_format).unwrap()];
        src[..64].fill(50);
        for pair in src[64..].chunks_mut(2) {
            pair[0] = 90;
            pair[1] = 160;
        }
        let mut dst = vec![0u8; required_len(&dst_format).unwrap()];

        SoftwareConverter::new()
            .convert(&src, &src_format, &mut dst, &dst_format)
            .unwrap();

        assert!(dst[..16].iter().all(|&b| b == 50));
        assert!(dst[16..20].iter().all(|&b| b == 90));
        assert!(dst[20..24].iter().all(|&b| b == 160));
    }

    #[test]
    fn test_identity_copy() {
        let format = Format::packed(Resolution::new(4, 2), PixelFormat::Nv12);
        let src: Vec<u8> = (0..12).collect();
        let mut dst = vec![0u8; 12];
        SoftwareConverter::new()
            .convert(&src, &format, &mut dst, &format)
            .unwrap();
        assert_eq!(src, dst);
    }

    #[test]
    fn test_short_buffers_rejected() {
        let format = Format::packed(Resolution::new(4, 2), PixelFormat::Yuyv);
        let mut dst = vec![0u8; 4];
        let err = SoftwareConverter::new()
            .convert(&[0u8; 16], &format, &mut dst, &format)
            .unwrap_err();
        assert!(matches!(err, CaptureError::Conversion(_)));
    }

    #[test]
    fn test_odd_dimensions_rejected() {
        let src_format = Format::packed(Resolution::new(640, 480), PixelFormat::Yuyv);
        let src = yuyv_frame(src_format.resolution, 60, 128, 128);
        for (res, pixel_format) in [
            (Resolution::new(321, 240), PixelFormat::Nv12),
            (Resolution::new(321, 240), PixelFormat::Yuyv),
            (Resolution::new(320, 241), PixelFormat::Nv12),
            (Resolution::new(320, 241), PixelFormat::Yuv420),
        ] {
            let dst_format = Format::packed(res, pixel_format);
            assert!(required_len(&dst_format).is_err());
            let mut dst = vec![0u8; res.pixels() as usize * 2];
            let err = SoftwareConverter::new()
                .convert(&src, &src_format, &mut dst, &dst_format)
                .unwrap_err();
            assert!(matches!(err, CaptureError::Conversion(_)), "{} {}", res, pixel_format);
        }

        let odd_src = Format::packed(Resolution::new(321, 240), PixelFormat::Yuyv);
        let dst_format = Format::packed(Resolution::new(320, 240), PixelFormat::Nv12);
        let mut dst = vec![0u8; required_len(&dst_format).unwrap()];
        assert!(SoftwareConverter::new()
            .convert(&vec![0u8; 321 * 240 * 2], &odd_src, &mut dst, &dst_format)
            .is_err());
    }

    #[test]
    fn test_mjpeg_rejected() {
        let format = Format::packed(Resolution::new(4, 2), PixelFormat::Mjpeg);
        assert!(required_len(&format).is_err());
    }
}
