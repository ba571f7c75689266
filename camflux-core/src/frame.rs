use std::io::Cursor;
use std::time::Instant;

use bytes::Bytes;
use image::codecs::jpeg::JpegEncoder;
use image::{DynamicImage, ExtendedColorType, ImageBuffer, Rgb, Rgba};

use crate::error::{Error, Result};

/// Pixel layout of a captured frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PixelFormat {
    Rgb8,
    Rgba8,
    /// Already JPEG-compressed (MJPEG pipes deliver these).
    Jpeg,
}

impl PixelFormat {
    /// Bytes per pixel for raw formats; `None` for compressed data.
    #[must_use]
    pub fn bytes_per_pixel(self) -> Option<usize> {
        match self {
            Self::Rgb8 => Some(3),
            Self::Rgba8 => Some(4),
            Self::Jpeg => None,
        }
    }
}

/// One frame as it came off the camera.
#[derive(Clone)]
pub struct RawFrame {
    pub format: PixelFormat,
    /// 0x0 for compressed frames whose dimensions are not yet known.
    pub width: u32,
    pub height: u32,
    pub data: Bytes,
    /// Capture-order sequence number, assigned by the capture loop.
    pub seq: u64,
    pub captured_at: Instant,
}

impl RawFrame {
    /// Wrap a raw pixel buffer, checking that its length matches the
    /// declared dimensions.
    pub fn from_pixels(
        format: PixelFormat,
        width: u32,
        height: u32,
        data: Bytes,
        seq: u64,
    ) -> Result<Self> {
        let Some(bpp) = format.bytes_per_pixel() else {
            return Err(Error::InvalidFrame {
                context: "from_pixels requires an uncompressed format".to_string(),
            });
        };
        let expected = width as usize * height as usize * bpp;
        if data.len() != expected {
            return Err(Error::InvalidFrame {
                context: format!(
                    "buffer is {} bytes, {width}x{height} needs {expected}",
                    data.len()
                ),
            });
        }
        Ok(Self {
            format,
            width,
            height,
            data,
            seq,
            captured_at: Instant::now(),
        })
    }

    /// Wrap an already-compressed JPEG frame.
    #[must_use]
    pub fn jpeg(data: Bytes, seq: u64) -> Self {
        Self {
            format: PixelFormat::Jpeg,
            width: 0,
            height: 0,
            data,
            seq,
            captured_at: Instant::now(),
        }
    }
}

impl std::fmt::Debug for RawFrame {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RawFrame")
            .field("format", &self.format)
            .field("width", &self.width)
            .field("height", &self.height)
            .field("bytes", &self.data.len())
            .field("seq", &self.seq)
            .finish()
    }
}

/// A frame after conversion, ready for transport.
#[derive(Clone)]
pub struct EncodedFrame {
    pub width: u32,
    pub height: u32,
    pub encoding: &'static str,
    pub data: Bytes,
    pub seq: u64,
    pub captured_at: Instant,
}

impl std::fmt::Debug for EncodedFrame {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EncodedFrame")
            .field("encoding", &self.encoding)
            .field("width", &self.width)
            .field("height", &self.height)
            .field("bytes", &self.data.len())
            .field("seq", &self.seq)
            .finish()
    }
}

/// Strategy for turning raw frames into transport-ready payloads.
pub trait FrameConverter: Send + Sync {
    /// Encode `frame`, downscaling to at most `max_width` pixels wide
    /// (aspect ratio preserved) and compressing at `quality` (1..=100).
    fn encode(&self, frame: &RawFrame, max_width: u32, quality: u8) -> Result<EncodedFrame>;
}

/// JPEG converter backed by the `image` crate.
#[derive(Debug, Clone, Copy, Default)]
pub struct JpegConverter;

impl FrameConverter for JpegConverter {
    fn encode(&self, frame: &RawFrame, max_width: u32, quality: u8) -> Result<EncodedFrame> {
        // Frames that are already JPEG and narrow enough pass through
        // untouched; re-encoding would only cost quality and CPU.
        if frame.format == PixelFormat::Jpeg {
            let (width, height) = jpeg_dimensions(&frame.data)?;
            if width <= max_width {
                return Ok(EncodedFrame {
                    width,
                    height,
                    encoding: "jpeg",
                    data: frame.data.clone(),
                    seq: frame.seq,
                    captured_at: frame.captured_at,
                });
            }
        }

        let mut img = decode(frame)?;
        if let Some((nw, nh)) = target_dimensions(img.width(), img.height(), max_width) {
            img = img.resize_exact(nw, nh, image::imageops::FilterType::Triangle);
        }

        let rgb = img.to_rgb8();
        let (width, height) = rgb.dimensions();
        let mut out = Cursor::new(Vec::new());
        JpegEncoder::new_with_quality(&mut out, quality).encode(
            rgb.as_raw(),
            width,
            height,
            ExtendedColorType::Rgb8,
        )?;

        Ok(EncodedFrame {
            width,
            height,
            encoding: "jpeg",
            data: Bytes::from(out.into_inner()),
            seq: frame.seq,
            captured_at: frame.captured_at,
        })
    }
}

fn decode(frame: &RawFrame) -> Result<DynamicImage> {
    match frame.format {
        PixelFormat::Jpeg => Ok(image::load_from_memory(&frame.data)?),
        PixelFormat::Rgb8 => {
            ImageBuffer::<Rgb<u8>, Vec<u8>>::from_raw(frame.width, frame.height, frame.data.to_vec())
                .map(DynamicImage::ImageRgb8)
                .ok_or_else(|| Error::InvalidFrame {
                    context: "RGB buffer does not match dimensions".to_string(),
                })
        }
        PixelFormat::Rgba8 => ImageBuffer::<Rgba<u8>, Vec<u8>>::from_raw(
            frame.width,
            frame.height,
            frame.data.to_vec(),
        )
        .map(DynamicImage::ImageRgba8)
        .ok_or_else(|| Error::InvalidFrame {
            context: "RGBA buffer does not match dimensions".to_string(),
        }),
    }
}

/// Read dimensions out of a JPEG header without a full decode.
pub fn jpeg_dimensions(data: &[u8]) -> Result<(u32, u32)> {
    let reader = image::ImageReader::new(Cursor::new(data)).with_guessed_format()?;
    Ok(reader.into_dimensions()?)
}

/// Output dimensions for a frame wider than `max_width`, or `None` when no
/// resize is needed. Pure, so the policy is testable on its own.
#[must_use]
pub fn target_dimensions(width: u32, height: u32, max_width: u32) -> Option<(u32, u32)> {
    if width <= max_width || width == 0 {
        return None;
    }
    let scale = f64::from(max_width) / f64::from(width);
    let new_height = (f64::from(height) * scale).round().max(1.0) as u32;
    Some((max_width, new_height))
}
